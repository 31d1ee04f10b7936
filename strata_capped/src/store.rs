//! The file-backed ring.

use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use metrics::counter;
use prost::Message;
use tracing::{debug, info};

use crate::{Blob, CappedId, Error, frame};

const MAGIC: &[u8; 8] = b"STRATCAP";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 64;
/// Resize copies live data in chunks of this many bytes.
const COPY_CHUNK: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    capacity: u64,
    /// Logical offset of the next write.
    cursor: u64,
    /// Logical offsets below this hold no data, set by a resize.
    floor: u64,
}

impl Header {
    fn encode(self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cursor.to_le_bytes());
        buf[32..40].copy_from_slice(&self.floor.to_le_bytes());
        buf
    }

    fn decode(path: &Path, buf: &[u8; HEADER_LEN as usize]) -> Result<Self, Error> {
        if &buf[0..8] != MAGIC {
            return Err(Error::BadHeader {
                path: path.to_path_buf(),
            });
        }
        let version = u32::from_le_bytes(le_array(&buf[8..12]));
        if version != VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        Ok(Self {
            capacity: u64::from_le_bytes(le_array(&buf[16..24])),
            cursor: u64::from_le_bytes(le_array(&buf[24..32])),
            floor: u64::from_le_bytes(le_array(&buf[32..40])),
        })
    }

    fn smallest_live(self) -> u64 {
        self.cursor.saturating_sub(self.capacity).max(self.floor)
    }
}

fn le_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[derive(Debug)]
struct Ring {
    file: File,
    header: Header,
}

impl Ring {
    /// Write `data` at logical offset `pos`, wrapping at the end of the ring.
    fn write_at(&self, pos: u64, data: &[u8]) -> Result<(), Error> {
        let capacity = self.header.capacity;
        let mut written = 0usize;
        while written < data.len() {
            let logical = pos + written as u64;
            let offset = logical % capacity;
            let room = usize::try_from(capacity - offset).unwrap_or(usize::MAX);
            let n = room.min(data.len() - written);
            self.file
                .write_all_at(&data[written..written + n], HEADER_LEN + offset)
                .map_err(|source| Error::Io {
                    context: "ring write",
                    source,
                })?;
            written += n;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes from logical offset `pos`.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<(), Error> {
        let capacity = self.header.capacity;
        let mut read = 0usize;
        while read < buf.len() {
            let logical = pos + read as u64;
            let offset = logical % capacity;
            let room = usize::try_from(capacity - offset).unwrap_or(usize::MAX);
            let n = room.min(buf.len() - read);
            self.file
                .read_exact_at(&mut buf[read..read + n], HEADER_LEN + offset)
                .map_err(|source| Error::Io {
                    context: "ring read",
                    source,
                })?;
            read += n;
        }
        Ok(())
    }

    fn persist_header(&self) -> Result<(), Error> {
        self.file
            .write_all_at(&self.header.encode(), 0)
            .map_err(|source| Error::Io {
                context: "header write",
                source,
            })
    }
}

/// A fixed-capacity, append-only ring of blobs backed by a single file.
///
/// One writer at a time, any number of concurrent readers. Readers hold a
/// shared lock while copying bytes out, so a concurrent wrap or resize never
/// hands them a torn block.
#[derive(Debug)]
pub struct CappedStore {
    path: PathBuf,
    ring: RwLock<Ring>,
}

impl CappedStore {
    /// Open the store at `path`, creating it with `capacity` bytes if absent.
    ///
    /// An existing file keeps its write cursor so previously issued ids stay
    /// valid. If its capacity differs from `capacity` the store is resized.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or allocated, or if it
    /// exists and is not a capped store.
    pub fn open(path: impl Into<PathBuf>, capacity: u64) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| Error::Io {
                context: "open",
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| Error::Io {
                context: "metadata",
                source,
            })?
            .len();

        let header = if len == 0 {
            let header = Header {
                capacity,
                cursor: 0,
                floor: 0,
            };
            file.set_len(HEADER_LEN + capacity)
                .map_err(|source| Error::Io {
                    context: "allocate",
                    source,
                })?;
            file.write_all_at(&header.encode(), 0)
                .map_err(|source| Error::Io {
                    context: "header write",
                    source,
                })?;
            info!(path = %path.display(), capacity, "created capped store");
            header
        } else {
            let mut buf = [0u8; HEADER_LEN as usize];
            file.read_exact_at(&mut buf, 0)
                .map_err(|_| Error::BadHeader { path: path.clone() })?;
            let header = Header::decode(&path, &buf)?;
            if header.capacity == 0 || len < HEADER_LEN + header.capacity {
                return Err(Error::BadHeader { path });
            }
            info!(
                path = %path.display(),
                capacity = header.capacity,
                cursor = header.cursor,
                "reopened capped store"
            );
            header
        };

        let store = Self {
            path,
            ring: RwLock::new(Ring { file, header }),
        };
        if store.capacity()? != capacity {
            store.resize(capacity)?;
        }
        Ok(store)
    }

    fn read_ring(&self) -> Result<RwLockReadGuard<'_, Ring>, Error> {
        self.ring.read().map_err(|_| Error::Poisoned)
    }

    fn write_ring(&self) -> Result<RwLockWriteGuard<'_, Ring>, Error> {
        self.ring.write().map_err(|_| Error::Poisoned)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current ring capacity in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poisoned`] if a writer panicked.
    pub fn capacity(&self) -> Result<u64, Error> {
        Ok(self.read_ring()?.header.capacity)
    }

    /// The smallest id that has not yet been overwritten.
    ///
    /// Monotonic. Rows holding an id below this value reference expired
    /// data and can be excluded from a scan without reading them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poisoned`] if a writer panicked.
    pub fn smallest_non_expired_id(&self) -> Result<CappedId, Error> {
        Ok(CappedId(self.read_ring()?.header.smallest_live()))
    }

    /// Write `records` as one block and return its id.
    ///
    /// Never waits on free space: the ring always has room because the
    /// oldest data is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockTooLarge`] if the framed records exceed the
    /// capacity, or an IO error from the backing file.
    pub fn write<I, B>(&self, records: I) -> Result<CappedId, Error>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let block = frame::encode_block(records)?;
        let block_len = block.len() as u64;

        let mut ring = self.write_ring()?;
        if block_len > ring.header.capacity {
            return Err(Error::BlockTooLarge {
                block: block_len,
                capacity: ring.header.capacity,
            });
        }
        let id = ring.header.cursor;
        ring.write_at(id, &block)?;
        ring.header.cursor = id + block_len;
        ring.persist_header()?;
        drop(ring);

        counter!("strata_capped_bytes_written_total").increment(block_len);
        Ok(CappedId(id))
    }

    /// Encode `messages` and write them as one block.
    ///
    /// # Errors
    ///
    /// See [`CappedStore::write`].
    pub fn write_messages<M: Message>(&self, messages: &[M]) -> Result<CappedId, Error> {
        self.write(messages.iter().map(Message::encode_to_vec))
    }

    /// Read back the raw records of block `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownId`] for an id this store never issued,
    /// [`Error::Corrupt`] if the framing is inconsistent, or an IO error.
    pub fn read_raw(&self, id: CappedId) -> Result<Blob<Vec<Bytes>>, Error> {
        let ring = self.read_ring()?;
        let header = ring.header;
        if id.0 < header.smallest_live() {
            drop(ring);
            debug!(%id, "capped read of expired id");
            counter!("strata_capped_expired_read_total").increment(1);
            return Ok(Blob::Expired);
        }
        if id.0 >= header.cursor {
            return Err(Error::UnknownId {
                id,
                cursor: header.cursor,
            });
        }

        let mut prefix = [0u8; frame::LEN_PREFIX as usize];
        ring.read_at(id.0, &mut prefix)?;
        let payload_len = frame::payload_len(prefix);
        let end = id.0 + frame::LEN_PREFIX + payload_len;
        if end > header.cursor {
            return Err(Error::Corrupt {
                id,
                reason: "block extends past write cursor",
            });
        }
        let mut payload = vec![0u8; usize::try_from(payload_len).unwrap_or(usize::MAX)];
        ring.read_at(id.0 + frame::LEN_PREFIX, &mut payload)?;
        drop(ring);

        frame::decode_records(id, Bytes::from(payload)).map(Blob::Live)
    }

    /// Read back block `id`, decoding every record as `M`.
    ///
    /// # Errors
    ///
    /// As [`CappedStore::read_raw`], plus [`Error::Decode`] if a record is
    /// not a valid `M`.
    pub fn read<M: Message + Default>(&self, id: CappedId) -> Result<Blob<Vec<M>>, Error> {
        match self.read_raw(id)? {
            Blob::Expired => Ok(Blob::Expired),
            Blob::Live(records) => records
                .into_iter()
                .map(|record| M::decode(record).map_err(|source| Error::Decode { id, source }))
                .collect::<Result<Vec<M>, Error>>()
                .map(Blob::Live),
        }
    }

    /// Change the ring capacity.
    ///
    /// History is truncated to the newest `capacity` live bytes. Ids keep
    /// their meaning; ids older than the retained history read as expired.
    /// Readers are excluded for the duration of the copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement file cannot be written.
    pub fn resize(&self, capacity: u64) -> Result<(), Error> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let mut ring = self.write_ring()?;
        let old = ring.header;
        if old.capacity == capacity {
            return Ok(());
        }

        let live = old.cursor - old.smallest_live();
        let keep = live.min(capacity);
        let start = old.cursor - keep;
        let header = Header {
            capacity,
            cursor: old.cursor,
            floor: start,
        };

        let tmp_path = self.path.with_extension("resize");
        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| Error::Io {
                context: "resize open",
                source,
            })?;
        tmp.set_len(HEADER_LEN + capacity)
            .map_err(|source| Error::Io {
                context: "resize allocate",
                source,
            })?;
        let replacement = Ring { file: tmp, header };

        let mut pos = start;
        let mut chunk = Vec::new();
        while pos < old.cursor {
            let n = (old.cursor - pos).min(COPY_CHUNK);
            chunk.resize(usize::try_from(n).unwrap_or(usize::MAX), 0);
            ring.read_at(pos, &mut chunk)?;
            replacement.write_at(pos, &chunk)?;
            pos += n;
        }
        replacement.persist_header()?;
        replacement.file.sync_all().map_err(|source| Error::Io {
            context: "resize sync",
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| Error::Io {
            context: "resize rename",
            source,
        })?;

        info!(
            path = %self.path.display(),
            from = old.capacity,
            to = capacity,
            retained = keep,
            "resized capped store"
        );
        *ring = replacement;
        Ok(())
    }

    /// Make every completed write durable.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the sync fails.
    pub fn flush(&self) -> Result<(), Error> {
        self.read_ring()?
            .file
            .sync_all()
            .map_err(|source| Error::Io {
                context: "flush",
                source,
            })
    }

    /// Flush and release the store.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the final sync fails.
    pub fn close(self) -> Result<(), Error> {
        self.flush()?;
        info!(path = %self.path.display(), "closed capped store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection, prelude::*};

    use super::{CappedStore, HEADER_LEN};
    use crate::{Blob, CappedId, Error};

    fn store(dir: &tempfile::TempDir, capacity: u64) -> CappedStore {
        CappedStore::open(dir.path().join("level.capped"), capacity).expect("open store")
    }

    #[test]
    fn round_trip_within_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 1024);

        let first = store.write([b"one".as_slice(), b"two".as_slice()]).expect("write");
        let second = store.write([b"three".as_slice()]).expect("write");
        assert!(second > first);

        let Blob::Live(records) = store.read_raw(first).expect("read") else {
            panic!("first block expired");
        };
        assert_eq!(records, vec![b"one".as_slice(), b"two".as_slice()]);
        let Blob::Live(records) = store.read_raw(second).expect("read") else {
            panic!("second block expired");
        };
        assert_eq!(records, vec![b"three".as_slice()]);
    }

    #[test]
    fn wrap_expires_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 64);
        let payload = [7u8; 20];

        let ids: Vec<CappedId> = (0..10)
            .map(|_| store.write([payload.as_slice()]).expect("write"))
            .collect();

        let smallest = store.smallest_non_expired_id().expect("smallest");
        assert!(smallest > ids[0]);
        assert!(store.read_raw(ids[0]).expect("read").is_expired());

        let newest = *ids.last().expect("ids");
        let Blob::Live(records) = store.read_raw(newest).expect("read") else {
            panic!("newest expired");
        };
        assert_eq!(records, vec![payload.as_slice()]);
    }

    #[test]
    fn oversized_block_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 16);
        let err = store.write([[0u8; 32].as_slice()]).expect_err("too large");
        assert!(matches!(err, Error::BlockTooLarge { .. }));
    }

    #[test]
    fn unknown_id_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 128);
        let err = store.read_raw(CappedId::new(5)).expect_err("never written");
        assert!(matches!(err, Error::UnknownId { .. }));
    }

    #[test]
    fn reopen_keeps_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = {
            let store = store(&dir, 256);
            let id = store.write([b"persisted".as_slice()]).expect("write");
            store.close().expect("close");
            id
        };
        let store = store(&dir, 256);
        let Blob::Live(records) = store.read_raw(id).expect("read") else {
            panic!("expired after reopen");
        };
        assert_eq!(records, vec![b"persisted".as_slice()]);
        let next = store.write([b"next".as_slice()]).expect("write");
        assert!(next > id);
    }

    #[test]
    fn garbage_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("junk.capped");
        std::fs::write(&path, vec![1u8; HEADER_LEN as usize + 8]).expect("write junk");
        let err = CappedStore::open(&path, 64).expect_err("not a store");
        assert!(matches!(err, Error::BadHeader { .. }));
    }

    #[test]
    fn shrink_keeps_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 256);
        let old = store.write([[1u8; 60].as_slice()]).expect("write");
        let recent = store.write([[2u8; 30].as_slice()]).expect("write");

        store.resize(40).expect("resize");
        assert_eq!(store.capacity().expect("capacity"), 40);
        assert!(store.read_raw(old).expect("read").is_expired());
        let Blob::Live(records) = store.read_raw(recent).expect("read") else {
            panic!("recent expired by shrink");
        };
        assert_eq!(records, vec![[2u8; 30].as_slice()]);
    }

    #[test]
    fn grow_keeps_everything_live() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 64);
        let ids: Vec<CappedId> = (0..6u8)
            .map(|i| store.write([[i; 10].as_slice()]).expect("write"))
            .collect();
        let smallest_before = store.smallest_non_expired_id().expect("smallest");

        store.resize(1024).expect("resize");
        assert_eq!(
            store.smallest_non_expired_id().expect("smallest"),
            smallest_before
        );
        for (i, id) in ids.iter().enumerate() {
            let blob = store.read_raw(*id).expect("read");
            if *id < smallest_before {
                assert!(blob.is_expired());
            } else {
                let expected = [u8::try_from(i).expect("small"); 10];
                assert_eq!(blob, Blob::Live(vec![bytes::Bytes::copy_from_slice(&expected)]));
            }
        }
        // Writing after growth must not clobber retained history.
        let next = store.write([[9u8; 100].as_slice()]).expect("write");
        assert!(!store.read_raw(next).expect("read").is_expired());
        assert!(
            !store
                .read_raw(*ids.last().expect("ids"))
                .expect("read")
                .is_expired()
        );
    }

    #[test]
    fn reopen_with_new_capacity_resizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = store(&dir, 128);
            store.write([b"abc".as_slice()]).expect("write");
            store.close().expect("close");
        }
        let store = store(&dir, 512);
        assert_eq!(store.capacity().expect("capacity"), 512);
    }

    proptest! {
        #[test]
        fn live_ids_read_back_identical(
            capacity in 32u64..512,
            writes in collection::vec(collection::vec(any::<u8>(), 0..24), 1..64),
        ) {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = store(&dir, capacity);
            let mut written = Vec::new();
            for record in &writes {
                let id = store.write([record.as_slice()]).expect("write");
                written.push((id, record.clone()));
            }

            let smallest = store.smallest_non_expired_id().expect("smallest");
            for (id, record) in written {
                let blob = store.read_raw(id).expect("read");
                if id < smallest {
                    prop_assert!(blob.is_expired());
                } else {
                    prop_assert_eq!(blob, Blob::Live(vec![bytes::Bytes::from(record)]));
                }
            }
        }
    }
}
