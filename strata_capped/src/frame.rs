//! Block framing.
//!
//! A block is a little-endian `u32` payload length followed by the payload.
//! The payload is the records back to back, each prefixed with a protobuf
//! varint length delimiter.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CappedId, Error};

pub(crate) const LEN_PREFIX: u64 = 4;

/// Frame `records` into a single block.
pub(crate) fn encode_block<I, B>(records: I) -> Result<Bytes, Error>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut payload = BytesMut::new();
    for record in records {
        let record = record.as_ref();
        prost::encode_length_delimiter(record.len(), &mut payload)?;
        payload.put_slice(record);
    }

    let Ok(payload_len) = u32::try_from(payload.len()) else {
        return Err(Error::BlockTooLarge {
            block: payload.len() as u64 + LEN_PREFIX,
            capacity: u64::from(u32::MAX),
        });
    };

    let mut block = BytesMut::with_capacity(payload.len() + LEN_PREFIX as usize);
    block.put_u32_le(payload_len);
    block.put_slice(&payload);
    Ok(block.freeze())
}

/// Parse the payload length prefix.
pub(crate) fn payload_len(prefix: [u8; 4]) -> u64 {
    u64::from(u32::from_le_bytes(prefix))
}

/// Split a block payload back into its records.
pub(crate) fn decode_records(id: CappedId, mut payload: Bytes) -> Result<Vec<Bytes>, Error> {
    let mut records = Vec::new();
    while payload.has_remaining() {
        let len = prost::decode_length_delimiter(&mut payload)
            .map_err(|source| Error::Decode { id, source })?;
        if len > payload.remaining() {
            return Err(Error::Corrupt {
                id,
                reason: "record length exceeds block payload",
            });
        }
        records.push(payload.split_to(len));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{decode_records, encode_block, payload_len};
    use crate::{CappedId, Error};

    #[test]
    fn block_carries_records_in_order() {
        let block = encode_block([b"alpha".as_slice(), b"".as_slice(), b"gamma".as_slice()]).expect("frame");
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&block[..4]);
        let len = payload_len(prefix);
        assert_eq!(len as usize, block.len() - 4);

        let records = decode_records(CappedId::new(0), block.slice(4..)).expect("decode");
        assert_eq!(
            records,
            vec![
                Bytes::from_static(b"alpha"),
                Bytes::new(),
                Bytes::from_static(b"gamma"),
            ]
        );
    }

    #[test]
    fn empty_block_has_no_records() {
        let block = encode_block(Vec::<Vec<u8>>::new()).expect("frame");
        assert_eq!(block.len(), 4);
        let records = decode_records(CappedId::new(7), block.slice(4..)).expect("decode");
        assert!(records.is_empty());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        // Delimiter claims 10 bytes, only 3 follow.
        let payload = Bytes::from_static(&[10, b'a', b'b', b'c']);
        let err = decode_records(CappedId::new(3), payload).expect_err("must fail");
        assert!(matches!(err, Error::Corrupt { .. }));
        assert!(err.is_malformed());
    }
}
