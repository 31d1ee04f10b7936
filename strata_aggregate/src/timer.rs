//! Timer forest merging.

use prost::Message;

use crate::proto::Timer;

/// Merge `from` into the forest `into`.
///
/// Timers are matched by name under the same parent. On a match counts and
/// totals are summed and children merged recursively; otherwise the timer is
/// inserted as a new sibling. Siblings are kept ordered by name so the result
/// does not depend on merge order.
pub fn merge_timers(into: &mut Vec<Timer>, from: &[Timer]) {
    for timer in from {
        match into.binary_search_by(|existing| existing.name.as_str().cmp(&timer.name)) {
            Ok(pos) => merge_timer(&mut into[pos], timer),
            Err(pos) => {
                let mut fresh = Timer {
                    name: timer.name.clone(),
                    extended: timer.extended,
                    total_nanos: timer.total_nanos,
                    count: timer.count,
                    child_timers: Vec::with_capacity(timer.child_timers.len()),
                };
                // Inputs may come from agents that never sorted siblings.
                merge_timers(&mut fresh.child_timers, &timer.child_timers);
                into.insert(pos, fresh);
            }
        }
    }
}

fn merge_timer(into: &mut Timer, from: &Timer) {
    into.extended |= from.extended;
    into.total_nanos += from.total_nanos;
    into.count += from.count;
    merge_timers(&mut into.child_timers, &from.child_timers);
}

/// Decode the auxiliary root timer as older agents wrote it.
///
/// Compatibility shim: some writers stored the root as a single `Timer`
/// record, others as a one-element length-delimited sequence. Both decode
/// to the same root. An empty field means no root.
///
/// # Errors
///
/// Returns the decode error if the bytes are neither encoding.
pub fn decode_legacy_aux_root(bytes: &[u8]) -> Result<Option<Timer>, prost::DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if let Some(timer) = decode_one_element_sequence(bytes) {
        return Ok(Some(timer));
    }
    Timer::decode(bytes).map(Some)
}

/// `Some` only if `bytes` is exactly one delimiter followed by a timer with
/// a name that fills the rest of the buffer.
fn decode_one_element_sequence(bytes: &[u8]) -> Option<Timer> {
    let mut cursor = bytes;
    let len = prost::decode_length_delimiter(&mut cursor).ok()?;
    if len != cursor.len() {
        return None;
    }
    let timer = Timer::decode(cursor).ok()?;
    (!timer.name.is_empty()).then_some(timer)
}

#[cfg(test)]
mod tests {
    use proptest::{collection, prelude::*};
    use prost::Message;

    use super::{decode_legacy_aux_root, merge_timers};
    use crate::proto::Timer;

    fn timer(name: &str, count: i64, total: f64, children: Vec<Timer>) -> Timer {
        Timer {
            name: name.to_string(),
            extended: false,
            total_nanos: total,
            count,
            child_timers: children,
        }
    }

    #[test]
    fn matching_names_sum() {
        let mut forest = vec![timer("http", 1, 10.0, vec![timer("jdbc", 2, 4.0, vec![])])];
        merge_timers(
            &mut forest,
            &[timer(
                "http",
                3,
                30.0,
                vec![timer("jdbc", 1, 1.0, vec![]), timer("cache", 1, 2.0, vec![])],
            )],
        );

        assert_eq!(forest.len(), 1);
        let http = &forest[0];
        assert_eq!(http.count, 4);
        assert_eq!(http.total_nanos, 40.0);
        let names: Vec<&str> = http.child_timers.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "jdbc"]);
        assert_eq!(http.child_timers[1].count, 3);
    }

    #[test]
    fn extended_is_sticky() {
        let mut forest = vec![timer("a", 1, 1.0, vec![])];
        let mut running = timer("a", 1, 1.0, vec![]);
        running.extended = true;
        merge_timers(&mut forest, &[running]);
        merge_timers(&mut forest, &[timer("a", 1, 1.0, vec![])]);
        assert!(forest[0].extended);
    }

    #[test]
    fn legacy_single_record() {
        let root = timer("auxiliary thread", 2, 8.0, vec![timer("io", 1, 3.0, vec![])]);
        let decoded = decode_legacy_aux_root(&root.encode_to_vec()).expect("decode");
        assert_eq!(decoded, Some(root));
    }

    #[test]
    fn legacy_delimited_sequence() {
        let root = timer("auxiliary thread", 2, 8.0, vec![timer("io", 1, 3.0, vec![])]);
        let decoded = decode_legacy_aux_root(&root.encode_length_delimited_to_vec()).expect("decode");
        assert_eq!(decoded, Some(root));
    }

    #[test]
    fn legacy_empty_is_none() {
        assert_eq!(decode_legacy_aux_root(&[]).expect("decode"), None);
    }

    fn arb_forest() -> impl Strategy<Value = Vec<Timer>> {
        let leaf = ("[a-d]", 0i64..100, 0u32..1000)
            .prop_map(|(name, count, total)| timer(&name, count, f64::from(total), vec![]));
        let node = ("[a-d]", 0i64..100, 0u32..1000, collection::vec(leaf, 0..4)).prop_map(
            |(name, count, total, children)| timer(&name, count, f64::from(total), children),
        );
        collection::vec(node, 0..4)
    }

    fn merged(a: &[Timer], b: &[Timer]) -> Vec<Timer> {
        let mut out = Vec::new();
        merge_timers(&mut out, a);
        merge_timers(&mut out, b);
        out
    }

    proptest! {
        #[test]
        fn merge_is_associative_and_commutative(
            a in arb_forest(),
            b in arb_forest(),
            c in arb_forest(),
        ) {
            let ab_c = merged(&merged(&a, &b), &c);
            let a_bc = merged(&a, &merged(&b, &c));
            prop_assert_eq!(&ab_c, &a_bc);

            let ab = merged(&a, &b);
            let ba = merged(&b, &a);
            prop_assert_eq!(ab, ba);
        }
    }
}
