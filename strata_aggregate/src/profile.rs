//! Call tree profile merging.

use crate::proto::ProfileNode;

/// Union `from` into `into`, summing sample counts along matching frame
/// paths. Siblings stay ordered by frame.
pub fn merge_profile(into: &mut Vec<ProfileNode>, from: &[ProfileNode]) {
    for node in from {
        match into.binary_search_by(|existing| existing.frame.as_str().cmp(&node.frame)) {
            Ok(pos) => {
                let existing = &mut into[pos];
                existing.sample_count += node.sample_count;
                merge_profile(&mut existing.children, &node.children);
            }
            Err(pos) => {
                let mut fresh = ProfileNode {
                    frame: node.frame.clone(),
                    sample_count: node.sample_count,
                    children: Vec::with_capacity(node.children.len()),
                };
                merge_profile(&mut fresh.children, &node.children);
                into.insert(pos, fresh);
            }
        }
    }
}

/// Samples across all roots.
#[must_use]
pub fn total_samples(roots: &[ProfileNode]) -> i64 {
    roots.iter().map(|root| root.sample_count).sum()
}
