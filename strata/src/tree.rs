//! The agent rollup tree.
//!
//! An agent rollup id `a::b::host` names the agent `host` inside the groups
//! `a::` and `a::b::`. Group ids end in the separator, agent ids do not.

use std::collections::{BTreeMap, BTreeSet};

/// Separator between path segments of a rollup id.
pub const SEPARATOR: &str = "::";

/// The groups containing `agent_rollup_id`, outermost first.
#[must_use]
pub fn group_chain(agent_rollup_id: &str) -> Vec<String> {
    agent_rollup_id
        .match_indices(SEPARATOR)
        .map(|(index, _)| agent_rollup_id[..index + SEPARATOR.len()].to_string())
        .filter(|group| group != agent_rollup_id)
        .collect()
}

/// A node of the rollup tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupNode {
    /// Agent rollup id.
    pub id: String,
    /// Child nodes, sorted by id.
    pub children: Vec<RollupNode>,
}

impl RollupNode {
    /// Ids of the direct children.
    #[must_use]
    pub fn child_ids(&self) -> Vec<String> {
        self.children.iter().map(|child| child.id.clone()).collect()
    }

    /// Number of nodes in this subtree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(RollupNode::node_count).sum::<usize>()
    }
}

fn build(id: String, children: &BTreeMap<Option<String>, Vec<String>>) -> RollupNode {
    let kids = children
        .get(&Some(id.clone()))
        .map(|ids| ids.iter().map(|child| build(child.clone(), children)).collect())
        .unwrap_or_default();
    RollupNode { id, children: kids }
}

/// Build the forest spanned by `agent_ids` and every group containing them.
/// Roots and children are sorted by id.
#[must_use]
pub fn build_forest<'a>(agent_ids: impl IntoIterator<Item = &'a str>) -> Vec<RollupNode> {
    let mut children: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for agent in agent_ids {
        let mut path = group_chain(agent);
        path.push(agent.to_string());
        let mut parent = None;
        for id in path {
            if seen.insert(id.clone()) {
                children.entry(parent.clone()).or_default().push(id.clone());
            }
            parent = Some(id);
        }
    }
    for ids in children.values_mut() {
        ids.sort();
    }

    children
        .get(&None)
        .map(|roots| roots.iter().map(|root| build(root.clone(), &children)).collect())
        .unwrap_or_default()
}
