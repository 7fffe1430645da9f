//! Answering peers that are acquiring a map we hold.

use std::sync::Arc;

use shamap::{NodeId, ShaMap, TreeNode, BRANCH_FACTOR};
use shamap_types::Hash256;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// The node at `wanted` plus some of its descendants, as `(position,
/// wire bytes)` pairs, ready for a peer.
///
/// Children of the node are included (leaves only if `fat_leaves`), and
/// while a node has exactly one child that is an inner node the reply
/// keeps going down that chain. For the root the children are only
/// included if `fat_root` is set. An empty root yields nothing.
pub fn get_node_fat(
    map: &ShaMap,
    wanted: &NodeId,
    fat_root: bool,
    fat_leaves: bool,
) -> SyncResult<Vec<(NodeId, Vec<u8>)>> {
    let mut node = Arc::clone(map.root());
    let mut at = NodeId::root();
    while at.depth() < wanted.depth() {
        let TreeNode::Inner(inner) = &*node else {
            break;
        };
        let branch = at.select_branch(wanted.id());
        let Some(child) = map.child_node(inner, &at, branch)? else {
            break;
        };
        node = child;
        at = at.child(branch);
    }
    if at != *wanted {
        warn!(node = %wanted, "peer requested a node that is not in the map");
        return Err(SyncError::NodeNotFound(*wanted));
    }
    if node.as_inner().is_some_and(|inner| inner.is_empty()) {
        warn!("peer requested an empty node");
        return Ok(Vec::new());
    }

    let mut out = vec![(at, node.to_wire())];
    if wanted.is_root() && !fat_root {
        return Ok(out);
    }
    loop {
        let TreeNode::Inner(inner) = &*node else {
            break;
        };
        let mut count = 0;
        let mut last = None;
        for branch in 0..BRANCH_FACTOR as u8 {
            let Some(child) = map.child_node(inner, &at, branch)? else {
                continue;
            };
            count += 1;
            let child_id = at.child(branch);
            if fat_leaves || child.is_inner() {
                out.push((child_id, child.to_wire()));
            }
            last = Some((child, child_id));
        }
        match last {
            Some((child, child_id)) if count == 1 && child.is_inner() => {
                node = child;
                at = child_id;
            }
            _ => break,
        }
    }
    Ok(out)
}

/// Nodes of `map` that `have` lacks, as `(hash, wire bytes)` pairs, at
/// most `max` of them.
///
/// Subtrees `have` already holds at the same position are skipped whole.
/// Leaves are only included if `include_leaves` is set; a peer acquiring a
/// transaction map usually has the transactions already.
pub fn fetch_pack(
    map: &ShaMap,
    have: Option<&ShaMap>,
    include_leaves: bool,
    max: usize,
) -> SyncResult<Vec<(Hash256, Vec<u8>)>> {
    let mut pack = Vec::new();
    let root_hash = map.get_hash();
    if root_hash.is_zero() || have.is_some_and(|have| have.get_hash() == root_hash) {
        return Ok(pack);
    }

    let mut stack = vec![(Arc::clone(map.root()), NodeId::root())];
    while let Some((node, id)) = stack.pop() {
        if pack.len() >= max {
            break;
        }
        pack.push((node.hash(), node.to_wire()));
        let TreeNode::Inner(inner) = &*node else {
            continue;
        };
        for branch in 0..BRANCH_FACTOR as u8 {
            let Some(child) = map.child_node(inner, &id, branch)? else {
                continue;
            };
            let child_id = id.child(branch);
            let hash = child.hash();
            if let Some(leaf) = child.as_leaf() {
                if !include_leaves || pack.len() >= max {
                    continue;
                }
                let known = match have {
                    Some(have) => have.has_leaf_node(leaf.key(), &hash)?,
                    None => false,
                };
                if !known {
                    pack.push((hash, child.to_wire()));
                }
            } else {
                let known = match have {
                    Some(have) => have.has_inner_node(&child_id, &hash)?,
                    None => false,
                };
                if !known {
                    stack.push((child, child_id));
                }
            }
        }
    }
    debug!(
        root = %root_hash.short_hex(),
        nodes = pack.len(),
        "fetch pack built"
    );
    Ok(pack)
}
