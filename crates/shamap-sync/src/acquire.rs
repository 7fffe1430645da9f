//! Acquiring a map node by node.
//!
//! A synching map starts from a root hash. [`missing_nodes`] walks as far as
//! the local store (and an optional [`SyncFilter`]) allows and reports the
//! positions it could not fill; the caller fetches those from peers and
//! feeds them back through [`add_known_node`]. Once nothing is missing the
//! map leaves the synching state.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use shamap::{
    Family, InnerNode, MapType, NodeId, ShaMap, ShaMapResult, SyncFilter, TreeNode, BRANCH_FACTOR,
};
use shamap_types::Hash256;
use tracing::{debug, trace, warn};

use crate::error::SyncResult;
use crate::full_below::FullBelowCache;
use crate::outcome::AddNodeOutcome;

/// Up to `max` nodes of `map` that are available neither locally nor from
/// `filter`, as `(position, hash)` pairs in walk order.
///
/// Subtrees found complete are recorded in `full_below` and skipped on
/// later calls. If nothing is missing the map leaves the synching state.
pub fn missing_nodes(
    map: &mut ShaMap,
    max: usize,
    filter: Option<&dyn SyncFilter>,
    full_below: &FullBelowCache,
) -> SyncResult<Vec<(NodeId, Hash256)>> {
    let root_hash = map.get_hash();
    if root_hash.is_zero() {
        warn!(map_type = %map.map_type(), "looking for missing nodes of an empty map");
        return Ok(Vec::new());
    }
    if map.is_backed() && full_below.touch_if_exists(&root_hash) {
        map.clear_synching();
        return Ok(Vec::new());
    }

    let mut walk = MissingWalk {
        map,
        filter,
        full_below,
        max,
        found: Vec::new(),
        seen: HashSet::new(),
    };
    let root = Arc::clone(walk.map.root());
    if let TreeNode::Inner(inner) = &*root {
        walk.inner(inner, &NodeId::root())?;
    }
    let found = walk.found;

    debug!(
        map_type = %map.map_type(),
        root = %root_hash.short_hex(),
        missing = found.len(),
        "missing node scan"
    );
    if found.is_empty() {
        map.clear_synching();
    }
    Ok(found)
}

struct MissingWalk<'a> {
    map: &'a ShaMap,
    filter: Option<&'a dyn SyncFilter>,
    full_below: &'a FullBelowCache,
    max: usize,
    found: Vec<(NodeId, Hash256)>,
    seen: HashSet<Hash256>,
}

impl MissingWalk<'_> {
    fn done(&self) -> bool {
        self.found.len() >= self.max
    }

    /// Walk below `inner`. Returns `true` if its subtree is complete.
    fn inner(&mut self, inner: &InnerNode, id: &NodeId) -> ShaMapResult<bool> {
        let backed = self.map.is_backed();
        let mut complete = true;
        for branch in 0..BRANCH_FACTOR as u8 {
            if self.done() {
                return Ok(false);
            }
            if inner.is_empty_branch(branch) {
                continue;
            }
            let hash = inner.child_hash(branch);
            if backed && self.full_below.touch_if_exists(&hash) {
                continue;
            }
            match self.map.try_child_node(inner, id, branch, self.filter)? {
                None => {
                    if self.seen.insert(hash) {
                        self.found.push((id.child(branch), hash));
                    }
                    complete = false;
                }
                Some(child) => {
                    if let TreeNode::Inner(child_inner) = &*child {
                        complete &= self.inner(child_inner, &id.child(branch))?;
                    }
                }
            }
        }
        if complete && backed {
            self.full_below.insert(inner.hash());
        }
        Ok(complete)
    }
}

/// The hashes of up to `max` missing nodes.
pub fn needed_hashes(
    map: &mut ShaMap,
    max: usize,
    filter: Option<&dyn SyncFilter>,
    full_below: &FullBelowCache,
) -> SyncResult<Vec<Hash256>> {
    Ok(missing_nodes(map, max, filter, full_below)?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect())
}

/// Every node hash still needed to reconstruct the tree under `target`
/// from `family`'s store.
///
/// The walk goes as far as stored nodes permit and records the hash at
/// every boundary. A root that is not stored is itself the one needed
/// hash.
pub fn needed_node_hashes(
    family: &Family,
    map_type: MapType,
    target: Hash256,
) -> SyncResult<BTreeSet<Hash256>> {
    if target.is_zero() {
        return Ok(BTreeSet::new());
    }
    let mut map = ShaMap::synching(map_type, family.clone());
    if !map.fetch_root(target, None)? {
        return Ok(BTreeSet::from([target]));
    }
    let full_below = FullBelowCache::new(0, Duration::from_secs(60));
    Ok(missing_nodes(&mut map, usize::MAX, None, &full_below)?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect())
}

/// Install the root of a synching map from `raw`, which must hash to
/// `expected`.
pub fn add_root_node(
    map: &mut ShaMap,
    expected: &Hash256,
    raw: &[u8],
    filter: Option<&dyn SyncFilter>,
) -> SyncResult<AddNodeOutcome> {
    if !map.get_hash().is_zero() {
        trace!(hash = %expected.short_hex(), "root node already present");
        return Ok(AddNodeOutcome::duplicate());
    }
    let node = match TreeNode::from_wire(raw) {
        Ok(node) => node,
        Err(e) => {
            warn!(error = %e, "malformed root node received");
            return Ok(AddNodeOutcome::invalid());
        }
    };
    if node.hash() != *expected || !node.is_inner() {
        warn!(expected = %expected, actual = %node.hash(), "unexpected root node received");
        return Ok(AddNodeOutcome::invalid());
    }

    let mut node = Arc::new(node);
    let kind = map.map_type().object_type();
    if let Some(family) = map.family() {
        family.store_node(&node, kind)?;
        node = family.canonicalize(*expected, node);
    }
    map.set_root_node(node)?;
    if let Some(filter) = filter {
        filter.got_node(false, expected, raw, kind);
    }
    Ok(AddNodeOutcome::useful())
}

/// Attach the node at `node_id`, received as `raw`, to a synching map.
///
/// The walk from the root must end exactly at an unfilled slot at
/// `node_id`, and `raw` must hash to what the parent records there.
/// Anything else is [`AddNodeOutcome::invalid`]; a node the map already
/// has is [`AddNodeOutcome::duplicate`]. A node that matches its hash but
/// cannot sit at its position proves the map unbuildable, and the map is
/// marked invalid.
pub fn add_known_node(
    map: &mut ShaMap,
    node_id: &NodeId,
    raw: &[u8],
    filter: Option<&dyn SyncFilter>,
    full_below: &FullBelowCache,
) -> SyncResult<AddNodeOutcome> {
    if node_id.is_root() {
        warn!("root offered as a known node");
        return Ok(AddNodeOutcome::invalid());
    }
    if !map.is_synching() {
        trace!(node = %node_id, "node offered to a map that is not synching");
        return Ok(AddNodeOutcome::duplicate());
    }

    let mut node = Arc::clone(map.root());
    let mut at = NodeId::root();
    while at.depth() < node_id.depth() {
        let TreeNode::Inner(inner) = &*node else {
            break;
        };
        let branch = at.select_branch(node_id.id());
        if inner.is_empty_branch(branch) {
            warn!(node = %node_id, "node offered for an empty branch");
            return Ok(AddNodeOutcome::invalid());
        }
        let child_hash = inner.child_hash(branch);
        if full_below.touch_if_exists(&child_hash) {
            return Ok(AddNodeOutcome::duplicate());
        }
        let child_id = at.child(branch);
        if let Some(child) = map.try_child_node(inner, &at, branch, filter)? {
            node = child;
            at = child_id;
            continue;
        }

        if child_id != *node_id {
            warn!(node = %node_id, stuck_at = %child_id, "unable to hook node");
            return Ok(AddNodeOutcome::invalid());
        }
        let received = match TreeNode::from_wire(raw) {
            Ok(received) => received,
            Err(e) => {
                warn!(node = %node_id, error = %e, "malformed node received");
                return Ok(AddNodeOutcome::invalid());
            }
        };
        if received.hash() != child_hash {
            warn!(node = %node_id, expected = %child_hash, actual = %received.hash(), "corrupt node received");
            return Ok(AddNodeOutcome::invalid());
        }
        // The parent vouches for this node, so a misplaced one means the
        // target tree itself is malformed.
        if !received.fits_at(&child_id) {
            warn!(node = %node_id, "node cannot sit at its position, map is invalid");
            map.set_invalid();
            return Ok(AddNodeOutcome::useful());
        }

        let kind = map.map_type().object_type();
        let mut received = Arc::new(received);
        if let Some(family) = map.family() {
            family.store_node(&received, kind)?;
            received = family.canonicalize(child_hash, received);
        }
        inner.hook_child(branch, received)?;
        if let Some(filter) = filter {
            filter.got_node(false, &child_hash, raw, kind);
        }
        trace!(node = %node_id, "node hooked");
        return Ok(AddNodeOutcome::useful());
    }

    trace!(node = %node_id, "node already present");
    Ok(AddNodeOutcome::duplicate())
}
