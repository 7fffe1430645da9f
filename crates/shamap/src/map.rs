use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use shamap_nodestore::{NodeObject, NodeObjectType};
use shamap_types::Hash256;
use tracing::{debug, warn};

use crate::error::{ShaMapError, ShaMapResult};
use crate::family::Family;
use crate::filter::SyncFilter;
use crate::item::ShaMapItem;
use crate::node::{InnerNode, LeafKind, LeafNode, TreeNode, BRANCH_FACTOR};
use crate::node_id::{NodeId, LEAF_DEPTH};

/// What a map holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapType {
    /// The transactions of a ledger or a proposed transaction set.
    Transaction,
    /// Ledger state: accounts, offers, trust lines.
    State,
    /// Scratch maps that belong to neither.
    Free,
}

impl MapType {
    /// The node store type used when this map's nodes are persisted.
    pub fn object_type(self) -> NodeObjectType {
        match self {
            Self::Transaction => NodeObjectType::TransactionNode,
            Self::State => NodeObjectType::AccountNode,
            Self::Free => NodeObjectType::Unknown,
        }
    }

    /// The leaf kind [`ShaMap::set_item`] uses.
    pub fn default_leaf_kind(self) -> LeafKind {
        match self {
            Self::Transaction => LeafKind::TransactionNoMeta,
            Self::State | Self::Free => LeafKind::AccountState,
        }
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction => write!(f, "transaction"),
            Self::State => write!(f, "state"),
            Self::Free => write!(f, "free"),
        }
    }
}

/// Lifecycle state of a map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapState {
    /// Open for mutation. Nodes it created since the last snapshot are its
    /// own.
    Modifying,
    /// Sealed. Every node may be shared with other maps.
    Immutable,
    /// Being acquired node by node; read-only.
    Synching,
    /// Acquisition proved the map cannot be built.
    Invalid,
}

/// Outcome of a removal one level down, reported to the parent.
enum Collapse {
    /// The child keeps its shape.
    Keep,
    /// The child has no children left.
    Empty,
    /// The child is left with one leaf, which takes the child's place.
    Promote(Arc<TreeNode>),
}

/// Resolves child slots to nodes, loading from the family or a sync filter.
#[derive(Clone, Copy)]
pub(crate) struct Loader<'a> {
    family: Option<&'a Family>,
    map_type: MapType,
}

impl Loader<'_> {
    /// Load the node with `hash` that belongs at `position`.
    ///
    /// Both the family and `filter` are only trusted for content that
    /// matches `hash`; a node that cannot sit at `position` is rejected as
    /// corrupt, whatever its hash.
    fn fetch(
        &self,
        hash: &Hash256,
        position: &NodeId,
        filter: Option<&dyn SyncFilter>,
    ) -> ShaMapResult<Option<Arc<TreeNode>>> {
        if let Some(family) = self.family {
            if let Some(node) = family.fetch_node(hash)? {
                check_position(&node, hash, position)?;
                return Ok(Some(node));
            }
        }
        let Some(filter) = filter else {
            return Ok(None);
        };
        let Some(bytes) = filter.get_node(hash) else {
            return Ok(None);
        };
        let node = TreeNode::from_wire(&bytes)?;
        if node.hash() != *hash {
            warn!(expected = %hash, actual = %node.hash(), "sync filter supplied a wrong node");
            return Err(ShaMapError::corrupt(format!(
                "filter node {} hashes to {}",
                hash,
                node.hash()
            )));
        }
        check_position(&node, hash, position)?;
        filter.got_node(true, hash, &bytes, self.map_type.object_type());
        let node = Arc::new(node);
        Ok(Some(match self.family {
            Some(family) => family.canonicalize(*hash, node),
            None => node,
        }))
    }

    /// The child at `branch` of `inner`, which sits at `id`, loading it if
    /// needed. `Ok(None)` for an empty branch; [`ShaMapError::MissingNode`]
    /// if the child is unavailable.
    pub(crate) fn child(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        branch: u8,
    ) -> ShaMapResult<Option<Arc<TreeNode>>> {
        let slot = inner.slot(branch);
        if slot.is_empty() {
            return Ok(None);
        }
        if let Some(node) = slot.resident() {
            return Ok(Some(Arc::clone(node)));
        }
        let hash = slot.hash();
        let child_id = id.child(branch);
        match self.fetch(&hash, &child_id, None)? {
            Some(node) => Ok(Some(slot.attach(node))),
            None => Err(ShaMapError::MissingNode {
                map_type: self.map_type,
                hash,
                node_id: child_id,
            }),
        }
    }

    /// Like [`child`](Self::child) but reports an unavailable child as
    /// `Ok(None)` and consults `filter` before giving up.
    pub(crate) fn try_child(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        branch: u8,
        filter: Option<&dyn SyncFilter>,
    ) -> ShaMapResult<Option<Arc<TreeNode>>> {
        let slot = inner.slot(branch);
        if slot.is_empty() {
            return Ok(None);
        }
        if let Some(node) = slot.resident() {
            return Ok(Some(Arc::clone(node)));
        }
        Ok(self
            .fetch(&slot.hash(), &id.child(branch), filter)?
            .map(|node| slot.attach(node)))
    }
}

fn check_position(node: &TreeNode, hash: &Hash256, position: &NodeId) -> ShaMapResult<()> {
    if node.fits_at(position) {
        return Ok(());
    }
    warn!(hash = %hash, position = %position, "loaded node cannot sit at its position");
    Err(ShaMapError::corrupt(format!(
        "node {hash} cannot sit at {position}"
    )))
}

/// A copy-on-write Merkle trie keyed by 256-bit keys.
///
/// Every node is held by `Arc`. [`snapshot`](Self::snapshot) shares the
/// whole tree with a new map in O(1); a later mutation clones only the
/// nodes on the path from the root to the changed leaf that are still
/// shared (`Arc::make_mut`), so other maps never observe it.
///
/// Nodes that are not in memory are loaded on demand from the map's
/// [`Family`]. A node that cannot be found is reported as
/// [`ShaMapError::MissingNode`] and the operation can be retried once the
/// node has been stored.
///
/// The root is always an inner node. Below the root the tree is kept
/// canonical: an inner node never ends up with a single leaf child, so the
/// shape, and therefore the hash, depends only on the set of items.
pub struct ShaMap {
    map_type: MapType,
    state: MapState,
    root: Arc<TreeNode>,
    family: Option<Family>,
}

impl ShaMap {
    /// An empty, modifiable map backed by `family`.
    pub fn new(map_type: MapType, family: Family) -> Self {
        Self::with_state(map_type, MapState::Modifying, Some(family))
    }

    /// An empty, modifiable map with no node store. It can only hold what
    /// is put into it.
    pub fn new_unbacked(map_type: MapType) -> Self {
        Self::with_state(map_type, MapState::Modifying, None)
    }

    /// An empty map waiting for its root to arrive through sync.
    pub fn synching(map_type: MapType, family: Family) -> Self {
        Self::with_state(map_type, MapState::Synching, Some(family))
    }

    fn with_state(map_type: MapType, state: MapState, family: Option<Family>) -> Self {
        Self {
            map_type,
            state,
            root: Arc::new(TreeNode::Inner(InnerNode::new())),
            family,
        }
    }

    /// An immutable map over the tree stored under `root_hash`.
    ///
    /// Only the root is loaded; everything else is fetched on demand.
    pub fn load(map_type: MapType, family: Family, root_hash: Hash256) -> ShaMapResult<Self> {
        let mut map = Self::with_state(map_type, MapState::Immutable, Some(family));
        if !map.fetch_root(root_hash, None)? {
            return Err(ShaMapError::MissingNode {
                map_type,
                hash: root_hash,
                node_id: NodeId::root(),
            });
        }
        Ok(map)
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    pub fn family(&self) -> Option<&Family> {
        self.family.as_ref()
    }

    pub fn is_backed(&self) -> bool {
        self.family.is_some()
    }

    pub fn is_synching(&self) -> bool {
        self.state == MapState::Synching
    }

    pub fn is_valid(&self) -> bool {
        self.state != MapState::Invalid
    }

    pub fn is_immutable(&self) -> bool {
        self.state == MapState::Immutable
    }

    /// Seal the map.
    pub fn set_immutable(&mut self) {
        if self.state == MapState::Modifying {
            self.state = MapState::Immutable;
        }
    }

    pub fn set_synching(&mut self) {
        self.state = MapState::Synching;
    }

    /// Leave the synching state; the map becomes modifiable.
    pub fn clear_synching(&mut self) {
        if self.state == MapState::Synching {
            self.state = MapState::Modifying;
        }
    }

    /// Mark the map as impossible to complete.
    pub fn set_invalid(&mut self) {
        self.state = MapState::Invalid;
    }

    /// The root hash. Dirty inner nodes are rehashed bottom-up on demand;
    /// clean nodes keep their memoized hash.
    pub fn get_hash(&self) -> Hash256 {
        self.root.hash()
    }

    pub fn root(&self) -> &Arc<TreeNode> {
        &self.root
    }

    pub(crate) fn root_inner(&self) -> &InnerNode {
        match &*self.root {
            TreeNode::Inner(inner) => inner,
            TreeNode::Leaf(_) => unreachable!("map root is always an inner node"),
        }
    }

    pub(crate) fn loader(&self) -> Loader<'_> {
        Loader {
            family: self.family.as_ref(),
            map_type: self.map_type,
        }
    }

    /// A new map sharing this map's entire tree.
    ///
    /// A modifiable source is sealed first. The snapshot is modifiable if
    /// `mutable` is set; its mutations never show through to this map.
    pub fn snapshot(&mut self, mutable: bool) -> ShaMap {
        self.set_immutable();
        debug!(map_type = %self.map_type, mutable, "map snapshot");
        Self {
            map_type: self.map_type,
            state: if mutable {
                MapState::Modifying
            } else {
                MapState::Immutable
            },
            root: Arc::clone(&self.root),
            family: self.family.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The leaf holding `key`, loading nodes on the way.
    fn find_leaf(&self, key: &Hash256) -> ShaMapResult<Option<Arc<TreeNode>>> {
        let loader = self.loader();
        let mut node = Arc::clone(&self.root);
        let mut id = NodeId::root();
        loop {
            let branch = id.select_branch(key);
            let child = match &*node {
                TreeNode::Inner(inner) => loader.child(inner, &id, branch)?,
                TreeNode::Leaf(_) => unreachable!("descent stops at leaves"),
            };
            let Some(child) = child else {
                return Ok(None);
            };
            if let TreeNode::Leaf(leaf) = &*child {
                return Ok((leaf.key() == key).then(|| Arc::clone(&child)));
            }
            id = id.child(branch);
            node = child;
        }
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &Hash256) -> ShaMapResult<Option<Bytes>> {
        Ok(self.peek_item(key)?.map(|item| item.data().clone()))
    }

    /// The item stored under `key`.
    pub fn peek_item(&self, key: &Hash256) -> ShaMapResult<Option<Arc<ShaMapItem>>> {
        Ok(self
            .find_leaf(key)?
            .and_then(|node| node.as_leaf().map(|leaf| Arc::clone(leaf.item()))))
    }

    /// The item under `key` with its leaf kind.
    pub fn peek_leaf(&self, key: &Hash256) -> ShaMapResult<Option<(Arc<ShaMapItem>, LeafKind)>> {
        Ok(self
            .find_leaf(key)?
            .and_then(|node| node.as_leaf().map(|leaf| (Arc::clone(leaf.item()), leaf.kind()))))
    }

    pub fn has_item(&self, key: &Hash256) -> ShaMapResult<bool> {
        Ok(self.find_leaf(key)?.is_some())
    }

    /// The child of `inner` (located at `id`) under `branch`, loading it if
    /// needed. Unavailable children are [`ShaMapError::MissingNode`].
    pub fn child_node(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        branch: u8,
    ) -> ShaMapResult<Option<Arc<TreeNode>>> {
        self.loader().child(inner, id, branch)
    }

    /// Like [`child_node`](Self::child_node) but returns `Ok(None)` for an
    /// unavailable child, after asking `filter`.
    pub fn try_child_node(
        &self,
        inner: &InnerNode,
        id: &NodeId,
        branch: u8,
        filter: Option<&dyn SyncFilter>,
    ) -> ShaMapResult<Option<Arc<TreeNode>>> {
        self.loader().try_child(inner, id, branch, filter)
    }

    /// Returns `true` if the inner node at `id` is available locally and
    /// hashes to `hash`.
    pub fn has_inner_node(&self, id: &NodeId, hash: &Hash256) -> ShaMapResult<bool> {
        let loader = self.loader();
        let mut node = Arc::clone(&self.root);
        let mut at = NodeId::root();
        while at.depth() < id.depth() {
            let Some(inner) = node.as_inner() else {
                return Ok(false);
            };
            let branch = at.select_branch(id.id());
            let Some(child) = loader.try_child(inner, &at, branch, None)? else {
                return Ok(false);
            };
            at = at.child(branch);
            node = child;
        }
        Ok(node.is_inner() && node.hash() == *hash)
    }

    /// Returns `true` if the leaf holding `key` is available locally and
    /// hashes to `hash`.
    pub fn has_leaf_node(&self, key: &Hash256, hash: &Hash256) -> ShaMapResult<bool> {
        let loader = self.loader();
        let mut node = Arc::clone(&self.root);
        let mut at = NodeId::root();
        loop {
            let branch = at.select_branch(key);
            let child = match &*node {
                TreeNode::Leaf(leaf) => return Ok(leaf.key() == key && leaf.hash() == *hash),
                TreeNode::Inner(inner) => loader.try_child(inner, &at, branch, None)?,
            };
            let Some(child) = child else {
                return Ok(false);
            };
            at = at.child(branch);
            node = child;
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn ensure_modifiable(&self) -> ShaMapResult<()> {
        if self.state == MapState::Modifying {
            Ok(())
        } else {
            Err(ShaMapError::ImmutableMap)
        }
    }

    /// Insert or replace `key`. Uses the map type's default leaf kind.
    ///
    /// Returns `Ok(true)` if the map changed and `Ok(false)` if it already
    /// held exactly this item, which is still a successful write. A map that
    /// cannot be written fails with [`ShaMapError::ImmutableMap`].
    pub fn set_item(&mut self, key: Hash256, data: impl Into<Bytes>) -> ShaMapResult<bool> {
        self.ensure_modifiable()?;
        let item = ShaMapItem::new(key, data);
        let kind = self.map_type.default_leaf_kind();
        if let Some(existing) = self.find_leaf(&key)? {
            if let Some(leaf) = existing.as_leaf() {
                if leaf.kind() == kind && leaf.item().data() == item.data() {
                    return Ok(false);
                }
            }
        }
        self.put_leaf(LeafNode::new(Arc::new(item), kind))?;
        Ok(true)
    }

    /// Insert a new item. Returns `false` if the key is already present.
    pub fn add_item(&mut self, item: ShaMapItem, kind: LeafKind) -> ShaMapResult<bool> {
        self.ensure_modifiable()?;
        if self.find_leaf(item.key())?.is_some() {
            return Ok(false);
        }
        self.put_leaf(LeafNode::new(Arc::new(item), kind))?;
        Ok(true)
    }

    /// Replace an existing item. Returns `false` if the key is absent or is
    /// held by a leaf of a different kind.
    pub fn update_item(&mut self, item: ShaMapItem, kind: LeafKind) -> ShaMapResult<bool> {
        self.ensure_modifiable()?;
        let Some(existing) = self.find_leaf(item.key())? else {
            return Ok(false);
        };
        if existing.as_leaf().map(LeafNode::kind) != Some(kind) {
            return Ok(false);
        }
        drop(existing);
        self.put_leaf(LeafNode::new(Arc::new(item), kind))?;
        Ok(true)
    }

    /// Remove `key`. Returns `false` if it was not present.
    ///
    /// Inner nodes left with a single leaf are collapsed into that leaf, all
    /// the way up.
    pub fn del_item(&mut self, key: &Hash256) -> ShaMapResult<bool> {
        self.ensure_modifiable()?;
        if !self.prepare_removal(key)? {
            return Ok(false);
        }
        let loader = Loader {
            family: self.family.as_ref(),
            map_type: self.map_type,
        };
        let root = match Arc::make_mut(&mut self.root) {
            TreeNode::Inner(inner) => inner,
            TreeNode::Leaf(_) => unreachable!("map root is always an inner node"),
        };
        // The root is never collapsed.
        remove_below(root, &NodeId::root(), key, loader)?;
        Ok(true)
    }

    /// Load everything a removal of `key` may touch, so that the removal
    /// itself cannot fail halfway. Returns `true` if `key` is present.
    fn prepare_removal(&self, key: &Hash256) -> ShaMapResult<bool> {
        let loader = self.loader();
        let mut node = Arc::clone(&self.root);
        let mut id = NodeId::root();
        loop {
            let Some(inner) = node.as_inner() else {
                unreachable!("descent stops at leaves");
            };
            let branch = id.select_branch(key);
            if inner.branch_count() == 2 {
                // The sibling may be promoted into this node's place.
                for other in (0..BRANCH_FACTOR as u8).filter(|b| *b != branch) {
                    loader.child(inner, &id, other)?;
                }
            }
            let Some(child) = loader.child(inner, &id, branch)? else {
                return Ok(false);
            };
            if let TreeNode::Leaf(leaf) = &*child {
                return Ok(leaf.key() == key);
            }
            id = id.child(branch);
            node = child;
        }
    }

    /// Write `leaf` at its key's position. The path must be loaded.
    fn put_leaf(&mut self, leaf: LeafNode) -> ShaMapResult<()> {
        let loader = Loader {
            family: self.family.as_ref(),
            map_type: self.map_type,
        };
        let root = match Arc::make_mut(&mut self.root) {
            TreeNode::Inner(inner) => inner,
            TreeNode::Leaf(_) => unreachable!("map root is always an inner node"),
        };
        insert_below(root, &NodeId::root(), leaf, loader)
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Call `f` for every node, parents before children, loading as needed.
    pub fn visit_nodes(&self, f: &mut dyn FnMut(&NodeId, &TreeNode)) -> ShaMapResult<()> {
        self.visit_nodes_from(&self.root, &NodeId::root(), f)
    }

    fn visit_nodes_from(
        &self,
        node: &Arc<TreeNode>,
        id: &NodeId,
        f: &mut dyn FnMut(&NodeId, &TreeNode),
    ) -> ShaMapResult<()> {
        f(id, node);
        if let TreeNode::Inner(inner) = &**node {
            for branch in 0..BRANCH_FACTOR as u8 {
                if let Some(child) = self.child_node(inner, id, branch)? {
                    self.visit_nodes_from(&child, &id.child(branch), f)?;
                }
            }
        }
        Ok(())
    }

    /// Call `f` for every item in key order.
    pub fn visit_leaves(&self, f: &mut dyn FnMut(&Arc<ShaMapItem>)) -> ShaMapResult<()> {
        for item in self.iter() {
            f(&item?);
        }
        Ok(())
    }

    /// Every item at or below `node`, which sits at `id`, in key order.
    pub fn leaves_below(
        &self,
        node: &Arc<TreeNode>,
        id: &NodeId,
    ) -> ShaMapResult<Vec<Arc<ShaMapItem>>> {
        let mut out = Vec::new();
        self.collect_leaves(node, id, &mut out)?;
        Ok(out)
    }

    fn collect_leaves(
        &self,
        node: &Arc<TreeNode>,
        id: &NodeId,
        out: &mut Vec<Arc<ShaMapItem>>,
    ) -> ShaMapResult<()> {
        match &**node {
            TreeNode::Leaf(leaf) => out.push(Arc::clone(leaf.item())),
            TreeNode::Inner(inner) => {
                for branch in 0..BRANCH_FACTOR as u8 {
                    if let Some(child) = self.child_node(inner, id, branch)? {
                        self.collect_leaves(&child, &id.child(branch), out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify the structure of the whole tree, loading every node.
    ///
    /// Checks that stored child hashes match the children, that every leaf
    /// lies under its position, and that no inner node below the root is
    /// empty or holds a lone leaf.
    pub fn check_invariants(&self) -> ShaMapResult<()> {
        self.check_inner(self.root_inner(), &NodeId::root())
    }

    fn check_inner(&self, inner: &InnerNode, id: &NodeId) -> ShaMapResult<()> {
        let violation = |node_id: NodeId, reason: &str| ShaMapError::Invariant {
            node_id,
            reason: reason.to_string(),
        };
        let count = inner.branch_count();
        if !id.is_root() && count == 0 {
            return Err(violation(*id, "empty inner node below the root"));
        }
        for branch in 0..BRANCH_FACTOR as u8 {
            let Some(child) = self.child_node(inner, id, branch)? else {
                continue;
            };
            let child_id = id.child(branch);
            if child.hash() != inner.child_hash(branch) {
                return Err(violation(child_id, "child does not match its recorded hash"));
            }
            match &*child {
                TreeNode::Leaf(leaf) => {
                    if !child_id.contains(leaf.key()) {
                        return Err(violation(child_id, "leaf outside its position"));
                    }
                    if count == 1 && !id.is_root() {
                        return Err(violation(*id, "inner node holds a single leaf"));
                    }
                }
                TreeNode::Inner(child_inner) => {
                    if child_id.depth() >= LEAF_DEPTH {
                        return Err(violation(child_id, "inner node at leaf depth"));
                    }
                    self.check_inner(child_inner, &child_id)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Persist every in-memory node not yet written, as `kind`, in one
    /// batch. Returns the number of nodes written.
    ///
    /// Written nodes are also made the shared instances in the family's
    /// tree-node cache. Unbacked maps write nothing.
    pub fn flush_dirty(&self, kind: NodeObjectType) -> ShaMapResult<usize> {
        let Some(family) = &self.family else {
            return Ok(0);
        };
        let mut dirty = Vec::new();
        collect_dirty(&self.root, &mut dirty);
        if dirty.is_empty() {
            return Ok(0);
        }
        let batch = dirty
            .iter()
            .map(|node| NodeObject::new(kind, node.hash(), node.to_wire()))
            .collect();
        family.db().store_batch(batch)?;
        for node in &dirty {
            node.mark_written();
            family.canonicalize(node.hash(), Arc::clone(node));
        }
        debug!(
            map_type = %self.map_type,
            count = dirty.len(),
            root = %self.get_hash().short_hex(),
            "flushed dirty nodes"
        );
        Ok(dirty.len())
    }

    /// Point the map at the tree stored under `hash`.
    ///
    /// Returns `Ok(false)` if the root is available neither locally nor
    /// from `filter`. A zero hash selects the empty tree.
    pub fn fetch_root(
        &mut self,
        hash: Hash256,
        filter: Option<&dyn SyncFilter>,
    ) -> ShaMapResult<bool> {
        if hash == self.root.hash() {
            return Ok(true);
        }
        if hash.is_zero() {
            self.root = Arc::new(TreeNode::Inner(InnerNode::new()));
            return Ok(true);
        }
        let Some(node) = self.loader().fetch(&hash, &NodeId::root(), filter)? else {
            return Ok(false);
        };
        self.set_root_node(node)?;
        Ok(true)
    }

    /// Replace the root. Only inner nodes can be roots.
    pub fn set_root_node(&mut self, node: Arc<TreeNode>) -> ShaMapResult<()> {
        if !node.is_inner() {
            return Err(ShaMapError::corrupt("a map root must be an inner node"));
        }
        self.root = node;
        Ok(())
    }
}

impl fmt::Debug for ShaMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaMap")
            .field("map_type", &self.map_type)
            .field("state", &self.state)
            .field("backed", &self.is_backed())
            .finish()
    }
}

/// Insert `leaf` below `inner`, which sits at `id`, cloning shared nodes on
/// the way down.
fn insert_below(
    inner: &mut InnerNode,
    id: &NodeId,
    leaf: LeafNode,
    loader: Loader<'_>,
) -> ShaMapResult<()> {
    enum Step {
        Attach,
        Split(Arc<TreeNode>),
        Descend,
    }

    let key = *leaf.key();
    let branch = id.select_branch(&key);
    let child_id = id.child(branch);
    let step = match loader.child(inner, id, branch)? {
        None => Step::Attach,
        Some(child) => match child.as_leaf().map(|existing| *existing.key() == key) {
            Some(true) => Step::Attach,
            Some(false) => Step::Split(child),
            None => Step::Descend,
        },
    };
    match step {
        Step::Attach => inner.set_child(branch, Arc::new(TreeNode::Leaf(leaf))),
        Step::Split(existing) => {
            let split = split_leaves(existing, leaf, &child_id);
            inner.set_child(branch, Arc::new(TreeNode::Inner(split)));
        }
        Step::Descend => {
            inner.invalidate();
            let child = inner
                .child_arc_mut(branch)
                .ok_or_else(|| ShaMapError::corrupt("child not loaded during insert"))?;
            let TreeNode::Inner(child_inner) = Arc::make_mut(child) else {
                return Err(ShaMapError::corrupt("expected an inner node during insert"));
            };
            insert_below(child_inner, &child_id, leaf, loader)?;
        }
    }
    Ok(())
}

/// Build the inner node at `id` holding both `existing` and `new`, with
/// one inner node per shared nibble between them.
fn split_leaves(existing: Arc<TreeNode>, new: LeafNode, id: &NodeId) -> InnerNode {
    let existing_key = match &*existing {
        TreeNode::Leaf(leaf) => *leaf.key(),
        TreeNode::Inner(_) => unreachable!("only leaves are split"),
    };
    let mut node = InnerNode::new();
    let old_branch = id.select_branch(&existing_key);
    let new_branch = id.select_branch(new.key());
    if old_branch == new_branch {
        let below = split_leaves(existing, new, &id.child(old_branch));
        node.set_child(old_branch, Arc::new(TreeNode::Inner(below)));
    } else {
        node.set_child(old_branch, existing);
        node.set_child(new_branch, Arc::new(TreeNode::Leaf(new)));
    }
    node
}

/// Remove `key` below `inner`, which sits at `id`, and report how `inner`
/// should be collapsed by its parent.
fn remove_below(
    inner: &mut InnerNode,
    id: &NodeId,
    key: &Hash256,
    loader: Loader<'_>,
) -> ShaMapResult<Collapse> {
    let branch = id.select_branch(key);
    let child_id = id.child(branch);
    let child_is_leaf = match loader.child(inner, id, branch)? {
        Some(child) => child.is_leaf(),
        None => return Ok(Collapse::Keep),
    };
    if child_is_leaf {
        inner.clear_child(branch);
    } else {
        inner.invalidate();
        let child = inner
            .child_arc_mut(branch)
            .ok_or_else(|| ShaMapError::corrupt("child not loaded during removal"))?;
        let TreeNode::Inner(child_inner) = Arc::make_mut(child) else {
            return Err(ShaMapError::corrupt("expected an inner node during removal"));
        };
        match remove_below(child_inner, &child_id, key, loader)? {
            Collapse::Keep => return Ok(Collapse::Keep),
            Collapse::Empty => inner.clear_child(branch),
            Collapse::Promote(leaf) => inner.set_child(branch, leaf),
        }
    }

    match inner.branch_count() {
        0 => Ok(Collapse::Empty),
        1 => {
            let only = (0..BRANCH_FACTOR as u8)
                .find(|b| !inner.is_empty_branch(*b))
                .unwrap_or_default();
            match loader.child(inner, id, only)? {
                Some(child) if child.is_leaf() => Ok(Collapse::Promote(child)),
                _ => Ok(Collapse::Keep),
            }
        }
        _ => Ok(Collapse::Keep),
    }
}

/// Collect, children first, every resident node not yet written. Written
/// subtrees are skipped: a mutation below a node always clears its flag.
fn collect_dirty(node: &Arc<TreeNode>, out: &mut Vec<Arc<TreeNode>>) {
    if node.is_written() {
        return;
    }
    if let TreeNode::Inner(inner) = &**node {
        if inner.is_empty() {
            return;
        }
        for branch in 0..BRANCH_FACTOR as u8 {
            if let Some(child) = inner.resident_child(branch) {
                collect_dirty(&child, out);
            }
        }
    }
    out.push(Arc::clone(node));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    fn key(n: u64) -> Hash256 {
        Hash256::from_low_u64(n)
    }

    /// A key whose first byte is `b`.
    fn top(b: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = b;
        bytes[31] = 1;
        Hash256::from_hash(bytes)
    }

    fn state_map() -> ShaMap {
        ShaMap::new(MapType::State, Family::in_memory())
    }

    fn contents(map: &ShaMap) -> BTreeMap<Hash256, Bytes> {
        map.iter()
            .map(|item| {
                let item = item.unwrap();
                (*item.key(), item.data().clone())
            })
            .collect()
    }

    fn build(keys: impl IntoIterator<Item = Hash256>) -> ShaMap {
        let mut map = ShaMap::new_unbacked(MapType::State);
        for k in keys {
            map.set_item(k, k.as_bytes()[24..].to_vec()).unwrap();
        }
        map
    }

    // -----------------------------------------------------------------------
    // Basic operations
    // -----------------------------------------------------------------------

    #[test]
    fn empty_map() {
        let map = state_map();
        assert!(map.get_hash().is_zero());
        assert_eq!(map.get(&key(1)).unwrap(), None);
        assert_eq!(map.state(), MapState::Modifying);
        map.check_invariants().unwrap();
    }

    #[test]
    fn set_get_and_overwrite() {
        let mut map = state_map();
        assert!(map.set_item(key(1), b"a".to_vec()).unwrap());
        assert_eq!(map.get(&key(1)).unwrap().as_deref(), Some(&b"a"[..]));
        let h1 = map.get_hash();
        assert!(!h1.is_zero());

        // Same value again changes nothing.
        assert!(!map.set_item(key(1), b"a".to_vec()).unwrap());
        assert_eq!(map.get_hash(), h1);

        assert!(map.set_item(key(1), b"b".to_vec()).unwrap());
        assert_eq!(map.get(&key(1)).unwrap().as_deref(), Some(&b"b"[..]));
        assert_ne!(map.get_hash(), h1);

        // A sealed map refuses the write outright, even an unchanged one.
        map.set_immutable();
        assert!(matches!(
            map.set_item(key(1), b"b".to_vec()),
            Err(ShaMapError::ImmutableMap)
        ));
    }

    #[test]
    fn add_and_update_semantics() {
        let mut map = state_map();
        let item = |v: &[u8]| ShaMapItem::new(key(9), v.to_vec());
        assert!(!map.update_item(item(b"x"), LeafKind::AccountState).unwrap());
        assert!(map.add_item(item(b"x"), LeafKind::AccountState).unwrap());
        assert!(!map.add_item(item(b"y"), LeafKind::AccountState).unwrap());
        assert_eq!(map.get(&key(9)).unwrap().as_deref(), Some(&b"x"[..]));

        // A leaf cannot change kind through an update.
        assert!(!map.update_item(item(b"y"), LeafKind::TransactionNoMeta).unwrap());
        assert!(map.update_item(item(b"y"), LeafKind::AccountState).unwrap());
        let (found, kind) = map.peek_leaf(&key(9)).unwrap().unwrap();
        assert_eq!(found.data().as_ref(), b"y");
        assert_eq!(kind, LeafKind::AccountState);
    }

    #[test]
    fn leaf_kind_changes_the_root_hash() {
        let mut a = state_map();
        let mut b = state_map();
        a.add_item(ShaMapItem::new(key(1), b"t".to_vec()), LeafKind::TransactionNoMeta)
            .unwrap();
        b.add_item(ShaMapItem::new(key(1), b"t".to_vec()), LeafKind::TransactionWithMeta)
            .unwrap();
        assert_ne!(a.get_hash(), b.get_hash());
    }

    #[test]
    fn delete_missing_key() {
        let mut map = build([key(1), key(2)]);
        let before = map.get_hash();
        assert!(!map.del_item(&key(3)).unwrap());
        assert_eq!(map.get_hash(), before);
    }

    #[test]
    fn delete_everything_returns_to_empty() {
        let keys: Vec<Hash256> = (0..100).map(key).collect();
        let mut map = build(keys.iter().copied());
        for k in &keys {
            assert!(map.del_item(k).unwrap());
            map.check_invariants().unwrap();
        }
        assert!(map.get_hash().is_zero());
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn keys_sharing_long_prefixes() {
        // These keys differ only in their last nibble: the tree is a chain
        // of 63 inner nodes.
        let mut map = build([key(0x10), key(0x11)]);
        map.check_invariants().unwrap();
        let mut depth = 0;
        map.visit_nodes(&mut |id, node| {
            if node.is_inner() {
                depth = depth.max(id.depth());
            }
        })
        .unwrap();
        assert_eq!(depth, 63);

        // Removing one collapses the whole chain.
        map.del_item(&key(0x11)).unwrap();
        map.check_invariants().unwrap();
        assert_eq!(map.get_hash(), build([key(0x10)]).get_hash());
        let mut nodes = 0;
        map.visit_nodes(&mut |_, _| nodes += 1).unwrap();
        assert_eq!(nodes, 2);
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    #[test]
    fn snapshot_remove_leaves_source_untouched() {
        let mut map1 = state_map();
        map1.set_item(key(1), b"a".to_vec()).unwrap();
        map1.set_item(key(2), b"b".to_vec()).unwrap();
        let h1 = map1.get_hash();

        let mut map2 = map1.snapshot(true);
        assert!(map2.del_item(&key(2)).unwrap());

        assert_eq!(map1.get(&key(2)).unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(map2.get(&key(2)).unwrap(), None);
        assert_eq!(map1.get_hash(), h1);
        assert_ne!(map2.get_hash(), h1);
    }

    #[test]
    fn snapshot_seals_the_source() {
        let mut map = state_map();
        map.set_item(key(1), b"a".to_vec()).unwrap();
        let frozen = map.snapshot(false);
        assert!(map.is_immutable());
        assert!(frozen.is_immutable());
        assert!(matches!(
            map.set_item(key(2), b"b".to_vec()),
            Err(ShaMapError::ImmutableMap)
        ));
        assert!(matches!(map.del_item(&key(1)), Err(ShaMapError::ImmutableMap)));
        assert_eq!(frozen.get_hash(), map.get_hash());
    }

    #[test]
    fn synching_maps_reject_mutation() {
        let mut map = ShaMap::synching(MapType::State, Family::in_memory());
        assert!(map.is_synching());
        assert!(matches!(
            map.set_item(key(1), b"a".to_vec()),
            Err(ShaMapError::ImmutableMap)
        ));
        map.clear_synching();
        assert_eq!(map.state(), MapState::Modifying);
        assert!(map.set_item(key(1), b"a".to_vec()).unwrap());
    }

    #[test]
    fn sibling_snapshots_are_isolated() {
        let mut base = build((0..50).map(key));
        let mut a = base.snapshot(true);
        let mut b = base.snapshot(true);
        a.set_item(key(1000), b"only in a".to_vec()).unwrap();
        b.del_item(&key(7)).unwrap();
        b.set_item(key(8), b"changed in b".to_vec()).unwrap();

        assert_eq!(a.get(&key(1000)).unwrap().as_deref(), Some(&b"only in a"[..]));
        assert_eq!(b.get(&key(1000)).unwrap(), None);
        assert!(a.has_item(&key(7)).unwrap());
        assert!(!b.has_item(&key(7)).unwrap());
        assert_ne!(a.get(&key(8)).unwrap(), b.get(&key(8)).unwrap());
        assert_eq!(base.iter().count(), 50);
    }

    #[test]
    fn unchanged_subtrees_stay_shared() {
        // Four keys under each root branch.
        let mut base = build((0..64).map(|n| top(n * 4)));
        let mut copy = base.snapshot(true);
        copy.set_item(top(0x10), b"new".to_vec()).unwrap();
        let base_root = base.root_inner();
        let copy_root = copy.root_inner();
        for branch in 0..BRANCH_FACTOR as u8 {
            let x = base_root.resident_child(branch).unwrap();
            let y = copy_root.resident_child(branch).unwrap();
            if branch == 1 {
                assert!(!Arc::ptr_eq(&x, &y), "modified branch still shared");
            } else {
                assert!(Arc::ptr_eq(&x, &y), "branch {branch} was copied");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn flush_writes_only_dirty_nodes() {
        let family = Family::in_memory();
        let mut map = ShaMap::new(MapType::State, family.clone());
        // One leaf under every root branch.
        for n in 0..16u8 {
            map.set_item(top(n << 4), vec![n]).unwrap();
        }
        assert_eq!(map.flush_dirty(NodeObjectType::AccountNode).unwrap(), 17);
        assert_eq!(map.flush_dirty(NodeObjectType::AccountNode).unwrap(), 0);

        map.set_item(top(5 << 4), b"changed".to_vec()).unwrap();
        // The new leaf and the root.
        assert_eq!(map.flush_dirty(NodeObjectType::AccountNode).unwrap(), 2);
        assert!(family.db().exists(&map.get_hash()).unwrap());
        assert_eq!(family.db().stats().store_count, 19);
    }

    #[test]
    fn unbacked_maps_do_not_flush() {
        let map = build((0..5).map(key));
        assert_eq!(map.flush_dirty(NodeObjectType::AccountNode).unwrap(), 0);
    }

    #[test]
    fn empty_map_flushes_nothing() {
        let map = state_map();
        assert_eq!(map.flush_dirty(NodeObjectType::AccountNode).unwrap(), 0);
    }

    #[test]
    fn reload_from_root_hash() {
        let family = Family::in_memory();
        let mut map = ShaMap::new(MapType::State, family.clone());
        for n in 0..300 {
            map.set_item(key(n * 7919), n.to_be_bytes().to_vec()).unwrap();
        }
        map.flush_dirty(NodeObjectType::AccountNode).unwrap();

        // A fresh family over the same store with a cold cache.
        let cold = Family::new(
            Arc::clone(family.db()),
            Arc::new(crate::family::TreeNodeCache::new(
                "cold",
                0,
                std::time::Duration::from_secs(60),
            )),
        );
        let reloaded = ShaMap::load(MapType::State, cold, map.get_hash()).unwrap();
        assert!(reloaded.is_immutable());
        assert_eq!(reloaded.get_hash(), map.get_hash());
        assert_eq!(contents(&reloaded), contents(&map));
        reloaded.check_invariants().unwrap();
    }

    #[test]
    fn load_unknown_root_is_missing_node() {
        let err = ShaMap::load(MapType::State, Family::in_memory(), key(42)).unwrap_err();
        match err {
            ShaMapError::MissingNode { hash, node_id, map_type } => {
                assert_eq!(hash, key(42));
                assert!(node_id.is_root());
                assert_eq!(map_type, MapType::State);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_node_is_precise_and_recoverable() {
        let source = Family::in_memory();
        let mut map = ShaMap::new(MapType::State, source.clone());
        for n in 0..40 {
            map.set_item(key(n << 58), vec![n as u8; 3]).unwrap();
        }
        map.flush_dirty(NodeObjectType::AccountNode).unwrap();
        let target = key(17 << 58);

        // Copy everything except the target's leaf into a second store.
        let leaf_hash = {
            let mut hash = None;
            map.visit_nodes(&mut |_, node| {
                if let Some(leaf) = node.as_leaf() {
                    if *leaf.key() == target {
                        hash = Some(leaf.hash());
                    }
                }
            })
            .unwrap();
            hash.unwrap()
        };
        let partial = Family::in_memory();
        source
            .db()
            .visit_all(&mut |obj| {
                if obj.hash != leaf_hash {
                    partial.db().store_object(obj).unwrap();
                }
            })
            .unwrap();

        let reloaded = ShaMap::load(MapType::State, partial.clone(), map.get_hash()).unwrap();
        let err = reloaded.get(&target).unwrap_err();
        let ShaMapError::MissingNode { hash, node_id, .. } = err else {
            panic!("expected a missing node, got {err}");
        };
        assert_eq!(hash, leaf_hash);
        assert!(node_id.contains(&target));

        // Supply exactly the reported node and retry.
        let object = source.db().fetch(&hash).unwrap().unwrap();
        partial.db().store_object((*object).clone()).unwrap();
        assert_eq!(reloaded.get(&target).unwrap().as_deref(), Some(&[17u8; 3][..]));
    }

    #[test]
    fn corrupt_store_is_reported() {
        let family = Family::in_memory();
        let mut map = ShaMap::new(MapType::State, family.clone());
        map.set_item(key(1), b"a".to_vec()).unwrap();
        map.set_item(key(1 << 60), b"b".to_vec()).unwrap();
        map.flush_dirty(NodeObjectType::AccountNode).unwrap();

        let bad = Family::in_memory();
        family
            .db()
            .visit_all(&mut |obj| {
                let data = if obj.hash == map.get_hash() {
                    obj.data.clone()
                } else {
                    bytes::Bytes::from_static(b"\x01garbage")
                };
                bad.db().store(obj.kind, obj.hash, data).unwrap();
            })
            .unwrap();
        let reloaded = ShaMap::load(MapType::State, bad, map.get_hash()).unwrap();
        assert!(matches!(reloaded.get(&key(1)), Err(ShaMapError::CorruptNode(_))));
    }

    #[test]
    fn structural_queries() {
        let mut map = build((0..30).map(|n| key(n << 59)));
        map.set_immutable();
        let mut inner_ids = Vec::new();
        let mut leaves = Vec::new();
        map.visit_nodes(&mut |id, node| match node {
            TreeNode::Inner(_) => inner_ids.push((*id, node.hash())),
            TreeNode::Leaf(leaf) => leaves.push((*leaf.key(), leaf.hash())),
        })
        .unwrap();
        for (id, hash) in &inner_ids {
            assert!(map.has_inner_node(id, hash).unwrap());
            assert!(!map.has_inner_node(id, &key(1)).unwrap());
        }
        for (k, hash) in &leaves {
            assert!(map.has_leaf_node(k, hash).unwrap());
        }
        assert!(!map.has_leaf_node(&key(3), &leaves[0].1).unwrap());
    }

    #[test]
    fn visit_leaves_and_leaves_below_agree() {
        let map = build((0..40).map(|n| key(n * 31)));
        let mut visited = Vec::new();
        map.visit_leaves(&mut |item| visited.push(*item.key())).unwrap();
        let below: Vec<Hash256> = map
            .leaves_below(map.root(), &NodeId::root())
            .unwrap()
            .iter()
            .map(|i| *i.key())
            .collect();
        assert_eq!(visited, below);
        assert_eq!(visited.len(), 40);
    }

    // -----------------------------------------------------------------------
    // Untrusted nodes
    // -----------------------------------------------------------------------

    /// Nodes holding one key that have a hash-consistent chain of inner
    /// nodes one level too deep above it. The leaf comes first, the root
    /// last.
    fn overdeep_chain() -> Vec<Arc<TreeNode>> {
        let item = ShaMapItem::new(Hash256::zero(), b"deep".to_vec());
        let mut below = Arc::new(TreeNode::Leaf(LeafNode::new(Arc::new(item), LeafKind::AccountState)));
        let mut nodes = vec![Arc::clone(&below)];
        for _ in 0..=LEAF_DEPTH {
            let mut inner = InnerNode::new();
            inner.set_child(0, below);
            below = Arc::new(TreeNode::Inner(inner));
            nodes.push(Arc::clone(&below));
        }
        nodes
    }

    /// A root whose only child, under branch 0, is a leaf keyed 0xff...
    fn misplaced_leaf() -> Vec<Arc<TreeNode>> {
        let item = ShaMapItem::new(Hash256::from_hash([0xff; 32]), b"x".to_vec());
        let leaf = Arc::new(TreeNode::Leaf(LeafNode::new(Arc::new(item), LeafKind::AccountState)));
        let mut root = InnerNode::new();
        root.set_child(0, Arc::clone(&leaf));
        vec![leaf, Arc::new(TreeNode::Inner(root))]
    }

    fn stored(nodes: &[Arc<TreeNode>]) -> Family {
        let family = Family::in_memory();
        for node in nodes {
            family.store_node(node, NodeObjectType::AccountNode).unwrap();
        }
        family
    }

    struct WireFilter(HashMap<Hash256, Vec<u8>>);

    impl WireFilter {
        fn new(nodes: &[Arc<TreeNode>]) -> Self {
            Self(nodes.iter().map(|n| (n.hash(), n.to_wire())).collect())
        }
    }

    impl SyncFilter for WireFilter {
        fn get_node(&self, hash: &Hash256) -> Option<Vec<u8>> {
            self.0.get(hash).cloned()
        }

        fn got_node(&self, _from_filter: bool, _hash: &Hash256, _data: &[u8], _kind: NodeObjectType) {}
    }

    fn is_corrupt<T>(result: ShaMapResult<T>) -> bool {
        matches!(result, Err(ShaMapError::CorruptNode(_)))
    }

    #[test]
    fn stored_inner_node_at_leaf_depth_is_corrupt() {
        let nodes = overdeep_chain();
        let root = nodes.last().unwrap().hash();

        let map = ShaMap::load(MapType::State, stored(&nodes), root).unwrap();
        assert!(is_corrupt(map.get(&Hash256::zero())));
        assert!(is_corrupt(map.iter().next().unwrap()));
        assert!(is_corrupt(map.check_invariants()));

        // Without the leaf the walk still stops at the bad inner node.
        let map = ShaMap::load(MapType::State, stored(&nodes[1..]), root).unwrap();
        assert!(is_corrupt(map.iter().next().unwrap()));
        assert!(is_corrupt(map.has_item(&Hash256::zero())));
    }

    #[test]
    fn stored_leaf_outside_its_position_is_corrupt() {
        let nodes = misplaced_leaf();
        let root = nodes.last().unwrap().hash();
        let map = ShaMap::load(MapType::State, stored(&nodes), root).unwrap();
        assert!(is_corrupt(map.get(&Hash256::zero())));
        assert!(is_corrupt(map.iter().next().unwrap()));
        // Lookups that never reach the leaf are unaffected.
        assert_eq!(map.get(&Hash256::from_hash([0xff; 32])).unwrap(), None);
    }

    #[test]
    fn filter_nodes_are_checked_against_their_position() {
        let nodes = overdeep_chain();
        let filter = WireFilter::new(&nodes);
        let mut map = ShaMap::synching(MapType::State, Family::in_memory());
        assert!(map.fetch_root(nodes.last().unwrap().hash(), Some(&filter)).unwrap());

        let mut node = Arc::clone(map.root());
        let mut id = NodeId::root();
        let err = loop {
            let inner = node.as_inner().expect("chain of inner nodes");
            match map.try_child_node(inner, &id, 0, Some(&filter)) {
                Ok(Some(child)) => {
                    node = child;
                    id = id.child(0);
                }
                Ok(None) => panic!("chain ended early at {id}"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ShaMapError::CorruptNode(_)), "{err}");
        assert_eq!(id.depth(), LEAF_DEPTH - 1);

        let nodes = misplaced_leaf();
        let filter = WireFilter::new(&nodes);
        let mut map = ShaMap::synching(MapType::State, Family::in_memory());
        assert!(map.fetch_root(nodes[1].hash(), Some(&filter)).unwrap());
        let root = Arc::clone(map.root());
        let inner = root.as_inner().unwrap();
        assert!(is_corrupt(map.try_child_node(inner, &NodeId::root(), 0, Some(&filter))));
    }

    // -----------------------------------------------------------------------
    // Concurrent readers
    // -----------------------------------------------------------------------

    #[test]
    fn maps_are_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<ShaMap>();
        check::<Family>();
        check::<TreeNode>();
    }

    #[test]
    fn sealed_map_reads_from_many_threads() {
        let family = Family::in_memory();
        let mut map = ShaMap::new(MapType::State, family.clone());
        for n in 0..2000 {
            map.set_item(key(n * 7919), n.to_be_bytes().to_vec()).unwrap();
        }
        map.flush_dirty(NodeObjectType::AccountNode).unwrap();
        let expected = contents(&map);

        // Cold cache: every node below the root is loaded lazily by
        // whichever thread gets there first.
        let cold = Family::new(
            Arc::clone(family.db()),
            Arc::new(crate::family::TreeNodeCache::new(
                "cold",
                0,
                std::time::Duration::from_secs(60),
            )),
        );
        let sealed = ShaMap::load(MapType::State, cold, map.get_hash()).unwrap();
        let probe_keys: Vec<Hash256> = (0..2000).step_by(97).map(|n| key(n * 7919)).collect();

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let sealed = &sealed;
                    let probe_keys = &probe_keys;
                    scope.spawn(move || {
                        // Half the threads look up first, half iterate first.
                        let (items, seen) = if t % 2 == 0 {
                            let items: Vec<_> = probe_keys
                                .iter()
                                .map(|k| sealed.peek_item(k).unwrap().unwrap())
                                .collect();
                            (items, contents(sealed))
                        } else {
                            let seen = contents(sealed);
                            let items: Vec<_> = probe_keys
                                .iter()
                                .map(|k| sealed.peek_item(k).unwrap().unwrap())
                                .collect();
                            (items, seen)
                        };
                        (sealed.get_hash(), items, seen)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let (_, first_items, _) = &results[0];
        for (hash, items, seen) in &results {
            assert_eq!(*hash, map.get_hash());
            assert_eq!(*seen, expected);
            for (a, b) in items.iter().zip(first_items) {
                assert!(Arc::ptr_eq(a, b), "threads loaded separate copies of {}", a.key());
            }
        }
        sealed.check_invariants().unwrap();
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn arb_key() -> impl Strategy<Value = Hash256> {
        prop_oneof![
            any::<[u8; 32]>().prop_map(Hash256::from_hash),
            (0u64..256).prop_map(Hash256::from_low_u64),
            (0u64..16).prop_map(|n| Hash256::from_low_u64(n << 60)),
        ]
    }

    fn arb_keys() -> impl Strategy<Value = BTreeSet<Hash256>> {
        proptest::collection::btree_set(arb_key(), 1..60)
    }

    proptest! {
        #[test]
        fn hash_depends_only_on_contents(keys in arb_keys()) {
            let forward = build(keys.iter().copied());
            let backward = build(keys.iter().rev().copied());
            prop_assert_eq!(forward.get_hash(), backward.get_hash());
            forward.check_invariants().unwrap();
        }

        #[test]
        fn removal_collapses_to_canonical_shape(keys in arb_keys(), mask in any::<u64>()) {
            let (removed, kept): (Vec<_>, Vec<_>) = keys
                .iter()
                .enumerate()
                .partition(|(i, _)| mask & (1 << (i % 64)) != 0);
            let mut map = build(keys.iter().copied());
            for (_, k) in &removed {
                prop_assert!(map.del_item(k).unwrap());
            }
            map.check_invariants().unwrap();
            let direct = build(kept.iter().map(|(_, k)| **k));
            prop_assert_eq!(map.get_hash(), direct.get_hash());
        }

        #[test]
        fn snapshot_mutations_never_leak(keys in arb_keys(), extra in arb_keys()) {
            let mut original = build(keys.iter().copied());
            let before = contents(&original);
            let hash_before = original.get_hash();
            let mut copy = original.snapshot(true);
            for k in &extra {
                if keys.contains(k) {
                    copy.del_item(k).unwrap();
                } else {
                    copy.set_item(*k, b"extra".to_vec()).unwrap();
                }
            }
            prop_assert_eq!(contents(&original), before);
            prop_assert_eq!(original.get_hash(), hash_before);
            copy.check_invariants().unwrap();
        }

        #[test]
        fn persisted_map_reloads_identically(keys in arb_keys(), removed in arb_keys()) {
            let family = Family::in_memory();
            let mut map = ShaMap::new(MapType::State, family.clone());
            for k in &keys {
                map.set_item(*k, k.as_bytes()[..8].to_vec()).unwrap();
            }
            map.flush_dirty(NodeObjectType::AccountNode).unwrap();
            for k in &removed {
                map.del_item(k).unwrap();
            }
            map.flush_dirty(NodeObjectType::AccountNode).unwrap();

            if map.get_hash().is_zero() {
                return Ok(());
            }
            let cold = Family::new(
                Arc::clone(family.db()),
                Arc::new(crate::family::TreeNodeCache::new("cold", 0, std::time::Duration::from_secs(60))),
            );
            let reloaded = ShaMap::load(MapType::State, cold, map.get_hash()).unwrap();
            prop_assert_eq!(contents(&reloaded), contents(&map));

            // Rehashing every reloaded node from its bytes gives the same root.
            let mut rehashed = true;
            reloaded.visit_nodes(&mut |_, node| {
                let again = TreeNode::from_wire(&node.to_wire()).unwrap();
                rehashed &= again.hash() == node.hash();
            }).unwrap();
            prop_assert!(rehashed);
        }
    }
}
