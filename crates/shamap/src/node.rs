//! Tree nodes: the 16-way inner node and the item-holding leaf, their
//! canonical hashes and their wire encoding.
//!
//! # Wire format
//!
//! Every node starts with a tag byte:
//!
//! | tag | node                              | payload                                   |
//! |-----|-----------------------------------|-------------------------------------------|
//! | 0   | transaction leaf without metadata | key (32) · length (u32 BE) · data         |
//! | 1   | account state leaf                | key (32) · length (u32 BE) · data         |
//! | 2   | inner node                        | presence bitmap (u16 BE) · present hashes |
//! | 4   | transaction leaf with metadata    | key (32) · length (u32 BE) · data         |
//!
//! Bit `i` of the bitmap is set when branch `i` is occupied; the hashes of
//! the occupied branches follow in branch order. An inner node with no
//! children is never encoded.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use shamap_crypto::ContentHasher;
use shamap_types::Hash256;

use crate::error::{ShaMapError, ShaMapResult};
use crate::item::ShaMapItem;
use crate::node_id::{NodeId, LEAF_DEPTH};

/// Children per inner node.
pub const BRANCH_FACTOR: usize = 16;

const TAG_TRANSACTION_NO_META: u8 = 0;
const TAG_ACCOUNT_STATE: u8 = 1;
const TAG_INNER: u8 = 2;
const TAG_TRANSACTION_WITH_META: u8 = 4;

const LEAF_HEADER_LEN: usize = 1 + Hash256::LEN + 4;

/// What a leaf holds. The kind selects the hash prefix, so the same bytes
/// stored as a transaction and as a state object hash differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeafKind {
    TransactionNoMeta,
    TransactionWithMeta,
    AccountState,
}

impl LeafKind {
    fn hasher(self) -> ContentHasher {
        match self {
            Self::TransactionNoMeta => ContentHasher::TRANSACTION,
            Self::TransactionWithMeta => ContentHasher::TRANSACTION_WITH_META,
            Self::AccountState => ContentHasher::ACCOUNT_STATE,
        }
    }

    fn wire_tag(self) -> u8 {
        match self {
            Self::TransactionNoMeta => TAG_TRANSACTION_NO_META,
            Self::TransactionWithMeta => TAG_TRANSACTION_WITH_META,
            Self::AccountState => TAG_ACCOUNT_STATE,
        }
    }

    fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_TRANSACTION_NO_META => Some(Self::TransactionNoMeta),
            TAG_TRANSACTION_WITH_META => Some(Self::TransactionWithMeta),
            TAG_ACCOUNT_STATE => Some(Self::AccountState),
            _ => None,
        }
    }
}

/// A leaf: one item plus its kind.
///
/// Leaves are never changed in place. The hash is computed once, at
/// construction.
pub struct LeafNode {
    item: Arc<ShaMapItem>,
    kind: LeafKind,
    hash: Hash256,
    written: AtomicBool,
}

impl LeafNode {
    pub fn new(item: Arc<ShaMapItem>, kind: LeafKind) -> Self {
        let hash = kind
            .hasher()
            .hash_parts(&[&item.data()[..], &item.key().as_bytes()[..]]);
        Self {
            item,
            kind,
            hash,
            written: AtomicBool::new(false),
        }
    }

    pub fn item(&self) -> &Arc<ShaMapItem> {
        &self.item
    }

    pub fn key(&self) -> &Hash256 {
        self.item.key()
    }

    pub fn kind(&self) -> LeafKind {
        self.kind
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }
}

impl Clone for LeafNode {
    fn clone(&self) -> Self {
        Self {
            item: Arc::clone(&self.item),
            kind: self.kind,
            hash: self.hash,
            written: AtomicBool::new(self.written.load(Ordering::Acquire)),
        }
    }
}

impl fmt::Debug for LeafNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafNode")
            .field("key", self.key())
            .field("kind", &self.kind)
            .field("hash", &self.hash)
            .field("size", &self.item.size())
            .finish()
    }
}

/// One child position of an inner node.
#[derive(Clone, Default)]
pub(crate) enum Slot {
    #[default]
    Empty,
    /// Known by hash. The node is attached on first load and never changes
    /// afterwards.
    Stored {
        hash: Hash256,
        node: OnceLock<Arc<TreeNode>>,
    },
    /// Attached by a mutation; the hash is whatever the node hashes to.
    Owned(Arc<TreeNode>),
}

impl Slot {
    fn stored(hash: Hash256) -> Self {
        Self::Stored {
            hash,
            node: OnceLock::new(),
        }
    }

    pub(crate) fn hash(&self) -> Hash256 {
        match self {
            Self::Empty => Hash256::zero(),
            Self::Stored { hash, .. } => *hash,
            Self::Owned(node) => node.hash(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The child if it is in memory.
    pub(crate) fn resident(&self) -> Option<&Arc<TreeNode>> {
        match self {
            Self::Empty => None,
            Self::Stored { node, .. } => node.get(),
            Self::Owned(node) => Some(node),
        }
    }

    /// Attach a loaded child to a `Stored` slot. The first attachment wins;
    /// the attached node is returned either way.
    pub(crate) fn attach(&self, loaded: Arc<TreeNode>) -> Arc<TreeNode> {
        match self {
            Self::Stored { node, .. } => Arc::clone(node.get_or_init(|| loaded)),
            Self::Owned(node) => Arc::clone(node),
            Self::Empty => loaded,
        }
    }
}

/// A branch node with sixteen child slots.
///
/// The hash is computed lazily from the children's hashes and memoized
/// until the next mutation through `&mut`. A node reachable from a sealed
/// map is only ever touched through `&self`: lazy child loading and lazy
/// hashing both go through set-once cells, so concurrent readers agree.
pub struct InnerNode {
    slots: [Slot; BRANCH_FACTOR],
    hash: OnceLock<Hash256>,
    written: AtomicBool,
}

impl InnerNode {
    /// An inner node with no children. Its hash is zero.
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            hash: OnceLock::new(),
            written: AtomicBool::new(false),
        }
    }

    pub fn hash(&self) -> Hash256 {
        *self.hash.get_or_init(|| self.compute_hash())
    }

    fn compute_hash(&self) -> Hash256 {
        if self.is_empty() {
            return Hash256::zero();
        }
        let mut buf = [0u8; BRANCH_FACTOR * Hash256::LEN];
        for (slot, chunk) in self.slots.iter().zip(buf.chunks_exact_mut(Hash256::LEN)) {
            chunk.copy_from_slice(slot.hash().as_bytes());
        }
        ContentHasher::INNER.hash(&buf)
    }

    /// Hash of the child at `branch`; zero when the branch is empty.
    pub fn child_hash(&self, branch: u8) -> Hash256 {
        self.slots[branch as usize].hash()
    }

    pub fn is_empty_branch(&self, branch: u8) -> bool {
        self.slots[branch as usize].is_empty()
    }

    /// Number of occupied branches.
    pub fn branch_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Slot::is_empty)
    }

    /// The child at `branch` if it is in memory.
    pub fn resident_child(&self, branch: u8) -> Option<Arc<TreeNode>> {
        self.slots[branch as usize].resident().cloned()
    }

    /// Attach a node received from elsewhere under `branch`.
    ///
    /// The node must hash to the hash this inner node records for the
    /// branch. Returns the attached node, which is an earlier attachment if
    /// one raced this call.
    pub fn hook_child(&self, branch: u8, node: Arc<TreeNode>) -> ShaMapResult<Arc<TreeNode>> {
        let slot = &self.slots[branch as usize];
        if slot.is_empty() {
            return Err(ShaMapError::corrupt(format!(
                "cannot attach a node under empty branch {branch}"
            )));
        }
        if node.hash() != slot.hash() {
            return Err(ShaMapError::corrupt(format!(
                "node {} does not match branch {branch} hash {}",
                node.hash(),
                slot.hash()
            )));
        }
        Ok(slot.attach(node))
    }

    pub(crate) fn slot(&self, branch: u8) -> &Slot {
        &self.slots[branch as usize]
    }

    /// Replace a child. The node must already be modifiable by the caller.
    pub(crate) fn set_child(&mut self, branch: u8, node: Arc<TreeNode>) {
        self.slots[branch as usize] = Slot::Owned(node);
        self.invalidate();
    }

    pub(crate) fn clear_child(&mut self, branch: u8) {
        self.slots[branch as usize] = Slot::Empty;
        self.invalidate();
    }

    /// Writable access to a resident child, for copy-on-write descent.
    ///
    /// A `Stored` slot is converted to `Owned` first. Returns `None` when
    /// the branch is empty or the child is not loaded.
    pub(crate) fn child_arc_mut(&mut self, branch: u8) -> Option<&mut Arc<TreeNode>> {
        let slot = &mut self.slots[branch as usize];
        if let Slot::Stored { node, .. } = slot {
            let loaded = Arc::clone(node.get()?);
            *slot = Slot::Owned(loaded);
        }
        match slot {
            Slot::Owned(node) => Some(node),
            _ => None,
        }
    }

    /// Forget the memoized hash and the persisted flag.
    pub(crate) fn invalidate(&mut self) {
        self.hash.take();
        *self.written.get_mut() = false;
    }

    fn to_wire(&self, out: &mut Vec<u8>) {
        let mut bitmap = 0u16;
        for (branch, slot) in self.slots.iter().enumerate() {
            if !slot.is_empty() {
                bitmap |= 1 << branch;
            }
        }
        out.reserve(3 + bitmap.count_ones() as usize * Hash256::LEN);
        out.push(TAG_INNER);
        out.extend_from_slice(&bitmap.to_be_bytes());
        for slot in self.slots.iter().filter(|s| !s.is_empty()) {
            out.extend_from_slice(slot.hash().as_bytes());
        }
    }

    fn from_wire(payload: &[u8]) -> ShaMapResult<Self> {
        if payload.len() < 2 {
            return Err(ShaMapError::corrupt("inner node too short"));
        }
        let bitmap = u16::from_be_bytes([payload[0], payload[1]]);
        if bitmap == 0 {
            return Err(ShaMapError::corrupt("inner node has no children"));
        }
        let hashes = &payload[2..];
        let expected = bitmap.count_ones() as usize * Hash256::LEN;
        if hashes.len() != expected {
            return Err(ShaMapError::corrupt(format!(
                "inner node claims {} children but carries {} bytes of hashes",
                bitmap.count_ones(),
                hashes.len()
            )));
        }
        let mut node = Self::new();
        let mut chunks = hashes.chunks_exact(Hash256::LEN);
        for branch in 0..BRANCH_FACTOR {
            if bitmap & (1 << branch) == 0 {
                continue;
            }
            let chunk = chunks
                .next()
                .ok_or_else(|| ShaMapError::corrupt("inner node truncated"))?;
            let hash = Hash256::from_slice(chunk)
                .map_err(|e| ShaMapError::corrupt(e.to_string()))?;
            if hash.is_zero() {
                return Err(ShaMapError::corrupt(format!(
                    "zero hash for occupied branch {branch}"
                )));
            }
            node.slots[branch] = Slot::stored(hash);
        }
        Ok(node)
    }
}

impl Default for InnerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InnerNode {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            hash: self.hash.clone(),
            written: AtomicBool::new(self.written.load(Ordering::Acquire)),
        }
    }
}

impl fmt::Debug for InnerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerNode")
            .field("hash", &self.hash.get())
            .field("branches", &self.branch_count())
            .finish()
    }
}

/// A node of the trie.
#[derive(Clone, Debug)]
pub enum TreeNode {
    Inner(InnerNode),
    Leaf(LeafNode),
}

impl TreeNode {
    /// The node's canonical hash.
    pub fn hash(&self) -> Hash256 {
        match self {
            Self::Inner(inner) => inner.hash(),
            Self::Leaf(leaf) => leaf.hash(),
        }
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn as_inner(&self) -> Option<&InnerNode> {
        match self {
            Self::Inner(inner) => Some(inner),
            Self::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Inner(_) => None,
        }
    }

    /// Whether the node can occupy position `id`: inner nodes must sit
    /// above leaf depth, and a leaf's key must lie under its position.
    pub fn fits_at(&self, id: &NodeId) -> bool {
        match self {
            Self::Inner(_) => id.depth() < LEAF_DEPTH,
            Self::Leaf(leaf) => id.contains(leaf.key()),
        }
    }

    /// Returns `true` once the node has been persisted (or was loaded from
    /// the store) and not changed since.
    pub fn is_written(&self) -> bool {
        self.written_flag().load(Ordering::Acquire)
    }

    pub(crate) fn mark_written(&self) {
        self.written_flag().store(true, Ordering::Release);
    }

    fn written_flag(&self) -> &AtomicBool {
        match self {
            Self::Inner(inner) => &inner.written,
            Self::Leaf(leaf) => &leaf.written,
        }
    }

    /// Serialize to the wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Inner(inner) => inner.to_wire(&mut out),
            Self::Leaf(leaf) => {
                let data = leaf.item.data();
                out.reserve(LEAF_HEADER_LEN + data.len());
                out.push(leaf.kind.wire_tag());
                out.extend_from_slice(leaf.key().as_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Parse the wire format. Anything inconsistent is
    /// [`ShaMapError::CorruptNode`].
    pub fn from_wire(bytes: &[u8]) -> ShaMapResult<Self> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| ShaMapError::corrupt("empty node"))?;
        if tag == TAG_INNER {
            return InnerNode::from_wire(payload).map(Self::Inner);
        }
        let kind = LeafKind::from_wire_tag(tag)
            .ok_or_else(|| ShaMapError::corrupt(format!("unknown node tag {tag}")))?;
        if bytes.len() < LEAF_HEADER_LEN {
            return Err(ShaMapError::corrupt("leaf node too short"));
        }
        let key = Hash256::from_slice(&payload[..Hash256::LEN])
            .map_err(|e| ShaMapError::corrupt(e.to_string()))?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&payload[Hash256::LEN..Hash256::LEN + 4]);
        let len = u32::from_be_bytes(len) as usize;
        let data = &payload[Hash256::LEN + 4..];
        if data.len() != len {
            return Err(ShaMapError::corrupt(format!(
                "leaf claims {len} bytes of data but carries {}",
                data.len()
            )));
        }
        let item = ShaMapItem::new(key, data.to_vec());
        Ok(Self::Leaf(LeafNode::new(Arc::new(item), kind)))
    }
}
