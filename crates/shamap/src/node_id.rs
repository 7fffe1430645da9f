use std::fmt;

use shamap_types::Hash256;

/// Depth of a position that can only hold a leaf: every nibble of the key is
/// fixed.
pub const LEAF_DEPTH: u8 = 64;

/// A position in the trie: a depth in nibbles plus the key prefix fixed by
/// that depth.
///
/// Two maps that hold a node at the same `NodeId` hold it at the same
/// structural position, which is what lets sync and diff walk two maps in
/// lockstep.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    depth: u8,
    id: Hash256,
}

impl NodeId {
    /// Size of the wire encoding: the prefix followed by one depth byte.
    pub const WIRE_LEN: usize = Hash256::LEN + 1;

    /// The root position.
    pub const fn root() -> Self {
        Self {
            depth: 0,
            id: Hash256::zero(),
        }
    }

    /// The position at `depth` on the path to `key`.
    pub fn new(depth: u8, key: &Hash256) -> Self {
        let depth = depth.min(LEAF_DEPTH);
        Self {
            depth,
            id: key.masked(depth as usize),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The fixed key prefix; nibbles past `depth` are zero.
    pub fn id(&self) -> &Hash256 {
        &self.id
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// The branch (0..16) taken from this position towards `key`.
    pub fn select_branch(&self, key: &Hash256) -> u8 {
        key.nibble(self.depth as usize)
    }

    /// The position one level down through `branch`.
    pub fn child(&self, branch: u8) -> Self {
        debug_assert!(self.depth < LEAF_DEPTH, "leaf positions have no children");
        debug_assert!(branch < 16);
        let mut bytes = *self.id.as_bytes();
        let index = self.depth as usize / 2;
        if self.depth % 2 == 0 {
            bytes[index] |= branch << 4;
        } else {
            bytes[index] |= branch & 0x0f;
        }
        Self {
            depth: self.depth + 1,
            id: Hash256::from_hash(bytes),
        }
    }

    /// Returns `true` if `key` lies below this position.
    pub fn contains(&self, key: &Hash256) -> bool {
        key.masked(self.depth as usize) == self.id
    }

    /// Encode as the 32-byte prefix followed by the depth.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[..Hash256::LEN].copy_from_slice(self.id.as_bytes());
        out[Hash256::LEN] = self.depth;
        out
    }

    /// Decode a wire position. Rejects depths past the leaf depth and
    /// prefixes with bits set below the depth.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return None;
        }
        let depth = bytes[Hash256::LEN];
        if depth > LEAF_DEPTH {
            return None;
        }
        let id = Hash256::from_slice(&bytes[..Hash256::LEN]).ok()?;
        (id.masked(depth as usize) == id).then_some(Self { depth, id })
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}:{})", self.depth, self)
    }
}

impl fmt::Display for NodeId {
    /// Only the fixed nibbles are printed; the root prints as `-`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "-");
        }
        let hex = self.id.to_hex();
        write!(f, "{}", &hex[..self.depth as usize])
    }
}
