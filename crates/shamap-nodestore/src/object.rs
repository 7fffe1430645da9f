use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shamap_types::Hash256;

/// What a stored node belongs to.
///
/// The discriminants are part of the stored blob format and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeObjectType {
    Unknown = 0,
    /// A ledger header.
    Ledger = 1,
    /// A node of a state map.
    AccountNode = 3,
    /// A node of a transaction map.
    TransactionNode = 4,
}

impl NodeObjectType {
    /// Decode the stored discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Ledger),
            3 => Some(Self::AccountNode),
            4 => Some(Self::TransactionNode),
            _ => None,
        }
    }

    /// The stored discriminant.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for NodeObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Ledger => write!(f, "ledger"),
            Self::AccountNode => write!(f, "account-node"),
            Self::TransactionNode => write!(f, "transaction-node"),
        }
    }
}

/// A blob keyed by the hash of the tree node it encodes.
///
/// The store never interprets `data` and never recomputes `hash`: the hash
/// is the node's canonical hash, which only the tree layer knows how to
/// derive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeObject {
    pub kind: NodeObjectType,
    pub hash: Hash256,
    pub data: Bytes,
}

impl NodeObject {
    /// Create a new node object.
    pub fn new(kind: NodeObjectType, hash: Hash256, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            hash,
            data: data.into(),
        }
    }

    /// Size of the payload in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
