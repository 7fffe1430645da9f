use shamap_types::Hash256;

/// Four-byte domain tag placed in front of hashed content.
///
/// The first three bytes are ASCII so that the tags are readable in hex
/// dumps; the fourth is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HashPrefix([u8; 4]);

impl HashPrefix {
    /// Inner (branch) node.
    pub const INNER_NODE: Self = Self(*b"MIN\0");
    /// Account state leaf.
    pub const LEAF_NODE: Self = Self(*b"MLN\0");
    /// Transaction leaf carrying metadata.
    pub const TX_NODE: Self = Self(*b"SND\0");
    /// Transaction leaf without metadata.
    pub const TRANSACTION_ID: Self = Self(*b"TXN\0");

    /// The raw prefix bytes.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a [`HashPrefix`] that is fed to BLAKE3 before the
/// content. Identical bytes hashed under two different prefixes produce
/// unrelated digests, so an account-state leaf can never collide with a
/// transaction leaf holding the same blob.
#[derive(Clone, Copy, Debug)]
pub struct ContentHasher {
    prefix: HashPrefix,
}

impl ContentHasher {
    /// Hasher for inner nodes.
    pub const INNER: Self = Self::new(HashPrefix::INNER_NODE);
    /// Hasher for account state leaves.
    pub const ACCOUNT_STATE: Self = Self::new(HashPrefix::LEAF_NODE);
    /// Hasher for transaction-with-metadata leaves.
    pub const TRANSACTION_WITH_META: Self = Self::new(HashPrefix::TX_NODE);
    /// Hasher for transaction-without-metadata leaves.
    pub const TRANSACTION: Self = Self::new(HashPrefix::TRANSACTION_ID);

    const fn new(prefix: HashPrefix) -> Self {
        Self { prefix }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Hash256 {
        self.hash_parts(&[data])
    }

    /// Hash the concatenation of `parts` with domain separation, without
    /// allocating the concatenated buffer.
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prefix.as_bytes());
        for part in parts {
            hasher.update(part);
        }
        Hash256::from_hash(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"ledger entry";
        assert_eq!(
            ContentHasher::ACCOUNT_STATE.hash(data),
            ContentHasher::ACCOUNT_STATE.hash(data)
        );
    }

    #[test]
    fn different_prefixes_produce_different_hashes() {
        let data = b"same content";
        let inner = ContentHasher::INNER.hash(data);
        let state = ContentHasher::ACCOUNT_STATE.hash(data);
        let tx = ContentHasher::TRANSACTION.hash(data);
        let tx_meta = ContentHasher::TRANSACTION_WITH_META.hash(data);
        assert_ne!(inner, state);
        assert_ne!(state, tx);
        assert_ne!(tx, tx_meta);
        assert_ne!(inner, tx_meta);
    }

    #[test]
    fn parts_equal_concatenation() {
        let joined = ContentHasher::INNER.hash(b"abcdef");
        let parts = ContentHasher::INNER.hash_parts(&[&b"ab"[..], &b"cd"[..], &b"ef"[..]]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn prefix_is_part_of_the_digest() {
        let data = b"leaf";
        let mut manual = blake3::Hasher::new();
        manual.update(b"MLN\0");
        manual.update(data);
        let expected = Hash256::from_hash(*manual.finalize().as_bytes());
        assert_eq!(ContentHasher::ACCOUNT_STATE.hash(data), expected);
        assert_ne!(ContentHasher::ACCOUNT_STATE.hash(data), Hash256::from_hash(*blake3::hash(data).as_bytes()));
    }

    #[test]
    fn prefixes_are_four_bytes_ending_in_zero() {
        for p in [
            HashPrefix::INNER_NODE,
            HashPrefix::LEAF_NODE,
            HashPrefix::TX_NODE,
            HashPrefix::TRANSACTION_ID,
        ] {
            assert_eq!(p.as_bytes()[3], 0);
        }
    }
}
