use bytes::Bytes;
use shamap_types::Hash256;

/// One entry of a map: a 256-bit key and the canonical serialization of
/// the ledger object stored under it.
///
/// Items are immutable and shared by `Arc` between every map and snapshot
/// that holds them. Updating a key creates a new item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaMapItem {
    key: Hash256,
    data: Bytes,
}

impl ShaMapItem {
    pub fn new(key: Hash256, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }

    pub fn key(&self) -> &Hash256 {
        &self.key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
