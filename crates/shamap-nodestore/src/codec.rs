//! Blob encoding shared by the persistent backends.
//!
//! On-disk format:
//! ```text
//! [1 byte: format (0 = raw, 1 = zstd)]
//! [1 byte: NodeObjectType discriminant]
//! [N bytes: payload, zstd-compressed when format = 1]
//! ```
//! The hash is the storage key and is not repeated in the value.

use serde::{Deserialize, Serialize};
use shamap_types::Hash256;

use crate::error::{NodeStoreError, NodeStoreResult};
use crate::object::{NodeObject, NodeObjectType};

const FORMAT_RAW: u8 = 0;
const FORMAT_ZSTD: u8 = 1;

/// Header size: format byte + type byte.
const HEADER_SIZE: usize = 2;

const ZSTD_LEVEL: i32 = 3;

/// Payload compression applied by a persistent backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// Encode an object into a stored blob.
pub fn encode(object: &NodeObject, compression: Compression) -> NodeStoreResult<Vec<u8>> {
    let (format, payload) = match compression {
        Compression::None => (FORMAT_RAW, None),
        Compression::Zstd => (FORMAT_ZSTD, Some(zstd::encode_all(&object.data[..], ZSTD_LEVEL)?)),
    };
    let body = payload.as_deref().unwrap_or(&object.data[..]);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(format);
    out.push(object.kind.as_u8());
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode a stored blob read under `hash`.
pub fn decode(hash: Hash256, blob: &[u8]) -> NodeStoreResult<NodeObject> {
    let corrupt = |reason: String| NodeStoreError::CorruptObject { hash, reason };

    if blob.len() < HEADER_SIZE {
        return Err(corrupt(format!("blob too short: {} bytes", blob.len())));
    }
    let kind = NodeObjectType::from_u8(blob[1])
        .ok_or_else(|| corrupt(format!("unknown object type {}", blob[1])))?;
    let body = &blob[HEADER_SIZE..];
    let data = match blob[0] {
        FORMAT_RAW => body.to_vec(),
        FORMAT_ZSTD => {
            zstd::decode_all(body).map_err(|e| corrupt(format!("zstd payload: {e}")))?
        }
        other => return Err(corrupt(format!("unknown blob format {other}"))),
    };
    Ok(NodeObject::new(kind, hash, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeObject {
        NodeObject::new(
            NodeObjectType::AccountNode,
            Hash256::from_low_u64(9),
            b"payload payload payload payload".to_vec(),
        )
    }

    #[test]
    fn raw_layout() {
        let blob = encode(&sample(), Compression::None).unwrap();
        assert_eq!(blob[0], FORMAT_RAW);
        assert_eq!(blob[1], NodeObjectType::AccountNode.as_u8());
        assert_eq!(&blob[2..], &sample().data[..]);
    }

    #[test]
    fn zstd_blob_decodes_to_original() {
        let obj = sample();
        let blob = encode(&obj, Compression::Zstd).unwrap();
        assert_eq!(blob[0], FORMAT_ZSTD);
        assert_eq!(decode(obj.hash, &blob).unwrap(), obj);
    }

    #[test]
    fn short_blob_is_corrupt() {
        let err = decode(Hash256::zero(), &[0]).unwrap_err();
        assert!(matches!(err, NodeStoreError::CorruptObject { .. }));
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let err = decode(Hash256::zero(), &[FORMAT_RAW, 77, 1, 2]).unwrap_err();
        assert!(err.to_string().contains("unknown object type"));
    }

    #[test]
    fn unknown_format_is_corrupt() {
        let err = decode(Hash256::zero(), &[9, 1]).unwrap_err();
        assert!(err.to_string().contains("unknown blob format"));
    }

    #[test]
    fn garbage_zstd_payload_is_corrupt() {
        let err = decode(Hash256::zero(), &[FORMAT_ZSTD, 1, 0xde, 0xad]).unwrap_err();
        assert!(matches!(err, NodeStoreError::CorruptObject { .. }));
    }
}
