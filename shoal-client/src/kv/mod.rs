//! Key-value service: the binary-protocol session, the typed operations it
//! carries, and the dispatcher that ties them to routing, retries, and
//! observability.

pub mod auth;
pub mod dispatch;
pub mod operations;
pub mod session;

use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

/// Longest key accepted by the server.
pub const MAX_KEY_LENGTH: usize = 250;

/// Name of the distinguished default scope and collection.
pub const DEFAULT_NAME: &str = "_default";

/// Fully-qualified document address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentId {
    bucket: String,
    scope: String,
    collection: String,
    key: Vec<u8>,
    /// Resolved by the session's collection cache before dispatch.
    collection_id: Option<u32>,
}

impl DocumentId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> ShoalResult<DocumentId> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(ShoalError::with_message(
                ErrorKind::InvalidArgument,
                format!("key length {} outside 1..={MAX_KEY_LENGTH}", key.len()),
            ));
        }
        Ok(DocumentId {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key,
            collection_id: None,
        })
    }

    /// Address in the default scope and collection.
    pub fn in_default_collection(
        bucket: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> ShoalResult<DocumentId> {
        DocumentId::new(bucket, DEFAULT_NAME, DEFAULT_NAME, key)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// `scope.collection`, the form used by GET_COLLECTION_ID and the
    /// per-session cache.
    pub fn collection_path(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }

    pub fn is_default_collection(&self) -> bool {
        self.scope == DEFAULT_NAME && self.collection == DEFAULT_NAME
    }

    pub fn collection_id(&self) -> Option<u32> {
        self.collection_id
    }

    pub fn set_collection_id(&mut self, cid: u32) {
        self.collection_id = Some(cid);
    }

    pub fn clear_collection_id(&mut self) {
        self.collection_id = None;
    }
}

/// Prefix `key` with the unsigned-LEB128 collection id, the wire form used
/// on sessions that negotiated collections.
pub fn encode_collection_prefix(cid: u32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 5);
    let mut value = cid;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(key);
    out
}

/// Token identifying a mutation for at-plus consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationToken {
    pub partition_uuid: u64,
    pub sequence_number: u64,
    pub partition_id: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_boundary() {
        let ok = DocumentId::in_default_collection("default", vec![b'x'; 250]);
        assert!(ok.is_ok());
        let err = DocumentId::in_default_collection("default", vec![b'x'; 251]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = DocumentId::in_default_collection("default", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn collection_path_form() {
        let id = DocumentId::new("b", "inventory", "hotels", "h1").unwrap();
        assert_eq!(id.collection_path(), "inventory.hotels");
        assert!(!id.is_default_collection());
        assert!(DocumentId::in_default_collection("b", "k")
            .unwrap()
            .is_default_collection());
    }

    #[test]
    fn leb128_prefix_encoding() {
        assert_eq!(encode_collection_prefix(0, b"k"), b"\x00k".to_vec());
        assert_eq!(encode_collection_prefix(0x7f, b"k"), b"\x7fk".to_vec());
        // 0x80 -> two bytes, little groups first with continuation bit
        assert_eq!(encode_collection_prefix(0x80, b"k"), b"\x80\x01k".to_vec());
        assert_eq!(
            encode_collection_prefix(0x1234, b""),
            vec![0xb4, 0x24]
        );
    }
}
