//! Typed key-value operations and their frame encodings.
//!
//! A [`KvRequest`] pairs a [`DocumentId`] with one [`KvOperation`]; the
//! dispatcher resolves collection ids and routing, then calls
//! [`KvRequest::encode`] to produce the wire frame for one attempt.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

use crate::protocol::subdoc::{
    encode_lookup_specs, encode_mutate_specs, LookupInSpec, MutateInSpec, SubdocField,
    DOC_FLAG_ACCESS_DELETED, DOC_FLAG_ADD, DOC_FLAG_CREATE_AS_DELETED, DOC_FLAG_MKDOC,
    DOC_FLAG_REVIVE_DOCUMENT,
};
use crate::protocol::{DataType, DurabilityLevel, Opcode, RequestFrame, ResponseFrame};

use super::{encode_collection_prefix, DocumentId, MutationToken};

/// Store semantics of a `mutate_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    #[default]
    Replace,
    Upsert,
    Insert,
}

/// The operations the client can issue against a document.
#[derive(Debug, Clone)]
pub enum KvOperation {
    Get,
    GetAndLock {
        lock_time: Duration,
    },
    GetAndTouch {
        expiry: u32,
    },
    Touch {
        expiry: u32,
    },
    Upsert {
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        preserve_expiry: bool,
    },
    Insert {
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
    },
    Replace {
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        preserve_expiry: bool,
        cas: u64,
    },
    Remove {
        cas: u64,
    },
    Append {
        value: Vec<u8>,
        cas: u64,
    },
    Prepend {
        value: Vec<u8>,
        cas: u64,
    },
    Increment {
        delta: u64,
        initial: u64,
        expiry: u32,
    },
    Decrement {
        delta: u64,
        initial: u64,
        expiry: u32,
    },
    Unlock {
        cas: u64,
    },
    LookupIn {
        specs: Vec<LookupInSpec>,
        access_deleted: bool,
    },
    MutateIn {
        specs: Vec<MutateInSpec>,
        semantics: StoreSemantics,
        expiry: u32,
        preserve_expiry: bool,
        access_deleted: bool,
        create_as_deleted: bool,
        revive_document: bool,
        cas: u64,
    },
    RangeScanCreate {
        /// JSON scan configuration, passed through as the request value.
        config: Vec<u8>,
    },
    RangeScanContinue {
        scan_uuid: [u8; 16],
        item_limit: u32,
        time_limit_ms: u32,
        byte_limit: u32,
    },
    RangeScanCancel {
        scan_uuid: [u8; 16],
    },
}

/// One user-level key-value request as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct KvRequest {
    pub id: DocumentId,
    pub operation: KvOperation,
    pub durability: DurabilityLevel,
    pub timeout: Option<Duration>,
    /// Read from this replica instead of the active node.
    pub replica: Option<usize>,
}

impl KvRequest {
    pub fn new(id: DocumentId, operation: KvOperation) -> Self {
        KvRequest {
            id,
            operation,
            durability: DurabilityLevel::None,
            timeout: None,
            replica: None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        match &self.operation {
            KvOperation::Get => Opcode::Get,
            KvOperation::GetAndLock { .. } => Opcode::GetAndLock,
            KvOperation::GetAndTouch { .. } => Opcode::GetAndTouch,
            KvOperation::Touch { .. } => Opcode::Touch,
            KvOperation::Upsert { .. } => Opcode::Set,
            KvOperation::Insert { .. } => Opcode::Add,
            KvOperation::Replace { .. } => Opcode::Replace,
            KvOperation::Remove { .. } => Opcode::Delete,
            KvOperation::Append { .. } => Opcode::Append,
            KvOperation::Prepend { .. } => Opcode::Prepend,
            KvOperation::Increment { .. } => Opcode::Increment,
            KvOperation::Decrement { .. } => Opcode::Decrement,
            KvOperation::Unlock { .. } => Opcode::Unlock,
            KvOperation::LookupIn { .. } => Opcode::SubdocMultiLookup,
            KvOperation::MutateIn { .. } => Opcode::SubdocMultiMutation,
            KvOperation::RangeScanCreate { .. } => Opcode::RangeScanCreate,
            KvOperation::RangeScanContinue { .. } => Opcode::RangeScanContinue,
            KvOperation::RangeScanCancel { .. } => Opcode::RangeScanCancel,
        }
    }

    /// Whether a retry can never double-apply the operation.
    pub fn idempotent(&self) -> bool {
        matches!(
            self.operation,
            KvOperation::Get
                | KvOperation::LookupIn { .. }
                | KvOperation::RangeScanCreate { .. }
                | KvOperation::RangeScanContinue { .. }
                | KvOperation::RangeScanCancel { .. }
        )
    }

    /// Whether the durability framing extra applies to this operation.
    pub fn supports_durability(&self) -> bool {
        matches!(
            self.operation,
            KvOperation::Upsert { .. }
                | KvOperation::Insert { .. }
                | KvOperation::Replace { .. }
                | KvOperation::Remove { .. }
                | KvOperation::Append { .. }
                | KvOperation::Prepend { .. }
                | KvOperation::Increment { .. }
                | KvOperation::Decrement { .. }
                | KvOperation::MutateIn { .. }
        )
    }

    /// Operations addressed to a document (and therefore routed by key and
    /// collection-qualified). Range scans address a partition instead.
    pub fn addresses_document(&self) -> bool {
        !matches!(
            self.operation,
            KvOperation::RangeScanCreate { .. }
                | KvOperation::RangeScanContinue { .. }
                | KvOperation::RangeScanCancel { .. }
        )
    }

    /// Build the frame for one attempt. `collections` reflects the target
    /// session's negotiated feature set.
    pub fn encode(&self, collections: bool) -> ShoalResult<RequestFrame> {
        let mut frame = RequestFrame::new(self.opcode());
        if self.addresses_document() {
            frame.key = if collections {
                let cid = if self.id.is_default_collection() {
                    self.id.collection_id().unwrap_or(0)
                } else {
                    self.id.collection_id().ok_or_else(|| {
                        ShoalError::with_message(
                            ErrorKind::CollectionNotFound,
                            "collection id not resolved before encode",
                        )
                    })?
                };
                encode_collection_prefix(cid, self.id.key())
            } else if self.id.is_default_collection() {
                self.id.key().to_vec()
            } else {
                return Err(ShoalError::with_message(
                    ErrorKind::UnsupportedOperation,
                    "server does not support collections",
                ));
            };
        }

        match &self.operation {
            KvOperation::Get | KvOperation::Unlock { .. } | KvOperation::Remove { .. } => {}
            KvOperation::GetAndLock { lock_time } => {
                let mut extras = vec![0u8; 4];
                BigEndian::write_u32(&mut extras, lock_time.as_secs() as u32);
                frame.extras = extras;
            }
            KvOperation::GetAndTouch { expiry } | KvOperation::Touch { expiry } => {
                let mut extras = vec![0u8; 4];
                BigEndian::write_u32(&mut extras, *expiry);
                frame.extras = extras;
            }
            KvOperation::Upsert {
                value,
                flags,
                expiry,
                preserve_expiry,
            } => {
                frame.extras = store_extras(*flags, *expiry);
                frame.value = value.clone();
                frame.datatype = DataType::JSON;
                if *preserve_expiry {
                    frame.add_preserve_expiry();
                }
            }
            KvOperation::Insert {
                value,
                flags,
                expiry,
            } => {
                frame.extras = store_extras(*flags, *expiry);
                frame.value = value.clone();
                frame.datatype = DataType::JSON;
            }
            KvOperation::Replace {
                value,
                flags,
                expiry,
                preserve_expiry,
                cas,
            } => {
                frame.extras = store_extras(*flags, *expiry);
                frame.value = value.clone();
                frame.datatype = DataType::JSON;
                frame.cas = *cas;
                if *preserve_expiry {
                    frame.add_preserve_expiry();
                }
            }
            KvOperation::Append { value, cas } | KvOperation::Prepend { value, cas } => {
                frame.value = value.clone();
                frame.cas = *cas;
            }
            KvOperation::Increment {
                delta,
                initial,
                expiry,
            }
            | KvOperation::Decrement {
                delta,
                initial,
                expiry,
            } => {
                let mut extras = vec![0u8; 20];
                BigEndian::write_u64(&mut extras[0..8], *delta);
                BigEndian::write_u64(&mut extras[8..16], *initial);
                BigEndian::write_u32(&mut extras[16..20], *expiry);
                frame.extras = extras;
            }
            KvOperation::LookupIn {
                specs,
                access_deleted,
            } => {
                if *access_deleted {
                    frame.extras = vec![DOC_FLAG_ACCESS_DELETED];
                }
                let mut value = Vec::new();
                encode_lookup_specs(specs, &mut value);
                frame.value = value;
            }
            KvOperation::MutateIn {
                specs,
                semantics,
                expiry,
                preserve_expiry,
                access_deleted,
                create_as_deleted,
                revive_document,
                cas,
            } => {
                let mut doc_flags = match semantics {
                    StoreSemantics::Replace => 0,
                    StoreSemantics::Upsert => DOC_FLAG_MKDOC,
                    StoreSemantics::Insert => DOC_FLAG_ADD,
                };
                if *access_deleted {
                    doc_flags |= DOC_FLAG_ACCESS_DELETED;
                }
                if *create_as_deleted {
                    doc_flags |= DOC_FLAG_CREATE_AS_DELETED;
                }
                if *revive_document {
                    doc_flags |= DOC_FLAG_REVIVE_DOCUMENT;
                }
                let mut extras = Vec::new();
                if *expiry != 0 {
                    extras.put_u32(*expiry);
                }
                if doc_flags != 0 {
                    extras.put_u8(doc_flags);
                }
                frame.extras = extras;
                frame.cas = *cas;
                let mut value = Vec::new();
                encode_mutate_specs(specs, &mut value);
                frame.value = value;
                if *preserve_expiry {
                    frame.add_preserve_expiry();
                }
            }
            KvOperation::RangeScanCreate { config } => {
                frame.value = config.clone();
                frame.datatype = DataType::JSON;
            }
            KvOperation::RangeScanContinue {
                scan_uuid,
                item_limit,
                time_limit_ms,
                byte_limit,
            } => {
                let mut extras = Vec::with_capacity(28);
                extras.put_slice(scan_uuid);
                extras.put_u32(*item_limit);
                extras.put_u32(*time_limit_ms);
                extras.put_u32(*byte_limit);
                frame.extras = extras;
            }
            KvOperation::RangeScanCancel { scan_uuid } => {
                frame.extras = scan_uuid.to_vec();
            }
        }

        // CAS-carrying ops that did not set it inline.
        match &self.operation {
            KvOperation::Unlock { cas } | KvOperation::Remove { cas } => frame.cas = *cas,
            _ => {}
        }

        Ok(frame)
    }
}

fn store_extras(flags: u32, expiry: u32) -> Vec<u8> {
    let mut extras = vec![0u8; 8];
    BigEndian::write_u32(&mut extras[0..4], flags);
    BigEndian::write_u32(&mut extras[4..8], expiry);
    extras
}

/// A decoded key-value response handed back to the caller.
#[derive(Debug, Clone, Default)]
pub struct KvResponse {
    pub cas: u64,
    pub flags: Option<u32>,
    pub value: Vec<u8>,
    pub datatype: u8,
    pub mutation_token: Option<MutationToken>,
    /// Per-spec results of a sub-document operation.
    pub fields: Vec<SubdocField>,
    /// Counter value for increment/decrement.
    pub counter: Option<u64>,
    pub server_duration_us: Option<u64>,
}

impl KvResponse {
    /// Interpret a successful response frame for `opcode`.
    pub fn from_frame(
        opcode: Opcode,
        partition: u16,
        frame: &ResponseFrame,
        value: Vec<u8>,
    ) -> ShoalResult<KvResponse> {
        let mut response = KvResponse {
            cas: frame.cas,
            datatype: frame.datatype,
            server_duration_us: frame.server_duration_us(),
            ..Default::default()
        };

        match opcode {
            Opcode::Get | Opcode::GetAndLock | Opcode::GetAndTouch => {
                if frame.extras.len() >= 4 {
                    response.flags = Some(BigEndian::read_u32(&frame.extras[0..4]));
                }
                response.value = value;
            }
            Opcode::Increment | Opcode::Decrement => {
                if value.len() >= 8 {
                    response.counter = Some(BigEndian::read_u64(&value[0..8]));
                }
                response.mutation_token = parse_mutation_token(frame, partition);
            }
            Opcode::Set
            | Opcode::Add
            | Opcode::Replace
            | Opcode::Delete
            | Opcode::Append
            | Opcode::Prepend
            | Opcode::Touch => {
                response.mutation_token = parse_mutation_token(frame, partition);
            }
            Opcode::SubdocMultiLookup => {
                response.fields = crate::protocol::subdoc::decode_lookup_fields(&value)?;
            }
            Opcode::SubdocMultiMutation => {
                response.fields = crate::protocol::subdoc::decode_mutate_fields(&value)?;
                response.mutation_token = parse_mutation_token(frame, partition);
            }
            _ => {
                response.value = value;
            }
        }
        Ok(response)
    }

    /// Sane replica-read accessor: a field exists iff the index is in range
    /// and the path-level status was success.
    pub fn field_exists(&self, spec_index: usize) -> bool {
        spec_index < self.fields.len() && self.fields[spec_index].exists()
    }
}

fn parse_mutation_token(frame: &ResponseFrame, partition: u16) -> Option<MutationToken> {
    if frame.extras.len() < 16 {
        return None;
    }
    Some(MutationToken {
        partition_uuid: BigEndian::read_u64(&frame.extras[0..8]),
        sequence_number: BigEndian::read_u64(&frame.extras[8..16]),
        partition_id: partition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Magic;
    use bytes::Bytes;

    fn id() -> DocumentId {
        DocumentId::in_default_collection("default", "foo").unwrap()
    }

    #[test]
    fn upsert_encodes_flags_and_expiry() {
        let request = KvRequest::new(
            id(),
            KvOperation::Upsert {
                value: b"{\"a\":1}".to_vec(),
                flags: 0x0200_0006,
                expiry: 60,
                preserve_expiry: false,
            },
        );
        let frame = request.encode(false).unwrap();
        assert_eq!(frame.opcode, Opcode::Set);
        assert_eq!(frame.extras.len(), 8);
        assert_eq!(BigEndian::read_u32(&frame.extras[0..4]), 0x0200_0006);
        assert_eq!(BigEndian::read_u32(&frame.extras[4..8]), 60);
        assert_eq!(frame.key, b"foo");
        assert_eq!(frame.value, b"{\"a\":1}");
    }

    #[test]
    fn collections_prefix_applies_to_default_collection() {
        let request = KvRequest::new(id(), KvOperation::Get);
        let frame = request.encode(true).unwrap();
        assert_eq!(frame.key, b"\x00foo");
    }

    #[test]
    fn non_default_collection_requires_resolution() {
        let doc = DocumentId::new("b", "s", "c", "k").unwrap();
        let request = KvRequest::new(doc.clone(), KvOperation::Get);
        // Unresolved id on a collections-capable session is a logic error.
        assert!(request.encode(true).is_err());
        // And on a session without collections it cannot be addressed.
        let err = request.encode(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

        let mut resolved = doc;
        resolved.set_collection_id(0x2a);
        let request = KvRequest::new(resolved, KvOperation::Get);
        assert_eq!(request.encode(true).unwrap().key, b"\x2ak");
    }

    #[test]
    fn counter_extras_layout() {
        let request = KvRequest::new(
            id(),
            KvOperation::Increment {
                delta: 5,
                initial: 100,
                expiry: 0,
            },
        );
        let frame = request.encode(false).unwrap();
        assert_eq!(frame.extras.len(), 20);
        assert_eq!(BigEndian::read_u64(&frame.extras[0..8]), 5);
        assert_eq!(BigEndian::read_u64(&frame.extras[8..16]), 100);
    }

    #[test]
    fn mutate_in_doc_flags_and_expiry_ordering() {
        let request = KvRequest::new(
            id(),
            KvOperation::MutateIn {
                specs: vec![MutateInSpec::dict_upsert("baz", b"42".to_vec())],
                semantics: StoreSemantics::Upsert,
                expiry: 30,
                preserve_expiry: false,
                access_deleted: true,
                create_as_deleted: false,
                revive_document: false,
                cas: 0,
            },
        );
        let frame = request.encode(false).unwrap();
        assert_eq!(frame.extras.len(), 5);
        assert_eq!(BigEndian::read_u32(&frame.extras[0..4]), 30);
        assert_eq!(frame.extras[4], DOC_FLAG_MKDOC | DOC_FLAG_ACCESS_DELETED);
    }

    #[test]
    fn idempotency_classification() {
        assert!(KvRequest::new(id(), KvOperation::Get).idempotent());
        assert!(!KvRequest::new(
            id(),
            KvOperation::Remove { cas: 0 }
        )
        .idempotent());
        assert!(!KvRequest::new(id(), KvOperation::Touch { expiry: 1 }).idempotent());
    }

    #[test]
    fn mutation_token_from_extras() {
        let mut header = [0u8; crate::protocol::HEADER_SIZE];
        header[0] = Magic::Response as u8;
        header[1] = Opcode::Set as u8;
        header[4] = 16;
        BigEndian::write_u32(&mut header[8..12], 16);
        let mut body = vec![0u8; 16];
        BigEndian::write_u64(&mut body[0..8], 0x1111);
        BigEndian::write_u64(&mut body[8..16], 7);
        let frame = ResponseFrame::decode(&header, Bytes::from(body)).unwrap();
        let response = KvResponse::from_frame(Opcode::Set, 115, &frame, Vec::new()).unwrap();
        let token = response.mutation_token.unwrap();
        assert_eq!(token.partition_uuid, 0x1111);
        assert_eq!(token.sequence_number, 7);
        assert_eq!(token.partition_id, 115);
    }
}
