//! Sub-document command specs: per-path opcodes and flags, plus the
//! multi-path encodings used by `lookup_in` and `mutate_in`.

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

use super::Status;

/// Per-spec opcodes within a multi-path request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubdocOpcode {
    GetDoc = 0x00,
    SetDoc = 0x01,
    RemoveDoc = 0x04,
    Get = 0xc5,
    Exists = 0xc6,
    DictAdd = 0xc7,
    DictUpsert = 0xc8,
    Remove = 0xc9,
    Replace = 0xca,
    ArrayPushLast = 0xcb,
    ArrayPushFirst = 0xcc,
    ArrayInsert = 0xcd,
    ArrayAddUnique = 0xce,
    Counter = 0xcf,
    Count = 0xd2,
}

/// Per-path flags.
pub const PATH_FLAG_CREATE_PARENTS: u8 = 0b0000_0001;
pub const PATH_FLAG_XATTR: u8 = 0b0000_0100;
pub const PATH_FLAG_EXPAND_MACROS: u8 = 0b0001_0000;

/// Whole-document flags for multi-path mutations.
pub const DOC_FLAG_MKDOC: u8 = 0b0000_0001;
pub const DOC_FLAG_ADD: u8 = 0b0000_0010;
pub const DOC_FLAG_ACCESS_DELETED: u8 = 0b0000_0100;
pub const DOC_FLAG_CREATE_AS_DELETED: u8 = 0b0000_1000;
pub const DOC_FLAG_REVIVE_DOCUMENT: u8 = 0b0001_0000;

pub fn build_path_flags(xattr: bool, create_parents: bool, expand_macros: bool) -> u8 {
    let mut flags = 0;
    if xattr {
        flags |= PATH_FLAG_XATTR;
    }
    if create_parents {
        flags |= PATH_FLAG_CREATE_PARENTS;
    }
    if expand_macros {
        flags |= PATH_FLAG_EXPAND_MACROS;
    }
    flags
}

/// One spec of a `lookup_in` request.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    pub opcode: SubdocOpcode,
    pub flags: u8,
    pub path: String,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        let path = path.into();
        let opcode = if path.is_empty() {
            SubdocOpcode::GetDoc
        } else {
            SubdocOpcode::Get
        };
        LookupInSpec {
            opcode,
            flags: 0,
            path,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        LookupInSpec {
            opcode: SubdocOpcode::Exists,
            flags: 0,
            path: path.into(),
        }
    }

    pub fn count(path: impl Into<String>) -> Self {
        LookupInSpec {
            opcode: SubdocOpcode::Count,
            flags: 0,
            path: path.into(),
        }
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= PATH_FLAG_XATTR;
        self
    }
}

/// One spec of a `mutate_in` request.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    pub opcode: SubdocOpcode,
    pub flags: u8,
    pub path: String,
    pub value: Vec<u8>,
}

impl MutateInSpec {
    pub fn new(
        opcode: SubdocOpcode,
        path: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let path = path.into();
        // An empty replace path addresses the whole document.
        let opcode = if opcode == SubdocOpcode::Replace && path.is_empty() {
            SubdocOpcode::SetDoc
        } else {
            opcode
        };
        MutateInSpec {
            opcode,
            flags: 0,
            path,
            value: value.into(),
        }
    }

    pub fn dict_upsert(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::DictUpsert, path, value)
    }

    pub fn dict_add(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::DictAdd, path, value)
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::Replace, path, value)
    }

    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        MutateInSpec::new(SubdocOpcode::Counter, path, delta.to_string().into_bytes())
    }

    pub fn array_push_last(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::ArrayPushLast, path, value)
    }

    pub fn array_push_first(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::ArrayPushFirst, path, value)
    }

    pub fn array_insert(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::ArrayInsert, path, value)
    }

    pub fn array_add_unique(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MutateInSpec::new(SubdocOpcode::ArrayAddUnique, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        let path = path.into();
        let opcode = if path.is_empty() {
            SubdocOpcode::RemoveDoc
        } else {
            SubdocOpcode::Remove
        };
        MutateInSpec {
            opcode,
            flags: 0,
            path,
            value: Vec::new(),
        }
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= PATH_FLAG_XATTR;
        self
    }

    pub fn create_parents(mut self) -> Self {
        self.flags |= PATH_FLAG_CREATE_PARENTS;
        self
    }

    pub fn expand_macros(mut self) -> Self {
        self.flags |= PATH_FLAG_EXPAND_MACROS;
        self
    }
}

/// Wire encoding of lookup specs: per spec `opcode, flags, path_len u16,
/// path`.
pub fn encode_lookup_specs(specs: &[LookupInSpec], out: &mut Vec<u8>) {
    for spec in specs {
        out.put_u8(spec.opcode as u8);
        out.put_u8(spec.flags);
        out.put_u16(spec.path.len() as u16);
        out.put_slice(spec.path.as_bytes());
    }
}

/// Wire encoding of mutation specs: per spec `opcode, flags, path_len u16,
/// value_len u32, path, value`.
pub fn encode_mutate_specs(specs: &[MutateInSpec], out: &mut Vec<u8>) {
    for spec in specs {
        out.put_u8(spec.opcode as u8);
        out.put_u8(spec.flags);
        out.put_u16(spec.path.len() as u16);
        out.put_u32(spec.value.len() as u32);
        out.put_slice(spec.path.as_bytes());
        out.put_slice(&spec.value);
    }
}

/// One decoded entry of a multi-path response.
#[derive(Debug, Clone)]
pub struct SubdocField {
    pub index: u8,
    pub status: Option<Status>,
    pub raw_status: u16,
    pub value: Vec<u8>,
}

impl SubdocField {
    /// A field "exists" iff its spec index is inside the response and the
    /// path-level status is success.
    pub fn exists(&self) -> bool {
        matches!(self.status, Some(status) if status.is_success())
    }
}

/// Decode a `lookup_in` response body: per field `status u16, value_len u32,
/// value`, in spec order.
pub fn decode_lookup_fields(mut body: &[u8]) -> ShoalResult<Vec<SubdocField>> {
    let mut fields = Vec::new();
    let mut index = 0u8;
    while !body.is_empty() {
        if body.len() < 6 {
            return Err(truncated());
        }
        let raw_status = BigEndian::read_u16(&body[0..2]);
        let len = BigEndian::read_u32(&body[2..6]) as usize;
        if body.len() < 6 + len {
            return Err(truncated());
        }
        fields.push(SubdocField {
            index,
            status: Status::parse(raw_status),
            raw_status,
            value: body[6..6 + len].to_vec(),
        });
        body = &body[6 + len..];
        index = index.wrapping_add(1);
    }
    Ok(fields)
}

/// Decode a `mutate_in` response body: entries only for specs that produced
/// output or failed, each `index u8, status u16[, value_len u32, value]`.
pub fn decode_mutate_fields(mut body: &[u8]) -> ShoalResult<Vec<SubdocField>> {
    let mut fields = Vec::new();
    while !body.is_empty() {
        if body.len() < 3 {
            return Err(truncated());
        }
        let index = body[0];
        let raw_status = BigEndian::read_u16(&body[1..3]);
        let status = Status::parse(raw_status);
        let mut value = Vec::new();
        body = &body[3..];
        if status == Some(Status::Success) {
            if body.len() < 4 {
                return Err(truncated());
            }
            let len = BigEndian::read_u32(&body[0..4]) as usize;
            if body.len() < 4 + len {
                return Err(truncated());
            }
            value = body[4..4 + len].to_vec();
            body = &body[4 + len..];
        }
        fields.push(SubdocField {
            index,
            status,
            raw_status,
            value,
        });
    }
    Ok(fields)
}

fn truncated() -> ShoalError {
    ShoalError::with_message(ErrorKind::ParsingFailure, "truncated sub-document response")
}
