//! Request opcodes issued by this client.

use std::fmt::{self, Display};

/// Client request opcodes. Only the opcodes the client actually sends are
/// listed; unknown response opcodes are surfaced as protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    SelectBucket = 0x89,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetClusterConfig = 0xb5,
    GetCollectionsManifest = 0xba,
    GetCollectionId = 0xbb,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    RangeScanCreate = 0xda,
    RangeScanContinue = 0xdb,
    RangeScanCancel = 0xdc,
    GetErrorMap = 0xfe,
}

impl Opcode {
    pub fn parse(raw: u8) -> Option<Opcode> {
        Some(match raw {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x0a => Opcode::Noop,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x1c => Opcode::Touch,
            0x1d => Opcode::GetAndTouch,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x89 => Opcode::SelectBucket,
            0x94 => Opcode::GetAndLock,
            0x95 => Opcode::Unlock,
            0xb5 => Opcode::GetClusterConfig,
            0xba => Opcode::GetCollectionsManifest,
            0xbb => Opcode::GetCollectionId,
            0xd0 => Opcode::SubdocMultiLookup,
            0xd1 => Opcode::SubdocMultiMutation,
            0xda => Opcode::RangeScanCreate,
            0xdb => Opcode::RangeScanContinue,
            0xdc => Opcode::RangeScanCancel,
            0xfe => Opcode::GetErrorMap,
            _ => return None,
        })
    }

    /// Name used for span `operation_name` tags and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "upsert",
            Opcode::Add => "insert",
            Opcode::Replace => "replace",
            Opcode::Delete => "remove",
            Opcode::Increment => "increment",
            Opcode::Decrement => "decrement",
            Opcode::Noop => "noop",
            Opcode::Append => "append",
            Opcode::Prepend => "prepend",
            Opcode::Touch => "touch",
            Opcode::GetAndTouch => "get_and_touch",
            Opcode::Hello => "hello",
            Opcode::SaslListMechs => "sasl_list_mechs",
            Opcode::SaslAuth => "sasl_auth",
            Opcode::SaslStep => "sasl_step",
            Opcode::SelectBucket => "select_bucket",
            Opcode::GetAndLock => "get_and_lock",
            Opcode::Unlock => "unlock",
            Opcode::GetClusterConfig => "get_cluster_config",
            Opcode::GetCollectionsManifest => "get_collections_manifest",
            Opcode::GetCollectionId => "get_collection_id",
            Opcode::SubdocMultiLookup => "lookup_in",
            Opcode::SubdocMultiMutation => "mutate_in",
            Opcode::RangeScanCreate => "range_scan_create",
            Opcode::RangeScanContinue => "range_scan_continue",
            Opcode::RangeScanCancel => "range_scan_cancel",
            Opcode::GetErrorMap => "get_error_map",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
