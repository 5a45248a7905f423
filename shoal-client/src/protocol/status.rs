//! Response status codes and their mapping onto client error kinds.

use std::fmt::{self, Display};

use shoal_errors::ErrorKind;

/// Server status codes this client understands statically. Codes outside
/// this set are resolved through the downloaded error map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    NotFound = 0x01,
    Exists = 0x02,
    TooBig = 0x03,
    Invalid = 0x04,
    NotStored = 0x05,
    DeltaBadValue = 0x06,
    NotMyVbucket = 0x07,
    NoBucket = 0x08,
    Locked = 0x09,
    NotLocked = 0x0e,
    AuthStale = 0x1f,
    AuthError = 0x20,
    AuthContinue = 0x21,
    RangeError = 0x22,
    NoAccess = 0x24,
    UnknownFrameInfo = 0x80,
    UnknownCommand = 0x81,
    NoMemory = 0x82,
    NotSupported = 0x83,
    Internal = 0x84,
    Busy = 0x85,
    TemporaryFailure = 0x86,
    XattrInvalid = 0x87,
    UnknownCollection = 0x88,
    NoCollectionsManifest = 0x89,
    UnknownScope = 0x8c,
    DurabilityInvalidLevel = 0xa0,
    DurabilityImpossible = 0xa1,
    SyncWriteInProgress = 0xa2,
    SyncWriteAmbiguous = 0xa3,
    SyncWriteReCommitInProgress = 0xa4,
    SubdocPathNotFound = 0xc0,
    SubdocPathMismatch = 0xc1,
    SubdocPathInvalid = 0xc2,
    SubdocPathTooBig = 0xc3,
    SubdocDocTooDeep = 0xc4,
    SubdocValueCannotInsert = 0xc5,
    SubdocDocNotJson = 0xc6,
    SubdocNumRangeError = 0xc7,
    SubdocDeltaInvalid = 0xc8,
    SubdocPathExists = 0xc9,
    SubdocValueTooDeep = 0xca,
    SubdocInvalidCombo = 0xcb,
    SubdocMultiPathFailure = 0xcc,
    SubdocSuccessDeleted = 0xcd,
    SubdocXattrInvalidFlagCombo = 0xce,
    SubdocXattrInvalidKeyCombo = 0xcf,
    SubdocXattrUnknownMacro = 0xd0,
    SubdocXattrUnknownVattr = 0xd1,
    SubdocXattrCannotModifyVattr = 0xd2,
    SubdocMultiPathFailureDeleted = 0xd3,
    RateLimitedNetworkIngress = 0x30,
    RateLimitedNetworkEgress = 0x31,
    RateLimitedMaxConnections = 0x32,
    RateLimitedMaxCommands = 0x33,
    ScopeSizeLimitExceeded = 0x34,
    RangeScanCancelled = 0xa5,
    RangeScanMore = 0xa6,
    RangeScanComplete = 0xa7,
}

impl Status {
    pub fn parse(raw: u16) -> Option<Status> {
        Some(match raw {
            0x00 => Status::Success,
            0x01 => Status::NotFound,
            0x02 => Status::Exists,
            0x03 => Status::TooBig,
            0x04 => Status::Invalid,
            0x05 => Status::NotStored,
            0x06 => Status::DeltaBadValue,
            0x07 => Status::NotMyVbucket,
            0x08 => Status::NoBucket,
            0x09 => Status::Locked,
            0x0e => Status::NotLocked,
            0x1f => Status::AuthStale,
            0x20 => Status::AuthError,
            0x21 => Status::AuthContinue,
            0x22 => Status::RangeError,
            0x24 => Status::NoAccess,
            0x30 => Status::RateLimitedNetworkIngress,
            0x31 => Status::RateLimitedNetworkEgress,
            0x32 => Status::RateLimitedMaxConnections,
            0x33 => Status::RateLimitedMaxCommands,
            0x34 => Status::ScopeSizeLimitExceeded,
            0x80 => Status::UnknownFrameInfo,
            0x81 => Status::UnknownCommand,
            0x82 => Status::NoMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::Internal,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            0x87 => Status::XattrInvalid,
            0x88 => Status::UnknownCollection,
            0x89 => Status::NoCollectionsManifest,
            0x8c => Status::UnknownScope,
            0xa0 => Status::DurabilityInvalidLevel,
            0xa1 => Status::DurabilityImpossible,
            0xa2 => Status::SyncWriteInProgress,
            0xa3 => Status::SyncWriteAmbiguous,
            0xa4 => Status::SyncWriteReCommitInProgress,
            0xa5 => Status::RangeScanCancelled,
            0xa6 => Status::RangeScanMore,
            0xa7 => Status::RangeScanComplete,
            0xc0 => Status::SubdocPathNotFound,
            0xc1 => Status::SubdocPathMismatch,
            0xc2 => Status::SubdocPathInvalid,
            0xc3 => Status::SubdocPathTooBig,
            0xc4 => Status::SubdocDocTooDeep,
            0xc5 => Status::SubdocValueCannotInsert,
            0xc6 => Status::SubdocDocNotJson,
            0xc7 => Status::SubdocNumRangeError,
            0xc8 => Status::SubdocDeltaInvalid,
            0xc9 => Status::SubdocPathExists,
            0xca => Status::SubdocValueTooDeep,
            0xcb => Status::SubdocInvalidCombo,
            0xcc => Status::SubdocMultiPathFailure,
            0xcd => Status::SubdocSuccessDeleted,
            0xce => Status::SubdocXattrInvalidFlagCombo,
            0xcf => Status::SubdocXattrInvalidKeyCombo,
            0xd0 => Status::SubdocXattrUnknownMacro,
            0xd1 => Status::SubdocXattrUnknownVattr,
            0xd2 => Status::SubdocXattrCannotModifyVattr,
            0xd3 => Status::SubdocMultiPathFailureDeleted,
            _ => return None,
        })
    }

    /// Statuses that still carry a usable response payload.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::SubdocSuccessDeleted
                | Status::SubdocMultiPathFailure
                | Status::SubdocMultiPathFailureDeleted
                | Status::RangeScanMore
                | Status::RangeScanComplete
        )
    }

    /// Terminal error kind for this status, applied when the retry
    /// orchestrator decides the status is not recoverable. `None` for
    /// statuses that never surface directly (e.g. `NotMyVbucket`).
    pub fn error_kind(&self, opcode_is_insert: bool) -> Option<ErrorKind> {
        Some(match self {
            Status::Success
            | Status::SubdocSuccessDeleted
            | Status::SubdocMultiPathFailure
            | Status::SubdocMultiPathFailureDeleted
            | Status::RangeScanMore
            | Status::RangeScanComplete => return None,
            Status::NotFound => ErrorKind::DocumentNotFound,
            Status::Exists => {
                // On add the key existed; on CAS-carrying mutations the CAS
                // was stale.
                if opcode_is_insert {
                    ErrorKind::DocumentExists
                } else {
                    ErrorKind::CasMismatch
                }
            }
            Status::TooBig => ErrorKind::ValueTooLarge,
            Status::Invalid | Status::RangeError | Status::DeltaBadValue => {
                ErrorKind::InvalidArgument
            }
            Status::NotStored => ErrorKind::DocumentNotFound,
            Status::NotMyVbucket => return None,
            Status::NoBucket => ErrorKind::BucketNotFound,
            Status::Locked => ErrorKind::DocumentLocked,
            Status::NotLocked => ErrorKind::InvalidArgument,
            Status::AuthStale | Status::AuthError | Status::AuthContinue => {
                ErrorKind::AuthenticationFailure
            }
            Status::NoAccess => ErrorKind::AuthenticationFailure,
            Status::RateLimitedNetworkIngress
            | Status::RateLimitedNetworkEgress
            | Status::RateLimitedMaxConnections
            | Status::RateLimitedMaxCommands => ErrorKind::RateLimited,
            Status::ScopeSizeLimitExceeded => ErrorKind::QuotaLimited,
            Status::UnknownFrameInfo | Status::UnknownCommand | Status::NotSupported => {
                ErrorKind::UnsupportedOperation
            }
            Status::NoMemory | Status::Busy | Status::TemporaryFailure => {
                ErrorKind::TemporaryFailure
            }
            Status::Internal => ErrorKind::InternalServerFailure,
            Status::XattrInvalid => ErrorKind::XattrInvalidKeyCombo,
            Status::UnknownCollection | Status::NoCollectionsManifest => {
                ErrorKind::CollectionNotFound
            }
            Status::UnknownScope => ErrorKind::ScopeNotFound,
            Status::DurabilityInvalidLevel => ErrorKind::DurabilityLevelNotAvailable,
            Status::DurabilityImpossible => ErrorKind::DurabilityImpossible,
            Status::SyncWriteInProgress => ErrorKind::SyncWriteInProgress,
            Status::SyncWriteAmbiguous => ErrorKind::DurabilityAmbiguous,
            Status::SyncWriteReCommitInProgress => ErrorKind::SyncWriteReCommitInProgress,
            Status::SubdocPathNotFound => ErrorKind::PathNotFound,
            Status::SubdocPathMismatch => ErrorKind::PathMismatch,
            Status::SubdocPathInvalid => ErrorKind::PathInvalid,
            Status::SubdocPathTooBig => ErrorKind::PathTooBig,
            Status::SubdocPathExists => ErrorKind::PathExists,
            Status::SubdocDocTooDeep
            | Status::SubdocValueCannotInsert
            | Status::SubdocDocNotJson
            | Status::SubdocNumRangeError
            | Status::SubdocDeltaInvalid
            | Status::SubdocValueTooDeep
            | Status::SubdocInvalidCombo => ErrorKind::InvalidArgument,
            Status::SubdocXattrInvalidFlagCombo | Status::SubdocXattrInvalidKeyCombo => {
                ErrorKind::XattrInvalidKeyCombo
            }
            Status::SubdocXattrUnknownMacro | Status::SubdocXattrUnknownVattr => {
                ErrorKind::InvalidArgument
            }
            Status::SubdocXattrCannotModifyVattr => ErrorKind::XattrCannotModifyVattr,
            Status::RangeScanCancelled => ErrorKind::RequestCanceled,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_maps_by_operation() {
        assert_eq!(
            Status::Exists.error_kind(true),
            Some(ErrorKind::DocumentExists)
        );
        assert_eq!(
            Status::Exists.error_kind(false),
            Some(ErrorKind::CasMismatch)
        );
    }

    #[test]
    fn success_statuses_carry_no_error() {
        for status in [Status::Success, Status::SubdocSuccessDeleted] {
            assert!(status.is_success());
            assert_eq!(status.error_kind(false), None);
        }
    }

    #[test]
    fn unknown_raw_status_is_none() {
        assert_eq!(Status::parse(0x7777), None);
        assert_eq!(Status::parse(0x86), Some(Status::TemporaryFailure));
    }
}
