//! Error types shared across the Shoal client workspace.
//!
//! The client surfaces every failure as a [`ShoalError`]: a kind drawn from a
//! closed set, plus an optional context record describing where the request
//! was in its lifecycle when it failed. Transient failures are not part of
//! this vocabulary; those are represented by [`RetryReason`] and recovered
//! internally by the retry orchestrator until the operation deadline.

use std::fmt::{self, Display};

use serde::Serialize;
use thiserror::Error;

/// The closed set of error kinds observable at the client boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    // Common
    #[error("ambiguous_timeout")]
    AmbiguousTimeout,
    #[error("unambiguous_timeout")]
    UnambiguousTimeout,
    #[error("request_canceled")]
    RequestCanceled,
    #[error("invalid_argument")]
    InvalidArgument,
    #[error("service_not_available")]
    ServiceNotAvailable,
    #[error("internal_server_failure")]
    InternalServerFailure,
    #[error("authentication_failure")]
    AuthenticationFailure,
    #[error("temporary_failure")]
    TemporaryFailure,
    #[error("parsing_failure")]
    ParsingFailure,
    #[error("cas_mismatch")]
    CasMismatch,
    #[error("bucket_not_found")]
    BucketNotFound,
    #[error("scope_not_found")]
    ScopeNotFound,
    #[error("collection_not_found")]
    CollectionNotFound,
    #[error("index_not_found")]
    IndexNotFound,
    #[error("index_exists")]
    IndexExists,
    #[error("rate_limited")]
    RateLimited,
    #[error("quota_limited")]
    QuotaLimited,
    #[error("unsupported_operation")]
    UnsupportedOperation,
    #[error("feature_not_available")]
    FeatureNotAvailable,

    // Key-value
    #[error("document_not_found")]
    DocumentNotFound,
    #[error("document_exists")]
    DocumentExists,
    #[error("document_locked")]
    DocumentLocked,
    #[error("value_too_large")]
    ValueTooLarge,
    #[error("durability_level_not_available")]
    DurabilityLevelNotAvailable,
    #[error("durability_impossible")]
    DurabilityImpossible,
    #[error("durability_ambiguous")]
    DurabilityAmbiguous,
    #[error("sync_write_in_progress")]
    SyncWriteInProgress,
    #[error("sync_write_re_commit_in_progress")]
    SyncWriteReCommitInProgress,
    #[error("path_not_found")]
    PathNotFound,
    #[error("path_exists")]
    PathExists,
    #[error("path_mismatch")]
    PathMismatch,
    #[error("path_invalid")]
    PathInvalid,
    #[error("path_too_big")]
    PathTooBig,
    #[error("xattr_invalid_key_combo")]
    XattrInvalidKeyCombo,
    #[error("xattr_cannot_modify_vattr")]
    XattrCannotModifyVattr,

    // Query
    #[error("planning_failure")]
    PlanningFailure,
    #[error("index_failure")]
    IndexFailure,
    #[error("prepared_statement_failure")]
    PreparedStatementFailure,
    #[error("dml_failure")]
    DmlFailure,

    // Analytics
    #[error("compilation_failure")]
    CompilationFailure,
    #[error("job_queue_full")]
    JobQueueFull,
    #[error("dataset_not_found")]
    DatasetNotFound,
    #[error("dataverse_not_found")]
    DataverseNotFound,
    #[error("dataset_exists")]
    DatasetExists,
    #[error("dataverse_exists")]
    DataverseExists,
    #[error("link_not_found")]
    LinkNotFound,
    #[error("link_exists")]
    LinkExists,

    // Search
    #[error("index_not_ready")]
    IndexNotReady,
}

impl ErrorKind {
    /// Timeout kind for an operation with the given idempotency, used when a
    /// deadline fires or a retry budget is exhausted.
    pub fn timeout(idempotent: bool) -> Self {
        if idempotent {
            ErrorKind::UnambiguousTimeout
        } else {
            ErrorKind::AmbiguousTimeout
        }
    }

    /// True for the two timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorKind::AmbiguousTimeout | ErrorKind::UnambiguousTimeout
        )
    }
}

/// Why a request attempt failed in a way the orchestrator may recover from.
///
/// Stored per-operation as the set of reasons seen so far, and surfaced in
/// the error context when the operation ultimately fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RetryReason {
    DoNotRetry,
    SocketClosedWhileInFlight,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    KvErrorMapRetryIndicated,
    ServiceNotAvailable,
    NodeNotAvailable,
    Unknown,
}

impl RetryReason {
    /// Reasons retried regardless of request idempotency: the request is
    /// known not to have been executed by the server.
    pub fn allows_non_idempotent_retry(&self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket
                | RetryReason::KvCollectionOutdated
                | RetryReason::KvLocked
                | RetryReason::KvTemporaryFailure
                | RetryReason::KvSyncWriteInProgress
                | RetryReason::KvSyncWriteReCommitInProgress
                | RetryReason::KvErrorMapRetryIndicated
                | RetryReason::ServiceNotAvailable
                | RetryReason::NodeNotAvailable
        )
    }

    /// Reasons that bypass the retry strategy and reschedule immediately
    /// after the controlled backoff: the routing information was stale, not
    /// the server overloaded.
    pub fn always_retry(&self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket | RetryReason::KvCollectionOutdated
        )
    }
}

impl Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryReason::DoNotRetry => "do_not_retry",
            RetryReason::SocketClosedWhileInFlight => "socket_closed_while_in_flight",
            RetryReason::KvNotMyVbucket => "kv_not_my_vbucket",
            RetryReason::KvCollectionOutdated => "kv_collection_outdated",
            RetryReason::KvLocked => "kv_locked",
            RetryReason::KvTemporaryFailure => "kv_temporary_failure",
            RetryReason::KvSyncWriteInProgress => "kv_sync_write_in_progress",
            RetryReason::KvSyncWriteReCommitInProgress => "kv_sync_write_re_commit_in_progress",
            RetryReason::KvErrorMapRetryIndicated => "kv_error_map_retry_indicated",
            RetryReason::ServiceNotAvailable => "service_not_available",
            RetryReason::NodeNotAvailable => "node_not_available",
            RetryReason::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Context attached to a failed key-value operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyValueErrorContext {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub retry_attempts: u32,
    pub retry_reasons: Vec<RetryReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_from: Option<String>,
    /// Raw server status code of the last response, when one was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque: Option<u32>,
}

/// Context attached to a failed HTTP-service operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpErrorContext {
    pub client_context_id: String,
    pub method: String,
    pub path: String,
    pub http_status: u16,
    pub http_body: String,
    pub retry_attempts: u32,
    pub retry_reasons: Vec<RetryReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_from: Option<String>,
}

/// Where the failing operation was when it failed.
#[derive(Debug, Clone, Default)]
pub enum ErrorContext {
    #[default]
    None,
    KeyValue(Box<KeyValueErrorContext>),
    Http(Box<HttpErrorContext>),
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::None => Ok(()),
            ErrorContext::KeyValue(ctx) => {
                write!(
                    f,
                    "bucket={}, scope={}, collection={}, retry_attempts={}",
                    ctx.bucket, ctx.scope, ctx.collection, ctx.retry_attempts
                )?;
                if let Some(key) = &ctx.key {
                    write!(f, ", key={key:?}")?;
                }
                if let Some(status) = ctx.status_code {
                    write!(f, ", status=0x{status:02x}")?;
                }
                if let Some(opaque) = ctx.opaque {
                    write!(f, ", opaque=0x{opaque:x}")?;
                }
                if let Some(remote) = &ctx.last_dispatched_to {
                    write!(f, ", last_dispatched_to={remote}")?;
                }
                if !ctx.retry_reasons.is_empty() {
                    write!(f, ", retry_reasons=[")?;
                    for (i, reason) in ctx.retry_reasons.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{reason}")?;
                    }
                    write!(f, "]")?;
                }
                Ok(())
            }
            ErrorContext::Http(ctx) => {
                write!(
                    f,
                    "method={}, path={}, http_status={}, client_context_id={}",
                    ctx.method, ctx.path, ctx.http_status, ctx.client_context_id
                )?;
                if let Some(remote) = &ctx.last_dispatched_to {
                    write!(f, ", last_dispatched_to={remote}")?;
                }
                Ok(())
            }
        }
    }
}

/// The error type returned by every fallible operation in the client.
#[derive(Debug, Clone)]
pub struct ShoalError {
    kind: ErrorKind,
    context: ErrorContext,
    source: Option<std::sync::Arc<dyn std::error::Error + Send + Sync>>,
    message: Option<String>,
}

impl std::error::Error for ShoalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(source) => {
                let source: &(dyn std::error::Error + 'static) = &**source;
                Some(source)
            }
            None => None,
        }
    }
}

impl ShoalError {
    pub fn new(kind: ErrorKind) -> Self {
        ShoalError {
            kind,
            context: ErrorContext::None,
            source: None,
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        ShoalError {
            kind,
            context: ErrorContext::None,
            source: None,
            message: Some(message.into()),
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ShoalError {
            kind,
            context: ErrorContext::None,
            source: Some(std::sync::Arc::new(source)),
            message: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn kv_context(&self) -> Option<&KeyValueErrorContext> {
        match &self.context {
            ErrorContext::KeyValue(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn http_context(&self) -> Option<&HttpErrorContext> {
        match &self.context {
            ErrorContext::Http(ctx) => Some(ctx),
            _ => None,
        }
    }

    #[must_use]
    pub fn set_kv_context(mut self, ctx: KeyValueErrorContext) -> Self {
        self.context = ErrorContext::KeyValue(Box::new(ctx));
        self
    }

    #[must_use]
    pub fn set_http_context(mut self, ctx: HttpErrorContext) -> Self {
        self.context = ErrorContext::Http(Box::new(ctx));
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind.is_timeout()
    }
}

impl Display for ShoalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if !matches!(self.context, ErrorContext::None) {
            write!(f, " ({})", self.context)?;
        }
        Ok(())
    }
}

impl From<ErrorKind> for ShoalError {
    fn from(kind: ErrorKind) -> Self {
        ShoalError::new(kind)
    }
}

/// Convenience alias used pervasively by the client crates.
pub type ShoalResult<T> = Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_renders_snake_case() {
        assert_eq!(ErrorKind::AmbiguousTimeout.to_string(), "ambiguous_timeout");
        assert_eq!(
            ErrorKind::SyncWriteReCommitInProgress.to_string(),
            "sync_write_re_commit_in_progress"
        );
    }

    #[test]
    fn timeout_kind_follows_idempotency() {
        assert_eq!(ErrorKind::timeout(true), ErrorKind::UnambiguousTimeout);
        assert_eq!(ErrorKind::timeout(false), ErrorKind::AmbiguousTimeout);
    }

    #[test]
    fn kv_context_shows_up_in_display() {
        let err = ShoalError::new(ErrorKind::DocumentNotFound).set_kv_context(
            KeyValueErrorContext {
                bucket: "default".into(),
                scope: "_default".into(),
                collection: "_default".into(),
                key: Some("foo".into()),
                retry_attempts: 2,
                retry_reasons: vec![RetryReason::KvTemporaryFailure],
                status_code: Some(0x01),
                opaque: Some(0x2a),
                ..Default::default()
            },
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("document_not_found"));
        assert!(rendered.contains("kv_temporary_failure"));
        assert!(rendered.contains("opaque=0x2a"));
    }

    #[test]
    fn routing_reasons_always_retry() {
        assert!(RetryReason::KvNotMyVbucket.always_retry());
        assert!(RetryReason::KvCollectionOutdated.always_retry());
        assert!(!RetryReason::KvTemporaryFailure.always_retry());
        assert!(!RetryReason::SocketClosedWhileInFlight.allows_non_idempotent_retry());
    }
}
