//! The key-value dispatcher: wraps one typed request with a deadline,
//! resolves its collection, encodes and sends it, and orchestrates retries
//! until the request completes or the deadline wins.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use metrics::{counter, histogram};
use shoal_errors::{
    ErrorKind, KeyValueErrorContext, RetryReason, ShoalError, ShoalResult,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ClusterOptions;
use crate::metrics::recorded;
use crate::protocol::{DataType, DurabilityLevel, Opcode, RequestFrame, Status};
use crate::retry::{RetryAction, RetryState};
use crate::tracer::{attributes, RequestSpan, RequestTracer};

use super::operations::{KvRequest, KvResponse};
use super::session::{KvSession, SessionResponse};

/// Operations with durability never run with a deadline below this.
pub const DURABILITY_TIMEOUT_FLOOR: Duration = Duration::from_millis(1_500);

/// Minimum time we need ahead of the deadline to chase a collection id.
const COLLECTION_REFRESH_FLOOR: Duration = Duration::from_millis(500);

/// Supplies the session serving a request's target node. Implemented by the
/// cluster facade over its current snapshot; consulted again on every
/// attempt so re-routing after a config swap is automatic.
pub(crate) trait KvRouter: Send + Sync {
    fn route(&self, request: &KvRequest) -> ShoalResult<(u16, KvSession)>;
}

/// Run `request` to completion against `router`.
pub(crate) async fn execute(
    router: &dyn KvRouter,
    options: &ClusterOptions,
    tracer: &dyn RequestTracer,
    request: KvRequest,
) -> ShoalResult<KvResponse> {
    let opcode = request.opcode();
    let mut span = tracer.start_span(opcode.name());
    span.add_tag_str(attributes::SERVICE, "kv");
    span.add_tag_str(attributes::INSTANCE, request.id.bucket());

    let mut timeout = request
        .timeout
        .unwrap_or(options.timeouts.key_value_timeout);
    if request.durability != DurabilityLevel::None
        && request.supports_durability()
        && timeout < DURABILITY_TIMEOUT_FLOOR
    {
        debug!(
            timeout_ms = timeout.as_millis() as u64,
            floor_ms = DURABILITY_TIMEOUT_FLOOR.as_millis() as u64,
            "timeout too low for durable operation, raising to floor"
        );
        timeout = DURABILITY_TIMEOUT_FLOOR;
    }
    let deadline = Instant::now() + timeout;
    // Server-side sync-write deadline: slightly inside the client deadline
    // so the server gives up first.
    let durability_wire_timeout = (timeout.as_millis() as f64 * 0.9) as u16;

    let result = run_attempts(
        router,
        options,
        span.as_mut(),
        request,
        deadline,
        durability_wire_timeout,
    )
    .await;
    span.end();
    result
}

async fn run_attempts(
    router: &dyn KvRouter,
    options: &ClusterOptions,
    span: &mut dyn RequestSpan,
    mut request: KvRequest,
    deadline: Instant,
    durability_wire_timeout: u16,
) -> ShoalResult<KvResponse> {
    let opcode = request.opcode();
    let mut retries = RetryState::new(request.idempotent());

    let mut last_remote: Option<String> = None;
    let mut last_local: Option<String> = None;
    let mut last_status: Option<u16> = None;
    let mut last_opaque: Option<u32> = None;

    macro_rules! fail {
        ($kind:expr) => {
            return Err(ShoalError::new($kind).set_kv_context(KeyValueErrorContext {
                bucket: request.id.bucket().to_string(),
                scope: request.id.scope().to_string(),
                collection: request.id.collection().to_string(),
                key: String::from_utf8(request.id.key().to_vec()).ok(),
                retry_attempts: retries.attempts,
                retry_reasons: retries.reasons.clone(),
                last_dispatched_to: last_remote.clone(),
                last_dispatched_from: last_local.clone(),
                status_code: last_status,
                opaque: last_opaque,
            }))
        };
    }

    macro_rules! consult {
        ($reason:expr) => {{
            let reason: RetryReason = $reason;
            retries.record(reason);
            counter!(recorded::OPERATION_RETRIES, "reason" => reason.to_string()).increment(1);
            let action = if reason.always_retry() {
                RetryAction::RetryAfter(Duration::from_millis(1))
            } else {
                options.retry_strategy.retry_after(&retries, reason)
            };
            match action {
                RetryAction::DoNotRetry => None,
                RetryAction::RetryAfter(delay) => Some(delay),
            }
        }};
    }

    macro_rules! backoff_or_timeout {
        ($delay:expr) => {{
            let delay: Duration = $delay;
            if Instant::now() + delay >= deadline {
                fail!(ErrorKind::timeout(retries.idempotent));
            }
            tokio::time::sleep(delay).await;
        }};
    }

    loop {
        if Instant::now() >= deadline {
            fail!(ErrorKind::timeout(retries.idempotent));
        }

        let (partition, session) = match router.route(&request) {
            Ok(target) => target,
            Err(e) => {
                match consult!(RetryReason::NodeNotAvailable) {
                    Some(delay) => {
                        backoff_or_timeout!(delay);
                        continue;
                    }
                    None => return Err(e),
                }
            }
        };

        let collections = session.supports_feature(crate::protocol::HelloFeature::Collections);
        if request.addresses_document() && collections && !request.id.is_default_collection() {
            match resolve_collection_id(&session, &mut request, deadline).await? {
                Resolution::Resolved => {}
                Resolution::Outdated => {
                    retries.record(RetryReason::KvCollectionOutdated);
                    if deadline.saturating_duration_since(Instant::now())
                        < COLLECTION_REFRESH_FLOOR
                    {
                        fail!(ErrorKind::timeout(retries.idempotent));
                    }
                    tokio::time::sleep(COLLECTION_REFRESH_FLOOR).await;
                    continue;
                }
            }
        }

        let mut frame = request.encode(collections)?;
        frame.vbucket_id = partition;
        frame.opaque = session.next_opaque();
        last_opaque = Some(frame.opaque);
        last_remote = Some(session.remote_addr().to_string());
        last_local = Some(session.local_addr().to_string());

        if session.supports_feature(crate::protocol::HelloFeature::Snappy) {
            maybe_compress(&mut frame, options);
        }
        if request.durability != DurabilityLevel::None && request.supports_durability() {
            if !session.supports_feature(crate::protocol::HelloFeature::SyncReplication) {
                fail!(ErrorKind::DurabilityLevelNotAvailable);
            }
            frame.add_durability(request.durability, Some(durability_wire_timeout));
        }

        span.add_tag_str(
            attributes::OPERATION_ID,
            &format!("0x{:x}", frame.opaque),
        );
        span.add_tag_str(attributes::REMOTE_SOCKET, session.remote_addr());
        span.add_tag_str(attributes::LOCAL_SOCKET, session.local_addr());
        span.add_tag_str(attributes::LOCAL_ID, session.id());

        let attempt_start = std::time::Instant::now();
        let receiver = session.write_and_subscribe(&frame);

        let outcome = tokio::select! {
            response = receiver => response,
            _ = tokio::time::sleep_until(deadline) => {
                // Frame already hit the socket; any answer is now an orphan.
                session.cancel(frame.opaque);
                span.add_tag_str(attributes::ORPHAN, "aborted");
                fail!(ErrorKind::timeout(retries.idempotent));
            }
        };

        histogram!(
            recorded::OPERATION_DURATION_US,
            "service" => "kv",
            "operation" => opcode.name(),
        )
        .record(attempt_start.elapsed().as_micros() as f64);

        let frame = match outcome {
            Err(_) => {
                // Session dropped the entry while shutting down.
                span.add_tag_str(attributes::ORPHAN, "canceled");
                fail!(ErrorKind::RequestCanceled);
            }
            Ok(SessionResponse::Canceled(RetryReason::DoNotRetry)) => {
                span.add_tag_str(attributes::ORPHAN, "canceled");
                fail!(ErrorKind::RequestCanceled);
            }
            Ok(SessionResponse::Canceled(reason)) => match consult!(reason) {
                Some(delay) => {
                    backoff_or_timeout!(delay);
                    continue;
                }
                None => fail!(ErrorKind::RequestCanceled),
            },
            Ok(SessionResponse::Frame(frame)) => frame,
        };

        last_status = Some(frame.raw_status);
        if let Some(duration) = frame.server_duration_us() {
            span.add_tag_u64(attributes::SERVER_DURATION, duration);
        }

        let status = match frame.status() {
            Some(status) => status,
            None => {
                // Outside the static set: ask the error map whether the
                // server thinks this is transient.
                match session.decode_error_map_reason(frame.raw_status) {
                    Some(reason) => match consult!(reason) {
                        Some(delay) => {
                            backoff_or_timeout!(delay);
                            continue;
                        }
                        None => fail!(ErrorKind::InternalServerFailure),
                    },
                    None => fail!(ErrorKind::InternalServerFailure),
                }
            }
        };

        if status.is_success() {
            trace!(opaque = frame.opaque, "operation completed");
            let value = decompress_value(&frame)?;
            return KvResponse::from_frame(opcode, partition, &frame, value);
        }

        let reason = match status {
            Status::NotMyVbucket => {
                session.handle_not_my_vbucket(&frame);
                Some(RetryReason::KvNotMyVbucket)
            }
            Status::UnknownCollection => {
                session.invalidate_collection_id(&request.id.collection_path());
                request.id.clear_collection_id();
                retries.record(RetryReason::KvCollectionOutdated);
                if deadline.saturating_duration_since(Instant::now()) < COLLECTION_REFRESH_FLOOR {
                    fail!(ErrorKind::timeout(retries.idempotent));
                }
                tokio::time::sleep(COLLECTION_REFRESH_FLOOR).await;
                continue;
            }
            Status::Locked if opcode != Opcode::Unlock => Some(RetryReason::KvLocked),
            Status::TemporaryFailure | Status::Busy | Status::NoMemory => {
                Some(RetryReason::KvTemporaryFailure)
            }
            Status::SyncWriteInProgress => Some(RetryReason::KvSyncWriteInProgress),
            Status::SyncWriteReCommitInProgress => {
                Some(RetryReason::KvSyncWriteReCommitInProgress)
            }
            _ => None,
        };

        if let Some(reason) = reason {
            match consult!(reason) {
                Some(delay) => {
                    backoff_or_timeout!(delay);
                    continue;
                }
                None => match status.error_kind(opcode == Opcode::Add) {
                    Some(kind) => fail!(kind),
                    None => fail!(ErrorKind::InternalServerFailure),
                },
            }
        }

        match status.error_kind(opcode == Opcode::Add) {
            Some(kind) => fail!(kind),
            None => fail!(ErrorKind::InternalServerFailure),
        }
    }
}

enum Resolution {
    Resolved,
    Outdated,
}

/// Fill in the request's collection id, asking the server on a cache miss.
async fn resolve_collection_id(
    session: &KvSession,
    request: &mut KvRequest,
    deadline: Instant,
) -> ShoalResult<Resolution> {
    if request.id.collection_id().is_some() {
        return Ok(Resolution::Resolved);
    }
    let path = request.id.collection_path();
    if let Some(cid) = session.cached_collection_id(&path) {
        request.id.set_collection_id(cid);
        return Ok(Resolution::Resolved);
    }
    trace!(collection = %path, "resolving collection id");

    let mut frame = RequestFrame::new(Opcode::GetCollectionId);
    frame.value = path.clone().into_bytes();
    frame.opaque = session.next_opaque();
    let receiver = session.write_and_subscribe(&frame);

    let response = tokio::select! {
        response = receiver => response,
        _ = tokio::time::sleep_until(deadline) => {
            session.cancel(frame.opaque);
            return Err(ShoalError::new(ErrorKind::AmbiguousTimeout));
        }
    };

    match response {
        Ok(SessionResponse::Frame(frame)) => match frame.status() {
            Some(Status::Success) if frame.extras.len() >= 12 => {
                let cid = BigEndian::read_u32(&frame.extras[8..12]);
                session.update_collection_id(path, cid);
                request.id.set_collection_id(cid);
                Ok(Resolution::Resolved)
            }
            Some(Status::UnknownCollection) => Err(ShoalError::with_message(
                ErrorKind::CollectionNotFound,
                format!("collection {} not found", request.id.collection_path()),
            )),
            Some(Status::UnknownScope) => Err(ShoalError::with_message(
                ErrorKind::ScopeNotFound,
                format!("scope {} not found", request.id.scope()),
            )),
            _ => Ok(Resolution::Outdated),
        },
        Ok(SessionResponse::Canceled(_)) | Err(_) => Ok(Resolution::Outdated),
    }
}

fn maybe_compress(frame: &mut RequestFrame, options: &ClusterOptions) {
    let compression = &options.compression;
    if !compression.enabled || frame.value.len() < compression.min_size {
        return;
    }
    let Ok(compressed) = snap::raw::Encoder::new().compress_vec(&frame.value) else {
        return;
    };
    if (compressed.len() as f64) <= (frame.value.len() as f64) * compression.min_ratio {
        frame.value = compressed;
        frame.datatype |= DataType::SNAPPY;
    }
}

fn decompress_value(frame: &crate::protocol::ResponseFrame) -> ShoalResult<Vec<u8>> {
    if frame.datatype & DataType::SNAPPY.bits() != 0 {
        return snap::raw::Decoder::new()
            .decompress_vec(&frame.value)
            .map_err(|e| ShoalError::with_source(ErrorKind::ParsingFailure, e));
    }
    Ok(frame.value.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionOptions;

    #[test]
    fn compression_respects_floor_and_ratio() {
        let mut options = ClusterOptions::default();
        options.compression = CompressionOptions {
            enabled: true,
            min_size: 32,
            min_ratio: 0.83,
        };

        // Tiny values stay untouched.
        let mut frame = RequestFrame::new(Opcode::Set);
        frame.value = b"short".to_vec();
        maybe_compress(&mut frame, &options);
        assert_eq!(frame.value, b"short");
        assert!(!frame.datatype.contains(DataType::SNAPPY));

        // Highly repetitive payloads compress and get flagged.
        let mut frame = RequestFrame::new(Opcode::Set);
        frame.value = vec![b'a'; 4096];
        maybe_compress(&mut frame, &options);
        assert!(frame.datatype.contains(DataType::SNAPPY));
        assert!(frame.value.len() < 4096);

        // And the round trip restores the original.
        let restored = snap::raw::Decoder::new()
            .decompress_vec(&frame.value)
            .unwrap();
        assert_eq!(restored, vec![b'a'; 4096]);
    }

    #[test]
    fn incompressible_values_stay_raw() {
        let mut options = ClusterOptions::default();
        options.compression.min_size = 16;
        let mut frame = RequestFrame::new(Opcode::Set);
        // Pseudo-random bytes do not meet a 0.83 ratio.
        let mut state = 0x12345678u32;
        frame.value = (0..256)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let original = frame.value.clone();
        maybe_compress(&mut frame, &options);
        assert_eq!(frame.value, original);
        assert!(!frame.datatype.contains(DataType::SNAPPY));
    }
}
