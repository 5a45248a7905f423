//! Query service: request-body construction, the prepared-statement flow,
//! and response envelope parsing with the service's error-code mapping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use shoal_errors::{ErrorKind, HttpErrorContext, ShoalError, ShoalResult};
use tracing::debug;
use uuid::Uuid;

use crate::http::pool::HttpSessionPool;
use crate::http::HttpRequest;
use crate::kv::MutationToken;
use crate::service::ServiceType;
use crate::topology::ClusterConfig;

/// Index-consistency requirement of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileMode {
    #[default]
    Off,
    Phases,
    Timings,
}

/// A mutation the query must observe (`at_plus` consistency).
#[derive(Debug, Clone)]
pub struct MutationState {
    pub bucket_name: String,
    pub token: MutationToken,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub statement: String,
    /// Ad-hoc statements skip the prepared-statement machinery.
    pub adhoc: bool,
    pub client_context_id: String,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: HashMap<String, Value>,
    pub scan_consistency: Option<ScanConsistency>,
    pub mutation_state: Vec<MutationState>,
    pub scan_wait: Option<Duration>,
    pub profile: ProfileMode,
    pub metrics: bool,
    pub readonly: bool,
    pub flex_index: bool,
    pub use_replica: Option<bool>,
    pub preserve_expiry: bool,
    pub max_parallelism: Option<u64>,
    pub pipeline_batch: Option<u64>,
    pub pipeline_cap: Option<u64>,
    pub scan_cap: Option<u64>,
    /// Scope qualification: `default:`bucket`.`scope``.
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub timeout: Option<Duration>,
    pub raw: HashMap<String, Value>,
}

impl QueryRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        QueryRequest {
            statement: statement.into(),
            adhoc: true,
            client_context_id: Uuid::new_v4().to_string(),
            positional_parameters: Vec::new(),
            named_parameters: HashMap::new(),
            scan_consistency: None,
            mutation_state: Vec::new(),
            scan_wait: None,
            profile: ProfileMode::Off,
            metrics: true,
            readonly: false,
            flex_index: false,
            use_replica: None,
            preserve_expiry: false,
            max_parallelism: None,
            pipeline_batch: None,
            pipeline_cap: None,
            scan_cap: None,
            bucket_name: None,
            scope_name: None,
            timeout: None,
            raw: HashMap::new(),
        }
    }

    /// Build the service body for one attempt. `prepared` is the cache entry
    /// to use, `auto_execute` whether a fresh PREPARE executes in the same
    /// round trip.
    fn encode_body(
        &self,
        prepared: Option<&crate::prepared::PreparedEntry>,
        enhanced_prepared: bool,
        default_timeout: Duration,
    ) -> Value {
        let mut body = serde_json::Map::new();
        if self.adhoc {
            body.insert("statement".into(), json!(self.statement));
        } else {
            match prepared {
                Some(entry) => {
                    body.insert("prepared".into(), json!(entry.name));
                    if let Some(plan) = &entry.plan {
                        body.insert("encoded_plan".into(), json!(plan));
                    }
                }
                None => {
                    body.insert(
                        "statement".into(),
                        json!(format!("PREPARE {}", self.statement)),
                    );
                    if enhanced_prepared {
                        body.insert("auto_execute".into(), json!(true));
                    }
                }
            }
        }
        body.insert("client_context_id".into(), json!(self.client_context_id));
        let timeout = self.timeout.unwrap_or(default_timeout);
        // Shave the wire timeout so the client deadline fires after the
        // server's, keeping the failure unambiguous.
        let wire_timeout = if timeout > Duration::from_secs(5) {
            timeout - Duration::from_millis(500)
        } else {
            timeout
        };
        body.insert(
            "timeout".into(),
            json!(format!("{}ms", wire_timeout.as_millis())),
        );

        if self.positional_parameters.is_empty() {
            for (name, value) in &self.named_parameters {
                let key = if name.starts_with('$') {
                    name.clone()
                } else {
                    format!("${name}")
                };
                body.insert(key, value.clone());
            }
        } else {
            body.insert("args".into(), Value::Array(self.positional_parameters.clone()));
        }

        match self.profile {
            ProfileMode::Off => {}
            ProfileMode::Phases => {
                body.insert("profile".into(), json!("phases"));
            }
            ProfileMode::Timings => {
                body.insert("profile".into(), json!("timings"));
            }
        }
        if let Some(value) = self.max_parallelism {
            body.insert("max_parallelism".into(), json!(value.to_string()));
        }
        if let Some(value) = self.pipeline_cap {
            body.insert("pipeline_cap".into(), json!(value.to_string()));
        }
        if let Some(value) = self.pipeline_batch {
            body.insert("pipeline_batch".into(), json!(value.to_string()));
        }
        if let Some(value) = self.scan_cap {
            body.insert("scan_cap".into(), json!(value.to_string()));
        }
        if !self.metrics {
            body.insert("metrics".into(), json!(false));
        }
        if self.readonly {
            body.insert("readonly".into(), json!(true));
        }
        if self.flex_index {
            body.insert("use_fts".into(), json!(true));
        }
        if let Some(use_replica) = self.use_replica {
            body.insert(
                "use_replica".into(),
                json!(if use_replica { "on" } else { "off" }),
            );
        }
        if self.preserve_expiry {
            body.insert("preserve_expiry".into(), json!(true));
        }

        let mut check_scan_wait = false;
        if let Some(consistency) = self.scan_consistency {
            match consistency {
                ScanConsistency::NotBounded => {
                    body.insert("scan_consistency".into(), json!("not_bounded"));
                }
                ScanConsistency::RequestPlus => {
                    check_scan_wait = true;
                    body.insert("scan_consistency".into(), json!("request_plus"));
                }
            }
        } else if !self.mutation_state.is_empty() {
            check_scan_wait = true;
            body.insert("scan_consistency".into(), json!("at_plus"));
            let mut scan_vectors = serde_json::Map::new();
            for state in &self.mutation_state {
                let bucket = scan_vectors
                    .entry(state.bucket_name.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Value::Object(bucket) = bucket {
                    bucket.insert(
                        state.token.partition_id.to_string(),
                        json!([
                            state.token.sequence_number,
                            state.token.partition_uuid.to_string()
                        ]),
                    );
                }
            }
            body.insert("scan_vectors".into(), Value::Object(scan_vectors));
        }
        if check_scan_wait {
            if let Some(scan_wait) = self.scan_wait {
                body.insert("scan_wait".into(), json!(format!("{}ms", scan_wait.as_millis())));
            }
        }

        if let (Some(bucket), Some(scope)) = (&self.bucket_name, &self.scope_name) {
            body.insert(
                "query_context".into(),
                json!(format!("default:`{bucket}`.`{scope}`")),
            );
        }
        for (name, value) in &self.raw {
            body.insert(name.clone(), value.clone());
        }
        Value::Object(body)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryProblem {
    pub code: u64,
    #[serde(rename = "msg")]
    pub message: String,
    /// Sub-code from the nested `reason` object some datastore errors carry.
    #[serde(default, deserialize_with = "reason_code")]
    pub reason: Option<u64>,
}

fn reason_code<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Reason {
        #[serde(default)]
        code: Option<u64>,
    }
    let reason: Option<Reason> = serde::Deserialize::deserialize(deserializer)?;
    Ok(reason.and_then(|reason| reason.code))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryMetrics {
    #[serde(rename = "resultCount", default)]
    pub result_count: u64,
    #[serde(rename = "resultSize", default)]
    pub result_size: u64,
    #[serde(rename = "elapsedTime", default)]
    pub elapsed_time: String,
    #[serde(rename = "executionTime", default)]
    pub execution_time: String,
    #[serde(rename = "sortCount", default)]
    pub sort_count: Option<u64>,
    #[serde(rename = "mutationCount", default)]
    pub mutation_count: Option<u64>,
    #[serde(rename = "errorCount", default)]
    pub error_count: Option<u64>,
    #[serde(rename = "warningCount", default)]
    pub warning_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryPayload {
    #[serde(rename = "requestID", default)]
    request_id: String,
    #[serde(rename = "clientContextID", default)]
    client_context_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    prepared: Option<String>,
    #[serde(default)]
    metrics: Option<QueryMetrics>,
    #[serde(default)]
    errors: Option<Vec<QueryProblem>>,
    #[serde(default)]
    warnings: Option<Vec<QueryProblem>>,
    #[serde(default)]
    results: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryMetaData {
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub metrics: Option<QueryMetrics>,
    pub errors: Vec<QueryProblem>,
    pub warnings: Vec<QueryProblem>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub rows: Vec<Value>,
    pub meta: QueryMetaData,
}

/// Run a query through the HTTP pool, consulting the prepared cache for
/// non-adhoc statements.
pub(crate) async fn execute_query(
    pool: &HttpSessionPool,
    config: Option<Arc<ClusterConfig>>,
    request: QueryRequest,
) -> ShoalResult<QueryResponse> {
    let enhanced = config
        .as_ref()
        .map(|c| c.supports_enhanced_prepared_statements())
        .unwrap_or(false);
    if request.use_replica.is_some()
        && !config
            .as_ref()
            .map(|c| c.supports_query_read_from_replica())
            .unwrap_or(false)
    {
        return Err(ShoalError::with_message(
            ErrorKind::FeatureNotAvailable,
            "cluster does not support read from replica in query",
        ));
    }
    let cache = pool.prepared_cache();
    let default_timeout = pool.default_timeout(ServiceType::Query);

    // At most: one normal attempt, one legacy-prepare re-execute, one
    // re-prepare after a prepared_statement_failure.
    let mut repair_attempted = false;
    loop {
        let prepared = if request.adhoc {
            None
        } else {
            cache.get(&request.statement)
        };
        let extract_plan = !request.adhoc && prepared.is_none() && !enhanced;
        let body = request.encode_body(prepared.as_ref(), enhanced, default_timeout);
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| ShoalError::with_source(ErrorKind::InvalidArgument, e))?;
        debug!(
            client_context_id = %request.client_context_id,
            prepared = prepared.is_some(),
            "dispatching query"
        );

        let http_request = HttpRequest::new(ServiceType::Query, "POST", "/query/service")
            .json(body_bytes)
            .header("connection", "keep-alive");
        let http_request = HttpRequest {
            timeout: Some(request.timeout.unwrap_or(default_timeout)),
            client_context_id: Some(request.client_context_id.clone()),
            ..http_request
        };
        let response = pool.execute(http_request).await?;

        let mut context = HttpErrorContext {
            client_context_id: request.client_context_id.clone(),
            method: "POST".into(),
            path: "/query/service".into(),
            http_status: response.status,
            http_body: String::from_utf8_lossy(&response.body).into_owned(),
            ..Default::default()
        };

        let payload: QueryPayload = match serde_json::from_slice(&response.body) {
            Ok(payload) => payload,
            Err(e) => {
                return Err(ShoalError::with_message(
                    ErrorKind::ParsingFailure,
                    e.to_string(),
                )
                .set_http_context(context))
            }
        };

        if payload.status == "success" {
            if let Some(name) = &payload.prepared {
                cache.put(request.statement.clone(), name.clone(), None);
            } else if extract_plan {
                // Legacy protocol: the PREPARE round trip returns the plan
                // instead of executing; cache it and run again.
                let rows = payload.results.as_deref().unwrap_or_default();
                let (name, plan) = match rows {
                    [row] => (
                        row.get("name").and_then(Value::as_str),
                        row.get("encoded_plan").and_then(Value::as_str),
                    ),
                    _ => (None, None),
                };
                match (name, plan) {
                    (Some(name), Some(plan)) if !repair_attempted => {
                        cache.put(request.statement.clone(), name, Some(plan.to_string()));
                        repair_attempted = true;
                        continue;
                    }
                    _ => {
                        return Err(ShoalError::new(ErrorKind::PreparedStatementFailure)
                            .set_http_context(context))
                    }
                }
            }
            return Ok(QueryResponse {
                rows: payload.results.unwrap_or_default(),
                meta: QueryMetaData {
                    request_id: payload.request_id,
                    client_context_id: payload.client_context_id,
                    status: payload.status,
                    metrics: payload.metrics,
                    errors: payload.errors.unwrap_or_default(),
                    warnings: payload.warnings.unwrap_or_default(),
                },
            });
        }

        let errors = payload.errors.unwrap_or_default();
        let kind = classify_query_errors(&errors, response.status, &response.body);
        if kind == ErrorKind::PreparedStatementFailure && !request.adhoc && !repair_attempted {
            // Stale server-side name: forget ours and prepare again.
            cache.evict(&request.statement);
            repair_attempted = true;
            continue;
        }
        if let Some(first) = errors.first() {
            context.http_body =
                format!("code={} msg={}", first.code, first.message);
        }
        return Err(ShoalError::new(kind).set_http_context(context));
    }
}

fn classify_query_errors(errors: &[QueryProblem], http_status: u16, body: &[u8]) -> ErrorKind {
    if let Some(kind) = crate::http::limit_error_kind(http_status, body) {
        return kind;
    }
    for error in errors {
        let kind = match error.code {
            1065 => Some(ErrorKind::InvalidArgument),
            1080 => Some(ErrorKind::UnambiguousTimeout),
            3000 => Some(ErrorKind::ParsingFailure),
            3230 => Some(ErrorKind::FeatureNotAvailable),
            4040 | 4050 | 4060 | 4070 | 4080 | 4090 => {
                Some(ErrorKind::PreparedStatementFailure)
            }
            4300 => Some(ErrorKind::IndexExists),
            // "Internal Error": only the message says what actually happened.
            5000 if error.message.contains(" already exists") => Some(ErrorKind::IndexExists),
            5000 if error.message.contains("not found.") => Some(ErrorKind::IndexNotFound),
            5000 if error.message.contains("Bucket Not Found") => {
                Some(ErrorKind::BucketNotFound)
            }
            5000
                if error.message.contains(
                    "Limit for number of indexes that can be created per scope has been reached",
                ) =>
            {
                Some(ErrorKind::QuotaLimited)
            }
            12003 => Some(ErrorKind::BucketNotFound),
            12004 | 12016 => Some(ErrorKind::IndexNotFound),
            12009 => {
                if error.message.contains("CAS mismatch") {
                    Some(ErrorKind::CasMismatch)
                } else {
                    match error.reason {
                        Some(12033) => Some(ErrorKind::CasMismatch),
                        Some(17014) => Some(ErrorKind::DocumentNotFound),
                        Some(17012) => Some(ErrorKind::DocumentExists),
                        _ => Some(ErrorKind::DmlFailure),
                    }
                }
            }
            1191 | 1192 | 1193 | 1194 => Some(ErrorKind::RateLimited),
            13014 => Some(ErrorKind::AuthenticationFailure),
            code if (12000..13000).contains(&code) || (14000..15000).contains(&code) => {
                Some(ErrorKind::IndexFailure)
            }
            code if (4000..5000).contains(&code) => Some(ErrorKind::PlanningFailure),
            _ => None,
        };
        if let Some(kind) = kind {
            return kind;
        }
    }
    if http_status == 401 {
        return ErrorKind::AuthenticationFailure;
    }
    ErrorKind::InternalServerFailure
}
