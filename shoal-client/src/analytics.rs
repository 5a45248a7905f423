//! Analytics service: request-body construction and response envelope
//! parsing. A subset of the query options applies; the service additionally
//! honours a priority header.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use shoal_errors::{ErrorKind, HttpErrorContext, ShoalError, ShoalResult};
use uuid::Uuid;

use crate::http::pool::HttpSessionPool;
use crate::http::HttpRequest;
use crate::query::QueryProblem;
use crate::service::ServiceType;

/// Header the service reads to deprioritize or prioritize a request.
const PRIORITY_HEADER: &str = "analytics-priority";

#[derive(Debug, Clone)]
pub struct AnalyticsRequest {
    pub statement: String,
    pub client_context_id: String,
    pub readonly: bool,
    /// Run ahead of normal requests.
    pub priority: bool,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: HashMap<String, Value>,
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub timeout: Option<Duration>,
    pub raw: HashMap<String, Value>,
}

impl AnalyticsRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        AnalyticsRequest {
            statement: statement.into(),
            client_context_id: Uuid::new_v4().to_string(),
            readonly: false,
            priority: false,
            positional_parameters: Vec::new(),
            named_parameters: HashMap::new(),
            bucket_name: None,
            scope_name: None,
            timeout: None,
            raw: HashMap::new(),
        }
    }

    fn encode_body(&self, default_timeout: Duration) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("statement".into(), json!(self.statement));
        body.insert("client_context_id".into(), json!(self.client_context_id));
        let timeout = self.timeout.unwrap_or(default_timeout);
        body.insert("timeout".into(), json!(format!("{}ms", timeout.as_millis())));
        if self.readonly {
            body.insert("readonly".into(), json!(true));
        }
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
            body.insert(
                "args".into(),
                Value::Array(self.positional_parameters.clone()),
            );
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
struct AnalyticsPayload {
    #[serde(rename = "requestID", default)]
    request_id: String,
    #[serde(rename = "clientContextID", default)]
    client_context_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Option<Vec<QueryProblem>>,
    #[serde(default)]
    results: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsResponse {
    pub rows: Vec<Value>,
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub errors: Vec<QueryProblem>,
}

pub(crate) async fn execute_analytics(
    pool: &HttpSessionPool,
    request: AnalyticsRequest,
) -> ShoalResult<AnalyticsResponse> {
    let default_timeout = pool.default_timeout(ServiceType::Analytics);
    let body = serde_json::to_vec(&request.encode_body(default_timeout))
        .map_err(|e| ShoalError::with_source(ErrorKind::InvalidArgument, e))?;

    let mut http_request = HttpRequest::new(ServiceType::Analytics, "POST", "/analytics/service")
        .json(body);
    if request.priority {
        http_request = http_request.header(PRIORITY_HEADER, "-1");
    }
    http_request.timeout = Some(request.timeout.unwrap_or(default_timeout));
    http_request.client_context_id = Some(request.client_context_id.clone());

    let response = pool.execute(http_request).await?;
    let context = HttpErrorContext {
        client_context_id: request.client_context_id.clone(),
        method: "POST".into(),
        path: "/analytics/service".into(),
        http_status: response.status,
        http_body: String::from_utf8_lossy(&response.body).into_owned(),
        ..Default::default()
    };

    let payload: AnalyticsPayload = serde_json::from_slice(&response.body).map_err(|e| {
        ShoalError::with_message(ErrorKind::ParsingFailure, e.to_string())
            .set_http_context(context.clone())
    })?;

    if payload.status != "success" {
        let errors = payload.errors.unwrap_or_default();
        let kind = classify_analytics_errors(&errors);
        return Err(ShoalError::new(kind).set_http_context(context));
    }

    Ok(AnalyticsResponse {
        rows: payload.results.unwrap_or_default(),
        request_id: payload.request_id,
        client_context_id: payload.client_context_id,
        status: payload.status,
        errors: payload.errors.unwrap_or_default(),
    })
}

fn classify_analytics_errors(errors: &[QueryProblem]) -> ErrorKind {
    for error in errors {
        let kind = match error.code {
            21002 => Some(ErrorKind::UnambiguousTimeout),
            20000 => Some(ErrorKind::AuthenticationFailure),
            23000 | 23003 => Some(ErrorKind::TemporaryFailure),
            23007 => Some(ErrorKind::JobQueueFull),
            24000 => Some(ErrorKind::ParsingFailure),
            24006 => Some(ErrorKind::LinkNotFound),
            24025 | 24044 | 24045 => Some(ErrorKind::DatasetNotFound),
            24034 => Some(ErrorKind::DataverseNotFound),
            24039 => Some(ErrorKind::DataverseExists),
            24040 => Some(ErrorKind::DatasetExists),
            24047 => Some(ErrorKind::IndexNotFound),
            24048 => Some(ErrorKind::IndexExists),
            code if (24000..25000).contains(&code) => Some(ErrorKind::CompilationFailure),
            25000 | 25001 => Some(ErrorKind::InternalServerFailure),
            _ => None,
        };
        if let Some(kind) = kind {
            return kind;
        }
    }
    ErrorKind::InternalServerFailure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_statement_and_context() {
        let mut request = AnalyticsRequest::new("SELECT VALUE 1");
        request.readonly = true;
        request.bucket_name = Some("travel".into());
        request.scope_name = Some("inventory".into());
        let body = request.encode_body(Duration::from_secs(75));
        assert_eq!(body["statement"], "SELECT VALUE 1");
        assert_eq!(body["readonly"], true);
        assert_eq!(body["query_context"], "default:`travel`.`inventory`");
        assert_eq!(body["timeout"], "75000ms");
    }

    #[test]
    fn error_classification() {
        let classify = |code: u64| {
            classify_analytics_errors(&[QueryProblem {
                code,
                message: String::new(),
                reason: None,
            }])
        };
        assert_eq!(classify(23007), ErrorKind::JobQueueFull);
        assert_eq!(classify(24034), ErrorKind::DataverseNotFound);
        assert_eq!(classify(24040), ErrorKind::DatasetExists);
        assert_eq!(classify(24999), ErrorKind::CompilationFailure);
        assert_eq!(classify(25000), ErrorKind::InternalServerFailure);
        assert_eq!(classify(20000), ErrorKind::AuthenticationFailure);
    }
}
