//! Client bindings for the Shoal document database.
//!
//! This crate is the connection-management and request-dispatch core: it
//! models the cluster topology, speaks the binary key-value protocol over
//! per-node sessions, pools keep-alive HTTP connections for the query,
//! search, analytics, view and management services, classifies transient
//! failures for retry, and feeds an orphan/threshold reporting pipeline.
//!
//! The entry point is [`cluster::Cluster`]:
//!
//! ```no_run
//! use shoal_client::cluster::Cluster;
//! use shoal_client::config::{ClusterOptions, Credentials};
//! use shoal_client::kv::operations::{KvOperation, KvRequest};
//! use shoal_client::kv::DocumentId;
//!
//! # async fn run() -> shoal_errors::ShoalResult<()> {
//! let mut options = ClusterOptions::default();
//! options.seed_hosts = vec!["db1.example".into()];
//! options.credentials = Credentials {
//!     username: "app".into(),
//!     password: "secret".into(),
//! };
//! let cluster = Cluster::connect(options).await?;
//! cluster.open_bucket("default").await?;
//!
//! let id = DocumentId::in_default_collection("default", "foo")?;
//! let response = cluster
//!     .execute(KvRequest::new(
//!         id,
//!         KvOperation::Upsert {
//!             value: br#"{"a":1}"#.to_vec(),
//!             flags: 0,
//!             expiry: 0,
//!             preserve_expiry: false,
//!         },
//!     ))
//!     .await?;
//! assert_ne!(response.cas, 0);
//! cluster.close().await;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod cluster;
pub mod config;
pub mod diag;
pub mod fixed_queue;
pub mod http;
pub mod kv;
pub mod metrics;
pub mod prepared;
pub mod protocol;
pub mod query;
pub mod reporter;
pub mod retry;
pub mod service;
pub mod topology;
pub mod tracer;

mod stream;

pub use shoal_errors::{
    ErrorContext, ErrorKind, HttpErrorContext, KeyValueErrorContext, RetryReason, ShoalError,
    ShoalResult,
};

/// Identity string sent in HELLO and HTTP `User-Agent` headers and embedded
/// in diagnostics reports.
pub fn sdk_id() -> String {
    format!("shoal-rust/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    #[test]
    fn sdk_id_carries_crate_version() {
        assert!(super::sdk_id().starts_with("shoal-rust/"));
    }
}
