//! Metric names recorded through the `metrics` facade. The facade's global
//! recorder defaults to a no-op; installing an exporter is the embedder's
//! choice.

/// Documenting constants for all metrics recorded by this crate.
pub mod recorded {
    /// Histogram. Observed end-to-end latency of one operation attempt, in
    /// microseconds, labelled by `service` and `operation`.
    pub const OPERATION_DURATION_US: &str = "shoal_client_operation_duration_us";

    /// Counter. Retries scheduled by the dispatcher, labelled by `reason`.
    pub const OPERATION_RETRIES: &str = "shoal_client_operation_retries";

    /// Counter. Orphaned responses observed, labelled by `service`.
    pub const ORPHANED_RESPONSES: &str = "shoal_client_orphaned_responses";
}
