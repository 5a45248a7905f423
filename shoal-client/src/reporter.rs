//! Orphan and slow-operation reporting.
//!
//! Two periodic emitters share one mechanism: completed spans are converted
//! into [`SpanRecord`]s, ranked by total duration in bounded queues
//! (top-N with a dropped counter), and flushed to the log on an interval.
//! Orphaned responses get their own KV-only report; operations that finish
//! but exceed the per-service threshold land in the per-service report.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{OrphanOptions, ThresholdOptions};
use crate::fixed_queue::ConcurrentFixedQueue;
use crate::metrics::recorded;
use crate::service::ServiceType;
use crate::tracer::{attributes, RequestSpan, RequestTracer};

/// Everything worth reporting about one finished span.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub connection_id: String,
    pub operation_id: String,
    pub last_remote_socket: String,
    pub last_local_socket: String,
    pub total_duration: Duration,
    pub last_server_duration_us: u64,
    pub total_server_duration_us: u64,
    pub operation_name: String,
    pub service: Option<ServiceType>,
}

impl SpanRecord {
    fn to_json(&self) -> serde_json::Value {
        let mut entry = json!({
            "operation_name": self.operation_name,
            "total_duration_us": self.total_duration.as_micros() as u64,
        });
        if self.service == Some(ServiceType::KeyValue) {
            entry["last_server_duration_us"] = json!(self.last_server_duration_us);
            entry["total_server_duration_us"] = json!(self.total_server_duration_us);
        }
        if !self.operation_id.is_empty() {
            entry["operation_id"] = json!(self.operation_id);
        }
        if !self.connection_id.is_empty() {
            entry["last_local_id"] = json!(self.connection_id);
        }
        if !self.last_local_socket.is_empty() {
            entry["last_local_socket"] = json!(self.last_local_socket);
        }
        if !self.last_remote_socket.is_empty() {
            entry["last_remote_socket"] = json!(self.last_remote_socket);
        }
        entry
    }
}

impl PartialEq for SpanRecord {
    fn eq(&self, other: &Self) -> bool {
        self.total_duration == other.total_duration
    }
}

impl Eq for SpanRecord {}

impl PartialOrd for SpanRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpanRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_duration.cmp(&other.total_duration)
    }
}

/// Collects spans whose response arrived after the caller had given up.
/// KV-only; extending to HTTP services would mirror the threshold
/// reporter's per-service queues.
#[derive(Debug)]
pub struct OrphanReporter {
    options: OrphanOptions,
    queue: ConcurrentFixedQueue<SpanRecord>,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl OrphanReporter {
    pub fn new(options: OrphanOptions) -> Arc<OrphanReporter> {
        Arc::new(OrphanReporter {
            queue: ConcurrentFixedQueue::new(options.sample_size),
            options,
            emitter: Mutex::new(None),
        })
    }

    /// Begin periodic emission. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.options.emit_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(reporter) = weak.upgrade() else { return };
                reporter.emit();
            }
        });
        *self.emitter.lock() = Some(task);
    }

    pub fn add_orphan(&self, record: SpanRecord) {
        counter!(recorded::ORPHANED_RESPONSES, "service" => "kv").increment(1);
        self.queue.push(record);
    }

    /// Drain the queue into the report document, or `None` when empty.
    pub fn flush_and_create_output(&self) -> Option<String> {
        if self.queue.is_empty() {
            return None;
        }
        let (records, dropped) = self.queue.steal_data();
        let total_count = records.len() + dropped;
        let entries: Vec<_> = records.iter().map(SpanRecord::to_json).collect();
        let report = json!({
            "kv": {
                "total_count": total_count,
                "top_requests": entries,
            }
        });
        Some(report.to_string())
    }

    fn emit(&self) {
        if let Some(report) = self.flush_and_create_output() {
            warn!("orphan responses observed: {report}");
        }
    }

    /// Stop the emitter and flush once more.
    pub fn close(&self) {
        if let Some(task) = self.emitter.lock().take() {
            task.abort();
        }
        self.emit();
    }
}

impl Drop for OrphanReporter {
    fn drop(&mut self) {
        if let Some(task) = self.emitter.lock().take() {
            task.abort();
        }
        if let Some(report) = self.flush_and_create_output() {
            warn!("orphan responses observed: {report}");
        }
    }
}

/// Collects spans slower than their service's threshold, one queue per
/// service.
#[derive(Debug)]
pub struct ThresholdReporter {
    options: ThresholdOptions,
    queues: HashMap<ServiceType, ConcurrentFixedQueue<SpanRecord>>,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl ThresholdReporter {
    pub fn new(options: ThresholdOptions) -> Arc<ThresholdReporter> {
        let mut queues = HashMap::new();
        for service in [
            ServiceType::KeyValue,
            ServiceType::Query,
            ServiceType::Views,
            ServiceType::Search,
            ServiceType::Analytics,
            ServiceType::Eventing,
            ServiceType::Management,
        ] {
            queues.insert(service, ConcurrentFixedQueue::new(options.sample_size));
        }
        Arc::new(ThresholdReporter {
            options,
            queues,
            emitter: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.options.emit_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(reporter) = weak.upgrade() else { return };
                reporter.emit();
            }
        });
        *self.emitter.lock() = Some(task);
    }

    /// Enqueue `record` if it crossed its service's threshold.
    pub fn check_threshold(&self, record: SpanRecord) {
        let Some(service) = record.service else { return };
        if record.total_duration <= self.options.threshold_for(service) {
            return;
        }
        if let Some(queue) = self.queues.get(&service) {
            queue.push(record);
        }
    }

    /// Reports for every non-empty queue.
    pub fn flush_and_create_output(&self) -> Vec<String> {
        let mut reports = Vec::new();
        for (service, queue) in &self.queues {
            if queue.is_empty() {
                continue;
            }
            let (records, dropped) = queue.steal_data();
            let entries: Vec<_> = records.iter().map(SpanRecord::to_json).collect();
            let report = json!({
                "service": service.as_str(),
                "total_count": records.len() + dropped,
                "top": entries,
            });
            reports.push(report.to_string());
        }
        reports
    }

    fn emit(&self) {
        for report in self.flush_and_create_output() {
            warn!("operations over threshold: {report}");
        }
    }

    pub fn close(&self) {
        if let Some(task) = self.emitter.lock().take() {
            task.abort();
        }
        self.emit();
    }
}

impl Drop for ThresholdReporter {
    fn drop(&mut self) {
        if let Some(task) = self.emitter.lock().take() {
            task.abort();
        }
        for report in self.flush_and_create_output() {
            warn!("operations over threshold: {report}");
        }
    }
}

/// The bundled tracer: spans feed the orphan and threshold reporters.
#[derive(Debug)]
pub struct ThresholdLoggingTracer {
    orphans: Arc<OrphanReporter>,
    thresholds: Arc<ThresholdReporter>,
    self_ref: std::sync::Weak<ThresholdLoggingTracer>,
}

impl ThresholdLoggingTracer {
    pub fn new(orphan: OrphanOptions, threshold: ThresholdOptions) -> Arc<ThresholdLoggingTracer> {
        Arc::new_cyclic(|weak| ThresholdLoggingTracer {
            orphans: OrphanReporter::new(orphan),
            thresholds: ThresholdReporter::new(threshold),
            self_ref: weak.clone(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.orphans.start();
        self.thresholds.start();
    }

    pub fn close(&self) {
        self.orphans.close();
        self.thresholds.close();
    }

    pub fn orphan_reporter(&self) -> &Arc<OrphanReporter> {
        &self.orphans
    }

    fn report(&self, record: SpanRecord, orphan: bool) {
        if orphan {
            // Orphan reporting covers KV only.
            if record.service == Some(ServiceType::KeyValue) {
                self.orphans.add_orphan(record);
            }
            return;
        }
        self.thresholds.check_threshold(record);
    }
}

impl RequestTracer for ThresholdLoggingTracer {
    fn start_span(&self, operation_name: &'static str) -> Box<dyn RequestSpan> {
        Box::new(ThresholdSpan {
            tracer: self.self_ref.clone(),
            start: Instant::now(),
            operation_name,
            string_tags: HashMap::new(),
            last_server_duration_us: 0,
            total_server_duration_us: 0,
        })
    }
}

struct ThresholdSpan {
    tracer: std::sync::Weak<ThresholdLoggingTracer>,
    start: Instant,
    operation_name: &'static str,
    string_tags: HashMap<&'static str, String>,
    last_server_duration_us: u64,
    total_server_duration_us: u64,
}

impl RequestSpan for ThresholdSpan {
    fn add_tag_str(&mut self, name: &'static str, value: &str) {
        // First writer wins, matching the write-once tag contract.
        self.string_tags
            .entry(name)
            .or_insert_with(|| value.to_string());
    }

    fn add_tag_u64(&mut self, name: &'static str, value: u64) {
        if name == attributes::SERVER_DURATION {
            self.last_server_duration_us = value;
            self.total_server_duration_us += value;
        }
    }

    fn end(self: Box<Self>) {
        let service = match self.string_tags.get(attributes::SERVICE).map(String::as_str) {
            Some("kv") => Some(ServiceType::KeyValue),
            Some("query") => Some(ServiceType::Query),
            Some("search") => Some(ServiceType::Search),
            Some("analytics") => Some(ServiceType::Analytics),
            Some("views") => Some(ServiceType::Views),
            Some("eventing") => Some(ServiceType::Eventing),
            Some("mgmt") => Some(ServiceType::Management),
            _ => None,
        };
        let orphan = self.string_tags.contains_key(attributes::ORPHAN);
        let tag = |name: &'static str| self.string_tags.get(name).cloned().unwrap_or_default();
        let record = SpanRecord {
            connection_id: tag(attributes::LOCAL_ID),
            operation_id: tag(attributes::OPERATION_ID),
            last_remote_socket: tag(attributes::REMOTE_SOCKET),
            last_local_socket: tag(attributes::LOCAL_SOCKET),
            total_duration: self.start.elapsed(),
            last_server_duration_us: self.last_server_duration_us,
            total_server_duration_us: self.total_server_duration_us,
            operation_name: self.operation_name.to_string(),
            service,
        };
        if let Some(tracer) = self.tracer.upgrade() {
            tracer.report(record, orphan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, duration_us: u64) -> SpanRecord {
        SpanRecord {
            connection_id: format!("conn-{name}"),
            operation_id: format!("0x{duration_us:x}"),
            last_remote_socket: "10.0.0.1:11210".into(),
            last_local_socket: "10.0.0.9:50000".into(),
            total_duration: Duration::from_micros(duration_us),
            last_server_duration_us: duration_us / 10,
            total_server_duration_us: duration_us / 5,
            operation_name: name.into(),
            service: Some(ServiceType::KeyValue),
        }
    }

    #[test]
    fn orphan_report_shape_and_bound() {
        let reporter = OrphanReporter::new(OrphanOptions {
            emit_interval: Duration::from_secs(10),
            sample_size: 4,
        });
        assert!(reporter.flush_and_create_output().is_none());

        for (name, duration) in [
            ("upsert", 200),
            ("get", 100),
            ("replace", 400),
            ("remove", 300),
            ("unlock", 600),
            ("insert", 500),
        ] {
            reporter.add_orphan(record(name, duration));
        }

        let output = reporter.flush_and_create_output().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(doc["kv"]["total_count"], 6);
        let top = doc["kv"]["top_requests"].as_array().unwrap();
        assert_eq!(top.len(), 4);
        let durations: Vec<u64> = top
            .iter()
            .map(|e| e["total_duration_us"].as_u64().unwrap())
            .collect();
        assert_eq!(durations, vec![600, 500, 400, 300]);
        assert_eq!(top[0]["operation_name"], "unlock");
        assert_eq!(top[0]["last_local_id"], "conn-unlock");

        // Stolen queue starts over.
        assert!(reporter.flush_and_create_output().is_none());
    }

    #[test]
    fn threshold_reporter_filters_fast_operations() {
        let mut options = ThresholdOptions::default();
        options.key_value_threshold = Duration::from_micros(250);
        let reporter = ThresholdReporter::new(options);

        reporter.check_threshold(record("get", 100));
        reporter.check_threshold(record("upsert", 400));
        reporter.check_threshold(record("remove", 300));

        let reports = reporter.flush_and_create_output();
        assert_eq!(reports.len(), 1);
        let doc: serde_json::Value = serde_json::from_str(&reports[0]).unwrap();
        assert_eq!(doc["service"], "kv");
        assert_eq!(doc["total_count"], 2);
        assert_eq!(doc["top"][0]["operation_name"], "upsert");
    }

    #[test]
    fn span_without_service_is_not_reported() {
        let mut no_service = record("get", 10_000);
        no_service.service = None;
        let reporter = ThresholdReporter::new(ThresholdOptions::default());
        reporter.check_threshold(no_service);
        assert!(reporter.flush_and_create_output().is_empty());
    }

    #[tokio::test]
    async fn tracer_routes_orphans_and_slow_spans() {
        let mut threshold = ThresholdOptions::default();
        threshold.key_value_threshold = Duration::from_micros(0);
        let tracer = ThresholdLoggingTracer::new(OrphanOptions::default(), threshold);

        // A slow, completed span lands in the threshold queues.
        let mut span = tracer.start_span("get");
        span.add_tag_str(attributes::SERVICE, "kv");
        span.add_tag_u64(attributes::SERVER_DURATION, 11);
        span.add_tag_u64(attributes::SERVER_DURATION, 31);
        span.end();
        let reports = tracer.thresholds.flush_and_create_output();
        assert_eq!(reports.len(), 1);
        let doc: serde_json::Value = serde_json::from_str(&reports[0]).unwrap();
        assert_eq!(doc["top"][0]["last_server_duration_us"], 31);
        assert_eq!(doc["top"][0]["total_server_duration_us"], 42);

        // An orphaned span lands in the orphan queue instead.
        let mut span = tracer.start_span("upsert");
        span.add_tag_str(attributes::SERVICE, "kv");
        span.add_tag_str(attributes::ORPHAN, "aborted");
        span.end();
        assert!(tracer.thresholds.flush_and_create_output().is_empty());
        assert!(tracer.orphans.flush_and_create_output().is_some());
    }
}
