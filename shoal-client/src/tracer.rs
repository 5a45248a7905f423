//! Request-tracing seam.
//!
//! The dispatcher talks to a [`RequestTracer`]; the default is a no-op, and
//! the bundled [`ThresholdLoggingTracer`](crate::reporter::ThresholdLoggingTracer)
//! turns finished spans into orphan and slow-operation reports. External
//! tracing systems can plug in the same way.

use std::fmt::Debug;

/// Tag names the dispatcher sets on every span.
pub mod attributes {
    pub const SERVICE: &str = "db.service";
    pub const INSTANCE: &str = "db.instance";
    pub const OPERATION_ID: &str = "db.operation_id";
    pub const LOCAL_SOCKET: &str = "net.local_socket";
    pub const REMOTE_SOCKET: &str = "net.remote_socket";
    pub const LOCAL_ID: &str = "db.local_id";
    pub const SERVER_DURATION: &str = "db.server_duration_us";
    pub const ORPHAN: &str = "db.orphan";
}

/// One in-flight operation's span. Tags are write-once per name, except
/// [`attributes::SERVER_DURATION`] which may be recorded once per attempt.
pub trait RequestSpan: Send {
    fn add_tag_str(&mut self, name: &'static str, value: &str);
    fn add_tag_u64(&mut self, name: &'static str, value: u64);
    /// Close the span; ownership moves to the tracer.
    fn end(self: Box<Self>);
}

/// Span factory, installed once at cluster open.
pub trait RequestTracer: Send + Sync + Debug {
    fn start_span(&self, operation_name: &'static str) -> Box<dyn RequestSpan>;
}

/// The default tracer: spans cost nothing and go nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

struct NoopSpan;

impl RequestSpan for NoopSpan {
    fn add_tag_str(&mut self, _name: &'static str, _value: &str) {}
    fn add_tag_u64(&mut self, _name: &'static str, _value: u64) {}
    fn end(self: Box<Self>) {}
}

impl RequestTracer for NoopTracer {
    fn start_span(&self, _operation_name: &'static str) -> Box<dyn RequestSpan> {
        Box::new(NoopSpan)
    }
}
