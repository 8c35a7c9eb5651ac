//! Metrics infrastructure.
//!
//! - `events`: the `InternalEvent` trait implemented by every emitted event
//! - `server`: Prometheus recorder and its HTTP endpoint

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit an internal event, recording its metrics.
///
/// ```ignore
/// emit!(DeadLetterPublished { topic: "webhook-events-dlq".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
