//! hookrelay-core: ambient plumbing shared by the hookrelay binaries.
//!
//! - `config/` - YAML loading with environment variable interpolation
//! - `metrics/` - Prometheus recorder, HTTP endpoint and the `emit!` macro
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization
//! - `error` - Error types for the above

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod tracing;

pub use config::{MetricsConfig, interpolate, load_yaml, parse_yaml};
pub use error::{ConfigError, MetricsError};
pub use self::metrics::{DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics};
pub use signal::{shutdown_signal, spawn_shutdown_handler};
pub use self::tracing::init_tracing;
