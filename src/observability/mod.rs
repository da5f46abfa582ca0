//! Observability: structured logging, connectivity metrics and the health
//! endpoint.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ConnectivityMetrics, ConnectivitySnapshot};

// Span macros for structured logging
pub use logging::{connection_span, lifecycle_span, recovery_span};
