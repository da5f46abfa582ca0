//! Error taxonomy for the connection supervisor
//!
//! Every failure a caller can observe from [`crate::supervisor::ConnectionSupervisor`]
//! is a [`SupervisorError`]. Component-level errors live next to their component
//! and are wrapped here.

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::exchange::ExchangeError;
use crate::tls::SecurityConfigError;
use crate::transport::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Why a single connect attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("broker transport failure: {0}")]
    Broker(#[from] BrokerError),

    #[error("exchange initialization failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("credential lookup failed: {0}")]
    Credentials(#[from] CredentialError),
}

/// Main error type returned by supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Bad TLS material. Never retried.
    #[error("TLS configuration error: {0}")]
    SecurityConfig(#[from] SecurityConfigError),

    /// Failed to initialize the connection or channel to the broker
    #[error("Failed to connect to broker after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Shutdown in progress, connect request rejected")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),
}

impl SupervisorError {
    /// Wrap the failure of the last attempt into the caller-facing error
    pub fn connect_failed(attempts: u32, source: AttemptError) -> Self {
        Self::ConnectFailed { attempts, source }
    }

    /// True when repeating the whole connect cycle could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::ConnectFailed { .. }
                | SupervisorError::Exchange(_)
                | SupervisorError::Credentials(_)
        )
    }

    /// Error text safe for logs and operator output
    pub fn sanitized_message(&self) -> String {
        sanitize_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|pass|token|secret)[=:]\s*\S+")
        .expect("secret redaction pattern is valid")
});

static URI_USERINFO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(amqps?://)[^@/\s]+@").expect("userinfo redaction pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Remove credentials from text that may end up in logs
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URI_USERINFO_PATTERN
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;
