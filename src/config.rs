//! Configuration for the connection supervisor
//!
//! Loaded from a TOML file, every table optional. `validate()` runs before the
//! supervisor is constructed so that no network call can happen with an
//! invalid configuration.

use crate::credentials::{Credentials, PropertyNames};
use crate::exchange::ExchangeSpec;
use crate::transport::amqp::connection::{
    redact_uri, DEFAULT_AMQPS_PORT, DEFAULT_AMQP_PORT,
};
use crate::transport::{Address, BrokerEndpoint, ConnectPlan, RecoverySettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const REDACTED: &str = "***";

/// Main supervisor configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub observability: ObservabilitySection,
}

/// Broker endpoint: `hosts` or `uri`, never both
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `host[:port]` entries tried in order
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Full connection URI; overrides hosts, credentials and virtual host
    pub uri: Option<String>,
    pub virtual_host: Option<String>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    pub heartbeat_secs: Option<u16>,
    pub frame_max: Option<u32>,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            uri: None,
            virtual_host: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            heartbeat_secs: None,
            frame_max: None,
            connection_name: default_connection_name(),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_connection_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

/// Static credentials plus the optional external property source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CredentialsSection {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Name of the property group holding rotated credentials
    #[serde(default)]
    pub app_config_name: String,
    #[serde(default)]
    pub user_property: String,
    #[serde(default)]
    pub password_property: String,
    /// TOML file backing the property source; environment variables otherwise
    pub property_file: Option<PathBuf>,
}

impl CredentialsSection {
    pub fn static_credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn property_names(&self) -> PropertyNames {
        PropertyNames::new(
            self.app_config_name.clone(),
            self.user_property.clone(),
            self.password_property.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeSection {
    /// Empty means the broker's default exchange
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_exchange_kind")]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_true")]
    pub auto_delete: bool,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: default_exchange_kind(),
            durable: false,
            auto_delete: true,
        }
    }
}

fn default_exchange_kind() -> String {
    "direct".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tls_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub key_store: StoreSection,
    #[serde(default)]
    pub trust_store: StoreSection,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: default_tls_protocol(),
            key_store: StoreSection::default(),
            trust_store: StoreSection::default(),
        }
    }
}

fn default_tls_protocol() -> String {
    "TLSv1.2".to_string()
}

/// Key or trust material on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreSection {
    /// PKCS12 or PEM; unset takes the default for the store's role
    pub store_type: Option<String>,
    /// Key/trust manager algorithm; unset means PKIX
    pub algorithm: Option<String>,
    pub path: Option<PathBuf>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recovery_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_recovery_interval_ms(),
        }
    }
}

fn default_recovery_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObservabilitySection {
    /// Port for the HTTP health server; unset disables it
    pub health_port: Option<u16>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SupervisorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field rule.
    ///
    /// Returns the names of fields that are set but ignored because a URI is
    /// configured, so the caller can warn about them.
    pub fn validate(&self) -> Result<Vec<&'static str>, ConfigError> {
        self.endpoint()?;

        self.credentials
            .property_names()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        if self.tls.enabled {
            if self.tls.key_store.path.is_none() {
                return Err(invalid("tls.key_store.path is required when TLS is enabled"));
            }
            if self.tls.key_store.password.as_deref().unwrap_or("").is_empty() {
                return Err(invalid(
                    "tls.key_store.password is required when TLS is enabled",
                ));
            }
            if self.tls.trust_store.path.is_none() {
                return Err(invalid(
                    "tls.trust_store.path is required when TLS is enabled",
                ));
            }
        }

        if self.recovery.enabled && self.recovery.interval_ms == 0 {
            return Err(invalid(
                "recovery.interval_ms must be greater than 0 when recovery is enabled",
            ));
        }

        if self.exchange.kind.trim().is_empty() {
            return Err(invalid("exchange.kind must not be empty"));
        }

        Ok(self.ignored_with_uri())
    }

    /// Fields that a configured URI makes meaningless
    pub fn ignored_with_uri(&self) -> Vec<&'static str> {
        if self.broker.uri.is_none() {
            return Vec::new();
        }

        let mut ignored = Vec::new();
        if !self.broker.hosts.is_empty() {
            ignored.push("broker.hosts");
        }
        if !self.credentials.username.is_empty() {
            ignored.push("credentials.username");
        }
        if !self.credentials.password.is_empty() {
            ignored.push("credentials.password");
        }
        if self.broker.virtual_host.is_some() {
            ignored.push("broker.virtual_host");
        }
        ignored
    }

    /// Resolve the broker endpoint, filling in default ports
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        if let Some(uri) = &self.broker.uri {
            let parsed = url::Url::parse(uri)
                .map_err(|e| invalid(&format!("broker.uri '{}' is invalid: {e}", redact_uri(uri))))?;
            if parsed.scheme() != "amqp" && parsed.scheme() != "amqps" {
                return Err(invalid(&format!(
                    "broker.uri scheme must be amqp or amqps, got '{}'",
                    parsed.scheme()
                )));
            }
            // The client only wraps amqps connections in TLS
            if self.tls.enabled && parsed.scheme() == "amqp" {
                return Err(invalid(
                    "broker.uri must use the amqps scheme when tls.enabled is true",
                ));
            }
            return Ok(BrokerEndpoint::Uri(uri.clone()));
        }

        let default_port = if self.tls.enabled {
            DEFAULT_AMQPS_PORT
        } else {
            DEFAULT_AMQP_PORT
        };

        if self.broker.hosts.is_empty() {
            return Ok(BrokerEndpoint::Addresses(vec![Address::new(
                "localhost",
                default_port,
            )]));
        }

        let addresses = self
            .broker
            .hosts
            .iter()
            .map(|entry| Address::parse(entry, default_port))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(&format!("broker.hosts: {e}")))?;

        Ok(BrokerEndpoint::Addresses(addresses))
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        RecoverySettings {
            enabled: self.recovery.enabled,
            interval: Duration::from_millis(self.recovery.interval_ms),
        }
    }

    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.name.clone(),
            kind: self.exchange.kind.clone(),
            durable: self.exchange.durable,
            auto_delete: self.exchange.auto_delete,
        }
    }

    /// Connect plan without credentials or TLS, which are resolved per attempt
    pub fn base_plan(&self) -> Result<ConnectPlan, ConfigError> {
        let mut plan = ConnectPlan::for_endpoint(self.endpoint()?);
        plan.virtual_host = self.broker.virtual_host.clone();
        plan.recovery = self.recovery_settings();
        plan.connection_timeout = Duration::from_millis(self.broker.connection_timeout_ms);
        plan.heartbeat_secs = self.broker.heartbeat_secs;
        plan.frame_max = self.broker.frame_max;
        plan.connection_name = self.broker.connection_name.clone();
        Ok(plan)
    }

    /// Copy with every secret masked, safe to print or log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.broker.uri = copy.broker.uri.as_deref().map(redact_uri);
        if !copy.credentials.password.is_empty() {
            copy.credentials.password = REDACTED.to_string();
        }
        for store in [&mut copy.tls.key_store, &mut copy.tls.trust_store] {
            if store.password.as_deref().is_some_and(|p| !p.is_empty()) {
                store.password = Some(REDACTED.to_string());
            }
        }
        copy
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
hosts = ["h1:5672", "h2:5673"]

[exchange]
name = "events"
kind = "topic"

[recovery]
enabled = true
interval_ms = 50
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}
