//! Credential resolution with rotation support
//!
//! Static credentials come from configuration. An optional external property
//! source, addressed by an app config name and two property names, overrides
//! them and is re-read on every connect attempt so rotated passwords are
//! picked up without a restart.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Username/password pair. Empty fields mean "client default".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// Where rotated credentials live: all three names set, or none
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyNames {
    pub app_config_name: String,
    pub user_property: String,
    pub password_property: String,
}

impl PropertyNames {
    pub fn new(
        app_config_name: impl Into<String>,
        user_property: impl Into<String>,
        password_property: impl Into<String>,
    ) -> Self {
        Self {
            app_config_name: app_config_name.into(),
            user_property: user_property.into(),
            password_property: password_property.into(),
        }
    }

    /// True when an external property source should be consulted
    pub fn is_configured(&self) -> bool {
        !self.app_config_name.is_empty()
    }

    /// The three names are mutually dependent
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("credentials.app_config_name", &self.app_config_name),
            ("credentials.user_property", &self.user_property),
            ("credentials.password_property", &self.password_property),
        ];

        let set: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if set.is_empty() || set.len() == fields.len() {
            return Ok(());
        }

        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| *name)
            .collect();

        Err(format!(
            "{} set without {}; all three must be set together",
            set.join(", "),
            missing.join(", ")
        ))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CredentialError {
    #[error("property source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("property '{property}' is missing or blank in app config '{app_config}'")]
    MissingProperty { app_config: String, property: String },
}

/// External store of named property groups
pub trait PropertySource: Send + Sync {
    /// Current value of `property` in group `app_config`, if present
    fn lookup(&self, app_config: &str, property: &str) -> Result<Option<String>, CredentialError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Property groups stored as tables in a TOML file, re-read on every lookup
///
/// ```toml
/// [orders]
/// "rabbit.user" = "svc-orders"
/// "rabbit.password" = "rotated-secret"
/// ```
#[derive(Debug, Clone)]
pub struct TomlFilePropertySource {
    path: PathBuf,
}

impl TomlFilePropertySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn unavailable(&self, reason: String) -> CredentialError {
        CredentialError::SourceUnavailable {
            source_name: self.describe(),
            reason,
        }
    }
}

impl PropertySource for TomlFilePropertySource {
    fn lookup(&self, app_config: &str, property: &str) -> Result<Option<String>, CredentialError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| self.unavailable(e.to_string()))?;
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| self.unavailable(e.to_string()))?;

        let Some(group) = table.get(app_config).and_then(|v| v.as_table()) else {
            return Ok(None);
        };

        // Quoted dotted key first, then the nested-table spelling
        let value = group.get(property).or_else(|| {
            property
                .split('.')
                .try_fold(None::<&toml::Value>, |current, segment| {
                    let next = match current {
                        None => group.get(segment),
                        Some(value) => value.as_table().and_then(|t| t.get(segment)),
                    };
                    next.map(Some)
                })
                .flatten()
        });

        Ok(value.map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        }))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Property groups read from environment variables named `{APP}_{PROPERTY}`,
/// upper-cased with every non-alphanumeric character replaced by `_`
#[derive(Debug, Clone, Default)]
pub struct EnvPropertySource;

impl EnvPropertySource {
    pub fn new() -> Self {
        Self
    }

    pub fn variable_name(app_config: &str, property: &str) -> String {
        format!("{app_config}_{property}")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl PropertySource for EnvPropertySource {
    fn lookup(&self, app_config: &str, property: &str) -> Result<Option<String>, CredentialError> {
        Ok(std::env::var(Self::variable_name(app_config, property)).ok())
    }

    fn describe(&self) -> String {
        "environment".to_string()
    }
}

/// Mutable in-process property store
#[derive(Debug, Default)]
pub struct InMemoryPropertySource {
    values: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryPropertySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, app_config: &str, property: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(
                (app_config.to_string(), property.to_string()),
                value.to_string(),
            );
        }
    }

    pub fn remove(&self, app_config: &str, property: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(&(app_config.to_string(), property.to_string()));
        }
    }
}

impl PropertySource for InMemoryPropertySource {
    fn lookup(&self, app_config: &str, property: &str) -> Result<Option<String>, CredentialError> {
        let values = self
            .values
            .lock()
            .map_err(|e| CredentialError::SourceUnavailable {
                source_name: self.describe(),
                reason: e.to_string(),
            })?;
        Ok(values
            .get(&(app_config.to_string(), property.to_string()))
            .cloned())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Resolves the credentials for each connect attempt
#[derive(Clone)]
pub struct CredentialResolver {
    source: Arc<dyn PropertySource>,
}

impl CredentialResolver {
    pub fn new(source: Arc<dyn PropertySource>) -> Self {
        Self { source }
    }

    /// Static credentials, overridden by any property present in the source.
    ///
    /// Presence alone overrides, even when the value equals the static one.
    pub fn resolve(
        &self,
        static_credentials: &Credentials,
        names: &PropertyNames,
    ) -> Result<Credentials, CredentialError> {
        let mut credentials = static_credentials.clone();
        if !names.is_configured() {
            return Ok(credentials);
        }

        if let Some(username) = self
            .source
            .lookup(&names.app_config_name, &names.user_property)?
        {
            debug!(
                app_config = %names.app_config_name,
                property = %names.user_property,
                "Username taken from property source"
            );
            credentials.username = username;
        }

        if let Some(password) = self
            .source
            .lookup(&names.app_config_name, &names.password_property)?
        {
            debug!(
                app_config = %names.app_config_name,
                property = %names.password_property,
                "Password taken from property source"
            );
            credentials.password = password;
        }

        Ok(credentials)
    }

    /// True iff the source holds a value differing from `current`
    pub fn credentials_changed(
        &self,
        current: &Credentials,
        names: &PropertyNames,
    ) -> Result<bool, CredentialError> {
        if !names.is_configured() {
            return Ok(false);
        }

        let username = self
            .source
            .lookup(&names.app_config_name, &names.user_property)?;
        if username.is_some_and(|u| u != current.username) {
            return Ok(true);
        }

        let password = self
            .source
            .lookup(&names.app_config_name, &names.password_property)?;
        Ok(password.is_some_and(|p| p != current.password))
    }

    /// Both properties must exist and be non-blank when an app config is named
    pub fn validate_properties(&self, names: &PropertyNames) -> Result<(), CredentialError> {
        if !names.is_configured() {
            return Ok(());
        }

        for property in [&names.user_property, &names.password_property] {
            let value = self.source.lookup(&names.app_config_name, property)?;
            if value.map_or(true, |v| v.trim().is_empty()) {
                return Err(CredentialError::MissingProperty {
                    app_config: names.app_config_name.clone(),
                    property: property.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("source", &self.source.describe())
            .finish()
    }
}
