//! Configuration module for the SAML SP adapter.
//!
//! The adapter is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//! public_url = "https://app.example.com"
//!
//! [[tenants]]
//! id = "demo"
//!
//! [tenants.idp]
//! entity_id = "https://idp.example.com/realms/demo"
//! sso_url = "https://idp.example.com/realms/demo/protocol/saml"
//!
//! [[tenants.idp.keys]]
//! certificate = "${DEMO_IDP_CERT}"
//! ```

mod observability;
mod server;
mod session;
mod tenant;

use std::{collections::HashSet, path::Path};

pub use observability::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use session::*;
pub use tenant::*;

use crate::tenant::TrustStore;

/// Root configuration for the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Session cookie configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// In-flight AuthnRequest/LogoutRequest bookkeeping.
    #[serde(default)]
    pub pending: PendingConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Trusted identity providers, one per tenant.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl AdapterConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: AdapterConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.pending.validate()?;

        let mut ids = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut hosts = HashSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !ids.insert(tenant.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate tenant id '{}'",
                    tenant.id
                )));
            }
            if !prefixes.insert(tenant.path_prefix()) {
                return Err(ConfigError::Validation(format!(
                    "tenant '{}' reuses path prefix '{}'",
                    tenant.id,
                    tenant.path_prefix()
                )));
            }
            for host in &tenant.hosts {
                if !hosts.insert(host.to_ascii_lowercase()) {
                    return Err(ConfigError::Validation(format!(
                        "host '{}' is claimed by more than one tenant",
                        host
                    )));
                }
            }
        }

        if self.tenants.is_empty() {
            tracing::warn!("No tenants configured; every SAML request will be rejected");
        }
        if self.server.public_url.is_none() {
            tracing::warn!(
                "server.public_url is not set; SP URLs are derived from the bind address"
            );
        }
        Ok(())
    }

    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }

    /// Load every tenant's key material into a trust store.
    pub fn trust_store(&self) -> Result<TrustStore, ConfigError> {
        let base_url = self.server.base_url();
        let configs = self
            .tenants
            .iter()
            .map(|tenant| tenant.to_trust_config(&base_url))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TrustStore::from_configs(configs))
    }
}

/// A config value in seconds as a `chrono` duration, saturating.
pub(crate) fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
