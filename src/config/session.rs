use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Session cookie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie name.
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,

    /// Session duration in seconds. An assertion's SessionNotOnOrAfter can
    /// only shorten it.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,

    /// Secure cookie (HTTPS only).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// SameSite cookie attribute.
    #[serde(default)]
    pub same_site: SameSite,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie(),
            duration_secs: default_session_duration(),
            secure: true,
            same_site: SameSite::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cookie_name.is_empty() {
            return Err(ConfigError::Validation(
                "Session cookie name cannot be empty".into(),
            ));
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::Validation(
                "Session duration cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_session_cookie() -> String {
    "__saml_session".to_string()
}

fn default_session_duration() -> u64 {
    8 * 3600 // 8 hours
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

/// Bounds of the in-flight request store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PendingConfig {
    /// How long an AuthnRequest or LogoutRequest stays answerable.
    #[serde(default = "default_pending_ttl")]
    pub ttl_secs: u64,

    /// Maximum number of live entries.
    #[serde(default = "default_pending_capacity")]
    pub capacity: usize,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pending_ttl(),
            capacity: default_pending_capacity(),
        }
    }
}

impl PendingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 || self.capacity == 0 {
            return Err(ConfigError::Validation(
                "pending.ttl_secs and pending.capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_pending_ttl() -> u64 {
    300
}

fn default_pending_capacity() -> usize {
    10_000
}
