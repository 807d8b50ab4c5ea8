//! Prometheus metrics for the SAML adapter.
//!
//! Provides counters for:
//! - Login outcomes per tenant
//! - Rejections by reason code
//! - Logouts by direction

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::counter;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(MetricsError::Install)?;

    // Store handle for the metrics endpoint
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record the end of a login attempt.
///
/// `outcome` is "authenticated", "no_principal" or "rejected".
pub fn record_saml_login(tenant: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("saml_logins_total", "tenant" => tenant.to_string(), "outcome" => outcome.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (tenant, outcome);
    }
}

/// Record a rejected SAML message by its stable reason code.
pub fn record_saml_rejection(reason: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("saml_rejections_total", "reason" => reason.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = reason;
    }
}

/// Record a completed logout.
///
/// `direction` is "sp_initiated" or "idp_initiated".
pub fn record_saml_logout(direction: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("saml_logouts_total", "direction" => direction.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = direction;
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
