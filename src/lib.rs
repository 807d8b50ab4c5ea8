//! SAML 2.0 Service Provider adapter.
//!
//! [`saml::SamlEngine`] is the protocol state machine; [`routes::build_app`]
//! mounts it behind an axum router for a host application. Trust material
//! per tenant lives in a [`tenant::TrustStore`], whose snapshots are swapped
//! on key rotation.

pub mod config;
pub mod observability;
pub mod routes;
pub mod saml;
pub mod session;
pub mod tenant;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use config::{AdapterConfig, ConfigError, seconds};
use saml::SamlEngine;
use session::{MemorySessionStore, PendingRequestStore, SessionStore};
use tenant::{
    HostResolver, IssuerResolver, PathPrefixResolver, TenantLookup, TrustConfigProvider,
    TrustStore,
};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AdapterConfig>,
    /// Administrative handle on the trust snapshots.
    pub trust: Arc<TrustStore>,
    pub tenants: Arc<TenantLookup>,
    pub engine: Arc<SamlEngine>,
}

impl AppState {
    /// Load every tenant's keys from `config` and wire the default
    /// in-memory session store.
    pub fn from_config(config: AdapterConfig) -> Result<Self, ConfigError> {
        let trust = Arc::new(config.trust_store()?);
        Ok(Self::with_trust_store(
            config,
            trust,
            Arc::new(MemorySessionStore::new()),
        ))
    }

    /// Tenants are resolved by path prefix, then host, then the issuer of the
    /// inbound message. Tenants missing from `config.tenants` own `/{id}`.
    pub fn with_trust_store(
        config: AdapterConfig,
        trust: Arc<TrustStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let mut paths = PathPrefixResolver::new();
        for tenant_id in trust.tenant_ids() {
            let prefix = config
                .tenant(&tenant_id)
                .map(|t| t.path_prefix())
                .unwrap_or_else(|| format!("/{}", tenant_id));
            paths = paths.with_prefix(prefix, tenant_id);
        }
        let mut hosts = HostResolver::new();
        for tenant in &config.tenants {
            for host in &tenant.hosts {
                hosts = hosts.with_host(host, &tenant.id);
            }
        }

        let provider: Arc<dyn TrustConfigProvider> = trust.clone();
        let tenants = TenantLookup::new(Arc::clone(&provider))
            .with_resolver(paths)
            .with_resolver(hosts)
            .with_resolver(IssuerResolver::new(provider));

        let engine = SamlEngine::new(sessions)
            .with_pending_store(PendingRequestStore::new(
                seconds(config.pending.ttl_secs),
                config.pending.capacity,
            ))
            .with_session_ttl(seconds(config.session.duration_secs));

        Self {
            config: Arc::new(config),
            trust,
            tenants: Arc::new(tenants),
            engine: Arc::new(engine),
        }
    }
}
