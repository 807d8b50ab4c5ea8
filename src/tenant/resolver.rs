use std::{collections::HashMap, sync::Arc};

use super::{TrustConfig, TrustConfigProvider};
use crate::saml::error::SamlError;

/// What a resolver may look at: nothing beyond the request line, the Host
/// header and the issuer peeked from an inbound message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
    pub issuer: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMatch {
    pub tenant_id: String,
    /// Leading part of the path owned by the tenant ("" for host or issuer
    /// based resolution); endpoint paths are matched on the remainder.
    pub path_prefix: String,
}

impl TenantMatch {
    pub fn new(tenant_id: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            path_prefix: path_prefix.into(),
        }
    }

    /// The request path with the tenant prefix removed, always starting with `/`.
    pub fn local_path<'p>(&self, path: &'p str) -> &'p str {
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}

/// Maps a request to a tenant id. Implementations are deterministic and
/// side-effect free.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<TenantMatch>;
}

/// Longest matching path prefix, on a segment boundary.
#[derive(Debug, Clone, Default)]
pub struct PathPrefixResolver {
    prefixes: Vec<(String, String)>,
}

impl PathPrefixResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        self.prefixes.push((prefix, tenant_id.into()));
        // Longest first
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }
}

impl TenantResolver for PathPrefixResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<TenantMatch> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| {
                ctx.path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .map(|(prefix, tenant)| TenantMatch::new(tenant.clone(), prefix.clone()))
    }
}

/// Exact host match, case-insensitive, ignoring any port.
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    hosts: HashMap<String, String>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl AsRef<str>, tenant_id: impl Into<String>) -> Self {
        self.hosts
            .insert(host.as_ref().to_ascii_lowercase(), tenant_id.into());
        self
    }
}

impl TenantResolver for HostResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<TenantMatch> {
        let host = ctx.host?;
        let host = host.rsplit_once(':').map_or(host, |(name, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                host
            }
        });
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map(|tenant| TenantMatch::new(tenant.clone(), ""))
    }
}

/// Tenant whose IdP issued the inbound message.
pub struct IssuerResolver {
    provider: Arc<dyn TrustConfigProvider>,
}

impl IssuerResolver {
    pub fn new(provider: Arc<dyn TrustConfigProvider>) -> Self {
        Self { provider }
    }
}

impl TenantResolver for IssuerResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<TenantMatch> {
        let issuer = ctx.issuer?;
        self.provider
            .find_by_issuer(issuer)
            .map(|config| TenantMatch::new(config.tenant_id.clone(), ""))
    }
}

/// Per-request hook supplied by the host application.
pub struct FnResolver<F>(pub F);

impl<F> TenantResolver for FnResolver<F>
where
    F: Fn(&RequestContext<'_>) -> Option<TenantMatch> + Send + Sync,
{
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<TenantMatch> {
        (self.0)(ctx)
    }
}

/// Resolvers consulted in order, backed by a trust provider.
pub struct TenantLookup {
    resolvers: Vec<Box<dyn TenantResolver>>,
    provider: Arc<dyn TrustConfigProvider>,
}

impl TenantLookup {
    pub fn new(provider: Arc<dyn TrustConfigProvider>) -> Self {
        Self {
            resolvers: Vec::new(),
            provider,
        }
    }

    pub fn with_resolver(mut self, resolver: impl TenantResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn provider(&self) -> &Arc<dyn TrustConfigProvider> {
        &self.provider
    }

    /// The first resolver's answer wins. Unresolvable requests and unknown
    /// tenants are `UNTRUSTED_TENANT`; disabled tenants `DISABLED_CLIENT`.
    pub fn resolve(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<(Arc<TrustConfig>, TenantMatch), SamlError> {
        let matched = self
            .resolvers
            .iter()
            .find_map(|r| r.resolve(ctx))
            .ok_or_else(|| SamlError::UntrustedTenant(ctx.path.to_string()))?;
        let config = self
            .provider
            .get_trust_config(&matched.tenant_id)
            .ok_or_else(|| SamlError::UntrustedTenant(matched.tenant_id.clone()))?;
        if !config.enabled {
            return Err(SamlError::DisabledClient(config.tenant_id.clone()));
        }
        Ok((config, matched))
    }
}
