//! Per-tenant trust configuration and its administrative store.
//!
//! A [`TrustConfig`] is immutable once published. Every change (key
//! rotation, enabling or disabling a tenant) builds a new snapshot and swaps
//! it in, so a request keeps the snapshot it fetched on entry.

mod resolver;

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use openssl::pkey::{PKey, Private};
pub use resolver::{
    FnResolver, HostResolver, IssuerResolver, PathPrefixResolver, RequestContext, TenantLookup,
    TenantMatch, TenantResolver,
};

use crate::saml::{
    binding::Binding,
    error::SamlError,
    mapper::{MappingRules, PrincipalNamePolicy},
    signature::{KeyNameTransformer, SigningKey, TrustKey},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub binding: Binding,
}

/// Which signatures are produced and which are demanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignaturePolicy {
    /// Sign AuthnRequests and LogoutRequests/Responses sent to the IdP.
    pub sign_requests: bool,
    /// Inbound protocol messages must carry a valid message-level signature
    /// (enveloped, or the Redirect query signature).
    pub want_response_signed: bool,
    /// The consumed assertion must carry a valid signature of its own.
    pub want_assertions_signed: bool,
    /// At least one of the message or assertion signatures must be valid.
    pub require_signature: bool,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            sign_requests: false,
            want_response_signed: false,
            want_assertions_signed: false,
            require_signature: true,
        }
    }
}

impl SignaturePolicy {
    /// True when an inbound logout message must be signed.
    pub fn wants_message_signature(&self) -> bool {
        self.want_response_signed || self.require_signature
    }
}

#[derive(Clone)]
pub struct TrustConfig {
    pub tenant_id: String,
    pub enabled: bool,

    pub idp_entity_id: String,
    pub sso: Endpoint,
    pub slo: Option<Endpoint>,
    /// Trusted IdP keys, in preference order.
    pub keys: Vec<TrustKey>,
    pub key_name_transformer: KeyNameTransformer,

    pub sp_entity_id: String,
    pub acs_url: String,
    pub slo_url: Option<String>,
    pub signing_key: Option<Arc<SigningKey>>,
    /// Tried in order; several during an SP key rollover.
    pub decryption_keys: Vec<PKey<Private>>,

    pub signatures: SignaturePolicy,
    pub name_id_format: Option<String>,
    pub principal: PrincipalNamePolicy,
    pub mapping: MappingRules,
    /// The session must hold at least one of these roles.
    pub required_roles: Vec<String>,
    pub clock_skew: Duration,
    pub allow_unsolicited: bool,
    pub strict_comments: bool,
    /// Binding the IdP answers with (`ProtocolBinding` of the AuthnRequest).
    pub response_binding: Binding,
    pub force_authn: bool,
    pub is_passive: bool,
}

impl TrustConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        idp_entity_id: impl Into<String>,
        sso_url: impl Into<String>,
        sp_entity_id: impl Into<String>,
        acs_url: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            enabled: true,
            idp_entity_id: idp_entity_id.into(),
            sso: Endpoint {
                url: sso_url.into(),
                binding: Binding::Redirect,
            },
            slo: None,
            keys: Vec::new(),
            key_name_transformer: KeyNameTransformer::default(),
            sp_entity_id: sp_entity_id.into(),
            acs_url: acs_url.into(),
            slo_url: None,
            signing_key: None,
            decryption_keys: Vec::new(),
            signatures: SignaturePolicy::default(),
            name_id_format: None,
            principal: PrincipalNamePolicy::default(),
            mapping: MappingRules::default(),
            required_roles: Vec::new(),
            clock_skew: Duration::seconds(30),
            allow_unsolicited: true,
            strict_comments: true,
            response_binding: Binding::Post,
            force_authn: false,
            is_passive: false,
        }
    }

    /// The verifier for signatures issued by this tenant's IdP.
    pub fn verifier(&self) -> crate::saml::signature::SignatureVerifier<'_> {
        crate::saml::signature::SignatureVerifier::new(&self.keys, self.key_name_transformer)
            .strict_comments(self.strict_comments)
    }

    /// SP key used for outbound messages, when request signing is on.
    pub fn outbound_signing_key(&self) -> Result<Option<&SigningKey>, SamlError> {
        if !self.signatures.sign_requests {
            return Ok(None);
        }
        self.signing_key.as_deref().map(Some).ok_or_else(|| {
            SamlError::Configuration(format!(
                "tenant '{}' signs requests but has no signing key",
                self.tenant_id
            ))
        })
    }
}

impl std::fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustConfig")
            .field("tenant_id", &self.tenant_id)
            .field("enabled", &self.enabled)
            .field("idp_entity_id", &self.idp_entity_id)
            .field("sso", &self.sso)
            .field("slo", &self.slo)
            .field("keys", &self.keys)
            .field("key_name_transformer", &self.key_name_transformer)
            .field("sp_entity_id", &self.sp_entity_id)
            .field("acs_url", &self.acs_url)
            .field("signing_key", &self.signing_key)
            .field("decryption_keys", &self.decryption_keys.len())
            .field("signatures", &self.signatures)
            .finish_non_exhaustive()
    }
}

/// Read access to trust snapshots.
pub trait TrustConfigProvider: Send + Sync {
    fn get_trust_config(&self, tenant_id: &str) -> Option<Arc<TrustConfig>>;

    /// The tenant whose IdP entity id is `issuer`.
    fn find_by_issuer(&self, issuer: &str) -> Option<Arc<TrustConfig>>;
}

/// Copy-on-write store of trust snapshots.
#[derive(Debug, Default)]
pub struct TrustStore {
    configs: DashMap<String, Arc<TrustConfig>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = TrustConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.put(config);
        }
        store
    }

    /// Publish a snapshot, returning the one it replaced.
    pub fn put(&self, config: TrustConfig) -> Option<Arc<TrustConfig>> {
        tracing::info!(tenant = %config.tenant_id, keys = config.keys.len(), "Trust config published");
        self.configs
            .insert(config.tenant_id.clone(), Arc::new(config))
    }

    pub fn remove(&self, tenant_id: &str) -> Option<Arc<TrustConfig>> {
        self.configs.remove(tenant_id).map(|(_, config)| config)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Apply `change` to a copy of the tenant's snapshot and publish it.
    ///
    /// The shard stays locked for the duration, so concurrent updates to the
    /// same tenant are serialized and none is lost.
    pub fn update<F>(&self, tenant_id: &str, change: F) -> Result<Arc<TrustConfig>, SamlError>
    where
        F: FnOnce(&mut TrustConfig),
    {
        let mut entry = self
            .configs
            .get_mut(tenant_id)
            .ok_or_else(|| SamlError::UntrustedTenant(tenant_id.to_string()))?;
        let mut next = TrustConfig::clone(&entry);
        change(&mut next);
        let next = Arc::new(next);
        *entry = Arc::clone(&next);
        Ok(next)
    }

    /// Trust an additional key (the new key of a rotation).
    pub fn add_key(&self, tenant_id: &str, key: TrustKey) -> Result<(), SamlError> {
        let key_id = key.key_id().to_string();
        self.update(tenant_id, |config| {
            if !config.keys.iter().any(|k| k.key_id() == key.key_id()) {
                config.keys.push(key);
            }
        })?;
        tracing::info!(tenant = %tenant_id, key_id = %key_id, "Trusted key added");
        Ok(())
    }

    /// Stop trusting a key, identified by configured name or key id.
    /// Returns whether a key was removed.
    pub fn remove_key(&self, tenant_id: &str, key: &str) -> Result<bool, SamlError> {
        let mut removed = false;
        self.update(tenant_id, |config| {
            let before = config.keys.len();
            config
                .keys
                .retain(|k| k.key_id() != key && k.name() != Some(key));
            removed = config.keys.len() != before;
        })?;
        if removed {
            tracing::info!(tenant = %tenant_id, key = %key, "Trusted key removed");
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, tenant_id: &str, enabled: bool) -> Result<(), SamlError> {
        self.update(tenant_id, |config| config.enabled = enabled)?;
        tracing::info!(tenant = %tenant_id, enabled, "Tenant enablement changed");
        Ok(())
    }
}

impl TrustConfigProvider for TrustStore {
    fn get_trust_config(&self, tenant_id: &str) -> Option<Arc<TrustConfig>> {
        self.configs.get(tenant_id).map(|e| Arc::clone(e.value()))
    }

    fn find_by_issuer(&self, issuer: &str) -> Option<Arc<TrustConfig>> {
        self.configs
            .iter()
            .find(|e| e.value().idp_entity_id == issuer)
            .map(|e| Arc::clone(e.value()))
    }
}
