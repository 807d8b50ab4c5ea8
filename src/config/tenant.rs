use std::{path::PathBuf, sync::Arc};

use openssl::pkey::PKey;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::{
    saml::{
        binding::Binding,
        mapper::{MappingRules, PrincipalNamePolicy},
        signature::{KeyNameTransformer, SigningKey, TrustKey},
    },
    tenant::{Endpoint, SignaturePolicy, TrustConfig},
};

/// One `[[tenants]]` entry: an IdP trusted by this SP.
///
/// ```toml
/// [[tenants]]
/// id = "demo"
///
/// [tenants.idp]
/// entity_id = "https://idp.example.com/realms/demo"
/// sso_url = "https://idp.example.com/realms/demo/protocol/saml"
///
/// [[tenants.idp.keys]]
/// name = "2024"
/// certificate_file = "/etc/saml/demo-idp.pem"
///
/// [tenants.sp]
/// private_key = "${DEMO_SP_KEY}"
/// certificate_file = "/etc/saml/demo-sp.pem"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path owned by the tenant. Defaults to `/{id}`.
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// Host names routed to this tenant regardless of path.
    #[serde(default)]
    pub hosts: Vec<String>,

    pub idp: IdpConfig,

    #[serde(default)]
    pub sp: SpConfig,

    #[serde(default)]
    pub signatures: SignatureConfig,

    /// NameIDPolicy format requested from the IdP.
    #[serde(default)]
    pub name_id_format: Option<String>,

    #[serde(default)]
    pub principal: PrincipalNamePolicy,

    #[serde(default)]
    pub mapping: MappingRules,

    /// A session must hold at least one of these roles.
    #[serde(default)]
    pub required_roles: Vec<String>,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Accept IdP-initiated responses without InResponseTo.
    #[serde(default = "default_true")]
    pub allow_unsolicited: bool,

    /// Reject signed values split by XML comments.
    #[serde(default = "default_true")]
    pub strict_comments: bool,

    /// Binding the IdP answers the AuthnRequest with.
    #[serde(default = "default_response_binding")]
    pub response_binding: Binding,

    #[serde(default)]
    pub force_authn: bool,

    #[serde(default)]
    pub is_passive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    pub entity_id: String,

    pub sso_url: String,

    #[serde(default = "default_request_binding")]
    pub sso_binding: Binding,

    /// IdP single logout endpoint. Without it, logout is local only.
    #[serde(default)]
    pub slo_url: Option<String>,

    #[serde(default = "default_request_binding")]
    pub slo_binding: Binding,

    /// Trusted verification keys, in preference order. Two entries coexist
    /// while the IdP rotates its key.
    #[serde(default)]
    pub keys: Vec<IdpKeyConfig>,

    #[serde(default)]
    pub key_name_transformer: KeyNameTransformer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpKeyConfig {
    /// Value matched against `ds:KeyName` in `KEY_ID` mode.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub certificate_file: Option<PathBuf>,

    #[serde(default)]
    pub public_key: Option<String>,

    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
}

impl IdpKeyConfig {
    fn load(&self) -> Result<TrustKey, ConfigError> {
        if let Some(pem) = read_pem("certificate", &self.certificate, &self.certificate_file)? {
            return TrustKey::from_certificate_pem(&pem, self.name.clone())
                .map_err(|e| ConfigError::Validation(e.to_string()));
        }
        if let Some(pem) = read_pem("public_key", &self.public_key, &self.public_key_file)? {
            return TrustKey::from_public_key_pem(&pem, self.name.clone())
                .map_err(|e| ConfigError::Validation(e.to_string()));
        }
        Err(ConfigError::Validation(
            "IdP key needs a certificate or a public_key".into(),
        ))
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// Defaults to `{public_url}{path_prefix}/saml/metadata`.
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Defaults to `{public_url}{path_prefix}/saml/acs`.
    #[serde(default)]
    pub acs_url: Option<String>,

    /// Defaults to `{public_url}{path_prefix}/saml/slo`.
    #[serde(default)]
    pub slo_url: Option<String>,

    #[serde(default)]
    pub private_key: Option<String>,

    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub certificate_file: Option<PathBuf>,

    /// `ds:KeyName` written into outbound signatures.
    #[serde(default)]
    pub key_name: Option<String>,

    /// Decrypt with the main key first, then these (SP key rollover).
    #[serde(default)]
    pub decryption_keys: Vec<PemConfig>,
}

impl std::fmt::Debug for SpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpConfig")
            .field("entity_id", &self.entity_id)
            .field("acs_url", &self.acs_url)
            .field("slo_url", &self.slo_url)
            .field("private_key", &self.private_key.as_ref().map(|_| "****"))
            .field("private_key_file", &self.private_key_file)
            .field("certificate_file", &self.certificate_file)
            .field("key_name", &self.key_name)
            .field("decryption_keys", &self.decryption_keys.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PemConfig {
    #[serde(default)]
    pub pem: Option<String>,

    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureConfig {
    #[serde(default)]
    pub sign_requests: bool,

    #[serde(default)]
    pub want_response_signed: bool,

    #[serde(default)]
    pub want_assertions_signed: bool,

    #[serde(default = "default_true")]
    pub require_signature: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        let policy = SignaturePolicy::default();
        Self {
            sign_requests: policy.sign_requests,
            want_response_signed: policy.want_response_signed,
            want_assertions_signed: policy.want_assertions_signed,
            require_signature: policy.require_signature,
        }
    }
}

impl TenantConfig {
    pub fn path_prefix(&self) -> String {
        match &self.path_prefix {
            Some(prefix) => prefix.trim_end_matches('/').to_string(),
            None => format!("/{}", self.id),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() || self.id.contains('/') {
            return Err(ConfigError::Validation(format!(
                "invalid tenant id '{}'",
                self.id
            )));
        }
        if let Some(prefix) = &self.path_prefix
            && !prefix.starts_with('/')
        {
            return Err(self.invalid("path_prefix must start with '/'"));
        }
        if self.idp.keys.is_empty() && self.signatures.require_signature {
            return Err(self.invalid("signatures are required but no IdP key is configured"));
        }
        if self.signatures.sign_requests
            && self.sp.private_key.is_none()
            && self.sp.private_key_file.is_none()
        {
            return Err(self.invalid("sign_requests needs an SP private key"));
        }
        Ok(())
    }

    /// Load key material and build the trust snapshot.
    ///
    /// `base_url` supplies the default SP URLs.
    pub fn to_trust_config(&self, base_url: &str) -> Result<TrustConfig, ConfigError> {
        let sp_base = format!("{}{}/saml", base_url.trim_end_matches('/'), self.path_prefix());
        let sp_entity_id = self
            .sp
            .entity_id
            .clone()
            .unwrap_or_else(|| format!("{}/metadata", sp_base));
        let acs_url = self
            .sp
            .acs_url
            .clone()
            .unwrap_or_else(|| format!("{}/acs", sp_base));

        let mut config = TrustConfig::new(
            &self.id,
            &self.idp.entity_id,
            &self.idp.sso_url,
            sp_entity_id,
            acs_url,
        );
        config.enabled = self.enabled;
        config.sso = Endpoint {
            url: self.idp.sso_url.clone(),
            binding: self.idp.sso_binding,
        };
        config.slo = self.idp.slo_url.as_ref().map(|url| Endpoint {
            url: url.clone(),
            binding: self.idp.slo_binding,
        });
        config.slo_url = Some(
            self.sp
                .slo_url
                .clone()
                .unwrap_or_else(|| format!("{}/slo", sp_base)),
        );
        config.keys = self
            .idp
            .keys
            .iter()
            .map(IdpKeyConfig::load)
            .collect::<Result<_, _>>()
            .map_err(|e| self.invalid(&e.to_string()))?;
        config.key_name_transformer = self.idp.key_name_transformer;

        let private_key = read_pem("private_key", &self.sp.private_key, &self.sp.private_key_file)
            .map_err(|e| self.invalid(&e.to_string()))?;
        let certificate = read_pem("certificate", &self.sp.certificate, &self.sp.certificate_file)
            .map_err(|e| self.invalid(&e.to_string()))?;
        match (&private_key, &certificate) {
            (Some(key), Some(cert)) => {
                let signing_key = SigningKey::from_pem(key, cert)
                    .map_err(|e| self.invalid(&e.to_string()))?
                    .with_key_name(self.sp.key_name.clone());
                config.decryption_keys.push(signing_key.private_key().clone());
                config.signing_key = Some(Arc::new(signing_key));
            }
            (Some(key), None) => {
                config.decryption_keys.push(
                    PKey::private_key_from_pem(key.as_bytes())
                        .map_err(|e| self.invalid(&format!("invalid SP private key: {}", e)))?,
                );
            }
            (None, Some(_)) => return Err(self.invalid("SP certificate without a private key")),
            (None, None) => {}
        }
        for extra in &self.sp.decryption_keys {
            let pem = read_pem("pem", &extra.pem, &extra.file)
                .map_err(|e| self.invalid(&e.to_string()))?
                .ok_or_else(|| self.invalid("decryption key needs pem or file"))?;
            config.decryption_keys.push(
                PKey::private_key_from_pem(pem.as_bytes())
                    .map_err(|e| self.invalid(&format!("invalid decryption key: {}", e)))?,
            );
        }

        config.signatures = SignaturePolicy {
            sign_requests: self.signatures.sign_requests,
            want_response_signed: self.signatures.want_response_signed,
            want_assertions_signed: self.signatures.want_assertions_signed,
            require_signature: self.signatures.require_signature,
        };
        config.name_id_format = self.name_id_format.clone();
        config.principal = self.principal.clone();
        config.mapping = self.mapping.clone();
        config.required_roles = self.required_roles.clone();
        config.clock_skew = super::seconds(self.clock_skew_secs);
        config.allow_unsolicited = self.allow_unsolicited;
        config.strict_comments = self.strict_comments;
        config.response_binding = self.response_binding;
        config.force_authn = self.force_authn;
        config.is_passive = self.is_passive;
        Ok(config)
    }

    fn invalid(&self, message: &str) -> ConfigError {
        ConfigError::Validation(format!("tenant '{}': {}", self.id, message))
    }
}

/// Inline PEM wins over the file; neither is `None`.
fn read_pem(
    field: &str,
    inline: &Option<String>,
    file: &Option<PathBuf>,
) -> Result<Option<String>, ConfigError> {
    match (inline, file) {
        (Some(_), Some(_)) => Err(ConfigError::Validation(format!(
            "set either {} or {}_file, not both",
            field, field
        ))),
        (Some(pem), None) => Ok(Some(pem.clone())),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map(Some)
            .map_err(|e| ConfigError::Io(e, path.clone())),
        (None, None) => Ok(None),
    }
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> u64 {
    30
}

fn default_request_binding() -> Binding {
    Binding::Redirect
}

fn default_response_binding() -> Binding {
    Binding::Post
}
