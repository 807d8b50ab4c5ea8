//! AuthnRequest construction.

use chrono::Utc;
use uuid::Uuid;

use super::{
    binding::Binding,
    constants::*,
    model::format_instant,
    xml::{escape_attr, escape_text},
};
use crate::tenant::TrustConfig;

/// A fresh, unguessable request ID. The prefix keeps it a valid `xs:ID`.
pub fn new_request_id() -> String {
    format!("ID_{}", Uuid::new_v4())
}

/// Per-attempt overrides of the tenant's defaults.
#[derive(Debug, Clone, Default)]
pub struct AuthnRequestOptions {
    pub is_passive: Option<bool>,
    pub force_authn: Option<bool>,
    /// Binding the IdP must answer with; PAOS for ECP.
    pub protocol_binding: Option<Binding>,
}

#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub is_passive: bool,
    pub xml: String,
}

pub fn build_authn_request(config: &TrustConfig, options: &AuthnRequestOptions) -> AuthnRequest {
    let id = new_request_id();
    let is_passive = options.is_passive.unwrap_or(config.is_passive);
    let force_authn = options.force_authn.unwrap_or(config.force_authn);
    let protocol_binding = options.protocol_binding.unwrap_or(config.response_binding);

    let mut flags = String::new();
    if force_authn {
        flags.push_str(r#" ForceAuthn="true""#);
    }
    if is_passive {
        flags.push_str(r#" IsPassive="true""#);
    }

    let name_id_policy = config
        .name_id_format
        .as_deref()
        .map(|format| {
            format!(
                r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                escape_attr(format)
            )
        })
        .unwrap_or_default();

    let xml = format!(
        concat!(
            r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
            r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}""#,
            r#" AssertionConsumerServiceURL="{acs}" ProtocolBinding="{binding}"{flags}>"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "{policy}",
            "</samlp:AuthnRequest>"
        ),
        protocol = NS_PROTOCOL,
        assertion = NS_ASSERTION,
        id = id,
        instant = format_instant(Utc::now()),
        destination = escape_attr(&config.sso.url),
        acs = escape_attr(&config.acs_url),
        binding = protocol_binding.uri(),
        flags = flags,
        issuer = escape_text(&config.sp_entity_id),
        policy = name_id_policy,
    );

    AuthnRequest { id, is_passive, xml }
}
