//! Transport bindings: HTTP-Redirect, HTTP-POST and SOAP/PAOS (ECP).

pub mod post;
pub mod redirect;
pub mod soap;

use axum::{
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::{constants::*, error::SamlError, signature::SigningKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Redirect,
    Post,
    Paos,
}

impl Binding {
    pub fn uri(&self) -> &'static str {
        match self {
            Binding::Redirect => BINDING_HTTP_REDIRECT,
            Binding::Post => BINDING_HTTP_POST,
            Binding::Paos => BINDING_PAOS,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, SamlError> {
        match uri {
            BINDING_HTTP_REDIRECT => Ok(Binding::Redirect),
            BINDING_HTTP_POST => Ok(Binding::Post),
            BINDING_PAOS => Ok(Binding::Paos),
            other => Err(SamlError::Decode(format!("unknown binding '{}'", other))),
        }
    }
}

/// Whether a bound message travels as `SAMLRequest` or `SAMLResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn param_name(&self) -> &'static str {
        match self {
            MessageKind::Request => "SAMLRequest",
            MessageKind::Response => "SAMLResponse",
        }
    }
}

/// A message as delivered by the HTTP transport, before decoding.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// The raw (still percent-encoded) query string of a GET request.
    Redirect { raw_query: String },
    /// Fields of an `application/x-www-form-urlencoded` POST body.
    Post {
        kind: MessageKind,
        message: String,
        relay_state: Option<String>,
    },
    /// A SOAP envelope posted by an ECP client.
    Soap { envelope: String },
}

impl InboundMessage {
    pub fn binding(&self) -> Binding {
        match self {
            InboundMessage::Redirect { .. } => Binding::Redirect,
            InboundMessage::Post { .. } => Binding::Post,
            InboundMessage::Soap { .. } => Binding::Paos,
        }
    }
}

/// Signature carried in the query string of a Redirect-bound message.
#[derive(Debug, Clone)]
pub struct QuerySignature {
    /// `SAMLxxx=..&RelayState=..&SigAlg=..` exactly as sent.
    pub signed_content: String,
    pub sig_alg: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub xml: String,
    pub kind: MessageKind,
    pub binding: Binding,
    pub relay_state: Option<String>,
    pub query_signature: Option<QuerySignature>,
}

/// A message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// `302 Found` to the URL.
    Redirect { url: String },
    /// Auto-submitting HTML form.
    Post { action: String, html: String },
    /// SOAP envelope returned to a PAOS client.
    Soap { envelope: String },
}

impl OutboundMessage {
    /// Location for redirects, form action for POST.
    pub fn target(&self) -> Option<&str> {
        match self {
            OutboundMessage::Redirect { url } => Some(url),
            OutboundMessage::Post { action, .. } => Some(action),
            OutboundMessage::Soap { .. } => None,
        }
    }
}

impl IntoResponse for OutboundMessage {
    fn into_response(self) -> Response {
        match self {
            OutboundMessage::Redirect { url } => {
                (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
            }
            OutboundMessage::Post { html, .. } => {
                ([(header::CACHE_CONTROL, "no-cache, no-store")], Html(html)).into_response()
            }
            OutboundMessage::Soap { envelope } => {
                ([(header::CONTENT_TYPE, PAOS_MEDIA_TYPE)], envelope).into_response()
            }
        }
    }
}

/// Decode an inbound message.
pub fn decode(inbound: &InboundMessage) -> Result<DecodedMessage, SamlError> {
    match inbound {
        InboundMessage::Redirect { raw_query } => redirect::decode(raw_query),
        InboundMessage::Post {
            kind,
            message,
            relay_state,
        } => post::decode(*kind, message, relay_state.clone()),
        InboundMessage::Soap { envelope } => soap::decode(envelope),
    }
}

/// Encode `xml` for `binding`, signing it when `signing_key` is given.
///
/// Redirect messages carry a query signature; POST messages are signed with
/// an enveloped XML signature over the root element before encoding.
pub fn encode(
    xml: &str,
    kind: MessageKind,
    binding: Binding,
    destination: &str,
    relay_state: Option<&str>,
    signing_key: Option<&SigningKey>,
) -> Result<OutboundMessage, SamlError> {
    match binding {
        Binding::Redirect => Ok(OutboundMessage::Redirect {
            url: redirect::encode(xml, kind, destination, relay_state, signing_key)?,
        }),
        Binding::Post => {
            let xml = match signing_key {
                Some(key) => super::signature::sign_root(xml, key)?,
                None => xml.to_string(),
            };
            Ok(OutboundMessage::Post {
                action: destination.to_string(),
                html: post::encode_form(&xml, kind, destination, relay_state),
            })
        }
        Binding::Paos => {
            let xml = match signing_key {
                Some(key) => super::signature::sign_root(xml, key)?,
                None => xml.to_string(),
            };
            Ok(OutboundMessage::Soap {
                envelope: soap::wrap(&xml),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_uri_round_trip() {
        for binding in [Binding::Redirect, Binding::Post, Binding::Paos] {
            assert_eq!(Binding::from_uri(binding.uri()).unwrap(), binding);
        }
        assert!(matches!(
            Binding::from_uri("urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact"),
            Err(SamlError::Decode(_))
        ));
    }

    #[test]
    fn test_outbound_redirect_response() {
        let response = OutboundMessage::Redirect {
            url: "https://idp/sso?SAMLRequest=x".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://idp/sso?SAMLRequest=x"
        );
    }

    #[test]
    fn test_outbound_soap_content_type() {
        let response = OutboundMessage::Soap {
            envelope: "<x/>".into(),
        }
        .into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            PAOS_MEDIA_TYPE
        );
    }
}
