//! HTTP-Redirect binding: raw DEFLATE, base64, query string.

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use url::form_urlencoded;

use super::{Binding, DecodedMessage, MessageKind, QuerySignature};
use crate::saml::{
    error::SamlError,
    signature::{SigningKey, sign_query},
};

/// Upper bound on inflated message size.
const MAX_INFLATED_BYTES: u64 = 1024 * 1024;

/// Build the redirect URL for `xml`.
///
/// The signed octets are `SAMLxxx=..[&RelayState=..]&SigAlg=..`, in that
/// order, exactly as they appear in the resulting URL.
pub fn encode(
    xml: &str,
    kind: MessageKind,
    destination: &str,
    relay_state: Option<&str>,
    signing_key: Option<&SigningKey>,
) -> Result<String, SamlError> {
    let mut compressed = Vec::new();
    {
        let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
        encoder
            .write_all(xml.as_bytes())
            .map_err(|e| SamlError::Internal(format!("Failed to compress message: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| SamlError::Internal(format!("Failed to compress message: {}", e)))?;
    }
    let encoded = STANDARD.encode(&compressed);

    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair(kind.param_name(), &encoded);
    if let Some(relay_state) = relay_state {
        query.append_pair("RelayState", relay_state);
    }
    if let Some(key) = signing_key {
        query.append_pair("SigAlg", key.algorithm());
    }
    let mut query = query.finish();

    if let Some(key) = signing_key {
        let signature = sign_query(&query, key)?;
        query.push_str("&Signature=");
        query.extend(form_urlencoded::byte_serialize(signature.as_bytes()));
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", destination, separator, query))
}

/// Decode a Redirect-bound message from the raw query string.
pub fn decode(raw_query: &str) -> Result<DecodedMessage, SamlError> {
    let mut message: Option<(MessageKind, &str)> = None;
    let mut relay_state: Option<&str> = None;
    let mut sig_alg: Option<&str> = None;
    let mut signature: Option<&str> = None;

    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let slot = match name {
            "SAMLRequest" | "SAMLResponse" => {
                let kind = if name == "SAMLRequest" {
                    MessageKind::Request
                } else {
                    MessageKind::Response
                };
                if message.is_some() {
                    return Err(SamlError::Decode("more than one SAML message in query".into()));
                }
                message = Some((kind, value));
                continue;
            }
            "RelayState" => &mut relay_state,
            "SigAlg" => &mut sig_alg,
            "Signature" => &mut signature,
            _ => continue,
        };
        if slot.is_some() {
            return Err(SamlError::Decode(format!("duplicate query parameter {}", name)));
        }
        *slot = Some(value);
    }

    let (kind, raw_message) =
        message.ok_or_else(|| SamlError::Decode("query carries no SAML message".into()))?;

    let encoded = percent_decode(raw_message);
    let compressed = STANDARD
        .decode(strip_whitespace(&encoded))
        .map_err(|e| SamlError::Decode(format!("invalid base64: {}", e)))?;
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED_BYTES + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| SamlError::Decode(format!("invalid DEFLATE data: {}", e)))?;
    if inflated.len() as u64 > MAX_INFLATED_BYTES {
        return Err(SamlError::Decode("inflated message too large".into()));
    }
    let xml = String::from_utf8(inflated)
        .map_err(|_| SamlError::Decode("message is not valid UTF-8".into()))?;

    let query_signature = match (sig_alg, signature) {
        (Some(raw_alg), Some(raw_sig)) => {
            let mut signed_content = format!("{}={}", kind.param_name(), raw_message);
            if let Some(raw_relay) = relay_state {
                signed_content.push_str("&RelayState=");
                signed_content.push_str(raw_relay);
            }
            signed_content.push_str("&SigAlg=");
            signed_content.push_str(raw_alg);
            let signature = STANDARD
                .decode(strip_whitespace(&percent_decode(raw_sig)))
                .map_err(|e| SamlError::Decode(format!("invalid signature encoding: {}", e)))?;
            Some(QuerySignature {
                signed_content,
                sig_alg: percent_decode(raw_alg),
                signature,
            })
        }
        (None, None) => None,
        _ => {
            return Err(SamlError::Decode(
                "SigAlg and Signature must be sent together".into(),
            ));
        }
    };

    Ok(DecodedMessage {
        xml,
        kind,
        binding: Binding::Redirect,
        relay_state: relay_state.map(percent_decode),
        query_signature,
    })
}

fn percent_decode(raw: &str) -> String {
    form_urlencoded::parse(format!("v={}", raw).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="ID_1">ěščřžýáíRoàåéèíñòøöùüßÅÄÖÜ</samlp:AuthnRequest>"#;

    fn query_of(url: &str) -> &str {
        url.split_once('?').unwrap().1
    }

    #[test]
    fn test_encode_decode_unsigned() {
        let url = encode(XML, MessageKind::Request, "https://idp/sso", Some("/app?x=1&y=2"), None)
            .unwrap();
        assert!(url.starts_with("https://idp/sso?SAMLRequest="));
        assert!(!url.contains("Signature="));

        let decoded = decode(query_of(&url)).unwrap();
        assert_eq!(decoded.xml, XML);
        assert_eq!(decoded.kind, MessageKind::Request);
        assert_eq!(decoded.relay_state.as_deref(), Some("/app?x=1&y=2"));
        assert!(decoded.query_signature.is_none());
    }

    #[test]
    fn test_destination_with_existing_query() {
        let url = encode(XML, MessageKind::Response, "https://idp/sso?tenant=a", None, None).unwrap();
        assert!(url.starts_with("https://idp/sso?tenant=a&SAMLResponse="));
        let decoded = decode(query_of(&url)).unwrap();
        assert_eq!(decoded.kind, MessageKind::Response);
    }

    #[test]
    fn test_signed_content_follows_parameter_order() {
        let raw = "Signature=c2ln&SigAlg=alg%3A1&foo=bar&RelayState=r%2F1&SAMLRequest=";
        let mut compressed = Vec::new();
        {
            let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(b"<x/>").unwrap();
        }
        let message: String =
            form_urlencoded::byte_serialize(STANDARD.encode(&compressed).as_bytes()).collect();
        let query = format!("{}{}", raw, message);
        let decoded = decode(&query).unwrap();
        let sig = decoded.query_signature.unwrap();
        assert_eq!(
            sig.signed_content,
            format!("SAMLRequest={}&RelayState=r%2F1&SigAlg=alg%3A1", message)
        );
        assert_eq!(sig.sig_alg, "alg:1");
        assert_eq!(sig.signature, b"sig");
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        assert!(matches!(
            decode("SAMLResponse=%%%not-base64"),
            Err(SamlError::Decode(_))
        ));
    }

    #[test]
    fn test_invalid_deflate_is_decode_error() {
        let bogus: String =
            form_urlencoded::byte_serialize(STANDARD.encode(b"\xff\xfe\xfd not deflate").as_bytes())
                .collect();
        assert!(matches!(
            decode(&format!("SAMLResponse={}", bogus)),
            Err(SamlError::Decode(_))
        ));
    }

    #[test]
    fn test_missing_message_and_lone_signature() {
        assert!(matches!(decode("RelayState=x"), Err(SamlError::Decode(_))));

        let url = encode(XML, MessageKind::Request, "https://idp/sso", None, None).unwrap();
        let query = format!("{}&Signature=abcd", query_of(&url));
        assert!(matches!(decode(&query), Err(SamlError::Decode(_))));
    }
}
