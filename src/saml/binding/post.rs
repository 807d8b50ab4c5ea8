//! HTTP-POST binding: base64 in a hidden form field.

use base64::{Engine, engine::general_purpose::STANDARD};

use super::{Binding, DecodedMessage, MessageKind};
use crate::saml::{error::SamlError, xml::escape_attr};

/// Render an auto-submitting form carrying `xml` to `action`.
pub fn encode_form(xml: &str, kind: MessageKind, action: &str, relay_state: Option<&str>) -> String {
    let encoded = STANDARD.encode(xml.as_bytes());
    let relay_input = relay_state
        .map(|rs| {
            format!(
                r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                escape_attr(rs)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>SAML</title></head>
<body onload="document.forms[0].submit()">
<noscript><p>JavaScript is disabled. Click Continue to proceed.</p></noscript>
<form method="POST" action="{action}">
<input type="hidden" name="{param}" value="{encoded}"/>
{relay_input}
<noscript><input type="submit" value="Continue"/></noscript>
</form>
</body>
</html>"#,
        action = escape_attr(action),
        param = kind.param_name(),
    )
}

/// Decode the form field. Line breaks inserted by MIME-style encoders are
/// the only characters removed before base64 decoding.
pub fn decode(
    kind: MessageKind,
    message: &str,
    relay_state: Option<String>,
) -> Result<DecodedMessage, SamlError> {
    let compact: String = message.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(SamlError::Decode(format!("empty {} field", kind.param_name())));
    }
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SamlError::Decode(format!("invalid base64: {}", e)))?;
    let xml = String::from_utf8(bytes)
        .map_err(|_| SamlError::Decode("message is not valid UTF-8".into()))?;

    Ok(DecodedMessage {
        xml,
        kind,
        binding: Binding::Post,
        relay_state,
        query_signature: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_contains_escaped_fields() {
        let html = encode_form(
            "<samlp:Response/>",
            MessageKind::Response,
            "https://sp/acs?a=1&b=2",
            Some(r#"/app?q="x""#),
        );
        assert!(html.contains(r#"action="https://sp/acs?a=1&amp;b=2""#));
        assert!(html.contains(r#"name="SAMLResponse""#));
        assert!(html.contains(r#"value="/app?q=&quot;x&quot;""#));
    }

    #[test]
    fn test_decode_tolerates_line_breaks() {
        let encoded = STANDARD.encode("<samlp:Response>ok</samlp:Response>");
        let (a, b) = encoded.split_at(10);
        let wrapped = format!("{}\r\n{}", a, b);
        let decoded = decode(MessageKind::Response, &wrapped, Some("rs".into())).unwrap();
        assert_eq!(decoded.xml, "<samlp:Response>ok</samlp:Response>");
        assert_eq!(decoded.relay_state.as_deref(), Some("rs"));
        assert_eq!(decoded.binding, Binding::Post);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(MessageKind::Response, "", None).is_err());
        assert!(decode(MessageKind::Response, "!!notbase64!!", None).is_err());
        let latin1 = STANDARD.encode([0xff, 0xfe, 0x00]);
        assert!(decode(MessageKind::Response, &latin1, None).is_err());
    }
}
