//! SOAP 1.1 envelopes and the PAOS headers of the ECP profile.

use roxmltree::{Document, Node};

use super::{Binding, DecodedMessage, MessageKind};
use crate::saml::{
    constants::*,
    error::SamlError,
    xml::{self, child_element, escape_attr, escape_text, is_element, text_content},
};

const SOAP_ACTOR_NEXT: &str = "http://schemas.xmlsoap.org/soap/actor/next";

/// True when the client advertises PAOS support for the ECP service.
///
/// Requires `Accept` to list `application/vnd.paos+xml` and the `PAOS`
/// header to name both the PAOS version and the ECP service, e.g.
/// `ver="urn:liberty:paos:2003-08";"urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp"`.
pub fn is_paos_capable(accept: Option<&str>, paos: Option<&str>) -> bool {
    let accepts = accept.is_some_and(|a| a.contains(PAOS_MEDIA_TYPE));
    let announces = paos.is_some_and(|p| p.contains(NS_PAOS) && p.contains(ECP_SERVICE));
    accepts && announces
}

fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    match trimmed.strip_prefix("<?xml") {
        Some(rest) => rest.split_once("?>").map(|(_, body)| body).unwrap_or(rest),
        None => xml,
    }
}

/// Wrap a message in a SOAP envelope with an empty header.
pub fn wrap(body_xml: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="{NS_SOAP_ENV}"><soap:Header/><soap:Body>{}</soap:Body></soap:Envelope>"#,
        strip_declaration(body_xml)
    )
}

/// Parameters of the ECP `paos:Request` and `ecp:Request` headers.
#[derive(Debug, Clone)]
pub struct EcpRequest<'a> {
    pub acs_url: &'a str,
    pub sp_entity_id: &'a str,
    pub idp_entity_id: &'a str,
    pub sso_url: &'a str,
    pub relay_state: Option<&'a str>,
    pub is_passive: bool,
}

/// Envelope returned to a PAOS client: PAOS and ECP headers announcing the
/// IdP list, with the AuthnRequest in the body.
pub fn ecp_envelope(authn_request_xml: &str, params: &EcpRequest<'_>) -> String {
    let relay = params
        .relay_state
        .map(|rs| {
            format!(
                r#"<ecp:RelayState xmlns:ecp="{NS_ECP}" soap:actor="{SOAP_ACTOR_NEXT}" soap:mustUnderstand="1">{}</ecp:RelayState>"#,
                escape_text(rs)
            )
        })
        .unwrap_or_default();

    format!(
        concat!(
            r#"<soap:Envelope xmlns:soap="{soap}">"#,
            "<soap:Header>",
            r#"<paos:Request xmlns:paos="{paos}" soap:actor="{actor}" soap:mustUnderstand="1" responseConsumerURL="{acs}" service="{service}"/>"#,
            r#"<ecp:Request xmlns:ecp="{ecp}" soap:actor="{actor}" soap:mustUnderstand="1" IsPassive="{passive}">"#,
            r#"<saml:Issuer xmlns:saml="{assertion}">{issuer}</saml:Issuer>"#,
            r#"<samlp:IDPList xmlns:samlp="{protocol}"><samlp:IDPEntry ProviderID="{idp}" Loc="{loc}"/></samlp:IDPList>"#,
            "</ecp:Request>",
            "{relay}",
            "</soap:Header>",
            "<soap:Body>{body}</soap:Body>",
            "</soap:Envelope>"
        ),
        soap = NS_SOAP_ENV,
        paos = NS_PAOS,
        actor = SOAP_ACTOR_NEXT,
        acs = escape_attr(params.acs_url),
        service = ECP_SERVICE,
        ecp = NS_ECP,
        passive = params.is_passive,
        assertion = NS_ASSERTION,
        issuer = escape_text(params.sp_entity_id),
        protocol = NS_PROTOCOL,
        idp = escape_attr(params.idp_entity_id),
        loc = escape_attr(params.sso_url),
        relay = relay,
        body = strip_declaration(authn_request_xml),
    )
}

/// Validate a SOAP envelope and keep it whole; the engine reads the message
/// through [`message_root`] so signatures are checked in their original
/// namespace context.
pub fn decode(envelope: &str) -> Result<DecodedMessage, SamlError> {
    let doc = xml::parse(envelope)?;
    let root = doc.root_element();
    if !is_element(root, NS_SOAP_ENV, "Envelope") {
        return Err(SamlError::Decode("expected a SOAP envelope".into()));
    }
    let message = message_root(&doc)?;
    let kind = match message.tag_name().name() {
        "Response" | "LogoutResponse" | "ArtifactResponse" => MessageKind::Response,
        _ => MessageKind::Request,
    };
    let relay_state = child_element(root, NS_SOAP_ENV, "Header")
        .and_then(|h| child_element(h, NS_ECP, "RelayState"))
        .map(|n| text_content(n).trim().to_string());

    Ok(DecodedMessage {
        xml: envelope.to_string(),
        kind,
        binding: Binding::Paos,
        relay_state,
        query_signature: None,
    })
}

/// The SAML protocol element of a decoded document: the first element of a
/// SOAP `Body`, or the document element itself.
pub fn message_root<'a, 'input>(doc: &'a Document<'input>) -> Result<Node<'a, 'input>, SamlError> {
    let root = doc.root_element();
    if !is_element(root, NS_SOAP_ENV, "Envelope") {
        return Ok(root);
    }
    let body = child_element(root, NS_SOAP_ENV, "Body")
        .ok_or_else(|| SamlError::Decode("SOAP envelope has no Body".into()))?;
    body.first_element_child()
        .ok_or_else(|| SamlError::Decode("SOAP Body is empty".into()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        Some("text/html; application/vnd.paos+xml"),
        Some(r#"ver="urn:liberty:paos:2003-08";"urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp""#),
        true
    )]
    #[case(
        Some("application/vnd.paos+xml"),
        Some("ver='urn:liberty:paos:2003-08' ;'urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp'"),
        true
    )]
    #[case(Some("text/html"), Some("ver='urn:liberty:paos:2003-08';'urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp'"), false)]
    #[case(Some("application/vnd.paos+xml"), None, false)]
    #[case(Some("application/vnd.paos+xml"), Some("ver='urn:liberty:paos:2003-08'"), false)]
    #[case(None, None, false)]
    fn test_paos_detection(
        #[case] accept: Option<&str>,
        #[case] paos: Option<&str>,
        #[case] expected: bool,
    ) {
        assert_eq!(is_paos_capable(accept, paos), expected);
    }

    #[test]
    fn test_ecp_envelope_structure() {
        let request = r#"<?xml version="1.0"?><samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="ID_1"/>"#;
        let envelope = ecp_envelope(
            request,
            &EcpRequest {
                acs_url: "https://sp/acs",
                sp_entity_id: "https://sp",
                idp_entity_id: "https://idp",
                sso_url: "https://idp/ecp",
                relay_state: Some("/app"),
                is_passive: false,
            },
        );
        let doc = xml::parse(&envelope).unwrap();
        let header = child_element(doc.root_element(), NS_SOAP_ENV, "Header").unwrap();

        let paos = child_element(header, NS_PAOS, "Request").unwrap();
        assert_eq!(paos.attribute("responseConsumerURL"), Some("https://sp/acs"));
        assert_eq!(paos.attribute("service"), Some(ECP_SERVICE));

        let ecp = child_element(header, NS_ECP, "Request").unwrap();
        let idp_list = child_element(ecp, NS_PROTOCOL, "IDPList").unwrap();
        let entry = child_element(idp_list, NS_PROTOCOL, "IDPEntry").unwrap();
        assert_eq!(entry.attribute("Loc"), Some("https://idp/ecp"));
        assert_eq!(entry.attribute("ProviderID"), Some("https://idp"));

        let message = message_root(&doc).unwrap();
        assert!(is_element(message, NS_PROTOCOL, "AuthnRequest"));

        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.relay_state.as_deref(), Some("/app"));
        assert_eq!(decoded.kind, MessageKind::Request);
    }

    #[test]
    fn test_decode_response_envelope() {
        let envelope = wrap(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="r"/>"#,
        );
        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.kind, MessageKind::Response);
        assert_eq!(decoded.binding, Binding::Paos);
    }

    #[test]
    fn test_decode_rejects_non_envelope_and_empty_body() {
        assert!(decode("<samlp:Response xmlns:samlp=\"urn:x\"/>").is_err());
        let empty = format!(
            r#"<soap:Envelope xmlns:soap="{}"><soap:Body></soap:Body></soap:Envelope>"#,
            NS_SOAP_ENV
        );
        assert!(decode(&empty).is_err());
    }
}
