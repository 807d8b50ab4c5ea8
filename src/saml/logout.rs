//! LogoutRequest and LogoutResponse construction.

use chrono::Utc;
use samael::{
    schema::{Issuer, LogoutRequest, NameID},
    traits::ToXml,
};

use super::{
    constants::*,
    error::SamlError,
    model::format_instant,
    request::new_request_id,
    xml::{escape_attr, escape_text},
};

#[derive(Debug, Clone)]
pub struct OutboundLogout {
    pub id: String,
    pub xml: String,
}

/// The principal a LogoutRequest names.
#[derive(Debug, Clone, Copy)]
pub struct LogoutSubject<'a> {
    pub name_id: &'a str,
    pub name_id_format: Option<&'a str>,
    pub session_index: Option<&'a str>,
}

pub fn build_logout_request(
    sp_entity_id: &str,
    destination: &str,
    subject: LogoutSubject<'_>,
) -> Result<OutboundLogout, SamlError> {
    let id = new_request_id();
    let request = LogoutRequest {
        id: Some(id.clone()),
        version: Some("2.0".to_string()),
        issue_instant: Some(Utc::now()),
        destination: Some(destination.to_string()),
        issuer: Some(Issuer {
            value: Some(sp_entity_id.to_string()),
            ..Default::default()
        }),
        name_id: Some(NameID {
            value: subject.name_id.to_string(),
            format: subject.name_id_format.map(str::to_string),
        }),
        session_index: subject.session_index.map(str::to_string),
        signature: None,
    };

    let xml = request
        .to_string()
        .map_err(|e| SamlError::Internal(format!("Failed to serialize LogoutRequest: {:?}", e)))?;
    Ok(OutboundLogout { id, xml })
}

pub fn build_logout_response(
    sp_entity_id: &str,
    destination: &str,
    in_response_to: &str,
    status_code: &str,
) -> OutboundLogout {
    let id = new_request_id();
    let xml = format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
            r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}""#,
            r#" InResponseTo="{in_response_to}">"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            "</samlp:LogoutResponse>"
        ),
        protocol = NS_PROTOCOL,
        assertion = NS_ASSERTION,
        id = id,
        instant = format_instant(Utc::now()),
        destination = escape_attr(destination),
        in_response_to = escape_attr(in_response_to),
        issuer = escape_text(sp_entity_id),
        status = escape_attr(status_code),
    );
    OutboundLogout { id, xml }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::{
        model::{LogoutRequestInfo, LogoutResponseInfo},
        xml,
    };

    #[test]
    fn test_logout_request_carries_name_id_and_session_index() {
        let logout = build_logout_request(
            "https://sp.example.com",
            "https://idp.example.com/slo",
            LogoutSubject {
                name_id: "bburke",
                name_id_format: Some(NAMEID_PERSISTENT),
                session_index: Some("idx-1"),
            },
        )
        .unwrap();

        let doc = xml::parse(&logout.xml).unwrap();
        let info = LogoutRequestInfo::parse(doc.root_element()).unwrap();
        assert_eq!(info.id, logout.id);
        assert_eq!(info.destination.as_deref(), Some("https://idp.example.com/slo"));
        assert_eq!(info.issuer.as_deref(), Some("https://sp.example.com"));
        let name_id = info.name_id.unwrap();
        assert_eq!(name_id.value, "bburke");
        assert_eq!(name_id.format.as_deref(), Some(NAMEID_PERSISTENT));
        assert_eq!(info.session_indexes, vec!["idx-1".to_string()]);
    }

    #[test]
    fn test_logout_response_is_success() {
        let logout = build_logout_response(
            "https://sp.example.com",
            "https://idp.example.com/slo",
            "ID_req",
            STATUS_SUCCESS,
        );
        let doc = xml::parse(&logout.xml).unwrap();
        let info = LogoutResponseInfo::parse(doc.root_element()).unwrap();
        assert_eq!(info.in_response_to.as_deref(), Some("ID_req"));
        assert!(info.status.is_success());
    }
}
