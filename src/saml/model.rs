//! Owned views of inbound SAML protocol messages.
//!
//! Parsing never mutates or repairs a message. Anything structurally wrong
//! is reported as [`SamlError::Decode`], and semantic checks (issuer,
//! destination, time windows) are left to the engine.

use chrono::{DateTime, SecondsFormat, Utc};
use roxmltree::Node;
use serde::{Deserialize, Serialize};

use super::{
    constants::*,
    error::SamlError,
    xml::{child_element, child_elements, descendant_element, is_element, text_content, trimmed_text},
};

/// Parse an `xs:dateTime` in UTC.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, SamlError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SamlError::Decode(format!("invalid timestamp '{}': {}", value, e)))
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn optional_instant(node: Node<'_, '_>, attr: &str) -> Result<Option<DateTime<Utc>>, SamlError> {
    node.attribute(attr).map(parse_instant).transpose()
}

fn required_attr(node: Node<'_, '_>, attr: &str) -> Result<String, SamlError> {
    node.attribute(attr).map(str::to_string).ok_or_else(|| {
        SamlError::Decode(format!(
            "{} is missing required attribute {}",
            node.tag_name().name(),
            attr
        ))
    })
}

fn issuer_of(node: Node<'_, '_>) -> Option<String> {
    child_element(node, NS_ASSERTION, "Issuer").map(trimmed_text)
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl StatusInfo {
    pub fn success() -> Self {
        Self {
            code: STATUS_SUCCESS.to_string(),
            sub_code: None,
            message: None,
        }
    }

    fn parse(status: Node<'_, '_>) -> Result<Self, SamlError> {
        let code_node = child_element(status, NS_PROTOCOL, "StatusCode")
            .ok_or_else(|| SamlError::Decode("Status has no StatusCode".into()))?;
        let sub_code = child_element(code_node, NS_PROTOCOL, "StatusCode")
            .and_then(|n| n.attribute("Value"))
            .map(str::to_string);
        Ok(Self {
            code: required_attr(code_node, "Value")?,
            sub_code,
            message: child_element(status, NS_PROTOCOL, "StatusMessage").map(trimmed_text),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    pub fn is_request_denied(&self) -> bool {
        self.code == STATUS_REQUEST_DENIED || self.sub_code.as_deref() == Some(STATUS_REQUEST_DENIED)
    }

    pub fn is_no_passive(&self) -> bool {
        self.sub_code.as_deref() == Some(STATUS_NO_PASSIVE) || self.code == STATUS_NO_PASSIVE
    }

    /// The most specific code available.
    pub fn effective_code(&self) -> &str {
        self.sub_code.as_deref().unwrap_or(&self.code)
    }
}

impl std::fmt::Display for StatusInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sub_code {
            Some(sub) => write!(f, "{} / {}", self.code, sub)?,
            None => write!(f, "{}", self.code)?,
        }
        if let Some(message) = &self.message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol-level fields of a `samlp:Response` (everything but assertions).
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub id: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub issue_instant: DateTime<Utc>,
    pub status: StatusInfo,
}

impl ResponseHeader {
    pub fn parse(node: Node<'_, '_>) -> Result<Self, SamlError> {
        if !is_element(node, NS_PROTOCOL, "Response") {
            return Err(SamlError::Decode(format!(
                "expected samlp:Response, found {}",
                node.tag_name().name()
            )));
        }
        let status = child_element(node, NS_PROTOCOL, "Status")
            .ok_or_else(|| SamlError::Decode("Response has no Status".into()))?;
        Ok(Self {
            id: required_attr(node, "ID")?,
            in_response_to: node.attribute("InResponseTo").map(str::to_string),
            destination: node.attribute("Destination").map(str::to_string),
            issuer: issuer_of(node),
            issue_instant: parse_instant(&required_attr(node, "IssueInstant")?)?,
            status: StatusInfo::parse(status)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assertion
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
}

impl NameId {
    fn parse(node: Node<'_, '_>) -> Self {
        Self {
            value: text_content(node).trim().to_string(),
            format: node.attribute("Format").map(str::to_string),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.format.as_deref() == Some(NAMEID_TRANSIENT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAttribute {
    pub name: String,
    pub name_format: Option<String>,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

impl SamlAttribute {
    fn parse(node: Node<'_, '_>) -> Result<Self, SamlError> {
        let values = child_elements(node, NS_ASSERTION, "AttributeValue")
            .filter(|v| v.attribute((NS_XSI, "nil")) != Some("true"))
            .map(|v| {
                // Typed values (xs:boolean, xs:int) are whitespace-collapsed
                let text = text_content(v);
                if v.attribute((NS_XSI, "type")).is_some() {
                    text.trim().to_string()
                } else {
                    text
                }
            })
            .collect();
        Ok(Self {
            name: required_attr(node, "Name")?,
            name_format: node.attribute("NameFormat").map(str::to_string),
            friendly_name: node.attribute("FriendlyName").map(str::to_string),
            values,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Each inner list is one `AudienceRestriction`; all must be satisfied.
    pub audience_restrictions: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SubjectConfirmation {
    pub method: Option<String>,
    pub recipient: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthnStatement {
    pub authn_instant: Option<DateTime<Utc>>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct Assertion {
    pub id: String,
    pub issuer: Option<String>,
    pub name_id: Option<NameId>,
    pub subject_confirmations: Vec<SubjectConfirmation>,
    pub conditions: Option<Conditions>,
    /// Attributes of every AttributeStatement, in document order.
    pub attributes: Vec<SamlAttribute>,
    pub authn_statement: Option<AuthnStatement>,
}

impl Assertion {
    pub fn parse(node: Node<'_, '_>) -> Result<Self, SamlError> {
        if !is_element(node, NS_ASSERTION, "Assertion") {
            return Err(SamlError::Decode(format!(
                "expected saml:Assertion, found {}",
                node.tag_name().name()
            )));
        }

        let subject = child_element(node, NS_ASSERTION, "Subject");
        let name_id = subject
            .and_then(|s| child_element(s, NS_ASSERTION, "NameID"))
            .map(NameId::parse);

        let mut subject_confirmations = Vec::new();
        if let Some(subject) = subject {
            for sc in child_elements(subject, NS_ASSERTION, "SubjectConfirmation") {
                let data = child_element(sc, NS_ASSERTION, "SubjectConfirmationData");
                subject_confirmations.push(SubjectConfirmation {
                    method: sc.attribute("Method").map(str::to_string),
                    recipient: data
                        .and_then(|d| d.attribute("Recipient"))
                        .map(str::to_string),
                    not_on_or_after: match data {
                        Some(d) => optional_instant(d, "NotOnOrAfter")?,
                        None => None,
                    },
                    in_response_to: data
                        .and_then(|d| d.attribute("InResponseTo"))
                        .map(str::to_string),
                });
            }
        }

        let conditions = match child_element(node, NS_ASSERTION, "Conditions") {
            Some(c) => Some(Conditions {
                not_before: optional_instant(c, "NotBefore")?,
                not_on_or_after: optional_instant(c, "NotOnOrAfter")?,
                audience_restrictions: child_elements(c, NS_ASSERTION, "AudienceRestriction")
                    .map(|r| {
                        child_elements(r, NS_ASSERTION, "Audience")
                            .map(trimmed_text)
                            .collect()
                    })
                    .collect(),
            }),
            None => None,
        };

        let mut attributes = Vec::new();
        for statement in child_elements(node, NS_ASSERTION, "AttributeStatement") {
            for attr in child_elements(statement, NS_ASSERTION, "Attribute") {
                attributes.push(SamlAttribute::parse(attr)?);
            }
        }

        let authn_statement = match child_element(node, NS_ASSERTION, "AuthnStatement") {
            Some(s) => Some(AuthnStatement {
                authn_instant: optional_instant(s, "AuthnInstant")?,
                session_index: s.attribute("SessionIndex").map(str::to_string),
                session_not_on_or_after: optional_instant(s, "SessionNotOnOrAfter")?,
            }),
            None => None,
        };

        Ok(Self {
            id: required_attr(node, "ID")?,
            issuer: issuer_of(node),
            name_id,
            subject_confirmations,
            conditions,
            attributes,
            authn_statement,
        })
    }

    pub fn session_index(&self) -> Option<&str> {
        self.authn_statement
            .as_ref()
            .and_then(|s| s.session_index.as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logout
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LogoutRequestInfo {
    pub id: String,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub name_id: Option<NameId>,
    pub session_indexes: Vec<String>,
}

impl LogoutRequestInfo {
    pub fn parse(node: Node<'_, '_>) -> Result<Self, SamlError> {
        if !is_element(node, NS_PROTOCOL, "LogoutRequest") {
            return Err(SamlError::Decode("expected samlp:LogoutRequest".into()));
        }
        Ok(Self {
            id: required_attr(node, "ID")?,
            issuer: issuer_of(node),
            destination: node.attribute("Destination").map(str::to_string),
            not_on_or_after: optional_instant(node, "NotOnOrAfter")?,
            name_id: descendant_element(node, NS_ASSERTION, "NameID").map(NameId::parse),
            session_indexes: child_elements(node, NS_PROTOCOL, "SessionIndex")
                .map(trimmed_text)
                .collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogoutResponseInfo {
    pub id: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub status: StatusInfo,
}

impl LogoutResponseInfo {
    pub fn parse(node: Node<'_, '_>) -> Result<Self, SamlError> {
        if !is_element(node, NS_PROTOCOL, "LogoutResponse") {
            return Err(SamlError::Decode("expected samlp:LogoutResponse".into()));
        }
        let status = child_element(node, NS_PROTOCOL, "Status")
            .ok_or_else(|| SamlError::Decode("LogoutResponse has no Status".into()))?;
        Ok(Self {
            id: required_attr(node, "ID")?,
            in_response_to: node.attribute("InResponseTo").map(str::to_string),
            destination: node.attribute("Destination").map(str::to_string),
            issuer: issuer_of(node),
            status: StatusInfo::parse(status)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::xml::parse;

    const RESPONSE: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" ID="r1" InResponseTo="ID_req" Destination="https://sp/acs" IssueInstant="2024-01-01T00:00:00Z" Version="2.0">
  <saml:Issuer>https://idp</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="a1" IssueInstant="2024-01-01T00:00:00Z" Version="2.0">
    <saml:Issuer>https://idp</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent">bburke</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData InResponseTo="ID_req" Recipient="https://sp/acs" NotOnOrAfter="2024-01-01T00:05:00.000Z"/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="2023-12-31T23:59:00Z" NotOnOrAfter="2024-01-01T00:05:00Z">
      <saml:AudienceRestriction><saml:Audience>https://sp</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="2024-01-01T00:00:00Z" SessionIndex="idx-1"/>
    <saml:AttributeStatement>
      <saml:Attribute Name="urn:oid:email" FriendlyName="email"><saml:AttributeValue>a@b.c</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="flag"><saml:AttributeValue xsi:type="xs:boolean"> true </saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="Role"><saml:AttributeValue>user</saml:AttributeValue><saml:AttributeValue>manager</saml:AttributeValue></saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn test_parse_response_and_assertion() {
        let doc = parse(RESPONSE).unwrap();
        let root = doc.root_element();
        let header = ResponseHeader::parse(root).unwrap();
        assert_eq!(header.id, "r1");
        assert_eq!(header.in_response_to.as_deref(), Some("ID_req"));
        assert_eq!(header.issuer.as_deref(), Some("https://idp"));
        assert!(header.status.is_success());

        let node = child_element(root, NS_ASSERTION, "Assertion").unwrap();
        let assertion = Assertion::parse(node).unwrap();
        assert_eq!(assertion.name_id.as_ref().unwrap().value, "bburke");
        assert_eq!(assertion.session_index(), Some("idx-1"));
        assert_eq!(assertion.subject_confirmations.len(), 1);
        assert_eq!(
            assertion.conditions.as_ref().unwrap().audience_restrictions,
            vec![vec!["https://sp".to_string()]]
        );
        assert_eq!(assertion.attributes.len(), 3);
        assert_eq!(assertion.attributes[0].friendly_name.as_deref(), Some("email"));
        assert_eq!(assertion.attributes[1].values, vec!["true".to_string()]);
        assert_eq!(assertion.attributes[2].values.len(), 2);
    }

    #[test]
    fn test_status_with_sub_code() {
        let xml = r#"<samlp:Status xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Responder"><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:NoPassive"/></samlp:StatusCode><samlp:StatusMessage>no session</samlp:StatusMessage></samlp:Status>"#;
        let doc = parse(xml).unwrap();
        let status = StatusInfo::parse(doc.root_element()).unwrap();
        assert!(!status.is_success());
        assert!(status.is_no_passive());
        assert!(!status.is_request_denied());
        assert_eq!(status.effective_code(), STATUS_NO_PASSIVE);
        assert_eq!(status.message.as_deref(), Some("no session"));
    }

    #[test]
    fn test_response_without_status_is_decode_error() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="x" IssueInstant="2024-01-01T00:00:00Z"/>"#;
        let doc = parse(xml).unwrap();
        assert!(matches!(
            ResponseHeader::parse(doc.root_element()),
            Err(SamlError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="lr1" Version="2.0" IssueInstant="2024-01-01T00:00:00Z" Destination="https://sp/slo"><saml:Issuer>https://idp</saml:Issuer><saml:NameID>bburke</saml:NameID><samlp:SessionIndex>idx-1</samlp:SessionIndex></samlp:LogoutRequest>"#;
        let doc = parse(xml).unwrap();
        let req = LogoutRequestInfo::parse(doc.root_element()).unwrap();
        assert_eq!(req.id, "lr1");
        assert_eq!(req.name_id.unwrap().value, "bburke");
        assert_eq!(req.session_indexes, vec!["idx-1".to_string()]);
    }

    #[test]
    fn test_instant_round_trip() {
        let instant = parse_instant("2024-03-05T10:11:12.345Z").unwrap();
        assert_eq!(format_instant(instant), "2024-03-05T10:11:12.345Z");
        assert!(parse_instant("yesterday").is_err());
    }
}
