//! Enveloped signatures for outbound messages (and the IdP simulator in tests).

use base64::{Engine, engine::general_purpose::STANDARD};
use roxmltree::Node;
use sha2::{Digest, Sha256};

use super::{SigningKey, sign_bytes};
use crate::saml::{
    constants::*,
    error::SamlError,
    xml::{self, C14nOptions, canonicalize, child_element, elements_with_id, escape_text},
};

/// Sign the document element of `xml`.
pub fn sign_root(xml: &str, key: &SigningKey) -> Result<String, SamlError> {
    let doc = xml::parse(xml)?;
    sign_node(xml, doc.root_element(), key)
}

/// Sign the element whose `ID` is `id`, leaving the rest of the document
/// byte-for-byte unchanged.
pub fn sign_element(xml: &str, id: &str, key: &SigningKey) -> Result<String, SamlError> {
    let doc = xml::parse(xml)?;
    let matches = elements_with_id(&doc, id);
    let [node] = matches.as_slice() else {
        return Err(SamlError::Internal(format!(
            "expected exactly one element with ID '{}'",
            id
        )));
    };
    sign_node(xml, *node, key)
}

/// Base64 signature over the exact bytes of a Redirect query string.
pub fn sign_query(query: &str, key: &SigningKey) -> Result<String, SamlError> {
    Ok(STANDARD.encode(sign_bytes(key.private_key(), query.as_bytes())?))
}

fn signed_info(ns_decl: &str, algorithm: &str, id: &str, digest: &str) -> String {
    format!(
        concat!(
            "<ds:SignedInfo{ns}>",
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{alg}"/>"#,
            r##"<ds:Reference URI="#{id}">"##,
            "<ds:Transforms>",
            r#"<ds:Transform Algorithm="{enveloped}"/>"#,
            r#"<ds:Transform Algorithm="{c14n}"/>"#,
            "</ds:Transforms>",
            r#"<ds:DigestMethod Algorithm="{digest_alg}"/>"#,
            "<ds:DigestValue>{digest}</ds:DigestValue>",
            "</ds:Reference>",
            "</ds:SignedInfo>"
        ),
        ns = ns_decl,
        c14n = ALG_EXC_C14N,
        alg = algorithm,
        id = id,
        enveloped = ALG_ENVELOPED_SIGNATURE,
        digest_alg = ALG_DIGEST_SHA256,
        digest = digest,
    )
}

fn sign_node(xml: &str, node: Node<'_, '_>, key: &SigningKey) -> Result<String, SamlError> {
    let id = node
        .attribute("ID")
        .ok_or_else(|| SamlError::Internal("element to sign has no ID".into()))?;

    let canonical = canonicalize(node, &C14nOptions::default());
    let digest = STANDARD.encode(Sha256::digest(canonical.as_bytes()));

    // SignedInfo is the c14n apex, so its canonical form carries xmlns:ds
    // no matter where the Signature ends up.
    let standalone = signed_info(
        &format!(r#" xmlns:ds="{}""#, NS_DSIG),
        key.algorithm(),
        id,
        &digest,
    );
    let signed_info_doc = xml::parse(&standalone)?;
    let canonical_signed_info =
        canonicalize(signed_info_doc.root_element(), &C14nOptions::default());
    let signature_value =
        STANDARD.encode(sign_bytes(key.private_key(), canonical_signed_info.as_bytes())?);

    let mut key_info = String::new();
    if let Some(name) = key.key_name() {
        key_info.push_str(&format!("<ds:KeyName>{}</ds:KeyName>", escape_text(name)));
    }
    if key.embeds_certificate() {
        key_info.push_str(&format!(
            "<ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data>",
            key.certificate_base64()?
        ));
    }
    if !key_info.is_empty() {
        key_info = format!("<ds:KeyInfo>{}</ds:KeyInfo>", key_info);
    }

    let signature = format!(
        r#"<ds:Signature xmlns:ds="{}">{}<ds:SignatureValue>{}</ds:SignatureValue>{}</ds:Signature>"#,
        NS_DSIG,
        signed_info("", key.algorithm(), id, &digest),
        signature_value,
        key_info
    );

    Ok(insert_signature(xml, node, &signature))
}

/// Insert after the element's `Issuer`, or as its first child.
fn insert_signature(xml: &str, node: Node<'_, '_>, signature: &str) -> String {
    if let Some(issuer) = child_element(node, NS_ASSERTION, "Issuer") {
        let at = issuer.range().end;
        return format!("{}{}{}", &xml[..at], signature, &xml[at..]);
    }
    if let Some(first) = node.first_child() {
        let at = first.range().start;
        return format!("{}{}{}", &xml[..at], signature, &xml[at..]);
    }

    // Self-closing element: expand to a start and end tag
    let range = node.range();
    let source = &xml[range.clone()];
    let start_tag = source.trim_end_matches("/>").trim_end();
    let qname = start_tag[1..]
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or_default();
    format!(
        "{}{}>{}</{}>{}",
        &xml[..range.start],
        start_tag,
        signature,
        qname,
        &xml[range.end..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::signature::{
        KeyNameTransformer, SignatureCheck, test_support::generate_certificate, verify,
    };

    fn key() -> SigningKey {
        let (private_key, cert) = generate_certificate("signer");
        SigningKey::new(private_key, cert).unwrap()
    }

    #[test]
    fn test_signature_follows_issuer() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_l1"><saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">sp</saml:Issuer><saml:NameID xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">u</saml:NameID></samlp:LogoutRequest>"#;
        let key = key();
        let signed = sign_root(xml, &key).unwrap();
        let issuer_end = signed.find("</saml:Issuer>").unwrap();
        let signature_start = signed.find("<ds:Signature").unwrap();
        let name_id_start = signed.find("<saml:NameID").unwrap();
        assert!(issuer_end < signature_start && signature_start < name_id_start);

        let check = verify(&signed, &[key.trust_key().unwrap()], KeyNameTransformer::KeyId, None)
            .unwrap();
        assert!(matches!(check, SignatureCheck::Verified(_)));
    }

    #[test]
    fn test_sign_nested_element() {
        let xml = "<r xmlns=\"urn:outer\">\n  <a:Assertion xmlns:a=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"_a1\">\n    <a:Issuer>idp</a:Issuer>\n    <a:Subject>s</a:Subject>\n  </a:Assertion>\n</r>";
        let key = key();
        let signed = sign_element(xml, "_a1", &key).unwrap();
        let doc = xml::parse(&signed).unwrap();
        let assertion = doc.root_element().first_element_child().unwrap();
        let keys = [key.trust_key().unwrap()];
        let verifier = crate::saml::signature::SignatureVerifier::new(&keys, KeyNameTransformer::None);
        assert!(verifier.verify_element(&doc, assertion, None).unwrap().is_verified());
    }

    #[test]
    fn test_self_closing_element_is_expanded() {
        let xml = r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_x"/>"#;
        let key = key();
        let signed = sign_root(xml, &key).unwrap();
        assert!(signed.ends_with("</ds:Signature></samlp:AuthnRequest>"));
        let check = verify(&signed, &[key.trust_key().unwrap()], KeyNameTransformer::KeyId, None)
            .unwrap();
        assert!(check.is_verified());
    }

    #[test]
    fn test_missing_id_is_an_error() {
        assert!(sign_root("<x/>", &key()).is_err());
        assert!(sign_element("<x ID=\"a\"/>", "b", &key()).is_err());
    }
}
