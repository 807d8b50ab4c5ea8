//! Enveloped-signature verification.
//!
//! Only a `ds:Signature` that is a direct child of the element it signs is
//! considered, and its single Reference must point at that element's `ID`.
//! A document in which the ID occurs more than once is rejected outright so
//! a wrapped copy can never be the one that was verified.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::hash::hash;
use roxmltree::{Document, Node};
use subtle::ConstantTimeEq;

use super::{
    KeyFamily, KeyNameTransformer, TrustKey, digest_method, signature_method, verify_bytes,
};
use crate::saml::{
    binding::QuerySignature,
    constants::*,
    error::SamlError,
    xml::{
        self, C14nOptions, canonicalize, child_element, child_elements, compact_text,
        elements_with_id, find_comment_in_text, trimmed_text,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// Label of the trusted key that verified the signature.
    pub key: String,
    /// ID of the signed element; empty for query signatures.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified(VerifiedSignature),
    Absent,
}

impl SignatureCheck {
    pub fn is_verified(&self) -> bool {
        matches!(self, SignatureCheck::Verified(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureVerifier<'k> {
    keys: &'k [TrustKey],
    transformer: KeyNameTransformer,
    strict_comments: bool,
}

impl<'k> SignatureVerifier<'k> {
    pub fn new(keys: &'k [TrustKey], transformer: KeyNameTransformer) -> Self {
        Self {
            keys,
            transformer,
            strict_comments: true,
        }
    }

    pub fn strict_comments(mut self, strict: bool) -> Self {
        self.strict_comments = strict;
        self
    }

    /// Verify the enveloped signature of `element`, if it has one.
    pub fn verify_element(
        &self,
        doc: &Document<'_>,
        element: Node<'_, '_>,
        key_name_hint: Option<&str>,
    ) -> Result<SignatureCheck, SamlError> {
        let mut signatures = child_elements(element, NS_DSIG, "Signature");
        let Some(signature) = signatures.next() else {
            return Ok(SignatureCheck::Absent);
        };
        if signatures.next().is_some() {
            return Err(invalid("more than one signature on element"));
        }

        let id = element
            .attribute("ID")
            .ok_or_else(|| invalid("signed element has no ID"))?;
        if elements_with_id(doc, id).len() != 1 {
            return Err(invalid(format!("ID '{}' is not unique in the document", id)));
        }

        let signed_info = child_element(signature, NS_DSIG, "SignedInfo")
            .ok_or_else(|| invalid("Signature has no SignedInfo"))?;
        let references: Vec<_> = child_elements(signed_info, NS_DSIG, "Reference").collect();
        let [reference] = references.as_slice() else {
            return Err(invalid("SignedInfo must carry exactly one Reference"));
        };
        if reference.attribute("URI") != Some(format!("#{}", id).as_str()) {
            return Err(invalid("Reference does not point at the signed element"));
        }

        let mut content_opts = C14nOptions::default();
        let mut enveloped = false;
        if let Some(transforms) = child_element(*reference, NS_DSIG, "Transforms") {
            for transform in child_elements(transforms, NS_DSIG, "Transform") {
                match transform.attribute("Algorithm").unwrap_or_default() {
                    ALG_ENVELOPED_SIGNATURE => enveloped = true,
                    algorithm @ (ALG_EXC_C14N | ALG_EXC_C14N_WITH_COMMENTS) => {
                        content_opts = c14n_options(transform, algorithm);
                    }
                    other => {
                        return Err(invalid(format!("unsupported transform '{}'", other)));
                    }
                }
            }
        }
        if enveloped {
            content_opts.exclude = Some(signature.id());
        }

        if self.strict_comments
            && let Some(name) = find_comment_in_text(element, Some(signature.id()))
        {
            return Err(invalid(format!("comment inside signed text of <{}>", name)));
        }

        let digest_alg = child_element(*reference, NS_DSIG, "DigestMethod")
            .and_then(|n| n.attribute("Algorithm"))
            .ok_or_else(|| invalid("Reference has no DigestMethod"))?;
        let expected_digest = child_element(*reference, NS_DSIG, "DigestValue")
            .map(compact_text)
            .ok_or_else(|| invalid("Reference has no DigestValue"))?;
        let expected_digest = STANDARD
            .decode(expected_digest)
            .map_err(|_| invalid("DigestValue is not base64"))?;
        let canonical = canonicalize(element, &content_opts);
        let actual_digest = hash(digest_method(digest_alg)?, canonical.as_bytes())?;
        if !bool::from(actual_digest[..].ct_eq(&expected_digest[..])) {
            return Err(invalid("digest mismatch: signed content was altered"));
        }

        let c14n_method = child_element(signed_info, NS_DSIG, "CanonicalizationMethod")
            .ok_or_else(|| invalid("SignedInfo has no CanonicalizationMethod"))?;
        let signed_info_opts = match c14n_method.attribute("Algorithm").unwrap_or_default() {
            algorithm @ (ALG_EXC_C14N | ALG_EXC_C14N_WITH_COMMENTS) => {
                c14n_options(c14n_method, algorithm)
            }
            other => {
                return Err(invalid(format!(
                    "unsupported canonicalization '{}'",
                    other
                )));
            }
        };
        let sig_alg = child_element(signed_info, NS_DSIG, "SignatureMethod")
            .and_then(|n| n.attribute("Algorithm"))
            .ok_or_else(|| invalid("SignedInfo has no SignatureMethod"))?;
        let signature_value = child_element(signature, NS_DSIG, "SignatureValue")
            .map(compact_text)
            .ok_or_else(|| invalid("Signature has no SignatureValue"))?;
        let signature_value = STANDARD
            .decode(signature_value)
            .map_err(|_| invalid("SignatureValue is not base64"))?;
        let signed_bytes = canonicalize(signed_info, &signed_info_opts);

        let hints = KeyHints::from_signature(signature, key_name_hint);
        let key = self.try_keys(&hints, sig_alg, signed_bytes.as_bytes(), &signature_value)?;
        tracing::debug!(reference = %id, key = %key, "XML signature verified");
        Ok(SignatureCheck::Verified(VerifiedSignature {
            key,
            reference: id.to_string(),
        }))
    }

    /// Verify a Redirect binding query signature.
    pub fn verify_query(&self, query: &QuerySignature) -> Result<VerifiedSignature, SamlError> {
        let key = self.try_keys(
            &KeyHints::default(),
            &query.sig_alg,
            query.signed_content.as_bytes(),
            &query.signature,
        )?;
        tracing::debug!(key = %key, "Query signature verified");
        Ok(VerifiedSignature {
            key,
            reference: String::new(),
        })
    }

    /// Hinted keys first, then every remaining key in trust order.
    fn try_keys(
        &self,
        hints: &KeyHints,
        sig_alg: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<String, SamlError> {
        let (_, family) = signature_method(sig_alg)?;
        let usable: Vec<&TrustKey> = self
            .keys
            .iter()
            .filter(|k| KeyFamily::of(k.public_key()) == Some(family))
            .collect();
        if usable.is_empty() {
            return Err(SamlError::UnknownKey(format!(
                "no trusted key for algorithm '{}'",
                sig_alg
            )));
        }

        let (hinted, rest): (Vec<&TrustKey>, Vec<&TrustKey>) = usable
            .into_iter()
            .partition(|k| hints.matches(k, self.transformer));
        if !hinted.is_empty() {
            tracing::debug!(hinted = hinted.len(), "Trying keys resolved from KeyInfo first");
        }

        for key in hinted.iter().chain(rest.iter()) {
            if verify_bytes(key.public_key(), sig_alg, data, signature)? {
                return Ok(key.label().to_string());
            }
        }
        Err(invalid("signature does not verify with any trusted key"))
    }
}

/// Verify the signature on the document element of `signed_xml`.
pub fn verify(
    signed_xml: &str,
    keys: &[TrustKey],
    transformer: KeyNameTransformer,
    key_name_hint: Option<&str>,
) -> Result<SignatureCheck, SamlError> {
    let doc = xml::parse(signed_xml)?;
    SignatureVerifier::new(keys, transformer).verify_element(&doc, doc.root_element(), key_name_hint)
}

fn invalid(message: impl Into<String>) -> SamlError {
    SamlError::InvalidSignature(message.into())
}

fn c14n_options(method: Node<'_, '_>, algorithm: &str) -> C14nOptions {
    let inclusive_prefixes = child_element(method, NS_EXC_C14N, "InclusiveNamespaces")
        .and_then(|n| n.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    C14nOptions {
        with_comments: algorithm == ALG_EXC_C14N_WITH_COMMENTS,
        inclusive_prefixes,
        exclude: None,
    }
}

#[derive(Debug, Default)]
struct KeyHints {
    key_names: Vec<String>,
    certificates: Vec<Vec<u8>>,
}

impl KeyHints {
    fn from_signature(signature: Node<'_, '_>, explicit: Option<&str>) -> Self {
        let mut hints = KeyHints::default();
        hints.key_names.extend(explicit.map(str::to_string));
        if let Some(key_info) = child_element(signature, NS_DSIG, "KeyInfo") {
            hints
                .key_names
                .extend(child_elements(key_info, NS_DSIG, "KeyName").map(trimmed_text));
            for data in child_elements(key_info, NS_DSIG, "X509Data") {
                hints.certificates.extend(
                    child_elements(data, NS_DSIG, "X509Certificate")
                        .filter_map(|c| STANDARD.decode(compact_text(c)).ok()),
                );
            }
        }
        hints
    }

    fn matches(&self, key: &TrustKey, transformer: KeyNameTransformer) -> bool {
        self.key_names.iter().any(|n| key.matches_name(n, transformer))
            || self.certificates.iter().any(|der| key.matches_certificate(der))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::saml::signature::{SigningKey, test_support::generate_certificate, sign_root};

    const UNSIGNED: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1" Version="2.0"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Attribute Name="mail"><saml:AttributeValue>bburke@redhat.com</saml:AttributeValue></saml:Attribute></samlp:Response>"#;

    fn signer(cn: &str) -> (SigningKey, TrustKey) {
        let (key, cert) = generate_certificate(cn);
        let signing = SigningKey::new(key, cert).unwrap();
        let trust = signing.trust_key().unwrap();
        (signing, trust)
    }

    #[test]
    fn test_valid_signature_verifies() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let check = verify(&signed, &[trust.clone()], KeyNameTransformer::KeyId, None).unwrap();
        assert_eq!(
            check,
            SignatureCheck::Verified(VerifiedSignature {
                key: trust.key_id().to_string(),
                reference: "_r1".into(),
            })
        );
    }

    #[test]
    fn test_unsigned_is_absent() {
        let (_, trust) = signer("idp");
        assert_eq!(
            verify(UNSIGNED, &[trust], KeyNameTransformer::KeyId, None).unwrap(),
            SignatureCheck::Absent
        );
    }

    #[test]
    fn test_tampered_value_fails() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let tampered = signed.replace("bburke@redhat.com", "admin@redhat.com");
        assert!(matches!(
            verify(&tampered, &[trust], KeyNameTransformer::KeyId, None),
            Err(SamlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_comment_injected_into_signed_text() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let injected = signed.replace("bburke@redhat.com", "bburke@redhat.com<!---->.evil.com");
        let keys = [trust];

        let doc = xml::parse(&injected).unwrap();
        let strict = SignatureVerifier::new(&keys, KeyNameTransformer::KeyId);
        assert!(matches!(
            strict.verify_element(&doc, doc.root_element(), None),
            Err(SamlError::InvalidSignature(_))
        ));

        // The text changed, so the digest breaks even without the policy
        let lenient = strict.strict_comments(false);
        assert!(lenient.verify_element(&doc, doc.root_element(), None).is_err());
    }

    #[test]
    fn test_comment_without_text_change_is_dropped_by_exc_c14n() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let injected = signed.replace("bburke@redhat.com", "bburke@<!--x-->redhat.com");
        let keys = [trust];
        let doc = xml::parse(&injected).unwrap();
        let verifier = SignatureVerifier::new(&keys, KeyNameTransformer::KeyId);
        assert!(verifier.verify_element(&doc, doc.root_element(), None).is_err());
        assert!(
            verifier
                .strict_comments(false)
                .verify_element(&doc, doc.root_element(), None)
                .unwrap()
                .is_verified()
        );
    }

    #[test]
    fn test_key_outside_trust_set_is_invalid() {
        let (signing, _) = signer("idp");
        let (_, other) = signer("other");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        assert!(matches!(
            verify(&signed, &[other], KeyNameTransformer::KeyId, None),
            Err(SamlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_no_keys_is_unknown_key() {
        let (signing, _) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        assert!(matches!(
            verify(&signed, &[], KeyNameTransformer::KeyId, None),
            Err(SamlError::UnknownKey(_))
        ));
    }

    #[rstest]
    #[case(KeyNameTransformer::None)]
    #[case(KeyNameTransformer::KeyId)]
    #[case(KeyNameTransformer::CertSubject)]
    fn test_any_trusted_key_verifies(#[case] mode: KeyNameTransformer) {
        let (old_signing, old_trust) = signer("idp-old");
        let (new_signing, new_trust) = signer("idp-new");
        let keys = [old_trust, new_trust.clone()];

        for signing in [&old_signing, &new_signing] {
            let signed = sign_root(UNSIGNED, signing).unwrap();
            assert!(verify(&signed, &keys, mode, None).unwrap().is_verified());
        }

        // A misleading KeyName and no certificate still falls back to all keys
        let misnamed = new_signing
            .clone()
            .with_key_name(Some("does-not-exist".into()))
            .without_certificate();
        let signed = sign_root(UNSIGNED, &misnamed).unwrap();
        assert!(verify(&signed, &keys, mode, None).unwrap().is_verified());

        let signed = sign_root(UNSIGNED, &old_signing).unwrap();
        assert!(verify(&signed, &[new_trust], mode, None).is_err());
    }

    #[test]
    fn test_wrapped_duplicate_id_is_rejected() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let wrapped = signed.replace(
            "<saml:Issuer>",
            r#"<saml:Extensions ID="_r1"/><saml:Issuer>"#,
        );
        assert!(matches!(
            verify(&wrapped, &[trust], KeyNameTransformer::KeyId, None),
            Err(SamlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_reference_to_other_element_is_rejected() {
        let (signing, trust) = signer("idp");
        let signed = sign_root(UNSIGNED, &signing).unwrap();
        let retargeted = signed.replace(r##"URI="#_r1""##, r##"URI="#_other""##);
        assert!(matches!(
            verify(&retargeted, &[trust], KeyNameTransformer::KeyId, None),
            Err(SamlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_query_signature() {
        let (signing, trust) = signer("sp");
        let content = "SAMLRequest=abc&RelayState=x&SigAlg=http%3A%2F%2Fwww.w3.org";
        let signature = crate::saml::signature::sign_query(content, &signing).unwrap();
        let query = QuerySignature {
            signed_content: content.to_string(),
            sig_alg: signing.algorithm().to_string(),
            signature: STANDARD.decode(signature).unwrap(),
        };
        let keys = [trust];
        let verifier = SignatureVerifier::new(&keys, KeyNameTransformer::None);
        assert!(verifier.verify_query(&query).is_ok());

        let forged = QuerySignature {
            signed_content: content.replace("RelayState=x", "RelayState=y"),
            ..query
        };
        assert!(matches!(
            verifier.verify_query(&forged),
            Err(SamlError::InvalidSignature(_))
        ));
    }
}
