use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    pkey::{PKey, Private, Public},
    x509::X509,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::signature_algorithm_for;
use crate::saml::error::SamlError;

/// How a `ds:KeyName` in an inbound signature is matched against trusted keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyNameTransformer {
    /// KeyName is ignored; every key is a candidate.
    None,
    /// KeyName is the configured key name or the certificate thumbprint.
    #[default]
    KeyId,
    /// KeyName is the certificate subject DN.
    CertSubject,
}

/// Strip PEM armor, leaving the base64 body on one line.
pub(crate) fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("")
}

fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Subject DN rendered as `CN=..,O=..` in certificate order.
fn subject_dn(cert: &X509) -> String {
    cert.subject_name()
        .entries()
        .map(|entry| {
            let attr = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|v| v.to_string())
                .unwrap_or_default();
            format!("{}={}", attr, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_dn(dn: &str) -> Vec<String> {
    dn.split(',')
        .map(|rdn| {
            let (attr, value) = rdn.split_once('=').unwrap_or((rdn, ""));
            format!("{}={}", attr.trim().to_ascii_uppercase(), value.trim())
        })
        .filter(|rdn| rdn != "=")
        .collect()
}

/// A certificate or raw public key trusted to sign for a tenant's IdP.
#[derive(Clone)]
pub struct TrustKey {
    name: Option<String>,
    key_id: String,
    subject: Option<String>,
    certificate_der: Option<Vec<u8>>,
    public_key: PKey<Public>,
}

impl TrustKey {
    pub fn from_certificate(cert: &X509, name: Option<String>) -> Result<Self, SamlError> {
        let der = cert.to_der()?;
        Ok(Self {
            name,
            key_id: thumbprint(&der),
            subject: Some(subject_dn(cert)),
            public_key: cert.public_key()?,
            certificate_der: Some(der),
        })
    }

    /// Load a certificate from PEM, or from a bare base64 body as found in
    /// IdP metadata.
    pub fn from_certificate_pem(pem: &str, name: Option<String>) -> Result<Self, SamlError> {
        let cert = if pem.contains("-----BEGIN") {
            X509::from_pem(pem.as_bytes())
        } else {
            let der = STANDARD
                .decode(strip_pem_headers(pem))
                .map_err(|e| SamlError::Configuration(format!("invalid certificate: {}", e)))?;
            X509::from_der(&der)
        }
        .map_err(|e| SamlError::Configuration(format!("invalid certificate: {}", e)))?;
        Self::from_certificate(&cert, name)
    }

    /// A bare public key. Only the configured name and the SPKI thumbprint can
    /// be matched by KeyName.
    pub fn from_public_key_pem(pem: &str, name: Option<String>) -> Result<Self, SamlError> {
        let public_key = PKey::public_key_from_pem(pem.as_bytes())
            .map_err(|e| SamlError::Configuration(format!("invalid public key: {}", e)))?;
        Ok(Self {
            name,
            key_id: thumbprint(&public_key.public_key_to_der()?),
            subject: None,
            certificate_der: None,
            public_key,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Configured name, falling back to the thumbprint.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key_id)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    pub fn matches_name(&self, key_name: &str, mode: KeyNameTransformer) -> bool {
        let key_name = key_name.trim();
        match mode {
            KeyNameTransformer::None => false,
            KeyNameTransformer::KeyId => {
                self.name.as_deref() == Some(key_name)
                    || self.key_id.eq_ignore_ascii_case(key_name)
            }
            KeyNameTransformer::CertSubject => self.subject.as_deref().is_some_and(|subject| {
                let ours = normalize_dn(subject);
                let mut theirs = normalize_dn(key_name);
                if ours == theirs {
                    return true;
                }
                theirs.reverse();
                ours == theirs
            }),
        }
    }

    pub fn matches_certificate(&self, der: &[u8]) -> bool {
        self.certificate_der.as_deref() == Some(der)
    }
}

impl std::fmt::Debug for TrustKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustKey")
            .field("name", &self.name)
            .field("key_id", &self.key_id)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Private key and certificate used to sign outbound messages.
#[derive(Clone)]
pub struct SigningKey {
    private_key: PKey<Private>,
    certificate: X509,
    key_name: Option<String>,
    embed_certificate: bool,
}

impl SigningKey {
    pub fn new(private_key: PKey<Private>, certificate: X509) -> Result<Self, SamlError> {
        if !certificate.public_key()?.public_eq(&private_key) {
            return Err(SamlError::Configuration(
                "signing key does not match its certificate".into(),
            ));
        }
        let key_name = Some(thumbprint(&certificate.to_der()?));
        Ok(Self {
            private_key,
            certificate,
            key_name,
            embed_certificate: true,
        })
    }

    /// The private key must be in PEM format (PKCS#8 or PKCS#1).
    pub fn from_pem(private_key_pem: &str, certificate_pem: &str) -> Result<Self, SamlError> {
        let private_key = PKey::private_key_from_pem(private_key_pem.as_bytes()).map_err(|e| {
            SamlError::Configuration(format!(
                "Failed to parse private key (expected PEM format): {}",
                e
            ))
        })?;
        let certificate = X509::from_pem(certificate_pem.as_bytes()).map_err(|e| {
            SamlError::Configuration(format!("Failed to parse certificate: {}", e))
        })?;
        Self::new(private_key, certificate)
    }

    /// Replace the `ds:KeyName` written into signatures; `None` omits it.
    pub fn with_key_name(mut self, key_name: Option<String>) -> Self {
        self.key_name = key_name;
        self
    }

    /// Leave the certificate out of `ds:KeyInfo`.
    pub fn without_certificate(mut self) -> Self {
        self.embed_certificate = false;
        self
    }

    pub fn algorithm(&self) -> &'static str {
        signature_algorithm_for(&self.private_key)
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub(crate) fn embeds_certificate(&self) -> bool {
        self.embed_certificate
    }

    /// DER certificate as single-line base64.
    pub fn certificate_base64(&self) -> Result<String, SamlError> {
        Ok(STANDARD.encode(self.certificate.to_der()?))
    }

    /// The verification counterpart of this key.
    pub fn trust_key(&self) -> Result<TrustKey, SamlError> {
        TrustKey::from_certificate(&self.certificate, None)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm())
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{test_support::generate_certificate, *};

    #[test]
    fn test_strip_pem_headers() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n  abcd\n-----END CERTIFICATE-----\n";
        assert_eq!(strip_pem_headers(pem), "MIIBabcd");
    }

    #[test]
    fn test_certificate_from_bare_base64() {
        let (_, cert) = generate_certificate("idp.example.com");
        let pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
        let from_pem = TrustKey::from_certificate_pem(&pem, None).unwrap();
        let from_body = TrustKey::from_certificate_pem(&strip_pem_headers(&pem), None).unwrap();
        assert_eq!(from_pem.key_id(), from_body.key_id());
        assert_eq!(from_pem.subject(), Some("CN=idp.example.com,O=Example"));
    }

    #[rstest]
    #[case(KeyNameTransformer::KeyId, "primary", true)]
    #[case(KeyNameTransformer::KeyId, "other", false)]
    #[case(KeyNameTransformer::CertSubject, "CN=idp.example.com,O=Example", true)]
    #[case(KeyNameTransformer::CertSubject, "O=Example, CN=idp.example.com", true)]
    #[case(KeyNameTransformer::CertSubject, "cn=idp.example.com,o=Example", true)]
    #[case(KeyNameTransformer::CertSubject, "CN=evil.example.com,O=Example", false)]
    #[case(KeyNameTransformer::None, "primary", false)]
    fn test_key_name_matching(
        #[case] mode: KeyNameTransformer,
        #[case] key_name: &str,
        #[case] expected: bool,
    ) {
        let (_, cert) = generate_certificate("idp.example.com");
        let key = TrustKey::from_certificate(&cert, Some("primary".into())).unwrap();
        assert_eq!(key.matches_name(key_name, mode), expected);
    }

    #[test]
    fn test_key_id_matches_thumbprint() {
        let (_, cert) = generate_certificate("idp.example.com");
        let key = TrustKey::from_certificate(&cert, None).unwrap();
        let upper = key.key_id().to_ascii_uppercase();
        assert!(key.matches_name(&upper, KeyNameTransformer::KeyId));
        assert_eq!(key.label(), key.key_id());
    }

    #[test]
    fn test_signing_key_rejects_mismatched_certificate() {
        let (key_a, _) = generate_certificate("a");
        let (_, cert_b) = generate_certificate("b");
        assert!(matches!(
            SigningKey::new(key_a, cert_b),
            Err(SamlError::Configuration(_))
        ));
    }

    #[test]
    fn test_signing_key_from_pem() {
        let (key, cert) = generate_certificate("sp.example.com");
        let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
        let signing = SigningKey::from_pem(&key_pem, &cert_pem).unwrap();
        assert_eq!(
            signing.algorithm(),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"
        );
        assert_eq!(signing.key_name(), Some(signing.trust_key().unwrap().key_id()));
        assert!(SigningKey::from_pem("not a key", &cert_pem).is_err());
    }
}
