//! SP metadata (EntityDescriptor with an SPSSODescriptor) for IdP
//! auto-configuration.

use super::{
    constants::*,
    error::SamlError,
    xml::{escape_attr, escape_text},
};
use crate::tenant::TrustConfig;

fn key_descriptor(usage: &str, certificate_base64: &str) -> String {
    format!(
        r#"
    <md:KeyDescriptor use="{}">
      <ds:KeyInfo xmlns:ds="{}">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
        usage, NS_DSIG, certificate_base64
    )
}

/// Generate the SP metadata document of a tenant.
///
/// The signing certificate is published for `use="signing"`, and also for
/// `use="encryption"` when it belongs to one of the SP decryption keys.
pub fn sp_metadata(config: &TrustConfig) -> Result<String, SamlError> {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="{}" entityID="{}">
  <md:SPSSODescriptor protocolSupportEnumeration="{}" AuthnRequestsSigned="{}" WantAssertionsSigned="{}">"#,
        NS_METADATA,
        escape_attr(&config.sp_entity_id),
        NS_PROTOCOL,
        config.signatures.sign_requests,
        config.signatures.want_assertions_signed,
    );

    if let Some(key) = &config.signing_key {
        let certificate = key.certificate_base64()?;
        xml.push_str(&key_descriptor("signing", &certificate));

        let public_key = key.certificate().public_key()?;
        if config
            .decryption_keys
            .iter()
            .any(|k| k.public_eq(&public_key))
        {
            xml.push_str(&key_descriptor("encryption", &certificate));
        }
    }

    if let Some(slo_url) = &config.slo_url {
        for binding in [BINDING_HTTP_REDIRECT, BINDING_HTTP_POST] {
            xml.push_str(&format!(
                r#"
    <md:SingleLogoutService Binding="{}" Location="{}"/>"#,
                binding,
                escape_attr(slo_url)
            ));
        }
    }

    let name_id_format = config.name_id_format.as_deref().unwrap_or(NAMEID_UNSPECIFIED);
    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{}</md:NameIDFormat>"#,
        escape_text(name_id_format)
    ));

    for (index, binding) in [BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, BINDING_PAOS]
        .into_iter()
        .enumerate()
    {
        let default = if index == 0 { r#" isDefault="true""# } else { "" };
        xml.push_str(&format!(
            r#"
    <md:AssertionConsumerService Binding="{}" Location="{}" index="{}"{}/>"#,
            binding,
            escape_attr(&config.acs_url),
            index,
            default
        ));
    }

    xml.push_str(
        r#"
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
    );

    Ok(xml)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::saml::{
        signature::{SigningKey, test_support::generate_certificate},
        xml::{self, child_elements},
    };

    fn config() -> TrustConfig {
        TrustConfig::new(
            "demo",
            "https://idp.example.com",
            "https://idp.example.com/sso",
            "https://sp.example.com",
            "https://sp.example.com/demo/saml/acs",
        )
    }

    #[test]
    fn test_generate_sp_metadata_basic() {
        let metadata = sp_metadata(&config()).unwrap();

        assert!(metadata.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        let doc = xml::parse(&metadata).unwrap();
        let root = doc.root_element();
        assert_eq!(root.attribute("entityID"), Some("https://sp.example.com"));

        let descriptor = root.first_element_child().unwrap();
        assert_eq!(descriptor.attribute("AuthnRequestsSigned"), Some("false"));
        let acs: Vec<_> = child_elements(descriptor, NS_METADATA, "AssertionConsumerService")
            .map(|n| n.attribute("Binding").unwrap_or_default().to_string())
            .collect();
        assert_eq!(acs, vec![BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, BINDING_PAOS]);
        assert!(metadata.contains(&format!("<md:NameIDFormat>{}</md:NameIDFormat>", NAMEID_UNSPECIFIED)));
        assert!(!metadata.contains("KeyDescriptor"));
        assert!(!metadata.contains("SingleLogoutService"));
    }

    #[test]
    fn test_generate_sp_metadata_with_keys() {
        let (private_key, cert) = generate_certificate("sp");
        let mut config = config();
        config.signing_key = Some(Arc::new(SigningKey::new(private_key.clone(), cert).unwrap()));
        config.decryption_keys = vec![private_key];
        config.slo_url = Some("https://sp.example.com/demo/saml/slo".into());
        config.signatures.sign_requests = true;

        let metadata = sp_metadata(&config).unwrap();
        assert!(metadata.contains(r#"<md:KeyDescriptor use="signing">"#));
        assert!(metadata.contains(r#"<md:KeyDescriptor use="encryption">"#));
        assert!(metadata.contains(r#"AuthnRequestsSigned="true""#));
        assert_eq!(metadata.matches("SingleLogoutService").count(), 2);
        assert!(!metadata.contains("-----BEGIN CERTIFICATE-----"));
    }
}
