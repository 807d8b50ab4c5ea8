//! XML-DSig enveloped signatures and Redirect query signatures.

mod keys;
mod signer;
mod verifier;

#[cfg(test)]
pub(crate) use keys::test_support;
pub use keys::{KeyNameTransformer, SigningKey, TrustKey};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    pkey::{Id, PKey, Private, Public},
    sign::{Signer, Verifier},
};
pub use signer::{sign_element, sign_query, sign_root};
pub use verifier::{SignatureCheck, SignatureVerifier, VerifiedSignature, verify};

use super::{constants::*, error::SamlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    fn of<T>(key: &PKey<T>) -> Option<Self> {
        match key.id() {
            Id::RSA => Some(KeyFamily::Rsa),
            Id::EC => Some(KeyFamily::Ec),
            _ => None,
        }
    }
}

/// Digest and key family for a `SignatureMethod` URI.
pub(crate) fn signature_method(uri: &str) -> Result<(MessageDigest, KeyFamily), SamlError> {
    match uri {
        ALG_RSA_SHA1 => Ok((MessageDigest::sha1(), KeyFamily::Rsa)),
        ALG_RSA_SHA256 => Ok((MessageDigest::sha256(), KeyFamily::Rsa)),
        ALG_RSA_SHA512 => Ok((MessageDigest::sha512(), KeyFamily::Rsa)),
        ALG_ECDSA_SHA256 => Ok((MessageDigest::sha256(), KeyFamily::Ec)),
        ALG_ECDSA_SHA384 => Ok((MessageDigest::sha384(), KeyFamily::Ec)),
        other => Err(SamlError::InvalidSignature(format!(
            "unsupported signature algorithm '{}'",
            other
        ))),
    }
}

pub(crate) fn digest_method(uri: &str) -> Result<MessageDigest, SamlError> {
    match uri {
        ALG_DIGEST_SHA1 => Ok(MessageDigest::sha1()),
        ALG_DIGEST_SHA256 => Ok(MessageDigest::sha256()),
        ALG_DIGEST_SHA512 => Ok(MessageDigest::sha512()),
        other => Err(SamlError::InvalidSignature(format!(
            "unsupported digest algorithm '{}'",
            other
        ))),
    }
}

/// Verify `signature` over `data`. Returns `Ok(false)` for a key of the wrong
/// family or a signature that does not verify.
pub(crate) fn verify_bytes(
    key: &PKey<Public>,
    algorithm: &str,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, SamlError> {
    let (digest, family) = signature_method(algorithm)?;
    if KeyFamily::of(key) != Some(family) {
        return Ok(false);
    }
    // XML-DSig carries ECDSA signatures as r || s
    let der;
    let signature = if family == KeyFamily::Ec {
        match ecdsa_raw_to_der(signature) {
            Some(converted) => {
                der = converted;
                der.as_slice()
            }
            None => return Ok(false),
        }
    } else {
        signature
    };
    let mut verifier = Verifier::new(digest, key)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature).unwrap_or(false))
}

/// Sign `data` with SHA-256, returning the XML-DSig encoding of the value.
pub(crate) fn sign_bytes(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, SamlError> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;
    match KeyFamily::of(key) {
        Some(KeyFamily::Ec) => {
            let field_len = key.ec_key()?.group().degree().div_ceil(8) as i32;
            let parsed = EcdsaSig::from_der(&signature)?;
            let mut raw = parsed.r().to_vec_padded(field_len)?;
            raw.extend(parsed.s().to_vec_padded(field_len)?);
            Ok(raw)
        }
        _ => Ok(signature),
    }
}

pub(crate) fn signature_algorithm_for(key: &PKey<Private>) -> &'static str {
    if key.ec_key().is_ok() {
        ALG_ECDSA_SHA256
    } else {
        ALG_RSA_SHA256
    }
}

fn ecdsa_raw_to_der(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(
        BigNum::from_slice(r).ok()?,
        BigNum::from_slice(s).ok()?,
    )
    .ok()?;
    sig.to_der().ok()
}
