//! XML-Encryption of assertions: RSA key transport, AES content encryption.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    encrypt::Decrypter,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{Cipher, Crypter, Mode, decrypt_aead},
};
use roxmltree::Node;

use super::{
    constants::*,
    error::SamlError,
    xml::{child_element, compact_text},
};

const ALG_RSA_OAEP_11: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
const ALG_MGF1_SHA1: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha1";
const ALG_MGF1_SHA256: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha256";
const NS_XENC11: &str = "http://www.w3.org/2009/xmlenc11#";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

fn failed(message: impl Into<String>) -> SamlError {
    SamlError::DecryptionFailed(message.into())
}

#[derive(Clone, Copy)]
enum ContentCipher {
    Cbc(Cipher),
    Gcm(Cipher),
}

impl ContentCipher {
    fn from_uri(uri: &str) -> Result<Self, SamlError> {
        match uri {
            ALG_AES128_CBC => Ok(ContentCipher::Cbc(Cipher::aes_128_cbc())),
            ALG_AES192_CBC => Ok(ContentCipher::Cbc(Cipher::aes_192_cbc())),
            ALG_AES256_CBC => Ok(ContentCipher::Cbc(Cipher::aes_256_cbc())),
            ALG_AES128_GCM => Ok(ContentCipher::Gcm(Cipher::aes_128_gcm())),
            ALG_AES256_GCM => Ok(ContentCipher::Gcm(Cipher::aes_256_gcm())),
            other => Err(failed(format!("unsupported content encryption '{}'", other))),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            ContentCipher::Cbc(c) | ContentCipher::Gcm(c) => c.key_len(),
        }
    }

    fn decrypt(&self, key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
        match *self {
            ContentCipher::Cbc(cipher) => {
                let iv_len = cipher.iv_len()?;
                let block = cipher.block_size();
                if data.len() < iv_len + block || (data.len() - iv_len) % block != 0 {
                    return None;
                }
                let (iv, ciphertext) = data.split_at(iv_len);
                let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv)).ok()?;
                crypter.pad(false);
                let mut out = vec![0; ciphertext.len() + block];
                let mut n = crypter.update(ciphertext, &mut out).ok()?;
                n += crypter.finalize(&mut out[n..]).ok()?;
                out.truncate(n);
                // ISO 10126: only the final byte (pad length) is defined
                let pad = *out.last()? as usize;
                if pad == 0 || pad > block || pad > out.len() {
                    return None;
                }
                out.truncate(out.len() - pad);
                Some(out)
            }
            ContentCipher::Gcm(cipher) => {
                if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
                    return None;
                }
                let (iv, rest) = data.split_at(GCM_IV_LEN);
                let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
                decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag).ok()
            }
        }
    }
}

#[derive(Clone, Copy)]
enum KeyTransport {
    Oaep {
        digest: MessageDigest,
        mgf1: MessageDigest,
    },
    Pkcs1,
}

impl KeyTransport {
    fn from_method(method: Node<'_, '_>) -> Result<Self, SamlError> {
        let digest = match child_element(method, NS_DSIG, "DigestMethod")
            .and_then(|n| n.attribute("Algorithm"))
        {
            None | Some(ALG_DIGEST_SHA1) => MessageDigest::sha1(),
            Some(ALG_DIGEST_SHA256) => MessageDigest::sha256(),
            Some(ALG_DIGEST_SHA512) => MessageDigest::sha512(),
            Some(other) => return Err(failed(format!("unsupported OAEP digest '{}'", other))),
        };
        match method.attribute("Algorithm").unwrap_or_default() {
            ALG_RSA_OAEP_MGF1P => Ok(KeyTransport::Oaep {
                digest,
                mgf1: MessageDigest::sha1(),
            }),
            ALG_RSA_OAEP_11 => {
                let mgf1 = match child_element(method, NS_XENC11, "MGF")
                    .and_then(|n| n.attribute("Algorithm"))
                {
                    None | Some(ALG_MGF1_SHA1) => MessageDigest::sha1(),
                    Some(ALG_MGF1_SHA256) => MessageDigest::sha256(),
                    Some(other) => {
                        return Err(failed(format!("unsupported MGF '{}'", other)));
                    }
                };
                Ok(KeyTransport::Oaep { digest, mgf1 })
            }
            ALG_RSA_1_5 => Ok(KeyTransport::Pkcs1),
            other => Err(failed(format!("unsupported key transport '{}'", other))),
        }
    }

    fn unwrap(&self, key: &PKey<Private>, wrapped: &[u8]) -> Option<Vec<u8>> {
        let mut decrypter = Decrypter::new(key).ok()?;
        match *self {
            KeyTransport::Oaep { digest, mgf1 } => {
                decrypter.set_rsa_padding(Padding::PKCS1_OAEP).ok()?;
                decrypter.set_rsa_oaep_md(digest).ok()?;
                decrypter.set_rsa_mgf1_md(mgf1).ok()?;
            }
            KeyTransport::Pkcs1 => decrypter.set_rsa_padding(Padding::PKCS1).ok()?,
        }
        let mut out = vec![0; decrypter.decrypt_len(wrapped).ok()?];
        let n = decrypter.decrypt(wrapped, &mut out).ok()?;
        out.truncate(n);
        Some(out)
    }
}

fn cipher_value(node: Node<'_, '_>) -> Result<Vec<u8>, SamlError> {
    let value = child_element(node, NS_XENC, "CipherData")
        .and_then(|d| child_element(d, NS_XENC, "CipherValue"))
        .map(compact_text)
        .ok_or_else(|| failed("CipherValue missing"))?;
    STANDARD
        .decode(value)
        .map_err(|_| failed("CipherValue is not base64"))
}

/// Decrypt an `EncryptedAssertion` with the first SP key that succeeds.
///
/// The plaintext is returned as-is. Every failure, including a missing or
/// unsupported algorithm, is [`SamlError::DecryptionFailed`].
pub fn decrypt_assertion(
    encrypted: Node<'_, '_>,
    keys: &[PKey<Private>],
) -> Result<String, SamlError> {
    if keys.is_empty() {
        return Err(failed("no SP decryption key configured"));
    }
    let data = child_element(encrypted, NS_XENC, "EncryptedData")
        .ok_or_else(|| failed("EncryptedAssertion has no EncryptedData"))?;
    let content_cipher = child_element(data, NS_XENC, "EncryptionMethod")
        .and_then(|n| n.attribute("Algorithm"))
        .ok_or_else(|| failed("EncryptedData has no EncryptionMethod"))
        .and_then(ContentCipher::from_uri)?;

    let encrypted_key = child_element(data, NS_DSIG, "KeyInfo")
        .and_then(|ki| child_element(ki, NS_XENC, "EncryptedKey"))
        .or_else(|| child_element(encrypted, NS_XENC, "EncryptedKey"))
        .ok_or_else(|| failed("no EncryptedKey found"))?;
    let transport = child_element(encrypted_key, NS_XENC, "EncryptionMethod")
        .ok_or_else(|| failed("EncryptedKey has no EncryptionMethod"))
        .and_then(KeyTransport::from_method)?;
    let wrapped_key = cipher_value(encrypted_key)?;
    let ciphertext = cipher_value(data)?;

    for (index, key) in keys.iter().enumerate() {
        let Some(session_key) = transport.unwrap(key, &wrapped_key) else {
            tracing::debug!(key_index = index, "Key transport failed with SP key");
            continue;
        };
        if session_key.len() != content_cipher.key_len() {
            continue;
        }
        if let Some(plain) = content_cipher.decrypt(&session_key, &ciphertext) {
            tracing::debug!(key_index = index, "Decrypted assertion");
            return String::from_utf8(plain).map_err(|_| failed("plaintext is not UTF-8"));
        }
    }
    Err(failed("no SP key could decrypt the assertion"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use openssl::{
        encrypt::Encrypter,
        pkey::{PKey, Public},
        rand::rand_bytes,
        rsa::Padding,
        symm::{Cipher, encrypt, encrypt_aead},
    };

    use super::*;

    /// Encrypt `assertion_xml` for `recipient` with RSA-OAEP key transport.
    pub fn encrypt_assertion(assertion_xml: &str, recipient: &PKey<Public>, algorithm: &str) -> String {
        let (cipher, gcm) = match algorithm {
            ALG_AES128_CBC => (Cipher::aes_128_cbc(), false),
            ALG_AES256_CBC => (Cipher::aes_256_cbc(), false),
            ALG_AES128_GCM => (Cipher::aes_128_gcm(), true),
            ALG_AES256_GCM => (Cipher::aes_256_gcm(), true),
            other => panic!("unsupported test algorithm {}", other),
        };
        let mut key = vec![0; cipher.key_len()];
        rand_bytes(&mut key).unwrap();

        let payload = if gcm {
            let mut iv = vec![0; GCM_IV_LEN];
            rand_bytes(&mut iv).unwrap();
            let mut tag = vec![0; GCM_TAG_LEN];
            let ct =
                encrypt_aead(cipher, &key, Some(&iv), &[], assertion_xml.as_bytes(), &mut tag)
                    .unwrap();
            [iv, ct, tag].concat()
        } else {
            let mut iv = vec![0; 16];
            rand_bytes(&mut iv).unwrap();
            let ct = encrypt(cipher, &key, Some(&iv), assertion_xml.as_bytes()).unwrap();
            [iv, ct].concat()
        };

        let mut encrypter = Encrypter::new(recipient).unwrap();
        encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
        let mut wrapped = vec![0; encrypter.encrypt_len(&key).unwrap()];
        let n = encrypter.encrypt(&key, &mut wrapped).unwrap();
        wrapped.truncate(n);

        format!(
            concat!(
                r#"<saml:EncryptedAssertion xmlns:saml="{assertion}">"#,
                r#"<xenc:EncryptedData xmlns:xenc="{xenc}" Type="http://www.w3.org/2001/04/xmlenc#Element">"#,
                r#"<xenc:EncryptionMethod Algorithm="{alg}"/>"#,
                r#"<ds:KeyInfo xmlns:ds="{dsig}"><xenc:EncryptedKey>"#,
                r#"<xenc:EncryptionMethod Algorithm="{transport}"/>"#,
                "<xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData>",
                "</xenc:EncryptedKey></ds:KeyInfo>",
                "<xenc:CipherData><xenc:CipherValue>{payload}</xenc:CipherValue></xenc:CipherData>",
                "</xenc:EncryptedData></saml:EncryptedAssertion>"
            ),
            assertion = NS_ASSERTION,
            xenc = NS_XENC,
            alg = algorithm,
            dsig = NS_DSIG,
            transport = ALG_RSA_OAEP_MGF1P,
            wrapped = STANDARD.encode(wrapped),
            payload = STANDARD.encode(payload),
        )
    }
}
