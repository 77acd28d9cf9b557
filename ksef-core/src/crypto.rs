//! Envelope encryption, hashing and at-rest sealing.
//!
//! Invoices and export keys travel as AES-256-CBC ciphertext whose key is wrapped with
//! RSA-OAEP (SHA-256, MGF1-SHA-256) under the platform's published certificate.
pub mod der;
pub mod xades;

use aes::Aes256;
use base64ct::{Base64, Encoding};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use rsa::{pkcs8::DecodePublicKey, Oaep, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::{
    der::{Decode, Encode},
    Certificate,
};

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors raised by key handling and symmetric/asymmetric encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("certificate parse error: {0}")]
    Certificate(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("invalid base64: {0}")]
    Base64(String),
}

/// A fresh AES-256 key and CBC initialization vector.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AES_KEY_LEN] = key.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "AES key must be {AES_KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        let iv: [u8; AES_IV_LEN] = iv.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("IV must be {AES_IV_LEN} bytes, got {}", iv.len()))
        })?;
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8; AES_KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; AES_IV_LEN] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        aes_encrypt(plaintext, &self.key, &self.iv)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_envelope(ciphertext, &self.key, &self.iv)
    }

    /// Wrap the AES key for the platform with RSA-OAEP.
    pub fn wrap(&self, public_key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
        rsa_oaep_encrypt(&self.key, public_key)
    }
}

/// Result of [`encrypt_envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; AES_IV_LEN],
}

impl Envelope {
    pub fn wrapped_key_base64(&self) -> String {
        Base64::encode_string(&self.wrapped_key)
    }

    pub fn iv_base64(&self) -> String {
        Base64::encode_string(&self.iv)
    }
}

/// Encrypt `plaintext` under a fresh AES key and wrap the key for `public_key`.
///
/// The caller keeps the returned [`SymmetricKey`] when it needs to decrypt platform
/// responses encrypted under the same key.
pub fn encrypt_envelope(
    plaintext: &[u8],
    public_key: &RsaPublicKey,
) -> Result<(Envelope, SymmetricKey), CryptoError> {
    let key = SymmetricKey::generate();
    let wrapped_key = key.wrap(public_key)?;
    let envelope = Envelope {
        ciphertext: key.encrypt(plaintext),
        wrapped_key,
        iv: key.iv,
    };
    Ok((envelope, key))
}

pub fn aes_encrypt(plaintext: &[u8], key: &[u8; AES_KEY_LEN], iv: &[u8; AES_IV_LEN]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-256-CBC decryption with PKCS#7 padding.
pub fn decrypt_envelope(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = SymmetricKey::from_slices(key, iv)?;
    Aes256CbcDec::new((&key.key).into(), (&key.iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Decrypt(format!("bad padding or key: {e}")))
}

pub fn rsa_oaep_encrypt(data: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
        .map_err(|e| CryptoError::Encrypt(format!("RSA-OAEP: {e}")))
}

/// Extract the RSA public key from a DER-encoded X.509 certificate.
pub fn rsa_public_key_from_certificate(cert_der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| CryptoError::Certificate(format!("{e}")))?;
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| CryptoError::Certificate(format!("SPKI encoding: {e}")))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| CryptoError::InvalidKey(format!("certificate key is not RSA: {e}")))
}

pub fn sha256_base64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(bytes))
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>, CryptoError> {
    Base64::decode_vec(value.trim()).map_err(|e| CryptoError::Base64(e.to_string()))
}

/// Seals small secrets (export keys) before they are written to persistent state.
///
/// The sealing key is SHA-256 of the host-supplied secret; each value gets its own IV
/// which is prefixed to the ciphertext.
#[derive(Clone)]
pub struct StateSeal {
    key: [u8; AES_KEY_LEN],
}

impl std::fmt::Debug for StateSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateSeal(..)")
    }
}

impl StateSeal {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut out = iv.to_vec();
        out.extend(aes_encrypt(plaintext, &self.key, &iv));
        Base64::encode_string(&out)
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = decode_base64(sealed)?;
        if raw.len() < AES_IV_LEN {
            return Err(CryptoError::Decrypt("sealed value too short".into()));
        }
        let (iv, ciphertext) = raw.split_at(AES_IV_LEN);
        decrypt_envelope(ciphertext, &self.key, iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn test_rsa_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 2048).expect("rsa key")
    }

    #[test]
    fn envelope_round_trips_empty_and_multi_block() {
        let private_key = test_rsa_key();
        let public_key = RsaPublicKey::from(&private_key);
        let inputs: [&[u8]; 4] = [b"", b"x", &[7u8; 16], &[42u8; 1000]];
        for input in inputs {
            let (envelope, key) = encrypt_envelope(input, &public_key).expect("encrypt");
            assert_eq!(envelope.ciphertext.len() % 16, 0);
            assert!(envelope.ciphertext.len() > input.len());

            let unwrapped = private_key
                .decrypt(Oaep::new::<Sha256>(), &envelope.wrapped_key)
                .expect("unwrap key");
            assert_eq!(unwrapped.as_slice(), key.key());

            let plain =
                decrypt_envelope(&envelope.ciphertext, &unwrapped, &envelope.iv).expect("decrypt");
            assert_eq!(plain, input);
        }
    }

    #[test]
    fn decrypt_rejects_wrong_key_lengths() {
        let err = decrypt_envelope(&[0u8; 16], &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
        let err = decrypt_envelope(&[0u8; 16], &[0u8; 32], &[0u8; 8]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }

    #[test]
    fn decrypt_with_wrong_key_fails_on_padding() {
        let key = SymmetricKey::generate();
        let ciphertext = key.encrypt(b"some invoice bytes that span blocks");
        let mut other = *key.key();
        other[0] ^= 0xff;
        // A wrong key yields garbage whose padding almost never validates.
        let result = decrypt_envelope(&ciphertext, &other, key.iv());
        if let Ok(plain) = result {
            assert_ne!(plain, b"some invoice bytes that span blocks");
        }
    }

    #[test]
    fn sha256_base64_matches_known_vector() {
        assert_eq!(
            sha256_base64(b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
        assert_eq!(
            sha256_base64(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn state_seal_round_trips_and_uses_fresh_iv() {
        let seal = StateSeal::from_secret("host secret");
        let a = seal.seal(b"key material");
        let b = seal.seal(b"key material");
        assert_ne!(a, b);
        assert_eq!(seal.open(&a).expect("open"), b"key material");

        let other = StateSeal::from_secret("different");
        if let Ok(plain) = other.open(&a) {
            assert_ne!(plain, b"key material");
        }
        assert!(seal.open("AAAA").is_err());
    }

    #[test]
    fn certificate_key_extraction_rejects_garbage() {
        assert!(matches!(
            rsa_public_key_from_certificate(b"not a certificate"),
            Err(CryptoError::Certificate(_))
        ));
    }
}
