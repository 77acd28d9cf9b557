//! Shared fixtures for unit tests: platform keys, signing certificates and fast configs.
use crate::config::{Config, EnvironmentType, PollingPolicy};
use crate::crypto::xades::XadesSigner;
use base64ct::{Base64, Encoding};
use httpmock::{Method::GET, Method::POST, Mock, MockServer};
use pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::{Encode, EncodePem};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{EncodePublicKey, SubjectPublicKeyInfoOwned};
use x509_cert::time::Validity;
use x509_cert::Certificate;

pub(crate) const NIP: &str = "5265877635";

/// Platform RSA key pair, generated once per test binary.
pub(crate) fn platform_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("rsa key"))
}

fn platform_certificate_der() -> &'static [u8] {
    static CERT: OnceLock<Vec<u8>> = OnceLock::new();
    CERT.get_or_init(|| {
        let key = platform_key();
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
        let spki_der = key.to_public_key().to_public_key_der().expect("spki");
        let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
        let cert = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(7u32),
            Validity::from_now(Duration::from_secs(24 * 3600)).expect("validity"),
            Name::from_str("CN=KSeF Test,O=Ministerstwo Finansow,C=PL").expect("name"),
            spki,
            &signer,
        )
        .expect("builder")
        .build::<rsa::pkcs1v15::Signature>()
        .expect("certificate");
        cert.to_der().expect("der")
    })
}

/// Body of `GET /security/public-key-certificates` publishing the test platform key.
pub(crate) fn public_keys_body() -> serde_json::Value {
    let certificate = Base64::encode_string(platform_certificate_der());
    serde_json::json!([
        {
            "certificate": certificate,
            "validFrom": "2020-01-01T00:00:00Z",
            "validTo": "2099-01-01T00:00:00Z",
            "usage": ["KsefTokenEncryption", "SymmetricKeyEncryption"]
        }
    ])
}

/// Self-signed P-256 certificate and PKCS#8 key as PEM strings.
pub(crate) fn p256_certificate_pem() -> (String, String) {
    let key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let spki_der = key.verifying_key().to_public_key_der().expect("spki");
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
    let cert: Certificate = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(1u32),
        Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        Name::from_str("CN=Jan Kowalski,C=PL").expect("name"),
        spki,
        &key,
    )
    .expect("builder")
    .build::<p256::ecdsa::DerSignature>()
    .expect("certificate");
    let cert_pem = cert.to_pem(LineEnding::LF).expect("cert pem");
    let key_pem = key.to_pkcs8_pem(LineEnding::LF).expect("key pem");
    (cert_pem, key_pem.to_string())
}

pub(crate) fn p256_signer() -> XadesSigner {
    let (cert, key) = p256_certificate_pem();
    XadesSigner::from_pem(&cert, &key, None).expect("signer")
}

/// Config pointed at a mock server with zero-delay polling.
pub(crate) fn fast_config(base_url: &str) -> Config {
    Config::new(EnvironmentType::Test, NIP)
        .with_base_url(base_url)
        .with_auth_polling(PollingPolicy::new(Duration::ZERO, 3))
        .with_session_polling(PollingPolicy::new(Duration::ZERO, 4))
        .with_invoice_check_every(2)
}

pub(crate) const ACCESS_TOKEN: &str = "access-token-1";
pub(crate) const CHALLENGE: &str = "20250625-CR-20F5EE4000-DA48AE4124-46";
pub(crate) const CHALLENGE_TIMESTAMP_MS: i64 = 1_750_845_600_000;

pub(crate) fn mock_public_keys(server: &MockServer) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/security/public-key-certificates");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(public_keys_body());
    })
}

pub(crate) fn mock_challenge(server: &MockServer) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(POST).path("/auth/challenge");
        then.status(200).json_body(serde_json::json!({
            "challenge": CHALLENGE,
            "timestamp": "2025-06-25T10:00:00Z",
            "timestampMs": CHALLENGE_TIMESTAMP_MS
        }));
    })
}

pub(crate) fn mock_auth_status<'a>(server: &'a MockServer, reference: &str) -> Mock<'a> {
    let path = format!("/auth/{reference}");
    server.mock(|when, then| {
        when.method(GET).path(path);
        then.status(200)
            .json_body(serde_json::json!({"status": {"code": 200, "description": "Sukces"}}));
    })
}

pub(crate) fn mock_redeem(server: &MockServer) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(POST)
            .path("/auth/token/redeem")
            .header("authorization", "Bearer auth-op");
        then.status(200).json_body(serde_json::json!({
            "accessToken": {"token": ACCESS_TOKEN, "validUntil": "2099-01-01T00:00:00Z"},
            "refreshToken": {"token": "refresh-token-1", "validUntil": "2099-01-08T00:00:00Z"}
        }));
    })
}

/// Mocks for a complete, successful KSeF-token authentication.
pub(crate) fn mock_token_auth(server: &MockServer) -> Vec<Mock<'_>> {
    let init = server.mock(|when, then| {
        when.method(POST).path("/auth/ksef-token");
        then.status(202).json_body(serde_json::json!({
            "referenceNumber": "20250625-AU-0",
            "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
        }));
    });
    vec![
        mock_public_keys(server),
        mock_challenge(server),
        init,
        mock_auth_status(server, "20250625-AU-0"),
        mock_redeem(server),
    ]
}
