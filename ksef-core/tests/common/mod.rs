use base64ct::{Base64, Encoding};
use httpmock::{Method::GET, Method::POST, Mock, MockServer};
use ksef_core::auth::Credentials;
use ksef_core::config::{Config, EnvironmentType, PollingPolicy};
use ksef_core::KsefClient;
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

pub const NIP: &str = "5265877635";
pub const ACCESS_TOKEN: &str = "access-token-1";
pub const SESSION: &str = "20250625-SO-2C3E6C8000-B3D0A0F4E9-1D";
pub const INVOICE_REF: &str = "20250625-EE-2C3E6C8000-B3D0A0F4E9-01";
pub const KSEF_NUMBER: &str = "5265877635-20250625-010080615740-E4";

#[allow(dead_code)]
pub fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

fn platform_certificate_der() -> &'static [u8] {
    static CERT: OnceLock<Vec<u8>> = OnceLock::new();
    CERT.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("rsa key");
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
        let spki_der = key.to_public_key().to_public_key_der().expect("spki");
        let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
        CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(7u32),
            Validity::from_now(Duration::from_secs(24 * 3600)).expect("validity"),
            Name::from_str("CN=KSeF Test,C=PL").expect("name"),
            spki,
            &signer,
        )
        .expect("builder")
        .build::<rsa::pkcs1v15::Signature>()
        .expect("certificate")
        .to_der()
        .expect("der")
    })
}

/// Writes a self-signed P-256 certificate and key into `dir` and returns their paths.
#[allow(dead_code)]
pub fn write_offline_certificate(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let spki_der = key.verifying_key().to_public_key_der().expect("spki");
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
    let cert = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(3u32),
        Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        Name::from_str("CN=Offline Issuer,C=PL").expect("name"),
        spki,
        &key,
    )
    .expect("builder")
    .build::<p256::ecdsa::DerSignature>()
    .expect("certificate");
    let cert_path = dir.join("offline.crt");
    let key_path = dir.join("offline.key");
    std::fs::write(&cert_path, cert.to_pem(LineEnding::LF).expect("pem")).expect("write cert");
    std::fs::write(
        &key_path,
        key.to_pkcs8_pem(LineEnding::LF).expect("key pem").as_bytes(),
    )
    .expect("write key");
    (cert_path, key_path)
}

pub fn config(server: &MockServer) -> Config {
    Config::new(EnvironmentType::Test, NIP)
        .with_base_url(server.base_url())
        .with_auth_polling(PollingPolicy::new(Duration::ZERO, 3))
        .with_session_polling(PollingPolicy::new(Duration::ZERO, 3))
        .with_invoice_check_every(0)
        .with_state_secret("integration-secret")
}

#[allow(dead_code)]
pub fn client(config: Config) -> KsefClient {
    KsefClient::new(config, Credentials::Token("ksef-token".into())).expect("client")
}

/// Mocks for public keys and a successful KSeF-token login.
pub fn mock_login(server: &MockServer) -> Vec<Mock<'_>> {
    let certificate = Base64::encode_string(platform_certificate_der());
    vec![
        server.mock(|when, then| {
            when.method(GET).path("/security/public-key-certificates");
            then.status(200).json_body(serde_json::json!([{
                "certificate": certificate,
                "validFrom": "2020-01-01T00:00:00Z",
                "validTo": "2099-01-01T00:00:00Z",
                "usage": ["KsefTokenEncryption", "SymmetricKeyEncryption"]
            }]));
        }),
        server.mock(|when, then| {
            when.method(POST).path("/auth/challenge");
            then.status(200).json_body(serde_json::json!({
                "challenge": "20250625-CR-20F5EE4000-DA48AE4124-46",
                "timestamp": "2025-06-25T10:00:00Z",
                "timestampMs": 1_750_845_600_000i64
            }));
        }),
        server.mock(|when, then| {
            when.method(POST).path("/auth/ksef-token");
            then.status(202).json_body(serde_json::json!({
                "referenceNumber": "20250625-AU-0",
                "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        }),
        server.mock(|when, then| {
            when.method(GET).path("/auth/20250625-AU-0");
            then.status(200)
                .json_body(serde_json::json!({"status": {"code": 200, "description": "Sukces"}}));
        }),
        server.mock(|when, then| {
            when.method(POST).path("/auth/token/redeem");
            then.status(200).json_body(serde_json::json!({
                "accessToken": {"token": ACCESS_TOKEN, "validUntil": "2099-01-01T00:00:00Z"},
                "refreshToken": {"token": "refresh-token-1", "validUntil": "2099-01-08T00:00:00Z"}
            }));
        }),
    ]
}

/// Session open and upload; `offline` is the flag the upload must carry.
#[allow(dead_code)]
pub fn mock_upload(server: &MockServer, offline: bool) -> (Mock<'_>, Mock<'_>) {
    let open = server.mock(|when, then| {
        when.method(POST)
            .path("/sessions/online")
            .header("authorization", format!("Bearer {ACCESS_TOKEN}"));
        then.status(201)
            .json_body(serde_json::json!({"referenceNumber": SESSION}));
    });
    let upload = server.mock(|when, then| {
        when.method(POST)
            .path(format!("/sessions/online/{SESSION}/invoices"))
            .json_body_partial(serde_json::json!({"offlineMode": offline}).to_string());
        then.status(202)
            .json_body(serde_json::json!({"referenceNumber": INVOICE_REF}));
    });
    (open, upload)
}

/// Session status, close, listing and UPO of an accepted invoice.
#[allow(dead_code)]
pub fn mock_accepted(server: &MockServer) -> Vec<Mock<'_>> {
    vec![
        server.mock(|when, then| {
            when.method(GET).path(format!("/sessions/{SESSION}"));
            then.status(200).json_body(serde_json::json!({
                "status": {"code": 200, "description": "Sukces"},
                "invoiceCount": 1, "successfulInvoiceCount": 1, "failedInvoiceCount": 0
            }));
        }),
        server.mock(|when, then| {
            when.method(POST)
                .path(format!("/sessions/online/{SESSION}/close"));
            then.status(204);
        }),
        server.mock(|when, then| {
            when.method(GET).path(format!("/sessions/{SESSION}/invoices"));
            then.status(200).json_body(serde_json::json!({"invoices": [{
                "referenceNumber": INVOICE_REF,
                "ksefNumber": KSEF_NUMBER,
                "status": {"code": 200, "description": "Sukces"}
            }]}));
        }),
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/sessions/{SESSION}/invoices/{INVOICE_REF}/upo"));
            then.status(200).body("<Potwierdzenie/>");
        }),
    ]
}

/// Session status reporting a failed invoice with the given status body.
#[allow(dead_code)]
pub fn mock_rejected(server: &MockServer, status: serde_json::Value) -> Vec<Mock<'_>> {
    vec![
        server.mock(|when, then| {
            when.method(GET).path(format!("/sessions/{SESSION}"));
            then.status(200).json_body(serde_json::json!({
                "status": {"code": 445, "description": "Błąd weryfikacji"},
                "invoiceCount": 1, "successfulInvoiceCount": 0, "failedInvoiceCount": 1
            }));
        }),
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/sessions/{SESSION}/invoices/{INVOICE_REF}"));
            then.status(200).json_body(serde_json::json!({
                "referenceNumber": INVOICE_REF,
                "status": status
            }));
        }),
    ]
}
