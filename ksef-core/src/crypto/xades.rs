//! XAdES-BES enveloped signatures for authentication challenges.
use crate::config::CertificateConfig;
use crate::crypto::der::{ecdsa_der_to_raw, issuer_serial_v2, DerError, DistinguishedName};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use libxml::{parser::Parser, tree::c14n};
use pkcs8::{DecodePrivateKey, EncryptedPrivateKeyInfo, SecretDocument};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    signature::{SignatureEncoding, Signer},
    RsaPrivateKey,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::{
    der::{Decode, DecodePem, Encode},
    Certificate,
};

pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("private key error: {0}")]
    Key(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("DER construction error: {0}")]
    Der(#[from] DerError),
    #[error("signature error: {0}")]
    Sign(String),
}

enum SignerKey {
    Rsa(rsa::pkcs1v15::SigningKey<Sha256>),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

impl SignerKey {
    fn signature_method(&self) -> &'static str {
        match self {
            SignerKey::Rsa(_) => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignerKey::P256(_) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
            SignerKey::P384(_) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384",
            SignerKey::P521(_) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512",
        }
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        let sign_err = |e: rsa::signature::Error| SigningError::Sign(e.to_string());
        let (der, component_size) = match self {
            SignerKey::Rsa(key) => {
                let signature: rsa::pkcs1v15::Signature = key.try_sign(data).map_err(sign_err)?;
                return Ok(signature.to_vec());
            }
            SignerKey::P256(key) => {
                let signature: p256::ecdsa::DerSignature = key.try_sign(data).map_err(sign_err)?;
                (signature.to_vec(), 32)
            }
            SignerKey::P384(key) => {
                let signature: p384::ecdsa::DerSignature = key.try_sign(data).map_err(sign_err)?;
                (signature.to_vec(), 48)
            }
            SignerKey::P521(key) => {
                let signature: p521::ecdsa::Signature = key.try_sign(data).map_err(sign_err)?;
                (signature.to_der().as_bytes().to_vec(), 66)
            }
        };
        Ok(ecdsa_der_to_raw(&der, component_size)?)
    }
}

/// Certificate and private key able to produce XAdES-BES signatures.
///
/// RSA keys sign with PKCS#1 v1.5; EC keys (P-256, P-384, P-521) sign with ECDSA and the
/// digest matching the curve size.
pub struct XadesSigner {
    certificate: Certificate,
    certificate_der: Vec<u8>,
    key: SignerKey,
}

impl std::fmt::Debug for XadesSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XadesSigner")
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .finish_non_exhaustive()
    }
}

impl XadesSigner {
    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| SigningError::Certificate(format!("parse error: {e}")))?;
        Ok(Self {
            certificate,
            certificate_der: cert_der.to_vec(),
            key: parse_pkcs8_der(private_key_der)?,
        })
    }

    pub fn from_pem(
        cert_pem: &str,
        private_key_pem: &str,
        password: Option<&str>,
    ) -> Result<Self, SigningError> {
        let certificate = Certificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| SigningError::Certificate(format!("parse error: {e}")))?;
        let certificate_der = certificate
            .to_der()
            .map_err(|e| SigningError::Certificate(format!("DER encoding error: {e}")))?;
        Ok(Self {
            certificate,
            certificate_der,
            key: parse_pem_key(private_key_pem, password)?,
        })
    }

    /// Load certificate and key files; each may be PEM or DER.
    pub fn from_files(config: &CertificateConfig) -> Result<Self, SigningError> {
        let cert = std::fs::read(&config.certificate_path).map_err(|e| {
            SigningError::Certificate(format!(
                "cannot read '{}': {e}",
                config.certificate_path.display()
            ))
        })?;
        let key = std::fs::read(&config.private_key_path).map_err(|e| {
            SigningError::Key(format!(
                "cannot read '{}': {e}",
                config.private_key_path.display()
            ))
        })?;

        let certificate = match as_pem(&cert) {
            Some(pem) => Certificate::from_pem(pem.as_bytes()),
            None => Certificate::from_der(&cert),
        }
        .map_err(|e| SigningError::Certificate(format!("parse error: {e}")))?;
        let certificate_der = certificate
            .to_der()
            .map_err(|e| SigningError::Certificate(format!("DER encoding error: {e}")))?;
        let key = match as_pem(&key) {
            Some(pem) => parse_pem_key(pem, config.password.as_deref())?,
            None => parse_pkcs8_der(&key)?,
        };
        Ok(Self {
            certificate,
            certificate_der,
            key,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_base64(&self) -> String {
        Base64::encode_string(&self.certificate_der)
    }

    /// Sign `xml` with the current time as the XAdES signing time.
    pub fn sign_challenge(&self, xml: &str) -> Result<String, SigningError> {
        self.sign_challenge_at(xml, Utc::now())
    }

    /// Produce an enveloped XAdES-BES signature and return the signed document.
    ///
    /// The document is canonicalized (exclusive C14N) before the signature is inserted as
    /// the last child of the root element, so the enveloped-signature transform yields
    /// exactly the digested bytes.
    pub fn sign_challenge_at(
        &self,
        xml: &str,
        signing_time: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        let canonical = canonicalize_document(xml)?;
        let document_digest = Base64::encode_string(&Sha256::digest(canonical.as_bytes()));

        let signed_properties = signed_properties_xml(
            &format_signing_time(&signing_time),
            &Base64::encode_string(&Sha256::digest(&self.certificate_der)),
            &self.issuer_serial_base64()?,
        );
        let signed_properties_digest =
            Base64::encode_string(&Sha256::digest(signed_properties.as_bytes()));

        let signed_info = signed_info_xml(
            self.key.signature_method(),
            &document_digest,
            &signed_properties_digest,
        );
        let signature_value = Base64::encode_string(&self.key.sign(signed_info.as_bytes())?);

        let signature = format!(
            "<ds:Signature xmlns:ds=\"{DS_NS}\" Id=\"Signature\">{signed_info}\
<ds:SignatureValue>{signature_value}</ds:SignatureValue>\
<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>\
<ds:Object><xades:QualifyingProperties xmlns:xades=\"{XADES_NS}\" Target=\"#Signature\">{signed_properties}</xades:QualifyingProperties></ds:Object>\
</ds:Signature>",
            cert = self.certificate_base64(),
        );

        let close = canonical
            .rfind("</")
            .ok_or_else(|| SigningError::Xml("document root is self-closing".into()))?;
        let mut signed = String::with_capacity(canonical.len() + signature.len() + 40);
        signed.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        signed.push_str(&canonical[..close]);
        signed.push_str(&signature);
        signed.push_str(&canonical[close..]);
        Ok(signed)
    }

    fn issuer_serial_base64(&self) -> Result<String, SigningError> {
        let tbs = &self.certificate.tbs_certificate;
        let issuer = DistinguishedName::from_name(&tbs.issuer);
        let encoded = issuer_serial_v2(&issuer, tbs.serial_number.as_bytes())?;
        Ok(Base64::encode_string(&encoded))
    }
}

fn as_pem(bytes: &[u8]) -> Option<&str> {
    std::str::from_utf8(bytes)
        .ok()
        .filter(|text| text.contains("-----BEGIN"))
}

fn parse_pem_key(pem: &str, password: Option<&str>) -> Result<SignerKey, SigningError> {
    let (label, document) = SecretDocument::from_pem(pem)
        .map_err(|e| SigningError::Key(format!("PEM decode error: {e}")))?;
    match label {
        "PRIVATE KEY" => parse_pkcs8_der(document.as_bytes()),
        "ENCRYPTED PRIVATE KEY" => {
            let password = password
                .ok_or_else(|| SigningError::Key("encrypted key requires a password".into()))?;
            let info = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
                .map_err(|e| SigningError::Key(format!("encrypted key parse error: {e}")))?;
            let decrypted = info
                .decrypt(password)
                .map_err(|e| SigningError::Key(format!("cannot decrypt key: {e}")))?;
            parse_pkcs8_der(decrypted.as_bytes())
        }
        "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(document.as_bytes())
            .map(|key| SignerKey::Rsa(rsa::pkcs1v15::SigningKey::new(key)))
            .map_err(|e| SigningError::Key(format!("PKCS#1 parse error: {e}"))),
        "EC PRIVATE KEY" => parse_sec1_der(document.as_bytes()),
        other => Err(SigningError::Key(format!("unsupported PEM label '{other}'"))),
    }
}

fn parse_pkcs8_der(der: &[u8]) -> Result<SignerKey, SigningError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return Ok(SignerKey::Rsa(rsa::pkcs1v15::SigningKey::new(key)));
    }
    if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
        return Ok(SignerKey::P256((&key).into()));
    }
    if let Ok(key) = p384::SecretKey::from_pkcs8_der(der) {
        return Ok(SignerKey::P384((&key).into()));
    }
    if let Ok(key) = p521::SecretKey::from_pkcs8_der(der) {
        return p521_signing_key(&key);
    }
    Err(SigningError::Key(
        "unsupported key: expected RSA or EC P-256/P-384/P-521 PKCS#8".into(),
    ))
}

fn parse_sec1_der(der: &[u8]) -> Result<SignerKey, SigningError> {
    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        return Ok(SignerKey::P256((&key).into()));
    }
    if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
        return Ok(SignerKey::P384((&key).into()));
    }
    if let Ok(key) = p521::SecretKey::from_sec1_der(der) {
        return p521_signing_key(&key);
    }
    Err(SigningError::Key("unsupported EC curve".into()))
}

fn p521_signing_key(key: &p521::SecretKey) -> Result<SignerKey, SigningError> {
    p521::ecdsa::SigningKey::from_bytes(&key.to_bytes())
        .map(SignerKey::P521)
        .map_err(|e| SigningError::Key(format!("P-521 key error: {e}")))
}

fn canonicalize_document(xml: &str) -> Result<String, SigningError> {
    let doc = Parser::default()
        .parse_string(xml)
        .map_err(|e| SigningError::Xml(format!("parse error: {e:?}")))?;
    let options = c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    };
    doc.canonicalize(options, None)
        .map_err(|e| SigningError::Xml(format!("canonicalization failed: {e:?}")))
}

fn format_signing_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// `SignedProperties` in its exclusive-canonical form.
fn signed_properties_xml(signing_time: &str, cert_digest: &str, issuer_serial: &str) -> String {
    format!(
        "<xades:SignedProperties xmlns:xades=\"{XADES_NS}\" Id=\"SignedProperties\">\
<xades:SignedSignatureProperties>\
<xades:SigningTime>{signing_time}</xades:SigningTime>\
<xades:SigningCertificateV2><xades:Cert><xades:CertDigest>\
<ds:DigestMethod xmlns:ds=\"{DS_NS}\" Algorithm=\"{SHA256_DIGEST}\"></ds:DigestMethod>\
<ds:DigestValue xmlns:ds=\"{DS_NS}\">{cert_digest}</ds:DigestValue>\
</xades:CertDigest>\
<xades:IssuerSerialV2>{issuer_serial}</xades:IssuerSerialV2>\
</xades:Cert></xades:SigningCertificateV2>\
</xades:SignedSignatureProperties>\
</xades:SignedProperties>"
    )
}

/// `SignedInfo` in its exclusive-canonical form.
fn signed_info_xml(
    signature_method: &str,
    document_digest: &str,
    signed_properties_digest: &str,
) -> String {
    format!(
        "<ds:SignedInfo xmlns:ds=\"{DS_NS}\">\
<ds:CanonicalizationMethod Algorithm=\"{EXC_C14N}\"></ds:CanonicalizationMethod>\
<ds:SignatureMethod Algorithm=\"{signature_method}\"></ds:SignatureMethod>\
<ds:Reference URI=\"\"><ds:Transforms>\
<ds:Transform Algorithm=\"{ENVELOPED_SIGNATURE}\"></ds:Transform>\
<ds:Transform Algorithm=\"{EXC_C14N}\"></ds:Transform>\
</ds:Transforms>\
<ds:DigestMethod Algorithm=\"{SHA256_DIGEST}\"></ds:DigestMethod>\
<ds:DigestValue>{document_digest}</ds:DigestValue></ds:Reference>\
<ds:Reference Type=\"{SIGNED_PROPERTIES_TYPE}\" URI=\"#SignedProperties\"><ds:Transforms>\
<ds:Transform Algorithm=\"{EXC_C14N}\"></ds:Transform>\
</ds:Transforms>\
<ds:DigestMethod Algorithm=\"{SHA256_DIGEST}\"></ds:DigestMethod>\
<ds:DigestValue>{signed_properties_digest}</ds:DigestValue></ds:Reference>\
</ds:SignedInfo>"
    )
}
