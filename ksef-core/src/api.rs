//! KSeF HTTP API client, shared request helper and error bodies.
pub mod codes;

use chrono::{DateTime, Utc};
use reqwest::{header::RETRY_AFTER, Client, Method, RequestBuilder};
use rsa::RsaPublicKey;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    auth::{AuthError, AuthSession, Credentials},
    config::Config,
    crypto::{self, xades::SigningError, CryptoError},
};

/// Back-off applied when a 429 response carries no usable `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Errors returned by the KSeF API client.
#[derive(Error, Debug)]
pub enum KsefError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("API error: {0}")]
    Api(ApiError),
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl KsefError {
    /// First platform exception or status code carried by the error, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            KsefError::Api(api) => api.code(),
            KsefError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// One entry of an `exceptionDetailList` (or the single `status` of a status body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetail {
    #[serde(rename = "exceptionCode")]
    pub code: i64,
    #[serde(rename = "exceptionDescription", default)]
    pub description: String,
    #[serde(default)]
    pub details: Vec<String>,
}

/// Structured error returned by the platform with a non-success HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub service_code: Option<String>,
    pub timestamp: Option<String>,
    pub exceptions: Vec<ExceptionDetail>,
    #[serde(skip)]
    pub body: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        for exception in &self.exceptions {
            write!(f, "; {} {}", exception.code, exception.description)?;
        }
        if self.exceptions.is_empty() && !self.body.is_empty() {
            write!(f, ": {}", self.body)?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionEnvelope {
    exception: ExceptionBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionBody {
    #[serde(default)]
    exception_detail_list: Vec<ExceptionDetail>,
    service_code: Option<String>,
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    status: StatusInfo,
}

/// `status` object used by long-running operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ApiError {
    /// Parse either error body shape; anything else is kept verbatim in `body`.
    pub fn from_body(status: u16, body: &str) -> Self {
        let mut error = ApiError {
            status,
            service_code: None,
            timestamp: None,
            exceptions: Vec::new(),
            body: body.to_string(),
        };
        if let Ok(envelope) = serde_json::from_str::<ExceptionEnvelope>(body) {
            error.service_code = envelope.exception.service_code;
            error.timestamp = envelope.exception.timestamp;
            error.exceptions = envelope.exception.exception_detail_list;
        } else if let Ok(envelope) = serde_json::from_str::<StatusEnvelope>(body) {
            error.exceptions.push(ExceptionDetail {
                code: envelope.status.code,
                description: envelope.status.description,
                details: envelope.status.details,
            });
        }
        error
    }

    pub fn code(&self) -> Option<i64> {
        self.exceptions.first().map(|exception| exception.code)
    }

    pub fn description(&self) -> Option<&str> {
        self.exceptions
            .first()
            .map(|exception| exception.description.as_str())
    }
}

/// Purpose a platform public-key certificate is published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    KsefTokenEncryption,
    SymmetricKeyEncryption,
    #[serde(other)]
    Other,
}

/// Entry of `GET /security/public-key-certificates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCertificate {
    pub certificate: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    #[serde(default)]
    pub usage: Vec<KeyUsage>,
}

/// KSeF API client.
///
/// Holds the ephemeral authentication session, the cached platform key certificates and
/// the most recent rate-limit deadline. Calls are issued strictly one after another.
///
/// # Examples
/// ```rust,no_run
/// use ksef_core::api::KsefClient;
/// use ksef_core::auth::Credentials;
/// use ksef_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test, "5265877635");
/// let client = KsefClient::new(config, Credentials::Token("token".into()))?;
/// # let _ = client;
/// # Ok::<(), ksef_core::api::KsefError>(())
/// ```
#[derive(Debug)]
pub struct KsefClient {
    pub(crate) config: Config,
    http: Client,
    base_url: String,
    pub(crate) credentials: Credentials,
    pub(crate) session: AuthSession,
    public_keys: Option<Vec<PublicKeyCertificate>>,
    rate_limited_until_ms: AtomicI64,
}

// Public API
impl KsefClient {
    /// Create a client for `config`'s environment.
    ///
    /// # Errors
    /// Returns [`KsefError::Http`] if the HTTP client cannot be built.
    pub fn new(config: Config, credentials: Credentials) -> Result<Self, KsefError> {
        let http = Client::builder().build()?;
        let base_url = config.base_url();
        Ok(Self {
            config,
            http,
            base_url,
            credentials,
            session: AuthSession::default(),
            public_keys: None,
            rate_limited_until_ms: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Deadline set by the most recent 429 response, if it is still in the future.
    pub fn rate_limited_until(&self) -> Option<DateTime<Utc>> {
        let millis = self.rate_limited_until_ms.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(millis).filter(|until| *until > Utc::now())
    }

    /// Platform certificates, fetched once per client.
    pub async fn public_key_certificates(
        &mut self,
    ) -> Result<&[PublicKeyCertificate], KsefError> {
        if self.public_keys.is_none() {
            let certificates: Vec<PublicKeyCertificate> = self
                .request_json(Method::GET, "security/public-key-certificates", None, None)
                .await?;
            debug!(count = certificates.len(), "fetched platform key certificates");
            self.public_keys = Some(certificates);
        }
        Ok(self.public_keys.as_deref().unwrap_or_default())
    }

    /// RSA key of the currently valid certificate published for `usage`.
    pub async fn public_key(&mut self, usage: KeyUsage) -> Result<RsaPublicKey, KsefError> {
        let now = Utc::now();
        let certificate = self
            .public_key_certificates()
            .await?
            .iter()
            .filter(|cert| cert.usage.contains(&usage))
            .filter(|cert| cert.valid_from <= now && now <= cert.valid_to)
            .max_by_key(|cert| cert.valid_from)
            .ok_or_else(|| {
                KsefError::Protocol(format!("no valid platform certificate for {usage:?}"))
            })?;
        let der = crypto::decode_base64(&certificate.certificate)?;
        Ok(crypto::rsa_public_key_from_certificate(&der)?)
    }
}

// Request helper
impl KsefClient {
    pub(crate) fn build_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Whether `url` points at this client's API (and therefore needs bearer auth).
    pub(crate) fn is_api_url(&self, url: &str) -> bool {
        let absolute = url.starts_with("http://") || url.starts_with("https://");
        !absolute || url.starts_with(&self.base_url)
    }

    /// Send a request and return the body of a successful response.
    ///
    /// HTTP 429 records the retry-after deadline before failing with
    /// [`KsefError::RateLimited`]; other non-success statuses fail with a parsed
    /// [`ApiError`].
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, KsefError> {
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            self.record_rate_limit(retry_after_secs);
            warn!(retry_after_secs, "rate limited by KSeF");
            return Err(KsefError::RateLimited { retry_after_secs });
        }
        let body = response.bytes().await.unwrap_or_default();
        if !status.is_success() {
            let error = ApiError::from_body(status.as_u16(), &String::from_utf8_lossy(&body));
            debug!(status = status.as_u16(), code = ?error.code(), "KSeF error response");
            return Err(KsefError::Api(error));
        }
        Ok(body.to_vec())
    }

    pub(crate) fn prepare(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        bearer: Option<&str>,
    ) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
    }

    pub(crate) async fn request_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, KsefError> {
        let url = self.build_endpoint(path);
        self.send(self.prepare(method, &url, body, bearer)).await
    }

    pub(crate) async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        bearer: Option<&str>,
    ) -> Result<T, KsefError> {
        let bytes = self.request_bytes(method, path, body, bearer).await?;
        parse_json(path, &bytes)
    }

    /// POST an XML document and parse the JSON reply.
    pub(crate) async fn post_xml<T: DeserializeOwned>(
        &self,
        path: &str,
        xml: String,
    ) -> Result<T, KsefError> {
        let request = self
            .http
            .post(self.build_endpoint(path))
            .header("Accept", "application/json")
            .header("Content-Type", "application/xml")
            .body(xml);
        let bytes = self.send(request).await?;
        parse_json(path, &bytes)
    }

    /// Fetch an absolute URL, with bearer auth only when it is given.
    pub(crate) async fn download(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, KsefError> {
        let mut request = self.http.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(request).await
    }

    fn record_rate_limit(&self, retry_after_secs: u64) {
        let until = Utc::now().timestamp_millis()
            + i64::try_from(retry_after_secs.saturating_mul(1000)).unwrap_or(i64::MAX / 2);
        self.rate_limited_until_ms.store(until, Ordering::Relaxed);
    }
}

fn parse_json<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T, KsefError> {
    serde_json::from_slice(bytes).map_err(|e| {
        KsefError::Protocol(format!("{path}: {e}: {}", String::from_utf8_lossy(bytes)))
    })
}
