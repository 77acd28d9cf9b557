//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Name of the environment variable that overrides the API base URL.
pub const BASE_URL_ENV: &str = "KSEF_BASE_URL";

/// KSeF environment selection for API endpoints.
/// - Test: the open test environment, accepts self-signed certificates and fake NIPs.
/// - Demo: the pre-production environment that mirrors production rules.
/// - Production: the live environment.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use ksef_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("demo")?;
/// assert_eq!(env, EnvironmentType::Demo);
/// # Ok::<(), ksef_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    Test,
    Demo,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "test" => Ok(EnvironmentType::Test),
            "demo" => Ok(EnvironmentType::Demo),
            "production" | "prod" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Demo => "demo",
            EnvironmentType::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://api-test.ksef.mf.gov.pl/v2/",
            EnvironmentType::Demo => "https://api-demo.ksef.mf.gov.pl/v2/",
            EnvironmentType::Production => "https://api.ksef.mf.gov.pl/v2/",
        }
    }
}

/// Bounded polling budget: a fixed interval between attempts and a maximum attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollingPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Total wall time the budget may spend sleeping.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Certificate material used for XAdES authentication and offline invoicing.
///
/// Both files may be PEM; the certificate may also be raw DER. The password unlocks
/// an encrypted PKCS#8 key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateConfig {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub password: Option<String>,
}

impl CertificateConfig {
    pub fn new(
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
        password: Option<String>,
    ) -> Self {
        Self {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            password,
        }
    }
}

/// Configuration for the API client, the submission orchestrator and the export pipeline.
///
/// # Examples
/// ```rust
/// use ksef_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test, "5265877635");
/// assert_eq!(config.nip(), "5265877635");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    nip: String,
    base_url: Option<String>,
    auth_polling: PollingPolicy,
    session_polling: PollingPolicy,
    invoice_check_every: u32,
    token_refresh_margin: Duration,
    export_batch_size: usize,
    export_timeout: Duration,
    state_secret: Option<String>,
    offline_certificate: Option<CertificateConfig>,
}

impl Config {
    pub fn new(env: EnvironmentType, nip: impl Into<String>) -> Self {
        Self {
            env,
            nip: nip.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_auth_polling(mut self, policy: PollingPolicy) -> Self {
        self.auth_polling = policy;
        self
    }

    pub fn with_session_polling(mut self, policy: PollingPolicy) -> Self {
        self.session_polling = policy;
        self
    }

    /// Check the per-invoice status every `n` session polls (0 disables the early check).
    pub fn with_invoice_check_every(mut self, n: u32) -> Self {
        self.invoice_check_every = n;
        self
    }

    pub fn with_token_refresh_margin(mut self, margin: Duration) -> Self {
        self.token_refresh_margin = margin;
        self
    }

    pub fn with_export_batch_size(mut self, size: usize) -> Self {
        self.export_batch_size = size.max(1);
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_state_secret(mut self, secret: impl Into<String>) -> Self {
        self.state_secret = Some(secret.into());
        self
    }

    pub fn with_offline_certificate(mut self, certificate: CertificateConfig) -> Self {
        self.offline_certificate = Some(certificate);
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn nip(&self) -> &str {
        &self.nip
    }

    /// Resolved base URL, always ending with `/`.
    ///
    /// Precedence: explicit [`Config::with_base_url`], then `KSEF_BASE_URL`, then the
    /// environment default.
    pub fn base_url(&self) -> String {
        let url = self
            .base_url
            .clone()
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .unwrap_or_else(|| self.env.endpoint_url().to_string());
        if url.ends_with('/') {
            url
        } else {
            format!("{url}/")
        }
    }

    pub fn auth_polling(&self) -> PollingPolicy {
        self.auth_polling
    }

    pub fn session_polling(&self) -> PollingPolicy {
        self.session_polling
    }

    pub fn invoice_check_every(&self) -> u32 {
        self.invoice_check_every
    }

    pub fn token_refresh_margin(&self) -> Duration {
        self.token_refresh_margin
    }

    pub fn export_batch_size(&self) -> usize {
        self.export_batch_size
    }

    pub fn export_timeout(&self) -> Duration {
        self.export_timeout
    }

    pub fn state_secret(&self) -> Option<&str> {
        self.state_secret.as_deref()
    }

    pub fn offline_certificate(&self) -> Option<&CertificateConfig> {
        self.offline_certificate.as_ref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: EnvironmentType::Test,
            nip: String::new(),
            base_url: None,
            auth_polling: PollingPolicy::new(Duration::from_secs(2), 15),
            session_polling: PollingPolicy::new(Duration::from_secs(2), 30),
            invoice_check_every: 3,
            token_refresh_margin: Duration::from_secs(5 * 60),
            export_batch_size: 1000,
            export_timeout: Duration::from_secs(2 * 60 * 60),
            state_secret: None,
            offline_certificate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_round_trips_through_strings() {
        for env in [
            EnvironmentType::Test,
            EnvironmentType::Demo,
            EnvironmentType::Production,
        ] {
            assert_eq!(EnvironmentType::from_str(env.as_str()), Ok(env));
        }
        assert_eq!(
            EnvironmentType::from_str("PROD"),
            Ok(EnvironmentType::Production)
        );
        assert!(matches!(
            EnvironmentType::from_str("staging"),
            Err(EnvironmentParseError::Invalid { .. })
        ));
    }

    #[test]
    fn explicit_base_url_gets_trailing_slash() {
        let config = Config::new(EnvironmentType::Demo, "1111111111")
            .with_base_url("http://127.0.0.1:9000/api");
        assert_eq!(config.base_url(), "http://127.0.0.1:9000/api/");
    }

    #[test]
    fn batch_size_never_zero() {
        let config = Config::default().with_export_batch_size(0);
        assert_eq!(config.export_batch_size(), 1);
    }

    #[test]
    fn default_polling_budget_is_bounded() {
        let config = Config::default();
        assert_eq!(config.auth_polling().budget(), Duration::from_secs(30));
        assert_eq!(config.token_refresh_margin(), Duration::from_secs(300));
    }
}
