//! Bearer-token acquisition: KSeF token and XAdES certificate flows, refresh and termination.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{codes, ApiError, KeyUsage, KsefClient, KsefError, StatusInfo},
    crypto::{self, xades::XadesSigner},
};

const AUTH_TOKEN_REQUEST_NS: &str = "http://ksef.mf.gov.pl/auth/token/2.0";

/// Errors raised while obtaining or renewing a session.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed challenge response: {0}")]
    MalformedChallenge(String),
    #[error("authentication still pending after {attempts} attempts")]
    PollingExhausted { attempts: u32 },
    #[error("authentication rejected with status {code}: {description}")]
    Rejected {
        code: i64,
        description: String,
        details: Vec<String>,
    },
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("authentication request failed: {0}")]
    Http(ApiError),
    #[error("cannot build AuthTokenRequest: {0}")]
    Xml(String),
}

/// Secret used to authenticate against the platform.
pub enum Credentials {
    /// KSeF token generated in the taxpayer's account.
    Token(String),
    /// Qualified certificate or seal with its private key.
    Certificate(Box<XadesSigner>),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Credentials::Token(..)"),
            Credentials::Certificate(signer) => {
                f.debug_tuple("Credentials::Certificate").field(signer).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

/// Token with its expiry as reported by the platform.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub token: String,
    pub valid_until: DateTime<Utc>,
}

impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("valid_until", &self.valid_until)
            .finish_non_exhaustive()
    }
}

/// Ephemeral session state held by a [`KsefClient`]. Never persisted.
#[derive(Debug, Clone)]
pub struct AuthSession {
    state: AuthState,
    access: Option<TokenInfo>,
    refresh: Option<TokenInfo>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            access: None,
            refresh: None,
        }
    }
}

impl AuthSession {
    pub fn state(&self) -> AuthState {
        match (&self.state, &self.access) {
            (AuthState::Authenticated, Some(access)) if access.valid_until <= Utc::now() => {
                AuthState::Expired
            }
            (state, _) => *state,
        }
    }

    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access.as_ref().map(|access| access.valid_until)
    }

    fn access_valid(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.state == AuthState::Authenticated
            && self
                .access
                .as_ref()
                .is_some_and(|access| access.valid_until - margin > now)
    }

    fn refresh_valid(&self, now: DateTime<Utc>) -> bool {
        self.refresh
            .as_ref()
            .is_some_and(|refresh| refresh.valid_until > now)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    #[serde(default)]
    challenge: String,
    timestamp: Option<DateTime<Utc>>,
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    reference_number: String,
    authentication_token: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct AuthStatusResponse {
    status: StatusInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemResponse {
    access_token: TokenInfo,
    refresh_token: TokenInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: TokenInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename = "AuthTokenRequest")]
struct AuthTokenRequest<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Challenge")]
    challenge: &'a str,
    #[serde(rename = "ContextIdentifier")]
    context_identifier: ContextNip<'a>,
    #[serde(rename = "SubjectIdentifierType")]
    subject_identifier_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ContextNip<'a> {
    #[serde(rename = "Nip")]
    nip: &'a str,
}

/// Unsigned `AuthTokenRequest` document for the certificate flow.
pub fn auth_token_request_xml(challenge: &str, nip: &str) -> Result<String, AuthError> {
    let request = AuthTokenRequest {
        xmlns: AUTH_TOKEN_REQUEST_NS,
        challenge,
        context_identifier: ContextNip { nip },
        subject_identifier_type: "certificateSubject",
    };
    let body = quick_xml::se::to_string(&request).map_err(|e| AuthError::Xml(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{body}"))
}

enum ChallengeAnswer {
    Token(String),
    Signed(String),
}

fn context_identifier(nip: &str) -> serde_json::Value {
    serde_json::json!({ "type": "Nip", "value": nip })
}

impl KsefClient {
    pub fn auth_session(&self) -> &AuthSession {
        &self.session
    }

    /// Make sure a usable access token is held, refreshing or re-authenticating as needed.
    ///
    /// A token expiring within the configured safety margin counts as expired.
    pub async fn ensure_authenticated(&mut self) -> Result<(), KsefError> {
        let now = Utc::now();
        let margin = chrono::Duration::from_std(self.config.token_refresh_margin())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if self.session.access_valid(now, margin) {
            return Ok(());
        }
        if self.session.refresh_valid(now) {
            match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(err) => warn!(error = %err, "token refresh failed, re-authenticating"),
            }
        }
        self.authenticate().await
    }

    /// Run the full challenge flow for the configured credentials.
    pub async fn authenticate(&mut self) -> Result<(), KsefError> {
        self.session = AuthSession {
            state: AuthState::Authenticating,
            ..AuthSession::default()
        };
        match self.run_authentication().await {
            Ok(tokens) => {
                info!(valid_until = %tokens.access_token.valid_until, "authenticated");
                self.session = AuthSession {
                    state: AuthState::Authenticated,
                    access: Some(tokens.access_token),
                    refresh: Some(tokens.refresh_token),
                };
                Ok(())
            }
            Err(err) => {
                self.session = AuthSession::default();
                Err(err)
            }
        }
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&mut self) -> Result<(), KsefError> {
        let refresh_token = self
            .session
            .refresh
            .as_ref()
            .map(|refresh| refresh.token.clone())
            .ok_or(AuthError::NotAuthenticated)?;
        let response: RefreshResponse = self
            .request_json(Method::POST, "auth/token/refresh", None, Some(&refresh_token))
            .await?;
        debug!(valid_until = %response.access_token.valid_until, "access token refreshed");
        self.session.access = Some(response.access_token);
        self.session.state = AuthState::Authenticated;
        Ok(())
    }

    /// Invalidate the current session on the platform and forget it locally.
    pub async fn terminate(&mut self) -> Result<(), KsefError> {
        let Some(access) = self.session.access.take() else {
            return Ok(());
        };
        self.session = AuthSession::default();
        self.request_bytes(Method::POST, "auth/token/terminate", None, Some(&access.token))
            .await?;
        info!("session terminated");
        Ok(())
    }

    pub(crate) fn access_token(&self) -> Result<String, KsefError> {
        self.session
            .access
            .as_ref()
            .map(|access| access.token.clone())
            .ok_or_else(|| AuthError::NotAuthenticated.into())
    }

    async fn run_authentication(&mut self) -> Result<RedeemResponse, KsefError> {
        let nip = self.config.nip().to_string();
        let challenge: ChallengeResponse = self
            .request_json(
                Method::POST,
                "auth/challenge",
                Some(&serde_json::json!({ "contextIdentifier": context_identifier(&nip) })),
                None,
            )
            .await?;
        if challenge.challenge.trim().is_empty() {
            return Err(AuthError::MalformedChallenge("missing challenge".into()).into());
        }
        let timestamp_ms = challenge
            .timestamp_ms
            .or_else(|| challenge.timestamp.map(|ts| ts.timestamp_millis()))
            .ok_or_else(|| AuthError::MalformedChallenge("missing timestamp".into()))?;
        debug!(challenge = %challenge.challenge, "received auth challenge");

        let answer = match &self.credentials {
            Credentials::Token(token) => ChallengeAnswer::Token(format!("{token}|{timestamp_ms}")),
            Credentials::Certificate(signer) => {
                let unsigned = auth_token_request_xml(&challenge.challenge, &nip)?;
                ChallengeAnswer::Signed(signer.sign_challenge(&unsigned)?)
            }
        };
        let init: InitResponse = match answer {
            ChallengeAnswer::Token(plaintext) => {
                let public_key = self.public_key(KeyUsage::KsefTokenEncryption).await?;
                let encrypted = crypto::rsa_oaep_encrypt(plaintext.as_bytes(), &public_key)?;
                let body = serde_json::json!({
                    "challenge": challenge.challenge,
                    "contextIdentifier": context_identifier(&nip),
                    "encryptedToken": Base64::encode_string(&encrypted),
                });
                self.request_json(Method::POST, "auth/ksef-token", Some(&body), None)
                    .await?
            }
            ChallengeAnswer::Signed(xml) => self.post_xml("auth/xades-signature", xml).await?,
        };

        let auth_token = init.authentication_token.token;
        self.poll_authentication(&init.reference_number, &auth_token)
            .await?;
        Ok(self
            .request_json(Method::POST, "auth/token/redeem", None, Some(&auth_token))
            .await?)
    }

    async fn poll_authentication(
        &self,
        reference: &str,
        auth_token: &str,
    ) -> Result<(), KsefError> {
        let policy = self.config.auth_polling();
        let path = format!("auth/{reference}");
        for attempt in 1..=policy.max_attempts {
            let response: AuthStatusResponse = self
                .request_json(Method::GET, &path, None, Some(auth_token))
                .await?;
            let status = response.status;
            debug!(attempt, code = status.code, "auth status");
            if status.code == codes::KsefStatusCode::Success.code() {
                return Ok(());
            }
            if codes::is_terminal_failure(status.code) {
                let description = if status.description.is_empty() {
                    codes::describe(status.code)
                } else {
                    status.description
                };
                return Err(AuthError::Rejected {
                    code: status.code,
                    description,
                    details: status.details,
                }
                .into());
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        warn!(
            %reference,
            budget_secs = policy.budget().as_secs(),
            "authentication polling budget exhausted"
        );
        Err(AuthError::PollingExhausted {
            attempts: policy.max_attempts,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, fast_config, NIP};
    use httpmock::{prelude::HttpMockRequest, Method::GET, Method::POST, MockServer};
    use rsa::Oaep;
    use sha2::Sha256;

    fn try_start_server() -> Option<MockServer> {
        std::panic::catch_unwind(MockServer::start).ok()
    }

    #[test]
    fn auth_token_request_has_namespace_and_context() {
        let xml = auth_token_request_xml("20250625-CR-1", NIP).expect("xml");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?><AuthTokenRequest"));
        assert!(xml.contains("xmlns=\"http://ksef.mf.gov.pl/auth/token/2.0\""));
        assert!(xml.contains("<Challenge>20250625-CR-1</Challenge>"));
        assert!(xml.contains("<ContextIdentifier><Nip>5265877635</Nip></ContextIdentifier>"));
        assert!(xml.contains("<SubjectIdentifierType>certificateSubject</SubjectIdentifierType>"));
    }

    fn token_decrypts_with_timestamp(req: &HttpMockRequest) -> bool {
        let Some(body) = req.body.as_ref() else {
            return false;
        };
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
            return false;
        };
        let Some(Ok(encrypted)) = json["encryptedToken"].as_str().map(Base64::decode_vec) else {
            return false;
        };
        let expected = format!("my-ksef-token|{}", testing::CHALLENGE_TIMESTAMP_MS);
        json["contextIdentifier"]["value"] == NIP
            && testing::platform_key()
                .decrypt(Oaep::new::<Sha256>(), &encrypted)
                .is_ok_and(|plain| plain == expected.as_bytes())
    }

    #[test]
    fn token_flow_encrypts_token_with_timestamp_and_redeems() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let keys = testing::mock_public_keys(&server);
        let challenge = testing::mock_challenge(&server);
        let init = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/ksef-token")
                .matches(token_decrypts_with_timestamp);
            then.status(202).json_body(serde_json::json!({
                "referenceNumber": "20250625-AU-0",
                "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        });
        let _status = testing::mock_auth_status(&server, "20250625-AU-0");
        let redeem = testing::mock_redeem(&server);

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Token("my-ksef-token".into()),
            )
            .expect("client");
            assert_eq!(client.auth_session().state(), AuthState::Unauthenticated);

            client.ensure_authenticated().await.expect("authenticated");
            assert_eq!(client.auth_session().state(), AuthState::Authenticated);
            assert_eq!(client.access_token().expect("token"), testing::ACCESS_TOKEN);

            // still valid, no further round trips
            client.ensure_authenticated().await.expect("cached");
        });
        keys.assert_hits(1);
        challenge.assert_hits(1);
        init.assert_hits(1);
        redeem.assert_hits(1);
    }

    #[test]
    fn terminal_auth_status_aborts_immediately() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let _keys = testing::mock_public_keys(&server);
        let _challenge = testing::mock_challenge(&server);
        let _init = server.mock(|when, then| {
            when.method(POST).path("/auth/ksef-token");
            then.status(202).json_body(serde_json::json!({
                "referenceNumber": "20250625-AU-1",
                "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        });
        let status = server.mock(|when, then| {
            when.method(GET).path("/auth/20250625-AU-1");
            then.status(200).json_body(serde_json::json!({
                "status": {"code": 450, "description": "Nieprawidłowy token", "details": ["revoked"]}
            }));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Token("revoked".into()),
            )
            .expect("client");
            let err = client.ensure_authenticated().await.unwrap_err();
            match err {
                KsefError::Auth(AuthError::Rejected { code, details, .. }) => {
                    assert_eq!(code, 450);
                    assert_eq!(details, vec!["revoked".to_string()]);
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(client.auth_session().state(), AuthState::Unauthenticated);
        });
        status.assert_hits(1);
    }

    #[test]
    fn pending_status_exhausts_polling_budget() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let _keys = testing::mock_public_keys(&server);
        let _challenge = testing::mock_challenge(&server);
        let _init = server.mock(|when, then| {
            when.method(POST).path("/auth/ksef-token");
            then.status(202).json_body(serde_json::json!({
                "referenceNumber": "20250625-AU-2",
                "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        });
        let status = server.mock(|when, then| {
            when.method(GET).path("/auth/20250625-AU-2");
            then.status(200)
                .json_body(serde_json::json!({"status": {"code": 100, "description": "W toku"}}));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Token("slow".into()),
            )
            .expect("client");
            let err = client.authenticate().await.unwrap_err();
            assert!(matches!(
                err,
                KsefError::Auth(AuthError::PollingExhausted { attempts: 3 })
            ));
        });
        status.assert_hits(3);
    }

    #[test]
    fn malformed_challenge_is_an_authentication_error() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let _challenge = server.mock(|when, then| {
            when.method(POST).path("/auth/challenge");
            then.status(200).json_body(serde_json::json!({"challenge": ""}));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Token("t".into()),
            )
            .expect("client");
            let err = client.authenticate().await.unwrap_err();
            assert!(matches!(
                err,
                KsefError::Auth(AuthError::MalformedChallenge(_))
            ));
        });
    }

    #[test]
    fn certificate_flow_posts_signed_xml() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let _challenge = testing::mock_challenge(&server);
        let xades = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/xades-signature")
                .header("content-type", "application/xml")
                .body_contains("<Challenge>20250625-CR-20F5EE4000-DA48AE4124-46</Challenge>")
                .body_contains("<ds:SignatureValue>");
            then.status(202).json_body(serde_json::json!({
                "referenceNumber": "20250625-AU-3",
                "authenticationToken": {"token": "auth-op", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        });
        let _status = testing::mock_auth_status(&server, "20250625-AU-3");
        let _redeem = testing::mock_redeem(&server);

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Certificate(Box::new(testing::p256_signer())),
            )
            .expect("client");
            client.authenticate().await.expect("authenticated");
        });
        xades.assert_hits(1);
    }

    #[test]
    fn expiring_token_is_refreshed_then_terminated() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let refresh = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/token/refresh")
                .header("authorization", "Bearer refresh-1");
            then.status(200).json_body(serde_json::json!({
                "accessToken": {"token": "access-2", "validUntil": "2099-01-01T00:00:00Z"}
            }));
        });
        let terminate = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/token/terminate")
                .header("authorization", "Bearer access-2");
            then.status(204);
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut client = KsefClient::new(
                fast_config(&server.base_url()),
                Credentials::Token("t".into()),
            )
            .expect("client");
            client.session = AuthSession {
                state: AuthState::Authenticated,
                access: Some(TokenInfo {
                    token: "access-1".into(),
                    valid_until: Utc::now() + chrono::Duration::seconds(30),
                }),
                refresh: Some(TokenInfo {
                    token: "refresh-1".into(),
                    valid_until: Utc::now() + chrono::Duration::days(7),
                }),
            };
            client.ensure_authenticated().await.expect("refreshed");
            assert_eq!(client.access_token().expect("token"), "access-2");

            client.terminate().await.expect("terminated");
            assert_eq!(client.auth_session().state(), AuthState::Unauthenticated);
            assert!(matches!(
                client.access_token(),
                Err(KsefError::Auth(AuthError::NotAuthenticated))
            ));
        });
        refresh.assert_hits(1);
        terminate.assert_hits(1);
    }
}
