//! Interactive session protocol: encrypt, open, upload, poll, close and fetch results.
use base64ct::{Base64, Encoding};
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::{
    api::{codes, ApiError, KeyUsage, KsefClient, KsefError},
    auth::AuthError,
    crypto::{self, CryptoError},
};

/// Schema identification sent when opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormCode {
    pub system_code: String,
    pub schema_version: String,
    pub value: String,
}

impl Default for FormCode {
    fn default() -> Self {
        Self {
            system_code: "FA (3)".into(),
            schema_version: "1-0E".into(),
            value: "FA".into(),
        }
    }
}

/// Per-submission switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub offline_mode: bool,
    /// Hash to declare instead of hashing the document again.
    pub invoice_hash: Option<String>,
    /// Hash of the rejected offline invoice this one technically corrects.
    pub corrected_hash: Option<String>,
    pub form_code: FormCode,
}

/// Status object with the optional extension fields the platform attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub extensions: Option<serde_json::Value>,
}

/// `GET /sessions/{ref}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: ProcessingStatus,
    #[serde(default)]
    pub invoice_count: Option<u32>,
    #[serde(default)]
    pub successful_invoice_count: Option<u32>,
    #[serde(default)]
    pub failed_invoice_count: Option<u32>,
}

/// Per-invoice status inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatus {
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub ksef_number: Option<String>,
    #[serde(default)]
    pub invoice_hash: Option<String>,
    pub status: ProcessingStatus,
}

#[derive(Debug, Deserialize)]
struct SessionInvoices {
    #[serde(default)]
    invoices: Vec<InvoiceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceResponse {
    reference_number: String,
}

/// Invoice accepted by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedInvoice {
    pub reference_number: String,
    pub invoice_reference: String,
    pub ksef_number: String,
    pub invoice_hash: String,
    pub upo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The platform rejected the document.
    Rejected,
    /// Code 440: the same invoice was already accepted.
    Duplicate { original_ksef_number: Option<String> },
    RateLimited { retry_after_secs: u64 },
    Authentication,
    Crypto,
    Transport,
    Protocol,
}

/// Why a submission did not succeed, with the platform's structured details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFailure {
    pub kind: FailureKind,
    pub code: Option<i64>,
    pub message: String,
    pub details: serde_json::Value,
}

impl SubmissionFailure {
    pub(crate) fn from_status(status: &ProcessingStatus) -> Self {
        let message = if status.description.is_empty() {
            codes::describe(status.code)
        } else {
            status.description.clone()
        };
        let kind = if status.code == codes::KsefStatusCode::Duplicate.code() {
            FailureKind::Duplicate {
                original_ksef_number: original_ksef_number(status),
            }
        } else {
            FailureKind::Rejected
        };
        let mut details = serde_json::json!({
            "description": codes::describe(status.code),
            "details": status.details,
        });
        if let FailureKind::Duplicate {
            original_ksef_number: Some(number),
        } = &kind
        {
            details["originalKsefNumber"] = serde_json::Value::String(number.clone());
        }
        Self {
            kind,
            code: Some(status.code),
            message,
            details,
        }
    }
}

impl From<KsefError> for SubmissionFailure {
    fn from(err: KsefError) -> Self {
        let code = err.code();
        let message = err.to_string();
        let (kind, details) = match &err {
            KsefError::RateLimited { retry_after_secs } => (
                FailureKind::RateLimited {
                    retry_after_secs: *retry_after_secs,
                },
                serde_json::json!({ "retryAfterSeconds": retry_after_secs }),
            ),
            KsefError::Api(api) => (
                api_failure_kind(api),
                serde_json::to_value(api).unwrap_or_default(),
            ),
            KsefError::Auth(AuthError::Rejected { details, .. }) => (
                FailureKind::Authentication,
                serde_json::json!({ "details": details }),
            ),
            KsefError::Auth(AuthError::Http(api)) => (
                FailureKind::Authentication,
                serde_json::to_value(api).unwrap_or_default(),
            ),
            KsefError::Auth(_) => (FailureKind::Authentication, serde_json::Value::Null),
            KsefError::Crypto(_) | KsefError::Signing(_) => {
                (FailureKind::Crypto, serde_json::Value::Null)
            }
            KsefError::Http(_) => (FailureKind::Transport, serde_json::Value::Null),
            KsefError::Protocol(_) => (FailureKind::Protocol, serde_json::Value::Null),
        };
        Self {
            kind,
            code,
            message,
            details,
        }
    }
}

/// Only a 4xx carrying a platform exception code is a verdict on the document.
fn api_failure_kind(api: &ApiError) -> FailureKind {
    match api.status {
        401 | 403 => FailureKind::Authentication,
        400..=499 if api.code().is_some() => FailureKind::Rejected,
        400..=499 => FailureKind::Protocol,
        _ => FailureKind::Transport,
    }
}

impl From<CryptoError> for SubmissionFailure {
    fn from(err: CryptoError) -> Self {
        KsefError::from(err).into()
    }
}

/// Outcome of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    Accepted(AcceptedInvoice),
    Failed {
        reference_number: Option<String>,
        invoice_reference: Option<String>,
        failure: SubmissionFailure,
    },
    /// Polling budget exhausted; the real outcome is unknown.
    Timeout {
        reference_number: String,
        invoice_reference: String,
    },
}

enum PollOutcome {
    Succeeded,
    Failed(SubmissionFailure),
    Exhausted,
}

#[derive(Default)]
struct Trace {
    reference_number: Option<String>,
    invoice_reference: Option<String>,
}

fn ksef_number_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b\d{10}-\d{8}-[0-9A-F]{12}-[0-9A-F]{2}\b").ok())
        .as_ref()
}

/// Original number of a duplicate, from the status extensions or its free-text details.
fn original_ksef_number(status: &ProcessingStatus) -> Option<String> {
    if let Some(number) = status
        .extensions
        .as_ref()
        .and_then(|ext| ext.get("originalKsefNumber"))
        .and_then(|value| value.as_str())
    {
        return Some(number.to_string());
    }
    let pattern = ksef_number_pattern()?;
    status
        .details
        .iter()
        .chain(std::iter::once(&status.description))
        .find_map(|text| pattern.find(text))
        .map(|found| found.as_str().to_string())
}

impl KsefClient {
    /// Submit one invoice through an interactive session.
    ///
    /// Never fails: every error becomes [`SubmissionResult::Failed`] carrying whatever
    /// references were already assigned.
    pub async fn submit_invoice(
        &mut self,
        invoice_xml: &[u8],
        options: &SubmitOptions,
    ) -> SubmissionResult {
        let mut trace = Trace::default();
        match self.try_submit(invoice_xml, options, &mut trace).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "submission failed");
                SubmissionResult::Failed {
                    reference_number: trace.reference_number,
                    invoice_reference: trace.invoice_reference,
                    failure: err.into(),
                }
            }
        }
    }

    pub async fn session_status(&mut self, reference: &str) -> Result<SessionStatus, KsefError> {
        self.ensure_authenticated().await?;
        let token = self.access_token()?;
        self.request_json(Method::GET, &format!("sessions/{reference}"), None, Some(&token))
            .await
    }

    pub async fn invoice_status(
        &mut self,
        reference: &str,
        invoice_reference: &str,
    ) -> Result<InvoiceStatus, KsefError> {
        self.ensure_authenticated().await?;
        let token = self.access_token()?;
        self.request_json(
            Method::GET,
            &format!("sessions/{reference}/invoices/{invoice_reference}"),
            None,
            Some(&token),
        )
        .await
    }

    pub async fn session_invoices(
        &mut self,
        reference: &str,
    ) -> Result<Vec<InvoiceStatus>, KsefError> {
        self.ensure_authenticated().await?;
        let token = self.access_token()?;
        let list: SessionInvoices = self
            .request_json(
                Method::GET,
                &format!("sessions/{reference}/invoices"),
                None,
                Some(&token),
            )
            .await?;
        Ok(list.invoices)
    }

    /// Official receipt (UPO) XML for an accepted invoice.
    pub async fn fetch_upo(
        &mut self,
        reference: &str,
        invoice_reference: &str,
    ) -> Result<String, KsefError> {
        self.ensure_authenticated().await?;
        let token = self.access_token()?;
        let bytes = self
            .request_bytes(
                Method::GET,
                &format!("sessions/{reference}/invoices/{invoice_reference}/upo"),
                None,
                Some(&token),
            )
            .await?;
        String::from_utf8(bytes).map_err(|e| KsefError::Protocol(format!("UPO is not UTF-8: {e}")))
    }

    async fn try_submit(
        &mut self,
        invoice_xml: &[u8],
        options: &SubmitOptions,
        trace: &mut Trace,
    ) -> Result<SubmissionResult, KsefError> {
        self.ensure_authenticated().await.map_err(|err| match err {
            KsefError::Api(api) => AuthError::Http(api).into(),
            other => other,
        })?;
        let public_key = self.public_key(KeyUsage::SymmetricKeyEncryption).await?;
        let (envelope, _key) = crypto::encrypt_envelope(invoice_xml, &public_key)?;
        let token = self.access_token()?;

        let mut open = serde_json::json!({
            "formCode": options.form_code,
            "encryption": {
                "encryptedSymmetricKey": envelope.wrapped_key_base64(),
                "initializationVector": envelope.iv_base64(),
            },
        });
        if options.offline_mode {
            open["offlineMode"] = serde_json::Value::Bool(true);
        }
        let session: ReferenceResponse = self
            .request_json(Method::POST, "sessions/online", Some(&open), Some(&token))
            .await?;
        let reference = session.reference_number;
        trace.reference_number = Some(reference.clone());
        info!(session = %reference, offline = options.offline_mode, "session opened");

        let invoice_hash = options
            .invoice_hash
            .clone()
            .unwrap_or_else(|| crypto::sha256_base64(invoice_xml));
        let mut upload = serde_json::json!({
            "invoiceHash": invoice_hash,
            "invoiceSize": invoice_xml.len(),
            "encryptedInvoiceHash": crypto::sha256_base64(&envelope.ciphertext),
            "encryptedInvoiceSize": envelope.ciphertext.len(),
            "encryptedInvoiceContent": Base64::encode_string(&envelope.ciphertext),
            "offlineMode": options.offline_mode,
        });
        if let Some(corrected) = &options.corrected_hash {
            upload["hashOfCorrectedInvoice"] = serde_json::Value::String(corrected.clone());
        }
        let sent: ReferenceResponse = self
            .request_json(
                Method::POST,
                &format!("sessions/online/{reference}/invoices"),
                Some(&upload),
                Some(&token),
            )
            .await?;
        let invoice_reference = sent.reference_number;
        trace.invoice_reference = Some(invoice_reference.clone());
        info!(session = %reference, invoice = %invoice_reference, "invoice uploaded");

        match self.poll_session(&reference, &invoice_reference).await? {
            PollOutcome::Succeeded => {}
            PollOutcome::Failed(failure) => {
                return Ok(SubmissionResult::Failed {
                    reference_number: Some(reference),
                    invoice_reference: Some(invoice_reference),
                    failure,
                })
            }
            PollOutcome::Exhausted => {
                return Ok(SubmissionResult::Timeout {
                    reference_number: reference,
                    invoice_reference,
                })
            }
        }

        self.finish_session(&reference, &invoice_reference, invoice_hash)
            .await
            .map(SubmissionResult::Accepted)
    }

    /// Poll the session until the invoice is processed or the budget runs out.
    ///
    /// Every `invoice_check_every` attempts the invoice itself is checked too, so an early
    /// rejection ends polling before the session reports it.
    async fn poll_session(
        &mut self,
        reference: &str,
        invoice_reference: &str,
    ) -> Result<PollOutcome, KsefError> {
        let policy = self.config.session_polling();
        let check_every = self.config.invoice_check_every();
        for attempt in 1..=policy.max_attempts {
            let status = self.session_status(reference).await?;
            debug!(
                attempt,
                code = status.status.code,
                successful = ?status.successful_invoice_count,
                failed = ?status.failed_invoice_count,
                "session status"
            );
            if status.successful_invoice_count.unwrap_or(0) > 0 {
                return Ok(PollOutcome::Succeeded);
            }
            if status.failed_invoice_count.unwrap_or(0) > 0 {
                let invoice = self.invoice_status(reference, invoice_reference).await?;
                return Ok(PollOutcome::Failed(SubmissionFailure::from_status(
                    &invoice.status,
                )));
            }
            if codes::is_terminal_failure(status.status.code) {
                return Ok(PollOutcome::Failed(SubmissionFailure::from_status(
                    &status.status,
                )));
            }
            if check_every > 0 && attempt % check_every == 0 {
                let invoice = self.invoice_status(reference, invoice_reference).await?;
                if codes::is_terminal_failure(invoice.status.code) {
                    return Ok(PollOutcome::Failed(SubmissionFailure::from_status(
                        &invoice.status,
                    )));
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        warn!(
            session = %reference,
            budget_secs = policy.budget().as_secs(),
            "session polling budget exhausted"
        );
        Ok(PollOutcome::Exhausted)
    }

    async fn finish_session(
        &mut self,
        reference: &str,
        invoice_reference: &str,
        invoice_hash: String,
    ) -> Result<AcceptedInvoice, KsefError> {
        let token = self.access_token()?;
        if let Err(err) = self
            .request_bytes(
                Method::POST,
                &format!("sessions/online/{reference}/close"),
                None,
                Some(&token),
            )
            .await
        {
            warn!(session = %reference, error = %err, "closing session failed");
        }

        let listed = self
            .session_invoices(reference)
            .await?
            .into_iter()
            .find(|invoice| invoice.reference_number.as_deref() == Some(invoice_reference));
        let listed = match listed {
            Some(listed) if listed.ksef_number.is_some() => listed,
            _ => self.invoice_status(reference, invoice_reference).await?,
        };
        let ksef_number = listed.ksef_number.ok_or_else(|| {
            KsefError::Protocol(format!("no KSeF number for invoice {invoice_reference}"))
        })?;
        info!(session = %reference, ksef_number = %ksef_number, "invoice accepted");

        let upo = match self.fetch_upo(reference, invoice_reference).await {
            Ok(upo) => Some(upo),
            Err(err) => {
                warn!(error = %err, "UPO not available yet");
                None
            }
        };
        Ok(AcceptedInvoice {
            reference_number: reference.to_string(),
            invoice_reference: invoice_reference.to_string(),
            ksef_number,
            invoice_hash: listed.invoice_hash.unwrap_or(invoice_hash),
            upo,
        })
    }
}
