//! Per-invoice submission state machine.
//!
//! Every entry point reads the current [`Submission`] for the invoice first, acts, and
//! persists the outcome before returning. The store's atomic claim guarantees at most one
//! PENDING attempt per invoice across concurrent invocations.
pub mod deadline;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    api::{codes, KsefClient, KsefError},
    crypto::xades::{SigningError, XadesSigner},
    invoice::{Invoice, InvoiceDocument, InvoiceDocumentBuilder, InvoiceError},
    session::{FailureKind, SubmissionFailure, SubmissionResult, SubmitOptions},
    store::{base64_serde, Claim, StoreError, SubmissionStore},
};

pub use deadline::{days_behind, offline_deadline, offline_deadline_utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    /// Delivered, outcome not yet known.
    Submitted,
    Accepted,
    Rejected,
    Failed,
    Timeout,
    Offline,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Submitted => "SUBMITTED",
            SubmissionStatus::Accepted => "ACCEPTED",
            SubmissionStatus::Rejected => "REJECTED",
            SubmissionStatus::Failed => "FAILED",
            SubmissionStatus::Timeout => "TIMEOUT",
            SubmissionStatus::Offline => "OFFLINE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Failed | SubmissionStatus::Rejected | SubmissionStatus::Timeout
        )
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one submission lineage for an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Assigned by the store; 0 until first claimed.
    pub id: u64,
    pub invoice_id: String,
    pub status: SubmissionStatus,
    pub ksef_reference: Option<String>,
    pub invoice_reference: Option<String>,
    pub ksef_number: Option<String>,
    pub invoice_hash: Option<String>,
    #[serde(default, with = "base64_serde")]
    pub document: Option<Vec<u8>>,
    pub document_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offline_mode: bool,
    pub offline_deadline: Option<DateTime<Utc>>,
    pub offline_detected_reason: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub upo_xml: Option<String>,
    pub original_invoice_hash: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(invoice_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            invoice_id: invoice_id.into(),
            status: SubmissionStatus::Pending,
            ksef_reference: None,
            invoice_reference: None,
            ksef_number: None,
            invoice_hash: None,
            document: None,
            document_created_at: None,
            offline_mode: false,
            offline_deadline: None,
            offline_detected_reason: None,
            retry_count: 0,
            error_code: None,
            error_message: None,
            error_details: None,
            upo_xml: None,
            original_invoice_hash: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Stored document, if one was kept from an earlier attempt.
    pub fn stored_document(&self) -> Option<InvoiceDocument> {
        let xml = self.document.clone()?;
        let hash = self.invoice_hash.clone()?;
        Some(InvoiceDocument {
            xml,
            hash,
            created_at: self.document_created_at.unwrap_or(self.submitted_at),
        })
    }

    fn attach_document(&mut self, document: &InvoiceDocument) {
        self.document = Some(document.xml.clone());
        self.invoice_hash = Some(document.hash.clone());
        self.document_created_at = Some(document.created_at);
    }

    fn clear_error(&mut self) {
        self.error_code = None;
        self.error_message = None;
        self.error_details = None;
    }

    fn record_failure(&mut self, failure: &SubmissionFailure) {
        self.error_code = failure.code;
        self.error_message = Some(failure.message.clone());
        self.error_details = Some(failure.details.clone());
    }
}

/// Request-scoped inputs of a submission call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitContext {
    pub today: NaiveDate,
    /// The caller confirmed that a backdated invoice may go out in offline mode.
    pub backdating_acknowledged: bool,
}

impl Default for SubmitContext {
    fn default() -> Self {
        Self {
            today: Local::now().date_naive(),
            backdating_acknowledged: false,
        }
    }
}

impl SubmitContext {
    pub fn acknowledged() -> Self {
        Self {
            backdating_acknowledged: true,
            ..Self::default()
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }
}

/// Result of an orchestrator entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Already accepted earlier; nothing was sent.
    AlreadyAccepted(Submission),
    /// Another attempt holds the PENDING claim.
    InProgress(Submission),
    /// The invoice is backdated and the caller has to confirm offline submission.
    NeedsOfflineConfirmation {
        days_behind: i64,
        deadline: DateTime<Utc>,
    },
    /// The attempt ran; the record's status holds the outcome.
    Completed(Submission),
}

impl SubmitOutcome {
    pub fn submission(&self) -> Option<&Submission> {
        match self {
            SubmitOutcome::AlreadyAccepted(submission)
            | SubmitOutcome::InProgress(submission)
            | SubmitOutcome::Completed(submission) => Some(submission),
            SubmitOutcome::NeedsOfflineConfirmation { .. } => None,
        }
    }

    pub fn status(&self) -> Option<SubmissionStatus> {
        self.submission().map(|submission| submission.status)
    }
}

/// Result of a UPO backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpoOutcome {
    Available(String),
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Invoice(#[from] InvoiceError),
    #[error("offline invoicing requires a configured certificate")]
    OfflineNotConfigured,
    #[error("offline certificate cannot be loaded: {0}")]
    OfflineCertificate(#[from] SigningError),
    #[error("no submission found for {0}")]
    NotFound(String),
    #[error("cannot {operation} invoice {invoice_id} in status {status}")]
    InvalidState {
        invoice_id: String,
        status: SubmissionStatus,
        operation: &'static str,
    },
    #[error("technical correction of {invoice_id} does not change the document")]
    UnchangedCorrection { invoice_id: String },
    #[error(transparent)]
    Ksef(#[from] KsefError),
}

/// Drives [`KsefClient`] submissions and keeps the [`Submission`] records current.
#[derive(Debug)]
pub struct SubmissionOrchestrator<S, B> {
    client: KsefClient,
    store: S,
    builder: B,
}

impl<S: SubmissionStore, B: InvoiceDocumentBuilder> SubmissionOrchestrator<S, B> {
    pub fn new(client: KsefClient, store: S, builder: B) -> Self {
        Self {
            client,
            store,
            builder,
        }
    }

    pub fn client(&mut self) -> &mut KsefClient {
        &mut self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (KsefClient, S, B) {
        (self.client, self.store, self.builder)
    }

    /// Submit an invoice online, or report why no attempt was made.
    pub async fn submit(
        &mut self,
        invoice: &Invoice,
        ctx: &SubmitContext,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let current = self.store.current(&invoice.id)?;
        if let Some(outcome) = settled_outcome(current.as_ref()) {
            return Ok(outcome);
        }

        let days_behind = deadline::days_behind(invoice.business_date, ctx.today);
        if days_behind > 0 && !ctx.backdating_acknowledged {
            return Ok(SubmitOutcome::NeedsOfflineConfirmation {
                days_behind,
                deadline: offline_deadline_utc(invoice.business_date),
            });
        }

        let document = self.document_for(invoice, current.as_ref())?;
        let mut record = reuse_or_new(invoice, current);
        record.attach_document(&document);
        if days_behind > 0 {
            record.offline_mode = true;
            record.offline_deadline = Some(offline_deadline_utc(invoice.business_date));
            record.offline_detected_reason =
                Some(format!("business date {days_behind} day(s) in the past"));
        }

        let record = match self.claim(record)? {
            Ok(record) => record,
            Err(outcome) => return Ok(outcome),
        };
        let options = SubmitOptions {
            offline_mode: record.offline_mode,
            invoice_hash: record.invoice_hash.clone(),
            ..SubmitOptions::default()
        };
        self.send(record, &document.xml, &options).await
    }

    /// Record an invoice as issued offline, without contacting the platform.
    pub async fn submit_offline(
        &mut self,
        invoice: &Invoice,
        reason: &str,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let certificate = self
            .client
            .config()
            .offline_certificate()
            .ok_or(SubmissionError::OfflineNotConfigured)?;
        XadesSigner::from_files(certificate)?;

        let current = self.store.current(&invoice.id)?;
        if let Some(outcome) = settled_outcome(current.as_ref()) {
            return Ok(outcome);
        }
        if let Some(current) = current.as_ref().filter(|c| c.status == SubmissionStatus::Offline) {
            return Ok(SubmitOutcome::Completed(current.clone()));
        }

        let document = self.document_for(invoice, current.as_ref())?;
        let mut record = reuse_or_new(invoice, current);
        record.attach_document(&document);
        let now = Utc::now();
        record.status = SubmissionStatus::Offline;
        record.offline_mode = true;
        record.offline_deadline = Some(offline_deadline_utc(invoice.business_date));
        record.offline_detected_reason = Some(reason.to_string());
        record.ksef_number = Some(format!(
            "OFFLINE-{}-{}",
            invoice.number,
            now.format("%Y%m%d%H%M%S")
        ));
        record.clear_error();
        record.updated_at = now;

        match self.store.claim(record)? {
            Claim::Claimed(record) => {
                info!(invoice = %invoice.id, deadline = ?record.offline_deadline, "invoice issued offline");
                Ok(SubmitOutcome::Completed(record))
            }
            Claim::Busy(current) => Ok(busy_outcome(current)),
        }
    }

    /// Retry a FAILED, REJECTED or TIMEOUT submission.
    ///
    /// Offline-mode records resend their stored document without the backdating check.
    pub async fn retry(
        &mut self,
        invoice: &Invoice,
        ctx: &SubmitContext,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let current = self.require_current(invoice, "retry", |status| status.is_retryable())?;
        if !current.offline_mode {
            return self.submit(invoice, ctx).await;
        }
        self.resend_offline(invoice, current).await
    }

    /// Send an OFFLINE record to the platform now that it is reachable.
    pub async fn reconcile_offline(
        &mut self,
        invoice: &Invoice,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let current = self.require_current(invoice, "reconcile", |status| {
            status == SubmissionStatus::Offline
        })?;
        self.resend_offline(invoice, current).await
    }

    /// Submit a corrected document for a rejected offline invoice as a new lineage.
    pub async fn submit_technical_correction(
        &mut self,
        invoice: &Invoice,
        original_submission_id: u64,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let original = self
            .store
            .get(original_submission_id)?
            .filter(|original| original.invoice_id == invoice.id)
            .ok_or_else(|| SubmissionError::NotFound(format!("submission {original_submission_id}")))?;
        let correctable = matches!(
            original.status,
            SubmissionStatus::Rejected | SubmissionStatus::Failed
        );
        if !correctable || !original.offline_mode {
            return Err(SubmissionError::InvalidState {
                invoice_id: invoice.id.clone(),
                status: original.status,
                operation: "correct",
            });
        }

        let document = self.builder.build(invoice, None)?;
        if original.invoice_hash.as_deref() == Some(document.hash.as_str()) {
            return Err(SubmissionError::UnchangedCorrection {
                invoice_id: invoice.id.clone(),
            });
        }
        let mut record = Submission::new(&invoice.id);
        record.attach_document(&document);
        record.offline_mode = true;
        record.offline_deadline = original.offline_deadline;
        record.offline_detected_reason = original.offline_detected_reason.clone();
        record.original_invoice_hash = original.invoice_hash.clone();

        let record = match self.claim(record)? {
            Ok(record) => record,
            Err(outcome) => return Ok(outcome),
        };
        let options = SubmitOptions {
            offline_mode: true,
            invoice_hash: Some(document.hash.clone()),
            corrected_hash: original.invoice_hash,
            ..SubmitOptions::default()
        };
        self.send(record, &document.xml, &options).await
    }

    /// Ask the platform what became of a timed-out submission instead of resending it.
    pub async fn resolve_timeout(
        &mut self,
        invoice: &Invoice,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let mut record = self.require_current(invoice, "resolve", |status| {
            matches!(status, SubmissionStatus::Timeout | SubmissionStatus::Submitted)
        })?;
        let (Some(reference), Some(invoice_reference)) =
            (record.ksef_reference.clone(), record.invoice_reference.clone())
        else {
            return Err(SubmissionError::InvalidState {
                invoice_id: invoice.id.clone(),
                status: record.status,
                operation: "resolve without references",
            });
        };

        record.updated_at = Utc::now();
        match self.client.invoice_status(&reference, &invoice_reference).await {
            Err(err) => {
                warn!(invoice = %invoice.id, error = %err, "timeout resolution failed");
                record.record_failure(&SubmissionFailure::from(err));
            }
            Ok(status) if codes::is_terminal_failure(status.status.code) => {
                let failure = SubmissionFailure::from_status(&status.status);
                record.status = status_for_failure(&failure);
                record.record_failure(&failure);
            }
            Ok(status) => match status.ksef_number {
                Some(ksef_number) if status.status.code == 200 => {
                    record.status = SubmissionStatus::Accepted;
                    record.ksef_number = Some(ksef_number);
                    if let Some(hash) = status.invoice_hash {
                        record.invoice_hash = Some(hash);
                    }
                    record.clear_error();
                    record.upo_xml = self
                        .client
                        .fetch_upo(&reference, &invoice_reference)
                        .await
                        .ok();
                }
                _ => record.status = SubmissionStatus::Submitted,
            },
        }
        self.store.save(&record)?;
        info!(invoice = %invoice.id, status = %record.status, "timeout resolved");
        Ok(SubmitOutcome::Completed(record))
    }

    /// Backfill the UPO of an accepted submission.
    pub async fn fetch_upo(&mut self, invoice: &Invoice) -> Result<UpoOutcome, SubmissionError> {
        let mut record = self.require_current(invoice, "fetch UPO for", |status| {
            status == SubmissionStatus::Accepted
        })?;
        if let Some(upo) = &record.upo_xml {
            return Ok(UpoOutcome::Available(upo.clone()));
        }
        let (Some(reference), Some(invoice_reference)) =
            (record.ksef_reference.clone(), record.invoice_reference.clone())
        else {
            return Ok(UpoOutcome::Unavailable("submission has no session references".into()));
        };
        match self.client.fetch_upo(&reference, &invoice_reference).await {
            Ok(upo) => {
                record.upo_xml = Some(upo.clone());
                record.updated_at = Utc::now();
                self.store.save(&record)?;
                Ok(UpoOutcome::Available(upo))
            }
            Err(err) => {
                warn!(invoice = %invoice.id, error = %err, "UPO fetch failed");
                Ok(UpoOutcome::Unavailable(err.to_string()))
            }
        }
    }

    async fn resend_offline(
        &mut self,
        invoice: &Invoice,
        mut record: Submission,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let document = match record.stored_document() {
            Some(document) => document,
            None => self.builder.build(invoice, record.document_created_at)?,
        };
        record.attach_document(&document);
        if record.status != SubmissionStatus::Offline {
            record.retry_count += 1;
        }
        let record = match self.claim(record)? {
            Ok(record) => record,
            Err(outcome) => return Ok(outcome),
        };
        let options = SubmitOptions {
            offline_mode: true,
            invoice_hash: Some(document.hash.clone()),
            corrected_hash: None,
            ..SubmitOptions::default()
        };
        self.send(record, &document.xml, &options).await
    }

    fn document_for(
        &self,
        invoice: &Invoice,
        current: Option<&Submission>,
    ) -> Result<InvoiceDocument, SubmissionError> {
        if let Some(stored) = current.and_then(Submission::stored_document) {
            return Ok(stored);
        }
        Ok(self
            .builder
            .build(invoice, current.and_then(|c| c.document_created_at))?)
    }

    fn require_current(
        &self,
        invoice: &Invoice,
        operation: &'static str,
        allowed: impl Fn(SubmissionStatus) -> bool,
    ) -> Result<Submission, SubmissionError> {
        let current = self
            .store
            .current(&invoice.id)?
            .ok_or_else(|| SubmissionError::NotFound(invoice.id.clone()))?;
        if !allowed(current.status) {
            return Err(SubmissionError::InvalidState {
                invoice_id: invoice.id.clone(),
                status: current.status,
                operation,
            });
        }
        Ok(current)
    }

    /// Take the PENDING claim, or return the outcome describing who holds it.
    fn claim(&self, mut record: Submission) -> Result<Result<Submission, SubmitOutcome>, StoreError> {
        record.status = SubmissionStatus::Pending;
        record.updated_at = Utc::now();
        Ok(match self.store.claim(record)? {
            Claim::Claimed(record) => Ok(record),
            Claim::Busy(current) => Err(busy_outcome(current)),
        })
    }

    async fn send(
        &mut self,
        mut record: Submission,
        xml: &[u8],
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, SubmissionError> {
        info!(invoice = %record.invoice_id, offline = options.offline_mode, retry = record.retry_count, "submitting invoice");
        let result = self.client.submit_invoice(xml, options).await;
        apply_result(&mut record, result);
        self.store.save(&record)?;
        info!(invoice = %record.invoice_id, status = %record.status, "submission finished");
        Ok(SubmitOutcome::Completed(record))
    }
}

fn settled_outcome(current: Option<&Submission>) -> Option<SubmitOutcome> {
    let current = current?;
    match current.status {
        SubmissionStatus::Accepted => Some(SubmitOutcome::AlreadyAccepted(current.clone())),
        SubmissionStatus::Pending => Some(SubmitOutcome::InProgress(current.clone())),
        _ => None,
    }
}

fn busy_outcome(current: Submission) -> SubmitOutcome {
    if current.status == SubmissionStatus::Accepted {
        SubmitOutcome::AlreadyAccepted(current)
    } else {
        SubmitOutcome::InProgress(current)
    }
}

/// Reuse the current row for another attempt, or start a new lineage.
fn reuse_or_new(invoice: &Invoice, current: Option<Submission>) -> Submission {
    match current {
        Some(mut current) => {
            if current.status.is_retryable() {
                current.retry_count += 1;
            }
            current
        }
        None => Submission::new(&invoice.id),
    }
}

fn status_for_failure(failure: &SubmissionFailure) -> SubmissionStatus {
    match failure.kind {
        FailureKind::Rejected | FailureKind::Duplicate { .. } => SubmissionStatus::Rejected,
        _ => SubmissionStatus::Failed,
    }
}

fn apply_result(record: &mut Submission, result: SubmissionResult) {
    record.updated_at = Utc::now();
    match result {
        SubmissionResult::Accepted(accepted) => {
            record.status = SubmissionStatus::Accepted;
            record.ksef_reference = Some(accepted.reference_number);
            record.invoice_reference = Some(accepted.invoice_reference);
            record.ksef_number = Some(accepted.ksef_number);
            record.invoice_hash = Some(accepted.invoice_hash);
            record.upo_xml = accepted.upo;
            record.clear_error();
        }
        SubmissionResult::Failed {
            reference_number,
            invoice_reference,
            failure,
        } => {
            record.status = status_for_failure(&failure);
            if reference_number.is_some() {
                record.ksef_reference = reference_number;
            }
            if invoice_reference.is_some() {
                record.invoice_reference = invoice_reference;
            }
            record.record_failure(&failure);
        }
        SubmissionResult::Timeout {
            reference_number,
            invoice_reference,
        } => {
            record.status = SubmissionStatus::Timeout;
            record.ksef_reference = Some(reference_number);
            record.invoice_reference = Some(invoice_reference);
            record.clear_error();
        }
    }
}
