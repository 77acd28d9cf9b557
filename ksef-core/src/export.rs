//! Incoming-invoice export saga.
//!
//! Each call loads the [`SyncState`] checkpoint, advances it by one step and persists it
//! before returning, so independent invocations can pick up where the last one stopped.
mod archive;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{codes, KeyUsage, KsefClient, KsefError, StatusInfo},
    crypto::{CryptoError, StateSeal, SymmetricKey},
    store::{StoreError, SyncStateStore},
};

pub use archive::{process_archive, BatchCounts, IncomingInvoiceSink, ProcessReport, SinkError};

/// Default export type name.
pub const INCOMING: &str = "incoming";

/// Lower bound of the first export when no HWM exists yet.
pub fn bootstrap_hwm() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Processing,
    Failed,
    Timeout,
}

/// One part of a completed export package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPart {
    pub ordinal_number: u32,
    #[serde(default)]
    pub part_name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPackage {
    #[serde(default)]
    pub invoice_count: u64,
    #[serde(default)]
    pub parts: Vec<ExportPart>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub last_permanent_storage_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permanent_storage_hwm_date: Option<DateTime<Utc>>,
}

impl ExportPackage {
    /// Date the HWM moves to once this package is processed.
    pub fn next_hwm(&self, completed_at: DateTime<Utc>) -> DateTime<Utc> {
        let truncated = self
            .is_truncated
            .then_some(self.last_permanent_storage_date)
            .flatten();
        truncated
            .or(self.permanent_storage_hwm_date)
            .unwrap_or(completed_at)
    }
}

/// Completed package whose download or processing has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPackage {
    pub reference: String,
    pub package: ExportPackage,
    pub completed_at: DateTime<Utc>,
}

/// Durable checkpoint of one export type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub export_type: String,
    pub hwm_date: Option<DateTime<Utc>>,
    pub fetch_reference: Option<String>,
    pub fetch_status: Option<FetchStatus>,
    pub fetch_started: Option<DateTime<Utc>>,
    /// Sealed with the configured state secret.
    pub fetch_key: Option<String>,
    pub fetch_iv: Option<String>,
    pub fetch_error: Option<String>,
    pub pending_package: Option<PendingPackage>,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_new: u64,
    #[serde(default)]
    pub last_existing: u64,
    #[serde(default)]
    pub last_total: u64,
    pub rate_limit_until: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(export_type: impl Into<String>) -> Self {
        Self {
            export_type: export_type.into(),
            hwm_date: None,
            fetch_reference: None,
            fetch_status: None,
            fetch_started: None,
            fetch_key: None,
            fetch_iv: None,
            fetch_error: None,
            pending_package: None,
            last_sync: None,
            last_new: 0,
            last_existing: 0,
            last_total: 0,
            rate_limit_until: None,
        }
    }

    pub fn fetch_in_progress(&self) -> bool {
        self.fetch_reference.as_deref().is_some_and(|r| !r.is_empty())
            && self.fetch_status == Some(FetchStatus::Processing)
    }

    /// Move the HWM forward; earlier dates are ignored.
    pub fn advance_hwm(&mut self, candidate: DateTime<Utc>) {
        if self.hwm_date.map_or(true, |current| candidate > current) {
            self.hwm_date = Some(candidate);
        }
    }

    fn clear_fetch(&mut self) {
        self.fetch_reference = None;
        self.fetch_status = None;
        self.fetch_started = None;
        self.fetch_key = None;
        self.fetch_iv = None;
        self.fetch_error = None;
        self.pending_package = None;
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ksef(#[from] KsefError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("export archive is unreadable: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("export archive entry is unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("export {reference} is still in progress")]
    InProgress { reference: String },
    #[error("rate limited until {until}")]
    RateLimited { until: DateTime<Utc> },
    #[error("a state secret is required to keep export keys at rest")]
    StateSecretMissing,
    #[error("export processing stopped after {report:?}: {source}")]
    Sink {
        source: SinkError,
        report: ProcessReport,
    },
}

/// Export accepted by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStarted {
    pub reference: String,
    pub from: DateTime<Utc>,
}

/// Outcome of [`IncomingExportPipeline::check_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExportStatus {
    /// No export is running.
    Idle { hwm_date: Option<DateTime<Utc>> },
    Processing {
        reference: String,
        elapsed: chrono::Duration,
    },
    TimedOut { reference: String },
    Failed {
        reference: String,
        code: i64,
        description: String,
    },
    Completed {
        report: ProcessReport,
        hwm_date: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportStatusResponse {
    status: StatusInfo,
    #[serde(default)]
    completed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    package: Option<ExportPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportInitResponse {
    reference_number: String,
}

/// Resumable export of invoices received by the configured context.
#[derive(Debug)]
pub struct IncomingExportPipeline<S> {
    client: KsefClient,
    store: S,
    export_type: String,
}

impl<S: SyncStateStore> IncomingExportPipeline<S> {
    pub fn new(client: KsefClient, store: S) -> Self {
        Self {
            client,
            store,
            export_type: INCOMING.to_string(),
        }
    }

    pub fn with_export_type(mut self, export_type: impl Into<String>) -> Self {
        self.export_type = export_type.into();
        self
    }

    pub fn client(&mut self) -> &mut KsefClient {
        &mut self.client
    }

    pub fn state(&self) -> Result<SyncState, ExportError> {
        Ok(self.store.load_sync_state(&self.export_type)?)
    }

    /// Start a server-side export from the current HWM.
    pub async fn init_fetch(&mut self) -> Result<ExportStarted, ExportError> {
        let seal = self.seal()?;
        let mut state = self.store.load_sync_state(&self.export_type)?;
        let now = Utc::now();
        self.check_rate_limit(&state)?;
        if state.fetch_in_progress() || state.pending_package.is_some() {
            if !self.timed_out(&state, now) {
                return Err(ExportError::InProgress {
                    reference: state.fetch_reference.clone().unwrap_or_default(),
                });
            }
            warn!(reference = ?state.fetch_reference, "clearing stale export");
            let reference = state.fetch_reference.clone();
            state.clear_fetch();
            state.fetch_reference = reference;
            state.fetch_status = Some(FetchStatus::Timeout);
            self.store.save_sync_state(&state)?;
        }

        let from = state.hwm_date.unwrap_or_else(bootstrap_hwm);
        let key = SymmetricKey::generate();
        match self.start_export(&key, from).await {
            Ok(reference) => {
                state.clear_fetch();
                state.fetch_reference = Some(reference.clone());
                state.fetch_status = Some(FetchStatus::Processing);
                state.fetch_started = Some(now);
                state.fetch_key = Some(seal.seal(key.key()));
                state.fetch_iv = Some(seal.seal(key.iv()));
                self.store.save_sync_state(&state)?;
                info!(%reference, %from, "export started");
                Ok(ExportStarted { reference, from })
            }
            Err(err) => Err(self.persist_failure(state, err)),
        }
    }

    /// Advance the running export: resume unfinished processing, or poll the platform.
    pub async fn check_status(
        &mut self,
        sink: &mut dyn IncomingInvoiceSink,
    ) -> Result<ExportStatus, ExportError> {
        let mut state = self.store.load_sync_state(&self.export_type)?;
        if let Some(pending) = state.pending_package.clone() {
            self.check_rate_limit(&state)?;
            info!(reference = %pending.reference, "resuming export processing");
            return self.process_package(state, pending, sink).await;
        }
        let Some(reference) = state.fetch_reference.clone().filter(|_| state.fetch_in_progress())
        else {
            return Ok(ExportStatus::Idle {
                hwm_date: state.hwm_date,
            });
        };

        self.check_rate_limit(&state)?;
        let now = Utc::now();
        let response = match self.poll_export(&reference).await {
            Ok(response) => response,
            Err(err) => return Err(self.persist_failure(state, err)),
        };
        match response.status.code {
            200 => {
                let completed_at = response.completed_date.unwrap_or(now);
                let package = response.package.unwrap_or(ExportPackage {
                    invoice_count: 0,
                    parts: Vec::new(),
                    is_truncated: false,
                    last_permanent_storage_date: None,
                    permanent_storage_hwm_date: None,
                });
                if package.invoice_count > 0 && package.parts.is_empty() {
                    let err = KsefError::Protocol(format!(
                        "export {reference} reports {} invoices but no parts",
                        package.invoice_count
                    ));
                    return Err(self.persist_failure(state, err.into()));
                }
                if package.invoice_count == 0 {
                    state.advance_hwm(package.next_hwm(completed_at));
                    state.clear_fetch();
                    self.record_run(&mut state, &ProcessReport::default());
                    self.store.save_sync_state(&state)?;
                    info!(%reference, "export completed without invoices");
                    return Ok(ExportStatus::Completed {
                        report: ProcessReport::default(),
                        hwm_date: state.hwm_date,
                    });
                }
                let pending = PendingPackage {
                    reference,
                    package,
                    completed_at,
                };
                state.pending_package = Some(pending.clone());
                self.store.save_sync_state(&state)?;
                self.process_package(state, pending, sink).await
            }
            code if codes::is_terminal_failure(code) => {
                let description = response.status.description.clone();
                warn!(%reference, code, %description, "export failed");
                state.fetch_status = Some(FetchStatus::Failed);
                state.fetch_error = Some(format!("{code}: {description}"));
                self.store.save_sync_state(&state)?;
                Ok(ExportStatus::Failed {
                    reference,
                    code,
                    description,
                })
            }
            _ => {
                if self.timed_out(&state, now) {
                    state.fetch_status = Some(FetchStatus::Timeout);
                    state.fetch_error = Some("export did not complete in time".into());
                    self.store.save_sync_state(&state)?;
                    return Ok(ExportStatus::TimedOut { reference });
                }
                let elapsed = now - state.fetch_started.unwrap_or(now);
                debug!(%reference, elapsed_secs = elapsed.num_seconds(), "export still processing");
                Ok(ExportStatus::Processing { reference, elapsed })
            }
        }
    }

    async fn start_export(
        &mut self,
        key: &SymmetricKey,
        from: DateTime<Utc>,
    ) -> Result<String, ExportError> {
        self.client.ensure_authenticated().await?;
        let public_key = self.client.public_key(KeyUsage::SymmetricKeyEncryption).await?;
        let wrapped = key.wrap(&public_key)?;
        let body = serde_json::json!({
            "encryption": {
                "encryptedSymmetricKey": Base64::encode_string(&wrapped),
                "initializationVector": Base64::encode_string(key.iv()),
            },
            "filters": {
                "subjectType": "Subject2",
                "dateRange": {
                    "dateType": "PermanentStorage",
                    "from": from.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "restrictToPermanentStorageHwmDate": true
                }
            }
        });
        let token = self.client.access_token()?;
        let response: ExportInitResponse = self
            .client
            .request_json(Method::POST, "invoices/exports", Some(&body), Some(&token))
            .await?;
        Ok(response.reference_number)
    }

    async fn poll_export(&mut self, reference: &str) -> Result<ExportStatusResponse, ExportError> {
        self.client.ensure_authenticated().await?;
        let token = self.client.access_token()?;
        Ok(self
            .client
            .request_json(
                Method::GET,
                &format!("invoices/exports/{reference}"),
                None,
                Some(&token),
            )
            .await?)
    }

    async fn process_package(
        &mut self,
        mut state: SyncState,
        pending: PendingPackage,
        sink: &mut dyn IncomingInvoiceSink,
    ) -> Result<ExportStatus, ExportError> {
        let archive = match self.download_package(&state, &pending.package).await {
            Ok(archive) => archive,
            Err(err) => return Err(self.persist_failure(state, err)),
        };
        let report = match process_archive(&archive, self.client.config().export_batch_size(), sink)
        {
            Ok(report) => report,
            Err(err) => return Err(self.persist_failure(state, err)),
        };

        state.advance_hwm(pending.package.next_hwm(pending.completed_at));
        state.clear_fetch();
        self.record_run(&mut state, &report);
        self.store.save_sync_state(&state)?;
        info!(
            reference = %pending.reference,
            new = report.new,
            existing = report.existing,
            total = report.total,
            "export processed"
        );
        Ok(ExportStatus::Completed {
            report,
            hwm_date: state.hwm_date,
        })
    }

    /// Download and decrypt every part, in ordinal order, into one archive.
    async fn download_package(
        &mut self,
        state: &SyncState,
        package: &ExportPackage,
    ) -> Result<Vec<u8>, ExportError> {
        let seal = self.seal()?;
        let (Some(sealed_key), Some(sealed_iv)) = (&state.fetch_key, &state.fetch_iv) else {
            return Err(CryptoError::InvalidKey("export key material is missing".into()).into());
        };
        let key = SymmetricKey::from_slices(&seal.open(sealed_key)?, &seal.open(sealed_iv)?)?;

        let mut parts: Vec<&ExportPart> = package.parts.iter().collect();
        parts.sort_by_key(|part| part.ordinal_number);
        let mut archive = Vec::new();
        for part in parts {
            self.check_rate_limit(state)?;
            let bearer = if self.client.is_api_url(&part.url) {
                self.client.ensure_authenticated().await?;
                Some(self.client.access_token()?)
            } else {
                None
            };
            let url = if part.url.starts_with("http://") || part.url.starts_with("https://") {
                part.url.clone()
            } else {
                self.client.build_endpoint(&part.url)
            };
            debug!(ordinal = part.ordinal_number, "downloading export part");
            let encrypted = self.client.download(&url, bearer.as_deref()).await?;
            archive.extend(key.decrypt(&encrypted)?);
        }
        Ok(archive)
    }

    fn record_run(&self, state: &mut SyncState, report: &ProcessReport) {
        state.last_sync = Some(Utc::now());
        state.last_new = report.new;
        state.last_existing = report.existing;
        state.last_total = report.total;
    }

    /// Refuse while either the checkpoint or the client holds an unexpired 429 deadline.
    fn check_rate_limit(&self, state: &SyncState) -> Result<(), ExportError> {
        let now = Utc::now();
        let until = state
            .rate_limit_until
            .filter(|until| *until > now)
            .into_iter()
            .chain(self.client.rate_limited_until())
            .max();
        match until {
            Some(until) => Err(ExportError::RateLimited { until }),
            None => Ok(()),
        }
    }

    fn timed_out(&self, state: &SyncState, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.client.config().export_timeout())
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        state
            .fetch_started
            .map_or(true, |started| now - started > timeout)
    }

    fn seal(&self) -> Result<StateSeal, ExportError> {
        self.client
            .config()
            .state_secret()
            .map(StateSeal::from_secret)
            .ok_or(ExportError::StateSecretMissing)
    }

    /// Record `err` on the checkpoint so the next invocation can see it.
    fn persist_failure(&self, mut state: SyncState, err: ExportError) -> ExportError {
        state.fetch_error = Some(err.to_string());
        if let ExportError::Ksef(KsefError::RateLimited { retry_after_secs }) = &err {
            state.rate_limit_until = Some(
                Utc::now()
                    + chrono::Duration::seconds(i64::try_from(*retry_after_secs).unwrap_or(60)),
            );
        }
        if let Err(store_err) = self.store.save_sync_state(&state) {
            warn!(error = %store_err, "could not persist export failure");
        }
        err
    }
}
