use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use ksef_core::auth::Credentials;
use ksef_core::config::{CertificateConfig, Config, EnvironmentType};
use ksef_core::crypto::{sha256_base64, xades::XadesSigner};
use ksef_core::export::{
    BatchCounts, ExportStatus, IncomingExportPipeline, IncomingInvoiceSink, SinkError,
};
use ksef_core::invoice::{IncomingInvoice, Invoice, PrebuiltDocument};
use ksef_core::store::{FileStore, SubmissionStore};
use ksef_core::submission::{SubmissionOrchestrator, SubmitContext, SubmitOutcome, UpoOutcome};
use ksef_core::KsefClient;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ksef")]
#[command(about = "KSeF e-invoicing client: submit invoices and download received ones")]
struct Cli {
    /// test, demo or production
    #[arg(long, env = "KSEF_ENV", default_value = "test", global = true)]
    env: String,
    /// Context NIP the session is opened for.
    #[arg(long, env = "KSEF_NIP", default_value = "", global = true)]
    nip: String,
    #[arg(long, env = "KSEF_BASE_URL", global = true)]
    base_url: Option<String>,
    /// KSeF authorisation token.
    #[arg(long, env = "KSEF_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,
    /// Certificate used for XAdES authentication instead of a token.
    #[arg(long, env = "KSEF_CERT", global = true)]
    cert: Option<PathBuf>,
    #[arg(long, env = "KSEF_KEY", global = true)]
    key: Option<PathBuf>,
    #[arg(long, env = "KSEF_KEY_PASSWORD", hide_env_values = true, global = true)]
    key_password: Option<String>,
    /// Certificate for issuing invoices in offline mode.
    #[arg(long, env = "KSEF_OFFLINE_CERT", global = true)]
    offline_cert: Option<PathBuf>,
    #[arg(long, env = "KSEF_OFFLINE_KEY", global = true)]
    offline_key: Option<PathBuf>,
    #[arg(long, env = "KSEF_OFFLINE_KEY_PASSWORD", hide_env_values = true, global = true)]
    offline_key_password: Option<String>,
    /// JSON file holding submission records and export checkpoints.
    #[arg(long, env = "KSEF_STATE", default_value = "ksef-state.json", global = true)]
    state: PathBuf,
    /// Secret protecting export keys stored in the state file.
    #[arg(long, env = "KSEF_STATE_SECRET", hide_env_values = true, global = true)]
    state_secret: Option<String>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct InvoiceArgs {
    /// Host identifier of the invoice.
    #[arg(long)]
    id: String,
    /// Invoice number; defaults to the identifier.
    #[arg(long)]
    number: Option<String>,
    /// Business date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Canonical invoice XML.
    #[arg(long)]
    xml: Option<PathBuf>,
}

impl InvoiceArgs {
    fn invoice(&self) -> Invoice {
        Invoice::new(
            &self.id,
            self.number.clone().unwrap_or_else(|| self.id.clone()),
            self.date.unwrap_or_else(|| Local::now().date_naive()),
        )
    }

    fn document(&self) -> Result<PrebuiltDocument> {
        match &self.xml {
            Some(path) => Ok(PrebuiltDocument::from_file(path)?),
            None => Ok(PrebuiltDocument::new(Vec::new())),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the base64 SHA-256 of an invoice document.
    Hash {
        #[arg(long)]
        invoice: PathBuf,
    },
    /// Authenticate and report the token lifetime.
    Auth,
    Submit {
        #[command(flatten)]
        invoice: InvoiceArgs,
        /// Send a backdated invoice in offline mode.
        #[arg(long)]
        confirm_backdated: bool,
    },
    /// Issue an invoice offline without contacting KSeF.
    SubmitOffline {
        #[command(flatten)]
        invoice: InvoiceArgs,
        #[arg(long, default_value = "platform unavailable")]
        reason: String,
    },
    Retry {
        #[command(flatten)]
        invoice: InvoiceArgs,
    },
    /// Technical correction of a rejected offline invoice.
    Correct {
        #[command(flatten)]
        invoice: InvoiceArgs,
        #[arg(long)]
        original: u64,
    },
    /// Send an offline invoice to KSeF.
    Reconcile {
        #[command(flatten)]
        invoice: InvoiceArgs,
    },
    /// Query the outcome of a timed-out submission.
    Resolve {
        #[command(flatten)]
        invoice: InvoiceArgs,
    },
    /// Fetch the UPO of an accepted invoice.
    Upo {
        #[command(flatten)]
        invoice: InvoiceArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print stored submission records.
    Status {
        #[arg(long)]
        id: Option<String>,
    },
    ExportInit,
    /// Poll the running export and store downloaded invoices.
    ExportCheck {
        #[arg(long, default_value = "incoming")]
        output: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let env = EnvironmentType::from_str(&self.env)?;
        let mut config = Config::new(env, &self.nip);
        if let Some(url) = &self.base_url {
            config = config.with_base_url(url);
        }
        if let Some(secret) = &self.state_secret {
            config = config.with_state_secret(secret);
        }
        if let (Some(cert), Some(key)) = (&self.offline_cert, &self.offline_key) {
            config = config.with_offline_certificate(CertificateConfig::new(
                cert,
                key,
                self.offline_key_password.clone(),
            ));
        }
        Ok(config)
    }

    fn credentials(&self) -> Result<Credentials> {
        if let Some(token) = &self.token {
            return Ok(Credentials::Token(token.clone()));
        }
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            let signer = XadesSigner::from_files(&CertificateConfig::new(
                cert,
                key,
                self.key_password.clone(),
            ))
            .context("loading authentication certificate")?;
            return Ok(Credentials::Certificate(Box::new(signer)));
        }
        bail!("no credentials: pass --token or --cert with --key")
    }

    /// Client for commands that may stay offline; authentication fails only if attempted.
    fn client(&self, needs_network: bool) -> Result<KsefClient> {
        let credentials = match self.credentials() {
            Ok(credentials) => credentials,
            Err(err) if needs_network => return Err(err),
            Err(_) => Credentials::Token(String::new()),
        };
        if needs_network && self.nip.is_empty() {
            bail!("--nip (or KSEF_NIP) is required");
        }
        Ok(KsefClient::new(self.config()?, credentials)?)
    }

    fn orchestrator(
        &self,
        invoice: &InvoiceArgs,
        needs_network: bool,
    ) -> Result<SubmissionOrchestrator<FileStore, PrebuiltDocument>> {
        Ok(SubmissionOrchestrator::new(
            self.client(needs_network)?,
            FileStore::new(&self.state),
            invoice.document()?,
        ))
    }
}

/// Writes each invoice to `<dir>/<ksef number>.xml`; files already present count as existing.
struct DirectorySink {
    dir: PathBuf,
}

impl IncomingInvoiceSink for DirectorySink {
    fn process_batch(
        &mut self,
        batch: &[IncomingInvoice],
        _metadata: Option<&serde_json::Value>,
    ) -> std::result::Result<BatchCounts, SinkError> {
        let mut counts = BatchCounts::default();
        for invoice in batch {
            let name = invoice.ksef_number.replace(['/', '\\'], "_");
            let path = self.dir.join(format!("{name}.xml"));
            if path.exists() {
                counts.existing += 1;
                continue;
            }
            fs::write(&path, &invoice.xml)
                .map_err(|e| SinkError(format!("{}: {e}", path.display())))?;
            counts.new += 1;
        }
        Ok(counts)
    }
}

fn print_outcome(outcome: &SubmitOutcome) -> Result<()> {
    let value = match outcome {
        SubmitOutcome::NeedsOfflineConfirmation {
            days_behind,
            deadline,
        } => serde_json::json!({
            "outcome": "needs_offline_confirmation",
            "daysBehind": days_behind,
            "deadline": deadline,
        }),
        SubmitOutcome::AlreadyAccepted(record) => serde_json::json!({
            "outcome": "already_accepted",
            "submission": record,
        }),
        SubmitOutcome::InProgress(record) => serde_json::json!({
            "outcome": "in_progress",
            "submission": record,
        }),
        SubmitOutcome::Completed(record) => serde_json::json!({
            "outcome": "completed",
            "submission": record,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn write_or_print(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "written");
        }
        None => println!("{text}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Hash { invoice } => {
            let bytes =
                fs::read(invoice).with_context(|| format!("reading {}", invoice.display()))?;
            println!("{}", sha256_base64(&bytes));
        }
        Commands::Auth => {
            let mut client = cli.client(true)?;
            client.authenticate().await?;
            let session = client.auth_session();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "state": format!("{:?}", session.state()),
                    "accessValidUntil": session.access_expires_at(),
                }))?
            );
            if let Err(err) = client.terminate().await {
                warn!(error = %err, "could not terminate the session");
            }
        }
        Commands::Submit {
            invoice,
            confirm_backdated,
        } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            let ctx = SubmitContext {
                backdating_acknowledged: *confirm_backdated,
                ..SubmitContext::default()
            };
            print_outcome(&orchestrator.submit(&invoice.invoice(), &ctx).await?)?;
        }
        Commands::SubmitOffline { invoice, reason } => {
            let mut orchestrator = cli.orchestrator(invoice, false)?;
            print_outcome(&orchestrator.submit_offline(&invoice.invoice(), reason).await?)?;
        }
        Commands::Retry { invoice } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            let outcome = orchestrator
                .retry(&invoice.invoice(), &SubmitContext::default())
                .await?;
            print_outcome(&outcome)?;
        }
        Commands::Correct { invoice, original } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            let outcome = orchestrator
                .submit_technical_correction(&invoice.invoice(), *original)
                .await?;
            print_outcome(&outcome)?;
        }
        Commands::Reconcile { invoice } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            print_outcome(&orchestrator.reconcile_offline(&invoice.invoice()).await?)?;
        }
        Commands::Resolve { invoice } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            print_outcome(&orchestrator.resolve_timeout(&invoice.invoice()).await?)?;
        }
        Commands::Upo { invoice, output } => {
            let mut orchestrator = cli.orchestrator(invoice, true)?;
            match orchestrator.fetch_upo(&invoice.invoice()).await? {
                UpoOutcome::Available(upo) => write_or_print(output.as_deref(), &upo)?,
                UpoOutcome::Unavailable(reason) => bail!("UPO not available: {reason}"),
            }
        }
        Commands::Status { id } => {
            let store = FileStore::new(&cli.state);
            let records = match id {
                Some(id) => store.current(id)?.into_iter().collect(),
                None => store.list()?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::ExportInit => {
            let mut pipeline =
                IncomingExportPipeline::new(cli.client(true)?, FileStore::new(&cli.state));
            let started = pipeline.init_fetch().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "referenceNumber": started.reference,
                    "from": started.from,
                }))?
            );
        }
        Commands::ExportCheck { output } => {
            fs::create_dir_all(output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut pipeline =
                IncomingExportPipeline::new(cli.client(true)?, FileStore::new(&cli.state));
            let mut sink = DirectorySink {
                dir: output.clone(),
            };
            let value = match pipeline.check_status(&mut sink).await? {
                ExportStatus::Idle { hwm_date } => {
                    serde_json::json!({"status": "idle", "hwmDate": hwm_date})
                }
                ExportStatus::Processing { reference, elapsed } => serde_json::json!({
                    "status": "processing",
                    "referenceNumber": reference,
                    "elapsedSeconds": elapsed.num_seconds(),
                }),
                ExportStatus::TimedOut { reference } => {
                    serde_json::json!({"status": "timeout", "referenceNumber": reference})
                }
                ExportStatus::Failed {
                    reference,
                    code,
                    description,
                } => serde_json::json!({
                    "status": "failed",
                    "referenceNumber": reference,
                    "code": code,
                    "description": description,
                }),
                ExportStatus::Completed { report, hwm_date } => serde_json::json!({
                    "status": "completed",
                    "new": report.new,
                    "existing": report.existing,
                    "total": report.total,
                    "hwmDate": hwm_date,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}
