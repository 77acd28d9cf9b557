//! Scanning of decrypted export archives into sink batches.
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::ExportError;
use crate::invoice::IncomingInvoice;

const METADATA_ENTRY: &str = "_metadata.json";
/// Upper bound on the buffer reserved up front from an entry's declared size.
const MAX_PREALLOCATION: usize = 1 << 20;

/// Error reported by an [`IncomingInvoiceSink`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Counters returned by the sink for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub new: u64,
    pub existing: u64,
}

/// Totals of one processed archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub new: u64,
    pub existing: u64,
    pub total: u64,
    pub batches: u32,
}

/// Receiver of downloaded invoices, called once per batch.
pub trait IncomingInvoiceSink {
    /// `metadata` is the package's `_metadata.json`, when present.
    fn process_batch(
        &mut self,
        batch: &[IncomingInvoice],
        metadata: Option<&serde_json::Value>,
    ) -> Result<BatchCounts, SinkError>;
}

fn ksef_number_element() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"<(?:[A-Za-z0-9_]+:)?(?:KSeFNumber|NrKSeF)>\s*([^<\s]+)\s*</").ok()
        })
        .as_ref()
}

/// Identifier for an entry: the KSeF number inside the document, else the file stem.
fn entry_key(name: &str, xml: &[u8]) -> String {
    let from_content = ksef_number_element()
        .and_then(|pattern| pattern.captures(xml))
        .and_then(|captures| captures.get(1))
        .map(|found| String::from_utf8_lossy(found.as_bytes()).into_owned());
    from_content.unwrap_or_else(|| {
        let file = name.rsplit('/').next().unwrap_or(name);
        file.strip_suffix(".xml").unwrap_or(file).to_string()
    })
}

/// Walk the archive entry by entry, handing `batch_size` invoices at a time to `sink`.
///
/// A failing batch stops the scan; the error carries the counters gathered so far.
pub fn process_archive(
    archive: &[u8],
    batch_size: usize,
    sink: &mut dyn IncomingInvoiceSink,
) -> Result<ProcessReport, ExportError> {
    let batch_size = batch_size.max(1);
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    let metadata = read_metadata(&mut zip)?;

    let mut report = ProcessReport::default();
    let mut batch = Vec::with_capacity(batch_size.min(1024));
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();
        if entry.is_dir() || !name.to_ascii_lowercase().ends_with(".xml") {
            continue;
        }
        let mut xml = Vec::with_capacity(initial_capacity(entry.size()));
        entry.read_to_end(&mut xml)?;
        batch.push(IncomingInvoice {
            ksef_number: entry_key(&name, &xml),
            file_name: name,
            xml,
        });
        if batch.len() >= batch_size {
            flush(&mut batch, metadata.as_ref(), sink, &mut report)?;
        }
    }
    if !batch.is_empty() {
        flush(&mut batch, metadata.as_ref(), sink, &mut report)?;
    }
    Ok(report)
}

fn read_metadata(
    zip: &mut zip::ZipArchive<Cursor<&[u8]>>,
) -> Result<Option<serde_json::Value>, ExportError> {
    let mut entry = match zip.by_name(METADATA_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut raw = Vec::new();
    entry.read_to_end(&mut raw)?;
    match serde_json::from_slice(&raw) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) => {
            warn!(error = %err, "ignoring malformed {METADATA_ENTRY}");
            Ok(None)
        }
    }
}

/// The size in the entry header is untrusted; it only seeds the buffer.
fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared)
        .unwrap_or(MAX_PREALLOCATION)
        .min(MAX_PREALLOCATION)
}

fn flush(
    batch: &mut Vec<IncomingInvoice>,
    metadata: Option<&serde_json::Value>,
    sink: &mut dyn IncomingInvoiceSink,
    report: &mut ProcessReport,
) -> Result<(), ExportError> {
    let counts = sink
        .process_batch(batch, metadata)
        .map_err(|source| ExportError::Sink {
            source,
            report: *report,
        })?;
    report.new += counts.new;
    report.existing += counts.existing;
    report.total += batch.len() as u64;
    report.batches += 1;
    debug!(size = batch.len(), total = report.total, "export batch processed");
    batch.clear();
    Ok(())
}
