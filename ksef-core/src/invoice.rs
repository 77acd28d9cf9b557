//! Invoice records and the document-builder seam.
//!
//! Producing the structured invoice XML belongs to the host. The core only needs the
//! canonical bytes, their hash and the creation timestamp, and asks for the same timestamp
//! again on retries so identical content keeps its original hash.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::sha256_base64;

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("cannot build invoice document: {0}")]
    Build(String),
}

/// Host invoice as seen by the submission engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub number: String,
    pub business_date: NaiveDate,
}

impl Invoice {
    pub fn new(id: impl Into<String>, number: impl Into<String>, business_date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
            business_date,
        }
    }
}

/// Canonical invoice document ready for encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceDocument {
    pub xml: Vec<u8>,
    /// Base64 SHA-256 of `xml`.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl InvoiceDocument {
    pub fn new(xml: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        let hash = sha256_base64(&xml);
        Self {
            xml,
            hash,
            created_at,
        }
    }
}

/// Turns an [`Invoice`] into its canonical XML document.
pub trait InvoiceDocumentBuilder {
    /// `created_at` is the timestamp of a previous build of the same invoice, if any;
    /// implementations must embed it instead of the current time.
    fn build(
        &self,
        invoice: &Invoice,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<InvoiceDocument, InvoiceError>;
}

/// Builder for documents produced elsewhere: returns the given bytes unchanged.
#[derive(Debug, Clone)]
pub struct PrebuiltDocument {
    xml: Vec<u8>,
}

impl PrebuiltDocument {
    pub fn new(xml: impl Into<Vec<u8>>) -> Self {
        Self { xml: xml.into() }
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, InvoiceError> {
        let path = path.as_ref();
        std::fs::read(path)
            .map(Self::new)
            .map_err(|e| InvoiceError::Build(format!("cannot read '{}': {e}", path.display())))
    }
}

impl InvoiceDocumentBuilder for PrebuiltDocument {
    fn build(
        &self,
        _invoice: &Invoice,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<InvoiceDocument, InvoiceError> {
        if self.xml.is_empty() {
            return Err(InvoiceError::Build("empty document".into()));
        }
        Ok(InvoiceDocument::new(
            self.xml.clone(),
            created_at.unwrap_or_else(Utc::now),
        ))
    }
}

/// Invoice received from a counterparty through an export package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvoice {
    pub ksef_number: String,
    pub file_name: String,
    pub xml: Vec<u8>,
}
