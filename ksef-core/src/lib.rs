//! Client for the Polish KSeF e-invoicing platform: authentication, encrypted invoice
//! submission with offline fallback, and the incoming-invoice export.
//!
//! # Examples
//! ```rust
//! use ksef_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Test, "5265877635");
//! # let _ = config;
//! ```
pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod export;
pub mod invoice;
pub mod session;
pub mod store;
pub mod submission;

#[cfg(test)]
mod testing;

use thiserror::Error;

pub use api::{KsefClient, KsefError};
pub use config::{Config, EnvironmentType};

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::EnvironmentParseError),
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
    #[error(transparent)]
    Signing(#[from] crypto::xades::SigningError),
    #[error(transparent)]
    Der(#[from] crypto::der::DerError),
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
    #[error(transparent)]
    Ksef(#[from] api::KsefError),
    #[error(transparent)]
    Invoice(#[from] invoice::InvoiceError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Submission(#[from] submission::SubmissionError),
    #[error(transparent)]
    Export(#[from] export::ExportError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::{
        api::KsefError,
        auth::AuthError,
        config::EnvironmentType,
        crypto::{der::DerError, xades::SigningError, CryptoError},
        export::ExportError,
        invoice::InvoiceError,
        store::StoreError,
        submission::{SubmissionError, SubmissionStatus},
    };
    use std::str::FromStr;

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = EnvironmentType::from_str("staging")
            .expect_err("unknown environment")
            .into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = CryptoError::Decrypt("padding".into()).into();
        assert!(matches!(err, Error::Crypto(_)));

        let err: Error = SigningError::Sign("sign".into()).into();
        assert!(matches!(err, Error::Signing(_)));

        let err: Error = DerError::Truncated.into();
        assert!(matches!(err, Error::Der(_)));

        let err: Error = AuthError::NotAuthenticated.into();
        assert!(matches!(err, Error::Auth(_)));

        let err: Error = KsefError::RateLimited {
            retry_after_secs: 60,
        }
        .into();
        assert!(matches!(err, Error::Ksef(_)));

        let err: Error = InvoiceError::Build("empty".into()).into();
        assert!(matches!(err, Error::Invoice(_)));

        let err: Error = StoreError::Immutable(3).into();
        assert!(matches!(err, Error::Store(_)));

        let err: Error = SubmissionError::InvalidState {
            invoice_id: "7".into(),
            status: SubmissionStatus::Accepted,
            operation: "retry",
        }
        .into();
        assert!(matches!(err, Error::Submission(_)));
        assert_eq!(err.to_string(), "cannot retry invoice 7 in status ACCEPTED");

        let err: Error = ExportError::StateSecretMissing.into();
        assert!(matches!(err, Error::Export(_)));
    }
}
