//! Processing status codes reported for sessions, invoices and authentication operations.
use serde::{Deserialize, Serialize};

/// Status code reported by the platform in `status.code` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KsefStatusCode {
    Received,
    Processing,
    Success,
    AuthenticationFailed,
    SessionCancelled,
    InvalidPermissions,
    AttachmentsNotAllowed,
    FileVerificationFailed,
    DecryptionFailed,
    Duplicate,
    SemanticValidationFailed,
    UnknownError,
    CancelledBySystem,
}

/// Every known status code, in ascending numeric order.
pub const ALL_STATUS_CODES: [KsefStatusCode; 13] = [
    KsefStatusCode::Received,
    KsefStatusCode::Processing,
    KsefStatusCode::Success,
    KsefStatusCode::AuthenticationFailed,
    KsefStatusCode::SessionCancelled,
    KsefStatusCode::InvalidPermissions,
    KsefStatusCode::AttachmentsNotAllowed,
    KsefStatusCode::FileVerificationFailed,
    KsefStatusCode::DecryptionFailed,
    KsefStatusCode::Duplicate,
    KsefStatusCode::SemanticValidationFailed,
    KsefStatusCode::UnknownError,
    KsefStatusCode::CancelledBySystem,
];

impl KsefStatusCode {
    pub const fn code(self) -> i64 {
        match self {
            KsefStatusCode::Received => 100,
            KsefStatusCode::Processing => 150,
            KsefStatusCode::Success => 200,
            KsefStatusCode::AuthenticationFailed => 400,
            KsefStatusCode::SessionCancelled => 405,
            KsefStatusCode::InvalidPermissions => 410,
            KsefStatusCode::AttachmentsNotAllowed => 415,
            KsefStatusCode::FileVerificationFailed => 430,
            KsefStatusCode::DecryptionFailed => 435,
            KsefStatusCode::Duplicate => 440,
            KsefStatusCode::SemanticValidationFailed => 450,
            KsefStatusCode::UnknownError => 500,
            KsefStatusCode::CancelledBySystem => 550,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        ALL_STATUS_CODES.into_iter().find(|known| known.code() == code)
    }

    pub const fn description(self) -> &'static str {
        match self {
            KsefStatusCode::Received => "Invoice accepted for further processing",
            KsefStatusCode::Processing => "Processing in progress",
            KsefStatusCode::Success => "Processed successfully",
            KsefStatusCode::AuthenticationFailed => "Authentication failed",
            KsefStatusCode::SessionCancelled => "Processing cancelled because of a session error",
            KsefStatusCode::InvalidPermissions => "Insufficient permissions for the context",
            KsefStatusCode::AttachmentsNotAllowed => {
                "Invoices with attachments are not allowed for this taxpayer"
            }
            KsefStatusCode::FileVerificationFailed => "Invoice file failed schema verification",
            KsefStatusCode::DecryptionFailed => "Invoice file could not be decrypted",
            KsefStatusCode::Duplicate => "Duplicate invoice",
            KsefStatusCode::SemanticValidationFailed => {
                "Invoice document failed semantic validation"
            }
            KsefStatusCode::UnknownError => "Unknown processing error",
            KsefStatusCode::CancelledBySystem => "Operation cancelled by the system",
        }
    }
}

/// Codes at or above 400 end processing, whether or not they are in the table.
pub const fn is_terminal_failure(code: i64) -> bool {
    code >= 400
}

/// Human-readable description for any numeric code, known or not.
pub fn describe(code: i64) -> String {
    match KsefStatusCode::from_code(code) {
        Some(known) => known.description().to_string(),
        None => format!("Unrecognised status code {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_round_trips() {
        let codes: Vec<i64> = ALL_STATUS_CODES.iter().map(|c| c.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(codes, sorted);
        for known in ALL_STATUS_CODES {
            assert_eq!(KsefStatusCode::from_code(known.code()), Some(known));
            assert!(!known.description().is_empty());
        }
    }

    #[test]
    fn terminal_failures_start_at_400() {
        assert!(!is_terminal_failure(KsefStatusCode::Success.code()));
        assert!(!is_terminal_failure(KsefStatusCode::Processing.code()));
        assert!(is_terminal_failure(KsefStatusCode::Duplicate.code()));
        assert!(is_terminal_failure(460));
    }

    #[test]
    fn unknown_codes_are_described() {
        assert_eq!(describe(440), "Duplicate invoice");
        assert_eq!(describe(999), "Unrecognised status code 999");
    }
}
