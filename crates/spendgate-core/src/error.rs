use thiserror::Error;

/// SpendGate runtime errors.
#[derive(Debug, Error)]
pub enum SpendGateError {
    #[error("Invalid purchase request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Approval expired: {0}")]
    Expired(String),

    #[error("Insufficient wallet funds: balance {balance_minor} below amount {amount_minor}")]
    InsufficientFunds {
        balance_minor: i64,
        amount_minor: u64,
    },

    #[error("Funding conflict: {0}")]
    FundingConflict(String),

    #[error("Card vendor '{vendor}' failed: {message}")]
    Vendor { vendor: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SpendGateError {
    pub fn vendor(vendor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vendor {
            vendor: vendor.into(),
            message: message.into(),
        }
    }

    pub fn conflict_active_session(session_id: &str) -> Self {
        Self::FundingConflict(format!(
            "an active funding session '{session_id}' already exists for this user"
        ))
    }
}
