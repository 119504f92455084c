use crate::error::SpendGateError;
use crate::types::CardDetails;
use async_trait::async_trait;

/// Pluggable card-issuing capability.
///
/// Implementations map the funded-session lifecycle onto an actual payment
/// network (or a deterministic simulation). The backend is chosen once at
/// construction time; call sites never branch on which one is wired in.
#[async_trait]
pub trait CardVendor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the user's card if it does not exist yet. Must be idempotent.
    async fn provision(&self, user_id: &str) -> Result<CardDetails, SpendGateError>;

    /// Load the card with exactly `amount_minor` and set its limit to match.
    async fn fund(&self, user_id: &str, amount_minor: u64) -> Result<(), SpendGateError>;

    /// Zero the card and return the balance that was still on it.
    async fn drain(&self, user_id: &str) -> Result<u64, SpendGateError>;

    async fn card(&self, user_id: &str) -> Result<Option<CardDetails>, SpendGateError>;
}
