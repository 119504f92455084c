//! Purchase authorization core: layered policy evaluation, human-in-the-loop
//! approvals, and the funded-card session lifecycle.
//!
//! The hard invariant this crate enforces is that the persistent payment
//! instrument is funded only for the narrow window of one approved purchase
//! and returns to a zero balance exactly once, under retries, timeouts,
//! crashes, and racing drain requests.

#![deny(unsafe_code)]

pub mod aggregation;
pub mod approval;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod recorder;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;
pub mod vendor;

pub use aggregation::SpendAggregator;
pub use approval::{ApprovalManager, ApprovalNotifier, ApprovalResolution};
pub use error::SpendGateError;
pub use ledger::{LedgerEntry, LedgerEntryKind, WalletLedger};
pub use policy::{evaluate_purchase, Decision, EvaluationContext};
pub use recorder::TransactionRecorder;
pub use runtime::{EngineConfig, PolicyStore, SpendGateEngine};
pub use session::SessionManager;
pub use storage::{LedgerStorageConfig, PersistentLedger};
pub use store::{MemoryStore, SpendStore, Transition};
pub use types::{
    Approval, ApprovalStatus, CardDetails, DrainOutcome, DrainReason, FundedAuthorization,
    FundingSession, Instrument, PolicyConfig, PurchaseOutcome, PurchaseRequest, PurchaseSnapshot,
    SessionStatus, SpendAggregates, SpendLimit, Transaction, TransactionStatus, Wallet,
};
pub use vendor::CardVendor;
