use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A spending limit that is either a finite amount (minor units) or explicitly unbounded.
///
/// Unbounded behaves as +infinity in comparisons; a finite limit of zero intentionally
/// blocks all spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendLimit {
    Unbounded,
    Minor(u64),
}

impl SpendLimit {
    pub fn finite(&self) -> Option<u64> {
        match self {
            Self::Unbounded => None,
            Self::Minor(value) => Some(*value),
        }
    }

    /// True when `candidate` exceeds this limit. Unbounded never excludes.
    pub fn exceeded_by(&self, candidate: u64) -> bool {
        match self {
            Self::Unbounded => false,
            Self::Minor(limit) => candidate > *limit,
        }
    }

    /// True when `count` has reached this limit (velocity semantics, `>=`).
    pub fn reached_by(&self, count: u64) -> bool {
        match self {
            Self::Unbounded => false,
            Self::Minor(limit) => count >= *limit,
        }
    }
}

impl Default for SpendLimit {
    fn default() -> Self {
        Self::Unbounded
    }
}

/// Per-user spending policy. Owned and mutated by an external settings service;
/// read-only inside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub always_ask: bool,
    pub per_purchase_limit: SpendLimit,
    pub daily_limit: SpendLimit,
    pub monthly_limit: SpendLimit,
    /// Purchase-count limit over the configured velocity window.
    pub weekly_purchase_limit: SpendLimit,
    pub blocked_categories: BTreeSet<String>,
    pub block_new_merchants: bool,
    pub block_international: bool,
    pub night_pause: bool,
    pub approval_timeout_secs: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            always_ask: false,
            per_purchase_limit: SpendLimit::Unbounded,
            daily_limit: SpendLimit::Unbounded,
            monthly_limit: SpendLimit::Unbounded,
            weekly_purchase_limit: SpendLimit::Unbounded,
            blocked_categories: BTreeSet::new(),
            block_new_merchants: false,
            block_international: false,
            night_pause: false,
            approval_timeout_secs: 300,
        }
    }
}

/// Transient purchase intent entering the authorization pipeline.
///
/// Never persisted as-is; always converted into a Transaction or an Approval snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub item: String,
    pub amount_minor: u64,
    pub currency: String,
    pub merchant: String,
    #[serde(default)]
    pub merchant_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub international: bool,
}

impl PurchaseRequest {
    pub fn new(
        item: impl Into<String>,
        amount_minor: u64,
        currency: impl Into<String>,
        merchant: impl Into<String>,
    ) -> Self {
        Self {
            item: item.into(),
            amount_minor,
            currency: currency.into(),
            merchant: merchant.into(),
            merchant_url: None,
            category: None,
            international: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn international(mut self) -> Self {
        self.international = true;
        self
    }

    pub fn snapshot(&self) -> PurchaseSnapshot {
        PurchaseSnapshot {
            item: self.item.clone(),
            amount_minor: self.amount_minor,
            currency: self.currency.clone(),
            merchant: self.merchant.clone(),
            category: self.category.clone(),
        }
    }
}

/// Immutable copy of the purchase fields carried by approvals and transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseSnapshot {
    pub item: String,
    pub amount_minor: u64,
    pub currency: String,
    pub merchant: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Human-in-the-loop gate created when policy defers an automatic decision.
///
/// Lifecycle: created pending, then exactly one transition to approved, rejected,
/// or expired. Resolution after expiry must fail, never silently fund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub user_id: String,
    pub token: String,
    pub purchase: PurchaseSnapshot,
    pub risk_flags: Vec<String>,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Redacted card fields safe to hand back to API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDetails {
    pub instrument_id: String,
    pub last4: String,
    pub brand: String,
    pub currency: String,
}

/// The persistent payment instrument, one per user.
///
/// Core invariant: balance and spending limit are both zero whenever no funding
/// session is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_id: String,
    pub user_id: String,
    pub last4: String,
    pub brand: String,
    pub currency: String,
    pub spending_limit_minor: u64,
    pub balance_minor: u64,
    pub created_at: DateTime<Utc>,
}

impl Instrument {
    pub fn card(&self) -> CardDetails {
        CardDetails {
            instrument_id: self.instrument_id.clone(),
            last4: self.last4.clone(),
            brand: self.brand.clone(),
            currency: self.currency.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    CheckoutSuccess,
    CheckoutFailed,
    Timeout,
    StaleCleanup,
}

impl DrainReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckoutSuccess => "checkout_success",
            Self::CheckoutFailed => "checkout_failed",
            Self::Timeout => "timeout",
            Self::StaleCleanup => "stale_cleanup",
        }
    }
}

/// One funded window on the instrument. At most one active session per user, ever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSession {
    pub session_id: String,
    pub user_id: String,
    pub instrument_id: String,
    pub transaction_id: Option<String>,
    pub amount_minor: u64,
    pub status: SessionStatus,
    pub drain_reason: Option<DrainReason>,
    /// Balance captured back off the card when the session terminated.
    pub drained_minor: Option<u64>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FundingSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Rejected,
    Authorized,
    Completed,
    Cancelled,
}

/// Durable record of every purchase attempt. `authorized` is the funded in-between
/// state; `completed` and `cancelled` are terminal and set only by the drain step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id: String,
    pub item: String,
    pub merchant: String,
    pub category: Option<String>,
    pub amount_minor: u64,
    pub currency: String,
    pub status: TransactionStatus,
    pub status_reason: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn counts_as_spend(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Authorized | TransactionStatus::Completed
        )
    }
}

/// Per-user external wallet the funded sessions draw from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub balance_minor: i64,
    pub updated_at: DateTime<Utc>,
}

/// Rolling-window spend totals fed into policy evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpendAggregates {
    pub today_spent_minor: u64,
    pub month_spent_minor: u64,
    pub recent_purchase_count: u64,
}

/// Result of a successful funding saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundedAuthorization {
    pub transaction_id: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub card: CardDetails,
}

/// Unified purchase-endpoint response. Business outcomes are values, not errors,
/// so callers can render deterministic state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Approved {
        transaction_id: String,
        topup_id: String,
        expires_at: DateTime<Utc>,
        card: CardDetails,
    },
    PendingApproval {
        approval_id: String,
        expires_at: DateTime<Utc>,
    },
    Rejected {
        reason: String,
        message: String,
    },
}

/// Drain-endpoint response; safe to produce repeatedly for the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DrainOutcome {
    Drained {
        drained_minor: u64,
        reason: DrainReason,
    },
    AlreadyDrained {
        reason: Option<DrainReason>,
    },
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Unguessable approval token: 32 lowercase hex characters.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}
