use crate::error::SpendGateError;
use crate::types::{
    Approval, ApprovalStatus, DrainReason, FundingSession, Instrument, SessionStatus, Transaction,
    TransactionStatus, Wallet,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Result of a guarded status transition: either it applied, or the record had
/// already moved on and the caller gets the current state back.
#[derive(Debug, Clone)]
pub enum Transition<T> {
    Applied(T),
    Conflict(T),
}

impl<T> Transition<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Conflict(_) => None,
        }
    }
}

/// Storage boundary for all persisted entities, keyed by user id.
///
/// Status changes on sessions and approvals go through compare-and-swap style
/// transitions guarded by the expected prior status, so racing callers cannot
/// both observe success.
#[async_trait]
pub trait SpendStore: Send + Sync {
    async fn instrument(&self, user_id: &str) -> Result<Option<Instrument>, SpendGateError>;
    async fn upsert_instrument(&self, instrument: Instrument) -> Result<(), SpendGateError>;
    /// Set the card's live balance and spending limit together.
    async fn set_instrument_funding(
        &self,
        user_id: &str,
        balance_minor: u64,
        limit_minor: u64,
    ) -> Result<Instrument, SpendGateError>;

    async fn wallet(&self, user_id: &str) -> Result<Option<Wallet>, SpendGateError>;
    async fn upsert_wallet(&self, wallet: Wallet) -> Result<(), SpendGateError>;

    /// Insert a new funding session. Fails with `FundingConflict` when the user
    /// already has an active session; this is the storage-level second line of
    /// defence behind the manager's own check.
    async fn insert_session(&self, session: FundingSession) -> Result<(), SpendGateError>;
    async fn session(&self, session_id: &str) -> Result<Option<FundingSession>, SpendGateError>;
    async fn active_session(&self, user_id: &str)
        -> Result<Option<FundingSession>, SpendGateError>;
    /// Most recently created session for the user, in any status.
    async fn latest_session(&self, user_id: &str)
        -> Result<Option<FundingSession>, SpendGateError>;
    async fn link_session_transaction(
        &self,
        session_id: &str,
        transaction_id: &str,
    ) -> Result<(), SpendGateError>;
    async fn transition_session(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
        drain_reason: Option<DrainReason>,
        drained_minor: Option<u64>,
    ) -> Result<Transition<FundingSession>, SpendGateError>;

    async fn insert_approval(&self, approval: Approval) -> Result<(), SpendGateError>;
    async fn approval_by_token(&self, token: &str) -> Result<Option<Approval>, SpendGateError>;
    async fn pending_approvals(&self, user_id: &str) -> Result<Vec<Approval>, SpendGateError>;
    async fn transition_approval(
        &self,
        approval_id: &str,
        expected: ApprovalStatus,
        next: ApprovalStatus,
    ) -> Result<Transition<Approval>, SpendGateError>;

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), SpendGateError>;
    async fn transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, SpendGateError>;
    async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
        status_reason: Option<String>,
    ) -> Result<Transaction, SpendGateError>;
    async fn transactions_for_user(&self, user_id: &str)
        -> Result<Vec<Transaction>, SpendGateError>;

    async fn is_known_merchant(
        &self,
        user_id: &str,
        merchant: &str,
    ) -> Result<bool, SpendGateError>;
    async fn mark_merchant_known(&self, user_id: &str, merchant: &str)
        -> Result<(), SpendGateError>;
}

fn merchant_key(user_id: &str, merchant: &str) -> (String, String) {
    (user_id.to_string(), merchant.to_ascii_lowercase())
}

/// In-memory store used by tests and the default service configuration.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instruments: RwLock<HashMap<String, Instrument>>,
    wallets: RwLock<HashMap<String, Wallet>>,
    sessions: RwLock<HashMap<String, FundingSession>>,
    approvals: RwLock<HashMap<String, Approval>>,
    transactions: RwLock<HashMap<String, Transaction>>,
    known_merchants: RwLock<HashSet<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpendStore for MemoryStore {
    async fn instrument(&self, user_id: &str) -> Result<Option<Instrument>, SpendGateError> {
        Ok(self.instruments.read().await.get(user_id).cloned())
    }

    async fn upsert_instrument(&self, instrument: Instrument) -> Result<(), SpendGateError> {
        self.instruments
            .write()
            .await
            .insert(instrument.user_id.clone(), instrument);
        Ok(())
    }

    async fn set_instrument_funding(
        &self,
        user_id: &str,
        balance_minor: u64,
        limit_minor: u64,
    ) -> Result<Instrument, SpendGateError> {
        let mut instruments = self.instruments.write().await;
        let instrument = instruments
            .get_mut(user_id)
            .ok_or_else(|| SpendGateError::NotFound(format!("no instrument for '{user_id}'")))?;
        instrument.balance_minor = balance_minor;
        instrument.spending_limit_minor = limit_minor;
        Ok(instrument.clone())
    }

    async fn wallet(&self, user_id: &str) -> Result<Option<Wallet>, SpendGateError> {
        Ok(self.wallets.read().await.get(user_id).cloned())
    }

    async fn upsert_wallet(&self, wallet: Wallet) -> Result<(), SpendGateError> {
        self.wallets
            .write()
            .await
            .insert(wallet.user_id.clone(), wallet);
        Ok(())
    }

    async fn insert_session(&self, session: FundingSession) -> Result<(), SpendGateError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions
            .values()
            .find(|s| s.user_id == session.user_id && s.status == SessionStatus::Active)
        {
            return Err(SpendGateError::conflict_active_session(&existing.session_id));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Option<FundingSession>, SpendGateError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn active_session(
        &self,
        user_id: &str,
    ) -> Result<Option<FundingSession>, SpendGateError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.user_id == user_id && s.status == SessionStatus::Active)
            .cloned())
    }

    async fn latest_session(
        &self,
        user_id: &str,
    ) -> Result<Option<FundingSession>, SpendGateError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn link_session_transaction(
        &self,
        session_id: &str,
        transaction_id: &str,
    ) -> Result<(), SpendGateError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SpendGateError::NotFound(format!("no session '{session_id}'")))?;
        session.transaction_id = Some(transaction_id.to_string());
        Ok(())
    }

    async fn transition_session(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
        drain_reason: Option<DrainReason>,
        drained_minor: Option<u64>,
    ) -> Result<Transition<FundingSession>, SpendGateError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SpendGateError::NotFound(format!("no session '{session_id}'")))?;

        if session.status != expected {
            return Ok(Transition::Conflict(session.clone()));
        }

        session.status = next;
        session.drain_reason = drain_reason;
        session.drained_minor = drained_minor;
        session.completed_at = Some(Utc::now());
        Ok(Transition::Applied(session.clone()))
    }

    async fn insert_approval(&self, approval: Approval) -> Result<(), SpendGateError> {
        self.approvals
            .write()
            .await
            .insert(approval.approval_id.clone(), approval);
        Ok(())
    }

    async fn approval_by_token(&self, token: &str) -> Result<Option<Approval>, SpendGateError> {
        Ok(self
            .approvals
            .read()
            .await
            .values()
            .find(|a| a.token == token)
            .cloned())
    }

    async fn pending_approvals(&self, user_id: &str) -> Result<Vec<Approval>, SpendGateError> {
        let mut pending: Vec<Approval> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| a.user_id == user_id && a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }

    async fn transition_approval(
        &self,
        approval_id: &str,
        expected: ApprovalStatus,
        next: ApprovalStatus,
    ) -> Result<Transition<Approval>, SpendGateError> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(approval_id)
            .ok_or_else(|| SpendGateError::NotFound(format!("no approval '{approval_id}'")))?;

        if approval.status != expected {
            return Ok(Transition::Conflict(approval.clone()));
        }

        approval.status = next;
        approval.resolved_at = Some(Utc::now());
        Ok(Transition::Applied(approval.clone()))
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), SpendGateError> {
        self.transactions
            .write()
            .await
            .insert(transaction.transaction_id.clone(), transaction);
        Ok(())
    }

    async fn transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, SpendGateError> {
        Ok(self.transactions.read().await.get(transaction_id).cloned())
    }

    async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
        status_reason: Option<String>,
    ) -> Result<Transaction, SpendGateError> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions.get_mut(transaction_id).ok_or_else(|| {
            SpendGateError::NotFound(format!("no transaction '{transaction_id}'"))
        })?;
        transaction.status = status;
        if status_reason.is_some() {
            transaction.status_reason = status_reason;
        }
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Transaction>, SpendGateError> {
        let mut items: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        items.sort_by_key(|t| t.created_at);
        Ok(items)
    }

    async fn is_known_merchant(
        &self,
        user_id: &str,
        merchant: &str,
    ) -> Result<bool, SpendGateError> {
        Ok(self
            .known_merchants
            .read()
            .await
            .contains(&merchant_key(user_id, merchant)))
    }

    async fn mark_merchant_known(
        &self,
        user_id: &str,
        merchant: &str,
    ) -> Result<(), SpendGateError> {
        self.known_merchants
            .write()
            .await
            .insert(merchant_key(user_id, merchant));
        Ok(())
    }
}
