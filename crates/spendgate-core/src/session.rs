use crate::error::SpendGateError;
use crate::recorder::TransactionRecorder;
use crate::store::{SpendStore, Transition};
use crate::types::{
    new_id, CardDetails, DrainOutcome, DrainReason, FundedAuthorization, FundingSession,
    Instrument, PurchaseSnapshot, SessionStatus, TransactionStatus,
};
use crate::vendor::CardVendor;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Per-user mutual exclusion registry.
///
/// Every mutating operation on a user's instrument or funding session runs
/// under this lock, so no two top-ups (or a top-up and a drain) interleave for
/// the same user.
#[derive(Default)]
pub struct UserLocks {
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub async fn lock_for(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

struct SessionInner {
    store: Arc<dyn SpendStore>,
    vendor: Arc<dyn CardVendor>,
    recorder: Arc<TransactionRecorder>,
    locks: UserLocks,
    timers: AsyncMutex<HashMap<String, JoinHandle<()>>>,
}

/// Owner of the funded/idle lifecycle of the persistent card.
///
/// This is the only component that mutates instrument balance/limit or funding
/// session status. Drain is idempotent because it can be reached from three
/// racing call sites: the explicit completion call, the auto-drain timer, and
/// the stale-cleanup sweep.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SpendStore>,
        vendor: Arc<dyn CardVendor>,
        recorder: Arc<TransactionRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                vendor,
                recorder,
                locks: UserLocks::default(),
                timers: AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Serialize a closure-free critical section for one user.
    pub async fn user_guard(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        self.inner.locks.lock_for(user_id).await
    }

    /// Idempotent card provisioning: returns the existing instrument when
    /// present, otherwise creates one at balance 0 / limit 0.
    pub async fn provision(&self, user_id: &str) -> Result<Instrument, SpendGateError> {
        let guard = self.user_guard(user_id).await;
        let _held = guard.lock().await;
        provision_locked(&self.inner, user_id).await
    }

    pub async fn card(&self, user_id: &str) -> Result<Option<CardDetails>, SpendGateError> {
        Ok(self
            .inner
            .store
            .instrument(user_id)
            .await?
            .map(|instrument| instrument.card()))
    }

    pub async fn instrument(&self, user_id: &str) -> Result<Option<Instrument>, SpendGateError> {
        self.inner.store.instrument(user_id).await
    }

    /// Run the full funding saga for an approved purchase.
    pub async fn fund_for_purchase(
        &self,
        user_id: &str,
        purchase: &PurchaseSnapshot,
        timeout_secs: i64,
    ) -> Result<FundedAuthorization, SpendGateError> {
        let guard = self.user_guard(user_id).await;
        let _held = guard.lock().await;
        fund_locked(&self.inner, user_id, purchase, timeout_secs).await
    }

    /// Drain the user's active session, if any.
    pub async fn drain(
        &self,
        user_id: &str,
        reason: DrainReason,
    ) -> Result<DrainOutcome, SpendGateError> {
        let guard = self.user_guard(user_id).await;
        let _held = guard.lock().await;
        drain_active_locked(&self.inner, user_id, reason).await
    }

    /// Finish a specific funded session. Safe to call more than once: repeated
    /// calls observe `AlreadyDrained` with the original reason.
    pub async fn complete(
        &self,
        user_id: &str,
        session_id: &str,
        success: bool,
    ) -> Result<DrainOutcome, SpendGateError> {
        let guard = self.user_guard(user_id).await;
        let _held = guard.lock().await;

        stale_cleanup_locked(&self.inner, user_id).await?;

        let session = self
            .inner
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| SpendGateError::NotFound(format!("no funding session '{session_id}'")))?;

        if session.user_id != user_id {
            return Err(SpendGateError::Forbidden(
                "funding session belongs to a different user".to_string(),
            ));
        }

        if session.status != SessionStatus::Active {
            return Ok(DrainOutcome::AlreadyDrained {
                reason: session.drain_reason,
            });
        }

        let reason = if success {
            DrainReason::CheckoutSuccess
        } else {
            DrainReason::CheckoutFailed
        };
        drain_session_locked(&self.inner, user_id, session_id, reason).await
    }

    /// Drain any active session past its expiry. Second safety net beyond the
    /// in-process timer; covers process restarts and missed timers.
    pub async fn stale_cleanup(
        &self,
        user_id: &str,
    ) -> Result<Option<DrainOutcome>, SpendGateError> {
        let guard = self.user_guard(user_id).await;
        let _held = guard.lock().await;
        stale_cleanup_locked(&self.inner, user_id).await
    }

    pub(crate) async fn stale_cleanup_locked(
        &self,
        user_id: &str,
    ) -> Result<Option<DrainOutcome>, SpendGateError> {
        stale_cleanup_locked(&self.inner, user_id).await
    }

    pub(crate) async fn fund_locked(
        &self,
        user_id: &str,
        purchase: &PurchaseSnapshot,
        timeout_secs: i64,
    ) -> Result<FundedAuthorization, SpendGateError> {
        fund_locked(&self.inner, user_id, purchase, timeout_secs).await
    }

    pub(crate) async fn provision_locked(
        &self,
        user_id: &str,
    ) -> Result<Instrument, SpendGateError> {
        provision_locked(&self.inner, user_id).await
    }
}

async fn provision_locked(
    inner: &Arc<SessionInner>,
    user_id: &str,
) -> Result<Instrument, SpendGateError> {
    if let Some(existing) = inner.store.instrument(user_id).await? {
        return Ok(existing);
    }

    let card = inner.vendor.provision(user_id).await?;
    let instrument = Instrument {
        instrument_id: card.instrument_id,
        user_id: user_id.to_string(),
        last4: card.last4,
        brand: card.brand,
        currency: card.currency,
        spending_limit_minor: 0,
        balance_minor: 0,
        created_at: Utc::now(),
    };
    inner.store.upsert_instrument(instrument.clone()).await?;
    Ok(instrument)
}

async fn fund_locked(
    inner: &Arc<SessionInner>,
    user_id: &str,
    purchase: &PurchaseSnapshot,
    timeout_secs: i64,
) -> Result<FundedAuthorization, SpendGateError> {
    stale_cleanup_locked(inner, user_id).await?;

    let instrument = provision_locked(inner, user_id).await?;
    let amount = purchase.amount_minor;

    let balance = inner.recorder.wallet_balance(user_id).await?;
    if balance < amount as i64 {
        inner
            .recorder
            .record_rejected(user_id, purchase, "insufficient wallet balance")
            .await?;
        return Err(SpendGateError::InsufficientFunds {
            balance_minor: balance,
            amount_minor: amount,
        });
    }

    if let Some(active) = inner.store.active_session(user_id).await? {
        return Err(SpendGateError::conflict_active_session(&active.session_id));
    }

    inner.vendor.fund(user_id, amount).await?;

    // The card now holds money. Every failure below must compensate before
    // the error is returned so the instrument never stays funded.
    let saga = FundingSaga { inner, user_id };

    if let Err(err) = inner
        .store
        .set_instrument_funding(user_id, amount, amount)
        .await
    {
        return Err(saga.rollback(err, None, None).await);
    }

    let expires_at = Utc::now() + Duration::seconds(timeout_secs.max(1));
    let session = FundingSession {
        session_id: new_id(),
        user_id: user_id.to_string(),
        instrument_id: instrument.instrument_id.clone(),
        transaction_id: None,
        amount_minor: amount,
        status: SessionStatus::Active,
        drain_reason: None,
        drained_minor: None,
        expires_at,
        completed_at: None,
        created_at: Utc::now(),
    };
    let session_id = session.session_id.clone();

    if let Err(err) = inner.store.insert_session(session).await {
        return Err(saga.rollback(err, None, None).await);
    }

    let transaction = match inner
        .recorder
        .record_authorized(user_id, purchase, &session_id)
        .await
    {
        Ok(transaction) => transaction,
        Err(err) => return Err(saga.rollback(err, Some(&session_id), None).await),
    };

    if let Err(err) = inner
        .store
        .link_session_transaction(&session_id, &transaction.transaction_id)
        .await
    {
        return Err(saga
            .rollback(err, Some(&session_id), Some(&transaction.transaction_id))
            .await);
    }

    if let Err(err) = inner
        .recorder
        .debit_for_purchase(user_id, amount, &transaction.transaction_id)
        .await
    {
        return Err(saga
            .rollback(err, Some(&session_id), Some(&transaction.transaction_id))
            .await);
    }

    arm_timer(inner, user_id, &session_id, timeout_secs).await;

    Ok(FundedAuthorization {
        transaction_id: transaction.transaction_id,
        session_id,
        expires_at,
        card: instrument.card(),
    })
}

/// Tracks which funding steps completed so a failure can unwind exactly them.
struct FundingSaga<'a> {
    inner: &'a Arc<SessionInner>,
    user_id: &'a str,
}

impl FundingSaga<'_> {
    /// Unwind the completed steps, preserving the original error. Compensation
    /// failures are logged, not surfaced: the caller must see the root cause.
    ///
    /// The wallet debit is the final fallible step of the saga, so a failed
    /// debit never needs a compensating refund here.
    async fn rollback(
        &self,
        cause: SpendGateError,
        session_id: Option<&str>,
        transaction_id: Option<&str>,
    ) -> SpendGateError {
        warn!(user_id = self.user_id, error = %cause, "funding saga failed, rolling back");

        if let Some(transaction_id) = transaction_id {
            if let Err(err) = self
                .inner
                .recorder
                .finalize_transaction(
                    transaction_id,
                    TransactionStatus::Cancelled,
                    Some("funding rolled back".to_string()),
                )
                .await
            {
                warn!(user_id = self.user_id, error = %err, "rollback transaction cancel failed");
            }
        }

        if let Some(session_id) = session_id {
            if let Err(err) = self
                .inner
                .store
                .transition_session(
                    session_id,
                    SessionStatus::Active,
                    SessionStatus::Drained,
                    Some(DrainReason::CheckoutFailed),
                    Some(0),
                )
                .await
            {
                warn!(user_id = self.user_id, error = %err, "rollback session drain failed");
            }
        }

        if let Err(err) = self.inner.vendor.drain(self.user_id).await {
            warn!(user_id = self.user_id, error = %err, "rollback vendor drain failed");
        }
        if let Err(err) = self
            .inner
            .store
            .set_instrument_funding(self.user_id, 0, 0)
            .await
        {
            warn!(user_id = self.user_id, error = %err, "rollback instrument zero failed");
        }

        cause
    }
}

async fn stale_cleanup_locked(
    inner: &Arc<SessionInner>,
    user_id: &str,
) -> Result<Option<DrainOutcome>, SpendGateError> {
    let Some(active) = inner.store.active_session(user_id).await? else {
        return Ok(None);
    };

    if !active.is_expired(Utc::now()) {
        return Ok(None);
    }

    let outcome =
        drain_session_locked(inner, user_id, &active.session_id, DrainReason::StaleCleanup).await?;
    Ok(Some(outcome))
}

async fn drain_active_locked(
    inner: &Arc<SessionInner>,
    user_id: &str,
    reason: DrainReason,
) -> Result<DrainOutcome, SpendGateError> {
    match inner.store.active_session(user_id).await? {
        Some(active) => drain_session_locked(inner, user_id, &active.session_id, reason).await,
        None => {
            let prior = inner.store.latest_session(user_id).await?;
            Ok(DrainOutcome::AlreadyDrained {
                reason: prior.and_then(|session| session.drain_reason),
            })
        }
    }
}

async fn drain_session_locked(
    inner: &Arc<SessionInner>,
    user_id: &str,
    session_id: &str,
    reason: DrainReason,
) -> Result<DrainOutcome, SpendGateError> {
    let (next_status, success) = match reason {
        DrainReason::CheckoutSuccess => (SessionStatus::Completed, true),
        _ => (SessionStatus::Drained, false),
    };

    // Claim the terminal transition first: exactly one caller wins the swap,
    // every loser observes the prior terminal state.
    let session = match inner
        .store
        .transition_session(session_id, SessionStatus::Active, next_status, Some(reason), None)
        .await?
    {
        Transition::Applied(session) => session,
        Transition::Conflict(current) => {
            return Ok(DrainOutcome::AlreadyDrained {
                reason: current.drain_reason,
            });
        }
    };

    cancel_timer(inner, user_id).await;

    let leftover = inner.vendor.drain(user_id).await?;
    inner.store.set_instrument_funding(user_id, 0, 0).await?;
    let _ = inner
        .store
        .transition_session(session_id, next_status, next_status, Some(reason), Some(leftover))
        .await?;

    // Success refunds only the unspent leftover; every other termination
    // refunds the full original amount.
    let refund_minor = if success {
        leftover
    } else {
        session.amount_minor
    };
    inner
        .recorder
        .refund(user_id, refund_minor, session.transaction_id.as_deref())
        .await?;

    if let Some(transaction_id) = session.transaction_id.as_deref() {
        let (status, note) = if success {
            (TransactionStatus::Completed, "checkout completed".to_string())
        } else {
            (
                TransactionStatus::Cancelled,
                format!("drained: {}", reason.as_str()),
            )
        };
        let transaction = inner
            .recorder
            .finalize_transaction(transaction_id, status, Some(note))
            .await?;

        if success {
            inner
                .store
                .mark_merchant_known(user_id, &transaction.merchant)
                .await?;
        }
    }

    Ok(DrainOutcome::Drained {
        drained_minor: leftover,
        reason,
    })
}

async fn arm_timer(inner: &Arc<SessionInner>, user_id: &str, session_id: &str, timeout_secs: i64) {
    let mut timers = inner.timers.lock().await;
    if let Some(stale) = timers.remove(user_id) {
        stale.abort();
    }

    let task_inner = Arc::clone(inner);
    let user = user_id.to_string();
    let session = session_id.to_string();
    let wait = std::time::Duration::from_secs(timeout_secs.max(1) as u64);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(wait).await;

        // Drop our own registry entry before draining so the drain path does
        // not abort this task mid-flight.
        task_inner.timers.lock().await.remove(&user);

        let guard = task_inner.locks.lock_for(&user).await;
        let _held = guard.lock().await;
        match drain_session_locked(&task_inner, &user, &session, DrainReason::Timeout).await {
            Ok(DrainOutcome::Drained { .. }) => {
                warn!(user_id = %user, session_id = %session, "funding session timed out and was drained");
            }
            Ok(DrainOutcome::AlreadyDrained { .. }) => {}
            Err(err) => {
                warn!(user_id = %user, session_id = %session, error = %err, "timed-out session drain failed");
            }
        }
    });

    timers.insert(user_id.to_string(), handle);
}

async fn cancel_timer(inner: &Arc<SessionInner>, user_id: &str) {
    let mut timers = inner.timers.lock().await;
    if let Some(handle) = timers.remove(user_id) {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpendGateError;
    use crate::storage::{LedgerStorageConfig, PersistentLedger};
    use crate::store::MemoryStore;
    use crate::types::PurchaseRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct TestVendor {
        balances: AsyncMutex<HashMap<String, u64>>,
    }

    impl TestVendor {
        fn new() -> Self {
            Self {
                balances: AsyncMutex::new(HashMap::new()),
            }
        }

        async fn capture(&self, user_id: &str, amount_minor: u64) {
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(user_id.to_string()).or_insert(0);
            *balance = balance.saturating_sub(amount_minor);
        }
    }

    #[async_trait]
    impl CardVendor for TestVendor {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn provision(&self, user_id: &str) -> Result<CardDetails, SpendGateError> {
            Ok(CardDetails {
                instrument_id: format!("card-{user_id}"),
                last4: "4242".to_string(),
                brand: "visa".to_string(),
                currency: "USD".to_string(),
            })
        }

        async fn fund(&self, user_id: &str, amount_minor: u64) -> Result<(), SpendGateError> {
            self.balances
                .lock()
                .await
                .insert(user_id.to_string(), amount_minor);
            Ok(())
        }

        async fn drain(&self, user_id: &str) -> Result<u64, SpendGateError> {
            Ok(self.balances.lock().await.remove(user_id).unwrap_or(0))
        }

        async fn card(&self, user_id: &str) -> Result<Option<CardDetails>, SpendGateError> {
            Ok(Some(CardDetails {
                instrument_id: format!("card-{user_id}"),
                last4: "4242".to_string(),
                brand: "visa".to_string(),
                currency: "USD".to_string(),
            }))
        }
    }

    /// Store wrapper that fails the session/transaction link once, simulating a
    /// persistence failure in the middle of the funding saga.
    struct LinkFailingStore {
        inner: MemoryStore,
        fail_link: AtomicBool,
    }

    impl LinkFailingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_link: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl SpendStore for LinkFailingStore {
        async fn instrument(&self, user_id: &str) -> Result<Option<Instrument>, SpendGateError> {
            self.inner.instrument(user_id).await
        }
        async fn upsert_instrument(&self, instrument: Instrument) -> Result<(), SpendGateError> {
            self.inner.upsert_instrument(instrument).await
        }
        async fn set_instrument_funding(
            &self,
            user_id: &str,
            balance_minor: u64,
            limit_minor: u64,
        ) -> Result<Instrument, SpendGateError> {
            self.inner
                .set_instrument_funding(user_id, balance_minor, limit_minor)
                .await
        }
        async fn wallet(&self, user_id: &str) -> Result<Option<crate::types::Wallet>, SpendGateError> {
            self.inner.wallet(user_id).await
        }
        async fn upsert_wallet(&self, wallet: crate::types::Wallet) -> Result<(), SpendGateError> {
            self.inner.upsert_wallet(wallet).await
        }
        async fn insert_session(&self, session: FundingSession) -> Result<(), SpendGateError> {
            self.inner.insert_session(session).await
        }
        async fn session(
            &self,
            session_id: &str,
        ) -> Result<Option<FundingSession>, SpendGateError> {
            self.inner.session(session_id).await
        }
        async fn active_session(
            &self,
            user_id: &str,
        ) -> Result<Option<FundingSession>, SpendGateError> {
            self.inner.active_session(user_id).await
        }
        async fn latest_session(
            &self,
            user_id: &str,
        ) -> Result<Option<FundingSession>, SpendGateError> {
            self.inner.latest_session(user_id).await
        }
        async fn link_session_transaction(
            &self,
            session_id: &str,
            transaction_id: &str,
        ) -> Result<(), SpendGateError> {
            if self.fail_link.swap(false, Ordering::SeqCst) {
                return Err(SpendGateError::Persistence(
                    "simulated link failure".to_string(),
                ));
            }
            self.inner
                .link_session_transaction(session_id, transaction_id)
                .await
        }
        async fn transition_session(
            &self,
            session_id: &str,
            expected: SessionStatus,
            next: SessionStatus,
            drain_reason: Option<DrainReason>,
            drained_minor: Option<u64>,
        ) -> Result<Transition<FundingSession>, SpendGateError> {
            self.inner
                .transition_session(session_id, expected, next, drain_reason, drained_minor)
                .await
        }
        async fn insert_approval(
            &self,
            approval: crate::types::Approval,
        ) -> Result<(), SpendGateError> {
            self.inner.insert_approval(approval).await
        }
        async fn approval_by_token(
            &self,
            token: &str,
        ) -> Result<Option<crate::types::Approval>, SpendGateError> {
            self.inner.approval_by_token(token).await
        }
        async fn pending_approvals(
            &self,
            user_id: &str,
        ) -> Result<Vec<crate::types::Approval>, SpendGateError> {
            self.inner.pending_approvals(user_id).await
        }
        async fn transition_approval(
            &self,
            approval_id: &str,
            expected: crate::types::ApprovalStatus,
            next: crate::types::ApprovalStatus,
        ) -> Result<Transition<crate::types::Approval>, SpendGateError> {
            self.inner
                .transition_approval(approval_id, expected, next)
                .await
        }
        async fn insert_transaction(
            &self,
            transaction: crate::types::Transaction,
        ) -> Result<(), SpendGateError> {
            self.inner.insert_transaction(transaction).await
        }
        async fn transaction(
            &self,
            transaction_id: &str,
        ) -> Result<Option<crate::types::Transaction>, SpendGateError> {
            self.inner.transaction(transaction_id).await
        }
        async fn update_transaction_status(
            &self,
            transaction_id: &str,
            status: TransactionStatus,
            status_reason: Option<String>,
        ) -> Result<crate::types::Transaction, SpendGateError> {
            self.inner
                .update_transaction_status(transaction_id, status, status_reason)
                .await
        }
        async fn transactions_for_user(
            &self,
            user_id: &str,
        ) -> Result<Vec<crate::types::Transaction>, SpendGateError> {
            self.inner.transactions_for_user(user_id).await
        }
        async fn is_known_merchant(
            &self,
            user_id: &str,
            merchant: &str,
        ) -> Result<bool, SpendGateError> {
            self.inner.is_known_merchant(user_id, merchant).await
        }
        async fn mark_merchant_known(
            &self,
            user_id: &str,
            merchant: &str,
        ) -> Result<(), SpendGateError> {
            self.inner.mark_merchant_known(user_id, merchant).await
        }
    }

    async fn manager_with(
        store: Arc<dyn SpendStore>,
        vendor: Arc<TestVendor>,
    ) -> (SessionManager, Arc<TransactionRecorder>) {
        let ledger = Arc::new(AsyncMutex::new(
            PersistentLedger::bootstrap(LedgerStorageConfig::memory())
                .await
                .unwrap(),
        ));
        let recorder = Arc::new(TransactionRecorder::new(store.clone(), ledger));
        let manager = SessionManager::new(store, vendor, recorder.clone());
        (manager, recorder)
    }

    fn purchase(amount_minor: u64) -> PurchaseSnapshot {
        PurchaseRequest::new("desk lamp", amount_minor, "USD", "lamp.store").snapshot()
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, _) = manager_with(store, Arc::new(TestVendor::new())).await;

        let first = manager.provision("user-1").await.unwrap();
        let second = manager.provision("user-1").await.unwrap();
        assert_eq!(first.instrument_id, second.instrument_id);
        assert_eq!(second.balance_minor, 0);
        assert_eq!(second.spending_limit_minor, 0);
    }

    #[tokio::test]
    async fn funding_sets_card_and_debits_wallet() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) = manager_with(store.clone(), vendor).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();

        let instrument = store.instrument("user-1").await.unwrap().unwrap();
        assert_eq!(instrument.balance_minor, 2_000);
        assert_eq!(instrument.spending_limit_minor, 2_000);
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 8_000);

        let session = store.session(&funded.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.transaction_id.as_deref(), Some(funded.transaction_id.as_str()));
    }

    #[tokio::test]
    async fn second_topup_conflicts_while_session_active() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, recorder) = manager_with(store, Arc::new(TestVendor::new())).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();
        let err = manager
            .fund_for_purchase("user-1", &purchase(1_000), 120)
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGateError::FundingConflict(_)));
    }

    #[tokio::test]
    async fn insufficient_wallet_rejects_before_funding() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, recorder) = manager_with(store.clone(), Arc::new(TestVendor::new())).await;
        recorder.deposit("user-1", 500).await.unwrap();

        let err = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGateError::InsufficientFunds { .. }));

        let transactions = store.transactions_for_user("user-1").await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TransactionStatus::Rejected);
        assert!(store.active_session("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_checkout_refunds_leftover_and_completes_transaction() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) = manager_with(store.clone(), vendor.clone()).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();
        // The merchant captures 1500 of the 2000 on the card.
        vendor.capture("user-1", 1_500).await;

        let outcome = manager
            .complete("user-1", &funded.session_id, true)
            .await
            .unwrap();
        match outcome {
            DrainOutcome::Drained {
                drained_minor,
                reason,
            } => {
                assert_eq!(drained_minor, 500);
                assert_eq!(reason, DrainReason::CheckoutSuccess);
            }
            other => panic!("expected drained, got {:?}", other),
        }

        // 10000 - 2000 + 500 leftover back.
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 8_500);
        assert_eq!(recorder.replay_balance("user-1").await, 8_500);

        let instrument = store.instrument("user-1").await.unwrap().unwrap();
        assert_eq!(instrument.balance_minor, 0);
        assert_eq!(instrument.spending_limit_minor, 0);

        let transaction = store
            .transaction(&funded.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transaction.status, TransactionStatus::Completed);
        assert!(store.is_known_merchant("user-1", "lamp.store").await.unwrap());
    }

    #[tokio::test]
    async fn failed_checkout_refunds_full_amount() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) = manager_with(store.clone(), vendor.clone()).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();
        vendor.capture("user-1", 700).await;

        manager
            .complete("user-1", &funded.session_id, false)
            .await
            .unwrap();

        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 10_000);
        let transaction = store
            .transaction(&funded.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transaction.status, TransactionStatus::Cancelled);
        assert!(!store.is_known_merchant("user-1", "lamp.store").await.unwrap());
    }

    #[tokio::test]
    async fn second_complete_reports_already_drained_without_double_refund() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, recorder) = manager_with(store, Arc::new(TestVendor::new())).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();

        manager
            .complete("user-1", &funded.session_id, true)
            .await
            .unwrap();
        let balance_after_first = recorder.wallet_balance("user-1").await.unwrap();
        let entries_after_first = recorder
            .ledger_entries_for_user("user-1")
            .await
            .unwrap()
            .len();

        let second = manager
            .complete("user-1", &funded.session_id, true)
            .await
            .unwrap();
        match second {
            DrainOutcome::AlreadyDrained { reason } => {
                assert_eq!(reason, Some(DrainReason::CheckoutSuccess));
            }
            other => panic!("expected already drained, got {:?}", other),
        }

        assert_eq!(
            recorder.wallet_balance("user-1").await.unwrap(),
            balance_after_first
        );
        assert_eq!(
            recorder
                .ledger_entries_for_user("user-1")
                .await
                .unwrap()
                .len(),
            entries_after_first
        );
    }

    #[tokio::test]
    async fn complete_checks_ownership_and_existence() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, recorder) = manager_with(store, Arc::new(TestVendor::new())).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();

        let err = manager
            .complete("user-2", &funded.session_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGateError::Forbidden(_)));

        let err = manager.complete("user-1", "missing", true).await.unwrap_err();
        assert!(matches!(err, SpendGateError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drains_abandoned_session() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) = manager_with(store.clone(), vendor).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let funded = manager
            .fund_for_purchase("user-1", &purchase(2_000), 2)
            .await
            .unwrap();

        // Let the auto-drain timer fire.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;

        let session = store.session(&funded.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Drained);
        assert_eq!(session.drain_reason, Some(DrainReason::Timeout));

        let instrument = store.instrument("user-1").await.unwrap().unwrap();
        assert_eq!(instrument.balance_minor, 0);
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn stale_cleanup_drains_expired_session_from_a_previous_process() {
        let store = Arc::new(MemoryStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) =
            manager_with(store.clone() as Arc<dyn SpendStore>, vendor.clone()).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        // Simulate a session left behind by a crashed process: funded card,
        // expired active session, no armed timer.
        manager.provision("user-1").await.unwrap();
        vendor.fund("user-1", 2_000).await.unwrap();
        store
            .set_instrument_funding("user-1", 2_000, 2_000)
            .await
            .unwrap();
        let session = FundingSession {
            session_id: new_id(),
            user_id: "user-1".to_string(),
            instrument_id: "card-user-1".to_string(),
            transaction_id: None,
            amount_minor: 2_000,
            status: SessionStatus::Active,
            drain_reason: None,
            drained_minor: None,
            expires_at: Utc::now() - Duration::seconds(30),
            completed_at: None,
            created_at: Utc::now() - Duration::seconds(90),
        };
        let session_id = session.session_id.clone();
        store.insert_session(session).await.unwrap();
        recorder
            .debit_for_purchase("user-1", 2_000, "tx-orphan")
            .await
            .unwrap();

        let outcome = manager.stale_cleanup("user-1").await.unwrap();
        match outcome {
            Some(DrainOutcome::Drained { reason, .. }) => {
                assert_eq!(reason, DrainReason::StaleCleanup);
            }
            other => panic!("expected stale drain, got {:?}", other),
        }

        let session = store.session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Drained);
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn drain_without_session_reports_prior_reason() {
        let store: Arc<dyn SpendStore> = Arc::new(MemoryStore::new());
        let (manager, recorder) = manager_with(store, Arc::new(TestVendor::new())).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        // Nothing ever funded.
        let outcome = manager
            .drain("user-1", DrainReason::CheckoutFailed)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DrainOutcome::AlreadyDrained { reason: None }
        ));

        let funded = manager
            .fund_for_purchase("user-1", &purchase(1_000), 120)
            .await
            .unwrap();
        manager
            .complete("user-1", &funded.session_id, false)
            .await
            .unwrap();

        let outcome = manager
            .drain("user-1", DrainReason::CheckoutFailed)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DrainOutcome::AlreadyDrained {
                reason: Some(DrainReason::CheckoutFailed)
            }
        ));
    }

    #[tokio::test]
    async fn midsaga_store_failure_rolls_everything_back() {
        let store = Arc::new(LinkFailingStore::new());
        let vendor = Arc::new(TestVendor::new());
        let (manager, recorder) =
            manager_with(store.clone() as Arc<dyn SpendStore>, vendor.clone()).await;
        recorder.deposit("user-1", 10_000).await.unwrap();

        let err = manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGateError::Persistence(_)));

        // Nothing left funded, wallet untouched (no debit had happened yet).
        let instrument = store.instrument("user-1").await.unwrap().unwrap();
        assert_eq!(instrument.balance_minor, 0);
        assert_eq!(instrument.spending_limit_minor, 0);
        assert_eq!(vendor.drain("user-1").await.unwrap(), 0);
        assert!(store.active_session("user-1").await.unwrap().is_none());
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 10_000);
        assert_eq!(recorder.replay_balance("user-1").await, 10_000);

        // The failure was transient; the next attempt succeeds cleanly.
        manager
            .fund_for_purchase("user-1", &purchase(2_000), 120)
            .await
            .unwrap();
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 8_000);
    }
}
