use crate::aggregation::SpendAggregator;
use crate::approval::{ApprovalManager, ApprovalNotifier, ApprovalResolution};
use crate::error::SpendGateError;
use crate::ledger::LedgerEntry;
use crate::policy::{evaluate_purchase, Decision, EvaluationContext};
use crate::recorder::TransactionRecorder;
use crate::session::SessionManager;
use crate::storage::{LedgerStorageConfig, PersistentLedger};
use crate::store::SpendStore;
use crate::types::{
    Approval, CardDetails, DrainOutcome, PolicyConfig, PurchaseOutcome, PurchaseRequest,
    Transaction,
};
use crate::vendor::CardVendor;
use async_trait::async_trait;
use chrono::{Duration, Timelike, Utc};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// Read-only access to per-user policy, owned by an external settings service.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy_for(&self, user_id: &str) -> Result<PolicyConfig, SpendGateError>;
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of a funded session before the auto-drain timer fires.
    pub funding_timeout_secs: i64,
    /// Length of the purchase-count velocity window.
    pub velocity_window_days: i64,
    /// Offset applied to UTC when deriving the local hour for the night pause.
    pub utc_offset_minutes: i32,
    pub ledger_storage: LedgerStorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            funding_timeout_secs: 600,
            velocity_window_days: 7,
            utc_offset_minutes: 0,
            ledger_storage: LedgerStorageConfig::Memory,
        }
    }
}

/// Purchase-authorization engine layering policy evaluation, human approvals,
/// and the funded-session lifecycle over a pluggable store and card vendor.
pub struct SpendGateEngine {
    store: Arc<dyn SpendStore>,
    policies: Arc<dyn PolicyStore>,
    aggregator: SpendAggregator,
    recorder: Arc<TransactionRecorder>,
    sessions: Arc<SessionManager>,
    approvals: ApprovalManager,
    config: EngineConfig,
}

impl SpendGateEngine {
    pub async fn bootstrap(
        store: Arc<dyn SpendStore>,
        policies: Arc<dyn PolicyStore>,
        vendor: Arc<dyn CardVendor>,
        notifier: Arc<dyn ApprovalNotifier>,
        config: EngineConfig,
    ) -> Result<Self, SpendGateError> {
        let ledger = Arc::new(AsyncMutex::new(
            PersistentLedger::bootstrap(config.ledger_storage.clone()).await?,
        ));
        let recorder = Arc::new(TransactionRecorder::new(store.clone(), ledger));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            vendor,
            recorder.clone(),
        ));
        let approvals = ApprovalManager::new(
            store.clone(),
            notifier,
            recorder.clone(),
            sessions.clone(),
        );

        Ok(Self {
            store,
            policies,
            aggregator: SpendAggregator::new(config.velocity_window_days),
            recorder,
            sessions,
            approvals,
            config,
        })
    }

    /// Authorize one purchase attempt: validate, evaluate against policy, then
    /// reject, defer to a human, or fund the card directly.
    pub async fn purchase(
        &self,
        user_id: &str,
        request: PurchaseRequest,
    ) -> Result<PurchaseOutcome, SpendGateError> {
        validate_request(&request)?;

        let guard = self.sessions.user_guard(user_id).await;
        let _held = guard.lock().await;

        self.sessions.stale_cleanup_locked(user_id).await?;

        let policy = self.policies.policy_for(user_id).await?;
        let transactions = self.store.transactions_for_user(user_id).await?;
        let now = Utc::now();
        let ctx = EvaluationContext {
            aggregates: self.aggregator.aggregates_for(&transactions, now),
            is_known_merchant: self
                .store
                .is_known_merchant(user_id, &request.merchant)
                .await?,
            local_hour: (now + Duration::minutes(self.config.utc_offset_minutes as i64)).hour(),
        };

        match evaluate_purchase(&request, &policy, &ctx) {
            Decision::Reject { reason, message } => {
                info!(user_id, %reason, "purchase rejected by policy");
                self.recorder
                    .record_rejected(user_id, &request.snapshot(), message.clone())
                    .await?;
                Ok(PurchaseOutcome::Rejected { reason, message })
            }
            Decision::NeedsApproval { reason, risk_flags } => {
                info!(user_id, %reason, "purchase deferred to human approval");
                let approval = self
                    .approvals
                    .create(
                        user_id,
                        request.snapshot(),
                        risk_flags,
                        policy.approval_timeout_secs,
                    )
                    .await?;
                Ok(PurchaseOutcome::PendingApproval {
                    approval_id: approval.approval_id,
                    expires_at: approval.expires_at,
                })
            }
            Decision::AutoApprove => {
                let funded = self
                    .sessions
                    .fund_locked(user_id, &request.snapshot(), self.config.funding_timeout_secs)
                    .await?;
                info!(user_id, session_id = %funded.session_id, "purchase auto-approved and funded");
                Ok(PurchaseOutcome::Approved {
                    transaction_id: funded.transaction_id,
                    topup_id: funded.session_id,
                    expires_at: funded.expires_at,
                    card: funded.card,
                })
            }
        }
    }

    /// Resolve a pending approval. Approving funds the card; rejecting records
    /// the refusal. Either way the approval transitions exactly once.
    pub async fn resolve_approval(
        &self,
        user_id: &str,
        token: &str,
        approved: bool,
    ) -> Result<PurchaseOutcome, SpendGateError> {
        let resolution = self
            .approvals
            .resolve(user_id, token, approved, self.config.funding_timeout_secs)
            .await?;

        Ok(match resolution {
            ApprovalResolution::Approved { funded, .. } => PurchaseOutcome::Approved {
                transaction_id: funded.transaction_id,
                topup_id: funded.session_id,
                expires_at: funded.expires_at,
                card: funded.card,
            },
            ApprovalResolution::Rejected { .. } => PurchaseOutcome::Rejected {
                reason: "rejected_by_user".to_string(),
                message: "Rejected by user".to_string(),
            },
        })
    }

    /// Finish a funded session. Callable more than once; repeats observe
    /// `already_drained` and never move money twice.
    pub async fn complete(
        &self,
        user_id: &str,
        topup_id: &str,
        success: bool,
    ) -> Result<DrainOutcome, SpendGateError> {
        self.sessions.complete(user_id, topup_id, success).await
    }

    /// Credit the user's wallet; returns the new balance.
    pub async fn deposit(&self, user_id: &str, amount_minor: u64) -> Result<i64, SpendGateError> {
        let guard = self.sessions.user_guard(user_id).await;
        let _held = guard.lock().await;
        self.recorder.deposit(user_id, amount_minor).await?;
        self.recorder.wallet_balance(user_id).await
    }

    pub async fn provision(&self, user_id: &str) -> Result<CardDetails, SpendGateError> {
        Ok(self.sessions.provision(user_id).await?.card())
    }

    pub async fn card(&self, user_id: &str) -> Result<Option<CardDetails>, SpendGateError> {
        self.sessions.card(user_id).await
    }

    pub async fn wallet_balance(&self, user_id: &str) -> Result<i64, SpendGateError> {
        self.recorder.wallet_balance(user_id).await
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>, SpendGateError> {
        self.store.transactions_for_user(user_id).await
    }

    pub async fn ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntry>, SpendGateError> {
        self.recorder.ledger_entries_for_user(user_id).await
    }

    pub async fn pending_approvals(&self, user_id: &str) -> Result<Vec<Approval>, SpendGateError> {
        self.approvals.pending_for_user(user_id).await
    }

    pub async fn verify_ledger_chain(&self) -> bool {
        self.recorder.verify_ledger_chain().await
    }

    pub async fn ledger_backend(&self) -> &'static str {
        self.recorder.ledger_backend().await
    }
}

fn validate_request(request: &PurchaseRequest) -> Result<(), SpendGateError> {
    if request.item.trim().is_empty() {
        return Err(SpendGateError::Validation("item is required".to_string()));
    }
    if request.merchant.trim().is_empty() {
        return Err(SpendGateError::Validation(
            "merchant is required".to_string(),
        ));
    }
    if request.currency.trim().is_empty() {
        return Err(SpendGateError::Validation(
            "currency is required".to_string(),
        ));
    }
    if request.amount_minor == 0 {
        return Err(SpendGateError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    Ok(())
}
