use crate::error::SpendGateError;
use crate::recorder::TransactionRecorder;
use crate::session::SessionManager;
use crate::store::{SpendStore, Transition};
use crate::types::{
    new_id, new_token, Approval, ApprovalStatus, FundedAuthorization, PurchaseSnapshot,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::warn;

/// Outbound channel for approval prompts. Delivery is best-effort: a failure
/// here must never fail approval creation.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, approval: &Approval) -> Result<(), SpendGateError>;
}

/// Resolution result for an approval that was still pending.
#[derive(Debug, Clone)]
pub enum ApprovalResolution {
    Approved {
        approval: Approval,
        funded: FundedAuthorization,
    },
    Rejected {
        approval: Approval,
    },
}

/// Tracks and resolves time-boxed human approvals.
///
/// Approvals move `pending -> approved | rejected | expired` exactly once; the
/// transition is a guarded swap in the store, and resolution runs under the
/// user lock so two racing resolvers can never both fund.
pub struct ApprovalManager {
    store: Arc<dyn SpendStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    recorder: Arc<TransactionRecorder>,
    sessions: Arc<SessionManager>,
}

impl ApprovalManager {
    pub fn new(
        store: Arc<dyn SpendStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        recorder: Arc<TransactionRecorder>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            store,
            notifier,
            recorder,
            sessions,
        }
    }

    pub async fn create(
        &self,
        user_id: &str,
        purchase: PurchaseSnapshot,
        risk_flags: Vec<String>,
        timeout_secs: i64,
    ) -> Result<Approval, SpendGateError> {
        let now = Utc::now();
        let approval = Approval {
            approval_id: new_id(),
            user_id: user_id.to_string(),
            token: new_token(),
            purchase,
            risk_flags,
            status: ApprovalStatus::Pending,
            expires_at: now + Duration::seconds(timeout_secs.max(1)),
            resolved_at: None,
            created_at: now,
        };

        self.store.insert_approval(approval.clone()).await?;

        if let Err(err) = self.notifier.notify(&approval).await {
            warn!(user_id, approval_id = %approval.approval_id, error = %err,
                "approval notification failed; approval stays pending");
        }

        Ok(approval)
    }

    pub async fn pending_for_user(&self, user_id: &str) -> Result<Vec<Approval>, SpendGateError> {
        self.store.pending_approvals(user_id).await
    }

    /// Resolve a pending approval by token.
    ///
    /// Fails with `NotFound` when no pending approval matches (including ones
    /// already resolved), `Forbidden` when the approval belongs to a different
    /// user, and `Expired` when the decision arrived too late. On approval the
    /// funding saga runs first; only a funded purchase flips the status, so a
    /// funding failure leaves the approval pending for a fresh decision.
    pub async fn resolve(
        &self,
        caller_user_id: &str,
        token: &str,
        approved: bool,
        funding_timeout_secs: i64,
    ) -> Result<ApprovalResolution, SpendGateError> {
        let guard = self.sessions.user_guard(caller_user_id).await;
        let _held = guard.lock().await;

        let approval = self
            .store
            .approval_by_token(token)
            .await?
            .ok_or_else(|| SpendGateError::NotFound("no pending approval for token".to_string()))?;

        if approval.user_id != caller_user_id {
            return Err(SpendGateError::Forbidden(
                "approval belongs to a different user".to_string(),
            ));
        }

        if approval.status != ApprovalStatus::Pending {
            return Err(SpendGateError::NotFound(
                "approval is no longer pending".to_string(),
            ));
        }

        if Utc::now() > approval.expires_at {
            let expired = self
                .store
                .transition_approval(
                    &approval.approval_id,
                    ApprovalStatus::Pending,
                    ApprovalStatus::Expired,
                )
                .await?;
            if expired.applied().is_some() {
                self.recorder
                    .record_rejected(caller_user_id, &approval.purchase, "approval expired")
                    .await?;
            }
            return Err(SpendGateError::Expired(
                "approval timed out before resolution".to_string(),
            ));
        }

        if !approved {
            let rejected = match self
                .store
                .transition_approval(
                    &approval.approval_id,
                    ApprovalStatus::Pending,
                    ApprovalStatus::Rejected,
                )
                .await?
            {
                Transition::Applied(approval) => approval,
                Transition::Conflict(_) => {
                    return Err(SpendGateError::NotFound(
                        "approval is no longer pending".to_string(),
                    ));
                }
            };

            self.recorder
                .record_rejected(caller_user_id, &approval.purchase, "Rejected by user")
                .await?;

            return Ok(ApprovalResolution::Rejected { approval: rejected });
        }

        // Fund first; the status flips only after money moved successfully.
        let funded = self
            .sessions
            .fund_locked(caller_user_id, &approval.purchase, funding_timeout_secs)
            .await?;

        let approved_record = match self
            .store
            .transition_approval(
                &approval.approval_id,
                ApprovalStatus::Pending,
                ApprovalStatus::Approved,
            )
            .await?
        {
            Transition::Applied(approval) => approval,
            Transition::Conflict(_) => {
                return Err(SpendGateError::Persistence(
                    "approval state changed while funding".to_string(),
                ));
            }
        };

        self.store
            .mark_merchant_known(caller_user_id, &approval.purchase.merchant)
            .await?;

        Ok(ApprovalResolution::Approved {
            approval: approved_record,
            funded,
        })
    }
}
