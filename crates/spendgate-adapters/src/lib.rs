//! Pluggable collaborator adapters: simulated card vendor, chaos-testing
//! vendor, approval notifiers, and a static policy store.

#![deny(unsafe_code)]

use async_trait::async_trait;
use spendgate_core::{
    Approval, ApprovalNotifier, CardDetails, CardVendor, PolicyConfig, PolicyStore, SpendGateError,
};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

fn derived_last4(user_id: &str) -> String {
    let digits = user_id
        .bytes()
        .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u32));
    format!("{:04}", digits % 10_000)
}

/// Deterministic local card vendor for development and tests.
///
/// Cards exist purely in process memory; `capture` simulates a merchant
/// charging part of the loaded balance during checkout.
#[derive(Debug, Default)]
pub struct SimulatedCardVendor {
    balances: Mutex<HashMap<String, u64>>,
}

impl SimulatedCardVendor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a merchant capture against the card's current balance.
    pub async fn capture(&self, user_id: &str, amount_minor: u64) {
        let mut balances = self.balances.lock().await;
        let balance = balances.entry(user_id.to_string()).or_insert(0);
        *balance = balance.saturating_sub(amount_minor);
    }

    pub async fn balance(&self, user_id: &str) -> u64 {
        *self.balances.lock().await.get(user_id).unwrap_or(&0)
    }
}

#[async_trait]
impl CardVendor for SimulatedCardVendor {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn provision(&self, user_id: &str) -> Result<CardDetails, SpendGateError> {
        Ok(CardDetails {
            instrument_id: format!("sim-{user_id}"),
            last4: derived_last4(user_id),
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
            instrument_id: format!("sim-{user_id}"),
            last4: derived_last4(user_id),
            brand: "visa".to_string(),
            currency: "USD".to_string(),
        }))
    }
}

/// Vendor whose funding calls always fail. Useful for exercising the funding
/// saga's rollback path.
#[derive(Debug, Clone)]
pub struct FailingCardVendor {
    reason: String,
}

impl FailingCardVendor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CardVendor for FailingCardVendor {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn provision(&self, user_id: &str) -> Result<CardDetails, SpendGateError> {
        Ok(CardDetails {
            instrument_id: format!("fail-{user_id}"),
            last4: "0000".to_string(),
            brand: "visa".to_string(),
            currency: "USD".to_string(),
        })
    }

    async fn fund(&self, _user_id: &str, _amount_minor: u64) -> Result<(), SpendGateError> {
        Err(SpendGateError::vendor(self.name(), self.reason.clone()))
    }

    async fn drain(&self, _user_id: &str) -> Result<u64, SpendGateError> {
        Ok(0)
    }

    async fn card(&self, _user_id: &str) -> Result<Option<CardDetails>, SpendGateError> {
        Ok(None)
    }
}

/// Notifier that writes approval prompts to the log. Stands in for a real
/// messaging channel in local deployments.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ApprovalNotifier for LoggingNotifier {
    async fn notify(&self, approval: &Approval) -> Result<(), SpendGateError> {
        info!(
            user_id = %approval.user_id,
            approval_id = %approval.approval_id,
            item = %approval.purchase.item,
            amount_minor = approval.purchase.amount_minor,
            merchant = %approval.purchase.merchant,
            risk_flags = ?approval.risk_flags,
            "approval requested"
        );
        Ok(())
    }
}

/// Notifier that retains every prompt for inspection in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Approval>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Approval> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl ApprovalNotifier for RecordingNotifier {
    async fn notify(&self, approval: &Approval) -> Result<(), SpendGateError> {
        self.sent.lock().await.push(approval.clone());
        Ok(())
    }
}

/// Policy store backed by an in-memory map with a configurable default.
///
/// Stands in for the external settings service that owns per-user policy.
#[derive(Debug, Default)]
pub struct StaticPolicyStore {
    default_policy: PolicyConfig,
    policies: RwLock<HashMap<String, PolicyConfig>>,
}

impl StaticPolicyStore {
    pub fn new(default_policy: PolicyConfig) -> Self {
        Self {
            default_policy,
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set(&self, user_id: impl Into<String>, policy: PolicyConfig) {
        self.policies.write().await.insert(user_id.into(), policy);
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn policy_for(&self, user_id: &str) -> Result<PolicyConfig, SpendGateError> {
        Ok(self
            .policies
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone()))
    }
}
