use crate::error::SpendGateError;
use crate::ledger::{LedgerEntry, LedgerEntryKind};
use crate::storage::PersistentLedger;
use crate::store::SpendStore;
use crate::types::{new_id, PurchaseSnapshot, Transaction, TransactionStatus, Wallet};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Append-only recorder for purchase outcomes and wallet movements.
///
/// Every wallet balance change writes exactly one ledger entry whose
/// `balance_after_minor` matches the wallet balance after the mutation. Policy
/// rejections and approval outcomes are recorded here, never only surfaced as
/// errors, so the system stays queryable after failures.
pub struct TransactionRecorder {
    store: Arc<dyn SpendStore>,
    ledger: Arc<AsyncMutex<PersistentLedger>>,
}

impl TransactionRecorder {
    pub fn new(store: Arc<dyn SpendStore>, ledger: Arc<AsyncMutex<PersistentLedger>>) -> Self {
        Self { store, ledger }
    }

    fn build_transaction(
        user_id: &str,
        purchase: &PurchaseSnapshot,
        status: TransactionStatus,
        status_reason: Option<String>,
        session_id: Option<String>,
    ) -> Transaction {
        let now = Utc::now();
        Transaction {
            transaction_id: new_id(),
            user_id: user_id.to_string(),
            item: purchase.item.clone(),
            merchant: purchase.merchant.clone(),
            category: purchase.category.clone(),
            amount_minor: purchase.amount_minor,
            currency: purchase.currency.clone(),
            status,
            status_reason,
            session_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn record_rejected(
        &self,
        user_id: &str,
        purchase: &PurchaseSnapshot,
        reason: impl Into<String>,
    ) -> Result<Transaction, SpendGateError> {
        let transaction = Self::build_transaction(
            user_id,
            purchase,
            TransactionStatus::Rejected,
            Some(reason.into()),
            None,
        );
        self.store.insert_transaction(transaction.clone()).await?;
        Ok(transaction)
    }

    pub async fn record_authorized(
        &self,
        user_id: &str,
        purchase: &PurchaseSnapshot,
        session_id: &str,
    ) -> Result<Transaction, SpendGateError> {
        let transaction = Self::build_transaction(
            user_id,
            purchase,
            TransactionStatus::Authorized,
            None,
            Some(session_id.to_string()),
        );
        self.store.insert_transaction(transaction.clone()).await?;
        Ok(transaction)
    }

    pub async fn finalize_transaction(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
        status_reason: Option<String>,
    ) -> Result<Transaction, SpendGateError> {
        self.store
            .update_transaction_status(transaction_id, status, status_reason)
            .await
    }

    pub async fn wallet_balance(&self, user_id: &str) -> Result<i64, SpendGateError> {
        Ok(self
            .store
            .wallet(user_id)
            .await?
            .map(|wallet| wallet.balance_minor)
            .unwrap_or(0))
    }

    /// Credit the wallet and write a matching deposit entry.
    pub async fn deposit(
        &self,
        user_id: &str,
        amount_minor: u64,
    ) -> Result<LedgerEntry, SpendGateError> {
        if amount_minor == 0 {
            return Err(SpendGateError::Validation(
                "deposit amount must be positive".to_string(),
            ));
        }
        self.apply_wallet_delta(user_id, LedgerEntryKind::Deposit, amount_minor as i64, None)
            .await
    }

    /// Debit the wallet for a funded purchase and write a matching entry.
    pub async fn debit_for_purchase(
        &self,
        user_id: &str,
        amount_minor: u64,
        transaction_id: &str,
    ) -> Result<LedgerEntry, SpendGateError> {
        let balance = self.wallet_balance(user_id).await?;
        if balance < amount_minor as i64 {
            return Err(SpendGateError::InsufficientFunds {
                balance_minor: balance,
                amount_minor,
            });
        }
        self.apply_wallet_delta(
            user_id,
            LedgerEntryKind::PurchaseDebit,
            -(amount_minor as i64),
            Some(transaction_id.to_string()),
        )
        .await
    }

    /// Credit the wallet back and write a matching refund entry.
    pub async fn refund(
        &self,
        user_id: &str,
        amount_minor: u64,
        transaction_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>, SpendGateError> {
        if amount_minor == 0 {
            return Ok(None);
        }
        let entry = self
            .apply_wallet_delta(
                user_id,
                LedgerEntryKind::Refund,
                amount_minor as i64,
                transaction_id.map(|id| id.to_string()),
            )
            .await?;
        Ok(Some(entry))
    }

    async fn apply_wallet_delta(
        &self,
        user_id: &str,
        kind: LedgerEntryKind,
        amount_minor: i64,
        transaction_id: Option<String>,
    ) -> Result<LedgerEntry, SpendGateError> {
        let current = self.wallet_balance(user_id).await?;
        let next = current
            .checked_add(amount_minor)
            .ok_or_else(|| SpendGateError::Ledger("wallet balance overflow".to_string()))?;

        let entry = {
            let mut ledger = self.ledger.lock().await;
            ledger
                .append(user_id, kind, transaction_id, amount_minor, next)
                .await?
        };

        self.store
            .upsert_wallet(Wallet {
                user_id: user_id.to_string(),
                balance_minor: next,
                updated_at: Utc::now(),
            })
            .await?;

        Ok(entry)
    }

    pub async fn ledger_entries_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<LedgerEntry>, SpendGateError> {
        Ok(self.ledger.lock().await.entries_for_user(user_id))
    }

    pub async fn verify_ledger_chain(&self) -> bool {
        self.ledger.lock().await.verify_chain()
    }

    pub async fn replay_balance(&self, user_id: &str) -> i64 {
        self.ledger.lock().await.replay_balance(user_id)
    }

    pub async fn ledger_backend(&self) -> &'static str {
        self.ledger.lock().await.backend_label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LedgerStorageConfig;
    use crate::store::MemoryStore;
    use crate::types::PurchaseRequest;

    async fn recorder() -> TransactionRecorder {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(AsyncMutex::new(
            PersistentLedger::bootstrap(LedgerStorageConfig::memory())
                .await
                .unwrap(),
        ));
        TransactionRecorder::new(store, ledger)
    }

    #[tokio::test]
    async fn ledger_replay_matches_wallet_after_each_movement() {
        let recorder = recorder().await;

        recorder.deposit("user-1", 10_000).await.unwrap();
        recorder
            .debit_for_purchase("user-1", 4_000, "tx-1")
            .await
            .unwrap();
        recorder.refund("user-1", 1_500, Some("tx-1")).await.unwrap();

        let balance = recorder.wallet_balance("user-1").await.unwrap();
        assert_eq!(balance, 7_500);
        assert_eq!(recorder.replay_balance("user-1").await, balance);
        assert!(recorder.verify_ledger_chain().await);

        let entries = recorder.ledger_entries_for_user("user-1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.last().unwrap().balance_after_minor, 7_500);
    }

    #[tokio::test]
    async fn debit_below_balance_is_refused() {
        let recorder = recorder().await;
        recorder.deposit("user-1", 1_000).await.unwrap();

        let err = recorder
            .debit_for_purchase("user-1", 2_000, "tx-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGateError::InsufficientFunds { .. }));

        // The refused debit wrote nothing.
        assert_eq!(recorder.wallet_balance("user-1").await.unwrap(), 1_000);
        assert_eq!(
            recorder.ledger_entries_for_user("user-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn zero_refund_writes_no_entry() {
        let recorder = recorder().await;
        recorder.deposit("user-1", 1_000).await.unwrap();

        assert!(recorder.refund("user-1", 0, None).await.unwrap().is_none());
        assert_eq!(
            recorder.ledger_entries_for_user("user-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn rejected_purchases_are_recorded_queryably() {
        let recorder = recorder().await;
        let purchase = PurchaseRequest::new("poster", 6_000, "USD", "art.shop").snapshot();

        recorder
            .record_rejected("user-1", &purchase, "amount 6000 exceeds per-purchase limit 5000")
            .await
            .unwrap();

        let transactions = recorder
            .store
            .transactions_for_user("user-1")
            .await
            .unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TransactionStatus::Rejected);
        assert!(transactions[0]
            .status_reason
            .as_deref()
            .unwrap()
            .contains("per-purchase limit"));
    }
}
