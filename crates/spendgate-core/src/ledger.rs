use crate::error::SpendGateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wallet ledger entry kinds. Every balance-affecting event is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Deposit,
    PurchaseDebit,
    Refund,
}

impl LedgerEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::PurchaseDebit => "purchase_debit",
            Self::Refund => "refund",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SpendGateError> {
        match value {
            "deposit" => Ok(Self::Deposit),
            "purchase_debit" => Ok(Self::PurchaseDebit),
            "refund" => Ok(Self::Refund),
            other => Err(SpendGateError::Ledger(format!(
                "unknown ledger kind '{other}'"
            ))),
        }
    }
}

/// Hash-chained, append-only wallet ledger entry.
///
/// `amount_minor` is signed: deposits and refunds are positive, purchase debits
/// negative. `balance_after_minor` is the user's wallet balance immediately after
/// the mutation; replaying a user's entries in order must reproduce it exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub index: u64,
    pub user_id: String,
    pub kind: LedgerEntryKind,
    pub transaction_id: Option<String>,
    pub amount_minor: i64,
    pub balance_after_minor: i64,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only wallet ledger with hash-chain proofs.
///
/// No in-place mutation APIs are exposed. Every balance change becomes an
/// additional record, preserving full historical accountability.
#[derive(Debug, Default, Clone)]
pub struct WalletLedger {
    entries: Vec<LedgerEntry>,
}

impl WalletLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Result<Self, SpendGateError> {
        let ledger = Self { entries };

        for (expected_index, entry) in ledger.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(SpendGateError::Ledger(format!(
                    "ledger index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !ledger.verify_chain() {
            return Err(SpendGateError::Ledger(
                "persisted ledger hash-chain verification failed".to_string(),
            ));
        }

        Ok(ledger)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn entries_for_user(&self, user_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Running signed sum of a user's entries; must equal the wallet balance.
    pub fn replay_balance(&self, user_id: &str) -> i64 {
        self.entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.amount_minor)
            .sum()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected_hash = compute_entry_hash(entry, previous_hash.as_deref());
            if entry.entry_hash != expected_hash {
                return false;
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Build the next deterministic entry without mutating the in-memory chain.
    pub fn build_entry(
        &self,
        user_id: &str,
        kind: LedgerEntryKind,
        transaction_id: Option<String>,
        amount_minor: i64,
        balance_after_minor: i64,
    ) -> LedgerEntry {
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let mut entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            index: self.entries.len() as u64,
            user_id: user_id.to_string(),
            kind,
            transaction_id,
            amount_minor,
            balance_after_minor,
            timestamp: Utc::now(),
            previous_hash: previous_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = compute_entry_hash(&entry, previous_hash.as_deref());
        entry
    }

    /// Commit a pre-built entry after external durability succeeds.
    pub fn commit_entry(&mut self, entry: LedgerEntry) -> Result<(), SpendGateError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(SpendGateError::Ledger(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous_hash = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous_hash {
            return Err(SpendGateError::Ledger(
                "commit previous hash mismatch".to_string(),
            ));
        }

        let expected_hash = compute_entry_hash(&entry, entry.previous_hash.as_deref());
        if entry.entry_hash != expected_hash {
            return Err(SpendGateError::Ledger(
                "commit hash mismatch for ledger entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(entry: &LedgerEntry, previous_hash: Option<&str>) -> String {
    let material = serde_json::json!({
        "index": entry.index,
        "user_id": entry.user_id,
        "kind": entry.kind,
        "transaction_id": entry.transaction_id,
        "amount_minor": entry.amount_minor,
        "balance_after_minor": entry.balance_after_minor,
        "timestamp": entry.timestamp,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(
        ledger: &mut WalletLedger,
        user: &str,
        kind: LedgerEntryKind,
        amount: i64,
        balance_after: i64,
    ) {
        let entry = ledger.build_entry(user, kind, None, amount, balance_after);
        ledger.commit_entry(entry).unwrap();
    }

    #[test]
    fn verifies_hash_chain() {
        let mut ledger = WalletLedger::new();
        append(&mut ledger, "user-1", LedgerEntryKind::Deposit, 10_000, 10_000);
        append(
            &mut ledger,
            "user-1",
            LedgerEntryKind::PurchaseDebit,
            -4_000,
            6_000,
        );
        append(&mut ledger, "user-1", LedgerEntryKind::Refund, 4_000, 10_000);

        assert!(ledger.verify_chain());
        assert_eq!(ledger.replay_balance("user-1"), 10_000);
    }

    #[test]
    fn detects_tampered_entries() {
        let mut ledger = WalletLedger::new();
        append(&mut ledger, "user-1", LedgerEntryKind::Deposit, 10_000, 10_000);

        let mut tampered = ledger.clone();
        tampered.entries[0].amount_minor = 999_999;

        assert!(!tampered.verify_chain());
    }

    #[test]
    fn replay_is_per_user() {
        let mut ledger = WalletLedger::new();
        append(&mut ledger, "user-1", LedgerEntryKind::Deposit, 5_000, 5_000);
        append(&mut ledger, "user-2", LedgerEntryKind::Deposit, 7_000, 7_000);
        append(
            &mut ledger,
            "user-1",
            LedgerEntryKind::PurchaseDebit,
            -2_000,
            3_000,
        );

        assert_eq!(ledger.replay_balance("user-1"), 3_000);
        assert_eq!(ledger.replay_balance("user-2"), 7_000);
        assert_eq!(ledger.entries_for_user("user-2").len(), 1);
    }

    #[test]
    fn from_entries_rejects_index_gaps() {
        let mut ledger = WalletLedger::new();
        append(&mut ledger, "user-1", LedgerEntryKind::Deposit, 5_000, 5_000);
        append(&mut ledger, "user-1", LedgerEntryKind::Deposit, 5_000, 10_000);

        let mut entries = ledger.entries().to_vec();
        entries.remove(0);

        assert!(WalletLedger::from_entries(entries).is_err());
    }

    #[test]
    fn commit_rejects_stale_entry() {
        let mut ledger = WalletLedger::new();
        let first = ledger.build_entry("user-1", LedgerEntryKind::Deposit, None, 5_000, 5_000);
        let stale = ledger.build_entry("user-1", LedgerEntryKind::Deposit, None, 1_000, 1_000);
        ledger.commit_entry(first).unwrap();

        assert!(ledger.commit_entry(stale).is_err());
    }
}
