use crate::types::{SpendAggregates, Transaction};
use chrono::{DateTime, Datelike, Duration, Utc};

/// Computes rolling spend aggregates from transaction history.
///
/// Only transactions that still count as spend (authorized or completed)
/// contribute; rejected and cancelled attempts do not consume limit headroom.
#[derive(Debug, Clone, Copy)]
pub struct SpendAggregator {
    /// Length of the purchase-count velocity window, in days.
    pub window_days: i64,
}

impl Default for SpendAggregator {
    fn default() -> Self {
        Self { window_days: 7 }
    }
}

impl SpendAggregator {
    pub fn new(window_days: i64) -> Self {
        Self {
            window_days: window_days.max(1),
        }
    }

    pub fn aggregates_for(
        &self,
        transactions: &[Transaction],
        now: DateTime<Utc>,
    ) -> SpendAggregates {
        let window_start = now - Duration::days(self.window_days);
        let mut aggregates = SpendAggregates::default();

        for tx in transactions.iter().filter(|tx| tx.counts_as_spend()) {
            if tx.created_at.date_naive() == now.date_naive() {
                aggregates.today_spent_minor =
                    aggregates.today_spent_minor.saturating_add(tx.amount_minor);
            }

            if tx.created_at.year() == now.year() && tx.created_at.month() == now.month() {
                aggregates.month_spent_minor =
                    aggregates.month_spent_minor.saturating_add(tx.amount_minor);
            }

            if tx.created_at > window_start {
                aggregates.recent_purchase_count += 1;
            }
        }

        aggregates
    }
}
