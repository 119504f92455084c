use crate::types::{PolicyConfig, PurchaseRequest, SpendAggregates};
use serde::{Deserialize, Serialize};

/// Inputs the evaluator needs beyond the request and the policy itself.
///
/// The local hour is injected by the caller so evaluation stays a pure function
/// of its arguments.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub aggregates: SpendAggregates,
    pub is_known_merchant: bool,
    pub local_hour: u32,
}

/// Policy decision for one purchase request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    AutoApprove,
    NeedsApproval {
        reason: String,
        risk_flags: Vec<String>,
    },
    Reject {
        reason: String,
        message: String,
    },
}

fn reject(reason: &str, message: String) -> Decision {
    Decision::Reject {
        reason: reason.to_string(),
        message,
    }
}

/// Evaluate a purchase against layered policy.
///
/// Rule order is load-bearing: the first matching rule wins, and hard rejects
/// are checked before any approval-requiring rule. Amount comparisons are
/// strict (`>`); the velocity check uses `>=`. Unbounded limits never match.
///
/// This function is deterministic and side-effect free, so the same input
/// always yields the same decision.
pub fn evaluate_purchase(
    request: &PurchaseRequest,
    policy: &PolicyConfig,
    ctx: &EvaluationContext,
) -> Decision {
    if let Some(category) = request.category.as_deref() {
        let blocked = policy
            .blocked_categories
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(category));
        if blocked {
            return reject(
                "blocked_category",
                format!("category '{category}' is blocked by policy"),
            );
        }
    }

    if request.international && policy.block_international {
        return reject(
            "international",
            "international purchases are blocked by policy".to_string(),
        );
    }

    if policy.night_pause && (ctx.local_hour >= 23 || ctx.local_hour < 7) {
        return reject(
            "night_pause",
            "purchases are paused overnight".to_string(),
        );
    }

    if policy.per_purchase_limit.exceeded_by(request.amount_minor) {
        let limit = policy.per_purchase_limit.finite().unwrap_or(0);
        return reject(
            "over_limit",
            format!(
                "amount {} exceeds per-purchase limit {}",
                request.amount_minor, limit
            ),
        );
    }

    let projected_today = ctx
        .aggregates
        .today_spent_minor
        .saturating_add(request.amount_minor);
    if policy.daily_limit.exceeded_by(projected_today) {
        let limit = policy.daily_limit.finite().unwrap_or(0);
        return reject(
            "daily_limit",
            format!("amount {} would exceed daily limit {}", request.amount_minor, limit),
        );
    }

    let projected_month = ctx
        .aggregates
        .month_spent_minor
        .saturating_add(request.amount_minor);
    if policy.monthly_limit.exceeded_by(projected_month) {
        let limit = policy.monthly_limit.finite().unwrap_or(0);
        return reject(
            "monthly_limit",
            format!(
                "amount {} would exceed monthly limit {}",
                request.amount_minor, limit
            ),
        );
    }

    if policy
        .weekly_purchase_limit
        .reached_by(ctx.aggregates.recent_purchase_count)
    {
        let limit = policy.weekly_purchase_limit.finite().unwrap_or(0);
        return reject(
            "velocity_limit",
            format!(
                "purchase count {} has reached the weekly purchase limit {}",
                ctx.aggregates.recent_purchase_count, limit
            ),
        );
    }

    let mut risk_flags = Vec::new();

    if policy.always_ask {
        risk_flags.push("always_ask".to_string());
    }

    if policy.block_new_merchants && !ctx.is_known_merchant {
        risk_flags.push("new_merchant".to_string());
    }

    if let Some(daily) = policy.daily_limit.finite() {
        // Integer form of the fixed 0.8 threshold: fires strictly above 80%.
        if (projected_today as u128) * 5 > (daily as u128) * 4 {
            risk_flags.push("near_daily_limit".to_string());
        }
    }

    match risk_flags.first() {
        Some(first) => Decision::NeedsApproval {
            reason: first.clone(),
            risk_flags,
        },
        None => Decision::AutoApprove,
    }
}
