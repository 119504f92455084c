//! REST surface for purchase authorization, approval resolution, and funded
//! session completion.

#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use spendgate_adapters::{LoggingNotifier, SimulatedCardVendor, StaticPolicyStore};
use spendgate_core::{
    Approval, CardDetails, DrainOutcome, EngineConfig, LedgerEntry, LedgerEntryKind,
    LedgerStorageConfig, MemoryStore, PolicyConfig, PurchaseOutcome, PurchaseRequest,
    SpendGateEngine, SpendGateError, Transaction,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger_storage: LedgerStorageConfig,
    /// Bearer token to user-id mapping. Authentication proper is an external
    /// collaborator; this static table is its boundary stand-in.
    pub api_tokens: HashMap<String, String>,
    pub default_policy: PolicyConfig,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let mut api_tokens = HashMap::new();
        api_tokens.insert("dev-token".to_string(), "local-user".to_string());
        Self {
            ledger_storage: LedgerStorageConfig::Memory,
            api_tokens,
            default_policy: PolicyConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<SpendGateEngine>,
    pub policies: Arc<StaticPolicyStore>,
    api_tokens: Arc<HashMap<String, String>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            ledger_storage,
            api_tokens,
            default_policy,
            mut engine,
        } = config;
        engine.ledger_storage = ledger_storage;

        let policies = Arc::new(StaticPolicyStore::new(default_policy));
        let engine = SpendGateEngine::bootstrap(
            Arc::new(MemoryStore::new()),
            policies.clone(),
            Arc::new(SimulatedCardVendor::new()),
            Arc::new(LoggingNotifier),
            engine,
        )
        .await
        .map_err(ServiceError::Core)?;

        Ok(Self {
            engine: Arc::new(engine),
            policies,
            api_tokens: Arc::new(api_tokens),
        })
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] SpendGateError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] SpendGateError),
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(err: &SpendGateError) -> StatusCode {
    match err {
        SpendGateError::Validation(_) => StatusCode::BAD_REQUEST,
        SpendGateError::NotFound(_) => StatusCode::NOT_FOUND,
        SpendGateError::Forbidden(_) => StatusCode::FORBIDDEN,
        SpendGateError::Expired(_) => StatusCode::GONE,
        SpendGateError::FundingConflict(_) => StatusCode::CONFLICT,
        SpendGateError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        SpendGateError::Vendor { .. }
        | SpendGateError::Persistence(_)
        | SpendGateError::Ledger(_)
        | SpendGateError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => (
                status_for(&err),
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/purchase", post(purchase))
        .route("/v1/approvals/pending", get(list_pending_approvals))
        .route("/v1/approvals/:token/resolve", post(resolve_approval))
        .route("/v1/topups/:topup_id/complete", post(complete_topup))
        .route("/v1/wallet", get(get_wallet))
        .route("/v1/wallet/deposit", post(deposit))
        .route("/v1/card", get(get_card).post(provision_card))
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .with_state(state)
}

fn authed_user(state: &ServiceState, headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("authorization must use the Bearer scheme"))?;

    state
        .api_tokens
        .get(token)
        .cloned()
        .ok_or_else(|| ApiError::unauthorized("unknown bearer token"))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "spendgate-service",
        ledger_backend: state.engine.ledger_backend().await,
    })
}

async fn purchase(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseOutcome>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(state.engine.purchase(&user_id, request).await?))
}

async fn list_pending_approvals(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Approval>>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(state.engine.pending_approvals(&user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveBody {
    approved: bool,
}

async fn resolve_approval(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<PurchaseOutcome>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(
        state
            .engine
            .resolve_approval(&user_id, &token, body.approved)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct CompleteBody {
    success: bool,
}

async fn complete_topup(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(topup_id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<DrainOutcome>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(
        state
            .engine
            .complete(&user_id, &topup_id, body.success)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct WalletResponse {
    balance_minor: i64,
}

async fn get_wallet(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<WalletResponse>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(WalletResponse {
        balance_minor: state.engine.wallet_balance(&user_id).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct DepositBody {
    amount_minor: u64,
}

async fn deposit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<DepositBody>,
) -> Result<Json<WalletResponse>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(WalletResponse {
        balance_minor: state.engine.deposit(&user_id, body.amount_minor).await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct CardResponse {
    card: Option<CardDetails>,
}

async fn get_card(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<CardResponse>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(CardResponse {
        card: state.engine.card(&user_id).await?,
    }))
}

async fn provision_card(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<CardDetails>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(state.engine.provision(&user_id).await?))
}

async fn list_transactions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    Ok(Json(state.engine.transactions(&user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerEntriesQuery {
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntriesResponse {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<LedgerEntry>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<LedgerEntryKind>, ApiError> {
    match kind.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => LedgerEntryKind::parse(&value).map(Some).map_err(|_| {
            ApiError::bad_request(format!(
                "invalid kind '{value}'; expected one of: deposit, purchase_debit, refund"
            ))
        }),
    }
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<LedgerEntriesResponse>, ApiError> {
    let user_id = authed_user(&state, &headers)?;
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;

    let mut entries = state.engine.ledger_entries(&user_id).await?;

    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    if order == "desc" {
        entries.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{}'; expected asc or desc",
            order
        )));
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(LedgerEntriesResponse {
        backend: state.engine.ledger_backend().await,
        total,
        returned,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header(header::AUTHORIZATION, "Bearer dev-token")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ledger_backend"], "memory");
    }

    #[tokio::test]
    async fn purchase_requires_bearer_token() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/purchase")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "item": "book",
                            "amount_minor": 1000,
                            "currency": "USD",
                            "merchant": "books.example",
                            "merchant_url": null,
                            "category": null,
                            "international": false
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn deposit_then_purchase_then_complete_roundtrip() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/v1/wallet/deposit"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({ "amount_minor": 10_000 }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["balance_minor"], 10_000);

        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/v1/purchase"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "item": "cable",
                            "amount_minor": 2000,
                            "currency": "USD",
                            "merchant": "wires.example",
                            "merchant_url": null,
                            "category": null,
                            "international": false
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "approved");
        let topup_id = body["topup_id"].as_str().unwrap().to_string();

        let complete = |success: bool| {
            let app = app.clone();
            let topup_id = topup_id.clone();
            async move {
                app.oneshot(
                    authed(
                        Request::builder()
                            .method("POST")
                            .uri(format!("/v1/topups/{topup_id}/complete")),
                    )
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({ "success": success }).to_string(),
                    ))
                    .unwrap(),
                )
                .await
                .unwrap()
            }
        };

        let first = body_json(complete(true).await).await;
        assert_eq!(first["status"], "drained");

        // The completion call is safe to repeat.
        let second = body_json(complete(true).await).await;
        assert_eq!(second["status"], "already_drained");
        assert_eq!(second["reason"], "checkout_success");

        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().uri("/v1/ledger/entries?order=asc"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
    }

    #[tokio::test]
    async fn unknown_topup_is_not_found() {
        let response = app()
            .await
            .oneshot(
                authed(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/topups/missing/complete"),
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({ "success": true }).to_string()))
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
