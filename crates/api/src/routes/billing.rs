//! Billing route handlers
//!
//! Thin adapters between HTTP and the billing crate: parse and validate
//! input, pick the right service call, map errors to status codes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use focusdeck_billing::{
    AccountRef, BillingService, EntitlementSnapshot, InvariantReport,
};
use focusdeck_shared::{BillingInterval, Plan};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn billing(state: &AppState) -> ApiResult<&Arc<BillingService>> {
    state
        .billing_service()
        .ok_or_else(|| ApiError::ServiceUnavailable("billing is not available".into()))
}

fn parse_plan(plan: &str) -> ApiResult<Plan> {
    plan.parse().map_err(ApiError::BadRequest)
}

fn parse_interval(interval: Option<&str>) -> ApiResult<BillingInterval> {
    match interval {
        Some(raw) => raw.parse().map_err(ApiError::BadRequest),
        None => Ok(BillingInterval::default()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
    pub billing_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PublicCheckoutRequest {
    pub email: String,
    pub plan: String,
    pub billing_interval: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    /// True when no processor customer is linked yet and nothing was synced
    pub pending: bool,
    #[serde(flatten)]
    pub entitlements: EntitlementSnapshot,
}

/// POST /checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = billing(&state)?;
    let plan = parse_plan(&request.plan)?;
    let interval = parse_interval(request.billing_interval.as_deref())?;

    let checkout = billing
        .checkout
        .create_checkout(AccountRef::Id(user.account_id), plan, interval)
        .await?;
    Ok(Json(CheckoutResponse {
        session_id: checkout.session_id,
        redirect_url: checkout.redirect_url,
    }))
}

/// POST /checkout/public
///
/// Checkout from the marketing site, before the user has an account. The
/// account is created (or found) from the email.
pub async fn create_public_checkout(
    State(state): State<AppState>,
    Json(request): Json<PublicCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = billing(&state)?;
    let plan = parse_plan(&request.plan)?;
    let interval = parse_interval(request.billing_interval.as_deref())?;

    let checkout = billing
        .checkout
        .create_checkout(AccountRef::Email(request.email), plan, interval)
        .await?;
    Ok(Json(CheckoutResponse {
        session_id: checkout.session_id,
        redirect_url: checkout.redirect_url,
    }))
}

/// POST /webhook
///
/// Raw body, authenticated by the processor's signature header. Non-2xx
/// responses make the processor redeliver.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let billing = billing(&state)?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    billing.webhooks.ingest(&body, signature).await?;
    Ok(StatusCode::OK)
}

/// GET /subscription/status
pub async fn subscription_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementSnapshot>> {
    let billing = billing(&state)?;
    let snapshot = billing.entitlements.current(user.account_id).await?;
    Ok(Json(snapshot))
}

/// POST /subscription/sync
pub async fn sync_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SyncResponse>> {
    let billing = billing(&state)?;
    let outcome = billing.sync.sync(user.account_id).await?;
    Ok(Json(SyncResponse {
        pending: outcome.pending,
        entitlements: outcome.snapshot,
    }))
}

/// POST /subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = billing(&state)?;
    billing.sync.request_cancellation(user.account_id).await?;
    Ok(Json(json!({ "status": "cancellation_requested" })))
}

/// POST /subscription/resume
pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = billing(&state)?;
    billing.sync.resume(user.account_id).await?;
    Ok(Json(json!({ "status": "cancellation_cleared" })))
}

/// GET /subscription/invariants
///
/// Consistency report for the caller's own billing state; support tooling.
pub async fn check_invariants(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantReport>> {
    let billing = billing(&state)?;
    let report = billing.invariants.check_account(user.account_id).await?;
    Ok(Json(report))
}
