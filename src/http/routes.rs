//! The gated API surface.
//!
//! Account and wallet handlers here are placeholders: they validate their
//! input and acknowledge it. Credential checks, OTP delivery, KYC, exchange
//! rates and trade execution belong to collaborators outside this crate.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::auth::Principal;
use super::middleware::{Gate, GateOptions, HandlerFault};
use crate::ratelimit::{PolicyName, PolicyRegistry};

/// Build the application router.
///
/// Every policy is resolved here, once, so a misconfigured table fails
/// before the server accepts a connection.
pub fn router(gate: &Gate, policies: &PolicyRegistry) -> Router {
    let login = GateOptions::rate_limited(policies.get(PolicyName::Login));
    let register = GateOptions::rate_limited(policies.get(PolicyName::Register));
    let verify_otp = GateOptions::rate_limited(policies.get(PolicyName::VerifyOtp));
    let forgot = GateOptions::rate_limited(policies.get(PolicyName::ForgotPassword));
    let generic = GateOptions::rate_limited(policies.get(PolicyName::GenericApi)).with_auth();
    let wallet = GateOptions::rate_limited(policies.get(PolicyName::WalletOps)).with_auth();

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", gate.wrap(post(login_handler), login))
        .route("/auth/register", gate.wrap(post(register_handler), register))
        .route("/auth/verify-otp", gate.wrap(post(verify_otp_handler), verify_otp))
        .route("/auth/forgot-password", gate.wrap(post(forgot_password_handler), forgot))
        .route("/api/profile", gate.wrap(get(profile_handler), generic))
        .route("/api/wallet/withdraw", gate.wrap(post(withdraw_handler), wallet))
        .route("/api/trade", gate.wrap(post(trade_handler), wallet))
        .with_state(gate.clone())
}

fn reply(status: StatusCode, message: &str) -> Response {
    let ok = status.is_success();
    (status, Json(json!({ "status": ok, "message": message }))).into_response()
}

async fn health(State(gate): State<Gate>) -> Json<Value> {
    let backend = gate.backend();
    Json(json!({
        "status": true,
        "backend": backend.kind().to_string(),
        "store_healthy": backend.health_check().await,
    }))
}

#[derive(Debug, Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

async fn login_handler(Json(body): Json<Credentials>) -> Response {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return reply(StatusCode::BAD_REQUEST, "Email and password are required");
    }
    reply(StatusCode::OK, "Login accepted")
}

async fn register_handler(Json(body): Json<Credentials>) -> Response {
    if !body.email.contains('@') {
        return reply(StatusCode::BAD_REQUEST, "A valid email is required");
    }
    if body.password.len() < 8 {
        return reply(StatusCode::BAD_REQUEST, "Password must be at least 8 characters");
    }
    reply(StatusCode::CREATED, "Registration received")
}

#[derive(Debug, Deserialize)]
struct OtpSubmission {
    email: String,
    otp: String,
}

async fn verify_otp_handler(Json(body): Json<OtpSubmission>) -> Response {
    let well_formed = body.otp.len() == 6 && body.otp.chars().all(|c| c.is_ascii_digit());
    if body.email.trim().is_empty() || !well_formed {
        return reply(StatusCode::BAD_REQUEST, "A 6 digit code is required");
    }
    reply(StatusCode::OK, "Code submitted")
}

#[derive(Debug, Deserialize)]
struct ForgotPassword {
    email: String,
}

async fn forgot_password_handler(Json(body): Json<ForgotPassword>) -> Response {
    info!(has_email = !body.email.trim().is_empty(), "Password reset requested");
    // Same answer whether or not the account exists
    reply(
        StatusCode::OK,
        "If the account exists, a reset link has been sent",
    )
}

async fn profile_handler(Extension(principal): Extension<Principal>) -> Json<Value> {
    Json(json!({ "status": true, "subject": principal.subject }))
}

#[derive(Debug, Deserialize)]
struct Withdrawal {
    amount: f64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct Receipt {
    id: Uuid,
    subject: String,
    kind: &'static str,
    amount: f64,
    currency: String,
}

async fn withdraw_handler(
    Extension(principal): Extension<Principal>,
    Json(body): Json<Withdrawal>,
) -> Result<Response, HandlerFault> {
    if !body.amount.is_finite() || body.amount <= 0.0 {
        return Ok(reply(StatusCode::BAD_REQUEST, "Amount must be positive"));
    }

    let receipt = Receipt {
        id: Uuid::new_v4(),
        subject: principal.subject,
        kind: "withdrawal",
        amount: body.amount,
        currency: body.currency.to_uppercase(),
    };
    Ok(accepted(&receipt)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Deserialize)]
struct TradeOrder {
    pair: String,
    side: Side,
    amount: f64,
}

async fn trade_handler(
    Extension(principal): Extension<Principal>,
    Json(body): Json<TradeOrder>,
) -> Result<Response, HandlerFault> {
    if !body.amount.is_finite() || body.amount <= 0.0 {
        return Ok(reply(StatusCode::BAD_REQUEST, "Amount must be positive"));
    }
    if !body.pair.contains('/') {
        return Ok(reply(StatusCode::BAD_REQUEST, "Pair must look like BASE/QUOTE"));
    }

    let kind = match body.side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    };
    let receipt = Receipt {
        id: Uuid::new_v4(),
        subject: principal.subject,
        kind,
        amount: body.amount,
        currency: body.pair.to_uppercase(),
    };
    Ok(accepted(&receipt)?)
}

fn accepted(receipt: &Receipt) -> serde_json::Result<Response> {
    let receipt = serde_json::to_value(receipt)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": true, "receipt": receipt })),
    )
        .into_response())
}
