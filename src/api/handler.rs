use axum::{
    extract::{Path, State},
    Json,
};
use alloy::primitives::{Address, U256};
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    config::ClaimsConfig,
    error::{AppError, AppResult},
    ledger::{models::NewClaim, ClaimStore},
    settlement::{CycleSummary, SettlementEngine},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ClaimStore>,
    pub engine: Arc<SettlementEngine>,
    pub claims: ClaimsConfig,
}

/// Run derive-based validation, flattening field errors into one message
fn validate_request<T: Validate>(request: &T) -> AppResult<()> {
    request.validate().map_err(|e| {
        let errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| e.message.as_ref().map(|s| s.to_string()).unwrap_or_default())
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");
        AppError::InvalidInput(format!("Validation failed: {}", errors))
    })
}

/// Ledger-precision integer for `amount` at `decimals`; rejects amounts
/// with more fractional digits than the token has
fn to_atomic(amount: Decimal, decimals: u8) -> AppResult<U256> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidInput("Amount must be positive".to_string()));
    }

    let amount = amount.normalize();
    let scale = amount.scale();
    let decimals = u32::from(decimals);
    if scale > decimals {
        return Err(AppError::InvalidInput(format!(
            "Amount has {} decimal places, token supports {}",
            scale, decimals
        )));
    }

    let mantissa = U256::from(amount.mantissa().unsigned_abs());
    Ok(mantissa * U256::from(10u64).pow(U256::from(decimals - scale)))
}

/// Create a claim: debit the internal balance and queue it for settlement
/// POST /claims
pub async fn create_claim(
    State(state): State<AppState>,
    Json(request): Json<CreateClaimRequest>,
) -> AppResult<Json<ClaimResponse>> {
    validate_request(&request)?;

    let recipient = Address::from_str(request.recipient_address.trim())
        .map_err(|e| AppError::InvalidAddress(format!("{}: {}", request.recipient_address, e)))?;
    let amount_atomic = to_atomic(request.amount, request.decimals.unwrap_or(18))?;

    let claim = state
        .store
        .create_claim(
            NewClaim {
                user_id: request.user_id,
                amount: request.amount,
                amount_atomic: amount_atomic.to_string(),
                recipient_address: recipient.to_checksum(None),
            },
            state.claims.max_in_flight_per_user,
        )
        .await?;

    Ok(Json(ClaimResponse::from(claim)))
}

/// GET /claims/:id
pub async fn get_claim(
    State(state): State<AppState>,
    Path(claim_id): Path<Uuid>,
) -> AppResult<Json<ClaimResponse>> {
    let claim = state
        .store
        .get_claim(claim_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Claim {}", claim_id)))?;

    Ok(Json(ClaimResponse::from(claim)))
}

/// Trigger a settlement cycle now
/// POST /settlement/run
pub async fn run_settlement(
    State(state): State<AppState>,
    request: Option<Json<RunSettlementRequest>>,
) -> AppResult<Json<CycleSummary>> {
    let force = request.map(|Json(r)| r.force).unwrap_or(false);
    info!(force, "Settlement cycle requested");

    let summary = state.engine.run_cycle(force).await?;
    Ok(Json(summary))
}

/// GET /settlement/stats
pub async fn settlement_stats(
    State(state): State<AppState>,
) -> AppResult<Json<SettlementStatsResponse>> {
    let claims = state.engine.stats().await?;
    let in_flight_nonces = state
        .engine
        .nonces()
        .in_flight(state.engine.signer())
        .await
        .len();

    Ok(Json(SettlementStatsResponse {
        claims,
        in_flight_nonces,
        timestamp: Utc::now(),
    }))
}

/// GET /admin/nonces
pub async fn list_nonces(State(state): State<AppState>) -> AppResult<Json<NoncesResponse>> {
    let signer = state.engine.signer();
    let in_flight = state.engine.nonces().in_flight(signer).await;

    Ok(Json(NoncesResponse {
        signer: signer.to_string(),
        in_flight,
    }))
}

/// Administrator-triggered nonce abandonment
/// POST /admin/nonces/abandon
///
/// SECURITY: an abandoned nonce may be reused for a new transaction. Only
/// abandon nonces whose transaction is known never to land.
pub async fn abandon_nonces(
    State(state): State<AppState>,
    request: Option<Json<AbandonNoncesRequest>>,
) -> AppResult<Json<AbandonNoncesResponse>> {
    let signer = state.engine.signer();
    let nonces = state.engine.nonces();

    let abandoned = match request.and_then(|Json(r)| r.nonce) {
        Some(nonce) => {
            if !nonces.abandon(signer, nonce).await {
                return Err(AppError::NotFound(format!("In-flight nonce {}", nonce)));
            }
            vec![nonce]
        }
        None => {
            nonces
                .abandon_older_than(signer, state.engine.config().nonce_abandon_after())
                .await
        }
    };

    Ok(Json(AbandonNoncesResponse {
        signer: signer.to_string(),
        abandoned,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.engine.stats().await {
        Ok(_) => "healthy",
        Err(e) => {
            warn!(error = %e, "⚠️ Health check could not reach claim store");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        signer: state.engine.signer().to_string(),
        settlement_enabled: state.engine.config().enabled,
    })
}
