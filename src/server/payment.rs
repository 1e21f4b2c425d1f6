//! Payment provider redirect target
//!
//! Providers send the payer back to `/payments/callback` with their own
//! reference parameter plus our `feeId` and `schoolId`. The reference is
//! verified with the provider; only a completed payment for the fee's amount
//! marks the fee paid and is kept as a `payments` record.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use super::auth::AppState;
use super::verifier::{PaymentVerifier, Verification};
use crate::error::{PortalError, Result};
use crate::storage::{record_id, Record, RecordStatus};
use crate::tenant::SchoolScope;

pub const FEES: &str = "fees";
pub const PAYMENTS: &str = "payments";

/// Reference parameters in lookup order for providers we don't know
const REFERENCE_KEYS: [&str; 5] = ["transaction_id", "reference", "session_id", "tx_ref", "orderID"];

/// Paid amounts within a cent of the fee are accepted
const AMOUNT_TOLERANCE: f64 = 0.01;

/// Pick the provider's payment reference out of the callback query
pub fn resolve_reference<'a>(provider: &str, params: &'a HashMap<String, String>) -> Option<&'a str> {
    let keys: &[&str] = match provider.to_ascii_lowercase().as_str() {
        "paystack" => &["reference"],
        "flutterwave" => &["transaction_id", "tx_ref"],
        "stripe" => &["session_id"],
        "paypal" => &["orderID"],
        _ => &REFERENCE_KEYS,
    };
    keys.iter()
        .filter_map(|key| params.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub payment_id: String,
    pub fee_id: String,
    pub reference: String,
    /// The reference was already recorded by an earlier callback
    pub duplicate: bool,
}

fn fee_amount(fee: &Record) -> Option<f64> {
    match fee.get("amount")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Check the provider's answer against the fee; returns the amount to record
fn accept(verification: Verification, provider: &str, fee: &Record) -> Result<Option<Value>> {
    let paid = match verification {
        Verification::Paid { amount } => amount,
        Verification::Unpaid { reason } => return Err(PortalError::PaymentRejected(reason)),
        Verification::Unsupported => {
            return Err(PortalError::InvalidRecord(format!(
                "payments from {} cannot be verified",
                provider
            )))
        }
    };
    match (fee_amount(fee), paid) {
        (Some(due), Some(paid)) if (due - paid).abs() > AMOUNT_TOLERANCE => Err(
            PortalError::PaymentRejected(format!("paid {} but the fee is {}", paid, due)),
        ),
        (Some(_), None) => Err(PortalError::PaymentRejected(
            "provider did not report the paid amount".to_string(),
        )),
        (Some(_), Some(_)) => Ok(fee.get("amount").cloned()),
        (None, paid) => Ok(paid.map(|a| json!(a))),
    }
}

fn repeat(scope: &SchoolScope, fee: &Record, fee_id: &str, payment_id: String, reference: &str) -> Result<PaymentOutcome> {
    // An earlier callback may have stored the payment and failed before the fee update
    if RecordStatus::of(fee) != Some(RecordStatus::Paid) {
        scope.set_status(FEES, fee_id, RecordStatus::Paid)?;
    }
    Ok(PaymentOutcome {
        payment_id,
        fee_id: record_id(fee).unwrap_or(fee_id).to_string(),
        reference: reference.to_string(),
        duplicate: true,
    })
}

/// Verify `reference` with the provider, record the payment for `fee_id`
/// and mark the fee paid
pub async fn record_payment(
    scope: &SchoolScope,
    verifier: &dyn PaymentVerifier,
    provider: &str,
    reference: &str,
    fee_id: &str,
) -> Result<PaymentOutcome> {
    let fee = scope
        .get_item(FEES, fee_id)?
        .ok_or_else(|| PortalError::not_found(FEES, fee_id))?;

    let payment_id = format!("{}-{}", provider.to_ascii_lowercase(), reference);
    if scope.get_item(PAYMENTS, &payment_id)?.is_some() {
        return repeat(scope, &fee, fee_id, payment_id, reference);
    }

    let verification = verifier
        .verify(provider, reference)
        .await
        .map_err(|e| PortalError::Verification(e.to_string()))?;
    let amount = accept(verification, provider, &fee)?;

    let mut payment = json!({
        "id": payment_id,
        "provider": provider,
        "reference": reference,
        "feeId": fee_id,
        "status": RecordStatus::Paid,
    });
    if let Some(amount) = amount {
        payment["amount"] = amount;
    }
    match scope.insert(PAYMENTS, payment) {
        Ok(_) => {}
        // A concurrent callback for the same reference got there first
        Err(PortalError::InvalidRecord(_)) if scope.get_item(PAYMENTS, &payment_id)?.is_some() => {
            return repeat(scope, &fee, fee_id, payment_id, reference);
        }
        Err(e) => return Err(e),
    }

    if RecordStatus::of(&fee) != Some(RecordStatus::Paid) {
        scope.set_status(FEES, fee_id, RecordStatus::Paid)?;
    }

    Ok(PaymentOutcome {
        payment_id,
        fee_id: record_id(&fee).unwrap_or(fee_id).to_string(),
        reference: reference.to_string(),
        duplicate: false,
    })
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub async fn payment_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let provider = params.get("provider").map(String::as_str).unwrap_or("");
    let Some(reference) = resolve_reference(provider, &params) else {
        return error_body(StatusCode::BAD_REQUEST, "missing payment reference");
    };
    let Some(fee_id) = params.get("feeId").filter(|v| !v.is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "missing feeId");
    };
    let Some(school_id) = params.get("schoolId").filter(|v| !v.is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "missing schoolId");
    };

    let scope = SchoolScope::new(state.store.clone(), school_id.as_str());
    match record_payment(&scope, state.verifier.as_ref(), provider, reference, fee_id).await {
        Ok(outcome) => {
            info!(
                "Payment {} for fee {} in {} ({})",
                outcome.payment_id,
                fee_id,
                school_id,
                if outcome.duplicate { "repeat" } else { "new" }
            );
            let mut body: Value = json!({ "status": RecordStatus::Paid });
            if let (Some(obj), Ok(Value::Object(extra))) =
                (body.as_object_mut(), serde_json::to_value(&outcome))
            {
                obj.extend(extra);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(PortalError::NotFound { .. }) => error_body(StatusCode::NOT_FOUND, "fee not found"),
        Err(PortalError::InvalidRecord(msg)) => error_body(StatusCode::BAD_REQUEST, msg),
        Err(PortalError::PaymentRejected(reason)) => {
            warn!("Rejected payment {} from {} for fee {}: {}", reference, provider, fee_id, reason);
            error_body(StatusCode::PAYMENT_REQUIRED, reason)
        }
        Err(PortalError::Verification(e)) => {
            warn!("Could not verify payment {} with {}: {}", reference, provider, e);
            error_body(StatusCode::BAD_GATEWAY, "payment provider unavailable")
        }
        Err(e) => {
            warn!("Payment callback failed: {}", e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to record payment")
        }
    }
}
