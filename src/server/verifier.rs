//! Payment verification against the provider's API
//!
//! A callback only says which reference the payer came back with. Before a
//! fee is marked paid the reference is looked up with the provider using the
//! school's secret key.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// What the provider says about a payment reference
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// Completed; `amount` in major currency units when the provider reports one
    Paid { amount: Option<f64> },
    /// Unknown reference, or a payment that did not complete
    Unpaid { reason: String },
    /// Payments from this provider cannot be checked
    Unsupported,
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, provider: &str, reference: &str) -> Result<Verification>;
}

/// Secret key for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKeys {
    pub secret_key: String,
    /// API base URL, for sandboxes and tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// Providers the portal can verify payments with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paystack: Option<ProviderKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flutterwave: Option<ProviderKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe: Option<ProviderKeys>,
}

impl PaymentsConfig {
    /// Names of the configured providers
    pub fn providers(&self) -> Vec<&'static str> {
        [
            ("paystack", self.paystack.is_some()),
            ("flutterwave", self.flutterwave.is_some()),
            ("stripe", self.stripe.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, configured)| configured.then_some(name))
        .collect()
    }
}

const PAYSTACK_API: &str = "https://api.paystack.co";
const FLUTTERWAVE_API: &str = "https://api.flutterwave.com";
const STRIPE_API: &str = "https://api.stripe.com";

/// Verifies references with Paystack, Flutterwave and Stripe over HTTPS
pub struct ProviderVerifier {
    client: reqwest::Client,
    config: PaymentsConfig,
}

impl ProviderVerifier {
    pub fn new(config: PaymentsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// GET `url` with the secret key; `None` when the provider doesn't know it
    async fn lookup(&self, url: Url, keys: &ProviderKeys) -> Result<Option<Value>> {
        debug!("Verifying payment: GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&keys.secret_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.json::<Value>().await?;
        Ok(Some(body))
    }

    async fn paystack(&self, keys: &ProviderKeys, reference: &str) -> Result<Verification> {
        let base = keys.api_base.as_deref().unwrap_or(PAYSTACK_API);
        let url = endpoint(base, &["transaction", "verify", reference])?;
        let Some(body) = self.lookup(url, keys).await? else {
            return Ok(unknown(reference));
        };
        let data = &body["data"];
        Ok(match data["status"].as_str() {
            // Amounts are in kobo/pesewas/cents
            Some("success") => Verification::Paid {
                amount: data["amount"].as_f64().map(|a| a / 100.0),
            },
            status => unpaid(status),
        })
    }

    async fn flutterwave(&self, keys: &ProviderKeys, reference: &str) -> Result<Verification> {
        let base = keys.api_base.as_deref().unwrap_or(FLUTTERWAVE_API);
        // Numeric references are transaction ids, anything else is our tx_ref
        let url = if !reference.is_empty() && reference.bytes().all(|b| b.is_ascii_digit()) {
            endpoint(base, &["v3", "transactions", reference, "verify"])?
        } else {
            let mut url = endpoint(base, &["v3", "transactions", "verify_by_reference"])?;
            url.query_pairs_mut().append_pair("tx_ref", reference);
            url
        };
        let Some(body) = self.lookup(url, keys).await? else {
            return Ok(unknown(reference));
        };
        let data = &body["data"];
        Ok(match data["status"].as_str() {
            Some("successful") => Verification::Paid {
                amount: data["amount"].as_f64(),
            },
            status => unpaid(status),
        })
    }

    async fn stripe(&self, keys: &ProviderKeys, reference: &str) -> Result<Verification> {
        let base = keys.api_base.as_deref().unwrap_or(STRIPE_API);
        let url = endpoint(base, &["v1", "checkout", "sessions", reference])?;
        let Some(body) = self.lookup(url, keys).await? else {
            return Ok(unknown(reference));
        };
        Ok(match body["payment_status"].as_str() {
            Some("paid") => Verification::Paid {
                amount: body["amount_total"].as_f64().map(|a| a / 100.0),
            },
            status => unpaid(status),
        })
    }
}

#[async_trait]
impl PaymentVerifier for ProviderVerifier {
    async fn verify(&self, provider: &str, reference: &str) -> Result<Verification> {
        let provider = provider.to_ascii_lowercase();
        match provider.as_str() {
            "paystack" => match &self.config.paystack {
                Some(keys) => self.paystack(keys, reference).await,
                None => Ok(Verification::Unsupported),
            },
            "flutterwave" => match &self.config.flutterwave {
                Some(keys) => self.flutterwave(keys, reference).await,
                None => Ok(Verification::Unsupported),
            },
            "stripe" => match &self.config.stripe {
                Some(keys) => self.stripe(keys, reference).await,
                None => Ok(Verification::Unsupported),
            },
            _ => Ok(Verification::Unsupported),
        }
    }
}

fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("{} cannot be used as an API base", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn unknown(reference: &str) -> Verification {
    Verification::Unpaid {
        reason: format!("unknown payment reference {}", reference),
    }
}

fn unpaid(status: Option<&str>) -> Verification {
    Verification::Unpaid {
        reason: format!("payment status is {}", status.unwrap_or("missing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::{IntoResponse, Json, Response},
        routing::get,
        Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    const SECRET: &str = "sk_test_school";

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", SECRET))
            .unwrap_or(false)
    }

    async fn paystack_verify(headers: HeaderMap, Path(reference): Path<String>) -> Response {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        match reference.as_str() {
            "ps-ok" => Json(json!({"status": true, "data": {"status": "success", "amount": 250000}}))
                .into_response(),
            "ps-abandoned" => Json(json!({"status": true, "data": {"status": "abandoned"}})).into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn flutterwave_by_id(Path(id): Path<String>) -> Response {
        match id.as_str() {
            "4242" => Json(json!({"status": "success", "data": {"status": "successful", "amount": 2500}}))
                .into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn flutterwave_by_ref(Query(params): Query<HashMap<String, String>>) -> Response {
        match params.get("tx_ref").map(String::as_str) {
            Some("fee 1/green") => {
                Json(json!({"status": "success", "data": {"status": "failed", "amount": 2500}}))
                    .into_response()
            }
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn stripe_session(Path(id): Path<String>) -> Response {
        match id.as_str() {
            "cs_paid" => Json(json!({"payment_status": "paid", "amount_total": 1999})).into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    /// Fake provider APIs on a random port; returns their base URL
    async fn mock_providers() -> Result<String> {
        let app = Router::new()
            .route("/transaction/verify/:reference", get(paystack_verify))
            .route("/v3/transactions/verify_by_reference", get(flutterwave_by_ref))
            .route("/v3/transactions/:id/verify", get(flutterwave_by_id))
            .route("/v1/checkout/sessions/:id", get(stripe_session));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(format!("http://{}", addr))
    }

    fn keys(base: &str, secret: &str) -> Option<ProviderKeys> {
        Some(ProviderKeys {
            secret_key: secret.to_string(),
            api_base: Some(base.to_string()),
        })
    }

    #[tokio::test]
    async fn test_provider_answers_are_mapped() -> Result<()> {
        let base = mock_providers().await?;
        let verifier = ProviderVerifier::new(PaymentsConfig {
            paystack: keys(&base, SECRET),
            flutterwave: keys(&base, SECRET),
            stripe: keys(&base, SECRET),
        });

        assert_eq!(
            verifier.verify("Paystack", "ps-ok").await?,
            Verification::Paid { amount: Some(2500.0) }
        );
        assert!(matches!(
            verifier.verify("paystack", "ps-abandoned").await?,
            Verification::Unpaid { .. }
        ));
        assert!(matches!(
            verifier.verify("paystack", "i-made-this-up").await?,
            Verification::Unpaid { .. }
        ));
        assert_eq!(
            verifier.verify("flutterwave", "4242").await?,
            Verification::Paid { amount: Some(2500.0) }
        );
        // Looked up by tx_ref, with the reference query-encoded
        assert!(matches!(
            verifier.verify("flutterwave", "fee 1/green").await?,
            Verification::Unpaid { .. }
        ));
        assert_eq!(
            verifier.verify("stripe", "cs_paid").await?,
            Verification::Paid { amount: Some(19.99) }
        );
        assert_eq!(verifier.verify("paypal", "PAY-1").await?, Verification::Unsupported);
        Ok(())
    }

    #[tokio::test]
    async fn test_unconfigured_provider_cannot_verify() -> Result<()> {
        let verifier = ProviderVerifier::new(PaymentsConfig::default());
        assert_eq!(verifier.verify("paystack", "ps-ok").await?, Verification::Unsupported);
        assert!(PaymentsConfig::default().providers().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_secret_is_an_error() -> Result<()> {
        let base = mock_providers().await?;
        let verifier = ProviderVerifier::new(PaymentsConfig {
            paystack: keys(&base, "sk_wrong"),
            ..Default::default()
        });
        assert!(verifier.verify("paystack", "ps-ok").await.is_err());
        Ok(())
    }

    #[test]
    fn test_endpoint_encodes_segments() -> Result<()> {
        let url = endpoint("https://api.paystack.co/", &["transaction", "verify", "a/b c"])?;
        assert_eq!(url.as_str(), "https://api.paystack.co/transaction/verify/a%2Fb%20c");
        Ok(())
    }
}
