//! # Stripe Provider
//!
//! Implementation of `PaymentProvider` on the Stripe Checkout Sessions and
//! Charges APIs.

use crate::config::StripeConfig;
use crate::webhook;
use async_trait::async_trait;
use checkout_core::{
    ChargeConfirmation, ChargeRequest, CheckoutSession, CheckoutUrls, PaymentProvider,
    PaymentToken, SessionStatus, ShopError, ShopResult, WebhookEvent,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

const PROVIDER: &str = "stripe";

/// Stripe payment provider
///
/// Hosted sessions use Stripe's checkout page; direct charges take a
/// client-side token.
pub struct StripeProvider {
    config: StripeConfig,
    client: Client,
}

impl StripeProvider {
    /// Create a new Stripe provider
    pub fn new(config: StripeConfig) -> ShopResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ShopError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> ShopResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    /// Form parameters for a Checkout Session
    fn session_params(request: &ChargeRequest, urls: &CheckoutUrls) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), urls.success_url()),
            ("cancel_url".to_string(), urls.cancel_url()),
        ];

        for (i, line) in request.lines.iter().enumerate() {
            params.push((
                format!("line_items[{}][price_data][currency]", i),
                request.currency.as_str().to_string(),
            ));
            params.push((
                format!("line_items[{}][price_data][unit_amount]", i),
                line.unit_amount.to_string(),
            ));
            params.push((
                format!("line_items[{}][price_data][product_data][name]", i),
                line.name.clone(),
            ));
            if let Some(ref desc) = line.description {
                params.push((
                    format!("line_items[{}][price_data][product_data][description]", i),
                    desc.clone(),
                ));
            }
            params.push((format!("line_items[{}][quantity]", i), line.quantity.to_string()));
        }

        if let Some(ref email) = request.customer_email {
            params.push(("customer_email".to_string(), email.clone()));
        }
        push_metadata(&mut params, request);
        params
    }

    /// Form parameters for a direct charge
    fn charge_params(request: &ChargeRequest, token: &PaymentToken) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.as_str().to_string()),
            ("source".to_string(), token.as_str().to_string()),
            ("description".to_string(), request.description.clone()),
        ];
        if let Some(ref email) = request.customer_email {
            params.push(("receipt_email".to_string(), email.clone()));
        }
        push_metadata(&mut params, request);
        params
    }

    /// Send an authenticated request and decode the JSON body
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ShopResult<T> {
        let response = request
            .header("Authorization", self.config.auth_header())
            .header("Stripe-Version", &self.config.api_version)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !status.is_success() {
            error!("Stripe API error: status={}, body={}", status, body);
            return Err(map_stripe_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ShopError::Serialization(format!("Failed to parse Stripe response: {}", e)))
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    #[instrument(skip(self, request, urls), fields(amount = request.amount, lines = request.lines.len()))]
    async fn create_session(
        &self,
        request: &ChargeRequest,
        urls: &CheckoutUrls,
    ) -> ShopResult<CheckoutSession> {
        let params = Self::session_params(request, urls);
        debug!("Creating Stripe checkout session with {} params", params.len());

        let mut builder = self.client.post(self.url("/v1/checkout/sessions")).form(&params);
        if let Some(ref key) = request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let session: StripeSessionResponse = self.send(builder).await?;
        let checkout_url = session.url.ok_or_else(|| {
            ShopError::Serialization("Stripe session response has no url".to_string())
        })?;

        info!("Created Stripe checkout session: id={}", session.id);

        Ok(CheckoutSession {
            session_id: session.id,
            provider: PROVIDER.to_string(),
            checkout_url,
            amount_total: session.amount_total.unwrap_or(request.amount),
            expires_at: session.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            created_at: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    async fn session_status(&self, session_id: &str) -> ShopResult<SessionStatus> {
        let url = self.url(&format!("/v1/checkout/sessions/{}", session_id));
        let session: StripeSessionResponse = self
            .send(self.client.get(url))
            .await
            .map_err(|e| match e {
                ShopError::NotFound { .. } => ShopError::NotFound {
                    entity: "checkout session",
                    id: session_id.to_string(),
                },
                other => other,
            })?;

        let status = match (session.payment_status.as_deref(), session.status.as_deref()) {
            (Some("paid"), _) => SessionStatus::Paid {
                amount_total: session.amount_total,
                payment_intent_id: session.payment_intent,
            },
            (_, Some("expired")) => SessionStatus::Expired,
            _ => SessionStatus::Open,
        };
        debug!("Stripe session {} is {:?}", session_id, status);
        Ok(status)
    }

    #[instrument(skip(self, request, token), fields(amount = request.amount))]
    async fn charge(
        &self,
        request: &ChargeRequest,
        token: &PaymentToken,
    ) -> ShopResult<ChargeConfirmation> {
        let mut builder = self
            .client
            .post(self.url("/v1/charges"))
            .form(&Self::charge_params(request, token));
        if let Some(ref key) = request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let charge: StripeChargeResponse = self.send(builder).await?;

        if !charge.paid || charge.status.as_deref() == Some("failed") {
            let reason = charge
                .failure_message
                .unwrap_or_else(|| "charge was not completed".to_string());
            warn!("Stripe charge {} not paid: {}", charge.id, reason);
            return Err(ShopError::PaymentDeclined { reason });
        }

        info!("Stripe charge {} succeeded ({})", charge.id, charge.amount);

        Ok(ChargeConfirmation {
            charge_id: charge.id,
            provider: PROVIDER.to_string(),
            amount: charge.amount,
            currency: request.currency,
            created_at: charge
                .created
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(Utc::now),
        })
    }

    #[instrument(skip(self, payload, signature))]
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> ShopResult<WebhookEvent> {
        webhook::verify_signature(
            &self.config.webhook_secret,
            payload,
            signature,
            self.config.webhook_tolerance,
            Utc::now(),
        )?;
        webhook::parse_event(payload)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

// =============================================================================
// Error mapping
// =============================================================================

fn unavailable(message: String) -> ShopError {
    ShopError::PaymentGatewayUnavailable {
        provider: PROVIDER.to_string(),
        message,
    }
}

/// Map a non-2xx Stripe response onto the shared error taxonomy
fn map_stripe_error(status: StatusCode, body: &str) -> ShopError {
    let detail = serde_json::from_str::<StripeErrorResponse>(body)
        .ok()
        .map(|r| r.error);
    let message = detail
        .as_ref()
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let kind = detail.as_ref().and_then(|d| d.error_type.as_deref());

    if kind == Some("card_error") || status == StatusCode::PAYMENT_REQUIRED {
        let reason = detail
            .as_ref()
            .and_then(|d| d.decline_code.clone().or_else(|| d.code.clone()))
            .map(|code| format!("{} ({})", message, code))
            .unwrap_or(message);
        return ShopError::PaymentDeclined { reason };
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || kind == Some("api_error") {
        return unavailable(message);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ShopError::Configuration(format!("Stripe rejected credentials: {}", message))
        }
        StatusCode::NOT_FOUND => ShopError::NotFound {
            entity: "stripe resource",
            id: message,
        },
        _ => ShopError::InvalidChargeRequest(message),
    }
}

fn push_metadata(params: &mut Vec<(String, String)>, request: &ChargeRequest) {
    for (key, value) in &request.metadata {
        params.push((format!("metadata[{}]", key), value.clone()));
    }
}

// =============================================================================
// Stripe API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripeSessionResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeChargeResponse {
    id: String,
    amount: i64,
    #[serde(default)]
    paid: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    failure_message: Option<String>,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkout_core::{
        CartSnapshot, Currency, Price, Product, SnapshotLine, UserId, WebhookEventType,
    };
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChargeRequest {
        let widget = Product::new("widget", "Widget", Price::parse("9.99", Currency::USD).unwrap())
            .with_description("A widget");
        let snapshot = CartSnapshot::from_lines(
            UserId::new("alice"),
            vec![SnapshotLine {
                product: widget,
                quantity: 3,
            }],
            Currency::USD,
        )
        .unwrap();
        ChargeRequest::from_snapshot(&snapshot, Currency::USD)
            .unwrap()
            .with_customer_email("alice@example.com")
            .with_idempotency_key("ord-1")
            .with_metadata("order_id", "ord-1")
    }

    fn provider(server: &MockServer) -> StripeProvider {
        let config = StripeConfig::new("sk_test_abc", "pk_test_abc", "whsec_test")
            .with_api_base_url(server.uri());
        StripeProvider::new(config).unwrap()
    }

    #[test]
    fn test_session_params() {
        let params = StripeProvider::session_params(&request(), &CheckoutUrls::new("https://shop.test"));
        let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("999"));
        assert_eq!(get("line_items[0][price_data][currency]"), Some("usd"));
        assert_eq!(get("line_items[0][quantity]"), Some("3"));
        assert_eq!(get("customer_email"), Some("alice@example.com"));
        assert_eq!(get("metadata[order_id]"), Some("ord-1"));
        assert_eq!(
            get("success_url"),
            Some("https://shop.test/checkout/success?session_id={CHECKOUT_SESSION_ID}")
        );
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("Authorization", "Bearer sk_test_abc"))
            .and(header("Idempotency-Key", "ord-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1",
                "amount_total": 2997,
                "expires_at": 1_900_000_000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = provider(&server)
            .create_session(&request(), &CheckoutUrls::default())
            .await
            .unwrap();

        assert_eq!(session.session_id, "cs_test_1");
        assert_eq!(session.amount_total, 2997);
        assert!(session.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_session_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_paid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_paid", "status": "complete", "payment_status": "paid",
                "amount_total": 2997, "payment_intent": "pi_1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_old", "status": "expired", "payment_status": "unpaid"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "type": "invalid_request_error", "message": "No such checkout.session" }
            })))
            .mount(&server)
            .await;

        let stripe = provider(&server);
        assert_eq!(
            stripe.session_status("cs_paid").await.unwrap(),
            SessionStatus::Paid {
                amount_total: Some(2997),
                payment_intent_id: Some("pi_1".to_string())
            }
        );
        assert_eq!(stripe.session_status("cs_old").await.unwrap(), SessionStatus::Expired);
        assert!(matches!(
            stripe.session_status("cs_missing").await.unwrap_err(),
            ShopError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_charge_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .and(body_string_contains("amount=2997"))
            .and(body_string_contains("source=tok_visa"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_1", "amount": 2997, "paid": true, "status": "succeeded", "created": 1_700_000_000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let confirmation = provider(&server)
            .charge(&request(), &PaymentToken::parse("tok_visa").unwrap())
            .await
            .unwrap();

        assert_eq!(confirmation.charge_id, "ch_1");
        assert_eq!(confirmation.amount, 2997);
    }

    #[tokio::test]
    async fn test_charge_error_taxonomy() {
        let cases = [
            (
                402,
                json!({ "error": { "type": "card_error", "code": "card_declined", "message": "Your card was declined." } }),
                "declined",
            ),
            (503, json!({ "error": { "type": "api_error", "message": "down" } }), "unavailable"),
            (429, json!({ "error": { "type": "rate_limit_error", "message": "slow down" } }), "unavailable"),
            (
                400,
                json!({ "error": { "type": "invalid_request_error", "message": "Invalid currency" } }),
                "invalid",
            ),
        ];

        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/charges"))
                .respond_with(ResponseTemplate::new(status).set_body_json(body))
                .mount(&server)
                .await;

            let err = provider(&server)
                .charge(&request(), &PaymentToken::parse("tok_visa").unwrap())
                .await
                .unwrap_err();

            match expected {
                "declined" => assert!(matches!(err, ShopError::PaymentDeclined { .. }), "{:?}", err),
                "unavailable" => assert!(err.is_retryable(), "{:?}", err),
                _ => assert!(matches!(err, ShopError::InvalidChargeRequest(_)), "{:?}", err),
            }
        }
    }

    #[tokio::test]
    async fn test_network_failure_is_unavailable() {
        let config = StripeConfig::new("sk_test_abc", "pk_test_abc", "whsec_test")
            .with_api_base_url("http://127.0.0.1:9");
        let err = StripeProvider::new(config)
            .unwrap()
            .charge(&request(), &PaymentToken::parse("tok_visa").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ShopError::PaymentGatewayUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_verify_webhook() {
        let server = MockServer::start().await;
        let stripe = provider(&server);
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": Utc::now().timestamp(),
            "data": { "object": { "id": "cs_1", "payment_status": "paid" } }
        }))
        .unwrap();
        let signature = webhook::sign_payload("whsec_test", Utc::now().timestamp(), &payload).unwrap();

        let event = stripe.verify_webhook(&payload, &signature).await.unwrap();
        assert_eq!(event.event_type, WebhookEventType::CheckoutCompleted);
        assert_eq!(event.session_id.as_deref(), Some("cs_1"));

        assert!(stripe.verify_webhook(&payload, "t=1,v1=bad").await.is_err());
    }
}
