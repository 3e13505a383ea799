//! # Request Handlers
//!
//! Axum request handlers for the storefront API.
//! Handlers validate input, resolve the current user and delegate to
//! `checkout_core`; they hold no business rules of their own.

use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use checkout_core::{
    add_to_cart, CartSnapshot, CartStore, Catalog, CheckoutFailure, CheckoutOutcome, CheckoutReport,
    Identity, Order, OrderId, OrderStore, PageRequest, PaymentState, PaymentToken, Price,
    ProductFilter, ProductId, ShopError, WebhookEventType,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query for the product listing
#[derive(Debug, Default, Deserialize)]
pub struct ProductQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Add a product to the cart
#[derive(Debug, Deserialize)]
pub struct AddToCartRequest {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// Direct-charge checkout request
#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Client-side payment token (e.g. `tok_visa`)
    pub payment_token: String,
    /// Repeat this key to safely retry the same submission
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Callback query from the hosted payment page
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// One line of the cart view
#[derive(Debug, Serialize)]
pub struct CartLineView {
    pub product_id: ProductId,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Price,
    pub line_total: Price,
}

/// Cart as shown to the user
#[derive(Debug, Serialize)]
pub struct CartView {
    pub lines: Vec<CartLineView>,
    pub total_quantity: u64,
    pub total: Price,
    pub total_display: String,
}

impl TryFrom<CartSnapshot> for CartView {
    type Error = ShopError;

    fn try_from(snapshot: CartSnapshot) -> Result<Self, Self::Error> {
        let lines = snapshot
            .lines
            .iter()
            .map(|line| {
                Ok(CartLineView {
                    product_id: line.product.id.clone(),
                    title: line.product.title.clone(),
                    quantity: line.quantity,
                    unit_price: line.product.price,
                    line_total: line.line_total()?,
                })
            })
            .collect::<Result<Vec<_>, ShopError>>()?;

        Ok(Self {
            lines,
            total_quantity: snapshot.total_quantity,
            total_display: snapshot.total.display(),
            total: snapshot.total,
        })
    }
}

/// Order as listed to its owner
#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub created_at: String,
    pub item_count: u64,
    pub total: Price,
    pub total_display: String,
    pub payment: PaymentState,
    pub invoice_url: String,
}

impl TryFrom<&Order> for OrderSummary {
    type Error = ShopError;

    fn try_from(order: &Order) -> Result<Self, Self::Error> {
        let total = order.total()?;
        Ok(Self {
            id: order.id.clone(),
            created_at: order.created_at.to_rfc3339(),
            item_count: order.item_count(),
            total_display: total.display(),
            total,
            payment: order.payment.clone(),
            invoice_url: format!("/api/v1/orders/{}/invoice", order.id),
        })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Set when a pending order exists despite the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
            order_id: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

pub fn shop_error_to_response(err: ShopError) -> ApiError {
    let code = err.status_code();
    if code >= 500 {
        error!("Request failed: {}", err);
    }
    let response = ErrorResponse::new(err.public_message(), code);
    (StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(response))
}

fn checkout_failure_to_response(failure: CheckoutFailure) -> ApiError {
    let stage = failure.stage;
    let order_id = failure.order_id;
    let (status, Json(mut body)) = shop_error_to_response(failure.error);
    if let Some(id) = order_id {
        body = body.with_details(format!("Order {} is pending payment", id));
        body.order_id = Some(id);
    } else {
        body = body.with_details(format!("Checkout stopped after {}", stage));
    }
    (status, Json(body))
}

// =============================================================================
// Identity
// =============================================================================

/// The requesting user, taken from `x-user-id` / `x-user-email`
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        match (header("x-user-id"), header("x-user-email")) {
            (Some(user_id), Some(email)) => Ok(CurrentUser(Identity::new(user_id, email))),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Authentication required", 401)),
            )),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storefront-checkout",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.provider_name(),
        "pending_cart_clears": state.checkout.pending_cart_clears(),
    }))
}

/// Paginated product listing
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> ApiResult<impl IntoResponse> {
    let request = PageRequest::new(query.page.unwrap_or(1), state.config.page_size)
        .map_err(shop_error_to_response)?;
    let filter = ProductFilter {
        category: query.category.filter(|c| !c.is_empty()),
    };

    let page = state
        .catalog
        .list_products(&filter, request)
        .await
        .map_err(shop_error_to_response)?;
    Ok(Json(page))
}

/// Get single product
pub async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let product = state
        .catalog
        .find_product(&ProductId::new(product_id.as_str()))
        .await
        .map_err(shop_error_to_response)?
        .filter(|p| p.active)
        .ok_or_else(|| shop_error_to_response(ShopError::product_not_found(product_id)))?;

    Ok(Json(product))
}

async fn cart_view(state: &AppState, identity: &Identity) -> ApiResult<Json<CartView>> {
    let snapshot = state
        .checkout
        .preview(identity)
        .await
        .map_err(shop_error_to_response)?;
    CartView::try_from(snapshot)
        .map(Json)
        .map_err(shop_error_to_response)
}

/// Current cart, priced
pub async fn get_cart(State(state): State<AppState>, CurrentUser(identity): CurrentUser) -> ApiResult<Json<CartView>> {
    cart_view(&state, &identity).await
}

/// Add a product to the cart
#[instrument(skip(state, identity, request), fields(user_id = %identity.user_id, product_id = %request.product_id))]
pub async fn add_cart_line(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Json(request): Json<AddToCartRequest>,
) -> ApiResult<Json<CartView>> {
    add_to_cart(
        state.catalog.as_ref(),
        state.carts.as_ref(),
        &identity,
        &ProductId::new(request.product_id),
        request.quantity,
    )
    .await
    .map_err(shop_error_to_response)?;

    cart_view(&state, &identity).await
}

/// Remove a product from the cart
pub async fn remove_cart_line(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(product_id): Path<String>,
) -> ApiResult<Json<CartView>> {
    state
        .carts
        .remove_line(&identity.user_id, &ProductId::new(product_id))
        .await
        .map_err(shop_error_to_response)?;

    cart_view(&state, &identity).await
}

fn report_response(report: CheckoutReport) -> Response {
    let status = match report.outcome {
        CheckoutOutcome::Completed(ref done) if !done.duplicate => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

/// Begin a hosted-session checkout
#[instrument(skip(state, identity), fields(user_id = %identity.user_id))]
pub async fn create_checkout(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<Response> {
    let report = state
        .checkout
        .begin_hosted_checkout(&identity, &state.urls)
        .await
        .map_err(checkout_failure_to_response)?;

    if let CheckoutOutcome::AwaitingPayment { ref session } = report.outcome {
        info!("Redirecting {} to {}", identity.user_id, session.checkout_url);
    }
    Ok(report_response(report))
}

/// Direct-charge checkout
#[instrument(skip(state, identity, request), fields(user_id = %identity.user_id))]
pub async fn create_order(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Json(request): Json<CreateOrderRequest>,
) -> ApiResult<Response> {
    let token = PaymentToken::parse(request.payment_token).map_err(shop_error_to_response)?;
    let key = request
        .idempotency_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let report = state
        .checkout
        .checkout_with_token(&identity, &token, key)
        .await
        .map_err(checkout_failure_to_response)?;
    Ok(report_response(report))
}

/// The requester's orders, oldest first
pub async fn list_orders(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<impl IntoResponse> {
    let orders = state
        .orders
        .list_by_user(&identity.user_id)
        .await
        .map_err(shop_error_to_response)?;

    let summaries = orders
        .iter()
        .map(OrderSummary::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(shop_error_to_response)?;

    Ok(Json(serde_json::json!({
        "orders": summaries,
        "count": summaries.len()
    })))
}

/// Stream an invoice PDF while it is written to disk
#[instrument(skip(state, identity), fields(user_id = %identity.user_id))]
pub async fn get_invoice(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(order_id): Path<String>,
) -> ApiResult<Response> {
    let stream = state
        .invoices
        .open_stream(&OrderId::new(order_id), &identity)
        .await
        .map_err(shop_error_to_response)?;

    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{}\"", stream.file_name))
        .map_err(|e| shop_error_to_response(ShopError::Internal(e.to_string())))?;

    let file_name = stream.file_name.clone();
    let delivery = stream.delivery;
    tokio::spawn(async move {
        match delivery.await {
            Ok(report) if !report.durable.is_delivered() => {
                warn!("Durable copy of {} not written: {:?}", file_name, report.durable);
            }
            Ok(_) => debug!("Delivered {}", file_name),
            Err(e) => error!("Invoice delivery task for {} failed: {}", file_name, e),
        }
    });

    let body = Body::from_stream(ReceiverStream::new(stream.chunks).map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(stream.content_length)),
        ],
        body,
    )
        .into_response())
}

/// Success callback from the hosted payment page
#[instrument(skip(state, identity, query), fields(user_id = %identity.user_id, session_id = %query.session_id))]
pub async fn checkout_success(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Html<String>> {
    let report = state
        .checkout
        .confirm_hosted_checkout(&identity, &query.session_id)
        .await
        .map_err(checkout_failure_to_response)?;

    let order_id = match report.completed() {
        Some(done) => done.order_id.to_string(),
        None => {
            return Err(shop_error_to_response(ShopError::Internal(
                "confirmed session produced no order".to_string(),
            )))
        }
    };

    Ok(Html(format!(
        r#"
<!DOCTYPE html>
<html>
<head><title>Payment Successful</title></head>
<body style="font-family: system-ui; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0;">
    <div style="padding: 60px; border-radius: 16px; text-align: center;">
        <h1>Payment Successful!</h1>
        <p>Order: <code>{order_id}</code></p>
        <p><a href="/api/v1/orders/{order_id}/invoice">Download invoice</a></p>
    </div>
</body>
</html>
"#
    )))
}

/// Checkout cancel page
pub async fn checkout_cancel() -> impl IntoResponse {
    Html(
        r#"
<!DOCTYPE html>
<html>
<head><title>Payment Cancelled</title></head>
<body style="font-family: system-ui; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0;">
    <div style="padding: 60px; border-radius: 16px; text-align: center;">
        <h1>Payment Cancelled</h1>
        <p style="color: #666;">No charges were made. Your cart is unchanged.</p>
    </div>
</body>
</html>
"#,
    )
}

/// Handle Stripe webhook
#[instrument(skip(state, headers, body))]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("Missing Stripe-Signature header", 400)),
            )
        })?;

    let event = state
        .checkout
        .gateway()
        .verify_webhook(&body, signature)
        .await
        .map_err(|e| {
            warn!("Webhook verification failed: {}", e);
            shop_error_to_response(e)
        })?;

    info!("Received webhook: type={:?}, id={}", event.event_type, event.event_id);

    match (&event.event_type, event.session_id.as_deref()) {
        (WebhookEventType::CheckoutCompleted, Some(session_id)) if event.is_paid_checkout() => {
            match state.checkout.confirm_session_from_provider(session_id).await {
                Ok(report) => {
                    debug!("Webhook confirmed session {}: {:?}", session_id, report.outcome);
                }
                // Ask the provider to redeliver on transient failures only.
                Err(failure) if failure.error.is_retryable() => {
                    return Err(checkout_failure_to_response(failure));
                }
                Err(failure) => {
                    warn!("Webhook for session {} not applied: {}", session_id, failure);
                }
            }
        }
        (WebhookEventType::CheckoutExpired, Some(session_id)) => {
            info!("Checkout session {} expired", session_id);
        }
        _ => debug!("Unhandled webhook event: {:?}", event.event_type),
    }

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new("Test error", 400);
        assert_eq!(err.error, "Test error");
        assert_eq!(err.code, 400);
    }

    #[test]
    fn test_shop_error_conversion() {
        let (status, _json) = shop_error_to_response(ShopError::InvalidRequest("Bad data".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, Json(body)) = shop_error_to_response(ShopError::PersistenceError("db down at 10.0.0.3".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.error.contains("10.0.0.3"));
    }

    #[test]
    fn test_checkout_failure_carries_order_id() {
        let failure = CheckoutFailure {
            stage: checkout_core::CheckoutStage::OrderPersisted,
            order_id: Some(OrderId::new("ord-1")),
            error: ShopError::PaymentDeclined {
                reason: "card_declined".to_string(),
            },
        };
        let (status, Json(body)) = checkout_failure_to_response(failure);
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body.order_id, Some(OrderId::new("ord-1")));
    }
}
