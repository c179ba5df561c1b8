use crate::auth::AuthenticatedUser;
use crate::errors::ApiError;
use actix_web::{error::JsonPayloadError, web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use loyalty_core::{LoyaltyService, Metrics, Order, OrderStatus, Points, SubmitReceipt, Withdrawal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            number: order.number.to_string(),
            status: order.status,
            accrual: order.accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: Points,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalView {
    pub order: String,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalView {
    fn from(withdrawal: Withdrawal) -> Self {
        Self {
            order: withdrawal.order.to_string(),
            sum: withdrawal.sum,
            processed_at: withdrawal.processed_at,
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "loyalty-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus text exposition
pub async fn metrics(metrics: web::Data<Metrics>) -> Result<HttpResponse, ApiError> {
    let body = metrics.render().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Upload an order number (plain-text body)
pub async fn upload_order(
    service: web::Data<Arc<LoyaltyService>>,
    user: AuthenticatedUser,
    body: String,
) -> Result<HttpResponse, ApiError> {
    let raw = body.trim();
    if raw.is_empty() {
        return Err(ApiError::BadRequest("order number is required".to_string()));
    }
    // Not a number at all is a malformed request; a bad checksum is a 422
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ApiError::BadRequest(format!("'{}' is not a number", raw)));
    }

    match service.submit_order(user.0, &body).await? {
        SubmitReceipt::Accepted(_) => Ok(HttpResponse::Accepted().finish()),
        SubmitReceipt::AlreadyUploaded(_) => Ok(HttpResponse::Ok().finish()),
    }
}

/// Orders of the requesting user, newest first
pub async fn list_orders(
    service: web::Data<Arc<LoyaltyService>>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let orders: Vec<OrderView> = service
        .orders(user.0)
        .await?
        .into_iter()
        .map(OrderView::from)
        .collect();

    if orders.is_empty() {
        return Ok(HttpResponse::NoContent().finish());
    }
    Ok(HttpResponse::Ok().json(orders))
}

pub async fn get_balance(
    service: web::Data<Arc<LoyaltyService>>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let balance = service.balance(user.0).await?;
    Ok(HttpResponse::Ok().json(balance))
}

/// Spend points against one of the user's orders
pub async fn withdraw(
    service: web::Data<Arc<LoyaltyService>>,
    user: AuthenticatedUser,
    request: web::Json<WithdrawRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = request.into_inner();
    let withdrawal = service.withdraw(user.0, &request.order, request.sum).await?;
    Ok(HttpResponse::Ok().json(WithdrawalView::from(withdrawal)))
}

/// Withdrawals of the requesting user, newest first
pub async fn list_withdrawals(
    service: web::Data<Arc<LoyaltyService>>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, ApiError> {
    let withdrawals: Vec<WithdrawalView> = service
        .withdrawals(user.0)
        .await?
        .into_iter()
        .map(WithdrawalView::from)
        .collect();

    if withdrawals.is_empty() {
        return Ok(HttpResponse::NoContent().finish());
    }
    Ok(HttpResponse::Ok().json(withdrawals))
}

/// Well-formed JSON with bad values (negative sum) is a 422, anything else a 400
fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    match err {
        JsonPayloadError::Deserialize(e) if e.is_data() => ApiError::Unprocessable(e.to_string()).into(),
        other => ApiError::BadRequest(other.to_string()).into(),
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .service(
            web::scope("/api/user")
                .route("/orders", web::post().to(upload_order))
                .route("/orders", web::get().to(list_orders))
                .route("/balance", web::get().to(get_balance))
                .route("/balance/withdraw", web::post().to(withdraw))
                .route("/withdrawals", web::get().to(list_withdrawals)),
        );
}
