//! Payment webhook endpoint
//!
//! The body is taken as raw bytes; the signature covers the exact payload,
//! so nothing may parse it before verification.

use axum::{body::Bytes, extract::State, http::HeaderMap};
use market_settlement::webhooks::SIGNATURE_HEADER;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<&'static str> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    match state.settlement.webhooks.handle(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = ?outcome, "Webhook acknowledged");
            Ok("ok")
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                status_class = ?e.status_class(),
                "Webhook processing failed"
            );
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use market_settlement::{
        notifications::NotificationDispatcher,
        store::MemoryStore,
        testing::{fixtures, sign_payload, RecordingGateway, TEST_WEBHOOK_SECRET},
        Settlement, SmsSurcharge,
    };
    use market_shared::SellerTier;
    use serde_json::json;
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{config::Config, routes::create_router, state::AppState};

    fn app(store: &MemoryStore) -> Router {
        let settlement = Settlement::new(
            Arc::new(store.clone()),
            Arc::new(RecordingGateway::default()),
            NotificationDispatcher::new(Arc::new(store.clone())),
            SmsSurcharge::default(),
        );
        let config = Config {
            database_url: "postgres://localhost/test".into(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".into(),
            run_migrations: false,
        };
        create_router(AppState::new(config, settlement))
    }

    fn checkout_event(session_id: &str, buyer: Uuid, seller: Uuid, product: Uuid) -> Vec<u8> {
        let items = json!([{
            "product_id": product,
            "seller_id": seller,
            "quantity": 1,
            "unit_price_cents": 1500,
        }]);
        json!({
            "id": "evt_api",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": session_id,
                "mode": "payment",
                "payment_status": "paid",
                "amount_total": 1500,
                "metadata": {
                    "buyer_id": buyer.to_string(),
                    "items": items.to_string(),
                }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn webhook_request(payload: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(payload)).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let store = MemoryStore::new();
        let response = app(&store)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_signed_checkout_returns_ok() {
        let store = MemoryStore::new();
        let buyer = fixtures::user(&store, "Bea", None).await;
        let seller = fixtures::seller(&store, SellerTier::Free, Some("acct_1"), None).await;
        let product = fixtures::product(&store, seller, 1500, Some(2)).await;

        let payload = checkout_event("cs_api", buyer, seller, product);
        let signature = sign_payload(
            TEST_WEBHOOK_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        let app = app(&store);
        let response = app
            .clone()
            .oneshot(webhook_request(payload.clone(), Some(signature.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");

        // Redelivery is acknowledged without a second order
        let response = app
            .oneshot(webhook_request(payload, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.snapshot().await.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_or_bad_signature_is_400() {
        let store = MemoryStore::new();
        let payload = checkout_event("cs_bad", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let response = app(&store)
            .oneshot(webhook_request(payload.clone(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let forged = sign_payload("whsec_other", &payload, OffsetDateTime::now_utc().unix_timestamp());
        let response = app(&store)
            .oneshot(webhook_request(payload, Some(forged)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.snapshot().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_stock_failure_is_500_for_retry() {
        let store = MemoryStore::new();
        let buyer = fixtures::user(&store, "Bea", None).await;
        let seller = fixtures::seller(&store, SellerTier::Free, None, None).await;
        let product = fixtures::product(&store, seller, 1500, Some(0)).await;

        let payload = checkout_event("cs_empty", buyer, seller, product);
        let signature = sign_payload(
            TEST_WEBHOOK_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let response = app(&store)
            .oneshot(webhook_request(payload, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_verified_but_unprocessable_checkout_is_500() {
        let store = MemoryStore::new();
        let payload = json!({
            "id": "evt_no_buyer",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_no_buyer",
                "mode": "payment",
                "payment_status": "paid",
                "metadata": {"items": "[]"}
            }}
        })
        .to_string()
        .into_bytes();
        let signature = sign_payload(
            TEST_WEBHOOK_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let response = app(&store)
            .oneshot(webhook_request(payload, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_signed_garbage_is_400() {
        let store = MemoryStore::new();
        let payload = b"{not an event".to_vec();
        let signature = sign_payload(
            TEST_WEBHOOK_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let response = app(&store)
            .oneshot(webhook_request(payload, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
