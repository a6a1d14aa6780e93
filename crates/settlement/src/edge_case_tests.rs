// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the settlement pipeline
//!
//! Drives signed webhook payloads end to end through the in-memory store:
//! - Webhook routing and idempotency
//! - Stock and order atomicity
//! - Payout arithmetic and transfer failures
//! - Deliverer matching and fan-out
//! - Notification channel independence

use std::collections::HashMap;
use std::sync::Arc;

use market_shared::SellerTier;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{GeoPoint, SellerProfile, UserContact};
use crate::notifications::preferences::NotificationPreferences;
use crate::notifications::NotificationDispatcher;
use crate::payouts::PayoutService;
use crate::store::MemoryStore;
use crate::testing::{fixtures, sign_payload, RecordingChannel, RecordingGateway, TEST_WEBHOOK_SECRET};
use crate::webhooks::{WebhookHandler, WebhookOutcome};

struct Pipeline {
    store: MemoryStore,
    gateway: Arc<RecordingGateway>,
    push: Arc<RecordingChannel>,
    email: Arc<RecordingChannel>,
    handler: WebhookHandler,
}

fn pipeline_with(email: RecordingChannel) -> Pipeline {
    let store = MemoryStore::new();
    let gateway = Arc::new(RecordingGateway::default());
    let push = Arc::new(RecordingChannel::new());
    let email = Arc::new(email);
    let dispatcher = NotificationDispatcher::new(Arc::new(store.clone()))
        .with_push(push.clone())
        .with_email(email.clone())
        .with_sms(Arc::new(RecordingChannel::new()));
    let payouts = PayoutService::new(Arc::new(store.clone()), gateway.clone());
    let handler = WebhookHandler::new(Arc::new(store.clone()), gateway.clone(), payouts, dispatcher);
    Pipeline {
        store,
        gateway,
        push,
        email,
        handler,
    }
}

fn pipeline() -> Pipeline {
    pipeline_with(RecordingChannel::new())
}

struct Line {
    product_id: Uuid,
    seller_id: Uuid,
    quantity: i32,
    unit_price_cents: i64,
}

fn checkout_payload(session_id: &str, buyer_id: Uuid, lines: &[Line], extra: &[(&str, &str)]) -> Vec<u8> {
    let items: Vec<_> = lines
        .iter()
        .map(|l| {
            json!({
                "product_id": l.product_id,
                "seller_id": l.seller_id,
                "quantity": l.quantity,
                "unit_price_cents": l.unit_price_cents,
            })
        })
        .collect();

    let mut metadata: HashMap<String, String> = HashMap::from([
        ("buyer_id".to_string(), buyer_id.to_string()),
        ("items".to_string(), serde_json::Value::from(items).to_string()),
    ]);
    for (k, v) in extra {
        metadata.insert(k.to_string(), v.to_string());
    }

    let total: i64 = lines
        .iter()
        .map(|l| l.unit_price_cents * i64::from(l.quantity))
        .sum();

    json!({
        "id": format!("evt_{}", session_id),
        "type": "checkout.session.completed",
        "created": 1_750_000_000,
        "data": {
            "object": {
                "id": session_id,
                "object": "checkout.session",
                "mode": "payment",
                "payment_status": "paid",
                "payment_intent": format!("pi_{}", session_id),
                "amount_total": total,
                "metadata": metadata,
            }
        }
    })
    .to_string()
    .into_bytes()
}

async fn deliver(p: &Pipeline, payload: &[u8]) -> crate::SettlementResult<WebhookOutcome> {
    let signature = sign_payload(
        TEST_WEBHOOK_SECRET,
        payload,
        OffsetDateTime::now_utc().unix_timestamp(),
    );
    p.handler.handle(payload, &signature).await
}

/// Buyer, one free-tier seller with a payout account, one product
async fn simple_shop(p: &Pipeline, price_cents: i64, stock: Option<i32>) -> (Uuid, Uuid, Uuid) {
    let buyer = fixtures::user(&p.store, "Bea", None).await;
    let seller = fixtures::seller(&p.store, SellerTier::Free, Some("acct_seller"), None).await;
    let product = fixtures::product(&p.store, seller, price_cents, stock).await;
    (buyer, seller, product)
}

#[cfg(test)]
mod webhook_tests {
    use super::*;
    use crate::client::SubscriptionSnapshot;
    use crate::error::{SettlementError, StatusClass};

    // =========================================================================
    // Same checkout event delivered five times creates one order
    // =========================================================================
    #[tokio::test]
    async fn test_replayed_checkout_creates_one_order() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 1_000, Some(10)).await;
        let payload = checkout_payload(
            "cs_replay",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 3,
                unit_price_cents: 1_000,
            }],
            &[],
        );

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(deliver(&p, &payload).await.unwrap());
        }

        assert_eq!(outcomes[0], WebhookOutcome::Processed);
        assert!(outcomes[1..].iter().all(|o| *o == WebhookOutcome::Duplicate));

        let state = p.store.snapshot().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.order_items.len(), 1);
        assert_eq!(state.products[&product].stock, Some(7));
        assert_eq!(state.payouts.len(), 1, "payouts are written once");
        assert_eq!(p.gateway.transfers().len(), 1, "money moves once");
        assert_eq!(state.review_tokens.len(), 1);
    }

    // =========================================================================
    // Concurrent redeliveries race; exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_redelivery_is_idempotent() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 500, Some(4)).await;
        let payload = checkout_payload(
            "cs_race",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 500,
            }],
            &[],
        );
        let signature = sign_payload(
            TEST_WEBHOOK_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        let mut handles = vec![];
        for _ in 0..8 {
            let handler = p.handler.clone();
            let payload = payload.clone();
            let signature = signature.clone();
            handles.push(tokio::spawn(async move {
                handler.handle(&payload, &signature).await.unwrap()
            }));
        }

        let mut processed = 0;
        for handle in handles {
            if handle.await.unwrap() == WebhookOutcome::Processed {
                processed += 1;
            }
        }

        assert_eq!(processed, 1);
        let state = p.store.snapshot().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.products[&product].stock, Some(3));
    }

    // =========================================================================
    // Bad signature: client error, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_has_no_side_effects() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 1_000, Some(10)).await;
        let payload = checkout_payload(
            "cs_forged",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_000,
            }],
            &[],
        );
        let forged = sign_payload("whsec_attacker", &payload, OffsetDateTime::now_utc().unix_timestamp());

        let err = p.handler.handle(&payload, &forged).await.unwrap_err();
        assert!(matches!(err, SettlementError::WebhookSignatureInvalid));
        assert_eq!(err.status_class(), StatusClass::ClientError);

        let state = p.store.snapshot().await;
        assert!(state.orders.is_empty());
        assert_eq!(state.products[&product].stock, Some(10));
        assert!(p.push.sent().is_empty());
    }

    // =========================================================================
    // Unpaid async-payment sessions wait for a later event
    // =========================================================================
    #[tokio::test]
    async fn test_unpaid_session_is_ignored() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 1_000, None).await;
        let payload = checkout_payload(
            "cs_unpaid",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_000,
            }],
            &[],
        );
        let mut event: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        event["data"]["object"]["payment_status"] = json!("unpaid");
        let payload = event.to_string().into_bytes();

        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Ignored);
        assert!(p.store.snapshot().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_ignored() {
        let p = pipeline();
        let payload = json!({
            "id": "evt_invoice",
            "type": "invoice.paid",
            "data": {"object": {"id": "in_1"}}
        })
        .to_string()
        .into_bytes();
        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Ignored);
    }

    // =========================================================================
    // Verified but unprocessable checkout: 500 so the gateway redelivers
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_without_buyer_is_retryable() {
        let p = pipeline();
        let payload = json!({
            "id": "evt_nobuyer",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_nobuyer",
                "mode": "payment",
                "payment_status": "paid",
                "metadata": {"items": "[]"}
            }}
        })
        .to_string()
        .into_bytes();

        let err = deliver(&p, &payload).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));
        assert_eq!(err.status_class(), StatusClass::ServerError);
    }

    #[tokio::test]
    async fn test_zero_quantity_checkout_is_retryable_and_writes_nothing() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 1_000, Some(5)).await;
        let payload = checkout_payload(
            "cs_zero_qty",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 0,
                unit_price_cents: 1_000,
            }],
            &[],
        );

        let err = deliver(&p, &payload).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));
        assert_eq!(err.status_class(), StatusClass::ServerError);

        let state = p.store.snapshot().await;
        assert!(state.orders.is_empty());
        assert_eq!(state.products[&product].stock, Some(5));
    }

    #[tokio::test]
    async fn test_unparseable_envelope_is_client_error() {
        let p = pipeline();
        let err = deliver(&p, b"not json at all").await.unwrap_err();
        assert!(matches!(err, SettlementError::MalformedEvent(_)));
        assert_eq!(err.status_class(), StatusClass::ClientError);
    }

    // =========================================================================
    // Subscription lifecycle updates seller linkage
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_events_update_seller_tier() {
        let p = pipeline();
        let seller = fixtures::user(&p.store, "Sol", None).await;
        p.store
            .add_seller(
                SellerProfile {
                    user_id: seller,
                    tier: SellerTier::Free,
                    payout_account_id: None,
                    location: None,
                    subscription_id: None,
                    subscription_valid_until: None,
                },
                Some("cus_sol"),
            )
            .await;

        let event = |event_type: &str, status: &str| {
            json!({
                "id": format!("evt_{}", event_type),
                "type": event_type,
                "data": {"object": {
                    "id": "sub_sol",
                    "customer": "cus_sol",
                    "status": status,
                    "current_period_end": 1_900_000_000,
                    "items": {"data": [{"price": {"id": "price_starter", "nickname": "Starter"}}]}
                }}
            })
            .to_string()
            .into_bytes()
        };

        let outcome = deliver(&p, &event("customer.subscription.updated", "active"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(
            p.store.snapshot().await.sellers[&seller].tier,
            SellerTier::Starter
        );

        deliver(&p, &event("customer.subscription.deleted", "canceled"))
            .await
            .unwrap();
        let state = p.store.snapshot().await;
        assert_eq!(state.sellers[&seller].tier, SellerTier::Free);
        assert_eq!(state.sellers[&seller].subscription_id, None);
    }

    // =========================================================================
    // Subscription without a period end: paid tier stays in force at checkout
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_without_period_end_keeps_paid_fee() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = fixtures::seller(&p.store, SellerTier::Free, Some("acct_pat"), None).await;
        let product = fixtures::product(&p.store, seller, 10_000, None).await;

        let subscription = json!({
            "id": "evt_sub_open",
            "type": "customer.subscription.created",
            "data": {"object": {
                "id": "sub_open",
                "customer": "cus_open",
                "status": "active",
                "metadata": {"seller_id": seller.to_string()},
                "items": {"data": [{"price": {"id": "price_unmapped", "nickname": "Pro Monthly"}}]}
            }}
        })
        .to_string()
        .into_bytes();
        assert_eq!(deliver(&p, &subscription).await.unwrap(), WebhookOutcome::Processed);

        let profile = p.store.snapshot().await.sellers[&seller].clone();
        assert_eq!(profile.tier, SellerTier::Pro);
        assert_eq!(profile.subscription_valid_until, None);

        let payload = checkout_payload(
            "cs_open_sub",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 10_000,
            }],
            &[],
        );
        deliver(&p, &payload).await.unwrap();

        // Pro rate, not the Free 12%
        assert_eq!(p.gateway.transfers()[0].amount_cents, 9_200);
    }

    #[tokio::test]
    async fn test_subscription_checkout_syncs_from_gateway() {
        let p = pipeline();
        let seller = fixtures::seller(&p.store, SellerTier::Free, None, None).await;
        p.gateway.add_subscription(SubscriptionSnapshot {
            id: "sub_new".into(),
            customer: "cus_new".into(),
            status: "active".into(),
            seller_id: Some(seller),
            current_period_end: Some(1_900_000_000),
            price_id: Some("price_pro".into()),
            plan_name: None,
        });

        let payload = json!({
            "id": "evt_sub_checkout",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_sub",
                "mode": "subscription",
                "payment_status": "paid",
                "subscription": "sub_new"
            }}
        })
        .to_string()
        .into_bytes();

        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Processed);
        let state = p.store.snapshot().await;
        assert_eq!(state.sellers[&seller].tier, SellerTier::Pro);
        assert!(state.orders.is_empty());
    }
}

#[cfg(test)]
mod order_tests {
    use super::*;
    use crate::error::{SettlementError, StatusClass};

    // =========================================================================
    // Stock 2, quantity 3: rejected, nothing written, gateway retries
    // =========================================================================
    #[tokio::test]
    async fn test_insufficient_stock_rolls_back_and_asks_for_retry() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 1_000, Some(2)).await;
        let other = fixtures::product(&p.store, seller, 300, Some(5)).await;
        let payload = checkout_payload(
            "cs_short",
            buyer,
            &[
                Line {
                    product_id: other,
                    seller_id: seller,
                    quantity: 1,
                    unit_price_cents: 300,
                },
                Line {
                    product_id: product,
                    seller_id: seller,
                    quantity: 3,
                    unit_price_cents: 1_000,
                },
            ],
            &[],
        );

        let err = deliver(&p, &payload).await.unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientStock { requested: 3, available: 2, .. }));
        assert_eq!(err.status_class(), StatusClass::ServerError);

        let state = p.store.snapshot().await;
        assert!(state.orders.is_empty());
        assert!(state.order_items.is_empty());
        assert_eq!(state.products[&product].stock, Some(2));
        assert_eq!(state.products[&other].stock, Some(5), "earlier line rolled back too");
        assert!(state.payouts.is_empty());
        assert!(p.push.sent().is_empty());
    }

    // =========================================================================
    // Many sessions for the last units: stock never negative
    // =========================================================================
    #[tokio::test]
    async fn test_competing_sessions_never_oversell() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 200, Some(3)).await;

        let mut handles = vec![];
        for i in 0..6 {
            let payload = checkout_payload(
                &format!("cs_compete_{}", i),
                buyer,
                &[Line {
                    product_id: product,
                    seller_id: seller,
                    quantity: 1,
                    unit_price_cents: 200,
                }],
                &[],
            );
            let signature = sign_payload(
                TEST_WEBHOOK_SECRET,
                &payload,
                OffsetDateTime::now_utc().unix_timestamp(),
            );
            let handler = p.handler.clone();
            handles.push(tokio::spawn(async move {
                handler.handle(&payload, &signature).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        let state = p.store.snapshot().await;
        assert_eq!(succeeded, 3);
        assert_eq!(state.orders.len(), 3);
        assert_eq!(state.products[&product].stock, Some(0));
    }

    // =========================================================================
    // Reservation confirmed with its order
    // =========================================================================
    #[tokio::test]
    async fn test_pending_reservation_confirmed() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 800, Some(5)).await;
        p.store
            .add_reservation("cs_reserved", product, 2, OffsetDateTime::now_utc())
            .await;
        let payload = checkout_payload(
            "cs_reserved",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 2,
                unit_price_cents: 800,
            }],
            &[],
        );

        deliver(&p, &payload).await.unwrap();
        let state = p.store.snapshot().await;
        assert_eq!(
            state.reservations[0].status,
            crate::models::ReservationStatus::Confirmed
        );
    }
}

#[cfg(test)]
mod payout_tests {
    use super::*;
    use crate::models::PayoutStatus;
    use crate::payouts::NO_PAYOUT_ACCOUNT;

    // =========================================================================
    // 100.00 at 12%: 12.00 fee, 88.00 transferred
    // =========================================================================
    #[tokio::test]
    async fn test_free_tier_seller_paid_net_of_fee() {
        let p = pipeline();
        let (buyer, seller, product) = simple_shop(&p, 10_000, None).await;
        let payload = checkout_payload(
            "cs_fee",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 10_000,
            }],
            &[],
        );
        deliver(&p, &payload).await.unwrap();

        let transfers = p.gateway.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount_cents, 8_800);
        assert_eq!(transfers[0].destination, "acct_seller");
        assert_eq!(transfers[0].metadata["product_id"], product.to_string());
        assert_eq!(transfers[0].metadata["platform_fee_cents"], "1200");

        let state = p.store.snapshot().await;
        assert_eq!(state.payouts[0].status, PayoutStatus::Transferred);
        assert_eq!(state.payouts[0].transfer_reference.as_deref(), Some("tr_test_1"));
    }

    /// Free-tier seller with a phone, opted into SMS order updates
    async fn sms_seller(p: &Pipeline, account: &str) -> Uuid {
        let seller = Uuid::new_v4();
        p.store
            .add_user(UserContact {
                user_id: seller,
                display_name: "Sam".into(),
                email: Some("sam@example.com".into()),
                phone: Some("+4915100000000".into()),
            })
            .await;
        p.store
            .add_seller(
                SellerProfile {
                    user_id: seller,
                    tier: SellerTier::Free,
                    payout_account_id: Some(account.into()),
                    location: None,
                    subscription_id: None,
                    subscription_valid_until: None,
                },
                None,
            )
            .await;
        let mut prefs = NotificationPreferences::all_enabled(seller);
        prefs.sms.order_status = Some(true);
        p.store.set_preferences(prefs).await;
        seller
    }

    // =========================================================================
    // Seller opted into SMS with a phone: 6 cent surcharge
    // =========================================================================
    #[tokio::test]
    async fn test_sms_surcharge_deducted_for_opted_in_seller() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = sms_seller(&p, "acct_sam").await;
        let product = fixtures::product(&p.store, seller, 10_000, None).await;

        let payload = checkout_payload(
            "cs_sms",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 10_000,
            }],
            &[],
        );
        deliver(&p, &payload).await.unwrap();

        assert_eq!(p.gateway.transfers()[0].amount_cents, 8_794);
    }

    // =========================================================================
    // Tiny item listed first: surcharge moves to the large item, both settle
    // =========================================================================
    #[tokio::test]
    async fn test_surcharge_skips_item_too_small_to_cover_it() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = sms_seller(&p, "acct_sam").await;
        let sticker = fixtures::product(&p.store, seller, 5, None).await;
        let lamp = fixtures::product(&p.store, seller, 10_000, None).await;

        let payload = checkout_payload(
            "cs_sms_small_first",
            buyer,
            &[
                Line {
                    product_id: sticker,
                    seller_id: seller,
                    quantity: 1,
                    unit_price_cents: 5,
                },
                Line {
                    product_id: lamp,
                    seller_id: seller,
                    quantity: 1,
                    unit_price_cents: 10_000,
                },
            ],
            &[],
        );
        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Processed);

        let state = p.store.snapshot().await;
        assert_eq!(state.order_items.len(), 2);
        assert_eq!(state.transactions.len(), 2, "every item gets a ledger row");
        assert_eq!(state.payouts.len(), 2);
        assert_eq!(
            state.payouts.iter().map(|payout| payout.ancillary_cents).sum::<i64>(),
            6,
            "surcharge charged exactly once"
        );

        let mut amounts: Vec<i64> = p.gateway.transfers().iter().map(|t| t.amount_cents).collect();
        amounts.sort_unstable();
        // 5 - round(0.6) = 4; 10_000 - 1_200 - 6 = 8_794
        assert_eq!(amounts, vec![4, 8_794]);
    }

    // =========================================================================
    // Only item cannot absorb the surcharge: waived, item still paid
    // =========================================================================
    #[tokio::test]
    async fn test_surcharge_waived_when_no_item_covers_it() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = sms_seller(&p, "acct_sam").await;
        let sticker = fixtures::product(&p.store, seller, 5, None).await;

        let payload = checkout_payload(
            "cs_sms_tiny",
            buyer,
            &[Line {
                product_id: sticker,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 5,
            }],
            &[],
        );
        deliver(&p, &payload).await.unwrap();

        let state = p.store.snapshot().await;
        assert_eq!(state.transactions.len(), 1);
        assert_eq!(state.payouts.len(), 1);
        assert_eq!(state.payouts[0].ancillary_cents, 0);
        assert_eq!(state.payouts[0].net_cents, 4);
        assert_eq!(state.payouts[0].status, PayoutStatus::Transferred);
    }

    // =========================================================================
    // Transfer fails: order stands, payout marked failed, buyer still told
    // =========================================================================
    #[tokio::test]
    async fn test_transfer_failure_is_non_fatal() {
        let p = pipeline();
        p.gateway.set_fail_transfers(true);
        let (buyer, seller, product) = simple_shop(&p, 2_500, Some(1)).await;
        let payload = checkout_payload(
            "cs_transfer_fail",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 2_500,
            }],
            &[],
        );

        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Processed);

        let state = p.store.snapshot().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.payouts[0].status, PayoutStatus::Failed);
        assert!(state.payouts[0].failure_reason.is_some());
        assert!(p
            .push
            .sent()
            .iter()
            .any(|m| m.to == format!("private-user-{}", buyer)));
    }

    #[tokio::test]
    async fn test_seller_without_payout_account_is_marked_failed() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = fixtures::seller(&p.store, SellerTier::Pro, None, None).await;
        let product = fixtures::product(&p.store, seller, 1_000, None).await;
        let payload = checkout_payload(
            "cs_no_account",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_000,
            }],
            &[],
        );

        deliver(&p, &payload).await.unwrap();
        let state = p.store.snapshot().await;
        assert_eq!(state.payouts[0].platform_fee_cents, 80);
        assert_eq!(state.payouts[0].status, PayoutStatus::Failed);
        assert_eq!(state.payouts[0].failure_reason.as_deref(), Some(NO_PAYOUT_ACCOUNT));
        assert!(p.gateway.transfers().is_empty());
    }
}

#[cfg(test)]
mod delivery_tests {
    use super::*;

    const KM_PER_DEG_LAT: f64 = crate::matching::EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

    fn north(origin: GeoPoint, km: f64) -> GeoPoint {
        GeoPoint::new(origin.lat + km / KM_PER_DEG_LAT, origin.lng)
    }

    const CENTER: GeoPoint = GeoPoint {
        lat: 48.137,
        lng: 11.575,
    };

    // =========================================================================
    // Near courier gets the offer, far courier does not
    // =========================================================================
    #[tokio::test]
    async fn test_delivery_offered_to_couriers_in_range() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = fixtures::seller(&p.store, SellerTier::Free, Some("acct_s"), Some(north(CENTER, 2.0))).await;
        let product = fixtures::product(&p.store, seller, 1_500, Some(3)).await;
        let near = fixtures::agent(&p.store, CENTER, 5.0, Some("acct_near")).await;
        let far = fixtures::agent(&p.store, north(CENTER, 20.0), 5.0, None).await;

        let buyer_at = north(CENTER, -3.0);
        let lat = buyer_at.lat.to_string();
        let lng = buyer_at.lng.to_string();
        let payload = checkout_payload(
            "cs_delivery",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_500,
            }],
            &[
                ("delivery_mode", "delivery"),
                ("delivery_address", "Marienplatz 1"),
                ("buyer_lat", lat.as_str()),
                ("buyer_lng", lng.as_str()),
                ("delivery_fee_cents", "500"),
                ("estimated_minutes", "40"),
            ],
        );

        deliver(&p, &payload).await.unwrap();

        let state = p.store.snapshot().await;
        assert_eq!(state.delivery_orders.len(), 1);
        let delivery = &state.delivery_orders[0];
        assert_eq!(delivery.deliverer_id, None);
        assert_eq!(delivery.delivery_fee_cents, 500);
        assert_eq!(delivery.platform_fee_cents, 60);
        assert_eq!(delivery.deliverer_earnings_cents, 440);
        assert_eq!(delivery.estimated_minutes, Some(40));

        let pushed: Vec<String> = p.push.sent().into_iter().map(|m| m.to).collect();
        assert!(pushed.contains(&format!("private-user-{}", near)));
        assert!(!pushed.contains(&format!("private-user-{}", far)));
    }

    // =========================================================================
    // No buyer coordinates: delivery order exists, nobody is offered it
    // =========================================================================
    #[tokio::test]
    async fn test_missing_buyer_coordinates_skip_fan_out() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = fixtures::seller(&p.store, SellerTier::Free, None, Some(CENTER)).await;
        let product = fixtures::product(&p.store, seller, 1_500, None).await;
        let courier = fixtures::agent(&p.store, CENTER, 50.0, None).await;

        let payload = checkout_payload(
            "cs_no_coords",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_500,
            }],
            &[("delivery_mode", "delivery")],
        );

        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Processed);
        let state = p.store.snapshot().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.delivery_orders.len(), 1);
        assert!(!p
            .push
            .sent()
            .iter()
            .any(|m| m.to == format!("private-user-{}", courier)));
    }

    // =========================================================================
    // Delivered leg is settled once by the worker path
    // =========================================================================
    #[tokio::test]
    async fn test_completed_delivery_paid_to_courier_once() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller = fixtures::seller(&p.store, SellerTier::Free, None, Some(CENTER)).await;
        let product = fixtures::product(&p.store, seller, 1_500, None).await;
        let courier = fixtures::agent(&p.store, CENTER, 50.0, Some("acct_courier")).await;

        let payload = checkout_payload(
            "cs_settle",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 1,
                unit_price_cents: 1_500,
            }],
            &[("delivery_mode", "delivery"), ("delivery_fee_cents", "400")],
        );
        deliver(&p, &payload).await.unwrap();

        let delivery_id = p.store.snapshot().await.delivery_orders[0].id;
        p.store
            .set_delivery_status(
                delivery_id,
                crate::models::DeliveryOrderStatus::Delivered,
                Some(courier),
            )
            .await;

        let payouts = PayoutService::new(Arc::new(p.store.clone()), p.gateway.clone());
        assert_eq!(payouts.settle_completed_deliveries(10).await.unwrap(), 1);
        assert_eq!(payouts.settle_completed_deliveries(10).await.unwrap(), 0);

        let courier_transfers: Vec<_> = p
            .gateway
            .transfers()
            .into_iter()
            .filter(|t| t.destination == "acct_courier")
            .collect();
        assert_eq!(courier_transfers.len(), 1);
        assert_eq!(courier_transfers[0].amount_cents, 352);
    }
}

#[cfg(test)]
mod notification_tests {
    use super::*;
    use crate::notifications::NotificationKind;

    // =========================================================================
    // Email provider down: push still reaches buyer and seller
    // =========================================================================
    #[tokio::test]
    async fn test_email_outage_does_not_block_push() {
        let p = pipeline_with(RecordingChannel::failing());
        let (buyer, seller, product) = simple_shop(&p, 1_000, None).await;
        let payload = checkout_payload(
            "cs_email_down",
            buyer,
            &[Line {
                product_id: product,
                seller_id: seller,
                quantity: 2,
                unit_price_cents: 1_000,
            }],
            &[],
        );

        assert_eq!(deliver(&p, &payload).await.unwrap(), WebhookOutcome::Processed);

        let pushed: Vec<String> = p.push.sent().into_iter().map(|m| m.to).collect();
        assert!(pushed.contains(&format!("private-user-{}", buyer)));
        assert!(pushed.contains(&format!("private-user-{}", seller)));
        assert!(p.email.sent().is_empty());

        let state = p.store.snapshot().await;
        let seller_audit = state
            .notifications
            .iter()
            .find(|n| n.user_id == seller)
            .unwrap();
        assert_eq!(seller_audit.kind, NotificationKind::NewOrder);
        assert_eq!(seller_audit.order_id, Some(state.orders[0].id));
    }

    #[tokio::test]
    async fn test_one_conversation_per_seller() {
        let p = pipeline();
        let buyer = fixtures::user(&p.store, "Bea", None).await;
        let seller_a = fixtures::seller(&p.store, SellerTier::Free, None, None).await;
        let seller_b = fixtures::seller(&p.store, SellerTier::Free, None, None).await;
        let a1 = fixtures::product(&p.store, seller_a, 100, None).await;
        let a2 = fixtures::product(&p.store, seller_a, 200, None).await;
        let b1 = fixtures::product(&p.store, seller_b, 300, None).await;

        let line = |product_id, seller_id| Line {
            product_id,
            seller_id,
            quantity: 1,
            unit_price_cents: 100,
        };
        let payload = checkout_payload(
            "cs_multi",
            buyer,
            &[line(a1, seller_a), line(a2, seller_a), line(b1, seller_b)],
            &[],
        );
        deliver(&p, &payload).await.unwrap();

        let state = p.store.snapshot().await;
        assert_eq!(state.conversations.len(), 2);
        assert_eq!(state.review_tokens.len(), 3);
        assert_eq!(state.payouts.len(), 3);
    }
}
