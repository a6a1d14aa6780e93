//! Payment webhook handling
//!
//! Verifies Stripe-signed events and routes them: subscription lifecycle
//! events update seller linkage, completed checkouts run the settlement
//! pipeline. Only order creation can fail the event; everything after the
//! commit is logged and carried on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::client::{PaymentGateway, SubscriptionSnapshot};
use crate::error::{SettlementError, SettlementResult};
use crate::matching::{match_items, DeliveryCandidate};
use crate::models::{DeliveryMode, GeoPoint, NewDeliveryOrder, NewOrderConversation, OrderItem};
use crate::notifications::{templates, NotificationDispatcher};
use crate::orders::{display_order_number, CreatedOrder, OrderRequest, OrderTransactionManager, PurchasedItem};
use crate::payouts::{split_delivery_fee, DeliveryFeeBreakdown, PayoutService};
use crate::review_tokens::ReviewTokenService;
use crate::store::MarketStore;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Name of the signature header Stripe sends
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Event envelope as delivered by Stripe
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    CheckoutCompleted,
    Other,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            _ => EventKind::Other,
        }
    }
}

/// What happened to an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// The checkout session already has an order
    Duplicate,
    /// Valid but nothing to do (unhandled type, unpaid session, unknown seller)
    Ignored,
}

/// A string id or an expanded object carrying one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) | ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: ExpandableId,
    status: String,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    items: SubscriptionItems,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItemObject {
    #[serde(default)]
    price: Option<PriceObject>,
    /// Newer API versions moved the period onto items
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
    #[serde(default)]
    nickname: Option<String>,
}

impl SubscriptionObject {
    fn into_snapshot(self) -> SubscriptionSnapshot {
        let first = self.items.data.into_iter().next();
        let period_end = self
            .current_period_end
            .or_else(|| first.as_ref().and_then(|i| i.current_period_end));
        let price = first.and_then(|i| i.price);
        let plan_name = self
            .metadata
            .get("plan")
            .cloned()
            .or_else(|| price.as_ref().and_then(|p| p.nickname.clone()));

        SubscriptionSnapshot {
            id: self.id,
            customer: self.customer.id().to_string(),
            status: self.status,
            seller_id: self.metadata.get("seller_id").and_then(|id| id.parse().ok()),
            current_period_end: period_end,
            price_id: price.map(|p| p.id),
            plan_name,
        }
    }
}

/// The checkout session fields the pipeline reads
#[derive(Debug, Clone, Deserialize)]
struct CheckoutSession {
    id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    payment_intent: Option<ExpandableId>,
    #[serde(default)]
    subscription: Option<ExpandableId>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Everything the checkout metadata tells us about an order
#[derive(Debug, Clone)]
pub struct CheckoutOrder {
    pub request: OrderRequest,
    pub buyer_location: Option<GeoPoint>,
    pub delivery_fee_cents: i64,
    pub delivery_fee_breakdown: Option<DeliveryFeeBreakdown>,
    pub estimated_minutes: Option<i32>,
}

fn meta<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn meta_parsed<T: std::str::FromStr>(metadata: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = meta(metadata, key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = key, value = raw, "Ignoring unparseable checkout metadata");
            None
        }
    }
}

fn parse_scheduled_date(raw: &str) -> Option<Date> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    // Accept full timestamps too; only the date part matters
    let date_part = raw.get(..10).unwrap_or(raw);
    match Date::parse(date_part, &format) {
        Ok(date) => Some(date),
        Err(_) => {
            tracing::warn!(value = raw, "Ignoring unparseable scheduled_date");
            None
        }
    }
}

/// Read the order out of checkout session metadata.
///
/// `buyer_id` and a non-empty `items` list are required; malformed optional
/// fields are dropped with a warning.
pub fn checkout_order(
    session_id: &str,
    amount_total: Option<i64>,
    metadata: &HashMap<String, String>,
) -> SettlementResult<CheckoutOrder> {
    let buyer_id: Uuid = meta(metadata, "buyer_id")
        .ok_or_else(|| SettlementError::InvalidPayload("metadata.buyer_id missing".to_string()))?
        .parse()
        .map_err(|_| SettlementError::InvalidPayload("metadata.buyer_id is not a uuid".to_string()))?;

    let items_json = meta(metadata, "items")
        .ok_or_else(|| SettlementError::InvalidPayload("metadata.items missing".to_string()))?;
    let items: Vec<PurchasedItem> = serde_json::from_str(items_json)?;
    if items.is_empty() {
        return Err(SettlementError::InvalidPayload(
            "metadata.items is empty".to_string(),
        ));
    }

    let delivery_mode = match meta(metadata, "delivery_mode") {
        Some(raw) => DeliveryMode::parse(raw).map_err(|_| {
            SettlementError::InvalidPayload(format!("unknown delivery_mode: {}", raw))
        })?,
        None => DeliveryMode::Pickup,
    };

    let delivery_fee_breakdown = meta(metadata, "delivery_fee_breakdown").and_then(|raw| {
        serde_json::from_str::<DeliveryFeeBreakdown>(raw)
            .map_err(|e| {
                tracing::warn!(error = %e, "Ignoring malformed delivery_fee_breakdown");
            })
            .ok()
    });

    Ok(CheckoutOrder {
        request: OrderRequest {
            buyer_id,
            payment_session_id: session_id.to_string(),
            items,
            total_cents: amount_total,
            delivery_mode,
            pickup_address: meta(metadata, "pickup_address").map(str::to_string),
            delivery_address: meta(metadata, "delivery_address").map(str::to_string),
            scheduled_date: meta(metadata, "scheduled_date").and_then(parse_scheduled_date),
            notes: meta(metadata, "notes").map(str::to_string),
        },
        buyer_location: GeoPoint::from_parts(
            meta_parsed(metadata, "buyer_lat"),
            meta_parsed(metadata, "buyer_lng"),
        ),
        delivery_fee_cents: meta_parsed(metadata, "delivery_fee_cents").unwrap_or(0),
        delivery_fee_breakdown,
        estimated_minutes: meta_parsed(metadata, "estimated_minutes"),
    })
}

/// Verify a `t=<unix>,v1=<hex>` signature header against `payload`.
///
/// Any one matching `v1` entry is accepted, compared in constant time.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> SettlementResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        SettlementError::WebhookSignatureInvalid
    })?;
    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(SettlementError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > tolerance_secs {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(SettlementError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        SettlementError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());

    let matched = candidates
        .iter()
        .any(|candidate| bool::from(computed.as_bytes().ct_eq(candidate.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(SettlementError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Routes verified payment events through the settlement pipeline
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn PaymentGateway>,
    orders: OrderTransactionManager,
    payouts: PayoutService,
    subscriptions: SubscriptionService,
    review_tokens: ReviewTokenService,
    dispatcher: NotificationDispatcher,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn PaymentGateway>,
        payouts: PayoutService,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            orders: OrderTransactionManager::new(store.clone()),
            subscriptions: SubscriptionService::new(store.clone(), gateway.clone()),
            review_tokens: ReviewTokenService::new(store.clone()),
            store,
            gateway,
            payouts,
            dispatcher,
        }
    }

    /// Verify the signature and parse the event envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> SettlementResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> SettlementResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            self.gateway.webhook_secret(),
            now,
            self.gateway.webhook_tolerance_secs(),
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            SettlementError::MalformedEvent(e.to_string())
        })?;

        Ok(event)
    }

    /// Verify then process a raw webhook delivery
    pub async fn handle(&self, payload: &[u8], signature: &str) -> SettlementResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(&event).await
    }

    pub async fn handle_event(&self, event: &WebhookEvent) -> SettlementResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing payment webhook event"
        );

        let outcome = match event.kind() {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription(event, false).await?
            }
            EventKind::SubscriptionDeleted => self.handle_subscription(event, true).await?,
            EventKind::CheckoutCompleted => self.handle_checkout_completed(event).await?,
            EventKind::Other => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled webhook event type"
                );
                WebhookOutcome::Ignored
            }
        };

        tracing::info!(
            event_id = %event.id,
            outcome = ?outcome,
            "Webhook event handled"
        );
        Ok(outcome)
    }

    async fn handle_subscription(
        &self,
        event: &WebhookEvent,
        deleted: bool,
    ) -> SettlementResult<WebhookOutcome> {
        let object: SubscriptionObject = serde_json::from_value(event.data.object.clone())?;
        let snapshot = object.into_snapshot();
        Ok(match self.subscriptions.apply(&snapshot, deleted).await? {
            Some(_) => WebhookOutcome::Processed,
            None => WebhookOutcome::Ignored,
        })
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> SettlementResult<WebhookOutcome> {
        let session: CheckoutSession = serde_json::from_value(event.data.object.clone())?;

        if session.mode.as_deref() == Some("subscription") {
            let subscription_id = session
                .subscription
                .as_ref()
                .map(|s| s.id().to_string())
                .unwrap_or_default();
            return Ok(match self.subscriptions.sync_by_id(&subscription_id).await? {
                Some(_) => WebhookOutcome::Processed,
                None => WebhookOutcome::Ignored,
            });
        }

        if session.payment_status.as_deref() == Some("unpaid") {
            tracing::info!(
                session_id = %session.id,
                "Checkout session not paid yet, waiting for async payment"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        if let Some(existing) = self.store.find_order_by_session(&session.id).await? {
            tracing::info!(
                session_id = %session.id,
                order_id = %existing.id,
                "Order already exists for checkout session, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let checkout = checkout_order(&session.id, session.amount_total, &session.metadata)?;

        let created = match self.orders.create_order(&checkout.request).await {
            Ok(created) => created,
            Err(SettlementError::DuplicateOrder(_)) => {
                tracing::info!(
                    session_id = %session.id,
                    "Concurrent delivery created the order first"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "Order creation failed, gateway will retry"
                );
                return Err(e);
            }
        };

        let provider_reference = session
            .payment_intent
            .as_ref()
            .map(|p| p.id().to_string())
            .unwrap_or_else(|| session.id.clone());

        self.after_commit(&created, &checkout, &provider_reference).await;
        Ok(WebhookOutcome::Processed)
    }

    /// Post-commit steps; each failure is logged and the rest still run
    async fn after_commit(&self, created: &CreatedOrder, checkout: &CheckoutOrder, provider_reference: &str) {
        let order = &created.order;

        if let Err(e) = self
            .review_tokens
            .issue_for_items(order.buyer_id, &created.items)
            .await
        {
            tracing::error!(order_id = %order.id, error = %e, "Failed to create review tokens");
        }

        self.open_conversations(created).await;

        if order.delivery_mode == DeliveryMode::Delivery {
            if let Err(e) = self.dispatch_deliveries(created, checkout).await {
                tracing::error!(order_id = %order.id, error = %e, "Delivery dispatch failed");
            }
        }

        let payouts = self
            .payouts
            .settle_order_sellers(order, &created.items, provider_reference)
            .await;
        tracing::info!(
            order_id = %order.id,
            payouts = payouts.len(),
            "Seller payouts recorded"
        );

        self.notify_parties(created).await;
    }

    async fn open_conversations(&self, created: &CreatedOrder) {
        let order = &created.order;
        let opening_message = format!(
            "Order {} was placed. Use this conversation to arrange pickup or delivery.",
            display_order_number(&order.order_number)
        );

        for seller_id in sellers_in(&created.items).into_keys() {
            if let Err(e) = self
                .store
                .open_order_conversation(NewOrderConversation {
                    order_id: order.id,
                    buyer_id: order.buyer_id,
                    seller_id,
                    opening_message: opening_message.clone(),
                })
                .await
            {
                tracing::error!(
                    order_id = %order.id,
                    seller_id = %seller_id,
                    error = %e,
                    "Failed to open order conversation"
                );
            }
        }
    }

    /// Create one delivery order per product and offer each to every
    /// eligible courier. Returns the number of offers sent.
    async fn dispatch_deliveries(
        &self,
        created: &CreatedOrder,
        checkout: &CheckoutOrder,
    ) -> SettlementResult<usize> {
        let order = &created.order;

        let mut products: Vec<&OrderItem> = Vec::new();
        for item in &created.items {
            if !products.iter().any(|p| p.product_id == item.product_id) {
                products.push(item);
            }
        }

        let splits = split_delivery_fee(
            checkout.delivery_fee_cents,
            checkout.delivery_fee_breakdown.as_ref(),
            products.len(),
        )?;

        let mut candidates = Vec::with_capacity(products.len());
        let mut deliveries = HashMap::new();
        for (item, split) in products.iter().zip(&splits) {
            let delivery = self
                .store
                .insert_delivery_order(NewDeliveryOrder {
                    order_id: order.id,
                    product_id: item.product_id,
                    seller_id: item.seller_id,
                    delivery_fee_cents: split.delivery_fee_cents,
                    platform_fee_cents: split.platform_fee_cents,
                    deliverer_earnings_cents: split.net_cents,
                    estimated_minutes: checkout.estimated_minutes,
                })
                .await?;

            let seller_location = self
                .store
                .seller_profile(item.seller_id)
                .await?
                .and_then(|p| p.location);
            candidates.push(DeliveryCandidate {
                product_id: item.product_id,
                seller_id: item.seller_id,
                seller_location,
            });
            deliveries.insert(item.product_id, delivery);
        }

        let agents = self.store.active_delivery_agents().await?;
        let matches = match_items(&agents, checkout.buyer_location, &candidates);

        let mut offers = Vec::new();
        for matched in &matches {
            let Some(delivery) = deliveries.get(&matched.product_id) else {
                continue;
            };
            let product_name = self
                .store
                .product(matched.product_id)
                .await?
                .map(|p| p.name)
                .unwrap_or_else(|| "An order".to_string());
            let event = templates::delivery_available(
                order.id,
                &order.order_number,
                delivery.id,
                &product_name,
                delivery.deliverer_earnings_cents,
            );
            for agent_id in &matched.agent_ids {
                offers.push((*agent_id, event.clone()));
            }
        }

        let results = join_all(
            offers
                .iter()
                .map(|(agent_id, event)| self.dispatcher.notify(*agent_id, event)),
        )
        .await;

        let mut sent = 0;
        for ((agent_id, _), result) in offers.iter().zip(results) {
            match result {
                Ok(_) => sent += 1,
                Err(e) => tracing::error!(
                    order_id = %order.id,
                    agent_id = %agent_id,
                    error = %e,
                    "Failed to offer delivery"
                ),
            }
        }

        tracing::info!(
            order_id = %order.id,
            delivery_orders = deliveries.len(),
            offers = sent,
            "Delivery orders created and offered"
        );
        Ok(sent)
    }

    async fn notify_parties(&self, created: &CreatedOrder) {
        let order = &created.order;

        let buyer_name = match self.store.user_contact(order.buyer_id).await {
            Ok(Some(contact)) => contact.display_name,
            Ok(None) => "A buyer".to_string(),
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Failed to load buyer contact");
                "A buyer".to_string()
            }
        };

        let buyer_event = templates::order_paid(order.id, &order.order_number, order.total_cents);
        if let Err(e) = self.dispatcher.notify(order.buyer_id, &buyer_event).await {
            tracing::error!(order_id = %order.id, error = %e, "Failed to notify buyer");
        }

        for (seller_id, (count, total)) in sellers_in(&created.items) {
            let event =
                templates::new_order(order.id, &order.order_number, &buyer_name, count, total);
            if let Err(e) = self.dispatcher.notify(seller_id, &event).await {
                tracing::error!(
                    order_id = %order.id,
                    seller_id = %seller_id,
                    error = %e,
                    "Failed to notify seller"
                );
            }
        }
    }
}

/// seller id -> (item count, gross total), in a stable order
fn sellers_in(items: &[OrderItem]) -> BTreeMap<Uuid, (usize, i64)> {
    let mut sellers = BTreeMap::new();
    for item in items {
        let entry = sellers.entry(item.seller_id).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += item.gross_cents();
    }
    sellers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sign_payload, TEST_WEBHOOK_SECRET};

    const NOW: i64 = 1_750_000_000;

    #[test]
    fn test_valid_signature_passes() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW);
        assert!(verify_signature(payload, &header, TEST_WEBHOOK_SECRET, NOW, 300).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let header = sign_payload(TEST_WEBHOOK_SECRET, br#"{"amount":100}"#, NOW);
        let err = verify_signature(br#"{"amount":999}"#, &header, TEST_WEBHOOK_SECRET, NOW, 300)
            .unwrap_err();
        assert!(matches!(err, SettlementError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let payload = b"{}";
        let header = sign_payload("whsec_other", payload, NOW);
        assert!(verify_signature(payload, &header, TEST_WEBHOOK_SECRET, NOW, 300).is_err());
    }

    #[test]
    fn test_stale_timestamp_fails() {
        let payload = b"{}";
        let header = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW - 301);
        assert!(verify_signature(payload, &header, TEST_WEBHOOK_SECRET, NOW, 300).is_err());
        let header = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW - 299);
        assert!(verify_signature(payload, &header, TEST_WEBHOOK_SECRET, NOW, 300).is_ok());
    }

    #[test]
    fn test_malformed_headers_fail() {
        let payload = b"{}";
        for header in ["", "v1=abc", "t=123", "t=abc,v1=def", "garbage"] {
            assert!(
                verify_signature(payload, header, TEST_WEBHOOK_SECRET, NOW, 300).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_any_matching_v1_is_accepted() {
        let payload = b"{}";
        let good = sign_payload(TEST_WEBHOOK_SECRET, payload, NOW);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1=deadbeef,v1={}", NOW, good_sig);
        assert!(verify_signature(payload, &header, TEST_WEBHOOK_SECRET, NOW, 300).is_ok());
    }

    #[test]
    fn test_event_kind_classification() {
        assert_eq!(
            EventKind::from_type("checkout.session.completed"),
            EventKind::CheckoutCompleted
        );
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::Other);
    }

    fn metadata(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_checkout_order_from_metadata() {
        let buyer = Uuid::new_v4();
        let product = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let items = serde_json::json!([{
            "product_id": product,
            "quantity": 2,
            "unit_price_cents": 450,
            "seller_id": seller
        }])
        .to_string();
        let buyer_str = buyer.to_string();
        let meta = metadata(&[
            ("buyer_id", buyer_str.as_str()),
            ("items", items.as_str()),
            ("delivery_mode", "delivery"),
            ("delivery_address", "Hauptstr. 1"),
            ("scheduled_date", "2025-06-01T10:00:00Z"),
            ("buyer_lat", "52.5"),
            ("buyer_lng", "13.4"),
            ("delivery_fee_cents", "500"),
            ("delivery_fee_breakdown", "not json"),
            ("estimated_minutes", "35"),
        ]);

        let checkout = checkout_order("cs_1", Some(1400), &meta).unwrap();
        assert_eq!(checkout.request.buyer_id, buyer);
        assert_eq!(checkout.request.items.len(), 1);
        assert_eq!(checkout.request.delivery_mode, DeliveryMode::Delivery);
        assert_eq!(checkout.request.total_cents, Some(1400));
        assert_eq!(
            checkout.request.scheduled_date,
            Some(time::macros::date!(2025 - 06 - 01))
        );
        assert_eq!(checkout.buyer_location, Some(GeoPoint::new(52.5, 13.4)));
        assert_eq!(checkout.delivery_fee_cents, 500);
        assert_eq!(checkout.delivery_fee_breakdown, None);
        assert_eq!(checkout.estimated_minutes, Some(35));
    }

    #[test]
    fn test_checkout_order_requires_buyer_and_items() {
        let err = checkout_order("cs_1", None, &metadata(&[("items", "[]")])).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));

        let buyer = Uuid::new_v4().to_string();
        let err = checkout_order(
            "cs_1",
            None,
            &metadata(&[("buyer_id", buyer.as_str()), ("items", "[]")]),
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));

        let err = checkout_order(
            "cs_1",
            None,
            &metadata(&[("buyer_id", buyer.as_str()), ("items", "{oops")]),
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));
    }

    #[test]
    fn test_subscription_object_snapshot() {
        let seller = Uuid::new_v4();
        let object: SubscriptionObject = serde_json::from_value(serde_json::json!({
            "id": "sub_9",
            "customer": {"id": "cus_9", "object": "customer"},
            "status": "active",
            "metadata": {"seller_id": seller.to_string()},
            "items": {"data": [{
                "current_period_end": 1_800_000_000,
                "price": {"id": "price_pro", "nickname": "Pro Monthly"}
            }]}
        }))
        .unwrap();

        let snapshot = object.into_snapshot();
        assert_eq!(snapshot.customer, "cus_9");
        assert_eq!(snapshot.seller_id, Some(seller));
        assert_eq!(snapshot.current_period_end, Some(1_800_000_000));
        assert_eq!(snapshot.price_id.as_deref(), Some("price_pro"));
        assert_eq!(snapshot.plan_name.as_deref(), Some("Pro Monthly"));
    }
}
