//! Test doubles and fixtures
//!
//! Available to this crate's tests and, behind the `test-utils` feature, to
//! other workspace crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use market_shared::SellerTier;
use sha2::Sha256;

use crate::client::{PaymentGateway, SubscriptionSnapshot, TransferRequest};
use crate::error::{SettlementError, SettlementResult};
use crate::notifications::channels::{EmailClient, PushBroker, SmsClient};

type HmacSha256 = Hmac<Sha256>;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Build a `Stripe-Signature` header value for `payload` at `timestamp`
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let signature = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(&signed);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };
    format!("t={},v1={}", timestamp, signature)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Gateway that records transfers instead of moving money
pub struct RecordingGateway {
    webhook_secret: String,
    fail_transfers: AtomicBool,
    transfers: Mutex<Vec<TransferRequest>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    price_tiers: HashMap<String, SellerTier>,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new(TEST_WEBHOOK_SECRET)
    }
}

impl RecordingGateway {
    pub fn new(webhook_secret: &str) -> Self {
        let price_tiers = HashMap::from([
            ("price_starter".to_string(), SellerTier::Starter),
            ("price_pro".to_string(), SellerTier::Pro),
        ]);
        Self {
            webhook_secret: webhook_secret.to_string(),
            fail_transfers: AtomicBool::new(false),
            transfers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            price_tiers,
        }
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    pub fn add_subscription(&self, snapshot: SubscriptionSnapshot) {
        lock(&self.subscriptions).insert(snapshot.id.clone(), snapshot);
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        lock(&self.transfers).clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    fn tier_for_price_id(&self, price_id: &str) -> Option<SellerTier> {
        self.price_tiers.get(price_id).copied()
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> SettlementResult<SubscriptionSnapshot> {
        lock(&self.subscriptions)
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| SettlementError::Gateway(format!("No such subscription: {}", subscription_id)))
    }

    async fn create_transfer(&self, request: &TransferRequest) -> SettlementResult<String> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(SettlementError::Gateway(
                "destination account cannot receive transfers".to_string(),
            ));
        }
        let mut transfers = lock(&self.transfers);
        transfers.push(request.clone());
        Ok(format!("tr_test_{}", transfers.len()))
    }
}

/// One captured channel send
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Push channel, email address or phone number
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Channel double implementing push, email and SMS
#[derive(Default)]
pub struct RecordingChannel {
    failing: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let channel = Self::default();
        channel.set_failing(true);
        channel
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    fn record(&self, to: &str, subject: Option<&str>, body: &str) -> SettlementResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SettlementError::Channel("provider unavailable".to_string()));
        }
        lock(&self.sent).push(SentMessage {
            to: to.to_string(),
            subject: subject.map(str::to_string),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl PushBroker for RecordingChannel {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> SettlementResult<()> {
        self.record(channel, Some(event), &payload.to_string())
    }
}

#[async_trait]
impl EmailClient for RecordingChannel {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> SettlementResult<()> {
        self.record(to, Some(subject), html_body)
    }
}

#[async_trait]
impl SmsClient for RecordingChannel {
    async fn send(&self, to_phone: &str, body: &str) -> SettlementResult<()> {
        self.record(to_phone, None, body)
    }
}

/// Seed helpers for the in-memory store
pub mod fixtures {
    use uuid::Uuid;

    use crate::models::{DeliveryAgent, GeoPoint, Product, SellerProfile, UserContact};
    use crate::store::MemoryStore;
    use market_shared::SellerTier;

    pub async fn user(store: &MemoryStore, name: &str, phone: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        store
            .add_user(UserContact {
                user_id: id,
                display_name: name.to_string(),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                phone: phone.map(str::to_string),
            })
            .await;
        id
    }

    pub async fn seller(
        store: &MemoryStore,
        tier: SellerTier,
        payout_account: Option<&str>,
        location: Option<GeoPoint>,
    ) -> Uuid {
        let id = user(store, "Seller", None).await;
        store
            .add_seller(
                SellerProfile {
                    user_id: id,
                    tier,
                    payout_account_id: payout_account.map(str::to_string),
                    location,
                    subscription_id: None,
                    subscription_valid_until: None,
                },
                None,
            )
            .await;
        id
    }

    pub async fn product(
        store: &MemoryStore,
        seller_id: Uuid,
        price_cents: i64,
        stock: Option<i32>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        store
            .add_product(Product {
                id,
                seller_id,
                name: "Wildflower honey".to_string(),
                price_cents,
                stock,
            })
            .await;
        id
    }

    pub async fn agent(
        store: &MemoryStore,
        location: GeoPoint,
        max_distance_km: f64,
        payout_account: Option<&str>,
    ) -> Uuid {
        let id = user(store, "Courier", None).await;
        store
            .add_delivery_agent(
                DeliveryAgent {
                    user_id: id,
                    location,
                    max_distance_km,
                    is_active: true,
                    location_enabled: true,
                },
                payout_account,
            )
            .await;
        id
    }
}
