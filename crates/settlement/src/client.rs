//! Payment gateway configuration and client
//!
//! `PaymentGateway` is the seam the pipeline talks to. `StripeGateway` is the
//! production implementation on top of async-stripe.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use market_shared::SellerTier;
use serde::{Deserialize, Serialize};
use stripe::{
    CreateTransfer, Currency, Expandable, RequestStrategy, Subscription, SubscriptionId, Transfer,
};

use crate::error::{SettlementError, SettlementResult};

/// Maximum age of a webhook signature timestamp
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Price ids that identify paid seller plans
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub starter: Option<String>,
    pub pro: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// ISO currency code used for transfers, lowercase
    pub currency: String,
    pub price_ids: PriceIds,
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub fn from_env() -> SettlementResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| SettlementError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| SettlementError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let currency = std::env::var("PAYOUT_CURRENCY")
            .map(|c| c.to_lowercase())
            .unwrap_or_else(|_| "eur".to_string());
        let webhook_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                SettlementError::Config(format!("WEBHOOK_TOLERANCE_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            currency,
            price_ids: PriceIds {
                starter: std::env::var("STRIPE_PRICE_STARTER").ok(),
                pro: std::env::var("STRIPE_PRICE_PRO").ok(),
            },
            webhook_tolerance_secs,
        })
    }

    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SellerTier> {
        if self.price_ids.pro.as_deref() == Some(price_id) {
            Some(SellerTier::Pro)
        } else if self.price_ids.starter.as_deref() == Some(price_id) {
            Some(SellerTier::Starter)
        } else {
            None
        }
    }

    fn stripe_currency(&self) -> Currency {
        match self.currency.as_str() {
            "usd" => Currency::USD,
            "gbp" => Currency::GBP,
            _ => Currency::EUR,
        }
    }
}

/// Stripe API client plus its configuration
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> SettlementResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// The parts of a subscription the settlement pipeline needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer: String,
    pub status: String,
    /// `metadata.seller_id`, preferred over the customer lookup
    #[serde(default)]
    pub seller_id: Option<uuid::Uuid>,
    /// Unix seconds; absent on some subscription payloads
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub price_id: Option<String>,
    /// Price nickname or plan metadata, whichever is present
    #[serde(default)]
    pub plan_name: Option<String>,
}

/// A connected-account transfer for one payout
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Also used as the idempotency key
    pub payout_id: uuid::Uuid,
    pub amount_cents: i64,
    pub destination: String,
    pub transfer_group: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn webhook_secret(&self) -> &str;

    fn webhook_tolerance_secs(&self) -> i64 {
        DEFAULT_WEBHOOK_TOLERANCE_SECS
    }

    /// Map a price id to a paid tier, if it is one of ours
    fn tier_for_price_id(&self, price_id: &str) -> Option<SellerTier>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> SettlementResult<SubscriptionSnapshot>;

    /// Create the transfer; returns the gateway's transfer reference
    async fn create_transfer(&self, request: &TransferRequest) -> SettlementResult<String>;
}

/// `PaymentGateway` backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn from_env() -> SettlementResult<Self> {
        Ok(Self::new(StripeClient::from_env()?))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn webhook_secret(&self) -> &str {
        &self.stripe.config().webhook_secret
    }

    fn webhook_tolerance_secs(&self) -> i64 {
        self.stripe.config().webhook_tolerance_secs
    }

    fn tier_for_price_id(&self, price_id: &str) -> Option<SellerTier> {
        self.stripe.config().tier_for_price_id(price_id)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> SettlementResult<SubscriptionSnapshot> {
        let sub_id: SubscriptionId = subscription_id
            .parse()
            .map_err(|_| SettlementError::InvalidPayload(format!(
                "Invalid subscription id: {}",
                subscription_id
            )))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let customer = match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        };
        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref());
        let plan_name = subscription
            .metadata
            .get("plan")
            .cloned()
            .or_else(|| price.and_then(|p| p.nickname.clone()));

        Ok(SubscriptionSnapshot {
            id: subscription.id.to_string(),
            customer,
            status: subscription.status.as_str().to_string(),
            seller_id: subscription
                .metadata
                .get("seller_id")
                .and_then(|id| id.parse().ok()),
            current_period_end: Some(subscription.current_period_end),
            price_id: price.map(|p| p.id.to_string()),
            plan_name,
        })
    }

    async fn create_transfer(&self, request: &TransferRequest) -> SettlementResult<String> {
        let config = self.stripe.config();

        let mut params = CreateTransfer::new(config.stripe_currency(), request.destination.clone());
        params.amount = Some(request.amount_cents);
        params.transfer_group = Some(&request.transfer_group);
        params.metadata = Some(
            request
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<String, String>>(),
        );

        // Retries of the same payout must not move money twice
        let client = self
            .stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.payout_id.to_string()));

        let transfer = Transfer::create(&client, params).await?;

        tracing::info!(
            payout_id = %request.payout_id,
            transfer_id = %transfer.id,
            amount_cents = request.amount_cents,
            "Created payout transfer"
        );

        Ok(transfer.id.to_string())
    }
}
