//! Seller subscription linkage
//!
//! Subscription webhooks and subscription-mode checkouts land here. The
//! seller's tier, external subscription id and validity are written back to
//! the seller profile.

use std::sync::Arc;

use market_shared::SellerTier;
use time::OffsetDateTime;

use crate::client::{PaymentGateway, SubscriptionSnapshot};
use crate::error::{SettlementError, SettlementResult};
use crate::models::SubscriptionLink;
use crate::store::MarketStore;

/// Statuses after which the seller no longer has a paid plan
const ENDED_STATUSES: &[&str] = &["canceled", "incomplete_expired", "unpaid"];

/// Map a free-form plan name ("Pro Monthly", "starter-plan") to a tier.
///
/// Unknown names map to Free.
pub fn normalize_plan_name(raw: &str) -> SellerTier {
    let lowered = raw.to_lowercase();
    let tokens = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty());

    let mut tier = SellerTier::Free;
    for token in tokens {
        match token {
            "pro" | "professional" | "premium" => return SellerTier::Pro,
            "starter" | "basic" => tier = SellerTier::Starter,
            _ => {}
        }
    }
    tier
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn MarketStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    fn tier_for(&self, snapshot: &SubscriptionSnapshot) -> SellerTier {
        snapshot
            .price_id
            .as_deref()
            .and_then(|price| self.gateway.tier_for_price_id(price))
            .or_else(|| snapshot.plan_name.as_deref().map(normalize_plan_name))
            .unwrap_or_default()
    }

    /// Build the linkage a snapshot implies; `deleted` marks a deletion event
    pub fn link_for(
        &self,
        seller_id: uuid::Uuid,
        snapshot: &SubscriptionSnapshot,
        deleted: bool,
    ) -> SubscriptionLink {
        let ended = deleted || ENDED_STATUSES.contains(&snapshot.status.as_str());
        let valid_until = snapshot
            .current_period_end
            .and_then(|end| OffsetDateTime::from_unix_timestamp(end).ok());

        SubscriptionLink {
            seller_id,
            tier: if ended {
                SellerTier::Free
            } else {
                self.tier_for(snapshot)
            },
            subscription_id: if deleted {
                None
            } else {
                Some(snapshot.id.clone())
            },
            status: snapshot.status.clone(),
            valid_until,
        }
    }

    /// Apply a subscription snapshot to its seller.
    ///
    /// The seller comes from the subscription metadata, falling back to the
    /// gateway customer id. Returns `None` when neither resolves.
    pub async fn apply(
        &self,
        snapshot: &SubscriptionSnapshot,
        deleted: bool,
    ) -> SettlementResult<Option<SubscriptionLink>> {
        let seller_id = match snapshot.seller_id {
            Some(id) => Some(id),
            None => self.store.seller_id_for_customer(&snapshot.customer).await?,
        };
        let Some(seller_id) = seller_id else {
            tracing::warn!(
                customer = %snapshot.customer,
                subscription = %snapshot.id,
                "No seller linked to customer, ignoring subscription event"
            );
            return Ok(None);
        };

        let link = self.link_for(seller_id, snapshot, deleted);
        self.store.update_seller_subscription(&link).await?;

        tracing::info!(
            seller_id = %seller_id,
            subscription = %snapshot.id,
            tier = %link.tier,
            status = %link.status,
            "Seller subscription synced"
        );
        Ok(Some(link))
    }

    /// Fetch a subscription from the gateway and apply it
    pub async fn sync_by_id(&self, subscription_id: &str) -> SettlementResult<Option<SubscriptionLink>> {
        if subscription_id.is_empty() {
            return Err(SettlementError::InvalidPayload(
                "checkout session has no subscription".to_string(),
            ));
        }
        let snapshot = self.gateway.retrieve_subscription(subscription_id).await?;
        self.apply(&snapshot, false).await
    }
}
