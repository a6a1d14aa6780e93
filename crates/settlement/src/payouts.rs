//! Payout calculation and transfer
//!
//! Amounts are integer minor units. Fees are basis points rounded half-up.
//! A net payout is computed and validated before any row is written, so it
//! is never negative.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use market_shared::SellerTier;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{PaymentGateway, TransferRequest};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    DeliveryOrder, NewLedgerTransaction, NewPayout, Order, OrderItem, Payout, PayoutStatus,
    RecipientKind, SellerProfile, TransactionKind,
};
use crate::notifications::preferences::PreferenceKey;
use crate::store::MarketStore;

/// Fee on delivery legs, independent of seller tier
pub const DELIVERY_PLATFORM_FEE_BPS: u32 = 1200;

/// Failed payouts are retried until they have this many attempts
pub const MAX_PAYOUT_ATTEMPTS: i32 = 5;

pub const NO_PAYOUT_ACCOUNT: &str = "no connected payout account";

/// `amount * bps / 10_000`, rounded half-up
pub fn round_bps(amount_cents: i64, bps: u32) -> i64 {
    (amount_cents * i64::from(bps) + 5_000) / 10_000
}

/// Per-order cost of SMS updates, deducted from the seller's payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmsSurcharge {
    pub base_cents: i64,
    pub markup_bps: u32,
}

impl Default for SmsSurcharge {
    fn default() -> Self {
        Self {
            base_cents: 5,
            markup_bps: 2_000,
        }
    }
}

impl SmsSurcharge {
    /// Reads SMS_BASE_COST_CENTS and SMS_MARKUP_BPS
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_cents: std::env::var("SMS_BASE_COST_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.base_cents),
            markup_bps: std::env::var("SMS_MARKUP_BPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.markup_bps),
        }
    }

    pub fn total_cents(&self) -> i64 {
        self.base_cents + round_bps(self.base_cents, self.markup_bps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SellerPayoutBreakdown {
    pub gross_cents: i64,
    pub platform_fee_bps: u32,
    pub platform_fee_cents: i64,
    pub ancillary_cents: i64,
    pub net_cents: i64,
}

/// Seller share of one line item.
///
/// Fails when the fee plus surcharge exceeds the gross amount; that is a
/// fee configuration problem and is never clamped.
pub fn calculate_seller_payout(
    gross_cents: i64,
    platform_fee_bps: u32,
    sms: Option<&SmsSurcharge>,
) -> SettlementResult<SellerPayoutBreakdown> {
    if gross_cents < 0 {
        return Err(SettlementError::InvalidPayout(format!(
            "gross amount {} is negative",
            gross_cents
        )));
    }

    let platform_fee_cents = round_bps(gross_cents, platform_fee_bps);
    let ancillary_cents = sms.map(SmsSurcharge::total_cents).unwrap_or(0);
    let net_cents = gross_cents - platform_fee_cents - ancillary_cents;

    if net_cents < 0 {
        return Err(SettlementError::InvalidPayout(format!(
            "fee {} + surcharge {} exceeds gross {}",
            platform_fee_cents, ancillary_cents, gross_cents
        )));
    }

    Ok(SellerPayoutBreakdown {
        gross_cents,
        platform_fee_bps,
        platform_fee_cents,
        ancillary_cents,
        net_cents,
    })
}

/// Fee split computed upstream when the delivery price was quoted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFeeBreakdown {
    pub total_cents: i64,
    pub platform_fee_cents: i64,
    pub deliverer_earnings_cents: i64,
}

impl DeliveryFeeBreakdown {
    fn is_consistent(&self) -> bool {
        self.total_cents >= 0
            && self.platform_fee_cents >= 0
            && self.deliverer_earnings_cents >= 0
            && self.platform_fee_cents + self.deliverer_earnings_cents == self.total_cents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryPayoutBreakdown {
    pub delivery_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub net_cents: i64,
}

/// Deliverer share of a delivery fee: the supplied split when it is
/// consistent with the fee, otherwise a flat 12% platform cut.
pub fn calculate_delivery_payout(
    delivery_fee_cents: i64,
    breakdown: Option<&DeliveryFeeBreakdown>,
) -> SettlementResult<DeliveryPayoutBreakdown> {
    if delivery_fee_cents < 0 {
        return Err(SettlementError::InvalidPayout(format!(
            "delivery fee {} is negative",
            delivery_fee_cents
        )));
    }

    if let Some(split) = breakdown {
        if split.is_consistent() && split.total_cents == delivery_fee_cents {
            return Ok(DeliveryPayoutBreakdown {
                delivery_fee_cents,
                platform_fee_cents: split.platform_fee_cents,
                net_cents: split.deliverer_earnings_cents,
            });
        }
        tracing::warn!(
            delivery_fee_cents = delivery_fee_cents,
            breakdown = ?split,
            "Delivery fee breakdown does not add up, computing split directly"
        );
    }

    let platform_fee_cents = round_bps(delivery_fee_cents, DELIVERY_PLATFORM_FEE_BPS);
    Ok(DeliveryPayoutBreakdown {
        delivery_fee_cents,
        platform_fee_cents,
        net_cents: delivery_fee_cents - platform_fee_cents,
    })
}

/// Split `total` into `parts` shares differing by at most one cent
pub fn split_evenly(total_cents: i64, parts: usize) -> Vec<i64> {
    let Ok(n) = i64::try_from(parts) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    let base = total_cents / n;
    let remainder = total_cents % n;
    (0..n).map(|i| base + i64::from(i < remainder)).collect()
}

/// Per-leg payout breakdowns when one delivery fee covers `legs` delivery
/// orders. A supplied breakdown is split the same way as the fee.
pub fn split_delivery_fee(
    delivery_fee_cents: i64,
    breakdown: Option<&DeliveryFeeBreakdown>,
    legs: usize,
) -> SettlementResult<Vec<DeliveryPayoutBreakdown>> {
    let fee_shares = split_evenly(delivery_fee_cents, legs);
    let platform_shares = breakdown
        .filter(|b| b.is_consistent() && b.total_cents == delivery_fee_cents)
        .map(|b| split_evenly(b.platform_fee_cents, legs));

    fee_shares
        .iter()
        .enumerate()
        .map(|(i, &share)| {
            let leg_split = platform_shares.as_ref().map(|shares| DeliveryFeeBreakdown {
                total_cents: share,
                platform_fee_cents: shares[i],
                deliverer_earnings_cents: share - shares[i],
            });
            calculate_delivery_payout(share, leg_split.as_ref())
        })
        .collect()
}

/// Item that carries each seller's once-per-order surcharge: the largest
/// by gross, earliest on ties
fn largest_item_per_seller(items: &[OrderItem]) -> HashMap<Uuid, Uuid> {
    let mut largest: HashMap<Uuid, &OrderItem> = HashMap::new();
    for item in items {
        largest
            .entry(item.seller_id)
            .and_modify(|current| {
                if item.gross_cents() > current.gross_cents() {
                    *current = item;
                }
            })
            .or_insert(item);
    }
    largest
        .into_iter()
        .map(|(seller_id, item)| (seller_id, item.id))
        .collect()
}

/// Tier that applies now; lapsed paid tiers fall back to Free
pub fn effective_tier(profile: &SellerProfile, now: OffsetDateTime) -> SellerTier {
    match profile.subscription_valid_until {
        Some(until) if profile.tier.is_paid() && until < now => SellerTier::Free,
        _ => profile.tier,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub transferred: usize,
    pub failed: usize,
}

/// Writes ledger rows and payouts, then pushes money to connected accounts
#[derive(Clone)]
pub struct PayoutService {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn PaymentGateway>,
    sms: SmsSurcharge,
}

impl PayoutService {
    pub fn new(store: Arc<dyn MarketStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::with_sms_surcharge(store, gateway, SmsSurcharge::default())
    }

    pub fn with_sms_surcharge(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn PaymentGateway>,
        sms: SmsSurcharge,
    ) -> Self {
        Self {
            store,
            gateway,
            sms,
        }
    }

    /// Whether the seller pays for SMS order updates
    async fn seller_sms_enabled(&self, seller_id: Uuid) -> SettlementResult<bool> {
        let Some(contact) = self.store.user_contact(seller_id).await? else {
            return Ok(false);
        };
        if !contact.has_phone() {
            return Ok(false);
        }
        let Some(prefs) = self.store.notification_preferences(seller_id).await? else {
            return Ok(false);
        };
        Ok(prefs.sms.get(PreferenceKey::NewOrder) == Some(true)
            || prefs.sms.get(PreferenceKey::OrderStatus) == Some(true))
    }

    /// One ledger row and payout per line item, then a transfer attempt for each.
    ///
    /// The SMS surcharge is charged once per seller per order, on that
    /// seller's largest item, and waived when even that item cannot cover
    /// it. Failures are logged per item and never abort the rest of the
    /// order.
    pub async fn settle_order_sellers(
        &self,
        order: &Order,
        items: &[OrderItem],
        provider_reference: &str,
    ) -> Vec<Payout> {
        let now = OffsetDateTime::now_utc();
        let surcharge_items = largest_item_per_seller(items);
        let mut payouts = Vec::with_capacity(items.len());

        for item in items {
            let may_surcharge = surcharge_items.get(&item.seller_id) == Some(&item.id);
            match self
                .settle_item(order, item, provider_reference, now, may_surcharge)
                .await
            {
                Ok(payout) => payouts.push(payout),
                Err(e) => {
                    tracing::error!(
                        order_id = %order.id,
                        order_item_id = %item.id,
                        seller_id = %item.seller_id,
                        error = %e,
                        "Failed to settle seller payout"
                    );
                }
            }
        }

        payouts
    }

    async fn settle_item(
        &self,
        order: &Order,
        item: &OrderItem,
        provider_reference: &str,
        now: OffsetDateTime,
        may_surcharge: bool,
    ) -> SettlementResult<Payout> {
        let tier = match self.store.seller_profile(item.seller_id).await? {
            Some(profile) => effective_tier(&profile, now),
            None => SellerTier::Free,
        };

        let sms = if may_surcharge && self.seller_sms_enabled(item.seller_id).await? {
            Some(&self.sms)
        } else {
            None
        };

        let gross_cents = item.gross_cents();
        let fee_bps = tier.platform_fee_bps();
        let breakdown = match calculate_seller_payout(gross_cents, fee_bps, sms) {
            Err(e) if sms.is_some() => {
                tracing::warn!(
                    order_item_id = %item.id,
                    seller_id = %item.seller_id,
                    gross_cents = gross_cents,
                    error = %e,
                    "Item cannot cover SMS surcharge, waiving it"
                );
                calculate_seller_payout(gross_cents, fee_bps, None)?
            }
            other => other?,
        };

        let transaction = self
            .store
            .insert_ledger_transaction(NewLedgerTransaction {
                order_id: order.id,
                order_item_id: Some(item.id),
                delivery_order_id: None,
                kind: TransactionKind::Sale,
                buyer_id: order.buyer_id,
                recipient_id: item.seller_id,
                gross_cents: breakdown.gross_cents,
                platform_fee_bps: breakdown.platform_fee_bps,
                platform_fee_cents: breakdown.platform_fee_cents,
                provider_reference: provider_reference.to_string(),
            })
            .await?;

        let mut payout = self
            .store
            .insert_payout(NewPayout {
                transaction_id: transaction.id,
                recipient_id: item.seller_id,
                recipient_kind: RecipientKind::Seller,
                gross_cents: breakdown.gross_cents,
                platform_fee_cents: breakdown.platform_fee_cents,
                ancillary_cents: breakdown.ancillary_cents,
                net_cents: breakdown.net_cents,
            })
            .await?;

        payout.status = self.transfer(&payout).await;
        Ok(payout)
    }

    /// Attempt the gateway transfer for a payout and record the result.
    ///
    /// Never fails: gateway and bookkeeping errors are logged and reflected
    /// in the returned status.
    pub async fn transfer(&self, payout: &Payout) -> PayoutStatus {
        if payout.net_cents == 0 {
            if let Err(e) = self.store.mark_payout_not_required(payout.id).await {
                tracing::error!(payout_id = %payout.id, error = %e, "Failed to mark payout not required");
            }
            return PayoutStatus::NotRequired;
        }

        let account = match self
            .store
            .payout_account(payout.recipient_id, payout.recipient_kind)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                tracing::error!(payout_id = %payout.id, error = %e, "Failed to load payout account");
                return self.record_failure(payout, &e.to_string()).await;
            }
        };

        let Some(destination) = account else {
            tracing::warn!(
                payout_id = %payout.id,
                recipient_id = %payout.recipient_id,
                "Recipient has no connected payout account"
            );
            return self.record_failure(payout, NO_PAYOUT_ACCOUNT).await;
        };

        let request = transfer_request(payout, destination);
        match self.gateway.create_transfer(&request).await {
            Ok(reference) => {
                if let Err(e) = self.store.mark_payout_transferred(payout.id, &reference).await {
                    tracing::error!(
                        payout_id = %payout.id,
                        transfer_reference = %reference,
                        error = %e,
                        "Transfer succeeded but recording it failed"
                    );
                }
                PayoutStatus::Transferred
            }
            Err(e) => {
                tracing::error!(
                    payout_id = %payout.id,
                    recipient_id = %payout.recipient_id,
                    net_cents = payout.net_cents,
                    error = %e,
                    "Payout transfer failed"
                );
                self.record_failure(payout, &e.to_string()).await
            }
        }
    }

    async fn record_failure(&self, payout: &Payout, reason: &str) -> PayoutStatus {
        if let Err(e) = self.store.mark_payout_failed(payout.id, reason).await {
            tracing::error!(payout_id = %payout.id, error = %e, "Failed to mark payout failed");
        }
        PayoutStatus::Failed
    }

    /// Re-attempt failed payouts below the attempt limit
    pub async fn retry_failed(&self, limit: i64) -> SettlementResult<RetrySummary> {
        let failed = self.store.failed_payouts(MAX_PAYOUT_ATTEMPTS, limit).await?;
        let mut summary = RetrySummary {
            attempted: failed.len(),
            ..RetrySummary::default()
        };

        for payout in &failed {
            match self.transfer(payout).await {
                PayoutStatus::Transferred | PayoutStatus::NotRequired => summary.transferred += 1,
                _ => summary.failed += 1,
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                transferred = summary.transferred,
                failed = summary.failed,
                "Retried failed payouts"
            );
        }
        Ok(summary)
    }

    /// Pay deliverers for delivered, not yet settled delivery orders
    pub async fn settle_completed_deliveries(&self, limit: i64) -> SettlementResult<usize> {
        let deliveries = self.store.delivered_unsettled_deliveries(limit).await?;
        let mut settled = 0;

        for delivery in &deliveries {
            match self.settle_delivery(delivery).await {
                Ok(_) => settled += 1,
                Err(e) => {
                    tracing::error!(
                        delivery_order_id = %delivery.id,
                        error = %e,
                        "Failed to settle delivery payout"
                    );
                }
            }
        }

        Ok(settled)
    }

    async fn settle_delivery(&self, delivery: &DeliveryOrder) -> SettlementResult<Payout> {
        let deliverer_id = delivery.deliverer_id.ok_or_else(|| {
            SettlementError::InvalidPayout(format!("delivery {} has no deliverer", delivery.id))
        })?;
        let order = self
            .store
            .order(delivery.order_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("order {}", delivery.order_id)))?;

        let stored_split = DeliveryFeeBreakdown {
            total_cents: delivery.delivery_fee_cents,
            platform_fee_cents: delivery.platform_fee_cents,
            deliverer_earnings_cents: delivery.deliverer_earnings_cents,
        };
        let breakdown = calculate_delivery_payout(delivery.delivery_fee_cents, Some(&stored_split))?;

        let transaction = self
            .store
            .insert_ledger_transaction(NewLedgerTransaction {
                order_id: order.id,
                order_item_id: None,
                delivery_order_id: Some(delivery.id),
                kind: TransactionKind::DeliveryLeg,
                buyer_id: order.buyer_id,
                recipient_id: deliverer_id,
                gross_cents: breakdown.delivery_fee_cents,
                platform_fee_bps: DELIVERY_PLATFORM_FEE_BPS,
                platform_fee_cents: breakdown.platform_fee_cents,
                provider_reference: order.payment_session_id.clone(),
            })
            .await?;

        let mut payout = self
            .store
            .insert_payout(NewPayout {
                transaction_id: transaction.id,
                recipient_id: deliverer_id,
                recipient_kind: RecipientKind::Deliverer,
                gross_cents: breakdown.delivery_fee_cents,
                platform_fee_cents: breakdown.platform_fee_cents,
                ancillary_cents: 0,
                net_cents: breakdown.net_cents,
            })
            .await?;

        self.store.mark_delivery_settled(delivery.id, payout.id).await?;
        payout.status = self.transfer(&payout).await;

        tracing::info!(
            delivery_order_id = %delivery.id,
            payout_id = %payout.id,
            status = %payout.status,
            "Settled delivery payout"
        );
        Ok(payout)
    }
}

fn transfer_request(payout: &Payout, destination: String) -> TransferRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("payout_id".to_string(), payout.id.to_string());
    metadata.insert("order_id".to_string(), payout.order_id.to_string());
    if let Some(product_id) = payout.product_id {
        metadata.insert("product_id".to_string(), product_id.to_string());
    }
    metadata.insert(
        format!("{}_id", payout.recipient_kind),
        payout.recipient_id.to_string(),
    );
    metadata.insert("gross_cents".to_string(), payout.gross_cents.to_string());
    metadata.insert(
        "platform_fee_cents".to_string(),
        payout.platform_fee_cents.to_string(),
    );
    metadata.insert(
        "ancillary_cents".to_string(),
        payout.ancillary_cents.to_string(),
    );

    TransferRequest {
        payout_id: payout.id,
        amount_cents: payout.net_cents,
        destination,
        transfer_group: format!("order_{}", payout.order_id),
        metadata,
    }
}
