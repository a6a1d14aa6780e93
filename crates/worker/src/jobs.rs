//! Scheduled settlement jobs
//!
//! Each job logs its own outcome and swallows errors so a failing run
//! never takes the scheduler down; the next tick retries.

use market_settlement::{InvariantChecker, Settlement, ViolationSeverity};
use tracing::{error, info, warn};

/// Tunables for the scheduled jobs
#[derive(Debug, Clone, Copy)]
pub struct JobConfig {
    pub reservation_ttl: time::Duration,
    pub payout_retry_batch: i64,
    pub delivery_settlement_batch: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: time::Duration::minutes(30),
            payout_retry_batch: 50,
            delivery_settlement_batch: 100,
        }
    }
}

impl JobConfig {
    /// Reads RESERVATION_TTL_MINUTES, PAYOUT_RETRY_BATCH and
    /// DELIVERY_SETTLEMENT_BATCH, keeping defaults for unset or bad values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reservation_ttl: env_number("RESERVATION_TTL_MINUTES")
                .map(time::Duration::minutes)
                .unwrap_or(defaults.reservation_ttl),
            payout_retry_batch: env_number("PAYOUT_RETRY_BATCH")
                .unwrap_or(defaults.payout_retry_batch),
            delivery_settlement_batch: env_number("DELIVERY_SETTLEMENT_BATCH")
                .unwrap_or(defaults.delivery_settlement_batch),
        }
    }
}

fn env_number(name: &str) -> Option<i64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<i64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            warn!(name = name, value = %raw, "Ignoring invalid job setting");
            None
        }
    }
}

pub async fn expire_reservations(settlement: &Settlement, config: &JobConfig) -> u64 {
    match settlement.orders.expire_reservations(config.reservation_ttl).await {
        Ok(expired) => expired,
        Err(e) => {
            error!(error = %e, "Reservation expiry failed");
            0
        }
    }
}

pub async fn retry_failed_payouts(settlement: &Settlement, config: &JobConfig) -> usize {
    match settlement.payouts.retry_failed(config.payout_retry_batch).await {
        Ok(summary) => summary.transferred,
        Err(e) => {
            error!(error = %e, "Payout retry failed");
            0
        }
    }
}

pub async fn settle_deliveries(settlement: &Settlement, config: &JobConfig) -> usize {
    match settlement
        .payouts
        .settle_completed_deliveries(config.delivery_settlement_batch)
        .await
    {
        Ok(settled) => {
            if settled > 0 {
                info!(settled = settled, "Settled completed deliveries");
            }
            settled
        }
        Err(e) => {
            error!(error = %e, "Delivery settlement failed");
            0
        }
    }
}

pub async fn check_invariants(checker: &InvariantChecker) {
    match checker.run_all_checks().await {
        Ok(summary) if summary.healthy => {
            info!(checks_run = summary.checks_run, "All settlement invariants hold");
        }
        Ok(summary) => {
            for violation in &summary.violations {
                if violation.severity == ViolationSeverity::Critical {
                    error!(
                        invariant = %violation.invariant,
                        entity_ids = ?violation.entity_ids,
                        description = %violation.description,
                        "Critical settlement invariant violated"
                    );
                } else {
                    warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        entity_ids = ?violation.entity_ids,
                        description = %violation.description,
                        "Settlement invariant violated"
                    );
                }
            }
            warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Invariant check found violations"
            );
        }
        Err(e) => error!(error = %e, "Invariant check failed"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use market_settlement::{
        models::{DeliveryMode, PayoutStatus},
        notifications::NotificationDispatcher,
        store::MemoryStore,
        testing::{fixtures, RecordingGateway},
        OrderRequest, PurchasedItem, Settlement, SmsSurcharge,
    };
    use market_shared::SellerTier;
    use time::OffsetDateTime;

    use super::*;

    fn settlement(store: &MemoryStore, gateway: Arc<RecordingGateway>) -> Settlement {
        Settlement::new(
            Arc::new(store.clone()),
            gateway,
            NotificationDispatcher::new(Arc::new(store.clone())),
            SmsSurcharge::default(),
        )
    }

    #[tokio::test]
    async fn test_expire_reservations_job() {
        let store = MemoryStore::new();
        let seller = fixtures::seller(&store, SellerTier::Free, None, None).await;
        let product = fixtures::product(&store, seller, 100, Some(1)).await;
        store
            .add_reservation(
                "cs_stale",
                product,
                1,
                OffsetDateTime::now_utc() - time::Duration::hours(1),
            )
            .await;

        let settlement = settlement(&store, Arc::new(RecordingGateway::default()));
        assert_eq!(expire_reservations(&settlement, &JobConfig::default()).await, 1);
    }

    #[tokio::test]
    async fn test_failed_payout_retried_once_gateway_recovers() {
        let store = MemoryStore::new();
        let gateway = Arc::new(RecordingGateway::default());
        let settlement = settlement(&store, gateway.clone());

        let buyer = fixtures::user(&store, "Bea", None).await;
        let seller = fixtures::seller(&store, SellerTier::Free, Some("acct_s"), None).await;
        let product = fixtures::product(&store, seller, 1_000, None).await;
        let created = settlement
            .orders
            .create_order(&OrderRequest {
                payment_session_id: "cs_retry".into(),
                buyer_id: buyer,
                items: vec![PurchasedItem {
                    product_id: product,
                    quantity: 1,
                    unit_price_cents: 1_000,
                    seller_id: seller,
                }],
                total_cents: None,
                delivery_mode: DeliveryMode::Pickup,
                pickup_address: None,
                delivery_address: None,
                scheduled_date: None,
                notes: None,
            })
            .await
            .unwrap();

        gateway.set_fail_transfers(true);
        settlement
            .payouts
            .settle_order_sellers(&created.order, &created.items, "pi_retry")
            .await;
        assert_eq!(store.snapshot().await.payouts[0].status, PayoutStatus::Failed);

        gateway.set_fail_transfers(false);
        assert_eq!(retry_failed_payouts(&settlement, &JobConfig::default()).await, 1);
        assert_eq!(
            store.snapshot().await.payouts[0].status,
            PayoutStatus::Transferred
        );
    }

    #[tokio::test]
    async fn test_settle_deliveries_job_without_work() {
        let store = MemoryStore::new();
        let settlement = settlement(&store, Arc::new(RecordingGateway::default()));
        assert_eq!(settle_deliveries(&settlement, &JobConfig::default()).await, 0);
    }

    #[test]
    fn test_job_config_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.reservation_ttl, time::Duration::minutes(30));
        assert_eq!(config.payout_retry_batch, 50);
    }
}
