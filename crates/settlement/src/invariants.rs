//! Settlement invariants
//!
//! Runnable consistency checks over the settlement tables. Safe to run at
//! any time, including after webhook replays; every check only reads.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SettlementResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Rows affected (products, orders, payouts, reservations)
    pub entity_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or stock is wrong
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeStockRow {
    id: Uuid,
    seller_id: Uuid,
    stock: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSessionRow {
    payment_session_id: String,
    order_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct PayoutArithmeticRow {
    id: Uuid,
    gross_cents: i64,
    platform_fee_cents: i64,
    ancillary_cents: i64,
    net_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EmptyOrderRow {
    id: Uuid,
    order_number: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanReservationRow {
    id: Uuid,
    payment_session_id: String,
    product_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnreferencedTransferRow {
    id: Uuid,
    recipient_id: Uuid,
    net_cents: i64,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> SettlementResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_stock_non_negative().await?);
        violations.extend(self.check_single_order_per_session().await?);
        violations.extend(self.check_payout_arithmetic().await?);
        violations.extend(self.check_orders_have_items().await?);
        violations.extend(self.check_confirmed_reservations_have_order().await?);
        violations.extend(self.check_transferred_payouts_have_reference().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Tracked stock is never below zero
    async fn check_stock_non_negative(&self) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeStockRow> = sqlx::query_as(
            r#"
            SELECT id, seller_id, stock
            FROM products
            WHERE stock IS NOT NULL AND stock < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stock_non_negative".to_string(),
                entity_ids: vec![row.id],
                description: format!("Product stock is {}", row.stock),
                context: serde_json::json!({
                    "seller_id": row.seller_id,
                    "stock": row.stock,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A payment session produced at most one order
    async fn check_single_order_per_session(&self) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSessionRow> = sqlx::query_as(
            r#"
            SELECT payment_session_id, ARRAY_AGG(id) AS order_ids
            FROM orders
            GROUP BY payment_session_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_order_per_session".to_string(),
                description: format!(
                    "Payment session has {} orders (expected 1)",
                    row.order_ids.len()
                ),
                context: serde_json::json!({
                    "payment_session_id": row.payment_session_id,
                }),
                entity_ids: row.order_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// net = gross - fee - ancillary, and net >= 0
    async fn check_payout_arithmetic(&self) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<PayoutArithmeticRow> = sqlx::query_as(
            r#"
            SELECT id, gross_cents, platform_fee_cents, ancillary_cents, net_cents
            FROM payouts
            WHERE net_cents < 0
               OR net_cents <> gross_cents - platform_fee_cents - ancillary_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payout_arithmetic".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Payout net {} does not equal {} - {} - {}",
                    row.net_cents, row.gross_cents, row.platform_fee_cents, row.ancillary_cents
                ),
                context: serde_json::json!({
                    "gross_cents": row.gross_cents,
                    "platform_fee_cents": row.platform_fee_cents,
                    "ancillary_cents": row.ancillary_cents,
                    "net_cents": row.net_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_orders_have_items(&self) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<EmptyOrderRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.order_number
            FROM orders o
            WHERE NOT EXISTS (SELECT 1 FROM order_items i WHERE i.order_id = o.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "orders_have_items".to_string(),
                entity_ids: vec![row.id],
                description: format!("Order {} has no items", row.order_number),
                context: serde_json::json!({ "order_number": row.order_number }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Reservations are only confirmed by order creation
    async fn check_confirmed_reservations_have_order(
        &self,
    ) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanReservationRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.payment_session_id, r.product_id
            FROM stock_reservations r
            WHERE r.status = 'confirmed'
              AND NOT EXISTS (
                  SELECT 1 FROM orders o WHERE o.payment_session_id = r.payment_session_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "confirmed_reservations_have_order".to_string(),
                entity_ids: vec![row.id],
                description: "Confirmed stock reservation has no order".to_string(),
                context: serde_json::json!({
                    "payment_session_id": row.payment_session_id,
                    "product_id": row.product_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_transferred_payouts_have_reference(
        &self,
    ) -> SettlementResult<Vec<InvariantViolation>> {
        let rows: Vec<UnreferencedTransferRow> = sqlx::query_as(
            r#"
            SELECT id, recipient_id, net_cents
            FROM payouts
            WHERE status = 'transferred' AND transfer_reference IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transferred_payouts_have_reference".to_string(),
                entity_ids: vec![row.id],
                description: "Payout marked transferred without a transfer reference".to_string(),
                context: serde_json::json!({
                    "recipient_id": row.recipient_id,
                    "net_cents": row.net_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> SettlementResult<Vec<InvariantViolation>> {
        match name {
            "stock_non_negative" => self.check_stock_non_negative().await,
            "single_order_per_session" => self.check_single_order_per_session().await,
            "payout_arithmetic" => self.check_payout_arithmetic().await,
            "orders_have_items" => self.check_orders_have_items().await,
            "confirmed_reservations_have_order" => {
                self.check_confirmed_reservations_have_order().await
            }
            "transferred_payouts_have_reference" => {
                self.check_transferred_payouts_have_reference().await
            }
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "stock_non_negative",
            "single_order_per_session",
            "payout_arithmetic",
            "orders_have_items",
            "confirmed_reservations_have_order",
            "transferred_payouts_have_reference",
        ]
    }
}
