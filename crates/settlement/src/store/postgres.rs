//! Postgres implementation of the settlement store

use async_trait::async_trait;
use market_shared::SellerTier;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime, Time};
use uuid::Uuid;

use super::{MarketStore, OrderTransaction};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    DeliveryAgent, DeliveryMode, DeliveryOrder, DeliveryOrderStatus, GeoPoint, LedgerTransaction,
    NewDeliveryOrder, NewLedgerTransaction, NewOrder, NewOrderConversation, NewOrderItem,
    NewPayout, NewReviewToken, Order, OrderItem, OrderStatus, Payout, PayoutStatus, Product,
    RecipientKind, SellerProfile, SubscriptionLink, UserContact,
};
use crate::notifications::preferences::{
    CategoryFlags, DeliveryNotificationSettings, NotificationPreferences, QuietHours, SmsFlags,
};
use crate::notifications::NewNotification;

const ORDER_COLUMNS: &str = "id, buyer_id, order_number, status, total_cents, delivery_mode, \
     pickup_address, delivery_address, scheduled_date, notes, payment_session_id, created_at";

const DELIVERY_COLUMNS: &str = "id, order_id, product_id, seller_id, deliverer_id, status, \
     delivery_fee_cents, platform_fee_cents, deliverer_earnings_cents, estimated_minutes";

const PAYOUT_SELECT: &str = r#"
    SELECT p.id, p.transaction_id, p.recipient_id, p.recipient_kind, t.order_id,
           COALESCE(oi.product_id, d.product_id) AS product_id,
           p.gross_cents, p.platform_fee_cents, p.ancillary_cents, p.net_cents,
           p.status, p.transfer_reference, p.failure_reason
    FROM payouts p
    JOIN transactions t ON t.id = p.transaction_id
    LEFT JOIN order_items oi ON oi.id = t.order_item_id
    LEFT JOIN delivery_orders d ON d.id = t.delivery_order_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    buyer_id: Uuid,
    order_number: String,
    status: String,
    total_cents: i64,
    delivery_mode: String,
    pickup_address: Option<String>,
    delivery_address: Option<String>,
    scheduled_date: Option<Date>,
    notes: Option<String>,
    payment_session_id: String,
    created_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = SettlementError;

    fn try_from(row: OrderRow) -> SettlementResult<Self> {
        Ok(Order {
            id: row.id,
            buyer_id: row.buyer_id,
            order_number: row.order_number,
            status: OrderStatus::parse(&row.status)?,
            total_cents: row.total_cents,
            delivery_mode: DeliveryMode::parse(&row.delivery_mode)?,
            pickup_address: row.pickup_address,
            delivery_address: row.delivery_address,
            scheduled_date: row.scheduled_date,
            notes: row.notes,
            payment_session_id: row.payment_session_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    seller_id: Uuid,
    quantity: i32,
    unit_price_cents: i64,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        OrderItem {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            seller_id: row.seller_id,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    seller_id: Uuid,
    name: String,
    price_cents: i64,
    stock: Option<i32>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            seller_id: row.seller_id,
            name: row.name,
            price_cents: row.price_cents,
            stock: row.stock,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SellerRow {
    user_id: Uuid,
    tier: String,
    payout_account_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    subscription_id: Option<String>,
    subscription_valid_until: Option<OffsetDateTime>,
}

impl TryFrom<SellerRow> for SellerProfile {
    type Error = SettlementError;

    fn try_from(row: SellerRow) -> SettlementResult<Self> {
        let tier: SellerTier = row
            .tier
            .parse()
            .map_err(|e| SettlementError::Internal(format!("{}", e)))?;
        Ok(SellerProfile {
            user_id: row.user_id,
            tier,
            payout_account_id: row.payout_account_id,
            location: GeoPoint::from_parts(row.latitude, row.longitude),
            subscription_id: row.subscription_id,
            subscription_valid_until: row.subscription_valid_until,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    seller_id: Uuid,
    deliverer_id: Option<Uuid>,
    status: String,
    delivery_fee_cents: i64,
    platform_fee_cents: i64,
    deliverer_earnings_cents: i64,
    estimated_minutes: Option<i32>,
}

impl TryFrom<DeliveryRow> for DeliveryOrder {
    type Error = SettlementError;

    fn try_from(row: DeliveryRow) -> SettlementResult<Self> {
        Ok(DeliveryOrder {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            seller_id: row.seller_id,
            deliverer_id: row.deliverer_id,
            status: DeliveryOrderStatus::parse(&row.status)?,
            delivery_fee_cents: row.delivery_fee_cents,
            platform_fee_cents: row.platform_fee_cents,
            deliverer_earnings_cents: row.deliverer_earnings_cents,
            estimated_minutes: row.estimated_minutes,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    transaction_id: Uuid,
    recipient_id: Uuid,
    recipient_kind: String,
    order_id: Uuid,
    product_id: Option<Uuid>,
    gross_cents: i64,
    platform_fee_cents: i64,
    ancillary_cents: i64,
    net_cents: i64,
    status: String,
    transfer_reference: Option<String>,
    failure_reason: Option<String>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = SettlementError;

    fn try_from(row: PayoutRow) -> SettlementResult<Self> {
        Ok(Payout {
            id: row.id,
            transaction_id: row.transaction_id,
            recipient_id: row.recipient_id,
            recipient_kind: RecipientKind::parse(&row.recipient_kind)?,
            order_id: row.order_id,
            product_id: row.product_id,
            gross_cents: row.gross_cents,
            platform_fee_cents: row.platform_fee_cents,
            ancillary_cents: row.ancillary_cents,
            net_cents: row.net_cents,
            status: PayoutStatus::parse(&row.status)?,
            transfer_reference: row.transfer_reference,
            failure_reason: row.failure_reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreferencesRow {
    user_id: Uuid,
    push_new_order: bool,
    push_order_status: bool,
    push_delivery_update: bool,
    push_new_message: bool,
    push_security_alert: bool,
    email_new_order: bool,
    email_order_status: bool,
    email_delivery_update: bool,
    email_new_message: bool,
    email_security_alert: bool,
    sms_new_order: Option<bool>,
    sms_order_status: Option<bool>,
    sms_delivery_update: Option<bool>,
    sms_new_message: Option<bool>,
    sms_security_alert: Option<bool>,
    quiet_hours_enabled: bool,
    quiet_hours_start: Option<Time>,
    quiet_hours_end: Option<Time>,
    utc_offset_minutes: i16,
}

impl From<PreferencesRow> for NotificationPreferences {
    fn from(row: PreferencesRow) -> Self {
        NotificationPreferences {
            user_id: row.user_id,
            push: CategoryFlags {
                new_order: row.push_new_order,
                order_status: row.push_order_status,
                delivery_update: row.push_delivery_update,
                new_message: row.push_new_message,
                security_alert: row.push_security_alert,
            },
            email: CategoryFlags {
                new_order: row.email_new_order,
                order_status: row.email_order_status,
                delivery_update: row.email_delivery_update,
                new_message: row.email_new_message,
                security_alert: row.email_security_alert,
            },
            sms: SmsFlags {
                new_order: row.sms_new_order,
                order_status: row.sms_order_status,
                delivery_update: row.sms_delivery_update,
                new_message: row.sms_new_message,
                security_alert: row.sms_security_alert,
            },
            quiet_hours: QuietHours {
                enabled: row.quiet_hours_enabled,
                start: row.quiet_hours_start,
                end: row.quiet_hours_end,
                utc_offset_minutes: row.utc_offset_minutes,
            },
        }
    }
}

const PREFERENCES_SELECT: &str = r#"
    SELECT user_id,
           push_new_order, push_order_status, push_delivery_update, push_new_message, push_security_alert,
           email_new_order, email_order_status, email_delivery_update, email_new_message, email_security_alert,
           sms_new_order, sms_order_status, sms_delivery_update, sms_new_message, sms_security_alert,
           quiet_hours_enabled, quiet_hours_start, quiet_hours_end, utc_offset_minutes
    FROM notification_preferences
    WHERE user_id = $1
"#;

fn bps_to_db(bps: u32) -> SettlementResult<i32> {
    i32::try_from(bps).map_err(|_| SettlementError::Internal(format!("fee bps {} out of range", bps)))
}

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_payout(&self, payout_id: Uuid) -> SettlementResult<Payout> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!("{} WHERE p.id = $1", PAYOUT_SELECT))
            .bind(payout_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }
}

pub struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    async fn insert_order(&mut self, order: NewOrder) -> SettlementResult<Order> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO orders (buyer_id, order_number, status, total_cents, delivery_mode,
                                pickup_address, delivery_address, scheduled_date, notes, payment_session_id)
            VALUES ($1, $2, 'confirmed', $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order.buyer_id)
        .bind(&order.order_number)
        .bind(order.total_cents)
        .bind(order.delivery_mode.as_str())
        .bind(&order.pickup_address)
        .bind(&order.delivery_address)
        .bind(order.scheduled_date)
        .bind(&order.notes)
        .bind(&order.payment_session_id)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn lock_product(&mut self, product_id: Uuid) -> SettlementResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, seller_id, name, price_cents, stock
            FROM products
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Product::from))
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> SettlementResult<OrderItem> {
        let row = sqlx::query_as::<_, OrderItemRow>(
            r#"
            INSERT INTO order_items (order_id, product_id, seller_id, quantity, unit_price_cents)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, order_id, product_id, seller_id, quantity, unit_price_cents
            "#,
        )
        .bind(item.order_id)
        .bind(item.product_id)
        .bind(item.seller_id)
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }

    async fn confirm_reservation(
        &mut self,
        payment_session_id: &str,
        product_id: Uuid,
    ) -> SettlementResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = 'confirmed', confirmed_at = NOW()
            WHERE payment_session_id = $1 AND product_id = $2 AND status = 'pending'
            "#,
        )
        .bind(payment_session_id)
        .bind(product_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn decrement_stock(
        &mut self,
        product_id: Uuid,
        quantity: i32,
    ) -> SettlementResult<Option<i32>> {
        // The CHECK (stock >= 0) constraint rejects the update outright if it
        // would go negative; the caller asserts on the returned level as well.
        let row: Option<(Option<i32>,)> = sqlx::query_as(
            r#"
            UPDATE products
            SET stock = CASE WHEN stock IS NULL THEN NULL ELSE stock - $2 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING stock
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some((stock,)) => Ok(stock),
            None => Err(SettlementError::NotFound(format!("product {}", product_id))),
        }
    }

    async fn commit(self: Box<Self>) -> SettlementResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MarketStore for PgStore {
    async fn begin(&self) -> SettlementResult<Box<dyn OrderTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgOrderTransaction { tx }))
    }

    async fn find_order_by_session(
        &self,
        payment_session_id: &str,
    ) -> SettlementResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE payment_session_id = $1",
            ORDER_COLUMNS
        ))
        .bind(payment_session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn order(&self, order_id: Uuid) -> SettlementResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn order_items(&self, order_id: Uuid) -> SettlementResult<Vec<OrderItem>> {
        let rows = sqlx::query_as::<_, OrderItemRow>(
            r#"
            SELECT id, order_id, product_id, seller_id, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

    async fn product(&self, product_id: Uuid) -> SettlementResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, seller_id, name, price_cents, stock FROM products WHERE id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Product::from))
    }

    async fn expire_stale_reservations(
        &self,
        created_before: OffsetDateTime,
    ) -> SettlementResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = 'expired'
            WHERE status = 'pending' AND created_at < $1
            "#,
        )
        .bind(created_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn seller_profile(&self, seller_id: Uuid) -> SettlementResult<Option<SellerProfile>> {
        let row = sqlx::query_as::<_, SellerRow>(
            r#"
            SELECT user_id, tier, payout_account_id, latitude, longitude,
                   subscription_id, subscription_valid_until
            FROM seller_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SellerProfile::try_from).transpose()
    }

    async fn seller_id_for_customer(&self, customer_id: &str) -> SettlementResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM seller_profiles WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn update_seller_subscription(&self, link: &SubscriptionLink) -> SettlementResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE seller_profiles
            SET tier = $2,
                subscription_id = $3,
                subscription_status = $4,
                subscription_valid_until = $5,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(link.seller_id)
        .bind(link.tier.as_str())
        .bind(&link.subscription_id)
        .bind(&link.status)
        .bind(link.valid_until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SettlementError::NotFound(format!("seller {}", link.seller_id)));
        }
        Ok(())
    }

    async fn user_contact(&self, user_id: Uuid) -> SettlementResult<Option<UserContact>> {
        let row: Option<(Uuid, String, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT id, display_name, email, phone FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(user_id, display_name, email, phone)| UserContact {
            user_id,
            display_name,
            email,
            phone,
        }))
    }

    async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<NotificationPreferences>> {
        let row = sqlx::query_as::<_, PreferencesRow>(PREFERENCES_SELECT)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(NotificationPreferences::from))
    }

    async fn insert_default_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<NotificationPreferences> {
        sqlx::query(
            "INSERT INTO notification_preferences (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, PreferencesRow>(PREFERENCES_SELECT)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn delivery_notification_settings(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<DeliveryNotificationSettings>> {
        let row: Option<(bool, bool, bool)> = sqlx::query_as(
            r#"
            SELECT push_enabled, email_enabled, sms_enabled
            FROM delivery_notification_settings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(push_enabled, email_enabled, sms_enabled)| DeliveryNotificationSettings {
                push_enabled,
                email_enabled,
                sms_enabled,
            },
        ))
    }

    async fn insert_notification(&self, notification: NewNotification) -> SettlementResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (user_id, kind, title, body, payload, order_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(sqlx::types::Json(&notification.payload))
        .bind(notification.order_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn active_delivery_agents(&self) -> SettlementResult<Vec<DeliveryAgent>> {
        let rows: Vec<(Uuid, f64, f64, f64, bool, bool)> = sqlx::query_as(
            r#"
            SELECT user_id, latitude, longitude, max_distance_km, is_active, location_enabled
            FROM delivery_profiles
            WHERE is_active AND location_enabled
              AND latitude IS NOT NULL AND longitude IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(user_id, lat, lng, max_distance_km, is_active, location_enabled)| DeliveryAgent {
                    user_id,
                    location: GeoPoint::new(lat, lng),
                    max_distance_km,
                    is_active,
                    location_enabled,
                },
            )
            .collect())
    }

    async fn insert_delivery_order(
        &self,
        delivery: NewDeliveryOrder,
    ) -> SettlementResult<DeliveryOrder> {
        // DO UPDATE (no-op) so RETURNING yields the existing row on conflict
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            INSERT INTO delivery_orders (order_id, product_id, seller_id, delivery_fee_cents,
                                         platform_fee_cents, deliverer_earnings_cents, estimated_minutes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id, product_id) DO UPDATE SET order_id = EXCLUDED.order_id
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(delivery.order_id)
        .bind(delivery.product_id)
        .bind(delivery.seller_id)
        .bind(delivery.delivery_fee_cents)
        .bind(delivery.platform_fee_cents)
        .bind(delivery.deliverer_earnings_cents)
        .bind(delivery.estimated_minutes)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn delivered_unsettled_deliveries(
        &self,
        limit: i64,
    ) -> SettlementResult<Vec<DeliveryOrder>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            SELECT {}
            FROM delivery_orders
            WHERE status = 'delivered' AND deliverer_id IS NOT NULL AND settled_payout_id IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryOrder::try_from).collect()
    }

    async fn mark_delivery_settled(
        &self,
        delivery_order_id: Uuid,
        payout_id: Uuid,
    ) -> SettlementResult<()> {
        sqlx::query("UPDATE delivery_orders SET settled_payout_id = $2 WHERE id = $1")
            .bind(delivery_order_id)
            .bind(payout_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_ledger_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> SettlementResult<LedgerTransaction> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO transactions (order_id, order_item_id, delivery_order_id, kind, buyer_id,
                                      recipient_id, gross_cents, platform_fee_bps, platform_fee_cents,
                                      status, provider_reference)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'captured', $10)
            RETURNING id
            "#,
        )
        .bind(transaction.order_id)
        .bind(transaction.order_item_id)
        .bind(transaction.delivery_order_id)
        .bind(transaction.kind.as_str())
        .bind(transaction.buyer_id)
        .bind(transaction.recipient_id)
        .bind(transaction.gross_cents)
        .bind(bps_to_db(transaction.platform_fee_bps)?)
        .bind(transaction.platform_fee_cents)
        .bind(&transaction.provider_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTransaction {
            id,
            order_id: transaction.order_id,
            order_item_id: transaction.order_item_id,
            delivery_order_id: transaction.delivery_order_id,
            kind: transaction.kind,
            buyer_id: transaction.buyer_id,
            recipient_id: transaction.recipient_id,
            gross_cents: transaction.gross_cents,
            platform_fee_bps: transaction.platform_fee_bps,
            platform_fee_cents: transaction.platform_fee_cents,
            provider_reference: transaction.provider_reference,
        })
    }

    async fn insert_payout(&self, payout: NewPayout) -> SettlementResult<Payout> {
        if payout.net_cents < 0 {
            return Err(SettlementError::InvalidPayout(format!(
                "net amount {} is negative",
                payout.net_cents
            )));
        }

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO payouts (transaction_id, recipient_id, recipient_kind, gross_cents,
                                 platform_fee_cents, ancillary_cents, net_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING id
            "#,
        )
        .bind(payout.transaction_id)
        .bind(payout.recipient_id)
        .bind(payout.recipient_kind.as_str())
        .bind(payout.gross_cents)
        .bind(payout.platform_fee_cents)
        .bind(payout.ancillary_cents)
        .bind(payout.net_cents)
        .fetch_one(&self.pool)
        .await?;

        self.fetch_payout(id).await
    }

    async fn mark_payout_transferred(
        &self,
        payout_id: Uuid,
        reference: &str,
    ) -> SettlementResult<()> {
        sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'transferred', transfer_reference = $2, failure_reason = NULL,
                attempts = attempts + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .bind(reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_payout_not_required(&self, payout_id: Uuid) -> SettlementResult<()> {
        sqlx::query("UPDATE payouts SET status = 'not_required', updated_at = NOW() WHERE id = $1")
            .bind(payout_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, reason: &str) -> SettlementResult<()> {
        sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'failed', failure_reason = $2, attempts = attempts + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failed_payouts(&self, max_attempts: i32, limit: i64) -> SettlementResult<Vec<Payout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "{} WHERE p.status = 'failed' AND p.attempts < $1 ORDER BY p.updated_at LIMIT $2",
            PAYOUT_SELECT
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Payout::try_from).collect()
    }

    async fn payout_account(
        &self,
        recipient_id: Uuid,
        kind: RecipientKind,
    ) -> SettlementResult<Option<String>> {
        let sql = match kind {
            RecipientKind::Seller => {
                "SELECT payout_account_id FROM seller_profiles WHERE user_id = $1"
            }
            RecipientKind::Deliverer => {
                "SELECT payout_account_id FROM delivery_profiles WHERE user_id = $1"
            }
        };
        let row: Option<(Option<String>,)> = sqlx::query_as(sql)
            .bind(recipient_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(account,)| account))
    }

    async fn review_token_exists(
        &self,
        order_item_id: Uuid,
        buyer_id: Uuid,
        product_id: Uuid,
    ) -> SettlementResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM review_tokens
                WHERE order_item_id = $1 AND buyer_id = $2 AND product_id = $3
            )
            "#,
        )
        .bind(order_item_id)
        .bind(buyer_id)
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_review_token(&self, token: NewReviewToken) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO review_tokens (order_item_id, buyer_id, product_id, token, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_item_id, buyer_id, product_id) DO NOTHING
            "#,
        )
        .bind(token.order_item_id)
        .bind(token.buyer_id)
        .bind(token.product_id)
        .bind(&token.token)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_order_conversation(
        &self,
        conversation: NewOrderConversation,
    ) -> SettlementResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        let (conversation_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO conversations (order_id, buyer_id, seller_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id, seller_id) DO UPDATE SET order_id = EXCLUDED.order_id
            RETURNING id
            "#,
        )
        .bind(conversation.order_id)
        .bind(conversation.buyer_id)
        .bind(conversation.seller_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO messages (conversation_id, sender_id, body) VALUES ($1, NULL, $2)")
            .bind(conversation_id)
            .bind(&conversation.opening_message)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(conversation_id)
    }
}
