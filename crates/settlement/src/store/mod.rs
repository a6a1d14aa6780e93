//! Persistence seam for the settlement pipeline
//!
//! `MarketStore` covers single-statement reads and writes. Anything that must
//! be atomic goes through an `OrderTransaction` obtained from `begin`;
//! dropping a transaction without calling `commit` rolls it back.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SettlementResult;
use crate::models::{
    DeliveryAgent, DeliveryOrder, LedgerTransaction, NewDeliveryOrder, NewLedgerTransaction,
    NewOrder, NewOrderConversation, NewOrderItem, NewPayout, NewReviewToken, Order, OrderItem,
    Payout, Product, RecipientKind, SellerProfile, SubscriptionLink, UserContact,
};
use crate::notifications::preferences::{DeliveryNotificationSettings, NotificationPreferences};
use crate::notifications::NewNotification;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Unit of work for order creation
#[async_trait]
pub trait OrderTransaction: Send {
    async fn insert_order(&mut self, order: NewOrder) -> SettlementResult<Order>;

    /// Read a product and hold its row until the transaction ends
    async fn lock_product(&mut self, product_id: Uuid) -> SettlementResult<Option<Product>>;

    async fn insert_order_item(&mut self, item: NewOrderItem) -> SettlementResult<OrderItem>;

    /// Mark pending reservations for (session, product) confirmed; returns rows touched
    async fn confirm_reservation(
        &mut self,
        payment_session_id: &str,
        product_id: Uuid,
    ) -> SettlementResult<u64>;

    /// Decrement tracked stock and return the new level (`None` when unlimited)
    async fn decrement_stock(
        &mut self,
        product_id: Uuid,
        quantity: i32,
    ) -> SettlementResult<Option<i32>>;

    async fn commit(self: Box<Self>) -> SettlementResult<()>;
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn begin(&self) -> SettlementResult<Box<dyn OrderTransaction>>;

    // Orders

    async fn find_order_by_session(&self, payment_session_id: &str)
        -> SettlementResult<Option<Order>>;

    async fn order(&self, order_id: Uuid) -> SettlementResult<Option<Order>>;

    async fn order_items(&self, order_id: Uuid) -> SettlementResult<Vec<OrderItem>>;

    async fn product(&self, product_id: Uuid) -> SettlementResult<Option<Product>>;

    async fn expire_stale_reservations(&self, created_before: OffsetDateTime)
        -> SettlementResult<u64>;

    // Sellers and subscriptions

    async fn seller_profile(&self, seller_id: Uuid) -> SettlementResult<Option<SellerProfile>>;

    async fn seller_id_for_customer(&self, customer_id: &str) -> SettlementResult<Option<Uuid>>;

    async fn update_seller_subscription(&self, link: &SubscriptionLink) -> SettlementResult<()>;

    // Users and notification settings

    async fn user_contact(&self, user_id: Uuid) -> SettlementResult<Option<UserContact>>;

    async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<NotificationPreferences>>;

    /// Insert the all-enabled default row; returns whatever row exists afterwards
    async fn insert_default_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<NotificationPreferences>;

    async fn delivery_notification_settings(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<DeliveryNotificationSettings>>;

    async fn insert_notification(&self, notification: NewNotification) -> SettlementResult<Uuid>;

    // Deliveries

    async fn active_delivery_agents(&self) -> SettlementResult<Vec<DeliveryAgent>>;

    async fn insert_delivery_order(
        &self,
        delivery: NewDeliveryOrder,
    ) -> SettlementResult<DeliveryOrder>;

    async fn delivered_unsettled_deliveries(&self, limit: i64)
        -> SettlementResult<Vec<DeliveryOrder>>;

    async fn mark_delivery_settled(&self, delivery_order_id: Uuid, payout_id: Uuid)
        -> SettlementResult<()>;

    // Ledger and payouts

    async fn insert_ledger_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> SettlementResult<LedgerTransaction>;

    async fn insert_payout(&self, payout: NewPayout) -> SettlementResult<Payout>;

    async fn mark_payout_transferred(&self, payout_id: Uuid, reference: &str)
        -> SettlementResult<()>;

    async fn mark_payout_not_required(&self, payout_id: Uuid) -> SettlementResult<()>;

    /// Record a failed attempt; increments the attempt counter
    async fn mark_payout_failed(&self, payout_id: Uuid, reason: &str) -> SettlementResult<()>;

    async fn failed_payouts(&self, max_attempts: i32, limit: i64) -> SettlementResult<Vec<Payout>>;

    async fn payout_account(
        &self,
        recipient_id: Uuid,
        kind: RecipientKind,
    ) -> SettlementResult<Option<String>>;

    // Post-purchase artifacts

    async fn review_token_exists(
        &self,
        order_item_id: Uuid,
        buyer_id: Uuid,
        product_id: Uuid,
    ) -> SettlementResult<bool>;

    async fn insert_review_token(&self, token: NewReviewToken) -> SettlementResult<()>;

    /// Open (or reuse) the conversation for (order, seller) and post the opening message
    async fn open_order_conversation(
        &self,
        conversation: NewOrderConversation,
    ) -> SettlementResult<Uuid>;
}
