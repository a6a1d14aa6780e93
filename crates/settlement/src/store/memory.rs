//! In-memory store for tests and local runs
//!
//! A transaction holds the state lock for its whole lifetime and works on a
//! staged copy; `commit` swaps the copy in, dropping it discards the copy.
//! That gives the same serialization on contended rows as `FOR UPDATE`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{MarketStore, OrderTransaction};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    DeliveryAgent, DeliveryOrder, DeliveryOrderStatus, LedgerTransaction, NewDeliveryOrder,
    NewLedgerTransaction, NewOrder, NewOrderConversation, NewOrderItem, NewPayout, NewReviewToken,
    Order, OrderItem, OrderStatus, Payout, PayoutStatus, Product, RecipientKind,
    ReservationStatus, SellerProfile, StockReservation, SubscriptionLink, UserContact,
};
use crate::notifications::preferences::{DeliveryNotificationSettings, NotificationPreferences};
use crate::notifications::NewNotification;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: HashMap<Uuid, UserContact>,
    pub products: HashMap<Uuid, Product>,
    pub sellers: HashMap<Uuid, SellerProfile>,
    pub customer_ids: HashMap<String, Uuid>,
    pub subscription_statuses: HashMap<Uuid, String>,
    pub agents: HashMap<Uuid, DeliveryAgent>,
    pub deliverer_accounts: HashMap<Uuid, String>,
    pub orders: Vec<Order>,
    pub order_items: Vec<OrderItem>,
    pub reservations: Vec<StockReservation>,
    pub transactions: Vec<LedgerTransaction>,
    pub payouts: Vec<Payout>,
    pub payout_attempts: HashMap<Uuid, i32>,
    pub delivery_orders: Vec<DeliveryOrder>,
    pub settled_deliveries: HashMap<Uuid, Uuid>,
    pub preferences: HashMap<Uuid, NotificationPreferences>,
    pub delivery_settings: HashMap<Uuid, DeliveryNotificationSettings>,
    pub notifications: Vec<NewNotification>,
    pub review_tokens: Vec<NewReviewToken>,
    pub conversations: HashMap<(Uuid, Uuid), Uuid>,
    pub messages: Vec<StoredMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current committed state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn add_user(&self, contact: UserContact) {
        self.state.lock().await.users.insert(contact.user_id, contact);
    }

    pub async fn add_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn add_seller(&self, profile: SellerProfile, customer_id: Option<&str>) {
        let mut state = self.state.lock().await;
        if let Some(customer_id) = customer_id {
            state
                .customer_ids
                .insert(customer_id.to_string(), profile.user_id);
        }
        state.sellers.insert(profile.user_id, profile);
    }

    pub async fn add_delivery_agent(&self, agent: DeliveryAgent, payout_account: Option<&str>) {
        let mut state = self.state.lock().await;
        if let Some(account) = payout_account {
            state
                .deliverer_accounts
                .insert(agent.user_id, account.to_string());
        }
        state.agents.insert(agent.user_id, agent);
    }

    pub async fn set_preferences(&self, prefs: NotificationPreferences) {
        self.state.lock().await.preferences.insert(prefs.user_id, prefs);
    }

    pub async fn set_delivery_settings(&self, user_id: Uuid, settings: DeliveryNotificationSettings) {
        self.state
            .lock()
            .await
            .delivery_settings
            .insert(user_id, settings);
    }

    pub async fn add_reservation(
        &self,
        payment_session_id: &str,
        product_id: Uuid,
        quantity: i32,
        created_at: OffsetDateTime,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.reservations.push(StockReservation {
            id,
            payment_session_id: payment_session_id.to_string(),
            product_id,
            quantity,
            status: ReservationStatus::Pending,
            created_at,
        });
        id
    }

    pub async fn set_delivery_status(
        &self,
        delivery_order_id: Uuid,
        status: DeliveryOrderStatus,
        deliverer_id: Option<Uuid>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(delivery) = state
            .delivery_orders
            .iter_mut()
            .find(|d| d.id == delivery_order_id)
        {
            delivery.status = status;
            if deliverer_id.is_some() {
                delivery.deliverer_id = deliverer_id;
            }
        }
    }
}

impl MemoryState {
    fn product_for_transaction(&self, transaction: &LedgerTransaction) -> Option<Uuid> {
        if let Some(item_id) = transaction.order_item_id {
            return self
                .order_items
                .iter()
                .find(|i| i.id == item_id)
                .map(|i| i.product_id);
        }
        transaction.delivery_order_id.and_then(|id| {
            self.delivery_orders
                .iter()
                .find(|d| d.id == id)
                .map(|d| d.product_id)
        })
    }

    fn payout_mut(&mut self, payout_id: Uuid) -> SettlementResult<&mut Payout> {
        self.payouts
            .iter_mut()
            .find(|p| p.id == payout_id)
            .ok_or_else(|| SettlementError::NotFound(format!("payout {}", payout_id)))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    async fn insert_order(&mut self, order: NewOrder) -> SettlementResult<Order> {
        if self
            .staged
            .orders
            .iter()
            .any(|o| o.payment_session_id == order.payment_session_id)
        {
            return Err(SettlementError::DuplicateOrder(order.payment_session_id));
        }

        let order = Order {
            id: Uuid::new_v4(),
            buyer_id: order.buyer_id,
            order_number: order.order_number,
            status: OrderStatus::Confirmed,
            total_cents: order.total_cents,
            delivery_mode: order.delivery_mode,
            pickup_address: order.pickup_address,
            delivery_address: order.delivery_address,
            scheduled_date: order.scheduled_date,
            notes: order.notes,
            payment_session_id: order.payment_session_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.staged.orders.push(order.clone());
        Ok(order)
    }

    async fn lock_product(&mut self, product_id: Uuid) -> SettlementResult<Option<Product>> {
        Ok(self.staged.products.get(&product_id).cloned())
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> SettlementResult<OrderItem> {
        let item = OrderItem {
            id: Uuid::new_v4(),
            order_id: item.order_id,
            product_id: item.product_id,
            seller_id: item.seller_id,
            quantity: item.quantity,
            unit_price_cents: item.unit_price_cents,
        };
        self.staged.order_items.push(item.clone());
        Ok(item)
    }

    async fn confirm_reservation(
        &mut self,
        payment_session_id: &str,
        product_id: Uuid,
    ) -> SettlementResult<u64> {
        let mut touched = 0;
        for reservation in self.staged.reservations.iter_mut().filter(|r| {
            r.payment_session_id == payment_session_id
                && r.product_id == product_id
                && r.status == ReservationStatus::Pending
        }) {
            reservation.status = ReservationStatus::Confirmed;
            touched += 1;
        }
        Ok(touched)
    }

    async fn decrement_stock(
        &mut self,
        product_id: Uuid,
        quantity: i32,
    ) -> SettlementResult<Option<i32>> {
        let product = self
            .staged
            .products
            .get_mut(&product_id)
            .ok_or_else(|| SettlementError::NotFound(format!("product {}", product_id)))?;
        Ok(product.stock.as_mut().map(|stock| {
            *stock -= quantity;
            *stock
        }))
    }

    async fn commit(self: Box<Self>) -> SettlementResult<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn begin(&self) -> SettlementResult<Box<dyn OrderTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn find_order_by_session(
        &self,
        payment_session_id: &str,
    ) -> SettlementResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .iter()
            .find(|o| o.payment_session_id == payment_session_id)
            .cloned())
    }

    async fn order(&self, order_id: Uuid) -> SettlementResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.id == order_id).cloned())
    }

    async fn order_items(&self, order_id: Uuid) -> SettlementResult<Vec<OrderItem>> {
        let state = self.state.lock().await;
        Ok(state
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn product(&self, product_id: Uuid) -> SettlementResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(&product_id).cloned())
    }

    async fn expire_stale_reservations(
        &self,
        created_before: OffsetDateTime,
    ) -> SettlementResult<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for reservation in state
            .reservations
            .iter_mut()
            .filter(|r| r.status == ReservationStatus::Pending && r.created_at < created_before)
        {
            reservation.status = ReservationStatus::Expired;
            expired += 1;
        }
        Ok(expired)
    }

    async fn seller_profile(&self, seller_id: Uuid) -> SettlementResult<Option<SellerProfile>> {
        Ok(self.state.lock().await.sellers.get(&seller_id).cloned())
    }

    async fn seller_id_for_customer(&self, customer_id: &str) -> SettlementResult<Option<Uuid>> {
        Ok(self.state.lock().await.customer_ids.get(customer_id).copied())
    }

    async fn update_seller_subscription(&self, link: &SubscriptionLink) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        let profile = state
            .sellers
            .get_mut(&link.seller_id)
            .ok_or_else(|| SettlementError::NotFound(format!("seller {}", link.seller_id)))?;
        profile.tier = link.tier;
        profile.subscription_id = link.subscription_id.clone();
        profile.subscription_valid_until = link.valid_until;
        state
            .subscription_statuses
            .insert(link.seller_id, link.status.clone());
        Ok(())
    }

    async fn user_contact(&self, user_id: Uuid) -> SettlementResult<Option<UserContact>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<NotificationPreferences>> {
        Ok(self.state.lock().await.preferences.get(&user_id).cloned())
    }

    async fn insert_default_preferences(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<NotificationPreferences> {
        let mut state = self.state.lock().await;
        Ok(state
            .preferences
            .entry(user_id)
            .or_insert_with(|| NotificationPreferences::all_enabled(user_id))
            .clone())
    }

    async fn delivery_notification_settings(
        &self,
        user_id: Uuid,
    ) -> SettlementResult<Option<DeliveryNotificationSettings>> {
        Ok(self
            .state
            .lock()
            .await
            .delivery_settings
            .get(&user_id)
            .copied())
    }

    async fn insert_notification(&self, notification: NewNotification) -> SettlementResult<Uuid> {
        self.state.lock().await.notifications.push(notification);
        Ok(Uuid::new_v4())
    }

    async fn active_delivery_agents(&self) -> SettlementResult<Vec<DeliveryAgent>> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .values()
            .filter(|a| a.is_active && a.location_enabled)
            .cloned()
            .collect())
    }

    async fn insert_delivery_order(
        &self,
        delivery: NewDeliveryOrder,
    ) -> SettlementResult<DeliveryOrder> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .delivery_orders
            .iter()
            .find(|d| d.order_id == delivery.order_id && d.product_id == delivery.product_id)
        {
            return Ok(existing.clone());
        }
        let record = DeliveryOrder {
            id: Uuid::new_v4(),
            order_id: delivery.order_id,
            product_id: delivery.product_id,
            seller_id: delivery.seller_id,
            deliverer_id: None,
            status: DeliveryOrderStatus::Pending,
            delivery_fee_cents: delivery.delivery_fee_cents,
            platform_fee_cents: delivery.platform_fee_cents,
            deliverer_earnings_cents: delivery.deliverer_earnings_cents,
            estimated_minutes: delivery.estimated_minutes,
        };
        state.delivery_orders.push(record.clone());
        Ok(record)
    }

    async fn delivered_unsettled_deliveries(
        &self,
        limit: i64,
    ) -> SettlementResult<Vec<DeliveryOrder>> {
        let state = self.state.lock().await;
        Ok(state
            .delivery_orders
            .iter()
            .filter(|d| {
                d.status == DeliveryOrderStatus::Delivered
                    && d.deliverer_id.is_some()
                    && !state.settled_deliveries.contains_key(&d.id)
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_delivery_settled(
        &self,
        delivery_order_id: Uuid,
        payout_id: Uuid,
    ) -> SettlementResult<()> {
        self.state
            .lock()
            .await
            .settled_deliveries
            .insert(delivery_order_id, payout_id);
        Ok(())
    }

    async fn insert_ledger_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> SettlementResult<LedgerTransaction> {
        let record = LedgerTransaction {
            id: Uuid::new_v4(),
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
        };
        self.state.lock().await.transactions.push(record.clone());
        Ok(record)
    }

    async fn insert_payout(&self, payout: NewPayout) -> SettlementResult<Payout> {
        if payout.net_cents < 0 {
            return Err(SettlementError::InvalidPayout(format!(
                "net amount {} is negative",
                payout.net_cents
            )));
        }
        let mut state = self.state.lock().await;
        let transaction = state
            .transactions
            .iter()
            .find(|t| t.id == payout.transaction_id)
            .cloned()
            .ok_or_else(|| {
                SettlementError::NotFound(format!("transaction {}", payout.transaction_id))
            })?;

        let record = Payout {
            id: Uuid::new_v4(),
            transaction_id: payout.transaction_id,
            recipient_id: payout.recipient_id,
            recipient_kind: payout.recipient_kind,
            order_id: transaction.order_id,
            product_id: state.product_for_transaction(&transaction),
            gross_cents: payout.gross_cents,
            platform_fee_cents: payout.platform_fee_cents,
            ancillary_cents: payout.ancillary_cents,
            net_cents: payout.net_cents,
            status: PayoutStatus::Pending,
            transfer_reference: None,
            failure_reason: None,
        };
        state.payouts.push(record.clone());
        Ok(record)
    }

    async fn mark_payout_transferred(
        &self,
        payout_id: Uuid,
        reference: &str,
    ) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        let payout = state.payout_mut(payout_id)?;
        payout.status = PayoutStatus::Transferred;
        payout.transfer_reference = Some(reference.to_string());
        payout.failure_reason = None;
        *state.payout_attempts.entry(payout_id).or_insert(0) += 1;
        Ok(())
    }

    async fn mark_payout_not_required(&self, payout_id: Uuid) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        state.payout_mut(payout_id)?.status = PayoutStatus::NotRequired;
        Ok(())
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, reason: &str) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        let payout = state.payout_mut(payout_id)?;
        payout.status = PayoutStatus::Failed;
        payout.failure_reason = Some(reason.to_string());
        *state.payout_attempts.entry(payout_id).or_insert(0) += 1;
        Ok(())
    }

    async fn failed_payouts(&self, max_attempts: i32, limit: i64) -> SettlementResult<Vec<Payout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .filter(|p| {
                p.status == PayoutStatus::Failed
                    && state.payout_attempts.get(&p.id).copied().unwrap_or(0) < max_attempts
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn payout_account(
        &self,
        recipient_id: Uuid,
        kind: RecipientKind,
    ) -> SettlementResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(match kind {
            RecipientKind::Seller => state
                .sellers
                .get(&recipient_id)
                .and_then(|s| s.payout_account_id.clone()),
            RecipientKind::Deliverer => state.deliverer_accounts.get(&recipient_id).cloned(),
        })
    }

    async fn review_token_exists(
        &self,
        order_item_id: Uuid,
        buyer_id: Uuid,
        product_id: Uuid,
    ) -> SettlementResult<bool> {
        let state = self.state.lock().await;
        Ok(state.review_tokens.iter().any(|t| {
            t.order_item_id == order_item_id && t.buyer_id == buyer_id && t.product_id == product_id
        }))
    }

    async fn insert_review_token(&self, token: NewReviewToken) -> SettlementResult<()> {
        self.state.lock().await.review_tokens.push(token);
        Ok(())
    }

    async fn open_order_conversation(
        &self,
        conversation: NewOrderConversation,
    ) -> SettlementResult<Uuid> {
        let mut state = self.state.lock().await;
        let key = (conversation.order_id, conversation.seller_id);
        let id = *state.conversations.entry(key).or_insert_with(Uuid::new_v4);
        state.messages.push(StoredMessage {
            conversation_id: id,
            sender_id: None,
            body: conversation.opening_message,
        });
        Ok(id)
    }
}
