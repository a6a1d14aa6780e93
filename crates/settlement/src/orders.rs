//! Atomic order creation
//!
//! Creates the order, its line items, confirms stock reservations and
//! decrements stock inside one store transaction. Nothing outside the
//! transaction happens here; notifications and payouts run after commit.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};
use crate::models::{DeliveryMode, NewOrder, NewOrderItem, Order, OrderItem};
use crate::store::MarketStore;

const ORDER_NUMBER_PREFIX: &str = "MKT";
const ORDER_SUFFIX_LEN: usize = 6;
/// No 0/O or 1/I so numbers survive being read over the phone
const ORDER_SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate an order number like `MKT-20250601-K7Q2XM`
pub fn generate_order_number(now: OffsetDateTime) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ORDER_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ORDER_SUFFIX_ALPHABET.len());
            char::from(ORDER_SUFFIX_ALPHABET[idx])
        })
        .collect();
    format!(
        "{}-{:04}{:02}{:02}-{}",
        ORDER_NUMBER_PREFIX,
        now.year(),
        u8::from(now.month()),
        now.day(),
        suffix
    )
}

/// Short form shown to users: `#K7Q2XM`
pub fn display_order_number(order_number: &str) -> String {
    let short = order_number.rsplit('-').next().unwrap_or(order_number);
    format!("#{}", short)
}

/// One purchased line as carried in checkout metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasedItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub seller_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub buyer_id: Uuid,
    pub payment_session_id: String,
    pub items: Vec<PurchasedItem>,
    /// Amount charged for the session; falls back to the item sum when absent
    pub total_cents: Option<i64>,
    pub delivery_mode: DeliveryMode,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    pub scheduled_date: Option<Date>,
    pub notes: Option<String>,
}

impl OrderRequest {
    pub fn items_total_cents(&self) -> i64 {
        self.items
            .iter()
            .map(|i| i.unit_price_cents * i64::from(i.quantity))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    /// product id -> order item id
    pub item_by_product: HashMap<Uuid, Uuid>,
}

/// Creates orders and moves stock
#[derive(Clone)]
pub struct OrderTransactionManager {
    store: Arc<dyn MarketStore>,
}

impl OrderTransactionManager {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    /// Create the order and its items, all or nothing.
    ///
    /// Fails with `InsufficientStock` when a tracked product has less stock
    /// than requested (zero stock included), `NotFound` for unknown products
    /// and `DuplicateOrder` when the payment session already has an order.
    pub async fn create_order(&self, request: &OrderRequest) -> SettlementResult<CreatedOrder> {
        validate(request)?;

        let mut tx = self.store.begin().await?;

        let order = tx
            .insert_order(NewOrder {
                buyer_id: request.buyer_id,
                order_number: generate_order_number(OffsetDateTime::now_utc()),
                total_cents: request
                    .total_cents
                    .unwrap_or_else(|| request.items_total_cents()),
                delivery_mode: request.delivery_mode,
                pickup_address: request.pickup_address.clone(),
                delivery_address: request.delivery_address.clone(),
                scheduled_date: request.scheduled_date,
                notes: request.notes.clone(),
                payment_session_id: request.payment_session_id.clone(),
            })
            .await?;

        let mut items = Vec::with_capacity(request.items.len());
        let mut item_by_product = HashMap::new();

        for purchased in &request.items {
            let product = tx
                .lock_product(purchased.product_id)
                .await?
                .ok_or_else(|| {
                    SettlementError::NotFound(format!("product {}", purchased.product_id))
                })?;

            if let Some(stock) = product.stock {
                if stock < purchased.quantity {
                    tracing::warn!(
                        product_id = %product.id,
                        requested = purchased.quantity,
                        available = stock,
                        session = %request.payment_session_id,
                        "Insufficient stock, rolling back order"
                    );
                    return Err(SettlementError::InsufficientStock {
                        product_id: product.id,
                        requested: purchased.quantity,
                        available: stock,
                    });
                }
            }

            if product.seller_id != purchased.seller_id {
                tracing::warn!(
                    product_id = %product.id,
                    metadata_seller = %purchased.seller_id,
                    product_seller = %product.seller_id,
                    "Checkout seller does not match product owner, using product owner"
                );
            }

            let item = tx
                .insert_order_item(NewOrderItem {
                    order_id: order.id,
                    product_id: product.id,
                    seller_id: product.seller_id,
                    quantity: purchased.quantity,
                    unit_price_cents: purchased.unit_price_cents,
                })
                .await?;

            tx.confirm_reservation(&request.payment_session_id, product.id)
                .await?;

            let remaining = tx.decrement_stock(product.id, purchased.quantity).await?;
            if let Some(stock) = remaining {
                if stock < 0 {
                    tracing::error!(
                        product_id = %product.id,
                        stock = stock,
                        "Stock went negative inside order transaction"
                    );
                    return Err(SettlementError::NegativeStock {
                        product_id: product.id,
                        stock,
                    });
                }
            }

            item_by_product.insert(item.product_id, item.id);
            items.push(item);
        }

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            items = items.len(),
            "Order created"
        );

        Ok(CreatedOrder {
            order,
            items,
            item_by_product,
        })
    }

    /// Release pending reservations older than `ttl`
    pub async fn expire_reservations(&self, ttl: time::Duration) -> SettlementResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - ttl;
        let expired = self.store.expire_stale_reservations(cutoff).await?;
        if expired > 0 {
            tracing::info!(expired = expired, "Expired stale stock reservations");
        }
        Ok(expired)
    }
}

fn validate(request: &OrderRequest) -> SettlementResult<()> {
    if request.items.is_empty() {
        return Err(SettlementError::InvalidPayload(
            "checkout has no items".to_string(),
        ));
    }
    if let Some(bad) = request.items.iter().find(|i| i.quantity <= 0) {
        return Err(SettlementError::InvalidPayload(format!(
            "quantity {} for product {} must be positive",
            bad.quantity, bad.product_id
        )));
    }
    if let Some(bad) = request.items.iter().find(|i| i.unit_price_cents < 0) {
        return Err(SettlementError::InvalidPayload(format!(
            "negative unit price for product {}",
            bad.product_id
        )));
    }
    Ok(())
}
