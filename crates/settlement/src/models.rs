//! Domain records for orders, stock, ledger, payouts and deliveries

use market_shared::SellerTier;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> SettlementResult<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SettlementError::Internal(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Order lifecycle; moves only forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Processing => "processing",
    Shipped => "shipped",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

impl OrderStatus {
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Confirmed => 1,
            OrderStatus::Processing => 2,
            OrderStatus::Shipped => 3,
            OrderStatus::Delivered => 4,
            OrderStatus::Cancelled => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Forward-only transitions; cancellation is allowed from any live state
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == OrderStatus::Cancelled || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Pickup,
    Delivery,
    Shipping,
}

text_enum!(DeliveryMode {
    Pickup => "pickup",
    Delivery => "delivery",
    Shipping => "shipping",
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Build a point only when both coordinates are known
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Self { lat, lng }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub delivery_mode: DeliveryMode,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    pub scheduled_date: Option<Date>,
    pub notes: Option<String>,
    pub payment_session_id: String,
    pub created_at: OffsetDateTime,
}

/// Fields needed to insert an order row
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub buyer_id: Uuid,
    pub order_number: String,
    pub total_cents: i64,
    pub delivery_mode: DeliveryMode,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    pub scheduled_date: Option<Date>,
    pub notes: Option<String>,
    pub payment_session_id: String,
}

/// Line item; the unit price is a snapshot taken at purchase time
#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

impl OrderItem {
    pub fn gross_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    /// `None` means unlimited stock
    pub stock: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Expired,
}

text_enum!(ReservationStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Expired => "expired",
});

#[derive(Debug, Clone, Serialize)]
pub struct StockReservation {
    pub id: Uuid,
    pub payment_session_id: String,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Sale,
    DeliveryLeg,
}

text_enum!(TransactionKind {
    Sale => "sale",
    DeliveryLeg => "delivery_leg",
});

/// Ledger row for money captured on behalf of a recipient
#[derive(Debug, Clone, Serialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub order_item_id: Option<Uuid>,
    pub delivery_order_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub buyer_id: Uuid,
    pub recipient_id: Uuid,
    pub gross_cents: i64,
    pub platform_fee_bps: u32,
    pub platform_fee_cents: i64,
    pub provider_reference: String,
}

#[derive(Debug, Clone)]
pub struct NewLedgerTransaction {
    pub order_id: Uuid,
    pub order_item_id: Option<Uuid>,
    pub delivery_order_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub buyer_id: Uuid,
    pub recipient_id: Uuid,
    pub gross_cents: i64,
    pub platform_fee_bps: u32,
    pub platform_fee_cents: i64,
    pub provider_reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Seller,
    Deliverer,
}

text_enum!(RecipientKind {
    Seller => "seller",
    Deliverer => "deliverer",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Transferred,
    Failed,
    /// Net amount was zero; nothing to transfer
    NotRequired,
}

text_enum!(PayoutStatus {
    Pending => "pending",
    Transferred => "transferred",
    Failed => "failed",
    NotRequired => "not_required",
});

#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_kind: RecipientKind,
    pub order_id: Uuid,
    pub product_id: Option<Uuid>,
    pub gross_cents: i64,
    pub platform_fee_cents: i64,
    pub ancillary_cents: i64,
    pub net_cents: i64,
    pub status: PayoutStatus,
    pub transfer_reference: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub transaction_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_kind: RecipientKind,
    pub gross_cents: i64,
    pub platform_fee_cents: i64,
    pub ancillary_cents: i64,
    pub net_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrderStatus {
    Pending,
    Accepted,
    PickedUp,
    Delivered,
    Cancelled,
}

text_enum!(DeliveryOrderStatus {
    Pending => "pending",
    Accepted => "accepted",
    PickedUp => "picked_up",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

/// One delivery leg per (order, product); unassigned until a deliverer accepts
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub deliverer_id: Option<Uuid>,
    pub status: DeliveryOrderStatus,
    pub delivery_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub deliverer_earnings_cents: i64,
    pub estimated_minutes: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewDeliveryOrder {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub delivery_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub deliverer_earnings_cents: i64,
    pub estimated_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellerProfile {
    pub user_id: Uuid,
    pub tier: SellerTier,
    pub payout_account_id: Option<String>,
    pub location: Option<GeoPoint>,
    pub subscription_id: Option<String>,
    pub subscription_valid_until: Option<OffsetDateTime>,
}

/// Seller subscription linkage written by subscription webhooks
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionLink {
    pub seller_id: Uuid,
    pub tier: SellerTier,
    pub subscription_id: Option<String>,
    pub status: String,
    pub valid_until: Option<OffsetDateTime>,
}

/// Contact details used by the notification channels
#[derive(Debug, Clone, Serialize)]
pub struct UserContact {
    pub user_id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl UserContact {
    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAgent {
    pub user_id: Uuid,
    pub location: GeoPoint,
    pub max_distance_km: f64,
    pub is_active: bool,
    pub location_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewReviewToken {
    pub order_item_id: Uuid,
    pub buyer_id: Uuid,
    pub product_id: Uuid,
    pub token: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewOrderConversation {
    pub order_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub opening_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_moves_forward_only() {
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Confirmed));
    }

    #[test]
    fn test_text_enums_parse_their_own_output() {
        assert_eq!(
            DeliveryOrderStatus::parse("picked_up").ok(),
            Some(DeliveryOrderStatus::PickedUp)
        );
        assert_eq!(PayoutStatus::NotRequired.as_str(), "not_required");
        assert!(DeliveryMode::parse("teleport").is_err());
    }

    #[test]
    fn test_geo_point_requires_both_coordinates() {
        assert!(GeoPoint::from_parts(Some(1.0), None).is_none());
        assert_eq!(
            GeoPoint::from_parts(Some(1.0), Some(2.0)),
            Some(GeoPoint::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_blank_phone_is_not_a_phone() {
        let contact = UserContact {
            user_id: Uuid::new_v4(),
            display_name: "Ana".into(),
            email: None,
            phone: Some("  ".into()),
        };
        assert!(!contact.has_phone());
    }
}
