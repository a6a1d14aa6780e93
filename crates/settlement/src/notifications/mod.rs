//! Multi-channel notification dispatch
//!
//! Preferences decide which channels may carry a message, templates build
//! the message, the dispatcher performs the sends and writes the audit row.

pub mod channels;
pub mod dispatcher;
pub mod preferences;
pub mod templates;

use serde::{Deserialize, Serialize};

pub use channels::{EmailClient, HttpPushBroker, PushBroker, ResendEmailClient, SmsClient, TwilioSmsClient};
pub use dispatcher::{ChannelOutcome, DispatchReport, NotificationDispatcher};
pub use preferences::{
    channel_allowed, Channel, DeliveryNotificationSettings, EventCategory, NotificationPreferences,
    QuietHours,
};
pub use templates::{ActionLink, ChannelSet, DomainEvent, NotificationMessage, TemplateKind};

/// Normalized notification type stored on the audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewOrder,
    OrderUpdate,
    Delivery,
    Message,
    Security,
    Review,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewOrder => "new_order",
            NotificationKind::OrderUpdate => "order_update",
            NotificationKind::Delivery => "delivery",
            NotificationKind::Message => "message",
            NotificationKind::Security => "security",
            NotificationKind::Review => "review",
            NotificationKind::System => "system",
        }
    }
}

impl From<EventCategory> for NotificationKind {
    fn from(category: EventCategory) -> Self {
        match category {
            EventCategory::NewOrder => NotificationKind::NewOrder,
            EventCategory::OrderStatus => NotificationKind::OrderUpdate,
            EventCategory::DeliveryAvailable | EventCategory::DeliveryUpdate => {
                NotificationKind::Delivery
            }
            EventCategory::NewMessage => NotificationKind::Message,
            EventCategory::SecurityAlert => NotificationKind::Security,
            EventCategory::ReviewRequest => NotificationKind::Review,
            EventCategory::System => NotificationKind::System,
        }
    }
}

/// Audit record written once per dispatched message
#[derive(Debug, Clone, Serialize)]
pub struct NewNotification {
    pub user_id: uuid::Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
    pub order_id: Option<uuid::Uuid>,
}
