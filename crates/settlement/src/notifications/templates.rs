//! Message templates for marketplace events
//!
//! Each event kind is one row: title/body with `{placeholders}`, the event
//! category, urgency, the base channel set and an optional action link.
//! Constructors below fill the variables; `render` turns an event into a
//! [`NotificationMessage`] plus the channels to request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::preferences::{Channel, EventCategory};
use crate::orders::display_order_number;

/// Link rendered as a button (email) or deep link (push/SMS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLink {
    pub label: String,
    pub path: String,
}

/// Structured message handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub category: EventCategory,
    pub urgent: bool,
    #[serde(default)]
    pub links: Vec<ActionLink>,
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    pub push: bool,
    pub email: bool,
    pub sms: bool,
}

impl ChannelSet {
    pub const ALL: ChannelSet = ChannelSet {
        push: true,
        email: true,
        sms: true,
    };
    pub const PUSH: ChannelSet = ChannelSet {
        push: true,
        email: false,
        sms: false,
    };
    pub const PUSH_EMAIL: ChannelSet = ChannelSet {
        push: true,
        email: true,
        sms: false,
    };
    pub const PUSH_SMS: ChannelSet = ChannelSet {
        push: true,
        email: false,
        sms: true,
    };

    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push,
            Channel::Email => self.email,
            Channel::Sms => self.sms,
        }
    }

    pub fn with(mut self, channel: Channel) -> Self {
        match channel {
            Channel::Push => self.push = true,
            Channel::Email => self.email = true,
            Channel::Sms => self.sms = true,
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    OrderPlaced,
    OrderPaid,
    NewOrder,
    ReadyForPickup,
    ReadyForDelivery,
    Delivered,
    Cancelled,
    DeliveryAvailable,
    DeliveryAccepted,
    DeliveryPickedUp,
    DeliveryCompleted,
    CountdownWarning,
    ShiftReminder,
    ChatMessage,
    SecurityAlert,
}

struct TemplateSpec {
    kind: TemplateKind,
    title: &'static str,
    body: &'static str,
    category: EventCategory,
    urgent: bool,
    channels: ChannelSet,
    link: Option<(&'static str, &'static str)>,
}

static TEMPLATES: &[TemplateSpec] = &[
    TemplateSpec {
        kind: TemplateKind::OrderPlaced,
        title: "Order {order_number} placed",
        body: "Thanks {buyer_name}! We received your order of {total}.",
        category: EventCategory::OrderStatus,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("View order", "/orders/{order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::OrderPaid,
        title: "Payment received for {order_number}",
        body: "Your payment of {total} was successful. The seller has been notified.",
        category: EventCategory::OrderStatus,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("View order", "/orders/{order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::NewOrder,
        title: "New order {order_number}",
        body: "{buyer_name} ordered {item_count} item(s) worth {total}.",
        category: EventCategory::NewOrder,
        urgent: true,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Open order", "/seller/orders/{order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::ReadyForPickup,
        title: "Order {order_number} is ready for pickup",
        body: "Pick up your order at {pickup_address}.",
        category: EventCategory::OrderStatus,
        urgent: false,
        channels: ChannelSet::ALL,
        link: Some(("Directions", "/orders/{order_id}/pickup")),
    },
    TemplateSpec {
        kind: TemplateKind::ReadyForDelivery,
        title: "Order {order_number} is ready for delivery",
        body: "{product_name} is packed and waiting for a courier.",
        category: EventCategory::DeliveryUpdate,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Track delivery", "/orders/{order_id}/delivery")),
    },
    TemplateSpec {
        kind: TemplateKind::Delivered,
        title: "Order {order_number} delivered",
        body: "Enjoy! Let the seller know how it went.",
        category: EventCategory::OrderStatus,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Leave a review", "/orders/{order_id}/review")),
    },
    TemplateSpec {
        kind: TemplateKind::Cancelled,
        title: "Order {order_number} cancelled",
        body: "Your order was cancelled: {reason}",
        category: EventCategory::OrderStatus,
        urgent: true,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("View order", "/orders/{order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::DeliveryAvailable,
        title: "Delivery available near you",
        body: "Pick up {product_name} and earn {earnings}. First to accept gets it.",
        category: EventCategory::DeliveryAvailable,
        urgent: true,
        channels: ChannelSet::PUSH,
        link: Some(("Accept delivery", "/deliveries/{delivery_order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::DeliveryAccepted,
        title: "A courier accepted order {order_number}",
        body: "{deliverer_name} will bring your order.",
        category: EventCategory::DeliveryUpdate,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Track delivery", "/orders/{order_id}/delivery")),
    },
    TemplateSpec {
        kind: TemplateKind::DeliveryPickedUp,
        title: "Order {order_number} is on its way",
        body: "{deliverer_name} picked up your order.",
        category: EventCategory::DeliveryUpdate,
        urgent: false,
        channels: ChannelSet::PUSH,
        link: Some(("Track delivery", "/orders/{order_id}/delivery")),
    },
    TemplateSpec {
        kind: TemplateKind::DeliveryCompleted,
        title: "Delivery completed",
        body: "You delivered order {order_number} and earned {earnings}.",
        category: EventCategory::DeliveryUpdate,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Earnings", "/deliveries/earnings")),
    },
    TemplateSpec {
        kind: TemplateKind::CountdownWarning,
        title: "{minutes} minutes left",
        body: "Delivery for order {order_number} is due in {minutes} minutes.",
        category: EventCategory::DeliveryUpdate,
        urgent: true,
        channels: ChannelSet::PUSH,
        link: Some(("Open delivery", "/deliveries/{delivery_order_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::ShiftReminder,
        title: "Your delivery shift starts soon",
        body: "Your shift starts at {shift_start}. Go online to receive orders.",
        category: EventCategory::DeliveryUpdate,
        urgent: false,
        channels: ChannelSet::PUSH,
        link: None,
    },
    TemplateSpec {
        kind: TemplateKind::ChatMessage,
        title: "New message from {sender_name}",
        body: "{preview}",
        category: EventCategory::NewMessage,
        urgent: false,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Reply", "/messages/{conversation_id}")),
    },
    TemplateSpec {
        kind: TemplateKind::SecurityAlert,
        title: "Security alert",
        body: "{detail}",
        category: EventCategory::SecurityAlert,
        urgent: true,
        channels: ChannelSet::PUSH_EMAIL,
        link: Some(("Review activity", "/settings/security")),
    },
];

fn spec_for(kind: TemplateKind) -> Option<&'static TemplateSpec> {
    TEMPLATES.iter().find(|t| t.kind == kind)
}

/// A domain event waiting to be rendered into a message
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub kind: TemplateKind,
    pub order_id: Option<Uuid>,
    vars: BTreeMap<&'static str, String>,
}

impl DomainEvent {
    pub fn new(kind: TemplateKind) -> Self {
        Self {
            kind,
            order_id: None,
            vars: BTreeMap::new(),
        }
    }

    pub fn var(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.vars.insert(key, value.into());
        self
    }

    pub fn order(mut self, order_id: Uuid, order_number: &str) -> Self {
        self.order_id = Some(order_id);
        self.var("order_id", order_id.to_string())
            .var("order_number", display_order_number(order_number))
    }

    pub fn vars(&self) -> &BTreeMap<&'static str, String> {
        &self.vars
    }

    /// Render into a message and the channel set to request.
    ///
    /// Urgent events additionally ask for SMS; the preference checks
    /// still decide whether SMS is actually sent.
    pub fn render(&self) -> Option<(NotificationMessage, ChannelSet)> {
        let spec = spec_for(self.kind)?;

        let mut channels = spec.channels;
        if spec.urgent {
            channels = channels.with(Channel::Sms);
        }

        let links = spec
            .link
            .map(|(label, path)| ActionLink {
                label: label.to_string(),
                path: fill(path, &self.vars),
            })
            .into_iter()
            .collect();

        let message = NotificationMessage {
            title: fill(spec.title, &self.vars),
            body: fill(spec.body, &self.vars),
            category: spec.category,
            urgent: spec.urgent,
            links,
            order_id: self.order_id,
            data: serde_json::json!({
                "template": self.kind,
                "vars": self.vars,
            }),
        };

        Some((message, channels))
    }
}

fn fill(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Format minor units for display, e.g. 1250 -> "€12.50"
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}€{}.{:02}", sign, abs / 100, abs % 100)
}

pub fn order_placed(order_id: Uuid, order_number: &str, buyer_name: &str, total_cents: i64) -> DomainEvent {
    DomainEvent::new(TemplateKind::OrderPlaced)
        .order(order_id, order_number)
        .var("buyer_name", buyer_name)
        .var("total", format_cents(total_cents))
}

pub fn order_paid(order_id: Uuid, order_number: &str, total_cents: i64) -> DomainEvent {
    DomainEvent::new(TemplateKind::OrderPaid)
        .order(order_id, order_number)
        .var("total", format_cents(total_cents))
}

pub fn new_order(
    order_id: Uuid,
    order_number: &str,
    buyer_name: &str,
    item_count: usize,
    seller_total_cents: i64,
) -> DomainEvent {
    DomainEvent::new(TemplateKind::NewOrder)
        .order(order_id, order_number)
        .var("buyer_name", buyer_name)
        .var("item_count", item_count.to_string())
        .var("total", format_cents(seller_total_cents))
}

pub fn ready_for_pickup(order_id: Uuid, order_number: &str, pickup_address: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::ReadyForPickup)
        .order(order_id, order_number)
        .var("pickup_address", pickup_address)
}

pub fn ready_for_delivery(order_id: Uuid, order_number: &str, product_name: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::ReadyForDelivery)
        .order(order_id, order_number)
        .var("product_name", product_name)
}

pub fn delivered(order_id: Uuid, order_number: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::Delivered).order(order_id, order_number)
}

pub fn cancelled(order_id: Uuid, order_number: &str, reason: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::Cancelled)
        .order(order_id, order_number)
        .var("reason", reason)
}

pub fn delivery_available(
    order_id: Uuid,
    order_number: &str,
    delivery_order_id: Uuid,
    product_name: &str,
    earnings_cents: i64,
) -> DomainEvent {
    DomainEvent::new(TemplateKind::DeliveryAvailable)
        .order(order_id, order_number)
        .var("delivery_order_id", delivery_order_id.to_string())
        .var("product_name", product_name)
        .var("earnings", format_cents(earnings_cents))
}

pub fn delivery_accepted(order_id: Uuid, order_number: &str, deliverer_name: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::DeliveryAccepted)
        .order(order_id, order_number)
        .var("deliverer_name", deliverer_name)
}

pub fn delivery_picked_up(order_id: Uuid, order_number: &str, deliverer_name: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::DeliveryPickedUp)
        .order(order_id, order_number)
        .var("deliverer_name", deliverer_name)
}

pub fn delivery_completed(order_id: Uuid, order_number: &str, earnings_cents: i64) -> DomainEvent {
    DomainEvent::new(TemplateKind::DeliveryCompleted)
        .order(order_id, order_number)
        .var("earnings", format_cents(earnings_cents))
}

pub fn countdown_warning(
    order_id: Uuid,
    order_number: &str,
    delivery_order_id: Uuid,
    minutes: u32,
) -> DomainEvent {
    DomainEvent::new(TemplateKind::CountdownWarning)
        .order(order_id, order_number)
        .var("delivery_order_id", delivery_order_id.to_string())
        .var("minutes", minutes.to_string())
}

pub fn shift_reminder(shift_start: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::ShiftReminder).var("shift_start", shift_start)
}

pub fn chat_message(conversation_id: Uuid, sender_name: &str, text: &str) -> DomainEvent {
    let preview: String = text.chars().take(120).collect();
    DomainEvent::new(TemplateKind::ChatMessage)
        .var("conversation_id", conversation_id.to_string())
        .var("sender_name", sender_name)
        .var("preview", preview)
}

pub fn security_alert(detail: &str) -> DomainEvent {
    DomainEvent::new(TemplateKind::SecurityAlert).var("detail", detail)
}
