//! Per-user channel preferences and the category lookup table
//!
//! Every event category maps to at most one preference flag. The mapping is a
//! static table consulted once per send instead of a branch per event type.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time, UtcOffset};
use uuid::Uuid;

use crate::models::UserContact;

/// Delivery channel for a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Push, Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

/// Typed event category carried by every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    NewOrder,
    OrderStatus,
    DeliveryAvailable,
    DeliveryUpdate,
    NewMessage,
    SecurityAlert,
    ReviewRequest,
    System,
}

/// The preference flag an event category is governed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceKey {
    NewOrder,
    OrderStatus,
    DeliveryUpdate,
    NewMessage,
    SecurityAlert,
}

struct CategoryRule {
    category: EventCategory,
    key: Option<PreferenceKey>,
    /// Whether delivery-profile overrides apply to this category
    delivery_scoped: bool,
}

static CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: EventCategory::NewOrder,
        key: Some(PreferenceKey::NewOrder),
        delivery_scoped: false,
    },
    CategoryRule {
        category: EventCategory::OrderStatus,
        key: Some(PreferenceKey::OrderStatus),
        delivery_scoped: false,
    },
    CategoryRule {
        category: EventCategory::DeliveryAvailable,
        key: Some(PreferenceKey::DeliveryUpdate),
        delivery_scoped: true,
    },
    CategoryRule {
        category: EventCategory::DeliveryUpdate,
        key: Some(PreferenceKey::DeliveryUpdate),
        delivery_scoped: true,
    },
    CategoryRule {
        category: EventCategory::NewMessage,
        key: Some(PreferenceKey::NewMessage),
        delivery_scoped: false,
    },
    CategoryRule {
        category: EventCategory::SecurityAlert,
        key: Some(PreferenceKey::SecurityAlert),
        delivery_scoped: false,
    },
    CategoryRule {
        category: EventCategory::ReviewRequest,
        key: None,
        delivery_scoped: false,
    },
    CategoryRule {
        category: EventCategory::System,
        key: None,
        delivery_scoped: false,
    },
];

fn rule_for(category: EventCategory) -> Option<&'static CategoryRule> {
    CATEGORY_RULES.iter().find(|r| r.category == category)
}

/// Push/email toggles for each preference key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFlags {
    pub new_order: bool,
    pub order_status: bool,
    pub delivery_update: bool,
    pub new_message: bool,
    pub security_alert: bool,
}

impl CategoryFlags {
    pub const ENABLED: CategoryFlags = CategoryFlags {
        new_order: true,
        order_status: true,
        delivery_update: true,
        new_message: true,
        security_alert: true,
    };

    pub fn get(&self, key: PreferenceKey) -> bool {
        match key {
            PreferenceKey::NewOrder => self.new_order,
            PreferenceKey::OrderStatus => self.order_status,
            PreferenceKey::DeliveryUpdate => self.delivery_update,
            PreferenceKey::NewMessage => self.new_message,
            PreferenceKey::SecurityAlert => self.security_alert,
        }
    }

    pub fn any(&self) -> bool {
        self.new_order
            || self.order_status
            || self.delivery_update
            || self.new_message
            || self.security_alert
    }
}

/// SMS toggles; `None` means the user never opted in or out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsFlags {
    pub new_order: Option<bool>,
    pub order_status: Option<bool>,
    pub delivery_update: Option<bool>,
    pub new_message: Option<bool>,
    pub security_alert: Option<bool>,
}

impl SmsFlags {
    pub fn get(&self, key: PreferenceKey) -> Option<bool> {
        match key {
            PreferenceKey::NewOrder => self.new_order,
            PreferenceKey::OrderStatus => self.order_status,
            PreferenceKey::DeliveryUpdate => self.delivery_update,
            PreferenceKey::NewMessage => self.new_message,
            PreferenceKey::SecurityAlert => self.security_alert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: Option<Time>,
    pub end: Option<Time>,
    /// Offset of the user's local time from UTC
    pub utc_offset_minutes: i16,
}

impl QuietHours {
    pub const DISABLED: QuietHours = QuietHours {
        enabled: false,
        start: None,
        end: None,
        utc_offset_minutes: 0,
    };

    /// Whether `now` falls inside the window, in the user's local time.
    ///
    /// Windows with `start > end` wrap past midnight. An empty window
    /// (`start == end`) never matches.
    pub fn contains(&self, now: OffsetDateTime) -> bool {
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return false;
        };
        if !self.enabled || start == end {
            return false;
        }

        let offset = UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60)
            .unwrap_or(UtcOffset::UTC);
        let local = now.to_offset(offset).time();

        if start < end {
            local >= start && local < end
        } else {
            local >= start || local < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub push: CategoryFlags,
    pub email: CategoryFlags,
    pub sms: SmsFlags,
    pub quiet_hours: QuietHours,
}

impl NotificationPreferences {
    /// The row created for users who never saved preferences
    pub fn all_enabled(user_id: Uuid) -> Self {
        Self {
            user_id,
            push: CategoryFlags::ENABLED,
            email: CategoryFlags::ENABLED,
            sms: SmsFlags::default(),
            quiet_hours: QuietHours::DISABLED,
        }
    }
}

/// Channel toggles from a deliverer's delivery profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryNotificationSettings {
    pub push_enabled: bool,
    pub email_enabled: bool,
    pub sms_enabled: bool,
}

impl DeliveryNotificationSettings {
    fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push_enabled,
            Channel::Email => self.email_enabled,
            Channel::Sms => self.sms_enabled,
        }
    }
}

/// Decide whether one channel may carry a message of `category`.
pub fn channel_allowed(
    channel: Channel,
    category: EventCategory,
    prefs: &NotificationPreferences,
    delivery: Option<&DeliveryNotificationSettings>,
    contact: &UserContact,
) -> bool {
    if channel == Channel::Sms && !contact.has_phone() {
        return false;
    }

    let rule = rule_for(category);

    if let (Some(rule), Some(settings)) = (rule, delivery) {
        if rule.delivery_scoped && settings.enabled(channel) {
            return true;
        }
    }

    let key = rule.and_then(|r| r.key);
    match (channel, key) {
        (Channel::Push, Some(key)) => prefs.push.get(key),
        (Channel::Push, None) => true,
        (Channel::Email, Some(key)) => prefs.email.get(key),
        (Channel::Email, None) => prefs.email.any(),
        (Channel::Sms, Some(PreferenceKey::SecurityAlert)) => {
            prefs.sms.security_alert.unwrap_or(true)
        }
        (Channel::Sms, Some(key)) => prefs.sms.get(key) == Some(true),
        (Channel::Sms, None) => false,
    }
}
