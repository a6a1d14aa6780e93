//! Per-user notification dispatch
//!
//! Decides which channels may carry a message, attempts each one on its own
//! and writes the audit record. Channel failures are reported, never raised.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::channels::{
    user_channel, EmailClient, HttpPushBroker, PushBroker, ResendEmailClient, SmsClient,
    TwilioSmsClient,
};
use super::preferences::{channel_allowed, Channel};
use super::templates::{ChannelSet, DomainEvent, NotificationMessage};
use super::{NewNotification, NotificationKind};
use crate::error::{SettlementError, SettlementResult};
use crate::models::UserContact;
use crate::store::MarketStore;

/// Event name used on the push broker
pub const PUSH_EVENT: &str = "notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRequested,
    PreferenceDisabled,
    QuietHours,
    NotConfigured,
    NoAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ChannelOutcome {
    Sent,
    Failed(String),
    Skipped(SkipReason),
}

impl ChannelOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, ChannelOutcome::Sent)
    }
}

/// Result of one `send` call, per channel
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub user_id: Uuid,
    pub push: ChannelOutcome,
    pub email: ChannelOutcome,
    pub sms: ChannelOutcome,
    /// Quiet hours held the whole message back
    pub suppressed: bool,
    pub notification_id: Option<Uuid>,
}

impl DispatchReport {
    fn all(user_id: Uuid, outcome: ChannelOutcome) -> Self {
        Self {
            user_id,
            push: outcome.clone(),
            email: outcome.clone(),
            sms: outcome,
            suppressed: false,
            notification_id: None,
        }
    }

    pub fn outcome(&self, channel: Channel) -> &ChannelOutcome {
        match channel {
            Channel::Push => &self.push,
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
        }
    }

    pub fn sent_count(&self) -> usize {
        [&self.push, &self.email, &self.sms]
            .iter()
            .filter(|o| o.is_sent())
            .count()
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn MarketStore>,
    push: Option<Arc<dyn PushBroker>>,
    email: Option<Arc<dyn EmailClient>>,
    sms: Option<Arc<dyn SmsClient>>,
    app_base_url: String,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self {
            store,
            push: None,
            email: None,
            sms: None,
            app_base_url: "http://localhost:3000".to_string(),
        }
    }

    /// Wire up every channel configured in the environment
    pub fn from_env(store: Arc<dyn MarketStore>) -> Self {
        let mut dispatcher = Self::new(store);
        if let Ok(url) = std::env::var("APP_BASE_URL") {
            dispatcher.app_base_url = url;
        }
        if let Some(push) = HttpPushBroker::from_env() {
            dispatcher = dispatcher.with_push(Arc::new(push));
        } else {
            tracing::warn!("Push broker not configured, push notifications disabled");
        }
        if let Some(email) = ResendEmailClient::from_env() {
            dispatcher = dispatcher.with_email(Arc::new(email));
        } else {
            tracing::warn!("RESEND_API_KEY not set, email notifications disabled");
        }
        if let Some(sms) = TwilioSmsClient::from_env() {
            dispatcher = dispatcher.with_sms(Arc::new(sms));
        } else {
            tracing::warn!("Twilio not configured, SMS notifications disabled");
        }
        dispatcher
    }

    pub fn with_push(mut self, push: Arc<dyn PushBroker>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_email(mut self, email: Arc<dyn EmailClient>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn with_sms(mut self, sms: Arc<dyn SmsClient>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub fn with_app_base_url(mut self, url: impl Into<String>) -> Self {
        self.app_base_url = url.into();
        self
    }

    /// Render a domain event and send it
    pub async fn notify(&self, user_id: Uuid, event: &DomainEvent) -> SettlementResult<DispatchReport> {
        let (message, channels) = event.render().ok_or_else(|| {
            SettlementError::Internal(format!("No template for {:?}", event.kind))
        })?;
        self.send(user_id, &message, channels).await
    }

    pub async fn send(
        &self,
        user_id: Uuid,
        message: &NotificationMessage,
        channels: ChannelSet,
    ) -> SettlementResult<DispatchReport> {
        self.send_at(user_id, message, channels, OffsetDateTime::now_utc(), true)
            .await
    }

    /// Core send: preferences, quiet hours, per-channel attempts, audit row.
    ///
    /// Only loading the user's settings can fail; channel and audit
    /// failures are logged and reported in the result.
    pub async fn send_at(
        &self,
        user_id: Uuid,
        message: &NotificationMessage,
        channels: ChannelSet,
        now: OffsetDateTime,
        persist: bool,
    ) -> SettlementResult<DispatchReport> {
        let contact = self
            .store
            .user_contact(user_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("user {}", user_id)))?;

        let prefs = match self.store.notification_preferences(user_id).await? {
            Some(prefs) => prefs,
            None => self.store.insert_default_preferences(user_id).await?,
        };
        let delivery = self.store.delivery_notification_settings(user_id).await?;

        if !message.urgent && prefs.quiet_hours.contains(now) {
            tracing::info!(
                user_id = %user_id,
                category = ?message.category,
                "Quiet hours active, notification suppressed"
            );
            let mut report =
                DispatchReport::all(user_id, ChannelOutcome::Skipped(SkipReason::QuietHours));
            report.suppressed = true;
            return Ok(report);
        }

        let gate = |channel: Channel| -> Option<ChannelOutcome> {
            if !channels.contains(channel) {
                return Some(ChannelOutcome::Skipped(SkipReason::NotRequested));
            }
            if !channel_allowed(channel, message.category, &prefs, delivery.as_ref(), &contact) {
                return Some(ChannelOutcome::Skipped(SkipReason::PreferenceDisabled));
            }
            None
        };

        let push_gate = gate(Channel::Push);
        let email_gate = gate(Channel::Email);
        let sms_gate = gate(Channel::Sms);

        let contact = &contact;
        let (push, email, sms) = futures::join!(
            async move {
                match push_gate {
                    Some(skipped) => skipped,
                    None => self.send_push(contact, message).await,
                }
            },
            async move {
                match email_gate {
                    Some(skipped) => skipped,
                    None => self.send_email(contact, message).await,
                }
            },
            async move {
                match sms_gate {
                    Some(skipped) => skipped,
                    None => self.send_sms(contact, message).await,
                }
            },
        );

        let mut report = DispatchReport {
            user_id,
            push,
            email,
            sms,
            suppressed: false,
            notification_id: None,
        };

        if persist {
            report.notification_id = self.persist(user_id, message).await;
        }

        Ok(report)
    }

    async fn send_push(&self, contact: &UserContact, message: &NotificationMessage) -> ChannelOutcome {
        let Some(push) = &self.push else {
            return ChannelOutcome::Skipped(SkipReason::NotConfigured);
        };
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => return ChannelOutcome::Failed(e.to_string()),
        };
        let result = push
            .publish(&user_channel(contact.user_id), PUSH_EVENT, &payload)
            .await;
        outcome(Channel::Push, contact.user_id, result)
    }

    async fn send_email(&self, contact: &UserContact, message: &NotificationMessage) -> ChannelOutcome {
        let Some(email) = &self.email else {
            return ChannelOutcome::Skipped(SkipReason::NotConfigured);
        };
        let Some(address) = contact.email.as_deref().filter(|a| !a.trim().is_empty()) else {
            return ChannelOutcome::Skipped(SkipReason::NoAddress);
        };
        let html = render_email_html(message, &self.app_base_url);
        let result = email.send(address, &message.title, &html).await;
        outcome(Channel::Email, contact.user_id, result)
    }

    async fn send_sms(&self, contact: &UserContact, message: &NotificationMessage) -> ChannelOutcome {
        let Some(sms) = &self.sms else {
            tracing::warn!(user_id = %contact.user_id, "SMS client not configured, skipping SMS");
            return ChannelOutcome::Skipped(SkipReason::NotConfigured);
        };
        let Some(phone) = contact.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
            return ChannelOutcome::Skipped(SkipReason::NoAddress);
        };
        let text = render_sms_text(message, &self.app_base_url);
        let result = sms.send(phone, &text).await;
        outcome(Channel::Sms, contact.user_id, result)
    }

    async fn persist(&self, user_id: Uuid, message: &NotificationMessage) -> Option<Uuid> {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to serialize notification");
                return None;
            }
        };
        let record = NewNotification {
            user_id,
            kind: NotificationKind::from(message.category),
            title: message.title.clone(),
            body: message.body.clone(),
            payload,
            order_id: message.order_id,
        };
        match self.store.insert_notification(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to persist notification");
                None
            }
        }
    }
}

fn outcome(channel: Channel, user_id: Uuid, result: SettlementResult<()>) -> ChannelOutcome {
    match result {
        Ok(()) => ChannelOutcome::Sent,
        Err(e) => {
            tracing::error!(
                channel = channel.as_str(),
                user_id = %user_id,
                error = %e,
                "Notification channel send failed"
            );
            ChannelOutcome::Failed(e.to_string())
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_email_html(message: &NotificationMessage, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let links: String = message
        .links
        .iter()
        .map(|l| {
            format!(
                r#"<p><a href="{}{}">{}</a></p>"#,
                escape_html(base),
                escape_html(&l.path),
                escape_html(&l.label)
            )
        })
        .collect();
    format!(
        "<h2>{}</h2><p>{}</p>{}",
        escape_html(&message.title),
        escape_html(&message.body),
        links
    )
}

fn render_sms_text(message: &NotificationMessage, base_url: &str) -> String {
    match message.links.first() {
        Some(link) => format!(
            "{}: {} {}{}",
            message.title,
            message.body,
            base_url.trim_end_matches('/'),
            link.path
        ),
        None => format!("{}: {}", message.title, message.body),
    }
}
