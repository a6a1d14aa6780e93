// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Marketplace Settlement
//!
//! Turns a paid checkout into orders, payouts and notifications.
//!
//! ## Components
//!
//! - **Webhooks**: verify payment events and route them
//! - **Orders**: atomic order creation and stock decrement
//! - **Matching**: find couriers near both the seller and the buyer
//! - **Payouts**: platform fees, SMS surcharge, connected-account transfers
//! - **Notifications**: per-channel preference rules, quiet hours, templates

pub mod client;
pub mod error;
pub mod invariants;
pub mod matching;
pub mod models;
pub mod notifications;
pub mod orders;
pub mod payouts;
pub mod review_tokens;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Client
pub use client::{PaymentGateway, StripeClient, StripeConfig, StripeGateway};

// Error
pub use error::{SettlementError, SettlementResult, StatusClass};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Orders
pub use orders::{CreatedOrder, OrderRequest, OrderTransactionManager, PurchasedItem};

// Payouts
pub use payouts::{PayoutService, RetrySummary, SmsSurcharge};

// Notifications
pub use notifications::{DispatchReport, NotificationDispatcher};

// Store
pub use store::{MarketStore, OrderTransaction, PgStore};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{WebhookEvent, WebhookHandler, WebhookOutcome};

/// The wired-up pipeline shared by the api and the worker
#[derive(Clone)]
pub struct Settlement {
    pub store: Arc<dyn MarketStore>,
    pub orders: OrderTransactionManager,
    pub payouts: PayoutService,
    pub dispatcher: NotificationDispatcher,
    pub webhooks: WebhookHandler,
}

impl Settlement {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: NotificationDispatcher,
        sms: SmsSurcharge,
    ) -> Self {
        let payouts = PayoutService::with_sms_surcharge(store.clone(), gateway.clone(), sms);
        let webhooks = WebhookHandler::new(
            store.clone(),
            gateway,
            payouts.clone(),
            dispatcher.clone(),
        );
        Self {
            orders: OrderTransactionManager::new(store.clone()),
            store,
            payouts,
            dispatcher,
            webhooks,
        }
    }

    /// Postgres store, Stripe gateway and whichever channels the
    /// environment configures
    pub fn from_env(pool: PgPool) -> SettlementResult<Self> {
        let store: Arc<dyn MarketStore> = Arc::new(PgStore::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::from_env()?);
        let dispatcher = NotificationDispatcher::from_env(store.clone());
        Ok(Self::new(store, gateway, dispatcher, SmsSurcharge::from_env()))
    }
}
