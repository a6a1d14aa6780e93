//! Post-purchase review tokens
//!
//! One token per purchased line item, created only when none exists yet for
//! the (order item, buyer, product) triple.

use std::sync::Arc;

use rand::RngCore;
use time::{Duration, OffsetDateTime};

use crate::error::SettlementResult;
use crate::models::{NewReviewToken, OrderItem};
use crate::store::MarketStore;

pub const REVIEW_TOKEN_BYTES: usize = 32;
pub const REVIEW_TOKEN_TTL_DAYS: i64 = 30;

/// 64 hex characters from the OS-seeded thread RNG
pub fn generate_token() -> String {
    let mut bytes = [0u8; REVIEW_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn token_expiry(now: OffsetDateTime) -> OffsetDateTime {
    now + Duration::days(REVIEW_TOKEN_TTL_DAYS)
}

#[derive(Clone)]
pub struct ReviewTokenService {
    store: Arc<dyn MarketStore>,
}

impl ReviewTokenService {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    /// Issue missing tokens for `items`; returns how many were created
    pub async fn issue_for_items(
        &self,
        buyer_id: uuid::Uuid,
        items: &[OrderItem],
    ) -> SettlementResult<usize> {
        let now = OffsetDateTime::now_utc();
        let mut created = 0;

        for item in items {
            if self
                .store
                .review_token_exists(item.id, buyer_id, item.product_id)
                .await?
            {
                continue;
            }
            self.store
                .insert_review_token(NewReviewToken {
                    order_item_id: item.id,
                    buyer_id,
                    product_id: item.product_id,
                    token: generate_token(),
                    expires_at: token_expiry(now),
                })
                .await?;
            created += 1;
        }

        Ok(created)
    }
}
