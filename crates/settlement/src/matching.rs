//! Deliverer matching
//!
//! Every eligible agent is offered the delivery; whoever accepts first gets
//! it. Assignment happens elsewhere.

use uuid::Uuid;

use crate::models::{DeliveryAgent, GeoPoint};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Active, location-enabled agents within their own radius of both points.
///
/// The agent's single `max_distance_km` bounds both the seller leg and the
/// buyer leg.
pub fn eligible_agents<'a>(
    agents: &'a [DeliveryAgent],
    seller: GeoPoint,
    buyer: GeoPoint,
) -> Vec<&'a DeliveryAgent> {
    agents
        .iter()
        .filter(|a| a.is_active && a.location_enabled)
        .filter(|a| {
            haversine_km(a.location, seller) <= a.max_distance_km
                && haversine_km(a.location, buyer) <= a.max_distance_km
        })
        .collect()
}

/// A purchased product that needs a courier
#[derive(Debug, Clone)]
pub struct DeliveryCandidate {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub seller_location: Option<GeoPoint>,
}

#[derive(Debug, Clone)]
pub struct ItemMatch {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub agent_ids: Vec<Uuid>,
}

/// Match each candidate item against the agent pool.
///
/// Items are skipped (not matched, not an error) when the buyer or that
/// item's seller has no coordinates.
pub fn match_items(
    agents: &[DeliveryAgent],
    buyer: Option<GeoPoint>,
    candidates: &[DeliveryCandidate],
) -> Vec<ItemMatch> {
    let Some(buyer) = buyer else {
        tracing::info!("Buyer has no coordinates, skipping deliverer matching");
        return Vec::new();
    };

    candidates
        .iter()
        .filter_map(|candidate| {
            let Some(seller) = candidate.seller_location else {
                tracing::info!(
                    product_id = %candidate.product_id,
                    seller_id = %candidate.seller_id,
                    "Seller has no coordinates, skipping deliverer matching for item"
                );
                return None;
            };
            let agent_ids = eligible_agents(agents, seller, buyer)
                .into_iter()
                .map(|a| a.user_id)
                .collect();
            Some(ItemMatch {
                product_id: candidate.product_id,
                seller_id: candidate.seller_id,
                agent_ids,
            })
        })
        .collect()
}
