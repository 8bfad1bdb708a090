//! Nearby-rider queries.
//!
//! The persistence collaborator owns the spatial index; this module pins the
//! contract callers rely on. Results are strictly inside the radius, sorted
//! nearest-first, never include the requester, and can be restricted to
//! riders that currently hold a live connection.

use std::sync::Arc;

use tracing::debug;

use crate::db::Persistence;
use crate::error::StoreError;
use crate::models::alert::GeoPoint;
use crate::models::rider::NearbyRider;
use crate::presence::PresenceRegistry;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy)]
pub struct NearbyFilter<'a> {
    pub exclude: &'a str,
    pub online_only: bool,
}

#[derive(Clone)]
pub struct GeoIndex {
    store: Arc<dyn Persistence>,
    presence: Arc<PresenceRegistry>,
}

impl GeoIndex {
    pub fn new(store: Arc<dyn Persistence>, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    pub async fn nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        filter: NearbyFilter<'_>,
    ) -> Result<Vec<NearbyRider>, StoreError> {
        let raw = self
            .store
            .geo_nearby(point, radius_meters, filter.exclude)
            .await?;
        let fetched = raw.len();

        // Re-derive distances locally so ordering does not depend on the backend.
        let mut riders: Vec<NearbyRider> = raw
            .into_iter()
            .filter(|r| r.user_id != filter.exclude)
            .map(|mut r| {
                r.distance_meters = haversine_meters(point, r.location);
                r
            })
            .filter(|r| r.distance_meters < radius_meters)
            .filter(|r| !filter.online_only || self.presence.is_online(&r.user_id))
            .collect();

        riders.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));

        debug!(
            lat = point.lat,
            lon = point.lon,
            radius_meters,
            fetched,
            kept = riders.len(),
            "Nearby query"
        );
        Ok(riders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryPersistence;
    use crate::presence::tests::connect;

    fn point(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint { lat, lon }
    }

    #[test]
    fn test_haversine_known_distances() {
        assert_eq!(haversine_meters(point(12.97, 77.59), point(12.97, 77.59)), 0.0);

        // One degree of latitude is ~111.19 km on this sphere.
        let d = haversine_meters(point(0.0, 0.0), point(1.0, 0.0));
        assert!((d - 111_194.9).abs() < 1.0, "got {}", d);

        // Bengaluru to Chennai is roughly 290 km.
        let d = haversine_meters(point(12.9716, 77.5946), point(13.0827, 80.2707));
        assert!((280_000.0..300_000.0).contains(&d), "got {}", d);
    }

    #[tokio::test]
    async fn test_nearby_filters_radius_requester_and_sorts() {
        let store = Arc::new(MemoryPersistence::new());
        let presence = Arc::new(PresenceRegistry::new());
        let origin = point(12.97, 77.59);

        store.put_rider_at("requester", 12.97, 77.59).await;
        store.put_rider_at("far", 12.97 + 0.135, 77.59).await; // ~15 km
        store.put_rider_at("mid", 12.97 + 0.045, 77.59).await; // ~5 km
        store.put_rider_at("near", 12.97 + 0.009, 77.59).await; // ~1 km

        let geo = GeoIndex::new(store, presence);
        let found = geo
            .nearby(
                origin,
                10_000.0,
                NearbyFilter {
                    exclude: "requester",
                    online_only: false,
                },
            )
            .await
            .unwrap();

        let ids: Vec<&str> = found.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(found.windows(2).all(|w| w[0].distance_meters <= w[1].distance_meters));
        assert!(found.iter().all(|r| r.distance_meters < 10_000.0));
    }

    #[tokio::test]
    async fn test_nearby_online_only_uses_presence() {
        let store = Arc::new(MemoryPersistence::new());
        let presence = Arc::new(PresenceRegistry::new());

        store.put_rider_at("online", 12.98, 77.59).await;
        store.put_rider_at("offline", 12.975, 77.59).await;
        let (_handle, _rx) = connect(&presence, "online");

        let geo = GeoIndex::new(store, presence);
        let found = geo
            .nearby(
                point(12.97, 77.59),
                10_000.0,
                NearbyFilter {
                    exclude: "someone",
                    online_only: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "online");
    }
}
