use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Persistence;
use crate::error::StoreError;
use crate::geo::haversine_meters;
use crate::models::alert::{AlertStatus, EmergencyAlert, GeoPoint, NearbyAlert};
use crate::models::rider::{LastKnownLocation, NearbyRider, RiderProfile};

#[derive(Default)]
struct Tables {
    alerts: HashMap<Uuid, EmergencyAlert>,
    riders: HashMap<String, RiderProfile>,
    locations: HashMap<String, LastKnownLocation>,
}

/// In-process stand-in for the document store.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_rider(&self, rider: RiderProfile) {
        self.tables
            .lock()
            .await
            .riders
            .insert(rider.user_id.clone(), rider);
    }

    pub async fn put_rider_at(&self, user_id: &str, lat: f64, lon: f64) {
        let location = LastKnownLocation {
            lat,
            lon,
            updated_at: Utc::now(),
        };
        self.tables
            .lock()
            .await
            .locations
            .insert(user_id.to_string(), location);
    }

    pub async fn location_of(&self, user_id: &str) -> Option<LastKnownLocation> {
        self.tables.lock().await.locations.get(user_id).copied()
    }
}

fn is_open(alert: &EmergencyAlert) -> bool {
    matches!(alert.status, AlertStatus::Active | AlertStatus::Responded)
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .alerts
            .insert(alert.id, alert.clone());
        Ok(())
    }

    async fn load_alert(&self, id: Uuid) -> Result<Option<EmergencyAlert>, StoreError> {
        Ok(self.tables.lock().await.alerts.get(&id).cloned())
    }

    async fn find_active_alerts_by_reporter(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmergencyAlert>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .alerts
            .values()
            .filter(|a| {
                a.reporter_id == reporter_id
                    && a.status == AlertStatus::Active
                    && a.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn find_open_alerts_by_reporter(
        &self,
        reporter_id: &str,
    ) -> Result<Vec<EmergencyAlert>, StoreError> {
        let tables = self.tables.lock().await;
        let mut alerts: Vec<EmergencyAlert> = tables
            .alerts
            .values()
            .filter(|a| a.reporter_id == reporter_id && is_open(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn find_open_alerts_near(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbyAlert>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .alerts
            .values()
            .filter(|a| is_open(a))
            .map(|a| NearbyAlert {
                alert: a.clone(),
                distance_meters: haversine_meters(point, a.location.point()),
            })
            .filter(|n| n.distance_meters < radius_meters)
            .collect())
    }

    async fn load_rider(&self, user_id: &str) -> Result<Option<RiderProfile>, StoreError> {
        Ok(self.tables.lock().await.riders.get(user_id).cloned())
    }

    async fn save_rider_location(
        &self,
        user_id: &str,
        location: &LastKnownLocation,
    ) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .locations
            .insert(user_id.to_string(), *location);
        Ok(())
    }

    async fn geo_nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        exclude: &str,
    ) -> Result<Vec<NearbyRider>, StoreError> {
        let tables = self.tables.lock().await;
        // Map order; GeoIndex does the sorting.
        Ok(tables
            .locations
            .iter()
            .filter(|(id, _)| id.as_str() != exclude)
            .map(|(id, loc)| {
                let location = GeoPoint {
                    lat: loc.lat,
                    lon: loc.lon,
                };
                NearbyRider {
                    user_id: id.clone(),
                    location,
                    distance_meters: haversine_meters(point, location),
                }
            })
            .filter(|r| r.distance_meters < radius_meters)
            .collect())
    }
}
