use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::alert::{EmergencyAlert, GeoPoint, NearbyAlert};
use crate::models::rider::{LastKnownLocation, NearbyRider, RiderProfile};

#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod queries;

pub type DbPool = Pool<Postgres>;

pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Document-store collaborator the alert engine reads and writes through.
///
/// Implementations are not required to be read-after-write consistent for
/// rider locations; `geo_nearby` may lag a fresh location report briefly.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Inserts the alert or overwrites the stored copy with the same id.
    async fn save_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError>;

    async fn load_alert(&self, id: Uuid) -> Result<Option<EmergencyAlert>, StoreError>;

    /// Alerts by `reporter_id` in status `active` created at or after `since`.
    async fn find_active_alerts_by_reporter(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmergencyAlert>, StoreError>;

    /// Active or responded alerts by `reporter_id`, newest first.
    async fn find_open_alerts_by_reporter(
        &self,
        reporter_id: &str,
    ) -> Result<Vec<EmergencyAlert>, StoreError>;

    /// Active or responded alerts within `radius_meters` of `point`.
    async fn find_open_alerts_near(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbyAlert>, StoreError>;

    async fn load_rider(&self, user_id: &str) -> Result<Option<RiderProfile>, StoreError>;

    async fn save_rider_location(
        &self,
        user_id: &str,
        location: &LastKnownLocation,
    ) -> Result<(), StoreError>;

    /// Riders with a known location within `radius_meters`, excluding `exclude`.
    async fn geo_nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        exclude: &str,
    ) -> Result<Vec<NearbyRider>, StoreError>;
}
