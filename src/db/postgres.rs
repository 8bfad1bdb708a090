use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use super::{queries, DbPool, Persistence};
use crate::error::StoreError;
use crate::models::alert::{
    AlertLocation, EmergencyAlert, GeoPoint, NearbyAlert, Responder,
};
use crate::models::rider::{EmergencyContact, LastKnownLocation, NearbyRider, RiderProfile};
use crate::rewards::{RewardGrant, RewardLedger};

/// Postgres-backed persistence and reward ledger.
#[derive(Clone)]
pub struct PgPersistence {
    pool: DbPool,
}

impl PgPersistence {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &PgRow,
    column: &str,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(StoreError::CorruptRow)
}

fn alert_from_row(row: &PgRow) -> Result<EmergencyAlert, StoreError> {
    let responders: Json<Vec<Responder>> = row.try_get("responders")?;

    Ok(EmergencyAlert {
        id: row.try_get("alert_id")?,
        reporter_id: row.try_get("reporter_id")?,
        alert_type: parse_column(row, "alert_type")?,
        severity: parse_column(row, "severity")?,
        location: AlertLocation {
            lat: row.try_get("lat")?,
            lon: row.try_get("lon")?,
            address: row.try_get("address")?,
        },
        description: row.try_get("description")?,
        status: parse_column(row, "status")?,
        responders: responders.0,
        auto_resolved: row.try_get("auto_resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn save_alert(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        sqlx::query(queries::UPSERT_ALERT)
            .bind(alert.id)
            .bind(&alert.reporter_id)
            .bind(alert.alert_type.as_str())
            .bind(alert.severity.as_str())
            .bind(alert.location.lat)
            .bind(alert.location.lon)
            .bind(alert.location.address.as_deref())
            .bind(alert.description.as_deref())
            .bind(alert.status.as_str())
            .bind(Json(&alert.responders))
            .bind(alert.auto_resolved)
            .bind(alert.resolved_at)
            .bind(alert.resolved_by.as_deref())
            .bind(alert.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_alert(&self, id: Uuid) -> Result<Option<EmergencyAlert>, StoreError> {
        let row = sqlx::query(queries::SELECT_ALERT)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn find_active_alerts_by_reporter(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmergencyAlert>, StoreError> {
        let rows = sqlx::query(queries::SELECT_ACTIVE_ALERTS_BY_REPORTER)
            .bind(reporter_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn find_open_alerts_by_reporter(
        &self,
        reporter_id: &str,
    ) -> Result<Vec<EmergencyAlert>, StoreError> {
        let rows = sqlx::query(queries::SELECT_OPEN_ALERTS_BY_REPORTER)
            .bind(reporter_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn find_open_alerts_near(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbyAlert>, StoreError> {
        let rows = sqlx::query(queries::SELECT_OPEN_ALERTS_NEAR)
            .bind(point.lat)
            .bind(point.lon)
            .bind(radius_meters)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(NearbyAlert {
                    alert: alert_from_row(row)?,
                    distance_meters: row.try_get("distance_meters")?,
                })
            })
            .collect()
    }

    async fn load_rider(&self, user_id: &str) -> Result<Option<RiderProfile>, StoreError> {
        let row = sqlx::query(queries::SELECT_RIDER)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let contacts: Json<Vec<EmergencyContact>> = row.try_get("emergency_contacts")?;
        Ok(Some(RiderProfile {
            user_id: row.try_get("user_id")?,
            display_name: row.try_get("display_name")?,
            emergency_contacts: contacts.0,
            reward_points: row.try_get("reward_points")?,
        }))
    }

    async fn save_rider_location(
        &self,
        user_id: &str,
        location: &LastKnownLocation,
    ) -> Result<(), StoreError> {
        sqlx::query(queries::UPSERT_RIDER_LOCATION)
            .bind(user_id)
            .bind(location.lat)
            .bind(location.lon)
            .bind(location.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn geo_nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        exclude: &str,
    ) -> Result<Vec<NearbyRider>, StoreError> {
        let rows = sqlx::query(queries::SELECT_RIDERS_NEAR)
            .bind(point.lat)
            .bind(point.lon)
            .bind(radius_meters)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(NearbyRider {
                    user_id: row.try_get("user_id")?,
                    location: GeoPoint {
                        lat: row.try_get("lat")?,
                        lon: row.try_get("lon")?,
                    },
                    distance_meters: row.try_get("distance_meters")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RewardLedger for PgPersistence {
    async fn record(&self, grant: &RewardGrant) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(queries::INSERT_REWARD_ACTIVITY)
            .bind(&grant.user_id)
            .bind(grant.kind.as_str())
            .bind(grant.points)
            .bind(grant.related_alert_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Conflict means this grant was already booked; leave the balance alone.
        if inserted == 1 {
            sqlx::query(queries::ADD_REWARD_POINTS)
                .bind(&grant.user_id)
                .bind(i64::from(grant.points))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted == 1)
    }
}
