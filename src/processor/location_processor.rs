use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::db::Persistence;
use crate::error::StoreError;
use crate::models::alert::GeoPoint;
use crate::models::message::LocationMessage;
use crate::models::rider::LastKnownLocation;
use crate::presence::PresenceRegistry;

/// Fixes older than this are replayed backlog and would move a rider backwards.
const MAX_FIX_AGE_MINUTES: i64 = 10;

/// Records a rider's position in presence and in the store, the same way for
/// WebSocket reports and telemetry pings.
pub async fn record_location(
    presence: &PresenceRegistry,
    store: &dyn Persistence,
    user_id: &str,
    point: GeoPoint,
) -> Result<LastKnownLocation, StoreError> {
    let location = presence.update_location(user_id, point);
    store.save_rider_location(user_id, &location).await?;
    Ok(location)
}

/// Handles one telemetry payload. Malformed or stale pings are logged and
/// dropped; only store failures are returned.
pub async fn process_message(
    presence: &PresenceRegistry,
    store: &dyn Persistence,
    payload: &[u8],
) -> anyhow::Result<Option<LastKnownLocation>> {
    // 1. Parse JSON
    let message: LocationMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse location message: {}", e);
            return Ok(None);
        }
    };

    // 2. Extract rider and fix
    let user_id = match message.get_user_id() {
        Some(id) if !id.trim().is_empty() => id.clone(),
        _ => {
            warn!(uuid = %message.uuid, "Location message missing USER_ID, skipping");
            return Ok(None);
        }
    };

    let point = match (message.data.latitude, message.data.longitude) {
        (Some(lat), Some(lon)) => match GeoPoint::new(lat, lon) {
            Ok(point) => point,
            Err(_) => {
                warn!(rider = %user_id, lat, lon, "Out of range coordinates, skipping");
                return Ok(None);
            }
        },
        _ => {
            warn!(rider = %user_id, "Location message without coordinates, skipping");
            return Ok(None);
        }
    };

    if let Some(fix) = message.fix_time() {
        if Utc::now() - fix > Duration::minutes(MAX_FIX_AGE_MINUTES) {
            debug!(rider = %user_id, fix = %fix, "Stale fix ignored");
            return Ok(None);
        }
    }

    // 3. Apply
    let location = record_location(presence, store, &user_id, point).await?;
    debug!(
        rider = %user_id,
        lat = location.lat,
        lon = location.lon,
        speed = ?message.data.speed,
        "Rider location updated"
    );
    Ok(Some(location))
}
