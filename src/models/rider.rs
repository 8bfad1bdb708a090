use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::GeoPoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub emergency_contacts: Vec<EmergencyContact>,
    pub reward_points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastKnownLocation {
    pub lat: f64,
    pub lon: f64,
    pub updated_at: DateTime<Utc>,
}

/// Row returned by the geo query, distance measured from the query point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyRider {
    pub user_id: String,
    pub location: GeoPoint,
    pub distance_meters: f64,
}
