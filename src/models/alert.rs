use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AlertError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Accident,
    Breakdown,
    Medical,
    Battery,
    Theft,
    Other,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Accident => "accident",
            AlertType::Breakdown => "breakdown",
            AlertType::Medical => "medical",
            AlertType::Battery => "battery",
            AlertType::Theft => "theft",
            AlertType::Other => "other",
        }
    }

    /// Types that warrant an automated call to the emergency service number.
    pub fn needs_service_call(&self) -> bool {
        matches!(self, AlertType::Medical | AlertType::Accident)
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accident" => Ok(AlertType::Accident),
            "breakdown" => Ok(AlertType::Breakdown),
            "medical" => Ok(AlertType::Medical),
            "battery" => Ok(AlertType::Battery),
            "theft" => Ok(AlertType::Theft),
            "other" => Ok(AlertType::Other),
            other => Err(format!("unknown alert type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Responded,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Responded => "responded",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Cancelled => "cancelled",
        }
    }

    /// Resolved and cancelled alerts accept no further mutation.
    pub fn is_final(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Cancelled)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "responded" => Ok(AlertStatus::Responded),
            "resolved" => Ok(AlertStatus::Resolved),
            "cancelled" => Ok(AlertStatus::Cancelled),
            other => Err(format!("unknown alert status '{}'", other)),
        }
    }
}

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Builds a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lon: f64) -> Result<Self, AlertError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(AlertError::InvalidLocation);
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(AlertError::InvalidLocation);
        }
        Ok(Self { lat, lon })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl AlertLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Responder {
    pub responder_id: String,
    pub responded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlert {
    pub id: Uuid,
    pub reporter_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub location: AlertLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: AlertStatus,
    pub responders: Vec<Responder>,
    pub auto_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmergencyAlert {
    pub fn new(
        reporter_id: String,
        alert_type: AlertType,
        severity: Severity,
        location: AlertLocation,
        description: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reporter_id,
            alert_type,
            severity,
            location,
            description,
            status: AlertStatus::Active,
            responders: Vec::new(),
            auto_resolved: false,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn has_responder(&self, user_id: &str) -> bool {
        self.responders.iter().any(|r| r.responder_id == user_id)
    }

    /// Reporter plus every listed responder.
    pub fn participants(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.responders.len() + 1);
        ids.push(self.reporter_id.clone());
        ids.extend(self.responders.iter().map(|r| r.responder_id.clone()));
        ids
    }
}

/// Caller-supplied fields of a new alert.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub location: AlertLocation,
    #[serde(default)]
    pub description: Option<String>,
}

/// An open alert paired with its distance from a query point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyAlert {
    pub alert: EmergencyAlert,
    pub distance_meters: f64,
}
