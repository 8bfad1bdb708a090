use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::alert::NewAlert;

/// JSON frame exchanged over the rider WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientHello {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ClientLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct ClientCreateAlert {
    #[serde(flatten)]
    pub alert: NewAlert,
}

#[derive(Debug, Deserialize)]
pub struct ClientRespond {
    pub alert_id: Uuid,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub eta_minutes: Option<u32>,
}

/// Payload shared by resolve and cancel.
#[derive(Debug, Deserialize)]
pub struct ClientAlertRef {
    pub alert_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ClientNearbyAlerts {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub radius_meters: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}
