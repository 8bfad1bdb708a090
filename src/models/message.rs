use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Location ping published by a rider's tracker onto the telemetry topic.
#[derive(Debug, Deserialize)]
pub struct LocationMessage {
    pub data: Data,
    #[serde(default)]
    pub metadata: Metadata,
    pub uuid: String,
}

#[derive(Debug, Deserialize)]
pub struct Data {
    #[serde(rename = "USER_ID")]
    pub user_id: Option<String>,
    #[serde(rename = "GPS_DATETIME")]
    pub gps_datetime: Option<String>,
    #[serde(rename = "LATITUD", default, deserialize_with = "parse_f64_option")]
    pub latitude: Option<f64>,
    #[serde(rename = "LONGITUD", default, deserialize_with = "parse_f64_option")]
    pub longitude: Option<f64>,
    #[serde(rename = "SPEED", default, deserialize_with = "parse_f64_option")]
    pub speed: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    #[serde(rename = "USER_ID")]
    pub user_id: Option<String>,
}

impl LocationMessage {
    pub fn get_user_id(&self) -> Option<&String> {
        self.data.user_id.as_ref().or(self.metadata.user_id.as_ref())
    }

    /// Fix time reported by the tracker, if it parses in either accepted layout.
    pub fn fix_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.data.gps_datetime.as_deref()?;
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
            .ok()
            .map(|t| t.and_utc())
    }
}

fn parse_f64_option<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        String(String),
        Float(f64),
    }

    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrFloat::Float(f)) => Ok(Some(f)),
        Some(StringOrFloat::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}
