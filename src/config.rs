use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::AlertPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub ws_bind_addr: String,
    pub log_level: String,

    pub kafka_enabled: bool,
    pub kafka_bootstrap_servers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_auto_offset_reset: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_username: String,
    pub kafka_password: String,
    pub kafka_security_protocol: String,
    pub kafka_max_retries: u32,
    pub kafka_circuit_breaker_cooldown: u64,

    pub alert_auto_resolve_minutes: u64,
    pub alert_duplicate_window_minutes: i64,
    pub alert_dispatch_radius_meters: f64,
    pub reward_emergency_response_points: i32,
    pub reward_emergency_resolved_points: i32,

    pub sms_gateway_url: Option<String>,
    pub sms_gateway_token: Option<String>,
    pub emergency_service_number: Option<String>,
    pub notify_timeout_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let db_host = var_or("DB_HOST", "localhost");
        let db_port = var_or("DB_PORT", "5432");
        let db_name = var_or("DB_DATABASE", "ride_sos");
        let db_user = var_or("DB_USER", "ride_sos");
        let db_pwd = var_or("DB_PWD", "ride_sos");

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );

        Ok(Self {
            database_url,
            ws_bind_addr: var_or("WS_BIND_ADDR", "0.0.0.0:8080"),
            log_level: var_or("LOG_LEVEL", "info"),

            kafka_enabled: parsed_or("KAFKA_ENABLED", false),
            kafka_bootstrap_servers: var_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            kafka_topic: var_or("KAFKA_TOPIC", "rider-locations"),
            kafka_group_id: var_or("KAFKA_GROUP_ID", "ride-sos-consumer"),
            kafka_auto_offset_reset: var_or("KAFKA_AUTO_OFFSET_RESET", "latest"),
            kafka_sasl_mechanism: var_or("KAFKA_SASL_MECHANISM", "SCRAM-SHA-256"),
            kafka_username: env::var("KAFKA_USERNAME").unwrap_or_default(),
            kafka_password: env::var("KAFKA_PASSWORD").unwrap_or_default(),
            kafka_security_protocol: var_or("KAFKA_SECURITY_PROTOCOL", "SASL_PLAINTEXT"),
            kafka_max_retries: parsed_or("KAFKA_MAX_RETRIES", 5),
            kafka_circuit_breaker_cooldown: parsed_or("KAFKA_CIRCUIT_BREAKER_COOLDOWN", 300),

            alert_auto_resolve_minutes: parsed_or("ALERT_AUTO_RESOLVE_MINUTES", 30),
            alert_duplicate_window_minutes: parsed_or("ALERT_DUPLICATE_WINDOW_MINUTES", 5),
            alert_dispatch_radius_meters: parsed_or("ALERT_DISPATCH_RADIUS_METERS", 10_000.0),
            reward_emergency_response_points: parsed_or("REWARD_EMERGENCY_RESPONSE_POINTS", 50),
            reward_emergency_resolved_points: parsed_or("REWARD_EMERGENCY_RESOLVED_POINTS", 25),

            sms_gateway_url: optional("SMS_GATEWAY_URL"),
            sms_gateway_token: optional("SMS_GATEWAY_TOKEN"),
            emergency_service_number: optional("EMERGENCY_SERVICE_NUMBER"),
            notify_timeout_secs: parsed_or("NOTIFY_TIMEOUT_SECS", 10),
        })
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            auto_resolve_after: Duration::from_secs(self.alert_auto_resolve_minutes * 60),
            duplicate_window: chrono::Duration::minutes(self.alert_duplicate_window_minutes),
            dispatch_radius_meters: self.alert_dispatch_radius_meters,
            response_points: self.reward_emergency_response_points,
            resolved_points: self.reward_emergency_resolved_points,
        }
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}
