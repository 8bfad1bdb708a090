//! External emergency channel: SMS to the reporter's contacts and an
//! automated call to the service number for medical and accident alerts.
//!
//! The gateway is optional. Without one, or without a destination, every
//! attempt is logged as a simulation. Nothing here returns an error to the
//! caller; failures end up in the [`ExternalReport`] and the log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::NotifyError;
use crate::models::alert::EmergencyAlert;
use crate::models::rider::{EmergencyContact, RiderProfile};

/// SMS / voice provider.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError>;

    async fn send_voice_call(&self, to: &str, script: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct VoiceRequest<'a> {
    to: &'a str,
    script: &'a str,
}

/// Provider reached over a JSON HTTP API (`POST {base}/sms`, `POST {base}/voice`).
pub struct HttpGateway {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for HttpGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        self.post("sms", &SmsRequest { to, body }).await
    }

    async fn send_voice_call(&self, to: &str, script: &str) -> Result<(), NotifyError> {
        self.post("voice", &VoiceRequest { to, script }).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Sms,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Simulated,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAttempt {
    pub channel: Channel,
    pub to: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default)]
pub struct ExternalReport {
    pub attempts: Vec<ExternalAttempt>,
}

impl ExternalReport {
    pub fn count(&self, channel: Channel, outcome: &Outcome) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.channel == channel && &a.outcome == outcome)
            .count()
    }
}

pub struct ExternalNotifier {
    gateway: Option<Arc<dyn NotificationGateway>>,
    service_number: Option<String>,
    timeout: Duration,
}

impl ExternalNotifier {
    pub fn new(
        gateway: Option<Arc<dyn NotificationGateway>>,
        service_number: Option<String>,
        timeout: Duration,
    ) -> Self {
        match &gateway {
            Some(g) => info!(gateway = g.name(), "External notifications enabled"),
            None => warn!("No notification gateway configured, external alerts will be simulated"),
        }
        Self {
            gateway,
            service_number,
            timeout,
        }
    }

    /// Notifies `reporter`'s emergency contacts and, when the alert type calls
    /// for it, the emergency service number.
    pub async fn deliver(
        &self,
        alert: &EmergencyAlert,
        reporter: Option<&RiderProfile>,
    ) -> ExternalReport {
        let mut report = ExternalReport::default();
        let contacts: &[EmergencyContact] = reporter
            .map(|r| r.emergency_contacts.as_slice())
            .unwrap_or_default();
        let name = reporter
            .and_then(|r| r.display_name.as_deref())
            .unwrap_or(&alert.reporter_id);

        if contacts.is_empty() {
            info!(alert_id = %alert.id, reporter = %alert.reporter_id, "Reporter has no emergency contacts");
        }

        let body = sms_body(alert, name);
        for contact in contacts {
            let outcome = self.attempt(Channel::Sms, &contact.phone, &body).await;
            report.attempts.push(ExternalAttempt {
                channel: Channel::Sms,
                to: contact.phone.clone(),
                outcome,
            });
        }

        if alert.alert_type.needs_service_call() {
            let script = voice_script(alert, name);
            let (to, outcome) = match &self.service_number {
                Some(number) => (number.clone(), self.attempt(Channel::Voice, number, &script).await),
                None => {
                    info!(alert_id = %alert.id, script = %script, "[simulated] service call, no number configured");
                    (String::new(), Outcome::Simulated)
                }
            };
            report.attempts.push(ExternalAttempt {
                channel: Channel::Voice,
                to,
                outcome,
            });
        }

        report
    }

    async fn attempt(&self, channel: Channel, to: &str, text: &str) -> Outcome {
        let Some(gateway) = &self.gateway else {
            info!(?channel, to, text, "[simulated] external notification");
            return Outcome::Simulated;
        };

        let call = async {
            match channel {
                Channel::Sms => gateway.send_sms(to, text).await,
                Channel::Voice => gateway.send_voice_call(to, text).await,
            }
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout.as_secs())),
        };

        match result {
            Ok(()) => {
                info!(?channel, to, gateway = gateway.name(), "External notification sent");
                Outcome::Sent
            }
            Err(e) => {
                error!(?channel, to, error = %e, "External notification failed");
                Outcome::Failed(e.to_string())
            }
        }
    }
}

fn place(alert: &EmergencyAlert) -> String {
    match &alert.location.address {
        Some(address) => format!("{} ({:.5}, {:.5})", address, alert.location.lat, alert.location.lon),
        None => format!("{:.5}, {:.5}", alert.location.lat, alert.location.lon),
    }
}

fn sms_body(alert: &EmergencyAlert, name: &str) -> String {
    let mut body = format!(
        "EMERGENCY: {} reported a {} alert ({} severity) at {}.",
        name,
        alert.alert_type.as_str(),
        alert.severity.as_str(),
        place(alert)
    );
    if let Some(description) = &alert.description {
        body.push(' ');
        body.push_str(description);
    }
    body
}

fn voice_script(alert: &EmergencyAlert, name: &str) -> String {
    format!(
        "This is an automated emergency call. Rider {} has reported a {} emergency at {}. Please dispatch assistance.",
        name,
        alert.alert_type.as_str(),
        place(alert)
    )
}
