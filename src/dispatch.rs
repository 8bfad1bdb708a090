//! Alert fan-out to nearby online riders plus the external emergency path.
//!
//! Each (alert, rider) pair is claimed before the push, so a rider gets at
//! most one `emergency_alert` per alert however many times dispatch runs.
//! A claim is released only when the push could not be enqueued, leaving
//! the pair available to a later retry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Persistence;
use crate::geo::{GeoIndex, NearbyFilter};
use crate::models::alert::EmergencyAlert;
use crate::models::rider::NearbyRider;
use crate::notify::{ExternalNotifier, ExternalReport};
use crate::presence::PresenceRegistry;

pub const EVENT_EMERGENCY_ALERT: &str = "emergency_alert";

pub struct DispatchReport {
    pub candidates: Vec<NearbyRider>,
    /// Riders that received the push during this run, nearest first.
    pub pushed: Vec<String>,
    /// Contacts / service call task. Never needs to be awaited.
    pub external: Option<JoinHandle<ExternalReport>>,
}

pub struct NotificationDispatcher {
    geo: GeoIndex,
    presence: Arc<PresenceRegistry>,
    store: Arc<dyn Persistence>,
    notifier: Arc<ExternalNotifier>,
    radius_meters: f64,
    delivered: Mutex<HashSet<(Uuid, String)>>,
}

impl NotificationDispatcher {
    pub fn new(
        geo: GeoIndex,
        presence: Arc<PresenceRegistry>,
        store: Arc<dyn Persistence>,
        notifier: Arc<ExternalNotifier>,
        radius_meters: f64,
    ) -> Self {
        Self {
            geo,
            presence,
            store,
            notifier,
            radius_meters,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    fn delivered(&self) -> MutexGuard<'_, HashSet<(Uuid, String)>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fans the alert out to online riders in range and starts the external
    /// path. `external` controls whether the external path runs, so a retry
    /// of the fan-out does not text the contacts twice.
    pub async fn dispatch(&self, alert: &EmergencyAlert, external: bool) -> DispatchReport {
        if alert.status.is_final() {
            debug!(alert_id = %alert.id, status = %alert.status, "Skipping dispatch of closed alert");
            return DispatchReport {
                candidates: Vec::new(),
                pushed: Vec::new(),
                external: None,
            };
        }

        // Started before the fan-out so it never depends on its outcome.
        let external = external.then(|| self.spawn_external(alert.clone()));

        let filter = NearbyFilter {
            exclude: &alert.reporter_id,
            online_only: true,
        };
        let candidates = match self
            .geo
            .nearby(alert.location.point(), self.radius_meters, filter)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "Nearby query failed, no riders notified");
                Vec::new()
            }
        };

        let mut pushed = Vec::new();
        for candidate in &candidates {
            let key = (alert.id, candidate.user_id.clone());
            if !self.delivered().insert(key.clone()) {
                debug!(alert_id = %alert.id, rider = %candidate.user_id, "Already notified");
                continue;
            }

            let payload = json!({
                "alert": alert,
                "distanceMeters": candidate.distance_meters.round(),
            });
            if self.presence.push(&candidate.user_id, EVENT_EMERGENCY_ALERT, payload) {
                pushed.push(candidate.user_id.clone());
            } else {
                warn!(alert_id = %alert.id, rider = %candidate.user_id, "Rider went offline before push");
                self.delivered().remove(&key);
            }
        }

        info!(
            alert_id = %alert.id,
            candidates = candidates.len(),
            pushed = pushed.len(),
            "Alert dispatched"
        );

        DispatchReport {
            candidates,
            pushed,
            external,
        }
    }

    fn spawn_external(&self, alert: EmergencyAlert) -> JoinHandle<ExternalReport> {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);

        tokio::spawn(async move {
            let reporter = match store.load_rider(&alert.reporter_id).await {
                Ok(reporter) => reporter,
                Err(e) => {
                    error!(alert_id = %alert.id, error = %e, "Could not load reporter profile");
                    None
                }
            };
            notifier.deliver(&alert, reporter.as_ref()).await
        })
    }

    /// Pushes a lifecycle event to the given riders, skipping `except`.
    pub fn notify_users(
        &self,
        user_ids: &[String],
        except: Option<&str>,
        event: &str,
        alert: &EmergencyAlert,
    ) -> usize {
        let payload = json!({ "alert": alert });
        user_ids
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter(|id| self.presence.push(id, event, payload.clone()))
            .count()
    }

    /// Drops fan-out keys of a closed alert.
    pub fn forget(&self, alert_id: Uuid) {
        self.delivered().retain(|(id, _)| *id != alert_id);
    }

    #[cfg(test)]
    pub fn delivered_len(&self) -> usize {
        self.delivered().len()
    }
}
