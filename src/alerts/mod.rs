//! Emergency alert lifecycle.
//!
//! ```text
//! active    ── first respond ─────────► responded
//! active    ── resolve / auto-resolve ─► resolved
//! responded ── resolve ───────────────► resolved
//! active    ── cancel ────────────────► cancelled
//! responded ── cancel ────────────────► cancelled
//! ```
//!
//! Every mutation of an existing alert runs under that alert's lock and
//! re-reads the stored copy, so two operations on the same alert never
//! interleave and the loser of a race sees the winner's final state.
//! Creation is serialized per reporter for duplicate suppression.

mod locks;
mod timer;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Persistence;
use crate::dispatch::{DispatchReport, NotificationDispatcher};
use crate::error::AlertError;
use crate::geo::haversine_meters;
use crate::models::alert::{
    AlertStatus, EmergencyAlert, GeoPoint, NearbyAlert, NewAlert, Responder,
};
use crate::rewards::{RewardKind, RewardTrigger};

use locks::KeyedLocks;
use timer::AutoResolveTimers;

pub const EVENT_ALERT_RESPONSE: &str = "alert_response";
pub const EVENT_ALERT_RESOLVED: &str = "alert_resolved";
pub const EVENT_ALERT_CANCELLED: &str = "alert_cancelled";

/// Retry delay when an auto-resolve could not be persisted.
const AUTO_RESOLVE_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub auto_resolve_after: Duration,
    pub duplicate_window: chrono::Duration,
    pub dispatch_radius_meters: f64,
    pub response_points: i32,
    pub resolved_points: i32,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            auto_resolve_after: Duration::from_secs(30 * 60),
            duplicate_window: chrono::Duration::minutes(5),
            dispatch_radius_meters: 10_000.0,
            response_points: 50,
            resolved_points: 25,
        }
    }
}

pub struct CreatedAlert {
    pub alert: EmergencyAlert,
    pub dispatch: DispatchReport,
}

pub struct AlertLifecycle {
    store: Arc<dyn Persistence>,
    dispatcher: NotificationDispatcher,
    rewards: RewardTrigger,
    timers: AutoResolveTimers,
    alert_locks: KeyedLocks<Uuid>,
    reporter_locks: KeyedLocks<String>,
    policy: AlertPolicy,
    this: Weak<AlertLifecycle>,
}

impl AlertLifecycle {
    pub fn new(
        store: Arc<dyn Persistence>,
        dispatcher: NotificationDispatcher,
        rewards: RewardTrigger,
        policy: AlertPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            dispatcher,
            rewards,
            timers: AutoResolveTimers::new(),
            alert_locks: KeyedLocks::new(),
            reporter_locks: KeyedLocks::new(),
            policy,
            this: this.clone(),
        })
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    async fn load(&self, alert_id: Uuid) -> Result<EmergencyAlert, AlertError> {
        self.store
            .load_alert(alert_id)
            .await?
            .ok_or(AlertError::AlertNotFound)
    }

    fn schedule_auto_resolve(&self, alert_id: Uuid, delay: Duration) {
        let lifecycle = self.this.clone();
        self.timers.schedule(alert_id, delay, async move {
            let Some(lifecycle) = lifecycle.upgrade() else {
                return;
            };
            if let Err(e) = lifecycle.auto_resolve_fired(alert_id).await {
                error!(alert_id = %alert_id, error = %e, "Auto-resolve failed");
            }
        });
    }

    pub async fn create(
        &self,
        reporter_id: &str,
        request: NewAlert,
    ) -> Result<CreatedAlert, AlertError> {
        GeoPoint::new(request.location.lat, request.location.lon)?;

        let reporter_guard = self.reporter_locks.lock(reporter_id.to_string()).await;

        let since = Utc::now() - self.policy.duplicate_window;
        let recent = self
            .store
            .find_active_alerts_by_reporter(reporter_id, since)
            .await?;
        if let Some(existing) = recent.first() {
            warn!(reporter = reporter_id, existing = %existing.id, "Duplicate active alert rejected");
            return Err(AlertError::DuplicateActiveAlert);
        }

        let alert = EmergencyAlert::new(
            reporter_id.to_string(),
            request.alert_type,
            request.severity,
            request.location,
            request.description,
        );
        // Held through the fan-out so a close cannot slip in before the last push.
        let alert_guard = self.alert_locks.lock(alert.id).await;
        self.store.save_alert(&alert).await?;
        self.schedule_auto_resolve(alert.id, self.policy.auto_resolve_after);
        drop(reporter_guard);

        info!(
            alert_id = %alert.id,
            reporter = reporter_id,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            "Emergency alert created"
        );

        let dispatch = self.dispatcher.dispatch(&alert, true).await;
        drop(alert_guard);
        Ok(CreatedAlert { alert, dispatch })
    }

    pub async fn respond(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        message: Option<String>,
        eta_minutes: Option<u32>,
    ) -> Result<EmergencyAlert, AlertError> {
        let _guard = self.alert_locks.lock(alert_id).await;
        let mut alert = self.load(alert_id).await?;

        if alert.reporter_id == responder_id {
            return Err(AlertError::SelfResponseNotAllowed);
        }
        if alert.status.is_final() {
            return Err(AlertError::AlertNotActive);
        }
        if alert.has_responder(responder_id) {
            return Err(AlertError::DuplicateResponse);
        }

        let first_response = alert.status == AlertStatus::Active;
        alert.responders.push(Responder {
            responder_id: responder_id.to_string(),
            responded_at: Utc::now(),
            message,
            eta_minutes,
        });
        if first_response {
            alert.status = AlertStatus::Responded;
        }
        self.store.save_alert(&alert).await?;

        info!(
            alert_id = %alert_id,
            responder = responder_id,
            responders = alert.responders.len(),
            first_response,
            "Alert response recorded"
        );

        if first_response {
            self.rewards.grant(
                responder_id,
                RewardKind::EmergencyResponse,
                self.policy.response_points,
                alert_id,
            );
        }
        self.dispatcher.notify_users(
            &[alert.reporter_id.clone()],
            Some(responder_id),
            EVENT_ALERT_RESPONSE,
            &alert,
        );

        Ok(alert)
    }

    pub async fn resolve(
        &self,
        alert_id: Uuid,
        requesting_user_id: &str,
    ) -> Result<EmergencyAlert, AlertError> {
        let _guard = self.alert_locks.lock(alert_id).await;
        let mut alert = self.load(alert_id).await?;

        if alert.status.is_final() {
            return Err(AlertError::AlreadyResolved);
        }
        if alert.reporter_id != requesting_user_id && !alert.has_responder(requesting_user_id) {
            return Err(AlertError::NotAuthorizedToResolve);
        }

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(Utc::now());
        alert.resolved_by = Some(requesting_user_id.to_string());
        self.store.save_alert(&alert).await?;
        self.timers.cancel(alert_id);

        info!(alert_id = %alert_id, resolved_by = requesting_user_id, "Alert resolved");

        for responder in &alert.responders {
            self.rewards.grant(
                &responder.responder_id,
                RewardKind::EmergencyResolved,
                self.policy.resolved_points,
                alert_id,
            );
        }
        self.close_out(&alert, Some(requesting_user_id), EVENT_ALERT_RESOLVED);

        Ok(alert)
    }

    /// Withdraws an alert. Only the reporter may cancel.
    pub async fn cancel(
        &self,
        alert_id: Uuid,
        requesting_user_id: &str,
    ) -> Result<EmergencyAlert, AlertError> {
        let _guard = self.alert_locks.lock(alert_id).await;
        let mut alert = self.load(alert_id).await?;

        if alert.status.is_final() {
            return Err(AlertError::AlreadyResolved);
        }
        if alert.reporter_id != requesting_user_id {
            return Err(AlertError::NotAuthorizedToResolve);
        }

        alert.status = AlertStatus::Cancelled;
        alert.resolved_at = Some(Utc::now());
        alert.resolved_by = Some(requesting_user_id.to_string());
        self.store.save_alert(&alert).await?;
        self.timers.cancel(alert_id);

        info!(alert_id = %alert_id, "Alert cancelled by reporter");
        self.close_out(&alert, Some(requesting_user_id), EVENT_ALERT_CANCELLED);

        Ok(alert)
    }

    /// Timer callback. Only an alert still `active` is closed; anything else
    /// is left untouched. Returns the alert when it was auto-resolved.
    pub async fn auto_resolve_fired(
        &self,
        alert_id: Uuid,
    ) -> Result<Option<EmergencyAlert>, AlertError> {
        let _guard = self.alert_locks.lock(alert_id).await;
        if !self.timers.claim(alert_id) {
            debug!(alert_id = %alert_id, "Auto-resolve timer was cancelled");
            return Ok(None);
        }

        let mut alert = match self.store.load_alert(alert_id).await {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                warn!(alert_id = %alert_id, "Auto-resolve fired for unknown alert");
                return Ok(None);
            }
            Err(e) => {
                self.schedule_auto_resolve(alert_id, AUTO_RESOLVE_RETRY);
                return Err(e.into());
            }
        };

        if alert.status != AlertStatus::Active {
            debug!(alert_id = %alert_id, status = %alert.status, "Auto-resolve skipped");
            // Fan-out and the first-response grant are behind it either way.
            self.release_keys(alert_id);
            return Ok(None);
        }

        alert.status = AlertStatus::Resolved;
        alert.auto_resolved = true;
        alert.resolved_at = Some(Utc::now());
        if let Err(e) = self.store.save_alert(&alert).await {
            self.schedule_auto_resolve(alert_id, AUTO_RESOLVE_RETRY);
            return Err(e.into());
        }

        info!(alert_id = %alert_id, "Alert auto-resolved after timeout");
        self.close_out(&alert, None, EVENT_ALERT_RESOLVED);

        Ok(Some(alert))
    }

    fn close_out(&self, alert: &EmergencyAlert, actor: Option<&str>, event: &str) {
        self.dispatcher
            .notify_users(&alert.participants(), actor, event, alert);
        self.release_keys(alert.id);
    }

    /// Drops in-memory idempotency keys of an alert that will see no more
    /// fan-out or grants.
    fn release_keys(&self, alert_id: Uuid) {
        self.dispatcher.forget(alert_id);
        self.rewards.forget(alert_id);
    }

    /// Open alerts within `radius_meters`, nearest first, leaving out those
    /// reported by `exclude_user`.
    pub async fn query_nearby_alerts(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        exclude_user: &str,
    ) -> Result<Vec<NearbyAlert>, AlertError> {
        let point = GeoPoint::new(point.lat, point.lon)?;
        let mut alerts: Vec<NearbyAlert> = self
            .store
            .find_open_alerts_near(point, radius_meters)
            .await?
            .into_iter()
            .filter(|n| n.alert.reporter_id != exclude_user)
            .map(|mut n| {
                n.distance_meters = haversine_meters(point, n.alert.location.point());
                n
            })
            .filter(|n| n.distance_meters < radius_meters)
            .collect();
        alerts.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        Ok(alerts)
    }

    pub async fn open_alerts_for(
        &self,
        reporter_id: &str,
    ) -> Result<Vec<EmergencyAlert>, AlertError> {
        Ok(self.store.find_open_alerts_by_reporter(reporter_id).await?)
    }
}

#[cfg(test)]
mod tests;
