//! Registry of riders holding a live real-time connection.
//!
//! The map is private to [`PresenceRegistry`] and guarded by a synchronous
//! mutex that is never held across an `.await`; every operation completes
//! without suspending. Pushing to a connection is an enqueue onto that
//! connection's outbound channel, drained by its writer task.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PresenceError;
use crate::models::alert::GeoPoint;
use crate::models::envelope::Envelope;
use crate::models::rider::LastKnownLocation;

pub const EVENT_RIDER_ONLINE: &str = "rider_online";
pub const EVENT_RIDER_OFFLINE: &str = "rider_offline";

/// What a connection's writer task receives.
#[derive(Debug)]
pub enum Outbound {
    Event(Envelope),
    /// Tells the writer to send a close frame and stop.
    Close(String),
}

/// Sending half of one live connection. Identity is the connection id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enqueues an event; false when the connection's writer is gone.
    pub fn send(&self, event: &str, payload: Value) -> bool {
        self.tx
            .send(Outbound::Event(Envelope::new(event, payload)))
            .is_ok()
    }

    fn close(&self, reason: &str) {
        let _ = self.tx.send(Outbound::Close(reason.to_string()));
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Debug, Clone)]
pub struct RiderPresence {
    pub user_id: String,
    pub connection: Option<ConnectionHandle>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub last_known_location: Option<LastKnownLocation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    riders: Mutex<HashMap<String, RiderPresence>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave an entry half-written,
    // so a poisoned map is still consistent.
    fn riders(&self) -> MutexGuard<'_, HashMap<String, RiderPresence>> {
        self.riders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `handle` as the user's live connection, closing any previous one.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Result<(), PresenceError> {
        if user_id.trim().is_empty() {
            return Err(PresenceError::InvalidUserId);
        }

        let mut riders = self.riders();
        let now = Utc::now();
        let entry = riders
            .entry(user_id.to_string())
            .or_insert_with(|| RiderPresence {
                user_id: user_id.to_string(),
                connection: None,
                is_online: false,
                last_seen: now,
                last_known_location: None,
            });

        if let Some(previous) = entry.connection.take() {
            info!(user_id, old = %previous.id(), new = %handle.id(), "Superseding connection");
            previous.close("superseded");
        }

        let was_online = entry.is_online;
        entry.connection = Some(handle);
        entry.is_online = true;
        entry.last_seen = now;

        drop(riders);

        if !was_online {
            info!(user_id, "Rider online");
            self.broadcast_except(user_id, EVENT_RIDER_ONLINE, json!({ "userId": user_id }));
        }
        Ok(())
    }

    /// Marks the user offline if `handle` is still the connection on record.
    ///
    /// Returns false for a stale handle, i.e. a disconnect that lost the race
    /// against a newer connection for the same user.
    pub fn unregister(&self, user_id: &str, handle: &ConnectionHandle) -> bool {
        let mut riders = self.riders();
        let Some(entry) = riders.get_mut(user_id) else {
            return false;
        };
        if entry.connection.as_ref() != Some(handle) {
            debug!(user_id, connection = %handle.id(), "Ignoring stale disconnect");
            return false;
        }

        entry.connection = None;
        entry.is_online = false;
        entry.last_seen = Utc::now();

        drop(riders);

        info!(user_id, "Rider offline");
        self.broadcast_except(user_id, EVENT_RIDER_OFFLINE, json!({ "userId": user_id }));
        true
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.riders()
            .get(user_id)
            .and_then(|entry| entry.connection.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.riders()
            .get(user_id)
            .map(|entry| entry.is_online)
            .unwrap_or(false)
    }

    /// Online riders, ordered by user id.
    pub fn snapshot(&self) -> Vec<PresenceSnapshot> {
        let mut online: Vec<PresenceSnapshot> = self
            .riders()
            .values()
            .filter(|entry| entry.is_online)
            .map(|entry| PresenceSnapshot {
                user_id: entry.user_id.clone(),
                last_seen: entry.last_seen,
            })
            .collect();
        online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        online
    }

    pub fn touch(&self, user_id: &str) {
        if let Some(entry) = self.riders().get_mut(user_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Records a location report. Riders without a connection still get an
    /// (offline) entry so the last fix is kept.
    pub fn update_location(&self, user_id: &str, point: GeoPoint) -> LastKnownLocation {
        let now = Utc::now();
        let location = LastKnownLocation {
            lat: point.lat,
            lon: point.lon,
            updated_at: now,
        };

        let mut riders = self.riders();
        let entry = riders
            .entry(user_id.to_string())
            .or_insert_with(|| RiderPresence {
                user_id: user_id.to_string(),
                connection: None,
                is_online: false,
                last_seen: now,
                last_known_location: None,
            });
        entry.last_known_location = Some(location);
        if entry.is_online {
            entry.last_seen = now;
        }
        location
    }

    pub fn last_known_location(&self, user_id: &str) -> Option<LastKnownLocation> {
        self.riders()
            .get(user_id)
            .and_then(|entry| entry.last_known_location)
    }

    pub fn push(&self, user_id: &str, event: &str, payload: Value) -> bool {
        match self.lookup(user_id) {
            Some(handle) => handle.send(event, payload),
            None => false,
        }
    }

    /// Best-effort delivery to every online rider except `user_id`.
    pub fn broadcast_except(&self, user_id: &str, event: &str, payload: Value) -> usize {
        self.riders()
            .values()
            .filter(|entry| entry.user_id != user_id)
            .filter_map(|entry| entry.connection.as_ref())
            .filter(|handle| handle.send(event, payload.clone()))
            .count()
    }
}
