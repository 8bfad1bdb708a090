//! Reward grants tied to alert transitions.
//!
//! A grant is keyed by (user, kind, alert). [`RewardTrigger::grant`] claims
//! the key synchronously and books the points on the ledger in a background
//! task, so the caller's transition never waits on, or fails because of,
//! the ledger.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewardKind {
    /// First responder on an active alert.
    EmergencyResponse,
    /// Listed responder on an alert that was resolved by hand.
    EmergencyResolved,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::EmergencyResponse => "emergency_response",
            RewardKind::EmergencyResolved => "emergency_resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardGrant {
    pub user_id: String,
    pub kind: RewardKind,
    pub points: i32,
    pub related_alert_id: Uuid,
}

/// Rewards bookkeeping collaborator.
#[async_trait]
pub trait RewardLedger: Send + Sync {
    /// Books the grant; `Ok(false)` when it was already on the ledger.
    async fn record(&self, grant: &RewardGrant) -> Result<bool, StoreError>;
}

type GrantKey = (String, RewardKind, Uuid);

pub struct RewardTrigger {
    ledger: Arc<dyn RewardLedger>,
    claimed: Arc<Mutex<HashSet<GrantKey>>>,
}

impl RewardTrigger {
    pub fn new(ledger: Arc<dyn RewardLedger>) -> Self {
        Self {
            ledger,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns false without touching the ledger if this key was already granted.
    pub fn grant(&self, user_id: &str, kind: RewardKind, points: i32, related_alert_id: Uuid) -> bool {
        let key = (user_id.to_string(), kind, related_alert_id);
        let fresh = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !fresh {
            debug!(user_id, kind = kind.as_str(), alert_id = %related_alert_id, "Grant already claimed");
            return false;
        }

        let grant = RewardGrant {
            user_id: user_id.to_string(),
            kind,
            points,
            related_alert_id,
        };
        let ledger = Arc::clone(&self.ledger);
        let claimed = Arc::clone(&self.claimed);

        tokio::spawn(async move {
            match ledger.record(&grant).await {
                Ok(true) => info!(
                    user_id = %grant.user_id,
                    kind = grant.kind.as_str(),
                    points = grant.points,
                    alert_id = %grant.related_alert_id,
                    "Reward granted"
                ),
                Ok(false) => debug!(
                    user_id = %grant.user_id,
                    kind = grant.kind.as_str(),
                    "Reward already on ledger"
                ),
                Err(e) => {
                    error!(
                        user_id = %grant.user_id,
                        kind = grant.kind.as_str(),
                        error = %e,
                        "Failed to record reward"
                    );
                    // The ledger dedups on its own key, so a later retry is safe.
                    claimed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&key);
                }
            }
        });

        true
    }

    /// Releases the keys of a closed alert. The ledger's own unique key
    /// still rejects a repeat booking.
    pub fn forget(&self, related_alert_id: Uuid) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, _, alert_id)| *alert_id != related_alert_id);
    }

    #[cfg(test)]
    pub fn claimed_len(&self) -> usize {
        self.claimed.lock().unwrap().len()
    }
}
