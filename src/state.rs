use std::sync::Arc;

use crate::alerts::{AlertLifecycle, AlertPolicy};
use crate::db::Persistence;
use crate::dispatch::NotificationDispatcher;
use crate::geo::GeoIndex;
use crate::notify::ExternalNotifier;
use crate::presence::PresenceRegistry;
use crate::rewards::{RewardLedger, RewardTrigger};

/// Shared handles every connection task works with.
#[derive(Clone)]
pub struct AppState {
    pub presence: Arc<PresenceRegistry>,
    pub store: Arc<dyn Persistence>,
    pub lifecycle: Arc<AlertLifecycle>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Persistence>,
        ledger: Arc<dyn RewardLedger>,
        notifier: ExternalNotifier,
        policy: AlertPolicy,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let geo = GeoIndex::new(Arc::clone(&store), Arc::clone(&presence));
        let dispatcher = NotificationDispatcher::new(
            geo,
            Arc::clone(&presence),
            Arc::clone(&store),
            Arc::new(notifier),
            policy.dispatch_radius_meters,
        );
        let lifecycle = AlertLifecycle::new(
            Arc::clone(&store),
            dispatcher,
            RewardTrigger::new(ledger),
            policy,
        );

        Self {
            presence,
            store,
            lifecycle,
        }
    }
}
