pub mod api_server;
pub mod bonus;
pub mod cli;
pub mod config;
pub mod errors;
pub mod game_engine;
pub mod hub;
pub mod ledger;
pub mod leaderboard;
pub mod metrics;
pub mod protocol;
pub mod room_manager;
pub mod storage;
pub mod tap_aggregator;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

pub use config::ServiceConfig;
pub use errors::{CoordinatorError, Result};

use crate::{
    bonus::BonusManager, hub::BroadcastHub, ledger::Ledger, room_manager::RoomManager,
    storage::Store, tap_aggregator::TapAggregator,
};

/// Explicitly constructed service graph. Components are wired once here and
/// injected, so tests can build the whole coordinator against an in-memory
/// store.
pub struct ServiceContext {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<dyn Store>,
    pub ledger: Arc<Ledger>,
    pub hub: Arc<BroadcastHub>,
    pub taps: Arc<TapAggregator>,
    pub bonus: Arc<BonusManager>,
    pub rooms: Arc<RoomManager>,
}

impl ServiceContext {
    pub fn new(config: ServiceConfig, store: Arc<dyn Store>) -> Arc<Self> {
        let config = Arc::new(config);
        let ledger = Arc::new(Ledger::new(store.clone()));
        let hub = Arc::new(BroadcastHub::new(config.general.outbound_queue_size));
        let taps = Arc::new(TapAggregator::new(config.limits.clone(), store.clone()));
        let bonus = Arc::new(BonusManager::new(
            config.bonus.clone(),
            ledger.clone(),
            store.clone(),
        ));
        let rooms = Arc::new(RoomManager::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            hub.clone(),
            taps.clone(),
            bonus.clone(),
        ));
        Arc::new(Self {
            config,
            store,
            ledger,
            hub,
            taps,
            bonus,
            rooms,
        })
    }

    /// Spawn the hub liveness prober and the aggregator's window GC.
    /// Returns the handles so the caller can abort them on shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let liveness = tokio::spawn(self.hub.clone().run_liveness(
            Duration::from_secs(self.config.general.ping_interval_secs),
            Duration::from_secs(self.config.general.liveness_timeout_secs),
        ));
        let gc = tokio::spawn(self.taps.clone().run_gc());
        vec![liveness, gc]
    }
}
