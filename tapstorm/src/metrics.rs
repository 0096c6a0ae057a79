use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref TAPS_ACCEPTED: IntCounter = IntCounter::new(
        "tapstorm_taps_accepted_total",
        "Tap counts accepted by the aggregator"
    )
    .expect("metric can be created");
    pub static ref TAPS_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tapstorm_taps_rejected_total",
            "Tap messages rejected by the aggregator"
        ),
        &["reason"]
    )
    .expect("metric can be created");
    pub static ref GAMES_SETTLED: IntCounter = IntCounter::new(
        "tapstorm_games_settled_total",
        "Games finalized with a recorded end time"
    )
    .expect("metric can be created");
    pub static ref PAYOUTS_CREDITED: IntCounter = IntCounter::new(
        "tapstorm_payouts_credited_total",
        "Prize pool units credited to winners"
    )
    .expect("metric can be created");
    pub static ref BROADCAST_DROPPED: IntCounter = IntCounter::new(
        "tapstorm_broadcast_dropped_total",
        "Outbound messages dropped on full connection queues"
    )
    .expect("metric can be created");
    pub static ref ACTIVE_ROOMS: IntGauge = IntGauge::new(
        "tapstorm_active_rooms",
        "Rooms currently waiting or active"
    )
    .expect("metric can be created");
    pub static ref CONNECTED_CLIENTS: IntGauge = IntGauge::new(
        "tapstorm_connected_clients",
        "Live client connections"
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let metrics: [(&str, Box<dyn Fn() -> prometheus::Result<()>>); 7] = [
        ("taps_accepted", Box::new(|| REGISTRY.register(Box::new(TAPS_ACCEPTED.clone())))),
        ("taps_rejected", Box::new(|| REGISTRY.register(Box::new(TAPS_REJECTED.clone())))),
        ("games_settled", Box::new(|| REGISTRY.register(Box::new(GAMES_SETTLED.clone())))),
        ("payouts_credited", Box::new(|| REGISTRY.register(Box::new(PAYOUTS_CREDITED.clone())))),
        ("broadcast_dropped", Box::new(|| REGISTRY.register(Box::new(BROADCAST_DROPPED.clone())))),
        ("active_rooms", Box::new(|| REGISTRY.register(Box::new(ACTIVE_ROOMS.clone())))),
        ("connected_clients", Box::new(|| REGISTRY.register(Box::new(CONNECTED_CLIENTS.clone())))),
    ];
    for (name, register) in metrics {
        if let Err(e) = register() {
            warn!("metric {} already registered: {}", name, e);
        }
    }
}

pub fn tap_rejected(reason: &str) {
    TAPS_REJECTED.with_label_values(&[reason]).inc();
}
