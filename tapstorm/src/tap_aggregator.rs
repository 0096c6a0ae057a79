//! Hot-path tap admission and aggregation.
//!
//! Every accepted batch becomes an append-only tap record; the per-user
//! running total feeds the live leaderboard broadcast. The abuse check is
//! O(1) amortized per tap (a bounded trailing window per user) and flags
//! are sticky: once a user trips a limit in a game, everything else they
//! send for that game is rejected until the flag is cleared.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use tapstorm_utils::{GameId, RateWindow, TapRecord, UserId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{config::TapLimitsConfig, metrics, storage::Store};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TapRejection {
    #[error("count {count} exceeds per-message ceiling {max}")]
    CountCeiling { count: u32, max: u32 },

    #[error("{in_window} taps in the trailing window exceeds {max}")]
    RateExceeded { in_window: u64, max: u64 },

    #[error("user is flagged for this game")]
    Flagged,
}

impl TapRejection {
    fn reason(&self) -> &'static str {
        match self {
            TapRejection::CountCeiling { .. } => "count_ceiling",
            TapRejection::RateExceeded { .. } => "rate_exceeded",
            TapRejection::Flagged => "flagged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbuseRecord {
    pub reason: String,
    pub flagged_at_ms: u64,
}

type Key = (GameId, UserId);

pub struct TapAggregator {
    limits: TapLimitsConfig,
    store: Arc<dyn Store>,
    windows: DashMap<Key, Arc<Mutex<RateWindow>>>,
    totals: DashMap<Key, AtomicU64>,
    abuse: DashMap<Key, AbuseRecord>,
}

impl TapAggregator {
    pub fn new(limits: TapLimitsConfig, store: Arc<dyn Store>) -> Self {
        Self {
            limits,
            store,
            windows: DashMap::new(),
            totals: DashMap::new(),
            abuse: DashMap::new(),
        }
    }

    /// Admit one batched tap message. Returns the user's new running total
    /// for the game on acceptance.
    pub async fn record_tap(
        &self,
        game: GameId,
        user: UserId,
        count: u32,
        ts_ms: u64,
    ) -> Result<u64, TapRejection> {
        let key = (game, user);

        if self.abuse.contains_key(&key) {
            metrics::tap_rejected(TapRejection::Flagged.reason());
            return Err(TapRejection::Flagged);
        }

        if count == 0 || count > self.limits.max_taps_per_message {
            let rejection = TapRejection::CountCeiling {
                count,
                max: self.limits.max_taps_per_message,
            };
            self.flag(key, &rejection, ts_ms);
            return Err(rejection);
        }

        let window = self
            .windows
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RateWindow::new(
                    self.limits.window_ms,
                    self.limits.window_max_taps,
                )))
            })
            .clone();
        let mut window = window.lock().await;
        if !window.observe(ts_ms, count) {
            let rejection = TapRejection::RateExceeded {
                in_window: window.current(ts_ms),
                max: self.limits.window_max_taps,
            };
            drop(window);
            self.flag(key, &rejection, ts_ms);
            return Err(rejection);
        }
        drop(window);

        if let Err(e) = self
            .store
            .append_tap(&TapRecord {
                game,
                user,
                count,
                ts_ms,
            })
            .await
        {
            // A tap that is not durably recorded must not count.
            warn!(%game, %user, "failed to append tap record: {e}");
            metrics::tap_rejected("storage");
            return Err(TapRejection::Flagged);
        }

        let total = {
            let entry = self.totals.entry(key).or_insert_with(|| AtomicU64::new(0));
            entry.fetch_add(count as u64, Ordering::Relaxed) + count as u64
        };
        metrics::TAPS_ACCEPTED.inc_by(count as u64);
        Ok(total)
    }

    fn flag(&self, key: Key, rejection: &TapRejection, ts_ms: u64) {
        metrics::tap_rejected(rejection.reason());
        let (game, user) = key;
        info!(%game, %user, "flagging user: {rejection}");
        self.abuse.entry(key).or_insert_with(|| AbuseRecord {
            reason: rejection.to_string(),
            flagged_at_ms: ts_ms,
        });
    }

    pub fn is_flagged(&self, game: GameId, user: UserId) -> bool {
        self.abuse.contains_key(&(game, user))
    }

    pub fn abuse_record(&self, game: GameId, user: UserId) -> Option<AbuseRecord> {
        self.abuse.get(&(game, user)).map(|r| r.clone())
    }

    /// Manual unflag; returns whether a record existed.
    pub fn clear_abuse(&self, game: GameId, user: UserId) -> bool {
        self.abuse.remove(&(game, user)).is_some()
    }

    pub fn total(&self, game: GameId, user: UserId) -> u64 {
        self.totals
            .get(&(game, user))
            .map(|t| t.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Live totals for one game, for leaderboard broadcasts.
    pub fn totals_for_game(&self, game: GameId) -> Vec<(UserId, u64)> {
        self.totals
            .iter()
            .filter(|entry| entry.key().0 == game)
            .map(|entry| (entry.key().1, entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    /// Drop all state for a settled game.
    pub fn purge_game(&self, game: GameId) {
        self.windows.retain(|key, _| key.0 != game);
        self.totals.retain(|key, _| key.0 != game);
        self.abuse.retain(|key, _| key.0 != game);
    }

    /// Evict windows that have been idle longer than the purge horizon.
    /// Totals and abuse records live until the game is purged.
    pub async fn gc(&self, now_ms: u64) {
        let mut stale = Vec::new();
        for entry in self.windows.iter() {
            let window = entry.value().lock().await;
            if window.idle_ms(now_ms) > self.limits.idle_purge_ms {
                stale.push(*entry.key());
            }
        }
        for key in stale {
            self.windows.remove(&key);
        }
    }

    /// Periodic garbage collection of inactive windows.
    pub async fn run_gc(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.limits.gc_interval_secs));
        loop {
            interval.tick().await;
            self.gc(tapstorm_utils::unix_ms()).await;
        }
    }
}
