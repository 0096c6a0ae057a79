//! Long-running per-user bonus challenges.
//!
//! A challenge is a counter toward a fixed tap goal inside a time window.
//! Completion pays a fixed reward in the in-game currency exactly once per
//! window, guarded by the `completed` flag.

use std::sync::Arc;

use dashmap::DashMap;
use tapstorm_utils::{unix_ms, BonusProgress, TxKind, UserId};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    config::BonusConfig,
    errors::{InvalidStateError, Result},
    ledger::Ledger,
    storage::Store,
};

pub struct BonusManager {
    config: BonusConfig,
    ledger: Arc<Ledger>,
    store: Arc<dyn Store>,
    progress: DashMap<UserId, Arc<Mutex<BonusProgress>>>,
}

impl BonusManager {
    pub fn new(config: BonusConfig, ledger: Arc<Ledger>, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            ledger,
            store,
            progress: DashMap::new(),
        }
    }

    fn fresh(&self, user: UserId, now_ms: u64) -> BonusProgress {
        BonusProgress {
            user,
            taps: 0,
            goal: self.config.goal,
            started_at_ms: now_ms,
            window_ms: self.config.window_secs * 1_000,
            paused: false,
            completed: false,
        }
    }

    fn slot(&self, user: UserId) -> Arc<Mutex<BonusProgress>> {
        let now_ms = unix_ms();
        self.progress
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(self.fresh(user, now_ms))))
            .clone()
    }

    /// Begin a challenge window, or return the running one. A completed or
    /// expired window is replaced by a fresh one.
    pub async fn start(&self, user: UserId) -> Result<BonusProgress> {
        let slot = self.slot(user);
        let mut progress = slot.lock().await;
        let now_ms = unix_ms();
        if progress.completed || progress.expired(now_ms) {
            *progress = self.fresh(user, now_ms);
        }
        progress.paused = false;
        self.store.upsert_bonus_progress(&progress).await?;
        Ok(progress.clone())
    }

    /// Toggle the challenge off without losing progress.
    pub async fn pause(&self, user: UserId) -> Result<BonusProgress> {
        let slot = self
            .progress
            .get(&user)
            .map(|p| p.value().clone())
            .ok_or(InvalidStateError::BonusInactive { user })?;
        let mut progress = slot.lock().await;
        progress.paused = true;
        self.store.upsert_bonus_progress(&progress).await?;
        Ok(progress.clone())
    }

    /// Count `count` taps toward the goal. Crossing the goal pays the fixed
    /// reward once for this window.
    pub async fn tap(&self, user: UserId, count: u32) -> Result<BonusProgress> {
        let slot = self
            .progress
            .get(&user)
            .map(|p| p.value().clone())
            .ok_or(InvalidStateError::BonusInactive { user })?;
        let mut progress = slot.lock().await;
        let now_ms = unix_ms();
        if progress.expired(now_ms) {
            return Err(InvalidStateError::BonusInactive { user }.into());
        }
        if progress.paused {
            return Err(InvalidStateError::BonusPaused { user }.into());
        }
        progress.taps = progress.taps.saturating_add(count as u64);
        let newly_completed = progress.goal_reached() && !progress.completed;
        if newly_completed {
            progress.completed = true;
        }
        self.store.upsert_bonus_progress(&progress).await?;
        if newly_completed {
            info!(%user, goal = progress.goal, "bonus goal reached");
            self.ledger
                .credit(user, self.config.reward, TxKind::Bonus, "bonus goal reached")
                .await?;
        }
        Ok(progress.clone())
    }

    /// Settlement hook for bonus-type games: pay the reward if the user's
    /// window crossed the goal and has not been paid yet.
    pub async fn complete_if_reached(&self, user: UserId) -> Result<bool> {
        let Some(slot) = self.progress.get(&user).map(|p| p.value().clone()) else {
            return Ok(false);
        };
        let mut progress = slot.lock().await;
        if !progress.goal_reached() || progress.completed {
            return Ok(false);
        }
        progress.completed = true;
        self.store.upsert_bonus_progress(&progress).await?;
        self.ledger
            .credit(user, self.config.reward, TxKind::Bonus, "bonus game settled")
            .await?;
        Ok(true)
    }

    pub async fn progress_of(&self, user: UserId) -> Option<BonusProgress> {
        match self.progress.get(&user).map(|p| p.value().clone()) {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        }
    }
}
