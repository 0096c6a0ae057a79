//! Room lifecycle coordinator.
//!
//! One `RoomHandle` per room; every operation on a room (create, join,
//! leave, tap, start, settle, delete) serializes on that room's mutex while
//! different rooms proceed in parallel. Ledger calls never run under a room
//! lock: joins debit first and re-validate, refund fan-out happens after the
//! lock is released.
//!
//! Timers (waiting period, hero auto-delete, game duration) are spawned
//! tasks holding only the room id and a generation counter; every fire
//! handler re-checks the current status, so a late fire after a best-effort
//! cancellation is a no-op.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use rand::{distributions::Alphanumeric, Rng};
use tapstorm_utils::{
    unix_ms, Amount, Game, GameId, Participant, Room, RoomId, RoomStatus, RoomType, TxKind,
    UserId, HERO_CREATION_MIN_BALANCE, JOIN_CODE_LEN,
};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    bonus::BonusManager,
    config::ServiceConfig,
    errors::{
        CoordinatorError, InvalidStateError, NotFoundError, Result, ValidationError,
    },
    hub::BroadcastHub,
    ledger::Ledger,
    metrics,
    protocol::{RoomSummary, ServerMessage},
    storage::Store,
    tap_aggregator::TapAggregator,
};

/// Seats in rooms spawned by the auto-join flow.
const AUTO_JOIN_CAPACITY: usize = 2;

pub struct RoomManager {
    pub(crate) config: Arc<ServiceConfig>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) hub: Arc<BroadcastHub>,
    pub(crate) taps: Arc<TapAggregator>,
    pub(crate) bonus: Arc<BonusManager>,
    rooms: DashMap<RoomId, Arc<RoomHandle>>,
    codes: DashMap<String, RoomId>,
    pub(crate) pending_payouts: Mutex<Vec<PendingPayout>>,
    next_room_id: AtomicU64,
    pub(crate) next_game_id: AtomicU64,
}

pub struct RoomHandle {
    pub id: RoomId,
    pub(crate) state: Mutex<RoomState>,
}

pub struct RoomState {
    pub room: Room,
    pub participants: Vec<Participant>,
    timer: Option<JoinHandle<()>>,
    timer_gen: u64,
    pub(crate) game: Option<ActiveGame>,
}

pub struct ActiveGame {
    pub game: Game,
    pub(crate) settled: Arc<AtomicBool>,
    pub(crate) timer: Option<JoinHandle<()>>,
}

/// A settlement credit that failed and awaits manual reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPayout {
    pub game: GameId,
    pub user: UserId,
    pub amount: Amount,
    pub error: String,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateRoomParams {
    pub creator: UserId,
    pub room_type: RoomType,
    pub entry_fee: Amount,
    pub capacity: usize,
    pub waiting_secs: Option<u64>,
    pub game_secs: Option<u64>,
    pub target_taps: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub rooms_waiting: usize,
    pub rooms_active: usize,
    pub rooms_finished: usize,
    pub live_games: usize,
    pub pending_payouts: usize,
}

impl RoomState {
    pub fn players(&self) -> usize {
        self.participants.iter().filter(|p| !p.observer).count()
    }

    pub fn observers(&self) -> usize {
        self.participants.iter().filter(|p| p.observer).count()
    }

    pub fn participant(&self, user: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user == user)
    }

    pub(crate) fn cancel_timer(&mut self) {
        self.timer_gen += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary::from_room(
            &self.room,
            self.players(),
            self.observers(),
            self.game.as_ref().map(|g| &g.game),
        )
    }

    pub(crate) fn paying_refunds(&self) -> Vec<(UserId, Amount)> {
        self.participants
            .iter()
            .filter(|p| p.paying)
            .map(|p| (p.user, self.room.entry_fee))
            .collect()
    }
}

impl RoomManager {
    pub fn new(
        config: Arc<ServiceConfig>,
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        hub: Arc<BroadcastHub>,
        taps: Arc<TapAggregator>,
        bonus: Arc<BonusManager>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            hub,
            taps,
            bonus,
            rooms: DashMap::new(),
            codes: DashMap::new(),
            pending_payouts: Mutex::new(Vec::new()),
            next_room_id: AtomicU64::new(1),
            next_game_id: AtomicU64::new(1),
        }
    }

    pub fn room(&self, id: RoomId) -> Option<Arc<RoomHandle>> {
        self.rooms.get(&id).map(|r| r.value().clone())
    }

    fn require_room(&self, id: RoomId) -> Result<Arc<RoomHandle>> {
        self.room(id).ok_or_else(|| NotFoundError::Room(id).into())
    }

    // ── Room Directory ────────────────────────────────────────────────

    /// Linear scan for a waiting room of the given type and fee with a free
    /// seat; first match wins.
    pub async fn find_available(
        &self,
        room_type: RoomType,
        entry_fee: Amount,
    ) -> Option<Arc<RoomHandle>> {
        let handles: Vec<Arc<RoomHandle>> =
            self.rooms.iter().map(|r| r.value().clone()).collect();
        for handle in handles {
            let state = handle.state.lock().await;
            if state.room.status == RoomStatus::Waiting
                && state.room.room_type == room_type
                && state.room.entry_fee == entry_fee
                && state.players() < state.room.capacity
            {
                drop(state);
                return Some(handle);
            }
        }
        None
    }

    /// Auto-join flow: join the first available standard room with this fee,
    /// creating one when none exists.
    pub async fn auto_join(self: &Arc<Self>, user: UserId, entry_fee: Amount) -> Result<RoomSummary> {
        let room_id = match self.find_available(RoomType::Standard, entry_fee).await {
            Some(handle) => handle.id,
            None => {
                let room = self
                    .create_room(CreateRoomParams {
                        creator: user,
                        room_type: RoomType::Standard,
                        entry_fee,
                        capacity: AUTO_JOIN_CAPACITY,
                        waiting_secs: None,
                        game_secs: None,
                        target_taps: None,
                    })
                    .await?;
                room.id
            }
        };
        self.join(room_id, user, false).await
    }

    pub fn room_id_by_code(&self, code: &str) -> Option<RoomId> {
        self.codes.get(code).map(|id| *id.value())
    }

    /// The user's running bonus room, if any.
    pub async fn bonus_room_for(&self, user: UserId) -> Option<RoomId> {
        let handles: Vec<Arc<RoomHandle>> =
            self.rooms.iter().map(|r| r.value().clone()).collect();
        for handle in handles {
            let state = handle.state.lock().await;
            if state.room.room_type == RoomType::Bonus
                && state.room.creator == user
                && state.room.status == RoomStatus::Active
            {
                return Some(handle.id);
            }
        }
        None
    }

    pub async fn summary_by_code(&self, code: &str) -> Result<RoomSummary> {
        let room_id = self
            .room_id_by_code(code)
            .ok_or_else(|| NotFoundError::JoinCode(code.to_string()))?;
        self.summary(room_id).await
    }

    pub async fn summary(&self, id: RoomId) -> Result<RoomSummary> {
        let handle = self.require_room(id)?;
        let state = handle.state.lock().await;
        Ok(state.summary())
    }

    // ── Room State Machine ────────────────────────────────────────────

    #[instrument(level = "debug", skip(self), fields(creator = %params.creator))]
    pub async fn create_room(self: &Arc<Self>, params: CreateRoomParams) -> Result<RoomSummary> {
        let room_type = params.room_type;
        let bounds = room_type.fee_bounds();
        if !bounds.contains(&params.entry_fee) {
            return Err(ValidationError::EntryFeeOutOfRange {
                room_type: room_type.to_string(),
                fee: params.entry_fee,
                min: *bounds.start(),
                max: *bounds.end(),
            }
            .into());
        }
        let (min_capacity, max_capacity) = (room_type.min_players(), room_type.max_capacity());
        if params.capacity < min_capacity || params.capacity > max_capacity {
            return Err(ValidationError::CapacityOutOfRange {
                room_type: room_type.to_string(),
                capacity: params.capacity,
                min: min_capacity,
                max: max_capacity,
            }
            .into());
        }
        if params.target_taps.is_some() && room_type != RoomType::Hero {
            return Err(ValidationError::MalformedMessage {
                reason: "target_taps is only available for hero rooms".into(),
            }
            .into());
        }
        if room_type == RoomType::Hero {
            let available = self.ledger.balance(params.creator).await;
            if available < HERO_CREATION_MIN_BALANCE {
                return Err(ValidationError::BelowCreationThreshold {
                    required: HERO_CREATION_MIN_BALANCE,
                    available,
                }
                .into());
            }
        }

        let id = RoomId(self.next_room_id.fetch_add(1, Ordering::Relaxed));
        let join_code = if room_type.uses_join_code() {
            Some(self.allocate_join_code(id))
        } else {
            None
        };
        let waiting_secs = params
            .waiting_secs
            .unwrap_or(self.config.timing.waiting_period_secs);
        let game_secs = match room_type {
            RoomType::Bonus => self.config.timing.bonus_game_duration_secs,
            _ => params
                .game_secs
                .unwrap_or(self.config.timing.game_duration_secs),
        };

        let room = Room {
            id,
            creator: params.creator,
            room_type,
            entry_fee: params.entry_fee,
            capacity: params.capacity,
            status: RoomStatus::Waiting,
            join_code,
            waiting_secs,
            game_secs,
            target_taps: params.target_taps,
            created_at_ms: unix_ms(),
        };
        self.store.insert_room(&room).await?;

        let handle = Arc::new(RoomHandle {
            id,
            state: Mutex::new(RoomState {
                room,
                participants: Vec::new(),
                timer: None,
                timer_gen: 0,
                game: None,
            }),
        });
        self.rooms.insert(id, handle.clone());
        metrics::ACTIVE_ROOMS.inc();
        info!(%id, %room_type, fee = params.entry_fee, "room created");

        let mut state = handle.state.lock().await;
        match room_type {
            RoomType::Bonus => {
                // Bonus rooms skip the waiting period: the creator is seated,
                // their challenge window opens and the game starts at once.
                self.bonus.start(params.creator).await?;
                let participant = Participant {
                    room: id,
                    user: params.creator,
                    joined_at_ms: unix_ms(),
                    observer: false,
                    paying: false,
                };
                self.store.insert_participant(&participant).await?;
                state.participants.push(participant);
                self.start_game_locked(&mut state).await?;
            }
            RoomType::Hero => {
                state.timer = Some(self.spawn_auto_delete_timer(id, waiting_secs, state.timer_gen));
            }
            RoomType::Standard => {
                state.timer = Some(self.spawn_waiting_timer(id, waiting_secs, state.timer_gen));
            }
        }
        Ok(state.summary())
    }

    fn allocate_join_code(&self, room: RoomId) -> String {
        loop {
            let code: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(JOIN_CODE_LEN)
                .map(|c| (c as char).to_ascii_uppercase())
                .collect();
            // Collision-checked against every live code.
            match self.codes.entry(code.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(room);
                    return code;
                }
            }
        }
    }

    /// Join a room. Idempotent for existing participants. The entry fee is
    /// debited before the participant is seated; if the room filled or
    /// closed in between, the debit is compensated with a refund.
    #[instrument(level = "debug", skip(self))]
    pub async fn join(
        self: &Arc<Self>,
        room_id: RoomId,
        user: UserId,
        as_observer: bool,
    ) -> Result<RoomSummary> {
        let handle = self.require_room(room_id)?;

        let (entry_fee, must_pay) = {
            let state = handle.state.lock().await;
            if state.participant(user).is_some() {
                return Ok(state.summary());
            }
            if state.room.status != RoomStatus::Waiting {
                return Err(InvalidStateError::JoinClosed {
                    room: room_id,
                    status: state.room.status,
                }
                .into());
            }
            if !as_observer && state.players() >= state.room.capacity {
                return Err(InvalidStateError::RoomFull { room: room_id }.into());
            }
            let hero_creator =
                state.room.room_type == RoomType::Hero && state.room.creator == user;
            let must_pay = !as_observer && !hero_creator && state.room.entry_fee > 0;
            (state.room.entry_fee, must_pay)
        };

        if must_pay {
            self.ledger
                .debit(user, entry_fee, TxKind::Entry, &format!("entry {room_id}"))
                .await?;
        }

        let mut state = handle.state.lock().await;
        // Re-validate: the room may have changed while the debit ran.
        if state.participant(user).is_some() {
            drop(state);
            self.compensate_entry(user, entry_fee, must_pay, room_id).await;
            return self.summary(room_id).await;
        }
        if state.room.status != RoomStatus::Waiting {
            let status = state.room.status;
            drop(state);
            self.compensate_entry(user, entry_fee, must_pay, room_id).await;
            return Err(InvalidStateError::JoinClosed {
                room: room_id,
                status,
            }
            .into());
        }
        if !as_observer && state.players() >= state.room.capacity {
            drop(state);
            self.compensate_entry(user, entry_fee, must_pay, room_id).await;
            return Err(InvalidStateError::RoomFull { room: room_id }.into());
        }

        let participant = Participant {
            room: room_id,
            user,
            joined_at_ms: unix_ms(),
            observer: as_observer,
            paying: must_pay,
        };
        self.store.insert_participant(&participant).await?;
        state.participants.push(participant);
        debug!(%room_id, %user, as_observer, "participant joined");

        self.hub.broadcast(
            room_id,
            &ServerMessage::PlayerJoin {
                room_id,
                user_id: user,
                observer: as_observer,
            },
        );
        self.hub.broadcast(
            room_id,
            &ServerMessage::RoomUpdate {
                room_id,
                data: state.summary(),
            },
        );

        // A non-observer filling the last seat starts the game early.
        if !as_observer && state.players() >= state.room.capacity {
            state.cancel_timer();
            self.start_game_locked(&mut state).await?;
        }
        Ok(state.summary())
    }

    async fn compensate_entry(&self, user: UserId, fee: Amount, paid: bool, room: RoomId) {
        if !paid {
            return;
        }
        if let Err(e) = self
            .ledger
            .credit(user, fee, TxKind::Refund, &format!("entry reverted {room}"))
            .await
        {
            error!(%room, %user, "failed to revert entry fee: {e}");
        }
    }

    /// Leave a waiting room. The leaver is refunded; a leaving creator
    /// closes the room and refunds everyone.
    #[instrument(level = "debug", skip(self))]
    pub async fn leave(self: &Arc<Self>, room_id: RoomId, user: UserId) -> Result<()> {
        let handle = self.require_room(room_id)?;
        let mut state = handle.state.lock().await;
        if state.room.status != RoomStatus::Waiting {
            return Err(InvalidStateError::LeaveClosed {
                room: room_id,
                status: state.room.status,
            }
            .into());
        }
        if state.participant(user).is_none() {
            return Err(InvalidStateError::NotParticipant {
                room: room_id,
                user,
            }
            .into());
        }

        if user == state.room.creator {
            // Creator walked: close the room and make everyone whole.
            let refunds = state.paying_refunds();
            state.cancel_timer();
            state.participants.clear();
            self.store.clear_participants(room_id).await?;
            self.finish_room_locked(&mut state, "creator left").await?;
            drop(state);
            self.refund_all(room_id, refunds).await;
            return Ok(());
        }

        let leaver = state
            .participants
            .iter()
            .find(|p| p.user == user)
            .copied();
        state.participants.retain(|p| p.user != user);
        self.store.remove_participant(room_id, user).await?;
        self.hub.broadcast(
            room_id,
            &ServerMessage::PlayerLeave {
                room_id,
                user_id: user,
            },
        );
        self.hub.broadcast(
            room_id,
            &ServerMessage::RoomUpdate {
                room_id,
                data: state.summary(),
            },
        );

        let refund = leaver.filter(|p| p.paying).map(|_| state.room.entry_fee);

        if state.participants.is_empty() {
            state.cancel_timer();
            self.finish_room_locked(&mut state, "room emptied").await?;
        }
        drop(state);

        if let Some(amount) = refund {
            self.refund_all(room_id, vec![(user, amount)]).await;
        }
        Ok(())
    }

    /// Creator-initiated deletion; allowed any time before settlement.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_room(self: &Arc<Self>, room_id: RoomId, requester: UserId) -> Result<()> {
        let handle = self.require_room(room_id)?;
        let mut state = handle.state.lock().await;
        if state.room.creator != requester {
            return Err(CoordinatorError::Unauthorized(format!(
                "only the creator may delete room {room_id}"
            )));
        }
        if state.room.status == RoomStatus::Finished {
            return Err(InvalidStateError::RoomSettled { room: room_id }.into());
        }
        state.cancel_timer();
        if let Some(active) = state.game.as_mut() {
            // Claim the settlement slot so a racing duration timer no-ops.
            if active
                .settled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(InvalidStateError::RoomSettled { room: room_id }.into());
            }
            if let Some(timer) = active.timer.take() {
                timer.abort();
            }
            let game_id = active.game.id;
            active.game.end_time_ms = Some(unix_ms());
            if let Err(e) = self
                .store
                .finalize_game(game_id, unix_ms(), None)
                .await
            {
                warn!(%room_id, %game_id, "finalize on delete failed: {e}");
            }
            self.taps.purge_game(game_id);
        }

        let refunds = state.paying_refunds();
        state.participants.clear();
        state.room.status = RoomStatus::Finished;
        self.remove_room_records(room_id).await;
        self.hub
            .broadcast(room_id, &ServerMessage::RoomDeleted { room_id });
        self.hub.drop_room(room_id);
        metrics::ACTIVE_ROOMS.dec();
        info!(%room_id, "room deleted by creator");
        drop(state);

        self.refund_all(room_id, refunds).await;
        Ok(())
    }

    async fn remove_room_records(&self, room_id: RoomId) {
        if let Err(e) = self.store.remove_room(room_id).await {
            warn!(%room_id, "failed to remove room from store: {e}");
        }
        self.rooms.remove(&room_id);
        self.codes.retain(|_, id| *id != room_id);
    }

    /// Mark a waiting room finished in place (not deleted).
    pub(crate) async fn finish_room_locked(
        &self,
        state: &mut RoomState,
        reason: &str,
    ) -> Result<()> {
        let room_id = state.room.id;
        if !state.room.status.can_advance_to(RoomStatus::Finished) {
            return Ok(());
        }
        state.room.status = RoomStatus::Finished;
        self.store.update_room(&state.room).await?;
        self.hub.broadcast(
            room_id,
            &ServerMessage::RoomUpdate {
                room_id,
                data: state.summary(),
            },
        );
        self.hub.drop_room(room_id);
        metrics::ACTIVE_ROOMS.dec();
        info!(%room_id, reason, "room finished");
        Ok(())
    }

    pub(crate) async fn refund_all(&self, room_id: RoomId, refunds: Vec<(UserId, Amount)>) {
        let results = join_all(refunds.iter().map(|(user, amount)| {
            let ledger = self.ledger.clone();
            let memo = format!("refund {room_id}");
            let (user, amount) = (*user, *amount);
            async move { ledger.credit(user, amount, TxKind::Refund, &memo).await }
        }))
        .await;
        for ((user, amount), result) in refunds.iter().zip(results) {
            if let Err(e) = result {
                error!(%room_id, %user, amount, "refund failed: {e}");
            }
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    fn spawn_waiting_timer(
        self: &Arc<Self>,
        room_id: RoomId,
        secs: u64,
        gen: u64,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            if let Err(e) = manager.on_waiting_expired(room_id, gen).await {
                error!(%room_id, "waiting timer handler failed: {e:#}");
            }
        })
    }

    fn spawn_auto_delete_timer(
        self: &Arc<Self>,
        room_id: RoomId,
        secs: u64,
        gen: u64,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            if let Err(e) = manager.on_auto_delete(room_id, gen).await {
                error!(%room_id, "auto-delete handler failed: {e:#}");
            }
        })
    }

    async fn on_waiting_expired(self: Arc<Self>, room_id: RoomId, gen: u64) -> Result<()> {
        let Some(handle) = self.room(room_id) else {
            return Ok(());
        };
        let mut state = handle.state.lock().await;
        if state.timer_gen != gen || state.room.status != RoomStatus::Waiting {
            debug!(%room_id, "stale waiting timer fire ignored");
            return Ok(());
        }
        state.timer = None;
        let players = state.players();
        if players == 0 {
            self.finish_room_locked(&mut state, "waiting period expired empty")
                .await?;
            return Ok(());
        }
        if players >= state.room.room_type.min_players() {
            info!(%room_id, players, "waiting period expired, starting game");
            self.start_game_locked(&mut state).await?;
            return Ok(());
        }
        // Not enough players to start: make everyone whole and close.
        let refunds = state.paying_refunds();
        state.participants.clear();
        self.store.clear_participants(room_id).await?;
        self.finish_room_locked(&mut state, "not enough players").await?;
        drop(state);
        self.refund_all(room_id, refunds).await;
        Ok(())
    }

    async fn on_auto_delete(self: Arc<Self>, room_id: RoomId, gen: u64) -> Result<()> {
        let Some(handle) = self.room(room_id) else {
            return Ok(());
        };
        let mut state = handle.state.lock().await;
        if state.timer_gen != gen || state.room.status != RoomStatus::Waiting {
            debug!(%room_id, "stale auto-delete fire ignored");
            return Ok(());
        }
        state.timer = None;
        let refunds = state.paying_refunds();
        state.participants.clear();
        state.room.status = RoomStatus::Finished;
        self.remove_room_records(room_id).await;
        self.hub
            .broadcast(room_id, &ServerMessage::RoomDeleted { room_id });
        self.hub.drop_room(room_id);
        metrics::ACTIVE_ROOMS.dec();
        info!(%room_id, "hero room auto-deleted");
        drop(state);
        self.refund_all(room_id, refunds).await;
        Ok(())
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub async fn stats(&self) -> CoordinatorStats {
        let handles: Vec<Arc<RoomHandle>> =
            self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut stats = CoordinatorStats::default();
        for handle in handles {
            let state = handle.state.lock().await;
            match state.room.status {
                RoomStatus::Waiting => stats.rooms_waiting += 1,
                RoomStatus::Active => {
                    stats.rooms_active += 1;
                    if state.game.is_some() {
                        stats.live_games += 1;
                    }
                }
                RoomStatus::Finished => stats.rooms_finished += 1,
            }
        }
        stats.pending_payouts = self.pending_payouts.lock().await.len();
        stats
    }

    pub async fn pending_payouts(&self) -> Vec<PendingPayout> {
        self.pending_payouts.lock().await.clone()
    }
}
