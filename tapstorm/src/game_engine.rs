//! Game start and exactly-once settlement.
//!
//! The prize pool is fixed the instant a game starts. Settlement runs under
//! the owning room's lock and is guarded by a compare-exchange on the
//! game's settled flag, so a duplicate timer fire, a first-to-target
//! trigger and a room deletion can race freely: exactly one of them
//! finalizes the game.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tapstorm_utils::{unix_ms, Game, GameId, RoomId, RoomStatus, RoomType, TapRecord, TxKind, UserId};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    errors::{InvalidStateError, Result},
    metrics,
    protocol::ServerMessage,
    room_manager::{ActiveGame, PendingPayout, RoomManager, RoomState},
};

/// What triggered a settlement attempt. The duration timer must not be
/// aborted from its own fire path, so the reason travels with the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    DurationElapsed,
    TargetReached,
}

impl RoomManager {
    /// Start the room's game. Caller holds the room lock and has verified
    /// the room is joinable no longer or full; this re-checks the player
    /// minimum and fixes the prize pool.
    pub(crate) async fn start_game_locked(
        self: &Arc<Self>,
        state: &mut RoomState,
    ) -> Result<()> {
        let room_id = state.room.id;
        let players = state.players();
        let min = state.room.room_type.min_players();
        if players < min {
            return Err(InvalidStateError::NotEnoughPlayers {
                room: room_id,
                players,
                min,
            }
            .into());
        }

        let paying = state.participants.iter().filter(|p| p.paying).count();
        let prize_pool = state.room.entry_fee * paying as u64;
        let game_id = GameId(self.next_game_id.fetch_add(1, Ordering::Relaxed));
        let game = Game {
            id: game_id,
            room: room_id,
            started_at_ms: unix_ms(),
            duration_secs: state.room.game_secs,
            prize_pool,
            end_time_ms: None,
            winner: None,
        };
        self.store.insert_game(&game).await?;

        state.room.status = RoomStatus::Active;
        self.store.update_room(&state.room).await?;

        let timer = self.spawn_duration_timer(room_id, game_id, state.room.game_secs);
        state.game = Some(ActiveGame {
            game,
            settled: Arc::new(AtomicBool::new(false)),
            timer: Some(timer),
        });

        info!(%room_id, %game_id, players, prize_pool, "game started");
        self.hub.broadcast(
            room_id,
            &ServerMessage::GameStart {
                room_id,
                game_id,
                duration_secs: state.room.game_secs,
                prize_pool,
                timestamp: unix_ms(),
            },
        );
        Ok(())
    }

    fn spawn_duration_timer(
        self: &Arc<Self>,
        room_id: RoomId,
        game_id: GameId,
        secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            if let Err(e) = manager
                .end_game(room_id, game_id, EndReason::DurationElapsed)
                .await
            {
                error!(%room_id, %game_id, "game end handler failed: {e:#}");
            }
        })
    }

    /// Record one batched tap for the room's running game. On acceptance
    /// the user's running total is fanned out; crossing a hero room's
    /// target ends the game.
    pub async fn record_tap(
        self: &Arc<Self>,
        room_id: RoomId,
        user: UserId,
        count: u32,
        ts_ms: Option<u64>,
    ) -> Result<u64> {
        let handle = self
            .room(room_id)
            .ok_or(crate::errors::NotFoundError::Room(room_id))?;

        let mut end_now = None;
        let mut is_bonus = false;
        let total = {
            let state = handle.state.lock().await;
            if state.room.status != RoomStatus::Active {
                return Err(InvalidStateError::NoRunningGame { room: room_id }.into());
            }
            let Some(active) = state.game.as_ref() else {
                return Err(InvalidStateError::NoRunningGame { room: room_id }.into());
            };
            match state.participant(user) {
                None => {
                    return Err(InvalidStateError::NotParticipant {
                        room: room_id,
                        user,
                    }
                    .into())
                }
                Some(p) if p.observer => {
                    return Err(InvalidStateError::ObserverTap { room: room_id }.into())
                }
                Some(_) => {}
            }

            let game_id = active.game.id;
            let ts = ts_ms.unwrap_or_else(unix_ms);
            let total = self.taps.record_tap(game_id, user, count, ts).await?;
            self.hub.broadcast(
                room_id,
                &ServerMessage::Tap {
                    room_id,
                    game_id,
                    user_id: user,
                    total,
                    timestamp: ts,
                },
            );
            if let Some(target) = state.room.target_taps {
                if total >= target {
                    end_now = Some(game_id);
                }
            }
            is_bonus = state.room.room_type == RoomType::Bonus;
            total
        };

        // Bonus-room taps also advance the creator's challenge window; the
        // credit on goal crossing happens there, outside the room lock.
        if is_bonus {
            if let Err(e) = self.bonus.tap(user, count).await {
                debug!(%room_id, %user, "bonus progress tap skipped: {e}");
            }
        }

        if let Some(game_id) = end_now {
            debug!(%room_id, %game_id, %user, "tap target reached");
            self.end_game(room_id, game_id, EndReason::TargetReached)
                .await?;
        }
        Ok(total)
    }

    /// Settle a game. Idempotent: once a settlement attempt wins the
    /// compare-exchange, every later call (late timer fire, duplicate
    /// trigger) is a no-op.
    #[instrument(level = "debug", skip(self))]
    pub async fn end_game(
        self: &Arc<Self>,
        room_id: RoomId,
        game_id: GameId,
        reason: EndReason,
    ) -> Result<()> {
        let Some(handle) = self.room(room_id) else {
            debug!(%room_id, %game_id, "room gone before settlement");
            return Ok(());
        };
        let mut guard = handle.state.lock().await;
        let state = &mut *guard;
        let Some(active) = state.game.as_mut() else {
            return Ok(());
        };
        if active.game.id != game_id {
            debug!(%room_id, %game_id, "stale game end ignored");
            return Ok(());
        }
        if active
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%game_id, "game already settled");
            return Ok(());
        }
        // The fire path must not abort its own task; cancellation there is
        // the settled flag the next fire checks.
        if reason != EndReason::DurationElapsed {
            if let Some(timer) = active.timer.take() {
                timer.abort();
            }
        }

        // Serialized with record_tap on the room lock: every accepted tap
        // is already durable, so the sum below is complete.
        let taps = self.store.taps_for_game(game_id).await?;
        let winner = compute_winner(&taps);
        let now_ms = unix_ms();
        active.game.end_time_ms = Some(now_ms);
        active.game.winner = winner;
        let prize_pool = active.game.prize_pool;
        let room_type = state.room.room_type;

        if let Err(e) = self.store.finalize_game(game_id, now_ms, winner).await {
            warn!(%game_id, "finalize_game: {e}");
        }
        state.room.status = RoomStatus::Finished;
        self.store.update_room(&state.room).await?;
        metrics::GAMES_SETTLED.inc();
        metrics::ACTIVE_ROOMS.dec();
        self.taps.purge_game(game_id);

        // A game nobody scored in still owes the escrowed fees back.
        let no_winner_refunds = if winner.is_none() {
            state.paying_refunds()
        } else {
            Vec::new()
        };

        info!(%room_id, %game_id, ?winner, prize_pool, ?reason, "game settled");
        self.hub.broadcast(
            room_id,
            &ServerMessage::GameEnd {
                room_id,
                game_id,
                winner,
                prize_pool,
                timestamp: now_ms,
            },
        );
        self.hub.drop_room(room_id);
        drop(guard);

        if !no_winner_refunds.is_empty() {
            self.refund_all(room_id, no_winner_refunds).await;
            return Ok(());
        }

        // Credits run without the room lock. A failed credit never rolls
        // back the finalized game; it lands on the reconciliation list.
        match (room_type, winner) {
            (RoomType::Bonus, Some(winner)) => {
                match self.bonus.complete_if_reached(winner).await {
                    Ok(paid) => debug!(%winner, paid, "bonus settlement"),
                    Err(e) => error!(%game_id, %winner, "bonus settlement failed: {e}"),
                }
            }
            (_, Some(winner)) if prize_pool > 0 => {
                match self
                    .ledger
                    .credit(winner, prize_pool, TxKind::Payout, &format!("prize {game_id}"))
                    .await
                {
                    Ok(()) => metrics::PAYOUTS_CREDITED.inc_by(prize_pool),
                    Err(e) => {
                        error!(%game_id, %winner, prize_pool, "payout failed, queued for reconciliation: {e}");
                        self.pending_payouts.lock().await.push(PendingPayout {
                            game: game_id,
                            user: winner,
                            amount: prize_pool,
                            error: e.to_string(),
                            ts_ms: now_ms,
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Winner = strictly highest cumulative tap total. Ties resolve to the
/// user whose running total reached the shared maximum earliest in record
/// append order, which is deterministic for identical input order.
pub fn compute_winner(taps: &[TapRecord]) -> Option<UserId> {
    let mut totals: HashMap<UserId, (u64, usize)> = HashMap::new();
    for (index, tap) in taps.iter().enumerate() {
        let entry = totals.entry(tap.user).or_insert((0, 0));
        entry.0 += tap.count as u64;
        entry.1 = index;
    }
    totals
        .into_iter()
        .min_by(|a, b| {
            // Highest total first, then earliest final record.
            b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1))
        })
        .map(|(user, _)| user)
}
