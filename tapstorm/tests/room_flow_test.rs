//! End-to-end coordinator scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use tapstorm::{
    config::ServiceConfig,
    errors::CoordinatorError,
    game_engine::EndReason,
    room_manager::CreateRoomParams,
    storage::{MemoryStore, Store},
    ServiceContext,
};
use tapstorm_utils::{RoomStatus, RoomType, TxKind, UserId};
use tokio::time::sleep;

fn test_ctx(waiting_secs: u64, game_secs: u64) -> Arc<ServiceContext> {
    let mut config = ServiceConfig::test();
    config.timing.waiting_period_secs = waiting_secs;
    config.timing.game_duration_secs = game_secs;
    ServiceContext::new(config, Arc::new(MemoryStore::new()))
}

async fn fund(ctx: &Arc<ServiceContext>, user: UserId, amount: u64) {
    ctx.ledger
        .credit(user, amount, TxKind::Payment, "seed")
        .await
        .unwrap();
}

fn standard_room(creator: UserId, entry_fee: u64, capacity: usize) -> CreateRoomParams {
    CreateRoomParams {
        creator,
        room_type: RoomType::Standard,
        entry_fee,
        capacity,
        waiting_secs: Some(30),
        game_secs: Some(30),
        target_taps: None,
    }
}

#[tokio::test]
async fn standard_room_full_flow() {
    let ctx = test_ctx(30, 1);
    let (creator, rival) = (UserId(1), UserId(2));
    fund(&ctx, creator, 100).await;
    fund(&ctx, rival, 50).await;

    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            game_secs: Some(1),
            ..standard_room(creator, 20, 2)
        })
        .await
        .unwrap();

    // Creator joins and pays the entry fee.
    let summary = ctx.rooms.join(room.id, creator, false).await.unwrap();
    assert_eq!(ctx.ledger.balance(creator).await, 80);
    assert_eq!(summary.participants, 1);
    assert_eq!(summary.status, RoomStatus::Waiting);

    // Second join fills the room: waiting ends, the game starts, and the
    // prize pool is fixed at 2 x 20.
    let summary = ctx.rooms.join(room.id, rival, false).await.unwrap();
    assert_eq!(ctx.ledger.balance(rival).await, 30);
    assert_eq!(summary.participants, 2);
    assert_eq!(summary.status, RoomStatus::Active);
    let game = summary.game.expect("game must be running");
    assert_eq!(game.prize_pool, 40);

    // Creator out-taps the rival.
    ctx.rooms
        .record_tap(room.id, creator, 25, Some(1_000))
        .await
        .unwrap();
    ctx.rooms
        .record_tap(room.id, rival, 30, Some(1_100))
        .await
        .unwrap();
    let total = ctx
        .rooms
        .record_tap(room.id, creator, 25, Some(5_000))
        .await
        .unwrap();
    assert_eq!(total, 50);

    // Duration timer settles the game.
    sleep(Duration::from_millis(1_600)).await;
    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Finished);
    let game = summary.game.unwrap();
    assert!(game.settled);
    assert_eq!(game.winner, Some(creator));

    // Winner got the whole pool, exactly once.
    assert_eq!(ctx.ledger.balance(creator).await, 120);
    assert_eq!(ctx.ledger.balance(rival).await, 30);

    // Settling again is a no-op.
    ctx.rooms
        .end_game(room.id, game.id, EndReason::DurationElapsed)
        .await
        .unwrap();
    assert_eq!(ctx.ledger.balance(creator).await, 120);

    // A finished room accepts no joins or taps.
    assert!(matches!(
        ctx.rooms.join(room.id, UserId(9), false).await,
        Err(CoordinatorError::InvalidState(_))
    ));
    assert!(matches!(
        ctx.rooms.record_tap(room.id, creator, 1, None).await,
        Err(CoordinatorError::InvalidState(_))
    ));
}

#[tokio::test]
async fn tied_totals_resolve_to_first_to_reach() {
    let ctx = test_ctx(30, 30);
    let (a, b) = (UserId(1), UserId(2));

    let room = ctx
        .rooms
        .create_room(standard_room(a, 0, 2))
        .await
        .unwrap();
    ctx.rooms.join(room.id, a, false).await.unwrap();
    ctx.rooms.join(room.id, b, false).await.unwrap();
    let game = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();

    // Both finish on 50, but b's total reaches 50 first.
    ctx.rooms.record_tap(room.id, a, 25, Some(1_000)).await.unwrap();
    ctx.rooms.record_tap(room.id, b, 25, Some(1_050)).await.unwrap();
    ctx.rooms.record_tap(room.id, b, 25, Some(5_000)).await.unwrap();
    ctx.rooms.record_tap(room.id, a, 25, Some(5_100)).await.unwrap();

    ctx.rooms
        .end_game(room.id, game.id, EndReason::TargetReached)
        .await
        .unwrap();
    let settled = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();
    assert_eq!(settled.winner, Some(b));
}

#[tokio::test]
async fn hero_room_auto_deletes_and_refunds() {
    let ctx = test_ctx(30, 30);
    let (creator, guest) = (UserId(1), UserId(2));
    fund(&ctx, creator, 600).await;
    fund(&ctx, guest, 150).await;

    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator,
            room_type: RoomType::Hero,
            entry_fee: 100,
            capacity: 3,
            waiting_secs: Some(1),
            game_secs: Some(30),
            target_taps: None,
        })
        .await
        .unwrap();
    let code = room.join_code.clone().expect("hero rooms carry a join code");

    // Join code lookup resolves the room.
    let found = ctx.rooms.summary_by_code(&code).await.unwrap();
    assert_eq!(found.id, room.id);

    // The hero creator is seated for free; the guest pays.
    ctx.rooms.join(room.id, creator, false).await.unwrap();
    assert_eq!(ctx.ledger.balance(creator).await, 600);
    ctx.rooms.join(room.id, guest, false).await.unwrap();
    assert_eq!(ctx.ledger.balance(guest).await, 50);

    // Nobody fills the room within the waiting period: it auto-deletes,
    // everyone is made whole, and the code is gone.
    sleep(Duration::from_millis(1_500)).await;
    assert!(matches!(
        ctx.rooms.summary(room.id).await,
        Err(CoordinatorError::NotFound(_))
    ));
    assert!(ctx.rooms.summary_by_code(&code).await.is_err());
    assert_eq!(ctx.ledger.balance(guest).await, 150);
    assert_eq!(ctx.ledger.balance(creator).await, 600);

    let refunds: Vec<_> = ctx
        .store
        .transactions_for_user(guest)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TxKind::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
}

#[tokio::test]
async fn hero_creation_requires_minimum_balance() {
    let ctx = test_ctx(30, 30);
    let poor = UserId(1);
    fund(&ctx, poor, 100).await;
    let err = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator: poor,
            room_type: RoomType::Hero,
            entry_fee: 100,
            capacity: 3,
            waiting_secs: None,
            game_secs: None,
            target_taps: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));
}

#[tokio::test]
async fn creator_leave_refunds_every_participant_once() {
    let ctx = test_ctx(30, 30);
    let users: Vec<UserId> = (1..=4).map(UserId).collect();
    for user in &users {
        fund(&ctx, *user, 100).await;
    }
    let creator = users[0];

    let room = ctx
        .rooms
        .create_room(standard_room(creator, 20, 6))
        .await
        .unwrap();
    for user in &users {
        ctx.rooms.join(room.id, *user, false).await.unwrap();
        assert_eq!(ctx.ledger.balance(*user).await, 80);
    }

    ctx.rooms.leave(room.id, creator).await.unwrap();

    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Finished);
    assert_eq!(summary.participants, 0);

    for user in &users {
        assert_eq!(ctx.ledger.balance(*user).await, 100, "user {user} made whole");
        let refunds = ctx
            .store
            .transactions_for_user(*user)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TxKind::Refund)
            .count();
        assert_eq!(refunds, 1, "exactly one refund for {user}");
    }
}

#[tokio::test]
async fn non_creator_leave_refunds_only_the_leaver() {
    let ctx = test_ctx(30, 30);
    let (creator, other) = (UserId(1), UserId(2));
    fund(&ctx, creator, 100).await;
    fund(&ctx, other, 100).await;

    let room = ctx
        .rooms
        .create_room(standard_room(creator, 20, 3))
        .await
        .unwrap();
    ctx.rooms.join(room.id, creator, false).await.unwrap();
    ctx.rooms.join(room.id, other, false).await.unwrap();

    ctx.rooms.leave(room.id, other).await.unwrap();
    assert_eq!(ctx.ledger.balance(other).await, 100);
    assert_eq!(ctx.ledger.balance(creator).await, 80);

    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Waiting);
    assert_eq!(summary.participants, 1);
}

#[tokio::test]
async fn duplicate_join_is_idempotent_and_charges_once() {
    let ctx = test_ctx(30, 30);
    let user = UserId(1);
    fund(&ctx, user, 100).await;

    let room = ctx
        .rooms
        .create_room(standard_room(user, 20, 3))
        .await
        .unwrap();
    ctx.rooms.join(room.id, user, false).await.unwrap();
    ctx.rooms.join(room.id, user, false).await.unwrap();
    assert_eq!(ctx.ledger.balance(user).await, 80);

    let entries = ctx
        .store
        .transactions_for_user(user)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TxKind::Entry)
        .count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn insufficient_balance_aborts_the_join() {
    let ctx = test_ctx(30, 30);
    let (creator, broke) = (UserId(1), UserId(2));
    fund(&ctx, creator, 100).await;
    fund(&ctx, broke, 5).await;

    let room = ctx
        .rooms
        .create_room(standard_room(creator, 20, 3))
        .await
        .unwrap();
    ctx.rooms.join(room.id, creator, false).await.unwrap();

    let err = ctx.rooms.join(room.id, broke, false).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Ledger(_)));
    assert_eq!(ctx.ledger.balance(broke).await, 5);
    assert_eq!(ctx.rooms.summary(room.id).await.unwrap().participants, 1);
}

#[tokio::test]
async fn observers_occupy_no_seat_and_cannot_tap() {
    let ctx = test_ctx(30, 30);
    let (a, b, watcher) = (UserId(1), UserId(2), UserId(3));
    fund(&ctx, a, 100).await;
    fund(&ctx, b, 100).await;

    let room = ctx
        .rooms
        .create_room(standard_room(a, 20, 2))
        .await
        .unwrap();
    ctx.rooms.join(room.id, a, false).await.unwrap();

    // Observer slots do not count toward capacity and cost nothing.
    let summary = ctx.rooms.join(room.id, watcher, true).await.unwrap();
    assert_eq!(summary.participants, 1);
    assert_eq!(summary.observers, 1);
    assert_eq!(summary.status, RoomStatus::Waiting);
    assert_eq!(ctx.ledger.balance(watcher).await, 0);

    // Filling the last real seat starts the game.
    let summary = ctx.rooms.join(room.id, b, false).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Active);
    assert_eq!(summary.game.as_ref().unwrap().prize_pool, 40);

    let err = ctx
        .rooms
        .record_tap(room.id, watcher, 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidState(_)));
}

#[tokio::test]
async fn waiting_timer_starts_a_solo_standard_game() {
    let ctx = test_ctx(1, 1);
    let solo = UserId(1);
    fund(&ctx, solo, 100).await;

    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator: solo,
            room_type: RoomType::Standard,
            entry_fee: 20,
            capacity: 4,
            waiting_secs: Some(1),
            game_secs: Some(1),
            target_taps: None,
        })
        .await
        .unwrap();
    ctx.rooms.join(room.id, solo, false).await.unwrap();

    sleep(Duration::from_millis(1_400)).await;
    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Active);

    ctx.rooms.record_tap(room.id, solo, 10, None).await.unwrap();
    sleep(Duration::from_millis(1_400)).await;

    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Finished);
    assert_eq!(summary.game.unwrap().winner, Some(solo));
    // Solo pool: the lone entry fee comes back as the payout.
    assert_eq!(ctx.ledger.balance(solo).await, 100);
}

#[tokio::test]
async fn empty_waiting_room_finishes_on_timer() {
    let ctx = test_ctx(1, 30);
    let creator = UserId(1);
    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator,
            room_type: RoomType::Standard,
            entry_fee: 0,
            capacity: 4,
            waiting_secs: Some(1),
            game_secs: None,
            target_taps: None,
        })
        .await
        .unwrap();

    sleep(Duration::from_millis(1_400)).await;
    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Finished);
}

#[tokio::test]
async fn tap_flood_is_flagged_and_stays_rejected() {
    let ctx = test_ctx(30, 30);
    let (a, b) = (UserId(1), UserId(2));

    let room = ctx
        .rooms
        .create_room(standard_room(a, 0, 2))
        .await
        .unwrap();
    ctx.rooms.join(room.id, a, false).await.unwrap();
    ctx.rooms.join(room.id, b, false).await.unwrap();

    // 61 taps in one trailing window trips the limit (budget is 60/3s).
    ctx.rooms.record_tap(room.id, a, 30, Some(1_000)).await.unwrap();
    ctx.rooms.record_tap(room.id, a, 30, Some(1_050)).await.unwrap();
    let err = ctx
        .rooms
        .record_tap(room.id, a, 1, Some(1_100))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::TapRejected(_)));

    // Flag is sticky for the rest of the game, well past the window.
    let err = ctx
        .rooms
        .record_tap(room.id, a, 1, Some(60_000))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::TapRejected(_)));

    // The other player is unaffected and wins on taps that stood.
    ctx.rooms.record_tap(room.id, b, 25, Some(2_000)).await.unwrap();
    ctx.rooms.record_tap(room.id, b, 25, Some(6_000)).await.unwrap();
    ctx.rooms.record_tap(room.id, b, 25, Some(10_000)).await.unwrap();

    let game = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();
    ctx.rooms
        .end_game(room.id, game.id, EndReason::TargetReached)
        .await
        .unwrap();
    let settled = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();
    assert_eq!(settled.winner, Some(b));
}

#[tokio::test]
async fn hero_target_taps_ends_the_game_early() {
    let ctx = test_ctx(30, 30);
    let (creator, challenger) = (UserId(1), UserId(2));
    fund(&ctx, creator, 600).await;
    fund(&ctx, challenger, 200).await;

    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator,
            room_type: RoomType::Hero,
            entry_fee: 100,
            capacity: 2,
            waiting_secs: Some(30),
            game_secs: Some(30),
            target_taps: Some(40),
        })
        .await
        .unwrap();
    ctx.rooms.join(room.id, creator, false).await.unwrap();
    ctx.rooms.join(room.id, challenger, false).await.unwrap();
    assert_eq!(
        ctx.rooms.summary(room.id).await.unwrap().status,
        RoomStatus::Active
    );

    ctx.rooms
        .record_tap(room.id, creator, 20, Some(1_000))
        .await
        .unwrap();
    // Crossing the target settles immediately; no timer involved.
    ctx.rooms
        .record_tap(room.id, challenger, 25, Some(1_100))
        .await
        .unwrap();
    ctx.rooms
        .record_tap(room.id, challenger, 25, Some(5_000))
        .await
        .unwrap();

    let summary = ctx.rooms.summary(room.id).await.unwrap();
    assert_eq!(summary.status, RoomStatus::Finished);
    let game = summary.game.unwrap();
    assert_eq!(game.winner, Some(challenger));
    // Pool = the challenger's fee only; the hero creator plays free.
    assert_eq!(game.prize_pool, 100);
    assert_eq!(ctx.ledger.balance(challenger).await, 200);
}

#[tokio::test]
async fn delete_room_is_creator_only_and_refunds() {
    let ctx = test_ctx(30, 30);
    let (creator, other) = (UserId(1), UserId(2));
    fund(&ctx, creator, 100).await;
    fund(&ctx, other, 100).await;

    let room = ctx
        .rooms
        .create_room(standard_room(creator, 20, 4))
        .await
        .unwrap();
    ctx.rooms.join(room.id, creator, false).await.unwrap();
    ctx.rooms.join(room.id, other, false).await.unwrap();

    assert!(matches!(
        ctx.rooms.delete_room(room.id, other).await,
        Err(CoordinatorError::Unauthorized(_))
    ));

    ctx.rooms.delete_room(room.id, creator).await.unwrap();
    assert!(ctx.rooms.summary(room.id).await.is_err());
    assert_eq!(ctx.ledger.balance(creator).await, 100);
    assert_eq!(ctx.ledger.balance(other).await, 100);
}

#[tokio::test]
async fn bonus_room_pays_the_goal_reward_once() {
    let ctx = test_ctx(30, 30);
    let grinder = UserId(1);

    // Bonus rooms skip waiting entirely: created already active, creator
    // seated, challenge window open. Test goal is 100 taps, reward 50.
    let room = ctx
        .rooms
        .create_room(CreateRoomParams {
            creator: grinder,
            room_type: RoomType::Bonus,
            entry_fee: 0,
            capacity: 1,
            waiting_secs: None,
            game_secs: None,
            target_taps: None,
        })
        .await
        .unwrap();
    assert_eq!(room.status, RoomStatus::Active);
    assert_eq!(room.participants, 1);
    assert_eq!(room.game.as_ref().unwrap().prize_pool, 0);

    // Spread below the rate threshold; crossing the goal pays immediately.
    for i in 0..4u64 {
        ctx.rooms
            .record_tap(room.id, grinder, 30, Some(1_000 + i * 4_000))
            .await
            .unwrap();
    }
    assert_eq!(ctx.ledger.reward_balance(grinder).await, 50);

    // Settling the bonus game later never pays a second time.
    let game = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();
    ctx.rooms
        .end_game(room.id, game.id, EndReason::TargetReached)
        .await
        .unwrap();
    assert_eq!(ctx.ledger.reward_balance(grinder).await, 50);
    let settled = ctx.rooms.summary(room.id).await.unwrap().game.unwrap();
    assert_eq!(settled.winner, Some(grinder));
}

#[tokio::test]
async fn auto_join_reuses_then_creates_rooms() {
    let ctx = test_ctx(30, 30);
    let (a, b) = (UserId(1), UserId(2));
    fund(&ctx, a, 100).await;
    fund(&ctx, b, 100).await;

    let first = ctx.rooms.auto_join(a, 20).await.unwrap();
    assert_eq!(first.status, RoomStatus::Waiting);
    assert_eq!(first.participants, 1);

    // Same fee lands in the same room and fills it.
    let second = ctx.rooms.auto_join(b, 20).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, RoomStatus::Active);
}
