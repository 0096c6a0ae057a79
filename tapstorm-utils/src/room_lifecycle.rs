use std::{fmt, ops::RangeInclusive};

use serde::{Deserialize, Serialize};

/// Currency amount in the smallest unit. Direction is carried by the
/// operation and transaction kind, never by the sign of an `Amount`.
pub type Amount = u64;

macro_rules! id_type {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(UserId, "u");
id_type!(RoomId, "r");
id_type!(GameId, "g");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Standard,
    Bonus,
    Hero,
}

impl RoomType {
    /// Valid entry-fee range for rooms of this type.
    pub fn fee_bounds(&self) -> RangeInclusive<Amount> {
        match self {
            RoomType::Standard => 0..=100,
            RoomType::Bonus => 0..=0,
            RoomType::Hero => 0..=10_000,
        }
    }

    /// Hard cap on non-observer seats.
    pub fn max_capacity(&self) -> usize {
        match self {
            RoomType::Standard => 10,
            RoomType::Bonus => 1,
            RoomType::Hero => 50,
        }
    }

    /// Fewest non-observer participants a game of this type may start with.
    /// Hero rooms are invitational and only start on a full house or with at
    /// least two players; standard and bonus games may run solo.
    pub fn min_players(&self) -> usize {
        match self {
            RoomType::Standard => 1,
            RoomType::Bonus => 1,
            RoomType::Hero => 2,
        }
    }

    pub fn uses_join_code(&self) -> bool {
        matches!(self, RoomType::Hero)
    }

    /// Bonus rooms never wait; the game starts at creation.
    pub fn skips_waiting(&self) -> bool {
        matches!(self, RoomType::Bonus)
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomType::Standard => write!(f, "standard"),
            RoomType::Bonus => write!(f, "bonus"),
            RoomType::Hero => write!(f, "hero"),
        }
    }
}

/// Minimum primary balance required to create a hero room.
pub const HERO_CREATION_MIN_BALANCE: Amount = 500;

/// Length of generated hero join codes.
pub const JOIN_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Finished,
}

impl RoomStatus {
    /// Status is monotonic: waiting -> active -> finished, never backward.
    /// A room may also finish straight from waiting (empty timeout, creator
    /// leave, deletion).
    pub fn can_advance_to(self, next: RoomStatus) -> bool {
        matches!(
            (self, next),
            (RoomStatus::Waiting, RoomStatus::Active)
                | (RoomStatus::Waiting, RoomStatus::Finished)
                | (RoomStatus::Active, RoomStatus::Finished)
        )
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomStatus::Waiting => write!(f, "waiting"),
            RoomStatus::Active => write!(f, "active"),
            RoomStatus::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub creator: UserId,
    pub room_type: RoomType,
    pub entry_fee: Amount,
    pub capacity: usize,
    pub status: RoomStatus,
    pub join_code: Option<String>,
    pub waiting_secs: u64,
    pub game_secs: u64,
    /// Hero-only first-to-threshold variant; None means timer-ended.
    pub target_taps: Option<u64>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Participant {
    pub room: RoomId,
    pub user: UserId,
    pub joined_at_ms: u64,
    /// Observers occupy no seat, pay nothing, contribute no taps, cannot win.
    pub observer: bool,
    /// Whether an entry fee was escrowed for this participant.
    pub paying: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub room: RoomId,
    pub started_at_ms: u64,
    pub duration_secs: u64,
    /// Fixed at start: entry fee x paying participants.
    pub prize_pool: Amount,
    pub end_time_ms: Option<u64>,
    pub winner: Option<UserId>,
}

impl Game {
    pub fn is_settled(&self) -> bool {
        self.end_time_ms.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TapRecord {
    pub game: GameId,
    pub user: UserId,
    pub count: u32,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Entry,
    Payout,
    Fee,
    Referral,
    Payment,
    Refund,
    Bonus,
}

impl TxKind {
    /// Bonus rewards land on the in-game reward balance; everything else
    /// moves the wallet-backed primary balance.
    pub fn is_reward_currency(&self) -> bool {
        matches!(self, TxKind::Bonus)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub user: UserId,
    /// Signed: debits are negative, credits positive.
    pub amount: i64,
    pub kind: TxKind,
    pub memo: String,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusProgress {
    pub user: UserId,
    pub taps: u64,
    pub goal: u64,
    pub started_at_ms: u64,
    pub window_ms: u64,
    pub paused: bool,
    pub completed: bool,
}

impl BonusProgress {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_at_ms) > self.window_ms
    }

    pub fn goal_reached(&self) -> bool {
        self.taps >= self.goal
    }
}
