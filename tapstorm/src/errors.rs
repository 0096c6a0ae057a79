use tapstorm_utils::{Amount, GameId, RoomId, RoomStatus, UserId};
use thiserror::Error;

use crate::{ledger::LedgerError, storage::StorageError, tap_aggregator::TapRejection};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidStateError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("tap rejected: {0}")]
    TapRejected(#[from] TapRejection),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("channel error: {error}")]
    Channel { error: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("entry fee {fee} outside {min}..={max} for {room_type} rooms")]
    EntryFeeOutOfRange {
        room_type: String,
        fee: Amount,
        min: Amount,
        max: Amount,
    },

    #[error("capacity {capacity} outside {min}..={max} for {room_type} rooms")]
    CapacityOutOfRange {
        room_type: String,
        capacity: usize,
        min: usize,
        max: usize,
    },

    #[error("creator balance {available} below hero creation threshold {required}")]
    BelowCreationThreshold { required: Amount, available: Amount },

    #[error("tap count must be a positive integer")]
    ZeroTapCount,

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("unknown leaderboard period: {period}")]
    UnknownPeriod { period: String },
}

#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("room {0}")]
    Room(RoomId),

    #[error("game {0}")]
    Game(GameId),

    #[error("no room with join code {0}")]
    JoinCode(String),

    #[error("user {0}")]
    User(UserId),
}

#[derive(Error, Debug)]
pub enum InvalidStateError {
    #[error("room {room} is {status}, joins are only accepted while waiting")]
    JoinClosed { room: RoomId, status: RoomStatus },

    #[error("room {room} is {status}, leaving is only permitted while waiting")]
    LeaveClosed { room: RoomId, status: RoomStatus },

    #[error("room {room} is full")]
    RoomFull { room: RoomId },

    #[error("room {room} has no running game")]
    NoRunningGame { room: RoomId },

    #[error("room {room} has {players} players, needs {min} to start")]
    NotEnoughPlayers {
        room: RoomId,
        players: usize,
        min: usize,
    },

    #[error("user {user} is not a participant of room {room}")]
    NotParticipant { room: RoomId, user: UserId },

    #[error("observers cannot tap in room {room}")]
    ObserverTap { room: RoomId },

    #[error("game {game} already settled")]
    AlreadySettled { game: GameId },

    #[error("room {room} already settled")]
    RoomSettled { room: RoomId },

    #[error("no active bonus challenge for user {user}")]
    BonusInactive { user: UserId },

    #[error("bonus challenge for user {user} is paused")]
    BonusPaused { user: UserId },
}

impl CoordinatorError {
    pub fn channel<E: std::fmt::Display>(error: E) -> Self {
        Self::Channel {
            error: error.to_string(),
        }
    }

    /// Short machine-readable code used in API error bodies and outbound
    /// `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Validation(_) => "validation_error",
            CoordinatorError::Ledger(LedgerError::InsufficientBalance { .. }) => {
                "insufficient_balance"
            }
            CoordinatorError::Ledger(_) => "ledger_error",
            CoordinatorError::NotFound(_) => "not_found",
            CoordinatorError::InvalidState(_) => "invalid_state",
            CoordinatorError::Unauthorized(_) => "unauthorized",
            CoordinatorError::TapRejected(_) => "abuse_detected",
            CoordinatorError::Storage(_) => "storage_error",
            CoordinatorError::Channel { .. } => "channel_error",
            CoordinatorError::Other(_) => "internal_error",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoordinatorError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::channel(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CoordinatorError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::channel(err)
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
