pub mod rate_window;
pub mod room_lifecycle;

use std::time::{SystemTime, UNIX_EPOCH};

pub use rate_window::RateWindow;
pub use room_lifecycle::{
    Amount, BonusProgress, Game, GameId, Participant, Room, RoomId, RoomStatus, RoomType,
    TapRecord, Transaction, TxKind, UserId, HERO_CREATION_MIN_BALANCE, JOIN_CODE_LEN,
};

/// Milliseconds since the unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
