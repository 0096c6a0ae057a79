//! Wire protocol for the realtime transport.
//!
//! Messages are a tagged union keyed by the `type` field, one payload shape
//! per variant, validated here at the transport boundary before anything
//! reaches the coordinator.

use serde::{Deserialize, Serialize};
use tapstorm_utils::{Amount, Game, GameId, Room, RoomId, RoomStatus, RoomType, UserId};

use crate::errors::ValidationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        data: JoinData,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    Tap {
        room_id: RoomId,
        data: TapData,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    PlayerReaction {
        room_id: RoomId,
        data: ReactionData,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinData {
    #[serde(default)]
    pub as_observer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapData {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionData {
    pub to_user_id: UserId,
    pub reaction: String,
}

impl ClientMessage {
    /// Parse and validate one inbound frame.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let msg: ClientMessage =
            serde_json::from_str(text).map_err(|e| ValidationError::MalformedMessage {
                reason: e.to_string(),
            })?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ClientMessage::Tap { data, .. } if data.count == 0 => {
                Err(ValidationError::ZeroTapCount)
            }
            ClientMessage::PlayerReaction { data, .. } if data.reaction.is_empty() => {
                Err(ValidationError::MalformedMessage {
                    reason: "reaction must not be empty".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    GameStart {
        room_id: RoomId,
        game_id: GameId,
        duration_secs: u64,
        prize_pool: Amount,
        timestamp: u64,
    },
    GameEnd {
        room_id: RoomId,
        game_id: GameId,
        winner: Option<UserId>,
        prize_pool: Amount,
        timestamp: u64,
    },
    PlayerJoin {
        room_id: RoomId,
        user_id: UserId,
        observer: bool,
    },
    PlayerLeave {
        room_id: RoomId,
        user_id: UserId,
    },
    Tap {
        room_id: RoomId,
        game_id: GameId,
        user_id: UserId,
        total: u64,
        timestamp: u64,
    },
    PlayerReaction {
        room_id: RoomId,
        user_id: UserId,
        data: ReactionData,
    },
    RoomUpdate {
        room_id: RoomId,
        data: RoomSummary,
    },
    RoomDeleted {
        room_id: RoomId,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Client-facing projection of a room, embedded in `room_update` events and
/// returned by the room HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub creator: UserId,
    pub room_type: RoomType,
    pub entry_fee: Amount,
    pub capacity: usize,
    pub status: RoomStatus,
    pub join_code: Option<String>,
    pub waiting_secs: u64,
    pub game_secs: u64,
    pub participants: usize,
    pub observers: usize,
    pub game: Option<GameSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSummary {
    pub id: GameId,
    pub started_at_ms: u64,
    pub duration_secs: u64,
    pub prize_pool: Amount,
    pub winner: Option<UserId>,
    pub settled: bool,
}

impl GameSummary {
    pub fn from_game(game: &Game) -> Self {
        Self {
            id: game.id,
            started_at_ms: game.started_at_ms,
            duration_secs: game.duration_secs,
            prize_pool: game.prize_pool,
            winner: game.winner,
            settled: game.is_settled(),
        }
    }
}

impl RoomSummary {
    pub fn from_room(room: &Room, participants: usize, observers: usize, game: Option<&Game>) -> Self {
        Self {
            id: room.id,
            creator: room.creator,
            room_type: room.room_type,
            entry_fee: room.entry_fee,
            capacity: room.capacity,
            status: room.status,
            join_code: room.join_code.clone(),
            waiting_secs: room.waiting_secs,
            game_secs: room.game_secs,
            participants,
            observers,
            game: game.map(GameSummary::from_game),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_message_round_trips() {
        let msg = ClientMessage::parse(
            r#"{"type":"tap","room_id":7,"data":{"count":5},"timestamp":123}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Tap {
                room_id,
                data,
                timestamp,
            } => {
                assert_eq!(room_id, RoomId(7));
                assert_eq!(data.count, 5);
                assert_eq!(timestamp, Some(123));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn zero_count_tap_is_rejected() {
        let err =
            ClientMessage::parse(r#"{"type":"tap","room_id":7,"data":{"count":0}}"#).unwrap_err();
        assert!(matches!(err, ValidationError::ZeroTapCount));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"warp_drive","room_id":1}"#).is_err());
    }

    #[test]
    fn join_defaults_to_player() {
        let msg = ClientMessage::parse(r#"{"type":"join_room","room_id":3}"#).unwrap();
        match msg {
            ClientMessage::JoinRoom { data, .. } => assert!(!data.as_observer),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn server_message_uses_snake_case_tags() {
        let json = serde_json::to_string(&ServerMessage::RoomDeleted { room_id: RoomId(9) })
            .unwrap();
        assert!(json.contains(r#""type":"room_deleted""#));
    }

    #[test]
    fn reaction_requires_fields() {
        let err = ClientMessage::parse(
            r#"{"type":"player_reaction","room_id":1,"data":{"to_user_id":2,"reaction":""}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedMessage { .. }));
    }
}
