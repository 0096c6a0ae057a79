//! Persistence collaborator boundary.
//!
//! The coordinator owns the live in-memory state; everything that must
//! survive it (users, rooms, participants, games, taps, transactions,
//! bonus progress) is written through this trait. `MemoryStore` backs the
//! single-process deployment and the test suite.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tapstorm_utils::{
    BonusProgress, Game, GameId, Participant, Room, RoomId, RoomStatus, RoomType, TapRecord,
    Transaction, UserId,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("duplicate {what}: {key}")]
    Duplicate { what: &'static str, key: String },

    #[error("{what} not found: {key}")]
    Missing { what: &'static str, key: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    /// Opaque subject supplied by the identity collaborator; unique.
    pub identity_key: String,
    pub wallet_linked: bool,
    pub created_at_ms: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn user_by_identity(&self, key: &str) -> Result<Option<UserProfile>, StorageError>;
    async fn create_user(&self, key: &str, now_ms: u64) -> Result<UserProfile, StorageError>;
    async fn set_wallet_linked(&self, user: UserId, linked: bool) -> Result<(), StorageError>;

    async fn insert_room(&self, room: &Room) -> Result<(), StorageError>;
    async fn update_room(&self, room: &Room) -> Result<(), StorageError>;
    async fn remove_room(&self, id: RoomId) -> Result<(), StorageError>;
    async fn room(&self, id: RoomId) -> Result<Option<Room>, StorageError>;
    async fn rooms_with_status(
        &self,
        room_type: RoomType,
        status: RoomStatus,
    ) -> Result<Vec<Room>, StorageError>;
    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StorageError>;

    async fn insert_participant(&self, participant: &Participant) -> Result<(), StorageError>;
    async fn remove_participant(&self, room: RoomId, user: UserId) -> Result<(), StorageError>;
    async fn clear_participants(&self, room: RoomId) -> Result<(), StorageError>;
    async fn participants(&self, room: RoomId) -> Result<Vec<Participant>, StorageError>;

    async fn insert_game(&self, game: &Game) -> Result<(), StorageError>;
    async fn finalize_game(
        &self,
        id: GameId,
        end_time_ms: u64,
        winner: Option<UserId>,
    ) -> Result<(), StorageError>;

    async fn append_tap(&self, tap: &TapRecord) -> Result<(), StorageError>;
    /// Tap records of a game in append order.
    async fn taps_for_game(&self, game: GameId) -> Result<Vec<TapRecord>, StorageError>;

    async fn append_transaction(&self, tx: &Transaction) -> Result<(), StorageError>;
    async fn transactions_for_user(&self, user: UserId) -> Result<Vec<Transaction>, StorageError>;
    async fn transactions_since(&self, ts_ms: u64) -> Result<Vec<Transaction>, StorageError>;

    async fn bonus_progress(&self, user: UserId) -> Result<Option<BonusProgress>, StorageError>;
    async fn upsert_bonus_progress(&self, progress: &BonusProgress) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryStore {
    users_by_key: DashMap<String, UserProfile>,
    rooms: DashMap<RoomId, Room>,
    codes: DashMap<String, RoomId>,
    participants: DashMap<RoomId, Vec<Participant>>,
    games: DashMap<GameId, Game>,
    taps: DashMap<GameId, Vec<TapRecord>>,
    transactions: Mutex<Vec<Transaction>>,
    bonus: DashMap<UserId, BonusProgress>,
    next_user_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_user_id: AtomicU64::new(1),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_by_identity(&self, key: &str) -> Result<Option<UserProfile>, StorageError> {
        Ok(self.users_by_key.get(key).map(|u| u.clone()))
    }

    async fn create_user(&self, key: &str, now_ms: u64) -> Result<UserProfile, StorageError> {
        if self.users_by_key.contains_key(key) {
            return Err(StorageError::Duplicate {
                what: "user identity",
                key: key.to_string(),
            });
        }
        let profile = UserProfile {
            id: UserId(self.next_user_id.fetch_add(1, Ordering::Relaxed)),
            identity_key: key.to_string(),
            wallet_linked: false,
            created_at_ms: now_ms,
        };
        self.users_by_key.insert(key.to_string(), profile.clone());
        Ok(profile)
    }

    async fn set_wallet_linked(&self, user: UserId, linked: bool) -> Result<(), StorageError> {
        for mut entry in self.users_by_key.iter_mut() {
            if entry.id == user {
                entry.wallet_linked = linked;
                return Ok(());
            }
        }
        Err(StorageError::Missing {
            what: "user",
            key: user.to_string(),
        })
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StorageError> {
        if let Some(code) = &room.join_code {
            if self.codes.contains_key(code) {
                return Err(StorageError::Duplicate {
                    what: "join code",
                    key: code.clone(),
                });
            }
            self.codes.insert(code.clone(), room.id);
        }
        if self.rooms.insert(room.id, room.clone()).is_some() {
            return Err(StorageError::Duplicate {
                what: "room",
                key: room.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_room(&self, room: &Room) -> Result<(), StorageError> {
        match self.rooms.get_mut(&room.id) {
            Some(mut entry) => {
                *entry = room.clone();
                Ok(())
            }
            None => Err(StorageError::Missing {
                what: "room",
                key: room.id.to_string(),
            }),
        }
    }

    async fn remove_room(&self, id: RoomId) -> Result<(), StorageError> {
        if let Some((_, room)) = self.rooms.remove(&id) {
            if let Some(code) = room.join_code {
                self.codes.remove(&code);
            }
        }
        self.participants.remove(&id);
        Ok(())
    }

    async fn room(&self, id: RoomId) -> Result<Option<Room>, StorageError> {
        Ok(self.rooms.get(&id).map(|r| r.clone()))
    }

    async fn rooms_with_status(
        &self,
        room_type: RoomType,
        status: RoomStatus,
    ) -> Result<Vec<Room>, StorageError> {
        Ok(self
            .rooms
            .iter()
            .filter(|r| r.room_type == room_type && r.status == status)
            .map(|r| r.clone())
            .collect())
    }

    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StorageError> {
        match self.codes.get(code) {
            Some(id) => Ok(self.rooms.get(&id).map(|r| r.clone())),
            None => Ok(None),
        }
    }

    async fn insert_participant(&self, participant: &Participant) -> Result<(), StorageError> {
        let mut entries = self.participants.entry(participant.room).or_default();
        if entries.iter().any(|p| p.user == participant.user) {
            return Err(StorageError::Duplicate {
                what: "participant",
                key: format!("{}/{}", participant.room, participant.user),
            });
        }
        entries.push(*participant);
        Ok(())
    }

    async fn remove_participant(&self, room: RoomId, user: UserId) -> Result<(), StorageError> {
        if let Some(mut entries) = self.participants.get_mut(&room) {
            entries.retain(|p| p.user != user);
        }
        Ok(())
    }

    async fn clear_participants(&self, room: RoomId) -> Result<(), StorageError> {
        self.participants.remove(&room);
        Ok(())
    }

    async fn participants(&self, room: RoomId) -> Result<Vec<Participant>, StorageError> {
        Ok(self
            .participants
            .get(&room)
            .map(|p| p.clone())
            .unwrap_or_default())
    }

    async fn insert_game(&self, game: &Game) -> Result<(), StorageError> {
        if self.games.insert(game.id, game.clone()).is_some() {
            return Err(StorageError::Duplicate {
                what: "game",
                key: game.id.to_string(),
            });
        }
        Ok(())
    }

    async fn finalize_game(
        &self,
        id: GameId,
        end_time_ms: u64,
        winner: Option<UserId>,
    ) -> Result<(), StorageError> {
        match self.games.get_mut(&id) {
            Some(mut game) => {
                if game.end_time_ms.is_some() {
                    return Err(StorageError::Duplicate {
                        what: "game settlement",
                        key: id.to_string(),
                    });
                }
                game.end_time_ms = Some(end_time_ms);
                game.winner = winner;
                Ok(())
            }
            None => Err(StorageError::Missing {
                what: "game",
                key: id.to_string(),
            }),
        }
    }

    async fn append_tap(&self, tap: &TapRecord) -> Result<(), StorageError> {
        self.taps.entry(tap.game).or_default().push(*tap);
        Ok(())
    }

    async fn taps_for_game(&self, game: GameId) -> Result<Vec<TapRecord>, StorageError> {
        Ok(self.taps.get(&game).map(|t| t.clone()).unwrap_or_default())
    }

    async fn append_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        self.transactions.lock().await.push(tx.clone());
        Ok(())
    }

    async fn transactions_for_user(&self, user: UserId) -> Result<Vec<Transaction>, StorageError> {
        Ok(self
            .transactions
            .lock()
            .await
            .iter()
            .filter(|t| t.user == user)
            .cloned()
            .collect())
    }

    async fn transactions_since(&self, ts_ms: u64) -> Result<Vec<Transaction>, StorageError> {
        Ok(self
            .transactions
            .lock()
            .await
            .iter()
            .filter(|t| t.ts_ms >= ts_ms)
            .cloned()
            .collect())
    }

    async fn bonus_progress(&self, user: UserId) -> Result<Option<BonusProgress>, StorageError> {
        Ok(self.bonus.get(&user).map(|b| b.clone()))
    }

    async fn upsert_bonus_progress(&self, progress: &BonusProgress) -> Result<(), StorageError> {
        self.bonus.insert(progress.user, progress.clone());
        Ok(())
    }
}
