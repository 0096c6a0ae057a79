//! Payout leaderboards over the transaction log.

use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use serde::Serialize;
use tapstorm_utils::{TxKind, UserId};

use crate::{
    errors::{Result, ValidationError},
    storage::Store,
};

const LEADERBOARD_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    Week,
    AllTime,
}

impl Period {
    pub fn cutoff_ms(&self, now_ms: u64) -> u64 {
        const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
        match self {
            Period::Today => now_ms - now_ms % DAY_MS,
            Period::Week => now_ms.saturating_sub(7 * DAY_MS),
            Period::AllTime => 0,
        }
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Period::Today),
            "week" => Ok(Period::Week),
            "alltime" => Ok(Period::AllTime),
            other => Err(ValidationError::UnknownPeriod {
                period: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub winnings: u64,
    pub wins: usize,
}

/// Rank users by prize payouts received since the period's cutoff.
pub async fn winnings(
    store: &Arc<dyn Store>,
    period: Period,
    now_ms: u64,
) -> Result<Vec<LeaderboardEntry>> {
    let transactions = store.transactions_since(period.cutoff_ms(now_ms)).await?;
    let entries = transactions
        .iter()
        .filter(|t| t.kind == TxKind::Payout && t.amount > 0)
        .map(|t| (t.user, t.amount as u64))
        .into_group_map()
        .into_iter()
        .map(|(user_id, payouts)| LeaderboardEntry {
            user_id,
            winnings: payouts.iter().sum(),
            wins: payouts.len(),
        })
        .sorted_by(|a, b| {
            b.winnings
                .cmp(&a.winnings)
                .then(a.user_id.0.cmp(&b.user_id.0))
        })
        .take(LEADERBOARD_LIMIT)
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tapstorm_utils::Transaction;

    async fn seed(store: &MemoryStore, user: u64, amount: i64, kind: TxKind, ts_ms: u64) {
        store
            .append_transaction(&Transaction {
                user: UserId(user),
                amount,
                kind,
                memo: String::new(),
                ts_ms,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ranks_by_payouts_within_the_period() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, 40, TxKind::Payout, 1_000).await;
        seed(&store, 2, 100, TxKind::Payout, 2_000).await;
        seed(&store, 1, 100, TxKind::Payout, 3_000).await;
        // Non-payout noise is ignored.
        seed(&store, 3, 500, TxKind::Payment, 2_500).await;
        seed(&store, 2, -20, TxKind::Entry, 2_600).await;

        let store: Arc<dyn Store> = store;
        let board = winnings(&store, Period::AllTime, 10_000).await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].user_id, UserId(1));
        assert_eq!(board[0].winnings, 140);
        assert_eq!(board[0].wins, 2);
        assert_eq!(board[1].user_id, UserId(2));
    }

    #[tokio::test]
    async fn cutoff_excludes_older_payouts() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, 40, TxKind::Payout, 1_000).await;
        seed(&store, 2, 10, TxKind::Payout, 9_500).await;

        let store: Arc<dyn Store> = store;
        let board = winnings(&store, Period::Week, 9_000 + 7 * 24 * 60 * 60 * 1_000)
            .await
            .unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].user_id, UserId(2));
    }

    #[test]
    fn period_parsing() {
        assert_eq!("today".parse::<Period>().unwrap(), Period::Today);
        assert_eq!("week".parse::<Period>().unwrap(), Period::Week);
        assert_eq!("alltime".parse::<Period>().unwrap(), Period::AllTime);
        assert!("yesterday".parse::<Period>().is_err());
    }
}
