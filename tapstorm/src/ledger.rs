//! The only component permitted to move currency.
//!
//! Every balance mutation is paired with exactly one appended transaction
//! record inside the same per-user critical section, so concurrent debits
//! and credits on one user serialize and the audit trail never diverges
//! from the balance. Users are serialized individually, not per room: a
//! user can be part of two rooms' settlements at once.

use std::sync::Arc;

use dashmap::DashMap;
use tapstorm_utils::{unix_ms, Amount, Transaction, TxKind, UserId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::{StorageError, Store};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("user {user} has {available}, needs {required}")]
    InsufficientBalance {
        user: UserId,
        required: Amount,
        available: Amount,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Account {
    pub balance: Amount,
    pub reward_balance: Amount,
}

pub struct Ledger {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            accounts: DashMap::new(),
            store,
        }
    }

    fn account(&self, user: UserId) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Account::default())))
            .clone()
    }

    /// Remove `amount` from the user's balance. Fails closed: the balance
    /// never goes negative and nothing is recorded on failure.
    pub async fn debit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        memo: &str,
    ) -> Result<(), LedgerError> {
        let account = self.account(user);
        let mut account = account.lock().await;
        let available = if kind.is_reward_currency() {
            account.reward_balance
        } else {
            account.balance
        };
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                user,
                required: amount,
                available,
            });
        }
        if kind.is_reward_currency() {
            account.reward_balance -= amount;
        } else {
            account.balance -= amount;
        }
        self.store
            .append_transaction(&Transaction {
                user,
                amount: -(amount as i64),
                kind,
                memo: memo.to_string(),
                ts_ms: unix_ms(),
            })
            .await?;
        debug!(%user, amount, ?kind, "debited");
        Ok(())
    }

    /// Add `amount` to the user's balance (reward balance for bonus kinds).
    pub async fn credit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        memo: &str,
    ) -> Result<(), LedgerError> {
        let account = self.account(user);
        let mut account = account.lock().await;
        if kind.is_reward_currency() {
            account.reward_balance = account.reward_balance.saturating_add(amount);
        } else {
            account.balance = account.balance.saturating_add(amount);
        }
        self.store
            .append_transaction(&Transaction {
                user,
                amount: amount as i64,
                kind,
                memo: memo.to_string(),
                ts_ms: unix_ms(),
            })
            .await?;
        debug!(%user, amount, ?kind, "credited");
        Ok(())
    }

    pub async fn balance(&self, user: UserId) -> Amount {
        self.account(user).lock().await.balance
    }

    pub async fn reward_balance(&self, user: UserId) -> Amount {
        self.account(user).lock().await.reward_balance
    }
}
