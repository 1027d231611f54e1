use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{check_distinct, AccountStore, TransactFn};
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::model::{Account, UserId};

/// Process-local account store.
///
/// A single lock covers every account, so transactions are trivially
/// serializable. Used in tests and single-node deployments.
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<UserId, Account>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAccountStore {
    /// Create an empty store stamped with wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that stamps `updated_at` from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, id: &str) -> Result<Account> {
        self.accounts
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::AccountNotFound(id.to_string()))
    }

    async fn insert(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.id) {
            return Err(EngineError::AccountExists(account.id));
        }
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn account_ids(&self) -> Result<Vec<UserId>> {
        let mut ids: Vec<UserId> = self.accounts.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn transact(&self, ids: &[UserId], f: TransactFn<'_>) -> Result<Vec<Account>> {
        check_distinct(ids)?;
        let mut accounts = self.accounts.lock().await;

        let mut working = ids
            .iter()
            .map(|id| {
                accounts
                    .get(id)
                    .cloned()
                    .ok_or_else(|| EngineError::AccountNotFound(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        f(&mut working)?;

        let now = self.clock.now();
        for account in working.iter_mut() {
            account.updated_at = now;
            accounts.insert(account.id.clone(), account.clone());
        }
        Ok(working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_transact_commits_all_or_nothing() {
        let store = InMemoryAccountStore::new();
        store.insert(Account::new("alice", Utc::now())).await.unwrap();
        store.insert(Account::new("bob", Utc::now())).await.unwrap();

        let ids = vec!["alice".to_string(), "bob".to_string()];
        let result = store
            .transact(
                &ids,
                Box::new(|accounts: &mut [Account]| -> Result<()> {
                    accounts[0].credits = 10;
                    Err(EngineError::InsufficientCredits {
                        required: 1,
                        available: 0,
                    })
                }),
            )
            .await;
        assert!(matches!(result, Err(EngineError::InsufficientCredits { .. })));
        assert_eq!(store.get("alice").await.unwrap().credits, 0);

        let committed = store
            .transact(
                &ids,
                Box::new(|accounts: &mut [Account]| -> Result<()> {
                    accounts[0].credits = 10;
                    accounts[1].credits = 20;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(committed[1].id, "bob");
        assert_eq!(store.get("alice").await.unwrap().credits, 10);
        assert_eq!(store.get("bob").await.unwrap().credits, 20);
    }

    #[tokio::test]
    async fn test_transact_rejects_missing_and_duplicate_ids() {
        let store = InMemoryAccountStore::new();
        store.insert(Account::new("alice", Utc::now())).await.unwrap();

        let missing = store
            .transact(&["ghost".to_string()], Box::new(|_: &mut [Account]| -> Result<()> { Ok(()) }))
            .await;
        assert!(matches!(missing, Err(EngineError::AccountNotFound(id)) if id == "ghost"));

        let dup = store
            .transact(
                &["alice".to_string(), "alice".to_string()],
                Box::new(|_: &mut [Account]| -> Result<()> { Ok(()) }),
            )
            .await;
        assert!(matches!(dup, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_insert_twice_fails() {
        let store = InMemoryAccountStore::new();
        store.insert(Account::new("alice", Utc::now())).await.unwrap();
        let again = store.insert(Account::new("alice", Utc::now())).await;
        assert!(matches!(again, Err(EngineError::AccountExists(_))));
        assert_eq!(store.account_ids().await.unwrap(), vec!["alice".to_string()]);
    }
}
