//! Account persistence.
//!
//! [`AccountStore`] is the transactional boundary for everything the ledger,
//! wallet and skip gate mutate. `transact` runs a closure over a consistent
//! snapshot of the requested accounts and writes all of them back, or none.

mod memory;
mod sqlite;

pub use memory::InMemoryAccountStore;
pub use sqlite::SqliteAccountStore;
pub(crate) use sqlite::format_timestamp;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Account, UserId};

/// Mutation applied inside a store transaction. Accounts arrive in the order
/// their ids were requested. Returning an error aborts without writing.
pub type TransactFn<'a> = Box<dyn FnOnce(&mut [Account]) -> Result<()> + Send + 'a>;

/// Durable per-user records with serializable multi-record transactions.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Read one account.
    async fn get(&self, id: &str) -> Result<Account>;

    /// Create an account. Fails with `AccountExists` if the id is taken.
    async fn insert(&self, account: Account) -> Result<()>;

    /// Ids of all stored accounts.
    async fn account_ids(&self) -> Result<Vec<UserId>>;

    /// Atomically read-modify-write the given accounts and return their
    /// committed state.
    ///
    /// Implementations either serialize transactions or fail the losing one
    /// with `TransactionConflict`.
    async fn transact(&self, ids: &[UserId], f: TransactFn<'_>) -> Result<Vec<Account>>;
}

/// Reject transactions that name the same account twice.
pub(crate) fn check_distinct(ids: &[UserId]) -> Result<()> {
    for (i, id) in ids.iter().enumerate() {
        if ids[..i].contains(id) {
            return Err(crate::error::EngineError::InvalidRequest(format!(
                "account {} appears twice in one transaction",
                id
            )));
        }
    }
    Ok(())
}
