//! SQLite persistence layer for the pairing engine.
//!
//! This crate provides async database operations for accounts (time ledger,
//! wallet and skip gate state) and the archive of closed chat sessions using
//! SQLx with SQLite.
//!
//! # Example
//!
//! ```no_run
//! use database::{account, models::AccountRecord, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect and run migrations
//!     let db = Database::connect("sqlite:pairing.db?mode=rwc").await?;
//!     db.migrate().await?;
//!
//!     let count = account::count_accounts(db.pool()).await?;
//!     println!("{count} accounts");
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod chat_session;
pub mod error;
pub mod models;

pub use error::{DatabaseError, Result};
pub use models::{AccountRecord, ChatSessionRecord};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

/// Database connection wrapper.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Default pool size for database connections.
    const DEFAULT_POOL_SIZE: u32 = 20;

    /// How long a writer waits on SQLite's lock before reporting busy.
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connect to a SQLite database.
    ///
    /// The URL should be in the format `sqlite:path/to/db.sqlite?mode=rwc`.
    /// Use `?mode=rwc` to create the database file if it doesn't exist.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example() -> database::Result<()> {
    /// // File database
    /// let db = database::Database::connect("sqlite:data/pairing.db?mode=rwc").await?;
    ///
    /// // In-memory database (for testing, use a single connection)
    /// let db = database::Database::connect_with_pool_size("sqlite::memory:", 1).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_pool_size(url, Self::DEFAULT_POOL_SIZE).await
    }

    /// Connect to a SQLite database with a custom pool size.
    pub async fn connect_with_pool_size(url: &str, pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Self::BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        tracing::info!(
            "Connected to database: {} (pool size: {})",
            url,
            pool_size
        );

        Ok(Self { pool })
    }

    /// Run database migrations.
    ///
    /// This should be called once after connecting to ensure the schema is up to date.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        tracing::info!("Migrations complete");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction on a pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let db = Database::connect_with_pool_size("sqlite::memory:", 1)
            .await
            .unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn record(id: &str) -> AccountRecord {
        AccountRecord {
            id: id.to_string(),
            is_premium: false,
            role: "both".to_string(),
            daily_free_seconds_used: 0,
            daily_reset_date: "2026-03-01".to_string(),
            paid_seconds_available: 0,
            preserved_free_seconds: None,
            preserved_paid_seconds: None,
            partner_change_count: 0,
            credits: 0,
            giftable_credits: 0,
            blocked_user_ids: "[]".to_string(),
            skip_count: 0,
            ad_gate_triggered_at: None,
            created_at: "2026-03-01T00:00:00Z".to_string(),
            updated_at: "2026-03-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_account_crud() {
        let db = test_db().await;

        // Create
        let alice = record("alice");
        account::create_account(db.pool(), &alice).await.unwrap();

        let dup = account::create_account(db.pool(), &alice).await;
        assert!(matches!(dup, Err(DatabaseError::AlreadyExists { .. })));

        // Read
        let fetched = account::get_account(db.pool(), "alice").await.unwrap();
        assert_eq!(fetched, alice);

        // Update
        let updated = AccountRecord {
            credits: 25,
            preserved_free_seconds: Some(200),
            blocked_user_ids: AccountRecord::encode_blocked_ids(&["bob".to_string()]).unwrap(),
            ..alice.clone()
        };
        account::update_account(db.pool(), &updated).await.unwrap();
        let fetched = account::get_account(db.pool(), "alice").await.unwrap();
        assert_eq!(fetched.credits, 25);
        assert_eq!(fetched.preserved_free_seconds, Some(200));
        assert_eq!(fetched.blocked_ids().unwrap(), vec!["bob".to_string()]);

        // List
        account::create_account(db.pool(), &record("bob")).await.unwrap();
        let ids = account::list_account_ids(db.pool()).await.unwrap();
        assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(account::count_accounts(db.pool()).await.unwrap(), 2);

        // Delete
        account::delete_account(db.pool(), "alice").await.unwrap();
        let result = account::get_account(db.pool(), "alice").await;
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_accounts_due_for_reset() {
        let db = test_db().await;

        account::create_account(db.pool(), &record("stale")).await.unwrap();
        let fresh = AccountRecord {
            daily_reset_date: "2026-03-02".to_string(),
            ..record("fresh")
        };
        account::create_account(db.pool(), &fresh).await.unwrap();

        let due = account::list_accounts_due_for_reset(db.pool(), "2026-03-02")
            .await
            .unwrap();
        assert_eq!(due, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn test_update_inside_transaction_rolls_back() {
        let db = test_db().await;
        account::create_account(db.pool(), &record("alice")).await.unwrap();

        {
            let mut tx = db.begin().await.unwrap();
            let mut row = account::get_account(&mut *tx, "alice").await.unwrap();
            row.credits = 99;
            account::update_account(&mut *tx, &row).await.unwrap();
            // Dropped without commit.
        }

        let fetched = account::get_account(db.pool(), "alice").await.unwrap();
        assert_eq!(fetched.credits, 0);
    }

    #[tokio::test]
    async fn test_session_archive_and_recent_partners() {
        let db = test_db().await;

        let session = ChatSessionRecord {
            id: "s1".to_string(),
            participant_a: "alice".to_string(),
            participant_b: "bob".to_string(),
            started_at: "2026-03-01T10:00:00Z".to_string(),
            ended_at: "2026-03-01T10:05:00Z".to_string(),
            close_reason: "user_ended".to_string(),
            elapsed_seconds: 300,
            message_count: 4,
            rating_eligible: true,
        };
        chat_session::archive_session(db.pool(), &session).await.unwrap();
        let old = ChatSessionRecord {
            id: "s0".to_string(),
            participant_a: "carol".to_string(),
            participant_b: "alice".to_string(),
            started_at: "2026-02-27T10:00:00Z".to_string(),
            ..session.clone()
        };
        chat_session::archive_session(db.pool(), &old).await.unwrap();

        let fetched = chat_session::get_session(db.pool(), "s1").await.unwrap();
        assert_eq!(fetched, session);

        let partners = chat_session::recent_partners(db.pool(), "alice", "2026-02-28T10:00:00Z")
            .await
            .unwrap();
        assert_eq!(partners, vec!["bob".to_string()]);

        let partners = chat_session::recent_partners(db.pool(), "bob", "2026-02-28T10:00:00Z")
            .await
            .unwrap();
        assert_eq!(partners, vec!["alice".to_string()]);

        let removed = chat_session::prune_sessions(db.pool(), "2026-02-28T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
