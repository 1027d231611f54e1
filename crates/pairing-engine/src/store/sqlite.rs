use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use database::{account, AccountRecord, Database};
use tracing::debug;

use super::{check_distinct, AccountStore, TransactFn};
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::model::{Account, Role, SkipAttemptState, UserId};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Durable account store backed by SQLite.
///
/// Each `transact` call runs in one SQLite transaction. SQLite serializes
/// writers; a writer that loses the race surfaces as `TransactionConflict`.
#[derive(Clone)]
pub struct SqliteAccountStore {
    database: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteAccountStore {
    /// Wrap a connected, migrated database.
    pub fn new(database: Database) -> Self {
        Self::with_clock(database, Arc::new(SystemClock))
    }

    /// Wrap a database and stamp `updated_at` from `clock`.
    pub fn with_clock(database: Database, clock: Arc<dyn Clock>) -> Self {
        Self { database, clock }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get(&self, id: &str) -> Result<Account> {
        let record = account::get_account(self.database.pool(), id).await?;
        from_record(record)
    }

    async fn insert(&self, account: Account) -> Result<()> {
        account::create_account(self.database.pool(), &to_record(&account)?).await?;
        Ok(())
    }

    async fn account_ids(&self) -> Result<Vec<UserId>> {
        Ok(account::list_account_ids(self.database.pool()).await?)
    }

    async fn transact(&self, ids: &[UserId], f: TransactFn<'_>) -> Result<Vec<Account>> {
        check_distinct(ids)?;
        let mut tx = self.database.begin().await?;

        let mut working = Vec::with_capacity(ids.len());
        for id in ids {
            let record = account::get_account(&mut *tx, id).await?;
            working.push(from_record(record)?);
        }

        // Dropping `tx` on error rolls back.
        f(&mut working)?;

        let now = self.clock.now();
        for account in working.iter_mut() {
            account.updated_at = now;
            account::update_account(&mut *tx, &to_record(account)?).await?;
        }
        tx.commit().await.map_err(database::DatabaseError::from)?;

        debug!("Committed transaction over {} account(s)", ids.len());
        Ok(working)
    }
}

/// Format a timestamp the way the database crate expects.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    // SQLite's datetime('now') default.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| corrupt(id, format!("bad timestamp {:?}: {}", raw, e)))
}

fn corrupt(id: &str, reason: String) -> EngineError {
    EngineError::CorruptRecord {
        id: id.to_string(),
        reason,
    }
}

fn to_i64(id: &str, field: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| corrupt(id, format!("{} out of range: {}", field, value)))
}

fn to_u64(id: &str, field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| corrupt(id, format!("negative {}: {}", field, value)))
}

fn to_record(account: &Account) -> Result<AccountRecord> {
    let id = account.id.as_str();
    Ok(AccountRecord {
        id: account.id.clone(),
        is_premium: account.is_premium,
        role: account.role.as_str().to_string(),
        daily_free_seconds_used: to_i64(id, "daily_free_seconds_used", account.daily_free_seconds_used)?,
        daily_reset_date: account.daily_reset_date.format(DATE_FORMAT).to_string(),
        paid_seconds_available: to_i64(id, "paid_seconds_available", account.paid_seconds_available)?,
        preserved_free_seconds: account
            .preserved_free_seconds
            .map(|v| to_i64(id, "preserved_free_seconds", v))
            .transpose()?,
        preserved_paid_seconds: account
            .preserved_paid_seconds
            .map(|v| to_i64(id, "preserved_paid_seconds", v))
            .transpose()?,
        partner_change_count: i64::from(account.partner_change_count),
        credits: to_i64(id, "credits", account.credits)?,
        giftable_credits: to_i64(id, "giftable_credits", account.giftable_credits)?,
        blocked_user_ids: AccountRecord::encode_blocked_ids(&account.blocked_user_ids)?,
        skip_count: i64::from(account.skip_state.skip_count),
        ad_gate_triggered_at: account.skip_state.ad_gate_triggered_at.map(format_timestamp),
        created_at: format_timestamp(account.created_at),
        updated_at: format_timestamp(account.updated_at),
    })
}

fn from_record(record: AccountRecord) -> Result<Account> {
    let id = record.id.as_str();
    let role = Role::parse(&record.role)
        .ok_or_else(|| corrupt(id, format!("unknown role {:?}", record.role)))?;
    let daily_reset_date = NaiveDate::parse_from_str(&record.daily_reset_date, DATE_FORMAT)
        .map_err(|e| corrupt(id, format!("bad reset date: {}", e)))?;
    let blocked_user_ids = record.blocked_ids()?.into_iter().collect();
    let skip_count = u8::try_from(record.skip_count)
        .map_err(|_| corrupt(id, format!("skip count out of range: {}", record.skip_count)))?;
    let partner_change_count = u32::try_from(record.partner_change_count).map_err(|_| {
        corrupt(
            id,
            format!("partner change count out of range: {}", record.partner_change_count),
        )
    })?;

    Ok(Account {
        id: record.id.clone(),
        is_premium: record.is_premium,
        role,
        daily_free_seconds_used: to_u64(id, "daily_free_seconds_used", record.daily_free_seconds_used)?,
        daily_reset_date,
        paid_seconds_available: to_u64(id, "paid_seconds_available", record.paid_seconds_available)?,
        preserved_free_seconds: record
            .preserved_free_seconds
            .map(|v| to_u64(id, "preserved_free_seconds", v))
            .transpose()?,
        preserved_paid_seconds: record
            .preserved_paid_seconds
            .map(|v| to_u64(id, "preserved_paid_seconds", v))
            .transpose()?,
        partner_change_count,
        credits: to_u64(id, "credits", record.credits)?,
        giftable_credits: to_u64(id, "giftable_credits", record.giftable_credits)?,
        blocked_user_ids,
        skip_state: SkipAttemptState {
            skip_count,
            ad_gate_triggered_at: record
                .ad_gate_triggered_at
                .as_deref()
                .map(|raw| parse_timestamp(id, raw))
                .transpose()?,
        },
        created_at: parse_timestamp(id, &record.created_at)?,
        updated_at: parse_timestamp(id, &record.updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn test_store() -> SqliteAccountStore {
        let db = Database::connect_with_pool_size("sqlite::memory:", 1)
            .await
            .unwrap();
        db.migrate().await.unwrap();
        SqliteAccountStore::new(db)
    }

    fn sample() -> Account {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let mut account = Account::new("alice", now).with_role(Role::Listen);
        account.daily_free_seconds_used = 300;
        account.paid_seconds_available = 720;
        account.preserved_free_seconds = Some(200);
        account.credits = 25;
        account.blocked_user_ids.insert("mallory".to_string());
        account.skip_state = SkipAttemptState {
            skip_count: 5,
            ad_gate_triggered_at: Some(now),
        };
        account
    }

    #[test]
    fn test_record_conversion_preserves_fields() {
        let account = sample();
        let back = from_record(to_record(&account).unwrap()).unwrap();
        assert_eq!(back, account);
    }

    #[test]
    fn test_negative_balance_is_corrupt() {
        let mut record = to_record(&sample()).unwrap();
        record.credits = -1;
        assert!(matches!(
            from_record(record),
            Err(EngineError::CorruptRecord { .. })
        ));
    }

    #[tokio::test]
    async fn test_transact_persists_and_rolls_back() {
        let store = test_store().await;
        store.insert(sample()).await.unwrap();

        let ids = vec!["alice".to_string()];
        let failed = store
            .transact(
                &ids,
                Box::new(|accounts: &mut [Account]| -> Result<()> {
                    accounts[0].credits = 0;
                    Err(EngineError::NotPremium)
                }),
            )
            .await;
        assert!(matches!(failed, Err(EngineError::NotPremium)));
        assert_eq!(store.get("alice").await.unwrap().credits, 25);

        store
            .transact(
                &ids,
                Box::new(|accounts: &mut [Account]| -> Result<()> {
                    accounts[0].credits -= 5;
                    accounts[0].blocked_user_ids.insert("trent".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let stored = store.get("alice").await.unwrap();
        assert_eq!(stored.credits, 20);
        assert!(stored.has_blocked("trent"));
        assert!(stored.has_blocked("mallory"));
    }

    #[tokio::test]
    async fn test_missing_account() {
        let store = test_store().await;
        let result = store.get("ghost").await;
        assert!(matches!(result, Err(EngineError::AccountNotFound(id)) if id == "ghost"));

        store.insert(sample()).await.unwrap();
        let again = store.insert(sample()).await;
        assert!(matches!(again, Err(EngineError::AccountExists(_))));
    }
}
