//! Account CRUD operations.
//!
//! Every function is generic over the executor so it can run against the
//! pool directly or inside a caller-owned transaction (`&mut *tx`).

use sqlx::{Executor, Sqlite};

use crate::error::{DatabaseError, Result};
use crate::models::AccountRecord;

const ACCOUNT_COLUMNS: &str = r#"
    id, is_premium, role, daily_free_seconds_used, daily_reset_date,
    paid_seconds_available, preserved_free_seconds, preserved_paid_seconds,
    partner_change_count, credits, giftable_credits, blocked_user_ids,
    skip_count, ad_gate_triggered_at, created_at, updated_at
"#;

/// Create a new account.
pub async fn create_account<'e, E>(executor: E, account: &AccountRecord) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO accounts (
            id, is_premium, role, daily_free_seconds_used, daily_reset_date,
            paid_seconds_available, preserved_free_seconds, preserved_paid_seconds,
            partner_change_count, credits, giftable_credits, blocked_user_ids,
            skip_count, ad_gate_triggered_at, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&account.id)
    .bind(account.is_premium)
    .bind(&account.role)
    .bind(account.daily_free_seconds_used)
    .bind(&account.daily_reset_date)
    .bind(account.paid_seconds_available)
    .bind(account.preserved_free_seconds)
    .bind(account.preserved_paid_seconds)
    .bind(account.partner_change_count)
    .bind(account.credits)
    .bind(account.giftable_credits)
    .bind(&account.blocked_user_ids)
    .bind(account.skip_count)
    .bind(&account.ad_gate_triggered_at)
    .bind(&account.created_at)
    .bind(&account.updated_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_unique_violation() {
                return DatabaseError::AlreadyExists {
                    entity: "Account",
                    id: account.id.clone(),
                };
            }
        }
        DatabaseError::Sqlx(e)
    })?;

    Ok(())
}

/// Get an account by ID, if it exists.
pub async fn find_account<'e, E>(executor: E, id: &str) -> Result<Option<AccountRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
    let record = sqlx::query_as::<_, AccountRecord>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(record)
}

/// Get an account by ID.
pub async fn get_account<'e, E>(executor: E, id: &str) -> Result<AccountRecord>
where
    E: Executor<'e, Database = Sqlite>,
{
    find_account(executor, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "Account",
            id: id.to_string(),
        })
}

/// Overwrite every mutable column of an existing account.
pub async fn update_account<'e, E>(executor: E, account: &AccountRecord) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET is_premium = ?,
            role = ?,
            daily_free_seconds_used = ?,
            daily_reset_date = ?,
            paid_seconds_available = ?,
            preserved_free_seconds = ?,
            preserved_paid_seconds = ?,
            partner_change_count = ?,
            credits = ?,
            giftable_credits = ?,
            blocked_user_ids = ?,
            skip_count = ?,
            ad_gate_triggered_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(account.is_premium)
    .bind(&account.role)
    .bind(account.daily_free_seconds_used)
    .bind(&account.daily_reset_date)
    .bind(account.paid_seconds_available)
    .bind(account.preserved_free_seconds)
    .bind(account.preserved_paid_seconds)
    .bind(account.partner_change_count)
    .bind(account.credits)
    .bind(account.giftable_credits)
    .bind(&account.blocked_user_ids)
    .bind(account.skip_count)
    .bind(&account.ad_gate_triggered_at)
    .bind(&account.updated_at)
    .bind(&account.id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound {
            entity: "Account",
            id: account.id.clone(),
        });
    }

    Ok(())
}

/// Delete an account by ID.
pub async fn delete_account<'e, E>(executor: E, id: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM accounts
        WHERE id = ?
        "#,
    )
    .bind(id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound {
            entity: "Account",
            id: id.to_string(),
        });
    }

    Ok(())
}

/// List all account IDs.
pub async fn list_account_ids<'e, E>(executor: E) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM accounts
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(ids)
}

/// List IDs of accounts whose last daily reset happened before `today`
/// (`YYYY-MM-DD`).
pub async fn list_accounts_due_for_reset<'e, E>(executor: E, today: &str) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM accounts
        WHERE daily_reset_date < ?
        ORDER BY id
        "#,
    )
    .bind(today)
    .fetch_all(executor)
    .await?;

    Ok(ids)
}

/// Count total accounts.
pub async fn count_accounts<'e, E>(executor: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM accounts
        "#,
    )
    .fetch_one(executor)
    .await?;

    Ok(count)
}
