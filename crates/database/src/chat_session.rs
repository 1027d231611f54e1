//! Archive of closed chat sessions.

use sqlx::SqlitePool;

use crate::error::{DatabaseError, Result};
use crate::models::ChatSessionRecord;

/// Archive a closed session. Archiving the same session twice is an error.
pub async fn archive_session(pool: &SqlitePool, session: &ChatSessionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chat_sessions (
            id, participant_a, participant_b, started_at, ended_at,
            close_reason, elapsed_seconds, message_count, rating_eligible
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.participant_a)
    .bind(&session.participant_b)
    .bind(&session.started_at)
    .bind(&session.ended_at)
    .bind(&session.close_reason)
    .bind(session.elapsed_seconds)
    .bind(session.message_count)
    .bind(session.rating_eligible)
    .execute(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_unique_violation() {
                return DatabaseError::AlreadyExists {
                    entity: "ChatSession",
                    id: session.id.clone(),
                };
            }
        }
        DatabaseError::Sqlx(e)
    })?;

    Ok(())
}

/// Get an archived session by ID.
pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<ChatSessionRecord> {
    sqlx::query_as::<_, ChatSessionRecord>(
        r#"
        SELECT id, participant_a, participant_b, started_at, ended_at,
               close_reason, elapsed_seconds, message_count, rating_eligible
        FROM chat_sessions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "ChatSession",
        id: id.to_string(),
    })
}

/// Partners `user_id` chatted with in sessions started at or after `since`.
pub async fn recent_partners(pool: &SqlitePool, user_id: &str, since: &str) -> Result<Vec<String>> {
    let partners = sqlx::query_scalar::<_, String>(
        r#"
        SELECT participant_b FROM chat_sessions
        WHERE participant_a = ? AND started_at >= ?
        UNION
        SELECT participant_a FROM chat_sessions
        WHERE participant_b = ? AND started_at >= ?
        "#,
    )
    .bind(user_id)
    .bind(since)
    .bind(user_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(partners)
}

/// Delete archived sessions that started before `before`. Returns rows removed.
pub async fn prune_sessions(pool: &SqlitePool, before: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM chat_sessions
        WHERE started_at < ?
        "#,
    )
    .bind(before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
