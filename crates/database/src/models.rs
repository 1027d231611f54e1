//! Database models.
//!
//! Timestamps are stored as RFC 3339 strings in UTC with second precision
//! (`2026-03-01T12:00:00Z`) so that lexical comparison matches time order.
//! Dates are stored as `YYYY-MM-DD`.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored account row: time ledger, wallet, and skip gate state for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AccountRecord {
    /// Opaque user identifier from the identity provider.
    pub id: String,
    /// Whether the user currently holds an unlimited subscription.
    pub is_premium: bool,
    /// Role tag: `talk`, `listen` or `both`.
    pub role: String,
    /// Free seconds consumed since `daily_reset_date`.
    pub daily_free_seconds_used: i64,
    /// UTC calendar day of the last daily reset.
    pub daily_reset_date: String,
    /// Purchased seconds that never expire.
    pub paid_seconds_available: i64,
    /// Leftover free seconds snapshotted at an early session close.
    pub preserved_free_seconds: Option<i64>,
    /// Leftover paid seconds snapshotted at an early session close.
    pub preserved_paid_seconds: Option<i64>,
    /// Number of partner skips today.
    pub partner_change_count: i64,
    /// Spendable credits.
    pub credits: i64,
    /// Credits that may only be gifted or converted to rewards.
    pub giftable_credits: i64,
    /// JSON array of blocked user ids.
    pub blocked_user_ids: String,
    /// Skips in the current matching cycle.
    pub skip_count: i64,
    /// When the ad gate last triggered, if it is pending.
    pub ad_gate_triggered_at: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl AccountRecord {
    /// Decode the blocked user list.
    pub fn blocked_ids(&self) -> crate::Result<Vec<String>> {
        Ok(serde_json::from_str(&self.blocked_user_ids)?)
    }

    /// Encode a blocked user list into the JSON column.
    pub fn encode_blocked_ids<'a, I>(ids: I) -> crate::Result<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let ids: Vec<&String> = ids.into_iter().collect();
        Ok(serde_json::to_string(&ids)?)
    }
}

/// An archived (closed) chat session between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChatSessionRecord {
    /// Session UUID.
    pub id: String,
    /// First participant (user id, or `ai`).
    pub participant_a: String,
    /// Second participant (user id, or `ai`).
    pub participant_b: String,
    /// When the session started.
    pub started_at: String,
    /// When the session became inactive.
    pub ended_at: String,
    /// Why the session ended (`user_ended`, `partner_skip`, ...).
    pub close_reason: String,
    /// Seconds of chat time metered.
    pub elapsed_seconds: i64,
    /// Messages exchanged.
    pub message_count: i64,
    /// Whether the participants may rate each other.
    pub rating_eligible: bool,
}
