//! Account data model.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Add;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier issued by the identity provider.
pub type UserId = String;

/// What a user wants out of a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Wants to talk.
    Talk,
    /// Wants to listen.
    Listen,
    /// Either.
    #[default]
    Both,
}

impl Role {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Talk => "talk",
            Role::Listen => "listen",
            Role::Both => "both",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "talk" => Some(Role::Talk),
            "listen" => Some(Role::Listen),
            "both" => Some(Role::Both),
            _ => None,
        }
    }

    /// Two talkers (or two listeners) are never paired; `Both` fits anyone.
    pub fn is_compatible_with(&self, other: Role) -> bool {
        !matches!(
            (self, other),
            (Role::Talk, Role::Talk) | (Role::Listen, Role::Listen)
        )
    }
}

/// A time balance that is either finite or unlimited (premium).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowance {
    /// A finite number of seconds.
    Limited(u64),
    /// Premium: no metering.
    Unlimited,
}

impl Allowance {
    /// `true` when nothing is left.
    pub fn is_zero(&self) -> bool {
        matches!(self, Allowance::Limited(0))
    }

    /// Finite seconds, or `None` when unlimited.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            Allowance::Limited(seconds) => Some(*seconds),
            Allowance::Unlimited => None,
        }
    }
}

impl Add for Allowance {
    type Output = Allowance;

    fn add(self, rhs: Allowance) -> Allowance {
        match (self, rhs) {
            (Allowance::Limited(a), Allowance::Limited(b)) => Allowance::Limited(a.saturating_add(b)),
            _ => Allowance::Unlimited,
        }
    }
}

impl fmt::Display for Allowance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allowance::Limited(seconds) => write!(f, "{}s", seconds),
            Allowance::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Skip gate state for one matching cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipAttemptState {
    /// Skips since the last reset.
    pub skip_count: u8,
    /// When the ad gate triggered, while it is pending.
    pub ad_gate_triggered_at: Option<DateTime<Utc>>,
}

impl SkipAttemptState {
    /// Whether the ad gate is currently blocking further skips.
    pub fn requires_ad(&self, limit: u8) -> bool {
        self.skip_count >= limit
    }
}

/// One user's durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub is_premium: bool,
    pub role: Role,
    /// Free seconds consumed on `daily_reset_date`.
    pub daily_free_seconds_used: u64,
    /// UTC day of the last daily reset.
    pub daily_reset_date: NaiveDate,
    /// Paid seconds; never expire.
    pub paid_seconds_available: u64,
    /// Leftover free time from an early close. Wins over recomputation.
    pub preserved_free_seconds: Option<u64>,
    /// Leftover paid time from an early close. Wins over `paid_seconds_available`.
    pub preserved_paid_seconds: Option<u64>,
    /// Partner skips today.
    pub partner_change_count: u32,
    pub credits: u64,
    pub giftable_credits: u64,
    pub blocked_user_ids: BTreeSet<UserId>,
    /// Persisted skip gate (non-premium only).
    pub skip_state: SkipAttemptState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh non-premium account with a full daily allowance.
    pub fn new(id: impl Into<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            is_premium: false,
            role: Role::Both,
            daily_free_seconds_used: 0,
            daily_reset_date: now.date_naive(),
            paid_seconds_available: 0,
            preserved_free_seconds: None,
            preserved_paid_seconds: None,
            partner_change_count: 0,
            credits: 0,
            giftable_credits: 0,
            blocked_user_ids: BTreeSet::new(),
            skip_state: SkipAttemptState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the role tag.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Builder: set premium status.
    pub fn with_premium(mut self, is_premium: bool) -> Self {
        self.is_premium = is_premium;
        self
    }

    /// Whether `other` is on this account's block list.
    pub fn has_blocked(&self, other: &str) -> bool {
        self.blocked_user_ids.contains(other)
    }
}

/// One side of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Participant {
    /// A human user.
    User(UserId),
    /// The AI fallback partner.
    Ai,
}

impl Participant {
    /// The user id, if this is a human.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Participant::User(id) => Some(id),
            Participant::Ai => None,
        }
    }

    /// Stable string form (`ai` for the AI partner).
    pub fn as_str(&self) -> &str {
        match self {
            Participant::User(id) => id,
            Participant::Ai => "ai",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_role_compatibility() {
        assert!(Role::Talk.is_compatible_with(Role::Listen));
        assert!(Role::Listen.is_compatible_with(Role::Talk));
        assert!(Role::Both.is_compatible_with(Role::Talk));
        assert!(Role::Listen.is_compatible_with(Role::Both));
        assert!(!Role::Talk.is_compatible_with(Role::Talk));
        assert!(!Role::Listen.is_compatible_with(Role::Listen));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Talk"), Some(Role::Talk));
        assert_eq!(Role::parse(" listen "), Some(Role::Listen));
        assert_eq!(Role::parse(Role::Both.as_str()), Some(Role::Both));
        assert_eq!(Role::parse("shout"), None);
    }

    #[test]
    fn test_allowance_addition() {
        assert_eq!(Allowance::Limited(10) + Allowance::Limited(5), Allowance::Limited(15));
        assert_eq!(Allowance::Limited(10) + Allowance::Unlimited, Allowance::Unlimited);
        assert!(Allowance::Limited(0).is_zero());
        assert!(!Allowance::Unlimited.is_zero());
        assert_eq!(Allowance::Unlimited.seconds(), None);
    }

    #[test]
    fn test_new_account_starts_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let account = Account::new("alice", now);
        assert_eq!(account.daily_reset_date, now.date_naive());
        assert_eq!(account.role, Role::Both);
        assert!(!account.is_premium);
        assert!(account.preserved_free_seconds.is_none());
    }

    #[test]
    fn test_participant_strings() {
        assert_eq!(Participant::User("bob".into()).as_str(), "bob");
        assert_eq!(Participant::Ai.as_str(), "ai");
        assert_eq!(Participant::Ai.user_id(), None);
    }
}
