//! Chat session state machine.
//!
//! A session copies each human participant's entitlement into a [`TimeMeter`]
//! when it starts and burns it down from explicit [`ChatSession::tick`] calls.
//! Nothing here reads the clock or the account store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionPolicy;
use crate::error::{EngineError, Result};
use crate::ledger::TimeLedger;
use crate::model::{Account, Allowance, Participant, UserId};

/// Session identifier.
pub type SessionId = Uuid;

/// Lifecycle state. `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Inactive,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserEnded,
    PartnerSkip,
    Block,
    Report,
    TimerExpired,
}

impl CloseReason {
    /// Stable string form used in the archive.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::UserEnded => "user_ended",
            CloseReason::PartnerSkip => "partner_skip",
            CloseReason::Block => "block",
            CloseReason::Report => "report",
            CloseReason::TimerExpired => "timer_expired",
        }
    }
}

/// One participant's time entitlement inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMeter {
    pub user_id: UserId,
    /// Premium at session start; never decremented.
    pub unlimited: bool,
    pub free_seconds_left: u64,
    pub paid_seconds_left: u64,
    /// Free seconds this meter started with.
    pub free_seconds_granted: u64,
    /// Paid seconds this meter started with plus any extension.
    pub paid_seconds_granted: u64,
    /// The low-time warning already fired.
    pub low_time_warned: bool,
}

impl TimeMeter {
    /// Freeze the account's entitlement at `now`.
    pub fn snapshot(ledger: &TimeLedger, account: &Account, now: DateTime<Utc>) -> Self {
        let unlimited = account.is_premium;
        let free = if unlimited {
            0
        } else {
            ledger
                .remaining_free_seconds(account, now)
                .seconds()
                .unwrap_or(0)
        };
        let paid = ledger.remaining_paid_seconds(account);
        Self {
            user_id: account.id.clone(),
            unlimited,
            free_seconds_left: free,
            paid_seconds_left: paid,
            free_seconds_granted: free,
            paid_seconds_granted: paid,
            low_time_warned: false,
        }
    }

    /// Burn `seconds`, free first.
    pub fn consume(&mut self, seconds: u64) {
        if self.unlimited {
            return;
        }
        let from_free = seconds.min(self.free_seconds_left);
        self.free_seconds_left -= from_free;
        let from_paid = (seconds - from_free).min(self.paid_seconds_left);
        self.paid_seconds_left -= from_paid;
    }

    /// Add purchased seconds to a running meter.
    pub fn add_paid(&mut self, seconds: u64) {
        self.paid_seconds_left = self.paid_seconds_left.saturating_add(seconds);
        self.paid_seconds_granted = self.paid_seconds_granted.saturating_add(seconds);
    }

    pub fn remaining(&self) -> Allowance {
        if self.unlimited {
            Allowance::Unlimited
        } else {
            Allowance::Limited(self.free_seconds_left + self.paid_seconds_left)
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn free_used(&self) -> u64 {
        self.free_seconds_granted.saturating_sub(self.free_seconds_left)
    }

    pub fn paid_used(&self) -> u64 {
        self.paid_seconds_granted.saturating_sub(self.paid_seconds_left)
    }
}

/// Something a tick produced that the participants should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickEvent {
    /// `user_id` is down to `seconds_left`.
    LowTimeWarning { user_id: UserId, seconds_left: u64 },
    /// A metered participant ran dry; the session is now inactive.
    TimerExpired,
}

/// A pairing of two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub participants: [Participant; 2],
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    /// One meter per human participant.
    pub meters: Vec<TimeMeter>,
    pub elapsed_seconds: u64,
    pub last_ticked_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub message_count: u32,
    pub rating_eligible: bool,
    pub rating_submitted: bool,
    pub has_received_gift: bool,
}

impl ChatSession {
    /// Start an active session.
    pub fn new(participants: [Participant; 2], meters: Vec<TimeMeter>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participants,
            started_at: now,
            state: SessionState::Active,
            meters,
            elapsed_seconds: 0,
            last_ticked_at: now,
            ended_at: None,
            close_reason: None,
            message_count: 0,
            rating_eligible: false,
            rating_submitted: false,
            has_received_gift: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Human participants.
    pub fn user_ids(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().filter_map(Participant::user_id)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.user_ids().any(|id| id == user_id)
    }

    /// The other side of the session, from `user_id`'s point of view.
    pub fn partner_of(&self, user_id: &str) -> Option<&Participant> {
        match &self.participants {
            [a, b] if a.user_id() == Some(user_id) => Some(b),
            [a, b] if b.user_id() == Some(user_id) => Some(a),
            _ => None,
        }
    }

    pub fn meter(&self, user_id: &str) -> Option<&TimeMeter> {
        self.meters.iter().find(|m| m.user_id == user_id)
    }

    pub fn meter_mut(&mut self, user_id: &str) -> Option<&mut TimeMeter> {
        self.meters.iter_mut().find(|m| m.user_id == user_id)
    }

    /// Fail unless `user_id` takes part in this session.
    pub fn ensure_participant(&self, user_id: &str) -> Result<()> {
        if self.has_participant(user_id) {
            Ok(())
        } else {
            Err(EngineError::NotParticipant {
                session_id: self.id,
                user_id: user_id.to_string(),
            })
        }
    }

    /// Fail unless the session is still active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(EngineError::SessionInactive(self.id))
        }
    }

    /// Advance every meter by `elapsed` seconds, free before paid.
    ///
    /// Each metered participant gets one low-time warning when their balance
    /// first drops to the threshold. If any metered participant runs dry the
    /// session ends with `TimerExpired`.
    pub fn tick(
        &mut self,
        elapsed: u64,
        now: DateTime<Utc>,
        policy: &SessionPolicy,
    ) -> Result<Vec<TickEvent>> {
        self.ensure_active()?;
        self.elapsed_seconds = self.elapsed_seconds.saturating_add(elapsed);
        self.last_ticked_at = now;

        let mut events = Vec::new();
        for meter in self.meters.iter_mut() {
            meter.consume(elapsed);
            if let Allowance::Limited(left) = meter.remaining() {
                if left > 0 && left <= policy.low_time_warning_seconds && !meter.low_time_warned {
                    meter.low_time_warned = true;
                    events.push(TickEvent::LowTimeWarning {
                        user_id: meter.user_id.clone(),
                        seconds_left: left,
                    });
                }
            }
        }

        if self.meters.iter().any(TimeMeter::is_exhausted) {
            self.end(now, CloseReason::TimerExpired, policy);
            events.push(TickEvent::TimerExpired);
        }
        Ok(events)
    }

    /// End the session. Fails if it already ended.
    pub fn close(&mut self, now: DateTime<Utc>, reason: CloseReason, policy: &SessionPolicy) -> Result<()> {
        self.ensure_active()?;
        self.end(now, reason, policy);
        Ok(())
    }

    fn end(&mut self, now: DateTime<Utc>, reason: CloseReason, policy: &SessionPolicy) {
        self.state = SessionState::Inactive;
        self.ended_at = Some(now);
        self.close_reason = Some(reason);
        self.rating_eligible = self.elapsed_seconds >= policy.rating_min_seconds
            || self.message_count >= policy.rating_min_messages;
    }
}
