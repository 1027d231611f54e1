//! Waiting tickets and atomic pairing.
//!
//! Tickets are kept in join order. Matching is split into a cheap probe
//! ([`MatchmakingQueue::attempt_match`]) and a compare-and-set
//! ([`MatchmakingQueue::pair`]) that re-validates both tickets under the
//! queue lock. Two searchers that probe the same candidate both call `pair`;
//! exactly one wins and the other gets `TicketRaceLost` and re-scans.
//!
//! The queue also tracks which users are engaged in an active session, so a
//! ticket can never be paired with someone who is already chatting.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{Role, UserId};

/// Ticket identifier. A fresh id per enqueue keeps a stale probe from
/// pairing a ticket that was cancelled and re-created in between.
pub type TicketId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Waiting,
    Matched,
    Cancelled,
}

/// One searching user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingTicket {
    pub id: TicketId,
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    /// Users this ticket must not be paired with (always includes self).
    pub exclude_set: HashSet<UserId>,
    pub status: TicketStatus,
    pub matched_with: Option<UserId>,
}

impl MatchmakingTicket {
    /// A waiting ticket. `user_id` is added to the exclusion set.
    pub fn new(
        user_id: impl Into<UserId>,
        role: Role,
        mut exclude_set: HashSet<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        exclude_set.insert(user_id.clone());
        Self {
            id: Uuid::new_v4(),
            user_id,
            role,
            joined_at: now,
            exclude_set,
            status: TicketStatus::Waiting,
            matched_with: None,
        }
    }

    /// Whether these two tickets may be paired, looking only at the tickets.
    pub fn accepts(&self, other: &MatchmakingTicket) -> bool {
        self.user_id != other.user_id
            && !self.exclude_set.contains(&other.user_id)
            && !other.exclude_set.contains(&self.user_id)
            && self.role.is_compatible_with(other.role)
    }
}

/// Two tickets committed to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// The ticket whose owner ran `pair`.
    pub first: MatchmakingTicket,
    pub second: MatchmakingTicket,
    pub matched_at: DateTime<Utc>,
}

/// What `cancel` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The waiting ticket was removed.
    Cancelled,
    /// The ticket was already paired; the match stands.
    AlreadyMatched(UserId),
    /// No ticket for the user.
    NotQueued,
}

#[derive(Debug, Default)]
struct QueueState {
    tickets: IndexMap<UserId, MatchmakingTicket>,
    engaged: HashSet<UserId>,
}

impl QueueState {
    fn is_waiting(&self, ticket: &MatchmakingTicket) -> bool {
        self.tickets
            .get(&ticket.user_id)
            .is_some_and(|current| current.id == ticket.id && current.status == TicketStatus::Waiting)
            && !self.engaged.contains(&ticket.user_id)
    }
}

/// In-memory matchmaking queue.
#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    state: Mutex<QueueState>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ticket. Returns the existing ticket id if the user is already
    /// queued; fails if the user is in an active session.
    pub async fn enqueue(&self, ticket: MatchmakingTicket) -> Result<TicketId> {
        let mut state = self.state.lock().await;
        if state.engaged.contains(&ticket.user_id) {
            return Err(EngineError::ActiveSessionExists);
        }
        if let Some(existing) = state.tickets.get(&ticket.user_id) {
            debug!("{} already queued with ticket {}", ticket.user_id, existing.id);
            return Ok(existing.id);
        }

        let id = ticket.id;
        debug!("Enqueued {} ({:?})", ticket.user_id, ticket.role);
        state.tickets.insert(ticket.user_id.clone(), ticket);
        Ok(id)
    }

    /// Current ticket for `user_id`.
    pub async fn ticket(&self, user_id: &str) -> Option<MatchmakingTicket> {
        self.state.lock().await.tickets.get(user_id).cloned()
    }

    /// Oldest waiting ticket that `ticket` may be paired with.
    pub async fn attempt_match(&self, ticket: &MatchmakingTicket) -> Option<MatchmakingTicket> {
        let state = self.state.lock().await;
        state
            .tickets
            .values()
            .filter(|candidate| candidate.status == TicketStatus::Waiting)
            .filter(|candidate| !state.engaged.contains(&candidate.user_id))
            .find(|candidate| ticket.accepts(candidate))
            .cloned()
    }

    /// Commit two tickets to each other.
    ///
    /// Both tickets must still be the caller's snapshot (same ids), still
    /// waiting, and neither user engaged. Otherwise nothing changes and the
    /// caller gets `TicketRaceLost`.
    pub async fn pair(
        &self,
        a: &MatchmakingTicket,
        b: &MatchmakingTicket,
        now: DateTime<Utc>,
    ) -> Result<Pairing> {
        let mut state = self.state.lock().await;
        if a.user_id == b.user_id || !state.is_waiting(a) || !state.is_waiting(b) {
            debug!("Pair {} <-> {} lost the race", a.user_id, b.user_id);
            return Err(EngineError::TicketRaceLost);
        }

        let mut committed = Vec::with_capacity(2);
        for (me, partner) in [(a, b), (b, a)] {
            if let Some(ticket) = state.tickets.get_mut(&me.user_id) {
                ticket.status = TicketStatus::Matched;
                ticket.matched_with = Some(partner.user_id.clone());
                committed.push(ticket.clone());
            }
        }
        state.engaged.insert(a.user_id.clone());
        state.engaged.insert(b.user_id.clone());

        let second = committed.pop().ok_or(EngineError::TicketRaceLost)?;
        let first = committed.pop().ok_or(EngineError::TicketRaceLost)?;
        info!("Paired {} with {}", first.user_id, second.user_id);
        Ok(Pairing {
            first,
            second,
            matched_at: now,
        })
    }

    /// Probe for `user_id` and pair with the first candidate.
    ///
    /// `Ok(None)` means nothing to do this round (no candidate, or the
    /// user's ticket is no longer waiting).
    pub async fn try_match(&self, user_id: &str, now: DateTime<Utc>) -> Result<Option<Pairing>> {
        let own = match self.ticket(user_id).await {
            Some(ticket) if ticket.status == TicketStatus::Waiting => ticket,
            _ => return Ok(None),
        };
        match self.attempt_match(&own).await {
            Some(candidate) => self.pair(&own, &candidate, now).await.map(Some),
            None => Ok(None),
        }
    }

    /// Withdraw a waiting ticket. Safe at any time; a ticket that was
    /// already paired stays paired.
    pub async fn cancel(&self, user_id: &str) -> CancelOutcome {
        let mut state = self.state.lock().await;
        Self::cancel_locked(&mut state, user_id)
    }

    /// Withdraw a waiting ticket and mark the user engaged in one step, for
    /// handing the user to the AI partner.
    pub async fn withdraw_for_fallback(&self, user_id: &str) -> CancelOutcome {
        let mut state = self.state.lock().await;
        let outcome = Self::cancel_locked(&mut state, user_id);
        if outcome == CancelOutcome::Cancelled {
            state.engaged.insert(user_id.to_string());
        }
        outcome
    }

    fn cancel_locked(state: &mut QueueState, user_id: &str) -> CancelOutcome {
        match state.tickets.get(user_id).map(|t| (t.status, t.matched_with.clone())) {
            None => CancelOutcome::NotQueued,
            Some((TicketStatus::Matched, Some(partner))) => CancelOutcome::AlreadyMatched(partner),
            Some(_) => {
                if let Some(mut ticket) = state.tickets.shift_remove(user_id) {
                    ticket.status = TicketStatus::Cancelled;
                    debug!("Cancelled ticket {} for {}", ticket.id, user_id);
                }
                CancelOutcome::Cancelled
            }
        }
    }

    /// The session for `pairing` exists; drop both tickets.
    ///
    /// Returns `false` if the pairing was reclaimed in the meantime. Both
    /// users are engaged again either way, since their session now exists.
    pub async fn complete(&self, pairing: &Pairing) -> bool {
        let mut state = self.state.lock().await;
        let mut owned = true;
        for ticket in [&pairing.first, &pairing.second] {
            if state.tickets.get(&ticket.user_id).is_some_and(|t| t.id == ticket.id) {
                state.tickets.shift_remove(&ticket.user_id);
            } else {
                owned = false;
            }
            state.engaged.insert(ticket.user_id.clone());
        }
        owned
    }

    /// Break up a match whose session never opened.
    ///
    /// Drops `user_id`'s matched ticket and the partner's ticket if it is
    /// matched back, and releases both users. Returns the partner, or `None`
    /// if `user_id` holds no matched ticket.
    pub async fn reclaim(&self, user_id: &str) -> Option<UserId> {
        let mut state = self.state.lock().await;
        let partner = match state.tickets.get(user_id) {
            Some(ticket) if ticket.status == TicketStatus::Matched => ticket.matched_with.clone()?,
            _ => return None,
        };

        state.tickets.shift_remove(user_id);
        let matched_back = state.tickets.get(&partner).is_some_and(|t| {
            t.status == TicketStatus::Matched && t.matched_with.as_deref() == Some(user_id)
        });
        if matched_back {
            state.tickets.shift_remove(&partner);
        }
        state.engaged.remove(user_id);
        state.engaged.remove(&partner);

        warn!("Reclaimed stale match {} <-> {}", user_id, partner);
        Some(partner)
    }

    /// The session for `pairing` could not be started; put both tickets
    /// back to waiting in their original positions.
    pub async fn abandon(&self, pairing: &Pairing) {
        let mut state = self.state.lock().await;
        for ticket in [&pairing.first, &pairing.second] {
            if let Some(current) = state.tickets.get_mut(&ticket.user_id) {
                if current.id == ticket.id {
                    current.status = TicketStatus::Waiting;
                    current.matched_with = None;
                }
            }
            state.engaged.remove(&ticket.user_id);
        }
        info!(
            "Abandoned pairing {} <-> {}",
            pairing.first.user_id, pairing.second.user_id
        );
    }

    /// Mark `user_id` as being in an active session.
    pub async fn engage(&self, user_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.engaged.insert(user_id.to_string()) {
            return Err(EngineError::ActiveSessionExists);
        }
        Ok(())
    }

    /// The user's session ended.
    pub async fn release(&self, user_id: &str) {
        self.state.lock().await.engaged.remove(user_id);
    }

    pub async fn is_engaged(&self, user_id: &str) -> bool {
        self.state.lock().await.engaged.contains(user_id)
    }

    /// Tickets still waiting.
    pub async fn waiting_count(&self) -> usize {
        self.state
            .lock()
            .await
            .tickets
            .values()
            .filter(|t| t.status == TicketStatus::Waiting)
            .count()
    }

    /// Ticket counts by status.
    pub async fn stats(&self) -> HashMap<TicketStatus, usize> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for ticket in state.tickets.values() {
            *counts.entry(ticket.status).or_insert(0) += 1;
        }
        counts
    }
}
