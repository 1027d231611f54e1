//! Live session storage.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use database::{chat_session, ChatSessionRecord, Database};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::model::UserId;
use crate::session::{ChatSession, SessionId};
use crate::store::format_timestamp;

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, ChatSession>,
    active_by_user: HashMap<UserId, SessionId>,
}

/// Sessions by id, with an index of each user's active session.
///
/// Optionally backed by SQLite: closed sessions are archived there so that
/// partner recency survives restarts.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    database: Option<Database>,
}

impl SessionRegistry {
    /// Create an empty, memory-only registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that archives closed sessions to `database`.
    pub fn with_database(database: Database) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            database: Some(database),
        }
    }

    /// Register a newly started session.
    pub async fn insert(&self, session: ChatSession) -> Result<()> {
        let mut state = self.state.write().await;
        if session.user_ids().any(|id| state.active_by_user.contains_key(id)) {
            return Err(EngineError::ActiveSessionExists);
        }
        if session.is_active() {
            for user_id in session.user_ids() {
                state.active_by_user.insert(user_id.to_string(), session.id);
            }
        }
        state.sessions.insert(session.id, session);
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Result<ChatSession> {
        self.state
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// The user's active session, if any.
    pub async fn active_for(&self, user_id: &str) -> Option<ChatSession> {
        let state = self.state.read().await;
        state
            .active_by_user
            .get(user_id)
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    /// Snapshot of all active sessions.
    pub async fn active_sessions(&self) -> Vec<ChatSession> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Apply `f` to a session under the write lock.
    ///
    /// `f` works on a copy; the copy replaces the stored session only if `f`
    /// succeeds. A session that ends inside `f` leaves the active index.
    pub async fn modify<T, F>(&self, id: SessionId, f: F) -> Result<(T, ChatSession)>
    where
        F: FnOnce(&mut ChatSession) -> Result<T>,
    {
        let mut state = self.state.write().await;
        let mut session = state
            .sessions
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))?;

        let value = f(&mut session)?;

        if !session.is_active() {
            for user_id in session.user_ids() {
                if state.active_by_user.get(user_id) == Some(&id) {
                    state.active_by_user.remove(user_id);
                }
            }
        }
        state.sessions.insert(id, session.clone());
        Ok((value, session))
    }

    /// Persist a closed session. Failures are logged, not returned.
    pub async fn archive(&self, session: &ChatSession) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) = chat_session::archive_session(database.pool(), &to_record(session)).await {
            warn!("Failed to archive session {}: {}", session.id, e);
        }
    }

    /// Users `user_id` was paired with in sessions started within `window`
    /// before `now`.
    pub async fn recent_partners(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> HashSet<UserId> {
        let since = window_start(now, window);
        let mut partners: HashSet<UserId> = {
            let state = self.state.read().await;
            state
                .sessions
                .values()
                .filter(|s| s.started_at >= since)
                .filter_map(|s| s.partner_of(user_id))
                .filter_map(|p| p.user_id().map(str::to_string))
                .collect()
        };

        if let Some(database) = &self.database {
            match chat_session::recent_partners(database.pool(), user_id, &format_timestamp(since)).await {
                Ok(archived) => partners.extend(archived),
                Err(e) => warn!("Failed to load recent partners for {}: {}", user_id, e),
            }
        }
        partners
    }

    /// Drop ended sessions that finished before `before`. Returns how many
    /// were removed.
    pub async fn prune(&self, before: DateTime<Utc>) -> usize {
        let mut state = self.state.write().await;
        let count = state.sessions.len();
        state
            .sessions
            .retain(|_, s| s.is_active() || s.ended_at.is_some_and(|ended| ended >= before));
        let removed = count - state.sessions.len();
        if removed > 0 {
            debug!("Pruned {} ended session(s)", removed);
        }
        removed
    }
}

/// Start of the `window` ending at `now`, clamped to the earliest time.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn to_record(session: &ChatSession) -> ChatSessionRecord {
    let [a, b] = &session.participants;
    ChatSessionRecord {
        id: session.id.to_string(),
        participant_a: a.as_str().to_string(),
        participant_b: b.as_str().to_string(),
        started_at: format_timestamp(session.started_at),
        ended_at: format_timestamp(session.ended_at.unwrap_or(session.last_ticked_at)),
        close_reason: session
            .close_reason
            .map(|r| r.as_str())
            .unwrap_or("unknown")
            .to_string(),
        elapsed_seconds: i64::try_from(session.elapsed_seconds).unwrap_or(i64::MAX),
        message_count: i64::from(session.message_count),
        rating_eligible: session.rating_eligible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicy;
    use crate::model::Participant;
    use crate::session::CloseReason;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn session(a: &str, b: &str, started: DateTime<Utc>) -> ChatSession {
        ChatSession::new(
            [Participant::User(a.to_string()), Participant::User(b.to_string())],
            vec![],
            started,
        )
    }

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn test_one_active_session_per_user() {
        let registry = SessionRegistry::new();
        registry.insert(session("alice", "bob", at(1, 10))).await.unwrap();

        let clash = registry.insert(session("carol", "bob", at(1, 10))).await;
        assert!(matches!(clash, Err(EngineError::ActiveSessionExists)));
        assert!(registry.active_for("carol").await.is_none());
    }

    #[tokio::test]
    async fn test_modify_only_commits_on_success() {
        let registry = SessionRegistry::new();
        let s = session("alice", "bob", at(1, 10));
        let id = s.id;
        registry.insert(s).await.unwrap();

        let failed = registry
            .modify(id, |s| {
                s.message_count = 99;
                Err::<(), _>(EngineError::NoActiveSession)
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(registry.get(id).await.unwrap().message_count, 0);

        let policy = SessionPolicy::default();
        registry
            .modify(id, |s| s.close(at(1, 11), CloseReason::UserEnded, &policy))
            .await
            .unwrap();
        assert!(registry.active_for("alice").await.is_none());
        assert!(!registry.get(id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_recent_partners_window() {
        let registry = SessionRegistry::new();
        let policy = SessionPolicy::default();
        for (partner, started) in [("old", at(1, 8)), ("bob", at(2, 9))] {
            let s = session("alice", partner, started);
            let id = s.id;
            registry.insert(s).await.unwrap();
            registry
                .modify(id, |s| s.close(started, CloseReason::UserEnded, &policy))
                .await
                .unwrap();
        }

        let partners = registry.recent_partners("alice", at(2, 10), DAY).await;
        assert_eq!(partners, HashSet::from(["bob".to_string()]));

        let partners = registry.recent_partners("bob", at(2, 10), DAY).await;
        assert_eq!(partners, HashSet::from(["alice".to_string()]));
    }

    #[tokio::test]
    async fn test_archive_feeds_recent_partners() {
        let db = Database::connect_with_pool_size("sqlite::memory:", 1)
            .await
            .unwrap();
        db.migrate().await.unwrap();

        let policy = SessionPolicy::default();
        let first = SessionRegistry::with_database(db.clone());
        let s = session("alice", "bob", at(2, 9));
        let id = s.id;
        first.insert(s).await.unwrap();
        let (_, closed) = first
            .modify(id, |s| s.close(at(2, 9), CloseReason::UserEnded, &policy))
            .await
            .unwrap();
        first.archive(&closed).await;

        // A fresh registry over the same database still knows the pairing.
        let second = SessionRegistry::with_database(db);
        let partners = second.recent_partners("alice", at(2, 10), DAY).await;
        assert!(partners.contains("bob"));
    }

    #[tokio::test]
    async fn test_prune_keeps_active_sessions() {
        let registry = SessionRegistry::new();
        let policy = SessionPolicy::default();
        let ended = session("alice", "bob", at(1, 8));
        let ended_id = ended.id;
        registry.insert(ended).await.unwrap();
        registry
            .modify(ended_id, |s| s.close(at(1, 9), CloseReason::UserEnded, &policy))
            .await
            .unwrap();
        registry.insert(session("carol", "dave", at(1, 8))).await.unwrap();

        assert_eq!(registry.prune(at(2, 0)).await, 1);
        assert_eq!(registry.active_sessions().await.len(), 1);
        assert!(matches!(
            registry.get(ended_id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
