//! Search-to-chat orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use database::Database;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::TimeLedger;
use crate::model::{Account, Participant, UserId};
use crate::notify::{deliver, Notification, NotificationSink};
use crate::queue::{CancelOutcome, MatchmakingQueue, MatchmakingTicket, Pairing, TicketStatus};
use crate::registry::{window_start, SessionRegistry};
use crate::retry::transact_with_retry;
use crate::session::{ChatSession, CloseReason, SessionId, TickEvent, TimeMeter};
use crate::skip_gate::{SkipGate, SkipOutcome};
use crate::store::AccountStore;
use crate::wallet::CreditWallet;

/// Owns the chat session lifecycle.
///
/// The manager:
/// - Runs the "find partner" poll loop against the matchmaking queue
/// - Starts sessions by snapshotting both ledgers in one transaction
/// - Applies ticks, closes, skips, blocks and reports
/// - Settles used time back into the accounts when a session ends
/// - Sends timer, low-time, gift and partner-left notifications
pub struct SessionManager {
    store: Arc<dyn AccountStore>,
    queue: Arc<MatchmakingQueue>,
    registry: SessionRegistry,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    ledger: TimeLedger,
    skip_gate: SkipGate,
    wallet: CreditWallet,
    config: EngineConfig,
}

impl SessionManager {
    /// Create a session manager with the given collaborators.
    pub fn new(
        store: Arc<dyn AccountStore>,
        queue: Arc<MatchmakingQueue>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        let wallet = CreditWallet::new(store.clone(), clock.clone(), notifier.clone(), &config);
        Self {
            store,
            queue,
            registry: SessionRegistry::new(),
            clock,
            notifier,
            ledger: TimeLedger::new(config.daily_free_seconds),
            skip_gate: SkipGate::from_config(&config),
            wallet,
            config,
        }
    }

    /// Archive closed sessions to `database` and read partner history
    /// from it.
    pub fn with_database(mut self, database: Database) -> Self {
        self.registry = SessionRegistry::with_database(database);
        self
    }

    pub fn store(&self) -> &dyn AccountStore {
        self.store.as_ref()
    }

    pub fn queue(&self) -> &MatchmakingQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &TimeLedger {
        &self.ledger
    }

    pub fn skip_gate(&self) -> &SkipGate {
        &self.skip_gate
    }

    pub fn wallet(&self) -> &CreditWallet {
        &self.wallet
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Find a partner for `user_id` and start a session with them.
    ///
    /// Polls the queue until matched or the search timeout passes. A user
    /// that loses a pairing race simply re-scans. On timeout the ticket is
    /// cancelled; if the cancel loses to a concurrent match, the match wins
    /// unless its session is still missing after `match_grace`.
    pub async fn find_partner(&self, user_id: &str) -> Result<ChatSession> {
        let now = self.clock.now();
        let account = self.store.get(user_id).await?;

        if self.registry.active_for(user_id).await.is_some() {
            return Err(EngineError::ActiveSessionExists);
        }
        if !account.is_premium && self.ledger.total_available(&account, now).is_zero() {
            return Err(EngineError::InsufficientTime);
        }
        if self.skip_gate.is_gated(&account) {
            return Err(EngineError::SkipLimitReached);
        }

        let exclude_set = self.exclusion_set(&account, now).await;
        let ticket = MatchmakingTicket::new(user_id, account.role, exclude_set, now);
        self.queue.enqueue(ticket).await?;
        info!("{} is searching ({})", user_id, account.role.as_str());

        let result = self.search(user_id).await;
        if result.is_err() {
            self.queue.cancel(user_id).await;
        }
        result
    }

    /// Withdraw a running search. A search that already matched is not
    /// affected.
    pub async fn cancel_search(&self, user_id: &str) -> CancelOutcome {
        self.queue.cancel(user_id).await
    }

    /// `blocked ∪ recent partners ∪ self`.
    async fn exclusion_set(&self, account: &Account, now: DateTime<Utc>) -> HashSet<UserId> {
        let mut exclude: HashSet<UserId> = account.blocked_user_ids.iter().cloned().collect();
        exclude.extend(
            self.registry
                .recent_partners(&account.id, now, self.config.recent_partner_window)
                .await,
        );
        exclude.insert(account.id.clone());
        exclude
    }

    async fn search(&self, user_id: &str) -> Result<ChatSession> {
        let timeout = self.config.search_timeout;
        let deadline = Instant::now() + timeout;
        let grace_deadline = deadline + self.config.match_grace;

        loop {
            if let Some(session) = self.poll_search(user_id).await? {
                return Ok(session);
            }

            if Instant::now() >= deadline {
                let outcome = if self.config.ai_fallback {
                    self.queue.withdraw_for_fallback(user_id).await
                } else {
                    self.queue.cancel(user_id).await
                };
                match outcome {
                    CancelOutcome::Cancelled if self.config.ai_fallback => {
                        info!("No partner for {} within {:?}, using AI", user_id, timeout);
                        return self.start_ai_session(user_id).await;
                    }
                    CancelOutcome::Cancelled => {
                        info!("No partner for {} within {:?}", user_id, timeout);
                        return Err(EngineError::SearchTimedOut(timeout));
                    }
                    CancelOutcome::AlreadyMatched(partner) if Instant::now() >= grace_deadline => {
                        if let Some(session) = self.registry.active_for(user_id).await {
                            return Ok(session);
                        }
                        // The side that won the pairing never opened the session.
                        self.queue.reclaim(user_id).await;
                        warn!("{} matched {} but no session opened", user_id, partner);
                        return Err(EngineError::SearchTimedOut(timeout));
                    }
                    CancelOutcome::AlreadyMatched(partner) => {
                        debug!("{} timed out after matching {}, waiting", user_id, partner);
                    }
                    CancelOutcome::NotQueued => {
                        return self
                            .registry
                            .active_for(user_id)
                            .await
                            .ok_or(EngineError::SearchCancelled);
                    }
                }
            }

            sleep(self.config.poll_interval).await;
        }
    }

    /// One round of the search loop. `Ok(None)` means keep polling.
    async fn poll_search(&self, user_id: &str) -> Result<Option<ChatSession>> {
        match self.queue.ticket(user_id).await {
            Some(ticket) if ticket.status == TicketStatus::Waiting => {
                for _ in 0..=self.config.retry.max_retries {
                    match self.queue.try_match(user_id, self.clock.now()).await {
                        Ok(Some(pairing)) => return self.start_pairing(pairing).await.map(Some),
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_retriable() => {
                            debug!("{} lost a pairing race, re-scanning", user_id);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(None)
            }
            // Matched by someone else; their side is starting the session.
            Some(_) => Ok(self.registry.active_for(user_id).await),
            None => self
                .registry
                .active_for(user_id)
                .await
                .map(Some)
                .ok_or(EngineError::SearchCancelled),
        }
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start a session between two users directly, bypassing the queue.
    pub async fn start(&self, a: &str, b: &str) -> Result<ChatSession> {
        if a == b {
            return Err(EngineError::InvalidRequest(
                "a session needs two different users".to_string(),
            ));
        }
        self.queue.engage(a).await?;
        if let Err(e) = self.queue.engage(b).await {
            self.queue.release(a).await;
            return Err(e);
        }

        let participants = [Participant::User(a.to_string()), Participant::User(b.to_string())];
        match self.open_session(participants).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.queue.release(a).await;
                self.queue.release(b).await;
                Err(e)
            }
        }
    }

    /// Turn a committed pairing into a session. On failure both tickets go
    /// back to waiting.
    async fn start_pairing(&self, pairing: Pairing) -> Result<ChatSession> {
        let participants = [
            Participant::User(pairing.first.user_id.clone()),
            Participant::User(pairing.second.user_id.clone()),
        ];
        match self.open_session(participants).await {
            Ok(session) => {
                if !self.queue.complete(&pairing).await {
                    warn!(
                        "Session {} opened after its pairing was reclaimed",
                        session.id
                    );
                }
                Ok(session)
            }
            Err(e) => {
                warn!(
                    "Could not start session for {} and {}: {}",
                    pairing.first.user_id, pairing.second.user_id, e
                );
                self.queue.abandon(&pairing).await;
                Err(e)
            }
        }
    }

    /// The user was withdrawn from the queue and engaged; pair them with AI.
    async fn start_ai_session(&self, user_id: &str) -> Result<ChatSession> {
        let participants = [Participant::User(user_id.to_string()), Participant::Ai];
        match self.open_session(participants).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.queue.release(user_id).await;
                Err(e)
            }
        }
    }

    /// Snapshot every human participant's balance and clear their preserved
    /// time in one transaction, then register the session.
    async fn open_session(&self, participants: [Participant; 2]) -> Result<ChatSession> {
        let now = self.clock.now();
        let ids: Vec<UserId> = participants
            .iter()
            .filter_map(|p| p.user_id().map(str::to_string))
            .collect();
        let ledger = self.ledger;
        let mut meters = Vec::with_capacity(ids.len());

        transact_with_retry(self.store.as_ref(), &ids, self.config.retry, |accounts| {
            meters.clear();
            for account in accounts.iter_mut() {
                ledger.apply_daily_reset(account, now);
                if !account.is_premium && ledger.total_available(account, now).is_zero() {
                    return Err(EngineError::InsufficientTime);
                }
                meters.push(TimeMeter::snapshot(&ledger, account, now));
                ledger.clear_preserved(account);
            }
            Ok(())
        })
        .await?;

        let session = ChatSession::new(participants, meters, now);
        self.registry.insert(session.clone()).await?;
        info!(
            "Session {} started: {} <-> {}",
            session.id,
            session.participants[0].as_str(),
            session.participants[1].as_str()
        );
        Ok(session)
    }

    // ========================================================================
    // Ticking
    // ========================================================================

    /// Advance a session by `elapsed` seconds.
    ///
    /// A session that runs out of time is settled before this returns.
    pub async fn tick(&self, session_id: SessionId, elapsed: u64) -> Result<ChatSession> {
        let now = self.clock.now();
        let policy = self.config.session;
        let (events, session) = self
            .registry
            .modify(session_id, |s| s.tick(elapsed, now, &policy))
            .await?;

        self.dispatch(&session, events).await;
        if !session.is_active() {
            self.settle(&session).await?;
        }
        Ok(session)
    }

    /// Tick every active session up to now. Returns the sessions that
    /// expired.
    pub async fn tick_all(&self) -> Vec<ChatSession> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        self.prune_ended(now).await;

        for session in self.registry.active_sessions().await {
            let elapsed = seconds_between(session.last_ticked_at, now);
            if elapsed == 0 {
                continue;
            }
            match self.tick(session.id, elapsed).await {
                Ok(s) if !s.is_active() => expired.push(s),
                Ok(_) => {}
                Err(EngineError::SessionInactive(_)) => {}
                Err(e) => warn!("Failed to tick session {}: {}", session.id, e),
            }
        }
        expired
    }

    async fn dispatch(&self, session: &ChatSession, events: Vec<TickEvent>) {
        for event in events {
            match event {
                TickEvent::LowTimeWarning { user_id, seconds_left } => {
                    debug!("{} has {}s left in {}", user_id, seconds_left, session.id);
                    deliver(
                        self.notifier.as_ref(),
                        Notification::LowTimeWarning {
                            session_id: session.id,
                            user_id,
                            seconds_left,
                        },
                    )
                    .await;
                }
                TickEvent::TimerExpired => {
                    info!("Session {} ran out of time", session.id);
                    for user_id in session.user_ids() {
                        deliver(
                            self.notifier.as_ref(),
                            Notification::TimerExpired {
                                session_id: session.id,
                                user_id: user_id.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Ending
    // ========================================================================

    /// End a session on behalf of `user_id`.
    ///
    /// Time elapsed since the last tick is charged first. If that exhausts a
    /// meter the session ends as `TimerExpired` regardless of `reason`.
    pub async fn close(
        &self,
        session_id: SessionId,
        user_id: &str,
        reason: CloseReason,
    ) -> Result<(ChatSession, Account)> {
        let now = self.clock.now();
        let policy = self.config.session;

        let (events, session) = self
            .registry
            .modify(session_id, |s| {
                s.ensure_participant(user_id)?;
                let elapsed = seconds_between(s.last_ticked_at, now);
                let events = s.tick(elapsed, now, &policy)?;
                if s.is_active() {
                    s.close(now, reason, &policy)?;
                }
                Ok(events)
            })
            .await?;

        self.dispatch(&session, events).await;
        let accounts = self.settle(&session).await?;

        if session.close_reason == Some(reason) && reason != CloseReason::TimerExpired {
            if let Some(partner) = session.partner_of(user_id).and_then(Participant::user_id) {
                deliver(
                    self.notifier.as_ref(),
                    Notification::PartnerLeft {
                        session_id,
                        user_id: partner.to_string(),
                        reason: reason.as_str().to_string(),
                    },
                )
                .await;
            }
        }

        let account = accounts
            .into_iter()
            .find(|a| a.id == user_id)
            .ok_or_else(|| EngineError::AccountNotFound(user_id.to_string()))?;
        Ok((session, account))
    }

    /// Charge an ended session to its participants, free them for a new
    /// search and archive it.
    async fn settle(&self, session: &ChatSession) -> Result<Vec<Account>> {
        let ids: Vec<UserId> = session.user_ids().map(str::to_string).collect();
        let ledger = self.ledger;
        let preserve = session.close_reason == Some(CloseReason::UserEnded);

        let result = transact_with_retry(self.store.as_ref(), &ids, self.config.retry, |accounts| {
            for account in accounts.iter_mut() {
                let Some(meter) = session.meter(&account.id) else {
                    continue;
                };
                ledger.commit_usage(account, meter.free_used(), meter.paid_used());
                if preserve && !meter.unlimited && !meter.is_exhausted() {
                    ledger.preserve(account, meter.free_seconds_left, meter.paid_seconds_left);
                }
            }
            Ok(())
        })
        .await;

        for id in &ids {
            self.queue.release(id).await;
        }
        self.registry.archive(session).await;
        self.prune_ended(self.clock.now()).await;

        match &result {
            Ok(_) => info!(
                "Session {} settled ({}s, {:?})",
                session.id,
                session.elapsed_seconds,
                session.close_reason.map(|r| r.as_str())
            ),
            Err(e) => warn!("Failed to settle session {}: {}", session.id, e),
        }
        result
    }

    /// Forget ended sessions that can no longer affect partner exclusion.
    /// Ratings must be submitted within the same window.
    async fn prune_ended(&self, now: DateTime<Utc>) {
        let cutoff = window_start(now, self.config.recent_partner_window);
        self.registry.prune(cutoff).await;
    }

    /// Go back to the user's running session.
    pub async fn resume(&self, user_id: &str) -> Result<ChatSession> {
        self.registry
            .active_for(user_id)
            .await
            .filter(|s| s.meter(user_id).is_some_and(|m| !m.is_exhausted()))
            .ok_or(EngineError::NoActiveSession)
    }

    /// Skip the current partner. Counts against the skip gate, then ends the
    /// session with `PartnerSkip`.
    pub async fn skip_partner(
        &self,
        session_id: SessionId,
        user_id: &str,
    ) -> Result<(ChatSession, SkipOutcome)> {
        let session = self.registry.get(session_id).await?;
        session.ensure_participant(user_id)?;
        session.ensure_active()?;

        let outcome = self
            .skip_gate
            .record(self.store.as_ref(), user_id, self.clock.now(), self.config.retry)
            .await?;
        let (session, account) = self.close(session_id, user_id, CloseReason::PartnerSkip).await?;
        Ok((
            session,
            SkipOutcome {
                account,
                requires_ad: outcome.requires_ad,
            },
        ))
    }

    /// Apply the ad player's verdict for `user_id`.
    pub async fn resolve_ad(&self, user_id: &str, success: bool) -> Result<Account> {
        self.skip_gate
            .resolve(
                self.store.as_ref(),
                user_id,
                success,
                self.clock.now(),
                self.config.retry,
            )
            .await
    }

    /// End the session and never match these two users again.
    pub async fn block_partner(
        &self,
        session_id: SessionId,
        user_id: &str,
    ) -> Result<(ChatSession, Account)> {
        let (session, account) = self.close(session_id, user_id, CloseReason::Block).await?;
        let Some(partner) = session.partner_of(user_id).and_then(Participant::user_id) else {
            return Ok((session, account));
        };

        let ids = [user_id.to_string()];
        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.config.retry, |accounts| {
            accounts[0].blocked_user_ids.insert(partner.to_string());
            Ok(())
        })
        .await?;
        info!("{} blocked {}", user_id, partner);
        Ok((session, accounts.remove(0)))
    }

    /// End the session and flag the partner for review.
    pub async fn report_partner(
        &self,
        session_id: SessionId,
        user_id: &str,
    ) -> Result<(ChatSession, Account)> {
        let (session, account) = self.close(session_id, user_id, CloseReason::Report).await?;
        if let Some(partner) = session.partner_of(user_id) {
            info!(
                "{} reported {} in session {}",
                user_id,
                partner.as_str(),
                session_id
            );
        }
        Ok((session, account))
    }

    // ========================================================================
    // In-session actions
    // ========================================================================

    /// Count a message sent in an active session.
    pub async fn record_message(&self, session_id: SessionId, user_id: &str) -> Result<ChatSession> {
        let (_, session) = self
            .registry
            .modify(session_id, |s| {
                s.ensure_participant(user_id)?;
                s.ensure_active()?;
                s.message_count = s.message_count.saturating_add(1);
                Ok(())
            })
            .await?;
        Ok(session)
    }

    /// Rate an ended session. Allowed once, and only if the session was
    /// long or busy enough.
    pub async fn submit_rating(
        &self,
        session_id: SessionId,
        user_id: &str,
        score: u8,
    ) -> Result<ChatSession> {
        if !(1..=5).contains(&score) {
            return Err(EngineError::InvalidRequest(format!(
                "rating must be 1-5, got {}",
                score
            )));
        }
        let (_, session) = self
            .registry
            .modify(session_id, |s| {
                s.ensure_participant(user_id)?;
                if s.is_active() {
                    return Err(EngineError::RatingNotAllowed("session still active".to_string()));
                }
                if !s.rating_eligible {
                    return Err(EngineError::RatingNotAllowed("session too short".to_string()));
                }
                if s.rating_submitted {
                    return Err(EngineError::RatingNotAllowed("already rated".to_string()));
                }
                s.rating_submitted = true;
                Ok(())
            })
            .await?;
        info!("{} rated session {} {}/5", user_id, session_id, score);
        Ok(session)
    }

    /// Gift giftable credits to the partner in a session.
    pub async fn send_gift(
        &self,
        session_id: SessionId,
        from: &str,
        credits: u64,
    ) -> Result<(Account, Account)> {
        let session = self.registry.get(session_id).await?;
        session.ensure_participant(from)?;
        let to = session
            .partner_of(from)
            .and_then(Participant::user_id)
            .ok_or_else(|| EngineError::InvalidRequest("cannot gift the AI partner".to_string()))?;

        let accounts = self.wallet.gift(from, to, credits).await?;
        self.registry
            .modify(session_id, |s| {
                s.has_received_gift = true;
                Ok(())
            })
            .await?;
        Ok(accounts)
    }

    /// Convert credits into paid time. A running session picks the new time
    /// up immediately; an ended session stays ended.
    pub async fn extend_time(&self, user_id: &str, credits: u64) -> Result<(Account, u64)> {
        let (account, seconds) = self.wallet.convert_credits_to_time(user_id, credits).await?;

        if let Some(session) = self.registry.active_for(user_id).await {
            let result = self
                .registry
                .modify(session.id, |s| {
                    if s.is_active() {
                        if let Some(meter) = s.meter_mut(user_id) {
                            meter.add_paid(seconds);
                        }
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to extend session {}: {}", session.id, e);
            }
        }
        Ok((account, seconds))
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Role;
    use crate::notify::RecordingSink;
    use crate::store::InMemoryAccountStore;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        manager: SessionManager,
        store: Arc<InMemoryAccountStore>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn fixture(accounts: Vec<Account>) -> Fixture {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(InMemoryAccountStore::with_clock(clock.clone()));
        for account in accounts {
            store.insert(account).await.unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let config = EngineConfig {
            search_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(MatchmakingQueue::new()),
            clock.clone(),
            sink.clone(),
            config,
        );
        Fixture {
            manager,
            store,
            clock,
            sink,
        }
    }

    fn account(id: &str) -> Account {
        Account::new(id, start_time())
    }

    #[tokio::test]
    async fn test_start_snapshots_and_clears_preserved() {
        let mut alice = account("alice");
        TimeLedger::default().preserve(&mut alice, 150, 50);
        let f = fixture(vec![alice, account("bob")]).await;

        let session = f.manager.start("alice", "bob").await.unwrap();
        let meter = session.meter("alice").unwrap();
        assert_eq!((meter.free_seconds_left, meter.paid_seconds_left), (150, 50));
        assert_eq!(session.meter("bob").unwrap().free_seconds_left, 1200);

        let stored = f.store.get("alice").await.unwrap();
        assert!(stored.preserved_free_seconds.is_none());
        assert!(stored.preserved_paid_seconds.is_none());

        let again = f.manager.start("alice", "carol").await;
        assert!(matches!(again, Err(EngineError::ActiveSessionExists)));
    }

    #[tokio::test]
    async fn test_close_commits_and_preserves() {
        let f = fixture(vec![account("alice"), account("bob")]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();

        f.clock.advance_secs(100);
        let (closed, alice) = f
            .manager
            .close(session.id, "alice", CloseReason::UserEnded)
            .await
            .unwrap();

        assert!(!closed.is_active());
        assert_eq!(closed.elapsed_seconds, 100);
        assert_eq!(alice.daily_free_seconds_used, 100);
        assert_eq!(alice.preserved_free_seconds, Some(1100));

        let bob = f.store.get("bob").await.unwrap();
        assert_eq!(bob.preserved_free_seconds, Some(1100));
        assert!(!f.manager.queue().is_engaged("alice").await);
        assert!(f.sink.received().contains(&Notification::PartnerLeft {
            session_id: session.id,
            user_id: "bob".to_string(),
            reason: "user_ended".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_skip_close_does_not_preserve() {
        let f = fixture(vec![account("alice"), account("bob")]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();

        f.clock.advance_secs(60);
        let (closed, outcome) = f.manager.skip_partner(session.id, "alice").await.unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::PartnerSkip));
        assert!(!outcome.requires_ad);
        assert_eq!(outcome.account.skip_state.skip_count, 1);
        assert_eq!(outcome.account.daily_free_seconds_used, 60);
        assert!(outcome.account.preserved_free_seconds.is_none());
    }

    #[tokio::test]
    async fn test_tick_expiry_notifies_both() {
        let mut alice = account("alice");
        alice.daily_free_seconds_used = 1190;
        let f = fixture(vec![alice, account("bob")]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();

        let expired = f.manager.tick(session.id, 10).await.unwrap();
        assert!(!expired.is_active());
        assert_eq!(expired.close_reason, Some(CloseReason::TimerExpired));

        let received = f.sink.received();
        let timer_users: Vec<_> = received
            .iter()
            .filter_map(|n| match n {
                Notification::TimerExpired { user_id, .. } => Some(user_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(timer_users, vec!["alice", "bob"]);
        assert_eq!(f.store.get("alice").await.unwrap().daily_free_seconds_used, 1200);
        assert!(matches!(
            f.manager.resume("alice").await,
            Err(EngineError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_rating_rules() {
        let f = fixture(vec![account("alice"), account("bob")]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();
        for _ in 0..10 {
            f.manager.record_message(session.id, "alice").await.unwrap();
        }

        let early = f.manager.submit_rating(session.id, "bob", 5).await;
        assert!(matches!(early, Err(EngineError::RatingNotAllowed(_))));

        f.manager
            .close(session.id, "alice", CloseReason::UserEnded)
            .await
            .unwrap();
        let rated = f.manager.submit_rating(session.id, "bob", 4).await.unwrap();
        assert!(rated.rating_submitted);

        let twice = f.manager.submit_rating(session.id, "alice", 4).await;
        assert!(matches!(twice, Err(EngineError::RatingNotAllowed(_))));

        let outsider = f.manager.record_message(session.id, "carol").await;
        assert!(matches!(outsider, Err(EngineError::NotParticipant { .. })));
    }

    #[tokio::test]
    async fn test_extend_time_updates_running_meter() {
        let mut alice = account("alice");
        alice.credits = 2;
        let f = fixture(vec![alice, account("bob").with_role(Role::Listen)]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();

        let (account, seconds) = f.manager.extend_time("alice", 1).await.unwrap();
        assert_eq!(seconds, 360);
        assert_eq!(account.credits, 1);

        let running = f.manager.resume("alice").await.unwrap();
        assert_eq!(running.id, session.id);
        assert_eq!(running.meter("alice").unwrap().paid_seconds_left, 360);
    }

    #[tokio::test]
    async fn test_block_partner() {
        let f = fixture(vec![account("alice"), account("bob")]).await;
        let session = f.manager.start("alice", "bob").await.unwrap();

        let (closed, alice) = f.manager.block_partner(session.id, "alice").await.unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::Block));
        assert!(alice.has_blocked("bob"));
        assert!(f.store.get("alice").await.unwrap().has_blocked("bob"));
    }
}
