//! Partner skip counting and the ad-watch gate.
//!
//! ```text
//! Idle ──skip──▶ Counting ──skip #limit──▶ AdRequired ──ad ok──▶ Idle
//!                                            │    ▲
//!                                            └────┘ ad failed
//! ```
//!
//! Premium users pass straight through and never persist a count.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{EngineConfig, RetryPolicy, SKIP_LIMIT};
use crate::error::{EngineError, Result};
use crate::ledger::TimeLedger;
use crate::model::{Account, SkipAttemptState};
use crate::retry::transact_with_retry;
use crate::store::AccountStore;

/// Result of recording a skip against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipOutcome {
    /// The account after the skip.
    pub account: Account,
    /// The caller must play an ad before the next skip or search.
    pub requires_ad: bool,
}

/// Skip gate state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipGate {
    limit: u8,
    ledger: TimeLedger,
}

impl Default for SkipGate {
    fn default() -> Self {
        Self::new(SKIP_LIMIT, TimeLedger::default())
    }
}

impl SkipGate {
    pub fn new(limit: u8, ledger: TimeLedger) -> Self {
        Self { limit, ledger }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.skip_limit, TimeLedger::new(config.daily_free_seconds))
    }

    /// Skips allowed before the gate closes.
    pub fn limit(&self) -> u8 {
        self.limit
    }

    /// Advance the state by one skip.
    ///
    /// Returns the new state and whether an ad is now required. Fails with
    /// `SkipLimitReached` while the gate is closed.
    pub fn record_skip(
        &self,
        state: &SkipAttemptState,
        is_premium: bool,
        now: DateTime<Utc>,
    ) -> Result<(SkipAttemptState, bool)> {
        if is_premium {
            return Ok((state.clone(), false));
        }
        if state.requires_ad(self.limit) {
            return Err(EngineError::SkipLimitReached);
        }

        let skip_count = state.skip_count + 1;
        let requires_ad = skip_count >= self.limit;
        let next = SkipAttemptState {
            skip_count,
            ad_gate_triggered_at: if requires_ad { Some(now) } else { None },
        };
        Ok((next, requires_ad))
    }

    /// Apply the ad player's verdict. Success reopens the gate; failure keeps
    /// it closed so the caller can retry the ad or give up.
    pub fn resolve_ad(&self, state: &SkipAttemptState, success: bool) -> SkipAttemptState {
        if success {
            SkipAttemptState::default()
        } else {
            state.clone()
        }
    }

    /// Whether this account is blocked on an ad right now.
    pub fn is_gated(&self, account: &Account) -> bool {
        !account.is_premium && account.skip_state.requires_ad(self.limit)
    }

    /// Record a skip for `user_id` in one account transaction. Non-premium
    /// skips also count towards today's partner changes.
    pub async fn record(
        &self,
        store: &dyn AccountStore,
        user_id: &str,
        now: DateTime<Utc>,
        retry: RetryPolicy,
    ) -> Result<SkipOutcome> {
        let account = store.get(user_id).await?;
        if account.is_premium {
            debug!("Premium skip for {} not counted", user_id);
            return Ok(SkipOutcome {
                account,
                requires_ad: false,
            });
        }

        let ids = [user_id.to_string()];
        let mut requires_ad = false;
        let mut accounts = transact_with_retry(store, &ids, retry, |accounts| {
            let account = &mut accounts[0];
            self.ledger.apply_daily_reset(account, now);
            let (next, gated) = self.record_skip(&account.skip_state, account.is_premium, now)?;
            account.skip_state = next;
            account.partner_change_count = account.partner_change_count.saturating_add(1);
            requires_ad = gated;
            Ok(())
        })
        .await?;

        if requires_ad {
            info!("Skip limit reached for {}, ad required", user_id);
        }
        Ok(SkipOutcome {
            account: accounts.remove(0),
            requires_ad,
        })
    }

    /// Record the ad result for `user_id`.
    pub async fn resolve(
        &self,
        store: &dyn AccountStore,
        user_id: &str,
        success: bool,
        now: DateTime<Utc>,
        retry: RetryPolicy,
    ) -> Result<Account> {
        let account = store.get(user_id).await?;
        if account.is_premium {
            return Ok(account);
        }

        let ids = [user_id.to_string()];
        let mut accounts = transact_with_retry(store, &ids, retry, |accounts| {
            let account = &mut accounts[0];
            self.ledger.apply_daily_reset(account, now);
            account.skip_state = self.resolve_ad(&account.skip_state, success);
            Ok(())
        })
        .await?;

        info!(
            "Ad for {} {}",
            user_id,
            if success { "completed" } else { "failed" }
        );
        Ok(accounts.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAccountStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_fifth_skip_requires_ad() {
        let gate = SkipGate::default();
        let mut state = SkipAttemptState::default();

        for expected in 1..=5u8 {
            let (next, requires_ad) = gate.record_skip(&state, false, now()).unwrap();
            assert_eq!(next.skip_count, expected);
            assert_eq!(requires_ad, expected == 5);
            state = next;
        }
        assert_eq!(state.ad_gate_triggered_at, Some(now()));

        let sixth = gate.record_skip(&state, false, now());
        assert!(matches!(sixth, Err(EngineError::SkipLimitReached)));
    }

    #[test]
    fn test_premium_never_gated() {
        let gate = SkipGate::default();
        let state = SkipAttemptState::default();
        for _ in 0..20 {
            let (next, requires_ad) = gate.record_skip(&state, true, now()).unwrap();
            assert!(!requires_ad);
            assert_eq!(next.skip_count, 0);
        }
    }

    #[test]
    fn test_resolve_ad() {
        let gate = SkipGate::default();
        let closed = SkipAttemptState {
            skip_count: 5,
            ad_gate_triggered_at: Some(now()),
        };

        let failed = gate.resolve_ad(&closed, false);
        assert_eq!(failed.skip_count, 5);
        assert!(failed.requires_ad(gate.limit()));

        let passed = gate.resolve_ad(&closed, true);
        assert_eq!(passed, SkipAttemptState::default());
    }

    #[tokio::test]
    async fn test_store_backed_gate() {
        let store = InMemoryAccountStore::new();
        store.insert(Account::new("alice", now())).await.unwrap();
        store
            .insert(Account::new("pat", now()).with_premium(true))
            .await
            .unwrap();
        let gate = SkipGate::default();
        let retry = RetryPolicy::default();

        for i in 1..=5 {
            let outcome = gate.record(&store, "alice", now(), retry).await.unwrap();
            assert_eq!(outcome.requires_ad, i == 5);
        }
        let stored = store.get("alice").await.unwrap();
        assert_eq!(stored.partner_change_count, 5);
        assert!(gate.is_gated(&stored));

        let blocked = gate.record(&store, "alice", now(), retry).await;
        assert!(matches!(blocked, Err(EngineError::SkipLimitReached)));
        assert_eq!(store.get("alice").await.unwrap().partner_change_count, 5);

        let reopened = gate.resolve(&store, "alice", true, now(), retry).await.unwrap();
        assert_eq!(reopened.skip_state.skip_count, 0);

        for _ in 0..7 {
            let outcome = gate.record(&store, "pat", now(), retry).await.unwrap();
            assert!(!outcome.requires_ad);
        }
        assert_eq!(store.get("pat").await.unwrap().skip_state.skip_count, 0);
    }
}
