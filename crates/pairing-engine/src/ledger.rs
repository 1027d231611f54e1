//! Free, paid and preserved time accounting.
//!
//! All balance math is a pure function of an [`Account`] and the current
//! instant. The daily reset is decided only by `(now, daily_reset_date)`, so
//! the lazy path (first read after midnight UTC) and the sweep job converge
//! on the same state.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{RetryPolicy, DAILY_FREE_LIMIT};
use crate::error::Result;
use crate::model::{Account, Allowance, SkipAttemptState};
use crate::retry::transact_with_retry;
use crate::store::AccountStore;

/// Time balance calculator for accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLedger {
    daily_free_limit: u64,
}

impl Default for TimeLedger {
    fn default() -> Self {
        Self::new(DAILY_FREE_LIMIT)
    }
}

impl TimeLedger {
    /// Create a ledger with the given daily free allowance.
    pub fn new(daily_free_limit: u64) -> Self {
        Self { daily_free_limit }
    }

    /// The daily free allowance in seconds.
    pub fn daily_free_limit(&self) -> u64 {
        self.daily_free_limit
    }

    /// Whether `now` falls on a later UTC day than the account's last reset.
    pub fn needs_reset(account: &Account, now: DateTime<Utc>) -> bool {
        now.date_naive() != account.daily_reset_date
    }

    /// Free seconds the account could use right now.
    pub fn remaining_free_seconds(&self, account: &Account, now: DateTime<Utc>) -> Allowance {
        if account.is_premium {
            return Allowance::Unlimited;
        }
        if Self::needs_reset(account, now) {
            return Allowance::Limited(self.daily_free_limit);
        }
        match account.preserved_free_seconds {
            Some(preserved) => Allowance::Limited(preserved),
            None => Allowance::Limited(
                self.daily_free_limit
                    .saturating_sub(account.daily_free_seconds_used),
            ),
        }
    }

    /// Paid seconds the account could use right now.
    pub fn remaining_paid_seconds(&self, account: &Account) -> u64 {
        account
            .preserved_paid_seconds
            .unwrap_or(account.paid_seconds_available)
    }

    /// Free plus paid; unlimited for premium accounts.
    pub fn total_available(&self, account: &Account, now: DateTime<Utc>) -> Allowance {
        self.remaining_free_seconds(account, now)
            + Allowance::Limited(self.remaining_paid_seconds(account))
    }

    /// Materialise the daily reset. Returns `true` if anything changed;
    /// a second call on the same UTC day is a no-op.
    pub fn apply_daily_reset(&self, account: &mut Account, now: DateTime<Utc>) -> bool {
        if !Self::needs_reset(account, now) {
            return false;
        }

        debug!(
            "Daily reset for {} ({} -> {})",
            account.id,
            account.daily_reset_date,
            now.date_naive()
        );
        account.daily_free_seconds_used = 0;
        account.preserved_free_seconds = None;
        account.partner_change_count = 0;
        if !account.is_premium {
            account.skip_state = SkipAttemptState::default();
        }
        account.daily_reset_date = now.date_naive();
        true
    }

    /// Charge time consumed by a finished session. Premium accounts are not
    /// charged. Consumes any preserved snapshot.
    pub fn commit_usage(&self, account: &mut Account, free_used: u64, paid_used: u64) {
        if account.is_premium {
            return;
        }
        account.daily_free_seconds_used = account
            .daily_free_seconds_used
            .saturating_add(free_used)
            .min(self.daily_free_limit);
        account.paid_seconds_available = account.paid_seconds_available.saturating_sub(paid_used);
        account.preserved_free_seconds = None;
        account.preserved_paid_seconds = None;
    }

    /// Snapshot leftover time so the next session starts from exactly this
    /// balance. Overwrites any earlier snapshot.
    pub fn preserve(&self, account: &mut Account, free_left: u64, paid_left: u64) {
        account.preserved_free_seconds = Some(free_left.min(self.daily_free_limit));
        account.preserved_paid_seconds = Some(paid_left);
    }

    /// Drop the preserved snapshot once a session has taken it over.
    pub fn clear_preserved(&self, account: &mut Account) {
        account.preserved_free_seconds = None;
        account.preserved_paid_seconds = None;
    }

    /// Add purchased seconds. Preserved fields are left alone; a pending
    /// paid snapshot keeps precedence until the next session consumes it.
    pub fn extend(&self, account: &mut Account, extra_seconds: u64) {
        account.paid_seconds_available = account.paid_seconds_available.saturating_add(extra_seconds);
    }

    /// Apply the daily reset to every account that is due. Returns the number
    /// of accounts changed.
    pub async fn sweep_daily_resets(
        &self,
        store: &dyn AccountStore,
        now: DateTime<Utc>,
        retry: RetryPolicy,
    ) -> Result<usize> {
        let mut reset = 0;
        for id in store.account_ids().await? {
            let mut changed = false;
            transact_with_retry(store, std::slice::from_ref(&id), retry, |accounts| {
                changed = self.apply_daily_reset(&mut accounts[0], now);
                Ok(())
            })
            .await?;
            if changed {
                reset += 1;
            }
        }

        info!("Daily reset sweep complete: {} account(s) reset", reset);
        Ok(reset)
    }
}
