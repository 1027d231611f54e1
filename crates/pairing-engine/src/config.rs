//! Configuration for the pairing engine.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Daily free chat allowance in seconds.
pub const DAILY_FREE_LIMIT: u64 = 1200;

/// Paid seconds granted per converted credit.
pub const SECONDS_PER_CREDIT: u64 = 360;

/// Giftable credits per reward unit.
pub const REWARD_UNIT_COST: u64 = 15;

/// Consecutive skips allowed before the ad gate triggers.
pub const SKIP_LIMIT: u8 = 5;

/// Remaining time at which the low-time warning fires.
pub const LOW_TIME_WARNING_SECONDS: u64 = 180;

/// Minimum chat length for a session to become ratable.
pub const RATING_MIN_SECONDS: u64 = 300;

/// Minimum message count for a session to become ratable.
pub const RATING_MIN_MESSAGES: u32 = 10;

/// Window in which a previous partner is excluded from matching.
pub const RECENT_PARTNER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default overall search timeout.
const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between matching probes.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default extra wait for a partner to open a session matched just before
/// the search deadline.
const DEFAULT_MATCH_GRACE: Duration = Duration::from_secs(5);

/// What a verified store product grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "amount")]
pub enum Product {
    /// Spendable credits.
    Credits(u64),
    /// Credits that can only be gifted or converted into rewards.
    GiftableCredits(u64),
    /// Unlimited-time subscription.
    Premium,
}

/// Thresholds the session state machine needs on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Remaining seconds at which the low-time warning fires.
    pub low_time_warning_seconds: u64,
    /// Chat length that makes a session ratable.
    pub rating_min_seconds: u64,
    /// Message count that makes a session ratable.
    pub rating_min_messages: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            low_time_warning_seconds: LOW_TIME_WARNING_SECONDS,
            rating_min_seconds: RATING_MIN_SECONDS,
            rating_min_messages: RATING_MIN_MESSAGES,
        }
    }
}

/// Bounded exponential backoff for retriable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry; doubled on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
        }
    }
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Daily free allowance in seconds.
    pub daily_free_seconds: u64,

    /// Paid seconds per converted credit.
    pub seconds_per_credit: u64,

    /// Giftable credits per reward unit.
    pub reward_unit_cost: u64,

    /// Skips before an ad is required (non-premium only).
    pub skip_limit: u8,

    /// Tick and rating thresholds.
    pub session: SessionPolicy,

    /// Previous partners are excluded for this long.
    pub recent_partner_window: Duration,

    /// Overall bound on one `find_partner` call.
    pub search_timeout: Duration,

    /// Delay between matching probes while waiting.
    pub poll_interval: Duration,

    /// After the search deadline, how long a matched user waits for the
    /// partner to open the session before the pairing is reclaimed.
    pub match_grace: Duration,

    /// Retry policy for store conflicts.
    pub retry: RetryPolicy,

    /// Start an AI session instead of failing when the search times out.
    pub ai_fallback: bool,

    /// Product catalog keyed by store product id.
    pub products: HashMap<String, Product>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daily_free_seconds: DAILY_FREE_LIMIT,
            seconds_per_credit: SECONDS_PER_CREDIT,
            reward_unit_cost: REWARD_UNIT_COST,
            skip_limit: SKIP_LIMIT,
            session: SessionPolicy::default(),
            recent_partner_window: RECENT_PARTNER_WINDOW,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            match_grace: DEFAULT_MATCH_GRACE,
            retry: RetryPolicy::default(),
            ai_fallback: false,
            products: default_products(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// All variables are optional; unset or unparsable values keep the default.
    ///
    /// - `PAIRING_DAILY_FREE_SECONDS` - Daily free allowance (default: 1200)
    /// - `PAIRING_SECONDS_PER_CREDIT` - Seconds per credit (default: 360)
    /// - `PAIRING_REWARD_UNIT_COST` - Giftable credits per reward (default: 15)
    /// - `PAIRING_SKIP_LIMIT` - Skips before the ad gate (default: 5)
    /// - `PAIRING_LOW_TIME_WARNING_SECONDS` - Low-time threshold (default: 180)
    /// - `PAIRING_RATING_MIN_SECONDS` - Ratable chat length (default: 300)
    /// - `PAIRING_RATING_MIN_MESSAGES` - Ratable message count (default: 10)
    /// - `PAIRING_RECENT_PARTNER_WINDOW_SECS` - Partner exclusion window (default: 86400)
    /// - `PAIRING_SEARCH_TIMEOUT_SECS` - Search timeout (default: 60)
    /// - `PAIRING_POLL_INTERVAL_MS` - Probe interval (default: 500)
    /// - `PAIRING_MATCH_GRACE_MS` - Wait for a matched partner past the deadline (default: 5000)
    /// - `PAIRING_MAX_RETRIES` - Conflict retries (default: 3)
    /// - `PAIRING_AI_FALLBACK` - `true` to fall back to an AI partner (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            daily_free_seconds: env_or("PAIRING_DAILY_FREE_SECONDS", defaults.daily_free_seconds),
            seconds_per_credit: env_or("PAIRING_SECONDS_PER_CREDIT", defaults.seconds_per_credit),
            reward_unit_cost: env_or("PAIRING_REWARD_UNIT_COST", defaults.reward_unit_cost),
            skip_limit: env_or("PAIRING_SKIP_LIMIT", defaults.skip_limit),
            session: SessionPolicy {
                low_time_warning_seconds: env_or(
                    "PAIRING_LOW_TIME_WARNING_SECONDS",
                    defaults.session.low_time_warning_seconds,
                ),
                rating_min_seconds: env_or(
                    "PAIRING_RATING_MIN_SECONDS",
                    defaults.session.rating_min_seconds,
                ),
                rating_min_messages: env_or(
                    "PAIRING_RATING_MIN_MESSAGES",
                    defaults.session.rating_min_messages,
                ),
            },
            recent_partner_window: Duration::from_secs(env_or(
                "PAIRING_RECENT_PARTNER_WINDOW_SECS",
                defaults.recent_partner_window.as_secs(),
            )),
            search_timeout: Duration::from_secs(env_or(
                "PAIRING_SEARCH_TIMEOUT_SECS",
                defaults.search_timeout.as_secs(),
            )),
            poll_interval: Duration::from_millis(env_or(
                "PAIRING_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            match_grace: Duration::from_millis(env_or(
                "PAIRING_MATCH_GRACE_MS",
                defaults.match_grace.as_millis() as u64,
            )),
            retry: RetryPolicy {
                max_retries: env_or("PAIRING_MAX_RETRIES", defaults.retry.max_retries),
                ..defaults.retry
            },
            ai_fallback: env_or("PAIRING_AI_FALLBACK", defaults.ai_fallback),
            products: defaults.products,
        }
    }

    /// Register or replace a product in the catalog.
    pub fn with_product(mut self, product_id: impl Into<String>, product: Product) -> Self {
        self.products.insert(product_id.into(), product);
        self
    }
}

fn default_products() -> HashMap<String, Product> {
    HashMap::from([
        ("credits_5".to_string(), Product::Credits(5)),
        ("credits_25".to_string(), Product::Credits(25)),
        ("credits_60".to_string(), Product::Credits(60)),
        ("gift_credits_15".to_string(), Product::GiftableCredits(15)),
        ("premium_monthly".to_string(), Product::Premium),
    ])
}

fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.daily_free_seconds, 1200);
        assert_eq!(config.seconds_per_credit, 360);
        assert_eq!(config.reward_unit_cost, 15);
        assert_eq!(config.skip_limit, 5);
        assert_eq!(config.session.low_time_warning_seconds, 180);
        assert_eq!(config.session.rating_min_seconds, 300);
        assert_eq!(config.session.rating_min_messages, 10);
        assert_eq!(config.recent_partner_window, Duration::from_secs(86_400));
        assert_eq!(config.search_timeout, Duration::from_secs(60));
        assert!(!config.ai_fallback);
    }

    #[test]
    fn test_env_override_and_invalid_value() {
        env::set_var("PAIRING_TEST_ONLY_VALUE", "42");
        assert_eq!(env_or("PAIRING_TEST_ONLY_VALUE", 7u64), 42);

        env::set_var("PAIRING_TEST_ONLY_VALUE", "not-a-number");
        assert_eq!(env_or("PAIRING_TEST_ONLY_VALUE", 7u64), 7);

        env::remove_var("PAIRING_TEST_ONLY_VALUE");
        assert_eq!(env_or("PAIRING_TEST_ONLY_VALUE", 7u64), 7);
    }

    #[test]
    fn test_with_product() {
        let config = EngineConfig::default().with_product("credits_100", Product::Credits(100));
        assert_eq!(config.products.get("credits_100"), Some(&Product::Credits(100)));
        assert_eq!(config.products.get("premium_monthly"), Some(&Product::Premium));
    }
}
