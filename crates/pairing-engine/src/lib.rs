//! Session time accounting and matchmaking for anonymous metered chat.
//!
//! This crate provides the [`SessionManager`] which pairs concurrently
//! searching users and meters their chat time against a daily free
//! allowance, purchased time and premium subscriptions.
//!
//! # Features
//!
//! - Atomic pairing: a compare-and-set over both tickets, never double-booked
//! - Free-before-paid time meters copied into each session at start
//! - Preserved leftovers so an early close resumes from the exact balance
//! - Idempotent daily reset, applied lazily or by a sweep job
//! - Skip counting with an ad gate for non-premium users
//! - Credits, gifting between users, and receipt redemption
//!
//! # Architecture
//!
//! ```text
//! find_partner(user)
//!          ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SESSION MANAGER                         │
//! │                                                             │
//! │  1. Check balance (TimeLedger) and ad gate (SkipGate)       │
//! │         ↓                                                   │
//! │  2. Enqueue ticket (MatchmakingQueue)                       │
//! │         ↓                                                   │
//! │  3. Poll: attempt_match → pair (CAS)                        │
//! │     • lost race → re-scan                                   │
//! │     • timeout → cancel (or AI fallback)                     │
//! │         ↓                                                   │
//! │  4. start: snapshot both ledgers in one transaction         │
//! │         ↓                                                   │
//! │  5. tick / close / skip / block / report                    │
//! │         ↓                                                   │
//! │  6. settle: commit usage, preserve leftovers, archive       │
//! └─────────────────────────────────────────────────────────────┘
//!          ↓
//!   AccountStore (in-memory or SQLite)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pairing_engine::{
//!     Account, EngineConfig, InMemoryAccountStore, LoggingSink, MatchmakingQueue,
//!     SessionManager, SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryAccountStore::new());
//!     store.insert(Account::new("alice", chrono::Utc::now())).await?;
//!
//!     let manager = SessionManager::new(
//!         store,
//!         Arc::new(MatchmakingQueue::new()),
//!         Arc::new(SystemClock),
//!         Arc::new(LoggingSink),
//!         EngineConfig::from_env(),
//!     );
//!
//!     let session = manager.find_partner("alice").await?;
//!     println!("Chatting in {}", session.id);
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod error;
mod ledger;
mod manager;
mod model;
mod notify;
mod payment;
mod queue;
mod registry;
mod retry;
mod session;
mod skip_gate;
mod store;
mod wallet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, Product, RetryPolicy, SessionPolicy, DAILY_FREE_LIMIT, LOW_TIME_WARNING_SECONDS,
    RATING_MIN_MESSAGES, RATING_MIN_SECONDS, RECENT_PARTNER_WINDOW, REWARD_UNIT_COST,
    SECONDS_PER_CREDIT, SKIP_LIMIT,
};
pub use error::{EngineError, Result};
pub use ledger::TimeLedger;
pub use manager::SessionManager;
pub use model::{Account, Allowance, Participant, Role, SkipAttemptState, UserId};
pub use notify::{LoggingSink, NoOpSink, Notification, NotificationSink};
pub use payment::{PaymentVerifier, PurchaseReceipt, VerifiedPurchase};
pub use queue::{CancelOutcome, MatchmakingQueue, MatchmakingTicket, Pairing, TicketId, TicketStatus};
pub use registry::SessionRegistry;
pub use retry::transact_with_retry;
pub use session::{ChatSession, CloseReason, SessionId, SessionState, TickEvent, TimeMeter};
pub use skip_gate::{SkipGate, SkipOutcome};
pub use store::{AccountStore, InMemoryAccountStore, SqliteAccountStore, TransactFn};
pub use wallet::CreditWallet;
