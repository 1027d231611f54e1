//! Daily reset sweeper for the pairing engine.
//!
//! Accounts are reset lazily on their next session, so this job is only
//! needed to keep stored balances current for reporting and to prune old
//! entries from the session archive.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use database::{account, chat_session, Database};
use pairing_engine::{EngineConfig, SqliteAccountStore, TimeLedger};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reset-sweeper")]
#[command(about = "Apply due daily resets and prune archived chat sessions")]
struct Args {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:data/pairing.db?mode=rwc")]
    database_url: String,

    /// Seconds between sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    interval_secs: u64,

    /// Keep archived sessions for this many days (0 disables pruning)
    #[arg(long, env = "ARCHIVE_RETENTION_DAYS", default_value_t = 30)]
    retention_days: u64,

    /// Run one sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reset_sweeper=info,pairing_engine=info")),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env();

    let db = Database::connect(&args.database_url).await?;
    db.migrate().await?;

    let sweeper = Sweeper {
        store: SqliteAccountStore::new(db.clone()),
        ledger: TimeLedger::new(config.daily_free_seconds),
        config,
        retention: Duration::from_secs(args.retention_days.saturating_mul(86_400)),
    };

    if args.once {
        sweeper.run(Utc::now()).await?;
        db.close().await;
        return Ok(());
    }

    info!(interval_secs = args.interval_secs, "Starting reset sweeper");
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweeper.run(Utc::now()).await {
                    error!("Sweep failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    db.close().await;
    Ok(())
}

struct Sweeper {
    store: SqliteAccountStore,
    ledger: TimeLedger,
    config: EngineConfig,
    retention: Duration,
}

impl Sweeper {
    async fn run(&self, now: DateTime<Utc>) -> Result<(), Box<dyn std::error::Error>> {
        let pool = self.store.database().pool();

        let today = now.format("%Y-%m-%d").to_string();
        let due = account::list_accounts_due_for_reset(pool, &today).await?;
        if due.is_empty() {
            info!("No accounts due for reset");
        } else {
            info!(due = due.len(), "Sweeping daily resets");
            self.ledger
                .sweep_daily_resets(&self.store, now, self.config.retry)
                .await?;
        }

        if self.retention.is_zero() {
            return Ok(());
        }
        // Archived sessions feed partner exclusion; never prune inside that window.
        let keep = self.retention.max(self.config.recent_partner_window);
        let Some(cutoff) = chrono::Duration::from_std(keep)
            .ok()
            .and_then(|keep| now.checked_sub_signed(keep))
        else {
            warn!("Retention period out of range, skipping prune");
            return Ok(());
        };

        let before = cutoff.to_rfc3339_opts(SecondsFormat::Secs, true);
        let removed = chat_session::prune_sessions(pool, &before).await?;
        if removed > 0 {
            info!(removed, before = %before, "Pruned archived sessions");
        }
        Ok(())
    }
}
