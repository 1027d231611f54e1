use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::model::{Account, UserId};
use crate::store::AccountStore;

/// Run a store transaction, retrying with exponential backoff when it fails
/// with a retriable error. Other errors are returned immediately.
///
/// `f` may run more than once, each time against a fresh snapshot, so it must
/// not carry state between attempts other than what it recomputes.
pub async fn transact_with_retry<F>(
    store: &dyn AccountStore,
    ids: &[UserId],
    policy: RetryPolicy,
    mut f: F,
) -> Result<Vec<Account>>
where
    F: FnMut(&mut [Account]) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        match store.transact(ids, Box::new(&mut f)).await {
            Ok(accounts) => return Ok(accounts),
            Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                let delay = policy
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt as u32));
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transaction conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
