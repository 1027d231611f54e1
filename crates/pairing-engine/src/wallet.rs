//! Credits, giftable credits and their conversion into paid time.
//!
//! Balance rules live in associated functions over a plain [`Account`]; the
//! async methods run them inside store transactions so concurrent purchases
//! and gifts never clobber each other.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{EngineConfig, Product, RetryPolicy};
use crate::error::{EngineError, Result};
use crate::ledger::TimeLedger;
use crate::model::{Account, UserId};
use crate::notify::{deliver, Notification, NotificationSink};
use crate::payment::{PaymentVerifier, PurchaseReceipt};
use crate::retry::transact_with_retry;
use crate::store::AccountStore;

/// Spendable and giftable credit balances.
pub struct CreditWallet {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    ledger: TimeLedger,
    seconds_per_credit: u64,
    reward_unit_cost: u64,
    retry: RetryPolicy,
    products: HashMap<String, Product>,
}

impl CreditWallet {
    pub fn new(
        store: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            ledger: TimeLedger::new(config.daily_free_seconds),
            seconds_per_credit: config.seconds_per_credit,
            reward_unit_cost: config.reward_unit_cost,
            retry: config.retry,
            products: config.products.clone(),
        }
    }

    /// Paid seconds granted per credit.
    pub fn seconds_per_credit(&self) -> u64 {
        self.seconds_per_credit
    }

    // ========================================================================
    // Balance rules
    // ========================================================================

    /// Add purchased credits.
    pub fn apply_purchase(account: &mut Account, credits: u64) {
        account.credits = account.credits.saturating_add(credits);
    }

    /// Remove spendable credits, failing without effect if the balance is short.
    pub fn debit_credits(account: &mut Account, credits: u64) -> Result<()> {
        if account.credits < credits {
            return Err(EngineError::InsufficientCredits {
                required: credits,
                available: account.credits,
            });
        }
        account.credits -= credits;
        Ok(())
    }

    /// Move giftable credits from a premium sender to the receiver's
    /// spendable balance.
    pub fn transfer_gift(from: &mut Account, to: &mut Account, credits: u64) -> Result<()> {
        if !from.is_premium {
            return Err(EngineError::NotPremium);
        }
        if from.giftable_credits < credits {
            return Err(EngineError::InsufficientGiftableCredits {
                required: credits,
                available: from.giftable_credits,
            });
        }
        from.giftable_credits -= credits;
        to.credits = to.credits.saturating_add(credits);
        Ok(())
    }

    /// Spend whole reward units out of the giftable balance. The remainder
    /// stays giftable.
    pub fn split_giftable(account: &mut Account, unit_cost: u64) -> Result<u64> {
        if unit_cost == 0 {
            return Err(EngineError::InvalidRequest(
                "reward unit cost must be positive".to_string(),
            ));
        }
        let rewards = account.giftable_credits / unit_cost;
        account.giftable_credits -= rewards * unit_cost;
        Ok(rewards)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Credit a verified purchase.
    pub async fn purchase(&self, user_id: &str, credits: u64) -> Result<Account> {
        require_positive(credits, "purchase")?;
        let now = self.clock.now();
        let ids = [user_id.to_string()];

        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            self.ledger.apply_daily_reset(&mut accounts[0], now);
            Self::apply_purchase(&mut accounts[0], credits);
            Ok(())
        })
        .await?;

        info!("Purchased {} credits for {}", credits, user_id);
        Ok(accounts.remove(0))
    }

    /// Spend credits on paid time. Returns the account and seconds granted.
    ///
    /// The debit commits on its own before the time is added; if the second
    /// step fails the credits stay spent.
    pub async fn convert_credits_to_time(
        &self,
        user_id: &str,
        credits: u64,
    ) -> Result<(Account, u64)> {
        require_positive(credits, "conversion")?;
        let seconds = credits.checked_mul(self.seconds_per_credit).ok_or_else(|| {
            EngineError::InvalidRequest(format!("{} credits overflow the time balance", credits))
        })?;
        let ids = [user_id.to_string()];

        transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            Self::debit_credits(&mut accounts[0], credits)
        })
        .await?;

        let now = self.clock.now();
        let result = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            self.ledger.apply_daily_reset(&mut accounts[0], now);
            self.ledger.extend(&mut accounts[0], seconds);
            Ok(())
        })
        .await;

        match result {
            Ok(mut accounts) => {
                info!(
                    "Converted {} credits into {}s for {}",
                    credits, seconds, user_id
                );
                Ok((accounts.remove(0), seconds))
            }
            Err(e) => {
                warn!(
                    "Debited {} credits from {} but extension failed: {}",
                    credits, user_id, e
                );
                Err(e)
            }
        }
    }

    /// Gift credits from a premium sender's giftable balance. Both accounts
    /// change in one transaction or neither does.
    pub async fn gift(&self, from: &str, to: &str, credits: u64) -> Result<(Account, Account)> {
        require_positive(credits, "gift")?;
        if from == to {
            return Err(EngineError::InvalidRequest(
                "cannot gift credits to yourself".to_string(),
            ));
        }
        let ids = [from.to_string(), to.to_string()];

        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            let (sender, receiver) = accounts.split_at_mut(1);
            Self::transfer_gift(&mut sender[0], &mut receiver[0], credits)
        })
        .await?;

        info!("{} gifted {} credits to {}", from, credits, to);
        deliver(
            self.notifier.as_ref(),
            Notification::CreditGift {
                from: from.to_string(),
                to: to.to_string(),
                credits,
            },
        )
        .await;

        let receiver = accounts.remove(1);
        let sender = accounts.remove(0);
        Ok((sender, receiver))
    }

    /// Convert giftable credits into reward units at the configured cost.
    pub async fn convert_giftable_to_rewards(&self, user_id: &str) -> Result<(Account, u64)> {
        let ids = [user_id.to_string()];
        let unit_cost = self.reward_unit_cost;
        let mut rewards = 0;

        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            rewards = Self::split_giftable(&mut accounts[0], unit_cost)?;
            Ok(())
        })
        .await?;

        if rewards > 0 {
            info!("Granted {} reward(s) to {}", rewards, user_id);
        }
        Ok((accounts.remove(0), rewards))
    }

    /// Verify a store receipt and apply the product it bought.
    pub async fn redeem_purchase(
        &self,
        user_id: &str,
        verifier: &dyn PaymentVerifier,
        receipt: &PurchaseReceipt,
    ) -> Result<(Account, Product)> {
        let verified = verifier.verify(user_id, receipt).await?;
        let product = *self
            .products
            .get(&verified.product_id)
            .ok_or_else(|| EngineError::UnknownProduct(verified.product_id.clone()))?;
        let now = self.clock.now();
        let ids = [user_id.to_string()];

        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            let account = &mut accounts[0];
            self.ledger.apply_daily_reset(account, now);
            match product {
                Product::Credits(credits) => Self::apply_purchase(account, credits),
                Product::GiftableCredits(credits) => {
                    account.giftable_credits = account.giftable_credits.saturating_add(credits);
                }
                Product::Premium => account.is_premium = true,
            }
            Ok(())
        })
        .await?;

        info!(
            "Redeemed {} ({}) for {}",
            verified.product_id, verified.transaction_id, user_id
        );
        Ok((accounts.remove(0), product))
    }

    /// Activate or lapse a premium subscription.
    pub async fn set_premium(&self, user_id: &str, is_premium: bool) -> Result<Account> {
        let ids: [UserId; 1] = [user_id.to_string()];
        let mut accounts = transact_with_retry(self.store.as_ref(), &ids, self.retry, |accounts| {
            accounts[0].is_premium = is_premium;
            Ok(())
        })
        .await?;

        info!("Premium for {} set to {}", user_id, is_premium);
        Ok(accounts.remove(0))
    }
}

fn require_positive(credits: u64, what: &str) -> Result<()> {
    if credits == 0 {
        return Err(EngineError::InvalidRequest(format!(
            "{} amount must be positive",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::RecordingSink;
    use crate::payment::VerifiedPurchase;
    use crate::store::InMemoryAccountStore;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Fixture {
        wallet: CreditWallet,
        store: Arc<InMemoryAccountStore>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture(accounts: Vec<Account>) -> Fixture {
        let store = Arc::new(InMemoryAccountStore::new());
        for account in accounts {
            store.insert(account).await.unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let wallet = CreditWallet::new(
            store.clone(),
            Arc::new(SystemClock),
            sink.clone(),
            &EngineConfig::default(),
        );
        Fixture { wallet, store, sink }
    }

    fn account(id: &str) -> Account {
        Account::new(id, Utc::now())
    }

    struct FixedVerifier(&'static str);

    #[async_trait]
    impl PaymentVerifier for FixedVerifier {
        async fn verify(&self, _user_id: &str, receipt: &PurchaseReceipt) -> Result<VerifiedPurchase> {
            if receipt.payload.is_empty() {
                return Err(EngineError::PaymentRejected("empty receipt".to_string()));
            }
            Ok(VerifiedPurchase {
                product_id: self.0.to_string(),
                transaction_id: "txn-1".to_string(),
            })
        }
    }

    fn receipt(payload: &str) -> PurchaseReceipt {
        PurchaseReceipt {
            platform: "test".to_string(),
            payload: payload.to_string(),
        }
    }

    // ========================================================================
    // Balance rules
    // ========================================================================

    #[test]
    fn test_debit_requires_balance() {
        let mut alice = account("alice");
        alice.credits = 3;
        let result = CreditWallet::debit_credits(&mut alice, 4);
        assert!(matches!(
            result,
            Err(EngineError::InsufficientCredits {
                required: 4,
                available: 3
            })
        ));
        assert_eq!(alice.credits, 3);
    }

    #[test]
    fn test_split_giftable_keeps_remainder() {
        let mut alice = account("alice");
        alice.giftable_credits = 47;
        assert_eq!(CreditWallet::split_giftable(&mut alice, 15).unwrap(), 3);
        assert_eq!(alice.giftable_credits, 2);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tokio::test]
    async fn test_convert_credits_to_time() {
        let mut alice = account("alice");
        alice.credits = 25;
        let f = fixture(vec![alice]).await;

        let (updated, seconds) = f.wallet.convert_credits_to_time("alice", 5).await.unwrap();
        assert_eq!(updated.credits, 20);
        assert_eq!(seconds, 1800);
        assert_eq!(updated.paid_seconds_available, 1800);
    }

    #[tokio::test]
    async fn test_convert_without_credits_changes_nothing() {
        let f = fixture(vec![account("alice")]).await;

        let result = f.wallet.convert_credits_to_time("alice", 1).await;
        assert!(matches!(result, Err(EngineError::InsufficientCredits { .. })));
        assert_eq!(f.store.get("alice").await.unwrap().paid_seconds_available, 0);

        let zero = f.wallet.convert_credits_to_time("alice", 0).await;
        assert!(matches!(zero, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_gift_requires_premium_and_balance() {
        let mut alice = account("alice");
        alice.giftable_credits = 10;
        let f = fixture(vec![alice, account("bob")]).await;

        let result = f.wallet.gift("alice", "bob", 5).await;
        assert!(matches!(result, Err(EngineError::NotPremium)));

        f.wallet.set_premium("alice", true).await.unwrap();
        let result = f.wallet.gift("alice", "bob", 11).await;
        assert!(matches!(
            result,
            Err(EngineError::InsufficientGiftableCredits { .. })
        ));
        assert_eq!(f.store.get("alice").await.unwrap().giftable_credits, 10);
        assert_eq!(f.store.get("bob").await.unwrap().credits, 0);
        assert!(f.sink.received().is_empty());

        let (sender, receiver) = f.wallet.gift("alice", "bob", 6).await.unwrap();
        assert_eq!(sender.giftable_credits, 4);
        assert_eq!(receiver.credits, 6);
        assert_eq!(
            f.sink.received(),
            vec![Notification::CreditGift {
                from: "alice".to_string(),
                to: "bob".to_string(),
                credits: 6,
            }]
        );
    }

    #[tokio::test]
    async fn test_gift_to_self_rejected() {
        let f = fixture(vec![account("alice").with_premium(true)]).await;
        let result = f.wallet.gift("alice", "alice", 1).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_convert_giftable_to_rewards() {
        let mut alice = account("alice");
        alice.giftable_credits = 31;
        let f = fixture(vec![alice]).await;

        let (updated, rewards) = f.wallet.convert_giftable_to_rewards("alice").await.unwrap();
        assert_eq!(rewards, 2);
        assert_eq!(updated.giftable_credits, 1);
    }

    #[tokio::test]
    async fn test_redeem_purchase() {
        let f = fixture(vec![account("alice")]).await;

        let (updated, product) = f
            .wallet
            .redeem_purchase("alice", &FixedVerifier("credits_25"), &receipt("ok"))
            .await
            .unwrap();
        assert_eq!(product, Product::Credits(25));
        assert_eq!(updated.credits, 25);

        let (updated, _) = f
            .wallet
            .redeem_purchase("alice", &FixedVerifier("premium_monthly"), &receipt("ok"))
            .await
            .unwrap();
        assert!(updated.is_premium);

        let unknown = f
            .wallet
            .redeem_purchase("alice", &FixedVerifier("mystery_box"), &receipt("ok"))
            .await;
        assert!(matches!(unknown, Err(EngineError::UnknownProduct(id)) if id == "mystery_box"));

        let rejected = f
            .wallet
            .redeem_purchase("alice", &FixedVerifier("credits_5"), &receipt(""))
            .await;
        assert!(matches!(rejected, Err(EngineError::PaymentRejected(_))));
        assert_eq!(f.store.get("alice").await.unwrap().credits, 25);
    }

    #[tokio::test]
    async fn test_concurrent_purchases_do_not_clobber() {
        let f = fixture(vec![account("alice")]).await;
        let wallet = Arc::new(f.wallet);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let wallet = wallet.clone();
            handles.push(tokio::spawn(async move {
                wallet.purchase("alice", 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(f.store.get("alice").await.unwrap().credits, 10);
    }
}
