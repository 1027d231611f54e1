//! Store receipt verification seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An in-app purchase receipt as submitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Store the receipt came from (`apple`, `google`, ...).
    pub platform: String,
    /// Opaque receipt payload.
    pub payload: String,
}

/// What the store confirmed was bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPurchase {
    /// Catalog product id.
    pub product_id: String,
    /// Store transaction id.
    pub transaction_id: String,
}

/// Verifies receipts against the platform store.
///
/// Implementations return `PaymentRejected` for receipts the store refuses.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, user_id: &str, receipt: &PurchaseReceipt) -> Result<VerifiedPurchase>;
}
