pub mod detector;
pub mod liveness;
pub mod maintenance;
pub mod pipeline;
pub mod policy;
pub mod window;

use bitcoin::Amount;

use policy::Verdict;

/// A confirmed transaction as delivered by the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    pub hash: String,
    pub total_output_value: Amount,
    pub fee: Amount,
    pub block_height: u64,
    pub is_coinbase: bool,
}

impl TxRecord {
    /// Size used for detection, in whole coins.
    pub fn size(&self) -> f64 {
        self.total_output_value.to_btc()
    }
}

/// A notable transaction handed to the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSummary {
    pub hash: String,
    /// Total output value in whole coins.
    pub amount: f64,
    pub fee: f64,
    pub block_height: u64,
    pub verdict: Verdict,
}

impl TransactionSummary {
    pub fn new(tx: &TxRecord, verdict: Verdict) -> Self {
        Self {
            hash: tx.hash.clone(),
            amount: tx.size(),
            fee: tx.fee.to_btc(),
            block_height: tx.block_height,
            verdict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid transaction size {0}: must be finite and non-negative")]
pub struct InvalidSize(pub f64);

/// Sizes entering the window must be finite and non-negative. Zero is allowed.
pub fn validate_size(size: f64) -> Result<f64, InvalidSize> {
    if size.is_finite() && size >= 0.0 {
        Ok(size)
    } else {
        Err(InvalidSize(size))
    }
}
