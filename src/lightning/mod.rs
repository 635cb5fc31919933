use anyhow::{anyhow, Result};
use lightning_invoice::Bolt11Invoice;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Newtype wrapper around Bolt11Invoice for convenience methods
#[derive(Debug, Clone)]
pub struct Invoice(Bolt11Invoice);

impl FromStr for Invoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s)
            .map(Self)
            .map_err(|e| anyhow!("Invalid invoice: {}", e))
    }
}

impl Invoice {
    /// Invoice amount in millisatoshi. The encoding already folds plain
    /// satoshi amounts into this.
    pub fn amount_msats(&self) -> Result<u64> {
        self.0
            .amount_milli_satoshis()
            .ok_or_else(|| anyhow!("Invoice must have an amount"))
    }

    pub fn is_expired_at(&self, unix_now: i64) -> bool {
        self.0
            .would_expire(Duration::from_secs(unix_now.max(0) as u64))
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
