//! Ledger configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Account used when a tenant has no mapping and no per-tenant fallback.
    pub unmapped_account_id: String,
    /// Largest absolute difference still reported as reconciled (exclusive).
    pub reconciliation_tolerance: Decimal,
    /// Lifetime of cached mapping lookups.
    pub mapping_cache_ttl_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            unmapped_account_id: "9999".to_string(),
            reconciliation_tolerance: Decimal::new(1, 2),
            mapping_cache_ttl_secs: 60,
        }
    }
}

impl LedgerConfig {
    pub fn mapping_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.mapping_cache_ttl_secs)
    }
}
