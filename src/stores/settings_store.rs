/// Wallet configuration
/// Loaded from JSON (text or file); every field has a default so partial
/// documents are accepted.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::stores::cashu::errors::{CashuResult, CashuWalletError};
use crate::stores::cashu::fees::FeePolicy;
use crate::stores::cashu::proofs::ProofStoreConfig;
use crate::stores::cashu::types::CurrencyUnit;
use crate::stores::cashu::utils::normalize_mint_url;

/// Exact-match search is exponential in the candidate count
const MAX_EXACT_MATCH_LIMIT: usize = 24;

/// Current settings schema version
const SETTINGS_VERSION: u32 = 1;

/// Wallet settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalletSettings {
    /// Mint used when an operation does not name one
    pub default_mint: String,
    pub unit: CurrencyUnit,
    /// Mints whose tokens `receive_tokens` accepts
    pub trusted_mints: Vec<String>,
    pub network_timeout_secs: u64,
    /// Reservations older than this are released by the watchdog
    pub reservation_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
    /// Used when the mint omits a quote expiry
    pub quote_ttl_secs: u64,
    /// Terminal quotes are kept this long for audit
    pub quote_retention_secs: u64,
    pub dust_threshold: u64,
    pub input_fee_ppk: u64,
    pub exact_match_limit: usize,
    pub read_retry_attempts: u32,
    pub read_retry_base_delay_ms: u64,
    pub version: u32, // Settings schema version
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            default_mint: String::new(),
            unit: CurrencyUnit::Sat,
            trusted_mints: Vec::new(),
            network_timeout_secs: 30,
            reservation_timeout_secs: 300,
            watchdog_interval_secs: 30,
            quote_ttl_secs: 600,
            quote_retention_secs: 7 * 24 * 60 * 60,
            dust_threshold: 2,
            input_fee_ppk: 0,
            exact_match_limit: 20,
            read_retry_attempts: 3,
            read_retry_base_delay_ms: 200,
            version: SETTINGS_VERSION,
        }
    }
}

impl WalletSettings {
    /// Settings for a single mint, everything else defaulted
    pub fn for_mint(mint_url: &str) -> Self {
        Self {
            default_mint: normalize_mint_url(mint_url),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> CashuResult<Self> {
        let mut settings: Self = serde_json::from_str(json)
            .map_err(|e| CashuWalletError::InvalidConfig(format!("Parse error: {}", e)))?;
        settings.normalize();
        settings.validate()?;
        log::info!(
            "Loaded wallet settings (default mint {}, {} trusted mints)",
            settings.default_mint,
            settings.trusted_mints.len()
        );
        Ok(settings)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> CashuResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CashuWalletError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> CashuResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CashuWalletError::Internal(format!("Failed to serialize settings: {}", e)))
    }

    /// Normalize mint URLs and make the default mint trusted
    pub fn normalize(&mut self) {
        if !self.default_mint.trim().is_empty() {
            self.default_mint = normalize_mint_url(&self.default_mint);
        }
        let mut trusted: Vec<String> = self
            .trusted_mints
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(|m| normalize_mint_url(m))
            .collect();
        if !self.default_mint.is_empty() && !trusted.contains(&self.default_mint) {
            trusted.insert(0, self.default_mint.clone());
        }
        trusted.dedup();
        self.trusted_mints = trusted;
    }

    pub fn validate(&self) -> CashuResult<()> {
        if self.default_mint.trim().is_empty() {
            return Err(CashuWalletError::InvalidConfig("default_mint is empty".to_string()));
        }
        let timeouts = [
            ("network_timeout_secs", self.network_timeout_secs),
            ("reservation_timeout_secs", self.reservation_timeout_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("quote_ttl_secs", self.quote_ttl_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(CashuWalletError::InvalidConfig(format!("{} must be non-zero", name)));
        }
        if self.exact_match_limit > MAX_EXACT_MATCH_LIMIT {
            return Err(CashuWalletError::InvalidConfig(format!(
                "exact_match_limit {} exceeds {}",
                self.exact_match_limit, MAX_EXACT_MATCH_LIMIT
            )));
        }
        Ok(())
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn read_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_base_delay_ms)
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::new(self.input_fee_ppk, self.dust_threshold)
    }

    pub fn proof_store_config(&self) -> ProofStoreConfig {
        ProofStoreConfig {
            fee_policy: self.fee_policy(),
            exact_match_limit: self.exact_match_limit,
            reservation_timeout_secs: self.reservation_timeout_secs,
        }
    }
}

/// Settings for the edge admission policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GatewaySettings {
    /// Comma separated, matched case-insensitively
    pub denylisted_emails: String,
    pub require_email_verified: bool,
}

impl GatewaySettings {
    pub fn denylist(&self) -> Vec<String> {
        self.denylisted_emails
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}
