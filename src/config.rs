use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::types::{AssetId, TxType};
use crate::market_data::adapters::retry::{ErrorClassifier, RetryPolicy};
use crate::market_data::normaliser::Normaliser;
use crate::market_data::scanner::ScannerConfig;

pub const ENV_PREFIX: &str = "XRPL_MD";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid { field, reason: reason.into() }
}

/// Runtime settings. Every field has a default, so an empty environment
/// yields a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rpc_endpoint_url: String,
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    pub backoff_base_seconds: f64,
    pub backoff_max_seconds: f64,
    pub backoff_jitter_ratio: f64,
    pub request_timeout_seconds: u64,
    pub bucket_width_seconds: i64,
    pub prefetch_depth: usize,
    pub transient_status_codes: Vec<u16>,
    pub transient_rpc_errors: Vec<String>,
    pub start_ledger_index: Option<u32>,
    pub end_ledger_index: Option<u32>,
    pub store_path: PathBuf,
    pub quote_preference: Vec<String>,
    pub bar_tx_types: Vec<TxType>,
    pub market_accounts: Vec<String>,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let classifier = ErrorClassifier::default();
        Self {
            rpc_endpoint_url: "https://xrplcluster.com/".into(),
            max_retry_attempts: retry.max_retries,
            backoff_base_seconds: retry.base_delay.as_secs_f64(),
            backoff_max_seconds: retry.max_delay.as_secs_f64(),
            backoff_jitter_ratio: 0.1,
            request_timeout_seconds: 30,
            bucket_width_seconds: 60,
            prefetch_depth: 4,
            transient_status_codes: classifier.transient_status_codes,
            transient_rpc_errors: classifier.transient_rpc_errors,
            start_ledger_index: None,
            end_ledger_index: None,
            store_path: PathBuf::from("data/xrpl-market-data"),
            quote_preference: vec!["XRP".into()],
            bar_tx_types: TxType::TRADES.to_vec(),
            market_accounts: Vec::new(),
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    /// Load from `./config` and the environment.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(Path::new("config"))
    }

    pub fn load_from(config_dir: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(config_dir.join("default")).required(false))
            // local overrides, not checked in
            .add_source(File::from(config_dir.join("local")).required(false))
            // e.g. XRPL_MD_RPC_ENDPOINT_URL, XRPL_MD_QUOTE_PREFERENCE=XRP,USD.rhub8...
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("transient_status_codes")
                    .with_list_parse_key("transient_rpc_errors")
                    .with_list_parse_key("quote_preference")
                    .with_list_parse_key("bar_tx_types")
                    .with_list_parse_key("market_accounts")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.rpc_endpoint_url.trim().is_empty() {
            return Err(invalid("rpc_endpoint_url", "must not be empty"));
        }
        if self.bucket_width_seconds <= 0 {
            return Err(invalid("bucket_width_seconds", format!("must be positive, got {}", self.bucket_width_seconds)));
        }
        if self.prefetch_depth == 0 {
            return Err(invalid("prefetch_depth", "must be at least 1"));
        }
        for (field, value) in [
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
            ("backoff_jitter_ratio", self.backoff_jitter_ratio),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("must be a non-negative number, got {}", value)));
            }
        }
        if self.backoff_max_seconds < self.backoff_base_seconds {
            return Err(invalid("backoff_max_seconds", "must not be below backoff_base_seconds"));
        }
        if let (Some(start), Some(end)) = (self.start_ledger_index, self.end_ledger_index) {
            if start > end {
                return Err(invalid("end_ledger_index", format!("{} is before start {}", end, start)));
            }
        }
        self.quote_assets()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_secs_f64(self.backoff_base_seconds),
            max_delay: Duration::from_secs_f64(self.backoff_max_seconds),
            jitter_ratio: self.backoff_jitter_ratio,
        }
    }

    pub fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier {
            transient_status_codes: self.transient_status_codes.clone(),
            transient_rpc_errors: self.transient_rpc_errors.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn quote_assets(&self) -> Result<Vec<AssetId>, SettingsError> {
        self.quote_preference
            .iter()
            .map(|s| s.parse::<AssetId>().map_err(|e| invalid("quote_preference", e.to_string())))
            .collect()
    }

    pub fn normaliser(&self) -> Result<Normaliser, SettingsError> {
        Ok(Normaliser::new(self.quote_assets()?, self.market_accounts.clone()))
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            start_ledger_index: self.start_ledger_index,
            end_ledger_index: self.end_ledger_index,
            prefetch_depth: self.prefetch_depth,
            bar_tx_types: self.bar_tx_types.clone(),
        }
    }
}
