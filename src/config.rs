use crate::catalog::{ReconcileSettings, SellerProfile};
use crate::llm::LlmConfig;
use crate::store::PgStoreSettings;
use std::{collections::HashSet, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported LLM_PROVIDER `{0}` (expected `tensorzero` or `none`)")]
    UnknownProvider(String),

    #[error("cannot read sellers file {path}")]
    SellersFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sellers file is not a valid seller list")]
    SellersParse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub store: PgStoreSettings,
}

#[derive(Debug, Clone)]
pub enum LlmProvider {
    None,
    TensorZero(LlmConfig),
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Shell command producing the export. Without it the export is read as-is.
    pub command: Option<String>,
    pub workdir: Option<PathBuf>,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database: Option<DatabaseConfig>,
    pub reconcile: ReconcileSettings,
    pub llm: LlmProvider,
    pub llm_batch_size: usize,
    pub scraper: ScraperConfig,
    pub sellers_file: Option<PathBuf>,
    pub schedule_interval: Option<Duration>,
    pub api_keys: String,
    pub metrics_key: Option<String>,
    pub run_history_limit: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let secs = |key: &str, default: u64| Duration::from_secs(number(key, default));
        let flag = |key: &str| {
            text(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
                .unwrap_or(false)
        };

        let reconcile = ReconcileSettings {
            batch_size: number("RECONCILE_BATCH_SIZE", 500) as usize,
            batch_timeout: secs("BATCH_TIMEOUT_SECS", 60),
            finalize_timeout: secs("FINALIZE_TIMEOUT_SECS", 30),
        };

        let database = text("DATABASE_URL").map(|url| DatabaseConfig {
            url,
            store: PgStoreSettings {
                max_connections: number("DB_MAX_CONNS", 8) as u32,
                acquire_timeout: secs("ACQUIRE_TIMEOUT_SECS", 10),
                batch_statement_timeout: reconcile.batch_timeout,
                finalize_statement_timeout: reconcile.finalize_timeout,
                auto_migrate: flag("AUTO_MIGRATE"),
            },
        });

        let llm = match text("LLM_PROVIDER").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("none") => LlmProvider::None,
            Some("tensorzero") => LlmProvider::TensorZero(LlmConfig::from_lookup(&lookup)),
            Some(other) => return Err(ConfigError::UnknownProvider(other.to_string())),
        };

        Ok(Self {
            port: text("PORT").and_then(|v| v.parse().ok()).unwrap_or(8000),
            database,
            reconcile,
            llm,
            llm_batch_size: number("LLM_BATCH_SIZE", 20) as usize,
            scraper: ScraperConfig {
                command: text("SCRAPER_COMMAND"),
                workdir: text("SCRAPER_WORKDIR").map(PathBuf::from),
                output: text("SCRAPER_OUTPUT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("products.json")),
            },
            sellers_file: text("SELLERS_FILE").map(PathBuf::from),
            schedule_interval: text("SCHEDULE_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            api_keys: text("CATALOG_API_KEYS").unwrap_or_default(),
            metrics_key: text("METRICS_KEY"),
            run_history_limit: number("RUN_HISTORY_LIMIT", 50) as usize,
        })
    }
}

/// Loads the seller seed list: a YAML sequence of `{phone, name?, city?, catalogue_url?}`.
/// Entries without a phone are dropped; repeated phones keep the first entry.
pub async fn load_sellers(path: &std::path::Path) -> Result<Vec<SellerProfile>, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::SellersFile {
            path: path.to_path_buf(),
            source,
        })?;
    parse_sellers(&raw)
}

fn parse_sellers(raw: &str) -> Result<Vec<SellerProfile>, ConfigError> {
    let entries: Vec<SellerProfile> = serde_yaml::from_str(raw)?;
    let mut seen = HashSet::new();
    let mut sellers = Vec::with_capacity(entries.len());
    for mut entry in entries {
        entry.phone = entry.phone.trim().to_string();
        if entry.phone.is_empty() {
            warn!(target = "catalog.config", "ignored seller entry without phone");
            continue;
        }
        if seen.insert(entry.phone.clone()) {
            sellers.push(entry);
        }
    }
    Ok(sellers)
}
