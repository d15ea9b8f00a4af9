// ⚙️ Configuration - warehouse.yml overlaid by ROASTERY_* environment variables

use crate::error::{EtlError, Result};
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;
use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "warehouse.yml";

/// Default SQLite file for the warehouse.
pub const DEFAULT_DATABASE_PATH: &str = "warehouse.db";

/// Environment variable prefix; `ROASTERY_SOURCES__SQUARE__ACCESS_TOKEN` sets
/// `sources.square.access_token`.
pub const ENV_PREFIX: &str = "ROASTERY";

/// Daily at 05:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 5 * * *";

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_PAGES: usize = 10_000;
pub const DEFAULT_INITIAL_LOOKBACK_DAYS: i64 = 30;
pub const DEFAULT_OVERLAP_MINUTES: i64 = 60;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub database: DatabaseConfig,
    pub reference: ReferenceConfig,
    pub retry: RetryPolicy,
    pub http: HttpConfig,
    pub sources: SourcesConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

/// Reference table CSVs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub items_csv: PathBuf,
    pub profiles_csv: PathBuf,
    /// Optional product-name alias table (`alias,zolo_id`)
    pub aliases_csv: Option<PathBuf>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            items_csv: PathBuf::from("reference/items.csv"),
            profiles_csv: PathBuf::from("reference/coffee_profiles.csv"),
            aliases_csv: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Runaway pagination guard, per extraction
    pub max_pages: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_pages: DEFAULT_MAX_PAGES,
            user_agent: format!("roastery-warehouse/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub square: SquareConfig,
    pub quickbooks: QuickbooksConfig,
    pub shopify: ShopifyConfig,
    pub cropster: CropsterConfig,
}

impl SourcesConfig {
    pub fn settings(&self, source: Source) -> &SourceSettings {
        match source {
            Source::Square => &self.square.settings,
            Source::Quickbooks => &self.quickbooks.settings,
            Source::Shopify => &self.shopify.settings,
            Source::Cropster => &self.cropster.settings,
        }
    }

    /// Sources with `enabled: true`, in declaration order
    pub fn enabled(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|source| self.settings(*source).enabled)
            .collect()
    }

    /// Configured base URL, or the public API host for the source
    pub fn base_url(&self, source: Source) -> Option<String> {
        let default = match source {
            Source::Square => Some("https://connect.squareup.com"),
            Source::Quickbooks => Some("https://quickbooks.api.intuit.com"),
            Source::Cropster => Some("https://c-sar.cropster.com"),
            // every shop has its own host
            Source::Shopify => None,
        };

        self.settings(source)
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| default.map(str::to_string))
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// Configured page size, or the size the source API is known to accept
    pub fn page_size(&self, source: Source) -> usize {
        let default = match source {
            Source::Square => 200,
            Source::Quickbooks => 25,
            Source::Shopify => 50,
            Source::Cropster => 100,
        };

        self.settings(source).page_size.unwrap_or(default)
    }
}

/// Settings every source shares
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub enabled: bool,
    /// Cron expression, 5 or 6 fields, UTC
    pub schedule: String,
    /// Window size of the first run when no watermark exists yet
    pub initial_lookback_days: i64,
    /// Re-read this much before the watermark to catch late updates
    pub overlap_minutes: i64,
    pub base_url: Option<String>,
    pub page_size: Option<usize>,
}

impl SourceSettings {
    pub fn initial_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.initial_lookback_days)
    }

    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.overlap_minutes)
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings {
            enabled: false,
            schedule: DEFAULT_SCHEDULE.to_string(),
            initial_lookback_days: DEFAULT_INITIAL_LOOKBACK_DAYS,
            overlap_minutes: DEFAULT_OVERLAP_MINUTES,
            base_url: None,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SquareConfig {
    #[serde(flatten)]
    pub settings: SourceSettings,
    pub access_token: String,
    pub location_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickbooksConfig {
    #[serde(flatten)]
    pub settings: SourceSettings,
    pub access_token: String,
    pub realm_id: String,
    pub minor_version: u32,
}

impl Default for QuickbooksConfig {
    fn default() -> Self {
        QuickbooksConfig {
            settings: SourceSettings::default(),
            access_token: String::new(),
            realm_id: String::new(),
            minor_version: 65,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopifyConfig {
    #[serde(flatten)]
    pub settings: SourceSettings,
    pub api_key: String,
    pub password: String,
    pub api_version: String,
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        ShopifyConfig {
            settings: SourceSettings::default(),
            api_key: String::new(),
            password: String::new(),
            api_version: "2024-01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropsterConfig {
    #[serde(flatten)]
    pub settings: SourceSettings,
    pub api_key: String,
    pub api_secret: String,
    pub group: String,
}

// ============================================================================
// Loading
// ============================================================================

impl WarehouseConfig {
    /// Load `path` (optional) then apply `ROASTERY_*` overrides, after `.env`.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WarehouseConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.max_pages == 0 {
            return Err(EtlError::Config("http.max_pages must be at least 1".to_string()));
        }

        for source in self.sources.enabled() {
            let settings = self.sources.settings(source);

            if self.sources.page_size(source) == 0 {
                return Err(EtlError::Config(format!(
                    "sources.{}.page_size must be at least 1",
                    source
                )));
            }
            if self.sources.base_url(source).is_none() {
                return Err(EtlError::Config(format!(
                    "sources.{}.base_url is required",
                    source
                )));
            }
            if settings.initial_lookback_days <= 0 || settings.overlap_minutes < 0 {
                return Err(EtlError::Config(format!(
                    "sources.{}: lookback must be positive and overlap non-negative",
                    source
                )));
            }
            crate::scheduler::parse_cron(&settings.schedule)?;
        }

        Ok(())
    }
}
