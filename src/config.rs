// Configuration module - handles MongoDB connection and settings retrieval
//
// This module is responsible for:
// 1. Connecting to MongoDB using the provided connection string
// 2. Fetching monitor settings from the MonitorSettings collection by key
// 3. Filling in defaults for every field the document omits
// 4. Validating intervals, timeouts and the daily report time

use chrono::{Duration as ChronoDuration, NaiveTime};
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Collection holding one settings document per key
const SETTINGS_COLLECTION: &str = "MonitorSettings";

/// Format of `report_time`
const REPORT_TIME_FORMAT: &str = "%H:%M";

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MongoDB connection failed: {0}")]
    MongoConnectionError(#[from] mongodb::error::Error),

    #[error("Settings document not found for key: {0}")]
    SettingsNotFound(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Monitor configuration loaded from MongoDB
///
/// Every field except `key` may be omitted from the stored document.
///
/// # Example MongoDB Document
/// ```json
/// {
///   "key": "default",
///   "collection_interval_secs": 300,
///   "report_time": "00:00",
///   "metrics_period_secs": 300,
///   "metrics_lookback_hours": 3,
///   "daily_average_days": 7,
///   "reports_dir": "data/reports",
///   "aws_region": "eu-west-1",
///   "call_timeout_secs": 30,
///   "render_timeout_secs": 60,
///   "metrics_concurrency": 4
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Identifier of this settings document
    pub key: String,

    /// Seconds between collection cycles
    pub collection_interval_secs: u64,

    /// Local wall-clock time of the daily report run, `HH:MM`
    pub report_time: String,

    /// Granularity of metric queries in seconds
    pub metrics_period_secs: u32,

    /// How far back each collection cycle queries metrics
    pub metrics_lookback_hours: u32,

    /// Trailing days covered by the daily-average chart
    pub daily_average_days: u32,

    /// Root directory of the report tree
    pub reports_dir: PathBuf,

    pub aws_region: String,

    /// Upper bound for every individual API call
    pub call_timeout_secs: u64,

    /// Upper bound for rendering one report
    pub render_timeout_secs: u64,

    /// Clusters whose tasks and metrics are collected at the same time
    pub metrics_concurrency: usize,

    /// Browser binary; auto-detected when absent
    pub chrome_executable: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            key: "default".to_string(),
            collection_interval_secs: 300,
            report_time: "00:00".to_string(),
            metrics_period_secs: 300,
            metrics_lookback_hours: 3,
            daily_average_days: 7,
            reports_dir: PathBuf::from("data/reports"),
            aws_region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            call_timeout_secs: 30,
            render_timeout_secs: 60,
            metrics_concurrency: 4,
            chrome_executable: None,
        }
    }
}

impl MonitorSettings {
    /// Default settings identified by `key`
    pub fn defaults_for(key: &str) -> Self {
        MonitorSettings {
            key: key.to_string(),
            ..MonitorSettings::default()
        }
    }

    /// Parsed daily report time
    pub fn report_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.report_time, REPORT_TIME_FORMAT).map_err(|e| {
            ConfigError::InvalidSettings(format!(
                "report_time '{}' is not HH:MM: {}",
                self.report_time, e
            ))
        })
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    /// Metric query period in the signed form the metrics API expects
    pub fn metrics_period(&self) -> i32 {
        i32::try_from(self.metrics_period_secs).unwrap_or(i32::MAX)
    }

    pub fn metrics_lookback(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::from(self.metrics_lookback_hours))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    /// Rejects settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("collection_interval_secs", self.collection_interval_secs),
            ("metrics_period_secs", u64::from(self.metrics_period_secs)),
            ("metrics_lookback_hours", u64::from(self.metrics_lookback_hours)),
            ("daily_average_days", u64::from(self.daily_average_days)),
            ("call_timeout_secs", self.call_timeout_secs),
            ("render_timeout_secs", self.render_timeout_secs),
            ("metrics_concurrency", self.metrics_concurrency as u64),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidSettings(format!("{} must be positive", name)));
        }

        // Metric periods are whole minutes except for high-resolution series
        if self.metrics_period_secs % 60 != 0 {
            return Err(ConfigError::InvalidSettings(format!(
                "metrics_period_secs must be a multiple of 60, got {}",
                self.metrics_period_secs
            )));
        }

        self.report_time()?;
        Ok(())
    }
}

/// Configuration manager for the monitor
///
/// Handles MongoDB connection and settings retrieval.
/// This is the main entry point for configuration management.
pub struct ConfigManager {
    /// MongoDB client instance
    client: Client,

    /// Database name holding settings and all monitor collections
    database_name: String,
}

impl ConfigManager {
    /// Creates a new ConfigManager and establishes MongoDB connection
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Name of the database to use (optional, defaults to "monitoring")
    ///
    /// # Returns
    /// * `Ok(ConfigManager)` - Successfully connected to MongoDB
    /// * `Err(ConfigError)` - Connection failed
    pub async fn new(
        connection_string: &str,
        database_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let client = Client::with_uri_str(connection_string).await?;

        // Verify connection by listing databases (lightweight operation)
        match client.list_database_names(None, None).await {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => {
                warn!("MongoDB connection verification failed: {}", e);
                return Err(ConfigError::MongoConnectionError(e));
            }
        }

        let database_name = database_name.unwrap_or("monitoring").to_string();

        Ok(ConfigManager {
            client,
            database_name,
        })
    }

    fn get_database(&self) -> Database {
        self.client.database(&self.database_name)
    }

    /// Fetches monitor settings from MongoDB for a specific key
    ///
    /// # Returns
    /// * `Ok(MonitorSettings)` - Loaded and validated settings
    /// * `Err(ConfigError::SettingsNotFound)` - No document with this key
    /// * `Err(ConfigError::InvalidSettings)` - The document failed validation
    ///
    /// # MongoDB Query
    /// Executes: `db.MonitorSettings.findOne({ key: "<key>" })`
    pub async fn load_settings(&self, key: &str) -> Result<MonitorSettings, ConfigError> {
        info!("Loading monitor settings for key: {}", key);

        let collection: Collection<MonitorSettings> =
            self.get_database().collection(SETTINGS_COLLECTION);
        let filter = mongodb::bson::doc! { "key": key };

        match collection.find_one(filter, None).await? {
            Some(settings) => {
                settings.validate()?;
                info!(
                    "Loaded settings: collect every {}s, report at {}, {} day averages, reports in '{}'",
                    settings.collection_interval_secs,
                    settings.report_time,
                    settings.daily_average_days,
                    settings.reports_dir.display()
                );
                Ok(settings)
            }
            None => {
                warn!("No settings found for key: {}", key);
                Err(ConfigError::SettingsNotFound(key.to_string()))
            }
        }
    }

    /// Returns a reference to the MongoDB client
    ///
    /// Used by the storage module for all monitor collections
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }
}
