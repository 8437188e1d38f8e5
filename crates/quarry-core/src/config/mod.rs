//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Quarry search configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Application database file; `None` uses the platform config directory
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

/// Which search engine the deployment should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineSetting {
    /// Use the app-database index when the store supports it
    #[default]
    Auto,
    /// Require the app-database index
    AppDb,
    /// Always scan live tables
    InPlace,
}

impl EngineSetting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::AppDb => "app_db",
            Self::InPlace => "in_place",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "app_db" | "appdb" => Some(Self::AppDb),
            "in_place" | "in-place" | "inplace" => Some(Self::InPlace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub engine: EngineSetting,
    /// Deepest rank a page can reach once permissions are applied
    pub max_candidates: usize,
    pub ingestion: IngestionConfig,
    pub retry: RetryConfig,
    pub ranking: RankingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionModeSetting {
    Sync,
    #[default]
    Batched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub mode: IngestionModeSetting,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per index write, including the first
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Weights for the ranking formula
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub name_weight: f64,
    pub description_weight: f64,
    pub native_query_weight: f64,
    pub exact_name_bonus: f64,
    pub recency_half_life_days: f64,
    pub view_weight: f64,
    pub bookmark_weight: f64,
    pub official_boost: f64,
    pub archived_penalty: f64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            engine: EngineSetting::Auto,
            max_candidates: 1000,
            ingestion: IngestionConfig::default(),
            retry: RetryConfig::default(),
            ranking: RankingConfig::default(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            mode: IngestionModeSetting::Batched,
            batch_size: 100,
            flush_interval_ms: 1000,
            queue_capacity: 10_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            name_weight: 1.0,
            description_weight: 0.4,
            native_query_weight: 0.25,
            exact_name_bonus: 0.5,
            recency_half_life_days: 180.0,
            view_weight: 0.05,
            bookmark_weight: 0.1,
            official_boost: 1.5,
            archived_penalty: 1.0,
        }
    }
}

const RANKING_KEYS: [&str; 9] = [
    "search.ranking.name_weight",
    "search.ranking.description_weight",
    "search.ranking.native_query_weight",
    "search.ranking.exact_name_bonus",
    "search.ranking.recency_half_life_days",
    "search.ranking.view_weight",
    "search.ranking.bookmark_weight",
    "search.ranking.official_boost",
    "search.ranking.archived_penalty",
];

impl RankingConfig {
    fn field(&self, key: &str) -> Option<f64> {
        Some(match key {
            "search.ranking.name_weight" => self.name_weight,
            "search.ranking.description_weight" => self.description_weight,
            "search.ranking.native_query_weight" => self.native_query_weight,
            "search.ranking.exact_name_bonus" => self.exact_name_bonus,
            "search.ranking.recency_half_life_days" => self.recency_half_life_days,
            "search.ranking.view_weight" => self.view_weight,
            "search.ranking.bookmark_weight" => self.bookmark_weight,
            "search.ranking.official_boost" => self.official_boost,
            "search.ranking.archived_penalty" => self.archived_penalty,
            _ => return None,
        })
    }

    fn field_mut(&mut self, key: &str) -> Option<&mut f64> {
        Some(match key {
            "search.ranking.name_weight" => &mut self.name_weight,
            "search.ranking.description_weight" => &mut self.description_weight,
            "search.ranking.native_query_weight" => &mut self.native_query_weight,
            "search.ranking.exact_name_bonus" => &mut self.exact_name_bonus,
            "search.ranking.recency_half_life_days" => &mut self.recency_half_life_days,
            "search.ranking.view_weight" => &mut self.view_weight,
            "search.ranking.bookmark_weight" => &mut self.bookmark_weight,
            "search.ranking.official_boost" => &mut self.official_boost,
            "search.ranking.archived_penalty" => &mut self.archived_penalty,
            _ => return None,
        })
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("QUARRY_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("quarry")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, applying env overrides
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `QUARRY_*` overrides from the given lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("QUARRY_SEARCH_ENGINE") {
            self.set("search.engine", &engine)?;
        }
        if let Some(mode) = lookup("QUARRY_INGESTION_MODE") {
            self.set("search.ingestion.mode", &mode)?;
        }
        if let Some(path) = lookup("QUARRY_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let ingestion = &self.search.ingestion;
        if ingestion.batch_size == 0 {
            return Err(anyhow!("search.ingestion.batch_size must be positive"));
        }
        if ingestion.queue_capacity < ingestion.batch_size {
            return Err(anyhow!(
                "search.ingestion.queue_capacity ({}) must be at least batch_size ({})",
                ingestion.queue_capacity,
                ingestion.batch_size
            ));
        }
        if ingestion.flush_interval_ms == 0 {
            return Err(anyhow!("search.ingestion.flush_interval_ms must be positive"));
        }
        if self.search.retry.attempts < 2 {
            return Err(anyhow!("search.retry.attempts must be at least 2"));
        }
        if self.search.max_candidates == 0 {
            return Err(anyhow!("search.max_candidates must be positive"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be positive"));
        }

        let ranking = &self.search.ranking;
        for key in RANKING_KEYS {
            let value = ranking.field(key).unwrap_or_default();
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("{} must be a non-negative number", key));
            }
        }
        if ranking.recency_half_life_days <= 0.0 {
            return Err(anyhow!("search.ranking.recency_half_life_days must be positive"));
        }
        if ranking.official_boost < 1.0 {
            return Err(anyhow!("search.ranking.official_boost must be at least 1.0"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        if let Some(value) = self.search.ranking.field(key) {
            return Ok(value.to_string());
        }

        match key {
            "database.path" => Ok(self
                .database
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "search.engine" => Ok(self.search.engine.as_str().to_string()),
            "search.max_candidates" => Ok(self.search.max_candidates.to_string()),
            "search.ingestion.mode" => Ok(match self.search.ingestion.mode {
                IngestionModeSetting::Sync => "sync".to_string(),
                IngestionModeSetting::Batched => "batched".to_string(),
            }),
            "search.ingestion.batch_size" => Ok(self.search.ingestion.batch_size.to_string()),
            "search.ingestion.flush_interval_ms" => {
                Ok(self.search.ingestion.flush_interval_ms.to_string())
            }
            "search.ingestion.queue_capacity" => {
                Ok(self.search.ingestion.queue_capacity.to_string())
            }
            "search.retry.attempts" => Ok(self.search.retry.attempts.to_string()),
            "search.retry.initial_backoff_ms" => {
                Ok(self.search.retry.initial_backoff_ms.to_string())
            }
            "search.retry.max_backoff_ms" => Ok(self.search.retry.max_backoff_ms.to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `quarry config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if let Some(slot) = self.search.ranking.field_mut(key) {
            let parsed: f64 = value
                .parse()
                .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            if !parsed.is_finite() || parsed < 0.0 {
                return Err(anyhow!("{} must be a non-negative number", key));
            }
            *slot = parsed;
            return Ok(());
        }

        match key {
            "database.path" => {
                self.database.path = Some(PathBuf::from(value));
            }
            "database.max_connections" => {
                self.database.max_connections = parse_positive(key, value)?;
            }
            "search.engine" => {
                self.search.engine = EngineSetting::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Invalid search engine: {}. Valid options: auto, app_db, in_place",
                        value
                    )
                })?;
            }
            "search.max_candidates" => {
                self.search.max_candidates = parse_positive(key, value)?;
            }
            "search.ingestion.mode" => {
                self.search.ingestion.mode = match value.trim().to_lowercase().as_str() {
                    "sync" | "synchronous" => IngestionModeSetting::Sync,
                    "batched" | "async" => IngestionModeSetting::Batched,
                    _ => {
                        return Err(anyhow!(
                            "Invalid ingestion mode: {}. Valid options: sync, batched",
                            value
                        ));
                    }
                };
            }
            "search.ingestion.batch_size" => {
                self.search.ingestion.batch_size = parse_positive(key, value)?;
            }
            "search.ingestion.flush_interval_ms" => {
                self.search.ingestion.flush_interval_ms = parse_positive(key, value)?;
            }
            "search.ingestion.queue_capacity" => {
                self.search.ingestion.queue_capacity = parse_positive(key, value)?;
            }
            "search.retry.attempts" => {
                let attempts: u32 = parse_positive(key, value)?;
                if attempts < 2 {
                    return Err(anyhow!("search.retry.attempts must be at least 2"));
                }
                self.search.retry.attempts = attempts;
            }
            "search.retry.initial_backoff_ms" => {
                self.search.retry.initial_backoff_ms = value
                    .parse()
                    .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            }
            "search.retry.max_backoff_ms" => {
                self.search.retry.max_backoff_ms = value
                    .parse()
                    .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `quarry config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "database.path",
            "database.max_connections",
            "search.engine",
            "search.max_candidates",
            "search.ingestion.mode",
            "search.ingestion.batch_size",
            "search.ingestion.flush_interval_ms",
            "search.ingestion.queue_capacity",
            "search.retry.attempts",
            "search.retry.initial_backoff_ms",
            "search.retry.max_backoff_ms",
        ];

        keys.into_iter()
            .chain(RANKING_KEYS)
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_positive<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be positive", key));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.search.engine, EngineSetting::Auto);
        assert_eq!(config.search.ingestion.mode, IngestionModeSetting::Batched);
        assert_eq!(config.search.ingestion.batch_size, 100);
        assert_eq!(config.search.retry.attempts, 3);
        assert_eq!(config.search.ranking.official_boost, 1.5);
        config.validate().expect("defaults should validate");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            engine = "in_place"

            [search.ingestion]
            mode = "sync"
            "#,
        )
        .expect("Should parse partial config");

        assert_eq!(config.search.engine, EngineSetting::InPlace);
        assert_eq!(config.search.ingestion.mode, IngestionModeSetting::Sync);
        assert_eq!(config.search.ingestion.queue_capacity, 10_000);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut config = Config::default();

        config.set("search.engine", "app_db").unwrap();
        assert_eq!(config.get("search.engine").unwrap(), "app_db");

        config.set("search.ranking.official_boost", "2.5").unwrap();
        assert_eq!(config.get("search.ranking.official_boost").unwrap(), "2.5");

        config.set("search.ingestion.batch_size", "25").unwrap();
        assert_eq!(config.search.ingestion.batch_size, 25);
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();

        assert!(config.set("search.engine", "elastic").is_err());
        assert!(config.set("search.retry.attempts", "1").is_err());
        assert!(config.set("search.ingestion.batch_size", "0").is_err());
        assert!(config.set("search.ranking.view_weight", "-1").is_err());
        assert!(config.set("nope", "1").is_err());
    }

    #[test]
    fn test_validate_rejects_small_queue() {
        let mut config = Config::default();
        config.search.ingestion.queue_capacity = 10;
        config.search.ingestion.batch_size = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_covers_every_key() {
        let config = Config::default();
        let listed = config.list().unwrap();
        assert_eq!(listed.len(), 11 + RANKING_KEYS.len());
        assert!(listed.iter().any(|(k, _)| k == "search.ranking.archived_penalty"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("QUARRY_SEARCH_ENGINE", "in_place"),
            ("QUARRY_INGESTION_MODE", "sync"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.search.engine, EngineSetting::InPlace);
        assert_eq!(config.search.ingestion.mode, IngestionModeSetting::Sync);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.set("search.max_candidates", "250").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.search.max_candidates, 250);

        let missing = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.search.max_candidates, 1000);
    }
}
