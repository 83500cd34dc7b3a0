use config::{Config, ConfigError, Environment, File};
use dotenv::dotenv;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Once;
use crate::info;

static DOTENV_ONCE: Once = Once::new();

/// When pending changes reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Queries flush the unit of work first so they observe staged changes.
    #[default]
    Auto,
    /// Only an explicit `flush()` writes.
    Commit,
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(FlushMode::Auto),
            "commit" => Ok(FlushMode::Commit),
            _ => Err(format!("Invalid value for FlushMode: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for FlushMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FlushMode::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrmSettings {
    pub db_path: String,
    pub db_cache_size_mb: usize,
    pub flush_mode: FlushMode,
    pub debug_queries: bool,
}

impl Default for OrmSettings {
    fn default() -> Self {
        OrmSettings {
            db_path: std::env::temp_dir().join("relbit").to_string_lossy().into_owned(),
            db_cache_size_mb: 64,
            flush_mode: FlushMode::Auto,
            debug_queries: false,
        }
    }
}

impl OrmSettings {
    /// Reads `path` (any format the `config` crate knows) and applies `RELBIT__*` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        load_config(path, "RELBIT")
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_debug_queries(mut self, debug_queries: bool) -> Self {
        self.debug_queries = debug_queries;
        self
    }
}

fn ensure_dotenv_loaded() {
    DOTENV_ONCE.call_once(|| {
        match dotenv() {
            Ok(_) => info!("Settings loaded including .env file."),
            Err(_) => info!("Settings loaded without .env file."),
        }
    });
}

pub fn load_config<T>(path: &str, prefix: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + std::fmt::Debug,
{
    ensure_dotenv_loaded();

    let cfg = Config::builder()
        .add_source(File::with_name(path).required(true))
        .add_source(
            Environment::with_prefix(prefix)
                .try_parsing(true)
                .separator("__"),
        )
        .build()?
        .try_deserialize::<T>()?;
    info!("{:#?}", cfg);
    Ok(cfg)
}
