//! Server configuration, loaded from defaults, an optional `config.toml`, then
//! environment variables — highest priority last, the way `figment` composes
//! providers.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_MAX_ITEMS_PER_SESSION: usize = 20;
const DEFAULT_MAX_PINNED_ITEMS_PER_SESSION: usize = 50;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 60 * 1000; // 1h
const DEFAULT_SESSION_EXPIRY_MS: u64 = 60 * 60 * 1000; // 1h
const DEFAULT_PORT: u16 = 8080;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub storage_path: String,
    pub large_file_threshold: u64,
    pub max_items_per_session: usize,
    pub max_pinned_items_per_session: usize,
    pub cleanup_interval: u64,
    pub session_expiry: u64,
    pub cors_origin: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: "./data".to_string(),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            max_items_per_session: DEFAULT_MAX_ITEMS_PER_SESSION,
            max_pinned_items_per_session: DEFAULT_MAX_PINNED_ITEMS_PER_SESSION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_MS,
            session_expiry: DEFAULT_SESSION_EXPIRY_MS,
            cors_origin: "*".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Load defaults, then `config.toml` if present, then env vars
    /// (`STORAGE_PATH`, `LARGE_FILE_THRESHOLD`, ...).
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Same as `load`, but merges a caller-supplied TOML file instead of the
    /// default `./config.toml` when `path` is given.
    pub fn load_from(path: Option<&std::path::Path>) -> Result<Self, figment::Error> {
        let toml_path = path.map(|p| p.to_path_buf()).unwrap_or_else(|| "config.toml".into());

        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml_path))
            .merge(Env::raw().only(&[
                "STORAGE_PATH",
                "LARGE_FILE_THRESHOLD",
                "MAX_ITEMS_PER_SESSION",
                "MAX_PINNED_ITEMS_PER_SESSION",
                "CLEANUP_INTERVAL",
                "SESSION_EXPIRY",
                "CORS_ORIGIN",
                "PORT",
            ]))
            .extract()
    }

    /// Parsed CORS policy per spec: `*` allows any origin, a comma-separated
    /// list allows exact matches, otherwise the single origin is allowed.
    pub fn cors_origins(&self) -> CorsPolicy {
        if self.cors_origin == "*" {
            CorsPolicy::Any
        } else if self.cors_origin.contains(',') {
            CorsPolicy::List(
                self.cors_origin
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )
        } else {
            CorsPolicy::List(vec![self.cors_origin.clone()])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    Any,
    List(Vec<String>),
}
