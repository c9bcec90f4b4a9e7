use crate::error::AppError;

/// Application configuration loaded explicitly from environment variables.
///
/// No defaults are assumed for paths; the caller must provide them.
/// Redis URL is optional; if absent, the server runs without caching.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379"). `None` disables caching.
    pub redis_url: Option<String>,
    /// Filesystem path to the SQLite database holding jurisdictions,
    /// ordinance chunks, and rulesets.
    pub database_path: String,
    /// Directory of per-jurisdiction structured rule files
    /// (`<slug>/index.json` plus topic detail files).
    pub rules_dir: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CIVIX_DATABASE_PATH`: path to the SQLite database file
    /// - `CIVIX_RULES_DIR`: directory of per-jurisdiction rule files
    ///
    /// Optional:
    /// - `REDIS_URL`: Redis connection string (omit to disable caching)
    pub fn from_env() -> Result<Self, AppError> {
        let database_path = std::env::var("CIVIX_DATABASE_PATH").map_err(|_| {
            AppError::Config("CIVIX_DATABASE_PATH environment variable is required".to_string())
        })?;

        let rules_dir = std::env::var("CIVIX_RULES_DIR").map_err(|_| {
            AppError::Config("CIVIX_RULES_DIR environment variable is required".to_string())
        })?;

        // The rules directory must exist even if empty; a missing path is a
        // deployment mistake, not an empty dataset.
        if !std::path::Path::new(&rules_dir).is_dir() {
            return Err(AppError::Config(format!(
                "rules directory not found at {rules_dir}"
            )));
        }

        let redis_url = std::env::var("REDIS_URL").ok();

        Ok(Self {
            redis_url,
            database_path,
            rules_dir,
        })
    }
}
