//! CLI configuration from environment variables.

use protheus_mirror::{EngineConfig, ErpConfig};

use crate::error::{CliError, CliResult};

/// Everything the CLI needs to build a mirror service.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Pool size. Default: 5.
    pub max_connections: u32,

    /// Run pending migrations on startup. Default: true.
    pub run_migrations: bool,

    pub erp: ErpConfig,
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Load configuration from environment variables (after `.env`).
    pub fn from_env() -> CliResult<Self> {
        let erp = ErpConfig::from_env()?;
        Self::from_reader(|key| std::env::var(key), erp, EngineConfig::from_env())
    }

    /// Load the database settings from a custom variable reader.
    pub fn from_reader<F>(reader: F, erp: ErpConfig, engine: EngineConfig) -> CliResult<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let database_url = reader("DATABASE_URL")
            .map_err(|_| CliError::Config("DATABASE_URL environment variable is required".into()))?;

        let max_connections = match reader("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse::<u32>().map_err(|e| {
                CliError::Config(format!("DATABASE_MAX_CONNECTIONS: {e}"))
            })?,
            Err(_) => 5,
        };

        let run_migrations = reader("MIRROR_RUN_MIGRATIONS")
            .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            max_connections,
            run_migrations,
            erp,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn reader(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned().ok_or(std::env::VarError::NotPresent)
    }

    fn erp() -> ErpConfig {
        ErpConfig::new("http://erp.local/rest", "admin", "secret")
    }

    #[test]
    fn test_database_url_is_required() {
        let err = CliConfig::from_reader(reader(&[]), erp(), EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::from_reader(
            reader(&[("DATABASE_URL", "postgres://localhost/mirror")]),
            erp(),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(config.max_connections, 5);
        assert!(config.run_migrations);
    }

    #[test]
    fn test_overrides() {
        let config = CliConfig::from_reader(
            reader(&[
                ("DATABASE_URL", "postgres://localhost/mirror"),
                ("DATABASE_MAX_CONNECTIONS", "12"),
                ("MIRROR_RUN_MIGRATIONS", "false"),
            ]),
            erp(),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(config.max_connections, 12);
        assert!(!config.run_migrations);

        let err = CliConfig::from_reader(
            reader(&[
                ("DATABASE_URL", "postgres://localhost/mirror"),
                ("DATABASE_MAX_CONNECTIONS", "many"),
            ]),
            erp(),
            EngineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
