use std::path::PathBuf;

use config_validator::{ConfigError, ConfigValidator};

/// Process settings read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub bus_type: String,
    pub nats_url: String,
    pub store_backend: String,
    pub database_url: Option<String>,
    /// Optional YAML with integrity tunables
    pub config_path: Option<PathBuf>,
    /// Directory of registered Avro subjects
    pub schema_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(ConfigValidator::from_env())
    }

    pub fn load(mut v: ConfigValidator<'_>) -> Result<Self, ConfigError> {
        let store_backend = v.one_of("STORE_BACKEND", &["memory", "postgres"], "postgres");
        let database_url = if store_backend == "postgres" {
            v.require("DATABASE_URL")
        } else {
            v.raw("DATABASE_URL")
        };
        let config = Config {
            host: v.optional_or("HOST", "0.0.0.0"),
            port: v.parse_or("PORT", 8090),
            bus_type: v.one_of("BUS_TYPE", &["inmemory", "nats"], "inmemory"),
            nats_url: v.optional_or("NATS_URL", "nats://localhost:4222"),
            store_backend,
            database_url,
            config_path: v.raw("CONFIG_PATH").map(PathBuf::from),
            schema_dir: v.raw("SCHEMA_DIR").map(PathBuf::from),
        };
        v.finish()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load(ConfigValidator::with_lookup(move |n| env.get(n).cloned()))
    }

    #[test]
    fn test_memory_backend_needs_no_database() {
        let config = load(&[("STORE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.port, 8090);
        assert_eq!(config.bus_type, "inmemory");
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        assert!(matches!(load(&[]), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_port_is_reported() {
        let err = load(&[("STORE_BACKEND", "memory"), ("PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(errors) if errors.len() == 1));
    }
}
