//! Configuration loading with collected validation errors.
//!
//! Services build their settings through [`ConfigValidator`] so a bad
//! deployment reports every invalid variable at once. [`IntegrityConfig`]
//! holds the settings of the event/request integrity substrate.

mod integrity;
mod validator;

pub use integrity::IntegrityConfig;
pub use validator::ConfigValidator;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
