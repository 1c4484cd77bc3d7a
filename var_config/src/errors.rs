use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cargo.toml not found in package root")]
    ConfigNotFound,
    #[error("package.metadata.vars section missing from Cargo.toml")]
    ConfigSectionNotFound,
    #[error("Invalid environment variable: {0}")]
    EnvVarError(String),
    #[error("Config Error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}
