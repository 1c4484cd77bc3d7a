#![forbid(unsafe_code)]

pub mod errors;

use crate::errors::ConfigError;
use config::{Case, Config, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use std::{
    env::VarError, fs, path::Path, str::FromStr, sync::Arc, time::Duration,
};
use typed_builder::TypedBuilder;

/// A Struct to allow us to parse the runtime options out of the
/// `[package.metadata.vars]` section of a Cargo.toml file.
#[derive(Clone, Debug)]
pub struct ConfFile {
    pub runtime_options: RuntimeOptions,
}

/// The options consumed by the variable runtime: where the server lives, how
/// the live channel reconnects, and how quickly persisted values are flushed.
///
/// Every field can be set in the `[package.metadata.vars]` section of
/// Cargo.toml, and overridden by a `VARS_*` environment variable.
#[derive(TypedBuilder, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeOptions {
    /// Prefix prepended to every HTTP request path, e.g.
    /// `http://127.0.0.1:8000`. Defaults to `http://127.0.0.1:8000`.
    #[builder(setter(into), default = default_base_url())]
    #[serde(default = "default_base_url")]
    pub base_url: Arc<str>,
    /// Path of the live channel endpoint, relative to `base_url`.
    /// Defaults to `/api/core/ws`.
    #[builder(setter(into), default = default_ws_path())]
    #[serde(default = "default_ws_path")]
    pub ws_path: Arc<str>,
    /// The maximum number of consecutive failed reconnect attempts before the
    /// live channel goes dormant. `None` retries forever.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Initial delay between reconnect attempts, doubled on every failure.
    #[builder(default = default_retry_delay_ms())]
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound for the reconnect delay.
    #[builder(default = default_max_retry_delay_ms())]
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Reload the page after the live channel reconnects. When unset, this is
    /// on in [`Env::DEV`] and off in [`Env::PROD`].
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub live_reload: Option<bool>,
    /// Debounce applied to backend store writes.
    #[builder(default = default_persist_debounce_ms())]
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
    /// The current environment.
    #[builder(default)]
    #[serde(default)]
    pub env: Env,
}

impl RuntimeOptions {
    /// Creates a new set of options from the `VARS_*` environment variables,
    /// falling back to defaults for any that are unset.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Ok(RuntimeOptions {
            base_url: env_w_default("VARS_BASE_URL", &default_base_url())?
                .into(),
            ws_path: env_w_default("VARS_WS_PATH", &default_ws_path())?
                .into(),
            max_attempts: env_wo_default("VARS_MAX_ATTEMPTS")?
                .as_deref()
                .map(parse_env_num)
                .transpose()?,
            retry_delay_ms: env_wo_default("VARS_RETRY_DELAY_MS")?
                .as_deref()
                .map(parse_env_num)
                .transpose()?
                .unwrap_or_else(default_retry_delay_ms),
            max_retry_delay_ms: env_wo_default("VARS_MAX_RETRY_DELAY_MS")?
                .as_deref()
                .map(parse_env_num)
                .transpose()?
                .unwrap_or_else(default_max_retry_delay_ms),
            live_reload: env_wo_default("VARS_LIVE_RELOAD")?
                .as_deref()
                .map(parse_env_bool)
                .transpose()?,
            persist_debounce_ms: env_wo_default("VARS_PERSIST_DEBOUNCE_MS")?
                .as_deref()
                .map(parse_env_num)
                .transpose()?
                .unwrap_or_else(default_persist_debounce_ms),
            env: env_from_str(env_w_default("VARS_ENV", "DEV")?.as_str())?,
        })
    }

    /// Whether the live channel should reload the page after reconnecting.
    pub fn live_reload(&self) -> bool {
        self.live_reload.unwrap_or(self.env == Env::DEV)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// The root of the HTTP endpoints.
    pub fn api_url(&self) -> String {
        format!("{}/api/core", self.base_url.trim_end_matches('/'))
    }

    /// The full URL of the live channel, with the `http` scheme of `base_url`
    /// swapped for `ws`.
    pub fn ws_url(&self) -> String {
        let base = self
            .base_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}{}", self.ws_path)
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions::builder().build()
    }
}

fn default_base_url() -> Arc<str> {
    "http://127.0.0.1:8000".into()
}

fn default_ws_path() -> Arc<str> {
    "/api/core/ws".into()
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_persist_debounce_ms() -> u64 {
    500
}

fn env_wo_default(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::EnvVarError(format!("{key}: {e}"))),
    }
}

fn env_w_default(key: &str, default: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(val) => Ok(val),
        Err(VarError::NotPresent) => Ok(default.to_string()),
        Err(e) => Err(ConfigError::EnvVarError(format!("{key}: {e}"))),
    }
}

fn parse_env_num<N: FromStr>(input: &str) -> Result<N, ConfigError> {
    input.trim().parse().map_err(|_| {
        ConfigError::EnvVarError(format!("{input} is not a valid number"))
    })
}

fn parse_env_bool(input: &str) -> Result<bool, ConfigError> {
    match input.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvVarError(format!(
            "{input} is not a supported boolean. Use true or false"
        ))),
    }
}

/// An enum that can be used to define the environment the runtime is running
/// in. Setting this to [`Env::DEV`] turns on live reload by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Env {
    PROD,
    #[default]
    DEV,
}

fn env_from_str(input: &str) -> Result<Env, ConfigError> {
    let sanitized = input.to_lowercase();
    match sanitized.as_ref() {
        "dev" | "development" => Ok(Env::DEV),
        "prod" | "production" => Ok(Env::PROD),
        _ => Err(ConfigError::EnvVarError(format!(
            "{input} is not a supported environment. Use either `dev` or \
             `production`.",
        ))),
    }
}

impl FromStr for Env {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        env_from_str(input)
    }
}

impl TryFrom<String> for Env {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        env_from_str(s.as_str())
    }
}

/// Loads [`RuntimeOptions`] from a Cargo.toml file at `path`, or from the
/// environment alone if no path is given.
pub fn get_configuration(path: Option<&str>) -> Result<ConfFile, ConfigError> {
    if let Some(path) = path {
        get_config_from_file(path)
    } else {
        get_config_from_env()
    }
}

/// Loads [`RuntimeOptions`] from a Cargo.toml file. `VARS_*` environment
/// variables take precedence over values in the file.
pub fn get_config_from_file<P: AsRef<Path>>(
    path: P,
) -> Result<ConfFile, ConfigError> {
    let text =
        fs::read_to_string(path).map_err(|_| ConfigError::ConfigNotFound)?;
    let runtime_options = get_config_from_str(&text)?;
    Ok(ConfFile { runtime_options })
}

/// Loads [`RuntimeOptions`] from the contents of a Cargo.toml file.
/// `VARS_*` environment variables take precedence over values in the text.
pub fn get_config_from_str(text: &str) -> Result<RuntimeOptions, ConfigError> {
    let re = Regex::new(r"(?m)^\[package.metadata.vars\]")
        .map_err(|e| ConfigError::ConfigError(e.to_string()))?;
    let start = match re.find(text) {
        Some(found) => found.end(),
        None => return Err(ConfigError::ConfigSectionNotFound),
    };

    // only the keys of the section itself, up to the next table header
    let section = &text[start..];
    let end = section.find("\n[").unwrap_or(section.len());

    let config = Config::builder()
        .add_source(File::from_str(&section[..end], FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("VARS").convert_case(Case::Kebab),
        )
        .build()?;

    config.try_deserialize().map_err(Into::into)
}

/// Loads [`RuntimeOptions`] from the environment alone.
pub fn get_config_from_env() -> Result<ConfFile, ConfigError> {
    Ok(ConfFile {
        runtime_options: RuntimeOptions::try_from_env()?,
    })
}

#[path = "tests.rs"]
#[cfg(test)]
mod tests;
