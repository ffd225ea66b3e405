use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use kindroom_gateway::connection::ConnectionSettings;
use kindroom_gateway::pipeline::PipelineConfig;
use kindroom_moderation::ModerationConfig;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

/// Server settings, read from `KINDROOM_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub moderation: ModerationConfig,
    pub pipeline: PipelineConfig,
    pub connection: ConnectionSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let text = |key: &'static str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let mut moderation =
            ModerationConfig::new(text("KINDROOM_MODERATION_URL", "http://127.0.0.1:8000"));
        moderation.escalation_url = get("KINDROOM_ESCALATION_URL");
        moderation.api_key = get("KINDROOM_ESCALATION_API_KEY").unwrap_or_default();
        if let Some(header) = get("KINDROOM_ESCALATION_API_KEY_HEADER") {
            moderation.api_key_header = header;
        }
        moderation.timeout =
            Duration::from_secs(number(&get, "KINDROOM_MODERATION_TIMEOUT_SECS", 10)?);

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            harmful_threshold: number(
                &get,
                "KINDROOM_HARMFUL_THRESHOLD",
                defaults.harmful_threshold,
            )?,
            echo_to_sender: boolean(&get, "KINDROOM_ECHO_TO_SENDER", defaults.echo_to_sender)?,
            operation_timeout: Duration::from_secs(number(
                &get,
                "KINDROOM_OPERATION_TIMEOUT_SECS",
                defaults.operation_timeout.as_secs(),
            )?),
        };

        let connection_defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            history_limit: number(
                &get,
                "KINDROOM_HISTORY_LIMIT",
                connection_defaults.history_limit,
            )?,
            outbound_buffer: number(
                &get,
                "KINDROOM_OUTBOUND_BUFFER",
                connection_defaults.outbound_buffer,
            )?,
        };

        Ok(Self {
            host: text("KINDROOM_HOST", "0.0.0.0"),
            port: number(&get, "KINDROOM_PORT", 3000)?,
            db_path: PathBuf::from(text("KINDROOM_DB_PATH", "kindroom.db")),
            moderation,
            pipeline,
            connection,
        })
    }
}

fn number<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError { key, value }),
    }
}

fn boolean(
    get: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError { key, value }),
        },
    }
}
