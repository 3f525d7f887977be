use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where the upstream bearer token comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// A fixed token from `ACCESS_TOKEN`.
    Static(String),
    /// The compute metadata server's default service account.
    Metadata,
    /// `gcloud auth print-access-token`.
    Gcloud,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub project_id: String,
    pub location: String,
    pub model_id: String,
    pub voice_name: String,
    pub upstream_url: String,
    pub system_instructions_path: PathBuf,
    pub credential_source: CredentialSource,
    pub openweather_api_key: Option<String>,
    pub health_check_interval: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub auth_timeout: Duration,
    pub shutdown_grace: Duration,
    pub forward_tool_summary: bool,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8081".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let project_id = std::env::var("PROJECT_ID")
            .map_err(|_| ConfigError::MissingVar("PROJECT_ID".to_string()))?;
        let location = std::env::var("LOCATION").unwrap_or_else(|_| "us-central1".to_string());
        let model_id =
            std::env::var("MODEL_ID").unwrap_or_else(|_| "gemini-2.0-flash-exp".to_string());
        let voice_name = std::env::var("VOICE_NAME").unwrap_or_else(|_| "Aoede".to_string());

        let upstream_url = std::env::var("UPSTREAM_URL").unwrap_or_else(|_| {
            format!(
                "wss://{}-aiplatform.googleapis.com/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent",
                location
            )
        });
        if !upstream_url.starts_with("ws://") && !upstream_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "UPSTREAM_URL".to_string(),
                format!("'{}' is not a WebSocket URL", upstream_url),
            ));
        }

        let system_instructions_path = std::env::var("SYSTEM_INSTRUCTIONS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./system-instructions.txt"));

        let source_str =
            std::env::var("CREDENTIAL_SOURCE").unwrap_or_else(|_| "gcloud".to_string());
        let credential_source = match source_str.to_lowercase().as_str() {
            "static" => CredentialSource::Static(std::env::var("ACCESS_TOKEN").map_err(|_| {
                ConfigError::MissingVar(
                    "ACCESS_TOKEN must be set for 'static' credential source".to_string(),
                )
            })?),
            "metadata" => CredentialSource::Metadata,
            "gcloud" => CredentialSource::Gcloud,
            other => {
                return Err(ConfigError::InvalidValue(
                    "CREDENTIAL_SOURCE".to_string(),
                    format!("'{}' is not one of static, metadata, gcloud", other),
                ));
            }
        };

        let openweather_api_key = std::env::var("OPENWEATHER_API_KEY").ok();

        let health_check_interval = secs_var("HEALTH_CHECK_INTERVAL_SECS", 30)?;
        let keepalive_interval = secs_var("KEEPALIVE_INTERVAL_SECS", 30)?;
        let keepalive_timeout = secs_var("KEEPALIVE_TIMEOUT_SECS", 10)?;
        let auth_timeout = secs_var("AUTH_TIMEOUT_SECS", 10)?;
        let shutdown_grace = Duration::from_millis(positive_var("SHUTDOWN_GRACE_MS", 500)?);

        let forward_tool_summary = match std::env::var("FORWARD_TOOL_SUMMARY") {
            Ok(v) => v.parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue(
                    "FORWARD_TOOL_SUMMARY".to_string(),
                    format!("'{}' is not true or false", v),
                )
            })?,
            Err(_) => false,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            project_id,
            location,
            model_id,
            voice_name,
            upstream_url,
            system_instructions_path,
            credential_source,
            openweather_api_key,
            health_check_interval,
            keepalive_interval,
            keepalive_timeout,
            auth_timeout,
            shutdown_grace,
            forward_tool_summary,
            log_level,
        })
    }

    /// The fully qualified publisher model path sent in the setup message.
    pub fn model_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/publishers/google/models/{}",
            self.project_id, self.location, self.model_id
        )
    }
}

fn positive_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match std::env::var(name) {
        Ok(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("'{}' is not a number", raw))
        })?,
        Err(_) => default,
    };
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

fn secs_var(name: &str, default: u64) -> Result<Duration, ConfigError> {
    positive_var(name, default).map(Duration::from_secs)
}
