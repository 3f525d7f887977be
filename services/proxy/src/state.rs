//! Shared Application State
//!
//! `AppState` holds the long-lived collaborators every client session uses:
//! the credential provider, the upstream connector, the tool-call interceptor
//! and the connection registry shared with the health monitor.

use crate::{
    config::{Config, CredentialSource},
    error::ProxyError,
    ws::{
        registry::ConnectionRegistry,
        relay::{KeepAlive, RelaySettings},
        tools::{ToolCallInterceptor, function_declarations},
        upstream::UpstreamConnector,
    },
};
use livewire_core::{
    auth::{
        CachedTokenProvider, GcloudTokenSource, MetadataTokenSource, StaticTokenSource,
        TokenProvider,
    },
    weather::{OpenWeatherClient, WeatherLookup},
};
use std::{path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub connector: Arc<UpstreamConnector>,
    pub interceptor: Arc<ToolCallInterceptor>,
    /// Cancelled on process shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        token_provider: Arc<dyn TokenProvider>,
        weather: Arc<dyn WeatherLookup>,
        system_instruction: Arc<String>,
    ) -> Self {
        let connector = UpstreamConnector::new(
            config.upstream_url.clone(),
            config.model_path(),
            config.voice_name.clone(),
            system_instruction,
            function_declarations(),
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            token_provider,
            connector: Arc::new(connector),
            interceptor: Arc::new(ToolCallInterceptor::new(weather)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Builds the production collaborators described by `config`.
    pub fn from_config(config: Config) -> Result<Self, ProxyError> {
        let token_provider = token_provider_for(&config.credential_source);
        if config.openweather_api_key.is_none() {
            info!("OPENWEATHER_API_KEY is not set; get_weather calls will return null.");
        }
        let weather = Arc::new(OpenWeatherClient::new(config.openweather_api_key.clone())?);
        let system_instruction = load_system_instruction(&config.system_instructions_path);
        Ok(Self::new(config, token_provider, weather, system_instruction))
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            keepalive: Some(KeepAlive {
                interval: self.config.keepalive_interval,
                timeout: self.config.keepalive_timeout,
            }),
            shutdown_grace: self.config.shutdown_grace,
            forward_tool_summary: self.config.forward_tool_summary,
        }
    }
}

pub fn token_provider_for(source: &CredentialSource) -> Arc<dyn TokenProvider> {
    match source {
        CredentialSource::Static(token) => {
            info!("Using a static access token.");
            Arc::new(CachedTokenProvider::new(StaticTokenSource::new(token.clone())))
        }
        CredentialSource::Metadata => {
            info!("Using the metadata server for access tokens.");
            Arc::new(CachedTokenProvider::new(MetadataTokenSource::new()))
        }
        CredentialSource::Gcloud => {
            info!("Using `gcloud auth print-access-token` for access tokens.");
            Arc::new(CachedTokenProvider::new(GcloudTokenSource::new()))
        }
    }
}

/// Reads the system instruction once at startup.
///
/// An unreadable file is logged and sessions run with an empty instruction.
pub fn load_system_instruction(path: &Path) -> Arc<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            info!(path = %path.display(), chars = text.len(), "Loaded system instructions.");
            Arc::new(text)
        }
        Err(e) => {
            let err = ProxyError::Config(format!(
                "could not read system instructions from {}: {}",
                path.display(),
                e
            ));
            error!(error = %err, "Continuing with an empty system instruction.");
            Arc::new(String::new())
        }
    }
}
