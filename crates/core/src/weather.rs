//! Current-weather lookup backed by the OpenWeather REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, warn};

const OPENWEATHER_BASE_URL: &str = "https://api.openweathermap.org";
/// Upper bound on each geocoding or weather request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("No OpenWeather API key configured")]
    MissingApiKey,
    #[error("Weather request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Weather service answered with status {0}")]
    Status(u16),
    #[error("Could not find location: {0}")]
    LocationNotFound(String),
    #[error("Invalid weather response: {0}")]
    InvalidResponse(String),
}

/// The weather summary returned to the model as a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub temperature: f64,
    pub description: String,
    pub humidity: u32,
    pub wind_speed: f64,
    pub city: String,
    pub country: String,
}

/// Looks up the current weather for a city name.
#[async_trait]
pub trait WeatherLookup: Send + Sync {
    async fn current_weather(&self, city: &str) -> Result<WeatherReport, WeatherError>;
}

#[derive(Deserialize)]
struct GeoLocation {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct CurrentWeather {
    main: MainReadings,
    weather: Vec<Condition>,
    wind: Wind,
    name: String,
    sys: Sys,
}

#[derive(Deserialize)]
struct MainReadings {
    temp: f64,
    humidity: u32,
}

#[derive(Deserialize)]
struct Condition {
    description: String,
}

#[derive(Deserialize)]
struct Wind {
    speed: f64,
}

#[derive(Deserialize)]
struct Sys {
    #[serde(default)]
    country: Option<String>,
}

impl TryFrom<CurrentWeather> for WeatherReport {
    type Error = WeatherError;

    fn try_from(current: CurrentWeather) -> Result<Self, Self::Error> {
        let description = current
            .weather
            .into_iter()
            .next()
            .map(|c| c.description)
            .ok_or_else(|| WeatherError::InvalidResponse("empty `weather` list".to_string()))?;
        Ok(Self {
            temperature: current.main.temp,
            description,
            humidity: current.main.humidity,
            wind_speed: current.wind.speed,
            city: current.name,
            country: current.sys.country.unwrap_or_default(),
        })
    }
}

/// Two-step lookup: geocode the city, then fetch metric weather at its coordinates.
pub struct OpenWeatherClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenWeatherClient {
    pub fn new(api_key: Option<String>) -> Result<Self, WeatherError> {
        Self::with_endpoint(api_key, OPENWEATHER_BASE_URL, REQUEST_TIMEOUT)
    }

    pub fn with_endpoint(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, WeatherError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, path, "Weather service returned an error status.");
            return Err(WeatherError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| WeatherError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl WeatherLookup for OpenWeatherClient {
    async fn current_weather(&self, city: &str) -> Result<WeatherReport, WeatherError> {
        let api_key = self.api_key.clone().ok_or(WeatherError::MissingApiKey)?;
        debug!(city, "Looking up weather.");

        let locations: Vec<GeoLocation> = self
            .get_json(
                "/geo/1.0/direct",
                &[
                    ("q", city.to_string()),
                    ("limit", "1".to_string()),
                    ("appid", api_key.clone()),
                ],
            )
            .await?;
        let location = locations
            .into_iter()
            .next()
            .ok_or_else(|| WeatherError::LocationNotFound(city.to_string()))?;

        let current: CurrentWeather = self
            .get_json(
                "/data/2.5/weather",
                &[
                    ("lat", location.lat.to_string()),
                    ("lon", location.lon.to_string()),
                    ("units", "metric".to_string()),
                    ("appid", api_key),
                ],
            )
            .await?;
        current.try_into()
    }
}
