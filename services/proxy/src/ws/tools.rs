//! Executes upstream tool calls locally and builds the tool response.

use super::protocol::{
    FunctionCall, FunctionDeclaration, FunctionResponse, ToolCall, ToolCallSummary,
    ToolResponseMessage,
};
use crate::error::ProxyError;
use livewire_core::weather::WeatherLookup;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GET_WEATHER: &str = "get_weather";

/// Declarations advertised to the upstream model in the setup message.
pub fn function_declarations() -> Vec<FunctionDeclaration> {
    vec![FunctionDeclaration {
        name: GET_WEATHER.to_string(),
        description: "Get current weather information for a city".to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "city": {
                    "type": "STRING",
                    "description": "The name of the city to get weather for"
                }
            },
            "required": ["city"]
        }),
    }]
}

/// Result of executing one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Goes back upstream in place of the original call.
    pub response: ToolResponseMessage,
    /// Last weather result, for the optional client-side debug echo.
    pub summary: Option<ToolCallSummary>,
}

pub struct ToolCallInterceptor {
    weather: Arc<dyn WeatherLookup>,
}

impl ToolCallInterceptor {
    pub fn new(weather: Arc<dyn WeatherLookup>) -> Self {
        Self { weather }
    }

    /// Runs every recognised invocation in order.
    ///
    /// Lookup failures still produce an entry with a `null` result. Invocations
    /// of unknown functions are left out of the response entirely.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let mut responses = Vec::with_capacity(call.function_calls.len());
        let mut summary = None;

        for invocation in &call.function_calls {
            match invocation.name.as_str() {
                GET_WEATHER => {
                    let city = invocation.string_arg("city").map(str::to_string);
                    let result = self.get_weather(invocation, city.as_deref()).await;
                    responses.push(FunctionResponse::new(GET_WEATHER, result.clone()));
                    summary = Some(ToolCallSummary {
                        city,
                        weather: result,
                    });
                }
                other => {
                    debug!(function = other, "Dropping unrecognised function call.");
                }
            }
        }

        ToolOutcome {
            response: ToolResponseMessage::new(responses),
            summary,
        }
    }

    async fn get_weather(&self, invocation: &FunctionCall, city: Option<&str>) -> Option<Value> {
        let Some(city) = city else {
            warn!(args = ?invocation.args, "get_weather called without a `city` argument.");
            return None;
        };

        match self.weather.current_weather(city).await {
            Ok(report) => {
                info!(city, ?report, "get_weather lookup succeeded.");
                serde_json::to_value(report).ok()
            }
            Err(e) => {
                let err = ProxyError::from(e);
                warn!(city, error = %err, "get_weather lookup failed; responding with null.");
                None
            }
        }
    }
}
