//! JSON message shapes exchanged with the client and the upstream service.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// --- Proxy-originated notices ---

/// Messages the proxy itself sends to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ServerNotice {
    /// Credentials were obtained; relaying is about to begin.
    AuthComplete(bool),
    /// Debug echo of the last weather tool result.
    ToolCallResponse(ToolCallSummary),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolCallSummary {
    pub city: Option<String>,
    pub weather: Option<Value>,
}

// --- Setup message sent upstream once per session ---

#[derive(Serialize, Debug, Clone)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Serialize, Debug, Clone)]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<ToolDeclarations>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Serialize, Debug, Clone)]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ToolDeclarations {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize, Debug, Clone)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl SetupMessage {
    pub fn new(
        model: String,
        voice_name: String,
        system_instruction: String,
        functions: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec![ResponseModality::Audio],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
                        },
                    },
                },
                system_instruction: Content {
                    role: "user".to_string(),
                    parts: vec![Part {
                        text: system_instruction,
                    }],
                },
                tools: vec![ToolDeclarations {
                    function_declarations: functions,
                }],
            },
        }
    }
}

// --- Tool calls and responses ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    #[serde(default, rename = "functionCalls", alias = "function_calls")]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl FunctionCall {
    pub fn string_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolResponseMessage {
    pub tool_response: ToolResponse,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub name: String,
    pub response: FunctionResult,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub result: ResultValue,
}

/// `object_value` serialises as `null` when the lookup produced nothing.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResultValue {
    pub object_value: Option<Value>,
}

impl FunctionResponse {
    pub fn new(name: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            response: FunctionResult {
                result: ResultValue {
                    object_value: value,
                },
            },
        }
    }
}

impl ToolResponseMessage {
    pub fn new(function_responses: Vec<FunctionResponse>) -> Self {
        Self {
            tool_response: ToolResponse { function_responses },
        }
    }
}

// --- Relayed messages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Setup,
    RealtimeInput,
    ServerContent,
    ToolCall,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Setup => "setup",
            MessageKind::RealtimeInput => "realtime_input",
            MessageKind::ServerContent => "server_content",
            MessageKind::ToolCall => "tool_call",
            MessageKind::Other => "other",
        }
    }
}

/// A message received from either side, classified by its top-level keys.
///
/// Every variant except `ToolCall` keeps the parsed payload untouched; the
/// relay forwards the original text, so classification never changes content.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayedMessage {
    Setup(Value),
    RealtimeInput(Value),
    ServerContent(Value),
    ToolCall(ToolCall),
    Other(Value),
}

impl RelayedMessage {
    pub fn parse(text: &str) -> Result<Self, ProxyError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProxyError::Parse(e.to_string()))?;
        Self::classify(value)
    }

    pub fn classify(value: Value) -> Result<Self, ProxyError> {
        let Some(object) = value.as_object() else {
            return Err(ProxyError::Parse(
                "message is not a JSON object".to_string(),
            ));
        };

        if object.contains_key("setup") {
            Ok(Self::Setup(value))
        } else if object.contains_key("realtime_input") || object.contains_key("realtimeInput") {
            Ok(Self::RealtimeInput(value))
        } else if object.contains_key("serverContent") || object.contains_key("server_content") {
            Ok(Self::ServerContent(value))
        } else if let Some(body) = object.get("toolCall").or_else(|| object.get("tool_call")) {
            let call = ToolCall::deserialize(body)
                .map_err(|e| ProxyError::Parse(format!("malformed toolCall: {}", e)))?;
            Ok(Self::ToolCall(call))
        } else {
            Ok(Self::Other(value))
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            RelayedMessage::Setup(_) => MessageKind::Setup,
            RelayedMessage::RealtimeInput(_) => MessageKind::RealtimeInput,
            RelayedMessage::ServerContent(_) => MessageKind::ServerContent,
            RelayedMessage::ToolCall(_) => MessageKind::ToolCall,
            RelayedMessage::Other(_) => MessageKind::Other,
        }
    }

    /// Top-level keys, for logging unrecognised shapes.
    pub fn keys(&self) -> Vec<String> {
        match self {
            RelayedMessage::Setup(v)
            | RelayedMessage::RealtimeInput(v)
            | RelayedMessage::ServerContent(v)
            | RelayedMessage::Other(v) => v
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default(),
            RelayedMessage::ToolCall(_) => vec!["toolCall".to_string()],
        }
    }

    /// Whether server content carries inline (audio) data anywhere in it.
    pub fn has_inline_data(&self) -> bool {
        match self {
            RelayedMessage::ServerContent(v) => contains_key(v, "inlineData"),
            _ => false,
        }
    }
}

fn contains_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key) || map.values().any(|v| contains_key(v, key)),
        Value::Array(items) => items.iter().any(|v| contains_key(v, key)),
        _ => false,
    }
}
