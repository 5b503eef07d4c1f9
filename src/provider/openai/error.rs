use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body returned by OpenAI-compatible servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiError {
    pub error: OpenAiErrorDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiErrorDetails {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub param: Option<Value>,
    /// Some servers send a string, others a number.
    #[serde(default)]
    pub code: Option<Value>,
}

pub(crate) fn parse_error(body: &str) -> Option<OpenAiError> {
    serde_json::from_str(body).ok()
}
