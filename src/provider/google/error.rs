use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body returned by the Generative Language API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleError {
    pub error: GoogleErrorDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleErrorDetails {
    pub code: Option<u16>,
    pub message: Option<String>,
    /// RPC status name such as `RESOURCE_EXHAUSTED`.
    pub status: Option<String>,
    pub details: Vec<Value>,
}

pub(crate) fn parse_error(body: &str) -> Option<GoogleError> {
    serde_json::from_str(body).ok()
}
