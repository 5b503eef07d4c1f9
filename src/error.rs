use std::time::Duration;

use thiserror::Error;

use crate::provider::google::GoogleError;
use crate::provider::openai::OpenAiError;

/// Aggregates every failure mode exposed by the service and its streaming pipeline.
///
/// Every variant is terminal for the call that produced it. Nothing in the crate
/// retries on its own, so callers decide whether to resend, switch backend, or
/// surface the message.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Connection or I/O failure before or while reading the response body.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Non-2xx response whose body parsed under the provider's error schema.
    #[error("provider {provider} returned HTTP {status}: {}", error.message())]
    ProviderHttp {
        /// Name of the backend, such as `openai`.
        provider: &'static str,
        /// HTTP status code of the response.
        status: u16,
        /// Parsed error payload.
        error: ProviderErrorPayload,
        /// Wait duration suggested through `Retry-After`, if any.
        retry_after: Option<Duration>,
    },
    /// Non-2xx response whose body was absent or did not match the error schema.
    #[error("provider {provider} returned HTTP {status}")]
    UnparseableHttp {
        provider: &'static str,
        status: u16,
        /// Raw body, kept verbatim when one was received.
        body: Option<String>,
    },
    /// A payload could not be deserialized into the expected schema.
    #[error("failed to decode {provider} payload: {message}")]
    Decode {
        provider: &'static str,
        /// Offending text exactly as received.
        raw: String,
        /// Deserializer diagnostic.
        message: String,
    },
    /// Invalid or inconsistent configuration, detected before any request is sent.
    #[error("invalid configuration for {field}: {reason}")]
    Configuration {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use genai_service::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Decode`] carrying the raw text that failed to parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use genai_service::error::LLMError;
    ///
    /// let err = LLMError::decode("openai", "{not json", "expected value");
    /// match err {
    ///     LLMError::Decode { raw, .. } => assert_eq!(raw, "{not json"),
    ///     _ => unreachable!(),
    /// }
    /// ```
    pub fn decode(
        provider: &'static str,
        raw: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Decode {
            provider,
            raw: raw.into(),
            message: message.to_string(),
        }
    }

    /// Creates an [`LLMError::Configuration`] for the named field.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status attached to the error, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ProviderHttp { status, .. } | Self::UnparseableHttp { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Returns `true` for HTTP 429 responses.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

/// Provider-specific error body attached to [`LLMError::ProviderHttp`].
#[derive(Debug, Clone)]
pub enum ProviderErrorPayload {
    OpenAi(OpenAiError),
    Google(GoogleError),
}

impl ProviderErrorPayload {
    /// Human-readable message reported by the backend.
    pub fn message(&self) -> &str {
        let message = match self {
            Self::OpenAi(error) => error.error.message.as_deref(),
            Self::Google(error) => error.error.message.as_deref(),
        };
        message.unwrap_or("unknown error")
    }

    /// Machine-readable code, rendered as text. OpenAI codes may be strings or
    /// numbers; Google reports its RPC status name.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::OpenAi(error) => error.error.code.as_ref().map(|code| match code {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            }),
            Self::Google(error) => error.error.status.clone(),
        }
    }
}
