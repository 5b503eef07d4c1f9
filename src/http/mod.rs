use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::error::LLMError;

/// Enumerates HTTP methods understood by the lightweight transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// Minimal HTTP request representation shared across backends.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Builds a body-less request.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Builds a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Builds a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Builds a POST request with a JSON request body.
    ///
    /// # Examples
    ///
    /// ```
    /// use genai_service::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        let mut request = Self::new(HttpMethod::Post, url);
        request
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        request.body = Some(body);
        request
    }

    /// Serializes `body` and builds a JSON POST request.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Validation`] when serialization fails; nothing is sent.
    pub fn json<T: Serialize + ?Sized>(url: impl Into<String>, body: &T) -> Result<Self, LLMError> {
        let payload = serde_json::to_vec(body).map_err(|err| LLMError::Validation {
            message: format!("failed to serialize request: {err}"),
        })?;
        Ok(Self::post_json(url, payload))
    }

    /// Adds or replaces a single header.
    ///
    /// # Examples
    ///
    /// ```
    /// use genai_service::http::HttpRequest;
    ///
    /// let request = HttpRequest::get("https://example.com").with_header("Accept", "text/event-stream");
    /// assert_eq!(request.headers.get("Accept"), Some(&"text/event-stream".to_string()));
    /// ```
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Merges `headers` into the request, replacing existing names.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Returns `true` for 2xx status codes.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
///
/// Dropping the stream must abort the underlying call.
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

/// Transport abstraction used to decouple the service from the concrete HTTP client.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    ///
    /// # Examples
    ///
    /// ```
    /// # use async_trait::async_trait;
    /// # use genai_service::http::{HttpTransport, HttpRequest, HttpResponse, HttpStreamResponse};
    /// # use genai_service::error::LLMError;
    /// # use futures_util::stream;
    /// struct MemoryTransport;
    ///
    /// #[async_trait]
    /// impl HttpTransport for MemoryTransport {
    ///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
    ///         Ok(HttpResponse { status: 200, headers: request.headers, body: b"ok".to_vec() })
    ///     }
    ///     async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
    ///         Ok(HttpStreamResponse { status: 200, headers: request.headers, body: Box::pin(stream::empty()) })
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let response = MemoryTransport
    ///     .send(HttpRequest::get("https://example.com"))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(response.status, 200);
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Implementations map connection failures to [`LLMError::Transport`].
    /// Non-2xx responses are returned as `Ok`; status handling belongs to the caller.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns as soon as the status line and headers arrive.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] for network failures. Body read failures are
    /// reported through the body stream instead.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

/// Drains a body stream and decodes it as UTF-8.
///
/// Used for error bodies of streaming calls, which are small and must be read
/// completely before they can be parsed.
pub async fn collect_body(mut body: HttpBodyStream) -> Result<String, LLMError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes)
        .map_err(|err| LLMError::transport(format!("failed to decode response body: {err}")))
}

#[cfg(test)]
pub(crate) mod mock;
pub mod reqwest;

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde::ser;

    /// Body type that intentionally fails serialization to trigger validation errors.
    struct NonSerializableBody;

    impl Serialize for NonSerializableBody {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(ser::Error::custom(
                "intentional serialization failure for test",
            ))
        }
    }

    #[test]
    fn json_request_reports_serde_error_as_validation() {
        match HttpRequest::json("http://example.com", &NonSerializableBody) {
            Err(LLMError::Validation { message }) => {
                assert!(
                    message.contains("failed to serialize request"),
                    "unexpected validation message: {message}"
                );
            }
            Ok(_) => panic!("expected validation error for non serializable body"),
            Err(other) => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn with_headers_keeps_content_type() {
        let request = HttpRequest::json("http://example.com", &serde_json::json!({"a": 1}))
            .expect("request")
            .with_headers(HashMap::from([(
                "Authorization".to_string(),
                "Bearer sk".to_string(),
            )]));
        assert_eq!(
            request.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            request.headers.get("Authorization").map(String::as_str),
            Some("Bearer sk")
        );
        assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
    }

    #[tokio::test]
    async fn collect_body_joins_chunks_and_propagates_errors() {
        let body: HttpBodyStream = Box::pin(stream::iter(vec![
            Ok(b"{\"error\":".to_vec()),
            Ok(b"{}}".to_vec()),
        ]));
        assert_eq!(collect_body(body).await.expect("text"), "{\"error\":{}}");

        let body: HttpBodyStream = Box::pin(stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(LLMError::transport("connection reset")),
        ]));
        assert!(matches!(
            collect_body(body).await,
            Err(LLMError::Transport { .. })
        ));
    }
}
