use serde::de::DeserializeOwned;

use crate::error::LLMError;

use super::decoder::SseFrame;

/// A typed unit of a streaming response.
pub trait StreamChunk: Send + 'static {
    /// Reports whether this chunk is the last meaningful one of the stream.
    ///
    /// Consumers stop reading, and release the connection, right after delivering a
    /// finished chunk.
    fn is_finished(&self) -> bool;
}

impl StreamChunk for SseFrame {
    fn is_finished(&self) -> bool {
        false
    }
}

/// Deserializes the data payload of `frame`.
///
/// Unknown fields are ignored. A payload that does not fit the schema yields
/// [`LLMError::Decode`] holding the raw text.
///
/// # Examples
///
/// ```
/// use genai_service::stream::{SseFrame, decode_chunk};
///
/// let frame = SseFrame { data: r#"{"id":"a","extra":true}"#.into(), ..SseFrame::default() };
/// let value: serde_json::Value = decode_chunk(&frame, "openai").unwrap();
/// assert_eq!(value["id"], "a");
/// ```
pub fn decode_chunk<T: DeserializeOwned>(
    frame: &SseFrame,
    provider: &'static str,
) -> Result<T, LLMError> {
    serde_json::from_str(&frame.data)
        .map_err(|err| LLMError::decode(provider, frame.data.clone(), err))
}

/// Builds the decode function that maps frames onto `T` as JSON.
pub fn json_decoder<T: DeserializeOwned + 'static>(
    provider: &'static str,
) -> impl Fn(SseFrame) -> Result<T, LLMError> + Send + 'static {
    move |frame| decode_chunk(&frame, provider)
}

/// Decode function that passes frames through untouched.
pub fn raw_frames() -> impl Fn(SseFrame) -> Result<SseFrame, LLMError> + Send + 'static {
    Ok
}
