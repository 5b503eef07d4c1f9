//! Google Generative Language API 次后端

mod error;
mod types;

pub use error::{GoogleError, GoogleErrorDetails};
pub(crate) use error::parse_error;
pub use types::*;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub(crate) fn generate_endpoint(base_url: &str, model: &str) -> String {
    format!("{}:generateContent", model_path(base_url, model))
}

/// Streaming variant; `alt=sse` switches the body to server-sent events.
pub(crate) fn stream_endpoint(base_url: &str, model: &str) -> String {
    format!("{}:streamGenerateContent?alt=sse", model_path(base_url, model))
}

fn model_path(base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let model = model.strip_prefix("models/").unwrap_or(model);
    if base.ends_with("/v1beta") {
        format!("{base}/models/{model}")
    } else {
        format!("{base}/v1beta/models/{model}")
    }
}
