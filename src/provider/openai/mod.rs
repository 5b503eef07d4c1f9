//! OpenAI 兼容后端 路由 数据结构与错误格式

mod error;
mod types;

pub use error::{OpenAiError, OpenAiErrorDetails};
pub(crate) use error::parse_error;
pub use types::*;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Joins `path` onto the base URL, inserting `/v1` unless the base already ends with it.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/{path}")
    } else {
        format!("{base}/v1/{path}")
    }
}
