//! OpenAI 兼容接口与 Google Generative Language API 的统一调用库
//!
//! [`AiService`] offers every operation three ways: awaitable
//! (`create_chat_completion`), as a raw [`ChunkStream`] (`stream_chat_completion`),
//! and through a [`CallSink`] callback (`stream_chat_completion_with`) that reports
//! loading state, data, errors and completion in a fixed order.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod provider;
pub mod stream;

pub use client::{AiService, AiServiceBuilder};
pub use config::{ServiceConfig, build_service};
pub use error::{LLMError, ProviderErrorPayload};
pub use lifecycle::{CallEvent, CallId, CallKind, CallRegistry, CallSink, Coordinator};
pub use provider::{ProviderContext, ProviderKind};
pub use stream::{ChunkStream, SseFrame, StreamChunk, StreamHandle, StreamOptions};
