//! Streaming pipeline: SSE framing, chunk decoding and the cancellable chunk stream.

mod controller;
mod decoder;
mod mapper;

pub use controller::{ChunkStream, StreamHandle, StreamOptions, open};
pub use decoder::{DONE_TOKEN, FrameDecoder, SseFrame};
pub use mapper::{StreamChunk, decode_chunk, json_decoder, raw_frames};
