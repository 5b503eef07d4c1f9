use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LLMError;
use crate::http::{DynHttpTransport, HttpRequest, collect_body, is_success};
use crate::lifecycle::{CallControl, CallRegistry};
use crate::provider::ProviderKind;

use super::decoder::{FrameDecoder, SseFrame};

/// Per-stream decoding switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Deliver the `[DONE]` sentinel as a frame instead of filtering it.
    pub emit_done: bool,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ReleaseState {
    released: bool,
    hooks: Vec<ReleaseHook>,
}

struct HandleInner {
    token: CancellationToken,
    release: Mutex<ReleaseState>,
}

/// Live handle of one streaming network call.
///
/// Clones share the same call. The handle is released exactly once, when the
/// stream ends, fails, or is cancelled.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

impl StreamHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                token: CancellationToken::new(),
                release: Mutex::new(ReleaseState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReleaseState> {
        self.inner
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Aborts the call. Safe to call repeatedly and after the stream has ended.
    pub fn cancel(&self) {
        if !self.is_released() {
            debug!("cancelling stream");
        }
        self.inner.token.cancel();
        self.release();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns `true` once the call reached a terminal state.
    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn release(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.released {
                return;
            }
            state.released = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Runs `hook` on release, immediately if that already happened.
    pub(crate) fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            if !state.released {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl CallControl for StreamHandle {
    fn cancel(&self) {
        StreamHandle::cancel(self);
    }

    fn is_finished(&self) -> bool {
        self.is_released()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("cancelled", &self.is_cancelled())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Cancellable, in-order sequence of decoded chunks from one streaming call.
///
/// Chunks are buffered without bound while the consumer is slower than the wire.
/// The sequence yields nothing after the first error or after cancellation, and
/// dropping it cancels the call.
pub struct ChunkStream<T> {
    receiver: mpsc::UnboundedReceiver<Result<T, LLMError>>,
    handle: StreamHandle,
    failed: bool,
}

impl<T> ChunkStream<T> {
    /// Handle that cancels this stream from elsewhere.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Lists the stream in `registry` until it reaches a terminal state.
    pub fn register(self, registry: &CallRegistry, operation: &'static str) -> Self {
        let id = registry.register(operation, Arc::new(self.handle.clone()));
        let registry = registry.clone();
        self.handle.on_release(move || registry.remove(id));
        self
    }
}

impl<T> Stream for ChunkStream<T> {
    type Item = Result<T, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed || this.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                this.failed = true;
                this.handle.release();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.handle.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Unpin for ChunkStream<T> {}

impl<T> Drop for ChunkStream<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

impl<T> fmt::Debug for ChunkStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream")
            .field("handle", &self.handle)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Issues `request` once and streams its body through `decode`.
///
/// The call runs on a spawned task, so this must be called within a tokio runtime.
/// A non-2xx status ends the stream with the provider's typed HTTP error.
pub fn open<T, F>(
    transport: DynHttpTransport,
    request: HttpRequest,
    provider: ProviderKind,
    options: StreamOptions,
    decode: F,
) -> ChunkStream<T>
where
    T: Send + 'static,
    F: Fn(SseFrame) -> Result<T, LLMError> + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = StreamHandle::new();
    let token = handle.token();

    debug!(provider = provider.name(), url = %request.url, "opening stream");
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(provider = provider.name(), "stream call aborted");
            }
            _ = pump(transport, request, provider, options, decode, sender) => {}
        }
    });

    ChunkStream {
        receiver,
        handle,
        failed: false,
    }
}

async fn pump<T, F>(
    transport: DynHttpTransport,
    request: HttpRequest,
    provider: ProviderKind,
    options: StreamOptions,
    decode: F,
    sender: mpsc::UnboundedSender<Result<T, LLMError>>,
) where
    F: Fn(SseFrame) -> Result<T, LLMError>,
{
    let response = match transport.send_stream(request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(provider = provider.name(), error = %err, "stream request failed");
            let _ = sender.send(Err(err));
            return;
        }
    };

    if !is_success(response.status) {
        let body = collect_body(response.body)
            .await
            .ok()
            .filter(|text| !text.trim().is_empty());
        debug!(
            provider = provider.name(),
            status = response.status,
            "stream rejected"
        );
        let _ = sender.send(Err(provider.http_error(
            response.status,
            &response.headers,
            body,
        )));
        return;
    }

    let mut frames =
        FrameDecoder::new(response.body, provider.name()).emit_done(options.emit_done);
    while let Some(frame) = frames.next().await {
        let item = frame.and_then(&decode);
        let failed = item.is_err();
        if let Err(err) = &item {
            debug!(provider = provider.name(), error = %err, "stream failed");
        }
        if sender.send(item).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::http::mock::MockTransport;
    use crate::stream::{json_decoder, raw_frames};

    fn chat_request() -> HttpRequest {
        HttpRequest::post_json("https://api.openai.com/v1/chat/completions", b"{}".to_vec())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn chunks_arrive_in_wire_order() {
        let transport = Arc::new(MockTransport::new().stream(
            200,
            &[
                "data: {\"n\":1}\n\ndata: {\"n\"",
                ":2}\n\ndata: {\"n\":3}\n\n",
                "data: [DONE]\n\n",
            ],
        ));
        let stream = open(
            transport.clone(),
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions::default(),
            json_decoder::<Value>("openai"),
        );

        let values: Vec<i64> = stream
            .map(|item| item.expect("chunk")["n"].as_i64().expect("n"))
            .collect()
            .await;
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn raw_frames_can_include_the_sentinel() {
        let transport = Arc::new(
            MockTransport::new().stream(200, &["event: delta\ndata: x\n\ndata: [DONE]\n\n"]),
        );
        let frames: Vec<SseFrame> = open(
            transport,
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions { emit_done: true },
            raw_frames(),
        )
        .map(|item| item.expect("frame"))
        .collect()
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("delta"));
        assert!(frames[1].is_done());
    }

    #[tokio::test]
    async fn error_status_is_parsed_with_the_provider_schema() {
        let transport = Arc::new(
            MockTransport::new().reply(429, r#"{"error":{"message":"rate limited"}}"#),
        );
        let mut stream = open(
            transport,
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions::default(),
            json_decoder::<Value>("openai"),
        );

        match stream.next().await {
            Some(Err(LLMError::ProviderHttp { status, error, .. })) => {
                assert_eq!(status, 429);
                assert_eq!(error.message(), "rate limited");
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_error_body_is_unparseable() {
        let transport = Arc::new(MockTransport::new().reply(503, ""));
        let mut stream = open(
            transport,
            chat_request(),
            ProviderKind::Google,
            StreamOptions::default(),
            raw_frames(),
        );
        assert!(matches!(
            stream.next().await,
            Some(Err(LLMError::UnparseableHttp {
                status: 503,
                body: None,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn decode_failure_stops_the_stream() {
        let transport = Arc::new(MockTransport::new().stream(
            200,
            &["data: {\"n\":1}\n\ndata: {oops\n\ndata: {\"n\":3}\n\n"],
        ));
        let items: Vec<Result<Value, LLMError>> = open(
            transport,
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions::default(),
            json_decoder::<Value>("openai"),
        )
        .collect()
        .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        match &items[1] {
            Err(LLMError::Decode { raw, .. }) => assert_eq!(raw, "{oops"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_drops_the_body_and_discards_queued_chunks() {
        let transport = Arc::new(
            MockTransport::new().stream_open(&["data: {\"n\":1}\n\ndata: {\"n\":2}\n\n"]),
        );
        let registry = CallRegistry::new();
        let mut stream = open(
            transport.clone(),
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions::default(),
            json_decoder::<Value>("openai"),
        )
        .register(&registry, "streamChatCompletion");
        assert_eq!(registry.len(), 1);

        let first = stream.next().await.expect("item").expect("chunk");
        assert_eq!(first["n"], 1);

        stream.cancel();
        stream.cancel();
        assert!(stream.next().await.is_none());
        assert!(registry.is_empty());
        wait_until(|| transport.dropped_bodies() == 1).await;
    }

    #[tokio::test]
    async fn natural_end_unregisters_the_stream() {
        let transport = Arc::new(MockTransport::new().stream(200, &["data: {}\n\n"]));
        let registry = CallRegistry::new();
        let stream = open(
            transport,
            chat_request(),
            ProviderKind::OpenAi,
            StreamOptions::default(),
            raw_frames(),
        )
        .register(&registry, "stream");
        let handle = stream.handle();

        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(registry.is_empty());
        assert!(handle.is_released());
        handle.cancel();
    }
}
