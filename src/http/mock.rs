//! In-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream;

use crate::error::LLMError;

use super::{HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

enum Reply {
    Full {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    Stream {
        status: u16,
        chunks: Vec<Vec<u8>>,
        hold_open: bool,
    },
    Fail(String),
}

/// Answers requests from a queue of scripted replies, in order.
#[derive(Default)]
pub(crate) struct MockTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
    dropped_bodies: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, status: u16, body: &str) -> Self {
        self.reply_with_headers(status, HashMap::new(), body)
    }

    pub(crate) fn reply_with_headers(
        self,
        status: u16,
        headers: HashMap<String, String>,
        body: &str,
    ) -> Self {
        self.push(Reply::Full {
            status,
            headers,
            body: body.to_string(),
        })
    }

    /// Streams `chunks` and closes the body.
    pub(crate) fn stream(self, status: u16, chunks: &[&str]) -> Self {
        self.push(Reply::Stream {
            status,
            chunks: chunks.iter().map(|chunk| chunk.as_bytes().to_vec()).collect(),
            hold_open: false,
        })
    }

    /// Streams `chunks` and then keeps the body open until it is dropped.
    pub(crate) fn stream_open(self, chunks: &[&str]) -> Self {
        self.push(Reply::Stream {
            status: 200,
            chunks: chunks.iter().map(|chunk| chunk.as_bytes().to_vec()).collect(),
            hold_open: true,
        })
    }

    pub(crate) fn fail(self, message: &str) -> Self {
        self.push(Reply::Fail(message.to_string()))
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn dropped_bodies(&self) -> usize {
        self.dropped_bodies.load(Ordering::SeqCst)
    }

    fn push(self, reply: Reply) -> Self {
        self.replies.lock().expect("replies lock").push_back(reply);
        self
    }

    fn next_reply(&self, request: HttpRequest) -> Result<Reply, LLMError> {
        self.requests.lock().expect("requests lock").push(request);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| LLMError::transport("no scripted reply left"))
    }
}

struct GuardedBody {
    inner: HttpBodyStream,
    dropped: Arc<AtomicUsize>,
}

impl Stream for GuardedBody {
    type Item = Result<Vec<u8>, LLMError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        match self.next_reply(request)? {
            Reply::Full {
                status,
                headers,
                body,
            } => Ok(HttpResponse {
                status,
                headers,
                body: body.into_bytes(),
            }),
            Reply::Stream { status, chunks, .. } => Ok(HttpResponse {
                status,
                headers: HashMap::new(),
                body: chunks.concat(),
            }),
            Reply::Fail(message) => Err(LLMError::transport(message)),
        }
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let (status, headers, chunks, hold_open) = match self.next_reply(request)? {
            Reply::Full {
                status,
                headers,
                body,
            } => (status, headers, vec![body.into_bytes()], false),
            Reply::Stream {
                status,
                chunks,
                hold_open,
            } => (status, HashMap::new(), chunks, hold_open),
            Reply::Fail(message) => return Err(LLMError::transport(message)),
        };

        let scripted = stream::iter(chunks.into_iter().map(Ok::<Vec<u8>, LLMError>));
        let inner: HttpBodyStream = if hold_open {
            Box::pin(scripted.chain(stream::pending()))
        } else {
            Box::pin(scripted)
        };
        let body: HttpBodyStream = Box::pin(GuardedBody {
            inner,
            dropped: Arc::clone(&self.dropped_bodies),
        });

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}
