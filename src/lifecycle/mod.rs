//! Callback-style call lifecycle: loading heartbeat, terminal events and cancellation.
//!
//! Every call, streaming or not, reports through one [`CallEvent`] type. The
//! sequence for one call is
//!
//! ```text
//! Loading(true)*  Loading(false)  Data*  (Completed | Error)
//! ```
//!
//! where `Loading(false)` precedes the first `Data` and appears exactly once, and
//! the terminal event is always last. [`CallKind::Plain`] calls carry no loading
//! events and [`CallKind::Single`] calls end with their single `Data`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::LLMError;
use crate::stream::{ChunkStream, StreamChunk};

mod context;
mod registry;

use context::CallContext;
pub(crate) use registry::CallControl;
pub use registry::{CallId, CallRegistry};

/// Interval between `Loading(true)` signals while no data has arrived.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// One signal delivered to a call's sink.
#[derive(Debug)]
pub enum CallEvent<T> {
    /// Loading indicator; `true` is repeated on every heartbeat.
    Loading(bool),
    /// A streamed chunk, or the result of a request/response call.
    Data(T),
    /// Terminal failure.
    Error(LLMError),
    /// Terminal end of a stream. Also sent when a stream is cancelled.
    Completed,
}

impl<T> CallEvent<T> {
    /// Returns `true` for events after which nothing else is delivered.
    pub fn is_terminal(&self, kind: CallKind) -> bool {
        match self {
            Self::Error(_) | Self::Completed => true,
            Self::Data(_) => kind != CallKind::Stream,
            Self::Loading(_) => false,
        }
    }
}

/// Receiver of [`CallEvent`]s. Invocations for one call never overlap.
pub trait CallSink<T>: Send {
    fn on_event(&mut self, event: CallEvent<T>);
}

impl<T, F> CallSink<T> for F
where
    F: FnMut(CallEvent<T>) + Send,
{
    fn on_event(&mut self, event: CallEvent<T>) {
        self(event)
    }
}

/// Shape of a callback call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Result or error only.
    Plain,
    /// Result or error, with a loading indicator.
    Single,
    /// Chunks, with a loading indicator and a completion signal.
    Stream,
}

/// Runs callback calls, at most one at a time.
///
/// Starting a call cancels the unfinished previous one first. Calls are listed in
/// the shared [`CallRegistry`] until they reach a terminal state.
///
/// Calls run on the tokio runtime captured at construction (or set through
/// [`Coordinator::with_runtime`]), so they may be started from any thread.
pub struct Coordinator {
    registry: CallRegistry,
    heartbeat_interval: Duration,
    runtime: Option<Handle>,
    active: Mutex<Option<(CallId, Arc<dyn CallControl>)>>,
}

impl Coordinator {
    /// Creates a coordinator bound to the current tokio runtime, if there is one.
    pub fn new(registry: CallRegistry) -> Self {
        Self {
            registry,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            runtime: Handle::try_current().ok(),
            active: Mutex::new(None),
        }
    }

    /// Runs calls on `runtime` instead of the one captured by [`Coordinator::new`].
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Runtime that call tasks are spawned on.
    ///
    /// Falls back to the caller's runtime. Without either the call cannot run and
    /// this returns [`LLMError::Configuration`].
    pub fn runtime(&self) -> Result<Handle, LLMError> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.clone()),
            None => Handle::try_current().map_err(|_| {
                LLMError::configuration("runtime", "no tokio runtime to run the call on")
            }),
        }
    }

    /// Overrides the heartbeat interval; values below one millisecond are raised to it.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    /// Id of the unfinished call, if any.
    pub fn active_call(&self) -> Option<CallId> {
        self.lock_active()
            .as_ref()
            .filter(|(_, call)| !call.is_finished())
            .map(|(id, _)| *id)
    }

    /// Cancels the active call. Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        let active = self.lock_active().take();
        match active {
            Some((_, call)) if !call.is_finished() => {
                call.cancel();
                true
            }
            _ => false,
        }
    }

    /// Starts a streaming call.
    ///
    /// `open` runs after the previous call has been cancelled. An error from it is
    /// reported through the sink like any other failure.
    pub fn run_stream<T, O, S>(&self, operation: &'static str, open: O, sink: S) -> CallId
    where
        T: StreamChunk,
        O: FnOnce() -> Result<ChunkStream<T>, LLMError>,
        S: CallSink<T> + 'static,
    {
        let (id, context) = self.begin(operation, CallKind::Stream, Box::new(sink));
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(err) => {
                context.heartbeat();
                context.fail(err);
                return id;
            }
        };
        let _entered = runtime.enter();
        match open() {
            Ok(stream) => {
                context.attach(stream.handle());
                runtime.spawn(drive_stream(context, stream, self.heartbeat_interval));
            }
            Err(err) => {
                context.heartbeat();
                context.fail(err);
            }
        }
        id
    }

    /// Starts a request/response call with a loading indicator.
    pub fn run_single<T, Fut, S>(&self, operation: &'static str, request: Fut, sink: S) -> CallId
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, LLMError>> + Send + 'static,
        S: CallSink<T> + 'static,
    {
        self.run_request(operation, CallKind::Single, request, Box::new(sink))
    }

    /// Starts a request/response call that reports only its outcome.
    pub fn run_plain<T, Fut, S>(&self, operation: &'static str, request: Fut, sink: S) -> CallId
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, LLMError>> + Send + 'static,
        S: CallSink<T> + 'static,
    {
        self.run_request(operation, CallKind::Plain, request, Box::new(sink))
    }

    fn run_request<T, Fut>(
        &self,
        operation: &'static str,
        kind: CallKind,
        request: Fut,
        sink: Box<dyn CallSink<T>>,
    ) -> CallId
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, LLMError>> + Send + 'static,
    {
        let (id, context) = self.begin(operation, kind, sink);
        match self.runtime() {
            Ok(runtime) => {
                runtime.spawn(drive_request(context, request, self.heartbeat_interval));
            }
            Err(err) => {
                context.heartbeat();
                context.fail(err);
            }
        }
        id
    }

    fn begin<T: Send + 'static>(
        &self,
        operation: &'static str,
        kind: CallKind,
        sink: Box<dyn CallSink<T>>,
    ) -> (CallId, Arc<CallContext<T>>) {
        let previous = self.lock_active().take();
        if let Some((previous_id, previous)) = previous {
            if !previous.is_finished() {
                debug!(call = %previous_id, "replacing unfinished call");
                previous.cancel();
            }
        }

        let context = Arc::new(CallContext::new(
            operation,
            kind,
            sink,
            self.registry.clone(),
        ));
        let control: Arc<dyn CallControl> = context.clone();
        let id = self.registry.register(operation, control.clone());
        context.set_id(id);
        debug!(call = %id, operation, ?kind, "call started");

        let displaced = self.lock_active().replace((id, control));
        if let Some((_, displaced)) = displaced {
            displaced.cancel();
        }
        (id, context)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<(CallId, Arc<dyn CallControl>)>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("has_runtime", &self.runtime.is_some())
            .field("active_call", &self.active_call())
            .finish()
    }
}

/// Ticks once per `interval`, starting one interval from now. The signal at call
/// start is sent by the driver itself.
fn heartbeat(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn drive_stream<T: StreamChunk>(
    context: Arc<CallContext<T>>,
    mut stream: ChunkStream<T>,
    interval: Duration,
) {
    let token = context.token();
    let mut ticker = heartbeat(interval);
    context.heartbeat();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick(), if context.is_loading() => context.heartbeat(),
            item = stream.next() => match item {
                Some(Ok(chunk)) => {
                    let finished = chunk.is_finished();
                    context.chunk(chunk);
                    if finished {
                        stream.cancel();
                        context.complete();
                        break;
                    }
                }
                Some(Err(err)) => {
                    context.fail(err);
                    break;
                }
                None => {
                    context.complete();
                    break;
                }
            },
        }
    }
    context.release();
}

async fn drive_request<T, Fut>(context: Arc<CallContext<T>>, request: Fut, interval: Duration)
where
    Fut: Future<Output = Result<T, LLMError>>,
{
    let token = context.token();
    let mut ticker = heartbeat(interval);
    context.heartbeat();
    tokio::pin!(request);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick(), if context.is_loading() => context.heartbeat(),
            result = &mut request => {
                match result {
                    Ok(value) => context.succeed(value),
                    Err(err) => context.fail(err),
                }
                break;
            }
        }
    }
    context.release();
}
