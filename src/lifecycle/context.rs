use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LLMError;
use crate::stream::StreamHandle;

use super::registry::{CallControl, CallId, CallRegistry};
use super::{CallEvent, CallKind, CallSink};

struct CallState<T> {
    /// `None` while a callback is running or after the terminal event.
    sink: Option<Box<dyn CallSink<T>>>,
    loading: bool,
    closed: bool,
    /// Set when `cancel` found the sink busy; the running delivery finishes the job.
    cancel_pending: bool,
}

/// State of one logical call, owned by the coordinator's active slot and the registry.
///
/// Every callback goes through [`CallContext::deliver`] or [`CallContext::cancel`],
/// which move the sink out of the state while it runs. Deliveries therefore never
/// overlap, and a callback may call `cancel` without deadlocking.
pub(crate) struct CallContext<T> {
    operation: &'static str,
    kind: CallKind,
    state: Mutex<CallState<T>>,
    stream: Mutex<Option<StreamHandle>>,
    token: CancellationToken,
    registry: CallRegistry,
    id: OnceLock<CallId>,
}

impl<T> CallContext<T> {
    pub(crate) fn new(
        operation: &'static str,
        kind: CallKind,
        sink: Box<dyn CallSink<T>>,
        registry: CallRegistry,
    ) -> Self {
        Self {
            operation,
            kind,
            state: Mutex::new(CallState {
                sink: Some(sink),
                loading: kind != CallKind::Plain,
                closed: false,
                cancel_pending: false,
            }),
            stream: Mutex::new(None),
            token: CancellationToken::new(),
            registry,
            id: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_id(&self, id: CallId) {
        let _ = self.id.set(id);
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Binds the streaming call so teardown can abort it.
    pub(crate) fn attach(&self, handle: StreamHandle) {
        if self.lock().closed {
            handle.cancel();
            return;
        }
        *self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub(crate) fn is_loading(&self) -> bool {
        let state = self.lock();
        state.loading && !state.closed
    }

    pub(crate) fn heartbeat(&self) {
        self.deliver(false, |state| {
            if state.loading {
                vec![CallEvent::Loading(true)]
            } else {
                Vec::new()
            }
        });
    }

    /// Forwards one streamed chunk. The first one clears the loading indicator.
    pub(crate) fn chunk(&self, chunk: T) {
        self.deliver(false, |state| {
            let mut events = Self::clear_loading(state);
            events.push(CallEvent::Data(chunk));
            events
        });
    }

    /// Terminal success of a request/response call.
    pub(crate) fn succeed(&self, value: T) {
        self.deliver(true, |state| {
            let mut events = Self::clear_loading(state);
            events.push(CallEvent::Data(value));
            events
        });
    }

    /// Terminal success of a stream.
    pub(crate) fn complete(&self) {
        self.deliver(true, |state| {
            let mut events = Self::clear_loading(state);
            events.push(CallEvent::Completed);
            events
        });
    }

    pub(crate) fn fail(&self, err: LLMError) {
        debug!(operation = self.operation, error = %err, "call failed");
        self.deliver(true, |state| {
            let mut events = Self::clear_loading(state);
            events.push(CallEvent::Error(err));
            events
        });
    }

    /// Cancels the call without an error event.
    ///
    /// A lit loading indicator is turned off and stream calls still receive
    /// [`CallEvent::Completed`], each exactly once. Returns `false` if the call was
    /// already finished.
    pub(crate) fn cancel(&self) -> bool {
        let ready = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            match state.sink.take() {
                Some(sink) => Some((sink, self.cancel_events(&mut *state))),
                None => {
                    state.cancel_pending = true;
                    None
                }
            }
        };
        debug!(operation = self.operation, "call cancelled");
        self.release();

        if let Some((mut sink, events)) = ready {
            for event in events {
                sink.on_event(event);
            }
        }
        true
    }

    fn deliver<F>(&self, terminal: bool, build: F)
    where
        F: FnOnce(&mut CallState<T>) -> Vec<CallEvent<T>>,
    {
        let (mut sink, events) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let Some(sink) = state.sink.take() else {
                return;
            };
            let events = build(&mut *state);
            if terminal {
                state.closed = true;
            }
            (sink, events)
        };

        if terminal {
            for event in events {
                sink.on_event(event);
            }
            drop(sink);
            self.release();
            return;
        }

        // A cancel may land between two events; nothing but the cancel events follows it.
        let mut queue = VecDeque::from(events);
        loop {
            let next = {
                let mut state = self.lock();
                if state.cancel_pending {
                    state.cancel_pending = false;
                    let mut tail: Vec<CallEvent<T>> = queue
                        .drain(..)
                        .filter(|event| matches!(event, CallEvent::Loading(false)))
                        .collect();
                    tail.extend(self.cancel_events(&mut *state));
                    Err(tail)
                } else if let Some(event) = queue.pop_front() {
                    Ok(event)
                } else {
                    state.sink = Some(sink);
                    return;
                }
            };
            match next {
                Ok(event) => sink.on_event(event),
                Err(tail) => {
                    for event in tail {
                        sink.on_event(event);
                    }
                    return;
                }
            }
        }
    }

    fn clear_loading(state: &mut CallState<T>) -> Vec<CallEvent<T>> {
        if state.loading {
            state.loading = false;
            vec![CallEvent::Loading(false)]
        } else {
            Vec::new()
        }
    }

    fn cancel_events(&self, state: &mut CallState<T>) -> Vec<CallEvent<T>> {
        let mut events = Self::clear_loading(state);
        if self.kind == CallKind::Stream {
            events.push(CallEvent::Completed);
        }
        events
    }

    /// Stops the driver, aborts the network call and unregisters. Idempotent.
    pub(crate) fn release(&self) {
        self.token.cancel();
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stream) = stream {
            stream.cancel();
        }
        if let Some(id) = self.id.get() {
            self.registry.remove(*id);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T> CallControl for CallContext<T> {
    fn cancel(&self) {
        CallContext::cancel(self);
    }

    fn is_finished(&self) -> bool {
        self.is_closed()
    }
}
