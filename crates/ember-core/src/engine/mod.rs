//! The uniform façade every backend implements.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, RwLock,
};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch};

use crate::{
    BackendKind, EngineError, EngineEvent, EngineStatus, GenerateOptions, GenerationResult,
    ListenerId, Listeners, TokenStats, Turn,
};

pub mod accelerator;
pub mod network;

pub use accelerator::AcceleratorEngine;
pub use network::NetworkEngine;

/// One backend behind the common engine contract.
///
/// Progress is observed only through events delivered to [`listeners`];
/// the methods themselves never block on the backend.
///
/// [`listeners`]: Engine::listeners
pub trait Engine: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn status(&self) -> EngineStatus;

    fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    fn is_generating(&self) -> bool {
        self.status() == EngineStatus::Generating
    }

    fn subscribe_status(&self) -> watch::Receiver<EngineStatus>;

    fn model_id(&self) -> Option<String>;

    fn listeners(&self) -> &Listeners;

    /// Probe the backend. Emits exactly one `capabilityInfo` or `error`.
    fn check(&self);

    /// Start loading `model_id`.
    ///
    /// The status is `loading` when this returns. The future resolves once
    /// the load ends in `ready` or `error`; dropping it does not cancel the
    /// load.
    fn load_model(&self, model_id: &str) -> BoxFuture<'static, Result<(), EngineError>>;

    /// Start a generation session over the loaded model.
    ///
    /// Fails with [`EngineError::NotReady`] unless the status is `ready`, so
    /// a second session is never started while one is in flight.
    fn generate(&self, turns: Vec<Turn>, options: GenerateOptions) -> Result<(), EngineError>;

    fn interrupt(&self);

    fn reset(&self);

    /// Tear the backend down, releasing the resident model. A session still
    /// open is closed with an `error` event.
    fn terminate(&self) -> BoxFuture<'static, ()>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

type LoadResult = Result<(), EngineError>;

/// State shared by every façade: the authoritative status, the held model
/// identifier, and the subscriber set.
///
/// Backend events pass through [`dispatch`](Self::dispatch), which moves the
/// status along its edges before re-broadcasting, and drops anything that
/// would follow a session's terminal event.
#[derive(Debug)]
pub struct EngineCore {
    backend: BackendKind,
    status: watch::Sender<EngineStatus>,
    model: RwLock<Option<String>>,
    listeners: Listeners,
    session: AtomicBool,
    terminated: AtomicBool,
    pending: Mutex<Option<oneshot::Sender<LoadResult>>>,
}

impl EngineCore {
    pub fn new(backend: BackendKind) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        Self {
            backend,
            status,
            model: RwLock::new(None),
            listeners: Listeners::new(),
            session: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn model_id(&self) -> Option<String> {
        self.model
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    fn set_model(&self, model_id: Option<String>) {
        *self.model.write().unwrap_or_else(|err| err.into_inner()) = model_id;
    }

    /// Move to `next` if the status machine has that edge.
    fn transition(&self, next: EngineStatus) -> bool {
        let mut previous = None;
        let moved = self.status.send_if_modified(|status| {
            previous = Some(*status);
            match status.can_transition_to(next) {
                true => {
                    *status = next;
                    true
                }
                false => false,
            }
        });
        match (moved, previous) {
            (true, Some(previous)) => tracing::debug!(
                event = "status_change",
                backend = %self.backend,
                from = %previous,
                to = %next,
                "Engine status changed"
            ),
            (false, Some(previous)) if previous != next => tracing::debug!(
                event = "status_change_rejected",
                backend = %self.backend,
                from = %previous,
                to = %next,
                "Engine status edge does not exist"
            ),
            _ => {}
        }
        moved
    }

    /// Enter `loading` for `model_id`. The receiver resolves when the load
    /// ends.
    pub fn begin_load(&self, model_id: &str) -> Result<oneshot::Receiver<LoadResult>, EngineError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(EngineError::Terminated);
        }
        if !self.transition(EngineStatus::Loading) {
            return Err(EngineError::not_ready(self.status()));
        }
        self.set_model(Some(model_id.to_string()));
        let (sender, receiver) = oneshot::channel();
        *lock(&self.pending) = Some(sender);
        Ok(receiver)
    }

    /// Enter `generating` and open a session.
    pub fn begin_generate(&self) -> Result<(), EngineError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(EngineError::Terminated);
        }
        if !self.transition(EngineStatus::Generating) {
            return Err(EngineError::not_ready(self.status()));
        }
        self.session.store(true, Ordering::Release);
        Ok(())
    }

    /// End a load with `err`, announcing it as an `error` event.
    pub fn fail_load(&self, err: EngineError) {
        let event = EngineEvent::error(err.to_string());
        self.end_load(Err(err), event);
    }

    fn end_load(&self, result: LoadResult, event: EngineEvent) {
        let next = match result {
            Ok(()) => EngineStatus::Ready,
            Err(_) => EngineStatus::Idle,
        };
        if self.status() != EngineStatus::Loading || !self.transition(next) {
            tracing::debug!(
                event = "stale_load_event",
                backend = %self.backend,
                kind = event.kind(),
                "Load event outside of a load dropped"
            );
            return;
        }
        if result.is_err() {
            self.set_model(None);
        }
        self.listeners.emit(&event);
        if let Some(pending) = lock(&self.pending).take() {
            let _ = pending.send(result);
        }
    }

    /// Broadcast the answer to a `check`. Status, the held model and any
    /// open session are left as they are.
    pub fn report_check(&self, event: EngineEvent) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if let EngineEvent::Error { message } = &event {
            tracing::warn!(event = "check_failed", backend = %self.backend, error = %message, "Capability check failed");
        }
        self.listeners.emit(&event);
    }

    /// Apply a backend event to the status and re-broadcast it.
    pub fn dispatch(&self, event: EngineEvent) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        match &event {
            EngineEvent::Ready => self.end_load(Ok(()), event),
            EngineEvent::Error { message } => {
                if self.session.swap(false, Ordering::AcqRel) {
                    self.transition(EngineStatus::Ready);
                    self.listeners.emit(&event);
                } else if self.status() == EngineStatus::Loading {
                    let err = EngineError::Load(message.clone());
                    self.end_load(Err(err), event);
                } else {
                    self.listeners.emit(&event);
                }
            }
            EngineEvent::Complete { .. } => {
                if self.session.swap(false, Ordering::AcqRel) {
                    self.transition(EngineStatus::Ready);
                    self.listeners.emit(&event);
                }
            }
            event if event.is_session_event() => {
                if self.session.load(Ordering::Acquire) {
                    self.listeners.emit(event);
                }
            }
            _ => self.listeners.emit(&event),
        }
    }

    /// Close the core: an open session ends with a synthetic `error` and a
    /// pending load resolves with [`EngineError::Terminated`]. Nothing is
    /// dispatched afterwards.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.session.swap(false, Ordering::AcqRel) {
            self.transition(EngineStatus::Ready);
            self.listeners
                .emit(&EngineEvent::error(EngineError::Terminated.to_string()));
        }
        if self.status() == EngineStatus::Loading {
            self.transition(EngineStatus::Idle);
            self.set_model(None);
        }
        if let Some(pending) = lock(&self.pending).take() {
            let _ = pending.send(Err(EngineError::Terminated));
        }
        tracing::info!(event = "engine_terminated", backend = %self.backend, "Engine terminated");
    }
}

/// Wait for a load started with [`EngineCore::begin_load`].
pub(crate) async fn await_load(receiver: oneshot::Receiver<LoadResult>) -> LoadResult {
    receiver.await.unwrap_or(Err(EngineError::Terminated))
}

struct Subscription<'a> {
    listeners: &'a Listeners,
    id: ListenerId,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.listeners.remove(self.id);
    }
}

/// Run one session to completion and collect its answer.
pub async fn generate_full(
    engine: &dyn Engine,
    turns: Vec<Turn>,
    options: GenerateOptions,
) -> Result<GenerationResult, EngineError> {
    generate_full_with(engine, turns, options, |_| {}).await
}

/// Like [`generate_full`], calling `on_token` with the running statistics on
/// every update.
///
/// Text streamed before an `error` is discarded. The private listener is
/// removed however the session ends.
pub async fn generate_full_with<F>(
    engine: &dyn Engine,
    turns: Vec<Turn>,
    options: GenerateOptions,
    mut on_token: F,
) -> Result<GenerationResult, EngineError>
where
    F: FnMut(TokenStats),
{
    let (sender, receiver) = flume::unbounded();
    let id = engine.listeners().add(Arc::new(move |event: &EngineEvent| {
        let _ = sender.send(event.clone());
    }));
    let _subscription = Subscription {
        listeners: engine.listeners(),
        id,
    };

    engine.generate(turns, options)?;

    let mut text = String::new();
    while let Ok(event) = receiver.recv_async().await {
        match event {
            EngineEvent::Update {
                output,
                tokens_per_second,
                token_count,
            } => {
                text.push_str(&output);
                on_token(TokenStats {
                    tokens_per_second,
                    token_count,
                });
            }
            EngineEvent::Complete {
                tokens_per_second,
                token_count,
                input_tokens,
            } => {
                return Ok(GenerationResult {
                    text,
                    tokens_per_second,
                    token_count,
                    input_tokens,
                })
            }
            EngineEvent::Error { message } => return Err(EngineError::Generation(message)),
            _ => {}
        }
    }
    Err(EngineError::Terminated)
}
