use std::{
    sync::{Arc, Mutex},
    thread,
};

use flume::Sender;
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::watch;

use super::{await_load, lock, Engine, EngineCore};
use crate::{
    runtime::AcceleratorRuntime,
    worker::{self, Reply},
    BackendKind, Command, EngineError, EngineEvent, EngineStatus, GenerateOptions, Listeners, Turn,
};

/// Façade over the accelerator worker thread.
///
/// Commands cross to the worker over one channel and events come back over
/// another, where a forwarding task feeds them into the shared core.
pub struct AcceleratorEngine {
    core: Arc<EngineCore>,
    commands: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    forward: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AcceleratorEngine {
    /// Start a worker for `runtime`. Must be called within a tokio runtime.
    pub fn spawn<R: AcceleratorRuntime>(runtime: Arc<R>) -> Result<Self, EngineError> {
        let (command_sender, command_receiver) = flume::unbounded();
        let (event_sender, event_receiver) = flume::unbounded();
        let thread = worker::spawn(runtime, command_receiver, event_sender)
            .map_err(|err| EngineError::Capability(format!("failed to start worker: {err}")))?;

        let core = Arc::new(EngineCore::new(BackendKind::Accelerator));
        let forward = {
            let core = core.clone();
            tokio::spawn(async move {
                while let Ok(reply) = event_receiver.recv_async().await {
                    match reply {
                        Reply::Check(event) => core.report_check(event),
                        Reply::Event(event) => core.dispatch(event),
                    }
                }
            })
        };
        tracing::info!(event = "engine_spawned", backend = %BackendKind::Accelerator, "Accelerator worker spawned");

        Ok(Self {
            core,
            commands: Mutex::new(Some(command_sender)),
            thread: Mutex::new(Some(thread)),
            forward: Mutex::new(Some(forward)),
        })
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        match &*lock(&self.commands) {
            Some(sender) => sender.send(command).map_err(|_| EngineError::Terminated),
            None => Err(EngineError::Terminated),
        }
    }
}

impl Engine for AcceleratorEngine {
    fn backend(&self) -> BackendKind {
        self.core.backend()
    }

    fn status(&self) -> EngineStatus {
        self.core.status()
    }

    fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.core.subscribe_status()
    }

    fn model_id(&self) -> Option<String> {
        self.core.model_id()
    }

    fn listeners(&self) -> &Listeners {
        self.core.listeners()
    }

    fn check(&self) {
        if let Err(err) = self.send(Command::Check) {
            self.core.report_check(EngineEvent::error(err.to_string()));
        }
    }

    fn load_model(&self, model_id: &str) -> BoxFuture<'static, Result<(), EngineError>> {
        let receiver = match self.core.begin_load(model_id) {
            Ok(receiver) => receiver,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };
        let command = Command::Load {
            model_id: model_id.to_string(),
        };
        if let Err(err) = self.send(command) {
            self.core.fail_load(err);
        }
        await_load(receiver).boxed()
    }

    fn generate(&self, turns: Vec<Turn>, options: GenerateOptions) -> Result<(), EngineError> {
        self.core.begin_generate()?;
        let sent = self
            .send(Command::Reset)
            .and_then(|_| self.send(Command::Generate { turns, options }));
        if let Err(err) = sent {
            self.core.dispatch(EngineEvent::error(err.to_string()));
            return Err(err);
        }
        Ok(())
    }

    fn interrupt(&self) {
        let _ = self.send(Command::Interrupt);
    }

    fn reset(&self) {
        let _ = self.send(Command::Reset);
    }

    fn terminate(&self) -> BoxFuture<'static, ()> {
        let _ = self.send(Command::Interrupt);
        // the worker exits once its command channel closes
        lock(&self.commands).take();
        let thread = lock(&self.thread).take();
        let forward = lock(&self.forward).take();
        let core = self.core.clone();

        async move {
            if let Some(thread) = thread {
                let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                if !matches!(joined, Ok(Ok(()))) {
                    tracing::warn!(event = "worker_join_failed", "Accelerator worker did not exit cleanly");
                }
            }
            if let Some(forward) = forward {
                let _ = forward.await;
            }
            core.terminate();
        }
        .boxed()
    }
}
