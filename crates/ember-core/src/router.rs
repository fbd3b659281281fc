//! Backend selection and hot-swapping behind one handle.

use std::sync::{Arc, RwLock};

use tokio::sync::{watch, Mutex};

use crate::{
    collab::{CredentialProvider, SettingsStore},
    engine::{
        generate_full_with,
        network::{LocalServer, NetworkEngine, RemoteApi},
        AcceleratorEngine, Engine,
    },
    runtime::AcceleratorRuntime,
    BackendKind, EngineError, EngineStatus, GenerateOptions, GenerationResult, Listener,
    ListenerId, Listeners, ModelRef, TokenStats, Turn,
};

/// Builds a fresh engine for a backend.
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Engine>, EngineError>;
}

type AcceleratorConstructor = Box<dyn Fn() -> Result<Arc<dyn Engine>, EngineError> + Send + Sync>;

/// The stock factory: the two network backends, plus the accelerator when
/// a runtime is supplied.
pub struct EngineFactory {
    accelerator: Option<AcceleratorConstructor>,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    settings: Arc<dyn SettingsStore>,
}

impl EngineFactory {
    pub fn new(credentials: Arc<dyn CredentialProvider>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            accelerator: None,
            client: reqwest::Client::new(),
            credentials,
            settings,
        }
    }

    pub fn with_accelerator<R: AcceleratorRuntime>(mut self, runtime: Arc<R>) -> Self {
        self.accelerator = Some(Box::new(move || {
            let engine = AcceleratorEngine::spawn(runtime.clone())?;
            Ok(Arc::new(engine) as Arc<dyn Engine>)
        }));
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

impl BackendFactory for EngineFactory {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Engine>, EngineError> {
        let engine: Arc<dyn Engine> = match kind {
            BackendKind::Accelerator => match &self.accelerator {
                Some(construct) => construct()?,
                None => {
                    return Err(EngineError::Capability(
                        "this build has no accelerator backend".into(),
                    ))
                }
            },
            BackendKind::LocalServer => Arc::new(NetworkEngine::new(
                LocalServer,
                self.client.clone(),
                self.credentials.clone(),
                self.settings.clone(),
            )),
            BackendKind::RemoteApi => Arc::new(NetworkEngine::new(
                RemoteApi,
                self.client.clone(),
                self.credentials.clone(),
                self.settings.clone(),
            )),
        };
        Ok(engine)
    }
}

/// The single entry point the application talks to.
///
/// Holds at most one active engine. Subscribers registered here belong to
/// the router and are carried over, under the same ids, whenever the active
/// engine is replaced.
pub struct BackendRouter {
    factory: Box<dyn BackendFactory>,
    active: RwLock<Option<Arc<dyn Engine>>>,
    listeners: Listeners,
    swap: Mutex<()>,
}

impl BackendRouter {
    pub fn new(factory: impl BackendFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            active: RwLock::new(None),
            listeners: Listeners::new(),
            swap: Mutex::new(()),
        }
    }

    pub fn active(&self) -> Option<Arc<dyn Engine>> {
        self.active
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn set_active(&self, engine: Option<Arc<dyn Engine>>) -> Option<Arc<dyn Engine>> {
        let mut active = self.active.write().unwrap_or_else(|err| err.into_inner());
        std::mem::replace(&mut *active, engine)
    }

    fn require(&self) -> Result<Arc<dyn Engine>, EngineError> {
        self.active().ok_or(EngineError::NoActiveBackend)
    }

    /// Number of router-owned subscribers.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn on_message(&self, listener: Listener) -> ListenerId {
        let id = self.listeners.add(listener.clone());
        if let Some(engine) = self.active() {
            engine.listeners().insert(id, listener);
        }
        id
    }

    pub fn off_message(&self, id: ListenerId) -> bool {
        if let Some(engine) = self.active() {
            engine.listeners().remove(id);
        }
        self.listeners.remove(id)
    }

    /// Make `kind` the active backend, replacing the current engine if it
    /// serves a different backend.
    pub async fn activate(&self, kind: BackendKind) -> Result<Arc<dyn Engine>, EngineError> {
        let _swap = self.swap.lock().await;
        self.activate_locked(kind).await
    }

    async fn activate_locked(&self, kind: BackendKind) -> Result<Arc<dyn Engine>, EngineError> {
        if let Some(engine) = self.active().filter(|engine| engine.backend() == kind) {
            return Ok(engine);
        }

        if let Some(previous) = self.set_active(None) {
            tracing::info!(
                event = "backend_swap",
                from = %previous.backend(),
                to = %kind,
                "Swapping backend"
            );
            previous.terminate().await;
        }

        let engine = self.factory.create(kind)?;
        for (id, listener) in self.listeners.snapshot() {
            engine.listeners().insert(id, listener);
        }
        self.set_active(Some(engine.clone()));
        tracing::info!(event = "backend_active", backend = %kind, "Backend active");
        Ok(engine)
    }

    /// Route `model` to its backend and load it there.
    pub async fn load_model(&self, model: &ModelRef) -> Result<(), EngineError> {
        let load = {
            let _swap = self.swap.lock().await;
            let engine = self.activate_locked(model.kind).await?;
            engine.load_model(&model.name)
        };
        load.await
    }

    pub fn check(&self) -> Result<(), EngineError> {
        self.require()?.check();
        Ok(())
    }

    pub fn generate(&self, turns: Vec<Turn>, options: GenerateOptions) -> Result<(), EngineError> {
        self.require()?.generate(turns, options)
    }

    pub async fn generate_full(
        &self,
        turns: Vec<Turn>,
        options: GenerateOptions,
    ) -> Result<GenerationResult, EngineError> {
        self.generate_full_with(turns, options, |_| {}).await
    }

    pub async fn generate_full_with<F>(
        &self,
        turns: Vec<Turn>,
        options: GenerateOptions,
        on_token: F,
    ) -> Result<GenerationResult, EngineError>
    where
        F: FnMut(TokenStats),
    {
        let engine = self.require()?;
        generate_full_with(engine.as_ref(), turns, options, on_token).await
    }

    pub fn interrupt(&self) -> Result<(), EngineError> {
        self.require()?.interrupt();
        Ok(())
    }

    pub fn reset(&self) -> Result<(), EngineError> {
        self.require()?.reset();
        Ok(())
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.require()?.status())
    }

    pub fn is_ready(&self) -> Result<bool, EngineError> {
        Ok(self.require()?.is_ready())
    }

    pub fn is_generating(&self) -> Result<bool, EngineError> {
        Ok(self.require()?.is_generating())
    }

    /// Status of the engine active now; a swap leaves the receiver on the
    /// retired engine.
    pub fn subscribe_status(&self) -> Result<watch::Receiver<EngineStatus>, EngineError> {
        Ok(self.require()?.subscribe_status())
    }

    pub fn model_id(&self) -> Result<Option<String>, EngineError> {
        Ok(self.require()?.model_id())
    }

    pub fn backend(&self) -> Result<BackendKind, EngineError> {
        Ok(self.require()?.backend())
    }

    /// Terminate the active engine, if any.
    pub async fn terminate(&self) {
        let _swap = self.swap.lock().await;
        if let Some(engine) = self.set_active(None) {
            engine.terminate().await;
        }
    }
}
