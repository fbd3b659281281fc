//! Façade over a backend reached by an HTTP streaming request.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::sync::watch;

use super::{await_load, lock, Engine, EngineCore};
use crate::{
    collab::{CredentialProvider, SettingsStore},
    session::Session,
    stopping::StoppingController,
    BackendKind, CapabilityInfo, EngineError, EngineEvent, EngineStatus, FinishReason,
    GenerateOptions, Listeners, Turn,
};

pub mod local_server;
pub mod remote_api;

pub use local_server::LocalServer;
pub use remote_api::RemoteApi;

/// One decoded piece of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    /// A delta the server marked as reasoning.
    Thinking(String),
    Usage {
        input_tokens: Option<usize>,
        output_tokens: Option<usize>,
    },
    Finish(FinishReason),
    /// The server closed the turn.
    Done,
    /// A failure reported inside the stream.
    Error(String),
}

/// Where and as whom a request is sent.
#[derive(Debug, Clone)]
pub struct Connection {
    pub client: reqwest::Client,
    pub base_url: String,
    pub token: Option<String>,
}

impl Connection {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// The wire dialect of one network backend.
pub trait ChatProvider: Send + Sync + 'static {
    const KIND: BackendKind;

    /// Key passed to the credential provider.
    fn credential_key(&self) -> &'static str;

    /// Whether a request may be sent without a token.
    fn credential_required(&self) -> bool;

    /// Settings key holding the base URL.
    fn settings_key(&self) -> &'static str;

    fn default_url(&self) -> &'static str;

    fn probe(&self, connection: &Connection) -> impl Future<Output = Result<CapabilityInfo>> + Send;

    /// Fail unless `model_id` can be served.
    fn verify_model(
        &self,
        connection: &Connection,
        model_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn request(
        &self,
        connection: &Connection,
        model_id: &str,
        turns: &[Turn],
        options: &GenerateOptions,
    ) -> reqwest::RequestBuilder;

    /// Decode the payload of one SSE `data:` line.
    fn parse(&self, data: &str) -> Result<Vec<Chunk>>;
}

struct Shared<P> {
    provider: P,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    settings: Arc<dyn SettingsStore>,
    stopping: StoppingController,
}

impl<P: ChatProvider> Shared<P> {
    fn base_url(&self) -> String {
        let url = self
            .settings
            .get(self.provider.settings_key())
            .unwrap_or_else(|| self.provider.default_url().to_string());
        url.trim_end_matches('/').to_string()
    }

    async fn connect(&self) -> Result<Connection, EngineError> {
        let key = self.provider.credential_key();
        let token = self.credentials.token(key).await;
        if token.is_none() && self.provider.credential_required() {
            return Err(EngineError::MissingCredential(key.to_string()));
        }
        Ok(Connection {
            client: self.client.clone(),
            base_url: self.base_url(),
            token,
        })
    }
}

/// Façade over a [`ChatProvider`]. Generation runs as a task reading the
/// response stream; there is no worker thread.
pub struct NetworkEngine<P: ChatProvider> {
    core: Arc<EngineCore>,
    shared: Arc<Shared<P>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<P: ChatProvider> NetworkEngine<P> {
    pub fn new(
        provider: P,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let shared = Shared {
            provider,
            client,
            credentials,
            settings,
            stopping: StoppingController::new(),
        };
        Self {
            core: Arc::new(EngineCore::new(P::KIND)),
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }
}

impl<P: ChatProvider> Engine for NetworkEngine<P> {
    fn backend(&self) -> BackendKind {
        P::KIND
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
        let shared = self.shared.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            let event = match shared.connect().await {
                Ok(connection) => match shared.provider.probe(&connection).await {
                    Ok(data) => EngineEvent::CapabilityInfo { data },
                    Err(err) => EngineEvent::error(format!("{err:#}")),
                },
                Err(err) => EngineEvent::error(err.to_string()),
            };
            core.report_check(event);
        });
    }

    fn load_model(&self, model_id: &str) -> BoxFuture<'static, Result<(), EngineError>> {
        let receiver = match self.core.begin_load(model_id) {
            Ok(receiver) => receiver,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };

        let shared = self.shared.clone();
        let core = self.core.clone();
        let model_id = model_id.to_string();
        tokio::spawn(async move {
            let connection = match shared.connect().await {
                Ok(connection) => connection,
                Err(err) => return core.fail_load(err),
            };
            core.dispatch(EngineEvent::loading(format!(
                "Connecting to {}",
                connection.base_url
            )));
            match shared.provider.verify_model(&connection, &model_id).await {
                Ok(()) => {
                    tracing::info!(
                        event = "model_loaded",
                        backend = %P::KIND,
                        model = %model_id,
                        url = %connection.base_url,
                        "Model available"
                    );
                    core.dispatch(EngineEvent::Ready);
                }
                Err(err) => {
                    tracing::error!(
                        event = "model_load_failed",
                        backend = %P::KIND,
                        model = %model_id,
                        error = %format!("{err:#}"),
                        "Model load failed"
                    );
                    core.fail_load(EngineError::Load(format!("{err:#}")));
                }
            }
        });
        await_load(receiver).boxed()
    }

    fn generate(&self, turns: Vec<Turn>, options: GenerateOptions) -> Result<(), EngineError> {
        let model_id = self
            .core
            .model_id()
            .ok_or(EngineError::NotReady(self.core.status()))?;
        self.core.begin_generate()?;
        self.shared.stopping.reset();
        // the previous stream already sent its terminal event
        if let Some(previous) = lock(&self.task).take() {
            previous.abort();
        }

        let shared = self.shared.clone();
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = stream(&shared, &core, &model_id, &turns, options).await {
                tracing::error!(
                    event = "generation_failed",
                    backend = %P::KIND,
                    model = %model_id,
                    error = %format!("{err:#}"),
                    "Generation failed"
                );
                core.dispatch(EngineEvent::error(format!("{err:#}")));
            }
        });
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    fn interrupt(&self) {
        self.shared.stopping.interrupt();
    }

    fn reset(&self) {
        self.shared.stopping.reset();
    }

    fn terminate(&self) -> BoxFuture<'static, ()> {
        self.shared.stopping.interrupt();
        let task = lock(&self.task).take();
        let core = self.core.clone();
        async move {
            if let Some(task) = task {
                task.abort();
                let _ = task.await;
            }
            core.terminate();
        }
        .boxed()
    }
}

/// Read one streamed response into session events.
async fn stream<P: ChatProvider>(
    shared: &Shared<P>,
    core: &EngineCore,
    model_id: &str,
    turns: &[Turn],
    options: GenerateOptions,
) -> Result<()> {
    let connection = shared.connect().await?;
    let response = shared
        .provider
        .request(&connection, model_id, turns, &options)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{status}: {}", body.trim());
    }

    let mut session = Session::new(&options);
    let mut started = false;
    let mut reason = FinishReason::Stop;
    let mut buffer: Vec<u8> = Vec::new();
    let mut bytes = response.bytes_stream();

    'read: loop {
        if shared.stopping.should_stop() {
            reason = FinishReason::Interrupted;
            break;
        }
        let Some(next) = bytes.next().await else {
            break;
        };
        buffer.extend_from_slice(&next?);

        while let Some(data) = next_data(&mut buffer) {
            for chunk in shared.provider.parse(&data)? {
                if !started && !matches!(chunk, Chunk::Usage { .. }) {
                    core.dispatch(session.start(session.input_tokens()));
                    started = true;
                }
                let events = match chunk {
                    Chunk::Text(text) => {
                        session.record_token();
                        session.push_text(&text)
                    }
                    Chunk::Thinking(text) => {
                        session.record_token();
                        session.push_reasoning(&text)
                    }
                    Chunk::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        session.record_usage(input_tokens, output_tokens);
                        vec![]
                    }
                    Chunk::Finish(finish) => {
                        reason = finish;
                        vec![]
                    }
                    Chunk::Done => break 'read,
                    Chunk::Error(message) => bail!("{message}"),
                };
                for event in events {
                    core.dispatch(event);
                }
            }
        }
    }

    if !started {
        core.dispatch(session.start(session.input_tokens()));
    }
    for event in session.finish(reason) {
        core.dispatch(event);
    }
    Ok(())
}

/// Pop the payload of the next complete `data:` line. Other SSE fields and
/// blank lines are skipped.
fn next_data(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(end) = buffer.iter().position(|&byte| byte == b'\n') {
        let line: Vec<u8> = buffer.drain(..=end).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(data) = line.trim_end().strip_prefix("data:") {
            return Some(data.trim_start().to_string());
        }
    }
    None
}
