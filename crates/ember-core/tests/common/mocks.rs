//! Mock implementations for testing.
//!
//! Provides a scripted accelerator runtime that replays fixed token text,
//! and a minimal HTTP server that answers with canned JSON or SSE streams.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use ember_core::{
    runtime::{AcceleratorRuntime, Generate, Progress, Tokenize},
    CapabilityInfo, EngineEvent, Listener, LoadingData,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Record every event delivered to the returned listener.
pub fn recorder() -> (Listener, Arc<Mutex<Vec<EngineEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Listener = Arc::new(move |event: &EngineEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (listener, seen)
}

pub fn kinds(events: &[EngineEvent]) -> Vec<&'static str> {
    events.iter().map(EngineEvent::kind).collect()
}

/// Poll `seen` until an event of `kind` arrives.
pub async fn wait_for(seen: &Arc<Mutex<Vec<EngineEvent>>>, kind: &str) -> Vec<EngineEvent> {
    let wait = async {
        loop {
            {
                let events = seen.lock().unwrap();
                if events.iter().any(|event| event.kind() == kind) {
                    return events.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(events) => events,
        Err(_) => panic!(
            "timed out waiting for `{kind}`; saw {:?}",
            kinds(&seen.lock().unwrap())
        ),
    }
}

/// An accelerator runtime whose model replays `pieces`, one per step.
///
/// Token `n` decodes to `pieces[n - 1]`; stepping past the last piece
/// returns the end token.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    pub pieces: Vec<String>,
    pub delay: Duration,
    pub capable: bool,
    pub fail_load: Option<String>,
    pub fail_steps: Arc<AtomicBool>,
    pub loads: Arc<Mutex<Vec<String>>>,
    pub releases: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new<S: Into<String>>(pieces: impl IntoIterator<Item = S>) -> Self {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            capable: true,
            ..Default::default()
        }
    }

    /// Sleep this long before every produced token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn incapable(mut self) -> Self {
        self.capable = false;
        self
    }

    pub fn failing_load(mut self, message: &str) -> Self {
        self.fail_load = Some(message.into());
        self
    }

    /// Every step fails, the warm-up included.
    pub fn failing_steps(self) -> Self {
        self.set_failing(true);
        self
    }

    /// Make the steps of loaded models fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.fail_steps.store(failing, Ordering::SeqCst);
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

pub struct ScriptedTokenizer {
    pieces: Vec<String>,
}

impl Tokenize for ScriptedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|_| 1).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for &token in tokens {
            match self.pieces.get(token as usize - 1) {
                Some(piece) => bytes.extend_from_slice(piece.as_bytes()),
                None => bail!("unknown token {token}"),
            }
        }
        Ok(bytes)
    }
}

pub struct ScriptedModel {
    len: usize,
    cursor: usize,
    delay: Duration,
    fail_steps: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl Generate for ScriptedModel {
    async fn step(&mut self, _tokens: &[u32]) -> Result<Option<u32>> {
        if self.fail_steps.load(Ordering::SeqCst) {
            bail!("device lost");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.cursor >= self.len {
            return Ok(None);
        }
        self.cursor += 1;
        Ok(Some(self.cursor as u32))
    }

    async fn clear(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    async fn release(self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AcceleratorRuntime for ScriptedRuntime {
    type Tokenizer = ScriptedTokenizer;
    type Model = ScriptedModel;

    async fn has_capability(&self) -> bool {
        self.capable
    }

    async fn describe_capability(&self) -> Result<CapabilityInfo> {
        Ok(CapabilityInfo {
            vendor: "scripted".into(),
            features: vec!["shader-f16:true".into()],
            limits: Default::default(),
        })
    }

    async fn load_tokenizer(&self, model_id: &str, progress: Progress<'_>) -> Result<ScriptedTokenizer> {
        progress(LoadingData::file(format!("{model_id}/tokenizer.json"), 1.0));
        Ok(ScriptedTokenizer {
            pieces: self.pieces.clone(),
        })
    }

    async fn load_model(&self, model_id: &str, progress: Progress<'_>) -> Result<ScriptedModel> {
        if let Some(message) = &self.fail_load {
            bail!("{message}");
        }
        self.loads.lock().unwrap().push(model_id.to_string());
        progress(LoadingData::file(format!("{model_id}/model.st"), 1.0));
        Ok(ScriptedModel {
            len: self.pieces.len(),
            cursor: 0,
            delay: self.delay,
            fail_steps: self.fail_steps.clone(),
            releases: self.releases.clone(),
        })
    }
}

/// A canned answer for one `METHOD /path`.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Json(u16, serde_json::Value),
    /// SSE body; each entry becomes one `data:` line.
    Sse(Vec<String>),
}

/// A request the mock server received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

/// A one-request-per-connection HTTP/1.1 server on a loopback port.
pub struct MockServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(routes: Vec<(&str, &str, MockResponse)>) -> Self {
        let routes: Arc<HashMap<(String, String), MockResponse>> = Arc::new(
            routes
                .into_iter()
                .map(|(method, path, response)| ((method.to_string(), path.to_string()), response))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = handle(stream, &routes, &requests).await;
                    });
                }
            })
        };
        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// The last request sent to `path`.
    pub fn last(&self, path: &str) -> Option<Recorded> {
        self.requests()
            .into_iter()
            .rev()
            .find(|request| request.path == path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(
    mut stream: TcpStream,
    routes: &HashMap<(String, String), MockResponse>,
    requests: &Mutex<Vec<Recorded>>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    while buffer.len() < head_end + length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buffer[head_end..]).unwrap_or(serde_json::Value::Null);
    requests.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    });

    match routes.get(&(method, path)) {
        Some(MockResponse::Json(status, value)) => {
            let body = value.to_string();
            let response = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await?;
        }
        Some(MockResponse::Sse(lines)) => {
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n")
                .await?;
            for line in lines {
                stream.write_all(format!("data: {line}\n\n").as_bytes()).await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        None => {
            let body = r#"{"error":{"message":"not found"}}"#;
            let response = format!(
                "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await?;
        }
    }
    stream.shutdown().await
}
