//! The accelerator worker: a dedicated thread that owns the resident model
//! and talks to its façade only through [`Command`] and [`EngineEvent`]
//! channels.

use std::{sync::Arc, thread::JoinHandle};

use anyhow::Result;
use flume::{Receiver, Sender};
use tokio::sync::Mutex;

use crate::{
    resident::ModelResident,
    runtime::{AcceleratorRuntime, Generate, Tokenize},
    session::Session,
    stopping::StoppingController,
    Command, EngineEvent, FinishReason, GenerateOptions, LoadingData,
};

pub const THREAD_NAME: &str = "ember-accelerator";

/// What the worker sends back to its façade.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The answer to a `check`. It never touches load or session state.
    Check(EngineEvent),
    /// A load or session event.
    Event(EngineEvent),
}

fn emit(sender: &Sender<Reply>, event: EngineEvent) {
    let _ = sender.send(Reply::Event(event));
}

/// Start the worker thread. It exits, releasing the resident model, once
/// every command sender is dropped.
pub fn spawn<R: AcceleratorRuntime>(
    runtime: Arc<R>,
    receiver: Receiver<Command>,
    sender: Sender<Reply>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || {
            let executor = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(executor) => executor,
                Err(err) => {
                    tracing::error!(event = "worker_start_failed", error = %err, "Worker runtime failed to start");
                    emit(&sender, EngineEvent::error(format!("worker failed to start: {err}")));
                    return;
                }
            };
            executor.block_on(serve(runtime, receiver, sender));
        })
}

/// The worker's dispatch loop.
///
/// `interrupt` and `reset` act on the stop flag in arrival order; everything
/// else runs as a task serialized on the resident model.
pub async fn serve<R: AcceleratorRuntime>(
    runtime: Arc<R>,
    receiver: Receiver<Command>,
    sender: Sender<Reply>,
) {
    let resident = Arc::new(Mutex::new(ModelResident::new(runtime)));
    let stopping = StoppingController::new();
    tracing::debug!(event = "worker_started", "Accelerator worker started");

    while let Ok(command) = receiver.recv_async().await {
        match command {
            Command::Interrupt => stopping.interrupt(),
            Command::Reset => stopping.reset(),
            command => {
                let future = process(resident.clone(), stopping.clone(), sender.clone(), command);
                tokio::spawn(future);
            }
        }
    }

    stopping.interrupt();
    resident.lock().await.release().await;
    tracing::debug!(event = "worker_stopped", "Accelerator worker stopped");
}

async fn process<R: AcceleratorRuntime>(
    resident: Arc<Mutex<ModelResident<R>>>,
    stopping: StoppingController,
    sender: Sender<Reply>,
    command: Command,
) {
    match command {
        Command::Check => {
            let runtime = resident.lock().await.runtime().clone();
            let event = match runtime.has_capability().await {
                true => match runtime.describe_capability().await {
                    Ok(data) => EngineEvent::CapabilityInfo { data },
                    Err(err) => EngineEvent::error(format!("{err:#}")),
                },
                false => EngineEvent::error("WebGPU is not supported on this device"),
            };
            let _ = sender.send(Reply::Check(event));
        }
        Command::Load { model_id } => {
            let progress = {
                let sender = sender.clone();
                move |data: LoadingData| emit(&sender, EngineEvent::Loading { data })
            };
            let mut resident = resident.lock().await;
            let event = match resident.acquire(&model_id, &progress).await {
                Ok(_) => EngineEvent::Ready,
                Err(err) => {
                    tracing::error!(
                        event = "model_load_failed",
                        model = %model_id,
                        error = %format!("{err:#}"),
                        "Model load failed"
                    );
                    EngineEvent::error(format!("{err:#}"))
                }
            };
            emit(&sender, event);
        }
        Command::Generate { turns, options } => {
            let mut resident = resident.lock().await;
            let runtime = resident.runtime().clone();
            let Some((tokenizer, model)) = resident.loaded() else {
                emit(&sender, EngineEvent::error("no model is loaded"));
                return;
            };
            let prompt = runtime.render_prompt(&turns, options.enable_thinking);
            if let Err(err) = generate(tokenizer, model, &prompt, options, &stopping, &sender).await {
                tracing::error!(
                    event = "generation_failed",
                    error = %format!("{err:#}"),
                    "Generation failed"
                );
                emit(&sender, EngineEvent::error(format!("{err:#}")));
            }
        }
        Command::Interrupt | Command::Reset => {}
    }
}

/// Run one greedy session. Returns `Err` only before `complete` was sent.
async fn generate<T: Tokenize, M: Generate>(
    tokenizer: &T,
    model: &mut M,
    prompt: &str,
    options: GenerateOptions,
    stopping: &StoppingController,
    sender: &Sender<Reply>,
) -> Result<()> {
    let send = |events: Vec<EngineEvent>| {
        for event in events {
            emit(sender, event);
        }
    };

    let mut session = Session::new(&options);
    let mut input = tokenizer.encode(prompt)?;
    model.clear().await?;
    send(vec![session.start(input.len())]);

    let mut buffer: Vec<u8> = Vec::new();
    let mut reason = FinishReason::Length;
    for _ in 0..options.max_tokens {
        if stopping.should_stop() {
            reason = FinishReason::Interrupted;
            break;
        }
        let Some(token) = model.step(&input).await? else {
            reason = FinishReason::Stop;
            break;
        };
        session.record_token();
        buffer.extend(tokenizer.decode(&[token])?);
        if let Some(text) = take_utf8(&mut buffer) {
            send(session.push_text(&text));
        }
        input = vec![token];
    }
    if !buffer.is_empty() {
        send(session.push_text(&String::from_utf8_lossy(&buffer)));
    }
    send(session.finish(reason));
    Ok(())
}

/// Remove and return the longest valid UTF-8 prefix of `buffer`, leaving an
/// incomplete trailing sequence for the next token.
fn take_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    let valid = match std::str::from_utf8(buffer) {
        Ok(_) => buffer.len(),
        Err(err) => match err.error_len() {
            // incomplete sequence at the end
            None => err.valid_up_to(),
            // invalid bytes; they can never complete
            Some(_) => buffer.len(),
        },
    };
    if valid == 0 {
        return None;
    }
    let head: Vec<u8> = buffer.drain(..valid).collect();
    Some(String::from_utf8_lossy(&head).into_owned())
}
