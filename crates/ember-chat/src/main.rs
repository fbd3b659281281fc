//! ember: chat with a language model from the terminal.
//!
//! The model runs on the local WebGPU device, on an OpenAI-compatible server,
//! or on a remote API, chosen by the backend half of `--model kind:ref`.

use std::{io::Write, path::PathBuf, sync::Arc, time::Instant};

use anyhow::{bail, Result};
use clap::Parser;
use ember_chat::{
    build_router,
    chat::{self, Conversation, Input},
    config::{Config, DEFAULT_CONFIG},
    credentials::EnvCredentials,
    load_or_default,
    logging::{self, errors, lifecycle, TurnContext},
    probe, seed_settings,
    settings::FileSettings,
};
use ember_core::{BackendRouter, EngineError, GenerateOptions, ModelRef};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Chat with a language model on WebGPU, a local server, or a remote API.
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(version)]
struct Args {
    /// Path to the config TOML file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Model to load, as `kind:ref` (e.g. `remote-api:claude-sonnet-4-5`)
    #[arg(short, long)]
    model: Option<ModelRef>,

    /// Output token limit per reply
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Ask for answers without a reasoning phase
    #[arg(long)]
    no_thinking: bool,

    /// Print engine events as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Probe the model's backend and exit
    #[arg(long)]
    check: bool,
}

impl Args {
    fn options(&self, config: &Config) -> GenerateOptions {
        let mut options = GenerateOptions::from(config.generation);
        if let Some(max_tokens) = self.max_tokens {
            options.max_tokens = max_tokens;
        }
        if self.no_thinking {
            options.enable_thinking = false;
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, found) = load_or_default(&args.config).await?;
    logging::init(config.log.format, &config.log.filter)?;
    lifecycle::app_startup("ember", env!("CARGO_PKG_VERSION"));
    lifecycle::config_loaded(&args.config.to_string_lossy(), found);

    let settings = Arc::new(FileSettings::open(&config.settings_path)?);
    seed_settings(&config, settings.as_ref())?;
    let credentials = Arc::new(EnvCredentials::from_config(&config));
    let router = build_router(&config, credentials, settings);
    router.on_message(chat::printer(std::io::stdout(), args.json));

    let Some(model) = args.model.clone().or_else(|| config.model.default.clone()) else {
        bail!("no model selected; pass --model KIND:REF or set [model].default");
    };

    let result = match args.check {
        true => probe(&router, model.kind).await.map(|_| ()),
        false => run(&router, &config, &args, model).await,
    };

    router.terminate().await;
    lifecycle::app_shutdown(match &result {
        Ok(()) => "exit",
        Err(_) => "error",
    });
    result
}

async fn load(router: &BackendRouter, model: &ModelRef) -> Result<()> {
    logging::model::model_select(model);
    let start = Instant::now();
    match router.load_model(model).await {
        Ok(()) => {
            logging::model::model_ready(model, start.elapsed().as_millis() as u64);
            Ok(())
        }
        Err(err) => {
            errors::model_load_failed(&model.to_string(), &err.to_string());
            Err(err.into())
        }
    }
}

fn prompt(json: bool) {
    if !json {
        let mut out = std::io::stdout();
        let _ = out.write_all(b"> ");
        let _ = out.flush();
    }
}

async fn run(router: &BackendRouter, config: &Config, args: &Args, model: ModelRef) -> Result<()> {
    load(router, &model).await?;

    let options = args.options(config);
    let mut current = model;
    let mut conversation = Conversation::new(config.model.system.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt(args.json);
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let input = match Input::parse(&line) {
            Ok(input) => input,
            Err(err) => {
                errors::invalid_command(&line, &err.to_string());
                eprintln!("{err}");
                continue;
            }
        };

        match input {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{}", chat::HELP),
            Input::Check => {
                if let Err(err) = router.check() {
                    eprintln!("{err}");
                }
            }
            Input::Reset => {
                conversation.clear();
                let _ = router.reset();
            }
            Input::Model(model) => {
                if load(router, &model).await.is_ok() {
                    current = model;
                }
            }
            Input::Message(text) => {
                conversation.push_user(text);
                let turns = conversation.turns();
                let mut context = TurnContext::new(Some(&current), &options, turns.len());

                let generation = router.generate_full(turns, options);
                tokio::pin!(generation);
                let result = loop {
                    tokio::select! {
                        result = &mut generation => break result,
                        _ = tokio::signal::ctrl_c() => {
                            let _ = router.interrupt();
                        }
                    }
                };

                match result {
                    Ok(result) => {
                        context.record(&result);
                        conversation.push_assistant(result.text);
                    }
                    Err(err) => {
                        // rejected before a session opened, so no event showed it
                        if let EngineError::NotReady(_) | EngineError::NoActiveBackend = err {
                            eprintln!("{err}");
                        }
                        context.record_error(&err.to_string());
                        conversation.retract();
                    }
                }
                context.emit_canonical_log();
            }
        }
    }
    Ok(())
}
