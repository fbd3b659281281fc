//! RWKV models on WebGPU, through `web-rwkv`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context as _, Result};
use derivative::Derivative;
use half::f16;
use memmap2::Mmap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};
use web_rwkv::{
    context::{Context, ContextBuilder, InstanceExt},
    runtime::{
        infer::{Rnn, RnnInput, RnnInputBatch, RnnOption, RnnOutputBatch},
        loader::Loader,
        model::{Bundle, ContextAutoLimits, ModelBuilder, ModelInfo, ModelVersion, State},
        v4, v5, v6, v7, Runtime, TokioRuntime,
    },
    tokenizer::Tokenizer,
    wgpu::{Backends, PowerPreference},
};

use crate::{
    runtime::{AcceleratorRuntime, Generate, Progress, Tokenize},
    CapabilityInfo, LoadingData,
};

pub const MODEL_FILE: &str = "model.st";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Token 0 ends a turn in the RWKV world vocabulary.
const END_TOKEN: u32 = 0;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct RwkvOptions {
    /// Directory holding one sub-directory per model.
    #[derivative(Default(value = "\"assets/models\".into()"))]
    pub models_dir: PathBuf,
    /// Tokens processed per inference call while prefilling.
    #[derivative(Default(value = "128"))]
    pub token_chunk_size: usize,
}

/// An [`AcceleratorRuntime`] serving models from `models_dir/<id>/`.
#[derive(Debug, Clone, Default)]
pub struct WebGpuRuntime {
    options: RwkvOptions,
}

impl WebGpuRuntime {
    pub fn new(options: RwkvOptions) -> Self {
        Self { options }
    }

    fn artifact(&self, model_id: &str, file: &str) -> PathBuf {
        self.options.models_dir.join(model_id).join(file)
    }
}

pub struct RwkvTokenizer(Tokenizer);

impl Tokenize for RwkvTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.0.encode(text.as_bytes())?)
    }

    fn decode(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        Ok(self.0.decode(tokens)?)
    }
}

pub struct RwkvModel {
    info: ModelInfo,
    runtime: Arc<dyn Runtime<Rnn> + Send + Sync>,
    state: Arc<dyn State + Send + Sync>,
    context: Context,
    token_chunk_size: usize,
}

impl Generate for RwkvModel {
    async fn step(&mut self, tokens: &[u32]) -> Result<Option<u32>> {
        let batch = RnnInputBatch::new(tokens.to_vec(), RnnOption::Last);
        let mut input = RnnInput::new(vec![batch], self.token_chunk_size);
        let mut logits = None;
        while input.num_token() > 0 {
            let (next, output) = self.runtime.infer(input).await?;
            input = next;
            if let Some(RnnOutputBatch(output)) = output.iter().find(|output| !output.is_empty()) {
                logits = Some(output.clone().to_vec());
            }
        }
        let Some(logits) = logits else {
            bail!("model produced no output");
        };
        match argmax(&logits) {
            Some(END_TOKEN) | None => Ok(None),
            Some(token) => Ok(Some(token)),
        }
    }

    async fn clear(&mut self) -> Result<()> {
        self.state.load(self.state.init(), 0)?;
        Ok(())
    }

    async fn release(self) -> Result<()> {
        let Self {
            info,
            runtime,
            state,
            context,
            ..
        } = self;
        // buffers are freed once the runtime, state and context are dropped
        drop(runtime);
        drop(state);
        drop(context);
        tracing::debug!(
            event = "gpu_release",
            version = ?info.version,
            layers = info.num_layer,
            "GPU buffers released"
        );
        Ok(())
    }
}

fn argmax(logits: &[f32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, x)| x.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as u32)
}

async fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(Tokenizer::new(&contents)?)
}

async fn create_context(info: &ModelInfo) -> Result<Context> {
    let instance = web_rwkv::wgpu::Instance::default();
    let adapter = instance.adapter(PowerPreference::HighPerformance).await?;
    let context = ContextBuilder::new(adapter)
        .auto_limits(info)
        .build()
        .await?;
    Ok(context)
}

impl AcceleratorRuntime for WebGpuRuntime {
    type Tokenizer = RwkvTokenizer;
    type Model = RwkvModel;

    async fn has_capability(&self) -> bool {
        let instance = web_rwkv::wgpu::Instance::default();
        !instance.enumerate_adapters(Backends::all()).await.is_empty()
    }

    async fn describe_capability(&self) -> Result<CapabilityInfo> {
        let instance = web_rwkv::wgpu::Instance::default();
        let adapter = instance.adapter(PowerPreference::HighPerformance).await?;
        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::info!(
            event = "gpu_adapter",
            adapter_name = %info.name,
            vendor = info.vendor,
            device = info.device,
            device_type = ?info.device_type,
            driver = %info.driver,
            backend = ?info.backend,
            "GPU adapter found"
        );

        let features = vec![
            format!("{:?}", info.backend).to_lowercase(),
            format!("{:?}", info.device_type).to_lowercase(),
            format!("shader-f16:{}", adapter.features().contains(web_rwkv::wgpu::Features::SHADER_F16)),
        ];
        let mut map = serde_json::Map::new();
        map.insert("maxBufferSize".into(), limits.max_buffer_size.into());
        map.insert(
            "maxStorageBufferBindingSize".into(),
            limits.max_storage_buffer_binding_size.into(),
        );
        map.insert(
            "maxComputeInvocationsPerWorkgroup".into(),
            limits.max_compute_invocations_per_workgroup.into(),
        );
        Ok(CapabilityInfo {
            vendor: info.name,
            features,
            limits: map,
        })
    }

    async fn load_tokenizer(&self, model_id: &str, progress: Progress<'_>) -> Result<RwkvTokenizer> {
        let path = self.artifact(model_id, TOKENIZER_FILE);
        let file = format!("{model_id}/{TOKENIZER_FILE}");
        progress(LoadingData::file(&file, 0.0));
        tracing::info!(event = "tokenizer_load", path = %path.display(), "Loading tokenizer");
        let tokenizer = load_tokenizer(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        progress(LoadingData::file(&file, 1.0));
        Ok(RwkvTokenizer(tokenizer))
    }

    async fn load_model(&self, model_id: &str, progress: Progress<'_>) -> Result<RwkvModel> {
        let path = self.artifact(model_id, MODEL_FILE);
        let file_name = format!("{model_id}/{MODEL_FILE}");
        progress(LoadingData::file(&file_name, 0.0));

        let file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let data = unsafe { Mmap::map(&file)? };
        let model = SafeTensors::deserialize(&data)?;
        let info = Loader::info(&model)?;
        tracing::info!(
            event = "model_metadata",
            path = %path.display(),
            version = ?info.version,
            layers = info.num_layer,
            embed_size = info.num_emb,
            vocab_size = info.num_vocab,
            "Model metadata"
        );
        progress(LoadingData::file(&file_name, 0.25));

        let context = create_context(&info).await?;
        let builder = ModelBuilder::new(&context, model);

        macro_rules! build {
            ($build:ident, $bundle:ty) => {{
                let model = builder.$build().await?;
                let bundle = <$bundle>::new(model, 1);
                let state: Arc<dyn State + Send + Sync> = Arc::new(bundle.state());
                let runtime: Arc<dyn Runtime<Rnn> + Send + Sync> =
                    Arc::new(TokioRuntime::<Rnn>::new(bundle).await);
                (runtime, state)
            }};
        }
        let (runtime, state) = match info.version {
            ModelVersion::V4 => build!(build_v4, v4::Bundle::<f16>),
            ModelVersion::V5 => build!(build_v5, v5::Bundle::<f16>),
            ModelVersion::V6 => build!(build_v6, v6::Bundle::<f16>),
            ModelVersion::V7 => build!(build_v7, v7::Bundle::<f16>),
        };
        progress(LoadingData::file(&file_name, 1.0));

        Ok(RwkvModel {
            info,
            runtime,
            state,
            context,
            token_chunk_size: self.options.token_chunk_size,
        })
    }
}
