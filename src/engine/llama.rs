//! llama.cpp engine
//!
//! # Architecture
//!
//! `LlamaModel` and `LlamaContext` wrap raw pointers, so each session gets a
//! dedicated worker thread that owns its model and runs every generation.
//! The session talks to it over a command channel; requests are executed one
//! after another. The `LlamaBackend` may only be initialised once per process
//! and is shared by all workers.

use std::num::NonZeroU32;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use super::completion::{settle_text, ChunkEmitter, CompletionRequest, FinishReason};
use super::model::{resolve_model_file, validate_gguf};
use super::{ChatRequest, EngineError, EngineLoader, Generation, InferenceEngine};
use crate::codec::Utf8Assembler;
use crate::config::{HyperParams, SamplerParams, SessionConfig};

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        let backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized");
        Ok(backend)
    })
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: PathBuf,
    /// Name reported in output chunks when the request names no model
    pub name: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        request: CompletionRequest,
        emitter: ChunkEmitter,
        stop_signal: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Builds a [`LlamaEngine`] per session.
pub struct LlamaLoader;

impl EngineLoader for LlamaLoader {
    fn load(&self, config: &SessionConfig) -> Result<Box<dyn InferenceEngine>, EngineError> {
        Ok(Box::new(LlamaEngine::start(config)?))
    }
}

/// A loaded model and the worker thread that runs it.
pub struct LlamaEngine {
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    model_info: LoadedModelInfo,
}

impl LlamaEngine {
    /// Locates and validates the model, then loads it on a new worker thread.
    ///
    /// Returns once the model is loaded or loading failed.
    pub fn start(config: &SessionConfig) -> Result<Self, EngineError> {
        let path = resolve_model_file(config)?;
        let _metadata = validate_gguf(&path)?;
        tracing::debug!("GGUF validation passed for {:?}", path);
        tracing::debug!("Native library folder: {}", config.lib_folder.display());

        let backend = backend()?;
        let hparams = config.hparams.clone();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker_path = path.clone();
        let handle = thread::Builder::new()
            .name("serve-bridge-llama".to_string())
            .spawn(move || {
                worker_thread_main(backend, &worker_path, hparams, ready_tx, command_rx)
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(e) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError(e.to_string()));
            }
        };

        tracing::info!("LlamaEngine worker thread started for {}", path.display());
        Ok(Self {
            command_tx,
            worker_handle: Some(handle),
            model_info,
        })
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.model_info
    }
}

impl InferenceEngine for LlamaEngine {
    fn submit(&self, request: &ChatRequest) -> Result<Generation, EngineError> {
        let request = CompletionRequest::parse(request.payload())?;

        let (token_tx, token_rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let model_name = request
            .model
            .clone()
            .unwrap_or_else(|| self.model_info.name.clone());
        let emitter = ChunkEmitter::new(token_tx, model_name, request.stream);

        self.command_tx
            .send(WorkerCommand::Generate {
                request,
                emitter,
                stop_signal: stop_signal.clone(),
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok(Generation::new(token_rx, stop_signal))
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the `LlamaModel` and processes commands from the session.
fn worker_thread_main(
    backend: &'static LlamaBackend,
    path: &Path,
    hparams: HyperParams,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let model = match load_model(backend, path, &hparams) {
        Ok((model, info)) => {
            let _ = ready_tx.send(Ok(info));
            model
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    serve_commands(&command_rx, |request, emitter, stop_signal| {
        run_generation(backend, &model, &hparams, request, emitter, stop_signal)
    });
}

/// Runs queued requests until `Shutdown` or until the session goes away.
///
/// Requests cancelled while queued are dropped without running. A failing or
/// panicking request ends only its own stream.
fn serve_commands<F>(command_rx: &Receiver<WorkerCommand>, mut run: F)
where
    F: FnMut(&CompletionRequest, &mut ChunkEmitter, &AtomicBool) -> Result<FinishReason, EngineError>,
{
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                request,
                mut emitter,
                stop_signal,
            }) => {
                if stop_signal.load(Ordering::Relaxed) {
                    tracing::debug!("Skipping request cancelled while queued");
                    continue;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run(&request, &mut emitter, &stop_signal)
                }));
                match outcome {
                    Ok(Ok(reason)) => emitter.finish(reason),
                    Ok(Err(e)) => {
                        tracing::warn!("Generation failed: {}", e);
                        emitter.fail(&e);
                    }
                    Err(_) => {
                        tracing::error!("Generation panicked; worker continues");
                        emitter.fail(&EngineError::Inference("generation panicked".to_string()));
                    }
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_model(
    backend: &LlamaBackend,
    path: &Path,
    hparams: &HyperParams,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(hparams.gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_path_buf(),
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path.display(),
        info.param_count,
        info.vocab_size,
        info.context_length
    );
    Ok((model, info))
}

/// Run one request (called from worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    hparams: &HyperParams,
    request: &CompletionRequest,
    emitter: &mut ChunkEmitter,
    stop_signal: &AtomicBool,
) -> Result<FinishReason, EngineError> {
    let prompt = match build_chat_prompt(model, request) {
        Ok(chat_prompt) => chat_prompt,
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            request.plain_prompt()
        }
    };

    let n_ctx = context_window(hparams.context_size, model.n_ctx_train());
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(hparams.batch_size)
        .with_n_threads(hparams.n_threads as i32)
        .with_n_threads_batch(hparams.n_threads as i32);

    if stop_signal.load(Ordering::Relaxed) {
        return Ok(FinishReason::Stop);
    }
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;
    if tokens.is_empty() || tokens.len() >= n_ctx as usize {
        return Err(EngineError::Tokenization(format!(
            "prompt of {} tokens does not fit a {} token context",
            tokens.len(),
            n_ctx
        )));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    run_inference(&mut ctx, model, hparams, request, tokens, n_ctx, emitter, stop_signal)
}

fn build_chat_prompt(model: &LlamaModel, request: &CompletionRequest) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let messages = request
        .messages
        .iter()
        .map(|m| {
            LlamaChatMessage::new(m.role.clone(), m.content.clone().unwrap_or_default())
                .map_err(|e| format!("Failed to build chat message: {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    model
        .apply_chat_template(&template, &messages, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Runs the decode loop and streams text through `emitter`.
#[allow(clippy::too_many_arguments)]
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    hparams: &HyperParams,
    request: &CompletionRequest,
    prompt_tokens: Vec<LlamaToken>,
    n_ctx: u32,
    emitter: &mut ChunkEmitter,
    stop_signal: &AtomicBool,
) -> Result<FinishReason, EngineError> {
    let n_batch = hparams.batch_size as usize;
    let mut batch = LlamaBatch::new(n_batch, 1);

    // Process the prompt in batch-sized pieces; only the last token needs logits.
    let last = prompt_tokens.len() - 1;
    for (start, piece) in prompt_tokens.chunks(n_batch).enumerate() {
        if stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by host during prompt processing");
            return Ok(FinishReason::Stop);
        }
        batch.clear();
        for (offset, token) in piece.iter().enumerate() {
            let pos = start * n_batch + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;
    }

    let params = request.sampling(&hparams.sampler);
    let mut sampler = build_sampler(&params, n_ctx);

    let max_tokens = request.max_tokens.unwrap_or(hparams.max_tokens);
    let mut n_decoded = prompt_tokens.len() as i32;
    let mut assembler = Utf8Assembler::new();
    let mut reason = FinishReason::Length;

    for _ in 0..max_tokens {
        if stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by host");
            return Ok(FinishReason::Stop);
        }
        if n_decoded as u32 >= n_ctx {
            tracing::debug!("Context window exhausted");
            break;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        let end_of_generation = model.is_eog_token(new_token);
        if end_of_generation && !params.ignore_eos {
            tracing::debug!("End of generation token encountered");
            reason = FinishReason::Stop;
            break;
        }

        // With ignore_eos the end token is decoded but never shown.
        if !end_of_generation {
            let token_bytes = model
                .token_to_bytes(new_token, Special::Tokenize)
                .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {e}")))?;
            let text = assembler
                .push(&token_bytes)
                .map_err(|e| EngineError::Inference(e.to_string()))?;
            if !emitter.text(&text) {
                tracing::debug!("Receiver dropped, stopping generation");
                return Ok(FinishReason::Stop);
            }
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_decoded += 1;
    }

    settle_text(assembler, reason).map_err(|e| EngineError::Inference(e.to_string()))
}

/// Context size for a request: the configured size, capped at what the model
/// was trained with.
fn context_window(configured: u32, n_ctx_train: u32) -> u32 {
    if n_ctx_train == 0 {
        configured
    } else {
        configured.min(n_ctx_train)
    }
}

/// Builds the sampler chain: penalties, then greedy below temperature 0.01,
/// otherwise top-k, top-p, temperature and a seeded draw.
fn build_sampler(params: &SamplerParams, n_ctx: u32) -> LlamaSampler {
    let mut stages = Vec::with_capacity(5);
    if params.has_penalties() {
        let last_n = if params.penalty_last_n < 0 {
            n_ctx as i32
        } else {
            params.penalty_last_n
        };
        stages.push(LlamaSampler::penalties(
            last_n,
            params.penalty_repeat,
            params.penalty_freq,
            params.penalty_present,
        ));
    }

    if params.temperature < 0.01 {
        stages.push(LlamaSampler::greedy());
    } else {
        let seed = if params.seed == 0 { rand_seed() } else { params.seed };
        stages.push(LlamaSampler::top_k(params.top_k as i32));
        stages.push(LlamaSampler::top_p(params.top_p, params.min_keep as usize));
        stages.push(LlamaSampler::temp(params.temperature));
        stages.push(LlamaSampler::dist(seed));
    }
    LlamaSampler::chain_simple(stages)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
