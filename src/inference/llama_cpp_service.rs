use anyhow::{anyhow, bail, Result};
use rand::{thread_rng, Rng};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use tracing::{info, warn};

use super::{truncate_at_stop, GenerationParams, RawCompletion, TextGenerator};
use crate::config::LlamaSettings;

#[allow(
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    dead_code,
    clippy::all
)]
mod ffi {
    include!(concat!(env!("OUT_DIR"), "/llama_bindings.rs"));
}

const N_BATCH: i32 = 512;
const PENALTY_LAST_N: i32 = 64;

static BACKEND_ONCE: OnceLock<()> = OnceLock::new();
static BACKEND_USERS: AtomicUsize = AtomicUsize::new(0);

fn init_backend() {
    BACKEND_ONCE.get_or_init(|| unsafe {
        ffi::llama_backend_init();
    });
    BACKEND_USERS.fetch_add(1, Ordering::SeqCst);
}

fn shutdown_backend() {
    if BACKEND_USERS.fetch_sub(1, Ordering::SeqCst) == 1 {
        unsafe {
            ffi::llama_backend_free();
        }
    }
}

/// GGUF model loaded through llama.cpp, serving requests from a fixed pool
/// of contexts.
pub struct LlamaCppService {
    pool: ContextPool,
    seed: Option<u32>,
}

struct SharedModel {
    model: *mut ffi::llama_model,
    vocab: *const ffi::llama_vocab,
}

unsafe impl Send for SharedModel {}
unsafe impl Sync for SharedModel {}

impl Drop for SharedModel {
    fn drop(&mut self) {
        unsafe {
            if !self.model.is_null() {
                ffi::llama_model_free(self.model);
            }
        }
        shutdown_backend();
    }
}

struct LlamaContext {
    shared: Arc<SharedModel>,
    ctx: *mut ffi::llama_context,
    n_ctx: u32,
    n_past: i32,
}

unsafe impl Send for LlamaContext {}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                ffi::llama_free(self.ctx);
            }
        }
    }
}

struct SamplerChain(*mut ffi::llama_sampler);

impl Drop for SamplerChain {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_null() {
                ffi::llama_sampler_free(self.0);
            }
        }
    }
}

struct ContextPool {
    inner: Arc<ContextPoolInner>,
}

struct ContextPoolInner {
    queue: Mutex<VecDeque<LlamaContext>>,
    available: Condvar,
}

struct ContextLease {
    pool: Arc<ContextPoolInner>,
    ctx: Option<LlamaContext>,
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let mut queue = self
                .pool
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.push_back(ctx);
            self.pool.available.notify_one();
        }
    }
}

impl LlamaCppService {
    pub fn new(settings: &LlamaSettings) -> Result<Self> {
        let path = settings.model_path.as_path();
        if !path.exists() {
            bail!("GGUF model not found at {}", path.display());
        }
        if settings.pool_size == 0 {
            bail!("context pool size must be at least 1");
        }

        info!(
            model = %path.display(),
            ctx = settings.ctx_length,
            threads = settings.threads,
            gpu_layers = settings.gpu_layers,
            pool = settings.pool_size,
            seed = ?settings.seed,
            "loading llama.cpp model"
        );

        let path_cstr = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| anyhow!("model path contains interior null byte"))?;

        init_backend();

        let mut model_params = unsafe { ffi::llama_model_default_params() };
        model_params.n_gpu_layers = settings.gpu_layers;
        model_params.main_gpu = 0;
        model_params.use_mmap = true;

        let model = unsafe { ffi::llama_model_load_from_file(path_cstr.as_ptr(), model_params) };
        if model.is_null() {
            shutdown_backend();
            bail!("failed to load model from {}", path.display());
        }

        let vocab = unsafe { ffi::llama_model_get_vocab(model) };
        if vocab.is_null() {
            unsafe {
                ffi::llama_model_free(model);
            }
            shutdown_backend();
            bail!("model vocabulary unavailable");
        }

        let shared = Arc::new(SharedModel { model, vocab });

        let mut contexts = VecDeque::with_capacity(settings.pool_size);
        for _ in 0..settings.pool_size {
            contexts.push_back(LlamaContext::create(
                shared.clone(),
                settings.ctx_length,
                settings.threads,
            )?);
        }

        info!("llama.cpp model ready");

        Ok(Self {
            pool: ContextPool::new(contexts),
            seed: settings.seed,
        })
    }

    fn seed(&self) -> u32 {
        self.seed.unwrap_or_else(|| thread_rng().gen())
    }
}

impl TextGenerator for LlamaCppService {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<RawCompletion> {
        let mut lease = self.pool.checkout();
        let ctx = lease
            .ctx
            .as_mut()
            .ok_or_else(|| anyhow!("context lease is empty"))?;
        ctx.run(prompt, params, self.seed())
    }
}

impl LlamaContext {
    fn create(shared: Arc<SharedModel>, ctx_length: u32, threads: i32) -> Result<Self> {
        let mut ctx_params = unsafe { ffi::llama_context_default_params() };
        ctx_params.n_ctx = ctx_length;
        ctx_params.n_batch = N_BATCH as u32;
        ctx_params.n_ubatch = N_BATCH as u32;
        ctx_params.n_threads = threads;
        ctx_params.n_threads_batch = threads;

        let ctx = unsafe { ffi::llama_init_from_model(shared.model, ctx_params) };
        if ctx.is_null() {
            bail!("failed to create llama context");
        }

        Ok(Self {
            shared,
            ctx,
            n_ctx: ctx_length,
            n_past: 0,
        })
    }

    fn sampler(params: &GenerationParams, seed: u32) -> Result<SamplerChain> {
        let mut chain_params = unsafe { ffi::llama_sampler_chain_default_params() };
        chain_params.no_perf = true;

        let chain = SamplerChain(unsafe { ffi::llama_sampler_chain_init(chain_params) });
        if chain.0.is_null() {
            bail!("failed to create sampler chain");
        }

        unsafe {
            if let Some(penalty) = params.repeat_penalty {
                let penalties = ffi::llama_sampler_init_penalties(PENALTY_LAST_N, penalty, 0.0, 0.0);
                ffi::llama_sampler_chain_add(chain.0, penalties);
            }
            if params.temperature <= 0.0 {
                ffi::llama_sampler_chain_add(chain.0, ffi::llama_sampler_init_greedy());
            } else {
                if params.top_p < 1.0 {
                    let top_p = ffi::llama_sampler_init_top_p(params.top_p, 1);
                    ffi::llama_sampler_chain_add(chain.0, top_p);
                }
                let temp = ffi::llama_sampler_init_temp(params.temperature);
                ffi::llama_sampler_chain_add(chain.0, temp);
                ffi::llama_sampler_chain_add(chain.0, ffi::llama_sampler_init_dist(seed));
            }
        }

        Ok(chain)
    }

    fn run(&mut self, prompt: &str, params: &GenerationParams, seed: u32) -> Result<RawCompletion> {
        unsafe {
            let mem = ffi::llama_get_memory(self.ctx);
            ffi::llama_memory_clear(mem, true);
        }
        self.n_past = 0;

        let sampler = Self::sampler(params, seed)?;
        let prompt_tokens = self.tokenize(prompt)?;
        if prompt_tokens.len() >= self.n_ctx as usize {
            bail!(
                "prompt is {} tokens, context window is {}",
                prompt_tokens.len(),
                self.n_ctx
            );
        }
        self.decode_sequence(&prompt_tokens)?;

        let mut pending = Vec::new();
        let mut text = String::new();
        let mut chunks = Vec::new();

        for _ in 0..params.max_tokens {
            if self.n_past as u32 >= self.n_ctx {
                warn!(n_ctx = self.n_ctx, "context window exhausted");
                break;
            }
            let token = unsafe { ffi::llama_sampler_sample(sampler.0, self.ctx, -1) };
            if token == ffi::LLAMA_TOKEN_NULL
                || unsafe { ffi::llama_vocab_is_eog(self.shared.vocab, token) }
            {
                break;
            }
            unsafe {
                ffi::llama_sampler_accept(sampler.0, token);
            }
            pending.extend_from_slice(&self.render_token_bytes(token)?);

            if let Some(piece) = take_utf8(&mut pending) {
                text.push_str(&piece);
                chunks.push(piece);
                let (kept, stopped) = truncate_at_stop(&text, &params.stop);
                if stopped {
                    return Ok(RawCompletion::Text(kept.to_string()));
                }
            }

            self.decode_sequence(std::slice::from_ref(&token))?;
        }

        if !pending.is_empty() {
            let tail = String::from_utf8_lossy(&pending).into_owned();
            text.push_str(&tail);
            chunks.push(tail);
            let (kept, stopped) = truncate_at_stop(&text, &params.stop);
            if stopped {
                return Ok(RawCompletion::Text(kept.to_string()));
            }
        }

        Ok(RawCompletion::Chunks(chunks))
    }

    fn tokenize(&self, text: &str) -> Result<Vec<ffi::llama_token>> {
        let mut buf = vec![0 as ffi::llama_token; text.len().max(32)];
        let bytes = text.as_bytes();
        let text_ptr = bytes.as_ptr() as *const c_char;
        loop {
            let res = unsafe {
                ffi::llama_tokenize(
                    self.shared.vocab,
                    text_ptr,
                    bytes.len() as i32,
                    buf.as_mut_ptr(),
                    buf.len() as i32,
                    true,
                    // client text never becomes control tokens
                    false,
                )
            };
            if res >= 0 {
                buf.truncate(res as usize);
                return Ok(buf);
            }
            let needed = (-res) as usize + 8;
            buf.resize(needed, 0);
        }
    }

    fn decode_sequence(&mut self, tokens: &[ffi::llama_token]) -> Result<()> {
        let mut processed = 0usize;
        while processed < tokens.len() {
            let take = (tokens.len() - processed).min(N_BATCH as usize);
            let chunk = &tokens[processed..processed + take];
            let mut batch = unsafe { ffi::llama_batch_init(N_BATCH, 0, 1) };
            unsafe {
                let token_slice = std::slice::from_raw_parts_mut(batch.token, chunk.len());
                token_slice.copy_from_slice(chunk);

                let pos_slice = std::slice::from_raw_parts_mut(batch.pos, chunk.len());
                for (i, slot) in pos_slice.iter_mut().enumerate() {
                    *slot = (self.n_past + i as i32) as ffi::llama_pos;
                }

                let n_seq_slice = std::slice::from_raw_parts_mut(batch.n_seq_id, chunk.len());
                let seq_heads = std::slice::from_raw_parts_mut(batch.seq_id, chunk.len());
                let logits_slice = std::slice::from_raw_parts_mut(batch.logits, chunk.len());

                for i in 0..chunk.len() {
                    n_seq_slice[i] = 1;
                    let seq_slot = std::slice::from_raw_parts_mut(seq_heads[i], 1);
                    seq_slot[0] = 0;
                    logits_slice[i] = if i == chunk.len() - 1 { 1 } else { 0 };
                }
            }
            batch.n_tokens = chunk.len() as i32;
            let err = unsafe { ffi::llama_decode(self.ctx, batch) };
            unsafe { ffi::llama_batch_free(batch) };
            if err != 0 {
                bail!("llama_decode failed with code {}", err);
            }
            processed += chunk.len();
            self.n_past += chunk.len() as i32;
        }
        Ok(())
    }

    fn render_token_bytes(&self, token: ffi::llama_token) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 64];
        loop {
            let res = unsafe {
                ffi::llama_token_to_piece(
                    self.shared.vocab,
                    token,
                    buf.as_mut_ptr() as *mut c_char,
                    buf.len() as i32,
                    0,
                    false,
                )
            };
            if res >= 0 {
                return Ok(buf[..res as usize].to_vec());
            }
            let needed = (-res) as usize + 8;
            buf.resize(needed, 0);
        }
    }
}

/// Drains the longest valid UTF-8 prefix of `pending`. Invalid bytes become
/// U+FFFD; an incomplete trailing sequence stays buffered for the next token.
fn take_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                out.push_str(valid);
                pending.clear();
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    out.push_str(&String::from_utf8_lossy(&pending[..valid_up_to]));
                    pending.drain(..valid_up_to);
                    continue;
                }
                match err.error_len() {
                    Some(error_len) => {
                        pending.drain(..error_len);
                        out.push('\u{FFFD}');
                    }
                    None => break,
                }
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

impl ContextPool {
    fn new(contexts: VecDeque<LlamaContext>) -> Self {
        Self {
            inner: Arc::new(ContextPoolInner {
                queue: Mutex::new(contexts),
                available: Condvar::new(),
            }),
        }
    }

    fn checkout(&self) -> ContextLease {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(ctx) = queue.pop_front() {
                return ContextLease {
                    pool: Arc::clone(&self.inner),
                    ctx: Some(ctx),
                };
            }
            queue = self
                .inner
                .available
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}
