use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::inference::GenerationParams;

pub const DEFAULT_MODEL_PATH: &str = "models/mistral-7b-instruct-v0.2.Q4_K_M.gguf";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_CTX: u32 = 4096;
const DEFAULT_CHAT_MAX_TOKENS: u32 = 200;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_TOP_P: f32 = 0.9;
const DEFAULT_REPEAT_PENALTY: f32 = 1.1;
const DEFAULT_CHAT_STOP: &str = "User:,Assistant:";
const DEFAULT_SEED: u32 = 42;

/// How the llama.cpp engine is loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct LlamaSettings {
    pub model_path: PathBuf,
    pub ctx_length: u32,
    pub threads: i32,
    pub seed: Option<u32>,
    pub gpu_layers: i32,
    pub pool_size: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub llama: LlamaSettings,
    /// Parameters for `/chat`, which takes none from the client. Its
    /// repeat penalty also applies to `/v1/completions`.
    pub chat_defaults: GenerationParams,
}

impl ServerConfig {
    /// Loads `.env` and `config/llamacpp.env` when present, then reads the
    /// process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        dotenvy::from_filename("config/llamacpp.env").ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(&get, "BIND_ADDR", || {
            SocketAddr::from_str(DEFAULT_BIND_ADDR).map_err(|e| anyhow!(e))
        })?;

        let threads = match get("LLAMA_THREADS") {
            Some(raw) => parse_value("LLAMA_THREADS", &raw)?,
            None => num_cpus::get() as i32,
        };

        let llama = LlamaSettings {
            model_path: get("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            ctx_length: parse_or(&get, "LLAMA_CTX", || Ok(DEFAULT_CTX))?,
            threads,
            seed: match get("LLAMA_SEED") {
                Some(raw) if raw.trim().eq_ignore_ascii_case("random") => None,
                Some(raw) => Some(parse_value("LLAMA_SEED", &raw)?),
                None => Some(DEFAULT_SEED),
            },
            gpu_layers: parse_or(&get, "LLAMA_GPU_LAYERS", || Ok(0))?,
            pool_size: parse_or(&get, "LLAMA_CONTEXT_POOL", || Ok(1))?,
        };

        let repeat_penalty = Some(parse_or(&get, "REPEAT_PENALTY", || {
            Ok(DEFAULT_REPEAT_PENALTY)
        })?);

        let stop = get("CHAT_STOP")
            .unwrap_or_else(|| DEFAULT_CHAT_STOP.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let chat_defaults = GenerationParams {
            max_tokens: parse_or(&get, "CHAT_MAX_TOKENS", || Ok(DEFAULT_CHAT_MAX_TOKENS))?,
            temperature: parse_or(&get, "CHAT_TEMPERATURE", || Ok(DEFAULT_TEMPERATURE))?,
            top_p: parse_or(&get, "CHAT_TOP_P", || Ok(DEFAULT_TOP_P))?,
            repeat_penalty,
            stop,
        };
        chat_defaults
            .validate()
            .context("invalid chat generation defaults")?;

        Ok(Self {
            bind_addr,
            llama,
            chat_defaults,
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("invalid value for {key} ({raw:?}): {e}"))
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: impl FnOnce() -> Result<T>,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8000);
        assert_eq!(cfg.llama.model_path, PathBuf::from(DEFAULT_MODEL_PATH));
        assert_eq!(cfg.llama.ctx_length, 4096);
        assert_eq!(cfg.llama.seed, Some(42));
        assert_eq!(cfg.llama.pool_size, 1);
        assert_eq!(cfg.llama.threads, num_cpus::get() as i32);
        assert_eq!(cfg.chat_defaults.max_tokens, 200);
        assert_eq!(cfg.chat_defaults.temperature, 0.7);
        assert_eq!(cfg.chat_defaults.top_p, 0.9);
        assert_eq!(cfg.chat_defaults.stop, vec!["User:", "Assistant:"]);
        assert_eq!(cfg.chat_defaults.repeat_penalty, Some(1.1));
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("MODEL_PATH", "/srv/models/tiny.gguf"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("LLAMA_THREADS", "4"),
            ("LLAMA_SEED", "42"),
            ("CHAT_TEMPERATURE", "0.2"),
            ("CHAT_STOP", "User:, </s> ,"),
        ])
        .unwrap();
        assert_eq!(cfg.llama.model_path, PathBuf::from("/srv/models/tiny.gguf"));
        assert_eq!(cfg.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.llama.threads, 4);
        assert_eq!(cfg.llama.seed, Some(42));
        assert_eq!(cfg.chat_defaults.temperature, 0.2);
        assert_eq!(cfg.chat_defaults.stop, vec!["User:", "</s>"]);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config(&[("MODEL_PATH", "  "), ("LLAMA_CTX", "")]).unwrap();
        assert_eq!(cfg.llama.model_path, PathBuf::from(DEFAULT_MODEL_PATH));
        assert_eq!(cfg.llama.ctx_length, 4096);
    }

    #[test]
    fn default_chat_stops_end_the_assistant_turn() {
        let cfg = config(&[]).unwrap();
        let stops = &cfg.chat_defaults.stop;
        assert_eq!(
            crate::inference::truncate_at_stop(" Hello!\nAssistant: and more", stops).0,
            " Hello!\n"
        );
        assert_eq!(
            crate::inference::truncate_at_stop(" Sure.\nUser: next", stops).0,
            " Sure.\n"
        );
    }

    #[test]
    fn seed_can_be_randomised() {
        let cfg = config(&[("LLAMA_SEED", "random")]).unwrap();
        assert_eq!(cfg.llama.seed, None);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = config(&[("LLAMA_CTX", "lots")]).unwrap_err();
        assert!(err.to_string().contains("LLAMA_CTX"));
    }

    #[test]
    fn rejects_out_of_range_chat_defaults() {
        assert!(config(&[("CHAT_TOP_P", "1.5")]).is_err());
        assert!(config(&[("CHAT_MAX_TOKENS", "0")]).is_err());
    }
}
