//! Configuration structures for Lockstep
//!
//! One configuration is shared by the coordinator and every worker process.
//! It is loaded from a YAML file and can be overridden by environment
//! variables prefixed with `LOCKSTEP_`, using `__` between nested keys
//! (`LOCKSTEP_SERVER__PORT=8000`).

use crate::error::{LockstepError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "LOCKSTEP_CONFIG";

/// Config file used when `LOCKSTEP_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "configs/lockstep.yaml";

/// Variables the coordinator sets on every spawned worker process
pub mod rank_env {
    pub const RANK: &str = "RANK";
    pub const WORLD_SIZE: &str = "WORLD_SIZE";
    pub const LOCAL_RANK: &str = "LOCAL_RANK";
    pub const MASTER_ADDR: &str = "MASTER_ADDR";
    pub const MASTER_PORT: &str = "MASTER_PORT";
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, respectful and honest assistant. \
Always answer as helpfully as possible, while being safe.";

/// Top-level configuration for Lockstep components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Execution group settings
    #[serde(default)]
    pub group: GroupConfig,

    /// Model capability settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Sampling parameters passed to every generation
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Chat endpoint behaviour
    #[serde(default)]
    pub chat: ChatConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Execution group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Number of ranks; fixed for the lifetime of the group
    #[serde(default = "default_group_size")]
    pub size: usize,

    /// How worker units are started
    #[serde(default)]
    pub launch: LaunchMode,

    /// Path to the worker binary (process mode). Defaults to
    /// `lockstep-worker` next to the running executable.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,

    /// Rendezvous parameters handed to every rank
    #[serde(default)]
    pub rendezvous: RendezvousConfig,

    /// Upper bound on group startup, rendezvous included
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Upper bound on one fan-out/fan-in cycle (0 = unbounded)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time each worker gets to exit after the shutdown sentinel
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Worker launch mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// One OS process per rank
    #[default]
    Process,

    /// One tokio task per rank inside the coordinator
    InProcess,
}

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    #[serde(default)]
    pub backend: RendezvousBackend,

    /// Address rank 0 listens on
    #[serde(default = "default_master_addr")]
    pub address: String,

    #[serde(default = "default_master_port")]
    pub port: u16,
}

/// Rendezvous backend
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RendezvousBackend {
    /// No network rendezvous; every rank lives in one address space or
    /// the group has a single rank
    #[default]
    Local,

    /// Rank 0 accepts TCP connections from every other rank
    Tcp,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Generation backend name
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Checkpoint directory
    #[serde(default)]
    pub checkpoint_dir: PathBuf,

    /// Tokenizer file
    #[serde(default)]
    pub tokenizer_path: PathBuf,

    /// Maximum sequence length
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Maximum batch size the model is built for
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

/// Sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Maximum generated length; `None` lets the model decide
    #[serde(default)]
    pub max_gen_len: Option<usize>,
}

/// Chat endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Prepended when a dialog does not open with a system message
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,

    /// Characters per emulated stream chunk
    #[serde(default = "default_stream_chunk_chars")]
    pub stream_chunk_chars: usize,

    /// Reject responses whose ranks disagree instead of logging
    #[serde(default)]
    pub strict_consensus: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics on `/metrics`
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    5000
}

fn default_group_size() -> usize {
    1
}

fn default_ready_timeout() -> u64 {
    600
}

fn default_request_timeout() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

fn default_backend() -> String {
    "echo".to_string()
}

fn default_max_seq_len() -> usize {
    512
}

fn default_max_batch_size() -> usize {
    4
}

fn default_temperature() -> f32 {
    0.6
}

fn default_top_p() -> f32 {
    0.9
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_stream_chunk_chars() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            size: default_group_size(),
            launch: LaunchMode::default(),
            worker_binary: None,
            rendezvous: RendezvousConfig::default(),
            ready_timeout_secs: default_ready_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            backend: RendezvousBackend::default(),
            address: default_master_addr(),
            port: default_master_port(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            checkpoint_dir: PathBuf::new(),
            tokenizer_path: PathBuf::new(),
            max_seq_len: default_max_seq_len(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_gen_len: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: default_system_prompt(),
            stream_chunk_chars: default_stream_chunk_chars(),
            strict_consensus: false,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl LockstepConfig {
    /// Load configuration from a YAML file, then apply `LOCKSTEP_*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(env_source())
            .build()
            .map_err(|e| {
                LockstepError::config(format!(
                    "Failed to load config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: LockstepConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let settings = ::config::Config::builder().add_source(env_source()).build()?;
        let config: LockstepConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `LOCKSTEP_CONFIG` (or the default path when it exists),
    /// falling back to the environment alone
    pub fn load() -> Result<Self> {
        match Self::source_path() {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// File [`load`](Self::load) reads, if any
    pub fn source_path() -> Option<PathBuf> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Some(PathBuf::from(DEFAULT_CONFIG_PATH))
            }
            Err(_) => None,
        }
    }

    /// Validate configuration
    ///
    /// Runs before any worker is spawned so that a bad path or size fails
    /// the coordinator instead of a rank half way through startup.
    pub fn validate(&self) -> Result<()> {
        let group = &self.group;
        if group.size == 0 {
            return Err(LockstepError::config("group.size must be at least 1"));
        }

        if group.launch == LaunchMode::Process
            && group.size > 1
            && group.rendezvous.backend == RendezvousBackend::Local
        {
            return Err(LockstepError::config(
                "local rendezvous cannot span processes; use the tcp backend for group.size > 1",
            ));
        }

        if group.rendezvous.backend == RendezvousBackend::Tcp && group.rendezvous.port == 0 {
            return Err(LockstepError::config("group.rendezvous.port must be non-zero"));
        }

        if group.ready_timeout_secs == 0 {
            return Err(LockstepError::config("group.ready_timeout_secs must be positive"));
        }

        self.validate_model()?;

        let sampling = &self.sampling;
        if !(sampling.temperature >= 0.0) {
            return Err(LockstepError::config(format!(
                "sampling.temperature must be >= 0, got {}",
                sampling.temperature
            )));
        }
        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            return Err(LockstepError::config(format!(
                "sampling.top_p must be in (0, 1], got {}",
                sampling.top_p
            )));
        }
        if sampling.max_gen_len == Some(0) {
            return Err(LockstepError::config("sampling.max_gen_len must be positive when set"));
        }

        if self.chat.stream_chunk_chars == 0 {
            return Err(LockstepError::config("chat.stream_chunk_chars must be at least 1"));
        }

        Ok(())
    }

    fn validate_model(&self) -> Result<()> {
        let model = &self.model;
        if model.checkpoint_dir.as_os_str().is_empty() {
            return Err(LockstepError::config("model.checkpoint_dir is required"));
        }
        if !model.checkpoint_dir.is_dir() {
            return Err(LockstepError::config(format!(
                "model.checkpoint_dir {} is not a directory",
                model.checkpoint_dir.display()
            )));
        }
        if model.tokenizer_path.as_os_str().is_empty() {
            return Err(LockstepError::config("model.tokenizer_path is required"));
        }
        if !model.tokenizer_path.is_file() {
            return Err(LockstepError::config(format!(
                "model.tokenizer_path {} is not a file",
                model.tokenizer_path.display()
            )));
        }
        if model.max_seq_len == 0 || model.max_batch_size == 0 {
            return Err(LockstepError::config(
                "model.max_seq_len and model.max_batch_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// HTTP bind address as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Get startup timeout as Duration
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.group.ready_timeout_secs)
    }

    /// Get request timeout as Duration, `None` when unbounded
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.group.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.group.shutdown_timeout_secs)
    }
}

fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix("LOCKSTEP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
