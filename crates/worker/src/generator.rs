//! Generation capability
//!
//! The model itself lives behind [`Generator`]. A worker builds exactly one
//! generator after joining the group and calls it with a single dialog per
//! request. [`build`] resolves the configured backend.

use lockstep_common::config::{ModelConfig, SamplingConfig};
use lockstep_common::error::{LockstepError, Result};
use lockstep_proto::{ChatMessage, Dialog, GenerationResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Sampling parameters for one call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_gen_len: Option<usize>,
    pub temperature: f32,
    pub top_p: f32,
}

impl From<&SamplingConfig> for GenerationParams {
    fn from(sampling: &SamplingConfig) -> Self {
        Self {
            max_gen_len: sampling.max_gen_len,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
        }
    }
}

/// One entry of a generator's output, matching the dialog at the same index
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub generation: GenerationResult,
}

/// Inputs needed to build a generator
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub checkpoint_dir: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
}

impl From<&ModelConfig> for BuildSpec {
    fn from(model: &ModelConfig) -> Self {
        Self {
            checkpoint_dir: model.checkpoint_dir.clone(),
            tokenizer_path: model.tokenizer_path.clone(),
            max_seq_len: model.max_seq_len,
            max_batch_size: model.max_batch_size,
        }
    }
}

impl BuildSpec {
    fn check(&self) -> Result<()> {
        if !self.checkpoint_dir.is_dir() {
            return Err(LockstepError::model(format!(
                "checkpoint directory {} not found",
                self.checkpoint_dir.display()
            )));
        }
        if !self.tokenizer_path.is_file() {
            return Err(LockstepError::model(format!(
                "tokenizer {} not found",
                self.tokenizer_path.display()
            )));
        }
        if self.max_seq_len == 0 || self.max_batch_size == 0 {
            return Err(LockstepError::model("max_seq_len and max_batch_size must be positive"));
        }
        Ok(())
    }
}

/// A loaded model able to continue dialogs
///
/// Called from a blocking thread; implementations may do heavy synchronous
/// work and take part in collectives with the other ranks.
pub trait Generator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Produce one generation per dialog, in order
    fn generate(&self, dialogs: &[Dialog], params: &GenerationParams) -> Result<Vec<Generation>>;
}

/// Build the generator named by `model.backend`
pub fn build(model: &ModelConfig) -> Result<Arc<dyn Generator>> {
    let spec = BuildSpec::from(model);
    spec.check()?;

    let generator: Arc<dyn Generator> = match model.backend.as_str() {
        "echo" => Arc::new(EchoGenerator::new(spec.max_batch_size)),
        other => {
            return Err(LockstepError::model(format!("unknown generator backend: {}", other)));
        }
    };

    info!(
        backend = generator.name(),
        checkpoint_dir = %spec.checkpoint_dir.display(),
        max_seq_len = spec.max_seq_len,
        max_batch_size = spec.max_batch_size,
        "Generator built"
    );

    Ok(generator)
}

/// Deterministic loopback backend
///
/// Answers with the last user message, cut to `max_gen_len` characters.
/// Every rank produces the same reply for the same dialog, which is what
/// group wiring and smoke tests need.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    max_batch_size: usize,
}

impl EchoGenerator {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }
}

impl Generator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    fn generate(&self, dialogs: &[Dialog], params: &GenerationParams) -> Result<Vec<Generation>> {
        if dialogs.len() > self.max_batch_size {
            return Err(LockstepError::model(format!(
                "batch of {} dialogs exceeds max_batch_size {}",
                dialogs.len(),
                self.max_batch_size
            )));
        }

        Ok(dialogs
            .iter()
            .map(|dialog| {
                let source = dialog.last_user_message().map(|m| m.content.as_str()).unwrap_or("");
                let content: String = match params.max_gen_len {
                    Some(limit) => source.chars().take(limit).collect(),
                    None => source.to_string(),
                };
                Generation {
                    generation: ChatMessage::assistant(content),
                }
            })
            .collect())
    }
}
