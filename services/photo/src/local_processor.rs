//! Local background removal.
//!
//! Runs a model command as `<program> <args...> <input> <output>` inside a
//! scratch directory. Without a configured program the passthrough stub copies
//! the input unchanged.

use crate::config::LocalProcessorConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Local processing failed: {0}")]
    Failed(String),

    #[error("Scratch directory error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalProcessor: Send + Sync {
    /// Remove the background of a PNG/JPEG image, returning PNG bytes.
    async fn process(&self, image: Bytes) -> Result<Bytes, ProcessorError>;
}

/// Copies input to output
#[derive(Debug, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl LocalProcessor for PassthroughProcessor {
    async fn process(&self, image: Bytes) -> Result<Bytes, ProcessorError> {
        Ok(image)
    }
}

/// Runs an external model program
#[derive(Debug)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, work_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            work_dir,
        }
    }
}

#[async_trait]
impl LocalProcessor for CommandProcessor {
    #[instrument(skip(self, image), fields(program = %self.program, size_bytes = image.len()))]
    async fn process(&self, image: Bytes) -> Result<Bytes, ProcessorError> {
        let scratch = self.work_dir.join(format!("bg-removal-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.run_in(&scratch, image).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "Failed to clean up scratch directory");
        }

        result
    }
}

impl CommandProcessor {
    async fn run_in(&self, scratch: &std::path::Path, image: Bytes) -> Result<Bytes, ProcessorError> {
        let input = scratch.join("input.png");
        let output = scratch.join("output.png");
        tokio::fs::write(&input, &image).await?;

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .arg(&output)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProcessorError::Failed(format!("failed to start {}: {e}", self.program)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            return Err(ProcessorError::Failed(if stderr.is_empty() {
                format!("process exited with {}", result.status)
            } else {
                stderr
            }));
        }

        match tokio::fs::read(&output).await {
            Ok(processed) => {
                debug!(size_bytes = processed.len(), "Local model produced output");
                Ok(Bytes::from(processed))
            }
            Err(_) => Err(ProcessorError::Failed("model produced no output file".to_string())),
        }
    }
}

/// Build the configured processor
pub fn from_config(config: &LocalProcessorConfig) -> std::sync::Arc<dyn LocalProcessor> {
    match &config.program {
        Some(program) if !program.trim().is_empty() => std::sync::Arc::new(CommandProcessor::new(
            program.clone(),
            config.args.clone(),
            config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
        )),
        _ => std::sync::Arc::new(PassthroughProcessor),
    }
}
