//! # Recognition Engine Seam
//!
//! The acoustic model is an external collaborator. The gateway only knows how to
//! hand it a WAV container plus a language hint and get annotated text back.
//!
//! ## Contract:
//! - `recognize` is async and may take seconds. It must not block the runtime, and
//!   dropping its future must stop the work: the dispatcher drops calls that run
//!   past the recognition timeout.
//! - `supports_concurrency` tells the dispatcher whether parallel calls are safe.
//!   Engines that answer `false` get exactly one inference slot.
//! - `probe` is run once at startup. A failing probe keeps the gateway not-ready.

use crate::config::EngineConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One recognition call's input.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Complete WAV file (header + 16-bit PCM)
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Language hint, `"auto"` lets the engine decide
    pub language: String,
}

/// Raw engine output before tag extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    /// Transcript possibly annotated with `<|tag|>` tokens
    pub text: String,
    pub confidence: Option<f32>,
}

impl EngineOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

#[async_trait::async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports_concurrency(&self) -> bool;

    /// Check the engine can actually be invoked.
    fn probe(&self) -> Result<()>;

    async fn recognize(&self, request: EngineRequest) -> Result<EngineOutput>;
}

/// Engine backed by an external executable.
///
/// Each call spawns `command args...`, writes the WAV container to the child's
/// stdin and reads the annotated transcript from stdout. Placeholders in `args`
/// (`{language}`, `{sample_rate}`, `{channels}`) are substituted per call.
/// The child is killed if the call is dropped before it exits.
pub struct CommandEngine {
    command: String,
    args: Vec<String>,
    concurrent: bool,
    label: String,
}

impl CommandEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            concurrent: config.concurrent,
            label: format!("command:{}", config.command),
        }
    }

    fn render_args(&self, request: &EngineRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{language}", &request.language)
                    .replace("{sample_rate}", &request.sample_rate.to_string())
                    .replace("{channels}", &request.channels.to_string())
            })
            .collect()
    }

    /// Resolve the configured command the way a shell would.
    fn resolve(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.command);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.command))
            .find(|path| path.is_file())
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.label
    }

    fn supports_concurrency(&self) -> bool {
        self.concurrent
    }

    fn probe(&self) -> Result<()> {
        let path = self
            .resolve()
            .ok_or_else(|| anyhow!("engine command '{}' not found", self.command))?;
        tracing::info!(path = %path.display(), "Recognition engine command resolved");
        Ok(())
    }

    async fn recognize(&self, request: EngineRequest) -> Result<EngineOutput> {
        let args = self.render_args(&request);
        tracing::debug!(command = %self.command, ?args, wav_bytes = request.wav.len(), "Invoking engine");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start engine command '{}'", self.command))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("engine stdin unavailable"))?;
        let wav = request.wav;

        // Stdin is fed while the output is read so a chatty child cannot deadlock us.
        // Dropping `stdin` at the end of the block signals EOF.
        let feed = async move {
            stdin.write_all(&wav).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("failed to wait for engine command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "engine exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        fed.map_err(|err| anyhow!("failed to send audio to engine: {}", err))?;

        let text = String::from_utf8(output.stdout).context("engine produced non-UTF-8 output")?;
        Ok(EngineOutput::text(text.trim()))
    }
}
