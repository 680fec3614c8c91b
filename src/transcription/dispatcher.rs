//! # Recognition Dispatcher
//!
//! Runs recognition off the connection's receive path on a bounded worker pool.
//!
//! ## How a submission flows:
//! 1. `submit` spawns an async task and returns its `JoinHandle` immediately
//! 2. The call waits for a worker slot (semaphore permit)
//! 3. WAV encoding and the engine call run while holding the permit
//! 4. The outcome is post-processed into a [`RecognitionResult`]
//!
//! ## Failure policy:
//! The returned handle always resolves to a result. Engine errors, panics and
//! timeouts produce an empty transcript with `error` set, so the session keeps
//! running after a failed recognition.
//!
//! The timeout starts at submission and covers the wait for a slot as well as the
//! engine call. A call that runs out of time is aborted, which drops the engine
//! future (killing an engine process) and frees its slot.

use crate::audio::pcm;
use crate::config::AudioFormatConfig;
use crate::error::GatewayError;
use crate::transcription::engine::{EngineOutput, EngineRequest, RecognitionEngine};
use crate::transcription::postprocess::{self, DEFAULT_CONFIDENCE};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Audio handed to the worker pool for one recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionTask {
    /// Registry serial of the owning session
    pub session_serial: u64,
    pub session_id: String,
    pub audio: Vec<u8>,
    pub language: String,
    pub is_final: bool,
}

/// Outcome of one recognition, as sent to the client in `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(rename = "transcription")]
    pub transcript: String,
    pub language: String,
    pub language_name: String,
    pub confidence: f32,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecognitionResult {
    pub fn from_output(output: EngineOutput) -> Self {
        let parsed = postprocess::parse(&output.text);
        if !parsed.tags.is_empty() {
            tracing::trace!(tags = ?parsed.tags, "Engine annotations stripped");
        }
        Self {
            transcript: parsed.text,
            language: parsed.language,
            language_name: parsed.language_name,
            confidence: output.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            timestamp: Utc::now().to_rfc3339(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            transcript: String::new(),
            language: postprocess::UNKNOWN_LANGUAGE.to_string(),
            language_name: postprocess::UNKNOWN_LANGUAGE_NAME.to_string(),
            confidence: 0.0,
            timestamp: Utc::now().to_rfc3339(),
            error: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Snapshot of dispatcher counters for the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub slots: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

/// Decrements the in-flight counter when the engine call ends, even by panic.
struct InFlightGuard(Arc<Counters>);

impl InFlightGuard {
    fn enter(counters: Arc<Counters>) -> Self {
        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct RecognitionDispatcher {
    engine: Arc<dyn RecognitionEngine>,
    permits: Arc<Semaphore>,
    slots: usize,
    format: AudioFormatConfig,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl RecognitionDispatcher {
    /// Create a dispatcher with `workers` slots.
    ///
    /// Engines that cannot run concurrently get a single slot no matter how many
    /// workers are configured.
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        workers: usize,
        timeout: Duration,
        format: AudioFormatConfig,
    ) -> Self {
        let workers = workers.max(1);
        let slots = if engine.supports_concurrency() {
            workers
        } else {
            if workers > 1 {
                warn!(
                    engine = engine.name(),
                    workers, "Engine is not safe for concurrent use; serializing recognition"
                );
            }
            1
        };

        info!(engine = engine.name(), slots, timeout_secs = timeout.as_secs_f64(), "Recognition dispatcher ready");

        Self {
            engine,
            permits: Arc::new(Semaphore::new(slots)),
            slots,
            format,
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Hand a task to the worker pool. Never blocks the caller.
    pub fn submit(&self, task: RecognitionTask) -> JoinHandle<RecognitionResult> {
        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let format = self.format.clone();
        let timeout = self.timeout;

        counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            session_id = %task.session_id,
            bytes = task.audio.len(),
            audio_secs = pcm::duration_secs(task.audio.len(), &self.format),
            is_final = task.is_final,
            "Recognition submitted"
        );

        tokio::spawn(async move {
            let started = Instant::now();
            let session_id = task.session_id.clone();
            let is_final = task.is_final;

            match run(engine, permits, Arc::clone(&counters), format, timeout, task).await {
                Ok(output) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    let result = RecognitionResult::from_output(output);
                    info!(
                        session_id = %session_id,
                        is_final,
                        language = %result.language,
                        chars = result.transcript.chars().count(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Recognition completed"
                    );
                    result
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = %session_id, is_final, error = %err, "Recognition failed");
                    RecognitionResult::failure(err.to_string())
                }
            }
        })
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            slots: self.slots,
        }
    }
}

async fn run(
    engine: Arc<dyn RecognitionEngine>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    format: AudioFormatConfig,
    timeout: Duration,
    task: RecognitionTask,
) -> Result<EngineOutput, GatewayError> {
    // A separate task so an engine panic surfaces as a JoinError
    let mut call = tokio::spawn(async move {
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Recognition("worker pool is shut down".to_string()))?;
        let _in_flight = InFlightGuard::enter(counters);

        let wav = pcm::encode_wav(&task.audio, &format)
            .map_err(|err| GatewayError::Recognition(format!("{:#}", err)))?;
        engine
            .recognize(EngineRequest {
                wav,
                sample_rate: format.sample_rate,
                channels: format.channels,
                language: task.language,
            })
            .await
            .map_err(|err| GatewayError::Recognition(format!("{:#}", err)))
    });

    match tokio::time::timeout(timeout, &mut call).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(GatewayError::Recognition("engine panicked".to_string()))
        }
        Ok(Err(join_err)) => Err(GatewayError::Recognition(join_err.to_string())),
        Err(_) => {
            call.abort();
            Err(GatewayError::Recognition(format!(
                "timed out after {:.1}s",
                timeout.as_secs_f64()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    /// Engine answering every call with a fixed script.
    struct ScriptedEngine {
        reply: Result<String, String>,
        concurrent: bool,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedEngine {
        fn ok(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                concurrent: true,
                delay: Duration::ZERO,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                ..Self::ok("")
            }
        }
    }

    #[async_trait::async_trait]
    impl RecognitionEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_concurrency(&self) -> bool {
            self.concurrent
        }

        fn probe(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recognize(&self, request: EngineRequest) -> anyhow::Result<EngineOutput> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            assert_eq!(&request.wav[0..4], b"RIFF");
            match &self.reply {
                Ok(text) => Ok(EngineOutput::text(text.clone())),
                Err(message) => Err(anyhow!(message.clone())),
            }
        }
    }

    struct PanickingEngine;

    #[async_trait::async_trait]
    impl RecognitionEngine for PanickingEngine {
        fn name(&self) -> &str {
            "panicking"
        }

        fn supports_concurrency(&self) -> bool {
            true
        }

        fn probe(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recognize(&self, _request: EngineRequest) -> anyhow::Result<EngineOutput> {
            panic!("model exploded");
        }
    }

    fn format() -> AudioFormatConfig {
        AudioFormatConfig {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }

    fn task(is_final: bool) -> RecognitionTask {
        RecognitionTask {
            session_serial: 1,
            session_id: "s1".to_string(),
            audio: vec![0u8; 3200],
            language: "auto".to_string(),
            is_final,
        }
    }

    fn dispatcher(engine: Arc<dyn RecognitionEngine>, workers: usize) -> RecognitionDispatcher {
        RecognitionDispatcher::new(engine, workers, Duration::from_secs(5), format())
    }

    #[tokio::test]
    async fn test_successful_recognition() {
        let engine = Arc::new(ScriptedEngine::ok("<|en|><|NEUTRAL|>hello world"));
        let dispatcher = dispatcher(engine, 4);

        let result = dispatcher.submit(task(true)).await.unwrap();
        assert_eq!(result.transcript, "hello world");
        assert_eq!(result.language, "en");
        assert_eq!(result.language_name, "English");
        assert_eq!(result.confidence, DEFAULT_CONFIDENCE);
        assert!(result.error.is_none());

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_engine_error_becomes_result() {
        let dispatcher = dispatcher(Arc::new(ScriptedEngine::failing("decoder crashed")), 2);

        let result = dispatcher.submit(task(true)).await.unwrap();
        assert_eq!(result.transcript, "");
        assert_eq!(result.confidence, 0.0);
        assert!(result.error.as_deref().unwrap_or_default().contains("decoder crashed"));
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_engine_panic_becomes_result() {
        let dispatcher = dispatcher(Arc::new(PanickingEngine), 2);

        let result = dispatcher.submit(task(false)).await.unwrap();
        assert!(result.is_failure());
        assert_eq!(result.error.as_deref(), Some("recognition failed: engine panicked"));
        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_timeout_becomes_result() {
        let mut engine = ScriptedEngine::ok("late");
        engine.delay = Duration::from_millis(300);
        let dispatcher = RecognitionDispatcher::new(
            Arc::new(engine),
            1,
            Duration::from_millis(50),
            format(),
        );

        let result = dispatcher.submit(task(true)).await.unwrap();
        assert!(result.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_queued_task_times_out_behind_stuck_call() {
        let mut engine = ScriptedEngine::ok("never");
        engine.delay = Duration::from_secs(3);
        let dispatcher = RecognitionDispatcher::new(
            Arc::new(engine),
            1,
            Duration::from_millis(100),
            format(),
        );

        let started = Instant::now();
        let first = dispatcher.submit(task(false));
        let second = dispatcher.submit(task(true));

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(first.error.as_deref().unwrap_or_default().contains("timed out"));
        assert!(second.error.as_deref().unwrap_or_default().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The aborted calls give their slot back
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.stats().in_flight, 0);
        assert_eq!(dispatcher.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_non_concurrent_engine_gets_one_slot() {
        let mut engine = ScriptedEngine::ok("x");
        engine.concurrent = false;
        engine.delay = Duration::from_millis(30);
        let engine = Arc::new(engine);
        let dispatcher = dispatcher(engine.clone(), 4);
        assert_eq!(dispatcher.stats().slots, 1);

        let handles: Vec<_> = (0..4).map(|_| dispatcher.submit(task(false))).collect();
        for handle in handles {
            assert!(handle.await.unwrap().error.is_none());
        }

        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().completed, 4);
    }

    #[test]
    fn test_result_serialization() {
        let json = serde_json::to_value(RecognitionResult::failure("boom")).unwrap();
        assert_eq!(json["transcription"], "");
        assert_eq!(json["error"], "boom");

        let ok = RecognitionResult::from_output(EngineOutput {
            text: "<|ko|>안녕".to_string(),
            confidence: Some(0.93),
        });
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["language_name"], "Korean");
        assert!(json.get("error").is_none());
        assert!((ok.confidence - 0.93).abs() < f32::EPSILON);
    }
}
