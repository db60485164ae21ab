//! Configuration for the Spar pipeline
//!
//! One `SparConfig` is constructed at process start (file or defaults) and
//! passed by reference into the worker runtime and each stage executor.
//! Nothing reads tunables ad hoc at arbitrary points.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Top-level configuration, loaded from `spar.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SparConfig {
    pub worker: WorkerConfig,
    pub events: EventsConfig,
    pub speech: SpeechConfig,
    pub llm: LlmConfig,
    pub policy: PolicyConfig,
    pub api: ApiConfig,
}

/// Worker runtime knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs claimed per round (clamped 1..=10)
    pub max_jobs_per_round: usize,
    /// Wall-clock budget for one claim round, ms (clamped 800..=20000)
    pub round_wall_ms: u64,
    /// Per-job execution timeout, ms (clamped 500..=30000)
    pub job_timeout_ms: u64,
    /// Idle backoff starts here, ms
    pub idle_sleep_min_ms: u64,
    /// Idle backoff is capped here, ms
    pub idle_sleep_max_ms: u64,
    /// Sleep after a round that errored, ms
    pub error_sleep_ms: u64,
    /// Liveness heartbeat interval, ms
    pub heartbeat_interval_ms: u64,
    /// Minimum interval between staleness sweeps, ms
    pub recover_interval_ms: u64,
    /// Max jobs requeued per staleness sweep
    pub recover_batch: usize,
    /// A `processing` job older than this is presumed abandoned, ms
    pub stale_after_ms: u64,
    /// Execute a single round and exit (scripted runs)
    pub run_once: bool,
    /// Let the intake path opportunistically run a submitted job's main stage
    pub kick_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_round: default_max_jobs_per_round(),
            round_wall_ms: default_round_wall_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            idle_sleep_min_ms: 200,
            idle_sleep_max_ms: 1600,
            error_sleep_ms: 1200,
            heartbeat_interval_ms: 2000,
            recover_interval_ms: 3000,
            recover_batch: 20,
            stale_after_ms: 30_000,
            run_once: false,
            kick_enabled: true,
        }
    }
}

/// Event log consumption knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Max events returned per pull
    pub pull_batch: usize,
    /// Default long-poll wait, ms
    pub pull_default_wait_ms: u64,
    pub pull_min_wait_ms: u64,
    pub pull_max_wait_ms: u64,
    /// Default SSE window, ms
    pub stream_default_wait_ms: u64,
    pub stream_min_wait_ms: u64,
    pub stream_max_wait_ms: u64,
    /// Empty-result poll backoff starts here, ms
    pub poll_min_ms: u64,
    /// Empty-result poll backoff is capped here, ms
    pub poll_max_ms: u64,
    /// SSE keep-alive ping interval, seconds
    pub keepalive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            pull_batch: 50,
            pull_default_wait_ms: 10_000,
            pull_min_wait_ms: 800,
            pull_max_wait_ms: 15_000,
            stream_default_wait_ms: 25_000,
            stream_min_wait_ms: 5_000,
            stream_max_wait_ms: 30_000,
            poll_min_ms: 120,
            poll_max_ms: 960,
            keepalive_secs: 15,
        }
    }
}

/// Speech provider knobs (transcription in, synthesis out)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Gateway base URL for both ASR paths and synthesis
    pub gateway_url: String,
    /// Environment variable holding the gateway credential
    pub api_key_env: String,
    pub primary_enabled: bool,
    pub primary_timeout_ms: u64,
    pub fallback_enabled: bool,
    pub fallback_timeout_ms: u64,
    /// Clips shorter than this never hit the fallback path; too short to
    /// contain decodable speech and the timeout budget is wasted on them
    pub fallback_min_secs: f32,
    /// Fallback poll attempts (clamped 4..=16)
    pub fallback_poll_attempts: u32,
    pub fallback_poll_base_ms: u64,
    pub fallback_poll_step_ms: u64,
    pub fallback_poll_max_ms: u64,
    pub tts_timeout_ms: u64,
    pub tts_retries: u32,
    pub tts_voice: String,
    /// Audio at or below this size rides inline in the job payload
    pub inline_audio_max_bytes: usize,
    /// Consecutive provider failures before the breaker opens
    pub breaker_threshold: u32,
    /// Breaker cool-down before a half-open probe, ms
    pub breaker_cooldown_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8089".to_string(),
            api_key_env: "SPAR_SPEECH_API_KEY".to_string(),
            primary_enabled: true,
            primary_timeout_ms: 12_000,
            fallback_enabled: true,
            fallback_timeout_ms: 8_000,
            fallback_min_secs: 1.0,
            fallback_poll_attempts: default_fallback_poll_attempts(),
            fallback_poll_base_ms: 80,
            fallback_poll_step_ms: 40,
            fallback_poll_max_ms: 280,
            tts_timeout_ms: 6_500,
            tts_retries: 1,
            tts_voice: "ember".to_string(),
            inline_audio_max_bytes: 600_000,
            breaker_threshold: 3,
            breaker_cooldown_ms: 60_000,
        }
    }
}

/// Generative provider knobs (rewrite + coaching analysis)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub rewrite_enabled: bool,
    /// Probability that a selected line is rewritten (clamped 0..=1)
    pub rewrite_probability: f32,
    pub rewrite_timeout_ms: u64,
    pub analysis_timeout_ms: u64,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "SPAR_LLM_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            rewrite_enabled: true,
            rewrite_probability: 0.3,
            rewrite_timeout_ms: 6_000,
            analysis_timeout_ms: 12_000,
            max_retries: 2,
            breaker_threshold: 3,
            breaker_cooldown_ms: 60_000,
        }
    }
}

/// Dialogue policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Repeated operator signatures before the angle rotates
    pub stagnation_threshold: u32,
    /// Rounds on one intent before it rotates
    pub max_same_intent_rounds: u32,
    /// Used-line memory cap
    pub used_line_cap: usize,
    /// Recent turns fed to selection and analysis
    pub history_window: usize,
    /// Default counterpart replies per conversation
    pub max_turns: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            stagnation_threshold: 2,
            max_same_intent_rounds: 4,
            used_line_cap: 180,
            history_window: 8,
            max_turns: 10,
        }
    }
}

/// HTTP boundary knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Operator submissions allowed per conversation per minute (0 disables)
    pub rate_limit_per_min: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8460".to_string(),
            rate_limit_per_min: 10,
        }
    }
}

// Default value providers for the clamped knobs
fn default_max_jobs_per_round() -> usize {
    3
}

fn default_round_wall_ms() -> u64 {
    6_000
}

fn default_job_timeout_ms() -> u64 {
    9_000
}

fn default_fallback_poll_attempts() -> u32 {
    8
}

impl SparConfig {
    /// Load configuration from a TOML file, or use defaults when the file is
    /// absent. Out-of-range knobs are clamped, never rejected.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| {
                crate::SparError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Self::default()
        };
        Ok(config.clamped())
    }

    /// Write the default configuration next to where it would be loaded from.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| crate::SparError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Pull every tunable back into its supported range.
    pub fn clamped(mut self) -> Self {
        self.worker.max_jobs_per_round = self.worker.max_jobs_per_round.clamp(1, 10);
        self.worker.round_wall_ms = self.worker.round_wall_ms.clamp(800, 20_000);
        self.worker.job_timeout_ms = self.worker.job_timeout_ms.clamp(500, 30_000);
        if self.worker.idle_sleep_max_ms < self.worker.idle_sleep_min_ms {
            self.worker.idle_sleep_max_ms = self.worker.idle_sleep_min_ms;
        }

        self.events.pull_default_wait_ms = self
            .events
            .pull_default_wait_ms
            .clamp(self.events.pull_min_wait_ms, self.events.pull_max_wait_ms);
        self.events.stream_default_wait_ms = self.events.stream_default_wait_ms.clamp(
            self.events.stream_min_wait_ms,
            self.events.stream_max_wait_ms,
        );
        if self.events.poll_max_ms < self.events.poll_min_ms {
            self.events.poll_max_ms = self.events.poll_min_ms;
        }

        self.speech.fallback_poll_attempts = self.speech.fallback_poll_attempts.clamp(4, 16);
        self.speech.fallback_min_secs = self.speech.fallback_min_secs.max(0.0);
        self.llm.rewrite_probability = self.llm.rewrite_probability.clamp(0.0, 1.0);
        self
    }

    /// Clamp an externally supplied pull wait into the configured window.
    pub fn clamp_pull_wait_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.events.pull_default_wait_ms)
            .clamp(self.events.pull_min_wait_ms, self.events.pull_max_wait_ms)
    }

    /// Clamp an externally supplied stream window into the configured range.
    pub fn clamp_stream_wait_ms(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.events.stream_default_wait_ms).clamp(
            self.events.stream_min_wait_ms,
            self.events.stream_max_wait_ms,
        )
    }
}
