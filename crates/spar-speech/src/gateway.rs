//! HTTP clients for the speech gateway
//!
//! The gateway fronts both transcription paths and synthesis. Flash ASR is
//! one round trip; batch ASR is a submit followed by a short poll ramp.
//! Each side carries its own circuit breaker so a flaky synthesizer cannot
//! block transcription, or the reverse.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use spar_core::breaker::CircuitBreaker;
use spar_core::config::SpeechConfig;
use spar_core::{AudioFormat, Emotion, Result, SparError};

use crate::orchestrator::{Synthesizer, SynthesizedSpeech, Transcriber, Transcript};

const TTS_RETRY_PAUSE_MS: u64 = 250;

#[derive(Serialize)]
struct TranscribeRequest {
    audio_b64: String,
    format: AudioFormat,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    seconds: Option<f32>,
}

#[derive(Deserialize)]
struct BatchSubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct BatchPollResponse {
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    seconds: Option<f32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    emotion: Emotion,
    format: AudioFormat,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    audio_b64: String,
    #[serde(default)]
    seconds: Option<f32>,
}

/// Client for the speech gateway's three endpoints
pub struct SpeechGateway {
    base_url: String,
    api_key: Option<String>,
    voice: String,
    client: reqwest::Client,
    primary_timeout: Duration,
    fallback_timeout: Duration,
    poll_attempts: u32,
    poll_base_ms: u64,
    poll_step_ms: u64,
    poll_max_ms: u64,
    tts_timeout: Duration,
    tts_retries: u32,
    asr_breaker: CircuitBreaker,
    tts_breaker: CircuitBreaker,
}

impl SpeechGateway {
    /// Build a client from configuration. The credential is read from the
    /// configured environment variable; a local gateway may run without one.
    pub fn new(config: &SpeechConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::debug!(
                "{} is not set; calling the speech gateway without credentials",
                config.api_key_env
            );
        }
        Self {
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key,
            voice: config.tts_voice.clone(),
            client: reqwest::Client::new(),
            primary_timeout: Duration::from_millis(config.primary_timeout_ms),
            fallback_timeout: Duration::from_millis(config.fallback_timeout_ms),
            poll_attempts: config.fallback_poll_attempts,
            poll_base_ms: config.fallback_poll_base_ms,
            poll_step_ms: config.fallback_poll_step_ms,
            poll_max_ms: config.fallback_poll_max_ms,
            tts_timeout: Duration::from_millis(config.tts_timeout_ms),
            tts_retries: config.tts_retries,
            asr_breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_ms),
            tts_breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_ms),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    /// Single round trip to the low-latency transcriber.
    pub async fn transcribe_flash(
        &self,
        audio: &[u8],
        format: AudioFormat,
    ) -> Result<Transcript> {
        if !self.asr_breaker.can_execute() {
            return Err(SparError::AsrFailed(format!(
                "transcription breaker is open; retry in {}s",
                self.asr_breaker.retry_after_ms() / 1000
            )));
        }

        let request = TranscribeRequest {
            audio_b64: BASE64.encode(audio),
            format,
        };
        let response = self
            .post("/v1/transcribe/flash")
            .timeout(self.primary_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.asr_send_error("flash transcription", self.primary_timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown".into());
            self.asr_breaker.record_failure();
            return Err(SparError::AsrFailed(format!(
                "flash transcription returned {}: {}",
                status, body
            )));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| SparError::AsrFailed(format!("flash response unreadable: {}", e)))?;
        self.asr_breaker.record_success();
        Ok(Transcript {
            text: parsed.text,
            confidence: parsed.confidence,
            seconds: parsed.seconds,
        })
    }

    /// Submit to the batch transcriber, then poll with a ramping pause.
    pub async fn transcribe_batch(
        &self,
        audio: &[u8],
        format: AudioFormat,
    ) -> Result<Transcript> {
        if !self.asr_breaker.can_execute() {
            return Err(SparError::AsrFailed(format!(
                "transcription breaker is open; retry in {}s",
                self.asr_breaker.retry_after_ms() / 1000
            )));
        }

        let started = Instant::now();
        let request = TranscribeRequest {
            audio_b64: BASE64.encode(audio),
            format,
        };
        let response = self
            .post("/v1/transcribe/batch")
            .timeout(self.fallback_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.asr_send_error("batch submit", self.fallback_timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown".into());
            self.asr_breaker.record_failure();
            return Err(SparError::AsrFailed(format!(
                "batch submit returned {}: {}",
                status, body
            )));
        }
        let submitted: BatchSubmitResponse = response
            .json()
            .await
            .map_err(|e| SparError::AsrFailed(format!("batch submit unreadable: {}", e)))?;

        for attempt in 0..self.poll_attempts {
            let pause = (self.poll_base_ms + u64::from(attempt) * self.poll_step_ms)
                .min(self.poll_max_ms);
            tokio::time::sleep(Duration::from_millis(pause)).await;

            let response = self
                .get(&format!("/v1/transcribe/batch/{}", submitted.job_id))
                .timeout(self.fallback_timeout)
                .send()
                .await
                .map_err(|e| self.asr_send_error("batch poll", self.fallback_timeout, e))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|_| "unknown".into());
                self.asr_breaker.record_failure();
                return Err(SparError::AsrFailed(format!(
                    "batch poll returned {}: {}",
                    status, body
                )));
            }
            let poll: BatchPollResponse = response
                .json()
                .await
                .map_err(|e| SparError::AsrFailed(format!("batch poll unreadable: {}", e)))?;

            match poll.status.as_str() {
                "done" => {
                    self.asr_breaker.record_success();
                    return Ok(Transcript {
                        text: poll.text.unwrap_or_default(),
                        confidence: poll.confidence,
                        seconds: poll.seconds,
                    });
                }
                "failed" => {
                    self.asr_breaker.record_failure();
                    return Err(SparError::AsrFailed(
                        poll.error
                            .unwrap_or_else(|| "batch transcription failed".to_string()),
                    ));
                }
                _ => {
                    tracing::debug!(
                        "batch job {} still pending (poll {}/{})",
                        submitted.job_id,
                        attempt + 1,
                        self.poll_attempts
                    );
                }
            }
        }

        // Exhausted polls are a timeout, not a provider rejection; the
        // breaker stays untouched so a slow batch queue cannot open it.
        Err(SparError::AsrTimeout(started.elapsed().as_millis() as u64))
    }

    fn asr_send_error(&self, what: &str, budget: Duration, e: reqwest::Error) -> SparError {
        if e.is_timeout() {
            return SparError::AsrTimeout(budget.as_millis() as u64);
        }
        self.asr_breaker.record_failure();
        SparError::AsrFailed(format!("{} request failed: {}", what, e))
    }
}

#[async_trait]
impl Synthesizer for SpeechGateway {
    async fn synthesize(&self, text: &str, emotion: Emotion) -> Result<SynthesizedSpeech> {
        if text.trim().is_empty() {
            return Err(SparError::TtsFailed("nothing to synthesize".to_string()));
        }
        if !self.tts_breaker.can_execute() {
            return Err(SparError::TtsFailed(format!(
                "synthesis breaker is open; retry in {}s",
                self.tts_breaker.retry_after_ms() / 1000
            )));
        }

        let request = SynthesizeRequest {
            text,
            voice: &self.voice,
            emotion,
            format: AudioFormat::Mp3,
        };

        let mut last_error = String::new();
        for attempt in 0..=self.tts_retries {
            if attempt > 0 {
                tracing::warn!(
                    "synthesis attempt {}/{} after: {}",
                    attempt + 1,
                    self.tts_retries + 1,
                    last_error
                );
                tokio::time::sleep(Duration::from_millis(TTS_RETRY_PAUSE_MS)).await;
            }

            let response = match self
                .post("/v1/speech")
                .timeout(self.tts_timeout)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = format!("send failed: {}", e);
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|_| "unknown".into());
                last_error = format!("gateway returned {}: {}", status, body);
                continue;
            }

            let parsed: SynthesizeResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    last_error = format!("response unreadable: {}", e);
                    continue;
                }
            };
            let audio = BASE64
                .decode(parsed.audio_b64.as_bytes())
                .map_err(|e| SparError::TtsFailed(format!("audio not decodable: {}", e)))?;
            if audio.is_empty() {
                last_error = "gateway returned no audio".to_string();
                continue;
            }

            self.tts_breaker.record_success();
            return Ok(SynthesizedSpeech {
                audio,
                format: AudioFormat::Mp3,
                seconds: parsed.seconds,
            });
        }

        self.tts_breaker.record_failure();
        Err(SparError::TtsFailed(last_error))
    }
}

/// Low-latency path, used as the primary transcriber
pub struct FlashTranscriber {
    gateway: Arc<SpeechGateway>,
}

impl FlashTranscriber {
    pub fn new(gateway: Arc<SpeechGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Transcriber for FlashTranscriber {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<Transcript> {
        self.gateway.transcribe_flash(audio, format).await
    }
}

/// Submit-and-poll path, used as the fallback transcriber
pub struct BatchTranscriber {
    gateway: Arc<SpeechGateway>,
}

impl BatchTranscriber {
    pub fn new(gateway: Arc<SpeechGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Transcriber for BatchTranscriber {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<Transcript> {
        self.gateway.transcribe_batch(audio, format).await
    }
}
