//! Primary/fallback transcription flow
//!
//! The primary transcriber is the low-latency path and always goes first.
//! The fallback only runs when the primary is disabled, errored, or heard
//! nothing, and only for clips long enough to plausibly contain speech.
//! Whatever happens, the caller learns which provider answered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use spar_core::config::SpeechConfig;
use spar_core::{AsrProvider, AudioFormat, Emotion, Result, SparError};

use crate::gateway::{BatchTranscriber, FlashTranscriber, SpeechGateway};

/// What a transcription provider heard
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f32>,
    pub seconds: Option<f32>,
}

/// Synthesized audio plus what the provider knows about it
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub seconds: Option<f32>,
}

/// Speech-to-text boundary. The gateway implements this twice, once per
/// path; tests substitute scripted fakes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<Transcript>;
}

/// Text-to-speech boundary.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, emotion: Emotion) -> Result<SynthesizedSpeech>;
}

/// A finished transcription round: the text plus which provider produced it.
#[derive(Debug, Clone)]
pub struct TranscribedInput {
    pub text: String,
    pub confidence: Option<f32>,
    pub seconds: Option<f32>,
    pub provider: AsrProvider,
}

/// Orchestrates the two transcription paths over uploaded audio.
pub struct SpeechInput {
    primary: Option<Arc<dyn Transcriber>>,
    fallback: Option<Arc<dyn Transcriber>>,
    primary_timeout: Duration,
    fallback_timeout: Duration,
    fallback_min_secs: f32,
}

impl SpeechInput {
    /// Start with no providers wired; attach them with the builder methods.
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            primary: None,
            fallback: None,
            primary_timeout: Duration::from_millis(config.primary_timeout_ms),
            fallback_timeout: Duration::from_millis(config.fallback_timeout_ms),
            fallback_min_secs: config.fallback_min_secs,
        }
    }

    /// Wire both paths to the speech gateway, honoring the enable flags.
    pub fn from_gateway(gateway: Arc<SpeechGateway>, config: &SpeechConfig) -> Self {
        let mut input = Self::new(config);
        if config.primary_enabled {
            input = input.with_primary(Arc::new(FlashTranscriber::new(gateway.clone())));
        }
        if config.fallback_enabled {
            input = input.with_fallback(Arc::new(BatchTranscriber::new(gateway)));
        }
        input
    }

    pub fn with_primary(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.primary = Some(transcriber);
        self
    }

    pub fn with_fallback(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.fallback = Some(transcriber);
        self
    }

    /// Transcribe one uploaded clip. `duration_hint` is the client-reported
    /// length in seconds; it gates the fallback and backfills the duration
    /// when the provider does not report one.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        duration_hint: Option<f32>,
    ) -> Result<TranscribedInput> {
        let mut primary_error: Option<SparError> = None;

        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.primary_timeout, primary.transcribe(audio, format))
                .await
            {
                Ok(Ok(transcript)) if !transcript.text.trim().is_empty() => {
                    return Ok(TranscribedInput {
                        text: transcript.text,
                        confidence: transcript.confidence,
                        seconds: transcript.seconds.or(duration_hint),
                        provider: AsrProvider::Primary,
                    });
                }
                Ok(Ok(_)) => {
                    tracing::debug!("primary transcriber heard nothing, considering fallback");
                }
                Ok(Err(e)) => {
                    tracing::warn!("primary transcriber failed: {}", e);
                    primary_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        "primary transcriber exceeded {}ms",
                        self.primary_timeout.as_millis()
                    );
                    primary_error = Some(SparError::AsrTimeout(
                        self.primary_timeout.as_millis() as u64,
                    ));
                }
            }
        }

        let fallback = match &self.fallback {
            Some(fallback) => fallback,
            None => return Err(self.without_fallback(primary_error)),
        };

        // Clips below the duration gate never reach the fallback; there is
        // nothing decodable in them and the submit+poll budget is not free.
        if let Some(secs) = duration_hint {
            if secs < self.fallback_min_secs {
                tracing::debug!(
                    "clip of {:.2}s is under the {:.2}s fallback gate, treating as silence",
                    secs,
                    self.fallback_min_secs
                );
                return Err(SparError::AsrSilence);
            }
        }

        // One more timeout slice for the whole submit-and-poll flow. Each
        // inner call carries its own timeout; this bounds their sum.
        let raced =
            tokio::time::timeout(self.fallback_timeout, fallback.transcribe(audio, format)).await;
        match raced {
            Ok(Ok(transcript)) if !transcript.text.trim().is_empty() => Ok(TranscribedInput {
                text: transcript.text,
                confidence: transcript.confidence,
                seconds: transcript.seconds.or(duration_hint),
                provider: AsrProvider::Fallback,
            }),
            Ok(Ok(_)) => Err(SparError::AsrSilence),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SparError::AsrTimeout(
                self.fallback_timeout.as_millis() as u64
            )),
        }
    }

    fn without_fallback(&self, primary_error: Option<SparError>) -> SparError {
        match primary_error {
            Some(e) => e,
            None if self.primary.is_some() => SparError::AsrSilence,
            None => SparError::AsrFailed("no transcription provider is configured".to_string()),
        }
    }
}
