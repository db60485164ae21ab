//! Unified error types for Spar

use thiserror::Error;

/// Unified error type for all Spar operations
#[derive(Error, Debug)]
pub enum SparError {
    // Input errors: surfaced to the caller immediately, never retried
    #[error("conversation not active: {0}")]
    ConversationNotActive(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("turn not found: {0}")]
    TurnNotFound(String),

    #[error("reply-to turn not found: {0}")]
    ReplyTurnNotFound(String),

    #[error("reply-to turn {0} is not a counterpart turn")]
    ReplyTurnWrongRole(String),

    #[error("turn {0} has the wrong role for this operation")]
    TurnWrongRole(String),

    #[error("turn {0} has no text to work with")]
    TurnTextEmpty(String),

    #[error("audio payload is empty")]
    AudioEmpty,

    #[error("unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("conflicting turn creation: {0}")]
    TurnConflict(String),

    // Transient provider errors: the caller resubmits a new turn
    #[error("no speech detected in the recording")]
    AsrSilence,

    #[error("transcription timed out after {0}ms")]
    AsrTimeout(u64),

    #[error("transcription failed: {0}")]
    AsrFailed(String),

    #[error("speech synthesis failed: {0}")]
    TtsFailed(String),

    #[error("generative provider failed: {0}")]
    Llm(String),

    // Systemic errors: fatal for the job, conversation stays usable
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job claim lost: {0}")]
    ClaimLost(String),

    #[error("job error: {0}")]
    Job(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("audio storage error: {0}")]
    AudioStore(String),

    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to decide retry behaviour and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request; fail fast, no retry.
    Input,
    /// External provider hiccup; the user submits a fresh turn.
    Provider,
    /// Something internal broke; log with context.
    Systemic,
}

impl SparError {
    /// Stable wire code carried in `turn_error` events and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConversationNotActive(_) => "conversation_not_active",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::TurnNotFound(_) => "turn_not_found",
            Self::ReplyTurnNotFound(_) => "reply_turn_not_found",
            Self::ReplyTurnWrongRole(_) => "reply_turn_wrong_role",
            Self::TurnWrongRole(_) => "turn_wrong_role",
            Self::TurnTextEmpty(_) => "turn_text_empty",
            Self::AudioEmpty => "audio_empty",
            Self::UnsupportedAudioFormat(_) => "unsupported_audio_format",
            Self::RateLimited(_) => "rate_limited",
            Self::TurnConflict(_) => "turn_conflict",
            Self::AsrSilence => "asr_silence",
            Self::AsrTimeout(_) => "asr_timeout",
            Self::AsrFailed(_) => "asr_failed",
            Self::TtsFailed(_) => "tts_failed",
            Self::Llm(_) => "llm_failed",
            Self::JobNotFound(_) => "job_not_found",
            Self::ClaimLost(_) => "claim_lost",
            Self::Job(_) => "job_error",
            Self::Store(_) => "store_error",
            Self::AudioStore(_) => "audio_storage_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal_error",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConversationNotActive(_)
            | Self::ConversationNotFound(_)
            | Self::TurnNotFound(_)
            | Self::ReplyTurnNotFound(_)
            | Self::ReplyTurnWrongRole(_)
            | Self::TurnWrongRole(_)
            | Self::TurnTextEmpty(_)
            | Self::AudioEmpty
            | Self::UnsupportedAudioFormat(_)
            | Self::RateLimited(_)
            | Self::TurnConflict(_) => ErrorClass::Input,
            Self::AsrSilence
            | Self::AsrTimeout(_)
            | Self::AsrFailed(_)
            | Self::TtsFailed(_)
            | Self::Llm(_) => ErrorClass::Provider,
            _ => ErrorClass::Systemic,
        }
    }

    /// Message shown to the person holding the microphone. The remedy differs
    /// per failure: re-record, move closer, or plain retry.
    pub fn user_message(&self) -> String {
        match self {
            Self::AsrSilence => {
                "No speech detected. Re-record a little closer to the microphone.".to_string()
            }
            Self::AsrTimeout(_) => "Transcription timed out. Please try again.".to_string(),
            Self::AsrFailed(_) => "Transcription failed. Please try again.".to_string(),
            Self::TtsFailed(_) => {
                "Audio generation failed. The reply is available as text.".to_string()
            }
            Self::UnsupportedAudioFormat(fmt) => {
                format!("Audio format '{fmt}' is not supported. Record as wav, mp3, ogg or flac.")
            }
            Self::RateLimited(_) => "Too many recordings in a row. Wait a moment.".to_string(),
            Self::ConversationNotActive(_) => "This practice session has ended.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using SparError
pub type Result<T> = std::result::Result<T, SparError>;
