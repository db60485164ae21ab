//! Speech in and speech out
//!
//! Three pieces:
//! - `format`: sniffs uploaded audio by its magic bytes
//! - `gateway`: HTTP clients for the speech gateway (flash ASR, batch ASR,
//!   synthesis), each wrapped in a circuit breaker
//! - `orchestrator`: the primary/fallback transcription flow with the
//!   duration gate and the silence/timeout/failure taxonomy

pub mod format;
pub mod gateway;
pub mod orchestrator;

pub use format::{resolve_format, sniff_format};
pub use gateway::{BatchTranscriber, FlashTranscriber, SpeechGateway};
pub use orchestrator::{
    SpeechInput, Synthesizer, SynthesizedSpeech, TranscribedInput, Transcriber, Transcript,
};
