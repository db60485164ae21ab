//! # spar-core
//!
//! Core types for the Spar voice-practice turn pipeline.
//!
//! Spar turns one recorded utterance into a transcribed operator turn, a
//! scripted counterpart reply, synthesized speech for that reply, and an
//! asynchronous coaching note, while clients follow progress through a
//! per-conversation event log.
//!
//! ## Core paradigm
//!
//! - Progress IS the event log (the cursor is the only ordering primitive)
//! - A unit of work IS a job that only moves forward through stages
//! - Exclusivity IS the atomic claim (`queued` -> `processing`), nothing else
//! - Provider calls ARE bounded (every external call carries a timeout)

pub mod breaker;
pub mod config;
pub mod fail_open;
pub mod stage;

mod error;
mod types;

pub use config::SparConfig;
pub use error::{ErrorClass, Result, SparError};
pub use stage::{
    AnalysisPayload, AnalysisResult, AsrResult, AudioSource, JobStage, MainPayload, ReplyResult,
    ResultState, SpeechOutputPayload, SpeechResult, StagePayload, StageTimings, ACTIVE_STAGES,
};
pub use types::*;
