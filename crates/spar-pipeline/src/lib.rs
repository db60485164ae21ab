//! The turn-processing pipeline
//!
//! Everything between "a recording arrived" and "the conversation moved on":
//! - `stages`: the three stage executors a claimed job runs through
//! - `ops`: transport-independent boundary operations (start, submit, pull,
//!   rollback, end, on-demand synthesis and analysis)
//! - `worker`: the claim/execute/recover loop
//! - `analyst`: the coaching trait plus the template fallback
//! - `audio_store`: where turn audio lives
//!
//! The HTTP layer in `spar-server` is a thin translation over [`Ops`]; the
//! CLI wires providers into [`Pipeline`] and hands it to [`Worker`].

pub mod analyst;
pub mod audio_store;
pub mod ops;
pub mod stages;
pub mod worker;

pub use analyst::{AnalysisRequest, CoachingAnalyst, TemplateAnalyst};
pub use audio_store::{audio_path, AudioStore, FsAudioStore, MemoryAudioStore};
pub use ops::{
    AnalysisOutcome, ConversationSnapshot, EventPage, NewConversation, Ops, RollbackOutcome,
    SubmitReceipt, SubmitRequest, SynthesisOutcome,
};
pub use stages::Pipeline;
pub use worker::{default_worker_id, Worker};
