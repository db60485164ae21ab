//! Core type definitions for the Spar pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::{JobStage, ResultState, StagePayload};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Short form for log lines.
            pub fn short(&self) -> String {
                format!("{}-{}", $prefix, &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| format!("Invalid {} id: {}", $prefix, s))
            }
        }
    };
}

uuid_id!(
    /// Identifier of one practice conversation
    ConversationId,
    "conv"
);
uuid_id!(
    /// Identifier of one utterance within a conversation
    TurnId,
    "turn"
);
uuid_id!(
    /// Identifier of one schedulable unit of pipeline work
    JobId,
    "job"
);

/// Category of scripted content governing counterpart replies
pub type CategoryId = String;

/// Scripted line identifier inside a category pack
pub type LineId = String;

/// Declared intent identifier inside a category pack
pub type IntentId = String;

/// Declared angle identifier inside an intent
pub type AngleId = String;

/// Worker identity, conventionally `hostname#pid`
pub type WorkerId = String;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The practicing human
    Operator,
    /// The simulated conversation partner
    Counterpart,
}

impl Role {
    /// The role expected at a given sequence index. The counterpart opens at
    /// index 0, then roles alternate.
    pub fn at_index(index: u32) -> Self {
        if index % 2 == 0 {
            Self::Counterpart
        } else {
            Self::Operator
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Operator => Self::Counterpart,
            Self::Counterpart => Self::Operator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator => write!(f, "operator"),
            Self::Counterpart => write!(f, "counterpart"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "operator" => Ok(Self::Operator),
            "counterpart" => Ok(Self::Counterpart),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Ended,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Turn lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Accepted,
    Processing,
    AsrReady,
    TextReady,
    AudioReady,
    AnalysisReady,
    Error,
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Processing => write!(f, "processing"),
            Self::AsrReady => write!(f, "asr_ready"),
            Self::TextReady => write!(f, "text_ready"),
            Self::AudioReady => write!(f, "audio_ready"),
            Self::AnalysisReady => write!(f, "analysis_ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Job scheduling status, orthogonal to the stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Done,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Event log entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Operator submission accepted, job queued
    TurnAccepted,
    /// Operator audio transcribed
    AsrReady,
    /// Counterpart reply text selected
    ReplyTextReady,
    /// Counterpart reply audio synthesized
    ReplyAudioReady,
    /// Coaching note attached to the operator turn
    AnalysisReady,
    /// Terminal or soft failure; payload carries code and message
    TurnError,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TurnAccepted => write!(f, "turn_accepted"),
            Self::AsrReady => write!(f, "asr_ready"),
            Self::ReplyTextReady => write!(f, "reply_text_ready"),
            Self::ReplyAudioReady => write!(f, "reply_audio_ready"),
            Self::AnalysisReady => write!(f, "analysis_ready"),
            Self::TurnError => write!(f, "turn_error"),
        }
    }
}

/// Where a counterpart reply's text came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// Straight from the scripted pack
    #[default]
    Fixed,
    /// Rewritten by the generative step
    Generated,
}

impl std::fmt::Display for ReplySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Generated => write!(f, "generated"),
        }
    }
}

/// Emotion tag attached to a scripted line, passed through to synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Pleased,
    Worried,
    Impatient,
    Skeptical,
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Pleased => write!(f, "pleased"),
            Self::Worried => write!(f, "worried"),
            Self::Impatient => write!(f, "impatient"),
            Self::Skeptical => write!(f, "skeptical"),
        }
    }
}

/// Which transcription path produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrProvider {
    Primary,
    Fallback,
}

impl std::fmt::Display for AsrProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Declared or sniffed audio container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "ogg" => Ok(Self::Ogg),
            "flac" => Ok(Self::Flac),
            _ => Err(format!("Invalid audio format: {}", s)),
        }
    }
}

/// Link from a counterpart turn back to the scripted line that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRef {
    pub line_id: LineId,
    pub intent_id: IntentId,
    pub angle_id: AngleId,
}

/// Coaching note attached to an operator turn by the analysis stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachingNote {
    /// Up to three short, actionable suggestions
    pub suggestions: Vec<String>,
    /// A polished rephrasing of what the operator said
    pub polished: String,
    /// `template` when the fallback analyst wrote it, `model` otherwise
    #[serde(default)]
    pub source: AnalysisSource,
}

/// Who authored a coaching note
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    #[default]
    Template,
    Model,
}

/// Lightweight delivery metrics computed from a transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnFeatures {
    /// Words per minute; `None` when duration is unknown
    pub speech_rate_wpm: Option<f32>,
    /// Share of filler words in the transcript; `None` when empty
    pub filler_ratio: Option<f32>,
}

/// One practice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Which scripted universe governs counterpart replies
    pub category_id: CategoryId,
    pub status: ConversationStatus,
    /// Owned by the dialogue policy engine; opaque to everyone else
    #[serde(default)]
    pub policy_memory: serde_json::Value,
    /// Counterpart replies allowed before the session is considered complete
    pub max_turns: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(category_id: impl Into<CategoryId>, max_turns: u32) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            category_id: category_id.into(),
            status: ConversationStatus::Active,
            policy_memory: serde_json::Value::Null,
            max_turns,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }
}

/// One utterance in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    /// Strictly increasing within the conversation; role alternates with it
    pub turn_index: u32,
    pub role: Role,
    pub status: TurnStatus,
    /// Empty until transcribed (operator) or selected (counterpart)
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_seconds: Option<f32>,
    /// Set on counterpart turns produced by the policy engine
    #[serde(default)]
    pub line_ref: Option<LineRef>,
    #[serde(default)]
    pub reply_source: Option<ReplySource>,
    #[serde(default)]
    pub emotion: Option<Emotion>,
    #[serde(default)]
    pub analysis: Option<CoachingNote>,
    #[serde(default)]
    pub features: Option<TurnFeatures>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(conversation_id: ConversationId, turn_index: u32, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: TurnId::new(),
            conversation_id,
            turn_index,
            role,
            status: TurnStatus::Accepted,
            text: String::new(),
            audio_path: None,
            audio_url: None,
            audio_seconds: None,
            line_ref: None,
            reply_source: None,
            emotion: None,
            analysis: None,
            features: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }

    /// The operator reply number this turn represents (1-based), counting
    /// from the counterpart opening at index 0.
    pub fn operator_turn_no(&self) -> u32 {
        (self.turn_index + 1) / 2
    }
}

/// Last error recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One schedulable unit of pipeline work, tied to a single operator turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
    pub stage: JobStage,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// Client token that created this job; lives on the job (not the stage
    /// payload) so dedup keeps working after the payload is rewritten
    #[serde(default)]
    pub idempotency_token: Option<String>,
    /// Inputs the next stage needs
    pub payload: StagePayload,
    /// Outputs accumulated across stages
    #[serde(default)]
    pub result_state: ResultState,
    #[serde(default)]
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(conversation_id: ConversationId, turn_id: TurnId, payload: StagePayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            conversation_id,
            turn_id,
            stage: JobStage::MainPending,
            status: JobStatus::Queued,
            attempt_count: 0,
            worker_id: None,
            idempotency_token: None,
            payload,
            result_state: ResultState::default(),
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn with_idempotency_token(mut self, token: Option<String>) -> Self {
        self.idempotency_token = token;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::Error)
    }

    /// Milliseconds since the job was created, for event payloads.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }
}

/// One immutable fact in a conversation's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Conversation-scoped, strictly increasing. The only ordering primitive
    /// clients may rely on.
    pub cursor: u64,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub turn_id: Option<TurnId>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Worker liveness report status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Started,
    Alive,
    Stopped,
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Alive => write!(f, "alive"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Best-effort worker liveness record, upserted by worker id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub status: HeartbeatStatus,
    pub jobs_processed: u64,
    pub updated_at: DateTime<Utc>,
}
