//! Job stage machine: stages, stage-scoped payloads, accumulated results.
//!
//! A job only ever moves forward: `main_pending -> speech_output_pending ->
//! analysis_pending -> done`, or from any non-terminal stage to `error`.
//! Unknown stage strings deserialize to `main_pending` so work enqueued by a
//! newer binary stays processable by an older one.

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{AsrProvider, AudioFormat, Emotion, LineRef, ReplySource, TurnId};

/// Stages a worker actively claims, in claim-priority order. Earlier stages
/// come first so a fresh submission is never starved by later-stage backlog.
pub const ACTIVE_STAGES: [JobStage; 3] = [
    JobStage::MainPending,
    JobStage::SpeechOutputPending,
    JobStage::AnalysisPending,
];

/// Named phase of a job's lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    #[default]
    MainPending,
    SpeechOutputPending,
    AnalysisPending,
    Done,
    Error,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainPending => "main_pending",
            Self::SpeechOutputPending => "speech_output_pending",
            Self::AnalysisPending => "analysis_pending",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Lenient parse: unknown or legacy stage names become `main_pending`,
    /// keeping older enqueued work processable.
    pub fn normalize(s: &str) -> Self {
        match s {
            "main_pending" => Self::MainPending,
            "speech_output_pending" => Self::SpeechOutputPending,
            "analysis_pending" => Self::AnalysisPending,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::MainPending,
        }
    }

    /// The stage that follows on successful completion.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::MainPending => Some(Self::SpeechOutputPending),
            Self::SpeechOutputPending => Some(Self::AnalysisPending),
            Self::AnalysisPending => Some(Self::Done),
            Self::Done | Self::Error => None,
        }
    }

    /// Position in the forward order. `error` ranks last so that every legal
    /// move strictly increases rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::MainPending => 0,
            Self::SpeechOutputPending => 1,
            Self::AnalysisPending => 2,
            Self::Done => 3,
            Self::Error => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Forward-only rule: a job may move to the next stage, jump to `done`
    /// only from `analysis_pending`, or fail to `error` from any non-terminal
    /// stage. Nothing moves backward.
    pub fn can_advance_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target == Self::Error {
            return true;
        }
        self.next() == Some(target)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_pending" | "speech_output_pending" | "analysis_pending" | "done" | "error" => {
                Ok(Self::normalize(s))
            }
            _ => Err(format!("Invalid job stage: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for JobStage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::normalize(&s))
    }
}

/// Where the audio bytes for the main stage live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioSource {
    /// Small clips ride inside the payload
    Inline { b64: String },
    /// Larger clips are parked in the audio store
    Stored { path: String },
}

/// Inputs for the main stage (transcribe + select reply)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainPayload {
    pub reply_to_turn_id: TurnId,
    pub audio: AudioSource,
    pub audio_format: AudioFormat,
    #[serde(default)]
    pub client_seconds: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

impl MainPayload {
    /// Best-effort extraction from a legacy payload written by an unknown
    /// binary. Field names tried in the order older layouts used them.
    pub fn from_legacy(value: &serde_json::Value) -> Option<Self> {
        let reply_to = value
            .get("reply_to_turn_id")
            .or_else(|| value.get("reply_to"))
            .and_then(|v| v.as_str())?
            .parse()
            .ok()?;

        let audio = if let Some(b64) = value
            .get("audio_b64")
            .or_else(|| value.get("audio_inline_b64"))
            .and_then(|v| v.as_str())
        {
            AudioSource::Inline {
                b64: b64.to_string(),
            }
        } else if let Some(path) = value.get("audio_path").and_then(|v| v.as_str()) {
            AudioSource::Stored {
                path: path.to_string(),
            }
        } else {
            return None;
        };

        let audio_format = value
            .get("audio_format")
            .or_else(|| value.get("format"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(AudioFormat::Wav);

        let client_seconds = value
            .get("client_seconds")
            .or_else(|| value.get("client_audio_seconds"))
            .and_then(|v| v.as_f64())
            .map(|v| v as f32);

        Some(Self {
            reply_to_turn_id: reply_to,
            audio,
            audio_format,
            client_seconds,
            idempotency_token: value
                .get("idempotency_token")
                .or_else(|| value.get("client_attempt_id"))
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }
}

/// Inputs for the speech-output stage (synthesize the counterpart reply)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechOutputPayload {
    pub reply_turn_id: TurnId,
    pub text: String,
    #[serde(default)]
    pub emotion: Emotion,
}

/// Inputs for the analysis stage (coaching note for the operator turn)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub operator_turn_id: TurnId,
    /// The counterpart turn the operator was replying to, for context
    #[serde(default)]
    pub prompt_turn_id: Option<TurnId>,
}

/// Stage-scoped job payload. Serialized adjacently tagged; deserialization
/// never fails — anything unrecognized lands in `Legacy` and is normalized
/// forward by the reader.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StagePayload {
    Main(MainPayload),
    SpeechOutput(SpeechOutputPayload),
    Analysis(AnalysisPayload),
    Legacy(serde_json::Value),
}

impl StagePayload {
    fn from_value(value: serde_json::Value) -> Self {
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);

        match kind.as_str() {
            "main" => serde_json::from_value(data)
                .map(Self::Main)
                .unwrap_or(Self::Legacy(value)),
            "speech_output" => serde_json::from_value(data)
                .map(Self::SpeechOutput)
                .unwrap_or(Self::Legacy(value)),
            "analysis" => serde_json::from_value(data)
                .map(Self::Analysis)
                .unwrap_or(Self::Legacy(value)),
            "legacy" => Self::Legacy(data),
            _ => Self::Legacy(value),
        }
    }
}

impl<'de> Deserialize<'de> for StagePayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_value(value))
    }
}

/// Transcription outcome carried forward from the main stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrResult {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub seconds: Option<f32>,
    pub provider: AsrProvider,
}

/// Reply selection outcome carried forward from the main stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyResult {
    pub reply_turn_id: TurnId,
    pub line_ref: LineRef,
    pub source: ReplySource,
    #[serde(default)]
    pub loop_guard_triggered: bool,
    #[serde(default)]
    pub emotion: Emotion,
}

/// Synthesis outcome carried forward from the speech-output stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechResult {
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub seconds: Option<f32>,
    #[serde(default)]
    pub tts_failed: bool,
}

/// Analysis outcome recorded by the final stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub completed: bool,
    /// The analyst failed and the note was skipped; the job still finished
    #[serde(default)]
    pub soft_failed: bool,
}

/// Per-stage wall times, for event payloads and postmortems
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimings {
    pub main_ms: Option<u64>,
    pub speech_output_ms: Option<u64>,
    pub analysis_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

/// Outputs accumulated across stages so a later stage never re-derives
/// earlier results. Absent sections default and unknown fields are ignored,
/// which keeps the layout loosely versioned in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultState {
    pub asr: Option<AsrResult>,
    pub reply: Option<ReplyResult>,
    pub speech: Option<SpeechResult>,
    pub analysis: Option<AnalysisResult>,
    pub reached_max_turns: bool,
    pub timings: StageTimings,
}
