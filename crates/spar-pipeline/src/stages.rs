//! Stage executors
//!
//! One `Pipeline` runs whichever stage a claimed job is in. The main stage
//! transcribes the operator's recording and selects the counterpart's reply;
//! the speech-output stage voices that reply; the analysis stage writes the
//! coaching note. Synthesis and analysis failures are soft: the job keeps
//! moving and the degradation is reported through the event log. Everything
//! else fails the job terminally with a `turn_error` event so a waiting
//! client is never left guessing.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::{debug, warn};

use spar_core::config::PolicyConfig;
use spar_core::{
    AnalysisPayload, AnalysisResult, AsrResult, AudioSource, Conversation, Emotion, EventType,
    Job, JobError, JobId, JobStage, LineRef, MainPayload, ReplyResult, Result, Role, SparConfig,
    SparError, SpeechOutputPayload, SpeechResult, StagePayload, Turn, TurnId, TurnStatus,
};
use spar_policy::{
    select_next_line, turn_features, LineRewriter, PackLibrary, PolicyMemory, RewriteGate,
};
use spar_speech::{SpeechInput, Synthesizer};
use spar_store::{NewEvent, Store};

use crate::analyst::{AnalysisRequest, CoachingAnalyst};
use crate::audio_store::{audio_path, AudioStore};

/// Executes claimed jobs, one stage per call
pub struct Pipeline {
    store: Arc<dyn Store>,
    audio: Arc<dyn AudioStore>,
    speech_input: SpeechInput,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    rewriter: Option<Arc<dyn LineRewriter>>,
    analyst: Arc<dyn CoachingAnalyst>,
    packs: Arc<PackLibrary>,
    rewrite_gate: RewriteGate,
    policy: PolicyConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        audio: Arc<dyn AudioStore>,
        speech_input: SpeechInput,
        analyst: Arc<dyn CoachingAnalyst>,
        packs: Arc<PackLibrary>,
        config: &SparConfig,
    ) -> Self {
        Self {
            store,
            audio,
            speech_input,
            synthesizer: None,
            rewriter: None,
            analyst,
            packs,
            rewrite_gate: RewriteGate::new(&config.llm),
            policy: config.policy.clone(),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn LineRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Run the stage the claimed job is in. The caller must hold the claim;
    /// the store rejects advancement from anyone else.
    pub async fn execute(&self, job: Job) -> Result<Job> {
        if job.stage.is_terminal() {
            debug!("job {} is already {}, nothing to run", job.id.short(), job.stage);
            return Ok(job);
        }

        let conversation = match self.store.get_conversation(job.conversation_id).await? {
            Some(conversation) if conversation.is_active() => conversation,
            Some(_) | None => {
                let id = job.conversation_id.to_string();
                return self.fail(job, SparError::ConversationNotActive(id)).await;
            }
        };

        match job.stage {
            JobStage::MainPending => self.run_main(job, conversation).await,
            JobStage::SpeechOutputPending => self.run_speech_output(job, conversation).await,
            JobStage::AnalysisPending => self.run_analysis(job, conversation).await,
            JobStage::Done | JobStage::Error => Ok(job),
        }
    }

    /// Transcribe the operator's clip, then select (and maybe rewrite) the
    /// counterpart's next line.
    async fn run_main(&self, job: Job, conversation: Conversation) -> Result<Job> {
        let started = Instant::now();

        let payload = match &job.payload {
            StagePayload::Main(payload) => payload.clone(),
            StagePayload::Legacy(value) => match MainPayload::from_legacy(value) {
                Some(payload) => payload,
                None => {
                    return self
                        .fail(job, SparError::Job("unreadable main payload".to_string()))
                        .await;
                }
            },
            other => {
                let what = format!("main stage got a {} payload", payload_kind(other));
                return self.fail(job, SparError::Job(what)).await;
            }
        };

        let mut operator = match self.store.get_turn(job.turn_id).await? {
            Some(turn) if turn.role == Role::Operator => turn,
            Some(turn) => {
                return self.fail(job, SparError::TurnWrongRole(turn.id.to_string())).await;
            }
            None => {
                let id = job.turn_id.to_string();
                return self.fail(job, SparError::TurnNotFound(id)).await;
            }
        };
        operator.status = TurnStatus::Processing;
        self.store.update_turn(operator.clone()).await?;

        let prompt = match self.store.get_turn(payload.reply_to_turn_id).await? {
            Some(turn) if turn.conversation_id == conversation.id => turn,
            _ => {
                let id = payload.reply_to_turn_id.to_string();
                return self.fail(job, SparError::ReplyTurnNotFound(id)).await;
            }
        };

        let audio = match &payload.audio {
            AudioSource::Inline { b64 } => match BASE64.decode(b64) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let what = format!("inline audio is not decodable: {e}");
                    return self.fail(job, SparError::Job(what)).await;
                }
            },
            AudioSource::Stored { path } => match self.audio.get(path).await {
                Ok(bytes) => bytes,
                Err(e) => return self.fail(job, e).await,
            },
        };
        if audio.is_empty() {
            return self.fail(job, SparError::AudioEmpty).await;
        }

        let transcribed = match self
            .speech_input
            .transcribe(&audio, payload.audio_format, payload.client_seconds)
            .await
        {
            Ok(transcribed) => transcribed,
            Err(e) => return self.fail(job, e).await,
        };

        let audio_seconds = transcribed
            .seconds
            .or(payload.client_seconds)
            .or(operator.audio_seconds);
        let features = turn_features(&transcribed.text, audio_seconds);
        let reached_max = conversation.max_turns > 0
            && operator.operator_turn_no() >= conversation.max_turns;

        operator.text = transcribed.text.clone();
        operator.audio_seconds = audio_seconds;
        operator.features = Some(features.clone());
        operator.status = TurnStatus::AsrReady;
        self.store.update_turn(operator.clone()).await?;

        self.store
            .append_event(
                NewEvent::new(conversation.id, EventType::AsrReady)
                    .with_turn(operator.id)
                    .with_job(job.id)
                    .with_payload(json!({
                        "turn_id": operator.id,
                        "text": transcribed.text,
                        "confidence": transcribed.confidence,
                        "audio_seconds": audio_seconds,
                        "audio_url": operator.audio_url,
                        "provider": transcribed.provider,
                        "features": features,
                        "reached_max_turns": reached_max,
                        "elapsed_ms": job.elapsed_ms(),
                    })),
            )
            .await?;

        let mut result = job.result_state.clone();
        result.asr = Some(AsrResult {
            text: transcribed.text.clone(),
            confidence: transcribed.confidence,
            seconds: audio_seconds,
            provider: transcribed.provider,
        });
        result.reached_max_turns = reached_max;
        result.timings.main_ms = Some(started.elapsed().as_millis() as u64);

        if reached_max {
            // The session is complete; no further counterpart reply. The job
            // still owes the operator an analysis, so it walks the remaining
            // stages carrying the analysis inputs.
            debug!(
                "conversation {} reached its turn cap at operator turn {}",
                conversation.id.short(),
                operator.operator_turn_no()
            );
            let forward = StagePayload::Analysis(AnalysisPayload {
                operator_turn_id: operator.id,
                prompt_turn_id: Some(prompt.id),
            });
            return self
                .store
                .advance_job(job.id, JobStage::SpeechOutputPending, Some(forward), result)
                .await;
        }

        let pack = match self.packs.resolve(Some(&conversation.category_id)) {
            Some(pack) => pack,
            None => {
                return self
                    .fail(job, SparError::Config("no category packs loaded".to_string()))
                    .await;
            }
        };
        let history = self
            .store
            .recent_turns(conversation.id, operator.turn_index, self.policy.history_window)
            .await?;
        let memory = PolicyMemory::from_value(&conversation.policy_memory);
        let seed = format!("{}|{}", conversation.id, operator.turn_index);

        let selection = match select_next_line(
            pack,
            &memory,
            &transcribed.text,
            &history,
            &self.policy,
            &seed,
        ) {
            Ok(selection) => selection,
            Err(e) => return self.fail(job, e).await,
        };

        let rewritten = self
            .rewrite_gate
            .apply(
                self.rewriter.as_deref(),
                &seed,
                &selection.line.text,
                selection.line.emotion,
                &pack.objective,
            )
            .await;

        let mut reply = Turn::new(conversation.id, operator.turn_index + 1, Role::Counterpart)
            .with_text(rewritten.text.clone())
            .with_status(TurnStatus::TextReady);
        let line_ref = LineRef {
            line_id: selection.line.line_id.clone(),
            intent_id: selection.intent_id.clone(),
            angle_id: selection.angle_id.clone(),
        };
        reply.line_ref = Some(line_ref.clone());
        reply.reply_source = Some(rewritten.source);
        reply.emotion = Some(selection.line.emotion);
        let reply = match self.store.append_turn(reply).await {
            Ok(reply) => reply,
            Err(e) => return self.fail(job, e).await,
        };

        self.store
            .update_policy_memory(conversation.id, selection.memory.to_value())
            .await?;

        self.store
            .append_event(
                NewEvent::new(conversation.id, EventType::ReplyTextReady)
                    .with_turn(reply.id)
                    .with_job(job.id)
                    .with_payload(json!({
                        "turn_id": reply.id,
                        "text": reply.text,
                        "emotion": reply.emotion,
                        "source": rewritten.source,
                        "line_ref": line_ref,
                        "loop_guard_triggered": selection.loop_guard_triggered,
                        "tts_failed": false,
                        "reached_max_turns": false,
                        "elapsed_ms": job.elapsed_ms(),
                    })),
            )
            .await?;

        result.reply = Some(ReplyResult {
            reply_turn_id: reply.id,
            line_ref,
            source: rewritten.source,
            loop_guard_triggered: selection.loop_guard_triggered,
            emotion: selection.line.emotion,
        });
        result.timings.main_ms = Some(started.elapsed().as_millis() as u64);

        let next = StagePayload::SpeechOutput(SpeechOutputPayload {
            reply_turn_id: reply.id,
            text: reply.text.clone(),
            emotion: selection.line.emotion,
        });
        self.store
            .advance_job(job.id, JobStage::SpeechOutputPending, Some(next), result)
            .await
    }

    /// Voice the selected reply. Synthesis trouble never fails the job; a
    /// readable reply beats no reply.
    async fn run_speech_output(&self, job: Job, conversation: Conversation) -> Result<Job> {
        let started = Instant::now();
        let mut result = job.result_state.clone();

        let payload = match &job.payload {
            StagePayload::SpeechOutput(payload) => payload.clone(),
            // Nothing was selected to voice (final round or a legacy shape);
            // pass straight through to analysis.
            StagePayload::Analysis(payload) => {
                result.timings.speech_output_ms = Some(0);
                let forward = StagePayload::Analysis(payload.clone());
                return self
                    .store
                    .advance_job(job.id, JobStage::AnalysisPending, Some(forward), result)
                    .await;
            }
            _ => {
                result.timings.speech_output_ms = Some(0);
                let forward = StagePayload::Analysis(AnalysisPayload {
                    operator_turn_id: job.turn_id,
                    prompt_turn_id: None,
                });
                return self
                    .store
                    .advance_job(job.id, JobStage::AnalysisPending, Some(forward), result)
                    .await;
            }
        };

        result.speech = match &self.synthesizer {
            Some(synthesizer) => {
                match self
                    .voice_reply(
                        &conversation,
                        payload.reply_turn_id,
                        &payload.text,
                        payload.emotion,
                        synthesizer.as_ref(),
                        Some(job.id),
                        job.elapsed_ms(),
                    )
                    .await
                {
                    Ok(speech) => Some(speech),
                    Err(e) => {
                        warn!(
                            "synthesis failed for turn {}, keeping the text reply: {}",
                            payload.reply_turn_id.short(),
                            e
                        );
                        self.store
                            .append_event(
                                NewEvent::new(conversation.id, EventType::ReplyTextReady)
                                    .with_turn(payload.reply_turn_id)
                                    .with_job(job.id)
                                    .with_payload(json!({
                                        "turn_id": payload.reply_turn_id,
                                        "text": payload.text,
                                        "tts_failed": true,
                                        "reached_max_turns": result.reached_max_turns,
                                        "elapsed_ms": job.elapsed_ms(),
                                    })),
                            )
                            .await?;
                        Some(SpeechResult {
                            tts_failed: true,
                            ..SpeechResult::default()
                        })
                    }
                }
            }
            None => {
                debug!(
                    "no synthesizer configured, reply {} stays text-only",
                    payload.reply_turn_id.short()
                );
                None
            }
        };

        result.timings.speech_output_ms = Some(started.elapsed().as_millis() as u64);
        let forward = StagePayload::Analysis(AnalysisPayload {
            operator_turn_id: job.turn_id,
            prompt_turn_id: None,
        });
        self.store
            .advance_job(job.id, JobStage::AnalysisPending, Some(forward), result)
            .await
    }

    /// Write the coaching note for the operator's turn. A failed analysis is
    /// reported and skipped; the job still finishes.
    async fn run_analysis(&self, job: Job, conversation: Conversation) -> Result<Job> {
        let started = Instant::now();
        let mut result = job.result_state.clone();

        let payload = match &job.payload {
            StagePayload::Analysis(payload) => payload.clone(),
            _ => AnalysisPayload {
                operator_turn_id: job.turn_id,
                prompt_turn_id: None,
            },
        };

        let mut operator = match self.store.get_turn(payload.operator_turn_id).await? {
            Some(turn) => turn,
            None => {
                let id = payload.operator_turn_id.to_string();
                return self.fail(job, SparError::TurnNotFound(id)).await;
            }
        };

        let history = self
            .store
            .recent_turns(conversation.id, operator.turn_index, self.policy.history_window)
            .await?;

        let prompt = match payload.prompt_turn_id {
            Some(id) => self.store.get_turn(id).await?,
            None => None,
        }
        .or_else(|| {
            history
                .iter()
                .rev()
                .find(|turn| {
                    turn.role == Role::Counterpart && turn.turn_index < operator.turn_index
                })
                .cloned()
        });

        let pack = self.packs.resolve(Some(&conversation.category_id));
        let request = AnalysisRequest {
            category_id: &conversation.category_id,
            objective: pack.map(|p| p.objective.as_str()).unwrap_or_default(),
            intent_id: prompt
                .as_ref()
                .and_then(|turn| turn.line_ref.as_ref())
                .map(|line_ref| line_ref.intent_id.as_str()),
            history: &history,
            counterpart_text: prompt.as_ref().map(|turn| turn.text.as_str()).unwrap_or_default(),
            operator_text: &operator.text,
        };

        result.analysis = Some(match self.analyst.analyze(&request).await {
            Ok(note) => {
                operator.analysis = Some(note.clone());
                operator.status = TurnStatus::AnalysisReady;
                self.store.update_turn(operator.clone()).await?;
                self.store
                    .append_event(
                        NewEvent::new(conversation.id, EventType::AnalysisReady)
                            .with_turn(operator.id)
                            .with_job(job.id)
                            .with_payload(json!({
                                "turn_id": operator.id,
                                "analysis": note,
                                "elapsed_ms": job.elapsed_ms(),
                            })),
                    )
                    .await?;
                AnalysisResult {
                    completed: true,
                    soft_failed: false,
                }
            }
            Err(e) => {
                warn!(
                    "analysis failed for turn {}, skipping the note: {}",
                    operator.id.short(),
                    e
                );
                self.store
                    .append_event(
                        NewEvent::new(conversation.id, EventType::TurnError)
                            .with_turn(operator.id)
                            .with_job(job.id)
                            .with_payload(json!({
                                "code": "analysis_failed",
                                "message": "Coaching suggestions were skipped for this turn.",
                                "elapsed_ms": job.elapsed_ms(),
                            })),
                    )
                    .await?;
                AnalysisResult {
                    completed: false,
                    soft_failed: true,
                }
            }
        });

        result.timings.analysis_ms = Some(started.elapsed().as_millis() as u64);
        result.timings.total_ms = Some(job.elapsed_ms().max(0) as u64);
        self.store
            .advance_job(job.id, JobStage::Done, None, result)
            .await
    }

    /// Synthesize, park the audio, update the turn, announce. Shared by the
    /// speech-output stage and the on-demand path; errors bubble to the
    /// caller, which decides whether they are soft.
    pub(crate) async fn voice_reply(
        &self,
        conversation: &Conversation,
        reply_turn_id: TurnId,
        text: &str,
        emotion: Emotion,
        synthesizer: &dyn Synthesizer,
        job_id: Option<JobId>,
        elapsed_ms: i64,
    ) -> Result<SpeechResult> {
        if text.trim().is_empty() {
            return Err(SparError::TtsFailed("reply text is empty".to_string()));
        }

        let speech = synthesizer.synthesize(text, emotion).await?;
        if speech.audio.is_empty() {
            return Err(SparError::TtsFailed("synthesizer returned no audio".to_string()));
        }

        let path = audio_path(conversation.id, reply_turn_id, speech.format);
        self.audio
            .put(&path, &speech.audio, speech.format.content_type())
            .await?;
        let url = self.audio.sign(&path).await?;

        let mut reply = self
            .store
            .get_turn(reply_turn_id)
            .await?
            .ok_or_else(|| SparError::TurnNotFound(reply_turn_id.to_string()))?;
        reply.audio_path = Some(path.clone());
        reply.audio_url = Some(url.clone());
        reply.audio_seconds = speech.seconds.or(reply.audio_seconds);
        reply.status = TurnStatus::AudioReady;
        self.store.update_turn(reply.clone()).await?;

        let mut event = NewEvent::new(conversation.id, EventType::ReplyAudioReady)
            .with_turn(reply_turn_id)
            .with_payload(json!({
                "turn_id": reply_turn_id,
                "audio_url": url,
                "audio_seconds": reply.audio_seconds,
                "text": text,
                "tts_failed": false,
                "elapsed_ms": elapsed_ms,
            }));
        if let Some(job_id) = job_id {
            event = event.with_job(job_id);
        }
        self.store.append_event(event).await?;

        Ok(SpeechResult {
            audio_path: Some(path),
            audio_url: Some(url),
            seconds: reply.audio_seconds,
            tts_failed: false,
        })
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn audio(&self) -> &Arc<dyn AudioStore> {
        &self.audio
    }

    pub(crate) fn packs(&self) -> &Arc<PackLibrary> {
        &self.packs
    }

    pub(crate) fn synthesizer(&self) -> Option<&Arc<dyn Synthesizer>> {
        self.synthesizer.as_ref()
    }

    pub(crate) fn analyst(&self) -> &Arc<dyn CoachingAnalyst> {
        &self.analyst
    }

    pub(crate) fn history_window(&self) -> usize {
        self.policy.history_window
    }

    /// Terminal failure: job to `error`, operator turn stamped, `turn_error`
    /// appended. Returns the failed job; only store trouble is an `Err`.
    async fn fail(&self, job: Job, error: SparError) -> Result<Job> {
        warn!(
            "job {} failed at {}: {} ({})",
            job.id.short(),
            job.stage,
            error,
            error.code()
        );

        if let Some(mut turn) = self.store.get_turn(job.turn_id).await? {
            turn.status = TurnStatus::Error;
            self.store.update_turn(turn).await?;
        }

        self.store
            .append_event(
                NewEvent::new(job.conversation_id, EventType::TurnError)
                    .with_turn(job.turn_id)
                    .with_job(job.id)
                    .with_payload(json!({
                        "code": error.code(),
                        "message": error.user_message(),
                        "elapsed_ms": job.elapsed_ms(),
                    })),
            )
            .await?;

        let result = job.result_state.clone();
        self.store
            .fail_job(
                job.id,
                JobError::new(error.code(), error.to_string()),
                result,
            )
            .await
    }
}

fn payload_kind(payload: &StagePayload) -> &'static str {
    match payload {
        StagePayload::Main(_) => "main",
        StagePayload::SpeechOutput(_) => "speech_output",
        StagePayload::Analysis(_) => "analysis",
        StagePayload::Legacy(_) => "legacy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use spar_core::config::SpeechConfig;
    use spar_core::{
        AnalysisSource, AsrProvider, AudioFormat, CoachingNote, Emotion, JobStatus, ReplySource,
        SparConfig,
    };
    use spar_speech::{SynthesizedSpeech, Transcriber, Transcript};
    use spar_store::MemoryStore;

    use crate::audio_store::MemoryAudioStore;

    struct SayingTranscriber(&'static str);

    #[async_trait]
    impl Transcriber for SayingTranscriber {
        async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> Result<Transcript> {
            Ok(Transcript {
                text: self.0.to_string(),
                confidence: Some(0.92),
                seconds: Some(3.0),
            })
        }
    }

    struct SilentTranscriber;

    #[async_trait]
    impl Transcriber for SilentTranscriber {
        async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> Result<Transcript> {
            Err(SparError::AsrSilence)
        }
    }

    struct MockSynth {
        fail: bool,
    }

    impl MockSynth {
        fn ok() -> Self {
            Self { fail: false }
        }

        fn failing() -> Self {
            Self { fail: true }
        }
    }

    #[async_trait]
    impl Synthesizer for MockSynth {
        async fn synthesize(&self, _text: &str, _emotion: Emotion) -> Result<SynthesizedSpeech> {
            if self.fail {
                return Err(SparError::TtsFailed("voice model offline".to_string()));
            }
            Ok(SynthesizedSpeech {
                audio: vec![0xFF, 0xFB, 0x90, 0x64],
                format: AudioFormat::Mp3,
                seconds: Some(2.2),
            })
        }
    }

    struct MockAnalyst {
        fail: bool,
    }

    #[async_trait]
    impl CoachingAnalyst for MockAnalyst {
        async fn analyze(&self, _request: &AnalysisRequest<'_>) -> Result<CoachingNote> {
            if self.fail {
                return Err(SparError::Llm("model unavailable".to_string()));
            }
            Ok(CoachingNote {
                suggestions: vec!["Lead with empathy.".to_string()],
                polished: "I understand the concern; here is what we check first.".to_string(),
                source: AnalysisSource::Model,
            })
        }
    }

    struct EchoRewriter;

    #[async_trait]
    impl LineRewriter for EchoRewriter {
        async fn rewrite(&self, text: &str, _emotion: Emotion, _context: &str) -> Result<String> {
            Ok(format!("(reworded) {text}"))
        }
    }

    fn test_config() -> SparConfig {
        let mut config = SparConfig::default();
        config.llm.rewrite_enabled = false;
        config.speech = SpeechConfig {
            primary_timeout_ms: 500,
            fallback_enabled: false,
            ..SpeechConfig::default()
        };
        config
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        audio: Arc<MemoryAudioStore>,
        conversation: Conversation,
        opening: Turn,
        operator: Turn,
        job: Job,
    }

    async fn fixture(max_turns: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audio = Arc::new(MemoryAudioStore::new());

        let mut conversation = Conversation::new("objections", max_turns);
        conversation.policy_memory = PolicyMemory::default().to_value();
        let conversation = store.create_conversation(conversation).await.unwrap();

        let opening = store
            .append_turn(
                Turn::new(conversation.id, 0, Role::Counterpart)
                    .with_text("Honestly, the price feels steep.")
                    .with_status(TurnStatus::TextReady),
            )
            .await
            .unwrap();
        let operator = store
            .append_turn(Turn::new(conversation.id, 1, Role::Operator))
            .await
            .unwrap();

        let payload = StagePayload::Main(MainPayload {
            reply_to_turn_id: opening.id,
            audio: AudioSource::Inline {
                b64: BASE64.encode(b"fake audio bytes"),
            },
            audio_format: AudioFormat::Wav,
            client_seconds: Some(3.0),
            idempotency_token: None,
        });
        let job = store
            .insert_job(Job::new(conversation.id, operator.id, payload))
            .await
            .unwrap();

        Fixture {
            store,
            audio,
            conversation,
            opening,
            operator,
            job,
        }
    }

    fn pipeline_for(fixture: &Fixture, config: &SparConfig) -> Pipeline {
        let speech_input = SpeechInput::new(&config.speech)
            .with_primary(Arc::new(SayingTranscriber("I hear you, but the price covers aftercare too")));
        Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: false }),
            Arc::new(PackLibrary::builtin()),
            config,
        )
        .with_synthesizer(Arc::new(MockSynth::ok()))
    }

    async fn step(fixture: &Fixture, pipeline: &Pipeline) -> Job {
        let claimed = fixture
            .store
            .claim_job(fixture.job.id, "test-worker")
            .await
            .unwrap()
            .expect("job should be claimable");
        pipeline.execute(claimed).await.unwrap()
    }

    async fn event_types(fixture: &Fixture) -> Vec<EventType> {
        fixture
            .store
            .events_after(fixture.conversation.id, 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_main_stage_transcribes_and_selects() {
        let fixture = fixture(10).await;
        let config = test_config();
        let pipeline = pipeline_for(&fixture, &config);

        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.stage, JobStage::SpeechOutputPending);
        assert_eq!(job.status, JobStatus::Queued);

        let operator = fixture
            .store
            .get_turn(fixture.operator.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operator.status, TurnStatus::AsrReady);
        assert!(operator.text.contains("price"));
        assert!(operator.features.is_some());
        assert_eq!(operator.audio_seconds, Some(3.0));

        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        assert_eq!(turns.len(), 3);
        let reply = &turns[2];
        assert_eq!(reply.role, Role::Counterpart);
        assert_eq!(reply.status, TurnStatus::TextReady);
        assert_eq!(reply.reply_source, Some(ReplySource::Fixed));
        assert!(reply.line_ref.is_some());
        assert!(!reply.text.is_empty());

        assert_eq!(
            event_types(&fixture).await,
            vec![EventType::AsrReady, EventType::ReplyTextReady]
        );

        let asr = job.result_state.asr.as_ref().unwrap();
        assert_eq!(asr.provider, AsrProvider::Primary);
        assert!(job.result_state.reply.is_some());
        assert!(job.result_state.timings.main_ms.is_some());

        // Policy memory was persisted for the next round.
        let conversation = fixture
            .store
            .get_conversation(fixture.conversation.id)
            .await
            .unwrap()
            .unwrap();
        let memory = PolicyMemory::from_value(&conversation.policy_memory);
        assert!(!memory.used_line_ids.is_empty());
    }

    #[tokio::test]
    async fn test_full_pipeline_reaches_done() {
        let fixture = fixture(10).await;
        let config = test_config();
        let pipeline = pipeline_for(&fixture, &config);

        step(&fixture, &pipeline).await;
        step(&fixture, &pipeline).await;
        let job = step(&fixture, &pipeline).await;

        assert_eq!(job.stage, JobStage::Done);
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.finished_at.is_some());

        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        let reply = &turns[2];
        assert_eq!(reply.status, TurnStatus::AudioReady);
        assert!(reply.audio_path.is_some());
        assert!(reply.audio_url.is_some());
        let stored = fixture
            .audio
            .get(reply.audio_path.as_deref().unwrap())
            .await
            .unwrap();
        assert!(!stored.is_empty());

        let operator = fixture
            .store
            .get_turn(fixture.operator.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operator.status, TurnStatus::AnalysisReady);
        assert_eq!(
            operator.analysis.as_ref().map(|n| n.source),
            Some(AnalysisSource::Model)
        );

        assert_eq!(
            event_types(&fixture).await,
            vec![
                EventType::AsrReady,
                EventType::ReplyTextReady,
                EventType::ReplyAudioReady,
                EventType::AnalysisReady,
            ]
        );

        let timings = &job.result_state.timings;
        assert!(timings.main_ms.is_some());
        assert!(timings.speech_output_ms.is_some());
        assert!(timings.analysis_ms.is_some());
        assert!(timings.total_ms.is_some());
    }

    #[tokio::test]
    async fn test_tts_failure_is_soft() {
        let fixture = fixture(10).await;
        let config = test_config();
        let speech_input = SpeechInput::new(&config.speech)
            .with_primary(Arc::new(SayingTranscriber("what about the price")));
        let pipeline = Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: false }),
            Arc::new(PackLibrary::builtin()),
            &config,
        )
        .with_synthesizer(Arc::new(MockSynth::failing()));

        step(&fixture, &pipeline).await;
        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.stage, JobStage::AnalysisPending);
        assert!(job.result_state.speech.as_ref().unwrap().tts_failed);

        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.status, JobStatus::Done);

        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        assert_eq!(turns[2].status, TurnStatus::TextReady);
        assert!(turns[2].audio_path.is_none());

        let events = fixture
            .store
            .events_after(fixture.conversation.id, 0, 100)
            .await
            .unwrap();
        let degraded = events
            .iter()
            .find(|e| {
                e.event_type == EventType::ReplyTextReady
                    && e.payload.get("tts_failed").and_then(|v| v.as_bool()) == Some(true)
            })
            .expect("the degraded reply event should be announced");
        assert_eq!(degraded.turn_id, Some(turns[2].id));
        assert!(!events.iter().any(|e| e.event_type == EventType::TurnError));
    }

    #[tokio::test]
    async fn test_analysis_failure_is_soft() {
        let fixture = fixture(10).await;
        let config = test_config();
        let speech_input = SpeechInput::new(&config.speech)
            .with_primary(Arc::new(SayingTranscriber("is it safe though")));
        let pipeline = Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: true }),
            Arc::new(PackLibrary::builtin()),
            &config,
        )
        .with_synthesizer(Arc::new(MockSynth::ok()));

        step(&fixture, &pipeline).await;
        step(&fixture, &pipeline).await;
        let job = step(&fixture, &pipeline).await;

        assert_eq!(job.status, JobStatus::Done, "soft failure still finishes");
        assert!(job.result_state.analysis.as_ref().unwrap().soft_failed);

        let operator = fixture
            .store
            .get_turn(fixture.operator.id)
            .await
            .unwrap()
            .unwrap();
        assert!(operator.analysis.is_none());
        assert_ne!(operator.status, TurnStatus::Error);

        let events = fixture
            .store
            .events_after(fixture.conversation.id, 0, 100)
            .await
            .unwrap();
        let error_event = events
            .iter()
            .find(|e| e.event_type == EventType::TurnError)
            .expect("soft analysis failure is announced");
        assert_eq!(
            error_event.payload.get("code").and_then(|v| v.as_str()),
            Some("analysis_failed")
        );
    }

    #[tokio::test]
    async fn test_asr_silence_fails_the_job() {
        let fixture = fixture(10).await;
        let config = test_config();
        let speech_input =
            SpeechInput::new(&config.speech).with_primary(Arc::new(SilentTranscriber));
        let pipeline = Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: false }),
            Arc::new(PackLibrary::builtin()),
            &config,
        );

        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.stage, JobStage::Error);
        assert_eq!(job.last_error.as_ref().unwrap().code, "asr_silence");

        let operator = fixture
            .store
            .get_turn(fixture.operator.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operator.status, TurnStatus::Error);

        let events = fixture
            .store
            .events_after(fixture.conversation.id, 0, 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::TurnError);
        assert_eq!(
            events[0].payload.get("code").and_then(|v| v.as_str()),
            Some("asr_silence")
        );
        let message = events[0].payload.get("message").and_then(|v| v.as_str());
        assert!(message.unwrap_or_default().contains("microphone"));

        // No counterpart reply was created.
        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn test_reached_max_skips_the_reply() {
        let fixture = fixture(1).await;
        let config = test_config();
        let pipeline = pipeline_for(&fixture, &config);

        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.stage, JobStage::SpeechOutputPending);
        assert!(job.result_state.reached_max_turns);
        assert!(job.result_state.reply.is_none());
        assert!(matches!(job.payload, StagePayload::Analysis(_)));

        // No counterpart turn was created for the final round.
        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        assert_eq!(turns.len(), 2);

        let events = fixture
            .store
            .events_after(fixture.conversation.id, 0, 100)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::AsrReady);
        assert_eq!(
            events[0].payload.get("reached_max_turns").and_then(|v| v.as_bool()),
            Some(true)
        );

        // The remaining stages still run: pass-through, then analysis.
        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.stage, JobStage::AnalysisPending);
        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.status, JobStatus::Done);

        let operator = fixture
            .store
            .get_turn(fixture.operator.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operator.status, TurnStatus::AnalysisReady);
    }

    #[tokio::test]
    async fn test_inactive_conversation_fails_fast() {
        let fixture = fixture(10).await;
        let config = test_config();
        let pipeline = pipeline_for(&fixture, &config);

        fixture
            .store
            .end_conversation(fixture.conversation.id)
            .await
            .unwrap();

        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.last_error.as_ref().unwrap().code,
            "conversation_not_active"
        );
    }

    #[tokio::test]
    async fn test_legacy_payload_normalizes_and_advances() {
        let fixture = fixture(10).await;
        let config = test_config();
        let pipeline = pipeline_for(&fixture, &config);

        // Rewrite the job the way an older writer would have stored it.
        let legacy = Job::new(
            fixture.conversation.id,
            fixture.operator.id,
            StagePayload::Legacy(json!({
                "reply_to": fixture.opening.id.to_string(),
                "audio_inline_b64": BASE64.encode(b"old layout audio"),
                "format": "wav",
                "client_audio_seconds": 2.5,
            })),
        );
        let legacy = fixture.store.insert_job(legacy).await.unwrap();

        let claimed = fixture
            .store
            .claim_job(legacy.id, "test-worker")
            .await
            .unwrap()
            .unwrap();
        let job = pipeline.execute(claimed).await.unwrap();
        assert_eq!(job.stage, JobStage::SpeechOutputPending);
        assert!(job.result_state.asr.is_some());
    }

    #[tokio::test]
    async fn test_rewriter_marks_the_source_generated() {
        let fixture = fixture(10).await;
        let mut config = test_config();
        config.llm.rewrite_enabled = true;
        config.llm.rewrite_probability = 1.0;

        let speech_input = SpeechInput::new(&config.speech)
            .with_primary(Arc::new(SayingTranscriber("the price is too high")));
        let pipeline = Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: false }),
            Arc::new(PackLibrary::builtin()),
            &config,
        )
        .with_rewriter(Arc::new(EchoRewriter));

        step(&fixture, &pipeline).await;

        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        let reply = &turns[2];
        assert_eq!(reply.reply_source, Some(ReplySource::Generated));
        assert!(reply.text.starts_with("(reworded) "));
        // The scripted line is still traceable underneath the rewrite.
        assert!(reply.line_ref.is_some());
    }

    #[tokio::test]
    async fn test_no_synthesizer_stays_text_only() {
        let fixture = fixture(10).await;
        let config = test_config();
        let speech_input = SpeechInput::new(&config.speech)
            .with_primary(Arc::new(SayingTranscriber("tell me about safety")));
        let pipeline = Pipeline::new(
            fixture.store.clone(),
            fixture.audio.clone(),
            speech_input,
            Arc::new(MockAnalyst { fail: false }),
            Arc::new(PackLibrary::builtin()),
            &config,
        );

        step(&fixture, &pipeline).await;
        let job = step(&fixture, &pipeline).await;
        assert_eq!(job.stage, JobStage::AnalysisPending);
        assert!(job.result_state.speech.is_none());

        let types = event_types(&fixture).await;
        assert!(!types.contains(&EventType::ReplyAudioReady));

        let turns = fixture.store.list_turns(fixture.conversation.id).await.unwrap();
        assert_eq!(turns[2].status, TurnStatus::TextReady);
    }
}
