//! Boundary operations
//!
//! Everything a client can ask for, independent of transport: starting a
//! conversation, submitting a recorded turn, following the event log,
//! rolling back, ending, and the two on-demand paths (voice a reply, coach a
//! turn). The HTTP layer translates these calls; it adds no semantics of its
//! own.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use spar_core::fail_open::fail_open;
use spar_core::{
    AudioFormat, AudioSource, CoachingNote, Conversation, ConversationId, ConversationStatus,
    Event, EventType, Job, JobId, LineRef, MainPayload, ReplySource, Result, Role, SparConfig,
    SparError, StagePayload, Turn, TurnId, TurnStatus,
};
use spar_policy::{pick_opening, PackLibrary, PolicyMemory};
use spar_speech::resolve_format;
use spar_store::{EventFeed, NewEvent, Store};

use crate::analyst::AnalysisRequest;
use crate::audio_store::{audio_path, AudioStore};
use crate::stages::Pipeline;

/// Worker id stamped on jobs claimed by the submission kick.
const KICK_WORKER_ID: &str = "intake";

/// One operator submission, already decoded from the transport.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub conversation_id: ConversationId,
    pub audio: Vec<u8>,
    pub declared_format: Option<AudioFormat>,
    pub reply_to_turn_id: TurnId,
    pub client_seconds: Option<f32>,
    pub idempotency_token: Option<String>,
}

/// What the caller gets back immediately; everything else arrives as events.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub turn_id: TurnId,
    pub job_id: JobId,
    pub next_cursor: u64,
    pub reached_max_turns: bool,
    /// An earlier submission with the same token already created this work
    pub deduped: bool,
}

/// A freshly started conversation plus its scripted opening.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation: Conversation,
    pub opening: Turn,
}

/// One page of the event log, with the status a poller steers by.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: u64,
    pub has_more: bool,
    pub conversation_status: ConversationStatus,
}

/// Current state of a conversation, for clients joining or rejoining.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub turns: Vec<Turn>,
    pub next_cursor: u64,
}

/// What remains after a rollback.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub remaining: Vec<Turn>,
    pub next_cursor: u64,
}

/// On-demand synthesis result.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub turn: Turn,
    /// The turn already had audio; nothing was synthesized
    pub cached: bool,
}

/// On-demand analysis result.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub note: CoachingNote,
    pub cached: bool,
}

/// The transport-independent API surface.
pub struct Ops {
    store: Arc<dyn Store>,
    audio: Arc<dyn AudioStore>,
    packs: Arc<PackLibrary>,
    pipeline: Arc<Pipeline>,
    feed: EventFeed,
    config: SparConfig,
}

impl Ops {
    pub fn new(pipeline: Arc<Pipeline>, config: SparConfig) -> Self {
        let store = pipeline.store().clone();
        let feed = EventFeed::new(store.clone(), &config.events);
        Self {
            audio: pipeline.audio().clone(),
            packs: pipeline.packs().clone(),
            store,
            pipeline,
            feed,
            config,
        }
    }

    pub fn config(&self) -> &SparConfig {
        &self.config
    }

    pub fn packs(&self) -> &PackLibrary {
        &self.packs
    }

    /// Create a conversation in `category` and author its opening counterpart
    /// turn. The opening is deterministic per conversation id.
    pub async fn start_conversation(
        &self,
        category: Option<&str>,
        max_turns: Option<u32>,
    ) -> Result<NewConversation> {
        let pack = self
            .packs
            .resolve(category)
            .ok_or_else(|| SparError::Config("no category packs loaded".to_string()))?;

        let mut conversation = Conversation::new(
            pack.category_id.clone(),
            max_turns.unwrap_or(self.config.policy.max_turns),
        );
        let opening = pick_opening(pack, &conversation.id.to_string()).ok_or_else(|| {
            SparError::Config(format!(
                "category pack '{}' has no opening lines",
                pack.category_id
            ))
        })?;
        conversation.policy_memory = PolicyMemory::for_opening(pack, opening).to_value();
        let conversation = self.store.create_conversation(conversation).await?;

        let mut turn = Turn::new(conversation.id, 0, Role::Counterpart)
            .with_text(opening.text.clone())
            .with_status(TurnStatus::TextReady);
        turn.line_ref = Some(LineRef {
            line_id: opening.line_id.clone(),
            intent_id: opening.intent_id.clone(),
            angle_id: opening.angle_id.clone(),
        });
        turn.reply_source = Some(ReplySource::Fixed);
        turn.emotion = Some(opening.emotion);
        let opening_turn = self.store.append_turn(turn).await?;

        info!(
            "started conversation {} in '{}' with opening {}",
            conversation.id.short(),
            conversation.category_id,
            opening.line_id
        );
        Ok(NewConversation {
            conversation,
            opening: opening_turn,
        })
    }

    /// Accept one recorded operator turn: validate, persist, enqueue, answer.
    /// The heavy work happens in the pipeline; the caller follows it through
    /// the event log from `next_cursor`.
    pub async fn submit_turn(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let conversation = self.require_conversation(request.conversation_id).await?;
        if !conversation.is_active() {
            return Err(SparError::ConversationNotActive(conversation.id.to_string()));
        }

        self.check_rate_limit(&conversation).await?;

        let format = resolve_format(&request.audio, request.declared_format)?;

        let reply_to = match self.store.get_turn(request.reply_to_turn_id).await? {
            Some(turn) if turn.conversation_id == conversation.id => turn,
            _ => {
                return Err(SparError::ReplyTurnNotFound(
                    request.reply_to_turn_id.to_string(),
                ));
            }
        };
        if reply_to.role != Role::Counterpart {
            return Err(SparError::ReplyTurnWrongRole(reply_to.id.to_string()));
        }

        if let Some(token) = request.idempotency_token.as_deref() {
            if let Some(job) = self
                .store
                .find_job_by_idempotency(conversation.id, token)
                .await?
            {
                debug!(
                    "token replay for conversation {}, answering with job {}",
                    conversation.id.short(),
                    job.id.short()
                );
                return Ok(SubmitReceipt {
                    turn_id: job.turn_id,
                    job_id: job.id,
                    next_cursor: self.store.latest_cursor(conversation.id).await?,
                    reached_max_turns: job.result_state.reached_max_turns,
                    deduped: true,
                });
            }
        }

        let mut turn = Turn::new(conversation.id, reply_to.turn_index + 1, Role::Operator);
        turn.audio_seconds = request.client_seconds;

        // Persist the turn before parking any audio; a rejected append must
        // not leave a blob nobody references.
        let mut turn = self.store.append_turn(turn).await?;

        let audio = if request.audio.len() > self.config.speech.inline_audio_max_bytes {
            let path = audio_path(conversation.id, turn.id, format);
            self.audio
                .put(&path, &request.audio, format.content_type())
                .await?;
            turn.audio_url = Some(self.audio.sign(&path).await?);
            turn.audio_path = Some(path.clone());
            self.store.update_turn(turn.clone()).await?;
            AudioSource::Stored { path }
        } else {
            AudioSource::Inline {
                b64: BASE64.encode(&request.audio),
            }
        };

        let payload = StagePayload::Main(MainPayload {
            reply_to_turn_id: reply_to.id,
            audio,
            audio_format: format,
            client_seconds: request.client_seconds,
            idempotency_token: request.idempotency_token.clone(),
        });
        let job = Job::new(conversation.id, turn.id, payload)
            .with_idempotency_token(request.idempotency_token.clone());
        let job = self.store.insert_job(job).await?;

        let reached_max =
            conversation.max_turns > 0 && turn.operator_turn_no() >= conversation.max_turns;

        let accepted = self
            .store
            .append_event(
                NewEvent::new(conversation.id, EventType::TurnAccepted)
                    .with_turn(turn.id)
                    .with_job(job.id)
                    .with_payload(json!({
                        "turn_id": turn.id,
                        "job_id": job.id,
                        "audio_url": turn.audio_url,
                        "audio_seconds": request.client_seconds,
                        "format": format,
                        "reached_max_turns": reached_max,
                    })),
            )
            .await?;

        if self.config.worker.kick_enabled {
            self.kick(job.id);
        }

        Ok(SubmitReceipt {
            turn_id: turn.id,
            job_id: job.id,
            next_cursor: accepted.cursor,
            reached_max_turns: reached_max,
            deduped: false,
        })
    }

    /// Opportunistically run the fresh job's main stage on the intake path so
    /// the first transcription does not wait for a worker round. Best effort;
    /// losing the claim or timing out leaves the job to the worker.
    fn kick(&self, job_id: JobId) {
        let pipeline = self.pipeline.clone();
        let timeout = Duration::from_millis(self.config.worker.job_timeout_ms);
        tokio::spawn(async move {
            fail_open("submission kick", || async {
                if let Some(claimed) = pipeline.store().claim_job(job_id, KICK_WORKER_ID).await? {
                    match tokio::time::timeout(timeout, pipeline.execute(claimed)).await {
                        Ok(outcome) => {
                            outcome?;
                        }
                        Err(_) => {
                            debug!(
                                "kick for job {} timed out, staleness recovery will requeue it",
                                job_id.short()
                            );
                        }
                    }
                }
                Ok(())
            })
            .await;
        });
    }

    async fn check_rate_limit(&self, conversation: &Conversation) -> Result<()> {
        let limit = self.config.api.rate_limit_per_min;
        if limit == 0 {
            return Ok(());
        }
        let window_start = Utc::now() - chrono::Duration::seconds(60);
        let recent = self
            .store
            .list_turns(conversation.id)
            .await?
            .iter()
            .filter(|turn| turn.role == Role::Operator && turn.created_at > window_start)
            .count();
        if recent >= limit as usize {
            return Err(SparError::RateLimited(format!(
                "{} submissions per minute per conversation",
                limit
            )));
        }
        Ok(())
    }

    /// The conversation, its surviving turns, and the cursor a fresh poller
    /// should start from.
    pub async fn snapshot(&self, conversation_id: ConversationId) -> Result<ConversationSnapshot> {
        let conversation = self.require_conversation(conversation_id).await?;
        let turns = self.store.list_turns(conversation_id).await?;
        Ok(ConversationSnapshot {
            next_cursor: self.store.latest_cursor(conversation_id).await?,
            conversation,
            turns,
        })
    }

    /// One page of events after `cursor`, long-polling up to the clamped wait.
    pub async fn pull_events(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        wait_ms: Option<u64>,
    ) -> Result<EventPage> {
        let wait = self.config.clamp_pull_wait_ms(wait_ms);
        self.next_page(conversation_id, cursor, Duration::from_millis(wait))
            .await
    }

    /// Same page shape with a caller-supplied window; the SSE loop uses this
    /// with the stream clamp.
    pub async fn next_page(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        wait: Duration,
    ) -> Result<EventPage> {
        self.require_conversation(conversation_id).await?;
        let batch = self.feed.wait_for_events(conversation_id, cursor, wait).await?;
        // Status is re-read after the wait; a conversation can end mid-poll
        // and the poller steers by this field.
        let conversation = self.require_conversation(conversation_id).await?;
        Ok(EventPage {
            events: batch.events,
            next_cursor: batch.next_cursor,
            has_more: batch.has_more,
            conversation_status: conversation.status,
        })
    }

    /// Mark the conversation ended. Idempotent; in-flight jobs fail fast on
    /// their next stage.
    pub async fn end_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        let conversation = self.store.end_conversation(conversation_id).await?;
        info!("conversation {} ended", conversation.id.short());
        Ok(conversation)
    }

    /// Discard an operator turn and everything after it. The event log is
    /// untouched; readers see the past, the turn list sees the present.
    pub async fn rollback(&self, turn_id: TurnId) -> Result<RollbackOutcome> {
        let turn = self.require_turn(turn_id).await?;
        if turn.role != Role::Operator {
            return Err(SparError::TurnWrongRole(turn.id.to_string()));
        }

        let remaining = self
            .store
            .rollback_turns(turn.conversation_id, turn.id)
            .await?;
        info!(
            "rolled conversation {} back to {} turns",
            turn.conversation_id.short(),
            remaining.len()
        );
        Ok(RollbackOutcome {
            next_cursor: self.store.latest_cursor(turn.conversation_id).await?,
            remaining,
        })
    }

    /// Voice one counterpart turn outside the pipeline. Unlike the staged
    /// path this fails hard; the caller asked for exactly this audio.
    pub async fn synthesize_turn(&self, turn_id: TurnId) -> Result<SynthesisOutcome> {
        let mut turn = self.require_turn(turn_id).await?;
        if turn.role != Role::Counterpart {
            return Err(SparError::TurnWrongRole(turn.id.to_string()));
        }
        if turn.text.trim().is_empty() {
            return Err(SparError::TurnTextEmpty(turn.id.to_string()));
        }

        if let Some(path) = turn.audio_path.clone() {
            // Already voiced; refresh the reference instead of re-synthesizing.
            let url = self.audio.sign(&path).await?;
            if turn.audio_url.as_deref() != Some(url.as_str()) {
                turn.audio_url = Some(url);
                self.store.update_turn(turn.clone()).await?;
            }
            return Ok(SynthesisOutcome { turn, cached: true });
        }

        let synthesizer = self
            .pipeline
            .synthesizer()
            .cloned()
            .ok_or_else(|| SparError::TtsFailed("no synthesizer is configured".to_string()))?;
        let conversation = self.require_conversation(turn.conversation_id).await?;

        let emotion = turn.emotion.unwrap_or_default();
        self.pipeline
            .voice_reply(
                &conversation,
                turn.id,
                &turn.text,
                emotion,
                synthesizer.as_ref(),
                None,
                0,
            )
            .await?;

        let turn = self.require_turn(turn_id).await?;
        Ok(SynthesisOutcome {
            turn,
            cached: false,
        })
    }

    /// Coach one operator turn outside the pipeline. Cached unless the caller
    /// forces a refresh; fails hard, unlike the staged analysis.
    pub async fn analyze_turn(
        &self,
        turn_id: TurnId,
        force_refresh: bool,
    ) -> Result<AnalysisOutcome> {
        let mut turn = self.require_turn(turn_id).await?;
        if turn.role != Role::Operator {
            return Err(SparError::TurnWrongRole(turn.id.to_string()));
        }
        if turn.text.trim().is_empty() {
            return Err(SparError::TurnTextEmpty(turn.id.to_string()));
        }
        if let Some(note) = &turn.analysis {
            if !force_refresh {
                return Ok(AnalysisOutcome {
                    note: note.clone(),
                    cached: true,
                });
            }
        }

        let conversation = self.require_conversation(turn.conversation_id).await?;
        let history = self
            .store
            .recent_turns(
                conversation.id,
                turn.turn_index,
                self.pipeline.history_window(),
            )
            .await?;
        let prompt = history
            .iter()
            .rev()
            .find(|t| t.role == Role::Counterpart && t.turn_index < turn.turn_index);
        let pack = self.packs.resolve(Some(&conversation.category_id));

        let request = AnalysisRequest {
            category_id: &conversation.category_id,
            objective: pack.map(|p| p.objective.as_str()).unwrap_or_default(),
            intent_id: prompt
                .and_then(|t| t.line_ref.as_ref())
                .map(|line_ref| line_ref.intent_id.as_str()),
            history: &history,
            counterpart_text: prompt.map(|t| t.text.as_str()).unwrap_or_default(),
            operator_text: &turn.text,
        };
        let note = self.pipeline.analyst().analyze(&request).await?;

        turn.analysis = Some(note.clone());
        turn.status = TurnStatus::AnalysisReady;
        self.store.update_turn(turn.clone()).await?;
        self.store
            .append_event(
                NewEvent::new(conversation.id, EventType::AnalysisReady)
                    .with_turn(turn.id)
                    .with_payload(json!({
                        "turn_id": turn.id,
                        "analysis": note,
                    })),
            )
            .await?;

        Ok(AnalysisOutcome {
            note,
            cached: false,
        })
    }

    async fn require_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or_else(|| SparError::ConversationNotFound(id.to_string()))
    }

    async fn require_turn(&self, id: TurnId) -> Result<Turn> {
        self.store
            .get_turn(id)
            .await?
            .ok_or_else(|| SparError::TurnNotFound(id.to_string()))
    }
}
