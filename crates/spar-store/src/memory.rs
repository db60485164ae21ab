//! Reference in-memory store
//!
//! One `RwLock` over the whole state gives the claim its atomicity within a
//! process; the trait contract is what a multi-process backend must match.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use spar_core::{
    Conversation, ConversationId, ConversationStatus, Event, Job, JobError, JobId, JobStage,
    JobStatus, Result, ResultState, Role, SparError, StagePayload, Turn, TurnId, WorkerHeartbeat,
    WorkerId,
};

use crate::store::{EventNotice, NewEvent, Store};

const NOTIFY_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    turns: HashMap<TurnId, Turn>,
    /// Turn ids per conversation, ascending by index
    turn_order: HashMap<ConversationId, Vec<TurnId>>,
    jobs: HashMap<JobId, Job>,
    /// Events per conversation, ascending by cursor
    events: HashMap<ConversationId, Vec<Event>>,
    cursors: HashMap<ConversationId, u64>,
    heartbeats: HashMap<WorkerId, WorkerHeartbeat>,
}

/// In-memory [`Store`] implementation
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    notifier: broadcast::Sender<EventNotice>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            notifier,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn next_turn_index(state: &State, conversation_id: ConversationId) -> u32 {
    state
        .turn_order
        .get(&conversation_id)
        .and_then(|order| order.last())
        .and_then(|id| state.turns.get(id))
        .map(|turn| turn.turn_index + 1)
        .unwrap_or(0)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        let mut state = self.state.write().await;
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.get(&id).cloned())
    }

    async fn update_policy_memory(
        &self,
        id: ConversationId,
        memory: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| SparError::ConversationNotFound(id.to_string()))?;
        conversation.policy_memory = memory;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn end_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| SparError::ConversationNotFound(id.to_string()))?;
        if conversation.status != ConversationStatus::Ended {
            conversation.status = ConversationStatus::Ended;
            conversation.updated_at = Utc::now();
        }
        Ok(conversation.clone())
    }

    async fn append_turn(&self, mut turn: Turn) -> Result<Turn> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&turn.conversation_id) {
            return Err(SparError::ConversationNotFound(
                turn.conversation_id.to_string(),
            ));
        }

        let index = next_turn_index(&state, turn.conversation_id);
        let expected = Role::at_index(index);
        if turn.role != expected {
            return Err(SparError::TurnConflict(format!(
                "turn index {} expects role {}, got {}",
                index, expected, turn.role
            )));
        }

        turn.turn_index = index;
        turn.updated_at = Utc::now();
        state
            .turn_order
            .entry(turn.conversation_id)
            .or_default()
            .push(turn.id);
        state.turns.insert(turn.id, turn.clone());
        Ok(turn)
    }

    async fn get_turn(&self, id: TurnId) -> Result<Option<Turn>> {
        let state = self.state.read().await;
        Ok(state.turns.get(&id).cloned())
    }

    async fn update_turn(&self, mut turn: Turn) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.turns.contains_key(&turn.id) {
            return Err(SparError::TurnNotFound(turn.id.to_string()));
        }
        turn.updated_at = Utc::now();
        state.turns.insert(turn.id, turn);
        Ok(())
    }

    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>> {
        let state = self.state.read().await;
        let order = state.turn_order.get(&conversation_id);
        Ok(order
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.turns.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recent_turns(
        &self,
        conversation_id: ConversationId,
        up_to_index: u32,
        limit: usize,
    ) -> Result<Vec<Turn>> {
        let all = self.list_turns(conversation_id).await?;
        let mut window: Vec<Turn> = all
            .into_iter()
            .filter(|t| t.turn_index <= up_to_index)
            .collect();
        if window.len() > limit {
            window = window.split_off(window.len() - limit);
        }
        Ok(window)
    }

    async fn rollback_turns(
        &self,
        conversation_id: ConversationId,
        from_turn_id: TurnId,
    ) -> Result<Vec<Turn>> {
        let mut state = self.state.write().await;
        let from_index = state
            .turns
            .get(&from_turn_id)
            .filter(|t| t.conversation_id == conversation_id)
            .map(|t| t.turn_index)
            .ok_or_else(|| SparError::TurnNotFound(from_turn_id.to_string()))?;

        let mut order = state.turn_order.remove(&conversation_id).unwrap_or_default();
        let mut removed: Vec<TurnId> = Vec::new();
        order.retain(|id| {
            let keep = state
                .turns
                .get(id)
                .map(|t| t.turn_index < from_index)
                .unwrap_or(false);
            if !keep {
                removed.push(*id);
            }
            keep
        });
        let remaining: Vec<TurnId> = order.clone();
        state.turn_order.insert(conversation_id, order);

        for id in &removed {
            state.turns.remove(id);
        }

        // Pending work for a discarded turn can never finish; cancel it.
        let now = Utc::now();
        for job in state.jobs.values_mut() {
            if removed.contains(&job.turn_id) && !job.is_terminal() {
                job.stage = JobStage::Error;
                job.status = JobStatus::Error;
                job.last_error = Some(JobError::new(
                    "turn_not_found",
                    "turn removed by rollback",
                ));
                job.finished_at = Some(now);
                job.updated_at = now;
            }
        }

        debug!(
            "rolled back {} turn(s) of {}",
            removed.len(),
            conversation_id
        );

        Ok(remaining
            .iter()
            .filter_map(|id| state.turns.get(id).cloned())
            .collect())
    }

    async fn insert_job(&self, job: Job) -> Result<Job> {
        let mut state = self.state.write().await;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn find_job_by_idempotency(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .find(|job| {
                job.conversation_id == conversation_id
                    && job.idempotency_token.as_deref() == Some(token)
            })
            .cloned())
    }

    async fn claim_job(&self, id: JobId, worker_id: &str) -> Result<Option<Job>> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SparError::JobNotFound(id.to_string()))?;
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        claim_in_place(job, worker_id);
        Ok(Some(job.clone()))
    }

    async fn claim_next(&self, stages: &[JobStage], worker_id: &str) -> Result<Option<Job>> {
        let mut state = self.state.write().await;
        for stage in stages {
            let candidate = state
                .jobs
                .values()
                .filter(|job| job.stage == *stage && job.status == JobStatus::Queued)
                .min_by_key(|job| job.created_at)
                .map(|job| job.id);
            if let Some(id) = candidate {
                let job = state
                    .jobs
                    .get_mut(&id)
                    .ok_or_else(|| SparError::JobNotFound(id.to_string()))?;
                claim_in_place(job, worker_id);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn advance_job(
        &self,
        id: JobId,
        next: JobStage,
        payload: Option<StagePayload>,
        result_state: ResultState,
    ) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SparError::JobNotFound(id.to_string()))?;

        if job.status != JobStatus::Processing {
            return Err(SparError::ClaimLost(format!(
                "job {} is {} not processing",
                id, job.status
            )));
        }
        if next == JobStage::Error || !job.stage.can_advance_to(next) {
            return Err(SparError::Job(format!(
                "illegal stage transition {} -> {}",
                job.stage, next
            )));
        }

        let now = Utc::now();
        job.stage = next;
        job.result_state = result_state;
        if let Some(payload) = payload {
            job.payload = payload;
        }
        if next == JobStage::Done {
            job.status = JobStatus::Done;
            job.finished_at = Some(now);
        } else {
            job.status = JobStatus::Queued;
            job.worker_id = None;
            job.started_at = None;
        }
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        id: JobId,
        error: JobError,
        result_state: ResultState,
    ) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SparError::JobNotFound(id.to_string()))?;
        if job.is_terminal() {
            return Ok(job.clone());
        }
        let now = Utc::now();
        job.stage = JobStage::Error;
        job.status = JobStatus::Error;
        job.result_state = result_state;
        job.last_error = Some(error);
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn recover_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let mut state = self.state.write().await;
        let mut stale: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .filter_map(|job| {
                let claimed_at = job.started_at.unwrap_or(job.updated_at);
                (claimed_at < stale_before).then_some((claimed_at, job.id))
            })
            .collect();
        stale.sort_by_key(|(at, _)| *at);
        stale.truncate(limit);

        let now = Utc::now();
        let mut requeued = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Queued;
                job.worker_id = None;
                job.started_at = None;
                job.updated_at = now;
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event> {
        let stored = {
            let mut state = self.state.write().await;
            if !state.conversations.contains_key(&event.conversation_id) {
                return Err(SparError::ConversationNotFound(
                    event.conversation_id.to_string(),
                ));
            }
            let cursor = state
                .cursors
                .entry(event.conversation_id)
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let stored = Event {
                cursor: *cursor,
                conversation_id: event.conversation_id,
                turn_id: event.turn_id,
                job_id: event.job_id,
                event_type: event.event_type,
                payload: event.payload,
                created_at: Utc::now(),
            };
            state
                .events
                .entry(event.conversation_id)
                .or_default()
                .push(stored.clone());
            stored
        };

        // Waking subscribers is best-effort; pull still sees the event.
        let _ = self.notifier.send(EventNotice {
            conversation_id: stored.conversation_id,
            cursor: stored.cursor,
        });
        Ok(stored)
    }

    async fn events_after(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .get(&conversation_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.cursor > cursor)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_cursor(&self, conversation_id: ConversationId) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.cursors.get(&conversation_id).copied().unwrap_or(0))
    }

    fn subscribe(&self) -> broadcast::Receiver<EventNotice> {
        self.notifier.subscribe()
    }

    async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat);
        Ok(())
    }

    async fn get_heartbeat(&self, worker_id: &WorkerId) -> Result<Option<WorkerHeartbeat>> {
        let state = self.state.read().await;
        Ok(state.heartbeats.get(worker_id).cloned())
    }
}

fn claim_in_place(job: &mut Job, worker_id: &str) {
    let now = Utc::now();
    job.status = JobStatus::Processing;
    job.attempt_count += 1;
    job.worker_id = Some(worker_id.to_string());
    job.last_error = None;
    job.started_at = Some(now);
    job.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use spar_core::{AudioSource, EventType, MainPayload, ResultState, StagePayload, TurnStatus};
    use spar_core::{AudioFormat, HeartbeatStatus};

    async fn seeded(store: &MemoryStore) -> (Conversation, Turn) {
        let conversation = store
            .create_conversation(Conversation::new("objections", 10))
            .await
            .unwrap();
        let opening = store
            .append_turn(
                Turn::new(conversation.id, 0, Role::Counterpart)
                    .with_text("That sounds expensive.")
                    .with_status(TurnStatus::TextReady),
            )
            .await
            .unwrap();
        (conversation, opening)
    }

    fn main_payload(reply_to: TurnId) -> StagePayload {
        StagePayload::Main(MainPayload {
            reply_to_turn_id: reply_to,
            audio: AudioSource::Inline {
                b64: "AAAA".to_string(),
            },
            audio_format: AudioFormat::Wav,
            client_seconds: Some(2.0),
            idempotency_token: None,
        })
    }

    async fn seeded_job(store: &MemoryStore) -> (Conversation, Turn, Job) {
        let (conversation, opening) = seeded(store).await;
        let operator = store
            .append_turn(Turn::new(conversation.id, 1, Role::Operator))
            .await
            .unwrap();
        let job = store
            .insert_job(Job::new(
                conversation.id,
                operator.id,
                main_payload(opening.id),
            ))
            .await
            .unwrap();
        (conversation, operator, job)
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let (_, _, job) = seeded_job(&store).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = job.id;
            handles.push(tokio::spawn(async move {
                store.claim_job(id, &format!("worker-{i}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let claimed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_claim_next_prefers_earlier_stages() {
        let store = MemoryStore::new();
        let (conversation, opening) = seeded(&store).await;
        let operator = store
            .append_turn(Turn::new(conversation.id, 1, Role::Operator))
            .await
            .unwrap();

        // An analysis-stage job enqueued before a fresh main-stage job.
        let mut late_stage = Job::new(conversation.id, operator.id, main_payload(opening.id));
        late_stage.stage = JobStage::AnalysisPending;
        let late_stage = store.insert_job(late_stage).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let fresh = store
            .insert_job(Job::new(
                conversation.id,
                operator.id,
                main_payload(opening.id),
            ))
            .await
            .unwrap();

        let claimed = store
            .claim_next(&spar_core::ACTIVE_STAGES, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, fresh.id, "main stage outranks analysis");

        let claimed = store
            .claim_next(&spar_core::ACTIVE_STAGES, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, late_stage.id);

        assert!(store
            .claim_next(&spar_core::ACTIVE_STAGES, "w1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_advance_requires_the_claim() {
        let store = MemoryStore::new();
        let (_, _, job) = seeded_job(&store).await;

        let result = store
            .advance_job(
                job.id,
                JobStage::SpeechOutputPending,
                None,
                ResultState::default(),
            )
            .await;
        assert!(matches!(result, Err(SparError::ClaimLost(_))));
    }

    #[tokio::test]
    async fn test_advance_walks_forward_only() {
        let store = MemoryStore::new();
        let (_, _, job) = seeded_job(&store).await;

        store.claim_job(job.id, "w1").await.unwrap().unwrap();

        // Skipping a stage is rejected and the claim survives the attempt.
        let skipped = store
            .advance_job(job.id, JobStage::AnalysisPending, None, ResultState::default())
            .await;
        assert!(matches!(skipped, Err(SparError::Job(_))));

        let advanced = store
            .advance_job(
                job.id,
                JobStage::SpeechOutputPending,
                None,
                ResultState::default(),
            )
            .await
            .unwrap();
        assert_eq!(advanced.stage, JobStage::SpeechOutputPending);
        assert_eq!(advanced.status, JobStatus::Queued);
        assert!(advanced.worker_id.is_none());

        // Re-claim, walk to done.
        store.claim_job(job.id, "w2").await.unwrap().unwrap();
        store
            .advance_job(job.id, JobStage::AnalysisPending, None, ResultState::default())
            .await
            .unwrap();
        store.claim_job(job.id, "w2").await.unwrap().unwrap();
        let done = store
            .advance_job(job.id, JobStage::Done, None, ResultState::default())
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert!(done.finished_at.is_some());
        assert_eq!(done.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_fail_job_is_idempotent_once_terminal() {
        let store = MemoryStore::new();
        let (_, _, job) = seeded_job(&store).await;

        store.claim_job(job.id, "w1").await.unwrap().unwrap();
        let failed = store
            .fail_job(
                job.id,
                JobError::new("asr_failed", "provider exploded"),
                ResultState::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.stage, JobStage::Error);

        let again = store
            .fail_job(
                job.id,
                JobError::new("other", "second failure"),
                ResultState::default(),
            )
            .await
            .unwrap();
        assert_eq!(again.last_error.unwrap().code, "asr_failed");
    }

    #[tokio::test]
    async fn test_stale_recovery_requeues_exactly_once() {
        let store = MemoryStore::new();
        let (_, _, job) = seeded_job(&store).await;
        store.claim_job(job.id, "w1").await.unwrap().unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let first = store.recover_stale_jobs(cutoff, 20).await.unwrap();
        assert_eq!(first, vec![job.id]);

        // The job is queued again; a second sweep finds nothing.
        let second = store.recover_stale_jobs(cutoff, 20).await.unwrap();
        assert!(second.is_empty());

        let recovered = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert_eq!(recovered.attempt_count, 1, "recovery is not an attempt");
    }

    #[tokio::test]
    async fn test_stale_recovery_respects_batch_limit() {
        let store = MemoryStore::new();
        let (conversation, opening) = seeded(&store).await;
        let operator = store
            .append_turn(Turn::new(conversation.id, 1, Role::Operator))
            .await
            .unwrap();

        for _ in 0..3 {
            let job = store
                .insert_job(Job::new(
                    conversation.id,
                    operator.id,
                    main_payload(opening.id),
                ))
                .await
                .unwrap();
            store.claim_job(job.id, "w1").await.unwrap().unwrap();
        }

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.recover_stale_jobs(cutoff, 2).await.unwrap().len(), 2);
        assert_eq!(store.recover_stale_jobs(cutoff, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_turn_indices_allocate_and_alternate() {
        let store = MemoryStore::new();
        let (conversation, opening) = seeded(&store).await;
        assert_eq!(opening.turn_index, 0);

        let operator = store
            .append_turn(Turn::new(conversation.id, 99, Role::Operator))
            .await
            .unwrap();
        assert_eq!(operator.turn_index, 1, "store allocates the index");

        let conflict = store
            .append_turn(Turn::new(conversation.id, 0, Role::Operator))
            .await;
        assert!(matches!(conflict, Err(SparError::TurnConflict(_))));

        let counterpart = store
            .append_turn(Turn::new(conversation.id, 0, Role::Counterpart))
            .await
            .unwrap();
        assert_eq!(counterpart.turn_index, 2);
    }

    #[tokio::test]
    async fn test_cursors_are_gapless_and_queryable() {
        let store = MemoryStore::new();
        let (conversation, _) = seeded(&store).await;

        for _ in 0..3 {
            store
                .append_event(NewEvent::new(conversation.id, EventType::TurnAccepted))
                .await
                .unwrap();
        }

        assert_eq!(store.latest_cursor(conversation.id).await.unwrap(), 3);

        let tail = store.events_after(conversation.id, 1, 50).await.unwrap();
        assert_eq!(
            tail.iter().map(|e| e.cursor).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(store
            .events_after(conversation.id, 3, 50)
            .await
            .unwrap()
            .is_empty());

        // Batch limit caps the page, never skips.
        let page = store.events_after(conversation.id, 0, 2).await.unwrap();
        assert_eq!(page.iter().map(|e| e.cursor).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_append_event_wakes_subscribers() {
        let store = MemoryStore::new();
        let (conversation, _) = seeded(&store).await;
        let mut rx = store.subscribe();

        store
            .append_event(NewEvent::new(conversation.id, EventType::AsrReady))
            .await
            .unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.conversation_id, conversation.id);
        assert_eq!(notice.cursor, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_suffix_and_cancels_jobs() {
        let store = MemoryStore::new();
        let (conversation, operator, job) = seeded_job(&store).await;
        store
            .append_turn(
                Turn::new(conversation.id, 0, Role::Counterpart).with_text("Reply text"),
            )
            .await
            .unwrap();

        let remaining = store
            .rollback_turns(conversation.id, operator.id)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].turn_index, 0);

        let cancelled = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Error);
        assert_eq!(cancelled.last_error.unwrap().code, "turn_not_found");

        // The freed index is reusable and alternation still holds.
        let redo = store
            .append_turn(Turn::new(conversation.id, 0, Role::Operator))
            .await
            .unwrap();
        assert_eq!(redo.turn_index, 1);
    }

    #[tokio::test]
    async fn test_idempotency_lookup_scoped_to_conversation() {
        let store = MemoryStore::new();
        let (conversation, operator, _) = seeded_job(&store).await;

        let job = store
            .insert_job(
                Job::new(conversation.id, operator.id, main_payload(operator.id))
                    .with_idempotency_token(Some("attempt-1".to_string())),
            )
            .await
            .unwrap();

        let found = store
            .find_job_by_idempotency(conversation.id, "attempt-1")
            .await
            .unwrap();
        assert_eq!(found.map(|j| j.id), Some(job.id));

        let other = store
            .create_conversation(Conversation::new("objections", 10))
            .await
            .unwrap();
        assert!(store
            .find_job_by_idempotency(other.id, "attempt-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_end_conversation_is_idempotent() {
        let store = MemoryStore::new();
        let (conversation, _) = seeded(&store).await;

        let ended = store.end_conversation(conversation.id).await.unwrap();
        assert_eq!(ended.status, ConversationStatus::Ended);
        let again = store.end_conversation(conversation.id).await.unwrap();
        assert_eq!(again.status, ConversationStatus::Ended);
        assert_eq!(again.updated_at, ended.updated_at);
    }

    #[tokio::test]
    async fn test_heartbeat_upserts_by_worker() {
        let store = MemoryStore::new();
        let hb = WorkerHeartbeat {
            worker_id: "host#1".to_string(),
            status: HeartbeatStatus::Started,
            jobs_processed: 0,
            updated_at: Utc::now(),
        };
        store.record_heartbeat(hb.clone()).await.unwrap();
        store
            .record_heartbeat(WorkerHeartbeat {
                status: HeartbeatStatus::Alive,
                jobs_processed: 4,
                ..hb
            })
            .await
            .unwrap();

        let stored = store
            .get_heartbeat(&"host#1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, HeartbeatStatus::Alive);
        assert_eq!(stored.jobs_processed, 4);
    }
}
