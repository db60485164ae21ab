//! The storage boundary trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use spar_core::{
    Conversation, ConversationId, Event, EventType, Job, JobError, JobId, JobStage, Result,
    ResultState, StagePayload, Turn, TurnId, WorkerHeartbeat, WorkerId,
};

/// Notification that an event was appended; carried on the store's broadcast
/// channel so pull waiters and SSE streams wake without polling.
#[derive(Debug, Clone)]
pub struct EventNotice {
    pub conversation_id: ConversationId,
    pub cursor: u64,
}

/// A not-yet-appended event; the store allocates the cursor.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub conversation_id: ConversationId,
    pub turn_id: Option<TurnId>,
    pub job_id: Option<JobId>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(conversation_id: ConversationId, event_type: EventType) -> Self {
        Self {
            conversation_id,
            turn_id: None,
            job_id: None,
            event_type,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_turn(mut self, turn_id: TurnId) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Shared persistence for conversations, turns, jobs, events and worker
/// heartbeats.
///
/// Concurrency contract: [`claim_next`](Store::claim_next) and
/// [`claim_job`](Store::claim_job) perform an atomic compare-and-set on job
/// status; at most one caller wins a given `queued -> processing` flip.
/// Turn indices and event cursors are allocated atomically by the store, so
/// two workers may operate on different jobs of the same conversation without
/// corrupting either invariant.
#[async_trait]
pub trait Store: Send + Sync {
    // Conversations

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// Persist new policy memory after a selection round.
    async fn update_policy_memory(
        &self,
        id: ConversationId,
        memory: serde_json::Value,
    ) -> Result<()>;

    /// Mark the conversation ended. Idempotent.
    async fn end_conversation(&self, id: ConversationId) -> Result<Conversation>;

    // Turns

    /// Append a turn, allocating the next sequence index. The caller's
    /// `turn_index` is ignored. Fails with `turn_conflict` when the caller's
    /// role does not alternate with the previous turn.
    async fn append_turn(&self, turn: Turn) -> Result<Turn>;

    async fn get_turn(&self, id: TurnId) -> Result<Option<Turn>>;

    /// Replace a turn record by id.
    async fn update_turn(&self, turn: Turn) -> Result<()>;

    /// All turns of a conversation, ascending by index.
    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>>;

    /// The most recent `limit` turns with index at most `up_to_index`,
    /// ascending. This is the bounded history window fed to selection and
    /// analysis.
    async fn recent_turns(
        &self,
        conversation_id: ConversationId,
        up_to_index: u32,
        limit: usize,
    ) -> Result<Vec<Turn>>;

    /// Discard `from_turn_id` and every later turn, cancelling their pending
    /// jobs. Returns the remaining turns ascending.
    async fn rollback_turns(
        &self,
        conversation_id: ConversationId,
        from_turn_id: TurnId,
    ) -> Result<Vec<Turn>>;

    // Jobs

    async fn insert_job(&self, job: Job) -> Result<Job>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Find the job created for an earlier submission with this idempotency
    /// token, if any.
    async fn find_job_by_idempotency(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<Option<Job>>;

    /// Atomic claim of a specific job: `queued -> processing`, attempt count
    /// incremented, last error cleared. `Ok(None)` when some other claimant
    /// won or the job is past `queued`.
    async fn claim_job(&self, id: JobId, worker_id: &str) -> Result<Option<Job>>;

    /// Atomic claim of the oldest queued job, trying `stages` in the given
    /// priority order. `Ok(None)` when nothing is queued.
    async fn claim_next(&self, stages: &[JobStage], worker_id: &str) -> Result<Option<Job>>;

    /// Complete the current stage: write accumulated results and either
    /// requeue at `next` with `payload`, or finish when `next` is terminal.
    /// Only the claim holder (status `processing`) may advance; the forward-
    /// only rule is enforced.
    async fn advance_job(
        &self,
        id: JobId,
        next: JobStage,
        payload: Option<StagePayload>,
        result_state: ResultState,
    ) -> Result<Job>;

    /// Terminal failure: stage and status become `error`. Idempotent on
    /// already-terminal jobs.
    async fn fail_job(&self, id: JobId, error: JobError, result_state: ResultState)
        -> Result<Job>;

    /// Requeue jobs stuck in `processing` since before `stale_before`,
    /// bounded by `limit`. Returns the requeued ids.
    async fn recover_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>>;

    // Events

    /// Append an event, allocating the conversation's next cursor, and wake
    /// subscribers.
    async fn append_event(&self, event: NewEvent) -> Result<Event>;

    /// Events with cursor strictly greater than `cursor`, ascending, at most
    /// `limit`.
    async fn events_after(
        &self,
        conversation_id: ConversationId,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Event>>;

    async fn latest_cursor(&self, conversation_id: ConversationId) -> Result<u64>;

    /// Subscribe to append notifications (all conversations; filter by id).
    fn subscribe(&self) -> broadcast::Receiver<EventNotice>;

    // Worker liveness

    async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<()>;

    async fn get_heartbeat(&self, worker_id: &WorkerId) -> Result<Option<WorkerHeartbeat>>;
}
