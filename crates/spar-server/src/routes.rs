//! JSON request handlers
//!
//! Each handler decodes the transport shape, calls one [`Ops`] operation and
//! re-shapes the outcome. Validation beyond decoding lives in the pipeline;
//! the handlers add nothing a direct caller of `Ops` would miss.

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use spar_core::{
    AudioFormat, CategoryId, CoachingNote, Conversation, ConversationId, ConversationStatus,
    Event, JobId, SparError, Turn, TurnId,
};
use spar_pipeline::SubmitRequest;

use crate::error::ApiError;
use crate::AppState;

pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        categories: state.ops.packs().categories().count(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub categories: usize,
}

pub async fn handle_categories(State(state): State<AppState>) -> Json<CategoriesResponse> {
    let categories = state
        .ops
        .packs()
        .categories()
        .map(|pack| CategorySummary {
            category_id: pack.category_id.clone(),
            name: pack.name.clone(),
            objective: pack.objective.clone(),
            openings: pack.openings.len(),
            lines: pack.lines.len(),
        })
        .collect();
    Json(CategoriesResponse { categories })
}

#[derive(Debug, Serialize)]
pub struct CategoriesResponse {
    pub categories: Vec<CategorySummary>,
}

#[derive(Debug, Serialize)]
pub struct CategorySummary {
    pub category_id: CategoryId,
    pub name: String,
    pub objective: String,
    pub openings: usize,
    pub lines: usize,
}

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

pub async fn handle_start_conversation(
    State(state): State<AppState>,
    Json(request): Json<StartConversationRequest>,
) -> Result<Json<StartConversationResponse>, ApiError> {
    let new = state
        .ops
        .start_conversation(request.category.as_deref(), request.max_turns)
        .await?;
    Ok(Json(StartConversationResponse {
        conversation: new.conversation,
        opening: new.opening,
    }))
}

#[derive(Debug, Serialize)]
pub struct StartConversationResponse {
    pub conversation: Conversation,
    pub opening: Turn,
}

pub async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let snapshot = state.ops.snapshot(conversation_id).await?;
    Ok(Json(SnapshotResponse {
        conversation: snapshot.conversation,
        turns: snapshot.turns,
        next_cursor: snapshot.next_cursor,
    }))
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub conversation: Conversation,
    pub turns: Vec<Turn>,
    pub next_cursor: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTurnRequest {
    /// The recording, base64 over JSON
    pub audio_b64: String,
    /// Declared container; a hint only, sniffing decides
    #[serde(default)]
    pub format: Option<String>,
    pub reply_to_turn_id: TurnId,
    #[serde(default)]
    pub client_seconds: Option<f32>,
    #[serde(default)]
    pub idempotency_token: Option<String>,
}

pub async fn handle_submit_turn(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<SubmitTurnRequest>,
) -> Result<Json<SubmitTurnResponse>, ApiError> {
    let declared_format = match request.format.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<AudioFormat>()
                .map_err(|_| SparError::UnsupportedAudioFormat(raw.to_string()))?,
        ),
    };
    let audio = BASE64
        .decode(request.audio_b64.as_bytes())
        .map_err(|_| SparError::UnsupportedAudioFormat("undecodable base64".to_string()))?;

    let receipt = state
        .ops
        .submit_turn(SubmitRequest {
            conversation_id,
            audio,
            declared_format,
            reply_to_turn_id: request.reply_to_turn_id,
            client_seconds: request.client_seconds,
            idempotency_token: request.idempotency_token,
        })
        .await?;
    Ok(Json(SubmitTurnResponse {
        turn_id: receipt.turn_id,
        job_id: receipt.job_id,
        next_cursor: receipt.next_cursor,
        reached_max_turns: receipt.reached_max_turns,
        deduped: receipt.deduped,
    }))
}

#[derive(Debug, Serialize)]
pub struct SubmitTurnResponse {
    pub turn_id: TurnId,
    pub job_id: JobId,
    pub next_cursor: u64,
    pub reached_max_turns: bool,
    pub deduped: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

pub async fn handle_pull_events(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let page = state
        .ops
        .pull_events(conversation_id, query.cursor, query.wait_ms)
        .await?;
    Ok(Json(EventsResponse {
        events: page.events,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
        conversation_status: page.conversation_status,
    }))
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<Event>,
    pub next_cursor: u64,
    pub has_more: bool,
    pub conversation_status: ConversationStatus,
}

pub async fn handle_end_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<EndConversationResponse>, ApiError> {
    let conversation = state.ops.end_conversation(conversation_id).await?;
    Ok(Json(EndConversationResponse { conversation }))
}

#[derive(Debug, Serialize)]
pub struct EndConversationResponse {
    pub conversation: Conversation,
}

pub async fn handle_rollback(
    State(state): State<AppState>,
    Path(turn_id): Path<TurnId>,
) -> Result<Json<RollbackResponse>, ApiError> {
    let outcome = state.ops.rollback(turn_id).await?;
    Ok(Json(RollbackResponse {
        turns: outcome.remaining,
        next_cursor: outcome.next_cursor,
    }))
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub turns: Vec<Turn>,
    pub next_cursor: u64,
}

pub async fn handle_synthesize_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<TurnId>,
) -> Result<Json<SynthesizeResponse>, ApiError> {
    let outcome = state.ops.synthesize_turn(turn_id).await?;
    Ok(Json(SynthesizeResponse {
        turn: outcome.turn,
        cached: outcome.cached,
    }))
}

#[derive(Debug, Serialize)]
pub struct SynthesizeResponse {
    pub turn: Turn,
    pub cached: bool,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

pub async fn handle_analyze_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<TurnId>,
    Query(query): Query<AnalyzeQuery>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let outcome = state.ops.analyze_turn(turn_id, query.force_refresh).await?;
    Ok(Json(AnalyzeResponse {
        analysis: outcome.note,
        cached: outcome.cached,
    }))
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub analysis: CoachingNote,
    pub cached: bool,
}
