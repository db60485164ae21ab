//! Chat-completions client
//!
//! One client serves both generative call sites: the line rewrite and the
//! coaching analysis. Transport is the OpenAI-style `/chat/completions`
//! shape; prompts demand strict JSON and the reply content is parsed into
//! typed results. Rate limits retry with capped exponential backoff; other
//! provider failures feed the circuit breaker so a dead provider stops
//! costing a full timeout per turn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use spar_core::breaker::CircuitBreaker;
use spar_core::config::LlmConfig;
use spar_core::{AnalysisSource, CoachingNote, Emotion, Result, Role, SparError, Turn};

const INITIAL_BACKOFF_MS: u64 = 400;
const MAX_BACKOFF_MS: u64 = 4_000;
const REWRITE_TEMPERATURE: f32 = 0.7;
const ANALYSIS_TEMPERATURE: f32 = 0.6;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct RewriteReply {
    text: String,
}

#[derive(Deserialize)]
struct AnalysisReply {
    suggestions: Vec<String>,
    polished: String,
}

/// Client for the generative provider's chat endpoint
pub struct ChatClient {
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    client: reqwest::Client,
    rewrite_timeout: Duration,
    analysis_timeout: Duration,
    max_retries: u32,
    breaker: CircuitBreaker,
}

impl ChatClient {
    /// Build a client from configuration. The credential is read once from
    /// the configured environment variable.
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            api_key_env: config.api_key_env.clone(),
            model: config.model.clone(),
            client: reqwest::Client::new(),
            rewrite_timeout: Duration::from_millis(config.rewrite_timeout_ms),
            analysis_timeout: Duration::from_millis(config.analysis_timeout_ms),
            max_retries: config.max_retries,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_ms),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    /// Rephrase one scripted counterpart line. Returns the new text only;
    /// the caller decides whether to use it.
    pub async fn rewrite_line(
        &self,
        text: &str,
        emotion: Emotion,
        context: &str,
    ) -> Result<String> {
        let system = ChatMessage::system(
            "You play the client in a live practice conversation for consultation staff. \
             Rephrase the scripted client line you are given so it sounds natural and spoken, \
             keeping its intent, emotion and level of difficulty. \
             Reply with strict JSON only: {\"text\": string}. One or two sentences.",
        );
        let user = ChatMessage::user(format!(
            "Practice objective: {}\nEmotion to keep: {}\nScripted line: {}",
            context, emotion, text
        ));

        let content = self
            .chat_content(&[system, user], REWRITE_TEMPERATURE, self.rewrite_timeout)
            .await?;
        parse_rewrite(&content)
    }

    /// Produce a coaching note for one operator reply.
    pub async fn coach_turn(
        &self,
        objective: &str,
        history: &[Turn],
        counterpart_text: &str,
        operator_text: &str,
    ) -> Result<CoachingNote> {
        let system = ChatMessage::system(
            "You are a communication coach reviewing one reply in a practice conversation. \
             Give exactly three short, actionable suggestions and one polished rephrasing \
             the operator could say verbatim. \
             Reply with strict JSON only: {\"suggestions\": [string, string, string], \"polished\": string}. \
             Do not invent facts, promise guaranteed outcomes, or give medical conclusions.",
        );
        let user = ChatMessage::user(format!(
            "Practice objective: {}\nRecent turns:\n{}\nClient said: {}\nOperator replied: {}",
            objective,
            format_history(history),
            counterpart_text,
            operator_text
        ));

        let content = self
            .chat_content(&[system, user], ANALYSIS_TEMPERATURE, self.analysis_timeout)
            .await?;
        parse_analysis(&content)
    }

    /// One chat call; returns the raw content of the first choice.
    async fn chat_content(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        timeout: Duration,
    ) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SparError::Llm(format!("{} is not set", self.api_key_env)))?;

        if !self.breaker.can_execute() {
            return Err(SparError::Llm(format!(
                "generative breaker is open; retry in {}s",
                self.breaker.retry_after_ms() / 1000
            )));
        }

        let request = ChatRequest {
            model: &self.model,
            temperature,
            messages,
        };

        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(api_key)
                .timeout(timeout)
                .json(&request)
                .send()
                .await
                .map_err(|e| self.send_error(timeout, e))?;

            let status = response.status();

            if status.as_u16() == 429 {
                retries += 1;
                if retries > self.max_retries {
                    return Err(SparError::Llm(format!(
                        "rate limited after {} retries",
                        self.max_retries
                    )));
                }
                let wait_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(backoff_ms);
                tracing::warn!(
                    "rate limited (429); waiting {}ms before retry {}/{}",
                    wait_ms,
                    retries,
                    self.max_retries
                );
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|_| "unknown".into());

                if status.is_server_error() && retries < self.max_retries {
                    retries += 1;
                    tracing::warn!(
                        "provider error ({}); waiting {}ms before retry {}/{}",
                        status,
                        backoff_ms,
                        retries,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                    continue;
                }

                self.breaker.record_failure();
                return Err(SparError::Llm(format!(
                    "provider returned {}: {}",
                    status, body
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| SparError::Llm(format!("chat response unreadable: {}", e)))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .unwrap_or_default();
            if content.trim().is_empty() {
                return Err(SparError::Llm("chat response had no content".to_string()));
            }

            self.breaker.record_success();
            return Ok(content);
        }
    }

    fn send_error(&self, budget: Duration, e: reqwest::Error) -> SparError {
        if e.is_timeout() {
            // A slow provider is the timeout budget's problem, not the
            // breaker's.
            return SparError::Llm(format!("chat call exceeded {}ms", budget.as_millis()));
        }
        self.breaker.record_failure();
        SparError::Llm(format!("chat call failed: {}", e))
    }
}

/// Render the recent history in a shape the model can follow.
fn format_history(history: &[Turn]) -> String {
    if history.is_empty() {
        return "(no prior turns)".to_string();
    }
    history
        .iter()
        .map(|turn| {
            let who = match turn.role {
                Role::Operator => "Operator",
                Role::Counterpart => "Client",
            };
            match (turn.role, turn.emotion) {
                (Role::Counterpart, Some(emotion)) => {
                    format!("{} ({}): {}", who, emotion, turn.text)
                }
                _ => format!("{}: {}", who, turn.text),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Models love code fences despite instructions; strip them before parsing.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn parse_rewrite(content: &str) -> Result<String> {
    let reply: RewriteReply = serde_json::from_str(extract_json(content))
        .map_err(|e| SparError::Llm(format!("rewrite reply not parseable: {}", e)))?;
    let text = reply.text.trim().to_string();
    if text.is_empty() {
        return Err(SparError::Llm("rewrite reply had empty text".to_string()));
    }
    Ok(text)
}

fn parse_analysis(content: &str) -> Result<CoachingNote> {
    let reply: AnalysisReply = serde_json::from_str(extract_json(content))
        .map_err(|e| SparError::Llm(format!("analysis reply not parseable: {}", e)))?;

    let suggestions: Vec<String> = reply
        .suggestions
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(3)
        .collect();
    let polished = reply.polished.trim().to_string();
    if suggestions.is_empty() || polished.is_empty() {
        return Err(SparError::Llm(
            "analysis reply missing suggestions or polished text".to_string(),
        ));
    }

    Ok(CoachingNote {
        suggestions,
        polished,
        source: AnalysisSource::Model,
    })
}
