//! Generative variety on top of scripted lines
//!
//! With a configured probability, a selected line's text is rephrased by a
//! generative collaborator. The rewrite is an enhancement, never a
//! dependency: any error, timeout, or empty result quietly keeps the
//! scripted text and the reply stays `fixed`. The probability coin is a
//! deterministic hash over the decision seed, so a given conversation state
//! always flips the same way.

use std::time::Duration;

use async_trait::async_trait;

use spar_core::config::LlmConfig;
use spar_core::{Emotion, ReplySource, Result};

use crate::signals::quick_hash;

/// Collaborator that can rephrase one counterpart line. The context string
/// carries the category objective so the rewrite stays on mission.
#[async_trait]
pub trait LineRewriter: Send + Sync {
    async fn rewrite(&self, text: &str, emotion: Emotion, context: &str) -> Result<String>;
}

/// What came out of the gate: the text to speak and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenLine {
    pub text: String,
    pub source: ReplySource,
}

impl RewrittenLine {
    fn fixed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            source: ReplySource::Fixed,
        }
    }
}

/// Deterministic probability coin over a seed string.
pub fn rewrite_coin(seed: &str, probability: f32) -> bool {
    let p = if probability.is_finite() {
        probability.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if p <= 0.0 {
        return false;
    }
    if p >= 1.0 {
        return true;
    }
    (f64::from(quick_hash(seed)) / f64::from(u32::MAX)) < f64::from(p)
}

/// The fail-open rewrite gate. Holds the knobs; the rewriter rides in per
/// call so the gate itself stays cheap to share.
#[derive(Debug, Clone)]
pub struct RewriteGate {
    enabled: bool,
    probability: f32,
    timeout: Duration,
}

impl RewriteGate {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            enabled: config.rewrite_enabled,
            probability: config.rewrite_probability,
            timeout: Duration::from_millis(config.rewrite_timeout_ms),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
            timeout: Duration::ZERO,
        }
    }

    /// Maybe rewrite `text`. Returns the scripted text as `fixed` on any
    /// path except a successful, non-empty rewrite.
    pub async fn apply(
        &self,
        rewriter: Option<&dyn LineRewriter>,
        seed: &str,
        text: &str,
        emotion: Emotion,
        context: &str,
    ) -> RewrittenLine {
        let rewriter = match rewriter {
            Some(rewriter) if self.enabled => rewriter,
            _ => return RewrittenLine::fixed(text),
        };
        if !rewrite_coin(seed, self.probability) {
            return RewrittenLine::fixed(text);
        }

        match tokio::time::timeout(self.timeout, rewriter.rewrite(text, emotion, context)).await {
            Ok(Ok(rewritten)) => {
                let trimmed = rewritten.trim();
                if trimmed.is_empty() {
                    tracing::debug!("rewrite returned nothing, keeping the scripted line");
                    RewrittenLine::fixed(text)
                } else {
                    RewrittenLine {
                        text: trimmed.to_string(),
                        source: ReplySource::Generated,
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("rewrite failed, keeping the scripted line: {}", e);
                RewrittenLine::fixed(text)
            }
            Err(_) => {
                tracing::warn!(
                    "rewrite exceeded {}ms, keeping the scripted line",
                    self.timeout.as_millis()
                );
                RewrittenLine::fixed(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spar_core::SparError;

    struct EchoRewriter(&'static str);

    #[async_trait]
    impl LineRewriter for EchoRewriter {
        async fn rewrite(&self, _text: &str, _emotion: Emotion, _context: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingRewriter;

    #[async_trait]
    impl LineRewriter for FailingRewriter {
        async fn rewrite(&self, _text: &str, _emotion: Emotion, _context: &str) -> Result<String> {
            Err(SparError::Llm("provider down".into()))
        }
    }

    struct SlowRewriter;

    #[async_trait]
    impl LineRewriter for SlowRewriter {
        async fn rewrite(&self, _text: &str, _emotion: Emotion, _context: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok("too slow".to_string())
        }
    }

    fn always_gate() -> RewriteGate {
        RewriteGate {
            enabled: true,
            probability: 1.0,
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_coin_is_deterministic_and_respects_bounds() {
        assert_eq!(rewrite_coin("seed", 0.3), rewrite_coin("seed", 0.3));
        assert!(!rewrite_coin("anything", 0.0));
        assert!(rewrite_coin("anything", 1.0));
        assert!(!rewrite_coin("anything", f32::NAN));
    }

    #[test]
    fn test_coin_rate_tracks_probability() {
        let flips = (0..1000)
            .filter(|i| rewrite_coin(&format!("conv|{i}"), 0.3))
            .count();
        // Coarse bound; the hash is uniform enough for the gate's purposes.
        assert!((150..=450).contains(&flips), "got {flips} heads");
    }

    #[tokio::test]
    async fn test_successful_rewrite_is_generated() {
        let gate = always_gate();
        let rewriter = EchoRewriter("a fresh phrasing");
        let out = gate
            .apply(Some(&rewriter), "s", "scripted", Emotion::Neutral, "ctx")
            .await;
        assert_eq!(out.text, "a fresh phrasing");
        assert_eq!(out.source, ReplySource::Generated);
    }

    #[tokio::test]
    async fn test_error_keeps_scripted_text() {
        let gate = always_gate();
        let out = gate
            .apply(
                Some(&FailingRewriter),
                "s",
                "scripted",
                Emotion::Neutral,
                "ctx",
            )
            .await;
        assert_eq!(out.text, "scripted");
        assert_eq!(out.source, ReplySource::Fixed);
    }

    #[tokio::test]
    async fn test_timeout_keeps_scripted_text() {
        let gate = always_gate();
        let out = gate
            .apply(Some(&SlowRewriter), "s", "scripted", Emotion::Neutral, "ctx")
            .await;
        assert_eq!(out.source, ReplySource::Fixed);
        assert_eq!(out.text, "scripted");
    }

    #[tokio::test]
    async fn test_empty_rewrite_keeps_scripted_text() {
        let gate = always_gate();
        let rewriter = EchoRewriter("   ");
        let out = gate
            .apply(Some(&rewriter), "s", "scripted", Emotion::Neutral, "ctx")
            .await;
        assert_eq!(out.source, ReplySource::Fixed);
    }

    #[tokio::test]
    async fn test_disabled_gate_never_calls_rewriter() {
        let out = RewriteGate::disabled()
            .apply(
                Some(&FailingRewriter),
                "s",
                "scripted",
                Emotion::Neutral,
                "ctx",
            )
            .await;
        assert_eq!(out, RewrittenLine::fixed("scripted"));
    }

    #[tokio::test]
    async fn test_no_rewriter_stays_fixed() {
        let out = always_gate()
            .apply(None, "s", "scripted", Emotion::Neutral, "ctx")
            .await;
        assert_eq!(out.source, ReplySource::Fixed);
    }
}
