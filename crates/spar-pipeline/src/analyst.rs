//! Coaching analysis behind a trait
//!
//! The analysis stage asks a `CoachingAnalyst` for suggestions about one
//! operator reply. The generative analyst lives with its client; this module
//! defines the seam and the scripted fallback that works with no provider
//! configured at all.

use std::sync::Arc;

use async_trait::async_trait;

use spar_core::{AnalysisSource, CoachingNote, Result, Turn};
use spar_policy::PackLibrary;

/// Everything the analyst gets to look at for one operator reply
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub category_id: &'a str,
    /// What the operator is practicing in this category
    pub objective: &'a str,
    /// Intent of the counterpart line being answered, when known
    pub intent_id: Option<&'a str>,
    /// Bounded recent window, oldest first
    pub history: &'a [Turn],
    pub counterpart_text: &'a str,
    pub operator_text: &'a str,
}

/// Produces a coaching note for one operator reply
#[async_trait]
pub trait CoachingAnalyst: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<CoachingNote>;
}

/// Scripted analyst serving pack templates. Deployments without a generative
/// credential wire this one; it never fails and never leaves the process.
pub struct TemplateAnalyst {
    packs: Arc<PackLibrary>,
}

impl TemplateAnalyst {
    pub fn new(packs: Arc<PackLibrary>) -> Self {
        Self { packs }
    }

    fn generic_note() -> CoachingNote {
        CoachingNote {
            suggestions: vec![
                "Acknowledge the concern before answering it.".to_string(),
                "Back your answer with one concrete, checkable fact.".to_string(),
                "Close with a small next step the client can agree to.".to_string(),
            ],
            polished: "I hear you, and that's a fair question. Let me walk you through \
                       exactly what this involves, and then we can decide together."
                .to_string(),
            source: AnalysisSource::Template,
        }
    }
}

#[async_trait]
impl CoachingAnalyst for TemplateAnalyst {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<CoachingNote> {
        let template = self
            .packs
            .resolve(Some(request.category_id))
            .and_then(|pack| pack.coaching_template(request.intent_id.unwrap_or_default()));

        Ok(match template {
            Some(template) => CoachingNote {
                suggestions: template.suggestions.clone(),
                polished: template.polished.clone(),
                source: AnalysisSource::Template,
            },
            None => Self::generic_note(),
        })
    }
}
