//! Scripted content packs
//!
//! A pack is the counterpart's side of one practice category: an ordered
//! intent graph (each intent carrying its angles), the scripted lines that
//! live at each intent/angle slot, deterministic openers for turn zero, and
//! template coaching notes for deployments without a generative analyst.
//! Packs are plain data; the selection logic lives in `select`.

use serde::{Deserialize, Serialize};

use spar_core::{AngleId, CategoryId, Emotion, IntentId, LineId};

/// One scripted counterpart line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedLine {
    pub line_id: LineId,
    pub intent_id: IntentId,
    pub angle_id: AngleId,
    pub text: String,
    #[serde(default)]
    pub emotion: Emotion,
    /// Rough 1..=5; higher pushes the operator harder
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
}

fn default_difficulty() -> u8 {
    2
}

impl ScriptedLine {
    pub fn new(
        line_id: impl Into<LineId>,
        intent_id: impl Into<IntentId>,
        angle_id: impl Into<AngleId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            intent_id: intent_id.into(),
            angle_id: angle_id.into(),
            text: text.into(),
            emotion: Emotion::Skeptical,
            difficulty: default_difficulty(),
        }
    }

    pub fn with_emotion(mut self, emotion: Emotion) -> Self {
        self.emotion = emotion;
        self
    }

    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = difficulty;
        self
    }
}

/// An intent with its angles in rotation order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentNode {
    pub intent_id: IntentId,
    pub angles: Vec<AngleId>,
}

impl IntentNode {
    pub fn new(intent_id: impl Into<IntentId>, angles: &[&str]) -> Self {
        Self {
            intent_id: intent_id.into(),
            angles: angles.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// A scripted opener for counterpart turn zero
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpeningLine {
    pub line_id: LineId,
    pub intent_id: IntentId,
    pub angle_id: AngleId,
    pub text: String,
    #[serde(default)]
    pub emotion: Emotion,
}

impl OpeningLine {
    pub fn new(
        line_id: impl Into<LineId>,
        intent_id: impl Into<IntentId>,
        angle_id: impl Into<AngleId>,
        text: impl Into<String>,
        emotion: Emotion,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            intent_id: intent_id.into(),
            angle_id: angle_id.into(),
            text: text.into(),
            emotion,
        }
    }
}

/// Fixed coaching content, used when no generative analyst is wired or when
/// the generative one soft-fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachingTemplate {
    pub intent_id: IntentId,
    pub suggestions: Vec<String>,
    pub polished: String,
}

impl CoachingTemplate {
    pub fn new(intent_id: impl Into<IntentId>, suggestions: &[&str], polished: &str) -> Self {
        Self {
            intent_id: intent_id.into(),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
            polished: polished.to_string(),
        }
    }
}

/// Everything the policy engine needs for one category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPack {
    pub category_id: CategoryId,
    pub name: String,
    /// What the operator is supposed to accomplish here
    pub objective: String,
    pub intents: Vec<IntentNode>,
    pub lines: Vec<ScriptedLine>,
    pub openings: Vec<OpeningLine>,
    pub coaching_templates: Vec<CoachingTemplate>,
}

impl CategoryPack {
    /// Lines at one intent/angle slot, in declaration order.
    pub fn lines_for(&self, intent_id: &str, angle_id: &str) -> Vec<&ScriptedLine> {
        self.lines
            .iter()
            .filter(|line| line.intent_id == intent_id && line.angle_id == angle_id)
            .collect()
    }

    pub fn find_line(&self, line_id: &str) -> Option<&ScriptedLine> {
        self.lines.iter().find(|line| line.line_id == line_id)
    }

    /// Template for the intent, or the category's first template when the
    /// intent has none of its own.
    pub fn coaching_template(&self, intent_id: &str) -> Option<&CoachingTemplate> {
        self.coaching_templates
            .iter()
            .find(|tpl| tpl.intent_id == intent_id)
            .or_else(|| self.coaching_templates.first())
    }

    /// Position of an intent in rotation order.
    pub fn intent_index(&self, intent_id: &str) -> Option<usize> {
        self.intents.iter().position(|n| n.intent_id == intent_id)
    }
}

/// The set of packs a deployment serves. The first pack is the default
/// category for requests that name none.
#[derive(Debug, Clone)]
pub struct PackLibrary {
    packs: Vec<CategoryPack>,
}

impl PackLibrary {
    pub fn new(packs: Vec<CategoryPack>) -> Self {
        Self { packs }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_packs())
    }

    pub fn get(&self, category_id: &str) -> Option<&CategoryPack> {
        self.packs.iter().find(|p| p.category_id == category_id)
    }

    /// Resolve a requested category, falling back to the default when the
    /// request names none or names one this library does not carry.
    pub fn resolve(&self, category_id: Option<&str>) -> Option<&CategoryPack> {
        match category_id {
            Some(id) => self.get(id).or_else(|| self.packs.first()),
            None => self.packs.first(),
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryPack> {
        self.packs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

/// The pack set shipped with the binary. Deployments with their own content
/// construct a `PackLibrary` from data instead.
pub fn builtin_packs() -> Vec<CategoryPack> {
    vec![
        discovery_pack(),
        objections_pack(),
        retention_pack(),
        recovery_pack(),
    ]
}

fn discovery_pack() -> CategoryPack {
    CategoryPack {
        category_id: "discovery".to_string(),
        name: "Discovery".to_string(),
        objective: "Surface needs, budget and timing while building enough trust to continue."
            .to_string(),
        intents: vec![
            IntentNode::new("needs_probe", &["open_question", "specific_concern"]),
            IntentNode::new("trust_building", &["credentials", "social_proof"]),
        ],
        lines: vec![
            ScriptedLine::new(
                "disc-needs-01",
                "needs_probe",
                "open_question",
                "Honestly I'm just looking around. What would you even recommend for someone who's never done this?",
            )
            .with_emotion(Emotion::Neutral)
            .with_difficulty(1),
            ScriptedLine::new(
                "disc-needs-02",
                "needs_probe",
                "open_question",
                "I don't really know what I need. Where do people like me usually start?",
            )
            .with_emotion(Emotion::Neutral)
            .with_difficulty(1),
            ScriptedLine::new(
                "disc-needs-03",
                "needs_probe",
                "specific_concern",
                "My skin gets irritated easily. Is that going to be a problem with any of this?",
            )
            .with_emotion(Emotion::Worried),
            ScriptedLine::new(
                "disc-needs-04",
                "needs_probe",
                "specific_concern",
                "I sit in front of a screen all day and it shows. What actually helps with that?",
            )
            .with_emotion(Emotion::Neutral),
            ScriptedLine::new(
                "disc-trust-01",
                "trust_building",
                "credentials",
                "How long has your team been doing this? I can't tell who's qualified anymore.",
            ),
            ScriptedLine::new(
                "disc-trust-02",
                "trust_building",
                "credentials",
                "Is the person doing the treatment certified, or is it whoever's free that day?",
            ),
            ScriptedLine::new(
                "disc-trust-03",
                "trust_building",
                "social_proof",
                "Do you have clients who started where I am? What happened for them?",
            )
            .with_emotion(Emotion::Neutral),
        ],
        openings: vec![
            OpeningLine::new(
                "disc-open-01",
                "needs_probe",
                "open_question",
                "Hi, I walked past and got curious. I've never been to a studio like this, what is it you actually do?",
                Emotion::Neutral,
            ),
            OpeningLine::new(
                "disc-open-02",
                "needs_probe",
                "open_question",
                "A friend mentioned you, but she didn't say much. Can you give me the short version of what you offer?",
                Emotion::Neutral,
            ),
        ],
        coaching_templates: vec![
            CoachingTemplate::new(
                "needs_probe",
                &[
                    "Ask one open question, then stop talking and listen.",
                    "Mirror the client's own words back before recommending anything.",
                    "Anchor on their goal, not on the service menu.",
                ],
                "It sounds like you're mostly curious what would fit you. Tell me a bit about what's bothered you lately, and I'll only suggest things that are actually relevant.",
            ),
            CoachingTemplate::new(
                "trust_building",
                &[
                    "Answer the qualification question directly before adding color.",
                    "Offer a specific, checkable fact instead of a slogan.",
                    "Invite them to verify rather than asking them to trust.",
                ],
                "Fair question. Everyone on the treatment floor holds the national certificate, and mine is on the wall behind you if you'd like to look while we talk.",
            ),
        ],
    }
}

fn objections_pack() -> CategoryPack {
    CategoryPack {
        category_id: "objections".to_string(),
        name: "Objection handling".to_string(),
        objective: "Work through price, safety and proof objections toward one concrete next step."
            .to_string(),
        intents: vec![
            IntentNode::new("price_objection", &["sticker_shock", "comparison"]),
            IntentNode::new("safety_objection", &["side_effects", "track_record"]),
            IntentNode::new("proof_request", &["results", "references"]),
        ],
        lines: vec![
            ScriptedLine::new(
                "obj-price-01",
                "price_objection",
                "sticker_shock",
                "That's a lot more than I was expecting. What exactly am I paying for here?",
            )
            .with_emotion(Emotion::Impatient),
            ScriptedLine::new(
                "obj-price-02",
                "price_objection",
                "sticker_shock",
                "I'd have to think hard about spending that much. Is there a smaller way to start?",
            )
            .with_emotion(Emotion::Worried),
            ScriptedLine::new(
                "obj-price-03",
                "price_objection",
                "sticker_shock",
                "Every time I ask, the number goes up. Give me the real total, all in.",
            )
            .with_emotion(Emotion::Impatient)
            .with_difficulty(3),
            ScriptedLine::new(
                "obj-price-04",
                "price_objection",
                "comparison",
                "The place down the street quoted me half of that. Why should I pay the difference?",
            )
            .with_difficulty(3),
            ScriptedLine::new(
                "obj-price-05",
                "price_objection",
                "comparison",
                "I can buy the same products online for less. What am I getting from you that I can't get there?",
            ),
            ScriptedLine::new(
                "obj-safety-01",
                "safety_objection",
                "side_effects",
                "I read about people having bad reactions to this. How do I know that won't be me?",
            )
            .with_emotion(Emotion::Worried),
            ScriptedLine::new(
                "obj-safety-02",
                "safety_objection",
                "side_effects",
                "What happens if my skin flares up afterwards? Who deals with that?",
            )
            .with_emotion(Emotion::Worried),
            ScriptedLine::new(
                "obj-safety-03",
                "safety_objection",
                "track_record",
                "Has anything ever gone wrong here? Be straight with me.",
            )
            .with_difficulty(3),
            ScriptedLine::new(
                "obj-proof-01",
                "proof_request",
                "results",
                "Do you have before-and-after photos from real clients, not the marketing ones?",
            ),
            ScriptedLine::new(
                "obj-proof-02",
                "proof_request",
                "results",
                "How soon would I actually see a difference, and how would we measure it?",
            )
            .with_emotion(Emotion::Neutral),
            ScriptedLine::new(
                "obj-proof-03",
                "proof_request",
                "references",
                "Could I talk to someone who's finished the course? Reviews on your own site don't count.",
            )
            .with_difficulty(3),
        ],
        openings: vec![
            OpeningLine::new(
                "obj-open-01",
                "price_objection",
                "sticker_shock",
                "So I've read the brochure and I'm still not convinced. Tell me why this is worth the money.",
                Emotion::Skeptical,
            ),
            OpeningLine::new(
                "obj-open-02",
                "safety_objection",
                "track_record",
                "Before you start: I've been burned by a studio before, so you'll have to do better than a sales pitch.",
                Emotion::Impatient,
            ),
        ],
        coaching_templates: vec![
            CoachingTemplate::new(
                "price_objection",
                &[
                    "Name the total honestly before they have to ask twice.",
                    "Trade scope, not price: offer a smaller start instead of a discount.",
                    "Tie each cost element to an outcome the client said they cared about.",
                ],
                "The full course is the number on the sheet, nothing hidden, and I understand it's a real decision. If you'd rather start small, the single introductory session covers the first step and you can stop there.",
            ),
            CoachingTemplate::new(
                "safety_objection",
                &[
                    "Describe the screening step before defending the product.",
                    "Say plainly what happens if something goes wrong and who owns it.",
                    "Never dismiss the worry; it is the most honest thing in the room.",
                ],
                "That's the right thing to ask. Before anything touches your skin we run a patch test and a short screening, and if anything reacts afterwards we see you the same day at no cost.",
            ),
            CoachingTemplate::new(
                "proof_request",
                &[
                    "Offer verifiable evidence, not adjectives.",
                    "Set an honest timeline for visible results.",
                    "Propose a measurable checkpoint at a fixed date.",
                ],
                "I can show you unretouched photos from clients who agreed to share them, and we'd photograph your own progress so at week four you can judge the difference yourself.",
            ),
        ],
    }
}

fn retention_pack() -> CategoryPack {
    CategoryPack {
        category_id: "retention".to_string(),
        name: "Follow-up and retention".to_string(),
        objective: "Review results, lock in maintenance and open the door to referrals.".to_string(),
        intents: vec![
            IntentNode::new("results_review", &["satisfied", "unsatisfied"]),
            IntentNode::new("rebooking", &["timing", "value"]),
        ],
        lines: vec![
            ScriptedLine::new(
                "ret-review-01",
                "results_review",
                "satisfied",
                "I have to admit it turned out better than I expected. What should I do to keep it this way?",
            )
            .with_emotion(Emotion::Pleased)
            .with_difficulty(1),
            ScriptedLine::new(
                "ret-review-02",
                "results_review",
                "unsatisfied",
                "It's been three weeks and I honestly can't see much change. Is that normal?",
            )
            .with_emotion(Emotion::Worried),
            ScriptedLine::new(
                "ret-review-03",
                "results_review",
                "unsatisfied",
                "My sister says she can't tell the difference. That's not what I paid for.",
            )
            .with_emotion(Emotion::Impatient)
            .with_difficulty(3),
            ScriptedLine::new(
                "ret-book-01",
                "rebooking",
                "timing",
                "Work is chaos this month. Why can't the next session just wait until whenever?",
            )
            .with_emotion(Emotion::Neutral),
            ScriptedLine::new(
                "ret-book-02",
                "rebooking",
                "value",
                "Another package already? Convince me the maintenance plan isn't a subscription trap.",
            )
            .with_difficulty(3),
        ],
        openings: vec![OpeningLine::new(
            "ret-open-01",
            "results_review",
            "satisfied",
            "Hi again. I finished the course last month and wanted to talk about what happens now.",
            Emotion::Pleased,
        )],
        coaching_templates: vec![
            CoachingTemplate::new(
                "results_review",
                &[
                    "Review their result in their words before proposing anything.",
                    "If they are unhappy, agree on what was promised before explaining.",
                    "Close with one concrete maintenance action, not a menu.",
                ],
                "Let's look at your week-one photos next to today before we decide anything. If the change isn't what we discussed, that's on us to address first.",
            ),
            CoachingTemplate::new(
                "rebooking",
                &[
                    "Explain why the interval matters clinically, not commercially.",
                    "Give a real consequence of skipping, stated calmly.",
                    "Offer the smallest commitment that protects the result.",
                ],
                "The six-week gap is about how the skin cycles, not our calendar. If this month is impossible, one maintenance session in week eight still protects most of what you've gained.",
            ),
        ],
    }
}

fn recovery_pack() -> CategoryPack {
    CategoryPack {
        category_id: "recovery".to_string(),
        name: "Service recovery".to_string(),
        objective: "Settle the emotion first, then repair, then hand over to follow-up. No selling."
            .to_string(),
        intents: vec![
            IntentNode::new("complaint", &["emotional", "factual"]),
            IntentNode::new("remedy", &["expectations", "next_steps"]),
        ],
        lines: vec![
            ScriptedLine::new(
                "rec-complaint-01",
                "complaint",
                "emotional",
                "I've been red and blotchy for four days and nobody called me back. Do you understand how that feels?",
            )
            .with_emotion(Emotion::Impatient)
            .with_difficulty(4),
            ScriptedLine::new(
                "rec-complaint-02",
                "complaint",
                "emotional",
                "I trusted you and now I'm scared to look in the mirror. What are you going to do about it?",
            )
            .with_emotion(Emotion::Worried)
            .with_difficulty(4),
            ScriptedLine::new(
                "rec-complaint-03",
                "complaint",
                "factual",
                "Your technician skipped the patch test. I checked my notes, it's not in there.",
            )
            .with_emotion(Emotion::Impatient)
            .with_difficulty(4),
            ScriptedLine::new(
                "rec-remedy-01",
                "remedy",
                "expectations",
                "I don't want vouchers. I want to know exactly how you're going to fix this.",
            )
            .with_emotion(Emotion::Impatient)
            .with_difficulty(3),
            ScriptedLine::new(
                "rec-remedy-02",
                "remedy",
                "next_steps",
                "Fine. Walk me through what happens tomorrow, and who I call if it gets worse.",
            )
            .with_emotion(Emotion::Neutral),
        ],
        openings: vec![OpeningLine::new(
            "rec-open-01",
            "complaint",
            "emotional",
            "Before anything else: I'm not happy, and I need you to hear that properly.",
            Emotion::Impatient,
        )],
        coaching_templates: vec![
            CoachingTemplate::new(
                "complaint",
                &[
                    "Acknowledge the feeling in the first sentence, unconditionally.",
                    "Do not explain or defend until they confirm they feel heard.",
                    "Take personal ownership of the follow-up, with your name on it.",
                ],
                "You're right to be upset, and I'm sorry this is how your week has gone. I'm taking this over personally, and before you leave you'll have my direct number.",
            ),
            CoachingTemplate::new(
                "remedy",
                &[
                    "State the remedy as dated steps, not intentions.",
                    "Name the responsible person for each step.",
                    "Close the loop: say when and how you will report back.",
                ],
                "Here's what happens: tomorrow at nine our lead practitioner examines the reaction, any care it needs is on us, and I call you Thursday with where things stand.",
            ),
        ],
    }
}
