//! Deterministic next-line selection
//!
//! The selector is a pure function: pack + memory + operator text + recent
//! history in, chosen line + new memory out. All "randomness" is `quick_hash`
//! over a caller-supplied seed, so the same conversation state always yields
//! the same line. The loop guard keeps the counterpart from circling: a
//! stalled operator signature rotates the angle, an overstayed intent rotates
//! the intent, and the previous line is never chosen twice in a row while an
//! alternative exists.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use spar_core::config::PolicyConfig;
use spar_core::{AngleId, IntentId, LineId, Result, Role, SparError, Turn};

use crate::pack::{CategoryPack, IntentNode, OpeningLine, ScriptedLine};
use crate::signals::{extract_signal, quick_hash};

/// What the policy engine remembers about one conversation between turns.
/// Persisted on the conversation as opaque JSON; anything unreadable
/// deserializes to the default and the engine starts fresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMemory {
    #[serde(default)]
    pub intent_index: usize,
    #[serde(default)]
    pub angle_index: usize,
    #[serde(default)]
    pub same_intent_rounds: u32,
    #[serde(default)]
    pub stagnation_count: u32,
    /// Most recent last; capped by configuration
    #[serde(default)]
    pub used_line_ids: Vec<LineId>,
    /// Signal signature of the previous operator turn
    #[serde(default)]
    pub last_signal: String,
}

impl PolicyMemory {
    /// Memory positioned at the opening line's slot, with the opener already
    /// marked used.
    pub fn for_opening(pack: &CategoryPack, opening: &OpeningLine) -> Self {
        let intent_index = pack.intent_index(&opening.intent_id).unwrap_or(0);
        let angle_index = pack
            .intents
            .get(intent_index)
            .and_then(|node| node.angles.iter().position(|a| a == &opening.angle_id))
            .unwrap_or(0);
        Self {
            intent_index,
            angle_index,
            same_intent_rounds: 0,
            stagnation_count: 0,
            used_line_ids: vec![opening.line_id.clone()],
            last_signal: String::new(),
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A chosen counterpart line plus the memory the caller must persist
#[derive(Debug, Clone)]
pub struct LineSelection {
    pub line: ScriptedLine,
    pub intent_id: IntentId,
    pub angle_id: AngleId,
    pub memory: PolicyMemory,
    pub loop_guard_triggered: bool,
}

fn clamp_index(n: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else if n >= len {
        len - 1
    } else {
        n
    }
}

/// Deterministic opener for a new conversation, hashed off the seed.
pub fn pick_opening<'a>(pack: &'a CategoryPack, seed: &str) -> Option<&'a OpeningLine> {
    if pack.openings.is_empty() {
        return None;
    }
    let idx = quick_hash(seed) as usize % pack.openings.len();
    Some(&pack.openings[idx])
}

fn pick_candidate<'a>(
    pack: &'a CategoryPack,
    intent_id: &str,
    angle_id: &str,
    used: &HashSet<&str>,
    history_texts: &HashSet<String>,
    seed: &str,
) -> Option<&'a ScriptedLine> {
    let scoped = pack.lines_for(intent_id, angle_id);
    if scoped.is_empty() {
        return None;
    }

    // Prefer lines never used in this conversation; then lines merely absent
    // from the visible history; then anything in the slot.
    let fresh: Vec<&ScriptedLine> = scoped
        .iter()
        .copied()
        .filter(|line| {
            !used.contains(line.line_id.as_str()) && !history_texts.contains(line.text.trim())
        })
        .collect();
    let pool = if !fresh.is_empty() {
        fresh
    } else {
        let unseen: Vec<&ScriptedLine> = scoped
            .iter()
            .copied()
            .filter(|line| !history_texts.contains(line.text.trim()))
            .collect();
        if !unseen.is_empty() {
            unseen
        } else {
            scoped
        }
    };

    let idx = quick_hash(&format!("{}|{}|{}", seed, angle_id, pool.len())) as usize % pool.len();
    Some(pool[idx])
}

/// Select the counterpart's next line.
///
/// `seed` should identify the decision point (conversation id plus operator
/// turn index) so replays are reproducible. `history` is the bounded recent
/// window, oldest first.
pub fn select_next_line(
    pack: &CategoryPack,
    memory: &PolicyMemory,
    operator_text: &str,
    history: &[Turn],
    config: &PolicyConfig,
    seed: &str,
) -> Result<LineSelection> {
    if pack.lines.is_empty() {
        return Err(SparError::Config(format!(
            "category pack '{}' has no lines",
            pack.category_id
        )));
    }

    // A pack without a declared graph still rotates over its first line's slot.
    let nodes: Vec<IntentNode> = if pack.intents.is_empty() {
        vec![IntentNode {
            intent_id: pack.lines[0].intent_id.clone(),
            angles: vec![pack.lines[0].angle_id.clone()],
        }]
    } else {
        pack.intents.clone()
    };

    let signal = extract_signal(operator_text);
    let progressed = memory.last_signal.is_empty() || memory.last_signal != signal;
    let mut stagnation = if progressed {
        0
    } else {
        memory.stagnation_count + 1
    };
    let mut loop_guard_triggered = false;

    let entry_intent = clamp_index(memory.intent_index, nodes.len());
    let mut intent_index = entry_intent;
    let mut angle_index = clamp_index(memory.angle_index, nodes[intent_index].angles.len().max(1));

    let stagnation_threshold = config.stagnation_threshold.max(1);
    let max_same_intent = config.max_same_intent_rounds.max(2);

    if stagnation >= stagnation_threshold {
        loop_guard_triggered = true;
        stagnation = 0;
        let angle_count = nodes[intent_index].angles.len();
        if angle_index + 1 < angle_count {
            angle_index += 1;
        } else {
            intent_index = (intent_index + 1) % nodes.len();
            angle_index = 0;
        }
    }

    if memory.same_intent_rounds >= max_same_intent {
        loop_guard_triggered = true;
        intent_index = (intent_index + 1) % nodes.len();
        angle_index = 0;
    }

    let used: HashSet<&str> = memory.used_line_ids.iter().map(String::as_str).collect();
    let history_texts: HashSet<String> = history
        .iter()
        .filter(|turn| turn.role == Role::Counterpart)
        .map(|turn| turn.text.trim().to_string())
        .collect();
    let last_line_id = memory.used_line_ids.last().map(String::as_str);

    let mut selected: Option<&ScriptedLine> = None;
    let mut sel_intent = intent_index;
    let mut sel_angle = angle_index;
    let max_attempts = (nodes.len() * 4).max(3);

    for attempt in 0..max_attempts {
        let node = &nodes[sel_intent];
        let angle_id = node
            .angles
            .get(clamp_index(sel_angle, node.angles.len().max(1)))
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let candidate = pick_candidate(
            pack,
            &node.intent_id,
            &angle_id,
            &used,
            &history_texts,
            &format!("{}|{}|{}", seed, history.len(), attempt),
        );

        match candidate {
            Some(line) if Some(line.line_id.as_str()) == last_line_id && pack.lines.len() > 1 => {
                // Never the same line twice in a row; rotate and look again.
                loop_guard_triggered = true;
            }
            Some(line) => {
                selected = Some(line);
                break;
            }
            None => {}
        }

        if sel_angle + 1 < node.angles.len() {
            sel_angle += 1;
        } else {
            sel_intent = (sel_intent + 1) % nodes.len();
            sel_angle = 0;
        }
    }

    let line = match selected {
        Some(line) => line,
        None => {
            // Every slot was exhausted or blocked; any line beats no reply.
            sel_intent = 0;
            sel_angle = 0;
            &pack.lines[0]
        }
    };

    let same_intent_rounds = if sel_intent == entry_intent {
        memory.same_intent_rounds.saturating_add(1).max(1)
    } else {
        1
    };

    // The cap keeps the most recent ids so the tail is always the previous
    // selection.
    let mut used_next = memory.used_line_ids.clone();
    if let Some(pos) = used_next.iter().position(|id| id == &line.line_id) {
        used_next.remove(pos);
    }
    used_next.push(line.line_id.clone());
    let cap = config.used_line_cap.max(1);
    if used_next.len() > cap {
        let overflow = used_next.len() - cap;
        used_next.drain(..overflow);
    }

    let next_memory = PolicyMemory {
        intent_index: sel_intent,
        angle_index: clamp_index(sel_angle, nodes[sel_intent].angles.len().max(1)),
        same_intent_rounds,
        stagnation_count: stagnation,
        used_line_ids: used_next,
        last_signal: signal,
    };

    Ok(LineSelection {
        line: line.clone(),
        intent_id: line.intent_id.clone(),
        angle_id: line.angle_id.clone(),
        memory: next_memory,
        loop_guard_triggered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{builtin_packs, PackLibrary};
    use spar_core::ConversationId;

    fn objections() -> CategoryPack {
        PackLibrary::builtin().get("objections").cloned().unwrap()
    }

    fn history_turn(index: u32, role: Role, text: &str) -> Turn {
        Turn::new(ConversationId::new(), index, role).with_text(text)
    }

    #[test]
    fn test_selection_is_deterministic() {
        let pack = objections();
        let memory = PolicyMemory::default();
        let config = PolicyConfig::default();

        let a = select_next_line(&pack, &memory, "the price seems high", &[], &config, "c1|1")
            .unwrap();
        let b = select_next_line(&pack, &memory, "the price seems high", &[], &config, "c1|1")
            .unwrap();
        assert_eq!(a.line.line_id, b.line.line_id);
        assert_eq!(a.memory, b.memory);
    }

    #[test]
    fn test_selection_updates_memory() {
        let pack = objections();
        let config = PolicyConfig::default();

        let sel = select_next_line(
            &pack,
            &PolicyMemory::default(),
            "I'm worried about the price",
            &[],
            &config,
            "c1|1",
        )
        .unwrap();

        assert_eq!(sel.memory.last_signal, "price");
        assert_eq!(sel.memory.same_intent_rounds, 1);
        assert_eq!(
            sel.memory.used_line_ids.last().map(String::as_str),
            Some(sel.line.line_id.as_str())
        );
        assert!(!sel.loop_guard_triggered);
    }

    #[test]
    fn test_stagnation_rotates_angle() {
        let pack = objections();
        let config = PolicyConfig::default();
        // Same signal as last time, one repeat away from the threshold.
        let memory = PolicyMemory {
            last_signal: "price".to_string(),
            stagnation_count: 1,
            ..PolicyMemory::default()
        };

        let sel = select_next_line(
            &pack,
            &memory,
            "but really, the price is the issue",
            &[],
            &config,
            "c1|2",
        )
        .unwrap();

        assert!(sel.loop_guard_triggered);
        assert_eq!(sel.angle_id, "comparison");
        assert_eq!(sel.memory.stagnation_count, 0);
    }

    #[test]
    fn test_same_intent_cap_rotates_intent() {
        let pack = objections();
        let config = PolicyConfig::default();
        let memory = PolicyMemory {
            same_intent_rounds: config.max_same_intent_rounds,
            last_signal: String::new(),
            ..PolicyMemory::default()
        };

        let sel = select_next_line(
            &pack,
            &memory,
            "let me think about something else",
            &[],
            &config,
            "c1|5",
        )
        .unwrap();

        assert!(sel.loop_guard_triggered);
        assert_eq!(sel.intent_id, "safety_objection");
        assert_eq!(sel.memory.same_intent_rounds, 1);
    }

    #[test]
    fn test_never_repeats_previous_line() {
        let pack = CategoryPack {
            category_id: "tiny".to_string(),
            name: "Tiny".to_string(),
            objective: String::new(),
            intents: vec![IntentNode::new("only", &["solo"])],
            lines: vec![
                ScriptedLine::new("tiny-a", "only", "solo", "first thing"),
                ScriptedLine::new("tiny-b", "only", "solo", "second thing"),
            ],
            openings: vec![],
            coaching_templates: vec![],
        };
        let config = PolicyConfig::default();
        // Both lines used and visible in history, so every pool collapses to
        // the full slot; the guard must still avoid the tail of `used`.
        let memory = PolicyMemory {
            used_line_ids: vec!["tiny-a".to_string(), "tiny-b".to_string()],
            ..PolicyMemory::default()
        };
        let history = vec![
            history_turn(0, Role::Counterpart, "first thing"),
            history_turn(2, Role::Counterpart, "second thing"),
        ];

        let sel =
            select_next_line(&pack, &memory, "go on", &history, &config, "c1|3").unwrap();
        assert_ne!(sel.line.line_id, "tiny-b");
    }

    #[test]
    fn test_single_line_pack_accepts_repeat() {
        let pack = CategoryPack {
            category_id: "one".to_string(),
            name: "One".to_string(),
            objective: String::new(),
            intents: vec![IntentNode::new("only", &["solo"])],
            lines: vec![ScriptedLine::new("solo-1", "only", "solo", "the only line")],
            openings: vec![],
            coaching_templates: vec![],
        };
        let memory = PolicyMemory {
            used_line_ids: vec!["solo-1".to_string()],
            ..PolicyMemory::default()
        };

        let sel = select_next_line(
            &pack,
            &memory,
            "anything",
            &[],
            &PolicyConfig::default(),
            "c1|2",
        )
        .unwrap();
        assert_eq!(sel.line.line_id, "solo-1");
    }

    #[test]
    fn test_used_lines_capped_most_recent_kept() {
        let pack = objections();
        let config = PolicyConfig {
            used_line_cap: 3,
            ..PolicyConfig::default()
        };
        let memory = PolicyMemory {
            used_line_ids: vec!["x1".to_string(), "x2".to_string(), "x3".to_string()],
            ..PolicyMemory::default()
        };

        let sel =
            select_next_line(&pack, &memory, "tell me more", &[], &config, "c1|4").unwrap();
        assert_eq!(sel.memory.used_line_ids.len(), 3);
        assert!(!sel.memory.used_line_ids.contains(&"x1".to_string()));
        assert_eq!(
            sel.memory.used_line_ids.last().map(String::as_str),
            Some(sel.line.line_id.as_str())
        );
    }

    #[test]
    fn test_empty_pack_is_an_error() {
        let pack = CategoryPack {
            category_id: "void".to_string(),
            name: "Void".to_string(),
            objective: String::new(),
            intents: vec![],
            lines: vec![],
            openings: vec![],
            coaching_templates: vec![],
        };
        let result = select_next_line(
            &pack,
            &PolicyMemory::default(),
            "hello",
            &[],
            &PolicyConfig::default(),
            "c1|1",
        );
        assert!(matches!(result, Err(SparError::Config(_))));
    }

    #[test]
    fn test_opening_pick_is_stable() {
        for pack in builtin_packs() {
            let a = pick_opening(&pack, "conv-seed").map(|o| o.line_id.clone());
            let b = pick_opening(&pack, "conv-seed").map(|o| o.line_id.clone());
            assert!(a.is_some());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_opening_memory_points_at_slot() {
        let pack = objections();
        let opening = pack
            .openings
            .iter()
            .find(|o| o.line_id == "obj-open-02")
            .unwrap();
        let memory = PolicyMemory::for_opening(&pack, opening);
        assert_eq!(memory.intent_index, 1);
        assert_eq!(memory.angle_index, 1);
        assert_eq!(memory.used_line_ids, vec!["obj-open-02".to_string()]);
    }

    #[test]
    fn test_memory_value_round_trip() {
        let memory = PolicyMemory {
            intent_index: 2,
            angle_index: 1,
            same_intent_rounds: 3,
            stagnation_count: 1,
            used_line_ids: vec!["a".to_string()],
            last_signal: "price".to_string(),
        };
        let restored = PolicyMemory::from_value(&memory.to_value());
        assert_eq!(restored, memory);

        let garbage = serde_json::json!("not an object");
        assert_eq!(PolicyMemory::from_value(&garbage), PolicyMemory::default());
        assert_eq!(
            PolicyMemory::from_value(&serde_json::Value::Null),
            PolicyMemory::default()
        );
    }
}
