//! The counterpart's brain
//!
//! Everything the simulated counterpart says comes out of here: the scripted
//! content packs, the signal patterns read off the operator's transcript, the
//! deterministic next-line selection with its loop guard, and the optional
//! generative rewrite that fails open to the script. The engine is pure: it
//! takes the conversation's policy memory and hands back a new one, and the
//! caller persists it.

pub mod features;
pub mod pack;
pub mod rewrite;
pub mod select;
pub mod signals;

pub use features::turn_features;
pub use pack::{CategoryPack, CoachingTemplate, IntentNode, OpeningLine, PackLibrary, ScriptedLine};
pub use rewrite::{LineRewriter, RewriteGate, RewrittenLine};
pub use select::{pick_opening, select_next_line, LineSelection, PolicyMemory};
pub use signals::{extract_signal, quick_hash};
