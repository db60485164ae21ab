//! Generative provider access for Spar
//!
//! Everything generative goes through one chat-completions client: the
//! occasional scripted-line rewrite and the per-turn coaching analysis.
//! Both call sites are fail-open, so this crate reports errors and lets
//! the pipeline decide what a failure costs.

pub mod client;

pub use client::{ChatClient, ChatMessage};
