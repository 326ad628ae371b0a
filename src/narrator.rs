//! Human-readable trait labels for diagnostic output.
//!
//! The orchestrator only uses this to make its log lines readable; a
//! [`SilentNarrator`] can be swapped in without changing any verdict.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::metrics::TraitVector;

/// Display label and description for one trait.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TraitLabel {
    /// Short label, e.g. "Speed (ms)".
    pub label: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
}

impl TraitLabel {
    /// Build a label.
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
        }
    }
}

/// Source of trait labels.
pub trait TraitNarrator: Send + Sync {
    /// Label for `name`, or `None` to fall back to the raw trait key.
    fn describe(&self, name: &str) -> Option<TraitLabel>;

    /// Render `"<label>: <value>"` for one trait.
    fn render(&self, name: &str, value: f64) -> String {
        match self.describe(name) {
            Some(entry) if entry.description.is_empty() => format!("{}: {value}", entry.label),
            Some(entry) => format!("{}: {value} ({})", entry.label, entry.description),
            None => format!("{name}: {value}"),
        }
    }

    /// Render every trait of a vector, in key order.
    fn explain(&self, traits: &TraitVector) -> Vec<String> {
        traits
            .iter()
            .map(|(name, value)| self.render(name, *value))
            .collect()
    }
}

/// Narrator that never labels anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentNarrator;

impl TraitNarrator for SilentNarrator {
    fn describe(&self, _name: &str) -> Option<TraitLabel> {
        None
    }
}

/// Table-driven narrator, usually loaded from the `[traits]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TraitTable {
    entries: BTreeMap<String, TraitLabel>,
}

impl TraitTable {
    /// Build a table from explicit entries.
    pub fn new(entries: BTreeMap<String, TraitLabel>) -> Self {
        Self { entries }
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, name: impl Into<String>, label: TraitLabel) {
        self.entries.insert(name.into(), label);
    }

    /// Number of labelled traits.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TraitTable {
    /// Labels for the traits the chamber measures.
    fn default() -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
        };
        table.insert(
            "speed_ms",
            TraitLabel::new("Speed (ms)", "How fast did it run?"),
        );
        table.insert(
            "memory_mb",
            TraitLabel::new("Memory (MB)", "How much memory did it use?"),
        );
        table.insert(
            "reliability",
            TraitLabel::new("Reliability", "Did it finish within its time limit?"),
        );
        table
    }
}

impl TraitNarrator for TraitTable {
    fn describe(&self, name: &str) -> Option<TraitLabel> {
        self.entries.get(name).cloned()
    }
}
