//! Per-plan observation store.
//!
//! Observations are completed step results, recorded in completion order.
//! The store is append-only within a plan; re-planning archives the whole
//! store and starts fresh so step indices never collide across plans.

use serde::{Deserialize, Serialize};

/// A completed step's recorded result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Index of the step in the plan this result came from
    pub step_index: usize,

    /// Step title at recording time, for report rendering
    pub title: String,

    pub content: String,
}

impl Observation {
    pub fn new(step_index: usize, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            step_index,
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Completion-ordered store of observations for the active plan
#[derive(Debug, Clone, Default)]
pub struct ObservationStore {
    entries: Vec<Observation>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, observation: Observation) {
        self.entries.push(observation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in completion order
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.entries.iter()
    }

    /// Most recent observation for a given step index
    pub fn by_index(&self, step_index: usize) -> Option<&Observation> {
        self.entries
            .iter()
            .rev()
            .find(|o| o.step_index == step_index)
    }

    /// Entries sorted by step index, for deterministic report output
    pub fn sorted_by_index(&self) -> Vec<&Observation> {
        let mut sorted: Vec<&Observation> = self.entries.iter().collect();
        sorted.sort_by_key(|o| o.step_index);
        sorted
    }

    /// Drain all entries, leaving the store empty
    pub fn take_all(&mut self) -> Vec<Observation> {
        std::mem::take(&mut self.entries)
    }
}
