//! Funnel state space: (stage, category) touch states plus the Start,
//! Conversion and Null sentinels.
//!
//! State identity is a structured pair, never a concatenated string, so a
//! category containing a separator character can never collide with a
//! composed key.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::errors::AttributionError;
use crate::paths::Path;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Start,
    /// One funnel-stage event tagged with a normalized category.
    Touch { stage: String, category: String },
    Conversion,
    Null,
}

impl State {
    pub fn touch(stage: &str, category: &str) -> Self {
        State::Touch {
            stage: stage.to_string(),
            category: category.to_string(),
        }
    }

    pub fn is_absorbing(&self) -> bool {
        matches!(self, State::Conversion | State::Null)
    }

    /// Display label for reports and logs. Formatting only; identity stays
    /// the structured pair.
    pub fn label(&self) -> String {
        match self {
            State::Start => "Start".to_string(),
            State::Conversion => "Conversion".to_string(),
            State::Null => "Null".to_string(),
            State::Touch { stage, category } => format!("{}::{}", stage, category),
        }
    }
}

/// Deterministic indexing of every state observed in one analysis run.
///
/// Start is index 0, Conversion and Null are the last two indices, and touch
/// states are ordered by first-seen stage order, then lexicographically by
/// category within a stage. Rebuilt per run; nothing persists across runs.
#[derive(Debug, Clone)]
pub struct StateSpace {
    states: Vec<State>,
    index: HashMap<State, usize>,
    category_states: HashMap<String, Vec<usize>>,
    stage_order: Vec<String>,
}

impl StateSpace {
    pub fn from_paths(paths: &[Path], cfg: &Config) -> Result<Self, AttributionError> {
        if paths.is_empty() {
            return Err(AttributionError::EmptyStateSpace);
        }

        // First-seen stage order across all paths, then per-stage category sets.
        let mut stage_order: Vec<String> = Vec::new();
        let mut stage_cats: HashMap<String, Vec<String>> = HashMap::new();
        for path in paths {
            for state in &path.states {
                if let State::Touch { stage, category } = state {
                    let cats = stage_cats.entry(stage.clone()).or_insert_with(|| {
                        stage_order.push(stage.clone());
                        Vec::new()
                    });
                    if !cats.contains(category) {
                        cats.push(category.clone());
                    }
                }
            }
        }

        // A single-visit path covers at most every declared stage plus the
        // two end sentinels; a minimum bound above that can never be met.
        if stage_order.len() + 2 < cfg.min_path_length {
            return Err(AttributionError::Configuration(format!(
                "funnel has {} observed stages but min_path_length is {}",
                stage_order.len(),
                cfg.min_path_length
            )));
        }

        let mut states = vec![State::Start];
        for stage in &stage_order {
            let mut cats = stage_cats.remove(stage).unwrap_or_default();
            cats.sort();
            for cat in cats {
                states.push(State::touch(stage, &cat));
            }
        }
        states.push(State::Conversion);
        states.push(State::Null);

        let mut index = HashMap::with_capacity(states.len());
        let mut category_states: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, state) in states.iter().enumerate() {
            index.insert(state.clone(), i);
            if let State::Touch { category, .. } = state {
                category_states.entry(category.clone()).or_default().push(i);
            }
        }

        Ok(Self {
            states,
            index,
            category_states,
            stage_order,
        })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, idx: usize) -> &State {
        &self.states[idx]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn index_of(&self, state: &State) -> Option<usize> {
        self.index.get(state).copied()
    }

    pub fn start_index(&self) -> usize {
        0
    }

    pub fn conversion_index(&self) -> usize {
        self.states.len() - 2
    }

    pub fn null_index(&self) -> usize {
        self.states.len() - 1
    }

    /// State indices carrying a given category value, in index order.
    pub fn category_states(&self, category: &str) -> &[usize] {
        self.category_states
            .get(category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Funnel stages in first-seen order.
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }
}
