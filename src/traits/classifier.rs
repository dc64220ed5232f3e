//! Model classification resolver.

use std::collections::HashMap;

use crate::types::ModelClassification;

/// Maps a caller-facing model id (e.g. `gpt-4o`) onto a quota tier.
pub trait ClassificationResolver: Send + Sync + std::fmt::Debug {
    fn classify(&self, model_id: &str) -> Option<ModelClassification>;
}

/// A resolver backed by a fixed table.
///
/// Exact ids win; otherwise the longest configured id that prefixes the requested one is used,
/// so `gpt-4o` also covers dated snapshots such as `gpt-4o-2024-08-06`.
#[derive(Debug, Clone, Default)]
pub struct StaticClassifier {
    table: HashMap<String, ModelClassification>,
}

impl StaticClassifier {
    pub fn new(table: HashMap<String, ModelClassification>) -> Self {
        Self { table }
    }

    pub fn with(mut self, model_id: impl Into<String>, class: ModelClassification) -> Self {
        self.table.insert(model_id.into(), class);
        self
    }
}

impl ClassificationResolver for StaticClassifier {
    fn classify(&self, model_id: &str) -> Option<ModelClassification> {
        if let Some(class) = self.table.get(model_id) {
            return Some(*class);
        }
        self.table
            .iter()
            .filter(|(id, _)| model_id.starts_with(id.as_str()))
            .max_by_key(|(id, _)| id.len())
            .map(|(_, class)| *class)
    }
}
