//! Macro configuration store.
//!
//! Persists user-defined G-code macros as a JSON document. The controllers
//! resolve `loadmacro` commands against this store; unknown ids surface as
//! command errors, never as controller failures.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// A stored G-code macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    /// Stable id used by `loadmacro`
    pub id: String,
    /// Display name
    pub name: String,
    /// G-code content
    pub content: String,
}

impl Macro {
    /// Create a macro with a freshly generated id
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            content: content.into(),
        }
    }
}

/// JSON-backed macro store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroConfig {
    /// All stored macros, in user-defined order
    #[serde(default)]
    pub macros: Vec<Macro>,
}

impl MacroConfig {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::other(format!("Invalid macro config {}: {}", path.display(), e)))
    }

    /// Save the store to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::other(format!("Failed to serialize macro config: {}", e)))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Look up a macro by id
    pub fn find(&self, id: &str) -> Option<&Macro> {
        self.macros.iter().find(|m| m.id == id)
    }

    /// Add a macro, returning its id
    pub fn add(&mut self, m: Macro) -> String {
        let id = m.id.clone();
        self.macros.push(m);
        id
    }

    /// Remove a macro by id, returning whether it existed
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.macros.len();
        self.macros.retain(|m| m.id != id);
        self.macros.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_and_remove() {
        let mut config = MacroConfig::new();
        let id = config.add(Macro::new("probe", "G38.2 Z-10 F50"));
        assert_eq!(config.find(&id).unwrap().name, "probe");
        assert!(config.remove(&id));
        assert!(config.find(&id).is_none());
        assert!(!config.remove(&id));
    }

    #[test]
    fn file_round_trip() {
        let mut config = MacroConfig::new();
        config.add(Macro::new("zero", "G92 X0 Y0 Z0"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macros.json");
        config.save_to_file(&path).unwrap();

        let loaded = MacroConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_fields_default() {
        let loaded: MacroConfig = serde_json::from_str("{}").unwrap();
        assert!(loaded.macros.is_empty());
    }
}
