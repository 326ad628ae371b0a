//! Unit files: the command under test, its trial inputs, and the
//! definition its identity is derived from.
//!
//! ```toml
//! namespace = "explorer"
//! command = "python3 solve.py"
//! inputs = ["1", "2", "3"]
//!
//! [definition]
//! source = "solve.py"
//! version = 3
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::identity::{UnitDefinition, DEFAULT_NAMESPACE};

/// A unit submitted for certification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Unit {
    /// Namespace the identity is derived in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Shell command run inside the chamber.
    pub command: String,
    /// Trial inputs, each delivered as `input.txt` to a fresh chamber.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Additional identity payload (source hash, version, declared traits).
    #[serde(default = "empty_definition")]
    pub definition: toml::Table,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

fn empty_definition() -> toml::Table {
    toml::Table::new()
}

impl Unit {
    /// Build a unit with an empty definition table.
    pub fn new(command: impl Into<String>, inputs: Vec<String>) -> Self {
        Self {
            namespace: default_namespace(),
            command: command.into(),
            inputs,
            definition: empty_definition(),
        }
    }

    /// Load a unit from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid unit.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read unit at {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid unit at {}", path.display()))
    }

    /// Parse a unit from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or `command` is empty.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let unit: Self = toml::from_str(toml_str).context("failed to parse unit TOML")?;
        if unit.command.trim().is_empty() {
            anyhow::bail!("unit command must not be empty");
        }
        Ok(unit)
    }

    /// Canonical definition: the command plus the `[definition]` table.
    ///
    /// Trial inputs are not part of identity.
    pub fn definition(&self) -> UnitDefinition {
        let definition = serde_json::to_value(&self.definition)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
        UnitDefinition::new(
            self.namespace.clone(),
            serde_json::json!({
                "command": self.command,
                "definition": definition,
            }),
        )
    }
}
