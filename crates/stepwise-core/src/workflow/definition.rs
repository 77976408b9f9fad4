//! Definition files: YAML/JSON parsing and filesystem operations.
//!
//! Definitions are authored as YAML (or JSON, which is valid YAML) and map
//! one-to-one onto `WorkflowDefinition`. Parsing only checks that the file
//! deserializes; structural checks live in the validator.

use std::path::{Path, PathBuf};

use stepwise_types::definition::WorkflowDefinition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON) document into a definition.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Serialize(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition from a `.yaml`, `.yml` or `.json` file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(&content).map_err(|e| DefinitionError::Parse(e.to_string()));
    }
    parse_definition_yaml(&content)
}

/// Save a definition as YAML, creating parent directories.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover definition files under `base_dir`, recursively, sorted by path.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_definitions(base_dir: &Path) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, WorkflowDefinition)>) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_definition = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json");
        if !is_definition {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable definition file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
