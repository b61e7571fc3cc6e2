//! Per-server parameter store.
//!
//! Parameters are constants grouped by server namespace, usually loaded from a
//! YAML file shaped as `{ server: { name: value } }`. Callers layer run-time
//! overrides on top with [`ParameterStore::merge`]; an override replaces the
//! whole value of its key and may introduce keys the file did not declare.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant values keyed by server, then by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterStore {
    namespaces: IndexMap<String, IndexMap<String, Value>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML (or JSON) parameter document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("parameter document must map server names to parameter tables")
    }

    /// Loads a parameter file from disk.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read parameter file: {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Failed to parse parameter file: {}", path.display()))
    }

    pub fn get(&self, server: &str, name: &str) -> Option<&Value> {
        self.namespaces.get(server).and_then(|namespace| namespace.get(name))
    }

    pub fn contains(&self, server: &str, name: &str) -> bool {
        self.get(server, name).is_some()
    }

    pub fn namespace(&self, server: &str) -> Option<&IndexMap<String, Value>> {
        self.namespaces.get(server)
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Inserts or replaces a single parameter.
    pub fn set(&mut self, server: &str, name: &str, value: Value) {
        self.namespaces
            .entry(server.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Applies `overrides` key by key; override values win.
    pub fn merge(&mut self, overrides: &ParameterStore) {
        for (server, namespace) in &overrides.namespaces {
            let target = self.namespaces.entry(server.clone()).or_default();
            for (name, value) in namespace {
                target.insert(name.clone(), value.clone());
            }
        }
    }

    /// Returns a merged copy, leaving `self` untouched.
    pub fn merged(&self, overrides: &ParameterStore) -> Self {
        let mut merged = self.clone();
        merged.merge(overrides);
        merged
    }
}
