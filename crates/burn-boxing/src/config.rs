use alloc::string::String;
use alloc::vec::Vec;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Configuration of the [`BoxingInterpreter`](crate::BoxingInterpreter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxingConfig {
    /// Remember each rule's decision per pair of placed layouts.
    pub memoize_checks: bool,
    /// Names of rules that are never selected. The identity rule cannot be disabled.
    pub disabled_rules: Vec<String>,
    /// Reject split axes outside the logical rank before any rule runs.
    pub validate_split_axes: bool,
}

impl Default for BoxingConfig {
    fn default() -> Self {
        Self {
            memoize_checks: true,
            disabled_rules: Vec::new(),
            validate_split_axes: true,
        }
    }
}

impl BoxingConfig {
    /// Parses a configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Disables the rule named `rule`.
    pub fn with_disabled_rule<S: Into<String>>(mut self, rule: S) -> Self {
        self.disabled_rules.push(rule.into());
        self
    }

    /// Whether the rule named `rule` is disabled.
    pub fn is_disabled(&self, rule: &str) -> bool {
        self.disabled_rules.iter().any(|name| name == rule)
    }
}
