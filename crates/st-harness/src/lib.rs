#![forbid(unsafe_code)]
//! Scenario runner, stress driver and activity-log inspector for synctrack.

pub mod inspect;
pub mod scenario;
pub mod stress;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use synctrack::DeviceConfig;

pub use st_types::Xorshift;

/// One named expectation of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

impl Check {
    #[must_use]
    pub fn equal<T: PartialEq + Debug>(name: &str, expected: T, actual: T) -> Self {
        Self {
            name: name.to_owned(),
            passed: expected == actual,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    #[must_use]
    pub fn holds(name: &str, condition: bool, actual: impl Debug) -> Self {
        Self {
            name: name.to_owned(),
            expected: "true".to_owned(),
            actual: format!("{actual:?}"),
            passed: condition,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub description: String,
    pub checks: Vec<Check>,
    pub passed: bool,
    /// Scenario-specific counters.
    pub details: serde_json::Value,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(
        scenario: &str,
        description: &str,
        checks: Vec<Check>,
        details: serde_json::Value,
    ) -> Self {
        let passed = checks.iter().all(|c| c.passed);
        Self {
            scenario: scenario.to_owned(),
            description: description.to_owned(),
            checks,
            passed,
            details,
        }
    }
}

/// Load a [`DeviceConfig`] from a JSON file. Missing fields take their
/// defaults.
pub fn load_config(path: &Path) -> Result<DeviceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: DeviceConfig = serde_json::from_str(&text)
        .with_context(|| format!("invalid config json {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("rejected config {}", path.display()))?;
    Ok(config)
}
