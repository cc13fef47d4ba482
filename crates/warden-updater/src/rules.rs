//! Known-incompatibility registry.
//!
//! Rules are loaded from a list bundled with the crate and can be replaced
//! by a remote JSON document with the same schema. A failed refresh keeps
//! the previously loaded list untouched. Readers take a cheap snapshot, so
//! a refresh never changes the rules seen by an evaluation in progress.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::download::Downloader;
use crate::error::UpdateError;
use crate::model::InstalledApplication;

/// Rules shipped with the crate.
const BUNDLED_RULES: &str = include_str!("../rules/incompatibilities.json");

/// Marker in `affected_versions` matching every installed version.
pub const ALL_VERSIONS: &str = "*";

/// Severity of a known incompatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RuleSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One known incompatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatibilityRule {
    /// Exact application identifiers
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Case-insensitive substrings of the display name
    #[serde(default)]
    pub name_patterns: Vec<String>,
    /// Installed versions affected, or `["*"]`
    pub affected_versions: Vec<String>,
    #[serde(default)]
    pub fixed_in: Option<String>,
    pub severity: RuleSeverity,
    pub reason: String,
}

impl IncompatibilityRule {
    /// Whether the rule names this application.
    pub fn matches_application(&self, app: &InstalledApplication) -> bool {
        if self.identifiers.iter().any(|id| id == &app.identifier) {
            return true;
        }
        let name = app.name.to_lowercase();
        self.name_patterns
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| name.contains(&pattern.to_lowercase()))
    }

    /// Whether the installed version is listed (literally) or wildcarded.
    pub fn affects_version(&self, installed: &str) -> bool {
        self.affected_versions
            .iter()
            .any(|v| v == ALL_VERSIONS || v == installed)
    }

    pub fn applies_to(&self, app: &InstalledApplication) -> bool {
        self.matches_application(app) && self.affects_version(&app.version)
    }
}

/// Parse a JSON rule list.
pub fn parse_rules(json: &str) -> Result<Vec<IncompatibilityRule>, UpdateError> {
    Ok(serde_json::from_str(json)?)
}

/// Shared, refreshable rule list.
#[derive(Debug)]
pub struct RuleRegistry {
    rules: RwLock<Arc<[IncompatibilityRule]>>,
}

impl RuleRegistry {
    pub fn new(rules: Vec<IncompatibilityRule>) -> Self {
        Self {
            rules: RwLock::new(rules.into()),
        }
    }

    /// Registry seeded with the bundled list.
    pub fn bundled() -> Result<Self, UpdateError> {
        Ok(Self::new(parse_rules(BUNDLED_RULES)?))
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Current rules.
    pub fn snapshot(&self) -> Arc<[IncompatibilityRule]> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the rule list.
    pub fn replace(&self, rules: Vec<IncompatibilityRule>) {
        *self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rules.into();
    }

    /// Replace the list from a JSON document, keeping the old list on error.
    pub fn refresh_from_json(&self, json: &str) -> Result<usize, UpdateError> {
        let rules = parse_rules(json)?;
        let count = rules.len();
        self.replace(rules);
        Ok(count)
    }

    /// Fetch `url` and replace the list, keeping the old list on any failure.
    pub async fn refresh(&self, downloader: &Downloader, url: &str) -> Result<usize, UpdateError> {
        let result = match downloader.fetch(url).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|e| UpdateError::ConfigError(format!("rules are not UTF-8: {e}")))
                .and_then(|json| self.refresh_from_json(&json)),
            Err(e) => Err(e),
        };

        match &result {
            Ok(count) => info!(url, count, "Refreshed incompatibility rules"),
            Err(e) => warn!(url, error = %e, "Rule refresh failed, keeping current list"),
        }
        result
    }
}
