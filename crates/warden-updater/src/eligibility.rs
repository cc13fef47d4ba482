//! Compatibility and policy filtering of update candidates.
//!
//! Each candidate is classified against the incompatibility registry and a
//! couple of heuristics, in this order:
//! 1. a rule names the application and lists its installed version (or
//!    `*`): incompatible
//! 2. the candidate version carries a pre-release marker: risky
//! 3. the installed bundle has not been modified for two years: risky
//! 4. otherwise compatible
//!
//! [`EligibilityFilter::apply`] turns verdicts into list edits: incompatible
//! candidates are dropped, risky ones are kept with `is_compatible` cleared,
//! and the user's ignore/pin policy is applied on top.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{InstalledApplication, UpdateCandidate};
use crate::rules::RuleRegistry;

/// Age after which an untouched bundle is considered abandoned.
pub const STALE_AFTER_DAYS: i64 = 730;

/// Version markers that denote a pre-release build.
const PRERELEASE_MARKERS: &[&str] = &["alpha", "beta", "rc", "preview", "dev", "nightly"];

/// Classification of one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Compatible,
    Risky {
        reason: String,
    },
    Incompatible {
        reason: String,
        fixed_in: Option<String>,
    },
}

impl Verdict {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible)
    }

    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible { .. })
    }
}

/// User policy consumed read-only by the filter and the background step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub security_only: bool,
    /// Identifier -> pinned version, compared as exact strings
    pub pins: BTreeMap<String, String>,
    pub ignored: BTreeSet<String>,
}

impl UpdatePolicy {
    /// Whether policy suppresses this candidate.
    pub fn suppresses(&self, candidate: &UpdateCandidate) -> bool {
        let id = candidate.identifier();
        if self.ignored.contains(id) {
            return true;
        }
        match self.pins.get(id) {
            Some(pinned) => pinned == &candidate.version,
            None => false,
        }
    }
}

/// Evaluates candidates against the rule registry and policy.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    registry: Arc<RuleRegistry>,
    stale_after: Duration,
}

impl EligibilityFilter {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            stale_after: Duration::days(STALE_AFTER_DAYS),
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Classify `candidate` for `app` as of now.
    pub fn evaluate(&self, app: &InstalledApplication, candidate: &UpdateCandidate) -> Verdict {
        self.evaluate_at(app, candidate, Utc::now())
    }

    /// Classify `candidate` for `app` as of `now`.
    pub fn evaluate_at(
        &self,
        app: &InstalledApplication,
        candidate: &UpdateCandidate,
        now: DateTime<Utc>,
    ) -> Verdict {
        let rules = self.registry.snapshot();
        if let Some(rule) = rules.iter().find(|rule| rule.applies_to(app)) {
            return Verdict::Incompatible {
                reason: rule.reason.clone(),
                fixed_in: rule.fixed_in.clone(),
            };
        }

        if let Some(marker) = prerelease_marker(&candidate.version) {
            return Verdict::Risky {
                reason: format!("{} is a pre-release build ({marker})", candidate.version),
            };
        }

        if let Some(modified) = app.last_modified {
            if now - modified > self.stale_after {
                return Verdict::Risky {
                    reason: format!(
                        "{} has not been modified since {}",
                        app.name,
                        modified.format("%Y-%m-%d")
                    ),
                };
            }
        }

        Verdict::Compatible
    }

    /// Apply verdicts and policy to a candidate list.
    pub fn apply(&self, candidates: Vec<UpdateCandidate>, policy: &UpdatePolicy) -> Vec<UpdateCandidate> {
        self.apply_at(candidates, policy, Utc::now())
    }

    pub fn apply_at(
        &self,
        candidates: Vec<UpdateCandidate>,
        policy: &UpdatePolicy,
        now: DateTime<Utc>,
    ) -> Vec<UpdateCandidate> {
        candidates
            .into_iter()
            .filter_map(|mut candidate| {
                let id = candidate.identifier().to_string();
                if policy.suppresses(&candidate) {
                    debug!(app = %id, version = %candidate.version, "Suppressed by pin/ignore policy");
                    return None;
                }

                match self.evaluate_at(&candidate.application, &candidate, now) {
                    Verdict::Compatible => Some(candidate),
                    Verdict::Risky { reason } => {
                        info!(app = %id, %reason, "Flagging risky update");
                        candidate.is_compatible = false;
                        Some(candidate)
                    }
                    Verdict::Incompatible { reason, fixed_in } => {
                        info!(app = %id, %reason, ?fixed_in, "Dropping incompatible update");
                        None
                    }
                }
            })
            .collect()
    }
}

/// The pre-release marker carried by `version`, if any.
pub fn prerelease_marker(version: &str) -> Option<&'static str> {
    let lower = version.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for token in &tokens {
        let word = token.trim_start_matches(|c: char| c.is_ascii_digit());
        if let Some(marker) = PRERELEASE_MARKERS.iter().find(|m| word.starts_with(*m)) {
            return Some(marker);
        }
    }

    // A dash followed by a word, e.g. "3.1-b2" or "1.0-pre"
    lower
        .split('-')
        .skip(1)
        .any(|suffix| suffix.starts_with(|c: char| c.is_ascii_alphabetic()))
        .then_some("pre-release suffix")
}
