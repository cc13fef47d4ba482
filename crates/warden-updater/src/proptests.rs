//! Property-based tests for warden-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Version ordering is a consistent total order
//! - Property 2: Reconciliation yields one candidate per application
//! - Property 3: Eligibility filtering is idempotent
//! - Property 4: Wildcard rules affect every installed version
//! - Property 5: Backup and restore reproduce the original bytes

#![cfg(test)]

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use crate::checksum::ChecksumVerifier;
use crate::eligibility::{EligibilityFilter, UpdatePolicy};
use crate::model::{InstalledApplication, SourceKind, UpdateCandidate};
use crate::reconcile::dedup_candidates;
use crate::rollback::RollbackStore;
use crate::rules::{IncompatibilityRule, RuleRegistry, RuleSeverity};
use crate::version;

// =============================================================================
// Generators
// =============================================================================

/// Dotted numeric version with 1 to 4 components.
fn arb_numeric_version() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..50, 1..5)
}

fn render(parts: &[u64]) -> String {
    parts.iter().map(u64::to_string).collect::<Vec<_>>().join(".")
}

/// Free-form version strings, including junk.
fn arb_version_string() -> impl Strategy<Value = String> {
    prop_oneof![
        arb_numeric_version().prop_map(|v| render(&v)),
        "[vV]?[0-9]{1,3}(\\.[0-9]{1,3}){0,3}(-(beta|rc|alpha)[0-9]?)?",
        "[a-zA-Z0-9.\\- ]{0,12}",
    ]
}

fn arb_source() -> impl Strategy<Value = SourceKind> {
    prop_oneof![
        Just(SourceKind::Sparkle),
        Just(SourceKind::PackageRegistry),
        Just(SourceKind::ReleaseApi),
    ]
}

/// Candidates over a small identifier space so collisions are common.
fn arb_candidates() -> impl Strategy<Value = Vec<UpdateCandidate>> {
    prop::collection::vec(
        (0usize..4, arb_numeric_version(), arb_source(), any::<bool>()),
        0..24,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(app, version, source, security)| {
                let id = format!("com.example.app{app}");
                let installed = InstalledApplication::new(&id, format!("App {app}"), "0", format!("/A{app}.app"));
                let mut candidate = UpdateCandidate::new(installed, render(&version), "https://example.com/a.zip", source);
                candidate.is_security = security;
                candidate
            })
            .collect()
    })
}

/// Zero-padded tuple comparison, the reference for numeric versions.
fn reference_cmp(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0)))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn wildcard_rule() -> IncompatibilityRule {
    IncompatibilityRule {
        identifiers: vec!["com.example.app1".to_string()],
        name_patterns: vec![],
        affected_versions: vec!["*".to_string()],
        fixed_in: None,
        severity: RuleSeverity::Critical,
        reason: "unsupported".to_string(),
    }
}

// =============================================================================
// Property 1: Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Swapping the operands reverses the result.
    #[test]
    fn prop_compare_is_antisymmetric(a in arb_version_string(), b in arb_version_string()) {
        prop_assert_eq!(version::compare(&a, &b), version::compare(&b, &a).reverse());
    }

    #[test]
    fn prop_compare_is_reflexive(a in arb_version_string()) {
        prop_assert_eq!(version::compare(&a, &a), Ordering::Equal);
        prop_assert!(!version::is_newer(&a, &a));
    }

    /// Numeric versions order like zero-padded integer tuples.
    #[test]
    fn prop_numeric_versions_match_tuple_order(a in arb_numeric_version(), b in arb_numeric_version()) {
        prop_assert_eq!(version::compare(&render(&a), &render(&b)), reference_cmp(&a, &b));
    }

    #[test]
    fn prop_trailing_zero_and_prefix_are_insignificant(a in arb_numeric_version()) {
        let plain = render(&a);
        prop_assert_eq!(version::compare(&plain, &format!("{plain}.0")), Ordering::Equal);
        prop_assert_eq!(version::compare(&plain, &format!("v{plain}")), Ordering::Equal);
    }
}

// =============================================================================
// Property 2: Dedup uniqueness
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Each identifier survives exactly once, with its highest version.
    #[test]
    fn prop_dedup_keeps_one_highest_per_identifier(candidates in arb_candidates()) {
        let input_ids: HashSet<String> = candidates.iter().map(|c| c.identifier().to_string()).collect();
        let merged = dedup_candidates(candidates.clone());

        let output_ids: Vec<&str> = merged.iter().map(|c| c.identifier()).collect();
        let unique: HashSet<&str> = output_ids.iter().copied().collect();
        prop_assert_eq!(output_ids.len(), unique.len());
        prop_assert_eq!(unique.len(), input_ids.len());

        for survivor in &merged {
            for other in candidates.iter().filter(|c| c.identifier() == survivor.identifier()) {
                prop_assert_ne!(version::compare(&other.version, &survivor.version), Ordering::Greater);
            }
        }
    }
}

// =============================================================================
// Property 3: Filter idempotence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_filter_is_idempotent(candidates in arb_candidates(), security_only in any::<bool>(), ignore in 0usize..5) {
        let filter = EligibilityFilter::new(Arc::new(RuleRegistry::new(vec![wildcard_rule()])));
        let mut policy = UpdatePolicy { security_only, ..Default::default() };
        policy.ignored.insert(format!("com.example.app{ignore}"));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let once = filter.apply_at(candidates, &policy, now);
        let twice = filter.apply_at(once.clone(), &policy, now);
        prop_assert_eq!(once, twice);
    }
}

// =============================================================================
// Property 4: Wildcard rules
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_wildcard_rule_applies_to_any_version(installed in arb_version_string(), offered in arb_numeric_version()) {
        let rule = wildcard_rule();
        let app = InstalledApplication::new("com.example.app1", "App 1", installed, "/A1.app");
        prop_assert!(rule.applies_to(&app));

        let filter = EligibilityFilter::new(Arc::new(RuleRegistry::new(vec![rule])));
        let candidate = UpdateCandidate::new(app.clone(), render(&offered), "https://example.com/a.zip", SourceKind::Sparkle);
        prop_assert!(filter.evaluate(&app, &candidate).is_incompatible());
    }
}

// =============================================================================
// Property 5: Backup round trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Restoring a backup reproduces the bundle's bytes exactly.
    #[test]
    fn prop_restore_reproduces_original(
        files in prop::collection::btree_map("[a-z]{1,8}", prop::collection::vec(any::<u8>(), 0..2048), 1..6),
        replacement in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let temp = TempDir::new().unwrap();
        let bundle = temp.path().join("Editor.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();
        for (name, data) in &files {
            std::fs::write(bundle.join("Contents").join(name), data).unwrap();
        }
        let verifier = ChecksumVerifier::new();
        let original = verifier.hash(&bundle).unwrap();

        let store = RollbackStore::new(temp.path().join("backups"), 3);
        let record = store.create_backup("com.example.editor", "1.0", &bundle).unwrap();
        prop_assert_eq!(record.checksum().unwrap(), original);

        std::fs::remove_dir_all(&bundle).unwrap();
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("replaced"), &replacement).unwrap();

        store.restore(&record, &bundle).unwrap();
        prop_assert_eq!(verifier.hash(&bundle).unwrap(), original);
        for (name, data) in &files {
            prop_assert_eq!(&std::fs::read(bundle.join("Contents").join(name)).unwrap(), data);
        }
        prop_assert!(!bundle.join("replaced").exists());
    }
}
