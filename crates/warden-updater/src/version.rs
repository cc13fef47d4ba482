//! Version ordering for free-form application version strings.
//!
//! Application versions seen in appcasts, registries and release tags are
//! not reliably semver, so ordering is component-wise: strings are trimmed,
//! a leading `v`/`V` is stripped, and the remainder is split on `.` and `-`.
//! Each pair of components compares numerically when both sides are
//! integers and case-insensitively as text otherwise. A missing trailing
//! component counts as `0` against a numeric one and as the empty string
//! otherwise, so `2.0` and `2.0.0` are equal.
//!
//! Malformed input never fails; it just degrades to text comparison.

use std::cmp::Ordering;

/// Strip surrounding whitespace and a single leading `v`/`V`.
pub fn normalize(version: &str) -> &str {
    let trimmed = version.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
}

fn components(version: &str) -> Vec<&str> {
    normalize(version).split(['.', '-']).collect()
}

fn compare_component(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.to_lowercase().cmp(&b.to_lowercase()),
        },
        (Some(a), None) => pad_against(a).reverse(),
        (None, Some(b)) => pad_against(b),
        (None, None) => Ordering::Equal,
    }
}

/// Ordering of the implicit padding component relative to `present`.
fn pad_against(present: &str) -> Ordering {
    match present.parse::<u64>() {
        Ok(n) => 0u64.cmp(&n),
        Err(_) => "".cmp(present.to_lowercase().as_str()),
    }
}

/// Total ordering of two version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let ord = compare_component(left.get(i).copied(), right.get(i).copied());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Returns true iff `candidate` orders strictly after `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}
