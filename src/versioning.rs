//! Hand-rolled tolerant version comparison for the early-update service.
//!
//! The spec's comparison tolerates inputs the `semver` crate rejects
//! outright (a bare `"5"`, `"1.0"`, build metadata dropped rather than
//! compared), so this is a purpose-built parser rather than a wrapper
//! around `semver::Version`.

use std::cmp::Ordering;

/// A tolerantly-parsed version: numeric components plus an optional
/// prerelease tail, with any `+build` metadata discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    pub components: Vec<u64>,
    pub prerelease: Option<String>,
}

impl ParsedVersion {
    /// Parse per the spec's algorithm: strip a leading `v`/`V`, strip
    /// `+build` metadata, split on `-` for the prerelease tail, then parse
    /// dot-separated numeric components. Non-parseable input (no numeric
    /// components at all) yields `0.0.0`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let without_prefix = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let without_build = without_prefix.split('+').next().unwrap_or("");

        let (core, prerelease) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (without_build, None),
        };

        let components: Vec<u64> = core
            .split('.')
            .map(|part| part.trim().parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()
            .unwrap_or_default();

        if components.is_empty() {
            return Self {
                components: vec![0, 0, 0],
                prerelease: None,
            };
        }

        Self {
            components,
            prerelease,
        }
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl Ord for ParsedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..3 {
            match self.component(i).cmp(&other.component(i)) {
                Ordering::Equal => continue,
                other_ordering => return other_ordering,
            }
        }

        // Absent prerelease beats any prerelease.
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ParsedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// True iff `candidate` is strictly newer than `current`, per the
/// tolerant comparison algorithm.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    ParsedVersion::parse(candidate) > ParsedVersion::parse(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_v_prefix_and_build_metadata() {
        let parsed = ParsedVersion::parse("v1.2.3+build.7");
        assert_eq!(parsed.components, vec![1, 2, 3]);
        assert!(parsed.prerelease.is_none());
    }

    #[test]
    fn tolerates_partial_and_bare_numeric_versions() {
        assert_eq!(ParsedVersion::parse("1.0").components, vec![1, 0]);
        assert_eq!(ParsedVersion::parse("5").components, vec![5]);
    }

    #[test]
    fn non_parseable_version_compares_as_zero_zero_zero() {
        let parsed = ParsedVersion::parse("not-a-version!!");
        assert_eq!(parsed.components, vec![0, 0, 0]);
    }

    #[test]
    fn absent_prerelease_beats_any_prerelease() {
        assert!(is_newer("1.0.0", "1.0.0-rc.1"));
        assert!(!is_newer("1.0.0-rc.1", "1.0.0"));
    }

    #[test]
    fn prerelease_tail_compares_lexicographically() {
        assert!(is_newer("1.0.0-rc.2", "1.0.0-rc.1"));
    }

    #[test]
    fn isnewer_is_transitive_and_irreflexive() {
        let a = "1.0.0";
        let b = "1.5.0";
        let c = "2.0.0";
        assert!(is_newer(b, a));
        assert!(is_newer(c, b));
        assert!(is_newer(c, a));
        assert!(!is_newer(a, a));
    }

    #[test]
    fn scenario_six_registry_version_is_detected_as_newer() {
        assert!(is_newer("2.0.0", "1.0.0"));
    }
}
