//! Comparison of two fingerprint snapshots.

use std::collections::BTreeSet;

use super::snapshot::FingerprintMap;

/// Outcome of comparing a new snapshot against an old one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Paths that are new, or present in both with a different digest.
    pub changed: BTreeSet<String>,
    /// Paths present only in the old snapshot.
    pub removed: BTreeSet<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Every path mentioned by the diff, changed first.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changed
            .iter()
            .chain(self.removed.iter())
            .map(String::as_str)
    }
}

/// Compare `new` against `old`.
pub fn diff(new: &FingerprintMap, old: &FingerprintMap) -> Diff {
    let changed = new
        .iter()
        .filter(|(path, digest)| old.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect();
    let removed = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .cloned()
        .collect();
    Diff { changed, removed }
}
