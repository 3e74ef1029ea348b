// Diff engine: a pure function of (snapshot, seen, active) that
// never mutates any state. Mutation is the Supervisor's responsibility.

use std::collections::HashSet;

use crate::refs::{Ref, RefSnapshot, Sha};
use crate::seen::SeenCommits;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Diff {
    /// Refs to launch, in stable snapshot (source) order. Deduplicated by
    /// SHA: a snapshot with two refs pointing at the same unseen commit
    /// yields exactly one launch entry (the first in iteration order).
    pub to_launch: Vec<Ref>,
    /// SHAs of active builds no longer justified by the latest snapshot,
    /// because their ref moved or disappeared.
    pub to_cancel: Vec<Sha>,
}

pub fn compute_diff(
    snapshot: &RefSnapshot,
    seen: &SeenCommits,
    active_shas: &HashSet<Sha>,
) -> Diff {
    let mut to_launch = Vec::new();
    let mut launched_this_tick = HashSet::new();
    for r in snapshot {
        if !seen.contains(r.sha()) && launched_this_tick.insert(r.sha().clone()) {
            to_launch.push(r.clone());
        }
    }

    let live_shas: HashSet<&Sha> = snapshot.iter().map(Ref::sha).collect();
    let to_cancel = active_shas
        .iter()
        .filter(|sha| !live_shas.contains(sha))
        .cloned()
        .collect();

    Diff {
        to_launch,
        to_cancel,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn refs(pairs: &[(&str, &str)]) -> RefSnapshot {
        pairs
            .iter()
            .map(|(name, sha)| Ref::new(*name, *sha))
            .collect()
    }

    #[test]
    fn launches_unseen_refs_in_order() {
        let snapshot = refs(&[("refs/heads/a", "sha-a"), ("refs/heads/b", "sha-b")]);
        let seen = SeenCommits::new();
        let diff = compute_diff(&snapshot, &seen, &HashSet::new());
        assert_eq!(
            diff.to_launch.iter().map(Ref::sha).collect::<Vec<_>>(),
            vec!["sha-a", "sha-b"]
        );
        assert!(diff.to_cancel.is_empty());
    }

    #[test]
    fn skips_already_seen_shas() {
        let snapshot = refs(&[("refs/heads/a", "sha-a"), ("refs/heads/b", "sha-b")]);
        let mut seen = SeenCommits::new();
        seen.add("sha-a".to_string());
        let diff = compute_diff(&snapshot, &seen, &HashSet::new());
        assert_eq!(diff.to_launch.len(), 1);
        assert_eq!(diff.to_launch[0].sha(), "sha-b");
    }

    #[test]
    fn dedupes_duplicate_shas_within_one_snapshot() {
        let snapshot = refs(&[("refs/heads/a", "sha-x"), ("refs/tags/dup", "sha-x")]);
        let seen = SeenCommits::new();
        let diff = compute_diff(&snapshot, &seen, &HashSet::new());
        assert_eq!(diff.to_launch.len(), 1);
    }

    #[test]
    fn cancels_disappeared_and_moved_refs() {
        let snapshot = refs(&[("refs/heads/main", "sha-new")]);
        let mut seen = SeenCommits::new();
        seen.add_all(["sha-old".to_string(), "sha-gone".to_string()]);
        let active: HashSet<Sha> = ["sha-old".to_string(), "sha-gone".to_string()]
            .into_iter()
            .collect();
        let mut diff = compute_diff(&snapshot, &seen, &active);
        diff.to_cancel.sort();
        assert_eq!(diff.to_cancel, vec!["sha-gone".to_string(), "sha-old".to_string()]);
    }

    #[test]
    fn reprocessing_same_snapshot_launches_nothing_new() {
        let snapshot = refs(&[("refs/heads/a", "sha-a")]);
        let mut seen = SeenCommits::new();
        let first = compute_diff(&snapshot, &seen, &HashSet::new());
        assert_eq!(first.to_launch.len(), 1);
        seen.add(first.to_launch[0].sha().clone());
        let second = compute_diff(&snapshot, &seen, &HashSet::new());
        assert!(second.to_launch.is_empty());
    }
}
