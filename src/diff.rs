//! Set difference between two consecutive fleet observations.

use std::collections::BTreeSet;

use crate::fleet::Fleet;

/// Outcome of comparing two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Present in the previous snapshot, absent from the current one.
    pub vanished: BTreeSet<String>,
    /// Present in the current snapshot and already known to be open.
    pub reappeared: BTreeSet<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.vanished.is_empty() && self.reappeared.is_empty()
    }
}

/// Compares `previous` with `current`. `is_open` tells which identifiers the
/// caller currently tracks as missing; the function keeps no state.
pub fn diff<F>(previous: &Fleet, current: &Fleet, is_open: F) -> Diff
where
    F: Fn(&str) -> bool,
{
    let vanished = previous
        .keys()
        .filter(|id| !current.contains_key(*id))
        .cloned()
        .collect();

    let reappeared = current
        .keys()
        .filter(|id| is_open(id.as_str()))
        .cloned()
        .collect();

    Diff {
        vanished,
        reappeared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests::vehicle;

    fn fleet(ids: &[&str]) -> Fleet {
        ids.iter()
            .map(|id| (id.to_string(), vehicle(id, 50.0, 51.0, 7.0)))
            .collect()
    }

    fn ids(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_disjoint_fleets_vanish_completely() {
        let a = fleet(&["a", "b", "c"]);
        let b = fleet(&["x", "y"]);

        let d = diff(&a, &b, |_| false);

        assert_eq!(ids(&d.vanished), vec!["a", "b", "c"]);
        assert!(d.reappeared.is_empty());
    }

    #[test]
    fn test_self_diff_is_empty() {
        let a = fleet(&["a", "b"]);
        assert!(diff(&a, &a, |_| false).is_empty());
    }

    #[test]
    fn test_reappeared_only_counts_open_ids() {
        let previous = fleet(&["a"]);
        let current = fleet(&["a", "b", "c"]);

        let d = diff(&previous, &current, |id| id == "c");

        assert!(d.vanished.is_empty());
        assert_eq!(ids(&d.reappeared), vec!["c"]);
    }

    #[test]
    fn test_empty_previous_vanishes_nothing() {
        let d = diff(&Fleet::new(), &fleet(&["a"]), |_| false);
        assert!(d.is_empty());
    }
}
