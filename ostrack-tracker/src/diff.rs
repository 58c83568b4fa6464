//! The per-cycle set diff at the heart of reconciliation. Pure: the caller
//! fetches, the caller writes; this module only decides what happens to each
//! stored row given one fetch result.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

/// Lifecycle bookkeeping of one stored row, as read at the start of a cycle.
#[derive(Debug, Clone)]
pub struct StoredMark {
    pub resource_id: String,
    pub first_time_not_seen: Option<DateTime<Utc>>,
    pub system_deleted: bool,
    pub user_deleted: bool,
}

/// What one cycle does to a (site, kind) pair. Fetched ids and stored rows
/// partition cleanly: a row is present, newly missing, waiting out the grace
/// window, expired, or historical; never two of those at once.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleDiff {
    /// F ∩ S: refresh mutable fields and `last_seen_time`.
    pub present: Vec<String>,
    /// Subset of `present` that had `first_time_not_seen` set. Reappearance
    /// is legal and clears the absence stamp without resetting history.
    pub reappeared: Vec<String>,
    /// F \ S: rows to insert.
    pub new: Vec<String>,
    /// S \ F seen for the first cycle of absence: stamp
    /// `first_time_not_seen` now.
    pub newly_missing: Vec<String>,
    /// S \ F continuously absent for at least the grace period: mark
    /// `system_deleted`.
    pub expired: Vec<String>,
}

pub fn diff_cycle(
    fetched: &HashSet<String>,
    stored: &[StoredMark],
    now: DateTime<Utc>,
    grace: Duration,
) -> CycleDiff {
    let mut diff = CycleDiff::default();
    let mut known: HashSet<&str> = HashSet::with_capacity(stored.len());

    for mark in stored {
        known.insert(mark.resource_id.as_str());
        if mark.system_deleted || mark.user_deleted {
            // Historical rows take no further part in the state machine.
            continue;
        }
        if fetched.contains(&mark.resource_id) {
            if mark.first_time_not_seen.is_some() {
                diff.reappeared.push(mark.resource_id.clone());
            }
            diff.present.push(mark.resource_id.clone());
        } else {
            match mark.first_time_not_seen {
                None => diff.newly_missing.push(mark.resource_id.clone()),
                Some(first) if now - first >= grace => {
                    diff.expired.push(mark.resource_id.clone());
                }
                Some(_) => {} // absent, but still inside the grace window
            }
        }
    }

    for id in fetched {
        if !known.contains(id.as_str()) {
            diff.new.push(id.clone());
        }
    }
    // HashSet iteration order is arbitrary; keep inserts deterministic.
    diff.new.sort();

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE_HOURS: i64 = 6;

    fn now() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    fn grace() -> Duration {
        Duration::hours(GRACE_HOURS)
    }

    fn mark(id: &str, absent_for_hours: Option<i64>) -> StoredMark {
        StoredMark {
            resource_id: id.to_string(),
            first_time_not_seen: absent_for_hours.map(|h| now() - Duration::hours(h)),
            system_deleted: false,
            user_deleted: false,
        }
    }

    fn fetched(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_fetched_ids_are_new() {
        let diff = diff_cycle(&fetched(&["a", "b"]), &[mark("a", None)], now(), grace());
        assert_eq!(diff.new, vec!["b"]);
        assert_eq!(diff.present, vec!["a"]);
    }

    #[test]
    fn present_row_is_not_reappeared_without_absence_stamp() {
        let diff = diff_cycle(&fetched(&["a"]), &[mark("a", None)], now(), grace());
        assert_eq!(diff.present, vec!["a"]);
        assert!(diff.reappeared.is_empty());
    }

    #[test]
    fn reappearance_before_grace_clears_the_stamp() {
        let diff = diff_cycle(&fetched(&["a"]), &[mark("a", Some(2))], now(), grace());
        assert_eq!(diff.present, vec!["a"]);
        assert_eq!(diff.reappeared, vec!["a"]);
        assert!(diff.expired.is_empty());
    }

    #[test]
    fn first_absence_is_stamped_not_deleted() {
        let diff = diff_cycle(&fetched(&[]), &[mark("a", None)], now(), grace());
        assert_eq!(diff.newly_missing, vec!["a"]);
        assert!(diff.expired.is_empty());
    }

    #[test]
    fn absence_within_grace_takes_no_action() {
        let diff = diff_cycle(&fetched(&[]), &[mark("a", Some(GRACE_HOURS - 1))], now(), grace());
        assert!(diff.newly_missing.is_empty());
        assert!(diff.expired.is_empty());
    }

    #[test]
    fn absence_at_grace_boundary_expires() {
        let diff = diff_cycle(&fetched(&[]), &[mark("a", Some(GRACE_HOURS))], now(), grace());
        assert_eq!(diff.expired, vec!["a"]);
    }

    #[test]
    fn historical_rows_are_ignored() {
        let mut gone = mark("a", Some(100));
        gone.system_deleted = true;
        let mut reclaimed = mark("b", None);
        reclaimed.user_deleted = true;

        let diff = diff_cycle(&fetched(&[]), &[gone, reclaimed], now(), grace());
        assert_eq!(diff, CycleDiff::default());
    }

    #[test]
    fn system_deleted_is_set_exactly_once() {
        // Cycle 1: past the grace window, the row expires.
        let first = diff_cycle(&fetched(&[]), &[mark("a", Some(GRACE_HOURS + 1))], now(), grace());
        assert_eq!(first.expired, vec!["a"]);

        // Cycle 2: the row now carries system_deleted and is historical.
        let mut after = mark("a", Some(GRACE_HOURS + 2));
        after.system_deleted = true;
        let second = diff_cycle(&fetched(&[]), &[after], now(), grace());
        assert!(second.expired.is_empty());
    }

    #[test]
    fn replaying_an_identical_cycle_changes_nothing() {
        // A cycle that stamps an absence, replayed against the state it
        // produced, decides nothing further.
        let first = diff_cycle(&fetched(&[]), &[mark("a", None)], now(), grace());
        assert_eq!(first.newly_missing, vec!["a"]);

        let second = diff_cycle(&fetched(&[]), &[mark("a", Some(0))], now(), grace());
        assert!(second.newly_missing.is_empty());
        assert!(second.expired.is_empty());

        // Same for the present path: replaying yields the same decision.
        let once = diff_cycle(&fetched(&["b"]), &[mark("b", None)], now(), grace());
        let twice = diff_cycle(&fetched(&["b"]), &[mark("b", None)], now(), grace());
        assert_eq!(once, twice);
    }

    #[test]
    fn every_stored_row_lands_in_exactly_one_bucket() {
        let stored = vec![
            mark("present", None),
            mark("back", Some(1)),
            mark("fresh-miss", None),
            mark("waiting", Some(GRACE_HOURS - 2)),
            mark("expired", Some(GRACE_HOURS + 4)),
        ];
        let diff = diff_cycle(&fetched(&["present", "back", "brand-new"]), &stored, now(), grace());

        assert_eq!(diff.present, vec!["present", "back"]);
        assert_eq!(diff.reappeared, vec!["back"]);
        assert_eq!(diff.new, vec!["brand-new"]);
        assert_eq!(diff.newly_missing, vec!["fresh-miss"]);
        assert_eq!(diff.expired, vec!["expired"]);

        // No id shows up in more than one action bucket (reappeared is a
        // refinement of present, not a separate action).
        for id in &diff.present {
            assert!(!diff.newly_missing.contains(id));
            assert!(!diff.expired.contains(id));
            assert!(!diff.new.contains(id));
        }
    }
}
