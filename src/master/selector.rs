//! Choice of backups for new replicas. Primaries prefer backups in failure
//! domains not already holding a replica of the segment; secondaries merely
//! avoid colocation with existing replicas.

use std::collections::HashSet;

use crate::common::ServerId;
use crate::tracker::{ServerDetails, ServerTracker};

use rand::prelude::*;

/// Replica placement policy over the live cluster view.
pub struct BackupSelector {
    me: ServerId,
    tracker: ServerTracker,
    rng: StdRng,
}

impl BackupSelector {
    pub fn new(me: ServerId, tracker: ServerTracker) -> Self {
        BackupSelector {
            me,
            tracker,
            rng: StdRng::from_entropy(),
        }
    }

    /// Up backups other than this master and the constraint set.
    fn candidates(&self, constraints: &[ServerId]) -> Vec<ServerDetails> {
        self.tracker
            .backups_up()
            .into_iter()
            .filter(|d| d.id != self.me && !constraints.contains(&d.id))
            .collect()
    }

    /// Chooses a backup for a primary replica, preferring failure domains
    /// distinct from every constraint's. Returns `None` when no candidate
    /// exists; the caller retries later.
    pub fn select_primary(
        &mut self,
        constraints: &[ServerId],
    ) -> Option<ServerId> {
        let candidates = self.candidates(constraints);
        let used_domains: HashSet<u64> = constraints
            .iter()
            .filter_map(|&id| self.tracker.details_of(id))
            .map(|d| d.failure_domain)
            .collect();

        let diverse: Vec<&ServerDetails> = candidates
            .iter()
            .filter(|d| !used_domains.contains(&d.failure_domain))
            .collect();
        if let Some(details) = diverse.choose(&mut self.rng) {
            return Some(details.id);
        }
        candidates.choose(&mut self.rng).map(|d| d.id)
    }

    /// Chooses a backup for a secondary replica: any up backup not already
    /// holding a replica of the segment.
    pub fn select_secondary(
        &mut self,
        constraints: &[ServerId],
    ) -> Option<ServerId> {
        self.candidates(constraints)
            .choose(&mut self.rng)
            .map(|d| d.id)
    }
}

#[cfg(test)]
mod selector_tests {
    use super::*;

    fn tracker_with_backups(domains: &[(u64, u64)]) -> ServerTracker {
        let tracker = ServerTracker::new();
        for &(id, domain) in domains {
            tracker.add_server(ServerId(id), false, true, domain);
        }
        tracker
    }

    #[test]
    fn avoids_constraints_and_self() {
        let tracker = tracker_with_backups(&[(1, 0), (2, 0), (3, 0)]);
        let mut selector = BackupSelector::new(ServerId(1), tracker);
        for _ in 0..20 {
            let choice =
                selector.select_secondary(&[ServerId(2)]).unwrap();
            assert_eq!(choice, ServerId(3));
        }
        assert_eq!(
            selector.select_secondary(&[ServerId(2), ServerId(3)]),
            None
        );
    }

    #[test]
    fn primary_prefers_fresh_failure_domain() {
        let tracker =
            tracker_with_backups(&[(1, 0), (2, 0), (3, 1)]);
        let mut selector = BackupSelector::new(ServerId(9), tracker);
        // backup 1 (domain 0) holds a replica; domain 1 is preferred
        for _ in 0..20 {
            assert_eq!(
                selector.select_primary(&[ServerId(1)]),
                Some(ServerId(3))
            );
        }
    }

    #[test]
    fn primary_falls_back_when_no_diverse_domain() {
        let tracker = tracker_with_backups(&[(1, 0), (2, 0)]);
        let mut selector = BackupSelector::new(ServerId(9), tracker);
        assert_eq!(
            selector.select_primary(&[ServerId(1)]),
            Some(ServerId(2))
        );
    }

    #[test]
    fn crashed_backups_not_considered() {
        let tracker = tracker_with_backups(&[(1, 0), (2, 1)]);
        tracker.mark_crashed(ServerId(2));
        let mut selector = BackupSelector::new(ServerId(9), tracker);
        for _ in 0..10 {
            assert_eq!(selector.select_primary(&[]), Some(ServerId(1)));
        }
    }
}
