use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::JobRecord;

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    /// Current board with first-seen time and badges carried forward.
    pub merged: Vec<JobRecord>,
    /// Ids absent from the previous snapshot, in encounter order.
    pub new_ids: Vec<String>,
}

impl DiffOutcome {
    /// New records as they currently stand in `merged`, so badges attached
    /// after the diff are included.
    pub fn new_jobs(&self) -> Vec<JobRecord> {
        let wanted: HashSet<&str> = self.new_ids.iter().map(String::as_str).collect();
        self.merged
            .iter()
            .filter(|job| wanted.contains(job.id.as_str()))
            .cloned()
            .collect()
    }
}

/// Classifies `current` against `previous`.
///
/// A job seen before keeps its `discovered_at` and `badges` (when set there);
/// every other field comes from `current`. A job not seen before gets
/// `discovered_at = now`. A listing that left the board and came back counts
/// as new again.
pub fn diff(current: Vec<JobRecord>, previous: &[JobRecord], now: DateTime<Utc>) -> DiffOutcome {
    let previous_by_id: HashMap<&str, &JobRecord> =
        previous.iter().map(|job| (job.id.as_str(), job)).collect();

    let mut outcome = DiffOutcome {
        merged: Vec::with_capacity(current.len()),
        new_ids: Vec::new(),
    };

    for mut job in current {
        match previous_by_id.get(job.id.as_str()) {
            Some(seen) => {
                if seen.discovered_at.is_some() {
                    job.discovered_at = seen.discovered_at;
                }
                if seen.badges.is_some() {
                    job.badges = seen.badges.clone();
                }
            }
            None => {
                job.discovered_at = Some(now);
                outcome.new_ids.push(job.id.clone());
            }
        }
        outcome.merged.push(job);
    }

    outcome
}

/// Newest first by parsed publish time; undated jobs sink to the end in
/// their original order.
pub fn sort_by_recency(jobs: &mut [JobRecord]) {
    jobs.sort_by(|a, b| match (a.posted_at_parsed, b.posted_at_parsed) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
