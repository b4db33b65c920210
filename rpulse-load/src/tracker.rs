//! Per-worker bookkeeping of jobs in flight.
//!
//! Each virtual user owns one tracker. Job ids encode the owning virtual user, so a tracker is
//! never read or written by more than one task and needs no locking.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::events::JobAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub status: JobAction,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: HashMap<i64, JobState>,
}

impl JobTracker {
    /// Record a freshly queued job.
    pub fn queue(&mut self, job_id: i64, created_at: DateTime<Utc>) {
        self.jobs.insert(
            job_id,
            JobState {
                status: JobAction::Queued,
                created_at,
                started_at: None,
            },
        );
    }

    /// Record the moment a job started running.
    pub fn start(&mut self, job_id: i64, created_at: DateTime<Utc>, started_at: DateTime<Utc>) {
        self.jobs.insert(
            job_id,
            JobState {
                status: JobAction::InProgress,
                created_at,
                started_at: Some(started_at),
            },
        );
    }

    /// The start time recorded for `job_id`, required to emit its `completed` event.
    pub fn started_at(&self, job_id: i64) -> Result<DateTime<Utc>> {
        self.jobs
            .get(&job_id)
            .and_then(|state| state.started_at)
            .ok_or(Error::MissingJobState { job_id })
    }

    /// Drop a job, either because it completed or because its lifecycle was aborted.
    pub fn remove(&mut self, job_id: i64) -> Option<JobState> {
        self.jobs.remove(&job_id)
    }

    pub fn get(&self, job_id: i64) -> Option<&JobState> {
        self.jobs.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lifecycle_transitions() {
        let mut tracker = JobTracker::default();
        let created = Utc::now();
        let started = created + Duration::seconds(2);

        tracker.queue(10001, created);
        assert_eq!(tracker.get(10001).unwrap().status, JobAction::Queued);
        assert!(tracker.started_at(10001).is_err());

        tracker.start(10001, created, started);
        let state = tracker.get(10001).unwrap();
        assert_eq!(state.status, JobAction::InProgress);
        assert_eq!(state.created_at, created);
        assert_eq!(tracker.started_at(10001).unwrap(), started);

        let removed = tracker.remove(10001).unwrap();
        assert_eq!(removed.started_at, Some(started));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unknown_job_reports_missing_state() {
        let tracker = JobTracker::default();
        let err = tracker.started_at(42).unwrap_err();
        assert!(matches!(err, Error::MissingJobState { job_id: 42 }));
    }

    #[test]
    fn test_jobs_are_tracked_independently() {
        let mut tracker = JobTracker::default();
        let created = Utc::now();
        tracker.queue(10000, created);
        tracker.start(20000, created, created + Duration::seconds(1));

        assert_eq!(tracker.len(), 2);
        assert!(tracker.started_at(10000).is_err());
        assert!(tracker.started_at(20000).is_ok());
    }
}
