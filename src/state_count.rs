//! Per-queue and per-server job-state rollup (§11, grounded on
//! `original_source/src/scheduler/state_count.h`'s `state_count`/
//! `count_states`/`total_states`/`state_count_add`).

use crate::entities::job::{Job, JobState};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCount {
    pub queued: i64,
    pub running: i64,
    pub suspended: i64,
    pub held: i64,
    pub exiting: i64,
    pub expired: i64,
}

impl StateCount {
    /// `count_states`: tally a job set into a fresh rollup.
    pub fn count<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut sc = Self::default();
        for job in jobs {
            sc.add(job.state, 1);
        }
        sc
    }

    /// `count_states` scoped to one queue.
    pub fn count_queue<'a>(jobs: impl IntoIterator<Item = &'a Job>, queue: &str) -> Self {
        Self::count(jobs.into_iter().filter(|j| j.queue == queue))
    }

    /// Per-queue rollups in one pass, keyed by queue name.
    pub fn count_by_queue<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> HashMap<String, StateCount> {
        let mut out: HashMap<String, StateCount> = HashMap::new();
        for job in jobs {
            out.entry(job.queue.clone()).or_default().add(job.state, 1);
        }
        out
    }

    /// `state_count_add`: bump one state's bucket by `amount` (negative to
    /// decrement, mirroring the header's signed-amount contract).
    pub fn add(&mut self, state: JobState, amount: i64) {
        let bucket = match state {
            JobState::Queued => &mut self.queued,
            JobState::Running => &mut self.running,
            JobState::SuspendedByScheduler => &mut self.suspended,
            JobState::Held => &mut self.held,
            JobState::Exiting => &mut self.exiting,
            JobState::Expired => &mut self.expired,
        };
        *bucket += amount;
    }

    /// `total_states`: accumulate `other` into `self`.
    pub fn total(&mut self, other: &StateCount) {
        self.queued += other.queued;
        self.running += other.running;
        self.suspended += other.suspended;
        self.held += other.held;
        self.exiting += other.exiting;
        self.expired += other.expired;
    }

    pub fn total_jobs(&self) -> i64 {
        self.queued + self.running + self.suspended + self.held + self.exiting + self.expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_in(state: JobState, queue: &str) -> Job {
        let mut j = Job::new(format!("{state:?}.host"), 1, queue);
        j.state = state;
        j
    }

    #[test]
    fn counts_jobs_by_state() {
        let jobs = vec![job_in(JobState::Running, "workq"), job_in(JobState::Running, "workq"), job_in(JobState::Queued, "workq")];
        let sc = StateCount::count(&jobs);
        assert_eq!(sc.running, 2);
        assert_eq!(sc.queued, 1);
        assert_eq!(sc.total_jobs(), 3);
    }

    #[test]
    fn total_accumulates_two_rollups() {
        let mut a = StateCount { running: 2, ..Default::default() };
        let b = StateCount { running: 1, queued: 3, ..Default::default() };
        a.total(&b);
        assert_eq!(a.running, 3);
        assert_eq!(a.queued, 3);
    }

    #[test]
    fn count_by_queue_splits_per_queue() {
        let jobs = vec![job_in(JobState::Running, "a"), job_in(JobState::Queued, "b")];
        let by_queue = StateCount::count_by_queue(&jobs);
        assert_eq!(by_queue["a"].running, 1);
        assert_eq!(by_queue["b"].queued, 1);
    }
}
