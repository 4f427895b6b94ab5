use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sweep_core::{JobState, Result, SweepError};

use crate::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub num_queued: usize,
    /// Submitted or running.
    pub num_running: usize,
    /// Succeeded or failed.
    pub num_completed: usize,
    pub num_total: usize,
}

/// Jobs in insertion order plus running counters.
///
/// Every state change goes through [`WorkQueue::transition`], which keeps
/// `num_queued + num_running + num_completed == len()`.
#[derive(Debug, Default)]
pub struct WorkQueue {
    jobs: Vec<Job>,
    num_queued: usize,
    num_running: usize,
    num_completed: usize,
}

impl WorkQueue {
    pub fn new(jobs: Vec<Job>) -> Self {
        let mut queue = Self {
            jobs: Vec::with_capacity(jobs.len()),
            ..Self::default()
        };
        for job in jobs {
            match job.state() {
                JobState::Queued => queue.num_queued += 1,
                s if s.is_active() => queue.num_running += 1,
                _ => queue.num_completed += 1,
            }
            queue.jobs.push(job);
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, idx: usize) -> &Job {
        &self.jobs[idx]
    }

    pub(crate) fn job_mut(&mut self, idx: usize) -> &mut Job {
        &mut self.jobs[idx]
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            num_queued: self.num_queued,
            num_running: self.num_running,
            num_completed: self.num_completed,
            num_total: self.jobs.len(),
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.num_completed == self.jobs.len()
    }

    pub fn range_terminal(&self, range: Range<usize>) -> bool {
        self.jobs[range].iter().all(|j| j.state().is_terminal())
    }

    /// Indices of submitted or running jobs, in insertion order.
    pub fn active_indices(&self) -> Vec<usize> {
        self.indices_where(|j| j.state().is_active())
    }

    pub fn queued_indices(&self) -> Vec<usize> {
        self.indices_where(|j| j.state() == JobState::Queued)
    }

    fn indices_where(&self, pred: impl Fn(&Job) -> bool) -> Vec<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| pred(j))
            .map(|(i, _)| i)
            .collect()
    }

    /// First queued job in `range` whose retry backoff has elapsed.
    pub fn next_admissible(&self, range: Range<usize>, now: DateTime<Utc>) -> Option<usize> {
        range.into_iter().find(|&i| {
            let job = &self.jobs[i];
            job.state() == JobState::Queued && job.retry_at.map(|at| at <= now).unwrap_or(true)
        })
    }

    /// Move a job to `next`, stamping submission/terminal times and keeping
    /// the counters consistent. Rejects moves the state machine forbids.
    pub fn transition(&mut self, idx: usize, next: JobState, now: DateTime<Utc>) -> Result<()> {
        let job = &mut self.jobs[idx];
        let prev = job.state;
        if !prev.can_transition_to(next) {
            return Err(SweepError::Backend(format!(
                "job {} cannot move from {} to {}",
                job.id(),
                prev,
                next
            )));
        }
        job.state = next;
        if next == JobState::Submitted {
            job.submitted_at = Some(now);
            job.retry_at = None;
        }
        if next.is_terminal() {
            job.terminal_at = Some(now);
        }

        match prev {
            JobState::Queued => self.num_queued -= 1,
            s if s.is_active() => self.num_running -= 1,
            _ => {}
        }
        match next {
            JobState::Queued => self.num_queued += 1,
            s if s.is_active() => self.num_running += 1,
            _ => self.num_completed += 1,
        }
        debug_assert_eq!(
            self.num_queued + self.num_running + self.num_completed,
            self.jobs.len()
        );
        Ok(())
    }

    /// Move an active job to a terminal state. A job that finished before any
    /// poll saw it running still passes through `Running`.
    pub fn finish(&mut self, idx: usize, terminal: JobState, now: DateTime<Utc>) -> Result<()> {
        if self.jobs[idx].state == JobState::Submitted {
            self.transition(idx, JobState::Running, now)?;
        }
        self.transition(idx, terminal, now)
    }
}
