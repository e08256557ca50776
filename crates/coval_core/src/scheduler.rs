//! Cooperative scheduling: a microtask queue and clock-driven deferred jobs.
//!
//! The engine is single-threaded; batched work (unified-store emissions) is
//! enqueued as microtasks and run when the engine drains the queue at the end
//! of an operation or a pump step. Deferred jobs (cache cleanup after the
//! grace period) run when their due time passes the injected clock.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::warn;

/// Guard against runaway microtask chains scheduling each other forever.
const MAX_DRAIN_STEPS: usize = 10_000;

type Job = Box<dyn FnOnce()>;

struct DeferredJob {
    token: u64,
    due_ms: i64,
    job: Job,
}

#[derive(Default)]
struct SchedulerInner {
    microtasks: VecDeque<Job>,
    deferred: Vec<DeferredJob>,
    next_token: u64,
}

/// Single-threaded scheduler. Cheaply cloneable; clones share the queues.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a microtask for the next drain.
    pub fn enqueue(&self, job: impl FnOnce() + 'static) {
        self.inner.borrow_mut().microtasks.push_back(Box::new(job));
    }

    /// Runs queued microtasks until the queue is empty, including tasks
    /// enqueued while draining. Returns the number of tasks run.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.inner.borrow_mut().microtasks.pop_front();
            let Some(job) = job else {
                return ran;
            };
            job();
            ran += 1;
            if ran >= MAX_DRAIN_STEPS {
                warn!(ran, "microtask drain aborted; queue keeps refilling");
                return ran;
            }
        }
    }

    /// Schedules a job to run once `due_ms` has passed. Returns a token
    /// usable with [`Scheduler::cancel`].
    pub fn defer(&self, due_ms: i64, job: impl FnOnce() + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.next_token += 1;
        let token = inner.next_token;
        inner.deferred.push(DeferredJob {
            token,
            due_ms,
            job: Box::new(job),
        });
        token
    }

    /// Cancels a deferred job. Returns whether it was still pending.
    pub fn cancel(&self, token: u64) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.deferred.len();
        inner.deferred.retain(|j| j.token != token);
        inner.deferred.len() != before
    }

    /// Runs all deferred jobs whose due time is at or before `now_ms`.
    /// Returns the number of jobs run.
    pub fn run_due(&self, now_ms: i64) -> usize {
        let due: Vec<Job> = {
            let mut inner = self.inner.borrow_mut();
            let mut due = Vec::new();
            let mut keep = Vec::with_capacity(inner.deferred.len());
            for entry in inner.deferred.drain(..) {
                if entry.due_ms <= now_ms {
                    due.push(entry.job);
                } else {
                    keep.push(entry);
                }
            }
            inner.deferred = keep;
            due
        };
        let ran = due.len();
        for job in due {
            job();
        }
        ran
    }

    /// Number of queued microtasks.
    pub fn pending_microtasks(&self) -> usize {
        self.inner.borrow().microtasks.len()
    }

    /// Number of pending deferred jobs.
    pub fn pending_deferred(&self) -> usize {
        self.inner.borrow().deferred.len()
    }
}
