//! Seconds-resolution cron jobs on a single background ticker thread.

use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type JobId = u64;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?}: {source}")]
    Expression {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
}

type Task = Box<dyn FnMut(DateTime<Local>) + Send>;

struct Job {
    id: JobId,
    schedule: Schedule,
    task: Task,
    next: Option<DateTime<Local>>,
}

impl Job {
    fn reschedule(&mut self, after: &DateTime<Local>) {
        self.next = self.schedule.after(after).next();
        if self.next.is_none() {
            warn!(job = self.id, "schedule has no further occurrences");
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
    next_id: JobId,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Registers `task` under a 6-field (seconds first) or 7-field (trailing
    /// year) cron expression. The task receives the time it was scheduled for.
    pub fn add_job<F>(&mut self, expression: &str, task: F) -> Result<JobId, CronError>
    where
        F: FnMut(DateTime<Local>) + Send + 'static,
    {
        let schedule = Schedule::from_str(expression).map_err(|source| CronError::Expression {
            expression: expression.to_owned(),
            source,
        })?;

        self.next_id += 1;
        let id = self.next_id;
        debug!(job = id, expression, "cron job added");

        self.jobs.push(Job {
            id,
            schedule,
            task: Box::new(task),
            next: None,
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Spawns the ticker thread. It runs until [`RunningScheduler::stop`] or drop.
    pub fn start(mut self) -> RunningScheduler {
        let now = Local::now();
        for job in self.jobs.iter_mut() {
            job.reschedule(&now);
        }

        let (stop, stopped) = mpsc::channel::<()>();
        info!(jobs = self.jobs.len(), "cron scheduler started");

        let handle = thread::spawn(move || loop {
            let now = Local::now();
            let wait = match self.next_due() {
                Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO),
                None => {
                    // Nothing left to run: idle until told to stop.
                    let _ = stopped.recv();
                    return;
                }
            };

            match stopped.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.run_due(Local::now());
        });

        RunningScheduler {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    fn next_due(&self) -> Option<DateTime<Local>> {
        self.jobs.iter().filter_map(|job| job.next).min()
    }

    /// Runs every job due at or before `now`, in registration order, and
    /// moves each of them to its next occurrence after `now`.
    fn run_due(&mut self, now: DateTime<Local>) -> usize {
        let mut ran = 0;
        for job in self.jobs.iter_mut() {
            match job.next {
                Some(due) if due <= now => {
                    debug!(job = job.id, scheduled = %due, "running cron job");
                    (job.task)(due);
                    job.reschedule(&now);
                    ran += 1;
                }
                _ => {}
            }
        }
        ran
    }
}

/// Handle to a started [`Scheduler`].
pub struct RunningScheduler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RunningScheduler {
    /// Stops the ticker and waits for it to exit. A job in progress finishes first.
    pub fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("cron ticker panicked");
            }
        }
        info!("cron scheduler stopped");
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for RunningScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
