use std::{sync::Arc, time::Instant};

use domain_verify_storage::{ChallengeError, ChallengeRepository};
use domain_verify_util::SchedulerConfig;
use metrics::histogram;
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::prober::{ProbeOutcome, Prober};
use crate::Clock;

/// Counts of what one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub selected: usize,
    pub verified: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub discarded: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Verified => self.verified += 1,
            ProbeOutcome::Rescheduled => self.rescheduled += 1,
            ProbeOutcome::Exhausted => self.exhausted += 1,
            ProbeOutcome::Discarded => self.discarded += 1,
        }
    }
}

/// Background worker that periodically probes due challenges.
#[derive(Clone)]
pub struct ProbeScheduler {
    challenges: ChallengeRepository,
    prober: Prober,
    config: SchedulerConfig,
    clock: Clock,
}

impl ProbeScheduler {
    pub fn new(
        challenges: ChallengeRepository,
        prober: Prober,
        config: SchedulerConfig,
        clock: Clock,
    ) -> Self {
        Self {
            challenges,
            prober,
            config,
            clock,
        }
    }

    /// Runs the scheduler loop in the background until the handle is stopped.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run_loop(rx).await;
        });
        SchedulerHandle { shutdown, task }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stage = "scheduler",
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "probe scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(stage = "scheduler", error = %err, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(stage = "scheduler", "probe scheduler stopped");
    }

    /// Selects the due batch and probes it with bounded parallelism.
    pub async fn run_once(&self) -> Result<TickSummary, ChallengeError> {
        let started = Instant::now();
        let now = (self.clock)();
        let due = self.challenges.list_due(now, self.config.batch_size).await?;

        let mut summary = TickSummary {
            selected: due.len(),
            ..TickSummary::default()
        };
        if due.is_empty() {
            histogram!("scheduler_tick_seconds").record(started.elapsed().as_secs_f64());
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        for challenge in due {
            let permits = permits.clone();
            let prober = self.prober.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                prober.probe_challenge(&challenge).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    warn!(stage = "scheduler", error = %err, "probe task failed");
                    summary.discarded += 1;
                }
            }
        }

        histogram!("scheduler_tick_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            stage = "scheduler",
            selected = summary.selected,
            verified = summary.verified,
            rescheduled = summary.rescheduled,
            exhausted = summary.exhausted,
            discarded = summary.discarded,
            "scheduler tick completed"
        );
        Ok(summary)
    }
}

/// Handle on a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop to stop and waits for the in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(stage = "scheduler", error = %err, "scheduler task ended abnormally");
        }
    }
}
