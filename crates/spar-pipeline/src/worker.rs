//! Worker runtime
//!
//! Claims queued jobs in rounds, runs their stage with a per-job timeout, and
//! periodically requeues claims whose holder went away. Any number of workers
//! may run against one store; the atomic claim keeps them from colliding.
//! Liveness is reported through best-effort heartbeats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use spar_core::config::WorkerConfig;
use spar_core::fail_open::{fail_open, fail_open_with_retries};
use spar_core::{HeartbeatStatus, Result, WorkerHeartbeat, WorkerId, ACTIVE_STAGES};
use spar_store::Store;

use crate::stages::Pipeline;

/// Stable-enough identity for claim attribution and liveness records.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "spar".to_string());
    format!("{}#{}", host, std::process::id())
}

/// Background job processor. One instance per task; run several for
/// parallelism.
pub struct Worker {
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    worker_id: WorkerId,
}

impl Worker {
    pub fn new(
        pipeline: Arc<Pipeline>,
        config: WorkerConfig,
        worker_id: impl Into<WorkerId>,
    ) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// The main loop: sweep, claim, execute, sleep when idle. Returns after
    /// `shutdown` flips to true, or after one round in `run_once` mode.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("worker {} starting", self.worker_id);
        let mut jobs_processed: u64 = 0;
        self.report(HeartbeatStatus::Started, jobs_processed).await;

        let recover_interval = Duration::from_millis(self.config.recover_interval_ms);
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let idle_min = Duration::from_millis(self.config.idle_sleep_min_ms);
        let idle_max = Duration::from_millis(self.config.idle_sleep_max_ms);

        let mut idle_sleep = idle_min;
        // First iteration sweeps immediately; a predecessor may have died
        // holding claims.
        let mut last_sweep = Instant::now() - recover_interval;
        let mut last_beat = Instant::now();
        let mut beat_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_sweep.elapsed() >= recover_interval {
                self.recover_stale().await;
                last_sweep = Instant::now();
            }

            match self.run_round().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_sleep) => {
                            idle_sleep = (idle_sleep * 2).min(idle_max);
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(done) => {
                    jobs_processed += done as u64;
                    idle_sleep = idle_min;
                }
                Err(e) => {
                    warn!("worker round failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(self.config.error_sleep_ms)).await;
                }
            }

            if last_beat.elapsed() >= heartbeat_interval {
                match self
                    .store
                    .record_heartbeat(self.beat(HeartbeatStatus::Alive, jobs_processed))
                    .await
                {
                    Ok(()) => beat_failures = 0,
                    Err(e) => {
                        beat_failures += 1;
                        if beat_failures <= 3 || beat_failures % 20 == 0 {
                            warn!("heartbeat failed {} times in a row: {}", beat_failures, e);
                        }
                    }
                }
                last_beat = Instant::now();
            }

            if self.config.run_once {
                break;
            }
        }

        self.report(HeartbeatStatus::Stopped, jobs_processed).await;
        info!(
            "worker {} stopped after {} jobs",
            self.worker_id, jobs_processed
        );
        Ok(())
    }

    /// One recovery sweep plus one claim round. Scripted runs call this
    /// directly; a fresh submission takes three calls to reach `done`.
    pub async fn run_once(&self) -> Result<usize> {
        self.recover_stale().await;
        self.run_round().await
    }

    /// Claim up to `max_jobs_per_round` queued jobs and execute their current
    /// stage concurrently. Returns the number claimed. A job whose stage
    /// overruns `job_timeout_ms` is abandoned in place; the staleness sweep
    /// requeues it later.
    pub async fn run_round(&self) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(self.config.round_wall_ms);
        let job_timeout = Duration::from_millis(self.config.job_timeout_ms);
        let mut tasks = JoinSet::new();
        let mut claimed = 0usize;

        while claimed < self.config.max_jobs_per_round && Instant::now() < deadline {
            let Some(job) = self.store.claim_next(&ACTIVE_STAGES, &self.worker_id).await? else {
                break;
            };
            claimed += 1;
            debug!(
                "worker {} claimed job {} at {} (attempt {})",
                self.worker_id,
                job.id.short(),
                job.stage,
                job.attempt_count
            );

            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let id = job.id;
                let stage = job.stage;
                match tokio::time::timeout(job_timeout, pipeline.execute(job)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!("job {} failed at {}: {}", id.short(), stage, e);
                    }
                    Err(_) => {
                        warn!(
                            "job {} timed out at {}, the staleness sweep will requeue it",
                            id.short(),
                            stage
                        );
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("job task panicked: {}", e);
            }
        }

        Ok(claimed)
    }

    async fn recover_stale(&self) {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.stale_after_ms as i64);
        // Unlike the heartbeat, a skipped sweep delays every abandoned job by
        // a full recover interval, so a store hiccup is worth a few retries.
        let requeued = fail_open_with_retries(
            "staleness sweep",
            || self.store.recover_stale_jobs(cutoff, self.config.recover_batch),
            3,
        )
        .await;
        if let Some(requeued) = requeued {
            if !requeued.is_empty() {
                info!("requeued {} stale jobs", requeued.len());
            }
        }
    }

    async fn report(&self, status: HeartbeatStatus, jobs_processed: u64) {
        fail_open("worker heartbeat", || {
            self.store.record_heartbeat(self.beat(status, jobs_processed))
        })
        .await;
    }

    fn beat(&self, status: HeartbeatStatus, jobs_processed: u64) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            status,
            jobs_processed,
            updated_at: Utc::now(),
        }
    }
}
