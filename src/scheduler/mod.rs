//! Cron scheduler.
//!
//! A single ticker evaluates every schedule against its stored
//! `next_run_at`. The missed-schedule policy is catch-up-once: a schedule
//! that is overdue, whether by a minute or by three hours, fires exactly one run
//! and then jumps to the next occurrence computed from now, never
//! backfilling the windows in between.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use smelter_core::ports::{Executor, LeaderGate, PipelineStore, Result, RunStore, ScheduleStore};
use smelter_core::types::{NewRun, Schedule};

use crate::cron_util::{next_after, parse_cron};
use crate::leader::{confirm_leader, jittered};

/// Evaluation cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Leader-election component name.
const COMPONENT: &str = "scheduler";

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    pipelines: Arc<dyn PipelineStore>,
    runs: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    leader: Arc<dyn LeaderGate>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        pipelines: Arc<dyn PipelineStore>,
        runs: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        leader: Arc<dyn LeaderGate>,
    ) -> Self {
        Self {
            schedules,
            pipelines,
            runs,
            executor,
            leader,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("scheduler started");
            loop {
                let delay = if confirm_leader(&self.leader, COMPONENT).await {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "scheduler tick failed");
                    }
                    self.tick_interval
                } else {
                    jittered(self.tick_interval)
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One evaluation pass over every schedule.
    pub async fn tick(&self) -> Result<()> {
        let schedules = self.schedules.list_all().await?;
        let now = Utc::now();

        for schedule in schedules {
            if !schedule.enabled {
                continue;
            }
            let parsed = match parse_cron(&schedule.cron_expr) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        cron = %schedule.cron_expr,
                        error = %e,
                        "skipping schedule with invalid cron expression"
                    );
                    continue;
                }
            };

            match schedule.next_run_at {
                // Fresh schedule: compute the first fire time, do not fire.
                None => {
                    if let Some(next) = next_after(&parsed, now) {
                        self.schedules.set_next_run_at(schedule.id, next).await?;
                    }
                }
                Some(next) if next > now => {}
                Some(_) => {
                    if let Err(e) = self.fire(&schedule, &parsed).await {
                        tracing::warn!(
                            schedule_id = %schedule.id,
                            error = %e,
                            "schedule fire failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn fire(&self, schedule: &Schedule, parsed: &cron::Schedule) -> Result<()> {
        let now = Utc::now();
        let next = match next_after(parsed, now) {
            Some(next) => next,
            None => {
                tracing::warn!(schedule_id = %schedule.id, "cron yields no future fire time");
                return Ok(());
            }
        };

        let Some(pipeline) = self.pipelines.get(schedule.pipeline_id).await? else {
            tracing::warn!(
                schedule_id = %schedule.id,
                pipeline_id = %schedule.pipeline_id,
                "schedule references a missing pipeline"
            );
            self.schedules.set_next_run_at(schedule.id, next).await?;
            return Ok(());
        };
        if pipeline.is_deleted() {
            self.schedules.set_next_run_at(schedule.id, next).await?;
            return Ok(());
        }

        let run = self
            .runs
            .create(NewRun {
                pipeline_id: pipeline.id,
                trigger: format!("schedule:{}", schedule.cron_expr),
                s3_credentials: None,
            })
            .await?;

        // Dispatch is best-effort: the run row exists regardless of the
        // outcome here.
        match self.executor.submit(&run, &pipeline).await {
            Ok(()) => {}
            Err(e) if e.is_runner_busy() => {
                // Leave the run pending and the schedule untouched; the next
                // tick re-evaluates while it is still due, and the reaper's
                // stuck-run timeout is the backstop.
                tracing::info!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    "runners at capacity, run stays pending"
                );
                return Ok(());
            }
            Err(e) => {
                // The client already marked the run failed; the scheduler
                // does not retry it.
                tracing::warn!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    error = %e,
                    "scheduled dispatch failed"
                );
            }
        }

        self.schedules
            .record_fire(schedule.id, run.id, now, next)
            .await?;
        tracing::info!(
            schedule_id = %schedule.id,
            run_id = %run.id,
            next_run_at = %next,
            "schedule fired"
        );
        Ok(())
    }
}
