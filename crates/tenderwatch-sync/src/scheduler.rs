//! Cron triggers around the pipeline. Every trigger goes through one run guard,
//! so a trigger that fires while a run is active is skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{Pipeline, PipelineConfig, RunSummary};

#[derive(Clone)]
pub struct GuardedRunner {
    pipeline: Arc<Pipeline>,
    guard: Arc<Mutex<()>>,
}

impl GuardedRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// `None` when another run holds the guard.
    pub async fn try_run(
        &self,
        trigger: &str,
        target_date: NaiveDate,
    ) -> Option<Result<RunSummary>> {
        let Ok(_active) = self.guard.try_lock() else {
            warn!(trigger, %target_date, "pipeline run already in progress; skipping trigger");
            return None;
        };
        info!(trigger, %target_date, "pipeline run triggered");
        Some(self.pipeline.run_pipeline(target_date).await)
    }

    /// Target date for a trigger firing at `now`, in the portal's time zone.
    pub fn trigger_date(&self, now: DateTime<Utc>, days_back: u32) -> NaiveDate {
        self.pipeline.portal_date(now, days_back)
    }

    async fn fire(&self, trigger: &'static str, days_back: u32) {
        let target_date = self.trigger_date(Utc::now(), days_back);
        match self.try_run(trigger, target_date).await {
            Some(Ok(summary)) => info!(
                trigger,
                run_id = %summary.run_id,
                persisted = summary.persisted,
                failed = summary.failed,
                "scheduled run finished"
            ),
            Some(Err(err)) => error!(
                trigger,
                error = %format!("{err:#}"),
                "scheduled run failed; waiting for next trigger"
            ),
            None => {}
        }
    }
}

/// Time left until `at` today, or `None` when it has already passed.
pub fn one_shot_delay(now: NaiveDateTime, at: NaiveTime) -> Option<Duration> {
    let target = now.date().and_time(at);
    if target <= now {
        return None;
    }
    (target - now).to_std().ok()
}

/// Daily cron job plus the optional one-shot run; `None` when scheduling is
/// disabled. The caller starts the returned scheduler.
pub async fn build_scheduler(
    runner: GuardedRunner,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let daily = runner.clone();
    let days_back = config.daily_target_days_back;
    let job = Job::new_async_tz(config.daily_cron.as_str(), Local, move |_uuid, _l| {
        let runner = daily.clone();
        Box::pin(async move { runner.fire("daily", days_back).await })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.daily_cron))?;
    sched.add(job).await.context("adding daily job")?;
    info!(cron = %config.daily_cron, days_back, "daily pipeline job scheduled");

    if let Some(at) = config.one_shot_at {
        match one_shot_delay(Local::now().naive_local(), at) {
            Some(delay) => {
                let once = runner.clone();
                let job = Job::new_one_shot_async(delay, move |_uuid, _l| {
                    let runner = once.clone();
                    Box::pin(async move { runner.fire("one_shot", 0).await })
                })
                .context("creating one-shot job")?;
                sched.add(job).await.context("adding one-shot job")?;
                info!(%at, delay_secs = delay.as_secs(), "one-shot pipeline run scheduled");
            }
            None => info!(%at, "one-shot time already passed today; not scheduling"),
        }
    }

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{doc, harness, target, FakeDocuments, FixedPortal};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        target().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn one_shot_later_today_is_scheduled() {
        let delay = one_shot_delay(at(10, 0), NaiveTime::from_hms_opt(13, 30, 0).unwrap());
        assert_eq!(delay, Some(Duration::from_secs(3 * 3600 + 30 * 60)));
    }

    #[test]
    fn one_shot_in_the_past_is_skipped() {
        let half_past_one = NaiveTime::from_hms_opt(13, 30, 0).unwrap();
        assert_eq!(one_shot_delay(at(14, 0), half_past_one), None);
        assert_eq!(one_shot_delay(at(13, 30), half_past_one), None);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let h = harness(
            FixedPortal {
                docs: vec![doc(1)],
                session_fails: false,
            },
            FakeDocuments::new(),
        );
        let runner = GuardedRunner::new(Arc::new(h.pipeline));

        let held = runner.guard.clone();
        let _active = held.lock().await;
        assert!(runner.try_run("daily", target()).await.is_none());
        drop(_active);

        let summary = runner
            .try_run("one_shot", target())
            .await
            .expect("guard free")
            .expect("run succeeds");
        assert_eq!(summary.persisted, 1);
    }

    #[tokio::test]
    async fn daily_trigger_covers_the_finished_portal_day() {
        let h = harness(
            FixedPortal {
                // 14:30 IST on 2025-03-05
                docs: vec![doc(1)],
                session_fails: false,
            },
            FakeDocuments::new(),
        );
        let runner = GuardedRunner::new(Arc::new(h.pipeline));

        // 02:00 IST on 2025-03-06
        let fired_at = Utc.with_ymd_and_hms(2025, 3, 5, 20, 30, 0).single().unwrap();
        assert_eq!(runner.trigger_date(fired_at, 0), target().succ_opt().unwrap());
        let daily = runner.trigger_date(fired_at, 1);
        assert_eq!(daily, target());

        let summary = runner
            .try_run("daily", daily)
            .await
            .expect("guard free")
            .expect("run succeeds");
        assert_eq!(summary.persisted, 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let h = harness(
            FixedPortal {
                docs: Vec::new(),
                session_fails: false,
            },
            FakeDocuments::new(),
        );
        let runner = GuardedRunner::new(Arc::new(h.pipeline));
        let sched = build_scheduler(runner, &PipelineConfig::default()).await.unwrap();
        assert!(sched.is_none());
    }
}
