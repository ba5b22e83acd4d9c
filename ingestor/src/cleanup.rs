//! Periodic wipe of all telemetry readings.
//!
//! The schedule lives in the repository so it survives restarts. Run times
//! are chosen in a fixed +05:30 civil offset for the first run only; every
//! later run is the previous execution instant plus `interval_days`, so a late
//! tick never shifts the cadence.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::metrics::{CLEANUP_DELETED_TOTAL, CLEANUP_RUNS_TOTAL};
use crate::model::{CleanupSchedule, CleanupScheduleUpdate};
use crate::periodic::{PeriodicTask, ReentrancyGuard};
use crate::repository::Repository;

pub const CLEANUP_TASK_NAME: &str = "device_data_cleanup";

/// +05:30
pub const CIVIL_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub fn civil_offset() -> FixedOffset {
    FixedOffset::east_opt(CIVIL_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    pub check_interval: std::time::Duration,
    pub interval_days: i32,
    pub execution_hour: u32,
    pub execution_minute: u32,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        CleanupSettings {
            check_interval: std::time::Duration::from_secs(60),
            interval_days: 2,
            execution_hour: 0,
            execution_minute: 0,
        }
    }
}

fn interval(interval_days: i32) -> Duration {
    Duration::days(i64::from(interval_days.max(1)))
}

/// First run for a schedule with no history: `hour:minute` civil time,
/// `interval_days` calendar days after today's civil date, stored as UTC.
pub fn initial_next_run(now: DateTime<Utc>, interval_days: i32, hour: u32, minute: u32) -> DateTime<Utc> {
    let offset = civil_offset();
    let date = now.with_timezone(&offset).date_naive() + interval(interval_days);
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| now + interval(interval_days))
}

/// Next run after an execution that happened at `executed_at`.
pub fn next_run_after(executed_at: DateTime<Utc>, interval_days: i32) -> DateTime<Utc> {
    executed_at + interval(interval_days)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Uninitialized,
    IdleEnabled,
    IdleDisabled,
    Running,
}

/// Point-in-time view of the scheduler for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStatus {
    pub task_name: String,
    pub state: SchedulerState,
    pub is_enabled: bool,
    pub is_running: bool,
    pub interval_days: i32,
    pub execution_hour: u32,
    pub execution_minute: u32,
    pub timezone: String,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_scheduled_time: Option<DateTime<Utc>>,
    pub next_scheduled_local: Option<String>,
    pub seconds_until_next: Option<i64>,
}

pub struct CleanupScheduler {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    settings: CleanupSettings,
    guard: ReentrancyGuard,
    task: Mutex<Option<PeriodicTask>>,
}

impl CleanupScheduler {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, settings: CleanupSettings) -> Self {
        CleanupScheduler {
            repo,
            clock,
            settings,
            guard: ReentrancyGuard::new(),
            task: Mutex::new(None),
        }
    }

    /// Loads the schedule, creating it on first use.
    pub async fn ensure_schedule(&self) -> Result<CleanupSchedule> {
        if let Some(schedule) = self.repo.get_cleanup_schedule(CLEANUP_TASK_NAME).await? {
            return Ok(schedule);
        }

        let now = self.clock.now();
        let schedule = CleanupSchedule {
            task_name: CLEANUP_TASK_NAME.to_string(),
            last_execution_time: None,
            next_scheduled_time: initial_next_run(
                now,
                self.settings.interval_days,
                self.settings.execution_hour,
                self.settings.execution_minute,
            ),
            interval_days: self.settings.interval_days.max(1),
            execution_hour: self.settings.execution_hour,
            execution_minute: self.settings.execution_minute,
            is_enabled: true,
        };
        let created = self.repo.create_cleanup_schedule(&schedule).await?;
        info!(
            next_run = %created.next_scheduled_time,
            interval_days = created.interval_days,
            "Created cleanup schedule"
        );
        Ok(created)
    }

    /// Creates the schedule if needed and starts the check timer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let schedule = self.ensure_schedule().await?;
        info!(
            enabled = schedule.is_enabled,
            next_run = %schedule.next_scheduled_time,
            "Cleanup scheduler starting"
        );

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }
        let scheduler = self.clone();
        *task = Some(PeriodicTask::spawn(
            "cleanup-scheduler",
            self.settings.check_interval,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.tick().await {
                        error!(error = %e, "Cleanup check failed");
                    }
                }
            },
        ));
        Ok(())
    }

    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Runs the wipe if the schedule is enabled and due. Returns the number
    /// of deleted readings when a run happened.
    pub async fn tick(&self) -> Result<Option<u64>> {
        if self.guard.is_running() {
            debug!("Cleanup already running, skipping check");
            return Ok(None);
        }

        let schedule = self.ensure_schedule().await?;
        if !schedule.is_enabled {
            return Ok(None);
        }

        let now = self.clock.now();
        if now < schedule.next_scheduled_time {
            return Ok(None);
        }

        info!(
            due = %schedule.next_scheduled_time,
            late_by_secs = (now - schedule.next_scheduled_time).num_seconds(),
            "Scheduled cleanup is due"
        );
        match self.run_cleanup().await {
            Ok(deleted) => Ok(Some(deleted)),
            Err(Error::Busy(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes every reading now and reschedules from this execution.
    /// Fails with [`Error::Busy`] if another run is in progress. On storage
    /// failure the schedule is left as it was, so the next check retries.
    pub async fn run_cleanup(&self) -> Result<u64> {
        let Some(_permit) = self.guard.try_enter() else {
            return Err(Error::Busy("cleanup is already running".to_string()));
        };

        let schedule = self.ensure_schedule().await?;
        let executed_at = self.clock.now();

        let deleted = match self.repo.clear_all_device_data().await {
            Ok(deleted) => deleted,
            Err(e) => {
                CLEANUP_RUNS_TOTAL.with_label_values(&["failed"]).inc();
                error!(error = %e, "Cleanup failed, schedule left unchanged");
                return Err(e);
            }
        };

        let next = next_run_after(executed_at, schedule.interval_days);
        let update = CleanupScheduleUpdate {
            last_execution_time: Some(executed_at),
            next_scheduled_time: Some(next),
            is_enabled: None,
        };
        if self
            .repo
            .update_cleanup_schedule(CLEANUP_TASK_NAME, update)
            .await?
            .is_none()
        {
            warn!("Cleanup schedule vanished during run; it will be recreated");
        }

        CLEANUP_RUNS_TOTAL.with_label_values(&["succeeded"]).inc();
        CLEANUP_DELETED_TOTAL.inc_by(deleted as f64);
        info!(
            deleted,
            executed_at = %executed_at,
            next_run = %next,
            "Cleanup completed"
        );
        Ok(deleted)
    }

    pub async fn get_config(&self) -> Result<CleanupStatus> {
        let schedule = self.repo.get_cleanup_schedule(CLEANUP_TASK_NAME).await?;
        let is_running = self.guard.is_running();
        let offset = civil_offset();
        let now = self.clock.now();

        let status = match schedule {
            Some(schedule) => CleanupStatus {
                task_name: schedule.task_name,
                state: if is_running {
                    SchedulerState::Running
                } else if schedule.is_enabled {
                    SchedulerState::IdleEnabled
                } else {
                    SchedulerState::IdleDisabled
                },
                is_enabled: schedule.is_enabled,
                is_running,
                interval_days: schedule.interval_days,
                execution_hour: schedule.execution_hour,
                execution_minute: schedule.execution_minute,
                timezone: offset.to_string(),
                last_execution_time: schedule.last_execution_time,
                next_scheduled_time: Some(schedule.next_scheduled_time),
                next_scheduled_local: Some(
                    schedule
                        .next_scheduled_time
                        .with_timezone(&offset)
                        .to_rfc3339(),
                ),
                seconds_until_next: Some((schedule.next_scheduled_time - now).num_seconds().max(0)),
            },
            None => CleanupStatus {
                task_name: CLEANUP_TASK_NAME.to_string(),
                state: SchedulerState::Uninitialized,
                is_enabled: false,
                is_running,
                interval_days: self.settings.interval_days,
                execution_hour: self.settings.execution_hour,
                execution_minute: self.settings.execution_minute,
                timezone: offset.to_string(),
                last_execution_time: None,
                next_scheduled_time: None,
                next_scheduled_local: None,
                seconds_until_next: None,
            },
        };
        Ok(status)
    }

    /// Toggles the schedule without moving the next run time.
    pub async fn set_enabled(&self, enabled: bool) -> Result<CleanupSchedule> {
        self.ensure_schedule().await?;
        let update = CleanupScheduleUpdate {
            is_enabled: Some(enabled),
            ..Default::default()
        };
        let schedule = self
            .repo
            .update_cleanup_schedule(CLEANUP_TASK_NAME, update)
            .await?
            .ok_or_else(|| Error::NotFound(CLEANUP_TASK_NAME.to_string()))?;
        info!(enabled, "Cleanup schedule toggled");
        Ok(schedule)
    }

    /// Recomputes the next run from the last execution (or, with no history,
    /// from now) and re-enables the schedule.
    pub async fn reset_schedule(&self) -> Result<CleanupSchedule> {
        let schedule = self.ensure_schedule().await?;
        let next = match schedule.last_execution_time {
            Some(last) => next_run_after(last, schedule.interval_days),
            None => initial_next_run(
                self.clock.now(),
                schedule.interval_days,
                schedule.execution_hour,
                schedule.execution_minute,
            ),
        };
        let update = CleanupScheduleUpdate {
            last_execution_time: None,
            next_scheduled_time: Some(next),
            is_enabled: Some(true),
        };
        let schedule = self
            .repo
            .update_cleanup_schedule(CLEANUP_TASK_NAME, update)
            .await?
            .ok_or_else(|| Error::NotFound(CLEANUP_TASK_NAME.to_string()))?;
        info!(next_run = %schedule.next_scheduled_time, "Cleanup schedule reset");
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::TelemetryReading;
    use crate::repository::MemoryRepository;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn scheduler(repo: &Arc<MemoryRepository>, clock: &Arc<ManualClock>) -> Arc<CleanupScheduler> {
        Arc::new(CleanupScheduler::new(
            repo.clone(),
            clock.clone(),
            CleanupSettings::default(),
        ))
    }

    async fn seed(repo: &MemoryRepository, n: i32) {
        for level in 0..n {
            repo.create_device_data(&TelemetryReading::new("D1", level, Utc::now()))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_initial_run_is_civil_midnight() {
        // 20:00 UTC is already 01:30 the next day at +05:30
        let next = initial_next_run(at(2024, 5, 1, 20, 0), 2, 0, 0);
        assert_eq!(next, at(2024, 5, 3, 18, 30));

        let next = initial_next_run(at(2024, 5, 1, 10, 0), 2, 3, 15);
        assert_eq!(next, at(2024, 5, 2, 21, 45));
    }

    #[test]
    fn test_next_run_is_pure_duration_addition() {
        let executed = at(2024, 5, 3, 19, 7);
        assert_eq!(
            next_run_after(executed, 2) - executed,
            Duration::seconds(172_800)
        );
    }

    #[tokio::test]
    async fn test_schedule_created_lazily_once() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);

        assert_eq!(
            scheduler.get_config().await.unwrap().state,
            SchedulerState::Uninitialized
        );
        let first = scheduler.ensure_schedule().await.unwrap();
        clock.advance(Duration::hours(5));
        let second = scheduler.ensure_schedule().await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_enabled);
        assert_eq!(first.interval_days, 2);
    }

    #[tokio::test]
    async fn test_late_tick_does_not_drift() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);
        let due = scheduler.ensure_schedule().await.unwrap().next_scheduled_time;

        clock.set(due - Duration::seconds(1));
        assert_eq!(scheduler.tick().await.unwrap(), None);

        let fired = due + Duration::minutes(37);
        clock.set(fired);
        seed(&repo, 3).await;
        assert_eq!(scheduler.tick().await.unwrap(), Some(3));

        let schedule = repo.get_cleanup_schedule(CLEANUP_TASK_NAME).await.unwrap().unwrap();
        assert_eq!(schedule.last_execution_time, Some(fired));
        assert_eq!(schedule.next_scheduled_time, fired + Duration::seconds(172_800));
    }

    #[tokio::test]
    async fn test_manual_run_wipes_and_reschedules() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 6, 10, 9, 0)));
        let scheduler = scheduler(&repo, &clock);
        seed(&repo, 500).await;

        assert_eq!(scheduler.run_cleanup().await.unwrap(), 500);
        assert_eq!(repo.reading_count(), 0);

        let config = scheduler.get_config().await.unwrap();
        assert_eq!(config.last_execution_time, Some(clock.now()));
        assert_eq!(
            config.next_scheduled_time,
            Some(clock.now() + Duration::days(2))
        );
        assert_eq!(config.state, SchedulerState::IdleEnabled);
        assert_eq!(config.timezone, "+05:30");
    }

    #[tokio::test]
    async fn test_failed_wipe_keeps_schedule_and_retries() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);
        let before = scheduler.ensure_schedule().await.unwrap();
        seed(&repo, 4).await;

        clock.set(before.next_scheduled_time + Duration::seconds(5));
        repo.set_fail_clear(true);
        assert!(scheduler.tick().await.is_err());
        let after = repo.get_cleanup_schedule(CLEANUP_TASK_NAME).await.unwrap().unwrap();
        assert_eq!(after, before);

        repo.set_fail_clear(false);
        clock.advance(Duration::seconds(60));
        assert_eq!(scheduler.tick().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_disabled_schedule_never_runs() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);
        let before = scheduler.set_enabled(false).await.unwrap();
        seed(&repo, 2).await;

        clock.advance(Duration::days(10));
        assert_eq!(scheduler.tick().await.unwrap(), None);
        assert_eq!(repo.reading_count(), 2);

        let config = scheduler.get_config().await.unwrap();
        assert_eq!(config.state, SchedulerState::IdleDisabled);
        assert_eq!(config.next_scheduled_time, Some(before.next_scheduled_time));
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);

        let _permit = scheduler.guard.try_enter().unwrap();
        assert!(matches!(scheduler.run_cleanup().await, Err(Error::Busy(_))));
        assert_eq!(scheduler.tick().await.unwrap(), None);
        assert_eq!(
            scheduler.get_config().await.unwrap().state,
            SchedulerState::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_reset_uses_last_execution() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);

        let fresh = scheduler.reset_schedule().await.unwrap();
        assert_eq!(fresh.next_scheduled_time, at(2024, 5, 3, 18, 30));

        scheduler.run_cleanup().await.unwrap();
        let executed = clock.now();
        scheduler.set_enabled(false).await.unwrap();
        clock.advance(Duration::hours(30));

        let reset = scheduler.reset_schedule().await.unwrap();
        assert!(reset.is_enabled);
        assert_eq!(reset.last_execution_time, Some(executed));
        assert_eq!(reset.next_scheduled_time, executed + Duration::days(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_due_cleanup() {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(at(2024, 5, 1, 20, 0)));
        let scheduler = scheduler(&repo, &clock);
        scheduler.start().await.unwrap();
        seed(&repo, 7).await;

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert_eq!(repo.reading_count(), 7);

        clock.advance(Duration::days(3));
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert_eq!(repo.reading_count(), 0);

        scheduler.stop().await;
    }
}
