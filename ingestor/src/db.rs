use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    CleanupSchedule, CleanupScheduleUpdate, Credentials, Device, DeviceUpdate, OfflineEvent,
    TelemetryReading,
};
use crate::repository::Repository;

const MAX_ATTEMPTS: u32 = 5;

const DEVICE_COLUMNS: &str = "device_id, name, broker_host, broker_port, topic, protocol, \
     username, password, status, last_seen, is_active, display_order";

const SCHEDULE_COLUMNS: &str = "task_name, last_execution_time, next_scheduled_time, \
     interval_days, execution_hour, execution_minute, is_enabled";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed [`Repository`].
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    name: String,
    broker_host: String,
    broker_port: Option<i32>,
    topic: String,
    protocol: String,
    username: Option<String>,
    password: Option<String>,
    status: String,
    last_seen: Option<DateTime<Utc>>,
    is_active: bool,
    display_order: i32,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let credentials = row
            .username
            .filter(|u| !u.trim().is_empty())
            .map(|username| Credentials {
                username,
                password: row.password.unwrap_or_default(),
            });
        Ok(Device {
            device_id: row.device_id,
            name: row.name,
            broker_host: row.broker_host,
            broker_port: row.broker_port.and_then(|p| u16::try_from(p).ok()),
            topic: row.topic,
            protocol: row.protocol.parse()?,
            credentials,
            status: row.status.parse()?,
            last_seen: row.last_seen,
            is_active: row.is_active,
            display_order: row.display_order,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    task_name: String,
    last_execution_time: Option<DateTime<Utc>>,
    next_scheduled_time: DateTime<Utc>,
    interval_days: i32,
    execution_hour: i32,
    execution_minute: i32,
    is_enabled: bool,
}

impl From<ScheduleRow> for CleanupSchedule {
    fn from(row: ScheduleRow) -> Self {
        CleanupSchedule {
            task_name: row.task_name,
            last_execution_time: row.last_execution_time,
            next_scheduled_time: row.next_scheduled_time,
            interval_days: row.interval_days,
            execution_hour: row.execution_hour.clamp(0, 23) as u32,
            execution_minute: row.execution_minute.clamp(0, 59) as u32,
            is_enabled: row.is_enabled,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OfflineEventRow {
    device_id: String,
    offline_at: DateTime<Utc>,
}

/// Runs a statement, retrying transient connection failures with
/// exponential backoff.
async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(db_err) => {
                if attempts >= MAX_ATTEMPTS || !is_transient_error(&db_err) {
                    error!(
                        "Database {} failed permanently after {} attempts: {}",
                        op, attempts, db_err
                    );
                    return Err(Error::Database(db_err));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                    op, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_devices(&self) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {} FROM devices ORDER BY display_order, device_id",
            DEVICE_COLUMNS
        );
        let rows = with_retry("get_devices", || {
            sqlx::query_as::<_, DeviceRow>(&query).fetch_all(&self.pool)
        })
        .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        let row = with_retry("get_device", || {
            sqlx::query_as::<_, DeviceRow>(&query)
                .bind(device_id)
                .fetch_optional(&self.pool)
        })
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn update_device(&self, device_id: &str, update: DeviceUpdate) -> Result<Option<Device>> {
        let query = format!(
            "UPDATE devices \
             SET status = COALESCE($2, status), last_seen = COALESCE($3, last_seen) \
             WHERE device_id = $1 \
             RETURNING {}",
            DEVICE_COLUMNS
        );
        let status = update.status.map(|s| s.as_str());
        let row = with_retry("update_device", || {
            sqlx::query_as::<_, DeviceRow>(&query)
                .bind(device_id)
                .bind(status)
                .bind(update.last_seen)
                .fetch_optional(&self.pool)
        })
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn create_device_data(&self, reading: &TelemetryReading) -> Result<()> {
        with_retry("create_device_data", || {
            sqlx::query(
                "INSERT INTO device_data (device_id, ts, alcohol_level, alert_status) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&reading.device_id)
            .bind(reading.timestamp)
            .bind(reading.alcohol_level)
            .bind(reading.alert_status.as_str())
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn log_device_offline_event(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        with_retry("log_offline_event", || {
            sqlx::query("INSERT INTO device_offline_events (device_id, offline_at) VALUES ($1, $2)")
                .bind(device_id)
                .bind(at)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn get_offline_events(&self, device_id: &str) -> Result<Vec<OfflineEvent>> {
        let rows = with_retry("get_offline_events", || {
            sqlx::query_as::<_, OfflineEventRow>(
                "SELECT device_id, offline_at FROM device_offline_events \
                 WHERE device_id = $1 ORDER BY offline_at",
            )
            .bind(device_id)
            .fetch_all(&self.pool)
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| OfflineEvent {
                device_id: row.device_id,
                offline_at: row.offline_at,
            })
            .collect())
    }

    async fn get_cleanup_schedule(&self, task_name: &str) -> Result<Option<CleanupSchedule>> {
        let query = format!(
            "SELECT {} FROM cleanup_schedules WHERE task_name = $1",
            SCHEDULE_COLUMNS
        );
        let row = with_retry("get_cleanup_schedule", || {
            sqlx::query_as::<_, ScheduleRow>(&query)
                .bind(task_name)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(row.map(CleanupSchedule::from))
    }

    async fn create_cleanup_schedule(&self, schedule: &CleanupSchedule) -> Result<CleanupSchedule> {
        let query = format!(
            "INSERT INTO cleanup_schedules ({cols}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (task_name) DO UPDATE SET task_name = EXCLUDED.task_name \
             RETURNING {cols}",
            cols = SCHEDULE_COLUMNS
        );
        let row = with_retry("create_cleanup_schedule", || {
            sqlx::query_as::<_, ScheduleRow>(&query)
                .bind(&schedule.task_name)
                .bind(schedule.last_execution_time)
                .bind(schedule.next_scheduled_time)
                .bind(schedule.interval_days)
                .bind(schedule.execution_hour as i32)
                .bind(schedule.execution_minute as i32)
                .bind(schedule.is_enabled)
                .fetch_one(&self.pool)
        })
        .await?;
        Ok(row.into())
    }

    async fn update_cleanup_schedule(
        &self,
        task_name: &str,
        update: CleanupScheduleUpdate,
    ) -> Result<Option<CleanupSchedule>> {
        let query = format!(
            "UPDATE cleanup_schedules SET \
             last_execution_time = COALESCE($2, last_execution_time), \
             next_scheduled_time = COALESCE($3, next_scheduled_time), \
             is_enabled = COALESCE($4, is_enabled) \
             WHERE task_name = $1 RETURNING {}",
            SCHEDULE_COLUMNS
        );
        let row = with_retry("update_cleanup_schedule", || {
            sqlx::query_as::<_, ScheduleRow>(&query)
                .bind(task_name)
                .bind(update.last_execution_time)
                .bind(update.next_scheduled_time)
                .bind(update.is_enabled)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(row.map(CleanupSchedule::from))
    }

    async fn clear_all_device_data(&self) -> Result<u64> {
        let result = with_retry("clear_all_device_data", || {
            sqlx::query("DELETE FROM device_data").execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
