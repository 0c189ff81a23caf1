//! Rotation schedule and the background rotation task
//!
//! Scheduling is advisory: an unreadable or disabled schedule simply means no
//! rotation is due. The daily rotation time is an `HH:MM` time of day in UTC.

use crate::error::Result;
use crate::service::{KmsService, RotationReason};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default daily rotation time (UTC)
pub const DEFAULT_DAILY_ROTATION_TIME: &str = "02:00";

/// Daily rotation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRotation {
    pub enabled: bool,
    /// Time of day in `HH:MM` (UTC)
    pub time: String,
}

impl Default for DailyRotation {
    fn default() -> Self {
        Self {
            enabled: false,
            time: DEFAULT_DAILY_ROTATION_TIME.to_string(),
        }
    }
}

/// Emergency rotation settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRotation {
    pub enabled: bool,
    /// Allow-list of trigger names that may request an emergency rotation
    pub triggers: Vec<String>,
}

/// Rotation policy published by the key registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSchedule {
    #[serde(default)]
    pub daily_rotation: DailyRotation,
    #[serde(default)]
    pub emergency_rotation: EmergencyRotation,
}

impl RotationSchedule {
    /// Creates a schedule with daily rotation enabled at `time`
    pub fn daily(time: impl Into<String>) -> Self {
        Self {
            daily_rotation: DailyRotation {
                enabled: true,
                time: time.into(),
            },
            ..Self::default()
        }
    }

    /// Enables emergency rotation for the given triggers
    pub fn with_emergency_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emergency_rotation = EmergencyRotation {
            enabled: true,
            triggers: triggers.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Checks if `trigger` may request an emergency rotation
    pub fn allows_trigger(&self, trigger: &str) -> bool {
        self.emergency_rotation.enabled
            && self
                .emergency_rotation
                .triggers
                .iter()
                .any(|allowed| allowed == trigger)
    }
}

/// Parses an `HH:MM` time of day
pub fn parse_time_of_day(time: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()
}

/// The most recent daily rotation boundary at or before `now`
pub fn last_rotation_boundary(time_of_day: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time_of_day).and_utc();
    if today <= now {
        today
    } else {
        today - Duration::days(1)
    }
}

/// Checks if a key created at `created_at` should be rotated under `schedule`
///
/// A rotation is due once a daily boundary has passed since the key was
/// created. Missing, disabled or unparseable schedules never require rotation.
pub fn is_rotation_due(
    schedule: Option<&RotationSchedule>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let Some(schedule) = schedule else {
        return false;
    };
    if !schedule.daily_rotation.enabled {
        return false;
    }
    let Some(time_of_day) = parse_time_of_day(&schedule.daily_rotation.time) else {
        log::warn!(
            "ignoring unparseable daily rotation time {:?}",
            schedule.daily_rotation.time
        );
        return false;
    };

    created_at < last_rotation_boundary(time_of_day, now)
}

/// Handle to a running rotation scheduler
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for the task to finish
    pub async fn shutdown(self) -> Result<()> {
        // The receiver may already be gone if the task ended on its own
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| crate::error::Error::Internal(format!("scheduler task failed: {}", e)))
    }
}

/// Periodically checks the registry schedule and rotates keys when due
#[derive(Debug)]
pub struct RotationScheduler {
    service: Arc<KmsService>,
    check_interval: std::time::Duration,
}

impl RotationScheduler {
    /// Creates a scheduler that checks every `check_interval`
    pub fn new(service: Arc<KmsService>, check_interval: std::time::Duration) -> Self {
        Self {
            service,
            check_interval,
        }
    }

    /// Runs a single check, rotating if due. Returns true if a rotation happened.
    pub async fn tick(&self) -> Result<bool> {
        if !self.service.check_rotation_needed().await {
            return Ok(false);
        }

        let rotation = self.service.rotate_keys(RotationReason::Scheduled).await?;
        log::info!(
            "scheduled rotation issued key version {} ({})",
            rotation.new_version,
            rotation.new_key_id
        );
        Ok(true)
    }

    /// Starts the scheduler on the current tokio runtime
    pub fn spawn(self) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            log::error!("scheduled key rotation failed: {}", e);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            log::debug!("rotation scheduler stopped");
        });

        SchedulerHandle { stop, task }
    }
}
