//! Reminder scanner: a scheduled batch job that pushes near-due tasks to
//! their receivers. Never touches dialog sessions.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::channels::{Notifier, notify_within};
use crate::config::{ReminderConfig, Timeouts};
use crate::error::{ConfigError, DatabaseError};
use crate::store::{self, Database, Task};

/// Outcome counts of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub notified: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReminderScanner {
    store: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    config: ReminderConfig,
    timeouts: Timeouts,
}

impl ReminderScanner {
    pub fn new(
        store: Arc<dyn Database>,
        notifier: Arc<dyn Notifier>,
        config: ReminderConfig,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            timeouts,
        }
    }

    /// Today's calendar date in the configured offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.config.utc_offset).date_naive()
    }

    /// Notify the receiver of every task due within the window, counting
    /// from `today`. A failed push is logged and the scan moves on.
    pub async fn scan(&self, today: NaiveDate) -> Result<ScanReport, DatabaseError> {
        let tasks = store::with_timeout(self.timeouts.store, self.store.list_tasks()).await?;
        let mut report = ScanReport {
            scanned: tasks.len(),
            ..ScanReport::default()
        };

        for task in &tasks {
            let remaining = (task.deadline - today).num_days();
            if !(0..=self.config.window_days).contains(&remaining) {
                report.skipped += 1;
                continue;
            }

            let text = reminder_text(task, remaining);
            match notify_within(
                self.notifier.as_ref(),
                self.timeouts.notify,
                task.receiver_id,
                &text,
            )
            .await
            {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    warn!(task_id = task.id, receiver = task.receiver_id, error = %e, "Reminder failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            %today,
            scanned = report.scanned,
            notified = report.notified,
            skipped = report.skipped,
            failed = report.failed,
            "Reminder scan finished"
        );
        Ok(report)
    }
}

fn reminder_text(task: &Task, remaining: i64) -> String {
    let when = match remaining {
        0 => "due today".to_string(),
        1 => "due tomorrow".to_string(),
        n => format!("due in {n} days"),
    };
    format!(
        "⏰ Reminder: task #{} is {when}.\n\n📌 {}\n📅 Deadline: {}",
        task.id, task.description, task.deadline
    )
}

/// Spawn the reminder loop: sleep until the next cron fire time (evaluated in
/// the configured offset), then scan.
pub fn spawn_reminder_ticker(
    scanner: Arc<ReminderScanner>,
) -> Result<tokio::task::JoinHandle<()>, ConfigError> {
    let schedule = cron::Schedule::from_str(&scanner.config.schedule).map_err(|e| {
        ConfigError::InvalidValue {
            key: "REMINDER_SCHEDULE".into(),
            message: e.to_string(),
        }
    })?;
    let offset = scanner.config.utc_offset;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(offset).next() else {
                warn!("Reminder schedule has no upcoming fire time, stopping");
                break;
            };
            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or_default();
            tracing::debug!(next = %next, "Next reminder scan");
            tokio::time::sleep(wait).await;

            let today = scanner.today();
            if let Err(e) = scanner.scan(today).await {
                tracing::error!("Reminder scan failed: {}", e);
            }
        }
    }))
}
