//! Configuration types, loaded from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use secrecy::SecretString;

use crate::access::DirectoryVisibility;
use crate::error::ConfigError;

/// Default reminder schedule: every day at 08:00 (seconds-first cron).
pub const DEFAULT_REMINDER_SCHEDULE: &str = "0 0 8 * * *";

/// Top-level bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram Bot API token.
    pub bot_token: SecretString,
    /// Chat id of the owner.
    pub owner_id: i64,
    /// Alias assigned to the owner identity on first boot.
    pub owner_alias: String,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    pub reminder: ReminderConfig,
    pub timeouts: Timeouts,
    /// Dialog sessions idle longer than this are dropped.
    pub session_idle_timeout: Duration,
    /// Who may list identities and pending requests.
    pub directory_visibility: DirectoryVisibility,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

/// Reminder scanner configuration.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub enabled: bool,
    /// Cron expression (seconds first), evaluated in `utc_offset`.
    pub schedule: String,
    /// Urgency window in days (inclusive).
    pub window_days: i64,
    /// Fixed calendar offset used for "today" and for the schedule.
    pub utc_offset: FixedOffset,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: DEFAULT_REMINDER_SCHEDULE.to_string(),
            window_days: 7,
            utc_offset: Utc.fix(),
        }
    }
}

/// Timeouts applied to every store access and outbound notification.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub store: Duration,
    pub notify: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(5),
            notify: Duration::from_secs(10),
        }
    }
}

impl BotConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELEGRAM_BOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let owner_id: i64 = parse_required(&lookup, "OWNER_ID")?;
        let owner_alias = lookup("OWNER_ALIAS").unwrap_or_else(|| "owner".to_string());

        let db_path = lookup("TASKBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/taskbot.db"));

        let offset_hours: i32 = parse_or(&lookup, "REMINDER_UTC_OFFSET_HOURS", 0)?;
        if !(-12..=14).contains(&offset_hours) {
            return Err(ConfigError::InvalidValue {
                key: "REMINDER_UTC_OFFSET_HOURS".into(),
                message: format!("{offset_hours} is outside -12..=14"),
            });
        }
        let utc_offset =
            FixedOffset::east_opt(offset_hours * 3600).ok_or_else(|| ConfigError::InvalidValue {
                key: "REMINDER_UTC_OFFSET_HOURS".into(),
                message: format!("{offset_hours} is not a valid offset"),
            })?;

        let schedule =
            lookup("REMINDER_SCHEDULE").unwrap_or_else(|| DEFAULT_REMINDER_SCHEDULE.to_string());
        if let Err(e) = cron::Schedule::from_str(&schedule) {
            return Err(ConfigError::InvalidValue {
                key: "REMINDER_SCHEDULE".into(),
                message: e.to_string(),
            });
        }

        let window_days: i64 = parse_or(&lookup, "REMINDER_WINDOW_DAYS", 7)?;
        if window_days < 0 {
            return Err(ConfigError::InvalidValue {
                key: "REMINDER_WINDOW_DAYS".into(),
                message: "must not be negative".into(),
            });
        }

        let reminder = ReminderConfig {
            enabled: parse_or(&lookup, "REMINDER_ENABLED", true)?,
            schedule,
            window_days,
            utc_offset,
        };

        let timeouts = Timeouts {
            store: Duration::from_secs(parse_or(&lookup, "STORE_TIMEOUT_SECS", 5)?),
            notify: Duration::from_secs(parse_or(&lookup, "NOTIFY_TIMEOUT_SECS", 10)?),
        };

        let idle_minutes: u64 = parse_or(&lookup, "SESSION_IDLE_MINUTES", 30)?;
        let idle_secs = idle_minutes
            .checked_mul(60)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "SESSION_IDLE_MINUTES".into(),
                message: format!("{idle_minutes} minutes is too large"),
            })?;

        let directory_visibility = match lookup("DIRECTORY_VISIBILITY") {
            Some(v) => v.parse().map_err(|message| ConfigError::InvalidValue {
                key: "DIRECTORY_VISIBILITY".into(),
                message,
            })?,
            None => DirectoryVisibility::default(),
        };

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            owner_id,
            owner_alias,
            db_path,
            reminder,
            timeouts,
            session_idle_timeout: Duration::from_secs(idle_secs),
            directory_visibility,
            log_dir: lookup("TASKBOT_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_required<T, F>(lookup: &F, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
