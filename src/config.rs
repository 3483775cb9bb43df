use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;

/// Booking rules the engine enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Business day opens (first candidate slot).
    pub day_open: NaiveTime,
    /// Business day closes (no slot may end after this).
    pub day_close: NaiveTime,
    /// Idle gap between consecutive offered slots.
    pub slot_buffer_minutes: u32,
    /// Minimum lead time before a confirmed appointment may be moved.
    pub reschedule_notice_minutes: u32,
    /// How far ahead the reminder sweep looks.
    pub reminder_window_minutes: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            day_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            day_close: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
            slot_buffer_minutes: 15,
            reschedule_notice_minutes: 120,
            reminder_window_minutes: 120,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.day_close <= self.day_open {
            return Err(ConfigError::Invalid {
                key: "SLOTBOOK_DAY_CLOSE",
                reason: "business day must close after it opens",
            });
        }
        if self.slot_buffer_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "SLOTBOOK_SLOT_BUFFER_MINUTES",
                reason: "buffer must be at least one minute",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Unparsable { key: &'static str, value: String },
    Invalid { key: &'static str, reason: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Unparsable { key, value } => write!(f, "{key}: cannot parse {value:?}"),
            ConfigError::Invalid { key, reason } => write!(f, "{key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Matches the default reminder window so each appointment is reminded once.
    pub reminder_interval: Duration,
    pub draft_ttl: Duration,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            reminder_interval: Duration::from_secs(2 * 60 * 60),
            draft_ttl: Duration::from_secs(30 * 60),
            policy: Policy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys take defaults;
    /// present but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("SLOTBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let metrics_port = get("SLOTBOOK_METRICS_PORT")
            .map(|v| parse_number("SLOTBOOK_METRICS_PORT", &v))
            .transpose()?;
        let compact_threshold = get("SLOTBOOK_COMPACT_THRESHOLD")
            .map(|v| parse_number("SLOTBOOK_COMPACT_THRESHOLD", &v))
            .transpose()?
            .unwrap_or(defaults.compact_threshold);
        let reminder_interval = get("SLOTBOOK_REMINDER_INTERVAL_SECS")
            .map(|v| parse_number("SLOTBOOK_REMINDER_INTERVAL_SECS", &v))
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reminder_interval);
        let draft_ttl = get("SLOTBOOK_DRAFT_TTL_SECS")
            .map(|v| parse_number("SLOTBOOK_DRAFT_TTL_SECS", &v))
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(defaults.draft_ttl);

        let base = defaults.policy;
        let policy = Policy {
            day_open: get("SLOTBOOK_DAY_OPEN")
                .map(|v| parse_time("SLOTBOOK_DAY_OPEN", &v))
                .transpose()?
                .unwrap_or(base.day_open),
            day_close: get("SLOTBOOK_DAY_CLOSE")
                .map(|v| parse_time("SLOTBOOK_DAY_CLOSE", &v))
                .transpose()?
                .unwrap_or(base.day_close),
            slot_buffer_minutes: get("SLOTBOOK_SLOT_BUFFER_MINUTES")
                .map(|v| parse_number("SLOTBOOK_SLOT_BUFFER_MINUTES", &v))
                .transpose()?
                .unwrap_or(base.slot_buffer_minutes),
            reschedule_notice_minutes: get("SLOTBOOK_NOTICE_MINUTES")
                .map(|v| parse_number("SLOTBOOK_NOTICE_MINUTES", &v))
                .transpose()?
                .unwrap_or(base.reschedule_notice_minutes),
            reminder_window_minutes: get("SLOTBOOK_REMINDER_WINDOW_MINUTES")
                .map(|v| parse_number("SLOTBOOK_REMINDER_WINDOW_MINUTES", &v))
                .transpose()?
                .unwrap_or(base.reminder_window_minutes),
        };
        policy.validate()?;

        Ok(Self {
            data_dir,
            metrics_port,
            compact_threshold,
            reminder_interval,
            draft_ttl,
            policy,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Unparsable {
        key,
        value: value.to_string(),
    })
}

/// Accepts `HH:MM` or `HH:MM:SS`.
fn parse_time(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Unparsable {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.policy.day_open, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(config.policy.day_close, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert_eq!(config.policy.slot_buffer_minutes, 15);
        assert_eq!(config.policy.reschedule_notice_minutes, 120);
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_DAY_OPEN", "08:30"),
            ("SLOTBOOK_DAY_CLOSE", "20:00:00"),
            ("SLOTBOOK_SLOT_BUFFER_MINUTES", "10"),
            ("SLOTBOOK_DRAFT_TTL_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.policy.day_open, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(config.policy.day_close, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(config.policy.slot_buffer_minutes, 10);
        assert_eq!(config.draft_ttl, Duration::from_secs(60));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[("SLOTBOOK_METRICS_PORT", "  ")])).unwrap();
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[("SLOTBOOK_METRICS_PORT", "ninety")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Unparsable { key: "SLOTBOOK_METRICS_PORT", .. }
        ));
    }

    #[test]
    fn malformed_time_is_rejected() {
        let err = Config::from_lookup(lookup(&[("SLOTBOOK_DAY_OPEN", "9am")])).unwrap_err();
        assert!(err.to_string().contains("SLOTBOOK_DAY_OPEN"));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("SLOTBOOK_DAY_OPEN", "18:00"),
            ("SLOTBOOK_DAY_CLOSE", "09:00"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLOTBOOK_DAY_CLOSE", .. }));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let err =
            Config::from_lookup(lookup(&[("SLOTBOOK_SLOT_BUFFER_MINUTES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
