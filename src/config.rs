use crate::db;
use crate::model::Honors;
use chrono::NaiveTime;
use chrono_tz::Tz;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const SETTINGS_KEY: &str = "engine.config";
/// Longest accepted detector window, in days.
pub const MAX_WINDOW_DAYS: u32 = 366;
pub const MAX_WINDOW_WEEKS: u32 = 52;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorsBand {
    pub lower_bound: Decimal,
    pub label: Honors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EngineConfig {
    pub timezone: String,
    pub absence_threshold: u32,
    pub absence_window_days: u32,
    pub late_threshold: u32,
    pub late_window_days: u32,
    pub consecutive_threshold: u32,
    pub consecutive_window_days: u32,
    pub pattern_threshold: u32,
    pub pattern_window_weeks: u32,
    pub risk_general_threshold: Decimal,
    pub risk_subject_threshold: Decimal,
    pub daily_sweep_local_time: String,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub unit_deadline_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub inner_retry_limit: u32,
    pub drain_deadline_ms: u64,
    pub transient_error_ceiling: u32,
    pub periodic_enabled: bool,
    pub honors_bands: Vec<HonorsBand>,
    pub sinks: Vec<String>,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Paris".to_string(),
            absence_threshold: 5,
            absence_window_days: 30,
            late_threshold: 10,
            late_window_days: 30,
            consecutive_threshold: 3,
            consecutive_window_days: 14,
            pattern_threshold: 3,
            pattern_window_weeks: 4,
            risk_general_threshold: Decimal::from(10),
            risk_subject_threshold: Decimal::from(10),
            daily_sweep_local_time: "16:00".to_string(),
            worker_count: default_worker_count(),
            queue_capacity: 1024,
            unit_deadline_ms: 5 * 60 * 1000,
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            inner_retry_limit: 3,
            drain_deadline_ms: 30_000,
            transient_error_ceiling: 50,
            periodic_enabled: true,
            honors_bands: vec![
                HonorsBand {
                    lower_bound: Decimal::from(12),
                    label: Honors::Encouragements,
                },
                HonorsBand {
                    lower_bound: Decimal::from(14),
                    label: Honors::Compliments,
                },
                HonorsBand {
                    lower_bound: Decimal::from(16),
                    label: Honors::Felicitations,
                },
            ],
            sinks: vec!["jsonl".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn tz(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| format!("timezone is not a known IANA zone: {}", self.timezone))
    }

    pub fn sweep_time(&self) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(self.daily_sweep_local_time.trim(), "%H:%M")
            .map_err(|_| "dailySweepLocalTime must be HH:MM".to_string())
    }

    pub fn unit_deadline(&self) -> Duration {
        Duration::from_millis(self.unit_deadline_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    /// Exponential backoff for the given (1-based) retry attempt, capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base_ms.max(1);
        let exp = attempt.saturating_sub(1).min(20);
        let delay = base.saturating_mul(1_u64 << exp);
        Duration::from_millis(delay.min(self.backoff_max_ms.max(base)))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.tz()?;
        self.sweep_time()?;
        let positive = [
            ("absenceThreshold", self.absence_threshold),
            ("absenceWindowDays", self.absence_window_days),
            ("lateThreshold", self.late_threshold),
            ("lateWindowDays", self.late_window_days),
            ("consecutiveThreshold", self.consecutive_threshold),
            ("consecutiveWindowDays", self.consecutive_window_days),
            ("patternThreshold", self.pattern_threshold),
            ("patternWindowWeeks", self.pattern_window_weeks),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(format!("{} must be >= 1", key));
            }
        }
        let windows = [
            ("absenceWindowDays", self.absence_window_days, MAX_WINDOW_DAYS),
            ("lateWindowDays", self.late_window_days, MAX_WINDOW_DAYS),
            ("consecutiveWindowDays", self.consecutive_window_days, MAX_WINDOW_DAYS),
            ("patternWindowWeeks", self.pattern_window_weeks, MAX_WINDOW_WEEKS),
        ];
        for (key, value, max) in windows {
            if value > max {
                return Err(format!("{} must be <= {}", key, max));
            }
        }
        if self.worker_count == 0 || self.worker_count > 256 {
            return Err("workerCount must be in 1..=256".into());
        }
        if self.queue_capacity == 0 {
            return Err("queueCapacity must be >= 1".into());
        }
        if self.unit_deadline_ms == 0 {
            return Err("unitDeadlineMs must be >= 1".into());
        }
        if self.risk_general_threshold.is_sign_negative()
            || self.risk_subject_threshold.is_sign_negative()
        {
            return Err("risk thresholds must not be negative".into());
        }
        let mut prev: Option<Decimal> = None;
        for band in &self.honors_bands {
            if band.label == Honors::None {
                return Err("honorsBands must not use the NONE label".into());
            }
            if let Some(p) = prev {
                if band.lower_bound <= p {
                    return Err("honorsBands must be strictly ascending".into());
                }
            }
            prev = Some(band.lower_bound);
        }
        for sink in &self.sinks {
            if sink != "jsonl" && sink != "memory" {
                return Err(format!("unknown sink: {}", sink));
            }
        }
        Ok(())
    }

    /// Overlay `patch` on this config. Unknown keys and invalid values are rejected.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<EngineConfig, String> {
        let mut current = serde_json::to_value(self).map_err(|e| e.to_string())?;
        let Some(obj) = current.as_object_mut() else {
            return Err("config must serialize to an object".into());
        };
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
        let next: EngineConfig = serde_json::from_value(current).map_err(|e| e.to_string())?;
        next.validate()?;
        Ok(next)
    }
}

pub fn load(conn: &Connection) -> anyhow::Result<EngineConfig> {
    let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? else {
        return Ok(EngineConfig::default());
    };
    match saved.as_object() {
        // Malformed historical values fall back to defaults rather than blocking the workspace.
        Some(obj) => match EngineConfig::default().merged(obj) {
            Ok(cfg) => Ok(cfg),
            Err(msg) => {
                tracing::warn!(error = %msg, "stored engine config rejected; using defaults");
                Ok(EngineConfig::default())
            }
        },
        None => Ok(EngineConfig::default()),
    }
}

pub fn save(conn: &Connection, cfg: &EngineConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("defaults valid");
        assert_eq!(cfg.tz().expect("tz"), chrono_tz::Europe::Paris);
        assert_eq!(
            cfg.sweep_time().expect("time"),
            NaiveTime::from_hms_opt(16, 0, 0).expect("time")
        );
    }

    #[test]
    fn patch_overrides_and_validates() {
        let cfg = EngineConfig::default();
        let patch = json!({ "absenceThreshold": 7, "timezone": "UTC" });
        let next = cfg.merged(patch.as_object().expect("obj")).expect("merge");
        assert_eq!(next.absence_threshold, 7);
        assert_eq!(next.timezone, "UTC");

        let bad = json!({ "timezone": "Mars/Olympus" });
        assert!(cfg.merged(bad.as_object().expect("obj")).is_err());

        let unknown = json!({ "nope": 1 });
        assert!(cfg.merged(unknown.as_object().expect("obj")).is_err());

        let zero = json!({ "lateThreshold": 0 });
        assert!(cfg.merged(zero.as_object().expect("obj")).is_err());
    }

    #[test]
    fn window_lengths_are_capped() {
        let cfg = EngineConfig::default();
        for patch in [
            json!({ "absenceWindowDays": 100_000_000 }),
            json!({ "lateWindowDays": 367 }),
            json!({ "consecutiveWindowDays": u32::MAX }),
            json!({ "patternWindowWeeks": 53 }),
        ] {
            assert!(cfg.merged(patch.as_object().expect("obj")).is_err(), "{}", patch);
        }
        let widest = json!({ "absenceWindowDays": 366, "patternWindowWeeks": 52 });
        let next = cfg.merged(widest.as_object().expect("obj")).expect("at cap");
        assert_eq!(next.absence_window_days, 366);
    }

    #[test]
    fn honors_bands_must_ascend() {
        let cfg = EngineConfig::default();
        let patch = json!({
            "honorsBands": [
                { "lowerBound": "14", "label": "COMPLIMENTS" },
                { "lowerBound": "12", "label": "ENCOURAGEMENTS" }
            ]
        });
        assert!(cfg.merged(patch.as_object().expect("obj")).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = EngineConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(cfg.backoff_delay(9), Duration::from_millis(1_000));
    }

    #[test]
    fn saved_config_round_trips_through_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let mut cfg = EngineConfig::default();
        cfg.pattern_threshold = 4;
        save(&conn, &cfg).expect("save");
        assert_eq!(load(&conn).expect("load").pattern_threshold, 4);
    }
}
