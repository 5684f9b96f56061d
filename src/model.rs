use chrono::{DateTime, NaiveDate, Utc, Weekday};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
    Excluded,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Some(Self::Present),
            "ABSENT" => Some(Self::Absent),
            "LATE" => Some(Self::Late),
            "EXCUSED" => Some(Self::Excused),
            "EXCLUDED" => Some(Self::Excluded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Absent => "ABSENT",
            Self::Late => "LATE",
            Self::Excused => "EXCUSED",
            Self::Excluded => "EXCLUDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: String,
    pub year_id: String,
    pub number: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub grades_locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Period {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day <= self.end_date
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub short_name: String,
    pub coefficient: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
}

/// A grade joined with the evaluation fields the aggregator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub evaluation_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub period_id: String,
    pub max_score: Decimal,
    pub coefficient: Decimal,
    pub counts_in_average: bool,
    pub published: bool,
    pub score: Option<Decimal>,
    pub absent: bool,
    pub cheating: bool,
    pub excused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Honors {
    None,
    Encouragements,
    Compliments,
    Felicitations,
}

impl Honors {
    pub fn as_str(self) -> &'static str {
        match self {
            Honors::None => "NONE",
            Honors::Encouragements => "ENCOURAGEMENTS",
            Honors::Compliments => "COMPLIMENTS",
            Honors::Felicitations => "FELICITATIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Honors::None),
            "ENCOURAGEMENTS" => Some(Honors::Encouragements),
            "COMPLIMENTS" => Some(Honors::Compliments),
            "FELICITATIONS" => Some(Honors::Felicitations),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AverageValues {
    pub simple: Decimal,
    pub weighted: Decimal,
}

/// Class-level figures written by the ranking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CohortPlacement {
    pub rank: i64,
    pub class_size: i64,
    pub class_min: Decimal,
    pub class_max: Decimal,
    pub class_mean: Decimal,
}

/// `values == None` is the absent marker.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectAverage {
    pub pupil_id: String,
    pub subject_id: String,
    pub period_id: String,
    pub class_id: String,
    pub values: Option<AverageValues>,
    pub placement: Option<CohortPlacement>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralAverage {
    pub pupil_id: String,
    pub period_id: String,
    pub class_id: String,
    pub values: Option<AverageValues>,
    pub placement: Option<CohortPlacement>,
    pub honors: Honors,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    AbsenceCount,
    LateCount,
    ConsecutiveAbsence,
    DayPattern(Weekday),
}

impl AlertKind {
    /// Stable storage key; day patterns carry their weekday so they never collide.
    pub fn key(self) -> String {
        match self {
            AlertKind::AbsenceCount => "absence_count".to_string(),
            AlertKind::LateCount => "late_count".to_string(),
            AlertKind::ConsecutiveAbsence => "consecutive_absence".to_string(),
            AlertKind::DayPattern(day) => {
                format!("day_pattern:{}", day.to_string().to_ascii_lowercase())
            }
        }
    }

    pub fn parse_key(s: &str) -> Option<Self> {
        match s {
            "absence_count" => Some(AlertKind::AbsenceCount),
            "late_count" => Some(AlertKind::LateCount),
            "consecutive_absence" => Some(AlertKind::ConsecutiveAbsence),
            other => {
                let day = other.strip_prefix("day_pattern:")?;
                Weekday::from_str(day).ok().map(AlertKind::DayPattern)
            }
        }
    }

    pub fn family(self) -> &'static str {
        match self {
            AlertKind::AbsenceCount => "ABSENCE_COUNT",
            AlertKind::LateCount => "LATE_COUNT",
            AlertKind::ConsecutiveAbsence => "CONSECUTIVE_ABSENCE",
            AlertKind::DayPattern(_) => "DAY_PATTERN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::Open => "OPEN",
            AlertState::Acknowledged => "ACKNOWLEDGED",
            AlertState::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(AlertState::Open),
            "ACKNOWLEDGED" => Some(AlertState::Acknowledged),
            "RESOLVED" => Some(AlertState::Resolved),
            _ => None,
        }
    }

    /// OPEN -> ACKNOWLEDGED -> RESOLVED, OPEN -> RESOLVED. Nothing leaves RESOLVED.
    pub fn can_transition_to(self, next: AlertState) -> bool {
        matches!(
            (self, next),
            (AlertState::Open, AlertState::Acknowledged)
                | (AlertState::Open, AlertState::Resolved)
                | (AlertState::Acknowledged, AlertState::Resolved)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub seq: i64,
    pub id: String,
    pub pupil_id: String,
    pub kind: AlertKind,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub threshold: i64,
    pub observed_value: i64,
    pub detail: serde_json::Value,
    pub state: AlertState,
    pub created_at: String,
    pub acknowledged_at: Option<String>,
    pub resolved_at: Option<String>,
}

impl Alert {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "seq": self.seq,
            "pupilId": self.pupil_id,
            "kind": self.kind.family(),
            "kindKey": self.kind.key(),
            "windowStart": self.window_start.to_string(),
            "windowEnd": self.window_end.to_string(),
            "threshold": self.threshold,
            "observedValue": self.observed_value,
            "detail": self.detail,
            "state": self.state.as_str(),
            "createdAt": self.created_at,
            "acknowledgedAt": self.acknowledged_at,
            "resolvedAt": self.resolved_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakSubject {
    pub subject_id: String,
    pub short_name: String,
    pub weighted_average: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskFinding {
    pub pupil_id: String,
    pub period_id: String,
    pub class_id: String,
    pub general: AverageValues,
    pub weak_subjects: Vec<WeakSubject>,
}

pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let t = raw.trim();
    Decimal::from_str(t)
        .ok()
        .or_else(|| Decimal::from_scientific(t).ok())
}

/// Two-decimal rounding applied where values leave the engine.
pub fn round2(d: Decimal) -> f64 {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(0.0)
}

pub fn round2_opt(d: Option<Decimal>) -> Option<f64> {
    d.map(round2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_kind_keys_distinguish_weekdays() {
        let mon = AlertKind::DayPattern(Weekday::Mon);
        let tue = AlertKind::DayPattern(Weekday::Tue);
        assert_ne!(mon.key(), tue.key());
        assert_eq!(mon.key(), "day_pattern:mon");
        assert_eq!(AlertKind::parse_key("day_pattern:tue"), Some(tue));
        assert_eq!(
            AlertKind::parse_key("consecutive_absence"),
            Some(AlertKind::ConsecutiveAbsence)
        );
        assert_eq!(AlertKind::parse_key("day_pattern:xyz"), None);
    }

    #[test]
    fn alert_state_machine_never_leaves_resolved() {
        use AlertState::*;
        assert!(Open.can_transition_to(Acknowledged));
        assert!(Open.can_transition_to(Resolved));
        assert!(Acknowledged.can_transition_to(Resolved));
        assert!(!Acknowledged.can_transition_to(Open));
        for next in [Open, Acknowledged, Resolved] {
            assert!(!Resolved.can_transition_to(next));
        }
    }

    #[test]
    fn round2_rounds_half_away_from_zero() {
        assert_eq!(round2(parse_decimal("13.3333333").expect("dec")), 13.33);
        assert_eq!(round2(parse_decimal("9.335").expect("dec")), 9.34);
        assert_eq!(parse_decimal("1e1"), Some(Decimal::from(10)));
    }
}
