//! Attendance anomaly detectors.
//!
//! A detector observes the timeline entries inside its own window, in date
//! order, then turns what it saw into zero or more candidate alerts.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::event_store::{DateRange, Snapshot};
use crate::model::{AlertKind, AttendanceStatus};
use crate::scanner::TimelineEntry;
use crate::store::CandidateAlert;
use chrono::{Datelike, NaiveDate, Weekday};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorError {
    pub message: String,
}

impl DetectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DetectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<crate::error::EngineError> for DetectorError {
    fn from(e: crate::error::EngineError) -> Self {
        DetectorError::new(e.to_string())
    }
}

pub trait Detector: Send {
    fn name(&self) -> &'static str;
    fn window(&self) -> DateRange;
    fn observe(&mut self, entry: &TimelineEntry) -> Result<(), DetectorError>;
    fn finish(
        &mut self,
        snapshot: &Snapshot<'_>,
        pupil_id: &str,
    ) -> Result<Vec<CandidateAlert>, DetectorError>;
}

/// The four detectors, windows ending on `today`.
pub fn standard_detectors(cfg: &EngineConfig, today: NaiveDate) -> EngineResult<Vec<Box<dyn Detector>>> {
    let detectors: Vec<Box<dyn Detector>> = vec![
        Box::new(AbsenceCount::new(
            DateRange::ending_on(today, cfg.absence_window_days)?,
            cfg.absence_threshold,
        )),
        Box::new(LateCount::new(
            DateRange::ending_on(today, cfg.late_window_days)?,
            cfg.late_threshold,
        )),
        Box::new(ConsecutiveAbsence::new(
            DateRange::ending_on(today, cfg.consecutive_window_days)?,
            cfg.consecutive_threshold,
        )),
        Box::new(DayPattern::new(
            DateRange::ending_on(today, cfg.pattern_window_weeks.saturating_mul(7))?,
            cfg.pattern_threshold,
        )),
    ];
    Ok(detectors)
}

/// Guards the date-order contract every detector relies on.
#[derive(Debug, Default)]
struct OrderGuard {
    last: Option<NaiveDate>,
}

impl OrderGuard {
    fn check(&mut self, date: NaiveDate) -> Result<(), DetectorError> {
        if let Some(last) = self.last {
            if date < last {
                return Err(DetectorError::new(format!(
                    "timeline out of order: {} after {}",
                    date, last
                )));
            }
        }
        self.last = Some(date);
        Ok(())
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Unjustified absences. Justified absences never count.
pub struct AbsenceCount {
    window: DateRange,
    threshold: i64,
    count: i64,
    dates: BTreeSet<NaiveDate>,
    order: OrderGuard,
}

impl AbsenceCount {
    pub fn new(window: DateRange, threshold: u32) -> Self {
        Self {
            window,
            threshold: i64::from(threshold),
            count: 0,
            dates: BTreeSet::new(),
            order: OrderGuard::default(),
        }
    }
}

impl Detector for AbsenceCount {
    fn name(&self) -> &'static str {
        "absence_count"
    }

    fn window(&self) -> DateRange {
        self.window
    }

    fn observe(&mut self, entry: &TimelineEntry) -> Result<(), DetectorError> {
        self.order.check(entry.date)?;
        if entry.status == AttendanceStatus::Absent && !entry.justified {
            self.count += 1;
            self.dates.insert(entry.date);
        }
        Ok(())
    }

    fn finish(
        &mut self,
        snapshot: &Snapshot<'_>,
        pupil_id: &str,
    ) -> Result<Vec<CandidateAlert>, DetectorError> {
        if self.count < self.threshold {
            return Ok(Vec::new());
        }
        let scheduled = snapshot.schedule_hours(pupil_id, self.window)?;
        let dates: Vec<String> = self.dates.iter().map(|d| d.to_string()).collect();
        Ok(vec![CandidateAlert {
            kind: AlertKind::AbsenceCount,
            window_start: self.window.start,
            window_end: self.window.end,
            threshold: self.threshold,
            observed_value: self.count,
            detail: json!({
                "scheduledSessions": scheduled,
                "dates": dates,
            }),
        }])
    }
}

/// Late arrivals, justified or not.
pub struct LateCount {
    window: DateRange,
    threshold: i64,
    count: i64,
    total_minutes: i64,
    order: OrderGuard,
}

impl LateCount {
    pub fn new(window: DateRange, threshold: u32) -> Self {
        Self {
            window,
            threshold: i64::from(threshold),
            count: 0,
            total_minutes: 0,
            order: OrderGuard::default(),
        }
    }
}

impl Detector for LateCount {
    fn name(&self) -> &'static str {
        "late_count"
    }

    fn window(&self) -> DateRange {
        self.window
    }

    fn observe(&mut self, entry: &TimelineEntry) -> Result<(), DetectorError> {
        self.order.check(entry.date)?;
        if entry.status == AttendanceStatus::Late {
            self.count += 1;
            self.total_minutes = self.total_minutes.saturating_add(entry.late_minutes);
        }
        Ok(())
    }

    fn finish(&mut self, _: &Snapshot<'_>, _: &str) -> Result<Vec<CandidateAlert>, DetectorError> {
        if self.count < self.threshold {
            return Ok(Vec::new());
        }
        Ok(vec![CandidateAlert {
            kind: AlertKind::LateCount,
            window_start: self.window.start,
            window_end: self.window.end,
            threshold: self.threshold,
            observed_value: self.count,
            detail: json!({ "totalLateMinutes": self.total_minutes }),
        }])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: NaiveDate,
    end: NaiveDate,
    len: i64,
}

/// Longest run of consecutive calendar days on which every record is ABSENT.
///
/// A day with any other status, or a calendar gap, ends the run. The emitted
/// window brackets the run rather than the scan window.
pub struct ConsecutiveAbsence {
    window: DateRange,
    threshold: i64,
    day: Option<(NaiveDate, bool)>,
    current: Option<Run>,
    best: Option<Run>,
    order: OrderGuard,
}

impl ConsecutiveAbsence {
    pub fn new(window: DateRange, threshold: u32) -> Self {
        Self {
            window,
            threshold: i64::from(threshold),
            day: None,
            current: None,
            best: None,
            order: OrderGuard::default(),
        }
    }

    fn close_day(&mut self) {
        let Some((date, all_absent)) = self.day.take() else {
            return;
        };
        if !all_absent {
            self.current = None;
            return;
        }
        let next = match self.current {
            Some(run) if run.end.succ_opt() == Some(date) => Run {
                start: run.start,
                end: date,
                len: run.len + 1,
            },
            _ => Run {
                start: date,
                end: date,
                len: 1,
            },
        };
        self.current = Some(next);
        // Ties go to the most recent run.
        if self.best.map_or(true, |b| next.len >= b.len) {
            self.best = Some(next);
        }
    }
}

impl Detector for ConsecutiveAbsence {
    fn name(&self) -> &'static str {
        "consecutive_absence"
    }

    fn window(&self) -> DateRange {
        self.window
    }

    fn observe(&mut self, entry: &TimelineEntry) -> Result<(), DetectorError> {
        self.order.check(entry.date)?;
        let absent = entry.status == AttendanceStatus::Absent;
        match self.day {
            Some((date, all_absent)) if date == entry.date => {
                self.day = Some((date, all_absent && absent));
            }
            _ => {
                self.close_day();
                self.day = Some((entry.date, absent));
            }
        }
        Ok(())
    }

    fn finish(&mut self, _: &Snapshot<'_>, _: &str) -> Result<Vec<CandidateAlert>, DetectorError> {
        self.close_day();
        let Some(run) = self.best else {
            return Ok(Vec::new());
        };
        if run.len < self.threshold {
            return Ok(Vec::new());
        }
        Ok(vec![CandidateAlert {
            kind: AlertKind::ConsecutiveAbsence,
            window_start: run.start,
            window_end: run.end,
            threshold: self.threshold,
            observed_value: run.len,
            detail: json!({
                "scanStart": self.window.start.to_string(),
                "scanEnd": self.window.end.to_string(),
            }),
        }])
    }
}

/// Distinct absent dates per weekday; one candidate per qualifying weekday.
pub struct DayPattern {
    window: DateRange,
    threshold: i64,
    by_weekday: BTreeMap<u32, BTreeSet<NaiveDate>>,
    order: OrderGuard,
}

impl DayPattern {
    pub fn new(window: DateRange, threshold: u32) -> Self {
        Self {
            window,
            threshold: i64::from(threshold),
            by_weekday: BTreeMap::new(),
            order: OrderGuard::default(),
        }
    }
}

impl Detector for DayPattern {
    fn name(&self) -> &'static str {
        "day_pattern"
    }

    fn window(&self) -> DateRange {
        self.window
    }

    fn observe(&mut self, entry: &TimelineEntry) -> Result<(), DetectorError> {
        self.order.check(entry.date)?;
        if entry.status == AttendanceStatus::Absent {
            self.by_weekday
                .entry(entry.date.weekday().num_days_from_monday())
                .or_default()
                .insert(entry.date);
        }
        Ok(())
    }

    fn finish(&mut self, _: &Snapshot<'_>, _: &str) -> Result<Vec<CandidateAlert>, DetectorError> {
        let mut out = Vec::new();
        for dates in self.by_weekday.values() {
            let count = dates.len() as i64;
            let Some(first) = dates.iter().next() else {
                continue;
            };
            if count < self.threshold {
                continue;
            }
            let weekday = first.weekday();
            let listed: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
            out.push(CandidateAlert {
                kind: AlertKind::DayPattern(weekday),
                window_start: self.window.start,
                window_end: self.window.end,
                threshold: self.threshold,
                observed_value: count,
                detail: json!({
                    "weekday": weekday_name(weekday),
                    "dates": listed,
                }),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn entry(date: &str, status: AttendanceStatus, justified: bool) -> TimelineEntry {
        TimelineEntry {
            date: d(date),
            status,
            justified,
            late_minutes: if status == AttendanceStatus::Late { 7 } else { 0 },
        }
    }

    fn run(detector: &mut dyn Detector, entries: &[TimelineEntry]) -> Vec<CandidateAlert> {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let snap = Snapshot::open(&conn).expect("snapshot");
        for e in entries {
            detector.observe(e).expect("observe");
        }
        detector.finish(&snap, "P1").expect("finish")
    }

    use AttendanceStatus::{Absent, Late, Present};

    #[test]
    fn absence_count_fires_at_threshold_and_ignores_justified() {
        let window = DateRange::ending_on(d("2025-03-30"), 30).expect("window");
        let days = ["2025-03-01", "2025-03-05", "2025-03-08", "2025-03-12", "2025-03-20"];
        let mut entries: Vec<TimelineEntry> =
            days.iter().map(|day| entry(day, Absent, false)).collect();
        entries.push(entry("2025-03-21", Absent, true));

        let mut det = AbsenceCount::new(window, 5);
        let out = run(&mut det, &entries);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].observed_value, 5);
        assert_eq!(out[0].threshold, 5);
        assert_eq!(out[0].detail["scheduledSessions"], 0);

        let mut det = AbsenceCount::new(window, 5);
        assert!(run(&mut det, &entries[1..]).is_empty());
    }

    #[test]
    fn late_count_includes_justified_lates() {
        let window = DateRange::ending_on(d("2025-03-30"), 30).expect("window");
        let entries: Vec<TimelineEntry> = (1..=10)
            .map(|i| entry(&format!("2025-03-{:02}", i), Late, i % 2 == 0))
            .collect();
        let mut det = LateCount::new(window, 10);
        let out = run(&mut det, &entries);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].detail["totalLateMinutes"], 70);
    }

    #[test]
    fn consecutive_run_of_exactly_threshold_fires_and_brackets_the_run() {
        let window = DateRange::ending_on(d("2025-03-14"), 14).expect("window");
        // Mon 3 - Wed 5 absent, Thu 6 present.
        let entries = [
            entry("2025-03-03", Absent, false),
            entry("2025-03-04", Absent, true),
            entry("2025-03-05", Absent, false),
            entry("2025-03-06", Present, false),
        ];
        let mut det = ConsecutiveAbsence::new(window, 3);
        let out = run(&mut det, &entries);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window_start, d("2025-03-03"));
        assert_eq!(out[0].window_end, d("2025-03-05"));
        assert_eq!(out[0].observed_value, 3);

        let mut det = ConsecutiveAbsence::new(window, 3);
        assert!(run(&mut det, &entries[1..]).is_empty());
    }

    #[test]
    fn consecutive_run_breaks_on_gaps_and_mixed_days() {
        let window = DateRange::ending_on(d("2025-03-14"), 14).expect("window");
        // Fri 7 absent, weekend without records, Mon 10 and Tue 11 absent.
        let gap = [
            entry("2025-03-07", Absent, false),
            entry("2025-03-10", Absent, false),
            entry("2025-03-11", Absent, false),
        ];
        let mut det = ConsecutiveAbsence::new(window, 3);
        assert!(run(&mut det, &gap).is_empty());

        // Wed 12 has one absent and one present session.
        let mixed = [
            entry("2025-03-11", Absent, false),
            entry("2025-03-12", Absent, false),
            entry("2025-03-12", Present, false),
            entry("2025-03-13", Absent, false),
        ];
        let mut det = ConsecutiveAbsence::new(window, 2);
        assert!(run(&mut det, &mixed).is_empty());
    }

    #[test]
    fn day_pattern_needs_three_of_the_same_weekday() {
        let window = DateRange::ending_on(d("2025-03-30"), 28).expect("window");
        let mondays = [
            entry("2025-03-03", Absent, false),
            entry("2025-03-10", Absent, true),
            entry("2025-03-10", Absent, false),
            entry("2025-03-17", Absent, false),
            entry("2025-03-18", Absent, false),
        ];
        let mut det = DayPattern::new(window, 3);
        let out = run(&mut det, &mondays);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::DayPattern(Weekday::Mon));
        assert_eq!(out[0].observed_value, 3);
        assert_eq!(out[0].detail["weekday"], "monday");

        let mut det = DayPattern::new(window, 3);
        assert!(run(&mut det, &mondays[1..]).is_empty());
    }

    #[test]
    fn day_pattern_emits_one_candidate_per_weekday() {
        let window = DateRange::ending_on(d("2025-03-30"), 28).expect("window");
        let mut entries = Vec::new();
        for day in ["03", "10", "17"] {
            entries.push(entry(&format!("2025-03-{}", day), Absent, false));
        }
        for day in ["05", "12", "19"] {
            entries.push(entry(&format!("2025-03-{}", day), Absent, false));
        }
        entries.sort_by_key(|e| e.date);
        let mut det = DayPattern::new(window, 3);
        let out = run(&mut det, &entries);
        let kinds: Vec<String> = out.iter().map(|c| c.kind.key()).collect();
        assert_eq!(kinds, vec!["day_pattern:mon", "day_pattern:wed"]);
    }

    #[test]
    fn out_of_order_timeline_is_a_detector_error() {
        let window = DateRange::ending_on(d("2025-03-30"), 30).expect("window");
        let mut det = LateCount::new(window, 1);
        det.observe(&entry("2025-03-05", Late, false)).expect("first");
        assert!(det.observe(&entry("2025-03-04", Late, false)).is_err());
    }
}
