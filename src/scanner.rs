//! Streams a pupil's attendance timeline to the detectors.

use crate::detectors::Detector;
use crate::error::EngineResult;
use crate::event_store::{DateRange, RawAttendance, Snapshot};
use crate::model::AttendanceStatus;
use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub justified: bool,
    pub late_minutes: i64,
}

impl TimelineEntry {
    fn from_raw(raw: &RawAttendance) -> Option<Self> {
        if raw.late_minutes < 0 {
            return None;
        }
        Some(Self {
            date: raw.date,
            status: AttendanceStatus::parse(&raw.status)?,
            justified: raw.justified,
            late_minutes: raw.late_minutes,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub entries: usize,
    pub skipped: usize,
    /// Indexes (into the detector slice) of detectors that failed mid-stream.
    pub failed: Vec<usize>,
}

/// Widest range covering every detector's window.
pub fn covering_range(detectors: &[Box<dyn Detector>]) -> Option<DateRange> {
    let mut it = detectors.iter().map(|d| d.window());
    let first = it.next()?;
    Some(it.fold(first, |acc, w| DateRange {
        start: acc.start.min(w.start),
        end: acc.end.max(w.end),
    }))
}

/// Feed every record in the covering range to each detector whose window contains it.
///
/// Records with an unknown status or negative lateness are skipped. A detector
/// that fails stops receiving records; the others carry on.
pub fn scan(
    snapshot: &Snapshot<'_>,
    pupil_id: &str,
    detectors: &mut [Box<dyn Detector>],
) -> EngineResult<ScanReport> {
    let mut report = ScanReport::default();
    let Some(range) = covering_range(detectors) else {
        return Ok(report);
    };
    let mut failed = vec![false; detectors.len()];

    snapshot.for_each_attendance(pupil_id, range, |raw| {
        let Some(entry) = TimelineEntry::from_raw(&raw) else {
            report.skipped += 1;
            tracing::warn!(
                pupil_id,
                session_id = %raw.session_id,
                date = %raw.date,
                status = %raw.status,
                "skipping malformed attendance record"
            );
            return Ok(());
        };
        report.entries += 1;
        for (i, detector) in detectors.iter_mut().enumerate() {
            if failed[i] || !detector.window().contains(entry.date) {
                continue;
            }
            if let Err(e) = detector.observe(&entry) {
                failed[i] = true;
                tracing::warn!(
                    pupil_id,
                    detector = detector.name(),
                    error = %e,
                    "detector failed; skipping this kind for the cycle"
                );
            }
        }
        Ok(())
    })?;

    report.failed = failed
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.then_some(i))
        .collect();
    Ok(report)
}
