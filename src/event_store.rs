//! Read view over the externally owned source tables.
//!
//! A [`Snapshot`] pins one SQLite read transaction for the lifetime of a work
//! unit, so every read inside the unit sees the same committed state even if
//! retroactive edits land mid-unit.

use crate::error::{EngineError, EngineResult};
use crate::model::{AttendanceStatus, ClassInfo, GradeRow, Period, Subject};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` calendar days ending on (and including) `end`.
    pub fn ending_on(end: NaiveDate, days: u32) -> EngineResult<Self> {
        let back = i64::from(days.max(1)) - 1;
        let start = chrono::Duration::try_days(back)
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or_else(|| {
                EngineError::Permanent(format!("window of {} days before {} is out of range", days, end))
            })?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// One attendance row as stored; status is left raw so scanners decide how to treat junk.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttendance {
    pub session_id: String,
    pub date: NaiveDate,
    pub status: String,
    pub justified: bool,
    pub late_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMember {
    pub pupil_id: String,
    pub display_name: String,
    /// More than one active enrollment covers the period end for this pupil.
    pub overlapping: bool,
}

pub struct Snapshot<'c> {
    tx: Transaction<'c>,
}

pub(crate) fn parse_date(raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::Permanent(format!("malformed date in source data: {}", raw)))
}

fn parse_source_decimal(raw: &str, what: &str) -> EngineResult<Decimal> {
    crate::model::parse_decimal(raw)
        .ok_or_else(|| EngineError::Permanent(format!("malformed {} in source data: {}", what, raw)))
}

impl<'c> Snapshot<'c> {
    pub fn open(conn: &'c Connection) -> EngineResult<Self> {
        let tx = conn.unchecked_transaction()?;
        // The WAL read mark is taken on first read, not on BEGIN.
        tx.query_row("SELECT COUNT(*) FROM sqlite_master", [], |r| {
            r.get::<_, i64>(0)
        })?;
        Ok(Self { tx })
    }

    /// Stream attendance rows in (date, session) order without collecting them.
    pub fn for_each_attendance<F>(
        &self,
        pupil_id: &str,
        range: DateRange,
        mut f: F,
    ) -> EngineResult<()>
    where
        F: FnMut(RawAttendance) -> EngineResult<()>,
    {
        let mut stmt = self.tx.prepare_cached(
            "SELECT session_id, date, status, justified, late_minutes
             FROM attendance
             WHERE pupil_id = ? AND date >= ? AND date <= ?
             ORDER BY date ASC, session_id ASC",
        )?;
        let mut rows = stmt.query((
            pupil_id,
            range.start.to_string(),
            range.end.to_string(),
        ))?;
        while let Some(row) = rows.next()? {
            let date_raw: String = row.get(1)?;
            f(RawAttendance {
                session_id: row.get(0)?,
                date: parse_date(&date_raw)?,
                status: row.get(2)?,
                justified: row.get::<_, i64>(3)? != 0,
                late_minutes: row.get(4)?,
            })?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn list_attendance(
        &self,
        pupil_id: &str,
        range: DateRange,
    ) -> EngineResult<Vec<RawAttendance>> {
        let mut out = Vec::new();
        self.for_each_attendance(pupil_id, range, |r| {
            out.push(r);
            Ok(())
        })?;
        Ok(out)
    }

    /// Grades of `pupil_id` in `period_id` joined with their evaluation.
    pub fn list_grades(&self, pupil_id: &str, period_id: &str) -> EngineResult<Vec<GradeRow>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT e.id, e.subject_id, e.class_id, e.period_id, e.max_score, e.coefficient,
                    e.counts_in_average, e.published,
                    g.score, g.absent, g.cheating, g.excused
             FROM grades g
             JOIN evaluations e ON e.id = g.evaluation_id
             WHERE g.pupil_id = ? AND e.period_id = ?
             ORDER BY e.subject_id, e.date, e.id",
        )?;
        let raw = stmt
            .query_map((pupil_id, period_id), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, i64>(6)? != 0,
                    r.get::<_, i64>(7)? != 0,
                    r.get::<_, Option<String>>(8)?,
                    r.get::<_, i64>(9)? != 0,
                    r.get::<_, i64>(10)? != 0,
                    r.get::<_, i64>(11)? != 0,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(raw.len());
        for (
            evaluation_id,
            subject_id,
            class_id,
            period_id,
            max_score,
            coefficient,
            counts_in_average,
            published,
            score,
            absent,
            cheating,
            excused,
        ) in raw
        {
            let score = match score {
                Some(s) => Some(parse_source_decimal(&s, "score")?),
                None => None,
            };
            out.push(GradeRow {
                evaluation_id,
                subject_id,
                class_id,
                period_id,
                max_score: parse_source_decimal(&max_score, "max_score")?,
                coefficient: parse_source_decimal(&coefficient, "coefficient")?,
                counts_in_average,
                published,
                score,
                absent,
                cheating,
                excused,
            });
        }
        Ok(out)
    }

    /// Pupils with an active enrollment in `class_id` covering the period's last day.
    pub fn list_class_members(&self, class_id: &str, period: &Period) -> EngineResult<Vec<ClassMember>> {
        let at = period.end_date.to_string();
        let mut stmt = self.tx.prepare_cached(
            "SELECT e.pupil_id, COALESCE(p.display_name, e.pupil_id),
                    (SELECT COUNT(*) FROM enrollments o
                     WHERE o.pupil_id = e.pupil_id AND o.active = 1
                       AND o.start_date <= ?1 AND (o.end_date IS NULL OR o.end_date >= ?1)) AS covering
             FROM enrollments e
             LEFT JOIN pupils p ON p.id = e.pupil_id
             WHERE e.class_id = ?2 AND e.active = 1
               AND e.start_date <= ?1 AND (e.end_date IS NULL OR e.end_date >= ?1)
             GROUP BY e.pupil_id
             ORDER BY e.pupil_id",
        )?;
        let members = stmt
            .query_map((&at, class_id), |r| {
                Ok(ClassMember {
                    pupil_id: r.get(0)?,
                    display_name: r.get(1)?,
                    overlapping: r.get::<_, i64>(2)? > 1,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    pub fn get_period(&self, id: &str) -> EngineResult<Option<Period>> {
        let row: Option<(String, i64, String, String, i64, Option<String>)> = self
            .tx
            .query_row(
                "SELECT year_id, number, start_date, end_date, grades_locked, locked_at
                 FROM periods WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?;
        let Some((year_id, number, start, end, locked, locked_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Period {
            id: id.to_string(),
            year_id,
            number,
            start_date: parse_date(&start)?,
            end_date: parse_date(&end)?,
            grades_locked: locked != 0,
            locked_at: locked_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
        }))
    }

    pub fn get_class(&self, id: &str) -> EngineResult<Option<ClassInfo>> {
        let name: Option<String> = self
            .tx
            .query_row("SELECT name FROM classes WHERE id = ?", [id], |r| r.get(0))
            .optional()?;
        Ok(name.map(|name| ClassInfo {
            id: id.to_string(),
            name,
        }))
    }

    pub fn pupil_exists(&self, id: &str) -> EngineResult<bool> {
        Ok(self
            .tx
            .query_row("SELECT 1 FROM pupils WHERE id = ?", [id], |r| r.get::<_, i64>(0))
            .optional()?
            .is_some())
    }

    /// Subjects keyed by id, loaded once per unit.
    pub fn subjects_by_id(&self) -> EngineResult<HashMap<String, Subject>> {
        let mut stmt = self
            .tx
            .prepare_cached("SELECT id, short_name, coefficient FROM subjects")?;
        let raw = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = HashMap::with_capacity(raw.len());
        for (id, short_name, coefficient) in raw {
            let coefficient = parse_source_decimal(&coefficient, "subject coefficient")?;
            out.insert(
                id.clone(),
                Subject {
                    id,
                    short_name,
                    coefficient,
                },
            );
        }
        Ok(out)
    }

    /// Number of scheduled sessions in `range` for the classes `pupil_id` was enrolled in on each session date.
    pub fn schedule_hours(&self, pupil_id: &str, range: DateRange) -> EngineResult<i64> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(DISTINCT s.id)
             FROM scheduled_sessions s
             JOIN enrollments e ON e.class_id = s.class_id
             WHERE e.pupil_id = ?1 AND e.active = 1
               AND s.date >= ?2 AND s.date <= ?3
               AND e.start_date <= s.date AND (e.end_date IS NULL OR e.end_date >= s.date)",
            (pupil_id, range.start.to_string(), range.end.to_string()),
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Pupils holding an active enrollment that covers `day`.
    pub fn list_active_pupils(&self, day: NaiveDate) -> EngineResult<Vec<String>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT DISTINCT pupil_id FROM enrollments
             WHERE active = 1 AND start_date <= ?1 AND (end_date IS NULL OR end_date >= ?1)
             ORDER BY pupil_id",
        )?;
        let ids = stmt
            .query_map([day.to_string()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// (class, period) pairs where the period contains `day` and the class has active members.
    pub fn list_active_class_periods(&self, day: NaiveDate) -> EngineResult<Vec<(String, String)>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT DISTINCT e.class_id, p.id
             FROM periods p
             JOIN enrollments e
               ON e.active = 1 AND e.start_date <= p.end_date
              AND (e.end_date IS NULL OR e.end_date >= p.end_date)
             WHERE p.start_date <= ?1 AND p.end_date >= ?1
             ORDER BY e.class_id, p.id",
        )?;
        let pairs = stmt
            .query_map([day.to_string()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    /// Class and period of an evaluation, for events that only name the evaluation.
    pub fn evaluation_scope(&self, evaluation_id: &str) -> EngineResult<Option<(String, String)>> {
        Ok(self
            .tx
            .query_row(
                "SELECT class_id, period_id FROM evaluations WHERE id = ?",
                [evaluation_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?)
    }

    /// The class `pupil_id` is actively enrolled in at the end of `period`.
    pub fn class_of_pupil(&self, pupil_id: &str, period: &Period) -> EngineResult<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT class_id FROM enrollments
                 WHERE pupil_id = ?1 AND active = 1
                   AND start_date <= ?2 AND (end_date IS NULL OR end_date >= ?2)
                 ORDER BY start_date DESC, id
                 LIMIT 1",
                (pupil_id, period.end_date.to_string()),
                |r| r.get(0),
            )
            .optional()?)
    }
}

/// Statuses are validated by consumers, not by the read view.
pub fn parse_status(raw: &str) -> Option<AttendanceStatus> {
    AttendanceStatus::parse(raw)
}
