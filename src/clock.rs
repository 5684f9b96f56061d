use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};

/// Every component reads time through this trait; nothing calls the host clock directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn timezone(&self) -> Tz;

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.timezone()).date_naive()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Settable clock used for replay and tests.
#[derive(Debug)]
pub struct FixedClock {
    tz: Tz,
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            tz,
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    #[cfg(test)]
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Next instant strictly after `now` at which the local wall clock in `tz` reads `at`.
///
/// A local time skipped by a DST jump fires at the first instant after the gap;
/// an ambiguous local time fires at its earlier occurrence.
pub fn next_local_occurrence(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local_today = now.with_timezone(&tz).date_naive();
    let mut day = local_today;
    loop {
        if let Some(candidate) = resolve_local(tz, day, at) {
            if candidate > now {
                return candidate;
            }
        }
        day = day.succ_opt().unwrap_or(day);
    }
}

fn resolve_local(tz: Tz, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = day.and_time(at);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Some(dt.with_timezone(&Utc));
    }
    // Inside a spring-forward gap: walk forward minute by minute until the zone has it.
    let mut candidate = naive;
    for _ in 0..180 {
        candidate += chrono::Duration::minutes(1);
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return Some(dt.with_timezone(&Utc));
        }
    }
    None
}
