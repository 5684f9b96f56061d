//! `AlertSweep(pupil)`: scan the pupil's recent attendance and open alerts.

use crate::detectors::standard_detectors;
use crate::error::{EngineError, EngineResult};
use crate::event_store::Snapshot;
use crate::model::Alert;
use crate::scanner;
use crate::store::{AggregateStore, CandidateAlert};
use crate::unit::{UnitContext, UnitOutcome};

pub fn run(ctx: &UnitContext<'_>, pupil_id: &str) -> EngineResult<UnitOutcome> {
    let snapshot = Snapshot::open(ctx.read)?;
    if !snapshot.pupil_exists(pupil_id)? {
        return Err(EngineError::missing("pupil", pupil_id));
    }
    let today = ctx.clock.today();
    let mut detectors = standard_detectors(ctx.config, today)?;

    let report = scanner::scan(&snapshot, pupil_id, &mut detectors)?;
    ctx.checkpoint()?;

    let mut candidates: Vec<CandidateAlert> = Vec::new();
    for (i, detector) in detectors.iter_mut().enumerate() {
        if report.failed.contains(&i) {
            continue;
        }
        match detector.finish(&snapshot, pupil_id) {
            Ok(found) => candidates.extend(found),
            Err(e) => {
                tracing::warn!(
                    pupil_id,
                    detector = detector.name(),
                    error = %e,
                    "detector failed; skipping this kind for the cycle"
                );
            }
        }
    }
    drop(snapshot);
    ctx.checkpoint()?;

    let tx = ctx.write.unchecked_transaction()?;
    let store = AggregateStore::new(&tx, ctx.now());
    let mut new_alerts: Vec<Alert> = Vec::new();
    for c in &candidates {
        let outcome = store.open_alert(pupil_id, c)?;
        if outcome.inserted {
            tracing::info!(
                pupil_id,
                kind = %c.kind.key(),
                observed = c.observed_value,
                threshold = c.threshold,
                "alert opened"
            );
            new_alerts.push(outcome.alert);
        }
    }
    ctx.checkpoint()?;
    tx.commit()?;

    tracing::debug!(
        pupil_id,
        entries = report.entries,
        skipped = report.skipped,
        candidates = candidates.len(),
        opened = new_alerts.len(),
        "alert sweep finished"
    );
    Ok(UnitOutcome::Swept { new_alerts })
}
