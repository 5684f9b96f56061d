//! `AggregateRecompute(class, period)`.
//!
//! Per-pupil subunits run inside savepoints of one write transaction; a pupil
//! whose source rows break an invariant is rolled back alone and reported to
//! the operator queue. The class ranking pass runs after every pupil subunit
//! has finished, first per subject, then for general averages. Nothing is
//! visible until the whole unit commits.

use crate::calc::{self, GradeUse, SubjectWeight};
use crate::error::{EngineError, EngineResult};
use crate::event_store::{ClassMember, Snapshot};
use crate::model::{AverageValues, CohortPlacement, GradeRow, Period, Subject};
use crate::risk::{self, RiskThresholds};
use crate::store::{input_digest, timestamp, AggregateStore, CohortRow};
use crate::unit::{record_operator_issue, AggregateReady, UnitContext, UnitOutcome};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub fn run(ctx: &UnitContext<'_>, class_id: &str, period_id: &str) -> EngineResult<UnitOutcome> {
    match recompute(ctx, class_id, period_id) {
        Err(EngineError::LockedPeriod { period_id }) => {
            tracing::info!(class_id, period_id = %period_id, "period locked; recompute is a no-op");
            Ok(UnitOutcome::Frozen { period_id })
        }
        other => other.map(UnitOutcome::Recomputed),
    }
}

fn recompute(ctx: &UnitContext<'_>, class_id: &str, period_id: &str) -> EngineResult<AggregateReady> {
    let snapshot = Snapshot::open(ctx.read)?;
    let period = snapshot
        .get_period(period_id)?
        .ok_or_else(|| EngineError::missing("period", period_id))?;
    snapshot
        .get_class(class_id)?
        .ok_or_else(|| EngineError::missing("class", class_id))?;
    let catalog = snapshot.subjects_by_id()?;
    let members = snapshot.list_class_members(class_id, &period)?;
    let thresholds = RiskThresholds {
        general: ctx.config.risk_general_threshold,
        subject: ctx.config.risk_subject_threshold,
    };

    let now = ctx.now();
    let mut tx = ctx.write.unchecked_transaction()?;
    let mut aborted = 0usize;

    for member in &members {
        ctx.checkpoint()?;
        let sp = tx.savepoint()?;
        let result = {
            let store = AggregateStore::new(&sp, now);
            recompute_pupil(&snapshot, &store, &catalog, &thresholds, ctx, member, class_id, &period)
        };
        match result {
            Ok(()) => sp.commit()?,
            Err(EngineError::DataIntegrity { pupil_id, message }) => {
                drop(sp);
                aborted += 1;
                tracing::warn!(
                    unit = %ctx.key,
                    pupil_id = %pupil_id,
                    error = %message,
                    "data integrity violation; pupil skipped"
                );
                record_operator_issue(&tx, "data_integrity", ctx.key, Some(&pupil_id), &message, now)?;
            }
            Err(e) => return Err(e),
        }
    }
    drop(snapshot);

    ctx.checkpoint()?;
    let member_ids: HashSet<&str> = members.iter().map(|m| m.pupil_id.as_str()).collect();
    let store = AggregateStore::new(&tx, now);
    let subjects = store.cohort_subjects(class_id, period_id)?;
    for subject_id in &subjects {
        let cohort = store.subject_cohort(class_id, period_id, subject_id)?;
        for (pupil_id, placement) in placements(&cohort, &member_ids)? {
            store.set_subject_placement(&pupil_id, subject_id, period_id, placement)?;
        }
    }
    ctx.checkpoint()?;
    let general = store.general_cohort(class_id, period_id)?;
    for (pupil_id, placement) in placements(&general, &member_ids)? {
        store.set_general_placement(&pupil_id, period_id, placement)?;
    }

    ctx.checkpoint()?;
    tx.commit()?;

    let ready = AggregateReady {
        class_id: class_id.to_string(),
        period_id: period_id.to_string(),
        subject_count: subjects.len(),
        pupil_count: members.len(),
        completed_at: timestamp(now),
    };
    tracing::info!(
        unit = %ctx.key,
        pupils = members.len(),
        subjects = subjects.len(),
        aborted,
        "aggregate recompute committed"
    );
    Ok(ready)
}

/// Placements that differ from what is stored, for current members only.
/// Absent rows lose any placement they had.
fn placements(
    cohort: &[CohortRow],
    members: &HashSet<&str>,
) -> EngineResult<Vec<(String, Option<CohortPlacement>)>> {
    let rows: Vec<&CohortRow> = cohort
        .iter()
        .filter(|r| members.contains(r.pupil_id.as_str()))
        .collect();
    let ranked_input: Vec<(String, rust_decimal::Decimal)> = rows
        .iter()
        .filter_map(|r| r.weighted.map(|w| (r.pupil_id.clone(), w)))
        .collect();
    let ranked: HashMap<String, CohortPlacement> = calc::rank_cohort(&ranked_input)
        .map_err(|e| EngineError::Permanent(e.message))?
        .into_iter()
        .collect();
    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let wanted = ranked.get(&r.pupil_id).copied();
            (wanted != r.placement).then(|| (r.pupil_id.clone(), wanted))
        })
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn recompute_pupil(
    snapshot: &Snapshot<'_>,
    store: &AggregateStore<'_>,
    catalog: &HashMap<String, Subject>,
    thresholds: &RiskThresholds,
    ctx: &UnitContext<'_>,
    member: &ClassMember,
    class_id: &str,
    period: &Period,
) -> EngineResult<()> {
    let pupil_id = member.pupil_id.as_str();
    if member.overlapping {
        return Err(EngineError::integrity(
            pupil_id,
            format!("overlapping active enrollments at {}", period.end_date),
        ));
    }

    let grades = snapshot.list_grades(pupil_id, &period.id)?;
    let mut by_subject: BTreeMap<&str, Vec<&GradeRow>> = BTreeMap::new();
    for g in &grades {
        calc::check_grade(g).map_err(|msg| EngineError::integrity(pupil_id, msg))?;
        if !catalog.contains_key(&g.subject_id) {
            return Err(EngineError::missing("subject", &g.subject_id));
        }
        if g.published && g.counts_in_average {
            by_subject.entry(g.subject_id.as_str()).or_default().push(g);
        }
    }

    // Subjects that already have a row are rewritten too, so lost support turns into an absent marker.
    let existing = store.subject_averages_for_pupil(pupil_id, &period.id)?;
    let mut subject_ids: BTreeSet<&str> = by_subject.keys().copied().collect();
    subject_ids.extend(existing.iter().map(|(s, _)| s.as_str()));

    for subject_id in subject_ids {
        let rows = by_subject.get(subject_id).map(Vec::as_slice).unwrap_or(&[]);
        let values = calc::subject_average(rows.iter().map(|g| calc::grade_use(g)))
            .map_err(|e| EngineError::integrity(pupil_id, e.message))?;
        let digest = input_digest(
            std::iter::once(class_id.to_string()).chain(rows.iter().map(|g| grade_fingerprint(g))),
        );
        store.put_subject_average(pupil_id, subject_id, &period.id, class_id, values, &digest)?;
    }

    let subject_rows = store.subject_averages_for_pupil(pupil_id, &period.id)?;
    let mut weights = Vec::new();
    for (subject_id, values) in &subject_rows {
        let Some(v) = values else { continue };
        let subject = catalog
            .get(subject_id)
            .ok_or_else(|| EngineError::missing("subject", subject_id))?;
        weights.push(SubjectWeight {
            weighted: v.weighted,
            coefficient: subject.coefficient,
        });
    }
    let had_general = store.general_average(pupil_id, &period.id)?.is_some();
    if subject_rows.is_empty() && !had_general {
        return Ok(());
    }
    let general = calc::general_average(&weights)
        .map_err(|e| EngineError::integrity(pupil_id, e.message))?;
    let honors = calc::honors_for(general.map(|g| g.weighted), &ctx.config.honors_bands);
    let general_digest = input_digest(
        std::iter::once(class_id.to_string())
            .chain(subject_rows.iter().map(|(s, v)| subject_fingerprint(s, v, catalog))),
    );
    store.put_general_average(pupil_id, &period.id, class_id, general, honors, &general_digest)?;

    let finding = risk::classify(
        pupil_id,
        &period.id,
        class_id,
        general,
        &subject_rows,
        catalog,
        thresholds,
    );
    store.put_risk_finding(pupil_id, &period.id, class_id, finding.as_ref(), &general_digest)?;
    Ok(())
}

fn grade_fingerprint(g: &GradeRow) -> String {
    let used = match calc::grade_use(g) {
        GradeUse::Ignored => "-".to_string(),
        GradeUse::Counted {
            score,
            max,
            coefficient,
        } => format!("{}/{}x{}", score.normalize(), max.normalize(), coefficient.normalize()),
    };
    format!("{}={}", g.evaluation_id, used)
}

fn subject_fingerprint(
    subject_id: &str,
    values: &Option<AverageValues>,
    catalog: &HashMap<String, Subject>,
) -> String {
    let coef = catalog
        .get(subject_id)
        .map(|s| s.coefficient.normalize().to_string())
        .unwrap_or_default();
    match values {
        Some(v) => format!("{}:{}:{}x{}", subject_id, v.simple.normalize(), v.weighted.normalize(), coef),
        None => format!("{}:absent", subject_id),
    }
}
