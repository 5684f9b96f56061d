//! Joins a low general average with the pupil's weak subjects.

use crate::model::{AverageValues, RiskFinding, Subject, WeakSubject};
use rust_decimal::Decimal;
use std::collections::HashMap;

pub struct RiskThresholds {
    pub general: Decimal,
    pub subject: Decimal,
}

/// `None` when the pupil is not at risk (or has no general average).
///
/// Weak subjects are listed weakest first; equal averages order by short name.
pub fn classify(
    pupil_id: &str,
    period_id: &str,
    class_id: &str,
    general: Option<AverageValues>,
    subjects: &[(String, Option<AverageValues>)],
    catalog: &HashMap<String, Subject>,
    thresholds: &RiskThresholds,
) -> Option<RiskFinding> {
    let general = general?;
    if general.weighted >= thresholds.general {
        return None;
    }
    let mut weak: Vec<WeakSubject> = subjects
        .iter()
        .filter_map(|(subject_id, values)| {
            let v = (*values)?;
            if v.weighted >= thresholds.subject {
                return None;
            }
            let short_name = catalog
                .get(subject_id)
                .map(|s| s.short_name.clone())
                .unwrap_or_else(|| subject_id.clone());
            Some(WeakSubject {
                subject_id: subject_id.clone(),
                short_name,
                weighted_average: v.weighted,
            })
        })
        .collect();
    weak.sort_by(|a, b| {
        a.weighted_average
            .cmp(&b.weighted_average)
            .then_with(|| a.short_name.cmp(&b.short_name))
    });
    Some(RiskFinding {
        pupil_id: pupil_id.to_string(),
        period_id: period_id.to_string(),
        class_id: class_id.to_string(),
        general,
        weak_subjects: weak,
    })
}
