//! Pure averaging and ranking arithmetic. Nothing here touches storage.

use crate::config::HonorsBand;
use crate::model::{AverageValues, CohortPlacement, GradeRow, Honors};
use rust_decimal::Decimal;
use std::cmp::Ordering;

const SCALE: Decimal = Decimal::from_parts(20, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalcError {
    pub message: String,
}

impl CalcError {
    fn overflow(what: &str) -> Self {
        CalcError {
            message: format!("decimal overflow while computing {}", what),
        }
    }
}

impl std::fmt::Display for CalcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// How one grade row feeds a subject average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradeUse {
    /// Not published, not counting, marked absent, or ungraded.
    Ignored,
    Counted {
        score: Decimal,
        max: Decimal,
        coefficient: Decimal,
    },
}

pub fn grade_use(g: &GradeRow) -> GradeUse {
    if !g.published || !g.counts_in_average || g.absent {
        return GradeUse::Ignored;
    }
    match g.score {
        Some(score) => GradeUse::Counted {
            score,
            max: g.max_score,
            coefficient: g.coefficient,
        },
        None => GradeUse::Ignored,
    }
}

/// Source invariants the aggregator refuses to average over.
pub fn check_grade(g: &GradeRow) -> Result<(), String> {
    if g.max_score <= Decimal::ZERO {
        return Err(format!("evaluation {} has max_score <= 0", g.evaluation_id));
    }
    if g.coefficient <= Decimal::ZERO {
        return Err(format!("evaluation {} has coefficient <= 0", g.evaluation_id));
    }
    if g.absent && g.score.is_some() {
        return Err(format!(
            "grade on evaluation {} is absent but carries a score",
            g.evaluation_id
        ));
    }
    if let Some(score) = g.score {
        if score.is_sign_negative() && !score.is_zero() {
            return Err(format!("grade on evaluation {} is negative", g.evaluation_id));
        }
        if score > g.max_score {
            return Err(format!(
                "grade on evaluation {} exceeds max_score ({} > {})",
                g.evaluation_id, score, g.max_score
            ));
        }
        if g.cheating && !score.is_zero() {
            return Err(format!(
                "grade on evaluation {} is flagged cheating with a non-zero score",
                g.evaluation_id
            ));
        }
    }
    Ok(())
}

/// `None` is the absent marker: no counted grade exists.
///
/// simple = 20 * sum(score) / sum(max)
/// weighted = sum(20 * score / max * coef) / sum(coef)
pub fn subject_average<I>(grades: I) -> Result<Option<AverageValues>, CalcError>
where
    I: IntoIterator<Item = GradeUse>,
{
    let mut sum_score = Decimal::ZERO;
    let mut sum_max = Decimal::ZERO;
    let mut sum_weighted = Decimal::ZERO;
    let mut sum_coef = Decimal::ZERO;
    let mut counted = 0usize;

    for g in grades {
        let GradeUse::Counted {
            score,
            max,
            coefficient,
        } = g
        else {
            continue;
        };
        counted += 1;
        sum_score = sum_score
            .checked_add(score)
            .ok_or_else(|| CalcError::overflow("score sum"))?;
        sum_max = sum_max
            .checked_add(max)
            .ok_or_else(|| CalcError::overflow("max sum"))?;
        let term = normalized(score, max)?
            .checked_mul(coefficient)
            .ok_or_else(|| CalcError::overflow("weighted term"))?;
        sum_weighted = sum_weighted
            .checked_add(term)
            .ok_or_else(|| CalcError::overflow("weighted sum"))?;
        sum_coef = sum_coef
            .checked_add(coefficient)
            .ok_or_else(|| CalcError::overflow("coefficient sum"))?;
    }

    if counted == 0 || sum_max.is_zero() || sum_coef.is_zero() {
        return Ok(None);
    }
    let simple = SCALE
        .checked_mul(sum_score)
        .and_then(|n| n.checked_div(sum_max))
        .ok_or_else(|| CalcError::overflow("simple average"))?;
    let weighted = sum_weighted
        .checked_div(sum_coef)
        .ok_or_else(|| CalcError::overflow("weighted average"))?;
    Ok(Some(AverageValues { simple, weighted }))
}

/// A score rescaled to a 20-point maximum.
pub fn normalized(score: Decimal, max: Decimal) -> Result<Decimal, CalcError> {
    SCALE
        .checked_mul(score)
        .and_then(|n| n.checked_div(max))
        .ok_or_else(|| CalcError::overflow("normalized score"))
}

/// One subject's contribution to a general average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectWeight {
    pub weighted: Decimal,
    pub coefficient: Decimal,
}

/// simple = mean of subject weighted averages;
/// weighted = sum(weighted * subject coef) / sum(subject coef).
pub fn general_average(subjects: &[SubjectWeight]) -> Result<Option<AverageValues>, CalcError> {
    if subjects.is_empty() {
        return Ok(None);
    }
    let mut sum = Decimal::ZERO;
    let mut sum_weighted = Decimal::ZERO;
    let mut sum_coef = Decimal::ZERO;
    for s in subjects {
        sum = sum
            .checked_add(s.weighted)
            .ok_or_else(|| CalcError::overflow("subject sum"))?;
        let term = s
            .weighted
            .checked_mul(s.coefficient)
            .ok_or_else(|| CalcError::overflow("subject term"))?;
        sum_weighted = sum_weighted
            .checked_add(term)
            .ok_or_else(|| CalcError::overflow("general weighted sum"))?;
        sum_coef = sum_coef
            .checked_add(s.coefficient)
            .ok_or_else(|| CalcError::overflow("subject coefficient sum"))?;
    }
    if sum_coef.is_zero() {
        return Ok(None);
    }
    let simple = sum
        .checked_div(Decimal::from(subjects.len()))
        .ok_or_else(|| CalcError::overflow("general simple average"))?;
    let weighted = sum_weighted
        .checked_div(sum_coef)
        .ok_or_else(|| CalcError::overflow("general weighted average"))?;
    Ok(Some(AverageValues { simple, weighted }))
}

/// Highest band whose lower bound the weighted average reaches. Bands are ascending.
pub fn honors_for(weighted: Option<Decimal>, bands: &[HonorsBand]) -> Honors {
    let Some(w) = weighted else {
        return Honors::None;
    };
    bands
        .iter()
        .rev()
        .find(|b| w >= b.lower_bound)
        .map(|b| b.label)
        .unwrap_or(Honors::None)
}

/// Standard competition ranking ("1224") over `(pupil_id, weighted)` pairs.
///
/// Output is sorted by weighted average descending, ties broken by pupil id.
pub fn rank_cohort(members: &[(String, Decimal)]) -> Result<Vec<(String, CohortPlacement)>, CalcError> {
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let mut sorted: Vec<&(String, Decimal)> = members.iter().collect();
    sorted.sort_by(|a, b| match b.1.cmp(&a.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });

    let class_size = sorted.len() as i64;
    let mut class_min = sorted[0].1;
    let mut class_max = sorted[0].1;
    let mut total = Decimal::ZERO;
    for (_, w) in &sorted {
        class_min = class_min.min(*w);
        class_max = class_max.max(*w);
        total = total
            .checked_add(*w)
            .ok_or_else(|| CalcError::overflow("class total"))?;
    }
    let class_mean = total
        .checked_div(Decimal::from(class_size))
        .ok_or_else(|| CalcError::overflow("class mean"))?;

    let mut out = Vec::with_capacity(sorted.len());
    let mut rank = 0i64;
    let mut prev: Option<Decimal> = None;
    for (i, (pupil_id, w)) in sorted.iter().enumerate() {
        if prev != Some(*w) {
            rank = i as i64 + 1;
            prev = Some(*w);
        }
        out.push((
            pupil_id.clone(),
            CohortPlacement {
                rank,
                class_size,
                class_min,
                class_max,
                class_mean,
            },
        ));
    }
    Ok(out)
}
