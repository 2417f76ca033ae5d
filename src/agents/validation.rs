use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::models::{AttributeRange, GeneratedItem, RejectedItem, ValidatedItem, Verdict};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: Vec<ValidatedItem>,
    pub rejected: Vec<RejectedItem>,
}

/// Checks quantitative attributes against the request's ranges. Out-of-range
/// items are rescaled as a whole (portion size) when one factor within the
/// tolerance brings every constrained attribute into range.
pub struct ValidationAgent {
    tolerance: f64,
}

impl ValidationAgent {
    pub fn new(config: &PipelineConfig) -> Self {
        Self { tolerance: config.autofix_tolerance.max(0.0) }
    }

    pub fn validate(&self, items: Vec<GeneratedItem>, constraints: &BTreeMap<String, AttributeRange>) -> ValidationReport {
        let mut report = ValidationReport::default();
        for item in items {
            match self.check(&item, constraints) {
                Ok(verdict) => report.valid.push(ValidatedItem { item, verdict }),
                Err(reason) => report.rejected.push(RejectedItem { item, reason }),
            }
        }
        report
    }

    fn check(&self, item: &GeneratedItem, constraints: &BTreeMap<String, AttributeRange>) -> Result<Verdict, String> {
        if item.name.trim().is_empty() {
            return Err("missing name".into());
        }
        if item.description.trim().is_empty() {
            return Err(format!("'{}': missing description", item.name));
        }
        if let Some((attr, v)) = item.attributes.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
            return Err(format!("'{}': {attr} has invalid value {v}", item.name));
        }

        let mut violations = Vec::new();
        for (attr, range) in constraints {
            let Some(value) = item.attributes.get(attr) else {
                return Err(format!("'{}': missing attribute {attr}", item.name));
            };
            if !range.contains(*value) {
                violations.push(format!("{attr} {value} outside {}", describe(range)));
            }
        }
        if violations.is_empty() {
            return Ok(Verdict::Valid);
        }

        match self.feasible_scale(item, constraints) {
            Some(scale) => Ok(Verdict::AutoFixed { scale, corrected: rescale(&item.attributes, scale, constraints) }),
            None => Err(format!(
                "'{}': {} (not fixable within ±{:.0}% rescale)",
                item.name,
                violations.join(", "),
                self.tolerance * 100.0
            )),
        }
    }

    /// Scale factor closest to 1 that satisfies every range, if one exists
    /// inside the tolerance band.
    fn feasible_scale(&self, item: &GeneratedItem, constraints: &BTreeMap<String, AttributeRange>) -> Option<f64> {
        let mut lo = (1.0 - self.tolerance).max(f64::EPSILON);
        let mut hi = 1.0 + self.tolerance;
        for (attr, range) in constraints {
            let value = *item.attributes.get(attr)?;
            if value == 0.0 {
                if !range.contains(0.0) {
                    return None;
                }
                continue;
            }
            if let Some(min) = range.min {
                lo = lo.max(min / value);
            }
            if let Some(max) = range.max {
                hi = hi.min(max / value);
            }
        }
        (lo <= hi).then(|| 1.0f64.clamp(lo, hi))
    }
}

fn rescale(attributes: &BTreeMap<String, f64>, scale: f64, constraints: &BTreeMap<String, AttributeRange>) -> BTreeMap<String, f64> {
    attributes
        .iter()
        .map(|(attr, v)| {
            let mut fixed = (v * scale * 100.0).round() / 100.0;
            // rounding must not push a value back out of its range
            if let Some(range) = constraints.get(attr) {
                if let Some(min) = range.min {
                    fixed = fixed.max(min);
                }
                if let Some(max) = range.max {
                    fixed = fixed.min(max);
                }
            }
            (attr.clone(), fixed)
        })
        .collect()
}

fn describe(range: &AttributeRange) -> String {
    match (range.min, range.max) {
        (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
        (Some(lo), None) => format!("[{lo}, ∞)"),
        (None, Some(hi)) => format!("[0, {hi}]"),
        (None, None) => "any".into(),
    }
}
