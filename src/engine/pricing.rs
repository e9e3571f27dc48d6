use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

// ── Pricing ───────────────────────────────────────────────────────

/// Price every night of `range`.
///
/// Precedence is strict: a per-date override always wins; otherwise a
/// Friday/Saturday night uses the weekend rate when one is configured;
/// otherwise the base rate. A zero rate counts as unset. A night left
/// without a price is an error rather than a guess.
pub fn nightly_rates(
    unit_id: Ulid,
    plan: Option<&RatePlan>,
    overrides: &BTreeMap<NaiveDate, f64>,
    range: &DateRange,
) -> Result<Vec<NightlyRate>, EngineError> {
    range
        .date_sequence()
        .map(|date| {
            let is_weekend = is_weekend_night(date);
            if let Some(&price) = overrides.get(&date) {
                return Ok(NightlyRate {
                    date,
                    price,
                    is_override: true,
                    is_weekend,
                });
            }
            let price = plan
                .map(|plan| match plan.weekend_rate {
                    Some(weekend) if is_weekend && weekend > 0.0 => weekend,
                    _ => plan.base_rate,
                })
                .filter(|&price| price > 0.0)
                .ok_or(EngineError::PriceUndetermined { unit_id, date })?;
            Ok(NightlyRate {
                date,
                price,
                is_override: false,
                is_weekend,
            })
        })
        .collect()
}

/// Exact sum of the nightly prices. No rounding happens here.
pub fn total_of(breakdown: &[NightlyRate]) -> f64 {
    breakdown.iter().map(|n| n.price).sum()
}

/// Smallest currency unit for the payment boundary: `round(total * 100)`.
pub fn to_minor_units(total: f64) -> i64 {
    (total * 100.0).round() as i64
}
