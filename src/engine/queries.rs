use ulid::Ulid;

use crate::model::*;

use super::guard::validate_stay;
use super::pricing::{nightly_rates, total_of};
use super::{Engine, EngineError, SharedUnitState};

impl Engine {
    /// True if any stored block of the unit overlaps `range`, whatever its source.
    /// An unknown unit is an error, never a default answer.
    pub async fn query_overlapping(
        &self,
        unit_id: Ulid,
        range: &DateRange,
    ) -> Result<bool, EngineError> {
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        Ok(guard.overlapping(range).next().is_some())
    }

    pub async fn is_available(&self, unit_id: Ulid, range: &DateRange) -> Result<bool, EngineError> {
        Ok(!self.query_overlapping(unit_id, range).await?)
    }

    /// True iff every listed unit is free for `range`.
    pub async fn group_available(
        &self,
        unit_ids: &[Ulid],
        range: &DateRange,
    ) -> Result<bool, EngineError> {
        if unit_ids.is_empty() {
            return Err(EngineError::invalid("no units linked"));
        }
        for &unit_id in unit_ids {
            if self.query_overlapping(unit_id, range).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Blocks, most recent start first. `None` lists every unit; an unknown
    /// unit lists nothing.
    pub async fn list_blocks(&self, unit_id: Option<Ulid>) -> Vec<BlockInfo> {
        let units: Vec<SharedUnitState> = match unit_id {
            Some(id) => self.get_unit(&id).into_iter().collect(),
            None => self.units.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for us in units {
            let guard = us.read().await;
            out.extend(guard.blocks.iter().map(BlockInfo::from));
        }
        out.sort_by(|a, b| {
            b.start_date
                .cmp(&a.start_date)
                .then_with(|| b.id.cmp(&a.id))
        });
        out
    }

    /// Every unit in creation order.
    pub async fn list_units(&self) -> Vec<UnitInfo> {
        let units: Vec<SharedUnitState> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(units.len());
        for us in units {
            out.push(UnitInfo::from(&*us.read().await));
        }
        out.sort_by_key(|u| u.id);
        out
    }

    pub async fn unit_info(&self, unit_id: Ulid) -> Result<UnitInfo, EngineError> {
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        Ok(UnitInfo::from(&*guard))
    }

    /// The unit and its blocks in start order, for calendar export.
    pub async fn unit_with_blocks(
        &self,
        unit_id: Ulid,
    ) -> Result<(UnitInfo, Vec<BlockInfo>), EngineError> {
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        let blocks = guard.blocks.iter().map(BlockInfo::from).collect();
        Ok((UnitInfo::from(&*guard), blocks))
    }

    pub async fn list_date_rates(
        &self,
        unit_id: Ulid,
        range: Option<DateRange>,
    ) -> Result<Vec<DateRateInfo>, EngineError> {
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        let to_info = |(date, price): (&chrono::NaiveDate, &f64)| DateRateInfo {
            unit_id,
            date: *date,
            price: *price,
        };
        Ok(match range {
            Some(range) => guard.overrides_in(&range).map(to_info).collect(),
            None => guard.date_rates.iter().map(to_info).collect(),
        })
    }

    /// Per-night prices for `range`, override > weekend > base.
    pub async fn price_breakdown(
        &self,
        unit_id: Ulid,
        range: &DateRange,
    ) -> Result<Vec<NightlyRate>, EngineError> {
        validate_stay(range)?;
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        nightly_rates(unit_id, guard.rate_plan.as_ref(), &guard.date_rates, range)
    }

    /// Exact total of the breakdown. The currency comes from the unit's plan,
    /// or the engine default when only overrides priced the stay.
    pub async fn calculate_total(
        &self,
        unit_id: Ulid,
        range: &DateRange,
    ) -> Result<Quote, EngineError> {
        validate_stay(range)?;
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.read().await;
        let breakdown = nightly_rates(unit_id, guard.rate_plan.as_ref(), &guard.date_rates, range)?;
        let currency = guard
            .rate_plan
            .as_ref()
            .map_or_else(|| self.default_currency.clone(), |p| p.currency.clone());
        Ok(Quote {
            total: total_of(&breakdown),
            currency,
            nights: breakdown.len(),
            breakdown,
        })
    }
}
