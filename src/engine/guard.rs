use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_stay(range: &DateRange) -> Result<(), EngineError> {
    if range.length_nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: &str) -> Result<(), EngineError> {
    if note.len() > MAX_NOTE_LEN {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

pub(crate) fn validate_block_room(us: &UnitState, adding: usize) -> Result<(), EngineError> {
    if us.blocks.len() + adding > MAX_BLOCKS_PER_UNIT {
        return Err(EngineError::LimitExceeded("too many blocks on unit"));
    }
    Ok(())
}

pub(crate) fn validate_ical_url(url: &str) -> Result<(), EngineError> {
    if url.len() > MAX_URL_LEN {
        return Err(EngineError::LimitExceeded("iCal URL too long"));
    }
    if !url.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("http")) {
        return Err(EngineError::invalid("invalid url"));
    }
    Ok(())
}

pub(crate) fn validate_rate(label: &str, rate: f64) -> Result<(), EngineError> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(EngineError::invalid(format!("{label} must be a non-negative number")));
    }
    Ok(())
}

/// Upper-cased ISO-4217-shaped code.
pub(crate) fn normalize_currency(raw: &str) -> Result<String, EngineError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::invalid(format!("invalid currency '{raw}'")));
    }
    Ok(code)
}

/// Any stored block overlapping `range`, whatever its source, means the unit is taken.
pub(crate) fn check_no_overlap(us: &UnitState, range: &DateRange) -> Result<(), EngineError> {
    if us.overlapping(range).next().is_some() {
        return Err(EngineError::Conflict { unit_id: us.id });
    }
    Ok(())
}
