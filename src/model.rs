use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar dates on the wire are always fixed-width `YYYY-MM-DD`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("invalid date '{0}': expected YYYY-MM-DD")]
    Parse(String),
    #[error("check-out must be after check-in ({start} .. {end})")]
    Empty { start: NaiveDate, end: NaiveDate },
}

/// Parse a strict `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, RangeError> {
    let trimmed = s.trim();
    // chrono tolerates unpadded fields; lexicographic ordering of stored dates does not.
    if trimmed.len() != 10 {
        return Err(RangeError::Parse(s.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT).map_err(|_| RangeError::Parse(s.to_string()))
}

/// Friday and Saturday nights are weekend nights.
pub fn is_weekend_night(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Fri | Weekday::Sat)
}

/// Half-open night range `[start, end)`: `start` is check-in, `end` is checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if end <= start {
            return Err(RangeError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, RangeError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// The one-night range starting at `day`.
    pub fn single_night(day: NaiveDate) -> Result<Self, RangeError> {
        let next = day
            .succ_opt()
            .ok_or_else(|| RangeError::Parse(day.to_string()))?;
        Self::new(day, next)
    }

    pub fn length_nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// A checkout on day D and a check-in on day D do not conflict.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    pub fn is_adjacent(&self, other: &DateRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// One date per night stayed. Each call starts a fresh sequence.
    pub fn date_sequence(&self) -> Nights {
        Nights {
            next: self.start,
            end: self.end,
        }
    }
}

impl IntoIterator for DateRange {
    type Item = NaiveDate;
    type IntoIter = Nights;

    fn into_iter(self) -> Nights {
        self.date_sequence()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct Nights {
    next: NaiveDate,
    end: NaiveDate,
}

impl Iterator for Nights {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.next >= self.end {
            return None;
        }
        let day = self.next;
        self.next = day.succ_opt().unwrap_or(self.end);
        Some(day)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next).num_days().max(0) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Nights {}

/// Origin of a block. Decides which reconciliation pass may delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Source {
    Manual,
    Direct,
    /// Lowercased OTA name, e.g. `airbnb` or `booking.com`.
    Ota(String),
}

impl Source {
    pub fn for_ota(name: &str) -> Self {
        Self::from(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Source::Manual => "manual",
            Source::Direct => "direct",
            Source::Ota(name) => name,
        }
    }

    /// OTA names that would collide with the built-in tags.
    pub fn is_reserved_ota_name(name: &str) -> bool {
        !matches!(Self::for_ota(name), Source::Ota(_))
    }
}

impl From<String> for Source {
    fn from(raw: String) -> Self {
        let tag = raw.trim().to_lowercase();
        match tag.as_str() {
            "manual" => Source::Manual,
            "direct" => Source::Direct,
            _ => Source::Ota(tag),
        }
    }
}

impl From<Source> for String {
    fn from(source: Source) -> Self {
        match source {
            Source::Ota(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged date range marking a unit unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub range: DateRange,
    pub source: Source,
    pub note: String,
}

/// Who a direct booking is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub name: String,
    pub email: String,
}

/// Admin calendar action on a single night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayAction {
    Block,
    Unblock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatePlan {
    pub base_rate: f64,
    /// Friday/Saturday nightly rate. `None` falls back to `base_rate`.
    pub weekend_rate: Option<f64>,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct UnitState {
    pub id: Ulid,
    pub ota: String,
    /// OTA-side property/room identifier.
    pub property_id: String,
    pub ical_url: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub rate_plan: Option<RatePlan>,
    /// Per-date absolute price overrides.
    pub date_rates: BTreeMap<NaiveDate, f64>,
    /// All blocks, sorted by `range.start`.
    pub blocks: Vec<Block>,
}

impl UnitState {
    pub fn new(id: Ulid, ota: String, property_id: String, ical_url: Option<String>) -> Self {
        Self {
            id,
            ota,
            property_id,
            ical_url,
            last_sync: None,
            rate_plan: None,
            date_rates: BTreeMap::new(),
            blocks: Vec::new(),
        }
    }

    /// Tag used for blocks mirrored from this unit's feed.
    pub fn feed_source(&self) -> Source {
        Source::for_ota(&self.ota)
    }

    /// Insert block maintaining sort order by range.start.
    pub fn insert_block(&mut self, block: Block) {
        let pos = self
            .blocks
            .partition_point(|b| b.range.start <= block.range.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Remove every block carrying exactly `source`. Returns how many went.
    pub fn remove_source(&mut self, source: &Source) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|b| &b.source != source);
        before - self.blocks.len()
    }

    /// Blocks whose range overlaps the query.
    /// Binary search skips blocks starting at or after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Block> {
        let right_bound = self.blocks.partition_point(|b| b.range.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }

    pub fn overrides_in(&self, range: &DateRange) -> impl Iterator<Item = (&NaiveDate, &f64)> {
        self.date_rates.range(range.start..range.end)
    }
}

/// The event types. This is the WAL record format: every state change is
/// exactly one record, so multi-row changes replay all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UnitCreated {
        id: Ulid,
        ota: String,
        property_id: String,
        ical_url: Option<String>,
    },
    IcalUrlChanged {
        id: Ulid,
        ical_url: Option<String>,
    },
    /// Cascades to the unit's blocks, rate plan and overrides.
    UnitDeleted {
        id: Ulid,
    },
    BlockAdded {
        id: Ulid,
        unit_id: Ulid,
        range: DateRange,
        source: Source,
        note: String,
    },
    BlockRemoved {
        id: Ulid,
        unit_id: Ulid,
    },
    /// Blocks inserted together, possibly across units.
    BlocksAdded {
        blocks: Vec<Block>,
    },
    /// `(unit_id, block_id)` pairs removed together.
    BlocksRemoved {
        removed: Vec<(Ulid, Ulid)>,
    },
    /// One reconciliation pass: drop every `(unit_id, source)` block, insert `blocks`.
    SourceReplaced {
        unit_id: Ulid,
        source: Source,
        blocks: Vec<Block>,
        synced_at: DateTime<Utc>,
    },
    RatePlanSet {
        unit_id: Ulid,
        plan: RatePlan,
    },
    DateRateSet {
        unit_id: Ulid,
        date: NaiveDate,
        price: f64,
    },
    DateRateCleared {
        unit_id: Ulid,
        date: NaiveDate,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitInfo {
    pub id: Ulid,
    pub ota: String,
    pub property_id: String,
    pub ical_url: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub rate_plan: Option<RatePlan>,
}

impl From<&UnitState> for UnitInfo {
    fn from(us: &UnitState) -> Self {
        Self {
            id: us.id,
            ota: us.ota.clone(),
            property_id: us.property_id.clone(),
            ical_url: us.ical_url.clone(),
            last_sync: us.last_sync,
            rate_plan: us.rate_plan.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source: String,
    pub note: String,
}

impl From<&Block> for BlockInfo {
    fn from(b: &Block) -> Self {
        Self {
            id: b.id,
            unit_id: b.unit_id,
            start_date: b.range.start,
            end_date: b.range.end,
            source: b.source.to_string(),
            note: b.note.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRateInfo {
    pub unit_id: Ulid,
    pub date: NaiveDate,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NightlyRate {
    pub date: NaiveDate,
    pub price: f64,
    pub is_override: bool,
    pub is_weekend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub total: f64,
    pub currency: String,
    pub nights: usize,
    pub breakdown: Vec<NightlyRate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn r(start: &str, end: &str) -> DateRange {
        DateRange::parse(start, end).unwrap()
    }

    fn block(start: &str, end: &str, source: Source) -> Block {
        Block {
            id: Ulid::new(),
            unit_id: Ulid::nil(),
            range: r(start, end),
            source,
            note: String::new(),
        }
    }

    #[test]
    fn range_rejects_empty_and_inverted() {
        assert!(matches!(
            DateRange::parse("2025-11-01", "2025-11-01"),
            Err(RangeError::Empty { .. })
        ));
        assert!(matches!(
            DateRange::parse("2025-11-04", "2025-11-01"),
            Err(RangeError::Empty { .. })
        ));
    }

    #[test]
    fn parse_date_is_strict() {
        assert!(parse_date("2025-11-01").is_ok());
        assert!(parse_date(" 2025-11-01 ").is_ok());
        assert!(matches!(parse_date("2025-1-01"), Err(RangeError::Parse(_))));
        assert!(matches!(parse_date("2025-13-01"), Err(RangeError::Parse(_))));
        assert!(matches!(parse_date("20251101"), Err(RangeError::Parse(_))));
        assert!(matches!(parse_date(""), Err(RangeError::Parse(_))));
    }

    #[test]
    fn range_overlap() {
        let a = r("2025-11-01", "2025-11-05");
        let b = r("2025-11-03", "2025-11-08");
        let c = r("2025-11-05", "2025-11-07");
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // checkout day == check-in day
        assert!(!c.overlaps(&a));
        assert!(a.is_adjacent(&c));
        assert!(!a.is_adjacent(&b));
    }

    #[test]
    fn overlap_matches_shared_dates() {
        // For every pair of ranges inside a small window, overlap must agree
        // with "the two ranges share at least one night".
        let base = d("2025-11-01");
        for s1 in 0..6 {
            for e1 in (s1 + 1)..7 {
                for s2 in 0..6 {
                    for e2 in (s2 + 1)..7 {
                        let a = DateRange::new(
                            base + chrono::Days::new(s1),
                            base + chrono::Days::new(e1),
                        )
                        .unwrap();
                        let b = DateRange::new(
                            base + chrono::Days::new(s2),
                            base + chrono::Days::new(e2),
                        )
                        .unwrap();
                        let shares = a.date_sequence().any(|day| b.contains(day));
                        assert_eq!(a.overlaps(&b), shares, "{a} vs {b}");
                    }
                }
            }
        }
    }

    #[test]
    fn nights_match_sequence_and_restart() {
        let range = r("2025-12-30", "2026-01-03");
        assert_eq!(range.length_nights(), 4);
        let first: Vec<_> = range.date_sequence().collect();
        let second: Vec<_> = range.date_sequence().collect();
        assert_eq!(first.len() as i64, range.length_nights());
        assert_eq!(first, second);
        assert_eq!(first[0], d("2025-12-30"));
        assert_eq!(first[3], d("2026-01-02"));
        assert_eq!(range.date_sequence().len(), 4);
        assert_eq!(range.into_iter().count(), 4);
    }

    #[test]
    fn weekend_nights() {
        assert!(is_weekend_night(d("2025-10-31"))); // Friday
        assert!(is_weekend_night(d("2025-11-01"))); // Saturday
        assert!(!is_weekend_night(d("2025-11-02"))); // Sunday
        assert!(!is_weekend_night(d("2025-11-03")));
    }

    #[test]
    fn source_tags() {
        assert_eq!(Source::for_ota("Airbnb"), Source::Ota("airbnb".into()));
        assert_eq!(Source::for_ota("Booking.com").as_str(), "booking.com");
        assert_eq!(Source::from("MANUAL".to_string()), Source::Manual);
        assert_eq!(Source::from("direct".to_string()), Source::Direct);
        assert!(Source::is_reserved_ota_name(" Manual "));
        assert!(!Source::is_reserved_ota_name("Agoda"));
        let json = serde_json::to_string(&Source::Ota("agoda".into())).unwrap();
        assert_eq!(json, "\"agoda\"");
    }

    #[test]
    fn block_ordering() {
        let mut us = UnitState::new(Ulid::new(), "Airbnb".into(), "r1".into(), None);
        us.insert_block(block("2025-11-10", "2025-11-12", Source::Manual));
        us.insert_block(block("2025-11-01", "2025-11-03", Source::Direct));
        us.insert_block(block("2025-11-05", "2025-11-06", Source::Manual));
        let starts: Vec<_> = us.blocks.iter().map(|b| b.range.start).collect();
        assert_eq!(starts, vec![d("2025-11-01"), d("2025-11-05"), d("2025-11-10")]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut us = UnitState::new(Ulid::new(), "Airbnb".into(), "r1".into(), None);
        us.insert_block(block("2025-10-01", "2025-10-05", Source::Manual));
        us.insert_block(block("2025-10-28", "2025-11-02", Source::Direct));
        us.insert_block(block("2025-12-01", "2025-12-02", Source::Manual));

        let query = r("2025-11-01", "2025-11-10");
        let hits: Vec<_> = us.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range, r("2025-10-28", "2025-11-02"));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut us = UnitState::new(Ulid::new(), "Airbnb".into(), "r1".into(), None);
        us.insert_block(block("2025-11-01", "2025-11-03", Source::Manual));
        let hits: Vec<_> = us.overlapping(&r("2025-11-03", "2025-11-05")).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn remove_source_is_exact() {
        let mut us = UnitState::new(Ulid::new(), "Airbnb".into(), "r1".into(), None);
        us.insert_block(block("2025-11-01", "2025-11-03", Source::Ota("airbnb".into())));
        us.insert_block(block("2025-11-04", "2025-11-05", Source::Ota("booking.com".into())));
        us.insert_block(block("2025-11-06", "2025-11-07", Source::Manual));
        assert_eq!(us.remove_source(&us.feed_source()), 1);
        assert_eq!(us.blocks.len(), 2);
        assert!(us.blocks.iter().all(|b| b.source != Source::Ota("airbnb".into())));
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut us = UnitState::new(Ulid::new(), "Airbnb".into(), "r1".into(), None);
        us.insert_block(block("2025-11-01", "2025-11-03", Source::Manual));
        assert!(us.remove_block(Ulid::new()).is_none());
        assert_eq!(us.blocks.len(), 1);
    }
}
