//! Minimal iCalendar (RFC 5545) reader and writer for availability feeds.
//!
//! Only `VEVENT` date bounds and summaries matter here: a date-time bound is
//! reduced to its calendar date as written in the feed, without zone conversion.

use std::fmt::Write as _;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_FEED_EVENTS;
use crate::model::{BlockInfo, DateRange, UnitInfo};

const CRLF: &str = "\r\n";
const PRODID: &str = "-//roomsync//channel-manager//EN";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IcalError {
    #[error("body is not an iCalendar (no BEGIN:VCALENDAR)")]
    NotACalendar,
    #[error("feed has more than {MAX_FEED_EVENTS} events")]
    TooManyEvents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub range: DateRange,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    /// Well-formed events in feed order.
    pub events: Vec<FeedEvent>,
    /// VEVENTs dropped for a missing or unusable DTSTART/DTEND.
    pub skipped: usize,
}

impl ParsedFeed {
    pub fn total_vevents(&self) -> usize {
        self.events.len() + self.skipped
    }
}

#[derive(Default)]
struct PendingEvent {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    summary: String,
}

impl PendingEvent {
    fn finish(self) -> Option<FeedEvent> {
        let range = DateRange::new(self.start?, self.end?).ok()?;
        Some(FeedEvent {
            range,
            summary: self.summary,
        })
    }
}

/// Parse a feed body. Malformed events are skipped, a body that is not a
/// calendar at all is an error.
pub fn parse(body: &str) -> Result<ParsedFeed, IcalError> {
    let lines = unfold(body);
    if !lines
        .iter()
        .any(|l| l.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(IcalError::NotACalendar);
    }

    let mut feed = ParsedFeed::default();
    let mut current: Option<PendingEvent> = None;

    for line in &lines {
        let Some((name, value)) = split_property(line) else {
            continue;
        };
        match name.as_str() {
            "BEGIN" if value.eq_ignore_ascii_case("VEVENT") => {
                current = Some(PendingEvent::default());
            }
            "END" if value.eq_ignore_ascii_case("VEVENT") => {
                let Some(pending) = current.take() else {
                    continue;
                };
                match pending.finish() {
                    Some(_) if feed.events.len() >= MAX_FEED_EVENTS => {
                        return Err(IcalError::TooManyEvents);
                    }
                    Some(event) => feed.events.push(event),
                    None => feed.skipped += 1,
                }
            }
            "DTSTART" | "DTEND" | "SUMMARY" => {
                let Some(ev) = current.as_mut() else {
                    continue;
                };
                match name.as_str() {
                    "DTSTART" => ev.start = parse_ical_date(value),
                    "DTEND" => ev.end = parse_ical_date(value),
                    _ => ev.summary = unescape_text(value),
                }
            }
            _ => {}
        }
    }
    Ok(feed)
}

/// Join RFC 5545 folded lines (continuations start with a space or tab).
fn unfold(body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in body.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        match line.strip_prefix([' ', '\t']) {
            Some(cont) if !out.is_empty() => {
                if let Some(last) = out.last_mut() {
                    last.push_str(cont);
                }
            }
            _ => out.push(line.to_string()),
        }
    }
    out
}

/// `NAME;PARAM=X:VALUE` → (upper-cased name, value). Parameters are ignored:
/// the value's shape alone tells a date from a date-time.
fn split_property(line: &str) -> Option<(String, &str)> {
    let colon = line.find(':')?;
    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let name = head.split(';').next().unwrap_or(head);
    Some((name.trim().to_ascii_uppercase(), value.trim()))
}

/// `YYYYMMDD` or `YYYYMMDDTHHMMSS[Z]`; either way only the date is kept.
fn parse_ical_date(value: &str) -> Option<NaiveDate> {
    let digits = value.get(..8)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if value.len() > 8 && !value[8..].starts_with(['T', 't']) {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push(' '),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | ';' | ',' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Stable event UID for one exported block.
pub fn export_uid(unit_id: Ulid, block_id: Ulid) -> String {
    format!("cm-{unit_id}-{block_id}@roomsync")
}

/// Render a unit's blocks as an all-day-event calendar with CRLF line endings.
pub fn export_calendar(unit: &UnitInfo, blocks: &[BlockInfo]) -> String {
    let mut out = String::new();
    let summary = escape_text(&format!("BLOCKED ({} {})", unit.ota, unit.property_id));
    for line in ["BEGIN:VCALENDAR", "VERSION:2.0"] {
        out.push_str(line);
        out.push_str(CRLF);
    }
    let _ = write!(out, "PRODID:{PRODID}{CRLF}");
    for b in blocks {
        let _ = write!(
            out,
            "BEGIN:VEVENT{CRLF}\
             UID:{uid}{CRLF}\
             SUMMARY:{summary}{CRLF}\
             DTSTART;VALUE=DATE:{start}{CRLF}\
             DTEND;VALUE=DATE:{end}{CRLF}\
             END:VEVENT{CRLF}",
            uid = export_uid(unit.id, b.id),
            start = b.start_date.format("%Y%m%d"),
            end = b.end_date.format("%Y%m%d"),
        );
    }
    out.push_str("END:VCALENDAR");
    out.push_str(CRLF);
    out
}
