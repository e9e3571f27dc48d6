//! OTA reconciliation: mirror each unit's external calendar into its
//! feed-sourced blocks.
//!
//! Fetching happens without any lock held. The commit is one
//! `SourceReplaced` record under the unit's write lock, so a failed fetch or a
//! failed commit leaves the unit's previous blocks in place. Two passes over
//! the same unit are not coordinated: the last commit wins.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use ulid::Ulid;

use crate::engine::Engine;
use crate::fetch::{CalendarFetcher, FetchError};
use crate::ical;
use crate::limits::{FEED_NOTE_CHARS, SYNC_STATUS_CHARS};
use crate::model::UnitInfo;

/// Feeds fetched at once during a pass.
const SYNC_CONCURRENCY: usize = 4;
/// Error text kept in a feed check line.
const CHECK_ERROR_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub unit_id: Ulid,
    pub ota: String,
    pub property_id: String,
    pub status: String,
}

impl SyncOutcome {
    fn new(unit: &UnitInfo, status: String) -> Self {
        Self {
            unit_id: unit.id,
            ota: unit.ota.clone(),
            property_id: unit.property_id.clone(),
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.starts_with("OK")
    }
}

/// One entry of a group's merged availability calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEntry {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source: String,
    pub unit_id: Ulid,
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Reconcile one unit against its feed.
pub async fn reconcile_unit(
    engine: &Engine,
    fetcher: &dyn CalendarFetcher,
    unit: &UnitInfo,
) -> SyncOutcome {
    let Some(url) = unit.ical_url.as_deref() else {
        return SyncOutcome::new(unit, "skipped (no iCal URL)".into());
    };
    if !url.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("http")) {
        return SyncOutcome::new(unit, "ERROR — invalid iCal URL".into());
    }

    let feed = match fetcher.fetch_events(url).await {
        Ok(feed) => feed,
        Err(e) => {
            tracing::warn!("sync unit {} ({}): fetch failed: {e}", unit.id, unit.ota);
            return SyncOutcome::new(unit, error_status(&e.to_string()));
        }
    };
    if feed.skipped > 0 {
        tracing::debug!("sync unit {}: skipped {} malformed events", unit.id, feed.skipped);
    }

    // Repeated events within one feed are stored once.
    let mut seen = HashSet::new();
    let ranges: Vec<_> = feed
        .events
        .into_iter()
        .filter(|ev| seen.insert(ev.range))
        .map(|ev| (ev.range, truncate_chars(&ev.summary, FEED_NOTE_CHARS)))
        .collect();
    let source = crate::model::Source::for_ota(&unit.ota);
    match engine
        .replace_source_blocks(unit.id, source, ranges, Utc::now())
        .await
    {
        Ok(inserted) => SyncOutcome::new(unit, format!("OK — {inserted} events")),
        Err(e) => {
            tracing::error!("sync unit {}: commit failed, previous blocks kept: {e}", unit.id);
            SyncOutcome::new(unit, error_status(&e.to_string()))
        }
    }
}

fn error_status(reason: &str) -> String {
    format!("ERROR — {}", truncate_chars(reason, SYNC_STATUS_CHARS))
}

/// Reconcile the given units, or every unit when `unit_ids` is `None`.
/// Results come back in unit order; one unit's failure never stops the others.
pub async fn sync_units(
    engine: &Engine,
    fetcher: &dyn CalendarFetcher,
    unit_ids: Option<&[Ulid]>,
) -> Vec<SyncOutcome> {
    let started = Instant::now();
    let units: Vec<UnitInfo> = match unit_ids {
        None => engine.list_units().await,
        Some(ids) => {
            let mut units = Vec::with_capacity(ids.len());
            for &id in ids {
                match engine.unit_info(id).await {
                    Ok(info) => units.push(info),
                    Err(e) => tracing::warn!("sync: skipping unit {id}: {e}"),
                }
            }
            units
        }
    };

    let outcomes: Vec<SyncOutcome> = stream::iter(units)
        .map(|unit| async move { reconcile_unit(engine, fetcher, &unit).await })
        .buffered(SYNC_CONCURRENCY)
        .collect()
        .await;

    for outcome in &outcomes {
        let label = crate::observability::sync_status_label(&outcome.status);
        metrics::counter!(crate::observability::SYNC_UNITS_TOTAL, "status" => label).increment(1);
    }
    metrics::histogram!(crate::observability::SYNC_PASS_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    let ok = outcomes.iter().filter(|o| o.is_ok()).count();
    tracing::info!(
        "sync pass: {ok}/{} units OK in {:?}",
        outcomes.len(),
        started.elapsed()
    );
    outcomes
}

/// Probe every unit's feed without writing anything.
pub async fn check_feeds(engine: &Engine, fetcher: &dyn CalendarFetcher) -> Vec<SyncOutcome> {
    let units = engine.list_units().await;
    stream::iter(units)
        .map(|unit| async move {
            let Some(url) = unit.ical_url.as_deref() else {
                return SyncOutcome::new(&unit, "(empty — add later)".into());
            };
            let status = match fetcher.get(url).await {
                Ok(resp) if resp.status == 200 && resp.body.contains("BEGIN:VCALENDAR") => {
                    match ical::parse(&resp.body) {
                        Ok(feed) => format!("OK ({} events)", feed.total_vevents()),
                        Err(_) => "OK".to_string(),
                    }
                }
                Ok(resp) => format!("Unexpected ({})", resp.status),
                Err(e) => format!("Error: {}", truncate_chars(&e.to_string(), CHECK_ERROR_CHARS)),
            };
            SyncOutcome::new(&unit, status)
        })
        .buffered(SYNC_CONCURRENCY)
        .collect()
        .await
}

/// Stored blocks of the units plus a best-effort live read of their feeds
/// (tagged `ical`), de-duplicated on (start, end, unit, source).
pub async fn group_calendar(
    engine: &Engine,
    fetcher: &dyn CalendarFetcher,
    unit_ids: &[Ulid],
) -> Vec<CalendarEntry> {
    let mut entries = Vec::new();
    for &unit_id in unit_ids {
        entries.extend(
            engine
                .list_blocks(Some(unit_id))
                .await
                .into_iter()
                .map(|b| CalendarEntry {
                    start_date: b.start_date,
                    end_date: b.end_date,
                    source: b.source,
                    unit_id,
                }),
        );
    }

    let mut feeds = Vec::new();
    for &unit_id in unit_ids {
        if let Ok(UnitInfo {
            ical_url: Some(url),
            ..
        }) = engine.unit_info(unit_id).await
        {
            feeds.push((unit_id, url));
        }
    }
    let live: Vec<(Ulid, Result<ical::ParsedFeed, FetchError>)> = stream::iter(feeds)
        .map(|(unit_id, url)| async move { (unit_id, fetcher.fetch_events(&url).await) })
        .buffered(SYNC_CONCURRENCY)
        .collect()
        .await;
    for (unit_id, result) in live {
        match result {
            Ok(feed) => entries.extend(feed.events.into_iter().map(|ev| CalendarEntry {
                start_date: ev.range.start,
                end_date: ev.range.end,
                source: "ical".into(),
                unit_id,
            })),
            Err(e) => tracing::warn!("availability: live feed for unit {unit_id} skipped: {e}"),
        }
    }

    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert((e.start_date, e.end_date, e.unit_id, e.source.clone())));
    entries
}
