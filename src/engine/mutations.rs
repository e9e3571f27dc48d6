use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::guard::*;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Units ────────────────────────────────────────────────

    pub async fn create_unit(
        &self,
        ota: &str,
        property_id: &str,
        ical_url: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if self.units.len() >= MAX_UNITS {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        let (ota, property_id, ical_url) = Self::unit_fields(ota, property_id, ical_url)?;

        let _lifecycle = self.lifecycle.read().await;
        let id = Ulid::new();
        let event = Event::UnitCreated {
            id,
            ota: ota.clone(),
            property_id: property_id.clone(),
            ical_url: ical_url.clone(),
        };
        self.wal_append(&event).await?;
        tracing::info!("unit {id} created ({ota} {property_id})");
        let us = UnitState::new(id, ota, property_id, ical_url);
        self.units.insert(id, Arc::new(RwLock::new(us)));
        Ok(id)
    }

    /// Trimmed and checked unit fields, without touching any state.
    pub fn unit_fields(
        ota: &str,
        property_id: &str,
        ical_url: Option<String>,
    ) -> Result<(String, String, Option<String>), EngineError> {
        let ota = ota.trim();
        if ota.is_empty() {
            return Err(EngineError::invalid("OTA name is required"));
        }
        if ota.len() > MAX_OTA_NAME_LEN {
            return Err(EngineError::LimitExceeded("OTA name too long"));
        }
        if Source::is_reserved_ota_name(ota) {
            return Err(EngineError::invalid(format!("'{ota}' is a reserved source tag")));
        }
        let property_id = property_id.trim();
        if property_id.len() > MAX_PROPERTY_ID_LEN {
            return Err(EngineError::LimitExceeded("property id too long"));
        }
        let ical_url = normalize_url(ical_url)?;
        Ok((ota.to_string(), property_id.to_string(), ical_url))
    }

    /// Create several units after every one of them has passed validation.
    /// `Err((index, e))` names the first bad row; nothing is written then.
    pub async fn create_units(
        &self,
        rows: Vec<(String, String, Option<String>)>,
    ) -> Result<Vec<Ulid>, (usize, EngineError)> {
        let mut checked = Vec::with_capacity(rows.len());
        for (i, (ota, property_id, url)) in rows.into_iter().enumerate() {
            checked.push(Self::unit_fields(&ota, &property_id, url).map_err(|e| (i, e))?);
        }
        if self.units.len() + checked.len() > MAX_UNITS {
            return Err((0, EngineError::LimitExceeded("too many units")));
        }
        let mut ids = Vec::with_capacity(checked.len());
        for (i, (ota, property_id, url)) in checked.into_iter().enumerate() {
            ids.push(self.create_unit(&ota, &property_id, url).await.map_err(|e| (i, e))?);
        }
        Ok(ids)
    }

    /// Point a unit at a new feed URL. `None` stops syncing it.
    pub async fn set_ical_url(
        &self,
        unit_id: Ulid,
        ical_url: Option<String>,
    ) -> Result<(), EngineError> {
        let ical_url = normalize_url(ical_url)?;
        let mut guard = self.write_unit(unit_id).await?;
        let event = Event::IcalUrlChanged {
            id: unit_id,
            ical_url,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a unit together with its blocks, rate plan and overrides.
    pub async fn delete_unit(&self, unit_id: Ulid) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.read().await;
        let guard = self.write_unit(unit_id).await?;
        let event = Event::UnitDeleted { id: unit_id };
        self.wal_append(&event).await?;
        self.unindex_unit(&guard);
        self.units.remove(&unit_id);
        tracing::info!("unit {unit_id} deleted with {} blocks", guard.blocks.len());
        Ok(())
    }

    // ── Blocks ───────────────────────────────────────────────

    /// Store a block. Duplicates are accepted: idempotency is the caller's job.
    pub async fn add_block(
        &self,
        unit_id: Ulid,
        range: DateRange,
        source: Source,
        note: String,
    ) -> Result<Ulid, EngineError> {
        validate_note(&note)?;
        let mut guard = self.write_unit(unit_id).await?;
        validate_block_room(&guard, 1)?;

        let id = Ulid::new();
        let event = Event::BlockAdded {
            id,
            unit_id,
            range,
            source: source.clone(),
            note: note.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(crate::observability::BLOCKS_WRITTEN_TOTAL, "source" => "admin")
            .increment(1);
        if source == Source::Manual {
            self.notify.send(Notice::ManualBlock {
                unit_id,
                range,
                source,
                note,
            });
        }
        Ok(id)
    }

    /// Remove one block. Returns false (not an error) when it doesn't exist.
    pub async fn remove_block(&self, block_id: Ulid) -> Result<bool, EngineError> {
        let Some(unit_id) = self.unit_for_block(&block_id) else {
            return Ok(false);
        };
        let mut guard = match self.write_unit(unit_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        // The block may have been replaced while we waited for the lock.
        if !guard.blocks.iter().any(|b| b.id == block_id) {
            return Ok(false);
        }
        let event = Event::BlockRemoved {
            id: block_id,
            unit_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Remove every block of `unit_id` carrying exactly `source`.
    pub async fn remove_blocks(&self, unit_id: Ulid, source: &Source) -> Result<usize, EngineError> {
        let mut guard = self.write_unit(unit_id).await?;
        let removed: Vec<(Ulid, Ulid)> = guard
            .blocks
            .iter()
            .filter(|b| &b.source == source)
            .map(|b| (unit_id, b.id))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }
        let count = removed.len();
        let event = Event::BlocksRemoved { removed };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(count)
    }

    /// Commit step of a reconciliation pass: drop the unit's `source` blocks and
    /// insert `ranges` in their place, as one WAL record. Blocks from any other
    /// source are untouched. On failure the unit keeps its previous blocks.
    pub async fn replace_source_blocks(
        &self,
        unit_id: Ulid,
        source: Source,
        ranges: Vec<(DateRange, String)>,
        synced_at: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        if ranges.len() > MAX_FEED_EVENTS {
            return Err(EngineError::LimitExceeded("too many feed events"));
        }
        let mut guard = self.write_unit(unit_id).await?;
        let kept = guard.blocks.iter().filter(|b| b.source != source).count();
        if kept + ranges.len() > MAX_BLOCKS_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many blocks on unit"));
        }

        let blocks: Vec<Block> = ranges
            .into_iter()
            .map(|(range, note)| Block {
                id: Ulid::new(),
                unit_id,
                range,
                source: source.clone(),
                note,
            })
            .collect();
        let inserted = blocks.len();
        let event = Event::SourceReplaced {
            unit_id,
            source,
            blocks,
            synced_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BLOCKS_WRITTEN_TOTAL, "source" => "sync")
            .increment(inserted as u64);
        Ok(inserted)
    }

    // ── Booking Guard ────────────────────────────────────────

    /// Book every unit of a group for `range`, all or nothing.
    ///
    /// Each unit's write lock is held from the overlap check through the insert,
    /// so two concurrent bookings for overlapping dates cannot both pass the
    /// check. Returns the new block ids in unit-id order.
    pub async fn book_group(
        &self,
        unit_ids: &[Ulid],
        range: DateRange,
        guest: &Guest,
        group: Option<&str>,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_stay(&range)?;
        if unit_ids.is_empty() {
            return Err(EngineError::invalid("no units linked to this property"));
        }
        if unit_ids.len() > MAX_GROUP_UNITS {
            return Err(EngineError::LimitExceeded("too many units in group"));
        }
        let name = guest.name.trim();
        let email = guest.email.trim();
        if name.is_empty() || email.is_empty() {
            return Err(EngineError::invalid("missing fields"));
        }
        let note = match group {
            Some(slug) => format!("Guest: {name} {email} (group:{slug})"),
            None => format!("Guest: {name} {email}"),
        };
        validate_note(&note)?;

        let mut guards = self.write_units(unit_ids).await?;

        // Phase 1: every unit must be free. Nothing is written on conflict.
        for guard in &guards {
            validate_block_room(guard, 1)?;
            if let Err(e) = check_no_overlap(guard, &range) {
                metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "conflict")
                    .increment(1);
                tracing::info!("booking {range} rejected: unit {} is taken", guard.id);
                return Err(e);
            }
        }

        // Phase 2: one record inserts a direct block per unit.
        let blocks: Vec<Block> = guards
            .iter()
            .map(|guard| Block {
                id: Ulid::new(),
                unit_id: guard.id,
                range,
                source: Source::Direct,
                note: note.clone(),
            })
            .collect();
        let ids: Vec<Ulid> = blocks.iter().map(|b| b.id).collect();
        let booked_units: Vec<Ulid> = blocks.iter().map(|b| b.unit_id).collect();
        let event = Event::BlocksAdded { blocks };
        self.persist_and_apply_all(&mut guards, &event).await?;
        drop(guards);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "booked").increment(1);
        tracing::info!(
            "booked {} {range} on {} units",
            group.unwrap_or("single unit"),
            booked_units.len()
        );
        self.notify.send(Notice::Booked {
            group: group.map(str::to_string),
            unit_ids: booked_units,
            range,
            guest_name: name.to_string(),
            guest_email: email.to_string(),
        });
        Ok(ids)
    }

    /// Block or unblock one night on every unit of a group with a `manual`
    /// block. Blocking skips units that already carry the identical manual
    /// block. Returns how many blocks were added or removed.
    pub async fn toggle_day(
        &self,
        unit_ids: &[Ulid],
        day: NaiveDate,
        action: DayAction,
        note: &str,
    ) -> Result<usize, EngineError> {
        if unit_ids.is_empty() {
            return Err(EngineError::invalid("no units linked"));
        }
        validate_note(note)?;
        let range = DateRange::single_night(day)?;
        let mut guards = self.write_units(unit_ids).await?;

        let is_same_manual = |b: &Block| b.source == Source::Manual && b.range == range;
        let (event, changed) = match action {
            DayAction::Block => {
                let blocks: Vec<Block> = guards
                    .iter()
                    .filter(|g| !g.blocks.iter().any(is_same_manual))
                    .map(|g| Block {
                        id: Ulid::new(),
                        unit_id: g.id,
                        range,
                        source: Source::Manual,
                        note: note.to_string(),
                    })
                    .collect();
                let n = blocks.len();
                (Event::BlocksAdded { blocks }, n)
            }
            DayAction::Unblock => {
                let removed: Vec<(Ulid, Ulid)> = guards
                    .iter()
                    .flat_map(|g| {
                        g.blocks
                            .iter()
                            .filter(|b| is_same_manual(b))
                            .map(|b| (g.id, b.id))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                let n = removed.len();
                (Event::BlocksRemoved { removed }, n)
            }
        };
        if changed == 0 {
            return Ok(0);
        }
        for guard in &guards {
            validate_block_room(guard, 1)?;
        }
        self.persist_and_apply_all(&mut guards, &event).await?;
        drop(guards);

        if let Event::BlocksAdded { blocks } = &event {
            for block in blocks {
                self.notify.send(Notice::ManualBlock {
                    unit_id: block.unit_id,
                    range,
                    source: Source::Manual,
                    note: note.to_string(),
                });
            }
        }
        Ok(changed)
    }

    // ── Rates ────────────────────────────────────────────────

    /// Create or replace the unit's single rate plan.
    pub async fn set_rate_plan(
        &self,
        unit_id: Ulid,
        base_rate: f64,
        weekend_rate: Option<f64>,
        currency: Option<&str>,
    ) -> Result<RatePlan, EngineError> {
        validate_rate("base_rate", base_rate)?;
        if let Some(weekend) = weekend_rate {
            validate_rate("weekend_rate", weekend)?;
        }
        let currency = normalize_currency(currency.unwrap_or(&self.default_currency))?;
        let plan = RatePlan {
            base_rate,
            weekend_rate,
            currency,
        };
        let mut guard = self.write_unit(unit_id).await?;
        let event = Event::RatePlanSet {
            unit_id,
            plan: plan.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(plan)
    }

    pub async fn set_date_rate(
        &self,
        unit_id: Ulid,
        date: NaiveDate,
        price: f64,
    ) -> Result<(), EngineError> {
        validate_rate("price", price)?;
        let mut guard = self.write_unit(unit_id).await?;
        let event = Event::DateRateSet {
            unit_id,
            date,
            price,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Returns false when there was no override for that date.
    pub async fn clear_date_rate(&self, unit_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let mut guard = self.write_unit(unit_id).await?;
        if !guard.date_rates.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::DateRateCleared { unit_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal record list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No unit appears or disappears between the snapshot and the swap.
        let _lifecycle = self.lifecycle.write().await;
        let mut unit_ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        unit_ids.sort();

        // Read locks stay held until the swap so no unit changes underneath
        // the snapshot. Sorted order matches `write_units`.
        let mut guards = Vec::with_capacity(unit_ids.len());
        for unit_id in unit_ids {
            if let Some(us) = self.get_unit(&unit_id) {
                guards.push(us.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::UnitCreated {
                id: guard.id,
                ota: guard.ota.clone(),
                property_id: guard.property_id.clone(),
                ical_url: guard.ical_url.clone(),
            });
            if let Some(plan) = &guard.rate_plan {
                events.push(Event::RatePlanSet {
                    unit_id: guard.id,
                    plan: plan.clone(),
                });
            }
            for (date, price) in &guard.date_rates {
                events.push(Event::DateRateSet {
                    unit_id: guard.id,
                    date: *date,
                    price: *price,
                });
            }

            let feed = guard.feed_source();
            let (mirrored, own): (Vec<Block>, Vec<Block>) = guard
                .blocks
                .iter()
                .cloned()
                .partition(|b| b.source == feed);
            if !own.is_empty() {
                events.push(Event::BlocksAdded { blocks: own });
            }
            match guard.last_sync {
                Some(synced_at) => events.push(Event::SourceReplaced {
                    unit_id: guard.id,
                    source: feed,
                    blocks: mirrored,
                    synced_at,
                }),
                None if !mirrored.is_empty() => events.push(Event::BlocksAdded { blocks: mirrored }),
                None => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        if result.is_ok() {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn normalize_url(url: Option<String>) -> Result<Option<String>, EngineError> {
    match url.map(|u| u.trim().to_string()) {
        None => Ok(None),
        Some(u) if u.is_empty() => Ok(None),
        Some(u) => {
            validate_ical_url(&u)?;
            Ok(Some(u))
        }
    }
}
