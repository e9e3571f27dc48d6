mod error;
mod guard;
mod mutations;
mod pricing;
mod queries;

pub use error::EngineError;
pub use pricing::{nightly_rates, to_minor_units, total_of};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

pub const DEFAULT_CURRENCY: &str = "THB";

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        flush_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch. Callers of this batch are told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The block store and rate plan store for every unit.
pub struct Engine {
    pub(super) units: DashMap<Ulid, SharedUnitState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: block id → unit id.
    pub(super) block_to_unit: DashMap<Ulid, Ulid>,
    pub(super) default_currency: String,
    /// Create/delete hold it shared; compaction holds it exclusive from
    /// snapshot to swap so the rewritten log sees every unit lifecycle record.
    pub(super) lifecycle: RwLock<()>,
}

/// Apply an event to one unit. The caller holds the write lock.
/// Multi-unit events only touch the entries that belong to `us`.
fn apply_to_unit(us: &mut UnitState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::IcalUrlChanged { ical_url, .. } => {
            us.ical_url = ical_url.clone();
        }
        Event::BlockAdded {
            id,
            unit_id,
            range,
            source,
            note,
        } => {
            us.insert_block(Block {
                id: *id,
                unit_id: *unit_id,
                range: *range,
                source: source.clone(),
                note: note.clone(),
            });
            index.insert(*id, *unit_id);
        }
        Event::BlockRemoved { id, .. } => {
            us.remove_block(*id);
            index.remove(id);
        }
        Event::BlocksAdded { blocks } => {
            let unit_id = us.id;
            for block in blocks.iter().filter(|b| b.unit_id == unit_id) {
                index.insert(block.id, block.unit_id);
                us.insert_block(block.clone());
            }
        }
        Event::BlocksRemoved { removed } => {
            let unit_id = us.id;
            for (_, block_id) in removed.iter().filter(|(uid, _)| *uid == unit_id) {
                us.remove_block(*block_id);
                index.remove(block_id);
            }
        }
        Event::SourceReplaced {
            source,
            blocks,
            synced_at,
            ..
        } => {
            for old in us.blocks.iter().filter(|b| &b.source == source) {
                index.remove(&old.id);
            }
            us.remove_source(source);
            for block in blocks {
                index.insert(block.id, block.unit_id);
                us.insert_block(block.clone());
            }
            us.last_sync = Some(*synced_at);
        }
        Event::RatePlanSet { plan, .. } => {
            us.rate_plan = Some(plan.clone());
        }
        Event::DateRateSet { date, price, .. } => {
            us.date_rates.insert(*date, *price);
        }
        Event::DateRateCleared { date, .. } => {
            us.date_rates.remove(date);
        }
        // UnitCreated/UnitDeleted are handled at the DashMap level, not here
        Event::UnitCreated { .. } | Event::UnitDeleted { .. } => {}
    }
}

/// Units touched by a non-Create/Delete event.
fn event_unit_ids(event: &Event) -> Vec<Ulid> {
    let mut ids = match event {
        Event::IcalUrlChanged { id, .. } => vec![*id],
        Event::BlockAdded { unit_id, .. }
        | Event::BlockRemoved { unit_id, .. }
        | Event::SourceReplaced { unit_id, .. }
        | Event::RatePlanSet { unit_id, .. }
        | Event::DateRateSet { unit_id, .. }
        | Event::DateRateCleared { unit_id, .. } => vec![*unit_id],
        Event::BlocksAdded { blocks } => blocks.iter().map(|b| b.unit_id).collect(),
        Event::BlocksRemoved { removed } => removed.iter().map(|(uid, _)| *uid).collect(),
        Event::UnitCreated { .. } | Event::UnitDeleted { .. } => Vec::new(),
    };
    ids.sort();
    ids.dedup();
    ids
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.tail_discarded {
            tracing::warn!(
                "WAL {}: discarded torn tail after {} records",
                wal_path.display(),
                replay.events.len()
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            units: DashMap::new(),
            wal_tx,
            notify,
            block_to_unit: DashMap::new(),
            default_currency: DEFAULT_CURRENCY.to_string(),
            lifecycle: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &replay.events {
            match event {
                Event::UnitCreated {
                    id,
                    ota,
                    property_id,
                    ical_url,
                } => {
                    let us = UnitState::new(*id, ota.clone(), property_id.clone(), ical_url.clone());
                    engine.units.insert(*id, Arc::new(RwLock::new(us)));
                }
                Event::UnitDeleted { id } => {
                    if let Some((_, us)) = engine.units.remove(id) {
                        let guard = us.try_read().expect("replay: uncontended read");
                        engine.unindex_unit(&guard);
                    }
                }
                other => {
                    for unit_id in event_unit_ids(other) {
                        if let Some(us) = engine.get_unit(&unit_id) {
                            let mut guard = us.try_write().expect("replay: uncontended write");
                            apply_to_unit(&mut guard, other, &engine.block_to_unit);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "store loaded: {} units, {} blocks",
            engine.units.len(),
            engine.block_to_unit.len()
        );
        Ok(engine)
    }

    /// Currency for quotes on units that have no rate plan.
    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into();
        self
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub fn unit_for_block(&self, block_id: &Ulid) -> Option<Ulid> {
        self.block_to_unit.get(block_id).map(|e| *e.value())
    }

    fn unindex_unit(&self, us: &UnitState) {
        for block in &us.blocks {
            self.block_to_unit.remove(&block.id);
        }
    }

    /// WAL-append then apply. If the append fails the unit is left untouched.
    pub(super) async fn persist_and_apply(
        &self,
        us: &mut UnitState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_unit(us, event, &self.block_to_unit);
        Ok(())
    }

    /// One WAL record applied to several locked units.
    pub(super) async fn persist_and_apply_all(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<UnitState>],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for guard in guards.iter_mut() {
            apply_to_unit(guard, event, &self.block_to_unit);
        }
        Ok(())
    }

    pub(super) async fn write_unit(
        &self,
        unit_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<UnitState>, EngineError> {
        let us = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(unit_id))?;
        let guard = us.write_owned().await;
        // Deleted while we waited for the lock.
        if !self.units.contains_key(&unit_id) {
            return Err(EngineError::NotFound(unit_id));
        }
        Ok(guard)
    }

    /// Write-lock several units. Locks are taken in sorted id order so two
    /// callers locking overlapping groups cannot deadlock.
    pub(super) async fn write_units(
        &self,
        unit_ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<UnitState>>, EngineError> {
        let mut ids = unit_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.write_unit(id).await?);
        }
        Ok(guards)
    }
}
