use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;
use crate::wal::{encode_frame, Wal};

use super::conflict::find_conflict;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    /// Duplicate id, or overlap with the given committed reservation.
    Conflict(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    Busy(ResourceId),
    Wal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Busy(rid) => write!(f, "timed out waiting for resource {rid}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// fsync once, then answer every sender with its result.
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
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before handling it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        flush_batch(&mut wal, batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Encode every event first; one that cannot be encoded fails alone and
/// writes nothing. The rest go to disk as a unit: all acknowledged, or all
/// failed with the log cut back.
fn flush_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    let mut frames = Vec::with_capacity(batch.len());
    let mut waiting = Vec::with_capacity(batch.len());
    for (event, tx) in batch {
        match encode_frame(&event) {
            Ok(frame) => {
                frames.push(frame);
                waiting.push(tx);
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }
    if frames.is_empty() {
        return;
    }

    let result = wal.write_batch(&frames);
    for tx in waiting {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply a committed event to a resource's state. Caller holds the write lock.
fn apply_event(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, ResourceId>) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.resource_id.clone());
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationUpdated {
            id,
            title,
            description,
            span,
            updated_at,
            ..
        } => {
            // Re-insert: a new start may move it in the sorted list.
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.title = title.clone();
                r.description = description.clone();
                r.span = *span;
                r.updated_at = *updated_at;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
        }
    }
}

/// Durable reservation records, partitioned by resource.
///
/// Each resource's state sits behind its own `RwLock`; the write half is the
/// admission guard handed out by [`ReservationStore::begin`]. Writes are
/// logged to the WAL (fsynced through the group-commit writer) before they
/// touch memory.
pub struct ReservationStore {
    resources: DashMap<ResourceId, SharedResourceState>,
    /// Reverse lookup: reservation id → resource id.
    index: DashMap<Ulid, ResourceId>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Transactions hold it shared; compaction takes it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    compaction_gate: RwLock<()>,
}

impl ReservationStore {
    /// Replay the WAL at `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = DashMap::new();
        let mut states: HashMap<ResourceId, ResourceState> = HashMap::new();
        for event in &events {
            let rs = states
                .entry(event.resource_id().clone())
                .or_insert_with(|| ResourceState::new(event.resource_id().clone()));
            apply_event(rs, event, &index);
        }

        let resources = DashMap::new();
        for (id, rs) in states {
            resources.insert(id, Arc::new(RwLock::new(rs)));
        }
        metrics::gauge!(RESERVATIONS_LIVE).set(index.len() as f64);
        tracing::info!(
            "store opened: {} events replayed, {} reservations on {} resources",
            events.len(),
            index.len(),
            resources.len()
        );

        Ok(Self {
            resources,
            index,
            wal_tx,
            compaction_gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    async fn persist_and_apply(&self, rs: &mut ResourceState, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_event(rs, event, &self.index);
        metrics::gauge!(RESERVATIONS_LIVE).set(self.index.len() as f64);
        Ok(())
    }

    pub fn resource_state(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    fn resource_or_create(&self, id: &str) -> SharedResourceState {
        self.resources
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.to_string()))))
            .value()
            .clone()
    }

    fn all_resources(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    pub fn resource_of(&self, id: &Ulid) -> Option<ResourceId> {
        self.index.get(id).map(|e| e.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.index.len()
    }

    pub async fn get(&self, id: Ulid) -> Option<Reservation> {
        let rs = self.resource_state(&self.resource_of(&id)?)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    /// Committed reservations of one resource, by start ascending.
    /// With a window, only those intersecting it.
    pub async fn list_by_resource(&self, resource_id: &str, window: Option<&Span>) -> Vec<Reservation> {
        let Some(rs) = self.resource_state(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        match window {
            Some(w) => guard.overlapping(w).cloned().collect(),
            None => guard.reservations.clone(),
        }
    }

    pub async fn list_all(&self) -> Vec<Reservation> {
        self.collect(|_| true).await
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Vec<Reservation> {
        self.collect(|r| r.owner_id == owner_id).await
    }

    /// Gather matching reservations across resources, by start then id.
    async fn collect(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.all_resources() {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| keep(*r)).cloned());
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Open an exclusive transaction on one resource, waiting at most `timeout`.
    pub async fn begin(&self, resource_id: &str, timeout: Duration) -> Result<ResourceTxn<'_>, StoreError> {
        let rs = self.resource_or_create(resource_id);
        let started = Instant::now();
        let acquire = async move {
            let gate = self.compaction_gate.read().await;
            let guard = rs.write_owned().await;
            (gate, guard)
        };
        let (gate, guard) = tokio::time::timeout(timeout, acquire)
            .await
            .map_err(|_| StoreError::Busy(resource_id.to_string()))?;
        metrics::histogram!(GUARD_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(ResourceTxn {
            store: self,
            _gate: gate,
            guard,
        })
    }

    /// Delete by id, locating the owning resource through the index.
    pub async fn delete(&self, id: Ulid, timeout: Duration) -> Result<Reservation, StoreError> {
        let resource_id = self.resource_of(&id).ok_or(StoreError::NotFound(id))?;
        let mut txn = self.begin(&resource_id, timeout).await?;
        txn.delete(id).await
    }

    /// Rewrite the WAL as one `ReservationCreated` per live reservation.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction_gate.write().await;
        let mut events = Vec::with_capacity(self.index.len());
        for rs in self.all_resources() {
            let guard = rs.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
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

/// Exclusive, scoped access to one resource's reservations.
///
/// Everything read through a transaction is committed state, and nobody else
/// can write this resource until it is dropped.
pub struct ResourceTxn<'a> {
    store: &'a ReservationStore,
    _gate: RwLockReadGuard<'a, ()>,
    guard: OwnedRwLockWriteGuard<ResourceState>,
}

impl ResourceTxn<'_> {
    pub fn resource_id(&self) -> &ResourceId {
        &self.guard.id
    }

    pub fn state(&self) -> &ResourceState {
        &self.guard
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.guard.reservations
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.guard.get(id)
    }

    pub async fn insert(&mut self, reservation: Reservation) -> Result<Reservation, StoreError> {
        if reservation.resource_id != self.guard.id {
            return Err(StoreError::Invalid("reservation belongs to another resource"));
        }
        if reservation.span.start >= reservation.span.end {
            return Err(StoreError::Invalid("start must be before end"));
        }
        if self.guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many reservations on resource"));
        }
        if self.store.index.contains_key(&reservation.id) {
            return Err(StoreError::Conflict(reservation.id));
        }
        if let Some(other) = find_conflict(&self.guard, &reservation.span, None) {
            return Err(StoreError::Conflict(other));
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.store.persist_and_apply(&mut self.guard, &event).await?;
        Ok(reservation)
    }

    /// Replace the mutable fields of an existing reservation.
    /// `resource_id`, `owner_id` and `created_at` must match the stored record.
    pub async fn replace(&mut self, reservation: Reservation) -> Result<Reservation, StoreError> {
        let current = self
            .guard
            .get(reservation.id)
            .ok_or(StoreError::NotFound(reservation.id))?;
        if current.resource_id != reservation.resource_id
            || current.owner_id != reservation.owner_id
            || current.created_at != reservation.created_at
        {
            return Err(StoreError::Invalid("immutable fields cannot change"));
        }
        if reservation.span.start >= reservation.span.end {
            return Err(StoreError::Invalid("start must be before end"));
        }
        if let Some(other) = find_conflict(&self.guard, &reservation.span, Some(reservation.id)) {
            return Err(StoreError::Conflict(other));
        }

        let event = Event::ReservationUpdated {
            id: reservation.id,
            resource_id: reservation.resource_id.clone(),
            title: reservation.title.clone(),
            description: reservation.description.clone(),
            span: reservation.span,
            updated_at: reservation.updated_at,
        };
        self.store.persist_and_apply(&mut self.guard, &event).await?;
        Ok(reservation)
    }

    pub async fn delete(&mut self, id: Ulid) -> Result<Reservation, StoreError> {
        let removed = self.guard.get(id).cloned().ok_or(StoreError::NotFound(id))?;
        let event = Event::ReservationDeleted {
            id,
            resource_id: self.guard.id.clone(),
        };
        self.store.persist_and_apply(&mut self.guard, &event).await?;
        Ok(removed)
    }
}
