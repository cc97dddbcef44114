mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::{EngineError, EntityKind};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCalendarState = Arc<RwLock<CalendarState>>;

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

/// Owns the WAL. Each append that arrives is batched with every append already
/// queued behind it, and the whole batch shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All-or-nothing: on any failure the file is cut back to its length before
/// the batch, so no later batch lands behind a half-written record.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL rollback after failed flush also failed: {e}");
    }
    result
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Reverse lookups kept in step with the calendar states.
#[derive(Default)]
pub(super) struct Indexes {
    /// reservation id → calendar id
    pub(super) reservation_to_calendar: DashMap<Ulid, Ulid>,
    /// item id → reservation id
    pub(super) item_to_reservation: DashMap<Ulid, Ulid>,
    /// client id → reservations referencing it
    pub(super) client_reservations: DashMap<Ulid, Vec<Ulid>>,
}

impl Indexes {
    fn link_client(&self, client_id: Ulid, reservation_id: Ulid) {
        self.client_reservations
            .entry(client_id)
            .or_default()
            .push(reservation_id);
    }

    fn unlink_client(&self, client_id: Ulid, reservation_id: Ulid) {
        if let Some(mut refs) = self.client_reservations.get_mut(&client_id) {
            refs.retain(|r| *r != reservation_id);
        }
    }

    fn forget_reservation(&self, reservation: &Reservation) {
        self.reservation_to_calendar.remove(&reservation.id);
        self.unlink_client(reservation.client_id, reservation.id);
        for item in &reservation.items {
            self.item_to_reservation.remove(&item.id);
        }
    }
}

/// The entity store. Catalog records (clients, products) live in flat maps;
/// every calendar owns its reservations behind its own lock.
///
/// Locking: reservation and item writes hold `catalog` shared plus the write
/// lock of each calendar they touch, for the whole check + WAL append + apply
/// sequence. Client, product and calendar writes hold `catalog` exclusively,
/// so a reference checked by a reservation write cannot disappear before the
/// write commits.
pub struct Engine {
    pub(super) clients: DashMap<Ulid, Client>,
    pub(super) products: DashMap<Ulid, Product>,
    pub(super) calendars: DashMap<Ulid, SharedCalendarState>,
    /// Unique client emails → owning client.
    pub(super) client_emails: DashMap<String, Ulid>,
    pub(super) index: Indexes,
    pub(super) catalog: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a calendar-scoped event. The caller holds the calendar's write lock.
fn apply_to_calendar(cs: &mut CalendarState, event: &Event, index: &Indexes) {
    match event {
        Event::CalendarUpdated(calendar) => cs.calendar = calendar.clone(),
        Event::ReservationCreated {
            id,
            calendar_id,
            client_id,
            span,
            items,
        } => {
            cs.insert_reservation(Reservation {
                id: *id,
                calendar_id: *calendar_id,
                client_id: *client_id,
                span: *span,
                items: items.clone(),
            });
            for item in items {
                index.item_to_reservation.insert(item.id, *id);
            }
            index.reservation_to_calendar.insert(*id, *calendar_id);
            index.link_client(*client_id, *id);
        }
        Event::ReservationUpdated {
            id,
            client_id,
            span,
            ..
        } => {
            // Re-insert so the start-time ordering holds.
            if let Some(mut r) = cs.remove_reservation(*id) {
                if r.client_id != *client_id {
                    index.unlink_client(r.client_id, *id);
                    index.link_client(*client_id, *id);
                }
                r.client_id = *client_id;
                r.span = *span;
                cs.insert_reservation(r);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            if let Some(r) = cs.remove_reservation(*id) {
                index.forget_reservation(&r);
            }
        }
        Event::ItemSaved { item, .. } => {
            if let Some(r) = cs.reservation_mut(item.reservation_id) {
                match r.items.iter_mut().find(|i| i.id == item.id) {
                    Some(existing) => *existing = item.clone(),
                    None => r.items.push(item.clone()),
                }
                index.item_to_reservation.insert(item.id, item.reservation_id);
            }
        }
        Event::ItemRemoved {
            id, reservation_id, ..
        } => {
            if let Some(r) = cs.reservation_mut(*reservation_id) {
                r.items.retain(|i| i.id != *id);
            }
            index.item_to_reservation.remove(id);
        }
        Event::ProductDeleted { id } => {
            cs.calendar.products.retain(|p| p != id);
            for r in &mut cs.reservations {
                r.items.retain(|item| {
                    let keep = item.product_id != *id;
                    if !keep {
                        index.item_to_reservation.remove(&item.id);
                    }
                    keep
                });
            }
        }
        _ => {}
    }
}

/// Apply a `ReservationUpdated` that changes calendars. The caller holds both
/// write locks. Items travel with the reservation.
fn move_reservation(from: &mut CalendarState, to: &mut CalendarState, event: &Event, index: &Indexes) {
    let Event::ReservationUpdated {
        id,
        calendar_id,
        client_id,
        span,
        ..
    } = event
    else {
        return;
    };
    let Some(mut r) = from.remove_reservation(*id) else {
        return;
    };
    if r.client_id != *client_id {
        index.unlink_client(r.client_id, *id);
        index.link_client(*client_id, *id);
    }
    r.calendar_id = *calendar_id;
    r.client_id = *client_id;
    r.span = *span;
    to.insert_reservation(r);
    index.reservation_to_calendar.insert(*id, *calendar_id);
}

/// The calendar whose lock an event needs, for calendar-scoped events.
fn event_calendar_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::CalendarUpdated(calendar) => Some(calendar.id),
        Event::ReservationCreated { calendar_id, .. }
        | Event::ReservationUpdated { calendar_id, .. }
        | Event::ReservationDeleted { calendar_id, .. }
        | Event::ItemSaved { calendar_id, .. }
        | Event::ItemRemoved { calendar_id, .. } => Some(*calendar_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            clients: DashMap::new(),
            products: DashMap::new(),
            calendars: DashMap::new(),
            client_emails: DashMap::new(),
            index: Indexes::default(),
            catalog: RwLock::new(()),
            wal_tx,
        };
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    /// Apply one logged event at startup. We are the only owner of every
    /// calendar lock, so `try_write` always succeeds; never block here since
    /// this runs inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ReservationUpdated {
                previous_calendar_id,
                calendar_id,
                ..
            } if previous_calendar_id != calendar_id => {
                let (Some(from), Some(to)) = (
                    self.get_calendar_state(previous_calendar_id),
                    self.get_calendar_state(calendar_id),
                ) else {
                    return;
                };
                let mut from = from.try_write().expect("replay: uncontended write");
                let mut to = to.try_write().expect("replay: uncontended write");
                move_reservation(&mut from, &mut to, event, &self.index);
            }
            Event::ProductDeleted { .. } => {
                for entry in self.calendars.iter() {
                    let mut cs = entry.value().try_write().expect("replay: uncontended write");
                    apply_to_calendar(&mut cs, event, &self.index);
                }
                self.apply_catalog(event);
            }
            other => match event_calendar_id(other) {
                Some(calendar_id) => {
                    if let Some(cs) = self.get_calendar_state(&calendar_id) {
                        let mut guard = cs.try_write().expect("replay: uncontended write");
                        apply_to_calendar(&mut guard, other, &self.index);
                    }
                }
                None => self.apply_catalog(other),
            },
        }
    }

    /// Apply an event that only touches the catalog maps.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ClientCreated(client) | Event::ClientUpdated(client) => {
                if let Some(old) = self.clients.insert(client.id, client.clone())
                    && old.email != client.email
                {
                    self.client_emails.remove(&old.email);
                }
                self.client_emails.insert(client.email.clone(), client.id);
            }
            Event::ClientDeleted { id } => {
                if let Some((_, client)) = self.clients.remove(id) {
                    self.client_emails.remove(&client.email);
                }
                self.index.client_reservations.remove(id);
            }
            Event::ProductCreated(product) | Event::ProductUpdated(product) => {
                self.products.insert(product.id, product.clone());
            }
            Event::ProductDeleted { id } => {
                self.products.remove(id);
            }
            Event::CalendarCreated(calendar) => {
                let cs = CalendarState::new(calendar.clone());
                self.calendars.insert(calendar.id, Arc::new(RwLock::new(cs)));
            }
            Event::CalendarDeleted { id } => {
                self.calendars.remove(id);
            }
            _ => {}
        }
    }

    /// Write an event through the group-commit writer and wait for the fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append then apply a catalog event. Caller holds `catalog` exclusively.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    /// WAL-append then apply a calendar-scoped event. Caller holds the lock.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_calendar(cs, event, &self.index);
        Ok(())
    }

    /// WAL-append then apply a cross-calendar move. Caller holds both locks.
    pub(super) async fn persist_move(
        &self,
        from: &mut CalendarState,
        to: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        move_reservation(from, to, event, &self.index);
        Ok(())
    }

    pub(super) fn apply_product_deleted(&self, guards: &mut [OwnedRwLockWriteGuard<CalendarState>], event: &Event) {
        for guard in guards.iter_mut() {
            apply_to_calendar(guard, event, &self.index);
        }
        self.apply_catalog(event);
    }

    pub fn get_calendar_state(&self, id: &Ulid) -> Option<SharedCalendarState> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    /// Find the calendar currently holding a reservation and write-lock it.
    /// Retries if the reservation moved between lookup and lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<CalendarState>), EngineError> {
        let missing = || EngineError::not_found(EntityKind::Reservation, reservation_id);
        loop {
            let calendar_id = self
                .index
                .reservation_to_calendar
                .get(&reservation_id)
                .map(|e| *e.value())
                .ok_or_else(missing)?;
            let cs = self.get_calendar_state(&calendar_id).ok_or_else(missing)?;
            let guard = cs.write_owned().await;
            if guard.reservation(reservation_id).is_some() {
                return Ok((calendar_id, guard));
            }
            let now = self
                .index
                .reservation_to_calendar
                .get(&reservation_id)
                .map(|e| *e.value());
            if now.is_none_or(|c| c == calendar_id) {
                return Err(missing());
            }
        }
    }
}
