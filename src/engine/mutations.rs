use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_double_booking, validate_calendar, validate_client, validate_product, validate_span,
};
use super::{Engine, EngineError, EntityKind};

fn dedup_ids(ids: Vec<Ulid>) -> Vec<Ulid> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

impl Engine {
    // ── Clients ──────────────────────────────────────────────

    pub async fn create_client(&self, id: Ulid, draft: ClientDraft) -> Result<Client, EngineError> {
        validate_client(&draft)?;
        let _catalog = self.catalog.write().await;
        if self.clients.contains_key(&id) {
            return Err(EngineError::Invalid("client id already in use"));
        }
        if self.client_emails.contains_key(&draft.email) {
            return Err(EngineError::DuplicateEmail(draft.email));
        }

        let client = Client {
            id,
            name: draft.name,
            phone: draft.phone,
            email: draft.email,
        };
        self.persist_catalog(&Event::ClientCreated(client.clone())).await?;
        Ok(client)
    }

    pub async fn update_client(&self, id: Ulid, draft: ClientDraft) -> Result<Client, EngineError> {
        validate_client(&draft)?;
        let _catalog = self.catalog.write().await;
        if !self.clients.contains_key(&id) {
            return Err(EngineError::not_found(EntityKind::Client, id));
        }
        let owner = self.client_emails.get(&draft.email).map(|e| *e.value());
        if owner.is_some_and(|owner| owner != id) {
            return Err(EngineError::DuplicateEmail(draft.email));
        }

        let client = Client {
            id,
            name: draft.name,
            phone: draft.phone,
            email: draft.email,
        };
        self.persist_catalog(&Event::ClientUpdated(client.clone())).await?;
        Ok(client)
    }

    pub async fn delete_client(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.clients.contains_key(&id) {
            return Err(EngineError::not_found(EntityKind::Client, id));
        }
        let referencing = self
            .index
            .client_reservations
            .get(&id)
            .and_then(|refs| refs.first().copied());
        if let Some(reservation) = referencing {
            return Err(EngineError::ReferentialIntegrity {
                kind: EntityKind::Client,
                id,
                reservation,
            });
        }
        self.persist_catalog(&Event::ClientDeleted { id }).await
    }

    // ── Products ─────────────────────────────────────────────

    pub async fn create_product(&self, id: Ulid, draft: ProductDraft) -> Result<Product, EngineError> {
        validate_product(&draft)?;
        let _catalog = self.catalog.write().await;
        if self.products.contains_key(&id) {
            return Err(EngineError::Invalid("product id already in use"));
        }

        let product = Product {
            id,
            name: draft.name,
            description: draft.description,
            price: draft.price,
            is_active: draft.is_active,
        };
        self.persist_catalog(&Event::ProductCreated(product.clone())).await?;
        Ok(product)
    }

    /// Saved reservation items keep the price they were saved with.
    pub async fn update_product(&self, id: Ulid, draft: ProductDraft) -> Result<Product, EngineError> {
        validate_product(&draft)?;
        let _catalog = self.catalog.write().await;
        if !self.products.contains_key(&id) {
            return Err(EngineError::not_found(EntityKind::Product, id));
        }

        let product = Product {
            id,
            name: draft.name,
            description: draft.description,
            price: draft.price,
            is_active: draft.is_active,
        };
        self.persist_catalog(&Event::ProductUpdated(product.clone())).await?;
        Ok(product)
    }

    /// Deletes the product, every reservation item that uses it, and its
    /// membership in calendar product sets.
    pub async fn delete_product(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.products.contains_key(&id) {
            return Err(EngineError::not_found(EntityKind::Product, id));
        }

        // Lock every calendar in sorted order.
        let mut calendar_ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        calendar_ids.sort();
        let mut guards = Vec::with_capacity(calendar_ids.len());
        for calendar_id in &calendar_ids {
            if let Some(cs) = self.get_calendar_state(calendar_id) {
                guards.push(cs.write_owned().await);
            }
        }

        let event = Event::ProductDeleted { id };
        self.wal_append(&event).await?;
        self.apply_product_deleted(&mut guards, &event);
        Ok(())
    }

    // ── Calendars ────────────────────────────────────────────

    fn check_products_exist(&self, products: &[Ulid]) -> Result<(), EngineError> {
        match products.iter().find(|p| !self.products.contains_key(*p)) {
            Some(missing) => Err(EngineError::not_found(EntityKind::Product, *missing)),
            None => Ok(()),
        }
    }

    pub async fn create_calendar(&self, id: Ulid, draft: CalendarDraft) -> Result<Calendar, EngineError> {
        validate_calendar(&draft)?;
        let _catalog = self.catalog.write().await;
        if self.calendars.contains_key(&id) {
            return Err(EngineError::Invalid("calendar id already in use"));
        }
        let products = dedup_ids(draft.products);
        self.check_products_exist(&products)?;

        let calendar = Calendar {
            id,
            name: draft.name,
            description: draft.description,
            products,
            is_active: draft.is_active,
        };
        self.persist_catalog(&Event::CalendarCreated(calendar.clone())).await?;
        Ok(calendar)
    }

    pub async fn update_calendar(&self, id: Ulid, draft: CalendarDraft) -> Result<Calendar, EngineError> {
        validate_calendar(&draft)?;
        let _catalog = self.catalog.write().await;
        let cs = self
            .get_calendar_state(&id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, id))?;
        let products = dedup_ids(draft.products);
        self.check_products_exist(&products)?;

        let calendar = Calendar {
            id,
            name: draft.name,
            description: draft.description,
            products,
            is_active: draft.is_active,
        };
        let mut guard = cs.write().await;
        self.persist_and_apply(&mut guard, &Event::CalendarUpdated(calendar.clone()))
            .await?;
        Ok(calendar)
    }

    pub async fn delete_calendar(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let cs = self
            .get_calendar_state(&id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, id))?;
        let guard = cs.read().await;
        if let Some(r) = guard.reservations.first() {
            return Err(EngineError::ReferentialIntegrity {
                kind: EntityKind::Calendar,
                id,
                reservation: r.id,
            });
        }
        drop(guard);
        self.persist_catalog(&Event::CalendarDeleted { id }).await
    }

    // ── Reservations ─────────────────────────────────────────

    fn product_price(&self, product_id: &Ulid) -> Result<f64, EngineError> {
        self.products
            .get(product_id)
            .map(|p| p.price)
            .ok_or(EngineError::not_found(EntityKind::Product, *product_id))
    }

    fn reject_double_booking(
        &self,
        cs: &CalendarState,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        check_no_double_booking(cs, span, exclude).inspect_err(|e| {
            metrics::counter!(crate::observability::DOUBLE_BOOKINGS_TOTAL).increment(1);
            tracing::debug!("calendar {}: {e}", cs.id());
        })
    }

    /// Book a slot with one item per product id, each priced from the
    /// product's current price. The booking and its items are a single WAL
    /// record, so a crash never leaves a partial item set.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        draft: ReservationDraft,
        product_ids: Vec<Ulid>,
    ) -> Result<Reservation, EngineError> {
        let span = validate_span(draft.start_time, draft.end_time)?;
        if product_ids.len() > MAX_ITEMS_PER_RESERVATION {
            return Err(EngineError::Invalid("too many items on reservation"));
        }

        let _catalog = self.catalog.read().await;
        if !self.clients.contains_key(&draft.client_id) {
            return Err(EngineError::not_found(EntityKind::Client, draft.client_id));
        }
        let priced = product_ids
            .into_iter()
            .map(|pid| self.product_price(&pid).map(|price| (pid, price)))
            .collect::<Result<Vec<_>, _>>()?;
        let cs = self
            .get_calendar_state(&draft.calendar_id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, draft.calendar_id))?;

        let mut guard = cs.write().await;
        if !guard.calendar.is_active {
            return Err(EngineError::Invalid("calendar is not active"));
        }
        if self.index.reservation_to_calendar.contains_key(&id) {
            return Err(EngineError::Invalid("reservation id already in use"));
        }
        self.reject_double_booking(&guard, &span, None)?;

        let items = priced
            .into_iter()
            .map(|(product_id, price)| ReservationItem {
                id: Ulid::new(),
                reservation_id: id,
                product_id,
                price,
            })
            .collect();
        let event = Event::ReservationCreated {
            id,
            calendar_id: draft.calendar_id,
            client_id: draft.client_id,
            span,
            items,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, id))
    }

    /// Re-save a reservation. Keeping the same interval never conflicts with
    /// itself; moving to another calendar locks both in id order.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        draft: ReservationDraft,
    ) -> Result<Reservation, EngineError> {
        let span = validate_span(draft.start_time, draft.end_time)?;
        let _catalog = self.catalog.read().await;
        if !self.clients.contains_key(&draft.client_id) {
            return Err(EngineError::not_found(EntityKind::Client, draft.client_id));
        }
        let target = self
            .get_calendar_state(&draft.calendar_id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, draft.calendar_id))?;

        loop {
            let (current_id, mut current) = self.resolve_reservation_write(id).await?;
            let event = Event::ReservationUpdated {
                id,
                previous_calendar_id: current_id,
                calendar_id: draft.calendar_id,
                client_id: draft.client_id,
                span,
            };

            if current_id == draft.calendar_id {
                self.reject_double_booking(&current, &span, Some(id))?;
                self.persist_and_apply(&mut current, &event).await?;
                return current
                    .reservation(id)
                    .cloned()
                    .ok_or(EngineError::not_found(EntityKind::Reservation, id));
            }

            // Re-acquire both locks in sorted order.
            let source = self
                .get_calendar_state(&current_id)
                .ok_or(EngineError::not_found(EntityKind::Calendar, current_id))?;
            drop(current);
            let (mut from, mut to) = if current_id < draft.calendar_id {
                let from = source.write_owned().await;
                (from, target.clone().write_owned().await)
            } else {
                let to = target.clone().write_owned().await;
                (source.write_owned().await, to)
            };
            if from.reservation(id).is_none() {
                // Moved or deleted while unlocked.
                continue;
            }
            if !to.calendar.is_active {
                return Err(EngineError::Invalid("calendar is not active"));
            }
            self.reject_double_booking(&to, &span, Some(id))?;
            self.persist_move(&mut from, &mut to, &event).await?;
            return to
                .reservation(id)
                .cloned()
                .ok_or(EngineError::not_found(EntityKind::Reservation, id));
        }
    }

    /// Removes the reservation and its items. Returns what was removed.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _catalog = self.catalog.read().await;
        let (calendar_id, mut guard) = self.resolve_reservation_write(id).await?;
        let removed = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
        self.persist_and_apply(&mut guard, &Event::ReservationDeleted { id, calendar_id })
            .await?;
        Ok(removed)
    }

    // ── Reservation items ────────────────────────────────────

    /// Add a line item. The stored price is the product's current price.
    pub async fn add_item(
        &self,
        id: Ulid,
        reservation_id: Ulid,
        product_id: Ulid,
    ) -> Result<ReservationItem, EngineError> {
        let _catalog = self.catalog.read().await;
        let price = self.product_price(&product_id)?;
        if self.index.item_to_reservation.contains_key(&id) {
            return Err(EngineError::Invalid("reservation item id already in use"));
        }
        let (calendar_id, mut guard) = self.resolve_reservation_write(reservation_id).await?;
        let count = guard.reservation(reservation_id).map_or(0, |r| r.items.len());
        if count >= MAX_ITEMS_PER_RESERVATION {
            return Err(EngineError::Invalid("too many items on reservation"));
        }

        let item = ReservationItem {
            id,
            reservation_id,
            product_id,
            price,
        };
        let event = Event::ItemSaved {
            item: item.clone(),
            calendar_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(item)
    }

    /// Re-save an item against `product_id`, re-snapshotting the price.
    pub async fn update_item(&self, id: Ulid, product_id: Ulid) -> Result<ReservationItem, EngineError> {
        let _catalog = self.catalog.read().await;
        let price = self.product_price(&product_id)?;
        let reservation_id = self.item_reservation(id)?;
        let (calendar_id, mut guard) = self.resolve_reservation_write(reservation_id).await?;
        let exists = guard
            .reservation(reservation_id)
            .is_some_and(|r| r.items.iter().any(|i| i.id == id));
        if !exists {
            return Err(EngineError::not_found(EntityKind::ReservationItem, id));
        }

        let item = ReservationItem {
            id,
            reservation_id,
            product_id,
            price,
        };
        let event = Event::ItemSaved {
            item: item.clone(),
            calendar_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(item)
    }

    pub async fn remove_item(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.read().await;
        let reservation_id = self.item_reservation(id)?;
        let (calendar_id, mut guard) = self.resolve_reservation_write(reservation_id).await?;
        let exists = guard
            .reservation(reservation_id)
            .is_some_and(|r| r.items.iter().any(|i| i.id == id));
        if !exists {
            return Err(EngineError::not_found(EntityKind::ReservationItem, id));
        }
        let event = Event::ItemRemoved {
            id,
            reservation_id,
            calendar_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    fn item_reservation(&self, item_id: Ulid) -> Result<Ulid, EngineError> {
        self.index
            .item_to_reservation
            .get(&item_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found(EntityKind::ReservationItem, item_id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Holds `catalog` exclusively so no write lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let mut events = Vec::new();

        events.extend(self.clients.iter().map(|e| Event::ClientCreated(e.value().clone())));
        events.extend(self.products.iter().map(|e| Event::ProductCreated(e.value().clone())));

        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for cs in calendars {
            let guard = cs.read().await;
            events.push(Event::CalendarCreated(guard.calendar.clone()));
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    calendar_id: r.calendar_id,
                    client_id: r.client_id,
                    span: r.span,
                    items: r.items.clone(),
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
