use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, EntityKind};

impl Engine {
    pub fn get_client(&self, id: Ulid) -> Result<Client, EngineError> {
        self.clients
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(EntityKind::Client, id))
    }

    /// Ordered by name.
    pub fn list_clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        clients
    }

    pub fn get_product(&self, id: Ulid) -> Result<Product, EngineError> {
        self.products
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found(EntityKind::Product, id))
    }

    pub fn list_products(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.products.iter().map(|e| e.value().clone()).collect();
        products.sort_by_key(|p| p.id);
        products
    }

    pub async fn get_calendar(&self, id: Ulid) -> Result<Calendar, EngineError> {
        let cs = self
            .get_calendar_state(&id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, id))?;
        let guard = cs.read().await;
        Ok(guard.calendar.clone())
    }

    pub async fn list_calendars(&self) -> Vec<Calendar> {
        let mut calendars = Vec::with_capacity(self.calendars.len());
        for cs in self.calendar_states() {
            calendars.push(cs.read().await.calendar.clone());
        }
        calendars.sort_by_key(|c| c.id);
        calendars
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let missing = || EngineError::not_found(EntityKind::Reservation, id);
        let calendar_id = self
            .index
            .reservation_to_calendar
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(missing)?;
        let cs = self.get_calendar_state(&calendar_id).ok_or_else(missing)?;
        let guard = cs.read().await;
        guard.reservation(id).cloned().ok_or_else(missing)
    }

    /// Every reservation, ordered by start time.
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let mut reservations = Vec::new();
        for cs in self.calendar_states() {
            reservations.extend(cs.read().await.reservations.iter().cloned());
        }
        reservations.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        reservations
    }

    /// Reservations on one calendar, ordered by start time.
    pub async fn calendar_reservations(&self, calendar_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let cs = self
            .get_calendar_state(&calendar_id)
            .ok_or(EngineError::not_found(EntityKind::Calendar, calendar_id))?;
        let guard = cs.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn get_item(&self, id: Ulid) -> Result<ReservationItem, EngineError> {
        let missing = || EngineError::not_found(EntityKind::ReservationItem, id);
        let reservation_id = self
            .index
            .item_to_reservation
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(missing)?;
        let reservation = self.get_reservation(reservation_id).await?;
        reservation
            .items
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(missing)
    }

    /// Snapshot the calendar handles so no map guard is held across awaits.
    fn calendar_states(&self) -> Vec<super::SharedCalendarState> {
        self.calendars.iter().map(|e| e.value().clone()).collect()
    }
}
