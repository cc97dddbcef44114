use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The only time type. Always UTC.
pub type Timestamp = DateTime<Utc>;

/// Closed interval `[start, end]`.
///
/// Two spans that merely touch at a boundary overlap: a booking ending at
/// 11:00 conflicts with one starting at 11:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    /// Products offered on this calendar. No duplicates.
    pub products: Vec<Ulid>,
    pub is_active: bool,
}

/// A line item. `price` is a copy of the product price taken when the item
/// was last saved, never a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub product_id: Ulid,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub calendar_id: Ulid,
    pub client_id: Ulid,
    pub span: Span,
    /// Owned line items, in insertion order.
    pub items: Vec<ReservationItem>,
}

impl Reservation {
    /// Sum of the stored item prices; zero when there are no items.
    pub fn total_price(&self) -> f64 {
        self.items.iter().fold(0.0, |acc, item| acc + item.price)
    }

    pub fn start_time(&self) -> Timestamp {
        self.span.start
    }

    pub fn end_time(&self) -> Timestamp {
        self.span.end
    }
}

// ── Write inputs ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClientDraft {
    pub name: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductDraft {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarDraft {
    pub name: String,
    pub description: String,
    pub products: Vec<Ulid>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationDraft {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub client_id: Ulid,
    pub calendar_id: Ulid,
}

// ── Calendar state ───────────────────────────────────────────

/// A calendar together with every reservation booked on it.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub calendar: Calendar,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl CalendarState {
    pub fn new(calendar: Calendar) -> Self {
        Self {
            calendar,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.calendar.id
    }

    /// Insert a reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window (closed bounds).
    /// Binary search skips reservations starting after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= query.start)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ClientCreated(Client),
    ClientUpdated(Client),
    ClientDeleted {
        id: Ulid,
    },
    ProductCreated(Product),
    ProductUpdated(Product),
    /// Also drops the product from every calendar and every item using it.
    ProductDeleted {
        id: Ulid,
    },
    CalendarCreated(Calendar),
    CalendarUpdated(Calendar),
    CalendarDeleted {
        id: Ulid,
    },
    /// The booking and its initial items commit as one record.
    ReservationCreated {
        id: Ulid,
        calendar_id: Ulid,
        client_id: Ulid,
        span: Span,
        items: Vec<ReservationItem>,
    },
    /// `previous_calendar_id` differs from `calendar_id` when the
    /// reservation moves; its items move with it.
    ReservationUpdated {
        id: Ulid,
        previous_calendar_id: Ulid,
        calendar_id: Ulid,
        client_id: Ulid,
        span: Span,
    },
    ReservationDeleted {
        id: Ulid,
        calendar_id: Ulid,
    },
    /// Item created or updated, carrying the snapshotted price.
    ItemSaved {
        item: ReservationItem,
        calendar_id: Ulid,
    },
    ItemRemoved {
        id: Ulid,
        reservation_id: Ulid,
        calendar_id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn reservation(start: Timestamp, end: Timestamp) -> Reservation {
        Reservation {
            id: Ulid::new(),
            calendar_id: Ulid::new(),
            client_id: Ulid::new(),
            span: Span::new(start, end),
            items: Vec::new(),
        }
    }

    #[test]
    fn touching_spans_overlap() {
        let a = Span::new(at(10, 0), at(11, 0));
        let b = Span::new(at(11, 0), at(12, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn separated_spans_do_not_overlap() {
        let a = Span::new(at(10, 0), at(11, 0));
        let b = Span::new(at(11, 1), at(12, 0));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn contained_span_overlaps() {
        let outer = Span::new(at(9, 0), at(17, 0));
        let inner = Span::new(at(12, 0), at(12, 30));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn instant_span_overlaps_itself() {
        let s = Span::new(at(10, 0), at(10, 0));
        assert!(s.overlaps(&s));
    }

    #[test]
    fn total_price_sums_items() {
        let mut r = reservation(at(10, 0), at(11, 0));
        assert_eq!(r.total_price(), 0.0);
        assert!(r.total_price().is_sign_positive());

        for price in [10.0, 5.5] {
            r.items.push(ReservationItem {
                id: Ulid::new(),
                reservation_id: r.id,
                product_id: Ulid::new(),
                price,
            });
        }
        assert_eq!(r.total_price(), 15.5);
    }

    #[test]
    fn calendar_state_keeps_reservations_sorted() {
        let mut cs = CalendarState::new(Calendar {
            id: Ulid::new(),
            name: "Room".into(),
            description: String::new(),
            products: vec![],
            is_active: true,
        });
        cs.insert_reservation(reservation(at(14, 0), at(15, 0)));
        cs.insert_reservation(reservation(at(9, 0), at(10, 0)));
        cs.insert_reservation(reservation(at(11, 0), at(12, 0)));

        let starts: Vec<_> = cs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![at(9, 0), at(11, 0), at(14, 0)]);
    }

    #[test]
    fn overlapping_uses_closed_bounds() {
        let mut cs = CalendarState::new(Calendar {
            id: Ulid::new(),
            name: "Room".into(),
            description: String::new(),
            products: vec![],
            is_active: true,
        });
        let early = reservation(at(8, 0), at(10, 0));
        let late = reservation(at(12, 0), at(13, 0));
        let (early_id, late_id) = (early.id, late.id);
        cs.insert_reservation(early);
        cs.insert_reservation(late);

        let hits: Vec<_> = cs
            .overlapping(&Span::new(at(10, 0), at(12, 0)))
            .map(|r| r.id)
            .collect();
        assert_eq!(hits, vec![early_id, late_id]);

        let none: Vec<_> = cs
            .overlapping(&Span::new(at(10, 1), at(11, 59)))
            .collect();
        assert!(none.is_empty());
    }
}
