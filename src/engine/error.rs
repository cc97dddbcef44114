use std::fmt;

use thiserror::Error;
use ulid::Ulid;

/// The kinds of record the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Client,
    Product,
    Calendar,
    Reservation,
    ReservationItem,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Client => "client",
            EntityKind::Product => "product",
            EntityKind::Calendar => "calendar",
            EntityKind::Reservation => "reservation",
            EntityKind::ReservationItem => "reservation item",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("trying to double book a reservation: overlaps reservation {0}")]
    DoubleBooking(Ulid),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Ulid },
    #[error("cannot delete {kind} {id}: still referenced by reservation {reservation}")]
    ReferentialIntegrity {
        kind: EntityKind,
        id: Ulid,
        reservation: Ulid,
    },
    #[error("a client with email {0:?} already exists")]
    DuplicateEmail(String),
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: EntityKind, id: Ulid) -> Self {
        EngineError::NotFound { kind, id }
    }

    /// Stable machine-readable code shared by the REST and GraphQL surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DoubleBooking(_) => "DOUBLE_BOOKING",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::ReferentialIntegrity { .. } => "REFERENTIAL_INTEGRITY",
            EngineError::DuplicateEmail(_) => "UNIQUENESS",
            EngineError::Invalid(_) => "INVALID_INPUT",
            EngineError::Wal(_) => "STORAGE",
        }
    }
}
