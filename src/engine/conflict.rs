use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build the span for a reservation write, rejecting reversed bounds.
pub(crate) fn validate_span(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    if start > end {
        return Err(EngineError::Invalid("start_time must not be after end_time"));
    }
    Ok(Span::new(start, end))
}

/// Reject a reservation whose closed interval touches or intersects any
/// other reservation on the calendar. `exclude` is the reservation being
/// updated, so re-saving it in place never conflicts with itself.
pub(crate) fn check_no_double_booking(
    cs: &CalendarState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match cs
        .overlapping(span)
        .find(|other| Some(other.id) != exclude)
    {
        Some(other) => Err(EngineError::DoubleBooking(other.id)),
        None => Ok(()),
    }
}

pub(crate) fn validate_price(price: f64) -> Result<(), EngineError> {
    if !price.is_finite() || price < 0.0 {
        return Err(EngineError::Invalid("price must be a non-negative number"));
    }
    Ok(())
}

fn check_len(value: &str, max: usize, msg: &'static str) -> Result<(), EngineError> {
    if value.chars().count() > max {
        return Err(EngineError::Invalid(msg));
    }
    Ok(())
}

pub(crate) fn validate_client(draft: &ClientDraft) -> Result<(), EngineError> {
    check_len(&draft.name, MAX_NAME_LEN, "client name too long")?;
    check_len(&draft.phone, MAX_NAME_LEN, "client phone too long")?;
    check_len(&draft.email, MAX_NAME_LEN, "client email too long")?;
    if draft.email.trim().is_empty() {
        return Err(EngineError::Invalid("client email must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_product(draft: &ProductDraft) -> Result<(), EngineError> {
    check_len(&draft.name, MAX_NAME_LEN, "product name too long")?;
    check_len(&draft.description, MAX_DESCRIPTION_LEN, "product description too long")?;
    validate_price(draft.price)
}

pub(crate) fn validate_calendar(draft: &CalendarDraft) -> Result<(), EngineError> {
    check_len(&draft.name, MAX_NAME_LEN, "calendar name too long")?;
    check_len(&draft.description, MAX_DESCRIPTION_LEN, "calendar description too long")?;
    if draft.products.len() > MAX_PRODUCTS_PER_CALENDAR {
        return Err(EngineError::Invalid("too many products on calendar"));
    }
    Ok(())
}
