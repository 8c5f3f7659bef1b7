use tracing::error;

use crate::model::*;
use crate::observability;

use super::availability::reserved_with_pending;
use super::EngineError;

/// Read queries take any ordered span; the line limits below don't apply.
pub(crate) fn validate_query_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    validate_query_span(span)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_quantity(quantity: Qty) -> Result<(), EngineError> {
    if quantity <= Qty::ZERO {
        return Err(EngineError::InvalidQuantity(quantity));
    }
    Ok(())
}

/// Log and count a negative availability figure; callers decide whether to
/// return it or refuse.
pub(crate) fn report_negative(key: &ProductKey, span: &Span, on_hand: Qty, reserved: Qty) -> String {
    let msg = format!("{key}: on hand {on_hand} below reserved {reserved} over {span}");
    error!("negative availability: {msg}");
    metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    msg
}

/// Admission decision for `requested` units over `span`: ledger reservations plus
/// `pending` (lines admitted earlier in the same batch) must leave room.
/// Caller holds the product's write lock.
pub(crate) fn check_capacity(
    pl: &ProductLedger,
    span: &Span,
    requested: Qty,
    on_hand: Qty,
    pending: &[(Span, Qty)],
) -> Result<(), EngineError> {
    let reserved = reserved_with_pending(pl, span, pending);
    let available = on_hand - reserved;
    if available < Qty::ZERO {
        return Err(EngineError::InvariantViolation(report_negative(
            &pl.key, span, on_hand, reserved,
        )));
    }
    if available < requested {
        return Err(EngineError::InsufficientCapacity {
            key: pl.key,
            requested,
            available,
        });
    }
    Ok(())
}
