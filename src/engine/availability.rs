use crate::limits::{MAX_GRID_WEEKS, WEEK_MS};
use crate::model::*;

use super::EngineError;

/// Reserved quantity over `span`: committed ledger lines plus not-yet-committed
/// batch members.
pub fn reserved_with_pending(pl: &ProductLedger, span: &Span, pending: &[(Span, Qty)]) -> Qty {
    let batch: Qty = pending
        .iter()
        .filter(|(s, _)| s.overlaps(span))
        .map(|(_, q)| *q)
        .sum();
    pl.sum_reserved_overlapping(span) + batch
}

/// Consecutive week-long columns starting at `start`.
pub fn week_columns(start: Ms, week_count: u32) -> Result<Vec<Span>, EngineError> {
    if week_count == 0 {
        return Ok(Vec::new());
    }
    if week_count > MAX_GRID_WEEKS {
        return Err(EngineError::LimitExceeded("too many grid weeks"));
    }
    let boundary = |w: Ms| {
        w.checked_mul(WEEK_MS)
            .and_then(|offset| start.checked_add(offset))
            .ok_or(EngineError::LimitExceeded("grid start out of range"))
    };
    (0..week_count as Ms)
        .map(|w| Span::new(boundary(w)?, boundary(w + 1)?))
        .collect()
}

/// One grid row. `pl` is `None` for a product with no lines yet.
pub fn grid_row(
    key: ProductKey,
    pl: Option<&ProductLedger>,
    on_hand: Qty,
    columns: &[Span],
    needed: Option<Qty>,
) -> GridRow {
    let cells = columns
        .iter()
        .map(|col| {
            let booked = pl.map_or(Qty::ZERO, |pl| pl.sum_reserved_overlapping(col));
            let available = on_hand - booked;
            GridCell {
                booked,
                available,
                needed,
                shortage: needed.is_some_and(|n| n > available),
            }
        })
        .collect();
    GridRow {
        key,
        on_hand,
        cells,
    }
}
