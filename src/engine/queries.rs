use std::collections::HashMap;

use futures::future::try_join_all;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{report_negative, validate_query_span};
use super::availability::{grid_row, week_columns};
use super::{Engine, EngineError};

impl Engine {
    /// `on_hand − Σ reserved overlapping span`. Not clamped: a negative figure
    /// means stock was depleted behind admission control's back, and is logged
    /// as an invariant violation before being returned.
    pub async fn available(&self, key: ProductKey, span: Span) -> Result<Qty, EngineError> {
        validate_query_span(&span)?;
        // Hold the read lock across the stock read so no admission interleaves.
        let guard = self.read_product(key).await?;
        let on_hand = self.stock.on_hand(&key).await?;
        let reserved = guard
            .as_ref()
            .map_or(Qty::ZERO, |pl| pl.sum_reserved_overlapping(&span));
        let available = on_hand - reserved;
        if available < Qty::ZERO {
            report_negative(&key, &span, on_hand, reserved);
        }
        Ok(available)
    }

    /// Advisory only; `confirm` re-checks under the admission lock.
    pub async fn can_book(
        &self,
        key: ProductKey,
        span: Span,
        quantity: Qty,
    ) -> Result<bool, EngineError> {
        if quantity <= Qty::ZERO {
            return Ok(false);
        }
        Ok(self.available(key, span).await? >= quantity)
    }

    /// Σ quantity of `reserved` lines of `key` overlapping `span`.
    pub async fn sum_reserved_overlapping(
        &self,
        key: ProductKey,
        span: Span,
    ) -> Result<Qty, EngineError> {
        validate_query_span(&span)?;
        Ok(self
            .read_product(key)
            .await?
            .map_or(Qty::ZERO, |pl| pl.sum_reserved_overlapping(&span)))
    }

    pub async fn get_line(&self, id: Ulid) -> Result<BookingLine, EngineError> {
        let key = self
            .ledger
            .key_for_line(&id)
            .ok_or(EngineError::NotFound(id))?;
        self.read_product(key)
            .await?
            .and_then(|pl| pl.get(id).cloned())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn lines_for_product(&self, key: ProductKey) -> Result<Vec<BookingLine>, EngineError> {
        Ok(self
            .read_product(key)
            .await?
            .map(|pl| pl.lines.clone())
            .unwrap_or_default())
    }

    /// Empty for an unknown booking.
    pub async fn lines_for_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<Vec<BookingLine>, EngineError> {
        let mut lines = Vec::new();
        for id in self.ledger.line_ids_for_booking(&booking_id) {
            lines.push(self.get_line(id).await?);
        }
        Ok(lines)
    }

    pub async fn rental_summary(&self, key: ProductKey) -> Result<RentalSummary, EngineError> {
        let guard = self.read_product(key).await?;
        let on_hand = self.stock.on_hand(&key).await?;
        let (reserved, rented) = match guard.as_deref() {
            Some(pl) => (
                pl.sum_in_state(&[LineState::Reserved]),
                pl.sum_in_state(&[LineState::Ongoing, LineState::Finished]),
            ),
            None => (Qty::ZERO, Qty::ZERO),
        };
        Ok(RentalSummary::new(key, on_hand, reserved, rented))
    }

    /// Week-by-week booked/available figures for several products. `needed`
    /// marks cells where a booking's requirement would not fit.
    pub async fn availability_grid(
        &self,
        keys: &[ProductKey],
        start: Ms,
        week_count: u32,
        needed: Option<&HashMap<ProductKey, Qty>>,
    ) -> Result<AvailabilityGrid, EngineError> {
        if keys.len() > MAX_GRID_PRODUCTS {
            return Err(EngineError::LimitExceeded("too many grid products"));
        }
        let columns = week_columns(start, week_count)?;

        let rows = try_join_all(keys.iter().map(|&key| {
            let columns = &columns;
            async move {
                let guard = self.read_product(key).await?;
                let on_hand = self.stock.on_hand(&key).await?;
                let want = needed.and_then(|n| n.get(&key).copied());
                Ok::<_, EngineError>(grid_row(key, guard.as_deref(), on_hand, columns, want))
            }
        }))
        .await?;

        Ok(AvailabilityGrid { columns, rows })
    }
}
