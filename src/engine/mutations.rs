use tokio::sync::oneshot;
use tracing::{error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::admission::{check_capacity, validate_quantity, validate_span};
use super::{Engine, EngineError, WalControl};

/// Who asked for a time-gated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Honour the line's dates.
    Scheduled,
    /// Explicit operator action; skips the date gate.
    Operator,
}

fn expect_transition(line: &BookingLine, event: LineEvent) -> Result<(), EngineError> {
    match line.state.next(event) {
        Some(_) => Ok(()),
        None => Err(EngineError::InvalidTransition {
            id: line.id,
            from: line.state,
            to: event.target(),
        }),
    }
}

fn count_transition(event: LineEvent) {
    metrics::counter!(observability::TRANSITIONS_TOTAL, "event" => event.as_str()).increment(1);
}

impl Engine {
    pub async fn create_draft(
        &self,
        id: Ulid,
        key: ProductKey,
        quantity: Qty,
        span: Span,
        booking_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate_quantity(quantity)?;
        validate_span(&span)?;
        let mut guard = self.lock_product(key).await?;
        if guard.lines.len() >= MAX_LINES_PER_PRODUCT {
            return Err(EngineError::LimitExceeded("too many lines on product"));
        }
        // Ids are global: a draft racing on another product must lose here.
        self.ledger.claim_line_id(id, key)?;

        let event = Event::LineDrafted {
            id,
            key,
            booking_id,
            quantity,
            span,
        };
        let result = self.persist_and_apply(&mut guard, &event).await;
        if result.is_err() && guard.get(id).is_none() {
            self.ledger.release_line_id(&id, &key);
        }
        result
    }

    /// Change quantity and span of a line still in `draft`.
    pub async fn amend_draft(&self, id: Ulid, quantity: Qty, span: Span) -> Result<(), EngineError> {
        validate_quantity(quantity)?;
        validate_span(&span)?;
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if line.state != LineState::Draft {
            return Err(EngineError::NotEditable {
                id,
                state: line.state,
            });
        }
        let event = Event::LineAmended {
            id,
            key,
            quantity,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// draft → reserved. Availability is recomputed here, under the product's
    /// lock, and the line is admitted in the same critical section.
    pub async fn confirm(&self, id: Ulid) -> Result<(), EngineError> {
        let result = self.confirm_line(id).await;
        metrics::counter!(
            observability::ADMISSIONS_TOTAL,
            "outcome" => observability::admission_outcome(&result)
        )
        .increment(1);
        result
    }

    async fn confirm_line(&self, id: Ulid) -> Result<(), EngineError> {
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_transition(&line, LineEvent::Confirm)?;

        let on_hand = self.stock.on_hand(&key).await?;
        if let Err(e) = check_capacity(&guard, &line.span, line.quantity, on_hand, &[]) {
            info!("line {id} refused: {e}");
            return Err(e);
        }

        self.persist_and_apply(&mut guard, &Event::LineConfirmed { id, key })
            .await?;
        count_transition(LineEvent::Confirm);
        info!("line {id} reserved: {} of {key} over {}", line.quantity, line.span);
        Ok(())
    }

    /// Confirm every draft line of a booking, all or nothing. Lines may belong
    /// to different products. Returns how many lines were reserved.
    pub async fn confirm_booking(&self, booking_id: Ulid) -> Result<usize, EngineError> {
        let result = self.confirm_booking_lines(booking_id).await;
        metrics::counter!(
            observability::ADMISSIONS_TOTAL,
            "outcome" => observability::admission_outcome(&result)
        )
        .increment(1);
        result
    }

    async fn confirm_booking_lines(&self, booking_id: Ulid) -> Result<usize, EngineError> {
        let line_ids = self.ledger.line_ids_for_booking(&booking_id);
        if line_ids.is_empty() {
            return Err(EngineError::NotFound(booking_id));
        }
        if line_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("booking has too many lines"));
        }

        // Lock in sorted key order so overlapping bookings can't deadlock.
        let mut keys: Vec<ProductKey> = line_ids
            .iter()
            .filter_map(|id| self.ledger.key_for_line(id))
            .collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_product(*key).await?);
        }

        // Phase 1: admit every draft line against the ledger plus the lines
        // already admitted from this booking.
        let mut admitted: Vec<(usize, Ulid)> = Vec::new();
        for (idx, guard) in guards.iter().enumerate() {
            let drafts: Vec<&BookingLine> = guard
                .lines
                .iter()
                .filter(|l| l.booking_id == Some(booking_id) && l.state == LineState::Draft)
                .collect();
            if drafts.is_empty() {
                continue;
            }
            let on_hand = self.stock.on_hand(&keys[idx]).await?;
            let mut pending = Vec::with_capacity(drafts.len());
            for line in drafts {
                check_capacity(guard, &line.span, line.quantity, on_hand, &pending)?;
                pending.push((line.span, line.quantity));
                admitted.push((idx, line.id));
            }
        }

        // Phase 2: everything fits. One journal unit, so a failed append
        // leaves every line a draft.
        let events: Vec<(usize, Event)> = admitted
            .iter()
            .map(|&(idx, id)| (idx, Event::LineConfirmed { id, key: keys[idx] }))
            .collect();
        self.persist_and_apply_all(&mut guards, events).await?;
        for _ in &admitted {
            count_transition(LineEvent::Confirm);
        }
        info!("booking {booking_id}: {} lines reserved", admitted.len());
        Ok(admitted.len())
    }

    /// draft/reserved → cancelled. A reserved line stops counting immediately.
    pub async fn cancel(&self, id: Ulid) -> Result<(), EngineError> {
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_transition(&line, LineEvent::Cancel)?;

        self.persist_and_apply(&mut guard, &Event::LineCancelled { id, key })
            .await?;
        count_transition(LineEvent::Cancel);
        if line.state == LineState::Reserved {
            info!("line {id} released {} of {key}", line.quantity);
        }
        Ok(())
    }

    /// Cancel every draft or reserved line of a booking. Returns how many.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<usize, EngineError> {
        let line_ids = self.ledger.line_ids_for_booking(&booking_id);
        if line_ids.is_empty() {
            return Err(EngineError::NotFound(booking_id));
        }
        let mut cancelled = 0;
        for id in line_ids {
            let line = self.get_line(id).await?;
            if line.state.next(LineEvent::Cancel).is_some() {
                self.cancel(id).await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// reserved → ongoing once the span has begun.
    pub async fn start(&self, id: Ulid) -> Result<(), EngineError> {
        self.start_with(id, Trigger::Scheduled).await
    }

    /// reserved → ongoing. Units physically leave stock; the line stops counting
    /// in the ledger because on-hand now reflects it.
    pub async fn start_with(&self, id: Ulid, trigger: Trigger) -> Result<(), EngineError> {
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_transition(&line, LineEvent::Start)?;
        let now = self.now_ms();
        if trigger == Trigger::Scheduled && now < line.span.start {
            return Err(EngineError::TooEarly {
                id,
                now,
                at: line.span.start,
            });
        }

        if let Err(e) = self.stock.move_out(&key, line.quantity).await {
            let e = EngineError::from(e);
            if matches!(e, EngineError::InsufficientStock { .. }) {
                error!("line {id}: reserved units missing from stock: {e}");
                metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
            }
            return Err(e);
        }
        if let Err(e) = self
            .persist_and_apply(&mut guard, &Event::LineStarted { id, key })
            .await
        {
            // Line is still reserved; put the units back.
            if let Err(undo) = self.stock.move_in(&key, line.quantity).await {
                error!("line {id}: cannot undo move-out after failed commit: {undo}");
            }
            return Err(e);
        }
        count_transition(LineEvent::Start);
        info!("line {id} out on rent: {} of {key}", line.quantity);
        Ok(())
    }

    /// ongoing → finished once the span has ended. No stock movement.
    pub async fn elapse(&self, id: Ulid) -> Result<(), EngineError> {
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_transition(&line, LineEvent::Elapse)?;
        let now = self.now_ms();
        if now < line.span.end {
            return Err(EngineError::TooEarly {
                id,
                now,
                at: line.span.end,
            });
        }

        self.persist_and_apply(&mut guard, &Event::LineElapsed { id, key })
            .await?;
        count_transition(LineEvent::Elapse);
        Ok(())
    }

    /// finished → returned. The call is the confirmation that units are back.
    pub async fn return_stock(&self, id: Ulid) -> Result<(), EngineError> {
        let (key, mut guard) = self.resolve_line_write(id).await?;
        let line = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_transition(&line, LineEvent::Return)?;

        self.stock.move_in(&key, line.quantity).await?;
        if let Err(e) = self
            .persist_and_apply(&mut guard, &Event::LineReturned { id, key })
            .await
        {
            if let Err(undo) = self.stock.move_out(&key, line.quantity).await {
                error!("line {id}: cannot undo move-in after failed commit: {undo}");
            }
            return Err(e);
        }
        count_transition(LineEvent::Return);
        info!("line {id} returned {} of {key}", line.quantity);
        Ok(())
    }

    /// `ongoing` lines whose span ended at or before `now`.
    pub fn collect_elapsed(&self, now: Ms) -> Vec<(Ulid, ProductKey)> {
        let mut due = Vec::new();
        for key in self.ledger.product_keys() {
            let Some(pl) = self.ledger.get_product(&key) else {
                continue;
            };
            // Busy partitions are picked up on the next sweep.
            if let Ok(guard) = pl.try_read() {
                due.extend(
                    guard
                        .lines
                        .iter()
                        .filter(|l| l.state == LineState::Ongoing && l.span.end <= now)
                        .map(|l| (l.id, key)),
                );
            }
        }
        due
    }

    /// Rewrite the WAL down to one draft event plus the state path per line.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_control(WalControl::Compact { response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_control(WalControl::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
