use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedProductLedger = Arc<RwLock<ProductLedger>>;

/// Every booking line, partitioned per product/company. Each partition sits behind
/// its own lock, which is the admission critical section; the indexes below are
/// only touched while that lock is held.
pub struct ReservationLedger {
    products: DashMap<ProductKey, SharedProductLedger>,
    line_index: DashMap<Ulid, ProductKey>,
    booking_index: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self {
            products: DashMap::new(),
            line_index: DashMap::new(),
            booking_index: DashMap::new(),
        }
    }

    // ── Product partitions ───────────────────────────────────

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn product_keys(&self) -> Vec<ProductKey> {
        self.products.iter().map(|e| *e.key()).collect()
    }

    pub fn get_product(&self, key: &ProductKey) -> Option<SharedProductLedger> {
        self.products.get(key).map(|e| e.value().clone())
    }

    pub fn product_or_insert(&self, key: ProductKey) -> SharedProductLedger {
        self.products
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ProductLedger::new(key))))
            .value()
            .clone()
    }

    pub(super) fn insert_product(&self, key: ProductKey, pl: SharedProductLedger) {
        self.products.insert(key, pl);
    }

    // ── Line and booking indexes ─────────────────────────────

    pub fn key_for_line(&self, id: &Ulid) -> Option<ProductKey> {
        self.line_index.get(id).map(|e| *e.value())
    }

    /// Reserve `id` for a new line of `key`. Fails if any product already
    /// owns it. Done under the product lock, before the draft is journaled.
    pub fn claim_line_id(&self, id: Ulid, key: ProductKey) -> Result<(), EngineError> {
        match self.line_index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(key);
                Ok(())
            }
        }
    }

    /// Undo a claim whose draft never made it into the journal.
    pub fn release_line_id(&self, id: &Ulid, key: &ProductKey) {
        self.line_index.remove_if(id, |_, owner| owner == key);
    }

    pub fn line_ids_for_booking(&self, booking_id: &Ulid) -> Vec<Ulid> {
        self.booking_index
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to its product partition (caller holds the lock).
    pub fn apply_event(&self, pl: &mut ProductLedger, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::LineDrafted {
                id,
                key,
                booking_id,
                quantity,
                span,
            } => {
                let owner = self.line_index.get(id).map(|e| *e.value());
                if pl.get(*id).is_some() || owner.is_some_and(|k| k != *key) {
                    return Err(EngineError::AlreadyExists(*id));
                }
                pl.insert(BookingLine {
                    id: *id,
                    key: *key,
                    booking_id: *booking_id,
                    quantity: *quantity,
                    span: *span,
                    state: LineState::Draft,
                });
                self.line_index.insert(*id, *key);
                if let Some(bid) = booking_id {
                    self.booking_index.entry(*bid).or_default().push(*id);
                }
            }
            Event::LineAmended {
                id, quantity, span, ..
            } => {
                let mut line = pl.remove(*id).ok_or(EngineError::NotFound(*id))?;
                if line.state != LineState::Draft {
                    let state = line.state;
                    pl.insert(line);
                    return Err(EngineError::NotEditable { id: *id, state });
                }
                line.quantity = *quantity;
                line.span = *span;
                pl.insert(line);
            }
            other => {
                if let Some(transition) = other.transition() {
                    pl.update_state(other.line_id(), transition.target())?;
                }
            }
        }
        Ok(())
    }
}

/// Minimal event sequence recreating every line `events` leave behind: one draft
/// event with the final quantity/span, then the transitions to its current state.
pub fn compact_events(events: &[Event]) -> Vec<Event> {
    let scratch = ReservationLedger::new();
    let mut products: BTreeMap<ProductKey, ProductLedger> = BTreeMap::new();
    for event in events {
        let key = event.key();
        let pl = products
            .entry(key)
            .or_insert_with(|| ProductLedger::new(key));
        // Replay already skips these; compaction drops them for good.
        let _ = scratch.apply_event(pl, event);
    }

    let mut out = Vec::new();
    for pl in products.values() {
        for line in &pl.lines {
            out.push(Event::LineDrafted {
                id: line.id,
                key: line.key,
                booking_id: line.booking_id,
                quantity: line.quantity,
                span: line.span,
            });
            out.extend(
                line.state
                    .path()
                    .iter()
                    .map(|e| Event::for_transition(*e, line.id, line.key)),
            );
        }
    }
    out
}
