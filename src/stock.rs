use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{ProductKey, Qty};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    InsufficientStock {
        key: ProductKey,
        requested: Qty,
        on_hand: Qty,
    },
    Unavailable(String),
}

impl std::fmt::Display for StockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StockError::InsufficientStock {
                key,
                requested,
                on_hand,
            } => write!(f, "cannot move {requested} of {key}: only {on_hand} on hand"),
            StockError::Unavailable(msg) => write!(f, "stock unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StockError {}

/// Boundary to the external stock subsystem. The engine never owns on-hand
/// quantity; it reads it per call and asks for physical movements.
#[async_trait]
pub trait StockAdapter: Send + Sync {
    /// Company-wide total over all internal locations, read at call time.
    async fn on_hand(&self, key: &ProductKey) -> Result<Qty, StockError>;

    /// Units leave stock (rental goes out). Fails if `quantity` exceeds on-hand.
    async fn move_out(&self, key: &ProductKey, quantity: Qty) -> Result<(), StockError>;

    /// Units come back into stock.
    async fn move_in(&self, key: &ProductKey, quantity: Qty) -> Result<(), StockError>;

    /// Re-apply a rental movement read back from the ledger journal at startup.
    /// Adapters over a stock system that keeps its own history already hold
    /// the movement and leave this as a no-op.
    fn restore(
        &self,
        _key: &ProductKey,
        _direction: Direction,
        _quantity: Qty,
    ) -> Result<(), StockError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockMove {
    pub key: ProductKey,
    pub direction: Direction,
    pub quantity: Qty,
}

/// One seed record. Quantities are decimal strings, e.g. `"20"` or `"12.5"`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantRecord {
    pub product: Ulid,
    pub company: Ulid,
    #[serde(default)]
    pub location: Option<Ulid>,
    pub quantity: Qty,
}

/// Stock kept per (product/company, internal location) and pooled on read.
pub struct InMemoryStock {
    quants: DashMap<ProductKey, BTreeMap<Ulid, Qty>>,
    /// Location returned units are put back into.
    home: Ulid,
    moves: Mutex<Vec<StockMove>>,
    unavailable: AtomicBool,
}

impl Default for InMemoryStock {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStock {
    pub fn new() -> Self {
        Self {
            quants: DashMap::new(),
            home: Ulid::new(),
            moves: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = QuantRecord>) -> Self {
        let stock = Self::new();
        for r in records {
            let location = r.location.unwrap_or(stock.home);
            stock.receive(ProductKey::new(r.product, r.company), location, r.quantity);
        }
        stock
    }

    /// Load a JSON array of [`QuantRecord`].
    pub fn load_json(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let records: Vec<QuantRecord> = serde_json::from_reader(io::BufReader::new(file))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_records(records))
    }

    /// Put units at an internal location (initial stock, purchases).
    pub fn receive(&self, key: ProductKey, location: Ulid, quantity: Qty) {
        *self
            .quants
            .entry(key)
            .or_default()
            .entry(location)
            .or_insert(Qty::ZERO) += quantity;
    }

    /// Shrink or drop stock outside the rental flow (damage, sale).
    pub fn write_off(&self, key: &ProductKey, quantity: Qty) {
        if let Some(mut locs) = self.quants.get_mut(key) {
            drain(&mut locs, quantity);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn moves(&self) -> Vec<StockMove> {
        self.moves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn moves_for(&self, key: &ProductKey, direction: Direction) -> Vec<StockMove> {
        self.moves()
            .into_iter()
            .filter(|m| m.key == *key && m.direction == direction)
            .collect()
    }

    fn check_available(&self) -> Result<(), StockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StockError::Unavailable("in-memory stock switched off".into()));
        }
        Ok(())
    }

    fn record(&self, key: ProductKey, direction: Direction, quantity: Qty) {
        self.moves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(StockMove {
                key,
                direction,
                quantity,
            });
    }
}

/// Take `quantity` from locations in id order, never going below zero.
fn drain(locs: &mut BTreeMap<Ulid, Qty>, mut quantity: Qty) {
    for q in locs.values_mut() {
        if quantity <= Qty::ZERO {
            break;
        }
        let take = (*q).min(quantity);
        *q -= take;
        quantity -= take;
    }
    locs.retain(|_, q| *q > Qty::ZERO);
}

#[async_trait]
impl StockAdapter for InMemoryStock {
    async fn on_hand(&self, key: &ProductKey) -> Result<Qty, StockError> {
        self.check_available()?;
        Ok(self
            .quants
            .get(key)
            .map(|locs| locs.values().copied().sum())
            .unwrap_or(Qty::ZERO))
    }

    async fn move_out(&self, key: &ProductKey, quantity: Qty) -> Result<(), StockError> {
        self.check_available()?;
        // Shard lock held across check and drain.
        let mut locs = self.quants.entry(*key).or_default();
        let on_hand: Qty = locs.values().copied().sum();
        if quantity > on_hand {
            return Err(StockError::InsufficientStock {
                key: *key,
                requested: quantity,
                on_hand,
            });
        }
        drain(&mut locs, quantity);
        drop(locs);
        self.record(*key, Direction::Out, quantity);
        Ok(())
    }

    async fn move_in(&self, key: &ProductKey, quantity: Qty) -> Result<(), StockError> {
        self.check_available()?;
        self.receive(*key, self.home, quantity);
        self.record(*key, Direction::In, quantity);
        Ok(())
    }

    /// The seed is stock before any rental went out, so journaled movements
    /// are applied on top of it. Restored movements are not recorded as moves.
    fn restore(
        &self,
        key: &ProductKey,
        direction: Direction,
        quantity: Qty,
    ) -> Result<(), StockError> {
        match direction {
            Direction::In => self.receive(*key, self.home, quantity),
            Direction::Out => {
                let mut locs = self.quants.entry(*key).or_default();
                let on_hand: Qty = locs.values().copied().sum();
                if quantity > on_hand {
                    return Err(StockError::InsufficientStock {
                        key: *key,
                        requested: quantity,
                        on_hand,
                    });
                }
                drain(&mut locs, quantity);
            }
        }
        Ok(())
    }
}
