use ulid::Ulid;

use crate::model::{LineState, Ms, ProductKey, Qty};
use crate::stock::StockError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    InvalidQuantity(Qty),
    InvalidTransition {
        id: Ulid,
        from: LineState,
        to: LineState,
    },
    /// Quantity or span edited outside `draft`.
    NotEditable {
        id: Ulid,
        state: LineState,
    },
    /// `start` before the span begins or `elapse` before it ends.
    TooEarly {
        id: Ulid,
        now: Ms,
        at: Ms,
    },
    InsufficientCapacity {
        key: ProductKey,
        requested: Qty,
        available: Qty,
    },
    InsufficientStock {
        key: ProductKey,
        requested: Qty,
        on_hand: Qty,
    },
    StockUnavailable(String),
    /// Per-product admission lock not acquired in time. Retry with backoff.
    Busy(ProductKey),
    /// Internal-consistency fault, e.g. negative availability.
    InvariantViolation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): end must follow start")
            }
            EngineError::InvalidQuantity(q) => {
                write!(f, "invalid quantity {q}: must be strictly positive")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "line {id}: cannot move from {from} to {to}")
            }
            EngineError::NotEditable { id, state } => {
                write!(f, "line {id} is {state}; only draft lines can be edited")
            }
            EngineError::TooEarly { id, now, at } => {
                write!(f, "line {id}: not before {at} (now {now})")
            }
            EngineError::InsufficientCapacity {
                key,
                requested,
                available,
            } => write!(
                f,
                "not enough availability for {key}: requested {requested}, available {available}"
            ),
            EngineError::InsufficientStock {
                key,
                requested,
                on_hand,
            } => write!(
                f,
                "insufficient stock for {key}: requested {requested}, on hand {on_hand}"
            ),
            EngineError::StockUnavailable(e) => write!(f, "stock subsystem unavailable: {e}"),
            EngineError::Busy(key) => write!(f, "busy: admission lock for {key} contended, retry"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StockError> for EngineError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::InsufficientStock {
                key,
                requested,
                on_hand,
            } => EngineError::InsufficientStock {
                key,
                requested,
                on_hand,
            },
            StockError::Unavailable(msg) => EngineError::StockUnavailable(msg),
        }
    }
}
