//! Rental availability engine: booking lines over half-open spans, admitted
//! against pooled on-hand stock under a per-product lock, and moved through
//! a fixed lifecycle that decides which counter reflects them.

pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod stock;
pub mod sweeper;
pub mod wal;
