mod admission;
mod availability;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::{grid_row, week_columns};
pub use error::EngineError;
pub use ledger::{compact_events, ReservationLedger, SharedProductLedger};
pub use mutations::Trigger;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::stock::{Direction, StockAdapter};
use crate::wal::Wal;

// ── Group-commit journal writer ──────────────────────────

pub(super) enum WalCommand {
    /// One commit unit: the events are journaled together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(WalControl),
}

pub(super) enum WalControl {
    /// Rewrite the journal from its own contents. Runs on the writer task, so no
    /// append can land between the fold and the swap.
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every append already queued and commits
/// them with one fsync; a control command flushes the batch first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            WalCommand::Append { events, response } => (events, response),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };
        let mut batch: Vec<Pending> = vec![(events, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { events, response } => batch.push((events, response)),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events));
    if result.is_ok() {
        result = wal.flush_sync();
    }
    if let Err(e) = &result {
        // Every caller in this batch is told it failed, so none of it may
        // survive to replay.
        warn!("WAL batch of {} units failed: {e}", batch.len());
        if let Err(undo) = wal.discard_unsynced() {
            error!("cannot roll back failed WAL batch: {undo}");
        }
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { response } => {
            let result = wal
                .flush_sync()
                .and_then(|()| Wal::replay(wal.path()))
                .and_then(|replayed| {
                    let events = compact_events(&replayed.events);
                    Wal::write_compact_file(wal.path(), &events)
                })
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Stock movement a journaled event stands for, if any.
fn recorded_move(event: &Event) -> Option<Direction> {
    match event {
        Event::LineStarted { .. } => Some(Direction::Out),
        Event::LineReturned { .. } => Some(Direction::In),
        _ => None,
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct EngineOptions {
    /// Longest wait for a product's admission lock before failing with `Busy`.
    pub admission_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_millis(250),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Engine {
    pub ledger: ReservationLedger,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) stock: Arc<dyn StockAdapter>,
    pub(super) options: EngineOptions,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        stock: Arc<dyn StockAdapter>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        Self::with_options(wal_path, stock, notify, EngineOptions::default())
    }

    /// Replay the journal into a fresh ledger and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn with_options(
        wal_path: PathBuf,
        stock: Arc<dyn StockAdapter>,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let replayed = Wal::replay(&wal_path)?;
        if replayed.discarded_tail {
            warn!("{}: discarded torn journal tail", wal_path.display());
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = ReservationLedger::new();
        // Nobody else can see these ledgers yet, so build them unlocked.
        let mut products: HashMap<ProductKey, ProductLedger> = HashMap::new();
        let mut restored = 0usize;
        for event in &replayed.events {
            let key = event.key();
            let pl = products
                .entry(key)
                .or_insert_with(|| ProductLedger::new(key));
            if let Err(e) = ledger.apply_event(pl, event) {
                warn!("replay: skipping event for line {}: {e}", event.line_id());
                continue;
            }
            // Bring on-hand back in step with the lines that moved stock.
            let (Some(direction), Some(line)) = (recorded_move(event), pl.get(event.line_id()))
            else {
                continue;
            };
            match stock.restore(&key, direction, line.quantity) {
                Ok(()) => restored += 1,
                Err(e) => {
                    error!("replay: line {} cannot restore stock movement: {e}", line.id);
                    metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
                }
            }
        }
        let product_count = products.len();
        for (key, pl) in products {
            ledger.insert_product(key, Arc::new(RwLock::new(pl)));
        }
        info!(
            "replayed {} events into {product_count} products ({restored} stock movements)",
            replayed.events.len()
        );

        Ok(Self {
            ledger,
            wal_tx,
            notify,
            stock,
            options,
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.options.clock.now_ms()
    }

    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_control(&self, control: WalControl) -> Result<(), EngineError> {
        self.wal_tx
            .send(WalCommand::Control(control))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// WAL-append, apply to the locked product, notify.
    pub(super) async fn persist_and_apply(
        &self,
        pl: &mut ProductLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        self.ledger.apply_event(pl, event)?;
        self.notify.send(event);
        Ok(())
    }

    /// Journal `events` as one unit, then apply each to the locked partition
    /// at its index in `guards`. Callers validate every event beforehand, so
    /// nothing is applied unless all of it was journaled.
    pub(super) async fn persist_and_apply_all(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<ProductLedger>],
        events: Vec<(usize, Event)>,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        self.wal_append(events.iter().map(|(_, e)| e.clone()).collect())
            .await?;
        for (idx, event) in &events {
            self.ledger.apply_event(&mut guards[*idx], event)?;
            self.notify.send(event);
        }
        Ok(())
    }

    /// Acquire a product's admission section, or fail with `Busy` after the
    /// configured wait.
    pub(super) async fn lock_product(
        &self,
        key: ProductKey,
    ) -> Result<OwnedRwLockWriteGuard<ProductLedger>, EngineError> {
        let pl = self.ledger.product_or_insert(key);
        let started = Instant::now();
        match tokio::time::timeout(self.options.admission_timeout, pl.write_owned()).await {
            Ok(guard) => {
                metrics::histogram!(observability::ADMISSION_LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                Ok(guard)
            }
            Err(_) => {
                metrics::counter!(observability::BUSY_TOTAL).increment(1);
                warn!("admission lock for {key} not acquired within {:?}", self.options.admission_timeout);
                Err(EngineError::Busy(key))
            }
        }
    }

    pub(super) async fn read_product(
        &self,
        key: ProductKey,
    ) -> Result<Option<OwnedRwLockReadGuard<ProductLedger>>, EngineError> {
        let Some(pl) = self.ledger.get_product(&key) else {
            return Ok(None);
        };
        tokio::time::timeout(self.options.admission_timeout, pl.read_owned())
            .await
            .map(Some)
            .map_err(|_| {
                metrics::counter!(observability::BUSY_TOTAL).increment(1);
                EngineError::Busy(key)
            })
    }

    /// Lookup line → product, acquire the product's write lock.
    pub(super) async fn resolve_line_write(
        &self,
        id: Ulid,
    ) -> Result<(ProductKey, OwnedRwLockWriteGuard<ProductLedger>), EngineError> {
        let key = self
            .ledger
            .key_for_line(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.lock_product(key).await?;
        Ok((key, guard))
    }
}
