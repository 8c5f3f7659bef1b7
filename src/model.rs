use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Unit count. Decimal so that metre- or kilo-denominated stock books exactly.
pub type Qty = Decimal;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Capacity key. On-hand stock is pooled over every internal location of the
/// company, so there is no location component here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductKey {
    pub product: Ulid,
    pub company: Ulid,
}

impl ProductKey {
    pub fn new(product: Ulid, company: Ulid) -> Self {
        Self { product, company }
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product, self.company)
    }
}

// ── Booking line lifecycle ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineState {
    Draft,
    Reserved,
    Ongoing,
    Finished,
    Returned,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineEvent {
    Confirm,
    Cancel,
    Start,
    Elapse,
    Return,
}

/// Which counter reflects a line at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    /// Summed by the reservation ledger.
    Ledger,
    /// Already folded into on-hand quantity by a physical movement.
    OnHand,
    Uncounted,
}

impl LineEvent {
    pub const ALL: [LineEvent; 5] = [
        LineEvent::Confirm,
        LineEvent::Cancel,
        LineEvent::Start,
        LineEvent::Elapse,
        LineEvent::Return,
    ];

    /// The state a successful event lands in.
    pub fn target(self) -> LineState {
        match self {
            LineEvent::Confirm => LineState::Reserved,
            LineEvent::Cancel => LineState::Cancelled,
            LineEvent::Start => LineState::Ongoing,
            LineEvent::Elapse => LineState::Finished,
            LineEvent::Return => LineState::Returned,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LineEvent::Confirm => "confirm",
            LineEvent::Cancel => "cancel",
            LineEvent::Start => "start",
            LineEvent::Elapse => "elapse",
            LineEvent::Return => "return",
        }
    }
}

impl LineState {
    /// The whole transition table. Anything not listed is rejected.
    pub fn allows(self, to: LineState) -> bool {
        use LineState::*;
        matches!(
            (self, to),
            (Draft, Reserved)
                | (Draft | Reserved, Cancelled)
                | (Reserved, Ongoing)
                | (Ongoing, Finished)
                | (Finished, Returned)
        )
    }

    pub fn next(self, event: LineEvent) -> Option<LineState> {
        let to = event.target();
        self.allows(to).then_some(to)
    }

    pub fn accounting(self) -> Accounting {
        match self {
            LineState::Reserved => Accounting::Ledger,
            LineState::Ongoing | LineState::Finished | LineState::Returned => Accounting::OnHand,
            LineState::Draft | LineState::Cancelled => Accounting::Uncounted,
        }
    }

    /// Events that take a fresh draft to this state. Each state has exactly one.
    pub fn path(self) -> &'static [LineEvent] {
        use LineEvent::*;
        match self {
            LineState::Draft => &[],
            LineState::Reserved => &[Confirm],
            LineState::Ongoing => &[Confirm, Start],
            LineState::Finished => &[Confirm, Start, Elapse],
            LineState::Returned => &[Confirm, Start, Elapse, Return],
            LineState::Cancelled => &[Cancel],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LineState::Returned | LineState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LineState::Draft => "draft",
            LineState::Reserved => "reserved",
            LineState::Ongoing => "ongoing",
            LineState::Finished => "finished",
            LineState::Returned => "returned",
            LineState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reservation request for a quantity of a product over a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLine {
    pub id: Ulid,
    pub key: ProductKey,
    /// Booking header this line belongs to, if any.
    pub booking_id: Option<Ulid>,
    pub quantity: Qty,
    pub span: Span,
    pub state: LineState,
}

/// All booking lines of one product/company, the unit of admission locking.
#[derive(Debug, Clone)]
pub struct ProductLedger {
    pub key: ProductKey,
    /// Sorted by `span.start`.
    pub lines: Vec<BookingLine>,
}

impl ProductLedger {
    pub fn new(key: ProductKey) -> Self {
        Self {
            key,
            lines: Vec::new(),
        }
    }

    /// Insert line maintaining sort order by span.start.
    pub fn insert(&mut self, line: BookingLine) {
        let pos = self
            .lines
            .partition_point(|l| l.span.start <= line.span.start);
        self.lines.insert(pos, line);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BookingLine> {
        let pos = self.lines.iter().position(|l| l.id == id)?;
        Some(self.lines.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&BookingLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    /// Move a line to `to`, refusing anything outside the transition table.
    /// Returns the previous state.
    pub fn update_state(&mut self, id: Ulid, to: LineState) -> Result<LineState, EngineError> {
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let from = line.state;
        if !from.allows(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        line.state = to;
        Ok(from)
    }

    /// Lines whose span overlaps the query window, in any state.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingLine> {
        let right_bound = self.lines.partition_point(|l| l.span.start < query.end);
        self.lines[..right_bound]
            .iter()
            .filter(move |l| l.span.end > query.start)
    }

    /// Σ quantity over `reserved` lines overlapping `query`.
    pub fn sum_reserved_overlapping(&self, query: &Span) -> Qty {
        self.overlapping(query)
            .filter(|l| l.state.accounting() == Accounting::Ledger)
            .map(|l| l.quantity)
            .sum()
    }

    pub fn sum_in_state(&self, states: &[LineState]) -> Qty {
        self.lines
            .iter()
            .filter(|l| states.contains(&l.state))
            .map(|l| l.quantity)
            .sum()
    }
}

/// Ledger events, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LineDrafted {
        id: Ulid,
        key: ProductKey,
        booking_id: Option<Ulid>,
        quantity: Qty,
        span: Span,
    },
    LineAmended {
        id: Ulid,
        key: ProductKey,
        quantity: Qty,
        span: Span,
    },
    LineConfirmed {
        id: Ulid,
        key: ProductKey,
    },
    LineCancelled {
        id: Ulid,
        key: ProductKey,
    },
    LineStarted {
        id: Ulid,
        key: ProductKey,
    },
    LineElapsed {
        id: Ulid,
        key: ProductKey,
    },
    LineReturned {
        id: Ulid,
        key: ProductKey,
    },
}

impl Event {
    pub fn key(&self) -> ProductKey {
        match self {
            Event::LineDrafted { key, .. }
            | Event::LineAmended { key, .. }
            | Event::LineConfirmed { key, .. }
            | Event::LineCancelled { key, .. }
            | Event::LineStarted { key, .. }
            | Event::LineElapsed { key, .. }
            | Event::LineReturned { key, .. } => *key,
        }
    }

    pub fn line_id(&self) -> Ulid {
        match self {
            Event::LineDrafted { id, .. }
            | Event::LineAmended { id, .. }
            | Event::LineConfirmed { id, .. }
            | Event::LineCancelled { id, .. }
            | Event::LineStarted { id, .. }
            | Event::LineElapsed { id, .. }
            | Event::LineReturned { id, .. } => *id,
        }
    }

    pub fn for_transition(event: LineEvent, id: Ulid, key: ProductKey) -> Self {
        match event {
            LineEvent::Confirm => Event::LineConfirmed { id, key },
            LineEvent::Cancel => Event::LineCancelled { id, key },
            LineEvent::Start => Event::LineStarted { id, key },
            LineEvent::Elapse => Event::LineElapsed { id, key },
            LineEvent::Return => Event::LineReturned { id, key },
        }
    }

    pub fn transition(&self) -> Option<LineEvent> {
        match self {
            Event::LineConfirmed { .. } => Some(LineEvent::Confirm),
            Event::LineCancelled { .. } => Some(LineEvent::Cancel),
            Event::LineStarted { .. } => Some(LineEvent::Start),
            Event::LineElapsed { .. } => Some(LineEvent::Elapse),
            Event::LineReturned { .. } => Some(LineEvent::Return),
            Event::LineDrafted { .. } | Event::LineAmended { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalStatus {
    Available,
    Reserved,
    Rented,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RentalSummary {
    pub key: ProductKey,
    pub on_hand: Qty,
    /// Units in `reserved` lines, any date.
    pub reserved: Qty,
    /// Units out on rent (`ongoing` + `finished`).
    pub rented: Qty,
    pub status: RentalStatus,
}

impl RentalSummary {
    pub fn new(key: ProductKey, on_hand: Qty, reserved: Qty, rented: Qty) -> Self {
        let status = if rented > Qty::ZERO {
            RentalStatus::Rented
        } else if reserved > Qty::ZERO {
            RentalStatus::Reserved
        } else if on_hand <= Qty::ZERO {
            RentalStatus::Unavailable
        } else {
            RentalStatus::Available
        };
        Self {
            key,
            on_hand,
            reserved,
            rented,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridCell {
    pub booked: Qty,
    /// `on_hand - booked`, not clamped.
    pub available: Qty,
    pub needed: Option<Qty>,
    pub shortage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridRow {
    pub key: ProductKey,
    pub on_hand: Qty,
    pub cells: Vec<GridCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityGrid {
    pub columns: Vec<Span>,
    pub rows: Vec<GridRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ProductKey {
        ProductKey::new(Ulid::new(), Ulid::new())
    }

    fn line(k: ProductKey, start: Ms, end: Ms, qty: i64, state: LineState) -> BookingLine {
        BookingLine {
            id: Ulid::new(),
            key: k,
            booking_id: None,
            quantity: Qty::from(qty),
            span: Span::new(start, end).unwrap(),
            state,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200).unwrap();
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_rejects_empty_and_inverted() {
        assert!(matches!(
            Span::new(200, 200),
            Err(EngineError::InvalidInterval { start: 200, end: 200 })
        ));
        assert!(matches!(
            Span::new(300, 100),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        for (a, b, c) in [(0, 1, 2), (100, 200, 300), (-50, 0, 1)] {
            let left = Span::new(a, b).unwrap();
            let right = Span::new(b, c).unwrap();
            assert!(!left.overlaps(&right));
            assert!(!right.overlaps(&left));
        }
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10).unwrap(),
            Span::new(5, 15).unwrap(),
            Span::new(10, 20).unwrap(),
            Span::new(2, 3).unwrap(),
            Span::new(-5, 100).unwrap(),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn transition_table_is_exact() {
        use LineState::*;
        let legal = [
            (Draft, LineEvent::Confirm, Reserved),
            (Draft, LineEvent::Cancel, Cancelled),
            (Reserved, LineEvent::Cancel, Cancelled),
            (Reserved, LineEvent::Start, Ongoing),
            (Ongoing, LineEvent::Elapse, Finished),
            (Finished, LineEvent::Return, Returned),
        ];
        for from in [Draft, Reserved, Ongoing, Finished, Returned, Cancelled] {
            for event in LineEvent::ALL {
                let expected = legal
                    .iter()
                    .find(|(f, e, _)| *f == from && *e == event)
                    .map(|(_, _, to)| *to);
                assert_eq!(from.next(event), expected, "{from} + {event}");
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for event in LineEvent::ALL {
            assert_eq!(LineState::Returned.next(event), None);
            assert_eq!(LineState::Cancelled.next(event), None);
        }
        assert!(LineState::Returned.is_terminal());
        assert!(!LineState::Finished.is_terminal());
    }

    #[test]
    fn path_walks_draft_to_state() {
        use LineState::*;
        for target in [Draft, Reserved, Ongoing, Finished, Returned, Cancelled] {
            let reached = target
                .path()
                .iter()
                .try_fold(Draft, |s, e| s.next(*e));
            assert_eq!(reached, Some(target));
        }
    }

    #[test]
    fn every_state_has_exactly_one_accounting_bucket() {
        use LineState::*;
        assert_eq!(Reserved.accounting(), Accounting::Ledger);
        for s in [Ongoing, Finished, Returned] {
            assert_eq!(s.accounting(), Accounting::OnHand);
        }
        for s in [Draft, Cancelled] {
            assert_eq!(s.accounting(), Accounting::Uncounted);
        }
    }

    #[test]
    fn ledger_keeps_lines_sorted() {
        let k = key();
        let mut pl = ProductLedger::new(k);
        pl.insert(line(k, 300, 400, 1, LineState::Draft));
        pl.insert(line(k, 100, 200, 1, LineState::Draft));
        pl.insert(line(k, 200, 300, 1, LineState::Draft));
        let starts: Vec<Ms> = pl.lines.iter().map(|l| l.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_adjacent_and_future() {
        let k = key();
        let mut pl = ProductLedger::new(k);
        pl.insert(line(k, 100, 200, 1, LineState::Reserved));
        pl.insert(line(k, 450, 600, 1, LineState::Reserved));
        pl.insert(line(k, 800, 900, 1, LineState::Reserved));
        let query = Span::new(200, 800).unwrap();
        let hits: Vec<_> = pl.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600).unwrap());
    }

    #[test]
    fn sum_counts_only_reserved_lines() {
        let k = key();
        let mut pl = ProductLedger::new(k);
        pl.insert(line(k, 0, 1000, 5, LineState::Reserved));
        pl.insert(line(k, 0, 1000, 7, LineState::Draft));
        pl.insert(line(k, 0, 1000, 11, LineState::Ongoing));
        pl.insert(line(k, 0, 1000, 13, LineState::Finished));
        pl.insert(line(k, 0, 1000, 17, LineState::Cancelled));
        pl.insert(line(k, 500, 1500, 3, LineState::Reserved));
        let q = Span::new(100, 200).unwrap();
        assert_eq!(pl.sum_reserved_overlapping(&q), Qty::from(5));
        let q = Span::new(900, 1200).unwrap();
        assert_eq!(pl.sum_reserved_overlapping(&q), Qty::from(8));
    }

    #[test]
    fn sum_handles_fractional_quantities() {
        let k = key();
        let mut pl = ProductLedger::new(k);
        let mut a = line(k, 0, 10, 1, LineState::Reserved);
        a.quantity = Qty::new(25, 1); // 2.5
        let mut b = line(k, 5, 15, 1, LineState::Reserved);
        b.quantity = Qty::new(125, 2); // 1.25
        pl.insert(a);
        pl.insert(b);
        let q = Span::new(0, 20).unwrap();
        assert_eq!(pl.sum_reserved_overlapping(&q), Qty::new(375, 2));
    }

    #[test]
    fn update_state_rejects_illegal_moves() {
        let k = key();
        let mut pl = ProductLedger::new(k);
        let l = line(k, 0, 10, 1, LineState::Draft);
        let id = l.id;
        pl.insert(l);

        let err = pl.update_state(id, LineState::Ongoing).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: LineState::Draft, to: LineState::Ongoing, .. }
        ));
        assert_eq!(pl.get(id).unwrap().state, LineState::Draft);

        assert_eq!(pl.update_state(id, LineState::Reserved).unwrap(), LineState::Draft);
        assert_eq!(pl.get(id).unwrap().state, LineState::Reserved);
        assert!(matches!(
            pl.update_state(Ulid::new(), LineState::Cancelled),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn summary_status_precedence() {
        let k = key();
        let s = RentalSummary::new(k, Qty::from(5), Qty::from(2), Qty::from(1));
        assert_eq!(s.status, RentalStatus::Rented);
        let s = RentalSummary::new(k, Qty::from(5), Qty::from(2), Qty::ZERO);
        assert_eq!(s.status, RentalStatus::Reserved);
        let s = RentalSummary::new(k, Qty::ZERO, Qty::ZERO, Qty::ZERO);
        assert_eq!(s.status, RentalStatus::Unavailable);
        let s = RentalSummary::new(k, Qty::from(5), Qty::ZERO, Qty::ZERO);
        assert_eq!(s.status, RentalStatus::Available);
    }

    #[test]
    fn event_survives_bincode() {
        // Decimal goes through serde-str so bincode can decode it.
        let event = Event::LineDrafted {
            id: Ulid::new(),
            key: key(),
            booking_id: Some(Ulid::new()),
            quantity: Qty::new(1575, 2),
            span: Span::new(0, 86_400_000).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
