//! Coding windows and the rateless encoder.
//!
//! A [`CodingWindow`] owns a set of source symbols together with their
//! index schedules and mixes them, in stream order, into the coded
//! symbols that pass through it.  The same structure serves three roles
//! on the decoder side (the receiver's own set, peeled remote symbols,
//! peeled local symbols), differing only in the XOR direction applied.
//!
//! The [`Encoder`] is a window that mixes its symbols into fresh, empty
//! coded symbols -- producing the unbounded stream the codec truncates
//! into a batch.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::mapping::IndexMapping;
use crate::symbol::{HashedSymbol, Symbol, SymbolDigest};

// ---------------------------------------------------------------------------
// CodedSymbol
// ---------------------------------------------------------------------------

/// One entry of the rateless stream: the XOR of the source symbols mixed
/// in so far, the XOR of their digests, and a signed inclusion count.
#[derive(Debug, Clone)]
pub struct CodedSymbol {
    /// XOR of all mixed-in source payloads.
    pub payload: Symbol,
    /// XOR of all mixed-in source digests.
    pub checksum: SymbolDigest,
    /// Signed number of mixed-in sources (+1 per sender-side inclusion,
    /// -1 per receiver-side inclusion).
    pub count: i64,
}

impl CodedSymbol {
    /// A coded symbol with nothing mixed in.
    #[must_use]
    pub fn new() -> Self {
        Self {
            payload: Symbol::empty(),
            checksum: SymbolDigest::ZERO,
            count: 0,
        }
    }

    /// Mix one source symbol in (or out -- XOR is self-inverse; only the
    /// count is signed).
    pub fn apply(&mut self, source: &HashedSymbol, direction: i64) {
        self.payload = self.payload.xor(&source.symbol);
        self.checksum = self.checksum.xor(source.digest);
        self.count += direction;
    }

    /// A singleton holds exactly one source symbol: the count is ±1 and
    /// the payload's own digest equals the accumulated checksum.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        (self.count == 1 || self.count == -1) && self.payload.digest() == self.checksum
    }

    /// Fully reconciled: every mixed-in source cancelled out.
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        self.count == 0 && self.checksum.is_zero()
    }
}

impl Default for CodedSymbol {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CodingWindow
// ---------------------------------------------------------------------------

/// A set of source symbols advancing through the coded-symbol stream.
///
/// A min-heap of `(next_index, source_position)` pairs tracks which
/// sources are due at the current stream index; [`CodingWindow::apply`]
/// mixes all due sources into the passing coded symbol and re-schedules
/// them.
#[derive(Debug, Default)]
pub struct CodingWindow {
    symbols: Vec<HashedSymbol>,
    mappings: Vec<IndexMapping>,
    queue: BinaryHeap<Reverse<(u64, usize)>>,
    next_index: u64,
}

impl CodingWindow {
    /// Create an empty window positioned at stream index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw symbol; its digest and schedule are derived here.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.add_hashed_symbol(HashedSymbol::new(symbol));
    }

    /// Add a pre-hashed symbol with a fresh schedule seeded by its digest.
    pub fn add_hashed_symbol(&mut self, hashed: HashedSymbol) {
        let mapping = IndexMapping::new(hashed.digest.seed());
        self.add_hashed_symbol_with_mapping(hashed, mapping);
    }

    /// Add a pre-hashed symbol with an explicit schedule position.
    ///
    /// The decoder uses this to install peeled symbols whose schedules
    /// have already been advanced past the received stream prefix.
    pub fn add_hashed_symbol_with_mapping(&mut self, hashed: HashedSymbol, mapping: IndexMapping) {
        let position = self.symbols.len();
        self.queue.push(Reverse((mapping.last_index(), position)));
        self.symbols.push(hashed);
        self.mappings.push(mapping);
    }

    /// Mix every source due at the current stream index into `coded`
    /// (with the given sign), advance those sources' schedules, and move
    /// the window to the next stream index.
    pub fn apply(&mut self, mut coded: CodedSymbol, direction: i64) -> CodedSymbol {
        while let Some(&Reverse((due, position))) = self.queue.peek() {
            if due != self.next_index {
                break;
            }
            self.queue.pop();
            coded.apply(&self.symbols[position], direction);
            let next = self.mappings[position].next_index();
            self.queue.push(Reverse((next, position)));
        }
        self.next_index += 1;
        coded
    }

    /// The symbols held by this window.
    pub fn symbols(&self) -> &[HashedSymbol] {
        &self.symbols
    }

    /// Number of symbols held.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the window holds no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Produces the rateless coded-symbol stream for a set of source symbols.
#[derive(Debug, Default)]
pub struct Encoder {
    window: CodingWindow,
}

impl Encoder {
    /// Create an encoder with no sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source symbol to the stream.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.window.add_symbol(symbol);
    }

    /// Produce the next coded symbol in the stream.
    pub fn produce_next(&mut self) -> CodedSymbol {
        self.window.apply(CodedSymbol::new(), 1)
    }

    /// Number of source symbols registered.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether no source symbols are registered.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
