//! Peeling decoder for the rateless stream.
//!
//! The decoder holds three coding windows:
//!
//! - `window` -- the receiver's own symbols, applied with sign -1 to every
//!   incoming coded symbol (cancelling everything both sides share),
//! - `remote` -- symbols peeled out of the stream that only the sender
//!   has (sign -1 against later arrivals),
//! - `local` -- symbols peeled out that only the receiver has (sign +1).
//!
//! After cancellation, each stored slot mixes only symbols from the
//! symmetric difference.  A slot whose count is ±1 and whose checksum
//! matches its payload digest is a *singleton*: its payload is one whole
//! difference symbol, which is extracted and then un-mixed from every
//! other slot on its schedule -- often exposing further singletons.  The
//! cascade ends when no peelable slot remains; unpeeled slots simply
//! wait for more coded symbols.

use crate::mapping::IndexMapping;
use crate::symbol::{HashedSymbol, Symbol};
use crate::window::{CodedSymbol, CodingWindow};

use std::collections::VecDeque;

/// Incremental peeling decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    slots: Vec<CodedSymbol>,
    peeled: Vec<bool>,
    peelable: VecDeque<usize>,
    window: CodingWindow,
    remote: CodingWindow,
    local: CodingWindow,
    decoded: usize,
}

impl Decoder {
    /// Create a decoder with no local symbols and an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one of the receiver's own symbols.
    ///
    /// Must be called for the entire local set before the first
    /// [`Decoder::add_coded_symbol`].
    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.window.add_symbol(symbol);
    }

    /// Accept the next coded symbol off the stream.
    pub fn add_coded_symbol(&mut self, coded: CodedSymbol) {
        let coded = self.window.apply(coded, -1);
        let coded = self.remote.apply(coded, -1);
        let coded = self.local.apply(coded, 1);

        let index = self.slots.len();
        if coded.is_singleton() || coded.is_reconciled() {
            self.peelable.push_back(index);
        }
        self.slots.push(coded);
        self.peeled.push(false);
    }

    /// Run the peeling cascade until no peelable slot remains.
    pub fn try_decode(&mut self) {
        while let Some(index) = self.peelable.pop_front() {
            if self.peeled[index] {
                continue;
            }
            let slot = &self.slots[index];
            if slot.is_reconciled() {
                self.peeled[index] = true;
                self.decoded += 1;
                continue;
            }
            if !slot.is_singleton() {
                // Mutated since it was queued; it will be re-queued if it
                // becomes peelable again.
                continue;
            }

            let count = slot.count;
            let hashed = HashedSymbol::new(slot.payload.clone());
            if count == 1 {
                // A symbol only the sender has.
                let mapping = self.unmix(&hashed, -1);
                self.remote.add_hashed_symbol_with_mapping(hashed, mapping);
            } else {
                // A symbol only the receiver has.
                let mapping = self.unmix(&hashed, 1);
                self.local.add_hashed_symbol_with_mapping(hashed, mapping);
            }
            self.peeled[index] = true;
            self.decoded += 1;
        }
    }

    /// Remove a freshly peeled symbol from every received slot on its
    /// schedule, queueing any slot that becomes peelable.  Returns the
    /// symbol's schedule advanced past the received prefix, ready to be
    /// installed in a window for future arrivals.
    fn unmix(&mut self, hashed: &HashedSymbol, direction: i64) -> IndexMapping {
        let mut mapping = IndexMapping::new(hashed.digest.seed());
        while (mapping.last_index() as usize) < self.slots.len() {
            let index = mapping.last_index() as usize;
            let slot = &mut self.slots[index];
            slot.apply(hashed, direction);
            if !self.peeled[index] && (slot.is_singleton() || slot.is_reconciled()) {
                self.peelable.push_back(index);
            }
            mapping.next_index();
        }
        mapping
    }

    /// Whether every received slot has been reconciled or peeled.
    pub fn is_complete(&self) -> bool {
        self.decoded == self.slots.len()
    }

    /// Symbols present only on the sender side.
    pub fn remote_symbols(&self) -> &[HashedSymbol] {
        self.remote.symbols()
    }

    /// Symbols present only on the receiver side.
    pub fn local_symbols(&self) -> &[HashedSymbol] {
        self.local.symbols()
    }

    /// Number of coded symbols received so far.
    pub fn received(&self) -> usize {
        self.slots.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
