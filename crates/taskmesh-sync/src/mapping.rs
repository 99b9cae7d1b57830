//! Deterministic coded-symbol index schedule.
//!
//! Every source symbol is assigned a strictly increasing, unbounded
//! sequence of coded-symbol indices, derived from a linear-congruential
//! generator seeded with the symbol's own digest.  Sender and receiver
//! recompute the identical sequence from the symbol alone, so the wire
//! carries no mapping metadata.
//!
//! The sequence starts at index 0 -- every symbol is mixed into the first
//! coded symbol -- and then advances by a pseudo-random step in `[1, 10]`
//! per draw.  The LCG constants are part of the wire protocol; changing
//! either side independently breaks decoding silently.

/// LCG multiplier (glibc `rand` family).
pub const LCG_MULTIPLIER: u64 = 1_103_515_245;

/// LCG increment.
pub const LCG_INCREMENT: u64 = 12_345;

/// Upper bound (inclusive) of the per-draw index step.
pub const MAX_STEP: u64 = 10;

/// Seeded iterator over a source symbol's coded-symbol indices.
#[derive(Debug, Clone)]
pub struct IndexMapping {
    state: u64,
    last_index: u64,
}

impl IndexMapping {
    /// Start a schedule from the given seed at index 0.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed,
            last_index: 0,
        }
    }

    /// Resume a schedule that has already advanced to `last_index`.
    #[must_use]
    pub fn resume(seed_state: u64, last_index: u64) -> Self {
        Self {
            state: seed_state,
            last_index,
        }
    }

    /// The most recently produced index.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Advance the generator and return the next index in the schedule.
    pub fn next_index(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.last_index += 1 + self.state % MAX_STEP;
        self.last_index
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
