//! Source symbols and their digests.
//!
//! A [`Symbol`] is an opaque byte string -- in practice the canonical JSON
//! encoding of one `key → value` pair of a context map.  Symbols support
//! the two operations the sketch needs: byte-wise XOR (with zero-padding
//! of the shorter operand) and a SHA-256 digest.
//!
//! XOR results are trimmed of trailing zero bytes.  Pair symbols are JSON
//! objects and never end in `0x00`, so trimming makes XOR an exact
//! involution (`s ^ t ^ t == s`) even for operands of different lengths,
//! and lets a fully-peeled coded symbol collapse back to the empty
//! payload.

use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// An opaque byte-string source symbol.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Symbol(Vec<u8>);

impl Symbol {
    /// Wrap raw bytes as a symbol.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(data.into())
    }

    /// The empty symbol -- identity element of [`Symbol::xor`].
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this symbol carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte-wise XOR, zero-padding the shorter operand, then trimming
    /// trailing zero bytes from the result.
    #[must_use]
    pub fn xor(&self, other: &Symbol) -> Symbol {
        let long = self.0.len().max(other.0.len());
        let mut out = Vec::with_capacity(long);
        for i in 0..long {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            out.push(a ^ b);
        }
        while out.last() == Some(&0) {
            out.pop();
        }
        Symbol(out)
    }

    /// SHA-256 digest of the symbol bytes.
    #[must_use]
    pub fn digest(&self) -> SymbolDigest {
        let mut hasher = Sha256::new();
        hasher.update(&self.0);
        SymbolDigest(hasher.finalize().into())
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// SymbolDigest
// ---------------------------------------------------------------------------

/// A 256-bit digest that XORs component-wise.
///
/// Coded symbols accumulate the XOR of the digests of every source symbol
/// mixed into them; when exactly one source remains, the accumulator
/// equals that source's digest, which is how the decoder recognises a
/// peelable singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDigest(pub [u8; 32]);

impl SymbolDigest {
    /// The all-zero digest -- identity element of [`SymbolDigest::xor`].
    pub const ZERO: SymbolDigest = SymbolDigest([0u8; 32]);

    /// Component-wise XOR.
    #[must_use]
    pub fn xor(self, other: SymbolDigest) -> SymbolDigest {
        let mut out = [0u8; 32];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.0[i] ^ other.0[i];
        }
        SymbolDigest(out)
    }

    /// Whether every component is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The 64-bit PRNG seed derived from this digest.
    ///
    /// Equals the digest interpreted as a big-endian integer reduced
    /// modulo 2^64, i.e. its last eight bytes.
    #[must_use]
    pub fn seed(&self) -> u64 {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[24..32]);
        u64::from_be_bytes(tail)
    }
}

// ---------------------------------------------------------------------------
// HashedSymbol
// ---------------------------------------------------------------------------

/// A symbol paired with its precomputed digest.
#[derive(Debug, Clone)]
pub struct HashedSymbol {
    /// The raw symbol.
    pub symbol: Symbol,
    /// SHA-256 of the symbol bytes.
    pub digest: SymbolDigest,
}

impl HashedSymbol {
    /// Hash a symbol once, up front.
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        let digest = symbol.digest();
        Self { symbol, digest }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_involution() {
        let a = Symbol::from(r#"{"a": "1"}"#);
        let b = Symbol::from(r#"{"longer-key": "longer-value"}"#);
        assert_eq!(a.xor(&b).xor(&b), a);
        assert_eq!(b.xor(&a).xor(&a), b);
    }

    #[test]
    fn xor_with_empty_is_identity() {
        let a = Symbol::from("payload");
        assert_eq!(a.xor(&Symbol::empty()), a);
        assert_eq!(Symbol::empty().xor(&a), a);
    }

    #[test]
    fn xor_with_self_is_empty() {
        let a = Symbol::from("same bytes");
        assert!(a.xor(&a).is_empty());
    }

    #[test]
    fn digest_xor_cancels() {
        let a = Symbol::from("alpha").digest();
        let b = Symbol::from("beta").digest();
        assert_eq!(a.xor(b).xor(b), a);
        assert!(a.xor(a).is_zero());
    }

    #[test]
    fn digest_is_stable() {
        let a = Symbol::from("stable");
        assert_eq!(a.digest(), a.digest());
        assert_ne!(a.digest(), Symbol::from("other").digest());
    }

    #[test]
    fn seed_uses_digest_tail() {
        let tail: u64 = 0xdead_beef_0bad;
        let d = SymbolDigest({
            let mut raw = [0u8; 32];
            raw[24..32].copy_from_slice(&tail.to_be_bytes());
            raw
        });
        assert_eq!(d.seed(), tail);
    }
}
