//! Context batch codec: pair symbols, wire format, delta extraction.
//!
//! A context is a `key → bytes` map.  Each pair is canonicalised into a
//! one-entry JSON object (sorted keys, byte values mapped through the
//! latin-1 code page so arbitrary bytes survive JSON embedding) and fed
//! to the encoder as one source symbol.  A batch is a JSON array of
//! serialized coded symbols; `⌈overhead · |context|⌉` of them are
//! emitted per encode, 1.5 by default.
//!
//! Decoding peels the batch against a local context and classifies the
//! surviving difference symbols: sender-only keys absent locally are
//! `added`, sender-only keys present locally (with a different value)
//! are `updated`, and receiver-only keys not superseded by an update are
//! `removed`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::decoder::Decoder;
use crate::error::{Result, SyncError};
use crate::symbol::{Symbol, SymbolDigest};
use crate::window::{CodedSymbol, Encoder};

/// A key → bytes context snapshot.
pub type Context = BTreeMap<String, Vec<u8>>;

/// Default ratio of coded symbols to source symbols per batch.
pub const DEFAULT_SYMBOL_OVERHEAD: f64 = 1.5;

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// The reconciliation outcome: how the receiver's context must change to
/// match the sender's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextDelta {
    /// Keys the sender has that the receiver lacks.
    pub added: BTreeMap<String, Vec<u8>>,
    /// Keys the receiver has that the sender lacks.
    pub removed: BTreeSet<String>,
    /// Keys both sides have but with differing values; carries the
    /// sender's value.
    pub updated: BTreeMap<String, Vec<u8>>,
}

impl ContextDelta {
    /// Whether the two contexts were already identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Apply this delta to a local context, bringing it in line with the
    /// sender's view.
    pub fn apply_to(&self, context: &mut Context) {
        for key in &self.removed {
            context.remove(key);
        }
        for (key, value) in self.added.iter().chain(self.updated.iter()) {
            context.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// On-the-wire shape of one coded symbol.
///
/// `symbol` is the payload mapped byte-for-byte through latin-1; `hash`
/// is the 32-byte checksum accumulator in lowercase hex (JSON has no
/// 256-bit integers); `count` is the signed inclusion count.
#[derive(Debug, Serialize, Deserialize)]
struct WireSymbol {
    symbol: String,
    hash: String,
    count: i64,
}

/// Map bytes to a JSON-safe string via the latin-1 code page.
fn latin1_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Invert [`latin1_encode`]; rejects code points above U+00FF.
fn latin1_decode(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(c as u32).map_err(|_| SyncError::NonLatin1 {
                codepoint: c as u32,
            })
        })
        .collect()
}

fn checksum_to_hex(digest: &SymbolDigest) -> String {
    hex::encode(digest.0)
}

fn checksum_from_hex(text: &str) -> Result<SymbolDigest> {
    let bytes = hex::decode(text).map_err(|e| SyncError::MalformedChecksum {
        reason: format!("invalid hex: {e}"),
    })?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| SyncError::MalformedChecksum {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
    Ok(SymbolDigest(raw))
}

// ---------------------------------------------------------------------------
// Pair symbols
// ---------------------------------------------------------------------------

/// Canonical JSON encoding of one `key → value` pair, with the value
/// mapped through latin-1.
fn pair_symbol(key: &str, value: &[u8]) -> Result<Symbol> {
    let mut map = BTreeMap::new();
    map.insert(key, latin1_encode(value));
    Ok(Symbol::new(serde_json::to_vec(&map)?))
}

/// Parse a peeled pair symbol back into its key and value bytes.
fn parse_pair(symbol: &Symbol) -> Result<(String, Vec<u8>)> {
    let map: BTreeMap<String, String> =
        serde_json::from_slice(symbol.as_bytes()).map_err(|e| SyncError::MalformedSymbol {
            reason: format!("pair symbol is not a JSON object: {e}"),
        })?;
    let mut entries = map.into_iter();
    match (entries.next(), entries.next()) {
        (Some((key, value)), None) => Ok((key, latin1_decode(&value)?)),
        _ => Err(SyncError::MalformedSymbol {
            reason: "pair symbol must hold exactly one entry".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Stateless encode/decode front-end for context reconciliation.
#[derive(Debug, Clone)]
pub struct RatelessCodec {
    overhead: f64,
}

impl RatelessCodec {
    /// Codec with the default symbol overhead.
    #[must_use]
    pub fn new() -> Self {
        Self {
            overhead: DEFAULT_SYMBOL_OVERHEAD,
        }
    }

    /// Codec with a custom coded-symbols-per-source ratio.
    #[must_use]
    pub fn with_overhead(overhead: f64) -> Self {
        Self { overhead }
    }

    /// Encode an authoritative context into a serialized batch of
    /// `⌈overhead · |context|⌉` coded symbols.
    pub fn encode(&self, context: &Context) -> Result<Vec<u8>> {
        let count = (context.len() as f64 * self.overhead).ceil() as usize;
        self.encode_with_symbols(context, count)
    }

    /// Encode with an explicit batch size (the stream is rateless, so
    /// any prefix length is valid).
    pub fn encode_with_symbols(&self, context: &Context, count: usize) -> Result<Vec<u8>> {
        let mut encoder = Encoder::new();
        for (key, value) in context {
            encoder.add_symbol(pair_symbol(key, value)?);
        }

        let wire: Vec<WireSymbol> = (0..count)
            .map(|_| {
                let coded = encoder.produce_next();
                WireSymbol {
                    symbol: latin1_encode(coded.payload.as_bytes()),
                    hash: checksum_to_hex(&coded.checksum),
                    count: coded.count,
                }
            })
            .collect();

        tracing::trace!(
            sources = context.len(),
            coded = wire.len(),
            "context encoded"
        );
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode a serialized batch against a local context and extract the
    /// delta that reconciles the local view with the sender's.
    pub fn decode(&self, batch: &[u8], local: &Context) -> Result<ContextDelta> {
        let mut decoder = Decoder::new();
        for (key, value) in local {
            decoder.add_symbol(pair_symbol(key, value)?);
        }

        let wire: Vec<WireSymbol> = serde_json::from_slice(batch)?;
        for ws in wire {
            decoder.add_coded_symbol(CodedSymbol {
                payload: Symbol::new(latin1_decode(&ws.symbol)?),
                checksum: checksum_from_hex(&ws.hash)?,
                count: ws.count,
            });
        }
        decoder.try_decode();

        let mut delta = ContextDelta::default();
        for hashed in decoder.remote_symbols() {
            let (key, value) = parse_pair(&hashed.symbol)?;
            if local.contains_key(&key) {
                delta.updated.insert(key, value);
            } else {
                delta.added.insert(key, value);
            }
        }
        for hashed in decoder.local_symbols() {
            let (key, _) = parse_pair(&hashed.symbol)?;
            // An updated key also surfaces its stale pair on the local
            // side; it is not a removal.
            if !delta.updated.contains_key(&key) {
                delta.removed.insert(key);
            }
        }

        tracing::trace!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            updated = delta.updated.len(),
            complete = decoder.is_complete(),
            "context decoded"
        );
        Ok(delta)
    }
}

impl Default for RatelessCodec {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &[u8])]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn latin1_round_trips_arbitrary_bytes() {
        let bytes: Vec<u8> = (0..=255).collect();
        let text = latin1_encode(&bytes);
        assert_eq!(latin1_decode(&text).unwrap(), bytes);
    }

    #[test]
    fn latin1_rejects_wide_chars() {
        assert!(matches!(
            latin1_decode("snowman ☃"),
            Err(SyncError::NonLatin1 { .. })
        ));
    }

    #[test]
    fn checksum_hex_round_trips() {
        let digest = Symbol::from("anything").digest();
        let hex = checksum_to_hex(&digest);
        assert_eq!(checksum_from_hex(&hex).unwrap(), digest);
    }

    #[test]
    fn checksum_rejects_bad_length() {
        assert!(checksum_from_hex("abcd").is_err());
    }

    #[test]
    fn pair_symbol_round_trips() {
        let symbol = pair_symbol("doc", b"\x00\xffbinary").unwrap();
        let (key, value) = parse_pair(&symbol).unwrap();
        assert_eq!(key, "doc");
        assert_eq!(value, b"\x00\xffbinary");
    }

    #[test]
    fn identical_contexts_yield_empty_delta() {
        let a = ctx(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let codec = RatelessCodec::new();
        let batch = codec.encode(&a).unwrap();
        let delta = codec.decode(&batch, &a).unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn empty_contexts_yield_empty_delta() {
        let codec = RatelessCodec::new();
        let batch = codec.encode(&Context::new()).unwrap();
        let delta = codec.decode(&batch, &Context::new()).unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn batch_size_is_ceil_of_overhead() {
        let a = ctx(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let codec = RatelessCodec::new();
        let batch = codec.encode(&a).unwrap();
        let wire: Vec<WireSymbol> = serde_json::from_slice(&batch).unwrap();
        assert_eq!(wire.len(), 5); // ceil(3 * 1.5)
    }

    #[test]
    fn tiny_delta_is_classified() {
        // A = {a:1, b:2, c:3}, L = {a:1, b:9, d:4} →
        // added = {c}, removed = {d}, updated = {b:2}.
        let a = ctx(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let l = ctx(&[("a", b"1"), ("b", b"9"), ("d", b"4")]);

        let codec = RatelessCodec::new();
        let batch = codec.encode_with_symbols(&a, 10).unwrap();
        let delta = codec.decode(&batch, &l).unwrap();

        assert_eq!(delta.added, ctx(&[("c", b"3")]));
        assert_eq!(delta.updated, ctx(&[("b", b"2")]));
        assert_eq!(
            delta.removed,
            ["d".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn delta_applies_cleanly() {
        let a = ctx(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let mut l = ctx(&[("a", b"1"), ("b", b"9"), ("d", b"4")]);

        let codec = RatelessCodec::new();
        let batch = codec.encode_with_symbols(&a, 10).unwrap();
        let delta = codec.decode(&batch, &l).unwrap();
        delta.apply_to(&mut l);
        assert_eq!(l, a);
    }

    #[test]
    fn bandwidth_tracks_difference_not_size() {
        // A large shared base with a one-key difference decodes from a
        // batch whose peeling only has to recover that one symbol.
        let mut a = Context::new();
        for i in 0..40 {
            a.insert(format!("shared_{i}"), vec![i as u8]);
        }
        let mut l = a.clone();
        a.insert("fresh".into(), b"new".to_vec());

        let codec = RatelessCodec::new();
        let batch = codec.encode(&a).unwrap();
        let delta = codec.decode(&batch, &l).unwrap();
        assert_eq!(delta.added, ctx(&[("fresh", b"new")]));
        assert!(delta.removed.is_empty());
        assert!(delta.updated.is_empty());

        delta.apply_to(&mut l);
        assert_eq!(l, a);
    }

    #[test]
    fn non_utf8_values_survive_the_wire() {
        let a = ctx(&[("blob", &[0u8, 159, 146, 150, 255][..])]);
        let codec = RatelessCodec::new();
        let batch = codec.encode(&a).unwrap();
        // Batch must itself be valid JSON text.
        let _: serde_json::Value = serde_json::from_slice(&batch).unwrap();

        let delta = codec.decode(&batch, &Context::new()).unwrap();
        assert_eq!(delta.added.get("blob").map(Vec::as_slice), Some(&[0u8, 159, 146, 150, 255][..]));
    }
}
