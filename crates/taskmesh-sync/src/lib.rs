//! Rateless set reconciliation for taskmesh context snapshots.
//!
//! The orchestrator holds an authoritative `key → bytes` context map per
//! task; every worker holds a possibly-stale local copy.  Instead of
//! shipping the whole map with each dispatch, the orchestrator encodes it
//! into a stream of *coded symbols* -- each the XOR of a deterministic
//! subset of source symbols -- and the worker peels the stream against its
//! own copy to recover exactly the `added / removed / updated` delta.
//! Bandwidth is proportional to the size of the symmetric difference, not
//! to the size of either map.
//!
//! The code is rateless: the encoder can keep producing symbols forever
//! and the decoder succeeds as soon as it has seen enough of them.  Both
//! sides derive each source symbol's coded-symbol indices from the same
//! seeded linear-congruential schedule, so no index metadata travels on
//! the wire.
//!
//! # Usage
//!
//! ```rust
//! use taskmesh_sync::{Context, RatelessCodec};
//!
//! let mut authoritative = Context::new();
//! authoritative.insert("doc_1".into(), b"v1".to_vec());
//!
//! let codec = RatelessCodec::new();
//! let batch = codec.encode(&authoritative).unwrap();
//!
//! // A worker with an empty local view recovers the whole snapshot.
//! let delta = codec.decode(&batch, &Context::new()).unwrap();
//! assert_eq!(delta.added.get("doc_1").map(Vec::as_slice), Some(&b"v1"[..]));
//! ```

pub mod codec;
pub mod decoder;
pub mod error;
pub mod mapping;
pub mod symbol;
pub mod window;

pub use codec::{Context, ContextDelta, DEFAULT_SYMBOL_OVERHEAD, RatelessCodec};
pub use decoder::Decoder;
pub use error::{Result, SyncError};
pub use mapping::IndexMapping;
pub use symbol::{HashedSymbol, Symbol, SymbolDigest};
pub use window::{CodedSymbol, CodingWindow, Encoder};
