//! taskmesh kernel primitives.
//!
//! The kernel crate carries the pieces every other taskmesh crate builds
//! on: the consistent-hash [`ring`](crate::ring) used to spread subtasks
//! across capable workers, the [`busy`](crate::busy) set that enforces
//! at-most-one-inflight-per-worker, the subject-based message
//! [`bus`](crate::bus) abstraction with its in-memory implementation,
//! and the JSON wire [`envelope`](crate::envelope)s exchanged with
//! workers.

pub mod bus;
pub mod busy;
pub mod envelope;
pub mod error;
pub mod ring;

pub use bus::{Bus, BusMessage, MemoryBus, Subscription};
pub use busy::BusySet;
pub use envelope::{
    DispatchPayload, Envelope, REGISTER_SUBJECT, RegisterPayload, ResultPayload, ResultValue,
    UnregisterPayload, WorkerStatus, parse_task_result_subject, task_result_subject,
};
pub use error::{KernelError, Result};
pub use ring::HashRing;
