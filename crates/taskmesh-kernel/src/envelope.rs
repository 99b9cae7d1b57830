//! JSON wire envelopes and bus subjects.
//!
//! Every message on the bus is `{"header": {"type": ..., "time": ...},
//! "payload": {...}}`.  The header type discriminates the payload shape;
//! `time` is seconds since the Unix epoch as a float.  Workers and
//! orchestrator agree on these shapes, so they live in the kernel crate
//! both sides depend on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Subject workers register and unregister on.
pub const REGISTER_SUBJECT: &str = "meta.register";

/// Per-task result subject.
pub fn task_result_subject(task_id: u64) -> String {
    format!("TASK_{task_id}_RESULT")
}

/// Recover the task ID from a result subject, if it is one.
pub fn parse_task_result_subject(subject: &str) -> Option<u64> {
    subject
        .strip_prefix("TASK_")?
        .strip_suffix("_RESULT")?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// Header / payload types
// ---------------------------------------------------------------------------

const TYPE_REGISTER: &str = "register";
const TYPE_UNREGISTER: &str = "unregister";
const TYPE_SUBTASK: &str = "subtask";
const TYPE_SUBTASK_RESULT: &str = "subtask-re";
const TYPE_SHUTDOWN: &str = "shutdown";

/// Worker availability as advertised at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Ready to accept a dispatch.
    Idle,
    /// Currently holding a dispatched subtask.
    Busy,
}

/// Payload of a `register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Stable worker identifier.
    pub agent_id: String,
    /// Comma-joined capability tags.
    pub capabilities: String,
    /// Subject the worker listens on for dispatches.
    pub listen_channel: String,
    /// Availability at registration time.
    pub status: WorkerStatus,
}

impl RegisterPayload {
    /// Split the comma-joined capability field into trimmed tags.
    pub fn capability_list(&self) -> Vec<String> {
        self.capabilities
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Payload of an `unregister` message.  Extra fields are ignored so a
/// worker may resend its full registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterPayload {
    /// Worker to remove.
    pub agent_id: String,
}

/// Payload of a `subtask` dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    /// Task the subtask belongs to.
    pub task_id: u64,
    /// Full worker prompt for this stage.
    pub query: String,
    /// Hex-encoded rateless batch of the task's authoritative context,
    /// absent when the task carries no context.
    pub iblt_data: Option<String>,
}

/// A worker result: a single string or a sequence to be newline-joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// One result string.
    Text(String),
    /// Multiple result fragments.
    Lines(Vec<String>),
}

impl ResultValue {
    /// Collapse to the single string form.
    pub fn join(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Lines(lines) => lines.join("\n"),
        }
    }
}

/// Payload of a `subtask-re` result message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Task the result belongs to (the subject already names it; this
    /// field is a cross-check).
    pub task_id: Option<u64>,
    /// Worker that produced the result.
    pub agent_id: Option<String>,
    /// The result itself.
    pub result: ResultValue,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A parsed bus message.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// A worker announced itself (or replaced its record).
    Register(RegisterPayload),
    /// A worker withdrew.
    Unregister(UnregisterPayload),
    /// A subtask dispatch to one worker.
    Subtask(DispatchPayload),
    /// A stage result from a worker.
    SubtaskResult(ResultPayload),
    /// Global teardown signal.
    Shutdown,
}

fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

impl Envelope {
    /// Serialize to wire bytes with a fresh timestamp.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (kind, payload) = match self {
            Self::Register(p) => (TYPE_REGISTER, Some(serde_json::to_value(p))),
            Self::Unregister(p) => (TYPE_UNREGISTER, Some(serde_json::to_value(p))),
            Self::Subtask(p) => (TYPE_SUBTASK, Some(serde_json::to_value(p))),
            Self::SubtaskResult(p) => (TYPE_SUBTASK_RESULT, Some(serde_json::to_value(p))),
            Self::Shutdown => (TYPE_SHUTDOWN, None),
        };
        let mut body = json!({ "header": { "type": kind, "time": now_epoch() } });
        if let Some(payload) = payload {
            body["payload"] = payload.map_err(|e| KernelError::MalformedEnvelope {
                reason: format!("payload serialization failed: {e}"),
            })?;
        }
        serde_json::to_vec(&body).map_err(|e| KernelError::MalformedEnvelope {
            reason: format!("envelope serialization failed: {e}"),
        })
    }

    /// Parse wire bytes into a typed envelope.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| KernelError::MalformedEnvelope {
                reason: format!("not valid JSON: {e}"),
            })?;
        let kind = value["header"]["type"]
            .as_str()
            .ok_or_else(|| KernelError::MalformedEnvelope {
                reason: "missing header.type".into(),
            })?;

        let payload = || {
            value
                .get("payload")
                .cloned()
                .ok_or_else(|| KernelError::MalformedEnvelope {
                    reason: format!("`{kind}` message missing payload"),
                })
        };

        match kind {
            TYPE_REGISTER => Ok(Self::Register(decode_payload(payload()?, TYPE_REGISTER)?)),
            TYPE_UNREGISTER => Ok(Self::Unregister(decode_payload(payload()?, TYPE_UNREGISTER)?)),
            TYPE_SUBTASK => Ok(Self::Subtask(decode_payload(payload()?, TYPE_SUBTASK)?)),
            TYPE_SUBTASK_RESULT => Ok(Self::SubtaskResult(decode_payload(
                payload()?,
                TYPE_SUBTASK_RESULT,
            )?)),
            TYPE_SHUTDOWN => Ok(Self::Shutdown),
            other => Err(KernelError::UnknownMessageType {
                kind: other.to_string(),
            }),
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: Value, what: &str) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| KernelError::MalformedEnvelope {
        reason: format!("bad {what} payload: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
