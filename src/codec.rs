//! The Jupyter kernel wire protocol: message shapes and transport framing.
//!
//! Jupyter messages are six named parts: `header`, `parent_header`,
//! `metadata`, `content`, `buffers[]`, plus a `channel` tag. This is the same
//! shape documented in the [Jupyter messaging spec][spec] and implemented by
//! real clients over ZeroMQ — Colab's WebSocket transport carries the same
//! logical message but frames it as plain JSON rather than ZeroMQ's
//! multipart/binary-offset framing, so the encode/decode functions here are
//! specific to that transport.
//!
//! [spec]: https://jupyter-client.readthedocs.io/en/stable/messaging.html

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum KernelMessageType {
    /// Execute a block of code.
    ExecuteRequest,
    /// Return execution results.
    ExecuteReply,
    /// Request kernel information.
    KernelInfoRequest,
    /// Reply with kernel information.
    KernelInfoReply,
    /// Request to interrupt kernel execution.
    InterruptRequest,
    /// Reply to confirm kernel interruption.
    InterruptReply,
    /// Streams of output (stdout, stderr) from the kernel.
    Stream,
    /// Bring back data to be displayed in frontends.
    DisplayData,
    /// Update display data with new information.
    UpdateDisplayData,
    /// Re-broadcast of code in ExecuteRequest. Echoed, generally ignored.
    ExecuteInput,
    /// Results of a code execution (e.g. the value of the last expression).
    ExecuteResult,
    /// An error occurred during code execution.
    Error,
    /// Updates about kernel status (starting/idle/busy).
    Status,
    /// Another kernel message type that this client doesn't act on.
    ///
    /// The validation layer (§9 "dynamic schema validation") routes unknown
    /// `msg_type` values here instead of failing to deserialize: log and
    /// ignore, never crash.
    #[serde(untagged)]
    Other(String),
}

/// Header of a message, common to every `{header, parent_header, metadata,
/// content, buffers}` tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelHeader {
    /// Fresh UUID per message.
    pub msg_id: String,
    /// Stable UUID for the lifetime of the client.
    pub session: String,
    /// The username sending the message.
    pub username: String,
    /// ISO-8601 UTC timestamp.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,
    /// The message type.
    pub msg_type: KernelMessageType,
    /// Message protocol version, "5.3" for this client.
    pub version: String,
}

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: &str = "5.3";

impl KernelHeader {
    /// Build a fresh header for a new outgoing message in the given session.
    pub fn new(msg_type: KernelMessageType, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: "colabctl".to_string(),
            date: OffsetDateTime::now_utc(),
            msg_type,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A message sent to or received from a Jupyter kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelMessage<T = serde_json::Value> {
    /// The message header.
    pub header: KernelHeader,
    /// The parent message header, if any (set on replies and iopub frames).
    pub parent_header: Option<KernelHeader>,
    /// The message content.
    pub content: T,
}

impl<T> KernelMessage<T> {
    /// Create a message with a fresh header and no parent.
    pub fn new(msg_type: KernelMessageType, session: &str, content: T) -> Self {
        Self {
            header: KernelHeader::new(msg_type, session),
            parent_header: None,
            content,
        }
    }
}

impl<T: Serialize> KernelMessage<T> {
    /// Render this message's content as a generic JSON value.
    pub fn into_json(self) -> KernelMessage {
        KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            content: serde_json::to_value(&self.content).expect("content serializes to JSON"),
        }
    }
}

impl KernelMessage {
    /// Deserialize the (generic JSON) content into a specific type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<KernelMessage<T>, crate::Error> {
        Ok(KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            content: serde_json::from_value(self.content)
                .map_err(|err| crate::Error::DeserializeMessage(err.to_string()))?,
        })
    }
}

/// The content of a reply to a kernel message, with status attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request was processed successfully.
    Ok(T),
    /// The request failed due to an error.
    Error(ErrorReply),
    /// Execution was aborted; no further detail is provided. See
    /// <https://github.com/ipython/ipykernel/issues/367>.
    #[serde(alias = "aborted")]
    Abort,
}

/// Content of an `error` iopub message or an errored `execute_reply`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ErrorReply {
    /// The error name, e.g. `"NameError"`.
    pub ename: String,
    /// The error message, e.g. `"name 'x' is not defined"`.
    pub evalue: String,
    /// Traceback frames, one string per line/frame.
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Content of an `execute_request` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Source code to execute.
    pub code: String,
    /// Run quietly (no broadcast, no history) if true.
    pub silent: bool,
    /// Whether to populate execution history.
    pub store_history: bool,
    /// Expressions to evaluate in the user namespace after execution.
    pub user_expressions: BTreeMap<String, String>,
    /// Whether the kernel may request stdin from the client.
    pub allow_stdin: bool,
    /// Abort queued execute_requests on exception if true.
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// Build the fixed request shape spec.md §4.1 documents.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// Content of a successful `execute_reply`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteReply {
    /// Monotonically increasing execution counter.
    pub execution_count: i64,
}

/// Content of a `kernel_info_request` (always empty).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct KernelInfoRequest {}

/// Content of a `kernel_info_reply`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelInfoReply {
    /// Messaging protocol version implemented by the kernel.
    pub protocol_version: String,
    /// Kernel implementation name, e.g. `"ipython"`.
    pub implementation: String,
    /// Kernel implementation version.
    pub implementation_version: String,
    /// A human-readable banner string.
    #[serde(default)]
    pub banner: String,
}

/// Content of an `interrupt_request` (always empty).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct InterruptRequest {}

/// Content of an `interrupt_reply` (always empty).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct InterruptReply {}

/// Content of a `stream` message (stdout/stderr chunk).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    /// `"stdout"` or `"stderr"`.
    pub name: String,
    /// The text chunk.
    pub text: String,
}

/// Content of a `display_data`/`update_display_data`/`execute_result`
/// message, normalized to the fields this client cares about.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayData {
    /// MIME type → payload.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Associated metadata, often empty.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Content of an `execute_result` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteResult {
    /// The execution count this result corresponds to.
    pub execution_count: i64,
    /// MIME type → payload (always includes `text/plain`).
    pub data: BTreeMap<String, serde_json::Value>,
    /// Associated metadata, often empty.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl From<ExecuteResult> for DisplayData {
    fn from(r: ExecuteResult) -> Self {
        DisplayData {
            data: r.data,
            metadata: r.metadata,
        }
    }
}

/// Content of a `status` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Current kernel execution state.
    pub execution_state: KernelStatus,
}

/// Possible kernel execution states, broadcast on iopub.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Published exactly once, at process startup. On a fresh Colab runtime
    /// this persists indefinitely over REST until a WebSocket attaches.
    Starting,
    /// The kernel is ready to execute code.
    Idle,
    /// The kernel is currently executing code.
    Busy,
}

/// Transport framing used on Colab's WebSocket.
///
/// A frame is either a JSON object with a top-level `channel` field, or a
/// JSON array `[channel, header, parent_header, metadata, content, buffers]`.
/// This client accepts both on receive and always emits the object form on
/// send; no binary buffers are ever sent.
pub mod frame {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use super::{KernelHeader, KernelMessage};

    #[derive(Serialize)]
    struct OutgoingFrame<'a> {
        channel: &'a str,
        header: &'a KernelHeader,
        parent_header: &'a Option<KernelHeader>,
        metadata: serde_json::Map<String, Value>,
        content: &'a Value,
        buffers: &'a [Value],
    }

    /// Serialize a message for the shell or control channel as the object
    /// form of the frame.
    pub fn encode(msg: &KernelMessage, channel: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutgoingFrame {
            channel,
            header: &msg.header,
            parent_header: &msg.parent_header,
            metadata: serde_json::Map::new(),
            content: &msg.content,
            buffers: &[],
        })
    }

    #[derive(Deserialize)]
    struct ObjectFrame {
        channel: String,
        header: KernelHeader,
        #[serde(default)]
        parent_header: Option<KernelHeader>,
        content: Value,
    }

    /// Decode a received WebSocket text frame, accepting either the object
    /// form or the 5/6-element array form.
    pub fn decode(text: &str) -> Option<(KernelMessage, String)> {
        if let Ok(obj) = serde_json::from_str::<ObjectFrame>(text) {
            return Some((
                KernelMessage {
                    header: obj.header,
                    parent_header: obj.parent_header,
                    content: obj.content,
                },
                obj.channel,
            ));
        }

        let arr: Vec<Value> = serde_json::from_str(text).ok()?;
        if arr.len() < 5 {
            return None;
        }
        let channel = arr[0].as_str()?.to_string();
        let header: KernelHeader = serde_json::from_value(arr[1].clone()).ok()?;
        let parent_header: Option<KernelHeader> = if arr[2].is_null() {
            None
        } else {
            serde_json::from_value(arr[2].clone()).ok()
        };
        let content = arr[4].clone();
        Some((
            KernelMessage {
                header,
                parent_header,
                content,
            },
            channel,
        ))
    }
}

/// Strip the anti-XSSI sentinel `)]}'\n` that prefixes some Colab API host
/// JSON bodies, if present.
pub fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(")]}'\n").unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_xssi_prefix_when_present() {
        assert_eq!(strip_xssi_prefix(")]}'\n{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_xssi_prefix("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn frame_roundtrips_object_form() {
        let msg = KernelMessage::new(
            KernelMessageType::ExecuteRequest,
            "sess-1",
            serde_json::to_value(ExecuteRequest::new("1+1")).unwrap(),
        );
        let text = frame::encode(&msg, "shell").unwrap();
        let (decoded, channel) = frame::decode(&text).unwrap();
        assert_eq!(channel, "shell");
        assert_eq!(decoded.header.msg_id, msg.header.msg_id);
        assert_eq!(decoded.content, msg.content);
    }

    #[test]
    fn frame_decodes_array_form() {
        let array = serde_json::json!([
            "iopub",
            {
                "msg_id": "abc",
                "session": "sess-1",
                "username": "kernel",
                "date": "2024-01-01T00:00:00.000000Z",
                "msg_type": "status",
                "version": "5.3",
            },
            null,
            {},
            {"execution_state": "idle"},
            [],
        ]);
        let (msg, channel) = frame::decode(&array.to_string()).unwrap();
        assert_eq!(channel, "iopub");
        assert_eq!(msg.header.msg_id, "abc");
        assert!(msg.parent_header.is_none());
    }
}
