//! Owns one WebSocket to a single kernel and implements the
//! execute_request/execute_reply/iopub cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{
    self, DisplayData, ExecuteReply, ExecuteRequest, KernelHeader, KernelMessage,
    KernelMessageType, KernelStatus,
};
use crate::colab::proxy_client::ProxyClient;
use crate::error::Error;

/// Outcome of one `execute` call.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    /// The reply's status was `ok`.
    Ok,
    /// The reply's status was `error`, or the kernel raised an exception.
    Error,
    /// The execution was interrupted or the connection dropped mid-flight.
    Abort,
}

/// Timing for one execute call, in ISO-8601 with a millisecond duration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Timing {
    /// When the `execute_request` was sent.
    #[serde(with = "time::serde::iso8601")]
    pub started: OffsetDateTime,
    /// When the result was finalized.
    #[serde(with = "time::serde::iso8601")]
    pub completed: OffsetDateTime,
    /// `completed - started` in whole milliseconds.
    pub duration_ms: i64,
}

/// An exception captured from an `error` frame or an `execute_reply` with
/// `status: error`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionError {
    /// Exception class name.
    pub ename: String,
    /// Exception message.
    pub evalue: String,
    /// Formatted traceback lines.
    pub traceback: Vec<String>,
}

/// The structured outcome of one code submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionResult {
    /// Overall outcome.
    pub status: ExecutionStatus,
    /// Captured standard output, truncated at the stream cap.
    pub stdout: String,
    /// Captured standard error, truncated at the stream cap.
    pub stderr: String,
    /// Rich display payloads emitted during this execution, in arrival order.
    pub display_data: Vec<DisplayData>,
    /// The exception, if any.
    pub error: Option<ExecutionError>,
    /// The kernel's execution counter after this call, if known.
    pub execution_count: Option<i64>,
    /// Wall-clock timing for this call.
    pub timing: Timing,
}

/// Per-stream output cap: once hit, further chunks for that stream are
/// dropped and a single truncation marker is appended.
const STREAM_CAP_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated at 1 MiB]";

struct StreamBuffer {
    buf: String,
    truncated: bool,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            buf: String::new(),
            truncated: false,
        }
    }

    fn push(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let remaining = STREAM_CAP_BYTES.saturating_sub(self.buf.len());
        if text.len() <= remaining {
            self.buf.push_str(text);
        } else {
            let mut cut = remaining.min(text.len());
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&text[..cut]);
            self.buf.push_str(TRUNCATION_MARKER);
            self.truncated = true;
        }
    }
}

enum IoEvent {
    Stream { name: String, text: String },
    Display(DisplayData),
    Error(ExecutionError),
    Reply(ExecuteReply, bool),
}

/// How the `drive` loop inside `execute_inner` finished, distinct from a
/// transport-level `Err`: an interrupt always resolves locally with
/// `status = ABORT`, never as a propagated error.
enum DriveOutcome {
    Completed,
    Interrupted,
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Live attachment to one kernel's WebSocket.
pub struct KernelClient {
    kernel_id: String,
    client_session: String,
    write: Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>,
    reader: JoinHandle<()>,
    pending: Arc<DashMap<String, oneshot::Sender<IoEvent>>>,
    io_sinks: Arc<DashMap<String, async_channel::Sender<IoEvent>>>,
    status: watch::Receiver<KernelStatus>,
    in_flight: AtomicBool,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
    proxy: ProxyClient,
}

impl KernelClient {
    /// Opens the WebSocket, sends one `kernel_info_request`, and resolves
    /// when either the reply is received or the first `status: idle`
    /// arrives, whichever comes first.
    pub async fn connect(
        proxy: ProxyClient,
        kernel_id: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let client_session = Uuid::new_v4().to_string();
        let url = proxy.kernel_websocket_url(kernel_id, &client_session);

        let mut request = url
            .into_client_request()
            .map_err(|err| Error::KernelConnect(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "X-Colab-Runtime-Proxy-Token",
            HeaderValue::from_str(proxy.token()).map_err(|err| Error::KernelConnect(err.to_string()))?,
        );
        headers.insert(
            "Origin",
            HeaderValue::from_str(proxy.base_url()).map_err(|err| Error::KernelConnect(err.to_string()))?,
        );
        headers.insert(
            "User-Agent",
            HeaderValue::from_static(crate::colab::api_client::CLIENT_AGENT),
        );

        let (ws, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::KernelConnect("timed out opening kernel websocket".into()))?
            .map_err(|err| classify_handshake_error(&err))?;

        debug!(status = response.status().as_u16(), kernel_id, "kernel websocket open");

        let (write, mut read) = ws.split();
        let pending: Arc<DashMap<String, oneshot::Sender<IoEvent>>> = Arc::new(DashMap::new());
        let io_sinks: Arc<DashMap<String, async_channel::Sender<IoEvent>>> = Arc::new(DashMap::new());
        let (status_tx, status_rx) = watch::channel(KernelStatus::Starting);

        let reader_pending = pending.clone();
        let reader_sinks = io_sinks.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Some((message, _channel)) = codec::frame::decode(&text) else {
                    warn!("dropped unparsable kernel frame");
                    continue;
                };
                dispatch_frame(message, &status_tx, &reader_pending, &reader_sinks);
            }
        });

        let client = KernelClient {
            kernel_id: kernel_id.to_string(),
            client_session,
            write: Mutex::new(write),
            reader,
            pending,
            io_sinks,
            status: status_rx,
            in_flight: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
            proxy,
        };

        // A freshly attached kernel reports `starting` indefinitely over REST
        // on Colab's free tier; it only moves to `idle` once a WebSocket
        // client attaches and observes it. kernel_info completing is not
        // sufficient evidence of readiness on its own, so it is sent best
        // effort and readiness is gated on `status:idle` alone.
        let info_header = KernelHeader::new(KernelMessageType::KernelInfoRequest, &client.client_session);
        let info_message = KernelMessage {
            header: info_header,
            parent_header: None,
            content: serde_json::json!({}),
        };
        if let Err(err) = client.send(&info_message, "shell").await {
            warn!(error = %err, "failed to send kernel_info_request during connect");
        }

        let mut status_wait = client.status.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *status_wait.borrow() == KernelStatus::Idle {
                    return Ok(());
                }
                if status_wait.changed().await.is_err() {
                    return Err(Error::KernelDisconnect);
                }
            }
        })
        .await
        .map_err(|_| Error::KernelConnect("timed out waiting for kernel readiness (status:idle)".into()))??;

        Ok(client)
    }

    /// The server-issued kernel id this client is attached to.
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn send(&self, message: &KernelMessage, channel: &str) -> Result<(), Error> {
        let frame = codec::frame::encode(message, channel)
            .map_err(|err| Error::DeserializeMessage(err.to_string()))?;
        self.write
            .lock()
            .await
            .send(WsMessage::Text(frame))
            .await
            .map_err(|err| Error::KernelConnect(err.to_string()))
    }

    /// Sends a `kernel_info_request` and resolves with its reply.
    pub async fn kernel_info(&self) -> Result<(), Error> {
        let header = KernelHeader::new(KernelMessageType::KernelInfoRequest, &self.client_session);
        let msg_id = header.msg_id.clone();
        let message = KernelMessage {
            header,
            parent_header: None,
            content: serde_json::json!({}),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg_id.clone(), tx);
        self.send(&message, "shell").await?;

        match tokio::time::timeout(Duration::from_secs(60), rx).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::KernelDisconnect),
            Err(_) => {
                self.pending.remove(&msg_id);
                Err(Error::KernelConnect("kernel_info_request timed out".into()))
            }
        }
    }

    /// Submits code for execution. Rejects a second call while one is
    /// already in flight on this kernel.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
        mut on_stream: Option<impl FnMut(&str, &str)>,
    ) -> Result<ExecutionResult, Error> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::ExecutionInProgress);
        }
        let result = self.execute_inner(code, timeout, &mut on_stream).await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_inner(
        &self,
        code: &str,
        timeout: Option<Duration>,
        on_stream: &mut Option<impl FnMut(&str, &str)>,
    ) -> Result<ExecutionResult, Error> {
        let header = KernelHeader::new(KernelMessageType::ExecuteRequest, &self.client_session);
        let msg_id = header.msg_id.clone();
        let content = serde_json::to_value(ExecuteRequest::new(code))
            .map_err(|err| Error::DeserializeMessage(err.to_string()))?;
        let message = KernelMessage {
            header,
            parent_header: None,
            content,
        };

        let (io_tx, io_rx) = async_channel::unbounded();
        self.io_sinks.insert(msg_id.clone(), io_tx);
        self.interrupted.store(false, Ordering::SeqCst);

        let started = OffsetDateTime::now_utc();
        self.send(&message, "shell").await?;

        let mut stdout = StreamBuffer::new();
        let mut stderr = StreamBuffer::new();
        let mut display_data = Vec::new();
        let mut error = None;
        let mut execution_count = None;
        let mut reply_status_ok = true;
        let mut reply_received = false;
        let mut status_rx = self.status.clone();

        let drive = async {
            loop {
                if self.interrupted.load(Ordering::SeqCst) {
                    return Ok(DriveOutcome::Interrupted);
                }
                if reply_received && *status_rx.borrow() == KernelStatus::Idle {
                    return Ok(DriveOutcome::Completed);
                }
                tokio::select! {
                    _ = self.interrupt_notify.notified() => {
                        if self.interrupted.load(Ordering::SeqCst) {
                            return Ok(DriveOutcome::Interrupted);
                        }
                    }
                    event = io_rx.recv() => {
                        match event {
                            Ok(IoEvent::Stream { name, text }) => {
                                if let Some(cb) = on_stream.as_mut() {
                                    cb(&name, &text);
                                }
                                match name.as_str() {
                                    "stderr" => stderr.push(&text),
                                    _ => stdout.push(&text),
                                }
                            }
                            Ok(IoEvent::Display(data)) => display_data.push(data),
                            Ok(IoEvent::Error(err)) => {
                                reply_status_ok = false;
                                error = Some(err);
                            }
                            Ok(IoEvent::Reply(reply, ok)) => {
                                execution_count = Some(reply.execution_count);
                                reply_status_ok = reply_status_ok && ok;
                                reply_received = true;
                            }
                            Err(_) => return Err(Error::KernelDisconnect),
                        }
                    }
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            return Err(Error::KernelDisconnect);
                        }
                    }
                }
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, drive).await.unwrap_or(Err(Error::KernelConnect(
                "execute timed out".into(),
            ))),
            None => drive.await,
        };

        self.io_sinks.remove(&msg_id);

        let completed = OffsetDateTime::now_utc();
        let timing = Timing {
            started,
            completed,
            duration_ms: (completed - started).whole_milliseconds() as i64,
        };

        // A genuine transport failure mid-execute resolves this call with
        // status=ABORT and whatever output was captured, but still
        // surfaces as an error so the Connection can reconnect; a
        // deliberate interrupt resolves the same way without an error.
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::KernelDisconnect) => {
                return Err(Error::ExecutionAborted(Box::new(ExecutionResult {
                    status: ExecutionStatus::Abort,
                    stdout: stdout.buf,
                    stderr: stderr.buf,
                    display_data,
                    error,
                    execution_count,
                    timing,
                })));
            }
            Err(err) => return Err(err),
        };

        let status = match outcome {
            DriveOutcome::Interrupted => ExecutionStatus::Abort,
            DriveOutcome::Completed if reply_status_ok && error.is_none() => ExecutionStatus::Ok,
            DriveOutcome::Completed => ExecutionStatus::Error,
        };

        Ok(ExecutionResult {
            status,
            stdout: stdout.buf,
            stderr: stderr.buf,
            display_data,
            error,
            execution_count,
            timing,
        })
    }

    /// Interrupts the running execution via the REST interrupt endpoint.
    /// Any in-flight `execute` resolves with `status = ABORT`, regardless of
    /// what reply or error frames the kernel sends afterward.
    pub async fn interrupt(&self) -> Result<(), Error> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_notify.notify_one();
        self.proxy
            .interrupt(&self.kernel_id)
            .await
            .map_err(Error::from)
    }

    /// Half-closes the WebSocket and waits briefly for acknowledgment.
    pub async fn close(mut self) -> Result<(), Error> {
        let _ = self.write.get_mut().close().await;
        self.reader.abort();
        Ok(())
    }
}

fn dispatch_frame(
    message: KernelMessage,
    status_tx: &watch::Sender<KernelStatus>,
    pending: &DashMap<String, oneshot::Sender<IoEvent>>,
    io_sinks: &DashMap<String, async_channel::Sender<IoEvent>>,
) {
    let msg_type = message.header.msg_type.clone();
    let parent_id = message
        .parent_header
        .as_ref()
        .map(|header| header.msg_id.clone());

    match msg_type {
        KernelMessageType::Status => {
            if let Ok(status) = serde_json::from_value::<codec::Status>(message.content.clone()) {
                let _ = status_tx.send(status.execution_state);
            }
        }
        KernelMessageType::KernelInfoReply => {
            if let Some(parent) = parent_id {
                if let Some((_, tx)) = pending.remove(&parent) {
                    let _ = tx.send(IoEvent::Reply(
                        ExecuteReply { execution_count: 0 },
                        true,
                    ));
                }
            }
        }
        KernelMessageType::ExecuteReply => {
            let Some(parent) = parent_id else { return };
            let ok = message
                .content
                .get("status")
                .and_then(Value::as_str)
                .map(|status| status == "ok")
                .unwrap_or(false);
            let reply: ExecuteReply = serde_json::from_value(message.content.clone()).unwrap_or(ExecuteReply {
                execution_count: 0,
            });
            if let Some(sink) = io_sinks.get(&parent) {
                let _ = sink.try_send(IoEvent::Reply(reply, ok));
            }
        }
        KernelMessageType::Stream => {
            let Some(parent) = parent_id else { return };
            if let Ok(stream) = serde_json::from_value::<codec::Stream>(message.content.clone()) {
                if let Some(sink) = io_sinks.get(&parent) {
                    let _ = sink.try_send(IoEvent::Stream {
                        name: stream.name,
                        text: stream.text,
                    });
                }
            }
        }
        KernelMessageType::ExecuteResult => {
            let Some(parent) = parent_id else { return };
            if let Ok(result) = serde_json::from_value::<codec::ExecuteResult>(message.content.clone()) {
                if let Some(sink) = io_sinks.get(&parent) {
                    let _ = sink.try_send(IoEvent::Display(result.into()));
                }
            }
        }
        KernelMessageType::DisplayData | KernelMessageType::UpdateDisplayData => {
            let Some(parent) = parent_id else { return };
            if let Ok(data) = serde_json::from_value::<DisplayData>(message.content.clone()) {
                if let Some(sink) = io_sinks.get(&parent) {
                    let _ = sink.try_send(IoEvent::Display(data));
                }
            }
        }
        KernelMessageType::Error => {
            let Some(parent) = parent_id else { return };
            let ename = value_str(&message.content, "ename");
            let evalue = value_str(&message.content, "evalue");
            let traceback = message
                .content
                .get("traceback")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            if let Some(sink) = io_sinks.get(&parent) {
                let _ = sink.try_send(IoEvent::Error(ExecutionError {
                    ename,
                    evalue,
                    traceback,
                }));
            }
        }
        KernelMessageType::ExecuteInput | KernelMessageType::InterruptReply | KernelMessageType::Other(_) => {}
        KernelMessageType::ExecuteRequest
        | KernelMessageType::KernelInfoRequest
        | KernelMessageType::InterruptRequest => {}
    }
}

fn value_str(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn classify_handshake_error(err: &tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => match response.status().as_u16() {
            404 => Error::KernelConnect(
                "kernel endpoint not found — likely wrong kernel id, wrong proxy url, or missing/invalid auth header".into(),
            ),
            401 | 403 => Error::KernelConnect("re-authenticate".into()),
            status => Error::KernelConnect(format!("handshake failed with status {status}")),
        },
        other => Error::KernelConnect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buffer_truncates_at_cap() {
        let mut buf = StreamBuffer::new();
        buf.push(&"a".repeat(STREAM_CAP_BYTES));
        assert_eq!(buf.buf.len(), STREAM_CAP_BYTES);
        assert!(!buf.truncated);

        buf.push("more");
        assert!(buf.truncated);
        assert!(buf.buf.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn stream_buffer_exact_cap_is_not_annotated() {
        let mut buf = StreamBuffer::new();
        buf.push(&"x".repeat(STREAM_CAP_BYTES));
        assert!(!buf.truncated);
        assert_eq!(buf.buf, "x".repeat(STREAM_CAP_BYTES));
    }

    #[test]
    fn stream_buffer_drops_everything_after_truncation() {
        let mut buf = StreamBuffer::new();
        buf.push(&"a".repeat(STREAM_CAP_BYTES));
        buf.push("first overflow");
        let len_after_first = buf.buf.len();
        buf.push("second overflow should be dropped");
        assert_eq!(buf.buf.len(), len_after_first);
    }
}
