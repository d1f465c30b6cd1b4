//! Composes the Colab API Client and Kernel Client into the connection
//! state machine: session creation, WebSocket readiness, and reconnect with
//! exponential backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::colab::api_client::{ColabApiClient, ProxyCredentials};
use crate::colab::proxy_client::ProxyClient;
use crate::colab::Variant;
use crate::error::Error;
use crate::kernel_client::{ExecutionResult, KernelClient};

/// State of a Connection, mirroring the documented state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConnectionState {
    /// No Jupyter session or kernel client exists.
    Disconnected,
    /// Creating the Jupyter session / opening the WebSocket.
    Connecting,
    /// Kernel reported `status: idle` over the WebSocket.
    Connected,
    /// WebSocket dropped; waiting out backoff before the next attempt.
    Reconnecting,
    /// Reconnect attempts exhausted, or a fatal error occurred.
    Failed,
}

const READY_TIMEOUT_FIRST: Duration = Duration::from_secs(60);
const READY_TIMEOUT_RECONNECT: Duration = Duration::from_secs(30);
const RECONNECT_BASE_MS: u64 = 1000;
const RECONNECT_CAP_MS: u64 = 16_000;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Compute the nth reconnect delay: `min(base * 2^n, cap)`.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let scaled = RECONNECT_BASE_MS.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(scaled.min(RECONNECT_CAP_MS))
}

/// Live attachment to one kernel on one runtime: Jupyter REST session plus
/// WebSocket, with reconnect-with-backoff baked in.
pub struct Connection {
    api: ColabApiClient,
    endpoint: String,
    proxy_url: String,
    proxy_token: Mutex<String>,
    kernel_name: String,
    notebook_path: Mutex<String>,
    state: watch::Sender<ConnectionState>,
    kernel: Mutex<Option<Arc<KernelClient>>>,
    jupyter_session_id: Mutex<Option<String>>,
    reconnect_attempts: AtomicU32,
}

impl Connection {
    /// Construct a Connection bound to one runtime assignment. Does not
    /// open anything until `initialize()` is called.
    pub fn new(
        api: ColabApiClient,
        endpoint: impl Into<String>,
        proxy: &ProxyCredentials,
        kernel_name: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            api,
            endpoint: endpoint.into(),
            proxy_url: proxy.url.clone(),
            proxy_token: Mutex::new(proxy.token.clone()),
            kernel_name: kernel_name.into(),
            notebook_path: Mutex::new(default_notebook_path()),
            state,
            kernel: Mutex::new(None),
            jupyter_session_id: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    /// DISCONNECTED → CONNECTING → CONNECTED. Creates (or verifies) the
    /// Jupyter session, opens the WebSocket, and waits for `status:idle`.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.set_state(ConnectionState::Connecting);
        match self.connect_once(READY_TIMEOUT_FIRST).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                Err(err)
            }
        }
    }

    async fn connect_once(&self, ready_timeout: Duration) -> Result<(), Error> {
        let token = self.proxy_token.lock().await.clone();
        let proxy = ProxyClient::new(&self.proxy_url, &token);

        let notebook_path = self.notebook_path.lock().await.clone();
        let mut session = proxy
            .create_session(&self.kernel_name, &notebook_path)
            .await?;

        // Readiness protocol is Colab-specific: a cached Jupyter session may
        // reference a kernel id that no longer exists on the runtime. Verify
        // it and fall back to a fresh session under a unique notebook path
        // rather than attaching to a dead kernel id.
        if proxy.get_kernel(&session.kernel.id).await.is_err() {
            warn!(kernel_id = %session.kernel.id, "cached kernel id is gone, creating a fresh session");
            let fresh_path = default_notebook_path();
            session = proxy.create_session(&self.kernel_name, &fresh_path).await?;
            *self.notebook_path.lock().await = fresh_path;
        }

        *self.jupyter_session_id.lock().await = Some(session.id.clone());

        let client = KernelClient::connect(proxy, &session.kernel.id, ready_timeout).await?;
        *self.kernel.lock().await = Some(Arc::new(client));
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Executes code on the attached kernel, awaiting CONNECTED state first.
    pub async fn execute_code(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, Error> {
        self.require_connected()?;
        let kernel = self.kernel_handle().await?;
        kernel.execute(code, timeout, None::<fn(&str, &str)>).await
    }

    /// Interrupts the in-flight execution on the attached kernel.
    pub async fn interrupt(&self) -> Result<(), Error> {
        let kernel = self.kernel_handle().await?;
        kernel.interrupt().await
    }

    /// The server-issued kernel id, available only in CONNECTED or
    /// RECONNECTING states.
    pub async fn kernel_id(&self) -> Option<String> {
        self.kernel
            .lock()
            .await
            .as_ref()
            .map(|k| k.kernel_id().to_string())
    }

    /// The current Jupyter session id, if a session has been created.
    pub async fn jupyter_session(&self) -> Option<String> {
        self.jupyter_session_id.lock().await.clone()
    }

    /// Handles a WebSocket drop: transitions to RECONNECTING and drives the
    /// reconnect loop with exponential backoff, refreshing proxy
    /// credentials before each attempt.
    pub async fn handle_disconnect(&self) -> Result<(), Error> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Reconnecting);
        *self.kernel.lock().await = None;

        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= MAX_RECONNECT_ATTEMPTS {
                self.set_state(ConnectionState::Failed);
                return Err(Error::ConnectionFailed(
                    "reconnect attempts exhausted; try --new-runtime".into(),
                ));
            }

            let delay = reconnect_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;

            match self.refresh_and_reconnect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    continue;
                }
            }
        }
    }

    async fn refresh_and_reconnect(&self) -> Result<(), Error> {
        let fresh = self.api.refresh_connection(&self.endpoint).await?;
        *self.proxy_token.lock().await = fresh.token;
        self.connect_once(READY_TIMEOUT_RECONNECT).await
    }

    /// Closes the WebSocket and transitions to DISCONNECTED. Optionally
    /// deletes the kernel on the runtime.
    pub async fn shutdown(&self, delete_kernel: bool) -> Result<(), Error> {
        if let Some(kernel) = self.kernel.lock().await.take() {
            if delete_kernel {
                let token = self.proxy_token.lock().await.clone();
                let proxy = ProxyClient::new(&self.proxy_url, &token);
                let _ = proxy.delete_kernel(kernel.kernel_id()).await;
            }
            if let Ok(owned) = Arc::try_unwrap(kernel) {
                let _ = owned.close().await;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn require_connected(&self) -> Result<(), Error> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Reconnecting => Ok(()),
            other => Err(Error::ConnectionFailed(format!(
                "connection is {other} expected CONNECTED"
            ))),
        }
    }

    async fn kernel_handle(&self) -> Result<Arc<KernelClient>, Error> {
        self.kernel
            .lock()
            .await
            .clone()
            .ok_or(Error::KernelDisconnect)
    }
}

fn default_notebook_path() -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    format!("/content/lecoder-{timestamp}.ipynb")
}

/// Accelerator→Variant check used when verifying a reused assignment before
/// handing it back, per the Runtime Manager's reuse-must-verify rule.
pub fn variant_matches(requested: Variant, accelerator: &str) -> bool {
    Variant::from_accelerator(accelerator) == requested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(1), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(3), Duration::from_millis(8000));
        assert_eq!(reconnect_delay(4), Duration::from_millis(16000));
        assert_eq!(reconnect_delay(5), Duration::from_millis(16000));
        assert_eq!(reconnect_delay(20), Duration::from_millis(16000));
    }

    #[test]
    fn variant_matches_checks_accelerator() {
        assert!(variant_matches(Variant::Gpu, "T4"));
        assert!(!variant_matches(Variant::Tpu, "T4"));
        assert!(variant_matches(Variant::Default, "none"));
    }

    #[test]
    fn notebook_path_has_expected_shape() {
        let path = default_notebook_path();
        assert!(path.starts_with("/content/lecoder-"));
        assert!(path.ends_with(".ipynb"));
    }
}
