//! Client for the per-runtime proxy host: the Jupyter REST surface
//! (`/api/sessions`, `/api/kernels`) that a Colab runtime exposes once a
//! runtime assignment has been made and a proxy token issued.

use backon::{ExponentialBuilder, Retryable};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::api_client::ColabApiError;

/// A Jupyter session as returned by `POST /api/sessions` / `GET /api/sessions/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct JupyterSession {
    /// Jupyter session id.
    pub id: String,
    /// The kernel backing this session.
    pub kernel: JupyterKernel,
}

/// A Jupyter kernel as returned by the proxy host's `/api/kernels` family.
#[derive(Debug, Clone, Deserialize)]
pub struct JupyterKernel {
    /// Jupyter kernel id, used to build the WebSocket path.
    pub id: String,
    /// Kernel name, e.g. `"python3"`.
    #[serde(default)]
    pub name: String,
    /// Last reported execution state, if the proxy host includes it.
    #[serde(default)]
    pub execution_state: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    kernel: CreateSessionKernel<'a>,
}

#[derive(Serialize)]
struct CreateSessionKernel<'a> {
    name: &'a str,
}

/// Client for one runtime's proxy host, bound to the short-lived proxy
/// token issued by `ColabApiClient::refresh_connection`.
#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ProxyClient {
    /// Construct a client bound to one runtime's proxy URL and token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        headers.insert("X-Colab-Runtime-Proxy-Token", self.token.parse().unwrap());
        headers.insert(header::USER_AGENT, super::api_client::CLIENT_AGENT.parse().unwrap());
        headers
    }

    fn retriable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// `createSession(kernelName, notebookPath)` — create a new Jupyter
    /// session (and its backing kernel) on the runtime. Retries on
    /// 502/503/504 at 1s, 2s, 4s: the proxy host is briefly unavailable for
    /// a few seconds right after a runtime is first assigned.
    pub async fn create_session(
        &self,
        kernel_name: &str,
        notebook_path: &str,
    ) -> Result<JupyterSession, ColabApiError> {
        let body = CreateSessionRequest {
            path: notebook_path,
            kind: "notebook",
            kernel: CreateSessionKernel { name: kernel_name },
        };

        let attempt = || async {
            let url = format!("{}/api/sessions", self.base_url);
            let resp = self
                .http
                .post(&url)
                .headers(self.headers())
                .json(&body)
                .send()
                .await
                .map_err(|err| ColabApiError::Transport {
                    method: "POST".into(),
                    path: "/api/sessions".into(),
                    status: 0,
                    body: err.to_string(),
                })?;
            let status = resp.status();
            if Self::retriable_status(status) {
                warn!(status = status.as_u16(), "proxy host unavailable, retrying session create");
                return Err(ColabApiError::Transport {
                    method: "POST".into(),
                    path: "/api/sessions".into(),
                    status: status.as_u16(),
                    body: String::new(),
                });
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ColabApiError::Transport {
                    method: "POST".into(),
                    path: "/api/sessions".into(),
                    status: status.as_u16(),
                    body,
                });
            }
            resp.json::<JupyterSession>()
                .await
                .map_err(|err| ColabApiError::Transport {
                    method: "POST".into(),
                    path: "/api/sessions".into(),
                    status: status.as_u16(),
                    body: err.to_string(),
                })
        };

        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(1))
                    .with_factor(2.0)
                    .with_max_times(3),
            )
            .when(|err| matches!(err, ColabApiError::Transport { status, .. } if Self::retriable_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::OK))))
            .await
    }

    /// `getSession(sessionId)` — poll an existing Jupyter session.
    pub async fn get_session(&self, session_id: &str) -> Result<JupyterSession, ColabApiError> {
        self.get_json(&format!("/api/sessions/{session_id}")).await
    }

    /// `getKernel(kernelId)` — poll an existing kernel's state directly.
    pub async fn get_kernel(&self, kernel_id: &str) -> Result<JupyterKernel, ColabApiError> {
        self.get_json(&format!("/api/kernels/{kernel_id}")).await
    }

    /// `listKernels()` — all kernels currently alive on this runtime.
    pub async fn list_kernels(&self) -> Result<Vec<JupyterKernel>, ColabApiError> {
        self.get_json("/api/kernels").await
    }

    /// `deleteKernel(kernelId)` — shut a kernel down.
    pub async fn delete_kernel(&self, kernel_id: &str) -> Result<(), ColabApiError> {
        let url = format!("{}/api/kernels/{kernel_id}", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(|err| ColabApiError::Transport {
                method: "DELETE".into(),
                path: format!("/api/kernels/{kernel_id}"),
                status: 0,
                body: err.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(ColabApiError::Transport {
                method: "DELETE".into(),
                path: format!("/api/kernels/{kernel_id}"),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// `interrupt(kernelId)` — POST the REST interrupt, used as a fallback
    /// to the WebSocket `interrupt_request` message.
    pub async fn interrupt(&self, kernel_id: &str) -> Result<(), ColabApiError> {
        let url = format!("{}/api/kernels/{kernel_id}/interrupt", self.base_url);
        let resp = self
            .http
            .post(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(|err| ColabApiError::Transport {
                method: "POST".into(),
                path: format!("/api/kernels/{kernel_id}/interrupt"),
                status: 0,
                body: err.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ColabApiError::Transport {
                method: "POST".into(),
                path: format!("/api/kernels/{kernel_id}/interrupt"),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ColabApiError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(|err| ColabApiError::Transport {
                method: "GET".into(),
                path: path.into(),
                status: 0,
                body: err.to_string(),
            })?;
        let status = resp.status();
        debug!(method = "GET", path, status = status.as_u16(), "proxy host request");
        if !status.is_success() {
            return Err(ColabApiError::Transport {
                method: "GET".into(),
                path: path.into(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|err| ColabApiError::Transport {
                method: "GET".into(),
                path: path.into(),
                status: status.as_u16(),
                body: err.to_string(),
            })
    }

    /// Build the WebSocket URL for a kernel channel on this runtime.
    pub fn kernel_websocket_url(&self, kernel_id: &str, client_session: &str) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{ws_base}/api/kernels/{kernel_id}/channels?session_id={client_session}&authuser=0&token={}",
            self.token
        )
    }

    /// The proxy token, needed to set the `X-Colab-Runtime-Proxy-Token`
    /// header on REST and WebSocket handshake requests.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The proxy's https base URL, used as the WebSocket handshake `Origin`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_websocket_url_from_https_base() {
        let client = ProxyClient::new("https://runtime.example.com", "tok123");
        assert_eq!(
            client.kernel_websocket_url("kid", "sess-1"),
            "wss://runtime.example.com/api/kernels/kid/channels?session_id=sess-1&authuser=0&token=tok123"
        );
    }

    #[test]
    fn recognizes_retriable_statuses() {
        assert!(ProxyClient::retriable_status(StatusCode::BAD_GATEWAY));
        assert!(ProxyClient::retriable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!ProxyClient::retriable_status(StatusCode::NOT_FOUND));
    }
}
