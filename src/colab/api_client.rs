//! Client for the Colab API host: assignment lifecycle, keep-alive, and
//! proxy-token refresh. Authenticated with the user's OAuth access token.

use std::time::{Duration, Instant};

use base64::Engine;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::Variant;
use crate::codec::strip_xssi_prefix;

pub(crate) const CLIENT_AGENT: &str = concat!("colabctl/", env!("CARGO_PKG_VERSION"));

/// Structured errors from the Colab API host, carrying enough detail for the
/// Error Handler (§4.8) and CLI to report something actionable.
#[derive(Debug, thiserror::Error)]
pub enum ColabApiError {
    /// Transport-level failure: bad status code with whatever body text the
    /// server returned (if readable).
    #[error("{method} {path} returned {status}: {body}")]
    Transport {
        /// HTTP method of the originating request.
        method: String,
        /// Request path (without host) that failed.
        path: String,
        /// HTTP status code returned.
        status: u16,
        /// Response body text, if the response was readable.
        body: String,
    },

    /// HTTP 412: too many concurrent assignments already exist.
    #[error("too many concurrent runtime assignments")]
    TooManyAssignments,

    /// `QUOTA_DENIED_REQUESTED_VARIANTS` or `QUOTA_EXCEEDED_USAGE_TIME`.
    #[error("insufficient quota: {reason}")]
    InsufficientQuota {
        /// The raw reason code from Colab.
        reason: String,
    },

    /// The account or project is denylisted from this variant/accelerator.
    #[error("denylisted from requesting this runtime")]
    Denylisted,
}

/// Result of the `getCcuInfo()` RPC, used to infer subscription tier.
#[derive(Debug, Clone, Deserialize)]
pub struct CcuInfo {
    /// GPU accelerator names the account is eligible to request.
    #[serde(default, rename = "eligibleGpus")]
    pub eligible_gpus: Vec<String>,
    /// Number of runtime assignments currently held.
    #[serde(default, rename = "assignmentsCount")]
    pub assignments_count: u32,
}

/// A Colab-allocated compute instance the user is entitled to use.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeAssignment {
    /// Opaque runtime identifier.
    pub endpoint: String,
    /// Accelerator name, e.g. `"T4"`, `"A100"`, `"TPU"`, `"none"`.
    pub accelerator: String,
    /// The variant this assignment actually is.
    #[serde(default = "Variant_default")]
    pub variant: Variant,
}

#[allow(non_snake_case)]
fn Variant_default() -> Variant {
    Variant::Default
}

/// Short-lived per-runtime connection info.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyCredentials {
    /// HTTPS base URL of the proxy host.
    pub url: String,
    /// Short-lived bearer-ish token for the proxy host.
    pub token: String,
    /// Seconds until `token` expires, from the moment it was issued.
    pub token_expires_in_seconds: u64,
    /// Local timestamp at which this struct was constructed, used to compute
    /// whether the token is still fresh before a reconnect.
    #[serde(skip, default = "Instant::now")]
    pub(crate) issued_at: Instant,
}

impl ProxyCredentials {
    /// Whether this credential is still valid for at least `margin` longer.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.issued_at.elapsed() + margin < Duration::from_secs(self.token_expires_in_seconds)
    }
}

/// GET `/tun/m/assign` can return either a ready assignment, or an XSRF
/// token that must be echoed back in a finalizing POST.
pub enum AssignProbe {
    /// An assignment already exists and is returned directly.
    Assigned(RuntimeAssignment),
    /// No assignment yet; POST this token back to create one.
    NeedsXsrf(String),
}

/// Stateless HTTP client for the Colab API host.
#[derive(Clone)]
pub struct ColabApiClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl ColabApiClient {
    /// Construct a client bound to one access token. Tokens are assumed
    /// externally managed (see the crate's `auth` module); this client never
    /// refreshes the OAuth token itself.
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    fn headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", self.access_token).parse().unwrap(),
        );
        headers.insert("X-Colab-Tunnel", "Google".parse().unwrap());
        headers.insert(header::USER_AGENT, CLIENT_AGENT.parse().unwrap());
        headers
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ColabApiError> {
        let url = format!("{}{path}", self.base_url);
        let started = Instant::now();
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
        debug!(method = "GET", path, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "colab api request");
        self.check_status("GET", path, status, &resp)?;
        let body = resp.text().await.unwrap_or_default();
        serde_json::from_str(strip_xssi_prefix(&body)).map_err(|err| ColabApiError::Transport {
            method: "GET".into(),
            path: path.into(),
            status: status.as_u16(),
            body: err.to_string(),
        })
    }

    fn check_status(
        &self,
        method: &str,
        path: &str,
        status: StatusCode,
        _resp: &reqwest::Response,
    ) -> Result<(), ColabApiError> {
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(ColabApiError::TooManyAssignments);
        }
        if !status.is_success() {
            return Err(ColabApiError::Transport {
                method: method.into(),
                path: path.into(),
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }

    /// `getCcuInfo()` — used to infer subscription tier.
    pub async fn get_ccu_info(&self) -> Result<CcuInfo, ColabApiError> {
        self.get_json("/tun/m/ccu-info?authuser=0").await
    }

    /// GET half of `assign()`: probe for an existing assignment or an XSRF
    /// token to finalize one.
    pub async fn probe_assign(
        &self,
        notebook_hash: &str,
        variant: Variant,
        accelerator: Option<&str>,
    ) -> Result<AssignProbe, ColabApiError> {
        let nbh = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(notebook_hash);
        let mut path = format!("/tun/m/assign?nbh={nbh}&variant={variant}&authuser=0");
        if let Some(accel) = accelerator {
            path.push_str(&format!("&accelerator={accel}"));
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Probe {
            Assignment(RuntimeAssignment),
            Xsrf {
                #[serde(rename = "xsrfToken")]
                xsrf_token: String,
            },
        }

        match self.get_json::<Probe>(&path).await? {
            Probe::Assignment(a) => Ok(AssignProbe::Assigned(a)),
            Probe::Xsrf { xsrf_token } => Ok(AssignProbe::NeedsXsrf(xsrf_token)),
        }
    }

    /// POST half of `assign()`: finalize an assignment using the XSRF token
    /// from `probe_assign`.
    pub async fn finalize_assign(
        &self,
        notebook_hash: &str,
        variant: Variant,
        accelerator: Option<&str>,
        xsrf_token: &str,
    ) -> Result<RuntimeAssignment, ColabApiError> {
        let nbh = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(notebook_hash);
        let mut path = format!("/tun/m/assign?nbh={nbh}&variant={variant}&authuser=0");
        if let Some(accel) = accelerator {
            path.push_str(&format!("&accelerator={accel}"));
        }
        let url = format!("{}{path}", self.base_url);

        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(self.headers())
            .header("X-Colab-Xsrf-Token", xsrf_token)
            .send()
            .await
            .map_err(|err| ColabApiError::Transport {
                method: "POST".into(),
                path: path.clone(),
                status: 0,
                body: err.to_string(),
            })?;
        let status = resp.status();
        debug!(method = "POST", path, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "colab api request");

        if status == StatusCode::PRECONDITION_FAILED {
            return Err(ColabApiError::TooManyAssignments);
        }
        let body = resp.text().await.unwrap_or_default();
        let body = strip_xssi_prefix(&body);

        if body.contains("QUOTA_DENIED_REQUESTED_VARIANTS") || body.contains("QUOTA_EXCEEDED_USAGE_TIME") {
            return Err(ColabApiError::InsufficientQuota {
                reason: extract_reason(body),
            });
        }
        if body.contains("DENYLISTED") {
            return Err(ColabApiError::Denylisted);
        }
        if !status.is_success() {
            return Err(ColabApiError::Transport {
                method: "POST".into(),
                path,
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        serde_json::from_str(body).map_err(|err| ColabApiError::Transport {
            method: "POST".into(),
            path,
            status: status.as_u16(),
            body: err.to_string(),
        })
    }

    /// `listAssignments()` — current assignments across all variants.
    pub async fn list_assignments(&self) -> Result<Vec<RuntimeAssignment>, ColabApiError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            assignments: Vec<RuntimeAssignment>,
        }
        Ok(self
            .get_json::<Response>("/tun/m/assignments?authuser=0")
            .await?
            .assignments)
    }

    /// `refreshConnection(endpoint)` — fresh proxy credentials for reuse or
    /// reconnection. Must be called before every reconnect attempt.
    pub async fn refresh_connection(
        &self,
        endpoint: &str,
    ) -> Result<ProxyCredentials, ColabApiError> {
        #[derive(Deserialize)]
        struct Raw {
            url: String,
            token: String,
            #[serde(rename = "tokenExpiresInSeconds")]
            token_expires_in_seconds: u64,
        }
        let path = format!("/tun/m/runtime-proxy-token?endpoint={endpoint}&port=8080&authuser=0");
        let raw: Raw = self.get_json(&path).await?;
        Ok(ProxyCredentials {
            url: raw.url,
            token: raw.token,
            token_expires_in_seconds: raw.token_expires_in_seconds,
            issued_at: Instant::now(),
        })
    }

    /// `sendKeepAlive(endpoint)` — idempotent poke to prevent idle eviction.
    pub async fn send_keep_alive(&self, endpoint: &str) -> Result<(), ColabApiError> {
        let path = format!("/tun/m/{endpoint}/keep-alive/?authuser=0");
        let _: serde_json::Value = self
            .get_json(&path)
            .await
            .or_else(|err| match err {
                // Some deployments return an empty 200 body for keep-alive.
                ColabApiError::Transport { status, .. } if (200..300).contains(&status) => {
                    Ok(serde_json::Value::Null)
                }
                other => Err(other),
            })?;
        Ok(())
    }
}

fn extract_reason(body: &str) -> String {
    for needle in ["QUOTA_DENIED_REQUESTED_VARIANTS", "QUOTA_EXCEEDED_USAGE_TIME"] {
        if body.contains(needle) {
            return needle.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_quota_reason_from_body() {
        assert_eq!(
            extract_reason("{\"reason\":\"QUOTA_EXCEEDED_USAGE_TIME\"}"),
            "QUOTA_EXCEEDED_USAGE_TIME"
        );
        assert_eq!(extract_reason("{}"), "unknown");
    }

    #[test]
    fn proxy_credentials_freshness() {
        let creds = ProxyCredentials {
            url: "https://x".into(),
            token: "tok".into(),
            token_expires_in_seconds: 3600,
            issued_at: Instant::now(),
        };
        assert!(creds.is_fresh(Duration::from_secs(60)));

        let stale = ProxyCredentials {
            url: "https://x".into(),
            token: "tok".into(),
            token_expires_in_seconds: 0,
            issued_at: Instant::now(),
        };
        assert!(!stale.is_fresh(Duration::from_secs(1)));
    }
}
