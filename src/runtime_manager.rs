//! Translates a requested runtime variant into an assignment, reusing an
//! existing one when possible and always verifying its variant before
//! handing it back.

use tracing::info;

use crate::colab::api_client::{AssignProbe, ColabApiClient, ProxyCredentials};
use crate::colab::Variant;
use crate::connection::Connection;
use crate::error::Error;

/// A Runtime Assignment plus its current Proxy Credentials and a display
/// label, ready to back a Connection.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Human-facing label, e.g. `"gpu (T4)"`.
    pub label: String,
    /// Accelerator name as reported by Colab.
    pub accelerator: String,
    /// Opaque assignment id.
    pub endpoint: String,
    /// Current short-lived proxy credentials.
    pub proxy: ProxyCredentials,
}

/// Parameters for `assign_runtime`.
#[derive(Debug, Clone)]
pub struct AssignRequest {
    /// The requested compute variant.
    pub variant: Variant,
    /// Skip reuse and always request a brand-new assignment.
    pub force_new: bool,
    /// Specific accelerator class within the variant, if any (e.g. "A100").
    pub accelerator: Option<String>,
}

/// Requests, reuses, and refreshes Colab runtime assignments.
pub struct RuntimeManager {
    api: ColabApiClient,
    notebook_hash: String,
}

impl RuntimeManager {
    /// `notebook_hash` is a client-chosen stable UUID per install; Colab
    /// only uses it as an assignment cache key.
    pub fn new(api: ColabApiClient, notebook_hash: impl Into<String>) -> Self {
        Self {
            api,
            notebook_hash: notebook_hash.into(),
        }
    }

    /// Resolve a runtime for the given request, reusing an existing
    /// assignment when `force_new` is false and one with a matching variant
    /// exists.
    pub async fn assign_runtime(&self, request: &AssignRequest) -> Result<Runtime, Error> {
        if !request.force_new {
            if let Some(runtime) = self.try_reuse(request.variant).await? {
                return Ok(runtime);
            }
        }
        self.assign_new(request).await
    }

    async fn try_reuse(&self, variant: Variant) -> Result<Option<Runtime>, Error> {
        let assignments = self.api.list_assignments().await?;
        if assignments.is_empty() {
            return Ok(None);
        }

        let Some(found) = assignments.iter().find(|a| a.variant == variant) else {
            let available: Vec<String> = assignments.iter().map(|a| a.variant.to_string()).collect();
            return Err(Error::ConnectionFailed(format!(
                "no existing assignment for variant {variant}; available: {}",
                available.join(", ")
            )));
        };

        // Reuse must verify the candidate's variant before returning it: a
        // reused GPU assignment must never masquerade as a TPU.
        if crate::connection::variant_matches(variant, &found.accelerator) {
            info!(endpoint = %found.endpoint, %variant, "reusing existing runtime assignment");
            let proxy = self.api.refresh_connection(&found.endpoint).await?;
            Ok(Some(Runtime {
                label: make_label(variant, &found.accelerator),
                accelerator: found.accelerator.clone(),
                endpoint: found.endpoint.clone(),
                proxy,
            }))
        } else {
            Ok(None)
        }
    }

    async fn assign_new(&self, request: &AssignRequest) -> Result<Runtime, Error> {
        let accelerator = request.accelerator.as_deref();
        let probe = self
            .api
            .probe_assign(&self.notebook_hash, request.variant, accelerator)
            .await?;
        let assignment = match probe {
            AssignProbe::Assigned(assignment) => assignment,
            AssignProbe::NeedsXsrf(xsrf_token) => {
                self.api
                    .finalize_assign(&self.notebook_hash, request.variant, accelerator, &xsrf_token)
                    .await?
            }
        };

        let proxy = self.api.refresh_connection(&assignment.endpoint).await?;
        Ok(Runtime {
            label: make_label(request.variant, &assignment.accelerator),
            accelerator: assignment.accelerator,
            endpoint: assignment.endpoint,
            proxy,
        })
    }

    /// Rebuild a `Runtime` for an endpoint a Session Record already pins,
    /// refreshing its proxy credentials. Used when attaching to (or
    /// reconnecting) a session whose runtime assignment already exists.
    pub async fn runtime_for_endpoint(&self, endpoint: &str) -> Result<Runtime, Error> {
        let assignments = self.api.list_assignments().await?;
        let assignment = assignments
            .into_iter()
            .find(|a| a.endpoint == endpoint)
            .ok_or_else(|| Error::SessionNotFound(format!("runtime {endpoint} is no longer assigned")))?;
        let proxy = self.api.refresh_connection(endpoint).await?;
        Ok(Runtime {
            label: make_label(assignment.variant, &assignment.accelerator),
            accelerator: assignment.accelerator,
            endpoint: assignment.endpoint,
            proxy,
        })
    }

    /// Builds a Connection wired to this Runtime Manager's Colab API
    /// client, initialized and ready to execute.
    pub async fn create_kernel_connection(&self, runtime: &Runtime) -> Result<Connection, Error> {
        let conn = Connection::new(self.api.clone(), &runtime.endpoint, &runtime.proxy, "python3");
        conn.initialize().await?;
        Ok(conn)
    }
}

fn make_label(variant: Variant, accelerator: &str) -> String {
    match variant {
        Variant::Default => "cpu".to_string(),
        _ if accelerator.is_empty() || accelerator == "none" => variant.to_string().to_lowercase(),
        _ => format!("{} ({accelerator})", variant.to_string().to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_includes_accelerator_for_gpu() {
        assert_eq!(make_label(Variant::Gpu, "T4"), "gpu (T4)");
        assert_eq!(make_label(Variant::Tpu, "TPU"), "tpu (TPU)");
        assert_eq!(make_label(Variant::Default, "none"), "cpu");
    }
}
