//! Stateless request issuers for the two Colab host families: the Colab API
//! host (assignment lifecycle, keep-alive, proxy-token refresh) and the
//! per-runtime proxy host (Jupyter REST: sessions, kernels).

pub mod api_client;
pub mod proxy_client;

use serde::{Deserialize, Serialize};

pub use api_client::{ColabApiClient, ColabApiError};
pub use proxy_client::ProxyClient;

/// The kind of compute a runtime assignment provides. A property of an
/// assignment, not merely a preference — reuse must verify it, never
/// silently hand back the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Variant {
    /// A GPU-backed runtime.
    Gpu,
    /// A TPU-backed runtime.
    Tpu,
    /// The default CPU-only runtime.
    Default,
}

impl Variant {
    /// Infer the variant implied by an accelerator name, e.g. for validating
    /// that a reused assignment's accelerator matches the requested variant.
    pub fn from_accelerator(accelerator: &str) -> Variant {
        match accelerator {
            "TPU" => Variant::Tpu,
            "none" | "" => Variant::Default,
            _ => Variant::Gpu,
        }
    }
}

/// Subscription tier, inferred from `eligibleGpus` in `getCcuInfo()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    /// A free-tier account.
    Free,
    /// A Pro (or better) account.
    Pro,
}

impl Tier {
    /// Maximum concurrent sessions permitted for this tier.
    pub fn max_sessions(self) -> usize {
        match self {
            Tier::Free => 1,
            Tier::Pro => 5,
        }
    }

    /// Infer the tier from the `eligibleGpus` list returned by `getCcuInfo()`.
    pub fn from_eligible_gpus(eligible_gpus: &[String]) -> Tier {
        const PRO_GPUS: &[&str] = &["A100", "L4", "V100"];
        if eligible_gpus
            .iter()
            .any(|gpu| PRO_GPUS.contains(&gpu.as_str()))
        {
            Tier::Pro
        } else {
            Tier::Free
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_pro_tier_from_eligible_gpus() {
        assert_eq!(
            Tier::from_eligible_gpus(&["T4".into(), "A100".into()]),
            Tier::Pro
        );
        assert_eq!(Tier::from_eligible_gpus(&["T4".into()]), Tier::Free);
        assert_eq!(Tier::from_eligible_gpus(&[]), Tier::Free);
    }

    #[test]
    fn infers_variant_from_accelerator() {
        assert_eq!(Variant::from_accelerator("TPU"), Variant::Tpu);
        assert_eq!(Variant::from_accelerator("none"), Variant::Default);
        assert_eq!(Variant::from_accelerator("T4"), Variant::Gpu);
    }
}
