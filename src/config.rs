//! Operator configuration from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::controller::error::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "openshift-image-registry";
pub const DEFAULT_REGISTRY_IMAGE: &str = "quay.io/openshift/origin-docker-registry:latest";
pub const DEFAULT_PRUNER_IMAGE: &str = "quay.io/openshift/origin-cli:latest";
pub const DEFAULT_RELEASE_VERSION: &str = "0.0.1-snapshot";

#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace holding every managed object
    pub namespace: String,
    pub registry_image: String,
    pub pruner_image: String,
    /// Version reported on the ClusterOperator
    pub release_version: String,
    pub resync_interval: Duration,
    /// How long a missing trust bundle is tolerated before Degraded
    pub trusted_ca_grace_period: Duration,
    pub finalizer_poll_interval: Duration,
    pub finalizer_max_wait: Option<Duration>,
    pub health_port: u16,
    /// Leader-election holder identity
    pub pod_name: String,
    pub leader_election: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry_image: DEFAULT_REGISTRY_IMAGE.to_string(),
            pruner_image: DEFAULT_PRUNER_IMAGE.to_string(),
            release_version: DEFAULT_RELEASE_VERSION.to_string(),
            resync_interval: Duration::from_secs(600),
            trusted_ca_grace_period: Duration::from_secs(300),
            finalizer_poll_interval: Duration::from_secs(1),
            finalizer_max_wait: None,
            health_port: 8080,
            pod_name: "unknown".to_string(),
            leader_election: true,
        }
    }
}

impl OperatorConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; unset and empty values take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            namespace: get("OPERATOR_NAMESPACE")
                .or_else(|| get("POD_NAMESPACE"))
                .unwrap_or(defaults.namespace),
            registry_image: get("IMAGE").unwrap_or(defaults.registry_image),
            pruner_image: get("IMAGE_PRUNER").unwrap_or(defaults.pruner_image),
            release_version: get("RELEASE_VERSION").unwrap_or(defaults.release_version),
            resync_interval: secs(&get, "RESYNC_INTERVAL_SECS")?.unwrap_or(defaults.resync_interval),
            trusted_ca_grace_period: secs(&get, "TRUSTED_CA_GRACE_PERIOD_SECS")?
                .unwrap_or(defaults.trusted_ca_grace_period),
            finalizer_poll_interval: secs(&get, "FINALIZER_POLL_INTERVAL_SECS")?
                .unwrap_or(defaults.finalizer_poll_interval),
            // zero leaves the deletion wait unbounded
            finalizer_max_wait: secs(&get, "FINALIZER_MAX_WAIT_SECS")?.filter(|d| !d.is_zero()),
            health_port: parse(&get, "HEALTH_PORT")?.unwrap_or(defaults.health_port),
            pod_name: get("POD_NAME").unwrap_or_else(|| {
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or(defaults.pod_name)
            }),
            leader_election: parse(&get, "LEADER_ELECTION")?.unwrap_or(defaults.leader_election),
        })
    }
}

fn parse<T, G>(get: &G, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::InvalidConfig(format!("{}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

fn secs<G>(get: &G, name: &str) -> Result<Option<Duration>>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<u64, G>(get, name)? {
        Some(0) if name != "FINALIZER_MAX_WAIT_SECS" => Err(Error::InvalidConfig(format!(
            "{} must be greater than zero",
            name
        ))),
        other => Ok(other.map(Duration::from_secs)),
    }
}
