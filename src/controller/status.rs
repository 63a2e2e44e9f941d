//! Status aggregation
//!
//! Pure functions from observations to conditions. Each condition axis is a
//! priority-ordered list of rules, first match wins. Callers pass the
//! previous conditions and the current time; only `ConditionSet` decides
//! transition times.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;

use crate::controller::conditions::{ConditionSet, condition_types};
use crate::controller::error::Error;
use crate::crd::{
    ClusterOperatorStatus, Condition, ConditionStatus, ManagementState, OperandVersion,
    RelatedObject, find_condition,
};

pub const REASON_READY: &str = "Ready";
pub const REASON_REMOVED: &str = "Removed";
pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_TRUSTED_CA_NOT_INJECTED: &str = "TrustedCANotInjected";

/// Rollout state of the registry Deployment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadState {
    pub desired_replicas: i32,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    pub generation: i64,
    pub observed_generation: i64,
    pub deleting: bool,
}

impl WorkloadState {
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let status = deployment.status.clone().unwrap_or_default();
        Self {
            desired_replicas: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
            replicas: status.replicas.unwrap_or(0),
            ready_replicas: status.ready_replicas.unwrap_or(0),
            updated_replicas: status.updated_replicas.unwrap_or(0),
            generation: deployment.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation.unwrap_or(0),
            deleting: deployment.metadata.deletion_timestamp.is_some(),
        }
    }

    /// Every replica runs the latest template and is ready
    pub fn is_rolled_out(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated_replicas == self.desired_replicas
            && self.ready_replicas == self.desired_replicas
            && self.replicas == self.desired_replicas
    }
}

/// Everything the registry aggregator looks at
#[derive(Debug)]
pub struct RegistryObservation<'a> {
    pub management_state: ManagementState,
    /// The registry Deployment as currently stored, if any
    pub workload: Option<WorkloadState>,
    /// First error of this pass's generate/apply/teardown
    pub apply_error: Option<&'a Error>,
    /// Managed objects still present; set when the Removed branch ran
    pub removal_remaining: Option<usize>,
    /// How long the trust bundle has been observed missing
    pub trusted_ca_missing_for: Option<Duration>,
    pub trusted_ca_grace: Duration,
}

fn available(set: &mut ConditionSet, obs: &RegistryObservation<'_>) {
    const T: &str = condition_types::AVAILABLE;
    let permanent = obs.apply_error.filter(|e| e.is_permanent());

    if obs.management_state == ManagementState::Removed {
        if obs.workload.is_none() {
            set.set_true(T, REASON_REMOVED, "The registry is removed");
        } else {
            set.set_false(T, "Removing", "The registry is being removed");
        }
        return;
    }
    if let Some(err) = permanent {
        set.set_false(T, &err.reason(), &err.message());
        return;
    }
    match &obs.workload {
        None => {
            set.set_false(T, "DeploymentNotFound", "The deployment does not exist");
        }
        Some(w) if w.deleting => {
            set.set_false(T, "DeploymentDeleted", "The deployment is being deleted");
        }
        Some(w) if w.is_rolled_out() => {
            set.set_true(T, REASON_READY, "The registry is ready");
        }
        Some(w) if w.ready_replicas > 0 => {
            set.set_true(T, "MinimumAvailability", "The registry has minimum availability");
        }
        Some(_) => {
            set.set_false(T, "NoReplicasAvailable", "The deployment does not have available replicas");
        }
    }
}

fn progressing(set: &mut ConditionSet, obs: &RegistryObservation<'_>) {
    const T: &str = condition_types::PROGRESSING;

    match obs.management_state {
        ManagementState::Unmanaged => {
            set.set_false(T, "Unmanaged", "The registry configuration is set to unmanaged mode");
            return;
        }
        ManagementState::Removed => {
            if obs.workload.is_some() {
                set.set_true(T, "Removing", "The registry is being removed");
            } else {
                set.set_false(T, REASON_REMOVED, "All registry resources are removed");
            }
            return;
        }
        ManagementState::Managed => {}
    }
    if let Some(err) = obs.apply_error {
        if err.is_permanent() {
            set.set_false(T, &err.reason(), &err.message());
        } else {
            set.set_true(T, "Error", &format!("Unable to apply resources: {}", err.message()));
        }
        return;
    }
    match &obs.workload {
        None => {
            set.set_true(T, "WaitingForDeployment", "The deployment does not exist yet");
        }
        Some(w) if !w.is_rolled_out() => {
            set.set_true(T, "DeploymentNotCompleted", "The deployment has not completed");
        }
        Some(_) => {
            set.set_false(T, REASON_READY, "The registry is ready");
        }
    }
}

fn degraded(set: &mut ConditionSet, obs: &RegistryObservation<'_>) {
    const T: &str = condition_types::DEGRADED;

    if let Some(err) = obs.apply_error.filter(|e| e.is_permanent()) {
        set.set_true(T, &err.reason(), &err.message());
        return;
    }
    if obs.management_state == ManagementState::Managed {
        if let Some(missing) = obs.trusted_ca_missing_for {
            if missing > obs.trusted_ca_grace {
                set.set_true(
                    T,
                    REASON_TRUSTED_CA_NOT_INJECTED,
                    &format!(
                        "The trusted CA bundle has not been injected for {}s",
                        missing.as_secs()
                    ),
                );
                return;
            }
        }
    }
    set.set_false(T, REASON_AS_EXPECTED, "");
}

fn removed(set: &mut ConditionSet, obs: &RegistryObservation<'_>) {
    const T: &str = condition_types::REMOVED;

    if obs.management_state != ManagementState::Removed {
        set.set_false(T, &obs.management_state.to_string(), "");
        return;
    }
    match obs.removal_remaining {
        Some(0) if obs.workload.is_none() => {
            set.set_true(T, REASON_REMOVED, "All registry resources are removed");
        }
        Some(0) => {
            set.set_false(
                T,
                "Removing",
                "All registry resources are deleted, waiting for the deployment to be observed as gone",
            );
        }
        Some(n) => {
            set.set_false(T, "Removing", &format!("{} registry resources remain", n));
        }
        None => {
            set.set_false(T, "Removing", "The registry is being removed");
        }
    }
}

/// Available, Progressing, Degraded and Removed for the registry
pub fn registry_conditions(
    previous: &[Condition],
    obs: &RegistryObservation<'_>,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut set = ConditionSet::from_existing(previous.to_vec(), now);
    available(&mut set, obs);
    progressing(&mut set, obs);
    degraded(&mut set, obs);
    removed(&mut set, obs);
    set.build()
}

/// What the pruner aggregator looks at
#[derive(Debug)]
pub struct PrunerObservation<'a> {
    pub suspend: bool,
    pub cronjob: Option<&'a CronJob>,
    pub apply_error: Option<&'a Error>,
}

/// The most recent scheduled run did not complete successfully
///
/// Derived from CronJob status alone: a schedule newer than the last success
/// with no job still running.
pub fn last_job_failed(cronjob: &CronJob) -> bool {
    let Some(status) = &cronjob.status else {
        return false;
    };
    if status.active.as_ref().is_some_and(|a| !a.is_empty()) {
        return false;
    }
    match (&status.last_schedule_time, &status.last_successful_time) {
        (Some(scheduled), Some(succeeded)) => scheduled.0 > succeeded.0,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Available, Scheduled, Failed and Degraded for the pruner
pub fn pruner_conditions(
    previous: &[Condition],
    obs: &PrunerObservation<'_>,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut set = ConditionSet::from_existing(previous.to_vec(), now);

    match obs.cronjob {
        Some(_) => set.set_true(condition_types::AVAILABLE, REASON_AS_EXPECTED, "Pruner CronJob has been created"),
        None => set.set_false(condition_types::AVAILABLE, "CronJobNotFound", "Pruner CronJob does not exist"),
    };

    if obs.suspend {
        set.set_false(condition_types::SCHEDULED, "Suspended", "The pruner job has been suspended");
    } else {
        set.set_true(condition_types::SCHEDULED, "Scheduled", "The pruner job has been scheduled");
    }

    if obs.cronjob.is_some_and(last_job_failed) {
        set.set_true(condition_types::FAILED, "JobFailed", "The most recent pruner job failed");
    } else {
        set.set_false(condition_types::FAILED, "Complete", "");
    }

    match obs.apply_error.filter(|e| e.is_permanent()) {
        Some(err) => set.set_true(condition_types::DEGRADED, &err.reason(), &err.message()),
        None => set.set_false(condition_types::DEGRADED, REASON_AS_EXPECTED, ""),
    };

    set.build()
}

/// Inputs for the ClusterOperator status
#[derive(Debug)]
pub struct OperatorObservation<'a> {
    pub registry: Option<&'a [Condition]>,
    pub pruner: Option<&'a [Condition]>,
    pub namespace: &'a str,
    pub release_version: &'a str,
}

fn copy_condition(set: &mut ConditionSet, source: Option<&Condition>, type_: &str) {
    match source {
        Some(c) => set.set(type_, c.status, &c.reason, &c.message),
        None => set.set(type_, ConditionStatus::Unknown, "NoData", "Waiting for the registry to report status"),
    };
}

/// Fold registry and pruner health into the ClusterOperator status
pub fn operator_status(
    previous: &ClusterOperatorStatus,
    obs: &OperatorObservation<'_>,
    now: DateTime<Utc>,
) -> ClusterOperatorStatus {
    let registry = obs.registry.unwrap_or_default();
    let pruner = obs.pruner.unwrap_or_default();
    let registry_available = find_condition(registry, condition_types::AVAILABLE);

    let mut set = ConditionSet::from_existing(previous.conditions.clone(), now);
    copy_condition(&mut set, registry_available, condition_types::AVAILABLE);
    copy_condition(
        &mut set,
        find_condition(registry, condition_types::PROGRESSING),
        condition_types::PROGRESSING,
    );

    let mut reasons = Vec::new();
    let mut messages = Vec::new();
    let degraded_sources = [
        (registry, condition_types::DEGRADED, "ImageRegistry", "Degraded"),
        (pruner, condition_types::FAILED, "ImagePruner", "JobFailed"),
        (pruner, condition_types::DEGRADED, "ImagePruner", "Degraded"),
    ];
    for (conditions, type_, source, suffix) in degraded_sources {
        if let Some(c) = find_condition(conditions, type_).filter(|c| c.status.is_true()) {
            reasons.push(format!("{}{}", source, suffix));
            messages.push(format!("{}: {}: {}", source, c.reason, c.message));
        }
    }
    if reasons.is_empty() {
        set.set_false(condition_types::DEGRADED, REASON_AS_EXPECTED, "");
    } else {
        set.set_true(condition_types::DEGRADED, &reasons.join("::"), &messages.join("\n"));
    }

    let settled = registry_available
        .is_some_and(|c| c.status.is_true() && (c.reason == REASON_READY || c.reason == REASON_REMOVED));
    let versions = if settled {
        vec![OperandVersion {
            name: "operator".to_string(),
            version: obs.release_version.to_string(),
        }]
    } else {
        previous.versions.clone()
    };

    ClusterOperatorStatus {
        conditions: set.build(),
        versions,
        related_objects: related_objects(obs.namespace),
    }
}

pub fn related_objects(namespace: &str) -> Vec<RelatedObject> {
    vec![
        RelatedObject::new("", "namespaces", None, namespace),
        RelatedObject::new("imageregistry.operator.openshift.io", "configs", None, "cluster"),
        RelatedObject::new("imageregistry.operator.openshift.io", "imagepruners", None, "cluster"),
    ]
}
