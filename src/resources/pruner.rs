//! Desired state of the image pruner

use crate::controller::error::{Error, Result};
use crate::controller::generator::{ClusterContext, Generator};
use crate::controller::objects::{ManagedObject, ObjectKind};
use crate::crd::ImagePruner;
use crate::resources::common::{PRUNER_COMPONENT, component_selector, owner_reference};
use crate::resources::cronjob::{PRUNER_SERVICE_ACCOUNT, pruner_cronjob};
use crate::resources::rbac;

pub const PRUNER_CLUSTER_ROLE: &str = "system:image-pruner";
pub const PRUNER_CLUSTER_ROLE_BINDING: &str = "openshift-image-registry-pruner";

const MANAGED_KINDS: &[ObjectKind] = &[
    ObjectKind::ServiceAccount,
    ObjectKind::ClusterRole,
    ObjectKind::ClusterRoleBinding,
    ObjectKind::CronJob,
];

#[derive(Clone, Debug, Default)]
pub struct PrunerGenerator;

impl PrunerGenerator {
    fn validate(pruner: &ImagePruner) -> Result<()> {
        let spec = &pruner.spec;
        if spec.schedule.split_whitespace().count() != 5 {
            return Err(Error::permanent(
                "InvalidSchedule",
                format!("schedule {:?} is not a five-field cron expression", spec.schedule),
            ));
        }
        if spec.keep_tag_revisions < 0 {
            return Err(Error::permanent(
                "InvalidKeepTagRevisions",
                format!(
                    "keepTagRevisions must not be negative, got {}",
                    spec.keep_tag_revisions
                ),
            ));
        }
        Ok(())
    }
}

impl Generator<ImagePruner> for PrunerGenerator {
    fn generate(&self, pruner: &ImagePruner, ctx: &ClusterContext) -> Result<Vec<ManagedObject>> {
        Self::validate(pruner)?;

        let owner = owner_reference(pruner);
        let ns = ctx.namespace.as_str();
        let component = PRUNER_COMPONENT;

        Ok(vec![
            ManagedObject::ServiceAccount(rbac::service_account(
                PRUNER_SERVICE_ACCOUNT,
                ns,
                component,
                &owner,
            )),
            ManagedObject::ClusterRole(rbac::cluster_role(
                PRUNER_CLUSTER_ROLE,
                rbac::pruner_rules(),
                component,
                &owner,
            )),
            ManagedObject::ClusterRoleBinding(rbac::cluster_role_binding(
                PRUNER_CLUSTER_ROLE_BINDING,
                PRUNER_CLUSTER_ROLE,
                PRUNER_SERVICE_ACCOUNT,
                ns,
                component,
                &owner,
            )),
            ManagedObject::CronJob(pruner_cronjob(
                pruner,
                ns,
                &ctx.pruner_image,
                component,
                &owner,
            )),
        ])
    }

    fn managed_kinds(&self) -> &'static [ObjectKind] {
        MANAGED_KINDS
    }

    fn selector(&self) -> String {
        component_selector(PRUNER_COMPONENT)
    }
}
