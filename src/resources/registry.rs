//! Desired state of the registry component

use std::collections::HashSet;

use crate::controller::error::{Error, Result};
use crate::controller::generator::{ClusterContext, Generator};
use crate::controller::objects::{ManagedObject, ObjectKind};
use crate::crd::ImageRegistry;
use crate::resources::common::{REGISTRY_COMPONENT, component_selector, owner_reference};
use crate::resources::deployment::{REGISTRY_SERVICE_ACCOUNT, dependencies_checksum, registry_deployment};
use crate::resources::{configmap, pdb, rbac, route, secret, service};
use crate::storage::driver_for;

pub const REGISTRY_CLUSTER_ROLE: &str = "system:registry";
pub const REGISTRY_CLUSTER_ROLE_BINDING: &str = "registry-registry-role";

/// Reason reported when two additional routes share a name
pub const DUPLICATE_ROUTE_REASON: &str = "duplicate route name";

/// Reason reported for a negative replica count
pub const INVALID_REPLICAS_REASON: &str = "negative replica count";

const MANAGED_KINDS: &[ObjectKind] = &[
    ObjectKind::ServiceAccount,
    ObjectKind::ClusterRole,
    ObjectKind::ClusterRoleBinding,
    ObjectKind::ConfigMap,
    ObjectKind::Secret,
    ObjectKind::Service,
    ObjectKind::PodDisruptionBudget,
    ObjectKind::Deployment,
    ObjectKind::Route,
];

/// Generates the objects backing the `ImageRegistry`
///
/// Expects storage defaults to have been completed on the resource.
#[derive(Clone, Debug, Default)]
pub struct RegistryGenerator;

impl RegistryGenerator {
    fn validate(registry: &ImageRegistry) -> Result<()> {
        let spec = &registry.spec;
        if spec.replicas < 0 {
            return Err(Error::permanent(
                INVALID_REPLICAS_REASON,
                format!("replicas must not be negative, got {}", spec.replicas),
            ));
        }

        let mut seen = HashSet::new();
        for route in &spec.routes {
            if !seen.insert(route.name.as_str()) {
                return Err(Error::permanent(
                    DUPLICATE_ROUTE_REASON,
                    format!("route name {:?} is used more than once", route.name),
                ));
            }
            if route.name == route::DEFAULT_ROUTE_NAME && spec.default_route {
                return Err(Error::permanent(
                    DUPLICATE_ROUTE_REASON,
                    format!("route name {:?} is reserved for the default route", route.name),
                ));
            }
        }

        if spec.http_secret.is_empty() {
            return Err(Error::InvalidConfig("httpSecret is not set".to_string()));
        }
        Ok(())
    }
}

impl Generator<ImageRegistry> for RegistryGenerator {
    fn generate(&self, registry: &ImageRegistry, ctx: &ClusterContext) -> Result<Vec<ManagedObject>> {
        Self::validate(registry)?;
        let driver = driver_for(&registry.spec.storage)?;

        let owner = owner_reference(registry);
        let ns = ctx.namespace.as_str();
        let component = REGISTRY_COMPONENT;
        let replicas = registry.spec.replicas;

        let trusted_ca = ManagedObject::ConfigMap(configmap::trusted_ca(ns, component, &owner));
        let service_ca = ManagedObject::ConfigMap(configmap::service_ca(ns, component, &owner));
        let private_config = ManagedObject::Secret(secret::private_configuration(
            ns,
            &registry.spec.http_secret,
            component,
            &owner,
        ));
        let checksum = dependencies_checksum(&[&trusted_ca, &service_ca, &private_config])?;

        let mut objects = vec![
            ManagedObject::ServiceAccount(rbac::service_account(
                REGISTRY_SERVICE_ACCOUNT,
                ns,
                component,
                &owner,
            )),
            ManagedObject::ClusterRole(rbac::cluster_role(
                REGISTRY_CLUSTER_ROLE,
                rbac::registry_rules(),
                component,
                &owner,
            )),
            ManagedObject::ClusterRoleBinding(rbac::cluster_role_binding(
                REGISTRY_CLUSTER_ROLE_BINDING,
                REGISTRY_CLUSTER_ROLE,
                REGISTRY_SERVICE_ACCOUNT,
                ns,
                component,
                &owner,
            )),
            trusted_ca,
            service_ca,
            private_config,
            ManagedObject::Service(service::registry_service(ns, component, &owner)),
        ];

        if driver.supports_multiple_replicas() {
            if let Some(pdb) = pdb::registry_pdb(ns, replicas, component, &owner) {
                objects.push(ManagedObject::PodDisruptionBudget(pdb));
            }
        }

        objects.push(ManagedObject::Deployment(registry_deployment(
            registry,
            ctx,
            driver.as_ref(),
            &checksum,
            component,
            &owner,
        )));

        if registry.spec.default_route {
            objects.push(ManagedObject::Route(route::default_route(ns, component, &owner)));
        }
        for extra in &registry.spec.routes {
            objects.push(ManagedObject::Route(route::additional_route(
                extra, ctx, component, &owner,
            )?));
        }

        Ok(objects)
    }

    fn managed_kinds(&self) -> &'static [ObjectKind] {
        MANAGED_KINDS
    }

    fn selector(&self) -> String {
        component_selector(REGISTRY_COMPONENT)
    }
}
