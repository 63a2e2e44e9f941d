pub mod applier;
pub mod bootstrap;
pub mod clusteroperator;
pub mod conditions;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod generator;
pub mod informer;
pub mod objects;
pub mod pruner;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod status;
pub mod store;

use std::sync::Arc;

pub use applier::{ApplyConfig, Applier};
pub use clusteroperator::{CLUSTER_OPERATOR_NAME, ClusterOperatorController};
pub use context::{Caches, Clock, Context, RESOURCE_NAME, Stores};
pub use error::{BackoffConfig, Error, Result};
pub use generator::{ClusterContext, Generator};
pub use informer::{Informer, Lister, Notifier, as_notifier};
pub use objects::{ManagedObject, ObjectKey, ObjectKind};
pub use pruner::PrunerController;
pub use registry::{REGISTRY_FINALIZER, RegistryController};
pub use runner::{Controller, ControllerSettings, Reconciler, Supervisor};
pub use store::{
    KubeObjectStore, KubeResourceStore, ObjectStore, ResourceStore, update_status_with_retry,
};

/// The registry, pruner and cluster-operator controllers wired to their caches
pub fn controllers(ctx: &Context, settings: &ControllerSettings) -> Vec<Controller> {
    let caches = &ctx.caches;

    let mut registry_notifiers = vec![
        as_notifier(&caches.registries),
        as_notifier(&caches.infrastructures),
        as_notifier(&caches.deployments),
        as_notifier(&caches.config_maps),
        as_notifier(&caches.secrets),
    ];
    registry_notifiers.extend(caches.extra_registry_notifiers.iter().cloned());

    let pruner_notifiers = vec![
        as_notifier(&caches.pruners),
        as_notifier(&caches.infrastructures),
        as_notifier(&caches.cron_jobs),
    ];

    let operator_notifiers = vec![as_notifier(&caches.registries), as_notifier(&caches.pruners)];

    vec![
        Controller::new(
            Arc::new(RegistryController::new(ctx.clone())),
            registry_notifiers,
            settings.clone(),
        ),
        Controller::new(
            Arc::new(PrunerController::new(ctx.clone())),
            pruner_notifiers,
            settings.clone(),
        ),
        Controller::new(
            Arc::new(ClusterOperatorController::new(ctx.clone())),
            operator_notifiers,
            settings.clone(),
        ),
    ]
    .into_iter()
    .map(|c| c.with_metrics(ctx.metrics.clone()))
    .collect()
}
