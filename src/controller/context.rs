use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};

use crate::config::OperatorConfig;
use crate::controller::applier::ApplyConfig;
use crate::controller::generator::{ClusterContext, RouteCertificate};
use crate::controller::informer::{Lister, Notifier};
use crate::controller::store::{ObjectStore, ResourceStore};
use crate::crd::{ClusterOperator, ImagePruner, ImageRegistry, Infrastructure};
use crate::health::Metrics;

/// Name of every singleton resource the operator reads or owns
pub const RESOURCE_NAME: &str = "cluster";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cached, possibly stale views shared by every controller
#[derive(Clone)]
pub struct Caches {
    pub registries: Arc<dyn Lister<ImageRegistry>>,
    pub pruners: Arc<dyn Lister<ImagePruner>>,
    pub infrastructures: Arc<dyn Lister<Infrastructure>>,
    pub deployments: Arc<dyn Lister<Deployment>>,
    pub config_maps: Arc<dyn Lister<ConfigMap>>,
    pub secrets: Arc<dyn Lister<Secret>>,
    pub cron_jobs: Arc<dyn Lister<CronJob>>,
    /// Watched only to wake the registry controller (services, routes)
    pub extra_registry_notifiers: Vec<Arc<dyn Notifier>>,
}

/// Authoritative read/write boundaries
#[derive(Clone)]
pub struct Stores {
    pub registries: Arc<dyn ResourceStore<ImageRegistry>>,
    pub pruners: Arc<dyn ResourceStore<ImagePruner>>,
    pub cluster_operators: Arc<dyn ResourceStore<ClusterOperator>>,
    pub objects: Arc<dyn ObjectStore>,
}

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    pub caches: Caches,
    pub stores: Stores,
    pub metrics: Arc<Metrics>,
    pub config: OperatorConfig,
    pub apply: ApplyConfig,
    clock: Clock,
}

impl Context {
    pub fn new(caches: Caches, stores: Stores, config: OperatorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            caches,
            stores,
            metrics,
            config,
            apply: ApplyConfig::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Cluster facts from the cached Infrastructure
    pub fn cluster_context(&self) -> ClusterContext {
        let infra = self.caches.infrastructures.get(RESOURCE_NAME);
        ClusterContext::new(
            &self.config.namespace,
            &self.config.registry_image,
            &self.config.pruner_image,
        )
        .with_infrastructure(infra.as_deref())
    }

    /// TLS material for every route secret in the operator namespace
    pub fn route_certificate(&self, secret_name: &str) -> Option<RouteCertificate> {
        let secret = self.caches.secrets.get(secret_name)?;
        let read = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
        };
        Some(RouteCertificate {
            certificate: read("tls.crt"),
            key: read("tls.key"),
            ca_certificate: read("ca.crt"),
        })
    }
}
