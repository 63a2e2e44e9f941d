use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::runtime::watcher;
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use image_registry_operator::controller::{
    Caches, Informer, KubeObjectStore, KubeResourceStore, Lister, Notifier, Stores, controllers,
};
use image_registry_operator::crd::{ClusterOperator, ImagePruner, ImageRegistry, Infrastructure, Route};
use image_registry_operator::health::{HealthState, run_health_server};
use image_registry_operator::resources::common::FIELD_MANAGER;
use image_registry_operator::{Context, ControllerSettings, OperatorConfig, Supervisor};

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lease configuration
const LEASE_NAME: &str = "image-registry-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("image_registry_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting image-registry-operator");

    let config = OperatorConfig::from_env()?;
    let client = Client::try_default().await?;
    info!(namespace = %config.namespace, "Connected to Kubernetes cluster");

    // Probes must answer even while waiting for leadership
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_lock = if config.leader_election {
        let lease_lock = LeaseLock::new(
            client.clone(),
            &config.namespace,
            LeaseLockParams {
                holder_id: config.pod_name.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );
        acquire_leadership(&lease_lock).await;
        Some(lease_lock)
    } else {
        info!("Leader election disabled");
        None
    };

    let mut supervisor = Supervisor::new(SHUTDOWN_GRACE_PERIOD);
    let informer_token = supervisor.token().child_token();
    let ctx = Context::new(
        caches(&client, &config.namespace, &informer_token),
        stores(&client),
        config.clone(),
        health_state.metrics.clone(),
    );
    let settings = ControllerSettings {
        resync_interval: config.resync_interval,
        ..Default::default()
    };
    for controller in controllers(&ctx, &settings) {
        info!(controller = controller.name(), "Starting controller");
        supervisor.spawn_controller(controller);
    }
    health_state.set_ready(true).await;

    let lost_leadership = async {
        match &lease_lock {
            Some(lease_lock) => renew_leadership(lease_lock).await,
            None => std::future::pending::<()>().await,
        }
    };
    let lost = std::cell::Cell::new(false);
    let stop = async {
        tokio::select! {
            _ = shutdown_signal() => info!("Received shutdown signal, initiating graceful shutdown..."),
            _ = lost_leadership => {
                error!("Lost leadership, shutting down");
                lost.set(true);
            }
            result = health_handle => {
                if let Err(e) = result {
                    error!("Health server task panicked: {}", e);
                }
            }
        }
        health_state.set_ready(false).await;
    };

    let result = supervisor.run_until(stop).await;
    informer_token.cancel();
    info!("Operator stopped");
    result?;
    if lost.get() {
        // exit non-zero so the pod restarts and re-enters the election
        return Err("lost leadership".into());
    }
    Ok(())
}

/// Block until this instance holds the lease
async fn acquire_leadership(lease_lock: &LeaseLock) {
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) => {
                if result.acquired_lease {
                    info!("Acquired leadership");
                    return;
                }
                info!("Another instance is leader, waiting...");
            }
            Err(e) => {
                warn!("Failed to acquire lease: {}, retrying...", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}

/// Keep renewing the lease; returns once it is lost or cannot be renewed
async fn renew_leadership(lease_lock: &LeaseLock) {
    loop {
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership!");
                return;
            }
            Err(e) => {
                error!("Failed to renew lease: {}", e);
                return;
            }
        }
    }
}

fn caches(client: &Client, namespace: &str, token: &CancellationToken) -> Caches {
    let cfg = watcher::Config::default().any_semantic();
    let ns = Some(namespace.to_string());

    let services: Arc<dyn Notifier> = Informer::<Service>::spawn(
        Api::namespaced(client.clone(), namespace),
        cfg.clone(),
        ns.clone(),
        token.clone(),
    );
    let routes: Arc<dyn Notifier> = Informer::<Route>::spawn(
        Api::namespaced(client.clone(), namespace),
        cfg.clone(),
        ns.clone(),
        token.clone(),
    );

    Caches {
        registries: cluster_informer::<ImageRegistry>(client, &cfg, token),
        pruners: cluster_informer::<ImagePruner>(client, &cfg, token),
        infrastructures: cluster_informer::<Infrastructure>(client, &cfg, token),
        deployments: Informer::<Deployment>::spawn(
            Api::namespaced(client.clone(), namespace),
            cfg.clone(),
            ns.clone(),
            token.clone(),
        ),
        config_maps: Informer::<ConfigMap>::spawn(
            Api::namespaced(client.clone(), namespace),
            cfg.clone(),
            ns.clone(),
            token.clone(),
        ),
        secrets: Informer::<Secret>::spawn(
            Api::namespaced(client.clone(), namespace),
            cfg.clone(),
            ns.clone(),
            token.clone(),
        ),
        cron_jobs: Informer::<CronJob>::spawn(
            Api::namespaced(client.clone(), namespace),
            cfg,
            ns,
            token.clone(),
        ),
        extra_registry_notifiers: vec![services, routes],
    }
}

fn cluster_informer<K>(
    client: &Client,
    cfg: &watcher::Config,
    token: &CancellationToken,
) -> Arc<dyn Lister<K>>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    Informer::<K>::spawn(Api::all(client.clone()), cfg.clone(), None, token.clone())
}

fn stores(client: &Client) -> Stores {
    Stores {
        registries: Arc::new(KubeResourceStore::<ImageRegistry>::new(client.clone(), FIELD_MANAGER)),
        pruners: Arc::new(KubeResourceStore::<ImagePruner>::new(client.clone(), FIELD_MANAGER)),
        cluster_operators: Arc::new(KubeResourceStore::<ClusterOperator>::new(client.clone(), FIELD_MANAGER)),
        objects: Arc::new(KubeObjectStore::new(client.clone(), FIELD_MANAGER)),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
