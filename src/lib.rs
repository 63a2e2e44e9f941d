pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod storage;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Controller, ControllerSettings, Error, REGISTRY_FINALIZER, Result,
    Supervisor,
};
pub use crd::{ClusterOperator, ImagePruner, ImageRegistry};
pub use health::{HealthState, Metrics};
