//! Desired-object templates and the generators assembling them

pub mod common;
pub mod configmap;
pub mod cronjob;
pub mod deployment;
pub mod pdb;
pub mod pruner;
pub mod rbac;
pub mod registry;
pub mod route;
pub mod secret;
pub mod service;

pub use pruner::PrunerGenerator;
pub use registry::RegistryGenerator;
