mod cluster_operator;
mod common;
mod image_pruner;
mod image_registry;
mod infrastructure;
mod route;

pub use cluster_operator::*;
pub use common::*;
pub use image_pruner::*;
pub use image_registry::*;
pub use infrastructure::*;
pub use route::*;
