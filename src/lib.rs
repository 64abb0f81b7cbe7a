//! OpenSandbox core
//!
//! Kubernetes-native sandbox pools: a controller that keeps pre-warmed pod
//! pools allocated to batch sandboxes, and the in-pod agent that executes
//! tasks on those pods.

pub mod agent;
pub mod controller;
pub mod resources;
