//! The sandbox pool control plane.

pub mod alloc_store;
pub mod allocator;
pub mod expectations;
pub mod reconciler;

pub use allocator::{AllocationResult, allocate};
pub use expectations::{RevisionExpectations, ScaleExpectations};
pub use reconciler::{PoolContext, ScalePlan, plan_scale, run};
