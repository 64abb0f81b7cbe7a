//! Persistence of the pool allocation map.
//!
//! The map lives in two pool annotations: the serialized `PoolAllocation`
//! and a strictly increasing generation counter. Writes are merge-patches
//! carrying the pool's resourceVersion so a concurrent writer loses with a
//! conflict instead of clobbering the map.

use crate::controller::expectations::RevisionExpectations;
use crate::resources::{
    POOL_ALLOC_GENERATION_ANNOTATION, POOL_ALLOC_STATUS_ANNOTATION, PoolAllocation, SandboxPool,
};
use anyhow::{Context, Result};
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Read-modify-patch access to the allocation annotations of one pool.
pub struct AllocationStore<'a> {
    pools: &'a Api<SandboxPool>,
    revisions: &'a RevisionExpectations,
}

impl<'a> AllocationStore<'a> {
    pub fn new(pools: &'a Api<SandboxPool>, revisions: &'a RevisionExpectations) -> Self {
        Self { pools, revisions }
    }

    /// Load the prior allocation and its generation from the pool object.
    pub fn load(&self, pool: &SandboxPool) -> Result<(PoolAllocation, u64)> {
        PoolAllocation::from_pool(pool)
    }

    /// Persist a new allocation map at `generation + 1`.
    ///
    /// The patch pins the pool's current resourceVersion; a stale pool loses
    /// with a conflict and the reconciler retries after re-reading. On
    /// success the returned resourceVersion is registered as a revision
    /// expectation so the next reconcile refuses to write until it has
    /// observed this object back.
    pub async fn persist(
        &self,
        key: &str,
        pool: &SandboxPool,
        allocation: &BTreeMap<String, String>,
        generation: u64,
    ) -> Result<()> {
        let name = pool.name_any();
        let next_generation = generation + 1;
        let payload = serde_json::to_string(&PoolAllocation {
            pod_allocation: allocation.clone(),
        })
        .context("serializing pool allocation")?;

        let patch = json!({
            "metadata": {
                "resourceVersion": pool.resource_version(),
                "annotations": {
                    POOL_ALLOC_STATUS_ANNOTATION: payload,
                    POOL_ALLOC_GENERATION_ANNOTATION: next_generation.to_string(),
                }
            }
        });

        let patched = self
            .pools
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching allocation annotations on pool {name}"))?;

        if let Some(rv) = patched.resource_version() {
            self.revisions.expect(key, rv);
        }
        debug!(
            pool = %name,
            generation = next_generation,
            allocated = allocation.len(),
            "persisted pool allocation"
        );
        Ok(())
    }
}
