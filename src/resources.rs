//! Custom resource types for sandbox pools.
//!
//! Defines the `SandboxPool` and `BatchSandbox` Custom Resource Definitions
//! using kube-derive, the annotation/label contract shared between the pool
//! controller and batch-sandbox owners, and the template revision stamp used
//! to drive rolling updates.

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

// ===== Annotation and label keys =====

/// Pool annotation carrying the serialized pod->sandbox allocation map.
pub const POOL_ALLOC_STATUS_ANNOTATION: &str = "pool.opensandbox.io/alloc-status";
/// Pool annotation carrying the monotonically increasing allocation generation.
pub const POOL_ALLOC_GENERATION_ANNOTATION: &str = "pool.opensandbox.io/alloc-generation";
/// BatchSandbox annotation listing the pods currently bound to it.
pub const SANDBOX_ALLOC_STATUS_ANNOTATION: &str = "sandbox.opensandbox.io/alloc-status";
/// BatchSandbox annotation listing the pods its owner is returning to the pool.
pub const SANDBOX_ALLOC_RELEASE_ANNOTATION: &str = "sandbox.opensandbox.io/alloc-release";

/// Label stamping every pool-owned pod with its pool's name.
pub const POOL_NAME_LABEL: &str = "sandbox.opensandbox.io/pool-name";
/// Label stamping every pool-owned pod with the revision it was created from.
pub const POOL_REVISION_LABEL: &str = "sandbox.opensandbox.io/pool-revision";

// ===== CRD: SandboxPool =====

/// Spec for the SandboxPool custom resource
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "opensandbox.io",
    version = "v1alpha1",
    kind = "SandboxPool",
    plural = "sandboxpools",
    shortname = "sbp",
    status = "SandboxPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolSpec {
    /// Pod template every pool pod is created from
    pub template: PodTemplateSpec,
    /// Pool sizing bounds
    #[serde(default)]
    pub capacity: PoolCapacity,
}

/// Sizing bounds for a pool: hard total limits plus an idle-buffer band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacity {
    /// Minimum number of pods the pool keeps alive
    #[serde(default)]
    pub pool_min: i64,
    /// Maximum number of pods the pool may own
    #[serde(default)]
    pub pool_max: i64,
    /// Lower bound on the idle (unallocated) pod buffer
    #[serde(default)]
    pub buffer_min: i64,
    /// Upper bound on the idle (unallocated) pod buffer
    #[serde(default)]
    pub buffer_max: i64,
}

impl PoolCapacity {
    /// Check the capacity invariants: `0 <= poolMin <= poolMax` and
    /// `0 <= bufferMin <= bufferMax`.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_min < 0 || self.pool_min > self.pool_max {
            return Err(format!(
                "invalid pool bounds: 0 <= poolMin ({}) <= poolMax ({}) violated",
                self.pool_min, self.pool_max
            ));
        }
        if self.buffer_min < 0 || self.buffer_min > self.buffer_max {
            return Err(format!(
                "invalid buffer bounds: 0 <= bufferMin ({}) <= bufferMax ({}) violated",
                self.buffer_min, self.buffer_max
            ));
        }
        Ok(())
    }
}

/// Status reported by the controller on the SandboxPool CR
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolStatus {
    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: i64,
    /// Revision stamp of the current template
    #[serde(default)]
    pub revision: String,
    /// Total pods owned by the pool
    #[serde(default)]
    pub total: i64,
    /// Pods bound to a batch sandbox
    #[serde(default)]
    pub allocated: i64,
    /// Idle pods that are Running and not terminating
    #[serde(default)]
    pub available: i64,
}

// ===== CRD: BatchSandbox =====

/// Spec for the BatchSandbox custom resource.
///
/// A BatchSandbox consumes `replicas` pods from the pool named by `poolRef`.
/// A BatchSandbox that carries its own `template` creates pods directly and
/// does not participate in pool allocation.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "opensandbox.io",
    version = "v1alpha1",
    kind = "BatchSandbox",
    plural = "batchsandboxes",
    shortname = "bsbx",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BatchSandboxSpec {
    /// Name of the SandboxPool to draw pods from
    #[serde(default)]
    pub pool_ref: String,
    /// Number of pods this sandbox needs
    #[serde(default)]
    pub replicas: i64,
    /// Inline pod template; set only for sandboxes that bypass the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

// ===== Allocation annotation payloads =====

/// Pool-wide allocation map persisted in the pool's alloc-status annotation.
///
/// Keys are pod names, values are the owning batch-sandbox names; a pod
/// appears at most once. `BTreeMap` keeps the serialized form canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAllocation {
    #[serde(default)]
    pub pod_allocation: BTreeMap<String, String>,
}

impl PoolAllocation {
    /// Load the allocation map and generation counter from pool annotations.
    ///
    /// A missing annotation reads as an empty map at generation zero; a
    /// garbled one is an error.
    pub fn from_pool(pool: &SandboxPool) -> anyhow::Result<(Self, u64)> {
        let annotations = pool.annotations();
        let allocation = match annotations.get(POOL_ALLOC_STATUS_ANNOTATION) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                anyhow::anyhow!("unparseable {POOL_ALLOC_STATUS_ANNOTATION} annotation: {e}")
            })?,
            None => Self::default(),
        };
        let generation = match annotations.get(POOL_ALLOC_GENERATION_ANNOTATION) {
            Some(raw) => raw.parse().map_err(|e| {
                anyhow::anyhow!("unparseable {POOL_ALLOC_GENERATION_ANNOTATION} annotation: {e}")
            })?,
            None => 0,
        };
        Ok((allocation, generation))
    }
}

/// Pod-name list payload shared by the BatchSandbox alloc-status and
/// alloc-release annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNameList {
    #[serde(default)]
    pub pods: Vec<String>,
}

/// Annotation accessors forming the batch-sandbox collaborator contract.
///
/// The pool controller writes `alloc-status` and treats it as the sandbox's
/// authoritative bound-pod list. A batch-sandbox owner must (a) write
/// `alloc-release` with pods to return and delete the sandbox only after the
/// release has been observed, (b) trust `alloc-status`, and (c) never delete
/// pool-owned pods directly.
pub trait BatchSandboxAllocations {
    /// Pods currently bound to this sandbox, per its alloc-status annotation.
    fn allocated_pods(&self) -> Vec<String>;
    /// Pods the owner is returning, per its alloc-release annotation.
    fn released_pods(&self) -> Vec<String>;
}

impl BatchSandboxAllocations for BatchSandbox {
    fn allocated_pods(&self) -> Vec<String> {
        annotation_pod_list(self, SANDBOX_ALLOC_STATUS_ANNOTATION)
    }

    fn released_pods(&self) -> Vec<String> {
        annotation_pod_list(self, SANDBOX_ALLOC_RELEASE_ANNOTATION)
    }
}

// A garbled list reads as empty; the merge pass restores alloc-status from
// the pool map and an empty release list defers the release.
fn annotation_pod_list(sandbox: &BatchSandbox, key: &str) -> Vec<String> {
    let Some(raw) = sandbox.annotations().get(key) else {
        return Vec::new();
    };
    match serde_json::from_str::<PodNameList>(raw) {
        Ok(list) => list.pods,
        Err(e) => {
            warn!(
                sandbox = %sandbox.name_any(),
                annotation = key,
                error = %e,
                "ignoring unparseable pod list annotation"
            );
            Vec::new()
        }
    }
}

// ===== Template revision =====

/// Compute the revision stamp for a pod template: the first 8 bytes of the
/// SHA-256 over its canonical JSON serialization, hex-encoded.
pub fn template_revision(template: &PodTemplateSpec) -> String {
    // Round-tripping through Value gives a stable key order.
    let canonical = serde_json::to_value(template)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..8])
}

// ===== Pod helpers =====

/// Whether a pod can serve an allocation: Running and not terminating.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Running")
}

/// Revision a pool pod was created at, from its pool-revision label.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(POOL_REVISION_LABEL))
        .map(String::as_str)
}

/// Sort pods oldest first by creation timestamp, name as tie-break, so
/// allocation and scale-down both walk pods in a stable order.
pub fn sort_pods_oldest_first(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let at = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let bt = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        at.cmp(&bt).then_with(|| a.name_any().cmp(&b.name_any()))
    });
}
