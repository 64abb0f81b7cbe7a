//! Pure pod-to-sandbox scheduling.
//!
//! `allocate` takes the prior pool allocation, the pool's pods, and the batch
//! sandboxes referencing the pool, and computes the next allocation map. It
//! performs no IO; the reconciler persists whatever comes out.

use crate::resources::{BatchSandbox, BatchSandboxAllocations, pod_is_ready};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationResult {
    /// The next pod->sandbox map.
    pub allocation: BTreeMap<String, String>,
    /// Per-sandbox bound-pod lists, remote order preserved, new pods appended.
    pub sandbox_pods: BTreeMap<String, Vec<String>>,
    /// Sandboxes whose alloc-status annotation needs a patch.
    pub dirty_sandboxes: BTreeSet<String>,
    /// Whether the map differs from the prior one.
    pub pool_dirty: bool,
    /// Pods the pool was short of to satisfy every sandbox.
    pub pod_supplement: usize,
}

/// Compute the next allocation.
///
/// Pods must already be sorted oldest-first; available pods are consumed from
/// the head so the oldest ready pods are handed out first. Sandboxes are
/// walked in name order to keep assignments stable across reconciles.
pub fn allocate(
    prior: &BTreeMap<String, String>,
    pods: &[Pod],
    sandboxes: &[BatchSandbox],
) -> AllocationResult {
    let mut allocation = prior.clone();
    let mut dirty_sandboxes = BTreeSet::new();

    let mut ordered: Vec<&BatchSandbox> = sandboxes.iter().collect();
    ordered.sort_by_key(|s| s.name_any());

    // The sandbox's own alloc-status is the authoritative record of what it
    // holds; fold any pods the pool map has not caught up on back in before
    // computing availability.
    let mut remote_pods: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for sandbox in &ordered {
        let name = sandbox.name_any();
        let remote = sandbox.allocated_pods();
        for pod in &remote {
            allocation.entry(pod.clone()).or_insert_with(|| name.clone());
        }
        remote_pods.insert(name, remote);
    }

    let mut available: VecDeque<String> = pods
        .iter()
        .filter(|p| pod_is_ready(p))
        .map(|p| p.name_any())
        .filter(|name| !allocation.contains_key(name))
        .collect();

    let mut sandbox_pods = BTreeMap::new();
    let mut pod_supplement = 0usize;

    // Allocation pass: top sandboxes up to their replica counts.
    for sandbox in &ordered {
        let name = sandbox.name_any();
        let mut bound = remote_pods.remove(&name).unwrap_or_default();

        // Entries the pool map holds that the sandbox annotation lost (a
        // failed sandbox patch on a prior cycle) are merged back and the
        // sandbox re-patched.
        for (pod, owner) in prior {
            if *owner == name && !bound.contains(pod) {
                bound.push(pod.clone());
                dirty_sandboxes.insert(name.clone());
            }
        }

        if sandbox.metadata.deletion_timestamp.is_none() {
            let need = (sandbox.spec.replicas.max(0) as usize).saturating_sub(bound.len());
            let can = need.min(available.len());
            for _ in 0..can {
                let pod = available.pop_front().expect("sized by can");
                allocation.insert(pod.clone(), name.clone());
                bound.push(pod);
                dirty_sandboxes.insert(name.clone());
            }
            pod_supplement += need - can;
        }

        sandbox_pods.insert(name, bound);
    }

    // Deallocation pass: honor explicit releases.
    for sandbox in &ordered {
        let name = sandbox.name_any();
        for released in sandbox.released_pods() {
            if allocation.get(&released).is_some_and(|owner| *owner == name) {
                allocation.remove(&released);
                dirty_sandboxes.insert(name.clone());
                if let Some(bound) = sandbox_pods.get_mut(&name) {
                    bound.retain(|p| *p != released);
                }
            }
        }
    }

    // Garbage-collect entries whose sandbox no longer exists.
    let live: BTreeSet<String> = ordered.iter().map(|s| s.name_any()).collect();
    allocation.retain(|_, owner| live.contains(owner));

    let pool_dirty = allocation != *prior;
    AllocationResult {
        allocation,
        sandbox_pods,
        dirty_sandboxes,
        pool_dirty,
        pod_supplement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        BatchSandboxSpec, SANDBOX_ALLOC_RELEASE_ANNOTATION, SANDBOX_ALLOC_STATUS_ANNOTATION,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn running_pod(name: &str, created_secs: i64) -> Pod {
        use chrono::TimeZone;
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(
                    chrono::Utc.timestamp_opt(created_secs, 0).unwrap(),
                )),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pending_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sandbox(name: &str, replicas: i64) -> BatchSandbox {
        let mut sbx = BatchSandbox::new(
            name,
            BatchSandboxSpec {
                pool_ref: "pool-a".to_string(),
                replicas,
                template: None,
            },
        );
        sbx.metadata.namespace = Some("ns".to_string());
        sbx
    }

    fn with_annotation(mut sbx: BatchSandbox, key: &str, pods: &[&str]) -> BatchSandbox {
        let list = serde_json::json!({ "pods": pods }).to_string();
        sbx.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), list);
        sbx
    }

    #[test]
    fn test_allocates_oldest_ready_pods_first() {
        let prior = BTreeMap::new();
        let pods = vec![
            running_pod("pod-old", 100),
            running_pod("pod-new", 200),
            pending_pod("pod-pending"),
        ];
        let sandboxes = vec![sandbox("sbx-1", 1)];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.get("pod-old"), Some(&"sbx-1".to_string()));
        assert_eq!(result.allocation.len(), 1);
        assert_eq!(result.sandbox_pods["sbx-1"], vec!["pod-old".to_string()]);
        assert!(result.dirty_sandboxes.contains("sbx-1"));
        assert!(result.pool_dirty);
        assert_eq!(result.pod_supplement, 0);
    }

    #[test]
    fn test_reports_shortfall_when_pool_is_dry() {
        let prior = BTreeMap::new();
        let pods = vec![running_pod("pod-1", 100)];
        let sandboxes = vec![sandbox("sbx-1", 3)];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.len(), 1);
        assert_eq!(result.pod_supplement, 2);
    }

    #[test]
    fn test_no_pod_allocated_twice() {
        let prior = BTreeMap::new();
        let pods = vec![running_pod("pod-1", 100), running_pod("pod-2", 200)];
        let sandboxes = vec![sandbox("sbx-a", 2), sandbox("sbx-b", 2)];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.len(), 2);
        // sbx-a sorts first and drains the pool.
        assert!(result.allocation.values().all(|owner| owner == "sbx-a"));
        assert_eq!(result.pod_supplement, 2);
    }

    #[test]
    fn test_prior_allocations_are_stable() {
        let mut prior = BTreeMap::new();
        prior.insert("pod-1".to_string(), "sbx-1".to_string());
        let pods = vec![running_pod("pod-1", 100), running_pod("pod-2", 200)];
        let sandboxes = vec![with_annotation(
            sandbox("sbx-1", 1),
            SANDBOX_ALLOC_STATUS_ANNOTATION,
            &["pod-1"],
        )];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.get("pod-1"), Some(&"sbx-1".to_string()));
        assert_eq!(result.allocation.len(), 1);
        assert!(!result.pool_dirty);
        assert!(result.dirty_sandboxes.is_empty());
    }

    #[test]
    fn test_merge_restores_lost_sandbox_annotation() {
        // Pool map has the binding but the sandbox annotation patch was lost.
        let mut prior = BTreeMap::new();
        prior.insert("pod-1".to_string(), "sbx-1".to_string());
        let pods = vec![running_pod("pod-1", 100)];
        let sandboxes = vec![sandbox("sbx-1", 1)];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.sandbox_pods["sbx-1"], vec!["pod-1".to_string()]);
        assert!(result.dirty_sandboxes.contains("sbx-1"));
        assert!(!result.pool_dirty);
        assert_eq!(result.pod_supplement, 0);
    }

    #[test]
    fn test_remote_annotation_is_authoritative() {
        // The sandbox annotation knows a binding the pool map lost; the pod
        // must not be treated as available.
        let prior = BTreeMap::new();
        let pods = vec![running_pod("pod-1", 100)];
        let sandboxes = vec![
            with_annotation(sandbox("sbx-1", 1), SANDBOX_ALLOC_STATUS_ANNOTATION, &["pod-1"]),
            sandbox("sbx-2", 1),
        ];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.get("pod-1"), Some(&"sbx-1".to_string()));
        assert_eq!(result.pod_supplement, 1);
    }

    #[test]
    fn test_release_returns_pods_to_idle() {
        let mut prior = BTreeMap::new();
        prior.insert("pod-1".to_string(), "sbx-1".to_string());
        let pods = vec![running_pod("pod-1", 100)];
        let sandboxes = vec![with_annotation(
            with_annotation(sandbox("sbx-1", 1), SANDBOX_ALLOC_STATUS_ANNOTATION, &["pod-1"]),
            SANDBOX_ALLOC_RELEASE_ANNOTATION,
            &["pod-1"],
        )];

        let result = allocate(&prior, &pods, &sandboxes);
        // Release runs after the allocation pass, so the cycle ends with the
        // pod free rather than immediately re-bound.
        assert!(result.allocation.is_empty());
        assert!(result.sandbox_pods["sbx-1"].is_empty());
        assert!(result.pool_dirty);
    }

    #[test]
    fn test_deleted_sandbox_entries_are_collected() {
        let mut prior = BTreeMap::new();
        prior.insert("pod-1".to_string(), "sbx-gone".to_string());
        let pods = vec![running_pod("pod-1", 100)];

        let result = allocate(&prior, &pods, &[]);
        assert!(result.allocation.is_empty());
        assert!(result.pool_dirty);
    }

    #[test]
    fn test_deleting_sandbox_gets_no_new_pods() {
        let prior = BTreeMap::new();
        let pods = vec![running_pod("pod-1", 100)];
        let mut sbx = sandbox("sbx-1", 1);
        sbx.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let result = allocate(&prior, &pods, &[sbx]);
        assert!(result.allocation.is_empty());
        assert_eq!(result.pod_supplement, 0);
    }

    #[test]
    fn test_release_of_foreign_pod_is_ignored() {
        let mut prior = BTreeMap::new();
        prior.insert("pod-1".to_string(), "sbx-owner".to_string());
        let pods = vec![running_pod("pod-1", 100)];
        let sandboxes = vec![
            with_annotation(sandbox("sbx-other", 0), SANDBOX_ALLOC_RELEASE_ANNOTATION, &["pod-1"]),
            with_annotation(sandbox("sbx-owner", 1), SANDBOX_ALLOC_STATUS_ANNOTATION, &["pod-1"]),
        ];

        let result = allocate(&prior, &pods, &sandboxes);
        assert_eq!(result.allocation.get("pod-1"), Some(&"sbx-owner".to_string()));
    }
}
