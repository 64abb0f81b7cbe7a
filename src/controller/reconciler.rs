//! Pool controller: keeps every SandboxPool at its desired shape.
//!
//! Watches pools, their owned pods, and the batch sandboxes referencing
//! them. Each reconcile schedules allocations, persists the allocation map,
//! mirrors per-sandbox pod lists, rolls idle pods onto the latest template
//! revision, and scales the pool into its buffer band.

use crate::controller::alloc_store::AllocationStore;
use crate::controller::allocator::{AllocationResult, allocate};
use crate::controller::expectations::{RevisionExpectations, ScaleExpectations};
use crate::resources::{
    BatchSandbox, POOL_NAME_LABEL, POOL_REVISION_LABEL, PodNameList,
    SANDBOX_ALLOC_STATUS_ANNOTATION, SandboxPool, SandboxPoolStatus, pod_is_ready, pod_revision,
    sort_pods_oldest_first, template_revision,
};
use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requeue interval while waiting out a shortfall or an unsatisfied
/// expectation.
const SHORT_REQUEUE: Duration = Duration::from_secs(5);
/// Periodic resync interval for settled pools.
const RESYNC_REQUEUE: Duration = Duration::from_secs(30);

/// Error type for the reconciler (wraps anyhow)
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReconcileError {
    #[from]
    source: anyhow::Error,
}

/// Shared state for the pool reconciler
pub struct PoolContext {
    client: Client,
    scale: ScaleExpectations,
    revisions: RevisionExpectations,
}

impl PoolContext {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            scale: ScaleExpectations::new(),
            revisions: RevisionExpectations::new(),
        }
    }
}

/// Run the pool controller until a termination signal arrives.
pub async fn run(client: Client, namespace: Option<&str>) -> anyhow::Result<()> {
    let pools: Api<SandboxPool> = scoped(client.clone(), namespace);
    let pods: Api<Pod> = scoped(client.clone(), namespace);
    let sandboxes: Api<BatchSandbox> = scoped(client.clone(), namespace);

    let context = Arc::new(PoolContext::new(client));

    info!(
        namespace = namespace.unwrap_or("<all>"),
        "starting sandbox pool controller"
    );

    Controller::new(pools, WatcherConfig::default())
        .owns(pods, WatcherConfig::default().labels(POOL_NAME_LABEL))
        .watches(sandboxes, WatcherConfig::default(), |sandbox: BatchSandbox| {
            let pool = sandbox.spec.pool_ref.clone();
            let namespace = sandbox.namespace().unwrap_or_default();
            (!pool.is_empty()).then(|| ObjectRef::new(&pool).within(&namespace))
        })
        .shutdown_on_signal()
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            match result {
                Ok((pool, action)) => debug!(pool = %pool.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    Ok(())
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn on_error(pool: Arc<SandboxPool>, error: &ReconcileError, _ctx: Arc<PoolContext>) -> Action {
    warn!(pool = %pool.name_any(), error = %error, "reconcile failed, requeueing");
    Action::requeue(SHORT_REQUEUE)
}

/// One reconcile pass for a single pool.
async fn reconcile(
    pool: Arc<SandboxPool>,
    ctx: Arc<PoolContext>,
) -> Result<Action, ReconcileError> {
    let namespace = pool
        .namespace()
        .context("SandboxPool is expected to be namespaced")?;
    let name = pool.name_any();
    let key = format!("{namespace}/{name}");

    // A deleting pool is frozen; garbage collection of owned pods is the
    // owner-reference's job.
    if pool.metadata.deletion_timestamp.is_some() {
        ctx.scale.forget(&key);
        ctx.revisions.forget(&key);
        return Ok(Action::await_change());
    }

    if let Err(reason) = pool.spec.capacity.validate() {
        warn!(pool = %key, %reason, "rejecting pool with invalid capacity");
        return Ok(Action::await_change());
    }

    ctx.revisions
        .observe(&key, &pool.resource_version().unwrap_or_default());

    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pools_api: Api<SandboxPool> = Api::namespaced(ctx.client.clone(), &namespace);
    let sandboxes_api: Api<BatchSandbox> = Api::namespaced(ctx.client.clone(), &namespace);

    // Load owned pods and the batch sandboxes drawing from this pool.
    let mut pods = list_owned_pods(&pods_api, &pool, &name).await?;
    observe_pods(&ctx, &key, &pods);
    pods.retain(|p| p.metadata.deletion_timestamp.is_none());
    sort_pods_oldest_first(&mut pods);

    let sandboxes: Vec<BatchSandbox> = sandboxes_api
        .list(&ListParams::default())
        .await
        .map_err(|e| anyhow::anyhow!(e).context("listing batch sandboxes"))?
        .items
        .into_iter()
        .filter(|s| s.spec.pool_ref == name && s.spec.template.is_none())
        .collect();

    // Schedule.
    let store = AllocationStore::new(&pools_api, &ctx.revisions);
    let (prior, generation) = store.load(&pool)?;
    let result = allocate(&prior.pod_allocation, &pods, &sandboxes);

    // Persist the pool map before any sandbox mirror is touched.
    if result.pool_dirty {
        if !ctx.revisions.satisfied(&key) {
            debug!(pool = %key, "previous allocation write not yet observed, holding back");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        if let Err(e) = store.persist(&key, &pool, &result.allocation, generation).await {
            warn!(pool = %key, error = %e, "allocation persistence failed, will retry");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
    }

    let mut errors: Vec<String> = Vec::new();
    patch_sandbox_mirrors(&sandboxes_api, &result, &mut errors).await;

    // Partition idle pods by template revision.
    let latest_revision = template_revision(&pool.spec.template);
    let idle: Vec<&Pod> = pods
        .iter()
        .filter(|p| !result.allocation.contains_key(&p.name_any()))
        .collect();
    let (latest_idle, delete_old): (Vec<&Pod>, Vec<&Pod>) = idle
        .iter()
        .copied()
        .partition(|p| pod_revision(p) == Some(latest_revision.as_str()));

    // Scale, unless an earlier create/delete has not been observed yet.
    let detail = ctx.scale.satisfied_detail(&key);
    if detail.satisfied {
        let plan = plan_scale(
            &pool.spec.capacity,
            pods.len() as i64,
            result.allocation.len() as i64,
            result.pod_supplement as i64,
            delete_old.iter().map(|p| p.name_any()).collect(),
            latest_idle.iter().map(|p| p.name_any()).collect(),
        );
        apply_scale(&ctx, &key, &pods_api, &pool, &latest_revision, &plan, &mut errors).await;
    } else {
        info!(
            pool = %key,
            pending_creates = detail.pending_creates.len(),
            pending_deletes = detail.pending_deletes.len(),
            unsatisfied_for = ?detail.unsatisfied_for,
            "scale expectations unsatisfied, skipping scale"
        );
    }

    // Publish status from what this pass observed.
    let available = idle.iter().filter(|p| pod_is_ready(p)).count() as i64;
    let status = SandboxPoolStatus {
        observed_generation: pool.metadata.generation.unwrap_or_default(),
        revision: latest_revision,
        total: pods.len() as i64,
        allocated: result.allocation.len() as i64,
        available,
    };
    if pool.status.as_ref() != Some(&status) {
        if let Err(e) = pools_api
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await
        {
            errors.push(format!("patching pool status: {e}"));
        }
    }

    if !errors.is_empty() {
        warn!(pool = %key, errors = errors.join("; "), "reconcile completed with errors");
    }

    if result.pod_supplement > 0 || !detail.satisfied {
        Ok(Action::requeue(SHORT_REQUEUE))
    } else {
        Ok(Action::requeue(RESYNC_REQUEUE))
    }
}

/// List pods labeled for this pool and controller-owned by it.
async fn list_owned_pods(
    pods_api: &Api<Pod>,
    pool: &SandboxPool,
    pool_name: &str,
) -> anyhow::Result<Vec<Pod>> {
    let uid = pool.uid().unwrap_or_default();
    let selector = format!("{POOL_NAME_LABEL}={pool_name}");
    let listed = pods_api
        .list(&ListParams::default().labels(&selector))
        .await
        .context("listing pool pods")?;
    Ok(listed
        .items
        .into_iter()
        .filter(|pod| {
            pod.metadata
                .owner_references
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|r| r.uid == uid)
        })
        .collect())
}

/// Reconcile scale expectations against the pods actually observed.
fn observe_pods(ctx: &PoolContext, key: &str, pods: &[Pod]) {
    let mut present = std::collections::HashSet::new();
    for pod in pods {
        let name = pod.name_any();
        ctx.scale.observe_creation(key, &name);
        if pod.metadata.deletion_timestamp.is_some() {
            ctx.scale.observe_deletion(key, &name);
        }
        present.insert(name);
    }
    for expected in ctx.scale.satisfied_detail(key).pending_deletes {
        if !present.contains(&expected) {
            ctx.scale.observe_deletion(key, &expected);
        }
    }
}

/// Mirror the bound-pod lists onto every dirty sandbox's alloc-status
/// annotation. Failures are recorded, never fatal: the allocator's merge
/// pass reconverges a stale mirror on the next cycle.
async fn patch_sandbox_mirrors(
    sandboxes_api: &Api<BatchSandbox>,
    result: &AllocationResult,
    errors: &mut Vec<String>,
) {
    for sandbox in &result.dirty_sandboxes {
        let pods = result
            .sandbox_pods
            .get(sandbox)
            .cloned()
            .unwrap_or_default();
        let payload = match serde_json::to_string(&PodNameList { pods }) {
            Ok(p) => p,
            Err(e) => {
                errors.push(format!("serializing alloc-status for {sandbox}: {e}"));
                continue;
            }
        };
        let patch = json!({
            "metadata": {
                "annotations": { SANDBOX_ALLOC_STATUS_ANNOTATION: payload }
            }
        });
        if let Err(e) = sandboxes_api
            .patch(sandbox, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            errors.push(format!("patching alloc-status on {sandbox}: {e}"));
        }
    }
}

/// A concrete set of create/delete actions for one reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Number of pods to create at the latest revision.
    pub create: usize,
    /// Idle pods to delete, old revisions first, oldest first within each.
    pub delete: Vec<String>,
}

/// Compute the scale actions from the observed counts.
///
/// `delete_old` are idle pods at a stale revision (always replaced);
/// `latest_idle` must be sorted oldest-first. Allocated pods are never
/// candidates.
pub fn plan_scale(
    capacity: &crate::resources::PoolCapacity,
    total: i64,
    allocated: i64,
    supplement: i64,
    delete_old: Vec<String>,
    latest_idle: Vec<String>,
) -> ScalePlan {
    let buffer = total - allocated;
    let desired_buffer = if buffer < capacity.buffer_min || buffer > capacity.buffer_max {
        (capacity.buffer_min + capacity.buffer_max) / 2
    } else {
        buffer
    };
    let desired_total =
        (allocated + supplement + desired_buffer).clamp(capacity.pool_min, capacity.pool_max);

    let supply_new = delete_old.len() as i64;
    let create = (desired_total + supply_new - total).max(0) as usize;

    let mut delete = delete_old;
    let surplus = (total - supply_new + create as i64 - desired_total).max(0) as usize;
    delete.extend(latest_idle.into_iter().take(surplus));

    ScalePlan { create, delete }
}

/// Actuate a scale plan, stamping expectations before every call.
async fn apply_scale(
    ctx: &PoolContext,
    key: &str,
    pods_api: &Api<Pod>,
    pool: &SandboxPool,
    revision: &str,
    plan: &ScalePlan,
    errors: &mut Vec<String>,
) {
    if plan.create > 0 {
        let names: Vec<String> = (0..plan.create)
            .map(|_| {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", pool.name_any(), &suffix[..8])
            })
            .collect();
        ctx.scale.expect_creations(key, names.iter().cloned());
        for pod_name in &names {
            let pod = match build_pool_pod(pool, pod_name, revision) {
                Ok(pod) => pod,
                Err(e) => {
                    ctx.scale.observe_creation(key, pod_name);
                    errors.push(format!("building pod {pod_name}: {e}"));
                    continue;
                }
            };
            if let Err(e) = pods_api.create(&PostParams::default(), &pod).await {
                ctx.scale.observe_creation(key, pod_name);
                errors.push(format!("creating pod {pod_name}: {e}"));
            }
        }
        info!(pool = %key, created = names.len(), revision, "scaled pool up");
    }

    if !plan.delete.is_empty() {
        ctx.scale.expect_deletions(key, plan.delete.iter().cloned());
        for pod_name in &plan.delete {
            match pods_api.delete(pod_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    ctx.scale.observe_deletion(key, pod_name);
                }
                Err(e) => {
                    ctx.scale.observe_deletion(key, pod_name);
                    errors.push(format!("deleting pod {pod_name}: {e}"));
                }
            }
        }
        info!(pool = %key, deleted = plan.delete.len(), "scaled pool down");
    }
}

/// Build a pod from the pool template, stamped with the pool-name and
/// pool-revision labels and owner-referenced to the pool.
fn build_pool_pod(pool: &SandboxPool, pod_name: &str, revision: &str) -> anyhow::Result<Pod> {
    let owner_ref = pool
        .controller_owner_ref(&())
        .context("pool is missing name or uid")?;

    let template = &pool.spec.template;
    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = Some(pod_name.to_string());
    metadata.namespace = pool.namespace();
    metadata.owner_references = Some(vec![owner_ref]);
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(POOL_NAME_LABEL.to_string(), pool.name_any());
    labels.insert(POOL_REVISION_LABEL.to_string(), revision.to_string());

    Ok(Pod {
        metadata: ObjectMeta {
            name: metadata.name,
            namespace: metadata.namespace,
            labels: metadata.labels,
            annotations: metadata.annotations,
            owner_references: metadata.owner_references,
            ..Default::default()
        },
        spec: template.spec.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::PoolCapacity;

    fn capacity(pool_min: i64, pool_max: i64, buffer_min: i64, buffer_max: i64) -> PoolCapacity {
        PoolCapacity {
            pool_min,
            pool_max,
            buffer_min,
            buffer_max,
        }
    }

    #[test]
    fn test_buffer_in_band_is_left_alone() {
        let plan = plan_scale(&capacity(0, 10, 1, 3), 3, 1, 0, vec![], vec![]);
        assert_eq!(plan, ScalePlan::default());
    }

    #[test]
    fn test_scale_out_on_buffer_widening() {
        // 1 idle pod, buffer band moved to [2,2]: one more pod is due.
        let plan = plan_scale(&capacity(0, 2, 2, 2), 1, 0, 0, vec![], vec!["p1".into()]);
        assert_eq!(plan.create, 1);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_pool_min_wins_over_buffer() {
        let plan = plan_scale(&capacity(1, 1, 0, 0), 0, 0, 0, vec![], vec![]);
        assert_eq!(plan.create, 1);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_pool_max_caps_supplement() {
        let plan = plan_scale(&capacity(0, 3, 1, 1), 2, 2, 5, vec![], vec![]);
        // allocated + supplement + buffer = 8, clamped to 3.
        assert_eq!(plan.create, 1);
    }

    #[test]
    fn test_rolling_replaces_old_idle_pods() {
        // p1 allocated at old revision stays; p2 idle at old revision is
        // replaced by a fresh pod at the latest revision.
        let plan = plan_scale(&capacity(0, 5, 1, 1), 2, 1, 0, vec!["p2".into()], vec![]);
        assert_eq!(plan.create, 1);
        assert_eq!(plan.delete, vec!["p2".to_string()]);
    }

    #[test]
    fn test_scale_in_deletes_oldest_latest_idle() {
        let plan = plan_scale(
            &capacity(0, 10, 1, 2),
            5,
            1,
            0,
            vec![],
            vec!["p-old".into(), "p-mid".into(), "p-new".into(), "p-newest".into()],
        );
        // buffer 4 out of [1,2] -> desired buffer 1, desired total 2.
        assert_eq!(plan.create, 0);
        assert_eq!(
            plan.delete,
            vec!["p-old".to_string(), "p-mid".to_string(), "p-new".to_string()]
        );
    }

    #[test]
    fn test_never_deletes_more_than_idle() {
        // Allocated count exceeds desired total; only idle pods may go.
        let plan = plan_scale(&capacity(0, 2, 0, 0), 4, 3, 0, vec![], vec!["p1".into()]);
        assert!(plan.delete.len() <= 1);
    }
}
