//! Cluster API facade.
//!
//! Everything the monitors read from or write to the Kubernetes API goes
//! through [`ClusterApi`], so the reconcilers can be driven by an in-memory
//! cluster in tests. [`KubeClient`] is the real implementation; every call is
//! bounded by a deadline.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Event, EventSource, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod, Taint,
};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Field manager recorded on taint patches.
pub const FIELD_MANAGER: &str = "podmon";
/// Component name on emitted events.
pub const EVENT_COMPONENT: &str = "podmon";

const TAINT_PATCH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Delete a pod, guarded by a UID precondition. `force` deletes with a zero grace period.
    async fn delete_pod(&self, namespace: &str, name: &str, uid: &str, force: bool) -> Result<()>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Like [`ClusterApi::get_node`] with an explicit deadline, used to check API reachability.
    async fn get_node_with_timeout(&self, timeout: Duration, name: &str) -> Result<Node>;

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume>;

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Look up the attachment of `pv_name` to `node_name`, reloading the cache on a miss.
    async fn get_cached_volume_attachment(
        &self,
        pv_name: &str,
        node_name: &str,
    ) -> Result<Option<VolumeAttachment>>;

    async fn delete_volume_attachment(&self, name: &str) -> Result<()>;

    /// Add (or with `remove`, drop) a taint. No-op when the node is already in that state.
    async fn taint_node(
        &self,
        node_name: &str,
        taint_key: &str,
        effect: TaintEffect,
        remove: bool,
    ) -> Result<()>;

    async fn create_event(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;

    /// Every bound PV referenced by the pod's claims. Unbound claims are skipped.
    async fn get_persistent_volumes_in_pod(&self, pod: &Pod) -> Result<Vec<PersistentVolume>> {
        let namespace = pod.namespace().unwrap_or_default();
        let mut pvs = Vec::new();

        for claim in pod_claim_names(pod) {
            let Some(pvc) = self
                .get_persistent_volume_claim(&namespace, &claim)
                .await?
            else {
                debug!(pvc = %claim, namespace = %namespace, "PVC not found");
                continue;
            };
            let Some(volume_name) = bound_volume_name(&pvc) else {
                info!(pvc = %claim, namespace = %namespace, "PVC not bound");
                continue;
            };
            pvs.push(self.get_persistent_volume(&volume_name).await?);
        }

        Ok(pvs)
    }
}

/// Claim names referenced from the pod spec, in declaration order.
pub fn pod_claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn bound_volume_name(pvc: &PersistentVolumeClaim) -> Option<String> {
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    let volume_name = pvc.spec.as_ref().and_then(|s| s.volume_name.clone());
    match (phase, volume_name) {
        (Some("Bound"), Some(name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

pub fn node_has_taint(node: &Node, key: &str, effect: TaintEffect) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.key == key && t.effect == effect.as_str())
        })
        .unwrap_or(false)
}

/// New taint list for the node, or `None` when nothing has to change.
pub fn updated_taints(
    node: &Node,
    key: &str,
    effect: TaintEffect,
    remove: bool,
) -> Option<Vec<Taint>> {
    let mut taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    let present = node_has_taint(node, key, effect);

    match (present, remove) {
        (true, true) => {
            taints.retain(|t| !(t.key == key && t.effect == effect.as_str()));
            Some(taints)
        }
        (false, false) => {
            taints.push(Taint {
                key: key.to_string(),
                effect: effect.as_str().to_string(),
                time_added: Some(Time(chrono::Utc::now())),
                value: None,
            });
            Some(taints)
        }
        _ => None,
    }
}

/// Kubernetes-backed [`ClusterApi`].
pub struct KubeClient {
    client: Client,
    timeout: Duration,
    /// Deadline for pod deletion and attachment listing.
    long_timeout: Duration,
    reporting_instance: String,
    /// `<pv>/<node>` to attachment.
    va_cache: Mutex<HashMap<String, VolumeAttachment>>,
}

impl KubeClient {
    pub fn new(
        client: Client,
        timeout: Duration,
        long_timeout: Duration,
        reporting_instance: String,
    ) -> Self {
        Self {
            client,
            timeout,
            long_timeout,
            reporting_instance,
            va_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        with_deadline(operation, timeout, fut).await
    }

    async fn reload_va_cache(&self) -> Result<()> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        let list = self
            .bounded(
                "list volumeattachments",
                self.long_timeout,
                api.list(&ListParams::default()),
            )
            .await?;

        let mut cache = HashMap::new();
        for va in list.items {
            if let Some(pv) = va.spec.source.persistent_volume_name.clone() {
                cache.insert(va_key(&pv, &va.spec.node_name), va);
            }
        }
        debug!(entries = cache.len(), "Rebuilt volume attachment cache");
        *self.va_cache.lock() = cache;
        Ok(())
    }
}

/// Run an API call, failing with [`Error::Timeout`] once `timeout` elapses.
pub async fn with_deadline<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout { operation, timeout }),
    }
}

fn va_key(pv_name: &str, node_name: &str) -> String {
    format!("{}/{}", pv_name, node_name)
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get pod", self.timeout, api.get_opt(name)).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: &str, force: bool) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = DeleteParams::default();
        if force {
            params.grace_period_seconds = Some(0);
        }
        if !uid.is_empty() {
            params.preconditions = Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            });
        }
        self.bounded("delete pod", self.long_timeout, api.delete(name, &params))
            .await?;
        info!(namespace = %namespace, pod = %name, force = force, "Deleted pod");
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.get_node_with_timeout(self.timeout, name).await
    }

    async fn get_node_with_timeout(&self, timeout: Duration, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded("get node", timeout, api.get_opt(name))
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.bounded("get persistentvolume", self.timeout, api.get_opt(name))
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "persistentvolume",
                name: name.to_string(),
            })
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get persistentvolumeclaim", self.timeout, api.get_opt(name))
            .await
    }

    async fn get_cached_volume_attachment(
        &self,
        pv_name: &str,
        node_name: &str,
    ) -> Result<Option<VolumeAttachment>> {
        let key = va_key(pv_name, node_name);
        if let Some(va) = self.va_cache.lock().get(&key) {
            return Ok(Some(va.clone()));
        }
        self.reload_va_cache().await?;
        Ok(self.va_cache.lock().get(&key).cloned())
    }

    async fn delete_volume_attachment(&self, name: &str) -> Result<()> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        let result = self
            .bounded(
                "delete volumeattachment",
                self.timeout,
                api.delete(name, &DeleteParams::default()),
            )
            .await;
        self.va_cache
            .lock()
            .retain(|_, va| va.metadata.name.as_deref() != Some(name));
        result.map(|_| ())
    }

    async fn taint_node(
        &self,
        node_name: &str,
        taint_key: &str,
        effect: TaintEffect,
        remove: bool,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let node = self.get_node(node_name).await?;
            let Some(taints) = updated_taints(&node, taint_key, effect, remove) else {
                debug!(node = %node_name, taint = %taint_key, remove = remove, "Taint already in desired state");
                return Ok(());
            };

            // Pinning the resourceVersion turns the merge patch into a compare-and-swap.
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": node.metadata.resource_version },
                "spec": { "taints": taints },
            });
            let result = self
                .bounded(
                    "patch node taints",
                    self.timeout,
                    api.patch(node_name, &params, &Patch::Merge(&patch)),
                )
                .await;

            match result {
                Ok(_) => {
                    info!(
                        node = %node_name,
                        taint = %taint_key,
                        effect = effect.as_str(),
                        remove = remove,
                        "Updated node taint"
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < TAINT_PATCH_ATTEMPTS => {
                    debug!(node = %node_name, attempt = attempt, "Node changed during taint update, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_event(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        let now = Time(chrono::Utc::now());

        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", name)),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.as_str().to_string()),
            source: Some(EventSource {
                component: Some(EVENT_COMPONENT.to_string()),
                host: None,
            }),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            reporting_component: Some(EVENT_COMPONENT.to_string()),
            reporting_instance: Some(self.reporting_instance.clone()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = self
            .bounded("create event", self.timeout, api.create(&PostParams::default(), &event))
            .await
        {
            warn!(pod = %name, reason = %reason, error = %e, "Failed to create event");
            return Err(e);
        }
        Ok(())
    }
}
