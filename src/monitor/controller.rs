//! Controller-mode reconciler and the fencing pipeline.
//!
//! Every pod event is classified under the pod's lock. A not-ready pod on a
//! node that is unreachable (or that podmon tainted itself) is handed to
//! [`PodMonitor::controller_cleanup_pod`], which only force-deletes the pod
//! after the array confirmed the node lost access and the driver detached
//! every volume from it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{
    csi_node_id, pod_key, pod_node_name, pod_uid, ControllerPodInfo, PodEvent, PodMonitor,
    PodStatus, MAX_CRASH_LOOP_RETRY, NODE_UNREACHABLE_TAINT,
};
use crate::driver::HostConnectivity;
use crate::error::{Error, Result};
use crate::k8s::{node_has_taint, EventType, TaintEffect};

const STORAGE_SYSTEM_ATTRIBUTE: &str = "StorageSystem";
const REMOTE_SYSTEM_ATTRIBUTE: &str = "remoteSystem";
const REPLICATED_PV_PREFIX: &str = "replicated-";
const DEFAULT_ARRAY_ID: &str = "default";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";

/// Why a pod is being fenced. Doubles as the event reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    NodeFailure,
    ArrayConnectivityLoss,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::NodeFailure => "NodeFailure",
            CleanupReason::ArrayConnectivityLoss => "ArrayConnectivityLoss",
        }
    }
}

/// Input of the fencing pipeline.
#[derive(Debug, Clone)]
pub struct FenceRequest {
    pub pod: Pod,
    pub node: Node,
    pub reason: CleanupReason,
    /// The node carries `node.kubernetes.io/unreachable:NoExecute`.
    pub taint_noexec: bool,
    /// The fence was triggered by podmon's own taint.
    pub taint_podmon: bool,
}

impl PodMonitor {
    /// Classify one pod event. Returns the fence to run, if any.
    pub async fn controller_mode_pod_handler(
        &self,
        pod: &Pod,
        event: PodEvent,
    ) -> Result<Option<FenceRequest>> {
        if pod.namespace().as_deref() == Some(self.settings.own_namespace.as_str()) {
            self.driver_pod_handler(pod, event).await?;
            return Ok(None);
        }

        let key = pod_key(pod);
        if event == PodEvent::Deleted {
            self.controller_pods.remove(&key);
            self.crash_loop_counts.remove(&key);
            debug!(pod = %key, "Pod deleted, dropped tracking state");
            return Ok(None);
        }

        let _guard = self.locks.lock(&key).await;

        let namespace = pod.namespace().unwrap_or_default();
        let Some(pod) = self.cluster.get_pod(&namespace, &pod.name_any()).await? else {
            debug!(pod = %key, "Pod no longer exists");
            return Ok(None);
        };

        let Some(node_name) = pod_node_name(&pod).map(str::to_string) else {
            // Replication failover of unscheduled pods is not handled here.
            debug!(pod = %key, "Pod is not scheduled, pending pod hook");
            return Ok(None);
        };

        let node = self.cluster.get_node(&node_name).await?;
        if let Some(uid) = node.metadata.uid.clone() {
            self.node_uids.insert(node_name.clone(), uid);
        }

        let status = PodStatus::of(&pod);
        let unreachable_noschedule =
            node_has_taint(&node, NODE_UNREACHABLE_TAINT, TaintEffect::NoSchedule);
        let unreachable_noexecute =
            node_has_taint(&node, NODE_UNREACHABLE_TAINT, TaintEffect::NoExecute);
        let podmon_noschedule =
            node_has_taint(&node, &self.podmon_taint_key, TaintEffect::NoSchedule);

        info!(
            pod = %key,
            event = ?event,
            node = %node_name,
            ready = status.ready,
            initialized = status.initialized,
            crash_loop = status.crash_loop,
            unreachable_noschedule = unreachable_noschedule,
            unreachable_noexecute = unreachable_noexecute,
            podmon_noschedule = podmon_noschedule,
            "Controller pod event"
        );

        if self.settings.ignore_volumeless_pods {
            let pvs = self.cluster.get_persistent_volumes_in_pod(&pod).await?;
            if pvs.is_empty() {
                self.controller_pods.remove(&key);
                debug!(pod = %key, "Ignoring pod without persistent volumes");
                return Ok(None);
            }
            if status.ready || event == PodEvent::Modified {
                self.record_controller_pod(&key, &pod, &node, &pvs, status.ready);
            }
        } else if status.ready || event == PodEvent::Modified {
            let pvs = self.cluster.get_persistent_volumes_in_pod(&pod).await?;
            self.record_controller_pod(&key, &pod, &node, &pvs, status.ready);
        }

        if status.ready {
            self.crash_loop_counts.remove(&key);
            return Ok(None);
        }

        if unreachable_noexecute || unreachable_noschedule || podmon_noschedule {
            // The recorded snapshot still has the CSI node id annotation even
            // if the node object has been stripped since.
            let recorded = self
                .controller_pods
                .get(&key)
                .filter(|info| info.pod_uid == pod_uid(&pod))
                .map(|info| info.node.clone());
            let fence_node = match recorded {
                Some(n) if csi_node_id(&n, &self.settings.driver_path).is_some() => n,
                _ => node,
            };
            return Ok(Some(FenceRequest {
                pod,
                node: fence_node,
                reason: CleanupReason::NodeFailure,
                taint_noexec: unreachable_noexecute,
                taint_podmon: podmon_noschedule,
            }));
        }

        if status.crash_loop {
            self.remediate_crash_loop(&key, &pod, &node_name).await;
        }

        Ok(None)
    }

    fn record_controller_pod(
        &self,
        key: &str,
        pod: &Pod,
        node: &Node,
        pvs: &[PersistentVolume],
        ready: bool,
    ) {
        let uid = pod_uid(pod);
        // Until the pod is Ready again keep the node snapshot of its last Ready observation.
        let node_snapshot = match self.controller_pods.get(key) {
            Some(info) if !ready && info.pod_uid == uid => info.node.clone(),
            _ => node.clone(),
        };
        let info = ControllerPodInfo {
            pod_key: key.to_string(),
            pod_uid: uid,
            node: node_snapshot,
            array_ids: pod_array_ids(pvs),
            pod_affinity_labels: pod_affinity_labels(pod),
        };
        debug!(pod = %key, arrays = ?info.array_ids, "Recorded controller pod info");
        self.controller_pods.insert(key.to_string(), info);
    }

    async fn remediate_crash_loop(&self, key: &str, pod: &Pod, node_name: &str) {
        let count = self.crash_loop_counts.get(key).map(|c| *c).unwrap_or(0);
        if count >= MAX_CRASH_LOOP_RETRY {
            debug!(pod = %key, count = count, "CrashLoopBackOff retry limit reached");
            return;
        }

        let uid = pod_uid(pod);
        let message = format!(
            "podmon cleaning pod {} {} with non-force delete from node {} because of CrashLoopBackOff",
            uid, key, node_name
        );
        if let Err(e) = self
            .cluster
            .create_event(pod, EventType::Warning, CRASH_LOOP_REASON, &message)
            .await
        {
            warn!(pod = %key, error = %e, "Could not record CrashLoopBackOff event");
        }

        self.crash_loop_counts.insert(key.to_string(), count + 1);
        let namespace = pod.namespace().unwrap_or_default();
        match self
            .cluster
            .delete_pod(&namespace, &pod.name_any(), &uid, false)
            .await
        {
            Ok(()) => info!(pod = %key, attempt = count + 1, "Deleted CrashLoopBackOff pod"),
            Err(e) => warn!(pod = %key, error = %e, "Could not delete CrashLoopBackOff pod"),
        }
    }

    /// Pods in the driver's namespace gate scheduling onto their node.
    async fn driver_pod_handler(&self, pod: &Pod, event: PodEvent) -> Result<()> {
        if event == PodEvent::Deleted {
            return Ok(());
        }
        let Some(node_name) = pod_node_name(pod) else {
            return Ok(());
        };

        let ready = PodStatus::of(pod).ready;
        let node = self.cluster.get_node(node_name).await?;
        let tainted = node_has_taint(&node, &self.driver_pod_taint_key, TaintEffect::NoSchedule);

        if !ready && !tainted {
            info!(pod = %pod_key(pod), node = %node_name, "Driver pod not ready, tainting node");
            self.cluster
                .taint_node(node_name, &self.driver_pod_taint_key, TaintEffect::NoSchedule, false)
                .await?;
        } else if ready && tainted {
            info!(pod = %pod_key(pod), node = %node_name, "Driver pod ready, removing node taint");
            self.cluster
                .taint_node(node_name, &self.driver_pod_taint_key, TaintEffect::NoSchedule, true)
                .await?;
        }
        Ok(())
    }

    /// Node watch handler: keeps the node UID map fresh and logs node health.
    pub async fn controller_mode_node_handler(&self, node: &Node) {
        let name = node.name_any();
        if let Some(uid) = node.metadata.uid.clone() {
            self.node_uids.insert(name.clone(), uid);
        }

        let unreachable = node_has_taint(node, NODE_UNREACHABLE_TAINT, TaintEffect::NoSchedule)
            || node_has_taint(node, NODE_UNREACHABLE_TAINT, TaintEffect::NoExecute);
        let podmon_tainted = node_has_taint(node, &self.podmon_taint_key, TaintEffect::NoSchedule);
        if unreachable || podmon_tainted {
            info!(node = %name, unreachable = unreachable, podmon_tainted = podmon_tainted, "Node is tainted");
        }

        if self.csi_extensions_present {
            match self.call_validate_volume_host_connectivity(node, &[]).await {
                Ok(connectivity) => {
                    debug!(node = %name, connected = connectivity.connected, "Node array connectivity")
                }
                Err(e) => debug!(node = %name, error = %e, "Node array connectivity check failed"),
            }
        }
    }

    /// Driver node id from the annotation, re-fetching the node once if it is absent.
    pub async fn resolve_csi_node_id(&self, node: &Node) -> Result<String> {
        let driver_path = &self.settings.driver_path;
        if let Some(id) = csi_node_id(node, driver_path) {
            return Ok(id);
        }

        let name = node.name_any();
        let fresh = self.cluster.get_node(&name).await?;
        csi_node_id(&fresh, driver_path).ok_or(Error::MissingCsiNodeId { node: name })
    }

    /// Ask the array about `node`. An array that no longer knows the host counts as disconnected.
    pub async fn call_validate_volume_host_connectivity(
        &self,
        node: &Node,
        volume_ids: &[String],
    ) -> Result<HostConnectivity> {
        let driver = self.driver.as_ref().ok_or(Error::DriverUnavailable)?;
        let node_id = self.resolve_csi_node_id(node).await?;

        let timeout = self.timings.short_timeout;
        let validated = tokio::time::timeout(
            timeout,
            driver.validate_volume_host_connectivity(&node_id, volume_ids),
        )
        .await
        .unwrap_or(Err(Error::Timeout {
            operation: "ValidateVolumeHostConnectivity",
            timeout,
        }));
        match validated {
            Ok(connectivity) => {
                for message in &connectivity.messages {
                    debug!(node = %node.name_any(), message = %message, "ValidateVolumeHostConnectivity");
                }
                Ok(connectivity)
            }
            Err(e) if e.is_no_corresponding_sdc() => {
                info!(node = %node.name_any(), "Array has no record of host, treating as disconnected");
                Ok(HostConnectivity::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the fencing pipeline under the pod lock. Returns whether the pod was deleted.
    pub async fn controller_cleanup_pod(&self, request: &FenceRequest) -> bool {
        let key = pod_key(&request.pod);
        let _guard = self.locks.lock(&key).await;

        match self.fence_pod(&key, request).await {
            Ok(done) => done,
            Err(e) => {
                warn!(pod = %key, node = %request.node.name_any(), error = %e, "Pod cleanup failed");
                false
            }
        }
    }

    async fn fence_pod(&self, key: &str, request: &FenceRequest) -> Result<bool> {
        let pod = &request.pod;
        let node_name = request.node.name_any();
        let uid = pod_uid(pod);
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        let recorded_uid = self.controller_pods.get(key).map(|info| info.pod_uid.clone());
        if let Some(recorded_uid) = recorded_uid {
            if recorded_uid != uid {
                info!(pod = %key, recorded_uid = %recorded_uid, uid = %uid, "Stale pod incarnation, skipping cleanup");
                return Ok(false);
            }
        }
        match self.cluster.get_pod(&namespace, &name).await? {
            Some(current) if pod_uid(&current) == uid => {}
            Some(_) => {
                info!(pod = %key, uid = %uid, "Pod was replaced, skipping cleanup");
                return Ok(false);
            }
            None => {
                info!(pod = %key, "Pod already gone, skipping cleanup");
                self.controller_pods.remove(key);
                return Ok(false);
            }
        }

        let pvs = self.cluster.get_persistent_volumes_in_pod(pod).await?;
        if pvs.is_empty() && self.settings.ignore_volumeless_pods {
            debug!(pod = %key, "No persistent volumes, nothing to fence");
            return Ok(true);
        }

        let volume_ids: Vec<String> = pvs
            .iter()
            .filter_map(|pv| pv.spec.as_ref()?.csi.as_ref())
            .map(|csi| csi.volume_handle.clone())
            .collect();
        if volume_ids.len() < pvs.len() {
            warn!(pod = %key, pvs = pvs.len(), handles = volume_ids.len(), "Some volumes are not CSI volumes");
        }

        let mut attachments = Vec::new();
        for pv in &pvs {
            let pv_name = pv.name_any();
            if let Some(va) = self
                .cluster
                .get_cached_volume_attachment(&pv_name, &node_name)
                .await?
            {
                attachments.push(va.name_any());
            }
        }

        let mut node_id = None;
        if self.driver.is_some() {
            match self.resolve_csi_node_id(&request.node).await {
                Ok(id) => node_id = Some(id),
                Err(e) => {
                    self.abort_event(request, &format!("because {}", e)).await;
                    return Ok(false);
                }
            }
        }

        if self.csi_extensions_present {
            match self
                .call_validate_volume_host_connectivity(&request.node, &volume_ids)
                .await
            {
                Err(e) => {
                    let detail = if matches!(e, Error::MissingCsiNodeId { .. }) {
                        format!("because {}", e)
                    } else {
                        format!(
                            "because error while validating volume host connectivity: {}",
                            e
                        )
                    };
                    self.abort_event(request, &detail).await;
                    return Ok(false);
                }
                Ok(connectivity) => {
                    let still_connected = connectivity.connected && !request.taint_podmon;
                    if still_connected || connectivity.ios_in_progress {
                        if self.tunables.skip_array_connection_validation() && request.taint_noexec {
                            info!(pod = %key, node = %node_name, "Skipping array connection validation");
                        } else {
                            self.abort_event(
                                request,
                                "because array still connected and/or recently did I/O",
                            )
                            .await;
                            return Ok(false);
                        }
                    }
                }
            }
        }

        if let (Some(driver), Some(node_id)) = (self.driver.as_ref(), node_id.as_deref()) {
            let mut failed = 0;
            for volume_id in &volume_ids {
                let result = self
                    .retry_pending("ControllerUnpublishVolume", || {
                        driver.controller_unpublish_volume(node_id, volume_id)
                    })
                    .await;
                if let Err(e) = result {
                    warn!(pod = %key, volume = %volume_id, node_id = %node_id, error = %e, "ControllerUnpublishVolume failed");
                    failed += 1;
                }
            }
            if failed > 0 {
                self.abort_event(
                    request,
                    &format!("because ControllerUnpublishVolume failed for {} volume(s)", failed),
                )
                .await;
                return Ok(false);
            }
        }

        if let Err(e) = self
            .cluster
            .taint_node(&node_name, &self.podmon_taint_key, TaintEffect::NoSchedule, false)
            .await
        {
            self.abort_event(request, &format!("because the node could not be tainted: {}", e))
                .await;
            return Ok(false);
        }

        for va_name in &attachments {
            if let Err(e) = self.delete_volume_attachment_with_retry(va_name).await {
                self.abort_event(
                    request,
                    &format!("because volume attachment {} could not be deleted: {}", va_name, e),
                )
                .await;
                return Ok(false);
            }
        }

        let message = format!(
            "podmon cleaning pod {} {} with force delete from node {}",
            uid, key, node_name
        );
        if let Err(e) = self
            .cluster
            .create_event(pod, EventType::Warning, request.reason.as_str(), &message)
            .await
        {
            warn!(pod = %key, error = %e, "Could not record cleanup event");
        }

        match self.cluster.delete_pod(&namespace, &name, &uid, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(pod = %key, "Pod disappeared before force delete");
            }
            Err(e) => {
                warn!(pod = %key, error = %e, "Force delete failed");
                return Ok(false);
            }
        }

        self.controller_pods.remove(key);
        info!(pod = %key, node = %node_name, reason = request.reason.as_str(), "Pod fenced and deleted");
        Ok(true)
    }

    async fn delete_volume_attachment_with_retry(&self, name: &str) -> Result<()> {
        let mut last = Ok(());
        for _ in 0..2 {
            match self.cluster.delete_volume_attachment(name).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => {
                    debug!(volume_attachment = %name, error = %e, "Volume attachment delete failed");
                    last = Err(e);
                }
            }
        }
        last
    }

    async fn abort_event(&self, request: &FenceRequest, detail: &str) {
        let key = pod_key(&request.pod);
        let node_name = request.node.name_any();
        let message = format!(
            "podmon aborted pod cleanup {} {} on node {} {}",
            pod_uid(&request.pod),
            key,
            node_name,
            detail
        );
        warn!(pod = %key, node = %node_name, "{}", message);
        if let Err(e) = self
            .cluster
            .create_event(
                &request.pod,
                EventType::Warning,
                request.reason.as_str(),
                &message,
            )
            .await
        {
            warn!(pod = %key, error = %e, "Could not record abort event");
        }
    }
}

/// Storage systems the pod's volumes live on, in first-seen order.
pub fn pod_array_ids(pvs: &[PersistentVolume]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for pv in pvs {
        let attributes = pv
            .spec
            .as_ref()
            .and_then(|s| s.csi.as_ref())
            .and_then(|csi| csi.volume_attributes.as_ref());
        let attribute = |name: &str| {
            attributes
                .and_then(|a| a.get(name))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let mut id = attribute(STORAGE_SYSTEM_ATTRIBUTE);
        if id.is_none() && pv.name_any().starts_with(REPLICATED_PV_PREFIX) {
            id = attribute(REMOTE_SYSTEM_ATTRIBUTE);
        }
        let id = id.unwrap_or_else(|| DEFAULT_ARRAY_ID.to_string());
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Labels of required hostname pod affinity terms; pods sharing them are fenced together.
pub fn pod_affinity_labels(pod: &Pod) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let terms = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_affinity.as_ref())
        .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_ref());

    for term in terms.into_iter().flatten() {
        if term.topology_key != HOSTNAME_TOPOLOGY_KEY {
            continue;
        }
        let Some(selector) = term.label_selector.as_ref() else {
            continue;
        };
        for (k, v) in selector.match_labels.iter().flatten() {
            labels.insert(k.clone(), v.clone());
        }
        for expr in selector.match_expressions.iter().flatten() {
            if expr.operator != "In" {
                continue;
            }
            for value in expr.values.iter().flatten() {
                labels.insert(expr.key.clone(), value.clone());
            }
        }
    }
    labels
}
