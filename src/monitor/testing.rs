//! In-memory cluster and driver used by the reconciler tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Affinity, ContainerState, ContainerStateWaiting, ContainerStatus, CSIPersistentVolumeSource, Node,
    NodeSpec, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod,
    PodAffinity, PodAffinityTerm, PodCondition, PodSpec, PodStatus as K8sPodStatus, Taint, Volume,
};
use k8s_openapi::api::storage::v1::{
    VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use parking_lot::Mutex;

use super::{pod_key, pod_uid, MonitorSettings, PodMonitor, CSI_NODE_ID_ANNOTATION};
use crate::config::{Timings, Tunables};
use crate::driver::{DriverApi, HostConnectivity};
use crate::error::{Error, Result};
use crate::k8s::{updated_taints, ClusterApi, EventType, TaintEffect};
use crate::mount::Mounter;

pub const DRIVER_PATH: &str = "csi-vxflexos.dellemc.com";

pub fn fast_timings() -> Timings {
    Timings {
        short_timeout: Duration::from_millis(50),
        medium_timeout: Duration::from_millis(100),
        long_timeout: Duration::from_millis(200),
        pending_retry: Duration::from_millis(1),
        api_check_interval: Duration::from_millis(5),
        api_check_retry_timeout: Duration::from_millis(1),
        api_check_first_try_timeout: Duration::from_millis(1),
        monitor_restart_delay: Duration::from_millis(1),
        driver_dial_retry: Duration::from_millis(1),
    }
}

/// A monitor wired to fakes, with the driver extension enabled.
pub fn monitor(
    settings: MonitorSettings,
    cluster: Arc<FakeCluster>,
    driver: Arc<FakeDriver>,
    mounter: Arc<dyn Mounter>,
) -> Arc<PodMonitor> {
    let tunables = Arc::new(Tunables::new(Duration::from_millis(1), 3, false));
    Arc::new(
        PodMonitor::new(settings, cluster, mounter, tunables, fast_timings())
            .with_driver(driver, true),
    )
}

/// Mounter that accepts everything.
pub struct NoopMounter;

impl Mounter for NoopMounter {
    fn unmount(&self, _path: &std::path::Path) -> std::io::Result<()> {
        Ok(())
    }

    fn remove_dir(&self, _path: &std::path::Path) -> std::io::Result<()> {
        Ok(())
    }

    fn remove_file(&self, _path: &std::path::Path) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct PodBuilder {
    pod: Pod,
}

pub fn pod(namespace: &str, name: &str, uid: &str, node_name: &str) -> PodBuilder {
    PodBuilder {
        pod: Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            status: Some(K8sPodStatus::default()),
        },
    }
}

impl PodBuilder {
    pub fn ready(mut self, ready: bool) -> Self {
        let status = self.pod.status.get_or_insert_with(Default::default);
        let conditions = status.conditions.get_or_insert_with(Vec::new);
        conditions.retain(|c| c.type_ != "Ready");
        conditions.push(PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn crash_loop(mut self) -> Self {
        let status = self.pod.status.get_or_insert_with(Default::default);
        status.container_statuses = Some(vec![ContainerStatus {
            name: "app".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("CrashLoopBackOff".to_string()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        self
    }

    pub fn claim(mut self, claim_name: &str) -> Self {
        let spec = self.pod.spec.get_or_insert_with(Default::default);
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: format!("vol-{}", claim_name),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        });
        self
    }

    /// Required pod affinity on `kubernetes.io/hostname` matching `labels`.
    pub fn affinity(mut self, labels: &[(&str, &str)]) -> Self {
        let spec = self.pod.spec.get_or_insert_with(Default::default);
        spec.affinity = Some(Affinity {
            pod_affinity: Some(PodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    topology_key: "kubernetes.io/hostname".to_string(),
                    label_selector: Some(LabelSelector {
                        match_labels: Some(
                            labels
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        ),
                        match_expressions: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

pub struct NodeBuilder {
    node: Node,
}

pub fn node(name: &str) -> NodeBuilder {
    NodeBuilder {
        node: Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("{}-uid", name)),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        },
    }
}

impl NodeBuilder {
    pub fn csi_node_id(self, driver_path: &str, node_id: &str) -> Self {
        let ids = HashMap::from([(driver_path.to_string(), node_id.to_string())]);
        let value = serde_json::to_string(&ids).unwrap();
        self.annotation(CSI_NODE_ID_ANNOTATION, &value)
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.node
            .annotations_mut()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn taint(mut self, key: &str, effect: TaintEffect) -> Self {
        let spec = self.node.spec.get_or_insert_with(Default::default);
        spec.taints.get_or_insert_with(Vec::new).push(Taint {
            key: key.to_string(),
            effect: effect.as_str().to_string(),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

pub fn pv(name: &str, handle: &str, attributes: &[(&str, &str)]) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: DRIVER_PATH.to_string(),
                volume_handle: handle.to_string(),
                volume_attributes: Some(
                    attributes
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn bound_pvc(namespace: &str, name: &str, pv_name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(pv_name.to_string()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        }),
    }
}

pub fn volume_attachment(name: &str, pv_name: &str, node_name: &str) -> VolumeAttachment {
    VolumeAttachment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: VolumeAttachmentSpec {
            attacher: DRIVER_PATH.to_string(),
            node_name: node_name.to_string(),
            source: VolumeAttachmentSource {
                persistent_volume_name: Some(pv_name.to_string()),
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Mutating cluster calls, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    DeletePod {
        key: String,
        uid: String,
        force: bool,
    },
    Taint {
        node: String,
        key: String,
        effect: TaintEffect,
        remove: bool,
    },
    DeleteVolumeAttachment(String),
    Event {
        key: String,
        event_type: EventType,
        reason: String,
        message: String,
    },
}

#[derive(Default)]
pub struct ClusterState {
    pub pods: HashMap<String, Pod>,
    pub nodes: HashMap<String, Node>,
    pub pvs: HashMap<String, PersistentVolume>,
    pub pvcs: HashMap<String, PersistentVolumeClaim>,
    pub vas: HashMap<String, VolumeAttachment>,
    pub calls: Vec<ClusterCall>,
    pub api_down: bool,
    /// Pod keys whose reads fail while the rest of the API answers.
    pub failing_pod_reads: HashSet<String>,
    /// Event creation is rejected after being recorded.
    pub events_rejected: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn add_pod(&self, pod: Pod) {
        self.state.lock().pods.insert(pod_key(&pod), pod);
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.name_any(), node);
    }

    /// Bound claim `<pv>-claim` in `namespace` backed by a CSI volume.
    pub fn add_volume(&self, namespace: &str, volume: PersistentVolume) -> String {
        let pv_name = volume.name_any();
        let claim = format!("{}-claim", pv_name);
        let mut state = self.state.lock();
        state.pvcs.insert(
            format!("{}/{}", namespace, claim),
            bound_pvc(namespace, &claim, &pv_name),
        );
        state.pvs.insert(pv_name, volume);
        claim
    }

    pub fn add_volume_attachment(&self, va: VolumeAttachment) {
        self.state.lock().vas.insert(va.name_any(), va);
    }

    pub fn set_api_down(&self, down: bool) {
        self.state.lock().api_down = down;
    }

    pub fn reject_events(&self) {
        self.state.lock().events_rejected = true;
    }

    pub fn fail_pod_reads(&self, key: &str) {
        self.state.lock().failing_pod_reads.insert(key.to_string());
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().nodes.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().calls.clone()
    }

    pub fn deleted_pods(&self) -> Vec<(String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::DeletePod { key, force, .. } => Some((key, force)),
                _ => None,
            })
            .collect()
    }

    pub fn taint_calls(&self) -> Vec<(String, String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Taint {
                    node, key, remove, ..
                } => Some((node, key, remove)),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Event {
                    reason, message, ..
                } => Some((reason, message)),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_volume_attachments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::DeleteVolumeAttachment(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

fn api_unreachable(operation: &'static str) -> Error {
    Error::Timeout {
        operation,
        timeout: Duration::from_millis(1),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let state = self.state.lock();
        let key = format!("{}/{}", namespace, name);
        if state.api_down || state.failing_pod_reads.contains(&key) {
            return Err(api_unreachable("get pod"));
        }
        Ok(state.pods.get(&key).cloned())
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: &str, force: bool) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::DeletePod {
            key: key.clone(),
            uid: uid.to_string(),
            force,
        });
        match state.pods.get(&key) {
            Some(pod) if pod_uid(pod) == uid => {
                state.pods.remove(&key);
                Ok(())
            }
            _ => Err(Error::NotFound {
                kind: "pod",
                name: key,
            }),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let state = self.state.lock();
        if state.api_down {
            return Err(api_unreachable("get node"));
        }
        state.nodes.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: "node",
            name: name.to_string(),
        })
    }

    async fn get_node_with_timeout(&self, _timeout: Duration, name: &str) -> Result<Node> {
        self.get_node(name).await
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.state
            .lock()
            .pvs
            .get(name)
            .cloned()
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
        Ok(self
            .state
            .lock()
            .pvcs
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn get_cached_volume_attachment(
        &self,
        pv_name: &str,
        node_name: &str,
    ) -> Result<Option<VolumeAttachment>> {
        Ok(self
            .state
            .lock()
            .vas
            .values()
            .find(|va| {
                va.spec.node_name == node_name
                    && va.spec.source.persistent_volume_name.as_deref() == Some(pv_name)
            })
            .cloned())
    }

    async fn delete_volume_attachment(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(ClusterCall::DeleteVolumeAttachment(name.to_string()));
        state.vas.remove(name).map(|_| ()).ok_or_else(|| Error::NotFound {
            kind: "volumeattachment",
            name: name.to_string(),
        })
    }

    async fn taint_node(
        &self,
        node_name: &str,
        taint_key: &str,
        effect: TaintEffect,
        remove: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::Taint {
            node: node_name.to_string(),
            key: taint_key.to_string(),
            effect,
            remove,
        });
        let node = state.nodes.get_mut(node_name).ok_or_else(|| Error::NotFound {
            kind: "node",
            name: node_name.to_string(),
        })?;
        if let Some(taints) = updated_taints(node, taint_key, effect, remove) {
            node.spec.get_or_insert_with(Default::default).taints = Some(taints);
        }
        Ok(())
    }

    async fn create_event(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::Event {
            key: pod_key(pod),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        if state.events_rejected {
            return Err(api_unreachable("create event"));
        }
        Ok(())
    }
}

/// Scripted answer to a connectivity check.
#[derive(Debug, Clone)]
pub enum ConnectivityAnswer {
    Connectivity { connected: bool, ios: bool },
    Fail(String),
}

impl ConnectivityAnswer {
    fn into_result(self) -> Result<HostConnectivity> {
        match self {
            ConnectivityAnswer::Connectivity { connected, ios } => Ok(HostConnectivity {
                connected,
                ios_in_progress: ios,
                messages: Vec::new(),
            }),
            ConnectivityAnswer::Fail(message) => Err(Error::Driver(tonic::Status::internal(message))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Validate {
        node_id: String,
        volume_ids: Vec<String>,
    },
    ControllerUnpublish {
        node_id: String,
        volume_id: String,
    },
    NodeUnpublish {
        volume_id: String,
        target_path: String,
    },
    NodeUnstage {
        volume_id: String,
        staging_path: String,
    },
}

pub struct DriverState {
    /// Answers for unscoped checks, consumed in order; `check_default` once drained.
    pub checks: VecDeque<ConnectivityAnswer>,
    pub check_default: ConnectivityAnswer,
    /// Answer for volume-scoped validation during fencing.
    pub validate: ConnectivityAnswer,
    /// Per-volume error messages returned by unpublish calls, consumed in order.
    pub unpublish_errors: HashMap<String, VecDeque<String>>,
    /// Per-volume error messages returned by `NodeUnstageVolume`, consumed in order.
    pub unstage_errors: HashMap<String, VecDeque<String>>,
    /// Every validation call hangs this long before answering.
    pub validate_delay: Option<Duration>,
    pub calls: Vec<DriverCall>,
}

pub struct FakeDriver {
    pub state: Mutex<DriverState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(DriverState {
                checks: VecDeque::new(),
                check_default: ConnectivityAnswer::Connectivity {
                    connected: true,
                    ios: false,
                },
                validate: ConnectivityAnswer::Connectivity {
                    connected: false,
                    ios: false,
                },
                unpublish_errors: HashMap::new(),
                unstage_errors: HashMap::new(),
                validate_delay: None,
                calls: Vec::new(),
            }),
        }
    }
}

impl FakeDriver {
    pub fn push_checks(&self, answers: impl IntoIterator<Item = ConnectivityAnswer>) {
        self.state.lock().checks.extend(answers);
    }

    pub fn set_validate(&self, answer: ConnectivityAnswer) {
        self.state.lock().validate = answer;
    }

    pub fn stall_validate(&self, delay: Duration) {
        self.state.lock().validate_delay = Some(delay);
    }

    pub fn fail_unpublish(&self, volume_id: &str, messages: &[&str]) {
        self.state.lock().unpublish_errors.insert(
            volume_id.to_string(),
            messages.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn fail_unstage(&self, volume_id: &str, messages: &[&str]) {
        self.state.lock().unstage_errors.insert(
            volume_id.to_string(),
            messages.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn controller_unpublishes(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::ControllerUnpublish { node_id, volume_id } => {
                    Some((node_id, volume_id))
                }
                _ => None,
            })
            .collect()
    }

    fn next_unpublish_error(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        next_error(&mut state.unpublish_errors, volume_id)
    }
}

fn next_error(errors: &mut HashMap<String, VecDeque<String>>, volume_id: &str) -> Result<()> {
    match errors.get_mut(volume_id).and_then(|q| q.pop_front()) {
        Some(message) => Err(Error::Driver(tonic::Status::internal(message))),
        None => Ok(()),
    }
}

#[async_trait]
impl DriverApi for FakeDriver {
    async fn validate_volume_host_connectivity(
        &self,
        node_id: &str,
        volume_ids: &[String],
    ) -> Result<HostConnectivity> {
        let (answer, delay) = {
            let mut state = self.state.lock();
            state.calls.push(DriverCall::Validate {
                node_id: node_id.to_string(),
                volume_ids: volume_ids.to_vec(),
            });
            let answer = if volume_ids.is_empty() {
                let default = state.check_default.clone();
                state.checks.pop_front().unwrap_or(default)
            } else {
                state.validate.clone()
            };
            (answer, state.validate_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer.into_result()
    }

    async fn controller_unpublish_volume(&self, node_id: &str, volume_id: &str) -> Result<()> {
        self.state.lock().calls.push(DriverCall::ControllerUnpublish {
            node_id: node_id.to_string(),
            volume_id: volume_id.to_string(),
        });
        self.next_unpublish_error(volume_id)
    }

    async fn node_unpublish_volume(&self, volume_id: &str, target_path: &str) -> Result<()> {
        self.state.lock().calls.push(DriverCall::NodeUnpublish {
            volume_id: volume_id.to_string(),
            target_path: target_path.to_string(),
        });
        self.next_unpublish_error(volume_id)
    }

    async fn node_unstage_volume(&self, volume_id: &str, staging_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::NodeUnstage {
            volume_id: volume_id.to_string(),
            staging_path: staging_path.to_string(),
        });
        next_error(&mut state.unstage_errors, volume_id)
    }
}

/// Settings for a node-mode monitor rooted in a scratch directory.
pub fn node_settings(node_name: &str, pods_root: PathBuf, private_dir: PathBuf) -> MonitorSettings {
    MonitorSettings {
        mode: crate::Mode::Node,
        node_name: node_name.to_string(),
        pods_root,
        private_mount_dir: Some(private_dir),
        ..Default::default()
    }
}
