//! Pod monitor state shared by the controller and node reconcilers.
//!
//! A single [`PodMonitor`] is built at startup and handed (behind an `Arc`)
//! to every background task: the pod and node watches, the array
//! connectivity monitor and, in node mode, the API watchdog.

pub mod array;
pub mod controller;
pub mod node;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::config::{Timings, Tunables};
use crate::driver::{DriverApi, DriverFamily};
use crate::error::Result;
use crate::k8s::ClusterApi;
use crate::mount::Mounter;
use crate::Mode;

/// Taint the node lifecycle controller puts on nodes it cannot reach.
pub const NODE_UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";
/// Suffix of the taint podmon puts on a node it has fenced.
pub const PODMON_TAINT_SUFFIX: &str = "podmon.storage.dell.com";
/// Suffix of the taint marking a node whose driver pod is down.
pub const DRIVER_POD_TAINT_SUFFIX: &str = "podmon-driver-pod.storage.dell.com";
/// Node annotation mapping CSI driver names to their node ids.
pub const CSI_NODE_ID_ANNOTATION: &str = "csi.volume.kubernetes.io/nodeid";
/// Attempts for CSI calls that report `pending`.
pub const CSI_MAX_RETRIES: usize = 3;
/// Deletes issued for a CrashLoopBackOff pod between two Ready observations.
pub const MAX_CRASH_LOOP_RETRY: u32 = 5;

const POD_READY_CONDITION: &str = "Ready";
const POD_INITIALIZED_CONDITION: &str = "Initialized";
const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// Watch event kinds as seen by the reconcilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEvent {
    Added,
    Modified,
    Deleted,
}

/// What the controller keeps about a pod it may have to fence.
#[derive(Debug, Clone)]
pub struct ControllerPodInfo {
    pub pod_key: String,
    pub pod_uid: String,
    /// Node as of the last Ready observation; keeps the CSI node id annotation.
    pub node: Node,
    pub array_ids: Vec<String>,
    pub pod_affinity_labels: BTreeMap<String, String>,
}

/// A CSI filesystem mount belonging to a local pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPathVolumeInfo {
    pub path: PathBuf,
    pub volume_id: String,
    pub pv_name: String,
}

/// A CSI raw block volume published to a local pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPathVolumeInfo {
    pub path: PathBuf,
    pub volume_id: String,
    pub pv_name: String,
}

/// What the node reconciler keeps about a local pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePodInfo {
    pub pod_uid: String,
    pub mounts: Vec<MountPathVolumeInfo>,
    pub devices: Vec<BlockPathVolumeInfo>,
}

/// Static settings of a monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub mode: Mode,
    pub driver_path: String,
    pub own_namespace: String,
    pub node_name: String,
    pub ignore_volumeless_pods: bool,
    pub pods_root: PathBuf,
    pub private_mount_dir: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Controller,
            driver_path: "csi-vxflexos.dellemc.com".to_string(),
            own_namespace: "vxflexos".to_string(),
            node_name: String::new(),
            ignore_volumeless_pods: false,
            pods_root: PathBuf::from("/var/lib/kubelet/pods"),
            private_mount_dir: None,
        }
    }
}

pub struct PodMonitor {
    pub settings: MonitorSettings,
    pub family: DriverFamily,
    pub podmon_taint_key: String,
    pub driver_pod_taint_key: String,
    pub cluster: Arc<dyn ClusterApi>,
    pub driver: Option<Arc<dyn DriverApi>>,
    pub csi_extensions_present: bool,
    pub mounter: Arc<dyn Mounter>,
    pub tunables: Arc<Tunables>,
    pub timings: Timings,
    pub locks: PodLocks,
    pub controller_pods: DashMap<String, ControllerPodInfo>,
    pub crash_loop_counts: DashMap<String, u32>,
    pub node_pods: DashMap<String, NodePodInfo>,
    pub node_uids: DashMap<String, String>,
    pub api_connected: AtomicBool,
}

impl PodMonitor {
    pub fn new(
        settings: MonitorSettings,
        cluster: Arc<dyn ClusterApi>,
        mounter: Arc<dyn Mounter>,
        tunables: Arc<Tunables>,
        timings: Timings,
    ) -> Self {
        let family = DriverFamily::from_driver_path(&settings.driver_path);
        Self {
            podmon_taint_key: format!("{}.{}", family.name(), PODMON_TAINT_SUFFIX),
            driver_pod_taint_key: format!("{}.{}", family.name(), DRIVER_POD_TAINT_SUFFIX),
            settings,
            family,
            cluster,
            driver: None,
            csi_extensions_present: false,
            mounter,
            tunables,
            timings,
            locks: PodLocks::default(),
            controller_pods: DashMap::new(),
            crash_loop_counts: DashMap::new(),
            node_pods: DashMap::new(),
            node_uids: DashMap::new(),
            api_connected: AtomicBool::new(true),
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn DriverApi>, extensions_present: bool) -> Self {
        self.driver = Some(driver);
        self.csi_extensions_present = extensions_present;
        self
    }

    /// Route a watch event to the reconciler for this process's mode.
    pub async fn dispatch_pod_event(self: &Arc<Self>, pod: Pod, event: PodEvent) {
        match self.settings.mode {
            Mode::Controller | Mode::Standalone => {
                match self.controller_mode_pod_handler(&pod, event).await {
                    Ok(Some(request)) => {
                        let monitor = Arc::clone(self);
                        tokio::spawn(async move {
                            monitor.controller_cleanup_pod(&request).await;
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!(pod = %pod_key(&pod), error = %e, "Controller pod handler failed"),
                }
            }
            Mode::Node => {
                if let Err(e) = self.node_mode_pod_handler(&pod, event).await {
                    warn!(pod = %pod_key(&pod), error = %e, "Node pod handler failed");
                }
            }
        }
    }

    /// Run a CSI call, retrying while the driver reports the operation as pending.
    pub(crate) async fn retry_pending<F, Fut>(&self, operation: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_pending() && attempt < CSI_MAX_RETRIES => {
                    debug!(operation = %operation, attempt = attempt, error = %e, "Driver operation pending, retrying");
                    tokio::time::sleep(self.timings.pending_retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `namespace/name`
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

pub fn split_pod_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

pub fn pod_uid(pod: &Pod) -> String {
    pod.metadata.uid.clone().unwrap_or_default()
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Condition-derived pod state the reconcilers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodStatus {
    pub ready: bool,
    pub initialized: bool,
    pub crash_loop: bool,
}

impl PodStatus {
    pub fn of(pod: &Pod) -> Self {
        let mut status = PodStatus {
            ready: false,
            initialized: true,
            crash_loop: false,
        };
        let Some(pod_status) = pod.status.as_ref() else {
            return status;
        };

        for condition in pod_status.conditions.iter().flatten() {
            if condition.type_ == POD_READY_CONDITION {
                status.ready = condition.status == "True";
            }
            if condition.type_ == POD_INITIALIZED_CONDITION {
                status.initialized = condition.status == "True";
            }
        }

        status.crash_loop = pod_status
            .container_statuses
            .iter()
            .flatten()
            .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
            .any(|reason| reason == CRASH_LOOP_BACK_OFF);

        status
    }
}

/// The driver's node id from the `csi.volume.kubernetes.io/nodeid` annotation.
pub fn csi_node_id(node: &Node, driver_path: &str) -> Option<String> {
    let annotation = node.annotations().get(CSI_NODE_ID_ANNOTATION)?;
    match serde_json::from_str::<HashMap<String, String>>(annotation) {
        Ok(ids) => ids.get(driver_path).filter(|id| !id.is_empty()).cloned(),
        Err(e) => {
            warn!(node = %node.name_any(), error = %e, "Could not parse CSI node id annotation");
            None
        }
    }
}

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Per pod-key mutual exclusion. Waiters are served in arrival order.
#[derive(Default, Clone)]
pub struct PodLocks {
    table: Arc<LockTable>,
}

impl PodLocks {
    pub async fn lock(&self, key: &str) -> PodLockGuard {
        let entry = {
            let mut table = self.table.lock();
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;
        PodLockGuard {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }
}

pub struct PodLockGuard {
    table: Arc<LockTable>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PodLockGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        self.guard.take();
        // Only the table's own reference left: nobody holds or waits on this key.
        if table
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            table.remove(&self.key);
        }
    }
}
