//! Node-mode reconciler.
//!
//! Tracks the CSI mounts and raw block devices of pods scheduled on this node. Once the controller
//! has fenced the node (podmon taint present) and the API is reachable again,
//! the local leftovers of force-deleted pods are unpublished and unstaged, and
//! the taint is lifted so the node can take workloads again.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    pod_key, pod_node_name, pod_uid, split_pod_key, BlockPathVolumeInfo, MountPathVolumeInfo,
    NodePodInfo, PodEvent, PodMonitor,
};
use crate::driver::DriverApi;
use crate::error::{Error, Result};
use crate::k8s::{node_has_taint, TaintEffect};

/// Kubelet subdirectory holding a pod's CSI filesystem volumes.
const CSI_VOLUMES_DIR: &str = "volumes/kubernetes.io~csi";
/// Kubelet subdirectory holding a pod's CSI raw block volumes.
const CSI_DEVICES_DIR: &str = "volumeDevices/kubernetes.io~csi";
const API_CHECK_RETRIES: usize = 3;

impl PodMonitor {
    pub async fn node_mode_pod_handler(&self, pod: &Pod, event: PodEvent) -> Result<()> {
        if pod_node_name(pod) != Some(self.settings.node_name.as_str()) {
            return Ok(());
        }
        let key = pod_key(pod);

        match event {
            PodEvent::Added | PodEvent::Modified => {
                let info = self.scan_pod_volumes(pod).await?;
                debug!(
                    pod = %key,
                    mounts = info.mounts.len(),
                    devices = info.devices.len(),
                    "Tracking local pod"
                );
                self.node_pods.insert(key, info);
            }
            PodEvent::Deleted => {
                // While self-tainted the record is what local cleanup works from.
                let node = self
                    .cluster
                    .get_node_with_timeout(self.timings.medium_timeout, &self.settings.node_name)
                    .await?;
                if node_has_taint(&node, &self.podmon_taint_key, TaintEffect::NoSchedule) {
                    info!(pod = %key, "Node is tainted, keeping pod record for cleanup");
                } else {
                    self.node_pods.remove(&key);
                    debug!(pod = %key, "Stopped tracking local pod");
                }
            }
        }
        Ok(())
    }

    async fn scan_pod_volumes(&self, pod: &Pod) -> Result<NodePodInfo> {
        let uid = pod_uid(pod);
        let pod_dir = self.settings.pods_root.join(&uid);

        let mounts = self
            .scan_csi_dir(pod, &pod_dir.join(CSI_VOLUMES_DIR), true)
            .await?
            .into_iter()
            .map(|(path, volume_id, pv_name)| MountPathVolumeInfo {
                path: path.join("mount"),
                volume_id,
                pv_name,
            })
            .collect();
        let devices = self
            .scan_csi_dir(pod, &pod_dir.join(CSI_DEVICES_DIR), false)
            .await?
            .into_iter()
            .map(|(path, volume_id, pv_name)| BlockPathVolumeInfo {
                path,
                volume_id,
                pv_name,
            })
            .collect();

        Ok(NodePodInfo {
            pod_uid: uid,
            mounts,
            devices,
        })
    }

    /// `(entry path, volume handle, PV name)` per PV entry of `dir`, ordered by PV name.
    async fn scan_csi_dir(
        &self,
        pod: &Pod,
        dir: &Path,
        dirs_only: bool,
    ) -> Result<Vec<(PathBuf, String, String)>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if dirs_only && !entry.file_type().await?.is_dir() {
                continue;
            }
            let pv_name = entry.file_name().to_string_lossy().into_owned();
            let volume_id = match self.cluster.get_persistent_volume(&pv_name).await {
                Ok(pv) => pv
                    .spec
                    .and_then(|s| s.csi)
                    .map(|csi| csi.volume_handle)
                    .unwrap_or_default(),
                Err(e) => {
                    error!(pod = %pod_key(pod), pv = %pv_name, error = %e, "Could not get persistent volume");
                    continue;
                }
            };
            if volume_id.is_empty() {
                debug!(pv = %pv_name, "Not a CSI volume");
                continue;
            }
            found.push((entry.path(), volume_id, pv_name));
        }
        found.sort_by(|a, b| a.2.cmp(&b.2));
        Ok(found)
    }

    /// Clean up every tracked pod the controller has deleted. Returns whether the taint was removed.
    pub async fn node_mode_cleanup_pods(&self, node: &Node) -> bool {
        let tracked: Vec<(String, NodePodInfo)> = self
            .node_pods
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut skipped = 0;
        let mut failed = 0;
        for (key, info) in tracked {
            let (namespace, name) = split_pod_key(&key);
            match self.cluster.get_pod(namespace, name).await {
                Ok(Some(current))
                    if pod_uid(&current) == info.pod_uid
                        && pod_node_name(&current) == Some(self.settings.node_name.as_str()) =>
                {
                    info!(pod = %key, "Pod still exists, skipping local cleanup");
                    skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pod = %key, error = %e, "Could not check pod, cleaning up anyway");
                }
            }

            let _guard = self.locks.lock(&key).await;
            match self.node_mode_cleanup_pod(&key, &info).await {
                Ok(()) => {
                    info!(pod = %key, uid = %info.pod_uid, "Cleaned up local pod");
                    self.node_pods.remove(&key);
                }
                Err(e) => {
                    error!(pod = %key, error = %e, "Local pod cleanup failed");
                    failed += 1;
                }
            }
        }

        if skipped > 0 || failed > 0 {
            info!(skipped = skipped, failed = failed, "Node cleanup incomplete, keeping taint");
            return false;
        }

        let node_name = node.name_any();
        match self
            .cluster
            .taint_node(&node_name, &self.podmon_taint_key, TaintEffect::NoSchedule, true)
            .await
        {
            Ok(()) => {
                info!(node = %node_name, "Node cleanup complete, removed podmon taint");
                true
            }
            Err(e) => {
                error!(node = %node_name, error = %e, "Could not remove podmon taint");
                false
            }
        }
    }

    /// Tear down every volume of one pod. The first error is returned once all volumes were tried.
    async fn node_mode_cleanup_pod(&self, key: &str, info: &NodePodInfo) -> Result<()> {
        let driver = self.driver.as_deref().ok_or(Error::DriverUnavailable)?;
        let private_dir = self.settings.private_mount_dir.as_deref();
        let mut first_error = None;

        for mount in &info.mounts {
            if let Err(e) = self.node_unpublish(driver, key, &mount.volume_id, &mount.path).await {
                first_error.get_or_insert(e);
                continue;
            }
            if let Some(staging) = self
                .family
                .staging_dir(private_dir, &mount.volume_id, &mount.pv_name)
            {
                if let Err(e) = self.node_unstage(driver, key, &mount.volume_id, &staging).await {
                    first_error.get_or_insert(e);
                }
            }
            if let Some(root) = self.family.private_mount_root(private_dir) {
                if let Err(e) = self.remove_private_mount(&root.join(&mount.volume_id)) {
                    error!(pod = %key, volume = %mount.volume_id, error = %e, "Private mount teardown failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        for device in &info.devices {
            if let Err(e) = self.node_unpublish(driver, key, &device.volume_id, &device.path).await {
                first_error.get_or_insert(e);
                continue;
            }
            if let Some(staging) = self.family.staging_block_dir(&device.pv_name) {
                if let Err(e) = self.node_unstage(driver, key, &device.volume_id, &staging).await {
                    first_error.get_or_insert(e);
                }
            }
            if let Some(dev) = self.family.private_block_dev(&device.pv_name, &info.pod_uid) {
                if let Err(e) = self.remove_private_device(&dev) {
                    error!(pod = %key, volume = %device.volume_id, error = %e, "Private block device teardown failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn node_unpublish(
        &self,
        driver: &dyn DriverApi,
        key: &str,
        volume_id: &str,
        target: &Path,
    ) -> Result<()> {
        let target = target.to_string_lossy();
        let result = self
            .retry_pending("NodeUnpublishVolume", || {
                driver.node_unpublish_volume(volume_id, &target)
            })
            .await;
        if let Err(e) = &result {
            error!(pod = %key, volume = %volume_id, path = %target, error = %e, "NodeUnpublishVolume failed");
        }
        result
    }

    async fn node_unstage(
        &self,
        driver: &dyn DriverApi,
        key: &str,
        volume_id: &str,
        staging: &Path,
    ) -> Result<()> {
        let staging = staging.to_string_lossy();
        let result = self
            .retry_pending("NodeUnstageVolume", || {
                driver.node_unstage_volume(volume_id, &staging)
            })
            .await;
        if let Err(e) = &result {
            error!(pod = %key, volume = %volume_id, path = %staging, error = %e, "NodeUnstageVolume failed");
        }
        result
    }

    fn remove_private_mount(&self, target: &Path) -> Result<()> {
        self.mounter.unmount(target)?;
        self.mounter.remove_dir(target)?;
        debug!(path = %target.display(), "Removed private mount");
        Ok(())
    }

    /// A device node that is no longer mounted is still removed.
    fn remove_private_device(&self, device: &Path) -> Result<()> {
        if let Err(e) = self.mounter.unmount(device) {
            warn!(path = %device.display(), error = %e, "Could not unmount private block device");
        }
        self.mounter.remove_file(device)?;
        debug!(path = %device.display(), "Removed private block device");
        Ok(())
    }

    /// Watchdog: cleans up once the API is reachable and the node carries the podmon taint.
    pub async fn api_monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(node = %self.settings.node_name, "API monitor started");
        loop {
            self.api_monitor_iteration().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("API monitor stopped");
                    return;
                }
                _ = tokio::time::sleep(self.timings.api_check_interval) => {}
            }
        }
    }

    /// One watchdog check. Returns the node when the API answered.
    pub async fn api_monitor_iteration(&self) -> Option<Node> {
        let node_name = &self.settings.node_name;
        let mut result = self
            .cluster
            .get_node_with_timeout(self.timings.api_check_first_try_timeout, node_name)
            .await;
        for attempt in 1..=API_CHECK_RETRIES {
            let Err(e) = &result else {
                break;
            };
            debug!(node = %node_name, attempt = attempt, error = %e, "API check failed, retrying");
            tokio::time::sleep(self.timings.api_check_retry_timeout).await;
            result = self
                .cluster
                .get_node_with_timeout(self.timings.api_check_retry_timeout, node_name)
                .await;
        }

        match result {
            Ok(node) => {
                if !self.api_connected.swap(true, Ordering::SeqCst) {
                    info!(node = %node_name, "API connectivity restored");
                }
                if node_has_taint(&node, &self.podmon_taint_key, TaintEffect::NoSchedule) {
                    info!(node = %node_name, "Node carries podmon taint, cleaning up pods");
                    self.node_mode_cleanup_pods(&node).await;
                }
                Some(node)
            }
            Err(e) => {
                if self.api_connected.swap(false, Ordering::SeqCst) {
                    warn!(node = %node_name, error = %e, "Lost API connectivity from node");
                }
                None
            }
        }
    }
}
