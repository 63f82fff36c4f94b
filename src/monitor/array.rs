//! Array connectivity monitor.
//!
//! Every poll cycle checks each (node, array) pair used by a tracked pod once.
//! A pair counts as disconnected only after `loss_threshold` negative samples
//! in a row; pods on such a node are fenced, co-scheduled pods as a group.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{CleanupReason, FenceRequest};
use super::{pod_node_name, pod_uid, split_pod_key, ControllerPodInfo, PodMonitor};
use crate::k8s::TaintEffect;

/// Poll rates below this stop the monitor after one cycle.
const MIN_POLL_RATE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityEntry {
    /// Checked during the current cycle.
    pub sampled: bool,
    /// Negative samples since the last positive one.
    pub loss_count: u32,
}

/// `(node, array)` connectivity with debounce. Owned by the monitor loop.
#[derive(Debug, Default)]
pub struct ConnectivityCache {
    entries: HashMap<(String, String), ConnectivityEntry>,
}

impl ConnectivityCache {
    /// Start a new cycle: every pair is checked again on next use.
    pub fn reset_sampled(&mut self) {
        for entry in self.entries.values_mut() {
            entry.sampled = false;
        }
    }

    pub fn entry(&self, node_name: &str, array_id: &str) -> Option<ConnectivityEntry> {
        self.entries
            .get(&(node_name.to_string(), array_id.to_string()))
            .copied()
    }

    pub fn record(&mut self, node_name: &str, array_id: &str, connected: bool) {
        let entry = self
            .entries
            .entry((node_name.to_string(), array_id.to_string()))
            .or_default();
        entry.sampled = true;
        if connected {
            entry.loss_count = 0;
        } else {
            entry.loss_count = entry.loss_count.saturating_add(1);
        }
    }

    /// Connected unless the loss count reached the threshold.
    pub fn is_connected(&self, node_name: &str, array_id: &str, threshold: u32) -> bool {
        self.entry(node_name, array_id)
            .map(|e| e.loss_count < threshold)
            .unwrap_or(true)
    }

    /// Check `node` at most once per cycle and report the debounced answer.
    pub async fn check_connectivity(
        &mut self,
        monitor: &PodMonitor,
        node: &Node,
        array_id: &str,
    ) -> bool {
        let node_name = node.name_any();
        let threshold = monitor.tunables.loss_threshold();
        if self
            .entry(&node_name, array_id)
            .is_some_and(|e| e.sampled)
        {
            return self.is_connected(&node_name, array_id, threshold);
        }

        match monitor
            .call_validate_volume_host_connectivity(node, &[])
            .await
        {
            Ok(connectivity) => {
                self.record(&node_name, array_id, connectivity.connected);
                debug!(
                    node = %node_name,
                    array = %array_id,
                    connected = connectivity.connected,
                    loss_count = self.entry(&node_name, array_id).map(|e| e.loss_count).unwrap_or(0),
                    "Array connectivity sample"
                );
            }
            Err(e) => {
                // Fail open: a failed check must not evict anything.
                warn!(node = %node_name, array = %array_id, error = %e, "Connectivity check failed, assuming connected");
                return true;
            }
        }
        self.is_connected(&node_name, array_id, threshold)
    }
}

impl PodMonitor {
    /// Background loop; exits on cancellation or when the poll rate disables it.
    pub async fn array_connectivity_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut cache = ConnectivityCache::default();
        info!("Array connectivity monitor started");
        loop {
            let fenced = self.array_monitor_cycle(&mut cache).await;
            if fenced > 0 {
                info!(pods = fenced, "Array connectivity monitor fenced pods");
            }

            let poll_rate = self.tunables.poll_rate();
            if poll_rate < MIN_POLL_RATE {
                info!("Array connectivity monitor disabled by poll rate");
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Array connectivity monitor stopped");
                    return;
                }
                _ = tokio::time::sleep(poll_rate) => {}
            }
        }
    }

    /// One poll cycle. Returns the number of pods deleted.
    pub async fn array_monitor_cycle(&self, cache: &mut ConnectivityCache) -> usize {
        cache.reset_sampled();

        let mut tracked: Vec<ControllerPodInfo> = self
            .controller_pods
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracked.sort_by(|a, b| a.pod_key.cmp(&b.pod_key));

        let mut to_clean = Vec::new();
        let mut nodes_to_taint: BTreeSet<String> = BTreeSet::new();
        for info in tracked {
            let mut connected = true;
            for array_id in &info.array_ids {
                if !cache.check_connectivity(self, &info.node, array_id).await {
                    info!(pod = %info.pod_key, node = %info.node.name_any(), array = %array_id, "Node lost connectivity to array");
                    connected = false;
                }
            }
            if !connected {
                nodes_to_taint.insert(info.node.name_any());
                to_clean.push(info);
            }
        }

        for node_name in &nodes_to_taint {
            if let Err(e) = self
                .cluster
                .taint_node(node_name, &self.podmon_taint_key, TaintEffect::NoSchedule, false)
                .await
            {
                warn!(node = %node_name, error = %e, "Could not taint node");
            }
        }

        let mut handled: HashSet<String> = HashSet::new();
        let mut fenced = 0;
        for info in &to_clean {
            if handled.contains(&info.pod_key) {
                continue;
            }
            let group: Vec<&ControllerPodInfo> = if info.pod_affinity_labels.is_empty() {
                vec![info]
            } else {
                to_clean
                    .iter()
                    .filter(|other| other.pod_affinity_labels == info.pod_affinity_labels)
                    .filter(|other| !handled.contains(&other.pod_key))
                    .collect()
            };
            for member in &group {
                handled.insert(member.pod_key.clone());
            }
            if group.len() > 1 {
                info!(pods = ?group.iter().map(|g| &g.pod_key).collect::<Vec<_>>(), "Fencing pod affinity group");
            }

            let results = join_all(group.into_iter().map(|g| self.fence_for_array_loss(g))).await;
            fenced += results.into_iter().filter(|done| *done).count();
        }
        fenced
    }

    async fn fence_for_array_loss(&self, info: &ControllerPodInfo) -> bool {
        let (namespace, name) = split_pod_key(&info.pod_key);
        let node_name = info.node.name_any();
        let pod = match self.cluster.get_pod(namespace, name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                debug!(pod = %info.pod_key, "Pod gone before array loss cleanup");
                return false;
            }
            Err(e) => {
                warn!(pod = %info.pod_key, error = %e, "Could not re-read pod");
                return false;
            }
        };

        if pod_uid(&pod) != info.pod_uid || pod_node_name(&pod) != Some(node_name.as_str()) {
            info!(pod = %info.pod_key, node = %node_name, "Pod moved or was replaced, skipping array loss cleanup");
            return false;
        }

        let request = FenceRequest {
            pod,
            node: info.node.clone(),
            reason: CleanupReason::ArrayConnectivityLoss,
            taint_noexec: false,
            taint_podmon: true,
        };
        self.controller_cleanup_pod(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::monitor::testing::{
        monitor, node, pod, pv, FakeCluster, FakeDriver, NoopMounter, ConnectivityAnswer, DRIVER_PATH,
    };
    use crate::monitor::{MonitorSettings, PodEvent};

    const PODMON_TAINT: &str = "vxflexos.podmon.storage.dell.com";

    fn disconnected() -> ConnectivityAnswer {
        ConnectivityAnswer::Connectivity {
            connected: false,
            ios: false,
        }
    }

    fn connected() -> ConnectivityAnswer {
        ConnectivityAnswer::Connectivity {
            connected: true,
            ios: false,
        }
    }

    /// Ready pods on `n1`, each with one volume on array `A`.
    async fn tracked_setup(
        pods: &[(&str, &str)],
        affinity: &[(&str, &str)],
    ) -> (Arc<FakeCluster>, Arc<FakeDriver>, Arc<PodMonitor>) {
        let cluster = Arc::new(FakeCluster::default());
        let driver = Arc::new(FakeDriver::default());
        let monitor = monitor(
            MonitorSettings::default(),
            cluster.clone(),
            driver.clone(),
            Arc::new(NoopMounter),
        );
        cluster.add_node(node("n1").csi_node_id(DRIVER_PATH, "n1").build());

        for (name, pv_name) in pods {
            let claim = cluster.add_volume("ns1", pv(pv_name, pv_name, &[("StorageSystem", "A")]));
            let mut builder = pod("ns1", name, &format!("uid-{}", name), "n1")
                .claim(&claim)
                .ready(true);
            if !affinity.is_empty() {
                builder = builder.affinity(affinity);
            }
            let p = builder.build();
            cluster.add_pod(p.clone());
            monitor
                .controller_mode_pod_handler(&p, PodEvent::Added)
                .await
                .unwrap();
        }
        // Tracking itself must not call the driver
        driver.state.lock().calls.clear();
        (cluster, driver, monitor)
    }

    #[test]
    fn test_cache_debounce() {
        let mut cache = ConnectivityCache::default();
        assert!(cache.is_connected("n1", "A", 3));

        cache.record("n1", "A", false);
        cache.record("n1", "A", false);
        assert!(cache.is_connected("n1", "A", 3));
        cache.record("n1", "A", true);
        assert_eq!(cache.entry("n1", "A").unwrap().loss_count, 0);

        for _ in 0..3 {
            cache.record("n1", "A", false);
        }
        assert!(!cache.is_connected("n1", "A", 3));
        assert!(cache.is_connected("n1", "B", 3));

        assert!(cache.entry("n1", "A").unwrap().sampled);
        cache.reset_sampled();
        let entry = cache.entry("n1", "A").unwrap();
        assert!(!entry.sampled);
        assert_eq!(entry.loss_count, 3);
    }

    #[tokio::test]
    async fn test_debounce_fences_after_threshold() {
        let (cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        driver.push_checks([disconnected(), disconnected(), disconnected()]);
        let mut cache = ConnectivityCache::default();

        assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 0);
        assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 0);
        assert!(cluster.taint_calls().is_empty());
        assert!(cluster.deleted_pods().is_empty());

        assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 1);
        assert_eq!(
            cluster.taint_calls()[0],
            ("n1".to_string(), PODMON_TAINT.to_string(), false)
        );
        assert_eq!(cluster.deleted_pods(), vec![("ns1/p".to_string(), true)]);
        let (reason, _) = cluster.events().pop().unwrap();
        assert_eq!(reason, "ArrayConnectivityLoss");
        assert!(monitor.controller_pods.is_empty());
    }

    #[tokio::test]
    async fn test_positive_sample_resets_debounce() {
        let (cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        driver.push_checks([disconnected(), disconnected(), connected(), disconnected()]);
        let mut cache = ConnectivityCache::default();

        for _ in 0..4 {
            assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 0);
        }
        assert!(cluster.taint_calls().is_empty());
        assert!(cluster.deleted_pods().is_empty());
        assert_eq!(cache.entry("n1", "A").unwrap().loss_count, 1);
    }

    #[tokio::test]
    async fn test_check_error_fails_open() {
        let (cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        driver.push_checks([
            disconnected(),
            ConnectivityAnswer::Fail("driver bug".to_string()),
            disconnected(),
        ]);
        let mut cache = ConnectivityCache::default();

        for _ in 0..3 {
            monitor.array_monitor_cycle(&mut cache).await;
        }
        assert_eq!(cache.entry("n1", "A").unwrap().loss_count, 2);
        assert!(cluster.deleted_pods().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_check_fails_open_within_short_timeout() {
        let (cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        driver.push_checks([disconnected(), disconnected(), disconnected()]);
        driver.stall_validate(Duration::from_secs(5));
        let mut cache = ConnectivityCache::default();

        let started = std::time::Instant::now();
        for _ in 0..3 {
            assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 0);
        }
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(driver.calls().len(), 3);
        assert!(cache.entry("n1", "A").is_none());
        assert!(cluster.deleted_pods().is_empty());
    }

    #[tokio::test]
    async fn test_one_check_per_node_per_cycle() {
        let (_cluster, driver, monitor) =
            tracked_setup(&[("p", "pv1"), ("q", "pv2")], &[]).await;
        let mut cache = ConnectivityCache::default();

        monitor.array_monitor_cycle(&mut cache).await;
        assert_eq!(driver.calls().len(), 1);
        monitor.array_monitor_cycle(&mut cache).await;
        assert_eq!(driver.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_affinity_group_fenced_together() {
        let (cluster, driver, monitor) =
            tracked_setup(&[("p", "pv1"), ("q", "pv2")], &[("app", "x")]).await;
        driver.push_checks([disconnected(), disconnected(), disconnected()]);
        let mut cache = ConnectivityCache::default();

        monitor.array_monitor_cycle(&mut cache).await;
        monitor.array_monitor_cycle(&mut cache).await;
        assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 2);

        let mut deleted = cluster.deleted_pods();
        deleted.sort();
        assert_eq!(
            deleted,
            vec![("ns1/p".to_string(), true), ("ns1/q".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_moved_pod_is_not_fenced() {
        let (cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        monitor.tunables.set_loss_threshold(1);
        driver.push_checks([disconnected()]);
        cluster.add_pod(
            pod("ns1", "p", "uid-p", "n2")
                .claim("pv1-claim")
                .ready(true)
                .build(),
        );

        let mut cache = ConnectivityCache::default();
        assert_eq!(monitor.array_monitor_cycle(&mut cache).await, 0);
        assert!(cluster.deleted_pods().is_empty());
        // The node is still tainted; it did lose the array
        assert_eq!(cluster.taint_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_loop_exits_on_tiny_poll_rate() {
        let (_cluster, driver, monitor) = tracked_setup(&[("p", "pv1")], &[]).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            monitor.clone().array_connectivity_monitor(CancellationToken::new()),
        )
        .await
        .expect("monitor loop should exit");
        assert_eq!(driver.calls().len(), 1);
    }
}
