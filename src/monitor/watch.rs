//! Pod and node watches.
//!
//! Watch events are turned into [`PodEvent`]s and handed to the reconcilers.
//! Events for the same pod are handled strictly one after another; different
//! pods are handled concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pod_key, PodEvent, PodMonitor};

/// Turns raw watch events into Added/Modified/Deleted.
#[derive(Default)]
pub struct EventClassifier {
    known: HashSet<String>,
}

impl EventClassifier {
    pub fn classify(&mut self, event: Event<Pod>) -> Vec<(Pod, PodEvent)> {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                let kind = if self.known.insert(pod_key(&pod)) {
                    PodEvent::Added
                } else {
                    PodEvent::Modified
                };
                vec![(pod, kind)]
            }
            Event::Delete(pod) => {
                self.known.remove(&pod_key(&pod));
                vec![(pod, PodEvent::Deleted)]
            }
            // A relist replays every live pod; keys from before it may be gone.
            Event::Init => {
                self.known.clear();
                Vec::new()
            }
            Event::InitDone => Vec::new(),
        }
    }
}

/// Per pod key handler chain: each event waits for the previous one of the same pod.
#[derive(Default)]
struct PodQueues {
    tails: HashMap<String, JoinHandle<()>>,
}

impl PodQueues {
    fn dispatch(&mut self, monitor: &Arc<PodMonitor>, pod: Pod, event: PodEvent) {
        self.tails.retain(|_, handle| !handle.is_finished());

        let key = pod_key(&pod);
        let previous = self.tails.remove(&key);
        let monitor = Arc::clone(monitor);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            monitor.dispatch_pod_event(pod, event).await;
        });
        self.tails.insert(key, handle);
    }
}

/// Watch pods and feed the reconciler until cancelled. Reconnects after errors.
pub async fn run_pod_watch(
    monitor: Arc<PodMonitor>,
    api: Api<Pod>,
    config: watcher::Config,
    cancel: CancellationToken,
) {
    let mut classifier = EventClassifier::default();
    let mut queues = PodQueues::default();
    let restart_delay = monitor.timings.monitor_restart_delay;

    info!(labels = ?config.label_selector, fields = ?config.field_selector, "Pod watch started");
    let mut stream = watcher::watcher(api.clone(), config.clone()).boxed();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Pod watch stopped");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                for (pod, kind) in classifier.classify(event) {
                    debug!(pod = %pod_key(&pod), event = ?kind, "Pod watch event");
                    queues.dispatch(&monitor, pod, kind);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, delay_secs = restart_delay.as_secs(), "Pod watch failed, restarting");
                tokio::time::sleep(restart_delay).await;
            }
            None => {
                warn!("Pod watch ended, restarting");
                tokio::time::sleep(restart_delay).await;
                stream = watcher::watcher(api.clone(), config.clone()).boxed();
            }
        }
    }
}

/// Watch nodes (controller mode) and keep node state fresh.
pub async fn run_node_watch(monitor: Arc<PodMonitor>, client: Client, cancel: CancellationToken) {
    let api: Api<Node> = Api::all(client);
    let restart_delay = monitor.timings.monitor_restart_delay;

    info!("Node watch started");
    let mut stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Node watch stopped");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Event::Apply(node))) | Some(Ok(Event::InitApply(node))) => {
                monitor.controller_mode_node_handler(&node).await;
            }
            Some(Ok(Event::Delete(node))) => {
                info!(node = %node.name_any(), "Node deleted");
                monitor.node_uids.remove(&node.name_any());
            }
            Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
            Some(Err(e)) => {
                warn!(error = %e, delay_secs = restart_delay.as_secs(), "Node watch failed, restarting");
                tokio::time::sleep(restart_delay).await;
            }
            None => {
                warn!("Node watch ended, restarting");
                tokio::time::sleep(restart_delay).await;
                stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();
            }
        }
    }
}

/// `key=value`, or no selector when the key is empty.
pub fn label_selector(key: &str, value: &str) -> Option<String> {
    if key.is_empty() {
        None
    } else {
        Some(format!("{}={}", key, value))
    }
}
