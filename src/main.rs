use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

mod config;
mod driver;
mod error;
mod k8s;
mod leader;
mod monitor;
mod mount;

use config::{ConfigDefaults, ConfigWatcher, DriverConfig, LogFormat, LogHandle, Timings, Tunables};
use driver::{CsiDriver, DriverFamily};
use k8s::KubeClient;
use leader::LeaderElector;
use monitor::watch::{label_selector, run_node_watch, run_pod_watch};
use monitor::{MonitorSettings, PodMonitor};
use mount::SystemMounter;

#[allow(clippy::doc_overindented_list_items)]
#[allow(clippy::doc_lazy_continuation)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod podmon_ext {
    tonic::include_proto!("podmon.v1");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Controller,
    Node,
    Standalone,
}

#[derive(Parser, Debug)]
#[command(name = "podmon")]
#[command(about = "Storage-aware pod resiliency monitor")]
struct Args {
    /// Operating mode
    #[arg(long, value_enum, default_value = "controller")]
    mode: Mode,

    /// Driver socket, e.g. unix:/var/run/csi/csi.sock
    #[arg(long)]
    csisock: Option<String>,

    /// Path to a kubeconfig file; in-cluster config when unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Driver name used to pick the driver family and read the CSI node id annotation
    #[arg(long = "driverPath", default_value = "csi-vxflexos.dellemc.com")]
    driver_path: String,

    /// YAML file with the driver ConfigMap parameters
    #[arg(long = "driver-config-params")]
    driver_config_params: PathBuf,

    /// Label key of monitored pods
    #[arg(long = "labelkey", default_value = "podmon.dellemc.com/driver")]
    label_key: String,

    /// Label value of monitored pods
    #[arg(long = "labelvalue", default_value = "csi-vxflexos")]
    label_value: String,

    /// Label key of the driver's node pods
    #[arg(long = "driverPodLabelKey", default_value = "app")]
    driver_pod_label_key: String,

    /// Label value of the driver's node pods
    #[arg(long = "driverPodLabelValue", default_value = "vxflexos-node")]
    driver_pod_label_value: String,

    /// Seconds between array connectivity polls
    #[arg(
        long = "arrayConnectivityPollRate",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    array_connectivity_poll_rate: u64,

    /// Failed polls before a node counts as disconnected from an array
    #[arg(
        long = "arrayConnectivityConnectionLossThreshold",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    array_connectivity_connection_loss_threshold: u32,

    /// Fence pods on NoExecute nodes even when the array reports the node connected
    #[arg(
        long = "skipArrayConnectionValidation",
        action = ArgAction::Set,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    skip_array_connection_validation: bool,

    /// Do not track pods without bound persistent volumes
    #[arg(
        long = "ignoreVolumelessPods",
        action = ArgAction::Set,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    ignore_volumeless_pods: bool,

    /// Run the controller under a Lease
    #[arg(
        long = "leaderelection",
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    leader_election: bool,

    /// Log level, overridden by the config file
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Kubelet pods directory
    #[arg(long, default_value = "/var/lib/kubelet/pods")]
    pods_root: PathBuf,

    /// Seconds between config file change checks
    #[arg(long, default_value_t = 5)]
    config_poll_interval: u64,

    #[arg(long, env = "KUBE_NODE_NAME", hide = true)]
    node_name: Option<String>,

    #[arg(long, env = "MY_POD_NAMESPACE", hide = true)]
    namespace: Option<String>,

    #[arg(long, env = "X_CSI_PRIVATE_MOUNT_DIR", hide = true)]
    private_mount_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // A broken config file is fatal before anything else starts.
    let file_config = DriverConfig::read(&args.driver_config_params, args.mode)?;
    let log_format = file_config.log_format.unwrap_or(LogFormat::Json);
    let log_handle = init_logging(log_format, &args.log_level);

    info!(
        mode = ?args.mode,
        driver = %args.driver_path,
        csisock = ?args.csisock,
        "Starting podmon"
    );

    let node_name = args.node_name.clone().unwrap_or_default();
    let namespace = args.namespace.clone().unwrap_or_default();
    match args.mode {
        Mode::Node if node_name.is_empty() => {
            return Err("KUBE_NODE_NAME is required in node mode".into())
        }
        Mode::Controller if namespace.is_empty() => {
            return Err("MY_POD_NAMESPACE is required in controller mode".into())
        }
        _ => {}
    }

    let tunables = Arc::new(Tunables::new(
        Duration::from_secs(args.array_connectivity_poll_rate),
        args.array_connectivity_connection_loss_threshold,
        args.skip_array_connection_validation,
    ));
    let config_watcher = ConfigWatcher::new(
        args.driver_config_params.clone(),
        args.mode,
        ConfigDefaults {
            poll_rate_secs: args.array_connectivity_poll_rate,
            loss_threshold: args.array_connectivity_connection_loss_threshold,
            skip_array_connection_validation: args.skip_array_connection_validation,
            log_level: args.log_level.clone(),
        },
        tunables.clone(),
        log_format,
    )
    .with_log_handle(log_handle);
    config_watcher.reload()?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let client = kube_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| format!("Failed to create Kubernetes client: {}", e))?;
    let identity = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("podmon-{}", uuid::Uuid::new_v4()));
    let family = DriverFamily::from_driver_path(&args.driver_path);
    let timings = Timings::default();

    let mut leadership = None;
    if args.mode == Mode::Controller && args.leader_election {
        let elector = LeaderElector::new(
            client.clone(),
            &format!("{}-podmon", family.name()),
            &namespace,
            &identity,
        );
        if !elector.acquire(&cancel).await {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        leadership = Some(tokio::spawn(elector.hold(cancel.clone())));
    }

    let cluster = Arc::new(KubeClient::new(
        client.clone(),
        timings.medium_timeout,
        timings.long_timeout,
        identity.clone(),
    ));
    let settings = MonitorSettings {
        mode: args.mode,
        driver_path: args.driver_path.clone(),
        own_namespace: namespace.clone(),
        node_name: node_name.clone(),
        ignore_volumeless_pods: args.ignore_volumeless_pods,
        pods_root: args.pods_root.clone(),
        private_mount_dir: args.private_mount_dir.clone(),
    };
    let mut pod_monitor = PodMonitor::new(
        settings,
        cluster,
        Arc::new(SystemMounter),
        tunables,
        timings.clone(),
    );

    match &args.csisock {
        Some(endpoint) => {
            let driver = match CsiDriver::connect(
                endpoint,
                timings.medium_timeout,
                timings.driver_dial_retry,
                &cancel,
            )
            .await
            {
                Ok(driver) => driver,
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let extensions_present = match args.mode {
                Mode::Node => false,
                Mode::Controller | Mode::Standalone => driver.extension_present().await,
            };
            info!(extensions_present = extensions_present, "Driver connected");
            pod_monitor = pod_monitor.with_driver(Arc::new(driver), extensions_present);
        }
        None => warn!("No --csisock given, driver calls are disabled"),
    }
    let pod_monitor = Arc::new(pod_monitor);

    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(config_watcher.run(
        Duration::from_secs(args.config_poll_interval.max(1)),
        cancel.clone(),
    ))];

    let mut pod_watch = watcher::Config::default();
    if let Some(selector) = label_selector(&args.label_key, &args.label_value) {
        pod_watch = pod_watch.labels(&selector);
    }

    match args.mode {
        Mode::Node => {
            pod_watch = pod_watch.fields(&format!("spec.nodeName={}", node_name));
            info!(node = %node_name, "Running in node mode");
            tasks.push(tokio::spawn(
                pod_monitor.clone().api_monitor_loop(cancel.clone()),
            ));
            tasks.push(tokio::spawn(run_pod_watch(
                pod_monitor.clone(),
                Api::all(client.clone()),
                pod_watch,
                cancel.clone(),
            )));
        }
        Mode::Controller | Mode::Standalone => {
            info!(namespace = %namespace, "Running in {:?} mode", args.mode);
            tasks.push(tokio::spawn(run_node_watch(
                pod_monitor.clone(),
                client.clone(),
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(run_pod_watch(
                pod_monitor.clone(),
                Api::all(client.clone()),
                pod_watch,
                cancel.clone(),
            )));
            if !namespace.is_empty() {
                let mut driver_pods = watcher::Config::default();
                if let Some(selector) =
                    label_selector(&args.driver_pod_label_key, &args.driver_pod_label_value)
                {
                    driver_pods = driver_pods.labels(&selector);
                }
                tasks.push(tokio::spawn(run_pod_watch(
                    pod_monitor.clone(),
                    Api::namespaced(client.clone(), &namespace),
                    driver_pods,
                    cancel.clone(),
                )));
            }
            if pod_monitor.csi_extensions_present {
                tasks.push(tokio::spawn(
                    pod_monitor.clone().array_connectivity_monitor(cancel.clone()),
                ));
            } else {
                info!("Array connectivity monitoring disabled, driver lacks the podmon extension");
            }
        }
    }

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }

    if let Some(leadership) = leadership {
        if leadership.await.unwrap_or(false) {
            return Err("leadership lost".into());
        }
    }
    info!("podmon stopped");
    Ok(())
}

/// JSON or text output with a reloadable level filter.
fn init_logging(format: LogFormat, level: &str) -> LogHandle {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(level));
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
    handle
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, Box<dyn std::error::Error>> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("Shutdown signal received");
    cancel.cancel();
}
