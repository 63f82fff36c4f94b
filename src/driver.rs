//! Storage driver facade.
//!
//! podmon talks to the CSI driver over the driver's own Unix socket. Besides
//! the standard controller/node unpublish calls it uses the podmon vendor
//! extension `ValidateVolumeHostConnectivity`, which asks the array whether a
//! host still has a path to it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

use crate::csi::controller_client::ControllerClient;
use crate::csi::node_client::NodeClient;
use crate::csi::{
    ControllerUnpublishVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};
use crate::error::{Error, Result};
use crate::podmon_ext::podmon_client::PodmonClient;
use crate::podmon_ext::ValidateVolumeHostConnectivityRequest;

/// Kubelet root the staging paths below are anchored on.
const KUBELET_ROOT: &str = "/var/lib/kubelet";
/// Default PowerFlex private mount root when `X_CSI_PRIVATE_MOUNT_DIR` is unset.
const VXFLEX_PRIVATE_MOUNT_DIR: &str = "/var/lib/kubelet/plugins/vxflexos.emc.dell.com/disks";

/// Storage driver family, picked from the `--driverPath` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFamily {
    Vxflex,
    Unity,
    PowerScale,
    PowerStore,
    PowerMax,
}

impl DriverFamily {
    pub fn from_driver_path(driver_path: &str) -> Self {
        if driver_path.contains("unity") {
            DriverFamily::Unity
        } else if driver_path.contains("isilon") || driver_path.contains("powerscale") {
            DriverFamily::PowerScale
        } else if driver_path.contains("powerstore") {
            DriverFamily::PowerStore
        } else if driver_path.contains("powermax") {
            DriverFamily::PowerMax
        } else {
            DriverFamily::Vxflex
        }
    }

    /// Short driver name used to build taint keys.
    pub fn name(&self) -> &'static str {
        match self {
            DriverFamily::Vxflex => "vxflexos",
            DriverFamily::Unity => "unity",
            DriverFamily::PowerScale => "isilon",
            DriverFamily::PowerStore => "powerstore",
            DriverFamily::PowerMax => "powermax",
        }
    }

    /// Root under which the driver keeps per-volume private mounts.
    pub fn private_mount_root(&self, configured: Option<&Path>) -> Option<PathBuf> {
        if let Some(dir) = configured {
            return Some(dir.to_path_buf());
        }
        match self {
            DriverFamily::Vxflex => Some(PathBuf::from(VXFLEX_PRIVATE_MOUNT_DIR)),
            _ => None,
        }
    }

    /// Staging path handed to `NodeUnstageVolume`, if the family stages volumes.
    pub fn staging_dir(
        &self,
        configured: Option<&Path>,
        volume_id: &str,
        pv_name: &str,
    ) -> Option<PathBuf> {
        match self {
            DriverFamily::Vxflex => self
                .private_mount_root(configured)
                .map(|root| root.join(volume_id)),
            DriverFamily::Unity | DriverFamily::PowerStore | DriverFamily::PowerMax => Some(
                Path::new(KUBELET_ROOT)
                    .join("plugins/kubernetes.io/csi/pv")
                    .join(pv_name)
                    .join("globalmount"),
            ),
            DriverFamily::PowerScale => None,
        }
    }

    /// Staging path of a raw block volume.
    pub fn staging_block_dir(&self, pv_name: &str) -> Option<PathBuf> {
        match self {
            DriverFamily::PowerScale => None,
            _ => Some(
                Path::new(KUBELET_ROOT)
                    .join("plugins/kubernetes.io/csi/volumeDevices/staging")
                    .join(pv_name),
            ),
        }
    }

    /// Per-pod device node the kubelet publishes a raw block volume to.
    pub fn private_block_dev(&self, pv_name: &str, pod_uid: &str) -> Option<PathBuf> {
        match self {
            DriverFamily::PowerScale => None,
            _ => Some(
                Path::new(KUBELET_ROOT)
                    .join("plugins/kubernetes.io/csi/volumeDevices/publish")
                    .join(pv_name)
                    .join(pod_uid),
            ),
        }
    }
}

/// Answer of `ValidateVolumeHostConnectivity`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConnectivity {
    pub connected: bool,
    pub ios_in_progress: bool,
    pub messages: Vec<String>,
}

#[async_trait]
pub trait DriverApi: Send + Sync {
    /// Ask the array whether `node_id` is connected, optionally scoped to volumes.
    async fn validate_volume_host_connectivity(
        &self,
        node_id: &str,
        volume_ids: &[String],
    ) -> Result<HostConnectivity>;

    async fn controller_unpublish_volume(&self, node_id: &str, volume_id: &str) -> Result<()>;

    async fn node_unpublish_volume(&self, volume_id: &str, target_path: &str) -> Result<()>;

    async fn node_unstage_volume(&self, volume_id: &str, staging_path: &str) -> Result<()>;
}

/// gRPC client for a driver listening on a Unix socket.
#[derive(Clone)]
pub struct CsiDriver {
    channel: Channel,
    timeout: Duration,
}

impl CsiDriver {
    /// Dial the driver, retrying until it answers or `cancel` fires.
    ///
    /// The driver opens its socket only once it is up (and, for controllers,
    /// leader), so the first attempts routinely fail.
    pub async fn connect(
        endpoint: &str,
        timeout: Duration,
        retry: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let path = socket_path(endpoint);
        loop {
            match dial(&path).await {
                Ok(channel) => {
                    info!(socket = %path.display(), "Connected to driver");
                    return Ok(Self { channel, timeout });
                }
                Err(e) => {
                    warn!(
                        socket = %path.display(),
                        error = %e,
                        retry_secs = retry.as_secs(),
                        "Waiting on connection to driver socket"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::DriverUnavailable),
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Whether the driver implements the podmon extension.
    pub async fn extension_present(&self) -> bool {
        match self.validate_volume_host_connectivity("", &[]).await {
            Ok(_) => true,
            Err(Error::Driver(status)) if status.code() == tonic::Code::Unimplemented => {
                info!("Driver does not implement ValidateVolumeHostConnectivity");
                false
            }
            Err(e) => {
                // Any other answer means the RPC is routed; the empty request is just invalid.
                debug!(error = %e, "ValidateVolumeHostConnectivity presence check returned an error");
                true
            }
        }
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(Error::Driver(status)),
            Err(_) => Err(Error::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl DriverApi for CsiDriver {
    async fn validate_volume_host_connectivity(
        &self,
        node_id: &str,
        volume_ids: &[String],
    ) -> Result<HostConnectivity> {
        let mut client = PodmonClient::new(self.channel.clone());
        let request = ValidateVolumeHostConnectivityRequest {
            node_id: node_id.to_string(),
            volume_ids: volume_ids.to_vec(),
        };
        debug!(node_id = %node_id, volumes = ?volume_ids, "Calling ValidateVolumeHostConnectivity");
        let response = self
            .call(
                "ValidateVolumeHostConnectivity",
                client.validate_volume_host_connectivity(request),
            )
            .await?;
        Ok(HostConnectivity {
            connected: response.connected,
            ios_in_progress: response.ios_in_progress,
            messages: response.messages,
        })
    }

    async fn controller_unpublish_volume(&self, node_id: &str, volume_id: &str) -> Result<()> {
        let mut client = ControllerClient::new(self.channel.clone());
        let request = ControllerUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            node_id: node_id.to_string(),
            secrets: Default::default(),
        };
        self.call(
            "ControllerUnpublishVolume",
            client.controller_unpublish_volume(request),
        )
        .await?;
        Ok(())
    }

    async fn node_unpublish_volume(&self, volume_id: &str, target_path: &str) -> Result<()> {
        let mut client = NodeClient::new(self.channel.clone());
        let request = NodeUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            target_path: target_path.to_string(),
        };
        self.call("NodeUnpublishVolume", client.node_unpublish_volume(request))
            .await?;
        Ok(())
    }

    async fn node_unstage_volume(&self, volume_id: &str, staging_path: &str) -> Result<()> {
        let mut client = NodeClient::new(self.channel.clone());
        let request = NodeUnstageVolumeRequest {
            volume_id: volume_id.to_string(),
            staging_target_path: staging_path.to_string(),
        };
        self.call("NodeUnstageVolume", client.node_unstage_volume(request))
            .await?;
        Ok(())
    }
}

/// Accepts `unix:/path`, `unix:///path` or a bare path.
fn socket_path(endpoint: &str) -> PathBuf {
    let trimmed = endpoint
        .strip_prefix("unix://")
        .or_else(|| endpoint.strip_prefix("unix:"))
        .unwrap_or(endpoint);
    PathBuf::from(trimmed)
}

async fn dial(path: &Path) -> Result<Channel> {
    let socket_path = path.to_path_buf();
    // The URI is ignored by the connector; tonic only needs a syntactically valid one.
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = socket_path.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
            }
        }))
        .await?;
    Ok(channel)
}
