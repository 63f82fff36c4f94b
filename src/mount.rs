use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::MntFlags;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Local filesystem operations used by node cleanup.
#[cfg_attr(test, automock)]
pub trait Mounter: Send + Sync {
    /// Unmount `path`. A path that is not mounted (or does not exist) is not an error.
    fn unmount(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty mount point directory. A missing directory is not an error.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove a block device node. A missing file is not an error.
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Real mount syscalls via nix.
pub struct SystemMounter;

impl SystemMounter {
    fn is_mounted(path: &Path) -> io::Result<bool> {
        let mounts = proc_mounts::MountList::new()?;
        Ok(mounts.get_mount_by_dest(path).is_some())
    }
}

impl Mounter for SystemMounter {
    fn unmount(&self, path: &Path) -> io::Result<()> {
        if !Self::is_mounted(path)? {
            debug!(path = %path.display(), "Not mounted, nothing to do");
            return Ok(());
        }

        match nix::mount::umount(path) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => {
                // Try lazy unmount if regular unmount fails
                warn!(path = %path.display(), error = %e, "Regular unmount failed, trying lazy unmount");
                nix::mount::umount2(path, MntFlags::MNT_DETACH).map_err(io::Error::from)
            }
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
