//! Ref-counted DRM file descriptors.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use drm::{control::Device as ControlDevice, Device as BasicDevice};
use tracing::{info, warn};

use crate::utils::DevPath;

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                tracing::error!("Failed to drop drm master state: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device.
///
/// Acquires the DRM master lock on creation where possible and releases
/// it when the last clone is dropped. Never construct two of these over
/// the same file description; clone instead.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Wrap an open drm node.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd { fd, privileged: false };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Whether the DRM master lock could be acquired.
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// The `dev_t` of the underlying device.
    pub fn dev_id(&self) -> std::io::Result<libc::dev_t> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev)
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}
