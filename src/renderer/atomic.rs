//! Atomic request building and the staged property changes.

use std::os::unix::io::RawFd;
use std::time::Duration;

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, property, AtomicCommitFlags, Device as ControlDevice, RawResourceHandle,
    ResourceHandle,
};
use tracing::{trace, warn};

use crate::connector::{Assignment, AtomicChanges, ConnectorProps, SharedProps};
use crate::device::Device;

/// How often a commit is re-tried on `EBUSY` before giving up.
const COMMIT_RETRIES: usize = 10;
/// Pause between `EBUSY` retries.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(2);

/// The cursor plane always carries a 64x64 image.
pub(crate) const CURSOR_SIZE: u64 = 64;

/// An atomic request plus the kernel objects it owns (blobs); they stay
/// alive until the request is dropped.
pub(crate) struct AtomicRequest<'a> {
    device: &'a Device,
    pub req: AtomicModeReq,
    blobs: Vec<u64>,
}

impl<'a> AtomicRequest<'a> {
    pub fn new(device: &'a Device) -> Self {
        AtomicRequest {
            device,
            req: AtomicModeReq::new(),
            blobs: Vec::new(),
        }
    }

    pub fn add<H: Into<RawResourceHandle> + ResourceHandle>(
        &mut self,
        handle: H,
        prop: property::Handle,
        value: property::Value<'static>,
    ) {
        self.req.add_property(handle, prop, value);
    }

    /// Transfer ownership of a blob to this request; it is destroyed when
    /// the request is dropped.
    pub fn own_blob(&mut self, id: u64) {
        self.blobs.push(id);
    }

    pub fn commit(&self, flags: AtomicCommitFlags) -> std::io::Result<()> {
        self.device.fd().atomic_commit(flags, self.req.clone())
    }

    /// Commit, absorbing transient `EBUSY` with a short bounded backoff.
    pub fn commit_with_retry(&self, flags: AtomicCommitFlags) -> std::io::Result<()> {
        let mut tries = 0;
        loop {
            match self.commit(flags | AtomicCommitFlags::TEST_ONLY) {
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) && tries < COMMIT_RETRIES => {
                    tries += 1;
                    trace!("Commit test busy, retrying ({}/{})", tries, COMMIT_RETRIES);
                    std::thread::sleep(COMMIT_RETRY_DELAY);
                }
                _ => break,
            }
        }
        self.commit(flags)
    }
}

impl Drop for AtomicRequest<'_> {
    fn drop(&mut self) {
        for blob in self.blobs.drain(..) {
            self.device.destroy_blob(blob);
        }
    }
}

/// Record of what [`stage_shared_props`] put into a request, so the
/// caller can clear exactly those bits on success or roll the cursor
/// index back on failure.
pub(crate) struct Staged {
    pub bits: AtomicChanges,
    pub prev_cursor_index: usize,
    pub damage_staged: bool,
}

/// Attach every latched property change to `req`.
///
/// The atomic-changes bits are left set; the caller clears them once the
/// commit succeeded. The cursor index is flipped here when a new cursor
/// buffer is staged and must be restored from the returned record when
/// the commit fails.
#[allow(clippy::too_many_arguments)]
pub(crate) fn stage_shared_props(
    device: &Device,
    connector: connector::Handle,
    connector_props: &ConnectorProps,
    assignment: &Assignment,
    props: &mut SharedProps,
    gamma_blob: &mut u64,
    fence_fd: RawFd,
    req: &mut AtomicRequest<'_>,
) -> Staged {
    let bits = props.changes;
    let mut staged = Staged {
        bits,
        prev_cursor_index: props.cursor.as_ref().map(|c| c.index).unwrap_or(0),
        damage_staged: false,
    };

    let cursor_plane = assignment
        .cursor_plane
        .and_then(|handle| device.plane(handle));

    if let (Some(plane), Some(cursor)) = (cursor_plane, props.cursor.as_mut()) {
        let plane_props = plane.props;
        let mut updated_fb = false;

        if bits.contains(AtomicChanges::CURSOR_BUFFER) {
            // the freshly written back buffer becomes the active one
            cursor.index = 1 - cursor.index;

            if cursor.visible {
                if let (Some(prop), Some(fb)) = (plane_props.fb_id, cursor.buffers[cursor.index].fb) {
                    req.add(plane.handle, prop, property::Value::Framebuffer(Some(fb)));
                    updated_fb = true;
                }
            }
        }

        let mut updated_visibility = false;

        if bits.contains(AtomicChanges::CURSOR_VISIBILITY) {
            if cursor.visible {
                updated_visibility = true;

                if !updated_fb {
                    if let (Some(prop), Some(fb)) = (plane_props.fb_id, cursor.buffers[cursor.index].fb) {
                        req.add(plane.handle, prop, property::Value::Framebuffer(Some(fb)));
                    }
                }
                if let Some(prop) = plane_props.crtc_id {
                    req.add(plane.handle, prop, property::Value::CRTC(Some(assignment.crtc)));
                }
                if let Some(prop) = plane_props.crtc_x {
                    req.add(plane.handle, prop, property::Value::SignedRange(props.cursor_x as i64));
                }
                if let Some(prop) = plane_props.crtc_y {
                    req.add(plane.handle, prop, property::Value::SignedRange(props.cursor_y as i64));
                }
                if let Some(prop) = plane_props.crtc_w {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(CURSOR_SIZE));
                }
                if let Some(prop) = plane_props.crtc_h {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(CURSOR_SIZE));
                }
                if let Some(prop) = plane_props.src_x {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(0));
                }
                if let Some(prop) = plane_props.src_y {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(0));
                }
                if let Some(prop) = plane_props.src_w {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(CURSOR_SIZE << 16));
                }
                if let Some(prop) = plane_props.src_h {
                    req.add(plane.handle, prop, property::Value::UnsignedRange(CURSOR_SIZE << 16));
                }
            } else {
                if let Some(prop) = plane_props.crtc_id {
                    req.add(plane.handle, prop, property::Value::CRTC(None));
                }
                if let Some(prop) = plane_props.fb_id {
                    req.add(plane.handle, prop, property::Value::Framebuffer(None));
                }
            }
        }

        if bits.contains(AtomicChanges::CURSOR_POSITION) && !updated_visibility {
            if let Some(prop) = plane_props.crtc_x {
                req.add(plane.handle, prop, property::Value::SignedRange(props.cursor_x as i64));
            }
            if let Some(prop) = plane_props.crtc_y {
                req.add(plane.handle, prop, property::Value::SignedRange(props.cursor_y as i64));
            }
        }
    }

    if bits.contains(AtomicChanges::GAMMA_LUT) && !props.gamma.is_empty() {
        if let Some(crtc) = device.crtc(assignment.crtc) {
            if let Some(prop) = crtc.props.gamma_lut {
                device.destroy_blob(*gamma_blob);
                *gamma_blob = 0;

                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        props.gamma.as_ptr() as *const u8,
                        std::mem::size_of_val(&props.gamma[..]),
                    )
                };
                match device.create_blob(bytes) {
                    Ok(blob) => {
                        *gamma_blob = blob;
                        req.add(assignment.crtc, prop, property::Value::Blob(blob));
                    }
                    Err(err) => {
                        warn!("Failed to create gamma lut blob: {}", err);
                    }
                }
            }
        }
    }

    if bits.contains(AtomicChanges::CONTENT_TYPE) {
        if let (Some(prop), Some(content_type)) = (connector_props.content_type, props.content_type) {
            req.add(connector, prop, property::Value::UnsignedRange(content_type.raw()));
        }
    }

    if !props.damage.is_empty() {
        if let Some(plane) = device.plane(assignment.primary_plane) {
            if let Some(prop) = plane.props.fb_damage_clips {
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        props.damage.as_ptr() as *const u8,
                        std::mem::size_of_val(&props.damage[..]),
                    )
                };
                if let Ok(blob) = device.create_blob(bytes) {
                    req.own_blob(blob);
                    req.add(plane.handle, prop, property::Value::Blob(blob));
                    staged.damage_staged = true;
                }
            }
        }
    }

    if let Some(plane) = device.plane(assignment.primary_plane) {
        if let Some(prop) = plane.props.in_fence_fd {
            req.add(plane.handle, prop, property::Value::SignedRange(fence_fd as i64));
        }
    }

    staged
}

/// Undo the effects of a failed staged commit and report whether the
/// bits staged on entry are still pending.
pub(crate) fn unstage_on_failure(props: &mut SharedProps, staged: &Staged) {
    if let Some(cursor) = props.cursor.as_mut() {
        cursor.index = staged.prev_cursor_index;
    }
}

/// Clear exactly the staged state after a successful commit.
pub(crate) fn clear_on_success(props: &mut SharedProps, staged: &Staged) {
    props.changes &= !staged.bits;
    if staged.damage_staged {
        props.damage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_only_staged_bits() {
        let mut props = SharedProps::default();
        props.changes = AtomicChanges::GAMMA_LUT | AtomicChanges::CONTENT_TYPE;
        let staged = Staged {
            bits: AtomicChanges::GAMMA_LUT,
            prev_cursor_index: 0,
            damage_staged: false,
        };
        clear_on_success(&mut props, &staged);
        assert_eq!(props.changes, AtomicChanges::CONTENT_TYPE);
    }

    #[test]
    fn damage_survives_failed_commit() {
        let mut props = SharedProps::default();
        props.damage.push(crate::utils::Box2 {
            x1: 0,
            y1: 0,
            x2: 8,
            y2: 8,
        });
        let staged = Staged {
            bits: AtomicChanges::empty(),
            prev_cursor_index: 0,
            damage_staged: true,
        };
        unstage_on_failure(&mut props, &staged);
        assert_eq!(props.damage.len(), 1);
        clear_on_success(&mut props, &staged);
        assert!(props.damage.is_empty());
    }
}
