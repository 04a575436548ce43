//! Page flip submission, event draining and presentation time.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use drm::control::{AtomicCommitFlags, Device as ControlDevice, PageFlipFlags};
use rustix::event::{PollFd, PollFlags};
use tracing::{debug, warn};

use super::atomic::{self, AtomicRequest};
use super::RendererState;
use crate::connector::{Connector, ConnectorInner, PresentationFlags};
use crate::device::FlipListener;
use crate::format::Format;

/// Poll timeout while waiting for our own flip.
const FLIP_POLL_TIMEOUT_MS: i32 = 500;
/// Poll timeout of the short bounded drains around mode switches.
const BOUNDED_POLL_TIMEOUT_MS: i32 = 1;
/// Iteration cap of "unbounded" waits, so a dead device cannot wedge the
/// render thread.
const MAX_FLIP_WAIT_ITERATIONS: u32 = 20;

/// Wait until this connector's outstanding flip has been delivered.
///
/// Events of any connector sharing the device may be dispatched while
/// draining; the per-device page-flip mutex serializes the drain itself.
pub(crate) fn wait_page_flip(conn: &Connector, bound: Option<u32>) {
    let inner = &conn.inner;
    let device = &inner.device;
    let mut remaining = bound.unwrap_or(MAX_FLIP_WAIT_ITERATIONS);
    let timeout = if bound.is_some() {
        BOUNDED_POLL_TIMEOUT_MS
    } else {
        FLIP_POLL_TIMEOUT_MS
    };

    while inner.pending_flip.load(Ordering::Acquire) {
        if remaining == 0 || inner.dead.load(Ordering::Acquire) {
            break;
        }
        remaining -= 1;

        let _guard = device.page_flip_mutex.lock().unwrap();

        // the flip may have been dispatched by another connector's drain
        // while we waited for the mutex
        if !inner.pending_flip.load(Ordering::Acquire) {
            break;
        }

        let fd = device.fd();
        let mut fds = [PollFd::new(fd, PollFlags::IN)];
        match rustix::event::poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => device.dispatch_events(),
            Err(err) => {
                warn!(connector = ?inner.handle, "Polling the drm fd failed: {}", err);
                break;
            }
        }
    }
}

impl FlipListener for ConnectorInner {
    fn flip_finished(&self, frame: u32, duration: Duration) {
        self.pending_flip.store(false, Ordering::Release);

        let mut presentation = self.presentation.lock().unwrap();
        if self.current_vsync.load(Ordering::Acquire) {
            presentation.flags =
                PresentationFlags::VSYNC | PresentationFlags::HW_CLOCK | PresentationFlags::HW_COMPLETION;
            presentation.frame = frame as u64;
            presentation.time = duration;
            presentation.period = Duration::from_nanos(self.refresh_ns.load(Ordering::Acquire) as u64);
        } else {
            presentation.flags = PresentationFlags::empty();
            presentation.frame = 0;
            presentation.period = Duration::ZERO;

            let previous = presentation.time;
            presentation.time = now(self);

            let limit = self.max_refresh_rate.load(Ordering::Acquire);
            if limit < 0 {
                return;
            }

            let refresh_ns = self.refresh_ns.load(Ordering::Acquire) as u64;
            let period = tearing_interval(limit, refresh_ns);

            if !period.is_zero() {
                if let Some(elapsed) = presentation.time.checked_sub(previous) {
                    if elapsed < period {
                        std::thread::sleep(period - elapsed);
                        presentation.time = now(self);
                    }
                }
            }
        }
    }
}

/// Minimum spacing between async flips: disabled below zero, roughly
/// twice the refresh rate at zero, `1/limit` seconds above.
fn tearing_interval(limit: i32, refresh_ns: u64) -> Duration {
    if limit < 0 {
        return Duration::ZERO;
    }
    if limit == 0 {
        if refresh_ns == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(refresh_ns / 2)
        }
    } else {
        Duration::from_micros(1_000_000 / limit as u64)
    }
}

fn now(inner: &ConnectorInner) -> Duration {
    let ts = rustix::time::clock_gettime(inner.device.presentation_clock());
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

fn async_flip_flag() -> AtomicCommitFlags {
    AtomicCommitFlags::from_bits_retain(drm_ffi::DRM_MODE_PAGE_FLIP_ASYNC)
}

impl RendererState {
    /// Submit `fb` as the next scanout image, following the vsync toggle
    /// and carrying every latched property change.
    ///
    /// `flip_format` names the `(fourcc, modifier)` of the buffer for the
    /// per-plane sync-only bookkeeping.
    #[profiling::function]
    pub(super) fn submit_flip(&mut self, fb: drm::control::framebuffer::Handle, flip_format: Format) {
        let conn = self.conn.clone();
        let inner = conn.inner.clone();
        let buffers = self.strategy.buffers_count();
        let custom = inner.props.lock().unwrap().custom_scanout[0].is_some();

        // never have two flips in flight for one connector
        if custom || inner.pending_flip.load(Ordering::Acquire) || buffers == 1 || buffers > 2 {
            wait_page_flip(&conn, None);
        }

        self.last_fb = Some(fb);
        let vsync = inner.current_vsync.load(Ordering::Acquire);

        let result = if self.device.is_atomic() {
            self.submit_atomic(&inner, fb, flip_format, vsync)
        } else {
            self.submit_legacy(fb, flip_format, vsync)
        };
        inner.pending_flip.store(true, Ordering::Release);

        if let Err(err) = result {
            inner.pending_flip.store(false, Ordering::Release);
            warn!(connector = %conn.log_name(), "Page flip failed: {}", err);
            if custom && err.raw_os_error() == Some(libc::EINVAL) {
                self.blacklist_modifier(flip_format);
            }
        }

        // a depth-two swapchain (and the very first flip) stays lockstep
        // with the display
        if custom || buffers == 2 || inner.first_flip.load(Ordering::Acquire) {
            inner.first_flip.store(false, Ordering::Release);
            wait_page_flip(&conn, None);
        }
    }

    fn submit_atomic(
        &mut self,
        inner: &ConnectorInner,
        fb: drm::control::framebuffer::Handle,
        flip_format: Format,
        vsync: bool,
    ) -> std::io::Result<()> {
        let device = self.device.clone();
        let assignment = self.assignment;
        let fence_fd = self.fence.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1);

        let mut guard = inner.props.lock().unwrap();
        let props = &mut *guard;
        let meta_props = inner.meta.read().unwrap().props;

        let sync_only = device
            .plane(assignment.primary_plane)
            .map(|plane| plane.sync_only.lock().unwrap().contains(&flip_format))
            .unwrap_or(false);

        if !vsync && props.changes.is_empty() && !sync_only {
            // async attempt with the framebuffer alone
            let mut req = AtomicRequest::new(&device);
            self.add_primary_fb(&mut req, fb);
            let result = req.commit(
                AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK | async_flip_flag(),
            );
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.raw_os_error() == Some(libc::EINVAL) {
                        self.blacklist_modifier(flip_format);
                    }
                    // fall through to a synchronous submission
                }
            }
        }

        let mut req = AtomicRequest::new(&device);
        let staged = atomic::stage_shared_props(
            &device,
            inner.handle,
            &meta_props,
            &assignment,
            props,
            &mut self.gamma_blob,
            fence_fd,
            &mut req,
        );
        self.add_primary_fb(&mut req, fb);
        let result = req.commit(AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK);
        match &result {
            Ok(()) => atomic::clear_on_success(props, &staged),
            Err(_) => atomic::unstage_on_failure(props, &staged),
        }
        result
    }

    fn submit_legacy(
        &mut self,
        fb: drm::control::framebuffer::Handle,
        flip_format: Format,
        vsync: bool,
    ) -> std::io::Result<()> {
        let crtc = self.assignment.crtc;
        if vsync {
            self.device.fd().page_flip(crtc, fb, PageFlipFlags::EVENT, None)
        } else {
            match self
                .device
                .fd()
                .page_flip(crtc, fb, PageFlipFlags::EVENT | PageFlipFlags::ASYNC, None)
            {
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                    self.blacklist_modifier(flip_format);
                    self.device.fd().page_flip(crtc, fb, PageFlipFlags::EVENT, None)
                }
                other => other,
            }
        }
    }

    fn add_primary_fb(&self, req: &mut AtomicRequest<'_>, fb: drm::control::framebuffer::Handle) {
        if let Some(plane) = self.device.plane(self.assignment.primary_plane) {
            if let Some(prop) = plane.props.fb_id {
                req.add(plane.handle, prop, drm::control::property::Value::Framebuffer(Some(fb)));
            }
        }
    }

    fn blacklist_modifier(&self, format: Format) {
        if let Some(plane) = self.device.plane(self.assignment.primary_plane) {
            let mut list = plane.sync_only.lock().unwrap();
            if !list.contains(&format) {
                debug!(
                    connector = %self.conn.log_name(),
                    ?format,
                    "Async flip rejected, marking format sync-only"
                );
                list.insert(format);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tearing_interval;
    use std::time::Duration;

    #[test]
    fn tearing_interval_policy() {
        let refresh_60hz = 1_000_000_000u64 / 60;
        // negative disables the limit
        assert_eq!(tearing_interval(-1, refresh_60hz), Duration::ZERO);
        // zero caps at roughly twice the refresh rate
        assert_eq!(
            tearing_interval(0, refresh_60hz),
            Duration::from_nanos(refresh_60hz / 2)
        );
        // unknown refresh disables the default cap
        assert_eq!(tearing_interval(0, 0), Duration::ZERO);
        // a positive value is taken literally
        assert_eq!(tearing_interval(100, refresh_60hz), Duration::from_millis(10));
    }
}
