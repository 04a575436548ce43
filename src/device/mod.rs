//! DRM device handling.
//!
//! A [`Device`] wraps one open render node: its capabilities, client
//! capabilities, the crtc/encoder/plane arenas with their property
//! tables, the GBM allocator, and the two pieces of cross-connector
//! shared state this crate relies on: the resource-binding table
//! (which crtc/plane belongs to which connector) and the page-flip
//! mutex serializing event draining on the shared file descriptor.

use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use drm::control::{connector, crtc, encoder, framebuffer, plane, property, Device as ControlDevice, Event, ResourceHandle};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use rustix::time::ClockId;
use tracing::{debug, info, trace, warn};

mod fd;
pub use fd::DrmDeviceFd;

use crate::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use crate::config::EnvConfig;
use crate::connector::ConnectorInner;
use crate::error::Error;
use crate::format::{Format, FormatList, FormatSet, Fourcc, Modifier};
use crate::render::PaintEngine;
use crate::utils::DevPath;

/// `DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP`; queried raw, the constant is newer
/// than the drm crate's capability enum.
const DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP: u64 = 0x15;

/// Kernel capabilities of a device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    /// Dumb buffers can be allocated
    pub dumb_buffer: bool,
    /// DMA-BUF import is supported
    pub prime_import: bool,
    /// DMA-BUF export is supported
    pub prime_export: bool,
    /// `ADDFB2` accepts explicit modifiers
    pub addfb2_modifiers: bool,
    /// VBlank timestamps use the monotonic clock
    pub timestamp_monotonic: bool,
    /// Legacy async page flips are supported
    pub async_page_flip: bool,
    /// Atomic async page flips are supported
    pub atomic_async_page_flip: bool,
    /// Preferred cursor width
    pub cursor_width: u32,
    /// Preferred cursor height
    pub cursor_height: u32,
}

/// Client capabilities acquired on the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCaps {
    /// Atomic modesetting
    pub atomic: bool,
    /// Universal planes
    pub universal_planes: bool,
    /// Aspect-ratio mode bits
    pub aspect_ratio: bool,
    /// Stereo 3D modes
    pub stereo_3d: bool,
    /// Writeback connectors are listed
    pub writeback: bool,
}

/// Plane classes of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    /// Composited above the primary plane
    Overlay,
    /// Carries the main image of a crtc
    Primary,
    /// Carries the hardware cursor
    Cursor,
}

/// Property handles of a crtc.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrtcProps {
    pub(crate) mode_id: Option<property::Handle>,
    pub(crate) active: Option<property::Handle>,
    pub(crate) gamma_lut: Option<property::Handle>,
    pub(crate) gamma_lut_size: Option<property::Handle>,
    pub(crate) vrr_enabled: Option<property::Handle>,
}

/// Property handles of a plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneProps {
    pub(crate) fb_id: Option<property::Handle>,
    pub(crate) crtc_id: Option<property::Handle>,
    pub(crate) crtc_x: Option<property::Handle>,
    pub(crate) crtc_y: Option<property::Handle>,
    pub(crate) crtc_w: Option<property::Handle>,
    pub(crate) crtc_h: Option<property::Handle>,
    pub(crate) src_x: Option<property::Handle>,
    pub(crate) src_y: Option<property::Handle>,
    pub(crate) src_w: Option<property::Handle>,
    pub(crate) src_h: Option<property::Handle>,
    pub(crate) in_fence_fd: Option<property::Handle>,
    pub(crate) fb_damage_clips: Option<property::Handle>,
    pub(crate) rotation: Option<property::Handle>,
}

/// A crtc of the device.
#[derive(Debug)]
pub struct CrtcRes {
    /// The kernel handle
    pub handle: crtc::Handle,
    /// Entries of the gamma lookup table, 0 when gamma is unsupported
    pub gamma_size: u64,
    pub(crate) props: CrtcProps,
}

/// An encoder of the device.
#[derive(Debug)]
pub struct EncoderRes {
    /// The kernel handle
    pub handle: encoder::Handle,
    /// Crtcs this encoder can drive
    pub possible_crtcs: Vec<crtc::Handle>,
}

/// A plane of the device.
#[derive(Debug)]
pub struct PlaneRes {
    /// The kernel handle
    pub handle: plane::Handle,
    /// Primary, overlay or cursor
    pub kind: PlaneKind,
    /// Crtcs this plane can feed
    pub possible_crtcs: Vec<crtc::Handle>,
    /// Input formats, with explicit modifiers where `IN_FORMATS` is exposed
    pub formats: FormatSet,
    /// `(fourcc, modifier)` pairs the kernel refused to flip async
    pub sync_only: Mutex<FormatList>,
    pub(crate) props: PlaneProps,
}

/// Listener for page-flip events of one crtc.
pub(crate) trait FlipListener: Send + Sync {
    fn flip_finished(&self, frame: u32, duration: Duration);
}

#[derive(Default)]
pub(crate) struct Bindings {
    pub crtcs: HashMap<crtc::Handle, connector::Handle>,
    pub encoders: HashMap<encoder::Handle, connector::Handle>,
    pub planes: HashMap<plane::Handle, connector::Handle>,
}

/// An open DRM device and everything shared between its connectors.
pub struct Device {
    fd: DrmDeviceFd,
    path: Option<PathBuf>,
    driver_name: String,
    caps: DeviceCaps,
    client_caps: ClientCaps,
    clock: ClockId,
    env: EnvConfig,

    crtcs: Vec<CrtcRes>,
    encoders: Vec<EncoderRes>,
    planes: Vec<PlaneRes>,

    gbm: Mutex<GbmAllocator<DrmDeviceFd>>,
    paint_engine: RwLock<Option<Arc<dyn PaintEngine>>>,
    render_device: RwLock<Weak<Device>>,

    pub(crate) bindings: Mutex<Bindings>,
    pub(crate) page_flip_mutex: Mutex<()>,
    flip_listeners: Mutex<HashMap<crtc::Handle, Weak<dyn FlipListener>>>,
    connector_registry: Mutex<Vec<Weak<ConnectorInner>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("driver", &self.driver_name)
            .field("caps", &self.caps)
            .field("client_caps", &self.client_caps)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Take over an open drm node.
    ///
    /// Reads capabilities, acquires client capabilities (atomic unless
    /// `SCANOUT_FORCE_LEGACY_API` is set), and scans the crtc, encoder
    /// and plane resources with their property tables.
    pub fn new(fd: DrmDeviceFd, env: EnvConfig) -> Result<Arc<Device>, Error> {
        let path = fd.dev_path();
        info!(dev = ?path, "Initializing device");

        let driver_name = fd
            .get_driver()
            .map(|d| d.name().to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown"));

        let mut client_caps = ClientCaps {
            stereo_3d: fd.set_client_capability(ClientCapability::Stereo3D, true).is_ok(),
            ..Default::default()
        };

        if env.force_legacy_api {
            info!(dev = ?path, "SCANOUT_FORCE_LEGACY_API is set, skipping the atomic cap");
        } else {
            client_caps.atomic = fd.set_client_capability(ClientCapability::Atomic, true).is_ok();
        }

        if client_caps.atomic {
            // the atomic cap implies these two
            client_caps.universal_planes = true;
            client_caps.aspect_ratio = true;
            if env.enable_writeback_connectors {
                client_caps.writeback = fd
                    .set_client_capability(ClientCapability::WritebackConnectors, true)
                    .is_ok();
            }
        } else {
            client_caps.aspect_ratio = fd.set_client_capability(ClientCapability::AspectRatio, true).is_ok();
            client_caps.universal_planes = fd
                .set_client_capability(ClientCapability::UniversalPlanes, true)
                .is_ok();
        }

        let get_cap = |cap| fd.get_driver_capability(cap).unwrap_or(0);
        let prime = get_cap(DriverCapability::Prime);
        let caps = DeviceCaps {
            dumb_buffer: get_cap(DriverCapability::DumbBuffer) == 1,
            prime_import: prime & 0x1 != 0,
            prime_export: prime & 0x2 != 0,
            addfb2_modifiers: get_cap(DriverCapability::AddFB2Modifiers) == 1,
            timestamp_monotonic: get_cap(DriverCapability::MonotonicTimestamp) == 1,
            async_page_flip: get_cap(DriverCapability::ASyncPageFlip) == 1,
            atomic_async_page_flip: drm_ffi::get_capability(fd.as_fd(), DRM_CAP_ATOMIC_ASYNC_PAGE_FLIP)
                .map(|cap| cap.value == 1)
                .unwrap_or(false),
            cursor_width: get_cap(DriverCapability::CursorWidth).max(64) as u32,
            cursor_height: get_cap(DriverCapability::CursorHeight).max(64) as u32,
        };
        let clock = if caps.timestamp_monotonic {
            ClockId::Monotonic
        } else {
            ClockId::Realtime
        };

        debug!(dev = ?path, driver = %driver_name, ?caps, ?client_caps, "Device capabilities");

        let gbm_device = GbmDevice::new(fd.clone())
            .map_err(|source| Error::access("Failed to create gbm device", path.clone(), source))?;
        let gbm = GbmAllocator::new(
            gbm_device,
            GbmBufferFlags::SCANOUT | GbmBufferFlags::RENDERING,
        );

        let mut device = Device {
            fd,
            path,
            driver_name,
            caps,
            client_caps,
            clock,
            env,
            crtcs: Vec::new(),
            encoders: Vec::new(),
            planes: Vec::new(),
            gbm: Mutex::new(gbm),
            paint_engine: RwLock::new(None),
            render_device: RwLock::new(Weak::new()),
            bindings: Mutex::new(Bindings::default()),
            page_flip_mutex: Mutex::new(()),
            flip_listeners: Mutex::new(HashMap::new()),
            connector_registry: Mutex::new(Vec::new()),
        };
        device.scan_resources()?;

        Ok(Arc::new(device))
    }

    fn scan_resources(&mut self) -> Result<(), Error> {
        let res = self.fd.resource_handles().map_err(|source| {
            Error::access("Error loading resource handles", self.path.clone(), source)
        })?;

        for &handle in res.crtcs() {
            let info = self
                .fd
                .get_crtc(handle)
                .map_err(|source| Error::access("Error loading crtc info", self.path.clone(), source))?;
            let mut props = CrtcProps::default();
            let mut gamma_size = info.gamma_length() as u64;
            for (name, prop, value) in self.collect_props(handle)? {
                match name.as_str() {
                    "MODE_ID" => props.mode_id = Some(prop),
                    "ACTIVE" => props.active = Some(prop),
                    "GAMMA_LUT" => props.gamma_lut = Some(prop),
                    "GAMMA_LUT_SIZE" => {
                        props.gamma_lut_size = Some(prop);
                        if self.client_caps.atomic {
                            gamma_size = value;
                        }
                    }
                    "VRR_ENABLED" => props.vrr_enabled = Some(prop),
                    _ => {}
                }
            }
            self.crtcs.push(CrtcRes {
                handle,
                gamma_size,
                props,
            });
        }

        for &handle in res.encoders() {
            let info = self.fd.get_encoder(handle).map_err(|source| {
                Error::access("Error loading encoder info", self.path.clone(), source)
            })?;
            self.encoders.push(EncoderRes {
                handle,
                possible_crtcs: res.filter_crtcs(info.possible_crtcs()),
            });
        }

        let plane_handles = self
            .fd
            .plane_handles()
            .map_err(|source| Error::access("Error loading planes", self.path.clone(), source))?;
        for handle in plane_handles {
            let info = self
                .fd
                .get_plane(handle)
                .map_err(|source| Error::access("Error loading plane info", self.path.clone(), source))?;
            let mut props = PlaneProps::default();
            let mut kind = PlaneKind::Overlay;
            let mut in_formats_blob = None;
            for (name, prop, value) in self.collect_props(handle)? {
                match name.as_str() {
                    "FB_ID" => props.fb_id = Some(prop),
                    "CRTC_ID" => props.crtc_id = Some(prop),
                    "CRTC_X" => props.crtc_x = Some(prop),
                    "CRTC_Y" => props.crtc_y = Some(prop),
                    "CRTC_W" => props.crtc_w = Some(prop),
                    "CRTC_H" => props.crtc_h = Some(prop),
                    "SRC_X" => props.src_x = Some(prop),
                    "SRC_Y" => props.src_y = Some(prop),
                    "SRC_W" => props.src_w = Some(prop),
                    "SRC_H" => props.src_h = Some(prop),
                    "IN_FENCE_FD" => props.in_fence_fd = Some(prop),
                    "FB_DAMAGE_CLIPS" => props.fb_damage_clips = Some(prop),
                    "rotation" => props.rotation = Some(prop),
                    "IN_FORMATS" => in_formats_blob = Some(value),
                    "type" => {
                        kind = match value {
                            1 => PlaneKind::Primary,
                            2 => PlaneKind::Cursor,
                            _ => PlaneKind::Overlay,
                        }
                    }
                    _ => {}
                }
            }

            let formats = self.plane_formats(&info, kind, in_formats_blob)?;
            self.planes.push(PlaneRes {
                handle,
                kind,
                possible_crtcs: res.filter_crtcs(info.possible_crtcs()),
                formats,
                sync_only: Mutex::new(FormatList::default()),
                props,
            });
        }

        trace!(
            dev = ?self.path,
            crtcs = self.crtcs.len(),
            encoders = self.encoders.len(),
            planes = self.planes.len(),
            "Scanned resources"
        );

        Ok(())
    }

    fn collect_props<T: ResourceHandle>(
        &self,
        handle: T,
    ) -> Result<Vec<(String, property::Handle, u64)>, Error> {
        let props = self
            .fd
            .get_properties(handle)
            .map_err(|source| Error::access("Error reading properties", self.path.clone(), source))?;
        let (handles, values) = props.as_props_and_values();
        let mut out = Vec::with_capacity(handles.len());
        for (&prop, &value) in handles.iter().zip(values.iter()) {
            let Ok(info) = self.fd.get_property(prop) else {
                continue;
            };
            out.push((info.name().to_string_lossy().into_owned(), prop, value));
        }
        Ok(out)
    }

    /// The input format set of a plane. With `ADDFB2_MODIFIERS` the
    /// `IN_FORMATS` blob is walked, otherwise the plain fourcc list is
    /// used with implicit modifiers (plus a forced linear entry for
    /// cursor planes).
    fn plane_formats(
        &self,
        info: &plane::Info,
        kind: PlaneKind,
        in_formats_blob: Option<u64>,
    ) -> Result<FormatSet, Error> {
        let mut formats = Vec::new();
        for code in info.formats().iter().flat_map(|&f| Fourcc::try_from(f).ok()) {
            formats.push(Format {
                code,
                modifier: Modifier::Invalid,
            });
        }

        if self.caps.addfb2_modifiers {
            if let Some(blob) = in_formats_blob {
                let data = self.fd.get_property_blob(blob).map_err(|source| {
                    Error::access("Failed to read IN_FORMATS blob", self.path.clone(), source)
                })?;
                // the blob layout gives no alignment guarantees, so every
                // entry is read unaligned
                unsafe {
                    let blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
                    let blob = &*blob_ptr;

                    let formats_ptr = blob_ptr.cast::<u8>().offset(blob.formats_offset as isize) as *const u32;
                    let modifiers_ptr = blob_ptr.cast::<u8>().offset(blob.modifiers_offset as isize)
                        as *const drm_ffi::drm_format_modifier;

                    for i in 0..blob.count_modifiers {
                        let mod_info = modifiers_ptr.offset(i as isize).read_unaligned();
                        for j in 0..64 {
                            if mod_info.formats & (1u64 << j) != 0 {
                                let raw = formats_ptr.offset((j + mod_info.offset) as isize).read_unaligned();
                                if let Ok(code) = Fourcc::try_from(raw) {
                                    formats.push(Format {
                                        code,
                                        modifier: Modifier::from(mod_info.modifier),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        } else if kind == PlaneKind::Cursor {
            // without modifier support cursor buffers are linear
            for format in formats.clone() {
                formats.push(Format {
                    code: format.code,
                    modifier: Modifier::Linear,
                });
            }
        }

        Ok(formats.into_iter().collect())
    }

    /// The wrapped file descriptor.
    pub fn fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    /// Path of the node, if known.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Kernel driver name.
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub(crate) fn is_nvidia(&self) -> bool {
        self.driver_name.contains("nvidia")
    }

    /// Kernel capabilities.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Acquired client capabilities.
    pub fn client_caps(&self) -> &ClientCaps {
        &self.client_caps
    }

    /// Whether commits go through the atomic API.
    pub fn is_atomic(&self) -> bool {
        self.client_caps.atomic
    }

    /// The clock id presentation timestamps are based on.
    pub fn presentation_clock(&self) -> ClockId {
        self.clock
    }

    /// The environment snapshot this device was created with.
    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    /// The crtcs of this device.
    pub fn crtcs(&self) -> &[CrtcRes] {
        &self.crtcs
    }

    /// The encoders of this device.
    pub fn encoders(&self) -> &[EncoderRes] {
        &self.encoders
    }

    /// The planes of this device.
    pub fn planes(&self) -> &[PlaneRes] {
        &self.planes
    }

    pub(crate) fn crtc(&self, handle: crtc::Handle) -> Option<&CrtcRes> {
        self.crtcs.iter().find(|c| c.handle == handle)
    }

    pub(crate) fn plane(&self, handle: plane::Handle) -> Option<&PlaneRes> {
        self.planes.iter().find(|p| p.handle == handle)
    }

    /// Lock the GBM allocator of this device.
    pub(crate) fn gbm(&self) -> std::sync::MutexGuard<'_, GbmAllocator<DrmDeviceFd>> {
        self.gbm.lock().unwrap()
    }

    /// Attach the paint engine for this GPU.
    pub fn set_paint_engine(&self, engine: Arc<dyn PaintEngine>) {
        *self.paint_engine.write().unwrap() = Some(engine);
    }

    /// The paint engine of this GPU, if attached.
    pub fn paint_engine(&self) -> Option<Arc<dyn PaintEngine>> {
        self.paint_engine.read().unwrap().clone()
    }

    /// Declare which device renders for this one. A device rendering for
    /// itself scans out its own images; anything else routes frames
    /// through the Prime, Dumb or CPU strategy.
    pub fn set_render_device(&self, render: &Arc<Device>) {
        *self.render_device.write().unwrap() = Arc::downgrade(render);
    }

    /// The device that renders for this one, when another one was
    /// assigned through [`set_render_device`](Self::set_render_device).
    pub fn render_device(&self) -> Option<Arc<Device>> {
        self.render_device.read().unwrap().upgrade()
    }

    /// Whether this device renders its own frames.
    pub fn is_render_device(&self) -> bool {
        match self.render_device.read().unwrap().upgrade() {
            Some(render) => std::ptr::eq(render.as_ref(), self),
            None => true,
        }
    }

    pub(crate) fn register_connector(&self, connector: Weak<ConnectorInner>) {
        let mut registry = self.connector_registry.lock().unwrap();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(connector);
    }

    pub(crate) fn connectors(&self) -> Vec<Arc<ConnectorInner>> {
        self.connector_registry
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn register_flip_listener(&self, crtc: crtc::Handle, listener: Weak<dyn FlipListener>) {
        self.flip_listeners.lock().unwrap().insert(crtc, listener);
    }

    pub(crate) fn unregister_flip_listener(&self, crtc: crtc::Handle) {
        self.flip_listeners.lock().unwrap().remove(&crtc);
    }

    /// Drain all pending events from the fd and dispatch page flips to
    /// their connectors. Must be called with the page-flip mutex held.
    pub(crate) fn dispatch_events(&self) {
        let events = match self.fd.receive_events() {
            Ok(events) => events,
            Err(err) => {
                warn!(dev = ?self.path, "Error reading drm events: {}", err);
                return;
            }
        };
        for event in events {
            if let Event::PageFlip(flip) = event {
                let listener = self.flip_listeners.lock().unwrap().get(&flip.crtc).and_then(Weak::upgrade);
                if let Some(listener) = listener {
                    listener.flip_finished(flip.frame, flip.duration);
                } else {
                    trace!(dev = ?self.path, crtc = ?flip.crtc, "Page flip for unknown crtc");
                }
            }
        }
    }

    /// Create a property blob from raw bytes; returns the blob id.
    pub(crate) fn create_blob(&self, data: &[u8]) -> Result<u64, Error> {
        let mut bytes = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut bytes)
            .map_err(|source| Error::access("Failed to create property blob", self.path.clone(), source.into()))?;
        Ok(blob.blob_id as u64)
    }

    pub(crate) fn destroy_blob(&self, id: u64) {
        if id != 0 {
            let _ = drm_ffi::mode::destroy_property_blob(self.fd.as_fd(), id as u32);
        }
    }

    /// Turn a buffer into a kernel framebuffer, preferring the modifier
    /// aware path and falling back to the legacy one.
    pub(crate) fn add_framebuffer<B>(&self, buffer: &B, allow_modifiers: bool) -> Result<framebuffer::Handle, Error>
    where
        B: drm::buffer::PlanarBuffer + drm::buffer::Buffer,
    {
        use drm::control::FbCmd2Flags;

        if allow_modifiers
            && self.caps.addfb2_modifiers
            && drm::buffer::PlanarBuffer::modifier(buffer)
                .map(|m| m != Modifier::Invalid)
                .unwrap_or(false)
        {
            match self.fd.add_planar_framebuffer(buffer, FbCmd2Flags::MODIFIERS) {
                Ok(fb) => return Ok(fb),
                Err(err) => {
                    debug!(dev = ?self.path, "add_planar_framebuffer with modifiers failed ({}), retrying without", err);
                }
            }
        }

        match self.fd.add_planar_framebuffer(buffer, FbCmd2Flags::empty()) {
            Ok(fb) => return Ok(fb),
            Err(err) => {
                debug!(dev = ?self.path, "add_planar_framebuffer failed ({}), trying legacy add_framebuffer", err);
            }
        }

        let format = drm::buffer::Buffer::format(buffer);
        let depth = crate::format::depth(format).unwrap_or(24);
        let bpp = crate::format::bpp(format).unwrap_or(32);
        self.fd
            .add_framebuffer(buffer, depth, bpp)
            .map_err(|source| Error::access("Failed to create framebuffer", self.path.clone(), source))
    }

    pub(crate) fn destroy_framebuffer(&self, fb: framebuffer::Handle) {
        let _ = self.fd.destroy_framebuffer(fb);
    }
}
