//! Connectors and their user-facing lifecycle.
//!
//! A [`Connector`] is a physical output of a [`Device`]. Once
//! [`initialized`](Connector::initialize) it owns a render thread that
//! drives the display through one of the rendering strategies; every
//! other method of this type merely publishes a request to that thread
//! and wakes it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use drm::control::{connector, encoder, plane, property, Device as ControlDevice};
use rustix::time::ClockId;
use tracing::{debug, warn};

mod mode;
pub use mode::ConnectorMode;

use crate::allocator::dmabuf::Dmabuf;
use crate::device::Device;
use crate::error::Error;
use crate::format::Format;
use crate::render::{PaintContext, PaintImage};
use crate::renderer;
use crate::renderer::cursor::CursorState;
use crate::renderer::StrategyKind;
use crate::utils::{Box2, Rect};

bitflags::bitflags! {
    /// Property changes latched for the next commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct AtomicChanges: u32 {
        const CURSOR_BUFFER = 0x01;
        const CURSOR_VISIBILITY = 0x02;
        const CURSOR_POSITION = 0x04;
        const GAMMA_LUT = 0x08;
        const CONTENT_TYPE = 0x10;
    }
}

/// Lifecycle states of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Not driven by this library
    Uninitialized,
    /// `initialize` is running
    Initializing,
    /// The render thread is up and paints on request
    Initialized,
    /// A mode change is being applied
    ChangingMode,
    /// A failed mode change is being rolled back
    RevertingMode,
    /// `suspend` was requested
    Suspending,
    /// The crtc is disabled, state is retained
    Suspended,
    /// `resume` was requested
    Resuming,
    /// `uninitialize` was requested
    Uninitializing,
}

/// Content type hint forwarded to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Desktop graphics
    Graphics,
    /// Still imagery
    Photo,
    /// Film material
    Video,
    /// Low-latency game output
    Game,
}

impl ContentType {
    pub(crate) fn raw(self) -> u64 {
        match self {
            ContentType::Graphics => 1,
            ContentType::Photo => 2,
            ContentType::Video => 3,
            ContentType::Game => 4,
        }
    }
}

/// Subpixel layout of a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subpixel {
    /// Layout unknown
    #[default]
    Unknown,
    /// R, G, B columns
    HorizontalRgb,
    /// B, G, R columns
    HorizontalBgr,
    /// R, G, B rows
    VerticalRgb,
    /// B, G, R rows
    VerticalBgr,
    /// No distinct subpixels
    None,
}

impl From<connector::SubPixel> for Subpixel {
    fn from(value: connector::SubPixel) -> Self {
        match value {
            connector::SubPixel::HorizontalRgb => Subpixel::HorizontalRgb,
            connector::SubPixel::HorizontalBgr => Subpixel::HorizontalBgr,
            connector::SubPixel::VerticalRgb => Subpixel::VerticalRgb,
            connector::SubPixel::VerticalBgr => Subpixel::VerticalBgr,
            connector::SubPixel::None => Subpixel::None,
            _ => Subpixel::Unknown,
        }
    }
}

bitflags::bitflags! {
    /// How the last frame was presented.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentationFlags: u32 {
        /// The flip was aligned to the vertical retrace
        const VSYNC = 0x1;
        /// The timestamp was taken by the hardware
        const HW_CLOCK = 0x2;
        /// The hardware signalled scanout start
        const HW_COMPLETION = 0x4;
    }
}

/// When and how the last framebuffer reached the screen.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresentationTime {
    /// Timestamp on the device's presentation clock
    pub time: Duration,
    /// Predicted time until the next retrace, zero if unknown
    pub period: Duration,
    /// Vertical retrace counter, zero if unknown
    pub frame: u64,
    /// See [`PresentationFlags`]
    pub flags: PresentationFlags,
}

/// A lightweight description of one swapchain slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotDescriptor {
    /// Position in the swapchain
    pub index: usize,
    /// Pixel size
    pub size: (u32, u32),
    /// Fourcc and modifier
    pub format: Format,
}

/// One rgb16 gamma ramp entry, kernel blob layout.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct GammaEntry {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub reserved: u16,
}

/// The callbacks driving a connector, implemented by the owner.
///
/// All methods except `presented`, `discarded` and `uninitialized` run on
/// the connector's render thread with the paint context current.
pub trait ConnectorHandler: Send + 'static {
    /// The connector finished initializing; GL state may be set up.
    fn initialized(&mut self, frame: &mut Frame<'_>);
    /// Draw the next frame into the bound target.
    fn paint(&mut self, frame: &mut Frame<'_>);
    /// A submitted frame reached the screen.
    fn presented(&mut self, connector: &Connector, time: PresentationTime);
    /// A requested paint was dropped without reaching the screen.
    fn discarded(&mut self, connector: &Connector);
    /// The current mode changed; viewport-dependent state must be rebuilt.
    fn resized(&mut self, frame: &mut Frame<'_>);
    /// The connector was torn down.
    fn uninitialized(&mut self, connector: &Connector);
}

/// Access to the current render target during a handler callback.
pub struct Frame<'a> {
    pub(crate) ctx: &'a mut dyn PaintContext,
    pub(crate) image: &'a dyn PaintImage,
    pub(crate) size: (u32, u32),
    pub(crate) age: u32,
    pub(crate) connector: &'a Connector,
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("size", &self.size)
            .field("age", &self.age)
            .finish_non_exhaustive()
    }
}

impl<'a> Frame<'a> {
    /// The paint context of the main render device.
    pub fn ctx(&mut self) -> &mut dyn PaintContext {
        self.ctx
    }

    /// The image currently bound as render target.
    pub fn target(&self) -> &dyn PaintImage {
        self.image
    }

    /// Active size of the current mode.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Age of the target in frames; 0 means undefined content.
    pub fn buffer_age(&self) -> u32 {
        self.age
    }

    /// The connector being painted.
    pub fn connector(&self) -> &Connector {
        self.connector
    }
}

/// Connector property ids, resolved once per (re)scan.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConnectorProps {
    pub crtc_id: Option<property::Handle>,
    pub dpms: Option<property::Handle>,
    pub edid: Option<property::Handle>,
    pub link_status: Option<property::Handle>,
    pub non_desktop: Option<property::Handle>,
    pub content_type: Option<property::Handle>,
    pub panel_orientation: Option<property::Handle>,
    pub subconnector: Option<property::Handle>,
    pub vrr_capable: Option<property::Handle>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectorMeta {
    pub connected: bool,
    pub mm_size: (u32, u32),
    pub subpixel: Subpixel,
    pub name: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub non_desktop: bool,
    pub vrr_capable: bool,
    pub props: ConnectorProps,
    pub encoders: Vec<encoder::Handle>,
    pub modes: Vec<ConnectorMode>,
    pub preferred: Option<usize>,
}

/// The hardware resources reserved for an initialized connector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Assignment {
    pub encoder: encoder::Handle,
    pub crtc: drm::control::crtc::Handle,
    pub primary_plane: plane::Handle,
    pub cursor_plane: Option<plane::Handle>,
    pub gamma_size: u64,
}

/// A user-provided buffer scanned out in place of the swapchain.
pub(crate) struct CustomScanout {
    pub device: Arc<Device>,
    pub fb: drm::control::framebuffer::Handle,
    pub format: Format,
    // keeps the storage alive while the kernel scans it out
    pub _bo: gbm::BufferObject<()>,
}

impl Drop for CustomScanout {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.fb);
    }
}

/// State written by external threads and consumed by the render thread.
#[derive(Default)]
pub(crate) struct SharedProps {
    pub changes: AtomicChanges,
    pub cursor: Option<CursorState>,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub gamma: Vec<GammaEntry>,
    pub content_type: Option<ContentType>,
    pub damage: Vec<Box2>,
    /// index 0: buffer for the next flip, index 1: buffer of the last flip
    pub custom_scanout: [Option<Arc<CustomScanout>>; 2],
}

/// A lifecycle transition requested by an external thread; the render
/// thread performs it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LifecycleRequest {
    ChangeMode(ConnectorMode),
    Suspend,
    Resume,
    Uninitialize,
}

pub(crate) struct LifecycleState {
    pub state: ConnectorState,
    pub request: Option<LifecycleRequest>,
    pub current_mode: Option<ConnectorMode>,
}

pub(crate) struct ConnectorInner {
    pub device: Arc<Device>,
    pub handle: connector::Handle,
    pub meta: RwLock<ConnectorMeta>,

    pub state: Mutex<LifecycleState>,
    pub state_cond: Condvar,
    pub props: Mutex<SharedProps>,
    pub assignment: Mutex<Option<Assignment>>,
    pub strategy_kind: Mutex<Option<StrategyKind>>,

    pub repaint_requested: Mutex<bool>,
    pub repaint_cond: Condvar,

    pub pending_vsync: AtomicBool,
    pub current_vsync: AtomicBool,
    pub max_refresh_rate: AtomicI32,
    pub refresh_ns: AtomicU32,

    pub pending_flip: AtomicBool,
    pub first_flip: AtomicBool,
    pub dead: AtomicBool,
    pub in_paint: AtomicBool,
    pub lock_current_buffer: AtomicBool,

    pub presentation: Mutex<PresentationTime>,
    pub buffer_count: AtomicUsize,
    pub buffer_index: AtomicUsize,
    pub slot_info: Mutex<Vec<SlotDescriptor>>,

    pub thread: Mutex<Option<JoinHandle<()>>>,
    pub init_result: Mutex<Option<Result<(), Error>>>,
    pub init_cond: Condvar,
}

/// A physical output of a [`Device`].
#[derive(Clone)]
pub struct Connector {
    pub(crate) inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("handle", &self.inner.handle)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

fn interface_prefix(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Writeback => "Writeback",
        Interface::SPI => "SPI",
        _ => "Unknown",
    }
}

impl Connector {
    /// Wrap a connector of `device` and read its metadata.
    pub fn new(device: Arc<Device>, handle: connector::Handle) -> Result<Connector, Error> {
        let connector = Connector {
            inner: Arc::new(ConnectorInner {
                device,
                handle,
                meta: RwLock::new(ConnectorMeta::default()),
                state: Mutex::new(LifecycleState {
                    state: ConnectorState::Uninitialized,
                    request: None,
                    current_mode: None,
                }),
                state_cond: Condvar::new(),
                props: Mutex::new(SharedProps::default()),
                assignment: Mutex::new(None),
                strategy_kind: Mutex::new(None),
                repaint_requested: Mutex::new(false),
                repaint_cond: Condvar::new(),
                pending_vsync: AtomicBool::new(true),
                current_vsync: AtomicBool::new(true),
                max_refresh_rate: AtomicI32::new(0),
                refresh_ns: AtomicU32::new(0),
                pending_flip: AtomicBool::new(false),
                first_flip: AtomicBool::new(true),
                dead: AtomicBool::new(false),
                in_paint: AtomicBool::new(false),
                lock_current_buffer: AtomicBool::new(false),
                presentation: Mutex::new(PresentationTime::default()),
                buffer_count: AtomicUsize::new(0),
                buffer_index: AtomicUsize::new(0),
                slot_info: Mutex::new(Vec::new()),
                thread: Mutex::new(None),
                init_result: Mutex::new(None),
                init_cond: Condvar::new(),
            }),
        };
        connector.update()?;
        connector
            .inner
            .device
            .register_connector(Arc::downgrade(&connector.inner));
        Ok(connector)
    }

    /// Re-read metadata from the kernel. Call on hotplug events.
    pub fn update(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let fd = inner.device.fd();
        let info = fd.get_connector(inner.handle, false).map_err(|source| {
            Error::access("Could not get connector info", inner.device.path().cloned(), source)
        })?;

        let mut meta = ConnectorMeta {
            connected: info.state() == connector::State::Connected,
            mm_size: info.size().unwrap_or((0, 0)),
            subpixel: info.subpixel().into(),
            name: format!("{}-{}", interface_prefix(info.interface()), info.interface_id()),
            encoders: info.encoders().to_vec(),
            ..Default::default()
        };

        // property ids and their current values
        let props = fd.get_properties(inner.handle).map_err(|source| {
            Error::access("Could not get connector properties", inner.device.path().cloned(), source)
        })?;
        let (prop_handles, values) = props.as_props_and_values();
        for (&prop, &value) in prop_handles.iter().zip(values.iter()) {
            let Ok(prop_info) = fd.get_property(prop) else {
                continue;
            };
            match prop_info.name().to_string_lossy().as_ref() {
                "CRTC_ID" => meta.props.crtc_id = Some(prop),
                "DPMS" => meta.props.dpms = Some(prop),
                "EDID" => meta.props.edid = Some(prop),
                "link-status" => meta.props.link_status = Some(prop),
                "non-desktop" => {
                    meta.props.non_desktop = Some(prop);
                    meta.non_desktop = value == 1;
                }
                "content type" => meta.props.content_type = Some(prop),
                "panel orientation" => meta.props.panel_orientation = Some(prop),
                "subconnector" => meta.props.subconnector = Some(prop),
                "vrr_capable" => {
                    meta.props.vrr_capable = Some(prop);
                    meta.vrr_capable = value == 1;
                }
                _ => {}
            }
        }

        if meta.connected {
            self.read_display_identity(&mut meta);
        }

        // modes, preferred first by flag, else by area
        meta.modes = info.modes().iter().map(|&m| ConnectorMode::new(m)).collect();
        meta.preferred = meta
            .modes
            .iter()
            .position(|m| m.is_preferred())
            .or_else(|| {
                meta.modes
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, m)| m.width() * m.height())
                    .map(|(i, _)| i)
            });

        let preferred = meta.preferred.map(|i| meta.modes[i]);
        *inner.meta.write().unwrap() = meta;

        // default to the preferred mode while uninitialized
        let mut state = inner.state.lock().unwrap();
        if state.state == ConnectorState::Uninitialized {
            state.current_mode = preferred;
        }
        Ok(())
    }

    fn read_display_identity(&self, meta: &mut ConnectorMeta) {
        let fd = self.inner.device.fd();
        let Some(edid_prop) = meta.props.edid else {
            return;
        };
        let props = match fd.get_properties(self.inner.handle) {
            Ok(props) => props,
            Err(_) => return,
        };
        let (prop_handles, values) = props.as_props_and_values();
        let Some(raw) = prop_handles
            .iter()
            .zip(values.iter())
            .find(|(&handle, _)| handle == edid_prop)
            .map(|(_, &value)| value)
        else {
            return;
        };
        let Ok(prop_info) = fd.get_property(edid_prop) else {
            return;
        };
        let Some(blob) = prop_info.value_type().convert_value(raw).as_blob() else {
            return;
        };
        let Ok(data) = fd.get_property_blob(blob) else {
            return;
        };
        match libdisplay_info::info::Info::parse_edid(&data) {
            Ok(edid) => {
                meta.make = edid.make();
                meta.model = edid.model();
                meta.serial = edid.serial();
            }
            Err(err) => {
                warn!(connector = %meta.name, "Failed to parse EDID: {}", err);
            }
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Start driving this connector. Fails if the connector is not
    /// `Uninitialized` or no viable hardware configuration exists.
    pub fn initialize(&self, handler: Box<dyn ConnectorHandler>) -> Result<(), Error> {
        renderer::initialize(self, handler)
    }

    /// Schedule exactly one paint. Idempotent within a frame.
    pub fn repaint(&self) -> Result<(), Error> {
        if self.inner.lock_current_buffer.load(Ordering::Acquire) {
            return Err(Error::InvalidState(self.state()));
        }
        let state = self.state();
        match state {
            ConnectorState::Initializing | ConnectorState::Initialized | ConnectorState::ChangingMode => {
                self.unlock_render_thread(true);
                Ok(())
            }
            other => Err(Error::InvalidState(other)),
        }
    }

    /// Request a mode change. The mode must come from [`modes`](Self::modes).
    pub fn set_mode(&self, mode: &ConnectorMode) -> Result<(), Error> {
        renderer::set_mode(self, mode)
    }

    /// Stop painting and disable the crtc, retaining all state.
    pub fn suspend(&self) -> Result<(), Error> {
        renderer::suspend(self)
    }

    /// Restore the crtc and resume painting after [`suspend`](Self::suspend).
    pub fn resume(&self) -> Result<(), Error> {
        renderer::resume(self)
    }

    /// Tear the renderer down. Blocks until the render thread exited.
    pub fn uninitialize(&self) {
        renderer::uninitialize(self)
    }

    /// Notification from the device enumerator that the output is gone.
    pub fn notify_unplugged(&self) {
        self.inner.dead.store(true, Ordering::Release);
        self.unlock_render_thread(false);
    }

    // -- cursor ------------------------------------------------------------

    /// Whether a hardware cursor is available.
    pub fn has_hardware_cursor(&self) -> bool {
        self.inner.props.lock().unwrap().cursor.is_some()
    }

    /// Show the cursor with the given 64x64 ARGB8888 pixels, or hide it.
    pub fn set_cursor(&self, pixels: Option<&[u8]>) -> Result<(), Error> {
        renderer::cursor::set_cursor(self, pixels)
    }

    /// Move the cursor hotspot.
    pub fn set_cursor_pos(&self, x: i32, y: i32) -> Result<(), Error> {
        renderer::cursor::set_cursor_pos(self, x, y)
    }

    // -- gamma, content type, damage ---------------------------------------

    /// Entries of the gamma table, 0 when unsupported or uninitialized.
    pub fn gamma_size(&self) -> u64 {
        self.inner
            .assignment
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.gamma_size)
            .unwrap_or(0)
    }

    /// Install a gamma table laid out as N red, N green, N blue values,
    /// where N is [`gamma_size`](Self::gamma_size).
    pub fn set_gamma(&self, table: &[u16]) -> Result<(), Error> {
        renderer::set_gamma(self, table)
    }

    /// Hint the display about the kind of content shown. Silently does
    /// nothing on displays without the property.
    pub fn set_content_type(&self, content_type: ContentType) {
        renderer::set_content_type(self, content_type)
    }

    /// The currently requested content type.
    pub fn content_type(&self) -> ContentType {
        self.inner
            .props
            .lock()
            .unwrap()
            .content_type
            .unwrap_or(ContentType::Graphics)
    }

    /// Whether damage hints reach the kernel or speed up the copy path.
    pub fn has_buffer_damage_support(&self) -> bool {
        renderer::has_buffer_damage_support(self)
    }

    /// Declare which parts of the next frame actually changed.
    pub fn set_buffer_damage(&self, rects: &[Rect]) -> Result<(), Error> {
        if !self.has_buffer_damage_support() {
            return Err(Error::InvalidState(self.state()));
        }
        let mut props = self.inner.props.lock().unwrap();
        props.damage = rects.iter().map(|&r| Box2::from(r)).collect();
        Ok(())
    }

    // -- vsync and pacing --------------------------------------------------

    /// Whether the device can flip without waiting for the retrace.
    pub fn has_vsync_control(&self) -> bool {
        let caps = self.inner.device.caps();
        let atomic = self.inner.device.is_atomic();
        (caps.async_page_flip && !atomic) || (caps.atomic_async_page_flip && atomic)
    }

    /// Whether flips currently wait for the vertical retrace.
    pub fn is_vsync_enabled(&self) -> bool {
        self.inner.pending_vsync.load(Ordering::Acquire)
    }

    /// Toggle vertical sync. Disabling fails without async flip support.
    pub fn enable_vsync(&self, enabled: bool) -> Result<(), Error> {
        if !enabled && !self.has_vsync_control() {
            return Err(Error::NoVsyncControl);
        }
        self.inner.pending_vsync.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Cap the flip rate while vsync is off. Negative disables the limit,
    /// zero picks roughly twice the current refresh rate.
    pub fn set_refresh_rate_limit(&self, hz: i32) {
        self.inner.max_refresh_rate.store(hz, Ordering::Release);
    }

    /// The current flip rate cap.
    pub fn refresh_rate_limit(&self) -> i32 {
        self.inner.max_refresh_rate.load(Ordering::Acquire)
    }

    /// Presentation details of the last frame on screen.
    pub fn presentation_time(&self) -> PresentationTime {
        *self.inner.presentation.lock().unwrap()
    }

    /// The clock presentation timestamps are measured on.
    pub fn presentation_clock(&self) -> ClockId {
        self.inner.device.presentation_clock()
    }

    // -- custom scanout ----------------------------------------------------

    /// Scan out a user buffer instead of the swapchain for this frame.
    /// Only valid while a `paint` callback is running.
    pub fn set_custom_scanout(&self, buffer: Option<&Dmabuf>) -> Result<(), Error> {
        renderer::set_custom_scanout(self, buffer)
    }

    /// Keep the current front buffer on screen and refuse repaints, e.g.
    /// while the owner samples its pixels.
    pub fn set_current_buffer_locked(&self, locked: bool) {
        self.inner.lock_current_buffer.store(locked, Ordering::Release);
    }

    /// Whether the front buffer is locked.
    pub fn is_current_buffer_locked(&self) -> bool {
        self.inner.lock_current_buffer.load(Ordering::Acquire)
    }

    // -- accessors ---------------------------------------------------------

    /// The kernel handle of this connector.
    pub fn handle(&self) -> connector::Handle {
        self.inner.handle
    }

    /// The device owning this connector.
    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        self.inner.state.lock().unwrap().state
    }

    /// Stable name such as `HDMI-A-1`.
    pub fn name(&self) -> String {
        self.inner.meta.read().unwrap().name.clone()
    }

    /// Monitor manufacturer from the EDID, if known.
    pub fn make(&self) -> Option<String> {
        self.inner.meta.read().unwrap().make.clone()
    }

    /// Monitor model from the EDID, if known.
    pub fn model(&self) -> Option<String> {
        self.inner.meta.read().unwrap().model.clone()
    }

    /// Monitor serial from the EDID, if known.
    pub fn serial(&self) -> Option<String> {
        self.inner.meta.read().unwrap().serial.clone()
    }

    /// Whether a display is attached.
    pub fn is_connected(&self) -> bool {
        self.inner.meta.read().unwrap().connected
    }

    /// Physical size in millimetres.
    pub fn physical_size(&self) -> (u32, u32) {
        self.inner.meta.read().unwrap().mm_size
    }

    /// Subpixel layout of the display.
    pub fn subpixel(&self) -> Subpixel {
        self.inner.meta.read().unwrap().subpixel
    }

    /// Whether the display asks not to be part of the desktop (VR etc).
    pub fn is_non_desktop(&self) -> bool {
        self.inner.meta.read().unwrap().non_desktop
    }

    /// Whether the display supports variable refresh rates.
    pub fn is_vrr_capable(&self) -> bool {
        self.inner.meta.read().unwrap().vrr_capable
    }

    /// All advertised modes.
    pub fn modes(&self) -> Vec<ConnectorMode> {
        self.inner.meta.read().unwrap().modes.clone()
    }

    /// The preferred mode, if the connector advertises any mode at all.
    pub fn preferred_mode(&self) -> Option<ConnectorMode> {
        let meta = self.inner.meta.read().unwrap();
        meta.preferred.map(|i| meta.modes[i])
    }

    /// The mode currently driven (or to be driven on initialize).
    pub fn current_mode(&self) -> Option<ConnectorMode> {
        self.inner.state.lock().unwrap().current_mode
    }

    /// Number of buffers in the swapchain, 0 while not initialized.
    pub fn buffer_count(&self) -> usize {
        self.inner.buffer_count.load(Ordering::Acquire)
    }

    /// Index of the buffer that will be painted next.
    pub fn current_buffer_index(&self) -> usize {
        self.inner.buffer_index.load(Ordering::Acquire)
    }

    /// Descriptors of the swapchain slots.
    pub fn images(&self) -> Vec<SlotDescriptor> {
        self.inner.slot_info.lock().unwrap().clone()
    }

    // -- internals ---------------------------------------------------------

    pub(crate) fn unlock_render_thread(&self, repaint: bool) {
        let mut requested = self.inner.repaint_requested.lock().unwrap();
        if repaint {
            *requested = true;
        }
        self.inner.repaint_cond.notify_one();
    }

    pub(crate) fn log_name(&self) -> String {
        format!(
            "{}:{}",
            self.inner
                .device
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| String::from("?")),
            self.inner.meta.read().unwrap().name
        )
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            debug!("Connector dropped with live render thread, joining");
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_and_sync<T: Send + Sync>() {}

    #[test]
    fn handles_cross_threads() {
        is_send_and_sync::<Connector>();
        is_send_and_sync::<crate::device::Device>();
    }

    #[test]
    fn interface_naming() {
        use drm::control::connector::Interface;
        assert_eq!(interface_prefix(Interface::HDMIA), "HDMI-A");
        assert_eq!(interface_prefix(Interface::EmbeddedDisplayPort), "eDP");
        assert_eq!(interface_prefix(Interface::DisplayPort), "DP");
        assert_eq!(format!("{}-{}", interface_prefix(Interface::HDMIA), 1), "HDMI-A-1");
    }

    #[test]
    fn content_type_raw_values() {
        assert_eq!(ContentType::Graphics.raw(), 1);
        assert_eq!(ContentType::Photo.raw(), 2);
        assert_eq!(ContentType::Video.raw(), 3);
        assert_eq!(ContentType::Game.raw(), 4);
    }
}
