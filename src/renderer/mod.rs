//! The per-connector renderer: render thread, state machine and the
//! lifecycle operations behind [`Connector`](crate::connector::Connector).
//!
//! External threads never mutate renderer state directly. They latch a
//! request (or a property change) and wake the render thread, which is
//! the only writer of the swapchain, the chosen hardware resources and
//! the flip bookkeeping.

use std::os::unix::io::OwnedFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use drm::control::{framebuffer, property, AtomicCommitFlags, Device as ControlDevice};
use tracing::{debug, info, warn};

pub(crate) mod atomic;
pub(crate) mod cursor;
pub(crate) mod flip;
pub(crate) mod strategy;
pub(crate) mod swapchain;

pub use strategy::StrategyKind;

use self::atomic::AtomicRequest;
use self::flip::wait_page_flip;
use self::strategy::{Strategy, StrategyEnv};
use crate::allocator::dmabuf::Dmabuf;
use crate::allocator::gbm::GbmBufferFlags;
use crate::allocator::Buffer;
use crate::connector::{
    Assignment, AtomicChanges, Connector, ConnectorHandler, ConnectorInner, ConnectorMode,
    ConnectorState, ContentType, CustomScanout, Frame, GammaEntry, LifecycleRequest,
};
use crate::device::{Device, FlipListener, PlaneKind};
use crate::error::Error;
use crate::format::{self, Format};
use crate::render::PaintContext;
use crate::utils::Rect;

/// `link-status` values of the kernel.
const LINK_STATUS_GOOD: u64 = 0;
const LINK_STATUS_BAD: u64 = 1;

/// Bounded drains around mode switches: three short poll iterations.
const BOUNDED_FLIP_WAIT: u32 = 3;

macro_rules! strategy_env {
    ($self:ident) => {
        StrategyEnv {
            scanout: &$self.device,
            render: &$self.render_device,
            ctx: &mut $self.paint_ctx,
            scanout_ctx: &mut $self.scanout_ctx,
        }
    };
}

// ---------------------------------------------------------------------------
// control-thread operations
// ---------------------------------------------------------------------------

/// Reserve hardware, spawn the render thread and wait for its verdict.
pub(crate) fn initialize(conn: &Connector, handler: Box<dyn ConnectorHandler>) -> Result<(), Error> {
    let inner = &conn.inner;

    {
        let mut state = inner.state.lock().unwrap();
        if state.state != ConnectorState::Uninitialized {
            return Err(Error::InvalidState(state.state));
        }
        if state.current_mode.is_none() {
            state.current_mode = conn.preferred_mode();
        }
        if state.current_mode.is_none() {
            return Err(Error::ModeNotSuitable);
        }
        state.state = ConnectorState::Initializing;
        state.request = None;
    }
    inner.state_cond.notify_all();

    let result = (|| -> Result<(), Error> {
        let device = &inner.device;

        // search and reservation happen under one lock, so two
        // connectors initializing at once cannot claim the same crtc
        let (encoder, crtc, primary, cursor_plane) = {
            let mut bindings = device.bindings.lock().unwrap();
            let (encoder, crtc, primary, cursor) =
                find_best_configuration(device, conn, &bindings).ok_or(Error::NoConfiguration)?;

            // legacy cursors are driver-placed; only the atomic engine owns a plane
            let cursor_plane = if device.is_atomic() && !device.env().force_legacy_cursor {
                cursor
            } else {
                None
            };

            bindings.encoders.insert(encoder, inner.handle);
            bindings.crtcs.insert(crtc, inner.handle);
            bindings.planes.insert(primary, inner.handle);
            if let Some(plane) = cursor_plane {
                bindings.planes.insert(plane, inner.handle);
            }
            (encoder, crtc, primary, cursor_plane)
        };

        let gamma_size = device.crtc(crtc).map(|c| c.gamma_size).unwrap_or(0);
        *inner.assignment.lock().unwrap() = Some(Assignment {
            encoder,
            crtc,
            primary_plane: primary,
            cursor_plane,
            gamma_size,
        });

        let listener: Weak<dyn FlipListener> = Arc::downgrade(&conn.inner) as _;
        device.register_flip_listener(crtc, listener);

        inner.dead.store(false, Ordering::Release);
        inner.first_flip.store(true, Ordering::Release);
        inner.pending_flip.store(false, Ordering::Release);

        init_gamma(conn, gamma_size);

        *inner.init_result.lock().unwrap() = None;
        let thread_conn = conn.clone();
        let thread = std::thread::Builder::new()
            .name(format!("scanout-{}", conn.name()))
            .spawn(move || run_render_thread(thread_conn, handler))
            .map_err(Error::ThreadSpawn)?;
        *inner.thread.lock().unwrap() = Some(thread);

        let mut result = inner.init_result.lock().unwrap();
        while result.is_none() {
            result = inner.init_cond.wait(result).unwrap();
        }
        result.take().unwrap()
    })();

    match result {
        Ok(()) => {
            let mut state = inner.state.lock().unwrap();
            state.state = ConnectorState::Initialized;
            drop(state);
            inner.state_cond.notify_all();
            debug!(connector = %conn.log_name(), "Initialized");
            Ok(())
        }
        Err(err) => {
            if let Some(thread) = inner.thread.lock().unwrap().take() {
                let _ = thread.join();
            }
            release_hardware(conn);
            let mut state = inner.state.lock().unwrap();
            state.state = ConnectorState::Uninitialized;
            drop(state);
            inner.state_cond.notify_all();
            warn!(connector = %conn.log_name(), "Initialization failed: {}", err);
            Err(err)
        }
    }
}

/// Request a mode change and wait for the render thread's verdict.
pub(crate) fn set_mode(conn: &Connector, mode: &ConnectorMode) -> Result<(), Error> {
    let inner = &conn.inner;

    if !conn.modes().iter().any(|m| m == mode) {
        return Err(Error::ModeNotSuitable);
    }
    if inner.dead.load(Ordering::Acquire) {
        return Err(Error::ConnectorDead);
    }

    let mut state = inner.state.lock().unwrap();
    if state.current_mode.as_ref() == Some(mode) {
        // setting the current mode is a no-op
        return Ok(());
    }
    match state.state {
        ConnectorState::Uninitialized => {
            state.current_mode = Some(*mode);
            Ok(())
        }
        ConnectorState::Initialized => {
            state.request = Some(LifecycleRequest::ChangeMode(*mode));
            drop(state);
            conn.unlock_render_thread(false);

            let mut state = inner.state.lock().unwrap();
            loop {
                if inner.dead.load(Ordering::Acquire) {
                    return Err(Error::ConnectorDead);
                }
                if state.request.is_none() && state.state == ConnectorState::Initialized {
                    break;
                }
                state = inner.state_cond.wait(state).unwrap();
            }
            if state.current_mode.as_ref() == Some(mode) {
                Ok(())
            } else {
                Err(Error::ModeNotSuitable)
            }
        }
        other => Err(Error::InvalidState(other)),
    }
}

/// Stop painting; returns once the crtc has been disabled.
pub(crate) fn suspend(conn: &Connector) -> Result<(), Error> {
    let inner = &conn.inner;
    loop {
        if inner.dead.load(Ordering::Acquire) {
            return Err(Error::ConnectorDead);
        }
        let mut state = inner.state.lock().unwrap();
        match state.state {
            ConnectorState::Suspended => return Ok(()),
            ConnectorState::Uninitialized | ConnectorState::Uninitializing => {
                return Err(Error::InvalidState(state.state))
            }
            ConnectorState::Initialized => {
                state.request = Some(LifecycleRequest::Suspend);
                // pending property changes die with the suspension
                inner.props.lock().unwrap().changes = AtomicChanges::empty();
                drop(state);
                conn.unlock_render_thread(false);
            }
            _ => {
                drop(state);
                conn.unlock_render_thread(true);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Bring a suspended connector back; schedules one repaint on success.
pub(crate) fn resume(conn: &Connector) -> Result<(), Error> {
    let inner = &conn.inner;
    loop {
        if inner.dead.load(Ordering::Acquire) {
            return Err(Error::ConnectorDead);
        }
        let mut state = inner.state.lock().unwrap();
        match state.state {
            ConnectorState::Initialized => {
                drop(state);
                conn.unlock_render_thread(true);
                return Ok(());
            }
            ConnectorState::Uninitialized | ConnectorState::Uninitializing => {
                return Err(Error::InvalidState(state.state))
            }
            ConnectorState::Suspended => {
                state.request = Some(LifecycleRequest::Resume);
                drop(state);
                conn.unlock_render_thread(false);
            }
            _ => {
                drop(state);
                conn.unlock_render_thread(false);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Tear the connector down and release all hardware. Blocks until the
/// render thread has exited.
pub(crate) fn uninitialize(conn: &Connector) {
    let inner = &conn.inner;

    // wait transitional states out
    loop {
        let state = inner.state.lock().unwrap().state;
        match state {
            ConnectorState::Initializing
            | ConnectorState::ChangingMode
            | ConnectorState::RevertingMode => std::thread::sleep(Duration::from_millis(20)),
            ConnectorState::Uninitialized | ConnectorState::Uninitializing => return,
            _ => break,
        }
    }

    {
        let mut state = inner.state.lock().unwrap();
        state.state = ConnectorState::Uninitializing;
        state.request = Some(LifecycleRequest::Uninitialize);
    }
    inner.state_cond.notify_all();

    loop {
        conn.unlock_render_thread(false);
        if inner.state.lock().unwrap().state == ConnectorState::Uninitialized {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    if let Some(thread) = inner.thread.lock().unwrap().take() {
        let _ = thread.join();
    }
    release_hardware(conn);
    debug!(connector = %conn.log_name(), "Uninitialized");
}

/// Install a gamma table published by the owner.
pub(crate) fn set_gamma(conn: &Connector, table: &[u16]) -> Result<(), Error> {
    let inner = &conn.inner;
    let Some(assignment) = *inner.assignment.lock().unwrap() else {
        return Err(Error::InvalidState(conn.state()));
    };
    let size = assignment.gamma_size as usize;
    if size == 0 {
        return Err(Error::NoGamma);
    }
    if table.len() != size * 3 {
        return Err(Error::GammaSizeMismatch(table.len(), size));
    }

    let (red, rest) = table.split_at(size);
    let (green, blue) = rest.split_at(size);

    let device = &inner.device;
    let atomic_lut = device.is_atomic()
        && device
            .crtc(assignment.crtc)
            .map(|c| c.props.gamma_lut.is_some())
            .unwrap_or(false);

    {
        let mut props = inner.props.lock().unwrap();
        props.gamma = (0..size)
            .map(|i| GammaEntry {
                red: red[i],
                green: green[i],
                blue: blue[i],
                reserved: 0,
            })
            .collect();
        if atomic_lut {
            props.changes |= AtomicChanges::GAMMA_LUT;
        }
    }

    if atomic_lut {
        conn.unlock_render_thread(false);
        Ok(())
    } else {
        device
            .fd()
            .set_gamma(assignment.crtc, red, green, blue)
            .map_err(|source| Error::access("Failed to set legacy gamma", device.path().cloned(), source))
    }
}

/// Latch or write the content-type hint.
pub(crate) fn set_content_type(conn: &Connector, content_type: ContentType) {
    let inner = &conn.inner;
    let prop = inner.meta.read().unwrap().props.content_type;

    {
        let mut props = inner.props.lock().unwrap();
        if props.content_type == Some(content_type) {
            return;
        }
        props.content_type = Some(content_type);
        if prop.is_none() {
            // stored for later displays, nothing to tell this one
            return;
        }
        if inner.device.is_atomic() {
            props.changes |= AtomicChanges::CONTENT_TYPE;
        }
    }

    if inner.device.is_atomic() {
        conn.unlock_render_thread(false);
    } else if let Some(prop) = prop {
        if let Err(err) = inner
            .device
            .fd()
            .set_property(inner.handle, prop, content_type.raw())
        {
            debug!(connector = %conn.log_name(), "Failed to set content type: {}", err);
        }
    }
}

/// Whether damage reaches the kernel or shortens the copy paths.
pub(crate) fn has_buffer_damage_support(conn: &Connector) -> bool {
    let inner = &conn.inner;
    if let Some(assignment) = *inner.assignment.lock().unwrap() {
        if inner
            .device
            .plane(assignment.primary_plane)
            .map(|p| p.props.fb_damage_clips.is_some())
            .unwrap_or(false)
        {
            return true;
        }
    }
    match *inner.strategy_kind.lock().unwrap() {
        // the self strategy scans out what was painted, damage cannot help
        Some(StrategyKind::Direct) => false,
        Some(_) => true,
        None => !inner.device.is_render_device(),
    }
}

/// Accept a user buffer for direct scanout; only valid inside `paint`.
pub(crate) fn set_custom_scanout(conn: &Connector, buffer: Option<&Dmabuf>) -> Result<(), Error> {
    let inner = &conn.inner;
    let device = &inner.device;

    if !inner.in_paint.load(Ordering::Acquire) || device.env().disable_custom_scanout {
        return Err(Error::UnsupportedScanoutBuffer("only accepted during paint"));
    }

    let Some(buffer) = buffer else {
        inner.props.lock().unwrap().custom_scanout[0] = None;
        return Ok(());
    };

    let mode = inner
        .state
        .lock()
        .unwrap()
        .current_mode
        .ok_or(Error::ModeNotSuitable)?;
    if buffer.width() != mode.width() || buffer.height() != mode.height() {
        return Err(Error::UnsupportedScanoutBuffer("size does not match the current mode"));
    }

    let assignment = inner
        .assignment
        .lock()
        .unwrap()
        .ok_or(Error::InvalidState(ConnectorState::Uninitialized))?;
    let plane = device
        .plane(assignment.primary_plane)
        .ok_or(Error::UnsupportedScanoutBuffer("primary plane vanished"))?;

    // the plane must take the format, possibly through its opaque sibling
    let mut fmt = buffer.format();
    if !plane.formats.contains(&fmt) {
        let substitute = format::opaque_substitute(fmt.code)
            .map(|code| Format { code, modifier: fmt.modifier });
        match substitute.filter(|s| plane.formats.contains(s)) {
            Some(substitute) => fmt = substitute,
            None => return Err(Error::UnsupportedScanoutBuffer("format not supported by the primary plane")),
        }
    }

    let bo: crate::allocator::gbm::GbmBuffer<()> = buffer
        .import_to(device.gbm().as_ref(), GbmBufferFlags::SCANOUT)
        .map_err(Error::Allocation)?;
    let fb = device.add_framebuffer(&bo, buffer.has_modifier())?;

    inner.props.lock().unwrap().custom_scanout[0] = Some(Arc::new(CustomScanout {
        device: device.clone(),
        fb,
        format: fmt,
        _bo: bo,
    }));
    Ok(())
}

// ---------------------------------------------------------------------------
// configuration search and cleanup
// ---------------------------------------------------------------------------

/// Score (encoder, crtc, primary plane, cursor plane) combinations among
/// the free hardware of the device; a usable primary plane is worth 100,
/// a free cursor plane another 50.
fn find_best_configuration(
    device: &Arc<Device>,
    conn: &Connector,
    bindings: &crate::device::Bindings,
) -> Option<(
    drm::control::encoder::Handle,
    drm::control::crtc::Handle,
    drm::control::plane::Handle,
    Option<drm::control::plane::Handle>,
)> {
    let encoders = conn.inner.meta.read().unwrap().encoders.clone();

    let mut best = None;
    let mut best_score = 0;

    for encoder in device
        .encoders()
        .iter()
        .filter(|e| encoders.contains(&e.handle) && !bindings.encoders.contains_key(&e.handle))
    {
        for &crtc in &encoder.possible_crtcs {
            if bindings.crtcs.contains_key(&crtc) {
                continue;
            }

            let free_plane = |kind: PlaneKind| {
                device.planes().iter().find(|p| {
                    p.kind == kind
                        && !bindings.planes.contains_key(&p.handle)
                        && p.possible_crtcs.contains(&crtc)
                })
            };

            let Some(primary) = free_plane(PlaneKind::Primary) else {
                continue;
            };
            let cursor = free_plane(PlaneKind::Cursor);

            let score = 100 + if cursor.is_some() { 50 } else { 0 };
            if score > best_score {
                best_score = score;
                best = Some((
                    encoder.handle,
                    crtc,
                    primary.handle,
                    cursor.map(|p| p.handle),
                ));
            }
        }
    }

    best
}

fn release_hardware(conn: &Connector) {
    let inner = &conn.inner;
    let device = &inner.device;

    if let Some(assignment) = inner.assignment.lock().unwrap().take() {
        device.unregister_flip_listener(assignment.crtc);
        let mut bindings = device.bindings.lock().unwrap();
        bindings.encoders.remove(&assignment.encoder);
        bindings.crtcs.remove(&assignment.crtc);
        bindings.planes.remove(&assignment.primary_plane);
        if let Some(cursor_plane) = assignment.cursor_plane {
            bindings.planes.remove(&cursor_plane);
            drop(bindings);
            cursor::offer_cursor_plane(inner, cursor_plane);
        }
    }

    *inner.strategy_kind.lock().unwrap() = None;
    inner.slot_info.lock().unwrap().clear();
    inner.buffer_count.store(0, Ordering::Release);
    inner.buffer_index.store(0, Ordering::Release);
    inner.props.lock().unwrap().custom_scanout = [None, None];
}

fn init_gamma(conn: &Connector, gamma_size: u64) {
    if gamma_size == 0 {
        debug!(connector = %conn.log_name(), "No gamma correction support");
        return;
    }
    let size = gamma_size as usize;
    let last = (size - 1) as f64;
    let ramp: Vec<u16> = (0..size)
        .map(|i| (u16::MAX as f64 * (i as f64 / last)) as u16)
        .collect();

    let mut table = Vec::with_capacity(size * 3);
    table.extend_from_slice(&ramp);
    table.extend_from_slice(&ramp);
    table.extend_from_slice(&ramp);

    if let Err(err) = set_gamma(conn, &table) {
        debug!(connector = %conn.log_name(), "Failed to install linear gamma: {}", err);
    }
}

// ---------------------------------------------------------------------------
// the render thread
// ---------------------------------------------------------------------------

pub(crate) struct RendererState {
    pub conn: Connector,
    pub handler: Box<dyn ConnectorHandler>,
    pub device: Arc<Device>,
    pub render_device: Arc<Device>,
    pub assignment: Assignment,
    pub paint_ctx: Box<dyn PaintContext>,
    pub scanout_ctx: Option<Box<dyn PaintContext>>,
    pub strategy: Strategy,
    pub mode: ConnectorMode,
    pub mode_blob: u64,
    pub gamma_blob: u64,
    pub last_fb: Option<framebuffer::Handle>,
    pub fence: Option<OwnedFd>,
}

fn run_render_thread(conn: Connector, handler: Box<dyn ConnectorHandler>) {
    profiling::register_thread!("scanout renderer");
    let inner = conn.inner.clone();

    let mut rs = match RendererState::bootstrap(conn.clone(), handler) {
        Ok(rs) => {
            *inner.init_result.lock().unwrap() = Some(Ok(()));
            inner.init_cond.notify_all();
            rs
        }
        Err(err) => {
            cursor::destroy_cursor(&inner);
            *inner.init_result.lock().unwrap() = Some(Err(err));
            inner.init_cond.notify_all();
            return;
        }
    };

    loop {
        // latch the vsync toggle for this cycle
        let vsync = inner.pending_vsync.load(Ordering::Acquire);
        inner.current_vsync.store(vsync, Ordering::Release);

        wait_for_wakeup(&inner);

        // teardown outranks everything else, even a dead display
        let uninit = matches!(
            inner.state.lock().unwrap().request,
            Some(LifecycleRequest::Uninitialize)
        );
        if uninit {
            inner.state.lock().unwrap().request = None;
            rs.teardown();
            publish_state(&inner, ConnectorState::Uninitialized);
            return;
        }

        if inner.dead.load(Ordering::Acquire) {
            // drop everything that was pending; the display is gone
            let request = inner.state.lock().unwrap().request.take();
            let had_repaint = take_repaint_flag(&inner);
            inner.props.lock().unwrap().changes = AtomicChanges::empty();
            if request.is_some() {
                inner.state_cond.notify_all();
            }
            if had_repaint {
                rs.handler.discarded(&conn);
            }
            continue;
        }

        // take the request and enter its transitional state in one step,
        // so waiters never observe a half-applied transition
        let request = {
            let mut state = inner.state.lock().unwrap();
            let request = state.request.take();
            match request {
                Some(LifecycleRequest::ChangeMode(_)) => state.state = ConnectorState::ChangingMode,
                Some(LifecycleRequest::Suspend) => state.state = ConnectorState::Suspending,
                Some(LifecycleRequest::Resume) => state.state = ConnectorState::Resuming,
                _ => {}
            }
            request
        };

        match request {
            Some(LifecycleRequest::ChangeMode(target)) => rs.change_mode(target),
            Some(LifecycleRequest::Suspend) => rs.pause_rendering(),
            Some(LifecycleRequest::Resume) => rs.resume_rendering(),
            Some(LifecycleRequest::Uninitialize) => unreachable!(),
            None => {
                let state = inner.state.lock().unwrap().state;
                if state == ConnectorState::Initialized {
                    if take_repaint_flag(&inner) {
                        rs.render_frame();
                    } else if !inner.props.lock().unwrap().changes.is_empty() {
                        rs.commit_props_only();
                    }
                } else if take_repaint_flag(&inner) {
                    rs.handler.discarded(&conn);
                }
            }
        }
    }
}

fn wait_for_wakeup(inner: &Arc<ConnectorInner>) {
    let mut requested = inner.repaint_requested.lock().unwrap();
    loop {
        let state = inner.state.lock().unwrap();
        let has_request = state.request.is_some();
        let initialized = state.state == ConnectorState::Initialized;
        drop(state);
        let has_changes = initialized && !inner.props.lock().unwrap().changes.is_empty();

        if *requested || has_request || has_changes || inner.dead.load(Ordering::Acquire) {
            break;
        }
        requested = inner.repaint_cond.wait(requested).unwrap();
    }
}

fn take_repaint_flag(inner: &ConnectorInner) -> bool {
    let mut requested = inner.repaint_requested.lock().unwrap();
    std::mem::take(&mut *requested)
}

fn publish_state(inner: &ConnectorInner, state: ConnectorState) {
    inner.state.lock().unwrap().state = state;
    inner.state_cond.notify_all();
}

impl RendererState {
    fn bootstrap(conn: Connector, handler: Box<dyn ConnectorHandler>) -> Result<RendererState, Error> {
        let inner = conn.inner.clone();
        let device = inner.device.clone();
        let render_device = device.render_device().unwrap_or_else(|| device.clone());

        let engine = render_device.paint_engine().ok_or(Error::NoPaintEngine)?;
        let mut paint_ctx = engine.create_context()?;
        let mut scanout_ctx: Option<Box<dyn PaintContext>> = None;

        cursor::create_cursor(&inner);

        let assignment = inner.assignment.lock().unwrap().ok_or(Error::NoConfiguration)?;
        let mode = inner
            .state
            .lock()
            .unwrap()
            .current_mode
            .ok_or(Error::ModeNotSuitable)?;
        inner.refresh_ns.store(mode.period_ns(), Ordering::Release);

        let strategy = {
            let mut env = StrategyEnv {
                scanout: &device,
                render: &render_device,
                ctx: &mut paint_ctx,
                scanout_ctx: &mut scanout_ctx,
            };
            let primary = device
                .plane(assignment.primary_plane)
                .ok_or(Error::NoConfiguration)?;
            strategy::select(&mut env, &conn.log_name(), &mode, primary)?
        };

        *inner.strategy_kind.lock().unwrap() = Some(strategy.kind());
        inner.buffer_count.store(strategy.buffers_count(), Ordering::Release);
        inner.buffer_index.store(strategy.current_index(), Ordering::Release);
        *inner.slot_info.lock().unwrap() = strategy.descriptors();

        let mut rs = RendererState {
            conn,
            handler,
            device,
            render_device,
            assignment,
            paint_ctx,
            scanout_ctx,
            strategy,
            mode,
            mode_blob: 0,
            gamma_blob: 0,
            last_fb: None,
            fence: None,
        };

        if let Err(err) = rs.init_crtc() {
            let mut env = strategy_env!(rs);
            rs.strategy.teardown(&mut env);
            return Err(err);
        }
        Ok(rs)
    }

    /// First mode set: light the crtc up with the slot after the current
    /// one, then let the owner set its GL state up.
    fn init_crtc(&mut self) -> Result<(), Error> {
        let fb = self.strategy.next_fb();
        self.enable_pipeline(fb)?;

        let state = self.conn.inner.state.lock().unwrap().state;
        let conn = self.conn.clone();
        let mut env = strategy_env!(self);
        self.strategy.bind_current(&mut env)?;
        let image = self.strategy.current_image();
        let mut frame = Frame {
            ctx: self.paint_ctx.as_mut(),
            image,
            size: (self.mode.width(), self.mode.height()),
            age: self.strategy.current_age(),
            connector: &conn,
        };
        match state {
            ConnectorState::ChangingMode | ConnectorState::RevertingMode => {
                self.handler.resized(&mut frame)
            }
            _ => self.handler.initialized(&mut frame),
        }
        self.paint_ctx.finish();
        Ok(())
    }

    /// Full modeset commit carrying all latched property changes.
    fn enable_pipeline(&mut self, fb: framebuffer::Handle) -> Result<(), Error> {
        self.last_fb = Some(fb);
        let inner = self.conn.inner.clone();

        if self.device.is_atomic() {
            self.device.destroy_blob(self.mode_blob);
            self.mode_blob = 0;
            let blob = self
                .device
                .fd()
                .create_property_blob(self.mode.raw())
                .map_err(|source| {
                    Error::access("Failed to create mode blob", self.device.path().cloned(), source)
                })?;
            self.mode_blob = blob.into();

            let mut guard = inner.props.lock().unwrap();
            let props = &mut *guard;
            let meta_props = inner.meta.read().unwrap().props;

            let mut req = AtomicRequest::new(&self.device);
            self.add_pipeline_props(&mut req, fb);
            let staged = atomic::stage_shared_props(
                &self.device,
                inner.handle,
                &meta_props,
                &self.assignment,
                props,
                &mut self.gamma_blob,
                -1,
                &mut req,
            );
            let result = req.commit_with_retry(AtomicCommitFlags::ALLOW_MODESET);
            match result {
                Ok(()) => {
                    atomic::clear_on_success(props, &staged);
                    return Ok(());
                }
                Err(err) => {
                    atomic::unstage_on_failure(props, &staged);
                    debug!(
                        connector = %self.conn.log_name(),
                        "Atomic mode set failed ({}), falling back to the legacy ioctl", err
                    );
                }
            }
        }

        // the legacy path, and the workaround when the atomic one refuses
        self.device
            .fd()
            .set_crtc(
                self.assignment.crtc,
                Some(fb),
                (0, 0),
                &[inner.handle],
                Some(*self.mode.raw()),
            )
            .map_err(|source| {
                Error::access("Failed to set crtc mode", self.device.path().cloned(), source)
            })
    }

    fn add_pipeline_props(&self, req: &mut AtomicRequest<'_>, fb: framebuffer::Handle) {
        let inner = &self.conn.inner;
        let meta_props = inner.meta.read().unwrap().props;
        let crtc = self.assignment.crtc;

        if let Some(plane) = self.device.plane(self.assignment.primary_plane) {
            let p = plane.props;
            if let Some(prop) = p.fb_id {
                req.add(plane.handle, prop, property::Value::Framebuffer(Some(fb)));
            }
            if let Some(prop) = p.crtc_id {
                req.add(plane.handle, prop, property::Value::CRTC(Some(crtc)));
            }
            if let Some(prop) = p.crtc_x {
                req.add(plane.handle, prop, property::Value::SignedRange(0));
            }
            if let Some(prop) = p.crtc_y {
                req.add(plane.handle, prop, property::Value::SignedRange(0));
            }
            if let Some(prop) = p.crtc_w {
                req.add(plane.handle, prop, property::Value::UnsignedRange(self.mode.width() as u64));
            }
            if let Some(prop) = p.crtc_h {
                req.add(plane.handle, prop, property::Value::UnsignedRange(self.mode.height() as u64));
            }
            if let Some(prop) = p.src_x {
                req.add(plane.handle, prop, property::Value::UnsignedRange(0));
            }
            if let Some(prop) = p.src_y {
                req.add(plane.handle, prop, property::Value::UnsignedRange(0));
            }
            if let Some(prop) = p.src_w {
                req.add(
                    plane.handle,
                    prop,
                    property::Value::UnsignedRange((self.mode.width() as u64) << 16),
                );
            }
            if let Some(prop) = p.src_h {
                req.add(
                    plane.handle,
                    prop,
                    property::Value::UnsignedRange((self.mode.height() as u64) << 16),
                );
            }
        }

        if let Some(crtc_res) = self.device.crtc(crtc) {
            if let Some(prop) = crtc_res.props.mode_id {
                req.add(crtc, prop, property::Value::Unknown(self.mode_blob));
            }
            if let Some(prop) = crtc_res.props.active {
                req.add(crtc, prop, property::Value::Boolean(true));
            }
        }

        if let Some(prop) = meta_props.crtc_id {
            req.add(inner.handle, prop, property::Value::CRTC(Some(crtc)));
        }
        if let Some(prop) = meta_props.link_status {
            req.add(inner.handle, prop, property::Value::UnsignedRange(LINK_STATUS_GOOD));
        }
    }

    /// Detach the pipeline: crtc off, plane unbound, link-status bad.
    fn reset_pipeline(&mut self) {
        let inner = self.conn.inner.clone();
        wait_page_flip(&self.conn, Some(BOUNDED_FLIP_WAIT));
        inner.pending_flip.store(false, Ordering::Release);

        if !self.device.is_atomic() {
            if let Err(err) = self
                .device
                .fd()
                .set_crtc(self.assignment.crtc, None, (0, 0), &[], None)
            {
                debug!(connector = %self.conn.log_name(), "Failed to disable crtc: {}", err);
            }
            return;
        }

        let mut guard = inner.props.lock().unwrap();
        let props = &mut *guard;
        let meta_props = inner.meta.read().unwrap().props;
        let crtc = self.assignment.crtc;

        let mut req = AtomicRequest::new(&self.device);
        if let Some(crtc_res) = self.device.crtc(crtc) {
            if let Some(prop) = crtc_res.props.mode_id {
                req.add(crtc, prop, property::Value::Unknown(0));
            }
            if let Some(prop) = crtc_res.props.active {
                req.add(crtc, prop, property::Value::Boolean(false));
            }
        }
        if let Some(prop) = meta_props.crtc_id {
            req.add(inner.handle, prop, property::Value::CRTC(None));
        }
        if let Some(prop) = meta_props.link_status {
            req.add(inner.handle, prop, property::Value::UnsignedRange(LINK_STATUS_BAD));
        }
        if let Some(plane) = self.device.plane(self.assignment.primary_plane) {
            let p = plane.props;
            if let Some(prop) = p.crtc_id {
                req.add(plane.handle, prop, property::Value::CRTC(None));
            }
            if let Some(prop) = p.fb_id {
                req.add(plane.handle, prop, property::Value::Framebuffer(None));
            }
            for prop in [p.crtc_x, p.crtc_y].into_iter().flatten() {
                req.add(plane.handle, prop, property::Value::SignedRange(0));
            }
            for prop in [p.crtc_w, p.crtc_h, p.src_x, p.src_y, p.src_w, p.src_h]
                .into_iter()
                .flatten()
            {
                req.add(plane.handle, prop, property::Value::UnsignedRange(0));
            }
        }

        let staged = atomic::stage_shared_props(
            &self.device,
            inner.handle,
            &meta_props,
            &self.assignment,
            props,
            &mut self.gamma_blob,
            -1,
            &mut req,
        );
        match req.commit_with_retry(AtomicCommitFlags::ALLOW_MODESET) {
            Ok(()) => atomic::clear_on_success(props, &staged),
            Err(err) => {
                atomic::unstage_on_failure(props, &staged);
                debug!(connector = %self.conn.log_name(), "Failed to reset pipeline: {}", err);
            }
        }
    }

    // -- painting ----------------------------------------------------------

    #[profiling::function]
    fn render_frame(&mut self) {
        let conn = self.conn.clone();
        let inner = conn.inner.clone();

        {
            let mut env = strategy_env!(self);
            if let Err(err) = self.strategy.bind_current(&mut env) {
                warn!(connector = %conn.log_name(), "Failed to bind the render target: {}", err);
                self.handler.discarded(&conn);
                return;
            }
        }

        inner.in_paint.store(true, Ordering::Release);
        {
            let image = self.strategy.current_image();
            let mut frame = Frame {
                ctx: self.paint_ctx.as_mut(),
                image,
                size: (self.mode.width(), self.mode.height()),
                age: self.strategy.current_age(),
                connector: &conn,
            };
            self.handler.paint(&mut frame);
        }
        inner.in_paint.store(false, Ordering::Release);

        let custom = inner.props.lock().unwrap().custom_scanout[0].clone();
        if let Some(custom) = custom {
            // the user buffer replaces the swapchain for this frame
            self.fence = None;
            self.submit_flip(custom.fb, custom.format);
            let time = conn.presentation_time();
            self.handler.presented(&conn, time);
        } else {
            let damage: Vec<Rect> = inner
                .props
                .lock()
                .unwrap()
                .damage
                .iter()
                .map(|b| Rect {
                    x: b.x1,
                    y: b.y1,
                    width: b.width(),
                    height: b.height(),
                })
                .collect();

            {
                let mut env = strategy_env!(self);
                if let Err(err) = self.strategy.prepare_present(&mut env, &damage) {
                    warn!(connector = %conn.log_name(), "Frame handoff failed: {}", err);
                    self.handler.discarded(&conn);
                    return;
                }
            }

            let want_fence = self.device.is_atomic()
                && self
                    .device
                    .plane(self.assignment.primary_plane)
                    .map(|p| p.props.in_fence_fd.is_some())
                    .unwrap_or(false);
            self.fence = {
                let mut env = strategy_env!(self);
                self.strategy.acquire_fence(&mut env, want_fence)
            };

            let fb = self.strategy.current_fb();
            let format = self.strategy.format();
            self.submit_flip(fb, format);

            self.strategy.mark_presented();
            self.strategy.advance();
            inner
                .buffer_index
                .store(self.strategy.current_index(), Ordering::Release);

            let time = conn.presentation_time();
            self.handler.presented(&conn, time);
        }

        // the buffer flipped one frame ago is no longer scanned out
        let mut props = inner.props.lock().unwrap();
        props.custom_scanout[1] = props.custom_scanout[0].take();
    }

    /// Re-commit the last framebuffer to carry pending property changes.
    fn commit_props_only(&mut self) {
        if let Some(fb) = self.last_fb {
            let format = self.strategy.format();
            self.submit_flip(fb, format);
        }
    }

    // -- mode changes, suspend, resume, teardown ---------------------------

    fn change_mode(&mut self, target: ConnectorMode) {
        let inner = self.conn.inner.clone();
        info!(connector = %self.conn.log_name(), "Changing mode to {}x{}@{}",
            target.width(), target.height(), target.refresh_rate());

        let previous = self.mode;
        match self.apply_mode(target) {
            Ok(()) => {
                let mut state = inner.state.lock().unwrap();
                state.current_mode = Some(target);
                state.state = ConnectorState::Initialized;
                drop(state);
                inner.state_cond.notify_all();
            }
            Err(err) => {
                warn!(connector = %self.conn.log_name(), "Mode change failed ({}), reverting", err);
                publish_state(&inner, ConnectorState::RevertingMode);
                match self.apply_mode(previous) {
                    Ok(()) => {
                        let mut state = inner.state.lock().unwrap();
                        state.current_mode = Some(previous);
                        state.state = ConnectorState::Initialized;
                        drop(state);
                        inner.state_cond.notify_all();
                    }
                    Err(revert_err) => {
                        warn!(
                            connector = %self.conn.log_name(),
                            "Mode revert failed too ({}), marking the connector dead", revert_err
                        );
                        inner.dead.store(true, Ordering::Release);
                        publish_state(&inner, ConnectorState::Initialized);
                    }
                }
            }
        }
    }

    fn apply_mode(&mut self, target: ConnectorMode) -> Result<(), Error> {
        let inner = self.conn.inner.clone();

        if target.same_size(&self.mode) {
            // the swapchain survives, only timings change
            self.mode = target;
            inner.refresh_ns.store(target.period_ns(), Ordering::Release);

            self.reset_pipeline();
            self.enable_pipeline(self.strategy.current_fb())?;

            let conn = self.conn.clone();
            let mut env = strategy_env!(self);
            self.strategy.bind_current(&mut env)?;
            let image = self.strategy.current_image();
            let mut frame = Frame {
                ctx: self.paint_ctx.as_mut(),
                image,
                size: (target.width(), target.height()),
                age: self.strategy.current_age(),
                connector: &conn,
            };
            self.handler.resized(&mut frame);
            self.paint_ctx.finish();
            return Ok(());
        }

        // the active area changes: the swapchain has to be rebuilt
        self.reset_pipeline();
        let kind = self.strategy.kind();
        let format = self.strategy.format();
        let count = self.strategy.buffers_count();
        {
            let mut env = strategy_env!(self);
            self.strategy.teardown(&mut env);
        }

        self.mode = target;
        inner.refresh_ns.store(target.period_ns(), Ordering::Release);

        let new_strategy = {
            let mut env = strategy_env!(self);
            strategy::create(kind, &mut env, &target, format, count)?
        };
        self.strategy = new_strategy;
        inner.buffer_count.store(self.strategy.buffers_count(), Ordering::Release);
        inner.buffer_index.store(self.strategy.current_index(), Ordering::Release);
        *inner.slot_info.lock().unwrap() = self.strategy.descriptors();

        self.init_crtc()
    }

    fn pause_rendering(&mut self) {
        let inner = self.conn.inner.clone();
        self.reset_pipeline();
        publish_state(&inner, ConnectorState::Suspended);
        debug!(connector = %self.conn.log_name(), "Suspended");
    }

    fn resume_rendering(&mut self) {
        let inner = self.conn.inner.clone();

        self.sync_state_after_resume();
        self.strategy.reset_ages();
        inner.first_flip.store(true, Ordering::Release);

        if let Some(fb) = self.last_fb {
            if let Err(err) = self.enable_pipeline(fb) {
                warn!(connector = %self.conn.log_name(), "Failed to restore the crtc: {}", err);
            }
        }

        publish_state(&inner, ConnectorState::Initialized);
        debug!(connector = %self.conn.log_name(), "Resumed");
    }

    /// Replay cursor, gamma and content-type after the display pipeline
    /// was owned by someone else.
    fn sync_state_after_resume(&mut self) {
        let inner = self.conn.inner.clone();
        let meta_props = inner.meta.read().unwrap().props;
        let atomic = self.device.is_atomic();
        let crtc = self.assignment.crtc;

        let mut guard = inner.props.lock().unwrap();
        let props = &mut *guard;

        if let Some(cursor) = props.cursor.as_ref() {
            if self.assignment.cursor_plane.is_some() {
                props.changes |= AtomicChanges::CURSOR_VISIBILITY | AtomicChanges::CURSOR_POSITION;
            } else {
                let fd = self.device.fd();
                let result = if cursor.visible {
                    fd.set_cursor(crtc, Some(&cursor.buffers[cursor.index].bo))
                } else {
                    fd.set_cursor(crtc, Option::<&crate::allocator::gbm::GbmBuffer<()>>::None)
                };
                if let Err(err) = result {
                    debug!(connector = %self.conn.log_name(), "Failed to restore legacy cursor: {}", err);
                }
                let _ = fd.move_cursor(crtc, (props.cursor_x, props.cursor_y));
            }
        }

        if atomic {
            if meta_props.content_type.is_some() && props.content_type.is_some() {
                props.changes |= AtomicChanges::CONTENT_TYPE;
            }
            if !props.gamma.is_empty() {
                props.changes |= AtomicChanges::GAMMA_LUT;
            }
        } else {
            if let (Some(prop), Some(content_type)) = (meta_props.content_type, props.content_type) {
                let _ = self.device.fd().set_property(inner.handle, prop, content_type.raw());
            }
            if !props.gamma.is_empty() {
                let red: Vec<u16> = props.gamma.iter().map(|e| e.red).collect();
                let green: Vec<u16> = props.gamma.iter().map(|e| e.green).collect();
                let blue: Vec<u16> = props.gamma.iter().map(|e| e.blue).collect();
                if let Err(err) = self.device.fd().set_gamma(crtc, &red, &green, &blue) {
                    debug!(connector = %self.conn.log_name(), "Failed to restore legacy gamma: {}", err);
                }
            }
        }
    }

    fn teardown(&mut self) {
        let inner = self.conn.inner.clone();
        let conn = self.conn.clone();

        wait_page_flip(&conn, Some(BOUNDED_FLIP_WAIT));
        inner.pending_flip.store(false, Ordering::Release);

        if take_repaint_flag(&inner) {
            self.handler.discarded(&conn);
        }
        self.handler.uninitialized(&conn);

        self.reset_pipeline();
        {
            let mut env = strategy_env!(self);
            self.strategy.teardown(&mut env);
        }
        cursor::destroy_cursor(&inner);

        self.device.destroy_blob(self.gamma_blob);
        self.gamma_blob = 0;
        self.device.destroy_blob(self.mode_blob);
        self.mode_blob = 0;
        self.fence = None;
    }
}
