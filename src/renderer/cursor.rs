//! The hardware cursor engine.
//!
//! Two 64x64 ARGB8888 buffers are held per connector. External updates
//! always land in the back buffer; the active index flips inside the
//! next atomic commit that carries the buffer change. Without an atomic
//! cursor plane the legacy ioctls are used and the kernel driver picks
//! the plane itself.

use drm::control::{AtomicCommitFlags, Device as ControlDevice};
use tracing::{debug, warn};

use super::atomic::AtomicRequest;
use crate::allocator::gbm::{GbmBuffer, GbmBufferFlags};
use crate::allocator::Modifier;
use crate::connector::{AtomicChanges, Connector, ConnectorInner};
use crate::error::Error;
use crate::format::Fourcc;

/// Edge length of the cursor image.
pub(crate) const CURSOR_SIDE: u32 = 64;
/// Bytes of one full cursor image.
pub(crate) const CURSOR_BYTES: usize = (CURSOR_SIDE * CURSOR_SIDE * 4) as usize;

pub(crate) struct CursorSlot {
    pub bo: GbmBuffer<()>,
    pub fb: Option<drm::control::framebuffer::Handle>,
}

/// Cursor double buffer, stored under the connector's property mutex.
pub(crate) struct CursorState {
    pub buffers: [CursorSlot; 2],
    pub index: usize,
    pub visible: bool,
}

/// Try to create the cursor buffers for an initialized connector.
///
/// Quietly leaves the connector without a cursor when the environment,
/// the driver or the allocation refuses.
pub(crate) fn create_cursor(inner: &ConnectorInner) {
    let device = &inner.device;
    let env = device.env();

    if env.disable_cursor {
        return;
    }
    if device.is_nvidia() && !env.nvidia_cursor {
        return;
    }

    let assignment = match *inner.assignment.lock().unwrap() {
        Some(assignment) => assignment,
        None => return,
    };

    let mut props = inner.props.lock().unwrap();
    if props.cursor.is_some() {
        return;
    }

    let blank = vec![0u8; CURSOR_BYTES];
    let mut slots = Vec::with_capacity(2);
    for _ in 0..2 {
        let bo = device.gbm().create_buffer_with_flags(
            CURSOR_SIDE,
            CURSOR_SIDE,
            Fourcc::Argb8888,
            &[Modifier::Invalid, Modifier::Linear],
            GbmBufferFlags::CURSOR | GbmBufferFlags::WRITE,
        );
        let mut bo = match bo {
            Ok(bo) => bo,
            Err(err) => {
                warn!(connector = ?inner.handle, "Failed to create cursor bo: {}", err);
                cleanup_slots(inner, slots);
                return;
            }
        };
        if let Err(err) = bo.write(&blank) {
            warn!(connector = ?inner.handle, "Failed to clear cursor bo: {}", err);
        }

        let fb = if assignment.cursor_plane.is_some() {
            match device.fd().add_framebuffer(&bo, 32, 32) {
                Ok(fb) => Some(fb),
                Err(err) => {
                    warn!(connector = ?inner.handle, "Failed to create cursor framebuffer: {}", err);
                    cleanup_slots(inner, slots);
                    return;
                }
            }
        } else {
            None
        };

        slots.push(CursorSlot { bo, fb });
    }

    if assignment.cursor_plane.is_none() {
        // legacy engine: hand the first buffer to the driver right away
        if let Err(err) = device.fd().set_cursor(assignment.crtc, Some(&slots[0].bo)) {
            debug!(connector = ?inner.handle, "Legacy cursor rejected: {}", err);
            cleanup_slots(inner, slots);
            return;
        }
    }

    let mut buffers = slots.into_iter();
    props.cursor = Some(CursorState {
        buffers: [buffers.next().unwrap(), buffers.next().unwrap()],
        index: 0,
        visible: false,
    });
}

fn cleanup_slots(inner: &ConnectorInner, slots: Vec<CursorSlot>) {
    for slot in slots {
        if let Some(fb) = slot.fb {
            inner.device.destroy_framebuffer(fb);
        }
        drop(slot.bo);
    }
}

/// Tear the cursor down, clearing the plane if it is on screen.
pub(crate) fn destroy_cursor(inner: &ConnectorInner) {
    let assignment = *inner.assignment.lock().unwrap();
    let mut props = inner.props.lock().unwrap();

    if let Some(cursor) = props.cursor.take() {
        if cursor.visible {
            if let Some(plane_handle) = assignment.and_then(|a| a.cursor_plane) {
                if let Some(plane) = inner.device.plane(plane_handle) {
                    let mut req = AtomicRequest::new(&inner.device);
                    if let Some(prop) = plane.props.crtc_id {
                        req.add(plane_handle, prop, drm::control::property::Value::CRTC(None));
                    }
                    if let Some(prop) = plane.props.fb_id {
                        req.add(plane_handle, prop, drm::control::property::Value::Framebuffer(None));
                    }
                    if let Err(err) = req.commit(AtomicCommitFlags::ALLOW_MODESET) {
                        debug!(connector = ?inner.handle, "Failed to clear cursor plane: {}", err);
                    }
                }
            }
        }
        cleanup_slots(
            inner,
            cursor.buffers.into_iter().collect::<Vec<_>>(),
        );
    }

    props.changes &= !(AtomicChanges::CURSOR_BUFFER
        | AtomicChanges::CURSOR_VISIBILITY
        | AtomicChanges::CURSOR_POSITION);
}

/// Show the cursor with new pixels, or hide it.
pub(crate) fn set_cursor(conn: &Connector, pixels: Option<&[u8]>) -> Result<(), Error> {
    let inner = &conn.inner;

    if let Some(pixels) = pixels {
        if pixels.len() != CURSOR_BYTES {
            return Err(Error::InvalidArgument("cursor images are 64x64 ARGB8888"));
        }
    }

    let assignment = *inner.assignment.lock().unwrap();
    let atomic_plane = assignment.and_then(|a| a.cursor_plane).is_some();

    {
        let mut guard = inner.props.lock().unwrap();
        let props = &mut *guard;
        let Some(cursor) = props.cursor.as_mut() else {
            return Err(Error::NoCursor);
        };

        if pixels.is_none() && !cursor.visible {
            return Ok(());
        }

        if atomic_plane {
            match pixels {
                Some(pixels) => {
                    if !cursor.visible {
                        cursor.visible = true;
                        props.changes |= AtomicChanges::CURSOR_VISIBILITY;
                    }
                    // the index flips during the commit
                    let pending = 1 - cursor.index;
                    if let Err(err) = cursor.buffers[pending].bo.write(pixels) {
                        warn!(connector = ?inner.handle, "Failed to write cursor pixels: {}", err);
                    }
                    props.changes |= AtomicChanges::CURSOR_BUFFER;
                }
                None => {
                    cursor.visible = false;
                    props.changes |= AtomicChanges::CURSOR_VISIBILITY;
                }
            }
        } else {
            let crtc = assignment.ok_or(Error::NoCursor)?.crtc;
            match pixels {
                Some(pixels) => {
                    cursor.visible = true;
                    cursor.index = 1 - cursor.index;
                    let index = cursor.index;
                    if let Err(err) = cursor.buffers[index].bo.write(pixels) {
                        warn!(connector = ?inner.handle, "Failed to write cursor pixels: {}", err);
                    }
                    inner
                        .device
                        .fd()
                        .set_cursor(crtc, Some(&cursor.buffers[index].bo))
                        .map_err(|source| {
                            Error::access("Failed to set legacy cursor", inner.device.path().cloned(), source)
                        })?;
                }
                None => {
                    cursor.visible = false;
                    inner
                        .device
                        .fd()
                        .set_cursor(crtc, Option::<&GbmBuffer<()>>::None)
                        .map_err(|source| {
                            Error::access("Failed to hide legacy cursor", inner.device.path().cloned(), source)
                        })?;
                }
            }
        }
    }

    if atomic_plane {
        conn.unlock_render_thread(false);
    }
    Ok(())
}

/// Update the cursor position.
pub(crate) fn set_cursor_pos(conn: &Connector, x: i32, y: i32) -> Result<(), Error> {
    let inner = &conn.inner;
    let assignment = *inner.assignment.lock().unwrap();
    let atomic_plane = assignment.and_then(|a| a.cursor_plane).is_some();

    {
        let mut guard = inner.props.lock().unwrap();
        let props = &mut *guard;
        let Some(cursor) = props.cursor.as_ref() else {
            return Err(Error::NoCursor);
        };
        let visible = cursor.visible;

        if props.cursor_x == x && props.cursor_y == y {
            return Ok(());
        }
        props.cursor_x = x;
        props.cursor_y = y;

        if atomic_plane {
            if visible {
                props.changes |= AtomicChanges::CURSOR_POSITION;
            }
        } else {
            let crtc = assignment.ok_or(Error::NoCursor)?.crtc;
            inner.device.fd().move_cursor(crtc, (x, y)).map_err(|source| {
                Error::access("Failed to move legacy cursor", inner.device.path().cloned(), source)
            })?;
        }
    }

    if atomic_plane {
        conn.unlock_render_thread(false);
    }
    Ok(())
}

/// Hand a released cursor plane to another initialized connector of the
/// same device that runs without one.
pub(crate) fn offer_cursor_plane(inner: &ConnectorInner, plane_handle: drm::control::plane::Handle) {
    let device = &inner.device;
    let Some(plane) = device.plane(plane_handle) else {
        return;
    };

    for candidate in device.connectors() {
        if candidate.handle == inner.handle {
            continue;
        }
        let is_initialized = {
            let state = candidate.state.lock().unwrap();
            state.state == crate::connector::ConnectorState::Initialized
        };
        if !is_initialized || candidate.props.lock().unwrap().cursor.is_some() {
            continue;
        }
        let Some(assignment) = *candidate.assignment.lock().unwrap() else {
            continue;
        };
        if assignment.cursor_plane.is_some() || !plane.possible_crtcs.contains(&assignment.crtc) {
            continue;
        }

        let mut bindings = device.bindings.lock().unwrap();
        if bindings.planes.contains_key(&plane_handle) {
            return;
        }
        bindings.planes.insert(plane_handle, candidate.handle);
        drop(bindings);

        candidate.assignment.lock().unwrap().as_mut().unwrap().cursor_plane = Some(plane_handle);
        create_cursor(&candidate);
        debug!(
            from = ?inner.handle,
            to = ?candidate.handle,
            plane = ?plane_handle,
            "Cursor plane handed over"
        );
        // wake the receiver so a latched cursor update can surface
        candidate.repaint_cond.notify_one();
        return;
    }
}
