//! The four rendering strategies.
//!
//! Every connector renders through exactly one strategy, picked at
//! initialize time and never swapped afterwards: `Direct` when the
//! scanout GPU paints its own frames, `Prime` when frames travel between
//! GPUs as dmabufs, `Dumb` when they travel through a CPU mapped
//! scanout buffer, and `Cpu` when they additionally have to be
//! re-uploaded on the scanout GPU.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::framebuffer;
use tracing::{debug, info};

use super::swapchain::Swapchain;
use crate::connector::{ConnectorMode, SlotDescriptor};
use crate::device::{Device, DeviceCaps, PlaneRes};
use crate::error::Error;
use crate::format::{Format, FormatSet, Fourcc, Modifier};
use crate::render::{PaintContext, PaintImage};
use crate::utils::Rect;

mod cpu;
mod direct;
mod dumb;
mod prime;

pub(crate) use cpu::CpuStrategy;
pub(crate) use direct::DirectStrategy;
pub(crate) use dumb::DumbStrategy;
pub(crate) use prime::PrimeStrategy;

/// Which strategy drives a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// The scanout device renders its own frames
    Direct,
    /// Frames are dmabuf-imported from the render device
    Prime,
    /// Frames are read back into a dumb buffer
    Dumb,
    /// Frames are read back and re-uploaded on the scanout device
    Cpu,
}

impl StrategyKind {
    /// Selection order, best to worst.
    pub const ORDER: [StrategyKind; 4] = [
        StrategyKind::Direct,
        StrategyKind::Prime,
        StrategyKind::Dumb,
        StrategyKind::Cpu,
    ];

    pub(crate) fn env_index(self) -> usize {
        match self {
            StrategyKind::Direct => 0,
            StrategyKind::Prime => 1,
            StrategyKind::Dumb => 2,
            StrategyKind::Cpu => 3,
        }
    }

    /// Human readable tag used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Direct => "self",
            StrategyKind::Prime => "prime",
            StrategyKind::Dumb => "dumb",
            StrategyKind::Cpu => "cpu",
        }
    }
}

/// Whether the preconditions of a strategy hold for a (scanout, render)
/// device pair, given the scanout device renders for itself or not.
pub(crate) fn preconditions_hold(
    kind: StrategyKind,
    scanout_is_render: bool,
    scanout_caps: &DeviceCaps,
    render_caps: &DeviceCaps,
) -> bool {
    match kind {
        StrategyKind::Direct => scanout_is_render,
        StrategyKind::Prime => {
            !scanout_is_render && render_caps.prime_export && scanout_caps.prime_import
        }
        StrategyKind::Dumb => scanout_caps.dumb_buffer,
        StrategyKind::Cpu => true,
    }
}

/// The devices and contexts a strategy operates with.
pub(crate) struct StrategyEnv<'a> {
    pub scanout: &'a Arc<Device>,
    pub render: &'a Arc<Device>,
    pub ctx: &'a mut Box<dyn PaintContext>,
    pub scanout_ctx: &'a mut Option<Box<dyn PaintContext>>,
}

impl StrategyEnv<'_> {
    /// The scanout-side plumbing context, created on first use.
    fn plumbing_ctx(&mut self) -> Result<&mut Box<dyn PaintContext>, Error> {
        if self.scanout_ctx.is_none() {
            let engine = self.scanout.paint_engine().ok_or(Error::NoPaintEngine)?;
            *self.scanout_ctx = Some(engine.create_context()?);
        }
        Ok(self.scanout_ctx.as_mut().unwrap())
    }
}

/// One strategy with its swapchain.
pub(crate) enum Strategy {
    Direct(DirectStrategy),
    Prime(PrimeStrategy),
    Dumb(DumbStrategy),
    Cpu(CpuStrategy),
}

macro_rules! dispatch {
    ($self:expr, $name:ident ( $($arg:expr),* )) => {
        match $self {
            Strategy::Direct(s) => s.$name($($arg),*),
            Strategy::Prime(s) => s.$name($($arg),*),
            Strategy::Dumb(s) => s.$name($($arg),*),
            Strategy::Cpu(s) => s.$name($($arg),*),
        }
    };
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Direct(_) => StrategyKind::Direct,
            Strategy::Prime(_) => StrategyKind::Prime,
            Strategy::Dumb(_) => StrategyKind::Dumb,
            Strategy::Cpu(_) => StrategyKind::Cpu,
        }
    }

    pub fn buffers_count(&self) -> usize {
        dispatch!(self, buffers_count())
    }

    pub fn current_index(&self) -> usize {
        dispatch!(self, current_index())
    }

    pub fn current_age(&self) -> u32 {
        dispatch!(self, current_age())
    }

    pub fn current_fb(&self) -> framebuffer::Handle {
        dispatch!(self, current_fb())
    }

    /// Framebuffer of the slot after the current one; the initial mode
    /// set scans this out while the first paint fills the current slot.
    pub fn next_fb(&self) -> framebuffer::Handle {
        dispatch!(self, next_fb())
    }

    pub fn current_image(&self) -> &dyn PaintImage {
        dispatch!(self, current_image())
    }

    pub fn format(&self) -> Format {
        dispatch!(self, format())
    }

    /// Bind the current slot as render target of the paint context.
    pub fn bind_current(&self, env: &mut StrategyEnv<'_>) -> Result<(), Error> {
        env.ctx.bind(self.current_image())?;
        Ok(())
    }

    /// Cross-device handoff of the painted frame, before the flip.
    pub fn prepare_present(&mut self, env: &mut StrategyEnv<'_>, damage: &[Rect]) -> Result<(), Error> {
        dispatch!(self, prepare_present(env, damage))
    }

    /// Export a fence for the submitted GPU work, or synchronize
    /// blocking when fences are unavailable or unwanted.
    pub fn acquire_fence(&mut self, env: &mut StrategyEnv<'_>, want_fence: bool) -> Option<OwnedFd> {
        dispatch!(self, acquire_fence(env, want_fence))
    }

    pub fn advance(&mut self) {
        dispatch!(self, advance())
    }

    pub fn mark_presented(&mut self) {
        dispatch!(self, mark_presented())
    }

    pub fn reset_ages(&mut self) {
        dispatch!(self, reset_ages())
    }

    pub fn descriptors(&self) -> Vec<SlotDescriptor> {
        dispatch!(self, descriptors())
    }

    pub fn teardown(&mut self, env: &mut StrategyEnv<'_>) {
        dispatch!(self, teardown(env))
    }
}

/// Build the strategy of the given kind for one mode.
pub(crate) fn create(
    kind: StrategyKind,
    env: &mut StrategyEnv<'_>,
    mode: &ConnectorMode,
    format: Format,
    count: usize,
) -> Result<Strategy, Error> {
    match kind {
        StrategyKind::Direct => DirectStrategy::new(env, mode, format, count).map(Strategy::Direct),
        StrategyKind::Prime => PrimeStrategy::new(env, mode, format, count).map(Strategy::Prime),
        StrategyKind::Dumb => DumbStrategy::new(env, mode, format, count).map(Strategy::Dumb),
        StrategyKind::Cpu => CpuStrategy::new(env, mode, format, count).map(Strategy::Cpu),
    }
}

/// Pick the first strategy whose preconditions hold and whose swapchain
/// comes up, in `ORDER`.
pub(crate) fn select(
    env: &mut StrategyEnv<'_>,
    log_name: &str,
    mode: &ConnectorMode,
    primary_plane: &PlaneRes,
) -> Result<Strategy, Error> {
    let scanout_is_render = Arc::ptr_eq(env.scanout, env.render);
    let render_formats = env
        .render
        .paint_engine()
        .ok_or(Error::NoPaintEngine)?
        .render_formats();

    for kind in StrategyKind::ORDER {
        if !preconditions_hold(kind, scanout_is_render, env.scanout.caps(), env.render.caps()) {
            continue;
        }

        let count = env.scanout.env().fb_count[kind.env_index()].unwrap_or(2);

        // explicit modifiers first, one retry with implicit ones
        for allow_modifiers in [true, false] {
            let format = choose_format(
                primary_plane,
                &render_formats,
                env.scanout.is_atomic(),
                env.scanout.caps().addfb2_modifiers,
                allow_modifiers,
            );
            match create(kind, env, mode, format, count) {
                Ok(strategy) => {
                    info!(
                        connector = %log_name,
                        strategy = kind.as_str(),
                        ?format,
                        buffering = count,
                        "Rendering strategy selected"
                    );
                    return Ok(strategy);
                }
                Err(err) => {
                    debug!(
                        connector = %log_name,
                        strategy = kind.as_str(),
                        allow_modifiers,
                        "Strategy initialization failed: {}",
                        err
                    );
                }
            }
            if format.modifier == Modifier::Invalid {
                // nothing left to retry without modifiers
                break;
            }
        }
    }

    Err(Error::StrategiesExhausted)
}

/// Pick the primary plane format: `XRGB8888` first, `XBGR8888` second,
/// then anything both sides support. Within the chosen fourcc a
/// non-linear modifier common to plane and renderer is preferred, then
/// linear, then the implicit layout.
pub(crate) fn choose_format(
    plane: &PlaneRes,
    render_formats: &FormatSet,
    atomic: bool,
    addfb2_modifiers: bool,
    allow_modifiers: bool,
) -> Format {
    let explicit_ok = atomic && addfb2_modifiers && allow_modifiers;

    for fourcc in [Fourcc::Xrgb8888, Fourcc::Xbgr8888] {
        if !plane.formats.contains_fourcc(fourcc) || !render_formats.contains_fourcc(fourcc) {
            continue;
        }
        if explicit_ok {
            for modifier in plane.formats.modifiers_for(fourcc) {
                if modifier != Modifier::Linear
                    && modifier != Modifier::Invalid
                    && render_formats.contains(&Format { code: fourcc, modifier })
                {
                    return Format { code: fourcc, modifier };
                }
            }
            let linear = Format {
                code: fourcc,
                modifier: Modifier::Linear,
            };
            if plane.formats.contains(&linear) && render_formats.contains(&linear) {
                return linear;
            }
        }
        return Format {
            code: fourcc,
            modifier: Modifier::Invalid,
        };
    }

    // any common pair, implicit layout unless explicitly shared
    if let Some(&format) = plane.formats.intersection(render_formats).next() {
        if explicit_ok {
            return format;
        }
        return Format {
            code: format.code,
            modifier: Modifier::Invalid,
        };
    }

    Format {
        code: Fourcc::Xrgb8888,
        modifier: Modifier::Invalid,
    }
}

/// Modifier list handed to the allocator for a chosen format.
pub(crate) fn allocation_modifiers(format: Format) -> [Modifier; 1] {
    [format.modifier]
}

pub(crate) fn descriptors_from<T>(
    chain: &Swapchain<T>,
    size: (u32, u32),
    format: Format,
) -> Vec<SlotDescriptor> {
    (0..chain.len())
        .map(|index| SlotDescriptor { index, size, format })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(dumb: bool, import: bool, export: bool) -> DeviceCaps {
        DeviceCaps {
            dumb_buffer: dumb,
            prime_import: import,
            prime_export: export,
            ..Default::default()
        }
    }

    fn first_viable(scanout_is_render: bool, scanout: &DeviceCaps, render: &DeviceCaps) -> StrategyKind {
        StrategyKind::ORDER
            .into_iter()
            .find(|&kind| preconditions_hold(kind, scanout_is_render, scanout, render))
            .unwrap()
    }

    #[test]
    fn selection_order_is_monotonic() {
        // a device rendering for itself always scans out directly
        assert_eq!(
            first_viable(true, &caps(true, true, true), &caps(true, true, true)),
            StrategyKind::Direct
        );
        // cross-device with prime on both ends
        assert_eq!(
            first_viable(false, &caps(true, true, false), &caps(false, false, true)),
            StrategyKind::Prime
        );
        // no prime import: pixels go through a dumb buffer
        assert_eq!(
            first_viable(false, &caps(true, false, false), &caps(false, false, true)),
            StrategyKind::Dumb
        );
        // no prime, no dumb buffers: the cpu path is the last resort
        assert_eq!(
            first_viable(false, &caps(false, false, false), &caps(false, false, false)),
            StrategyKind::Cpu
        );
    }

    #[test]
    fn prime_needs_both_ends() {
        assert!(!preconditions_hold(
            StrategyKind::Prime,
            false,
            &caps(false, false, false),
            &caps(false, false, true)
        ));
        assert!(!preconditions_hold(
            StrategyKind::Prime,
            false,
            &caps(false, true, false),
            &caps(false, false, false)
        ));
        assert!(preconditions_hold(
            StrategyKind::Prime,
            false,
            &caps(false, true, false),
            &caps(false, false, true)
        ));
    }
}
