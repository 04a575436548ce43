//! The prime strategy: rendered on one GPU, dmabuf-imported and scanned
//! out by another.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::framebuffer;

use super::{allocation_modifiers, descriptors_from, StrategyEnv};
use crate::allocator::dmabuf::AsDmabuf;
use crate::allocator::gbm::{GbmBuffer, GbmBufferFlags};
use crate::connector::{ConnectorMode, SlotDescriptor};
use crate::device::Device;
use crate::error::Error;
use crate::format::{Format, Modifier};
use crate::render::{ImageCaps, PaintError, PaintImage};
use crate::renderer::swapchain::Swapchain;
use crate::utils::Rect;

pub(crate) struct PrimeSlot {
    _render_bo: GbmBuffer<()>,
    _scan_bo: GbmBuffer<()>,
    fb: framebuffer::Handle,
    image: Box<dyn PaintImage>,
}

pub(crate) struct PrimeStrategy {
    device: Arc<Device>,
    chain: Swapchain<PrimeSlot>,
    size: (u32, u32),
    format: Format,
}

impl PrimeStrategy {
    pub fn new(
        env: &mut StrategyEnv<'_>,
        mode: &ConnectorMode,
        format: Format,
        count: usize,
    ) -> Result<Self, Error> {
        let device = env.scanout.clone();
        let (width, height) = (mode.width(), mode.height());

        let mut slots = Vec::with_capacity(count);
        let result = (|| -> Result<(), Error> {
            for _ in 0..count {
                // the render device draws into this buffer ...
                let render_bo = env
                    .render
                    .gbm()
                    .create_buffer_with_flags(
                        width,
                        height,
                        format.code,
                        &allocation_modifiers(format),
                        GbmBufferFlags::RENDERING,
                    )
                    .map_err(Error::Allocation)?;
                let dmabuf = render_bo.export().map_err(|err| Error::Paint(PaintError::new(err)))?;
                let image = env
                    .ctx
                    .import_dmabuf(&dmabuf, ImageCaps::SRC | ImageCaps::DST)?;

                // ... and the scanout device presents the same storage
                let scan_bo: GbmBuffer<()> = dmabuf
                    .import_to(device.gbm().as_ref(), GbmBufferFlags::SCANOUT)
                    .map_err(Error::Allocation)?;
                let fb = device.add_framebuffer(&scan_bo, format.modifier != Modifier::Invalid)?;

                slots.push(PrimeSlot {
                    _render_bo: render_bo,
                    _scan_bo: scan_bo,
                    fb,
                    image,
                });
            }
            Ok(())
        })();

        if let Err(err) = result {
            for slot in slots {
                device.destroy_framebuffer(slot.fb);
            }
            return Err(err);
        }

        Ok(PrimeStrategy {
            device,
            chain: Swapchain::new(slots),
            size: (width, height),
            format,
        })
    }

    pub fn buffers_count(&self) -> usize {
        self.chain.len()
    }

    pub fn current_index(&self) -> usize {
        self.chain.current_index()
    }

    pub fn current_age(&self) -> u32 {
        self.chain.current_age()
    }

    pub fn current_fb(&self) -> framebuffer::Handle {
        self.chain.current().payload.fb
    }

    pub fn next_fb(&self) -> framebuffer::Handle {
        self.chain.get(self.chain.next_index()).unwrap().payload.fb
    }

    pub fn current_image(&self) -> &dyn PaintImage {
        self.chain.current().payload.image.as_ref()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn prepare_present(&mut self, env: &mut StrategyEnv<'_>, _damage: &[Rect]) -> Result<(), Error> {
        // scanout happens on the imported storage; all that is needed is
        // that the render device's work is flushed before the flip, which
        // acquire_fence takes care of
        let _ = env;
        Ok(())
    }

    pub fn acquire_fence(&mut self, env: &mut StrategyEnv<'_>, want_fence: bool) -> Option<OwnedFd> {
        if want_fence {
            if let Some(fence) = env.ctx.export_fence() {
                return Some(fence);
            }
        }
        env.ctx.finish();
        None
    }

    pub fn advance(&mut self) {
        self.chain.advance();
    }

    pub fn mark_presented(&mut self) {
        self.chain.mark_presented();
    }

    pub fn reset_ages(&mut self) {
        self.chain.reset_ages();
    }

    pub fn descriptors(&self) -> Vec<SlotDescriptor> {
        descriptors_from(&self.chain, self.size, self.format)
    }

    pub fn teardown(&mut self, _env: &mut StrategyEnv<'_>) {
        for slot in self.chain.iter() {
            self.device.destroy_framebuffer(slot.payload.fb);
        }
    }
}
