//! The dumb-buffer strategy: rendered offscreen on one GPU, pixels read
//! back into CPU mapped scanout buffers of another.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::{framebuffer, Device as ControlDevice};

use super::{descriptors_from, StrategyEnv};
use crate::allocator::dumb::{DumbAllocator, DumbBuffer};
use crate::allocator::{Allocator, Modifier};
use crate::connector::{ConnectorMode, SlotDescriptor};
use crate::device::Device;
use crate::error::Error;
use crate::format::{self, Format};
use crate::render::{ImageCaps, PaintImage};
use crate::renderer::swapchain::Swapchain;
use crate::utils::Rect;

pub(crate) struct DumbSlot {
    image: Box<dyn PaintImage>,
    dumb: DumbBuffer,
    fb: framebuffer::Handle,
}

pub(crate) struct DumbStrategy {
    device: Arc<Device>,
    chain: Swapchain<DumbSlot>,
    size: (u32, u32),
    format: Format,
}

impl DumbStrategy {
    pub fn new(
        env: &mut StrategyEnv<'_>,
        mode: &ConnectorMode,
        format: Format,
        count: usize,
    ) -> Result<Self, Error> {
        let device = env.scanout.clone();
        let (width, height) = (mode.width(), mode.height());
        let mut allocator = DumbAllocator::new(device.fd().clone());

        let mut slots = Vec::with_capacity(count);
        let result = (|| -> Result<(), Error> {
            for _ in 0..count {
                let image = env
                    .ctx
                    .create_image(width, height, format.code, ImageCaps::SRC | ImageCaps::DST)?;
                let dumb = allocator
                    .create_buffer(width, height, format.code, &[Modifier::Linear])
                    .map_err(Error::Allocation)?;
                let depth = format::depth(format.code).unwrap_or(24);
                let bpp = format::bpp(format.code).unwrap_or(32);
                let fb = device
                    .fd()
                    .add_framebuffer(dumb.handle(), depth, bpp)
                    .map_err(|source| {
                        Error::access("Failed to create dumb framebuffer", device.path().cloned(), source)
                    })?;

                slots.push(DumbSlot { image, dumb, fb });
            }
            Ok(())
        })();

        if let Err(err) = result {
            for slot in slots {
                device.destroy_framebuffer(slot.fb);
            }
            return Err(err);
        }

        Ok(DumbStrategy {
            device,
            chain: Swapchain::new(slots),
            size: (width, height),
            format: Format {
                code: format.code,
                modifier: Modifier::Linear,
            },
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

    /// Read the painted frame back into the dumb buffer, row wise and
    /// restricted to the damaged area when one was declared.
    pub fn prepare_present(&mut self, env: &mut StrategyEnv<'_>, damage: &[Rect]) -> Result<(), Error> {
        let slot = self.chain.current_mut();
        let pitch = slot.payload.dumb.pitch();
        let mut mapping = slot.payload.dumb.map_mut().map_err(Error::Allocation)?;
        env.ctx.read_pixels(damage, mapping.as_mut(), pitch)?;
        Ok(())
    }

    pub fn acquire_fence(&mut self, env: &mut StrategyEnv<'_>, _want_fence: bool) -> Option<OwnedFd> {
        // the readback above already waited for the GPU
        let _ = env;
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
