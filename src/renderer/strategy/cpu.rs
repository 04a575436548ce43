//! The CPU strategy: the last resort when neither dmabuf import nor
//! dumb buffers exist on the scanout device. Frames are read back into
//! host memory, re-uploaded as a texture on the scanout GPU and drawn
//! into a scannable buffer there.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::framebuffer;

use super::{allocation_modifiers, descriptors_from, StrategyEnv};
use crate::allocator::dmabuf::AsDmabuf;
use crate::allocator::gbm::{GbmBuffer, GbmBufferFlags};
use crate::connector::{ConnectorMode, SlotDescriptor};
use crate::device::Device;
use crate::error::Error;
use crate::format::{self, Format, Modifier};
use crate::render::{ImageCaps, PaintError, PaintImage};
use crate::renderer::swapchain::Swapchain;
use crate::utils::Rect;

pub(crate) struct CpuSlot {
    image: Box<dyn PaintImage>,
    tex: Box<dyn PaintImage>,
    scan_image: Box<dyn PaintImage>,
    _scan_bo: GbmBuffer<()>,
    fb: framebuffer::Handle,
}

pub(crate) struct CpuStrategy {
    device: Arc<Device>,
    chain: Swapchain<CpuSlot>,
    staging: Vec<u8>,
    stride: u32,
    size: (u32, u32),
    format: Format,
}

impl CpuStrategy {
    pub fn new(
        env: &mut StrategyEnv<'_>,
        mode: &ConnectorMode,
        format: Format,
        count: usize,
    ) -> Result<Self, Error> {
        let device = env.scanout.clone();
        let (width, height) = (mode.width(), mode.height());
        let force_gl = device.env().force_gl_allocation;
        let bytes_per_pixel = format::bpp(format.code).unwrap_or(32) / 8;
        let stride = width * bytes_per_pixel;

        let mut slots = Vec::with_capacity(count);
        let result = (|| -> Result<(), Error> {
            for _ in 0..count {
                let image = env
                    .ctx
                    .create_image(width, height, format.code, ImageCaps::SRC | ImageCaps::DST)?;

                let (scan_bo, scan_image) = if force_gl {
                    // allocate through the scanout paint stack, then wrap
                    // the exported storage for the kernel
                    let plumbing = env.plumbing_ctx()?;
                    let scan_image = plumbing.create_image(
                        width,
                        height,
                        format.code,
                        ImageCaps::DST | ImageCaps::DRM_FB,
                    )?;
                    let dmabuf = plumbing.export_dmabuf(scan_image.as_ref())?;
                    let bo: GbmBuffer<()> = dmabuf
                        .import_to(device.gbm().as_ref(), GbmBufferFlags::SCANOUT)
                        .map_err(Error::Allocation)?;
                    (bo, scan_image)
                } else {
                    let bo = device
                        .gbm()
                        .create_buffer_with_flags(
                            width,
                            height,
                            format.code,
                            &allocation_modifiers(format),
                            GbmBufferFlags::SCANOUT | GbmBufferFlags::RENDERING,
                        )
                        .map_err(Error::Allocation)?;
                    let dmabuf = bo.export().map_err(|err| Error::Paint(PaintError::new(err)))?;
                    let plumbing = env.plumbing_ctx()?;
                    let scan_image = plumbing.import_dmabuf(&dmabuf, ImageCaps::DST)?;
                    (bo, scan_image)
                };

                let plumbing = env.plumbing_ctx()?;
                let tex = plumbing.create_image(width, height, format.code, ImageCaps::SRC)?;
                let fb = device.add_framebuffer(&scan_bo, format.modifier != Modifier::Invalid)?;

                slots.push(CpuSlot {
                    image,
                    tex,
                    scan_image,
                    _scan_bo: scan_bo,
                    fb,
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

        Ok(CpuStrategy {
            device,
            chain: Swapchain::new(slots),
            staging: vec![0; (stride * height) as usize],
            stride,
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

    /// Read back on the render device, upload and draw on the scanout
    /// device. Damage shrinks both copies.
    pub fn prepare_present(&mut self, env: &mut StrategyEnv<'_>, damage: &[Rect]) -> Result<(), Error> {
        let slot = &self.chain.current().payload;

        env.ctx.read_pixels(damage, &mut self.staging, self.stride)?;

        let plumbing = env.plumbing_ctx()?;
        plumbing.upload(slot.tex.as_ref(), damage, &self.staging, self.stride)?;
        plumbing.bind(slot.scan_image.as_ref())?;
        plumbing.blit(slot.tex.as_ref(), slot.scan_image.as_ref(), damage)?;
        Ok(())
    }

    pub fn acquire_fence(&mut self, env: &mut StrategyEnv<'_>, want_fence: bool) -> Option<OwnedFd> {
        // the flip must wait for the scanout-side blit
        if let Ok(plumbing) = env.plumbing_ctx() {
            if want_fence {
                if let Some(fence) = plumbing.export_fence() {
                    return Some(fence);
                }
            }
            plumbing.finish();
        }
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
