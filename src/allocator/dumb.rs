//! Dumb (CPU mapped) buffers exposed as scanout framebuffers.

use std::fmt;

use drm::buffer::Buffer as _;
use drm::control::dumbbuffer::{DumbBuffer as Handle, DumbMapping};
use drm::control::Device as ControlDevice;

use super::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::device::DrmDeviceFd;
use crate::format;

/// Allocator for [`DumbBuffer`]s on a DRM device.
#[derive(Debug, Clone)]
pub struct DumbAllocator {
    fd: DrmDeviceFd,
}

impl DumbAllocator {
    /// Create a new allocator over the given device.
    pub fn new(fd: DrmDeviceFd) -> Self {
        DumbAllocator { fd }
    }
}

impl Allocator for DumbAllocator {
    type Buffer = DumbBuffer;
    type Error = std::io::Error;

    #[profiling::function]
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<DumbBuffer, Self::Error> {
        // dumb buffers are always linear
        if modifiers
            .iter()
            .all(|&m| m != Modifier::Invalid && m != Modifier::Linear)
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "dumb buffers only support a linear layout",
            ));
        }

        let bpp = format::bpp(fourcc).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown bits-per-pixel")
        })?;
        let handle = self.fd.create_dumb_buffer((width, height), fourcc, bpp)?;

        Ok(DumbBuffer {
            fd: self.fd.clone(),
            handle,
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        })
    }
}

/// A CPU mapped buffer suitable for scanout without any GPU involvement.
pub struct DumbBuffer {
    fd: DrmDeviceFd,
    handle: Handle,
    format: Format,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .finish()
    }
}

impl Buffer for DumbBuffer {
    fn width(&self) -> u32 {
        self.handle.size().0
    }

    fn height(&self) -> u32 {
        self.handle.size().1
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl DumbBuffer {
    /// Raw handle to the underlying kernel buffer.
    ///
    /// Becomes invalid once this wrapper is dropped.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Row stride in bytes.
    pub fn pitch(&self) -> u32 {
        drm::buffer::Buffer::pitch(&self.handle)
    }

    /// Map the buffer into process memory for writing.
    pub fn map_mut(&mut self) -> std::io::Result<DumbMapping<'_>> {
        self.fd.map_dumb_buffer(&mut self.handle)
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        let _ = self.fd.destroy_dumb_buffer(self.handle);
    }
}
