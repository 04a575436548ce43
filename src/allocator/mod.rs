//! Buffer allocation.
//!
//! Strategies obtain their scanout storage through the [`Allocator`]
//! trait: GBM buffer objects ([`gbm`]) where the GPU can render or scan
//! out directly, dumb buffers ([`dumb`]) where pixels have to travel
//! through the CPU. [`dmabuf`] carries buffers between devices and into
//! the embedder's paint stack.

pub mod dmabuf;
pub mod dumb;
pub mod gbm;

pub use crate::format::{Format, Fourcc, Modifier};

/// Common functionality of all buffers.
pub trait Buffer {
    /// Width of the buffer in pixels.
    fn width(&self) -> u32;
    /// Height of the buffer in pixels.
    fn height(&self) -> u32;
    /// Size (width, height) of the buffer.
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Format (fourcc and modifier) of the buffer.
    fn format(&self) -> Format;
}

/// Types able to allocate new buffers of a given size and format.
pub trait Allocator {
    /// The buffer type produced by this allocator.
    type Buffer: Buffer;
    /// The error produced on allocation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Try to allocate a buffer with the given dimensions, fourcc and one
    /// of the given modifiers.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}
