//! The paint interface consumed by the renderer.
//!
//! The GL/EGL stack is not part of this crate. The embedder implements
//! [`PaintEngine`] per GPU; the renderer mints one [`PaintContext`] per
//! render thread from it and drives every strategy through that context.
//! Contexts minted from one engine share images, which is what lets a
//! paint callback use textures created elsewhere in the application.

use std::os::unix::io::OwnedFd;

use downcast_rs::{impl_downcast, Downcast};

use crate::allocator::dmabuf::Dmabuf;
use crate::format::{Format, FormatSet, Fourcc};
use crate::utils::Rect;

bitflags::bitflags! {
    /// What an image can be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageCaps: u32 {
        /// Can be sampled from
        const SRC = 0x01;
        /// Can be rendered into
        const DST = 0x02;
        /// Can back a DRM framebuffer
        const DRM_FB = 0x04;
        /// Is backed by a GBM buffer object
        const GBM_BO = 0x08;
        /// Can be read back into CPU memory
        const DUMB_EXPORT = 0x10;
    }
}

/// An error reported by the embedder's paint stack.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PaintError(pub Box<dyn std::error::Error + Send + Sync>);

impl PaintError {
    /// Wrap any error value.
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PaintError(Box::new(err))
    }

    /// Wrap a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        PaintError(msg.into().into())
    }
}

/// Opaque pixel storage owned by a [`PaintContext`].
pub trait PaintImage: Downcast + Send {
    /// Size in pixels.
    fn size(&self) -> (u32, u32);
    /// Fourcc and modifier of the storage.
    fn format(&self) -> Format;
    /// Capability set of the image.
    fn caps(&self) -> ImageCaps;
}
impl_downcast!(PaintImage);

/// A per-thread handle into the embedder's GL stack for one GPU.
///
/// All methods are called from the render thread owning the context.
pub trait PaintContext: Send {
    /// Create an offscreen image.
    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        caps: ImageCaps,
    ) -> Result<Box<dyn PaintImage>, PaintError>;

    /// Import a dmabuf as an image with the requested capabilities.
    fn import_dmabuf(&mut self, dmabuf: &Dmabuf, caps: ImageCaps) -> Result<Box<dyn PaintImage>, PaintError>;

    /// Export an image created by this context (or a sibling context of
    /// the same engine) as a dmabuf.
    fn export_dmabuf(&mut self, image: &dyn PaintImage) -> Result<Dmabuf, PaintError>;

    /// Make `image` the current render target.
    fn bind(&mut self, image: &dyn PaintImage) -> Result<(), PaintError>;

    /// Read pixels of the bound image back into `dst` with the given row
    /// stride, restricted to `damage` (the full image if empty).
    fn read_pixels(
        &mut self,
        damage: &[Rect],
        dst: &mut [u8],
        dst_stride: u32,
    ) -> Result<(), PaintError>;

    /// Upload `src` into `image`, restricted to `damage` (the full image
    /// if empty).
    fn upload(
        &mut self,
        image: &dyn PaintImage,
        damage: &[Rect],
        src: &[u8],
        src_stride: u32,
    ) -> Result<(), PaintError>;

    /// Draw `src` onto `dst`, restricted to `damage` (the full target if
    /// empty). Used by the CPU strategy to move uploaded pixels into a
    /// scannable image.
    fn blit(
        &mut self,
        src: &dyn PaintImage,
        dst: &dyn PaintImage,
        damage: &[Rect],
    ) -> Result<(), PaintError>;

    /// Export a sync file descriptor signalling completion of all GPU
    /// work submitted so far. `None` means the stack cannot produce
    /// fences; the caller falls back to a blocking finish.
    fn export_fence(&mut self) -> Option<OwnedFd>;

    /// Block until all submitted GPU work completed.
    fn finish(&mut self);
}

/// Per-GPU factory for [`PaintContext`]s, implemented by the embedder.
pub trait PaintEngine: Send + Sync {
    /// Formats this engine can render into.
    fn render_formats(&self) -> FormatSet;
    /// Formats this engine can sample from.
    fn texture_formats(&self) -> FormatSet;
    /// Mint a context for the calling thread.
    fn create_context(&self) -> Result<Box<dyn PaintContext>, PaintError>;
}
