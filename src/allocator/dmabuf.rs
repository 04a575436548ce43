//! Shared buffer handles based on DMA-BUF file descriptors.
//!
//! A [`Dmabuf`] names the same pixel storage across devices, processes
//! and the paint stack. It is cheap to clone; the underlying file
//! descriptors are closed when the last clone is dropped.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use super::{Buffer, Format, Fourcc, Modifier};

/// Maximum plane count of a dmabuf.
pub const MAX_PLANES: usize = 4;

#[derive(Debug)]
struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

#[derive(Debug)]
struct DmabufInternal {
    planes: Vec<Plane>,
    width: u32,
    height: u32,
    format: Format,
}

/// A handle to a buffer shared as a set of DMA-BUF file descriptors.
#[derive(Debug, Clone)]
pub struct Dmabuf(Arc<DmabufInternal>);

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        self.0.format
    }
}

impl Dmabuf {
    /// Start building a dmabuf with the size and format of `src`.
    pub fn builder_from_buffer(src: &impl Buffer) -> DmabufBuilder {
        let (width, height) = src.size();
        Self::builder(width, height, src.format().code, src.format().modifier)
    }

    /// Start building a new dmabuf.
    pub fn builder(width: u32, height: u32, fourcc: Fourcc, modifier: Modifier) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                width,
                height,
                format: Format {
                    code: fourcc,
                    modifier,
                },
            },
        }
    }

    /// Number of planes.
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// The file descriptors, one per plane.
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> {
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// The per-plane offsets.
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// The per-plane strides.
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Whether the buffer carries an explicit format modifier.
    pub fn has_modifier(&self) -> bool {
        self.0.format.modifier != Modifier::Invalid
    }
}

/// Builder for a [`Dmabuf`].
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane. Planes must be added in index order.
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> &mut Self {
        if self.internal.planes.len() < MAX_PLANES {
            self.internal.planes.push(Plane { fd, offset, stride });
        }
        self
    }

    /// Finish the builder. Returns `None` if no planes were added.
    pub fn build(self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

/// Buffers that can hand out a [`Dmabuf`] view of themselves.
pub trait AsDmabuf {
    /// Error type of the export.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Export this buffer as a new [`Dmabuf`].
    fn export(&self) -> Result<Dmabuf, Self::Error>;
}

impl AsDmabuf for Dmabuf {
    type Error = std::convert::Infallible;

    fn export(&self) -> Result<Dmabuf, Self::Error> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_builder_yields_none() {
        let builder = Dmabuf::builder(64, 64, Fourcc::Argb8888, Modifier::Linear);
        assert!(builder.build().is_none());
    }
}
