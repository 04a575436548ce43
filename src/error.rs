//! Errors thrown by this crate.

use std::io;
use std::path::PathBuf;

use crate::connector::ConnectorState;
use crate::render::PaintError;

/// Errors of the scanout stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device has been deactivated (session switch or lost DRM master).
    #[error("The device has been deactivated")]
    DeviceInactive,
    /// A DRM ioctl failed.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The connector is in the wrong lifecycle state for the requested operation.
    #[error("The connector is {0:?}, which does not permit this operation")]
    InvalidState(ConnectorState),
    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No free encoder, crtc and primary plane combination drives this connector.
    #[error("No free encoder/crtc/primary-plane combination for this connector")]
    NoConfiguration,
    /// The given mode does not belong to this connector.
    #[error("The requested mode is not advertised by this connector")]
    ModeNotSuitable,
    /// The connector has no hardware cursor.
    #[error("The connector has no hardware cursor")]
    NoCursor,
    /// The crtc does not support gamma correction.
    #[error("The crtc reports a gamma table size of zero")]
    NoGamma,
    /// The supplied gamma table does not match the crtc gamma size.
    #[error("The gamma table length {0} does not match 3 * {1}")]
    GammaSizeMismatch(usize, usize),
    /// The device cannot turn vertical sync off.
    #[error("The device lacks async page-flip support")]
    NoVsyncControl,
    /// A mode change failed forwards and backwards; the display is gone.
    #[error("The connector is dead after an unrecoverable mode-set failure")]
    ConnectorDead,
    /// Every rendering strategy failed to build a swapchain.
    #[error("No rendering strategy could be initialized for this connector")]
    StrategiesExhausted,
    /// A GBM allocation failed.
    #[error("GBM buffer allocation failed: {0}")]
    Allocation(#[source] io::Error),
    /// The embedder's paint stack reported an error.
    #[error("Paint stack error: {0}")]
    Paint(#[from] PaintError),
    /// The paint engine required for this operation was never attached.
    #[error("The device has no paint engine attached")]
    NoPaintEngine,
    /// The buffer is not suitable for direct scanout on this connector.
    #[error("Buffer not suitable for scanout: {0}")]
    UnsupportedScanoutBuffer(&'static str),
    /// The render thread could not be spawned.
    #[error("Failed to spawn the render thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// A DRM ioctl failed on a device.
#[derive(Debug, thiserror::Error)]
#[error("{errmsg} on device `{dev:?}`: {source}")]
pub struct AccessError {
    /// Description of the action that failed
    pub errmsg: &'static str,
    /// Device path the ioctl was issued on, if known
    pub dev: Option<PathBuf>,
    /// Underlying io error
    #[source]
    pub source: io::Error,
}

impl Error {
    pub(crate) fn access(errmsg: &'static str, dev: Option<PathBuf>, source: io::Error) -> Self {
        Error::Access(AccessError { errmsg, dev, source })
    }
}
