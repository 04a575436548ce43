#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like KMS
#![allow(clippy::upper_case_acronyms)]

//! # scanout: drive every display of every GPU
//!
//! This crate sits directly on top of the kernel mode-setting API, GBM
//! and an embedder-supplied GL stack, and presents a uniform lifecycle
//! for every connected display: initialize, paint on request, page-flip,
//! change modes, suspend, resume, uninitialize. Which GPU scans a
//! display out and which GPU paints for it is hidden behind one of four
//! rendering strategies, picked automatically per connector.
//!
//! ## Structure of the crate
//!
//! [`Device`] wraps one open DRM node: capabilities, resource arenas and
//! the state shared by its connectors. [`Connector`] is the user-facing
//! handle of one display; [`Connector::initialize`] spawns a dedicated
//! render thread that owns all rendering state and is driven through
//! [`ConnectorHandler`] callbacks. The [`allocator`] module provides the
//! GBM and dumb-buffer plumbing, and [`render`] defines the traits the
//! embedder implements to plug its GL stack in.
//!
//! There is no event loop: each connector runs one blocking OS thread,
//! and operations from other threads only latch requests and wake it.
//!
//! ## Opening devices
//!
//! Device discovery, seat management and hotplug monitoring are left to
//! the embedder; anything that can hand over an opened DRM file
//! descriptor (logind, seatd, plain `open(2)` as root) works:
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use std::os::unix::io::OwnedFd;
//! use scanout::{Device, DrmDeviceFd, EnvConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/dev/dri/card0")?;
//! let fd = DrmDeviceFd::new(OwnedFd::from(file));
//! let device = Device::new(fd, EnvConfig::from_env())?;
//! # let _ = device;
//! # Ok(())
//! # }
//! ```
//!
//! ### Logging
//!
//! This crate emits [`tracing`] events; install any `tracing` subscriber
//! to see them.

pub mod allocator;
pub mod config;
pub mod connector;
pub mod device;
mod error;
pub mod format;
pub mod render;
pub(crate) mod renderer;
pub mod utils;

pub use config::EnvConfig;
pub use connector::{
    Connector, ConnectorHandler, ConnectorMode, ConnectorState, ContentType, Frame,
    PresentationFlags, PresentationTime, SlotDescriptor, Subpixel,
};
pub use device::{Device, DrmDeviceFd};
pub use error::{AccessError, Error};
pub use format::{Format, Fourcc, Modifier};
pub use render::{ImageCaps, PaintContext, PaintEngine, PaintError, PaintImage};
pub use renderer::StrategyKind;
