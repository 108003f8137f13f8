// DRM Testbed
//
// Locates DRM device nodes by driver family, forces Intel GPUs into a known
// idle state on first use and again at process exit, and drives the display
// pipe CRC interface.

// Session, configuration and exit handling
pub mod core;

// Pipe CRC client
pub mod crc;

pub mod error;

// Device access, classification, resolution and quiescence
pub mod gpu;

// Utility functions
pub mod utils;

pub use crate::core::config::Config;
pub use crate::core::lifecycle::{elevate_to_master, Category, DrmSession};
pub use crate::error::{DrmError, Result};
pub use crate::gpu::detection::require_intel;
pub use crate::gpu::quiesce::force_idle;
pub use crate::gpu::{ChipsetMask, DeviceHandle, DriverFamily, NodeKind};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Opens a legacy node matching `mask` through the process-wide session
pub fn open_driver(mask: ChipsetMask) -> Result<DeviceHandle> {
    DrmSession::system().open_driver(mask)
}

/// `open_driver` plus DRM master
pub fn open_driver_master(mask: ChipsetMask) -> Result<DeviceHandle> {
    DrmSession::system().open_driver_master(mask)
}

/// Opens a render node, falling back to a legacy node
pub fn open_driver_render(mask: ChipsetMask) -> Result<DeviceHandle> {
    DrmSession::system().open_driver_render(mask)
}
