// GPU quiescence module for the DRM Testbed
//
// Drains every execution engine of an i915 device by submitting a no-op
// batch on each engine selector, waiting for it, and then asking the driver
// to retire requests and free idle objects.

use std::io;

use log::warn;

use crate::error::{DrmError, Result};
use crate::gpu::device::DrmDevice;
use crate::gpu::ioctl::{DROP_FREED, DROP_RETIRE, I915_EXEC_BSD, I915_EXEC_BSD_RING2, I915_PARAM_HAS_BSD2};
use crate::gpu::DeviceHandle;

/// Size of the scratch batch buffer
const BATCH_SIZE: u64 = 4096;

/// Every legacy engine selector value is tried
pub const ENGINE_SELECTORS: u64 = 1 << 6;

const MI_BATCH_BUFFER_END: u32 = 0x0a << 23;
const MI_NOOP: u32 = 0;

/// What a quiescence run submitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleReport {
    pub submitted: u32,   // Selectors the driver accepted
    pub unsupported: u32, // Selectors rejected as not present on this hardware
    pub bsd2: bool,       // Second video engine was flushed too
}

/// Waits until the gpu behind `handle` is idle
///
/// Submission errors for engines the hardware lacks are expected and
/// skipped. Any other submission error means the handle is unusable and is
/// returned.
pub fn force_idle(handle: &DeviceHandle) -> Result<IdleReport> {
    force_idle_device(handle.device())
}

/// `force_idle` on a bare device
pub fn force_idle_device(device: &dyn DrmDevice) -> Result<IdleReport> {
    let batch = device.gem_create(BATCH_SIZE)?;

    let mut commands = [0u8; 8];
    commands[..4].copy_from_slice(&MI_BATCH_BUFFER_END.to_le_bytes());
    commands[4..].copy_from_slice(&MI_NOOP.to_le_bytes());

    let result = device
        .gem_write(batch, 0, &commands)
        .map_err(DrmError::from)
        .and_then(|()| submit_all(device, batch))
        .and_then(|report| device.gem_wait(batch).map(|()| report).map_err(DrmError::from));

    // The submission error, if any, is the one worth reporting
    let closed = device.gem_close(batch);
    let report = result?;
    closed?;

    match device.drop_caches(DROP_RETIRE | DROP_FREED) {
        Ok(()) => Ok(report),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
            warn!("Cannot drop i915 caches, debugfs unavailable: {}", e);
            Ok(report)
        }
        Err(e) => Err(e.into()),
    }
}

fn submit_all(device: &dyn DrmDevice, batch: u32) -> Result<IdleReport> {
    let mut report = IdleReport::default();

    for selector in 0..ENGINE_SELECTORS {
        if submit(device, batch, selector)? {
            report.submitted += 1;
        } else {
            report.unsupported += 1;
        }
    }

    if has_bsd2(device) {
        report.bsd2 = submit(device, batch, I915_EXEC_BSD | I915_EXEC_BSD_RING2)?;
    }

    Ok(report)
}

/// Submits the batch once; `Ok(false)` when the selector is not implemented
fn submit(device: &dyn DrmDevice, batch: u32, flags: u64) -> Result<bool> {
    match device.execbuf(batch, flags) {
        Ok(()) => Ok(true),
        Err(e) if is_unsupported_engine(&e) => Ok(false),
        Err(source) => Err(DrmError::Submission { selector: flags, source }),
    }
}

fn is_unsupported_engine(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::ENODEV) | Some(libc::EOPNOTSUPP)
    )
}

fn has_bsd2(device: &dyn DrmDevice) -> bool {
    device
        .get_param(I915_PARAM_HAS_BSD2)
        .map(|value| value != 0)
        .unwrap_or(false)
}
