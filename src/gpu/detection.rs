// Device classification module for the DRM Testbed
//
// This module identifies the driver family behind an open DRM node and,
// for i915 nodes, the chipset generation. Classification never retries
// and never changes the state of the node it inspects.

use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::error::{DrmError, Result};
use crate::gpu::chipset::{self, IntelChipset};
use crate::gpu::device::DrmDevice;
use crate::gpu::ioctl::I915_PARAM_CHIPSET_ID;
use crate::gpu::{DeviceHandle, DriverFamily};

/// Classifier state shared by every classification in a session
///
/// Holds the most recently resolved Intel chipset id so later code can ask
/// for the generation without another query.
#[derive(Debug, Default)]
pub struct ClassifierState {
    device_id: AtomicU32, // 0 until a supported chipset has been seen
}

impl ClassifierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached chipset id, if any
    pub fn device_id(&self) -> Option<u16> {
        match self.device_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id as u16),
        }
    }

    /// The cached chipset, looked up again in the generation table
    pub fn chipset(&self) -> Option<IntelChipset> {
        self.device_id().and_then(chipset::lookup)
    }

    fn remember(&self, device_id: u16) {
        self.device_id.store(device_id as u32, Ordering::Release);
    }
}

/// Identifies the driver family from the version query
///
/// Returns `None` when the query itself fails (no permission, not a DRM
/// node, ...).
pub fn identify_family(device: &dyn DrmDevice) -> Option<DriverFamily> {
    match device.driver_name() {
        Ok(name) => Some(DriverFamily::from_driver_name(&name)),
        Err(e) => {
            debug!("version query failed: {}", e);
            None
        }
    }
}

/// Looks up the chipset generation of an i915 node
///
/// Only meaningful for the Intel family; other drivers reject the parameter
/// query and end up unsupported. A supported id is cached in `state`.
pub fn chipset_generation(device: &dyn DrmDevice, state: &ClassifierState) -> Option<IntelChipset> {
    let id = match device.get_param(I915_PARAM_CHIPSET_ID) {
        Ok(id) => id,
        Err(e) => {
            debug!("chipset id query failed: {}", e);
            return None;
        }
    };

    let chipset = u16::try_from(id).ok().and_then(chipset::lookup);
    match chipset {
        Some(chipset) => state.remember(chipset.device_id),
        None => debug!("chipset id {:#06x} is not a known Intel gpu", id),
    }
    chipset
}

/// Runs both classification steps
pub fn classify(device: &dyn DrmDevice, state: &ClassifierState) -> (Option<DriverFamily>, Option<IntelChipset>) {
    let family = identify_family(device);
    let chipset = match family {
        Some(DriverFamily::Intel) => chipset_generation(device, state),
        _ => None,
    };
    (family, chipset)
}

/// Fails with a requirement error unless the handle is a supported Intel gpu
pub fn require_intel(handle: &DeviceHandle) -> Result<()> {
    if handle.is_intel() {
        Ok(())
    } else {
        Err(DrmError::Requirement(format!(
            "{} is not a known Intel gpu",
            handle.path().display()
        )))
    }
}
