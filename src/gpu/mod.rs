// GPU device module for the DRM Testbed
//
// This module handles DRM device node classification, resolution and
// quiescence, plus the handle type that ties an open node to its
// classification.

pub mod chipset;
pub mod detection;
pub mod device;
pub mod ioctl;
pub mod quiesce;
pub mod resolver;

#[cfg(test)]
pub(crate) mod sim;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::DrmError;
use crate::gpu::chipset::IntelChipset;
use crate::gpu::device::DrmDevice;

/// Driver families recognised by the version query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverFamily {
    Intel,
    Vc4,
    Vgem,
    Virtio,
    Other(String),
}

impl DriverFamily {
    /// Classifies a (possibly truncated) driver name
    pub fn from_driver_name(name: &str) -> Self {
        match name {
            "i915" => DriverFamily::Intel,
            "vc4" => DriverFamily::Vc4,
            "vgem" => DriverFamily::Vgem,
            // virtio_gpu, cut to four bytes by the version query
            "virt" => DriverFamily::Virtio,
            other => DriverFamily::Other(other.to_string()),
        }
    }

    /// The mask bit this family answers to; empty for unknown drivers
    pub fn mask(&self) -> ChipsetMask {
        match self {
            DriverFamily::Intel => ChipsetMask::INTEL,
            DriverFamily::Vc4 => ChipsetMask::VC4,
            DriverFamily::Vgem => ChipsetMask::VGEM,
            DriverFamily::Virtio => ChipsetMask::VIRTIO,
            DriverFamily::Other(_) => ChipsetMask::empty(),
        }
    }
}

impl fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverFamily::Intel => write!(f, "Intel"),
            DriverFamily::Vc4 => write!(f, "VC4"),
            DriverFamily::Vgem => write!(f, "VGEM"),
            DriverFamily::Virtio => write!(f, "virtio"),
            DriverFamily::Other(name) => write!(f, "{}", name),
        }
    }
}

bitflags::bitflags! {
    /// Driver families a resolution request accepts
    ///
    /// `ANY` deliberately leaves out `VGEM`: the synthetic vgem device must be
    /// asked for by name.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChipsetMask: u32 {
        const INTEL = 1 << 0;
        const VC4 = 1 << 1;
        const VGEM = 1 << 2;
        const VIRTIO = 1 << 3;
        const ANY = !(1 << 2);
    }
}

impl fmt::Display for ChipsetMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == ChipsetMask::ANY {
            return write!(f, "any");
        }

        let names: Vec<&str> = [
            (ChipsetMask::INTEL, "intel"),
            (ChipsetMask::VC4, "vc4"),
            (ChipsetMask::VGEM, "vgem"),
            (ChipsetMask::VIRTIO, "virtio"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();

        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

impl FromStr for ChipsetMask {
    type Err = DrmError;

    /// Parses a comma separated list such as `intel,vgem` or `any`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = ChipsetMask::empty();
        for word in s.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            mask |= match word.to_ascii_lowercase().as_str() {
                "intel" | "i915" => ChipsetMask::INTEL,
                "vc4" => ChipsetMask::VC4,
                "vgem" => ChipsetMask::VGEM,
                "virtio" | "virt" => ChipsetMask::VIRTIO,
                "any" => ChipsetMask::ANY,
                _ => return Err(DrmError::InvalidArgument(format!("unknown chipset '{}'", word))),
            };
        }

        if mask.is_empty() {
            return Err(DrmError::InvalidArgument("empty chipset mask".to_string()));
        }
        Ok(mask)
    }
}

/// Which family of device node a handle was opened from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Legacy, // /dev/dri/cardN, supports modesetting and master
    Render, // /dev/dri/renderDN, no display ownership
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeKind::Legacy => write!(f, "legacy"),
            NodeKind::Render => write!(f, "render"),
        }
    }
}

/// An open, classified DRM device node
///
/// The handle owns its descriptor; `close` consumes it, so a node can never
/// be closed twice.
pub struct DeviceHandle {
    device: Box<dyn DrmDevice>,
    path: PathBuf,
    kind: NodeKind,
    family: Option<DriverFamily>,
    chipset: Option<IntelChipset>,
}

impl DeviceHandle {
    pub(crate) fn new(
        device: Box<dyn DrmDevice>,
        path: PathBuf,
        kind: NodeKind,
        family: Option<DriverFamily>,
        chipset: Option<IntelChipset>,
    ) -> Self {
        Self { device, path, kind, family, chipset }
    }

    /// Returns the node path the handle was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the driver family, `None` if the version query failed
    pub fn family(&self) -> Option<&DriverFamily> {
        self.family.as_ref()
    }

    pub fn chipset(&self) -> Option<IntelChipset> {
        self.chipset
    }

    /// Intel graphics generation, if this is a supported Intel device
    pub fn generation(&self) -> Option<u8> {
        self.chipset.map(|chipset| chipset.gen)
    }

    /// True for i915 nodes whose chipset is in the generation table
    pub fn is_intel(&self) -> bool {
        self.family == Some(DriverFamily::Intel) && self.chipset.is_some()
    }

    pub fn device(&self) -> &dyn DrmDevice {
        self.device.as_ref()
    }

    /// Requests DRM master on this node
    pub fn set_master(&self) -> io::Result<()> {
        self.device.set_master()
    }

    /// Closes the underlying descriptor
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("chipset", &self.chipset)
            .finish()
    }
}
