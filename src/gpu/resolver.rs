// Device resolution module for the DRM Testbed
//
// This module scans the legacy and render device nodes, classifies each
// one, and hands back the first node matching a chipset mask. Rejected
// nodes are closed before the scan moves on.

use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;

use crate::core::config::Config;
use crate::gpu::detection::{classify, ClassifierState};
use crate::gpu::device::{DeviceOpener, ModuleLoader};
use crate::gpu::{ChipsetMask, DeviceHandle, DriverFamily, NodeKind};

/// Legacy nodes inspected when looking up the Intel card index
const CARD_INDEX_SCAN: u32 = 16;

/// One row of a node probe
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub driver: Option<String>,   // Family name, None if unclassifiable
    pub chipset: Option<String>,  // Intel platform name
    pub generation: Option<u8>,
}

/// Scans device nodes on behalf of a session
pub struct Resolver<'a> {
    config: &'a Config,
    opener: &'a dyn DeviceOpener,
    loader: &'a dyn ModuleLoader,
    classifier: &'a ClassifierState,
}

impl<'a> Resolver<'a> {
    pub fn new(
        config: &'a Config,
        opener: &'a dyn DeviceOpener,
        loader: &'a dyn ModuleLoader,
        classifier: &'a ClassifierState,
    ) -> Self {
        Self { config, opener, loader, classifier }
    }

    /// Returns the first legacy node matching `mask`
    ///
    /// Nodes are tried from the highest index down. When `mask` is exactly
    /// `ANY`, the first node that is not vgem is taken whatever its driver.
    pub fn resolve(&self, mask: ChipsetMask) -> Option<DeviceHandle> {
        if mask.contains(ChipsetMask::VGEM) {
            // Failure shows up later as no node classifying as vgem
            if let Err(e) = self.loader.load("vgem") {
                debug!("loading vgem failed: {}", e);
            }
        }

        for index in (0..self.config.legacy_count).rev() {
            let Some(handle) = self.open_classified(self.config.legacy_path(index), NodeKind::Legacy) else {
                continue;
            };

            if matches_mask(&handle, mask) {
                info!("Using {} ({})", handle.path().display(), describe(&handle));
                return Some(handle);
            }

            debug!("{} does not match {}, closing", handle.path().display(), mask);
            handle.close();
        }

        None
    }

    /// Returns the first render node backed by a supported Intel gpu
    ///
    /// Render nodes are tried from the lowest index up. The mask is not
    /// consulted: only Intel render nodes are ever accepted here.
    pub fn resolve_render_node(&self, _mask: ChipsetMask) -> Option<DeviceHandle> {
        for offset in 0..self.config.render_count {
            let Some(handle) = self.open_classified(self.config.render_path(offset), NodeKind::Render) else {
                continue;
            };

            if handle.is_intel() {
                info!("Using {} ({})", handle.path().display(), describe(&handle));
                return Some(handle);
            }

            debug!("{} is not a known Intel gpu, closing", handle.path().display());
            handle.close();
        }

        None
    }

    /// Prefers a render node, falling back to the legacy scan
    pub fn resolve_render(&self, mask: ChipsetMask) -> Option<DeviceHandle> {
        self.resolve_render_node(mask).or_else(|| {
            debug!("no render node found, falling back to legacy nodes");
            self.resolve(mask)
        })
    }

    /// Index of the first legacy node backed by a supported Intel gpu
    ///
    /// Suitable for building /dev or /sys paths. Nodes are tried from 0 up.
    pub fn intel_card_index(&self) -> Option<u32> {
        (0..CARD_INDEX_SCAN).find(|&index| {
            self.open_classified(self.config.legacy_path(index), NodeKind::Legacy)
                .map(|handle| handle.is_intel())
                .unwrap_or(false)
        })
    }

    /// Opens every configured node and reports its classification
    pub fn probe_all(&self) -> Vec<NodeReport> {
        let legacy = (0..self.config.legacy_count).map(|i| (self.config.legacy_path(i), NodeKind::Legacy));
        let render = (0..self.config.render_count).map(|i| (self.config.render_path(i), NodeKind::Render));

        legacy
            .chain(render)
            .filter_map(|(path, kind)| self.open_classified(path, kind))
            .map(|handle| NodeReport {
                path: handle.path().to_path_buf(),
                kind: handle.kind(),
                driver: handle.family().map(|family| family.to_string()),
                chipset: handle.chipset().map(|chipset| chipset.platform.to_string()),
                generation: handle.generation(),
            })
            .collect()
    }

    fn open_classified(&self, path: PathBuf, kind: NodeKind) -> Option<DeviceHandle> {
        let device = match self.opener.open(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("cannot open {}: {}", path.display(), e);
                return None;
            }
        };

        let (family, chipset) = classify(device.as_ref(), self.classifier);
        if family.is_none() {
            debug!("{} did not answer the version query", path.display());
        }
        Some(DeviceHandle::new(device, path, kind, family, chipset))
    }
}

/// Whether a classified handle satisfies a chipset mask
fn matches_mask(handle: &DeviceHandle, mask: ChipsetMask) -> bool {
    match handle.family() {
        // i915 only counts as Intel once the chipset is known
        Some(DriverFamily::Intel) if handle.is_intel() && mask.contains(ChipsetMask::INTEL) => true,
        Some(family @ (DriverFamily::Vc4 | DriverFamily::Vgem | DriverFamily::Virtio))
            if mask.intersects(family.mask()) =>
        {
            true
        }
        // vgem is only ever used when asked for explicitly
        family => mask == ChipsetMask::ANY && family != Some(&DriverFamily::Vgem),
    }
}

fn describe(handle: &DeviceHandle) -> String {
    match (handle.family(), handle.chipset()) {
        (_, Some(chipset)) => chipset.to_string(),
        (Some(family), None) => family.to_string(),
        (None, None) => "unknown driver".to_string(),
    }
}
