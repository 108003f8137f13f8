// Device lifecycle management for the DRM Testbed
//
// `DrmSession` is the entry point for tests that need a DRM device. The
// first caller to open a device of a given category idles the gpu and
// registers an exit handler that idles it again when the process ends.
// Everybody else just gets a handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use log::{info, warn};

use crate::core::config::Config;
use crate::core::exit::{self, ExitHandlers};
use crate::error::{DrmError, Result};
use crate::gpu::detection::ClassifierState;
use crate::gpu::device::{DeviceOpener, ModuleLoader, Modprobe};
use crate::gpu::ioctl::KernelOpener;
use crate::gpu::quiesce;
use crate::gpu::resolver::Resolver;
use crate::gpu::{ChipsetMask, DeviceHandle, DriverFamily};

/// The two kinds of open request that get their own one-time setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Legacy,
    Render,
}

/// One-time initialization gate
///
/// Counts open requests; only the caller that observes zero wins. The count
/// never goes down and says nothing about how many handles are open.
#[derive(Debug, Default)]
pub struct OpenGate {
    opens: AtomicUsize,
}

impl OpenGate {
    /// Records an open; true for exactly one caller over the gate's life
    pub fn enter(&self) -> bool {
        self.opens.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub fn count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }
}

/// The handle an exit handler idles and closes
///
/// Empty until armed, and empty again after the handler has fired.
#[derive(Debug, Default)]
pub struct ExitState {
    slot: Mutex<Option<DeviceHandle>>,
}

impl ExitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the handle to clean up; false if one is already stored
    fn arm(&self, handle: DeviceHandle) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Idles and closes the stored handle, if there still is one
    ///
    /// Safe to call any number of times, before or after arming. Errors are
    /// dropped: the process is going away.
    pub fn fire(&self) {
        let handle = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = quiesce::force_idle(&handle);
            handle.close();
        }
    }
}

#[derive(Debug, Default)]
struct CategoryState {
    gate: OpenGate,
    exit: Arc<ExitState>,
}

/// Device resolution plus per-process setup and teardown
pub struct DrmSession {
    config: Config,
    opener: Box<dyn DeviceOpener>,
    loader: Box<dyn ModuleLoader>,
    classifier: ClassifierState,
    exit_handlers: Arc<ExitHandlers>,
    legacy: CategoryState,
    render: CategoryState,
}

static SYSTEM: OnceLock<DrmSession> = OnceLock::new();

impl DrmSession {
    pub fn new(
        config: Config,
        opener: Box<dyn DeviceOpener>,
        loader: Box<dyn ModuleLoader>,
        exit_handlers: Arc<ExitHandlers>,
    ) -> Self {
        Self {
            config,
            opener,
            loader,
            classifier: ClassifierState::new(),
            exit_handlers,
            legacy: CategoryState::default(),
            render: CategoryState::default(),
        }
    }

    /// A session over the real device nodes, cleaning up through the
    /// process-wide exit registry
    pub fn kernel(config: Config) -> Self {
        let opener = Box::new(KernelOpener::new(config.debugfs_root.clone()));
        let loader = Box::new(Modprobe::new(config.modprobe.clone()));
        let handlers = exit::global();
        if let Err(e) = exit::install_process_hooks(Arc::clone(&handlers)) {
            warn!("{}", e);
        }
        Self::new(config, opener, loader, handlers)
    }

    /// The process-wide kernel session, configured from the environment
    pub fn system() -> &'static DrmSession {
        SYSTEM.get_or_init(|| {
            let config = Config::load().unwrap_or_else(|e| {
                warn!("{}, using defaults", e);
                Config::default()
            });
            DrmSession::kernel(config)
        })
    }

    /// Sets up the process-wide session with `config` unless it already exists
    pub fn install_system(config: Config) -> &'static DrmSession {
        SYSTEM.get_or_init(|| DrmSession::kernel(config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classifier(&self) -> &ClassifierState {
        &self.classifier
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.config, self.opener.as_ref(), self.loader.as_ref(), &self.classifier)
    }

    /// Open requests seen so far for a category
    pub fn open_count(&self, category: Category) -> usize {
        self.category(category).gate.count()
    }

    pub fn exit_state(&self, category: Category) -> &Arc<ExitState> {
        &self.category(category).exit
    }

    /// Opens a legacy node matching `mask`
    ///
    /// For i915 the first caller also idles the gpu and arranges for it to
    /// be idled again at exit. Returns `NotFound` if nothing matches.
    pub fn open_driver(&self, mask: ChipsetMask) -> Result<DeviceHandle> {
        let handle = self
            .resolver()
            .resolve(mask)
            .ok_or(DrmError::NotFound { mask })?;

        if handle.family() == Some(&DriverFamily::Intel) && self.legacy.gate.enter() {
            quiesce::force_idle(&handle)?;
            self.arm_exit_handler(Category::Legacy, mask);
        }

        Ok(handle)
    }

    /// Opens a legacy node and makes it DRM master
    pub fn open_driver_master(&self, mask: ChipsetMask) -> Result<DeviceHandle> {
        let handle = self.open_driver(mask)?;
        elevate_to_master(&handle)?;
        Ok(handle)
    }

    /// Opens a render node, or a legacy node when no render node matches
    pub fn open_driver_render(&self, mask: ChipsetMask) -> Result<DeviceHandle> {
        let Some(handle) = self.resolver().resolve_render_node(mask) else {
            return self.open_driver(mask);
        };

        if !self.render.gate.enter() {
            return Ok(handle);
        }

        // Engine idling only applies to Intel sessions
        if mask.contains(ChipsetMask::INTEL) {
            quiesce::force_idle(&handle)?;
            self.arm_exit_handler(Category::Render, mask);
        }

        Ok(handle)
    }

    /// Opens the at-exit handle and registers the handler that drains it
    ///
    /// The at-exit handle is always a legacy node, render category included.
    fn arm_exit_handler(&self, category: Category, mask: ChipsetMask) {
        let Some(exit_handle) = self.resolver().resolve(mask) else {
            warn!("No second {:?} handle for exit cleanup", category);
            return;
        };

        let state = Arc::clone(&self.category(category).exit);
        if !state.arm(exit_handle) {
            return;
        }

        info!("Registered exit handler for {:?} category", category);
        self.exit_handlers.install(move |_reason| state.fire());
    }

    fn category(&self, category: Category) -> &CategoryState {
        match category {
            Category::Legacy => &self.legacy,
            Category::Render => &self.render,
        }
    }
}

/// Makes `handle` DRM master
///
/// Failure is a requirement failure: another client owns the display.
pub fn elevate_to_master(handle: &DeviceHandle) -> Result<()> {
    handle.set_master().map_err(|e| {
        DrmError::Requirement(format!(
            "Can't become DRM master on {} ({}), please check if no other DRM client is running",
            handle.path().display(),
            e
        ))
    })
}
