// Device access traits for the DRM Testbed
//
// The resolver, quiescence engine and lifecycle manager only talk to device
// nodes through these traits. `gpu::ioctl` provides the kernel-backed
// implementation.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::utils::run_command_args;

/// Operations on one open DRM device node
///
/// Every method maps onto a single kernel request. Implementations must not
/// retry on their own apart from restarting interrupted calls.
pub trait DrmDevice: Send + fmt::Debug {
    /// Short driver name from the version query, at most four bytes
    fn driver_name(&self) -> io::Result<String>;

    /// i915 get-parameter query
    fn get_param(&self, param: i32) -> io::Result<i32>;

    /// Allocates a buffer object and returns its handle
    fn gem_create(&self, size: u64) -> io::Result<u32>;

    /// Writes `data` into a buffer object at `offset`
    fn gem_write(&self, handle: u32, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Submits a single buffer object as a batch with the given engine flags
    fn execbuf(&self, handle: u32, flags: u64) -> io::Result<()>;

    /// Blocks until all rendering to the buffer object has completed
    fn gem_wait(&self, handle: u32) -> io::Result<()>;

    /// Releases a buffer object handle
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    /// Asks the driver to drop the caches selected by `flags`
    fn drop_caches(&self, flags: u64) -> io::Result<()>;

    /// Requests DRM master (exclusive display ownership)
    fn set_master(&self) -> io::Result<()>;
}

/// Opens device node paths read-write
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DrmDevice>>;
}

/// Best-effort kernel module loading
pub trait ModuleLoader: Send + Sync {
    fn load(&self, module: &str) -> Result<(), String>;
}

/// Loads modules through the system `modprobe` binary
#[derive(Debug, Clone)]
pub struct Modprobe {
    program: PathBuf,
}

impl Modprobe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl ModuleLoader for Modprobe {
    fn load(&self, module: &str) -> Result<(), String> {
        // -s sends modprobe's own errors to syslog instead of the terminal
        run_command_args(&self.program, &["-s", module]).map(|_| ())
    }
}
