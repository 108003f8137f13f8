// Kernel control surface for the DRM Testbed
//
// Raw DRM and i915 ioctl structures plus `KernelNode`, the `DrmDevice`
// implementation backed by an open /dev/dri node.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::mem::size_of;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use libc::{c_char, c_int, c_ulong, c_void};

use crate::gpu::device::{DeviceOpener, DrmDevice};

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const DRM_COMMAND_BASE: u32 = 0x40;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr) as c_ulong
}

const fn io(nr: u32) -> c_ulong {
    ioc(IOC_NONE, nr, 0)
}

const fn iow<T>(nr: u32) -> c_ulong {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

const fn iowr<T>(nr: u32) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, size_of::<T>())
}

/// i915 get-parameter ids
pub const I915_PARAM_CHIPSET_ID: i32 = 4;
pub const I915_PARAM_HAS_BSD2: i32 = 31;

/// Engine selector bits for execbuf
pub const I915_EXEC_BSD: u64 = 2;
pub const I915_EXEC_BSD_RING2: u64 = 2 << 13;

/// i915_gem_drop_caches flags
pub const DROP_RETIRE: u64 = 0x4;
pub const DROP_FREED: u64 = 0x10;

#[repr(C)]
struct DrmVersion {
    version_major: c_int,
    version_minor: c_int,
    version_patchlevel: c_int,
    name_len: usize,
    name: *mut c_char,
    date_len: usize,
    date: *mut c_char,
    desc_len: usize,
    desc: *mut c_char,
}

#[repr(C)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
struct DrmI915Getparam {
    param: c_int,
    value: *mut c_int,
}

#[repr(C)]
struct DrmI915GemCreate {
    size: u64,
    handle: u32,
    pad: u32,
}

#[repr(C)]
struct DrmI915GemPwrite {
    handle: u32,
    pad: u32,
    offset: u64,
    size: u64,
    data_ptr: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmI915GemExecObject2 {
    handle: u32,
    relocation_count: u32,
    relocs_ptr: u64,
    alignment: u64,
    offset: u64,
    flags: u64,
    rsvd1: u64,
    rsvd2: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmI915GemExecbuffer2 {
    buffers_ptr: u64,
    buffer_count: u32,
    batch_start_offset: u32,
    batch_len: u32,
    dr1: u32,
    dr4: u32,
    num_cliprects: u32,
    cliprects_ptr: u64,
    flags: u64,
    rsvd1: u64,
    rsvd2: u64,
}

#[repr(C)]
struct DrmI915GemWait {
    bo_handle: u32,
    flags: u32,
    timeout_ns: i64,
}

const DRM_IOCTL_VERSION: c_ulong = iowr::<DrmVersion>(0x00);
const DRM_IOCTL_GEM_CLOSE: c_ulong = iow::<DrmGemClose>(0x09);
const DRM_IOCTL_SET_MASTER: c_ulong = io(0x1e);
const DRM_IOCTL_I915_GETPARAM: c_ulong = iowr::<DrmI915Getparam>(DRM_COMMAND_BASE + 0x06);
const DRM_IOCTL_I915_GEM_CREATE: c_ulong = iowr::<DrmI915GemCreate>(DRM_COMMAND_BASE + 0x1b);
const DRM_IOCTL_I915_GEM_PWRITE: c_ulong = iow::<DrmI915GemPwrite>(DRM_COMMAND_BASE + 0x1d);
const DRM_IOCTL_I915_GEM_EXECBUFFER2: c_ulong = iow::<DrmI915GemExecbuffer2>(DRM_COMMAND_BASE + 0x29);
const DRM_IOCTL_I915_GEM_WAIT: c_ulong = iowr::<DrmI915GemWait>(DRM_COMMAND_BASE + 0x2c);

/// Issues an ioctl, restarting it when interrupted
fn drm_ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> io::Result<()> {
    loop {
        // SAFETY: `arg` points at a live #[repr(C)] struct matching `request`
        // (or is null for argument-less requests).
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Minor number of a character device, glibc encoding
fn dev_minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & 0xffff_ff00)
}

/// Minor of the primary node sharing a device with `minor`
///
/// Render (128+) and control (64+) minors carry the card index in their low
/// six bits; i915 only registers its debugfs files under the primary minor.
pub fn primary_minor(minor: u64) -> u64 {
    minor & 0x3f
}

/// An open DRM device node
#[derive(Debug)]
pub struct KernelNode {
    file: File,
    drop_caches_path: PathBuf, // <debugfs>/<minor>/i915_gem_drop_caches
}

impl KernelNode {
    /// Opens `path` read-write; `debugfs_root` is the dri debugfs directory
    pub fn open(path: &Path, debugfs_root: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let minor = primary_minor(dev_minor(file.metadata()?.rdev()));
        let drop_caches_path = debugfs_root
            .join(minor.to_string())
            .join("i915_gem_drop_caches");

        Ok(Self { file, drop_caches_path })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DrmDevice for KernelNode {
    fn driver_name(&self) -> io::Result<String> {
        let mut name = [0u8; 5];
        let mut version = DrmVersion {
            version_major: 0,
            version_minor: 0,
            version_patchlevel: 0,
            name_len: 4,
            name: name.as_mut_ptr() as *mut c_char,
            date_len: 0,
            date: ptr::null_mut(),
            desc_len: 0,
            desc: ptr::null_mut(),
        };
        drm_ioctl(self.fd(), DRM_IOCTL_VERSION, &mut version as *mut _ as *mut c_void)?;

        // The kernel copies at most name_len bytes and reports the full length
        let end = name[..4].iter().position(|&b| b == 0).unwrap_or(4);
        Ok(String::from_utf8_lossy(&name[..end]).into_owned())
    }

    fn get_param(&self, param: i32) -> io::Result<i32> {
        let mut value: c_int = 0;
        let mut gp = DrmI915Getparam { param, value: &mut value };
        drm_ioctl(self.fd(), DRM_IOCTL_I915_GETPARAM, &mut gp as *mut _ as *mut c_void)?;
        Ok(value)
    }

    fn gem_create(&self, size: u64) -> io::Result<u32> {
        let mut create = DrmI915GemCreate { size, handle: 0, pad: 0 };
        drm_ioctl(self.fd(), DRM_IOCTL_I915_GEM_CREATE, &mut create as *mut _ as *mut c_void)?;
        Ok(create.handle)
    }

    fn gem_write(&self, handle: u32, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut pwrite = DrmI915GemPwrite {
            handle,
            pad: 0,
            offset,
            size: data.len() as u64,
            data_ptr: data.as_ptr() as u64,
        };
        drm_ioctl(self.fd(), DRM_IOCTL_I915_GEM_PWRITE, &mut pwrite as *mut _ as *mut c_void)
    }

    fn execbuf(&self, handle: u32, flags: u64) -> io::Result<()> {
        let mut object = DrmI915GemExecObject2 { handle, ..Default::default() };
        let mut execbuf = DrmI915GemExecbuffer2 {
            buffers_ptr: &mut object as *mut _ as u64,
            buffer_count: 1,
            flags,
            ..Default::default()
        };
        drm_ioctl(self.fd(), DRM_IOCTL_I915_GEM_EXECBUFFER2, &mut execbuf as *mut _ as *mut c_void)
    }

    fn gem_wait(&self, handle: u32) -> io::Result<()> {
        // Negative timeout waits forever
        let mut wait = DrmI915GemWait { bo_handle: handle, flags: 0, timeout_ns: -1 };
        drm_ioctl(self.fd(), DRM_IOCTL_I915_GEM_WAIT, &mut wait as *mut _ as *mut c_void)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut close = DrmGemClose { handle, pad: 0 };
        drm_ioctl(self.fd(), DRM_IOCTL_GEM_CLOSE, &mut close as *mut _ as *mut c_void)
    }

    fn drop_caches(&self, flags: u64) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.drop_caches_path)?;
        write!(file, "{:#x}", flags)
    }

    fn set_master(&self) -> io::Result<()> {
        drm_ioctl(self.fd(), DRM_IOCTL_SET_MASTER, ptr::null_mut())
    }
}

/// Opens real device nodes
#[derive(Debug, Clone)]
pub struct KernelOpener {
    debugfs_root: PathBuf,
}

impl KernelOpener {
    pub fn new(debugfs_root: impl Into<PathBuf>) -> Self {
        Self { debugfs_root: debugfs_root.into() }
    }
}

impl DeviceOpener for KernelOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DrmDevice>> {
        Ok(Box::new(KernelNode::open(path, &self.debugfs_root)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn request_numbers_match_the_kernel_headers() {
        assert_eq!(DRM_IOCTL_VERSION, 0xc040_6400);
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_SET_MASTER, 0x641e);
        assert_eq!(DRM_IOCTL_I915_GETPARAM, 0xc010_6446);
        assert_eq!(DRM_IOCTL_I915_GEM_CREATE, 0xc010_645b);
        assert_eq!(DRM_IOCTL_I915_GEM_PWRITE, 0x4020_645d);
        assert_eq!(DRM_IOCTL_I915_GEM_EXECBUFFER2, 0x4040_6469);
        assert_eq!(DRM_IOCTL_I915_GEM_WAIT, 0xc010_646c);
    }

    #[test]
    fn minor_numbers_decode() {
        // card0 is 226:0, renderD128 is 226:128
        assert_eq!(dev_minor(0xe200), 0);
        assert_eq!(dev_minor(0xe280), 128);
    }

    #[test]
    fn render_minors_share_the_card_debugfs_directory() {
        assert_eq!(primary_minor(0), 0);
        assert_eq!(primary_minor(2), 2);
        assert_eq!(primary_minor(128), 0);
        assert_eq!(primary_minor(129), 1);
        assert_eq!(primary_minor(dev_minor(0xe281)), 1);
    }

    #[test]
    fn opening_a_regular_file_yields_a_node_that_fails_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card0");
        std::fs::write(&path, b"").unwrap();

        let node = KernelNode::open(&path, dir.path()).unwrap();
        assert_eq!(node.drop_caches_path, dir.path().join("0").join("i915_gem_drop_caches"));
        assert!(node.driver_name().is_err());
        assert!(node.get_param(I915_PARAM_CHIPSET_ID).is_err());
    }
}
