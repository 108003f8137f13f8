// Simulated DRM nodes for unit tests
//
// A `SimOpener` maps node paths to `SimNode` descriptions and counts every
// request made against each node, including opens and closes.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::gpu::device::{DeviceOpener, DrmDevice, ModuleLoader};
use crate::gpu::ioctl::{I915_EXEC_BSD, I915_EXEC_BSD_RING2, I915_PARAM_CHIPSET_ID, I915_PARAM_HAS_BSD2};

/// Behaviour of one simulated node
#[derive(Debug, Clone)]
pub(crate) struct SimNode {
    driver: Option<&'static str>, // None: version query fails
    chipset_id: i32,
    bsd2: bool,
    submit_errno: Option<i32>, // returned by every valid submission
    master_busy: bool,
    drop_caches_errno: Option<i32>,
}

impl SimNode {
    pub fn intel(chipset_id: u16) -> Self {
        Self::named("i915").with_chipset(chipset_id)
    }

    pub fn named(driver: &'static str) -> Self {
        Self {
            driver: Some(driver),
            chipset_id: 0,
            bsd2: false,
            submit_errno: None,
            master_busy: false,
            drop_caches_errno: None,
        }
    }

    pub fn unclassifiable() -> Self {
        Self { driver: None, ..Self::named("") }
    }

    pub fn with_chipset(mut self, chipset_id: u16) -> Self {
        self.chipset_id = chipset_id as i32;
        self
    }

    pub fn with_bsd2(mut self) -> Self {
        self.bsd2 = true;
        self
    }

    pub fn failing_submissions(mut self, errno: i32) -> Self {
        self.submit_errno = Some(errno);
        self
    }

    pub fn master_busy(mut self) -> Self {
        self.master_busy = true;
        self
    }

    pub fn failing_drop_caches(mut self, errno: i32) -> Self {
        self.drop_caches_errno = Some(errno);
        self
    }

    fn is_intel(&self) -> bool {
        self.driver == Some("i915")
    }
}

/// Request counters for one node path
#[derive(Debug, Default)]
pub(crate) struct SimStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub version_queries: AtomicUsize,
    pub gem_creates: AtomicUsize,
    pub gem_closes: AtomicUsize,
    pub submissions: AtomicUsize, // accepted execbufs
    pub bsd2_submissions: AtomicUsize,
    pub waits: AtomicUsize,
    pub drop_caches: AtomicUsize,
    pub master_requests: AtomicUsize,
}

impl SimStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SimDevice {
    node: SimNode,
    stats: Arc<SimStats>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl DrmDevice for SimDevice {
    fn driver_name(&self) -> io::Result<String> {
        SimStats::bump(&self.stats.version_queries);
        self.node
            .driver
            .map(|name| name.chars().take(4).collect())
            .ok_or_else(|| errno(libc::EACCES))
    }

    fn get_param(&self, param: i32) -> io::Result<i32> {
        if !self.node.is_intel() {
            return Err(errno(libc::ENOTTY));
        }
        match param {
            I915_PARAM_CHIPSET_ID => Ok(self.node.chipset_id),
            I915_PARAM_HAS_BSD2 => Ok(self.node.bsd2 as i32),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn gem_create(&self, _size: u64) -> io::Result<u32> {
        if !self.node.is_intel() {
            return Err(errno(libc::ENOTTY));
        }
        SimStats::bump(&self.stats.gem_creates);
        Ok(1)
    }

    fn gem_write(&self, _handle: u32, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn execbuf(&self, _handle: u32, flags: u64) -> io::Result<()> {
        if flags == I915_EXEC_BSD | I915_EXEC_BSD_RING2 {
            if !self.node.bsd2 {
                return Err(errno(libc::EINVAL));
            }
            SimStats::bump(&self.stats.bsd2_submissions);
            return Ok(());
        }
        // default, render, bsd, blt and vebox rings exist; everything else is EINVAL
        if flags > 4 {
            return Err(errno(libc::EINVAL));
        }
        if let Some(code) = self.node.submit_errno {
            return Err(errno(code));
        }
        SimStats::bump(&self.stats.submissions);
        Ok(())
    }

    fn gem_wait(&self, _handle: u32) -> io::Result<()> {
        SimStats::bump(&self.stats.waits);
        Ok(())
    }

    fn gem_close(&self, _handle: u32) -> io::Result<()> {
        SimStats::bump(&self.stats.gem_closes);
        Ok(())
    }

    fn drop_caches(&self, _flags: u64) -> io::Result<()> {
        SimStats::bump(&self.stats.drop_caches);
        match self.node.drop_caches_errno {
            Some(code) => Err(errno(code)),
            None => Ok(()),
        }
    }

    fn set_master(&self) -> io::Result<()> {
        SimStats::bump(&self.stats.master_requests);
        if self.node.master_busy {
            return Err(errno(libc::EBUSY));
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        SimStats::bump(&self.stats.closes);
    }
}

/// Opens simulated nodes by path
#[derive(Debug, Default)]
pub(crate) struct SimOpener {
    nodes: HashMap<PathBuf, (SimNode, Arc<SimStats>)>,
}

impl SimOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, path: impl Into<PathBuf>, node: SimNode) -> Self {
        self.nodes.insert(path.into(), (node, Arc::new(SimStats::default())));
        self
    }

    pub fn stats(&self, path: impl AsRef<Path>) -> Arc<SimStats> {
        self.nodes
            .get(path.as_ref())
            .map(|(_, stats)| Arc::clone(stats))
            .unwrap_or_default()
    }

    /// Descriptors opened but not yet closed, over all nodes
    pub fn live_descriptors(&self) -> usize {
        self.nodes
            .values()
            .map(|(_, s)| SimStats::get(&s.opens) - SimStats::get(&s.closes))
            .sum()
    }

    /// Scratch buffers created over all nodes, one per quiescence run
    pub fn total_quiesces(&self) -> usize {
        self.nodes.values().map(|(_, s)| SimStats::get(&s.gem_creates)).sum()
    }
}

impl DeviceOpener for SimOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DrmDevice>> {
        let (node, stats) = self
            .nodes
            .get(path)
            .ok_or_else(|| errno(libc::ENOENT))?;
        SimStats::bump(&stats.opens);
        Ok(Box::new(SimDevice { node: node.clone(), stats: Arc::clone(stats) }))
    }
}

impl DeviceOpener for Arc<SimOpener> {
    fn open(&self, path: &Path) -> io::Result<Box<dyn DrmDevice>> {
        self.as_ref().open(path)
    }
}

/// Module loader that records requests and always fails
#[derive(Debug, Default)]
pub(crate) struct SimLoader {
    pub requests: Mutex<Vec<String>>,
}

impl ModuleLoader for SimLoader {
    fn load(&self, module: &str) -> Result<(), String> {
        self.requests
            .lock()
            .unwrap()
            .push(module.to_string());
        Err(format!("modprobe {} not available", module))
    }
}

impl ModuleLoader for Arc<SimLoader> {
    fn load(&self, module: &str) -> Result<(), String> {
        self.as_ref().load(module)
    }
}
