// Pipe CRC capture for the DRM Testbed
//
// Drives CRC collection through debugfs. Kernels with the generic DRM CRC
// interface expose `crtc-<n>/crc/{control,data}`; older i915 kernels use a
// single `i915_display_crc_ctl` file plus one `i915_pipe_<X>_crc` file per pipe.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::crc::{Crc, CrcSource, Pipe, PipeCrcCommand};
use crate::error::{DrmError, Result};

const LEGACY_CONTROL: &str = "i915_display_crc_ctl";

/// Which debugfs layout the kernel offers
#[derive(Debug, Clone, PartialEq, Eq)]
enum Interface {
    Generic { control: PathBuf, data: PathBuf },
    Legacy { control: PathBuf, data: PathBuf },
}

/// CRC capture on one pipe
#[derive(Debug)]
pub struct PipeCrc {
    pipe: Pipe,
    source: CrcSource,
    interface: Interface,
    reader: Option<BufReader<File>>, // Open while capturing
}

impl PipeCrc {
    /// Locates the CRC files for `pipe` under the device's debugfs directory
    pub fn new(debugfs_dir: &Path, pipe: Pipe, source: CrcSource) -> Result<Self> {
        let crtc = debugfs_dir.join(format!("crtc-{}", pipe.index())).join("crc");
        let interface = if crtc.join("control").exists() {
            Interface::Generic {
                control: crtc.join("control"),
                data: crtc.join("data"),
            }
        } else if debugfs_dir.join(LEGACY_CONTROL).exists() {
            Interface::Legacy {
                control: debugfs_dir.join(LEGACY_CONTROL),
                data: debugfs_dir.join(format!("i915_pipe_{}_crc", pipe.name())),
            }
        } else {
            return Err(DrmError::Requirement(format!(
                "no pipe CRC support under {}",
                debugfs_dir.display()
            )));
        };

        debug!("pipe {} crc interface: {:?}", pipe, interface);
        Ok(Self { pipe, source, interface, reader: None })
    }

    pub fn pipe(&self) -> Pipe {
        self.pipe
    }

    pub fn source(&self) -> CrcSource {
        self.source
    }

    pub fn is_generic(&self) -> bool {
        matches!(self.interface, Interface::Generic { .. })
    }

    pub fn is_running(&self) -> bool {
        self.reader.is_some()
    }

    /// Selects the source and opens the data file
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let data = match &self.interface {
            Interface::Generic { control, data } => {
                write_control(control, self.source.name())?;
                data.clone()
            }
            Interface::Legacy { control, data } => {
                // Reset first, the driver refuses to switch sources while running
                write_control(control, &PipeCrcCommand { pipe: self.pipe, source: CrcSource::None }.to_string())?;
                let command = PipeCrcCommand { pipe: self.pipe, source: self.source };
                write_control(control, &command.to_string())?;
                data.clone()
            }
        };

        let file = File::open(&data).map_err(|e| kernel_error(e, &data))?;
        self.reader = Some(BufReader::new(file));
        info!("Capturing pipe {} CRCs from source {}", self.pipe, self.source);
        Ok(())
    }

    /// Closes the data file and turns the source off again
    pub fn stop(&mut self) -> Result<()> {
        if self.reader.take().is_none() {
            return Ok(());
        }

        if let Interface::Legacy { control, .. } = &self.interface {
            let command = PipeCrcCommand { pipe: self.pipe, source: CrcSource::None };
            write_control(control, &command.to_string())?;
        }
        debug!("pipe {} crc capture stopped", self.pipe);
        Ok(())
    }

    /// Reads `count` samples, blocking until the kernel produces them
    pub fn read(&mut self, count: usize) -> Result<Vec<Crc>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DrmError::InvalidArgument(format!("pipe {} crc capture not started", self.pipe)))?;

        let mut crcs = Vec::with_capacity(count);
        let mut line = String::new();
        while crcs.len() < count {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                return Err(DrmError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("crc data ended after {} of {} samples", crcs.len(), count),
                )));
            }
            if line.trim().is_empty() {
                continue;
            }
            crcs.push(Crc::parse_line(&line)?);
        }
        Ok(crcs)
    }

    /// Starts, reads one sample and stops
    pub fn collect_one(&mut self) -> Result<Crc> {
        self.start()?;
        let result = self.read(1);
        self.stop()?;
        result?
            .pop()
            .ok_or_else(|| DrmError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "no crc sample")))
    }
}

impl Drop for PipeCrc {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("pipe {} crc cleanup failed: {}", self.pipe, e);
        }
    }
}

/// Writes a command to a control file
fn write_control(path: &Path, command: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| kernel_error(e, path))?;
    file.write_all(command.as_bytes()).map_err(|e| kernel_error(e, path))?;
    debug!("{} <- {}", path.display(), command);
    Ok(())
}

fn kernel_error(err: io::Error, path: &Path) -> DrmError {
    if err.raw_os_error() == Some(libc::EINVAL) {
        DrmError::InvalidArgument(format!("{} rejected the command", path.display()))
    } else {
        DrmError::Io(err)
    }
}

/// Commands the legacy control file must refuse: bad pipe, bad source, too
/// few words, too many words
pub const MALFORMED_COMMANDS: [&str; 4] = ["pipe D none", "pipe A foo", "pipe foo", "pipe A none option"];

/// Source name the generic interface must refuse
pub const BAD_SOURCE: &str = "foo";

/// Checks the kernel rejects malformed CRC requests
///
/// The generic interface accepts any source name on the control file and
/// fails the data file open with EINVAL instead. The legacy control file
/// rejects bad commands on write. Returns the requests that were wrongly
/// accepted.
pub fn check_control_grammar(debugfs_dir: &Path) -> Result<Vec<String>> {
    let crtc = debugfs_dir.join("crtc-0").join("crc");
    let generic = crtc.join("control").exists();
    let control = debugfs_dir.join(LEGACY_CONTROL);
    let legacy = control.exists();
    if !generic && !legacy {
        return Err(DrmError::Requirement(format!(
            "no pipe CRC control file under {}",
            debugfs_dir.display()
        )));
    }

    let mut accepted = Vec::new();

    if generic && !rejects_source(&crtc, BAD_SOURCE)? {
        accepted.push(BAD_SOURCE.to_string());
    }

    if legacy {
        for command in MALFORMED_COMMANDS {
            match write_control(&control, command) {
                Err(DrmError::InvalidArgument(_)) => {}
                Ok(()) => accepted.push(command.to_string()),
                Err(e) => return Err(e),
            }
        }
    }

    Ok(accepted)
}

/// Selects `source` on a generic crtc and reports whether opening the data
/// file then fails with EINVAL
fn rejects_source(crtc: &Path, source: &str) -> Result<bool> {
    match write_control(&crtc.join("control"), source) {
        Err(DrmError::InvalidArgument(_)) => return Ok(true),
        Err(e) => return Err(e),
        Ok(()) => {}
    }

    let data = crtc.join("data");
    match File::open(&data).map_err(|e| kernel_error(e, &data)) {
        Ok(_) => Ok(false),
        Err(DrmError::InvalidArgument(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn generic_interface_is_preferred() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-1/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();
        fs::write(dir.path().join(LEGACY_CONTROL), "").unwrap();

        let crc = PipeCrc::new(dir.path(), Pipe::B, CrcSource::Auto).unwrap();
        assert!(crc.is_generic());
    }

    #[test]
    fn missing_interface_is_a_requirement() {
        let dir = tempdir().unwrap();
        let err = PipeCrc::new(dir.path(), Pipe::A, CrcSource::Auto).unwrap_err();
        assert!(matches!(err, DrmError::Requirement(_)));
    }

    #[test]
    fn generic_capture_writes_the_source_and_reads_samples() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-0/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();
        fs::write(crc_dir.join("data"), "0x00000001 0x0000abcd\n0x00000002 0x0000abce\n").unwrap();

        let mut crc = PipeCrc::new(dir.path(), Pipe::A, CrcSource::Auto).unwrap();
        crc.start().unwrap();
        let samples = crc.read(2).unwrap();
        crc.stop().unwrap();

        assert_eq!(fs::read_to_string(crc_dir.join("control")).unwrap(), "auto");
        assert_eq!(samples[0].frame, Some(1));
        assert_eq!(samples[1].words, vec![0xabce]);
    }

    #[test]
    fn legacy_capture_resets_the_source_on_stop() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEGACY_CONTROL), "").unwrap();
        fs::write(dir.path().join("i915_pipe_C_crc"), "      7 12345678 0 0 0 0\n").unwrap();

        let mut crc = PipeCrc::new(dir.path(), Pipe::C, CrcSource::Pipe).unwrap();
        let sample = crc.collect_one().unwrap();

        assert_eq!(sample.frame, Some(7));
        assert_eq!(sample.words[0], 0x1234_5678);
        // Plain files keep only the last write
        assert_eq!(fs::read_to_string(dir.path().join(LEGACY_CONTROL)).unwrap(), "pipe C none");
    }

    #[test]
    fn short_data_is_an_error() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-0/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();
        fs::write(crc_dir.join("data"), "0x00000001 0x0000abcd\n").unwrap();

        let mut crc = PipeCrc::new(dir.path(), Pipe::A, CrcSource::Auto).unwrap();
        assert!(crc.read(1).is_err());
        crc.start().unwrap();
        assert!(matches!(crc.read(3), Err(DrmError::Io(_))));
    }

    #[test]
    fn malformed_commands_cover_each_grammar_rule() {
        assert_eq!(MALFORMED_COMMANDS, ["pipe D none", "pipe A foo", "pipe foo", "pipe A none option"]);
        for command in MALFORMED_COMMANDS {
            assert!(PipeCrcCommand::parse(command).is_err(), "'{}' parsed", command);
        }
        assert!(BAD_SOURCE.parse::<CrcSource>().is_err());
    }

    #[test]
    fn generic_bad_source_is_checked_through_the_data_file() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-0/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();
        fs::write(crc_dir.join("data"), "").unwrap();

        // Plain files open fine, so the bad source counts as accepted
        assert_eq!(check_control_grammar(dir.path()).unwrap(), vec![BAD_SOURCE.to_string()]);
        assert_eq!(fs::read_to_string(crc_dir.join("control")).unwrap(), BAD_SOURCE);
    }

    #[test]
    fn both_interfaces_are_checked_when_present() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-0/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();
        fs::write(crc_dir.join("data"), "").unwrap();
        fs::write(dir.path().join(LEGACY_CONTROL), "").unwrap();

        let accepted = check_control_grammar(dir.path()).unwrap();
        assert_eq!(accepted.len(), 1 + MALFORMED_COMMANDS.len());
        assert_eq!(accepted[0], BAD_SOURCE);
    }

    #[test]
    fn unreadable_generic_data_is_an_io_error() {
        let dir = tempdir().unwrap();
        let crc_dir = dir.path().join("crtc-0/crc");
        fs::create_dir_all(&crc_dir).unwrap();
        fs::write(crc_dir.join("control"), "").unwrap();

        assert!(matches!(check_control_grammar(dir.path()), Err(DrmError::Io(_))));
    }
}
