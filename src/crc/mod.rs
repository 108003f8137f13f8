// Pipe CRC interface for the DRM Testbed
//
// Client side of the kernel's display CRC capture: the control command
// grammar (`pipe <id> <source>`), CRC sample parsing, and a capture handle
// over debugfs.

pub mod capture;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{DrmError, Result};

/// Display pipes that can be captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    A,
    B,
    C,
}

impl Pipe {
    pub fn index(self) -> usize {
        match self {
            Pipe::A => 0,
            Pipe::B => 1,
            Pipe::C => 2,
        }
    }

    pub fn name(self) -> char {
        match self {
            Pipe::A => 'A',
            Pipe::B => 'B',
            Pipe::C => 'C',
        }
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Pipe {
    type Err = DrmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A" => Ok(Pipe::A),
            "B" => Ok(Pipe::B),
            "C" => Ok(Pipe::C),
            _ => Err(DrmError::InvalidArgument(format!("unknown pipe '{}'", s))),
        }
    }
}

/// Where in the display pipeline the CRC is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcSource {
    None,
    Plane1,
    Plane2,
    Pf,
    Pipe,
    Tv,
    DpB,
    DpC,
    DpD,
    Auto,
}

impl CrcSource {
    const ALL: [CrcSource; 10] = [
        CrcSource::None,
        CrcSource::Plane1,
        CrcSource::Plane2,
        CrcSource::Pf,
        CrcSource::Pipe,
        CrcSource::Tv,
        CrcSource::DpB,
        CrcSource::DpC,
        CrcSource::DpD,
        CrcSource::Auto,
    ];

    /// Name as spelled by the kernel
    pub fn name(self) -> &'static str {
        match self {
            CrcSource::None => "none",
            CrcSource::Plane1 => "plane1",
            CrcSource::Plane2 => "plane2",
            CrcSource::Pf => "pf",
            CrcSource::Pipe => "pipe",
            CrcSource::Tv => "TV",
            CrcSource::DpB => "DP-B",
            CrcSource::DpC => "DP-C",
            CrcSource::DpD => "DP-D",
            CrcSource::Auto => "auto",
        }
    }
}

impl fmt::Display for CrcSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CrcSource {
    type Err = DrmError;

    fn from_str(s: &str) -> Result<Self> {
        CrcSource::ALL
            .iter()
            .copied()
            .find(|source| source.name() == s)
            .ok_or_else(|| DrmError::InvalidArgument(format!("unknown crc source '{}'", s)))
    }
}

/// A parsed control file command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeCrcCommand {
    pub pipe: Pipe,
    pub source: CrcSource,
}

impl PipeCrcCommand {
    /// Parses `pipe <A|B|C> <source>`; anything else is an invalid argument
    pub fn parse(text: &str) -> Result<Self> {
        let caps = command_regex()?.captures(text).ok_or_else(|| {
            DrmError::InvalidArgument(format!(
                "expected 3 words, got {} in '{}'",
                text.split_whitespace().count(),
                text.trim()
            ))
        })?;

        if &caps[1] != "pipe" {
            return Err(DrmError::InvalidArgument(format!("unknown object '{}'", &caps[1])));
        }

        Ok(Self {
            pipe: caps[2].parse()?,
            source: caps[3].parse()?,
        })
    }
}

/// Three whitespace-separated words, compiled once
fn command_regex() -> Result<&'static Regex> {
    static COMMAND: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    COMMAND
        .get_or_init(|| Regex::new(r"^\s*(\S+)\s+(\S+)\s+(\S+)\s*$"))
        .as_ref()
        .map_err(|e| DrmError::InvalidArgument(format!("regex error: {}", e)))
}

impl fmt::Display for PipeCrcCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pipe {} {}", self.pipe, self.source)
    }
}

/// One CRC sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crc {
    pub frame: Option<u32>, // None when the driver has no frame counter
    pub words: Vec<u32>,
}

impl Crc {
    /// Parses a line of the CRC data file
    ///
    /// Generic format: `0x0000002a 0xdeadbeef ...` (frame may be `XXXXXXXXXX`);
    /// legacy i915 format: `      42 deadbeef ...`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let frame_field = fields
            .next()
            .ok_or_else(|| DrmError::InvalidArgument("empty crc line".to_string()))?;

        let frame = if frame_field.chars().all(|c| c == 'X') {
            None
        } else if let Some(hex) = frame_field.strip_prefix("0x") {
            Some(parse_hex(hex, line)?)
        } else {
            Some(
                frame_field
                    .parse()
                    .map_err(|_| DrmError::InvalidArgument(format!("bad crc frame in '{}'", line.trim())))?,
            )
        };

        let words = fields
            .map(|word| parse_hex(word.trim_start_matches("0x"), line))
            .collect::<Result<Vec<u32>>>()?;
        if words.is_empty() {
            return Err(DrmError::InvalidArgument(format!("no crc values in '{}'", line.trim())));
        }

        Ok(Self { frame, words })
    }
}

fn parse_hex(text: &str, line: &str) -> Result<u32> {
    u32::from_str_radix(text, 16)
        .map_err(|_| DrmError::InvalidArgument(format!("bad crc value in '{}'", line.trim())))
}

impl fmt::Display for Crc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.frame {
            Some(frame) => write!(f, "{:>8}", frame)?,
            None => write!(f, "{:>8}", "-")?,
        }
        for word in &self.words {
            write!(f, " {:08x}", word)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_commands_parse() {
        let cmd = PipeCrcCommand::parse("pipe A auto").unwrap();
        assert_eq!(cmd, PipeCrcCommand { pipe: Pipe::A, source: CrcSource::Auto });
        assert_eq!(cmd.to_string(), "pipe A auto");

        let cmd = PipeCrcCommand::parse("  pipe C DP-B\n").unwrap();
        assert_eq!(cmd.source, CrcSource::DpB);
    }

    #[test]
    fn word_count_is_enforced() {
        for text in ["pipe foo", "pipe A none option", "", "pipe"] {
            match PipeCrcCommand::parse(text) {
                Err(DrmError::InvalidArgument(msg)) => assert!(msg.starts_with("expected 3 words"), "{}", msg),
                other => panic!("'{}' gave {:?}", text, other),
            }
        }
        // Repeated parses share the compiled pattern
        assert!(std::ptr::eq(command_regex().unwrap(), command_regex().unwrap()));
    }

    #[test]
    fn crc_lines_parse_in_both_formats() {
        let generic = Crc::parse_line("0x0000002a 0xdeadbeef 0x00000001").unwrap();
        assert_eq!(generic.frame, Some(42));
        assert_eq!(generic.words, vec![0xdead_beef, 1]);

        let legacy = Crc::parse_line("      42 deadbeef        1        0        0        0").unwrap();
        assert_eq!(legacy.frame, Some(42));
        assert_eq!(legacy.words.len(), 5);

        let no_frame = Crc::parse_line("XXXXXXXXXX 0x12345678").unwrap();
        assert_eq!(no_frame.frame, None);
    }

    #[test]
    fn bad_crc_lines_are_rejected() {
        assert!(Crc::parse_line("").is_err());
        assert!(Crc::parse_line("0x10").is_err());
        assert!(Crc::parse_line("12 nothex").is_err());
    }
}
