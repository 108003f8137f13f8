// Error types for the DRM Testbed
//
// Resolution failures are reported as `NotFound` so callers can decide to
// skip; requirement failures are hard aborts.

use std::io;

use crate::gpu::ChipsetMask;

/// Errors surfaced by device resolution, quiescence and the CRC client
#[derive(Debug, thiserror::Error)]
pub enum DrmError {
    #[error("No known gpu found for chipset mask {mask}")]
    NotFound { mask: ChipsetMask },

    #[error("Requirement failed: {0}")]
    Requirement(String),

    #[error("Command submission failed on engine selector {selector:#x}: {source}")]
    Submission {
        selector: u64,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DrmError {
    /// True when the error means "no matching hardware", which test callers
    /// usually turn into a skip rather than a failure
    pub fn is_skip(&self) -> bool {
        matches!(self, DrmError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, DrmError>;
