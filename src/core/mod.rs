// Core module definitions for the DRM Testbed

pub mod config;
pub mod exit;
pub mod lifecycle;
