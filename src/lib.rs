//! Kernel modesetting output management.
//!
//! This crate owns the scanout half of a display server: it finds connectors and crtcs, sets
//! modes, page flips rendered frames onto outputs, scans client buffers out directly when they
//! cover an output exactly, and drives the hardware cursor. Rendering is left to a
//! [`surface::SurfaceFactory`] supplied by the caller.

pub mod cli;
pub mod config;
pub mod configuration;
pub mod cursor;
pub mod device;
pub mod display;
pub mod display_buffer;
pub mod dumb;
pub mod error;
pub mod framebuffer;
pub mod grouping;
pub mod output;
pub mod output_container;
pub mod page_flipper;
pub mod report;
pub mod surface;
