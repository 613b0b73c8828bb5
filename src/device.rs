// SPDX-License-Identifier: GPL-3.0-or-later

//! The kernel modesetting seam.
//!
//! Everything above this module talks to the kernel through [`KmsDevice`]. Kernel objects are
//! read into owned snapshots ([`ConnectorInfo`], [`EncoderInfo`], [`CrtcInfo`]) so nothing
//! holds on to kernel-allocated structures past the call that produced them.

pub mod drm;
pub mod edid;
pub mod mode;

use std::{fmt, io, time::Duration};

use itertools::Itertools;
use smithay::reexports::drm::{
    buffer::{self, DrmFourcc},
    control::{Mode, connector, crtc, encoder, framebuffer, property},
};
use tracing::{info, warn};

/// Identifies one kms device for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Identifies an output across configurations: a connector on a specific device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId {
    pub device: DeviceId,
    pub connector: connector::Handle,
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, u32::from(self.connector))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

impl ConnectionState {
    pub fn describe(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Unknown => "UNKNOWN",
        }
    }
}

/// A snapshot of a connector.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub handle: connector::Handle,
    /// The connector name, e.g. `HDMI-A-1`.
    pub name: String,
    pub state: ConnectionState,
    pub modes: Vec<Mode>,
    pub encoders: Vec<encoder::Handle>,
    pub current_encoder: Option<encoder::Handle>,
    /// Physical size in millimeters, if known.
    pub physical_size_mm: Option<(u32, u32)>,
}

impl ConnectorInfo {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub handle: encoder::Handle,
    pub crtc: Option<crtc::Handle>,
    /// The crtcs this encoder can drive, already resolved from the kernel's bitmask.
    pub possible_crtcs: Vec<crtc::Handle>,
}

#[derive(Debug, Clone)]
pub struct CrtcInfo {
    pub handle: crtc::Handle,
    pub position: (u32, u32),
    pub mode: Option<Mode>,
    pub framebuffer: Option<framebuffer::Handle>,
    pub gamma_length: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub connectors: Vec<connector::Handle>,
    pub encoders: Vec<encoder::Handle>,
    pub crtcs: Vec<crtc::Handle>,
}

/// A completed page flip as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: crtc::Handle,
    /// The kernel's 32-bit vblank sequence.
    pub sequence: u32,
    /// Monotonic time the flip completed.
    pub timestamp: Duration,
}

/// A buffer bound to a crtc's cursor plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPlane {
    pub handle: buffer::Handle,
    pub size: (u32, u32),
}

/// Everything the kernel needs to register a single-plane scanout framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub size: (u32, u32),
    pub format: DrmFourcc,
    pub stride: u32,
    pub handle: buffer::Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: buffer::Handle,
    pub size: (u32, u32),
    pub pitch: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DriverInfo {
    pub name: String,
    pub description: String,
    pub date: String,
}

/// The kernel modesetting interface of one device.
///
/// Every call is synchronous. Failures are returned as raw [`io::Error`]s; classifying them is
/// up to the caller since the same errno means different things for different operations.
pub trait KmsDevice: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    fn driver_info(&self) -> io::Result<DriverInfo>;

    fn resources(&self) -> io::Result<Resources>;
    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo>;
    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo>;
    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcInfo>;

    /// Finds an enum or range property on a connector by name.
    fn find_property(
        &self,
        connector: connector::Handle,
        name: &str,
    ) -> io::Result<Option<property::Handle>>;
    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: u64,
    ) -> io::Result<()>;
    /// The raw EDID blob of a connector, if it has one.
    fn edid(&self, connector: connector::Handle) -> io::Result<Option<Vec<u8>>>;

    /// Binds `framebuffer` to `crtc` with the given mode, or disables the crtc if either is `None`.
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()>;

    /// Queues an asynchronous flip that will be reported through [`KmsDevice::receive_events`].
    fn page_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()>;
    /// Blocks until the event descriptor is readable.
    fn wait_for_events(&self) -> io::Result<()>;
    /// Reads every pending event. Only call after [`KmsDevice::wait_for_events`] returned.
    fn receive_events(&self) -> io::Result<Vec<FlipEvent>>;

    fn cursor_size(&self) -> (u32, u32);
    fn set_cursor(&self, crtc: crtc::Handle, cursor: Option<CursorPlane>) -> io::Result<()>;
    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()>;

    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], green: &[u16], blue: &[u16])
    -> io::Result<()>;

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<framebuffer::Handle>;
    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()>;

    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc)
    -> io::Result<DumbAllocation>;
    fn write_dumb_buffer(&self, handle: buffer::Handle, data: &[u8]) -> io::Result<()>;
    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()>;

    fn acquire_master(&self) -> io::Result<()>;
    fn release_master(&self) -> io::Result<()>;
}

/// Logs the driver and every connector with its modes.
pub fn log_details(device: &dyn KmsDevice) {
    match device.driver_info() {
        Ok(DriverInfo {
            name,
            description,
            date,
        }) => {
            info!(device = %device.id(), "Using driver {name} [{description}] (driver date: {date})");
        }
        Err(err) => warn!(device = %device.id(), "Failed to query driver version: {err}"),
    }

    let resources = match device.resources() {
        Ok(resources) => resources,
        Err(err) => {
            warn!(device = %device.id(), "Failed to enumerate resources: {err}");
            return;
        }
    };

    for handle in resources.connectors {
        let Ok(connector) = device.connector(handle) else {
            continue;
        };

        info!("\tOutput: {} ({})", connector.name, connector.state.describe());
        if !connector.modes.is_empty() {
            info!(
                "\t\tModes: {}",
                connector
                    .modes
                    .iter()
                    .map(|mode| {
                        let (w, h) = mode.size();
                        format!("{w}×{h}@{:.2}", mode::vrefresh_hz(mode))
                    })
                    .join(", ")
            );
        }
    }
}
