use std::{io::Write, time::Duration};

use drm_sys::{
    DRM_MODE_FLAG_NHSYNC, DRM_MODE_FLAG_NVSYNC, DRM_MODE_FLAG_PHSYNC, DRM_MODE_FLAG_PVSYNC,
    DRM_MODE_TYPE_DRIVER, DRM_MODE_TYPE_PREFERRED, drm_mode_modeinfo,
};
use smithay::reexports::drm::control::{Mode, ModeFlags, ModeTypeFlags};

/// Raw display timings, in the units the kernel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTimings {
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub hsync_positive: bool,
    pub vsync_positive: bool,
    pub preferred: bool,
}

impl ModeTimings {
    /// CEA-861 1920x1080@60.
    pub const FHD_60: ModeTimings = ModeTimings {
        clock: 148_500,
        hdisplay: 1920,
        hsync_start: 2008,
        hsync_end: 2052,
        htotal: 2200,
        vdisplay: 1080,
        vsync_start: 1084,
        vsync_end: 1089,
        vtotal: 1125,
        hsync_positive: true,
        vsync_positive: true,
        preferred: false,
    };

    /// VESA 800x600@60.
    pub const SVGA_60: ModeTimings = ModeTimings {
        clock: 40_000,
        hdisplay: 800,
        hsync_start: 840,
        hsync_end: 968,
        htotal: 1056,
        vdisplay: 600,
        vsync_start: 601,
        vsync_end: 605,
        vtotal: 628,
        hsync_positive: true,
        vsync_positive: true,
        preferred: false,
    };

    pub fn preferred(self) -> Self {
        Self {
            preferred: true,
            ..self
        }
    }
}

/// Builds a bit-exact kernel mode from timings.
pub fn mode_from_timings(timings: ModeTimings) -> Mode {
    mode_from_timings_named(timings, &format!("{}x{}", timings.hdisplay, timings.vdisplay))
}

pub fn mode_from_timings_named(timings: ModeTimings, name: &str) -> Mode {
    let ModeTimings {
        clock,
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        hsync_positive,
        vsync_positive,
        preferred,
    } = timings;

    let vrefresh = if htotal == 0 || vtotal == 0 {
        0
    } else {
        ((clock as u64 * 1000 + (htotal as u64 * vtotal as u64) / 2)
            / (htotal as u64 * vtotal as u64)) as u32
    };

    let mut flags = 0;
    match hsync_positive {
        true => flags |= DRM_MODE_FLAG_PHSYNC,
        false => flags |= DRM_MODE_FLAG_NHSYNC,
    };
    match vsync_positive {
        true => flags |= DRM_MODE_FLAG_PVSYNC,
        false => flags |= DRM_MODE_FLAG_NVSYNC,
    };

    let mut type_ = DRM_MODE_TYPE_DRIVER;
    if preferred {
        type_ |= DRM_MODE_TYPE_PREFERRED;
    }

    // Keep the last byte as the nul terminator
    let mut name_buf = [0u8; 32];
    let len = name.len().min(31);
    let _ = name_buf
        .as_mut_slice()
        .write_all(&name.as_bytes()[..len]);
    let name = bytemuck::cast(name_buf);

    drm_mode_modeinfo {
        clock,
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        hskew: 0,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        vscan: 0,
        vrefresh,
        flags,
        type_,
        name,
    }
    .into()
}

/// The time between two vblanks for this mode.
pub fn refresh_interval(mode: &Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if denominator == 0 {
        return Duration::ZERO;
    }

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    let refresh_interval_ns = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(refresh_interval_ns)
}

/// The vertical refresh rate in Hz, truncated to two decimal places.
pub fn vrefresh_hz(mode: &Mode) -> f64 {
    let htotal = mode.hsync().2 as i64;
    let vtotal = mode.vsync().2 as i64;

    if htotal == 0 || vtotal == 0 {
        return 0.0;
    }

    // clock is in kHz
    (mode.clock() as i64 * 100_000 / (htotal * vtotal)) as f64 / 100.0
}

/// Compares two modes by their timings, ignoring names and type flags.
pub fn timings_equal(a: &Mode, b: &Mode) -> bool {
    a.clock() == b.clock()
        && a.size() == b.size()
        && a.hsync() == b.hsync()
        && a.vsync() == b.vsync()
        && a.hskew() == b.hskew()
}

pub fn is_preferred(mode: &Mode) -> bool {
    mode.mode_type().contains(ModeTypeFlags::PREFERRED)
}
