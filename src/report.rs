use std::io;

use smithay::reexports::drm::control::crtc;
use tracing::{debug, error, info, trace};

use crate::{
    device::{DeviceId, OutputId},
    page_flipper::Frame,
};

/// Receives notifications at the milestones of output setup and scanout.
///
/// Every method has an empty default so implementations only override what they care about.
pub trait DisplayReport: Send + Sync {
    fn report_vsync(&self, _output: OutputId, _frame: Frame) {}

    fn report_successful_setup_of_native_resources(&self) {}
    fn report_successful_make_current_on_construction(&self) {}
    fn report_successful_buffer_swap_on_construction(&self) {}
    fn report_successful_drm_mode_set_crtc_on_construction(&self) {}
    fn report_successful_display_construction(&self) {}

    fn report_drm_master_failure(&self, _device: DeviceId, _error: &io::Error) {}

    fn report_crtc_failure(&self, _output_name: &str, _crtc: Option<crtc::Handle>) {}
}

/// A report that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReport;

impl DisplayReport for TracingReport {
    fn report_vsync(&self, output: OutputId, frame: Frame) {
        trace!(%output, msc = frame.msc, timestamp = ?frame.timestamp, "vsync");
    }

    fn report_successful_setup_of_native_resources(&self) {
        debug!("Successfully set up native resources");
    }

    fn report_successful_make_current_on_construction(&self) {
        debug!("Successfully made render surface current on construction");
    }

    fn report_successful_buffer_swap_on_construction(&self) {
        debug!("Successfully swapped render surface buffers on construction");
    }

    fn report_successful_drm_mode_set_crtc_on_construction(&self) {
        debug!("Successfully performed initial modeset on construction");
    }

    fn report_successful_display_construction(&self) {
        info!("Display buffer constructed");
    }

    fn report_drm_master_failure(&self, device: DeviceId, err: &io::Error) {
        error!(%device, "Failed to change drm master state: {err}");
    }

    fn report_crtc_failure(&self, output_name: &str, crtc: Option<crtc::Handle>) {
        error!(output = output_name, ?crtc, "Failed to set crtc");
    }
}
