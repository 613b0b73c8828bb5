// SPDX-License-Identifier: GPL-3.0-or-later

//! The render target of one output group and its post/flip cadence.
//!
//! Composited frames defer waiting for their flip until just before the next frame is posted,
//! giving the renderer a whole refresh interval to draw the next one. Bypass frames and
//! mirrored groups wait right away.

use std::{fmt, sync::Arc, time::Duration};

use smithay::{
    reexports::drm::control::framebuffer,
    utils::{Logical, Rectangle, Transform},
};
use tracing::{debug, error, trace};

use crate::{
    error::KmsError,
    framebuffer::{BufferId, Framebuffer, ScanoutBuffer},
    output::KmsOutput,
    report::DisplayReport,
    surface::{RenderSurface, Renderable, covers_exactly},
};

/// Predicted worst-case render time of a composited frame.
const COMPOSITE_RENDER_TIME: Duration = Duration::from_millis(50);
/// A bypassed frame only needs time to schedule the flip.
const BYPASS_RENDER_TIME: Duration = Duration::from_millis(5);

/// Whether client buffers may be scanned out directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BypassOption {
    #[default]
    Allowed,
    Prohibited,
}

/// A buffer on its way to or on the screen, with the framebuffer it was registered as.
#[derive(Clone)]
struct ScanoutFrame {
    buffer: Arc<dyn ScanoutBuffer>,
    fb: Arc<Framebuffer>,
}

impl fmt::Debug for ScanoutFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanoutFrame")
            .field("buffer", &self.buffer.id())
            .field("fb", &self.fb.id())
            .finish()
    }
}

pub struct DisplayBuffer {
    outputs: Vec<Arc<KmsOutput>>,
    surface: Box<dyn RenderSurface>,
    report: Arc<dyn DisplayReport>,
    bypass_option: BypassOption,
    area: Rectangle<i32, Logical>,
    transform: Transform,

    needs_set_crtc: bool,
    /// Indices into `outputs` with a flip in flight.
    pending_flips: Vec<usize>,

    /// The client buffer chosen by the last [`DisplayBuffer::overlay`].
    bypass: Option<ScanoutFrame>,
    scheduled_bypass_frame: Option<ScanoutFrame>,
    visible_bypass_frame: Option<ScanoutFrame>,
    scheduled_composite_frame: Option<ScanoutFrame>,
    visible_composite_frame: Option<ScanoutFrame>,

    recommended_sleep: Duration,
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("outputs", &self.outputs)
            .field("area", &self.area)
            .field("transform", &self.transform)
            .field("needs_set_crtc", &self.needs_set_crtc)
            .field("pending_flips", &self.pending_flips)
            .finish()
    }
}

impl DisplayBuffer {
    /// Sets up `surface` as the render target of `outputs` and performs an initial modeset with
    /// a cleared frame.
    pub fn new(
        outputs: Vec<Arc<KmsOutput>>,
        mut surface: Box<dyn RenderSurface>,
        report: Arc<dyn DisplayReport>,
        bypass_option: BypassOption,
        area: Rectangle<i32, Logical>,
        transform: Transform,
    ) -> Result<Self, KmsError> {
        let Some(first) = outputs.first().cloned() else {
            return Err(KmsError::InvalidConfiguration(
                "a display buffer needs at least one output".to_string(),
            ));
        };

        report.report_successful_setup_of_native_resources();

        surface.make_current()?;
        report.report_successful_make_current_on_construction();

        surface.clear([0.0, 0.0, 0.0, 1.0])?;
        surface.swap_buffers()?;
        report.report_successful_buffer_swap_on_construction();

        let front = surface.lock_front()?;
        if outputs
            .iter()
            .any(|output| output.buffer_requires_migration(front.as_ref()))
        {
            return Err(KmsError::MixedDevices);
        }

        let fb = first.fb_for(front.as_ref())?;

        let mut display_buffer = Self {
            outputs,
            surface,
            report: report.clone(),
            bypass_option,
            area,
            transform,
            needs_set_crtc: false,
            pending_flips: Vec::new(),
            bypass: None,
            scheduled_bypass_frame: None,
            visible_bypass_frame: None,
            scheduled_composite_frame: None,
            visible_composite_frame: Some(ScanoutFrame { buffer: front, fb }),
            recommended_sleep: Duration::ZERO,
        };

        if let Some(frame) = display_buffer.visible_composite_frame.clone() {
            display_buffer.set_crtc(frame.fb.id());
        }

        display_buffer.surface.release_current()?;

        report.report_successful_drm_mode_set_crtc_on_construction();
        report.report_successful_display_construction();

        Ok(display_buffer)
    }

    pub fn view_area(&self) -> Rectangle<i32, Logical> {
        self.area
    }

    pub fn transformation(&self) -> Transform {
        self.transform
    }

    pub fn set_transformation(&mut self, transform: Transform, area: Rectangle<i32, Logical>) {
        self.transform = transform;
        self.area = area;
    }

    pub fn outputs(&self) -> &[Arc<KmsOutput>] {
        &self.outputs
    }

    /// Tries to scan out the topmost renderable directly, skipping composition.
    ///
    /// Returns true if a client buffer will be shown by the next [`DisplayBuffer::post`]; the
    /// caller then doesn't need to render or swap.
    pub fn overlay(&mut self, renderables: &[&dyn Renderable]) -> bool {
        self.bypass = None;

        if self.transform != Transform::Normal || self.bypass_option != BypassOption::Allowed {
            return false;
        }

        let Some(candidate) = bypass_candidate(renderables, self.area) else {
            return false;
        };

        let buffer = candidate.buffer();
        let (w, h) = buffer.size();
        let first = &self.outputs[0];

        let fits_outputs = self
            .outputs
            .iter()
            .all(|output| output.size() == (w as i32, h as i32).into());

        if !buffer.can_scanout() || !fits_outputs || first.buffer_requires_migration(buffer.as_ref())
        {
            return false;
        }

        match first.fb_for(buffer.as_ref()) {
            Ok(fb) => {
                trace!(buffer = buffer.id().0, "Bypassing composition");
                self.bypass = Some(ScanoutFrame { buffer, fb });
                true
            }
            Err(err) => {
                debug!("Can't scan out client buffer directly: {err}");
                false
            }
        }
    }

    pub fn make_current(&mut self) -> Result<(), KmsError> {
        Ok(self.surface.make_current()?)
    }

    pub fn release_current(&mut self) -> Result<(), KmsError> {
        Ok(self.surface.release_current()?)
    }

    pub fn bind(&mut self) -> Result<(), KmsError> {
        Ok(self.surface.bind()?)
    }

    pub fn clear(&mut self, color: [f32; 4]) -> Result<(), KmsError> {
        Ok(self.surface.clear(color)?)
    }

    /// Finishes a composited frame. Drops any bypass chosen by [`DisplayBuffer::overlay`].
    pub fn swap_buffers(&mut self) -> Result<(), KmsError> {
        self.surface.swap_buffers()?;
        self.bypass = None;
        Ok(())
    }

    /// Puts the latest frame on screen.
    ///
    /// Flips if possible and falls back to a full modeset if a flip was refused or
    /// [`DisplayBuffer::schedule_set_crtc`] was called.
    pub fn post(&mut self) -> Result<(), KmsError> {
        // The previous frame may still be in flight
        self.wait_for_page_flip()?;

        let bypass = self.bypass.take();
        let fb = match &bypass {
            Some(frame) => frame.fb.id(),
            None => {
                let front = self.surface.lock_front()?;
                let fb = self.outputs[0].fb_for(front.as_ref())?;
                let id = fb.id();
                self.scheduled_composite_frame = Some(ScanoutFrame { buffer: front, fb });
                id
            }
        };

        let mut missed_flip = false;
        if !self.needs_set_crtc {
            if !self.schedule_page_flip(fb)? {
                self.needs_set_crtc = true;
            } else {
                missed_flip = self.pending_flips.len() < self.outputs.len();
            }
        }

        if self.needs_set_crtc {
            self.set_crtc(fb);
            self.needs_set_crtc = false;
        }

        let predicted_render_time = match bypass {
            Some(frame) => {
                // Holding on to a client buffer for another frame would starve the client
                self.scheduled_bypass_frame = Some(frame);
                self.wait_for_page_flip()?;
                BYPASS_RENDER_TIME
            }
            None => {
                // Mirrored outputs may run at different rates, so don't let frames pile up
                if self.outputs.len() > 1 {
                    self.wait_for_page_flip()?;
                }
                COMPOSITE_RENDER_TIME
            }
        };

        // Mirrored flips have landed by now, so the outputs left out can be modeset next frame
        if missed_flip {
            self.needs_set_crtc = true;
        }

        self.recommended_sleep = match self.outputs.as_slice() {
            [output] => output
                .refresh_interval()
                .saturating_sub(predicted_render_time),
            _ => Duration::ZERO,
        };

        Ok(())
    }

    /// How long the renderer can sleep before starting the next frame.
    pub fn recommended_sleep(&self) -> Duration {
        self.recommended_sleep
    }

    /// Waits for outstanding flips on every output and retires the previously visible frame.
    pub fn wait_for_page_flip(&mut self) -> Result<(), KmsError> {
        for idx in std::mem::take(&mut self.pending_flips) {
            self.outputs[idx].wait_for_page_flip()?;
        }

        if self.scheduled_bypass_frame.is_some() || self.scheduled_composite_frame.is_some() {
            self.visible_bypass_frame = self.scheduled_bypass_frame.take();
            self.visible_composite_frame = self.scheduled_composite_frame.take();
        }

        Ok(())
    }

    /// Makes the next [`DisplayBuffer::post`] do a full modeset instead of a flip.
    pub fn schedule_set_crtc(&mut self) {
        self.needs_set_crtc = true;
    }

    /// The buffer currently on screen.
    pub fn visible_buffer(&self) -> Option<BufferId> {
        self.visible_bypass_frame
            .as_ref()
            .or(self.visible_composite_frame.as_ref())
            .map(|frame| frame.buffer.id())
    }

    /// The buffer waiting for its flip to complete.
    pub fn scheduled_buffer(&self) -> Option<BufferId> {
        self.scheduled_bypass_frame
            .as_ref()
            .or(self.scheduled_composite_frame.as_ref())
            .map(|frame| frame.buffer.id())
    }

    fn schedule_page_flip(&mut self, fb: framebuffer::Handle) -> Result<bool, KmsError> {
        // Schedule everything before waiting on anything so mirrored outputs flip in parallel
        for (idx, output) in self.outputs.iter().enumerate() {
            if output.schedule_page_flip(fb)? {
                self.pending_flips.push(idx);
            }
        }

        Ok(!self.pending_flips.is_empty())
    }

    fn set_crtc(&self, fb: framebuffer::Handle) {
        for output in self.outputs.iter() {
            // Outputs can vanish underneath us, e.g. when a virtual machine window is resized
            if !output.set_crtc(fb) {
                let name = output.name();
                error!(
                    output = %name,
                    "Failed to set crtc. Screen contents may be incomplete. \
                     Try plugging the monitor in again."
                );
                self.report.report_crtc_failure(&name, output.current_crtc());
            }
        }
    }
}

/// The topmost renderable, if it covers `area` exactly and nothing above it shows in `area`.
fn bypass_candidate<'a>(
    renderables: &[&'a dyn Renderable],
    area: Rectangle<i32, Logical>,
) -> Option<&'a dyn Renderable> {
    for renderable in renderables.iter().rev() {
        if covers_exactly(*renderable, area) {
            return Some(*renderable);
        }
        if renderable.screen_position().overlaps(area) {
            return None;
        }
    }
    None
}
