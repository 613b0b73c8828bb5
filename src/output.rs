// SPDX-License-Identifier: GPL-3.0-or-later

pub mod gamma;

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use smithay::{
    reexports::drm::control::{Mode, connector, crtc, framebuffer, property},
    utils::{Logical, Size},
};
use tracing::{debug, error, info, warn};

use crate::{
    configuration::{ModeInfo, OutputConfiguration, PowerMode},
    device::{
        ConnectorInfo, CrtcInfo, CursorPlane, DeviceId, KmsDevice, OutputId,
        edid::EdidInfo,
        mode::{self, refresh_interval, vrefresh_hz},
    },
    error::{KmsError, is_permission_error},
    framebuffer::{Framebuffer, FramebufferRegistry, ScanoutBuffer},
    page_flipper::{Frame, PageFlipper},
};

use self::gamma::GammaCurves;

struct OutputState {
    connector: ConnectorInfo,
    dpms_property: Option<property::Handle>,
    mode_index: usize,
    /// Where this output's scanout starts within the framebuffer.
    offset: (u32, u32),
    current_crtc: Option<CrtcInfo>,
    /// The crtc configuration found at startup, restored on drop.
    saved_crtc: Option<CrtcInfo>,
    /// Whether the hardware still shows `saved_crtc`.
    using_saved_crtc: bool,
}

/// One connector and the crtc driving it.
///
/// Locks are always taken power first, then state.
pub struct KmsOutput {
    device: Arc<dyn KmsDevice>,
    handle: connector::Handle,
    flipper: Arc<dyn PageFlipper>,
    framebuffers: Arc<FramebufferRegistry>,
    power: Mutex<PowerMode>,
    state: Mutex<OutputState>,
    has_cursor: AtomicBool,
    last_frame: Mutex<Frame>,
}

impl fmt::Debug for KmsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsOutput")
            .field("id", &self.output_id())
            .field("name", &self.name())
            .field("crtc", &self.current_crtc())
            .finish()
    }
}

impl KmsOutput {
    pub fn new(
        device: Arc<dyn KmsDevice>,
        handle: connector::Handle,
        flipper: Arc<dyn PageFlipper>,
        framebuffers: Arc<FramebufferRegistry>,
    ) -> Result<Self, KmsError> {
        let connector = device
            .connector(handle)
            .map_err(|err| KmsError::from_io("get connector", err))?;

        let saved_crtc = bound_crtc(device.as_ref(), &connector);
        let dpms_property = find_dpms_property(device.as_ref(), handle);

        debug!(
            output = %connector.name,
            saved_crtc = ?saved_crtc.as_ref().map(|crtc| crtc.handle),
            "Created output"
        );

        Ok(Self {
            device,
            handle,
            flipper,
            framebuffers,
            power: Mutex::new(PowerMode::On),
            state: Mutex::new(OutputState {
                connector,
                dpms_property,
                mode_index: 0,
                offset: (0, 0),
                current_crtc: None,
                saved_crtc,
                using_saved_crtc: true,
            }),
            has_cursor: AtomicBool::new(false),
            last_frame: Mutex::new(Frame::default()),
        })
    }

    pub fn id(&self) -> connector::Handle {
        self.handle
    }

    pub fn output_id(&self) -> OutputId {
        OutputId {
            device: self.device.id(),
            connector: self.handle,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.device
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().connector.name.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connector.is_connected()
    }

    /// Re-reads the connector and drops the cached crtc.
    pub fn reset(&self) -> Result<(), KmsError> {
        let connector = self
            .device
            .connector(self.handle)
            .map_err(|err| KmsError::from_io("get connector", err))?;
        let dpms_property = find_dpms_property(self.device.as_ref(), self.handle);

        let mut state = self.state.lock().unwrap();
        state.connector = connector;
        state.dpms_property = dpms_property;
        state.current_crtc = None;

        Ok(())
    }

    fn current_mode(state: &OutputState) -> Option<Mode> {
        state.connector.modes.get(state.mode_index).copied()
    }

    /// The size of the configured mode.
    pub fn size(&self) -> Size<i32, Logical> {
        let state = self.state.lock().unwrap();
        Self::current_mode(&state)
            .map(|mode| {
                let (w, h) = mode.size();
                Size::from((w as i32, h as i32))
            })
            .unwrap_or_default()
    }

    pub fn max_refresh_rate(&self) -> f64 {
        let state = self.state.lock().unwrap();
        state
            .connector
            .modes
            .iter()
            .map(vrefresh_hz)
            .fold(0.0, f64::max)
    }

    /// The time between vblanks in the configured mode.
    pub fn refresh_interval(&self) -> Duration {
        let state = self.state.lock().unwrap();
        Self::current_mode(&state)
            .map(|mode| refresh_interval(&mode))
            .unwrap_or(Duration::ZERO)
    }

    /// Sets the framebuffer offset and mode used by the next modeset. Does no I/O.
    pub fn configure(&self, offset: (u32, u32), mode_index: usize) {
        let mut state = self.state.lock().unwrap();
        state.offset = offset;
        state.mode_index = mode_index;
    }

    pub fn current_crtc(&self) -> Option<crtc::Handle> {
        self.state
            .lock()
            .unwrap()
            .current_crtc
            .as_ref()
            .map(|crtc| crtc.handle)
    }

    /// Finds a crtc for this output, keeping it until the next [`KmsOutput::reset`].
    pub fn ensure_crtc(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.ensure_crtc_locked(&mut state)
    }

    fn ensure_crtc_locked(&self, state: &mut OutputState) -> bool {
        if state.current_crtc.is_some() {
            return true;
        }

        if !state.connector.is_connected() {
            return false;
        }

        let crtc = bound_crtc(self.device.as_ref(), &state.connector).or_else(|| {
            match find_free_crtc(self.device.as_ref(), &state.connector) {
                Ok(crtc) => crtc,
                Err(err) => {
                    warn!(output = %state.connector.name, "Failed to search for a crtc: {err}");
                    None
                }
            }
        });

        match crtc {
            Some(crtc) => {
                debug!(output = %state.connector.name, crtc = ?crtc.handle, "Acquired crtc");
                state.current_crtc = Some(crtc);
                true
            }
            None => false,
        }
    }

    /// Performs a full modeset showing `fb` in the configured mode.
    ///
    /// Returns false if there is no crtc or the kernel rejected the modeset, in which case the
    /// cached crtc is dropped and searched for again next time.
    pub fn set_crtc(&self, fb: framebuffer::Handle) -> bool {
        let mut state = self.state.lock().unwrap();

        if !self.ensure_crtc_locked(&mut state) {
            error!(output = %state.connector.name, "Output has no crtc to set a framebuffer on");
            return false;
        }

        let Some(mode) = Self::current_mode(&state) else {
            error!(
                output = %state.connector.name,
                mode_index = state.mode_index,
                "Output has no mode at the configured index"
            );
            return false;
        };

        let Some(crtc) = state.current_crtc.as_ref().map(|crtc| crtc.handle) else {
            return false;
        };

        if let Err(err) = self
            .device
            .set_crtc(crtc, Some(fb), state.offset, &[self.handle], Some(mode))
        {
            warn!(output = %state.connector.name, ?crtc, ?fb, "Failed to set crtc: {err}");
            state.current_crtc = None;
            return false;
        }

        state.using_saved_crtc = false;
        true
    }

    /// Stops scanout on this output's crtc.
    ///
    /// Permission failures are expected while the session is being switched and are only
    /// logged. Any other failure is returned.
    pub fn clear_crtc(&self) -> Result<(), KmsError> {
        let mut state = self.state.lock().unwrap();

        self.ensure_crtc_locked(&mut state);
        let Some(crtc) = state.current_crtc.take() else {
            return Ok(());
        };

        match self.device.set_crtc(crtc.handle, None, (0, 0), &[], None) {
            Ok(()) => {
                state.using_saved_crtc = false;
                Ok(())
            }
            Err(err) if is_permission_error(&err) => {
                info!(output = %state.connector.name, "Couldn't clear output: {err}");
                Ok(())
            }
            Err(err) => Err(KmsError::from_io("clear crtc", err)),
        }
    }

    /// Queues a flip to `fb`. Does nothing unless the output is powered on.
    ///
    /// Returns false if the output lost its crtc or the kernel refused the flip. A full modeset
    /// through [`KmsOutput::set_crtc`] searches for a crtc again.
    pub fn schedule_page_flip(&self, fb: framebuffer::Handle) -> Result<bool, KmsError> {
        let power = self.power.lock().unwrap();
        if *power != PowerMode::On {
            return Ok(true);
        }

        let crtc = {
            let state = self.state.lock().unwrap();
            match state.current_crtc.as_ref() {
                Some(crtc) => crtc.handle,
                None => {
                    error!(output = %state.connector.name, "Output has no crtc to flip on");
                    return Ok(false);
                }
            }
        };

        self.flipper.schedule_flip(crtc, fb, self.handle)
    }

    /// Blocks until the last scheduled flip completed. Does nothing unless the output is
    /// powered on.
    pub fn wait_for_page_flip(&self) -> Result<(), KmsError> {
        let power = self.power.lock().unwrap();
        if *power != PowerMode::On {
            return Ok(());
        }

        let crtc = self.crtc_for_flip()?;
        let frame = self.flipper.wait_for_flip(crtc)?;
        *self.last_frame.lock().unwrap() = frame;

        Ok(())
    }

    fn crtc_for_flip(&self) -> Result<crtc::Handle, KmsError> {
        let state = self.state.lock().unwrap();
        state
            .current_crtc
            .as_ref()
            .map(|crtc| crtc.handle)
            .ok_or_else(|| KmsError::NoCrtc {
                output: state.connector.name.clone(),
            })
    }

    /// The frame the last completed flip landed on.
    pub fn last_frame(&self) -> Frame {
        *self.last_frame.lock().unwrap()
    }

    /// Shows `cursor` on this output's crtc.
    ///
    /// Returns false if the driver refused, in which case [`KmsOutput::has_cursor`] is false
    /// afterwards. Without a crtc there is nothing to do.
    pub fn set_cursor(&self, cursor: CursorPlane) -> bool {
        let Some(crtc) = self.current_crtc() else {
            return true;
        };

        match self.device.set_cursor(crtc, Some(cursor)) {
            Ok(()) => {
                self.has_cursor.store(true, Ordering::Release);
                true
            }
            Err(err) => {
                let err = KmsError::from_io_optional("set cursor", err);
                warn!(?crtc, "Hardware cursor rejected: {err}");
                self.has_cursor.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn move_cursor(&self, position: (i32, i32)) -> bool {
        let Some(crtc) = self.current_crtc() else {
            return false;
        };

        match self.device.move_cursor(crtc, position) {
            Ok(()) => true,
            Err(err) => {
                debug!(?crtc, ?position, "Failed to move cursor: {err}");
                false
            }
        }
    }

    pub fn clear_cursor(&self) -> bool {
        self.has_cursor.store(false, Ordering::Release);
        let Some(crtc) = self.current_crtc() else {
            return true;
        };

        match self.device.set_cursor(crtc, None) {
            Ok(()) => true,
            Err(err) => {
                warn!(?crtc, "Failed to clear cursor: {err}");
                false
            }
        }
    }

    pub fn has_cursor(&self) -> bool {
        self.has_cursor.load(Ordering::Acquire)
    }

    pub fn set_power_mode(&self, mode: PowerMode) {
        let mut power = self.power.lock().unwrap();
        if *power == mode {
            return;
        }

        let state = self.state.lock().unwrap();
        if let Some(prop) = state.dpms_property {
            if let Err(err) = self
                .device
                .set_connector_property(self.handle, prop, mode.dpms_value())
            {
                warn!(output = %state.connector.name, ?mode, "Failed to set dpms: {err}");
            }
        }

        *power = mode;
    }

    pub fn power_mode(&self) -> PowerMode {
        *self.power.lock().unwrap()
    }

    /// Uploads gamma ramps, or a linear ramp if `curves` is empty.
    pub fn set_gamma(&self, curves: &GammaCurves) -> Result<(), KmsError> {
        let mut state = self.state.lock().unwrap();

        if !self.ensure_crtc_locked(&mut state) {
            return Err(KmsError::NoCrtc {
                output: state.connector.name.clone(),
            });
        }
        let Some(crtc) = state.current_crtc.as_ref() else {
            return Ok(());
        };

        let linear;
        let curves = if curves.is_empty() {
            if crtc.gamma_length == 0 {
                return Ok(());
            }
            linear = GammaCurves::linear(crtc.gamma_length as usize);
            &linear
        } else {
            curves
        };

        if curves.size().is_none() {
            return Err(KmsError::InvalidConfiguration(format!(
                "gamma channels for {} have different lengths",
                state.connector.name
            )));
        }

        self.device
            .set_gamma(crtc.handle, &curves.red, &curves.green, &curves.blue)
            .map_err(|err| KmsError::from_io_optional("set gamma", err))
    }

    /// Re-reads the connector and adopts whatever crtc the kernel currently binds to it.
    pub fn refresh_hardware_state(&self) -> Result<(), KmsError> {
        let connector = self
            .device
            .connector(self.handle)
            .map_err(|err| KmsError::from_io("get connector", err))?;

        let mut state = self.state.lock().unwrap();
        state.current_crtc = bound_crtc(self.device.as_ref(), &connector);
        state.connector = connector;

        Ok(())
    }

    /// Fills `conf` with what the hardware reports for this output.
    pub fn update_from_hardware_state(&self, conf: &mut OutputConfiguration) {
        let power_mode = self.power_mode();
        let state = self.state.lock().unwrap();
        let connector = &state.connector;

        let modes = &connector.modes;
        let preferred_mode_index = modes
            .iter()
            .position(mode::is_preferred)
            .or_else(|| (!modes.is_empty()).then_some(0));

        let crtc_mode = state
            .current_crtc
            .as_ref()
            .and_then(|crtc| crtc.mode)
            .filter(|mode| mode.clock() != 0);
        let current_mode_index = crtc_mode
            .and_then(|current| modes.iter().position(|m| mode::timings_equal(m, &current)))
            // Some hosts don't report the current mode but name one "preferred"
            .or_else(|| {
                modes
                    .iter()
                    .position(|m| m.name().to_str().is_ok_and(|name| name == "preferred"))
            })
            .or(preferred_mode_index);

        let gamma_length = state
            .current_crtc
            .as_ref()
            .map(|crtc| crtc.gamma_length)
            .unwrap_or(0);

        conf.id = self.output_id();
        conf.name = connector.name.clone();
        conf.connected = connector.is_connected();
        conf.modes = modes
            .iter()
            .map(|m| {
                let (w, h) = m.size();
                ModeInfo {
                    size: (w as i32, h as i32).into(),
                    refresh_hz: vrefresh_hz(m),
                }
            })
            .collect();
        conf.preferred_mode_index = preferred_mode_index;
        conf.current_mode_index = current_mode_index;
        conf.physical_size_mm = connector.physical_size_mm;
        conf.power_mode = power_mode;
        conf.gamma_supported = gamma_length > 0;
        conf.gamma = GammaCurves::linear(gamma_length as usize);

        conf.edid = match self.device.edid(self.handle) {
            Ok(Some(blob)) => EdidInfo::parse(&blob)
                .inspect_err(|err| debug!(output = %connector.name, "Invalid EDID: {err}"))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                debug!(output = %connector.name, "Failed to read EDID: {err}");
                None
            }
        };
    }

    pub fn fb_for(&self, buffer: &dyn ScanoutBuffer) -> Result<Arc<Framebuffer>, KmsError> {
        self.framebuffers.lookup_or_create(buffer)
    }

    /// Whether `buffer` lives on a different device and must be copied before scanout.
    pub fn buffer_requires_migration(&self, buffer: &dyn ScanoutBuffer) -> bool {
        buffer.device_id() != self.device.id()
    }

    fn restore_saved_crtc(&self) {
        let mut state = self.state.lock().unwrap();
        if state.using_saved_crtc {
            return;
        }
        let Some(saved) = state.saved_crtc.clone() else {
            return;
        };

        let result = match (saved.framebuffer, saved.mode) {
            (Some(fb), Some(mode)) => self.device.set_crtc(
                saved.handle,
                Some(fb),
                saved.position,
                &[self.handle],
                Some(mode),
            ),
            _ => self.device.set_crtc(saved.handle, None, (0, 0), &[], None),
        };

        if let Err(err) = result {
            warn!(output = %state.connector.name, "Failed to restore saved crtc: {err}");
        }

        state.using_saved_crtc = true;
    }
}

impl Drop for KmsOutput {
    fn drop(&mut self) {
        self.restore_saved_crtc();
    }
}

/// The crtc driving `connector` through its current encoder, if any.
fn bound_crtc(device: &dyn KmsDevice, connector: &ConnectorInfo) -> Option<CrtcInfo> {
    let encoder = device.encoder(connector.current_encoder?).ok()?;
    device.crtc(encoder.crtc?).ok()
}

/// Searches for a crtc no other connected connector uses, reachable through an encoder no
/// other connected connector uses.
fn find_free_crtc(
    device: &dyn KmsDevice,
    connector: &ConnectorInfo,
) -> std::io::Result<Option<CrtcInfo>> {
    let resources = device.resources()?;

    let mut used_crtcs = Vec::new();
    let mut used_encoders = Vec::new();
    for handle in resources.connectors {
        if handle == connector.handle {
            continue;
        }
        let other = device.connector(handle)?;
        if !other.is_connected() {
            continue;
        }
        let Some(encoder) = other.current_encoder else {
            continue;
        };
        used_encoders.push(encoder);
        if let Some(crtc) = device.encoder(encoder)?.crtc {
            used_crtcs.push(crtc);
        }
    }

    for crtc in resources.crtcs {
        if used_crtcs.contains(&crtc) {
            continue;
        }

        for encoder in connector.encoders.iter() {
            if used_encoders.contains(encoder) {
                continue;
            }
            if device.encoder(*encoder)?.possible_crtcs.contains(&crtc) {
                return device.crtc(crtc).map(Some);
            }
        }
    }

    Ok(None)
}

fn find_dpms_property(device: &dyn KmsDevice, connector: connector::Handle) -> Option<property::Handle> {
    device
        .find_property(connector, "DPMS")
        .inspect_err(|err| debug!(?connector, "Failed to look up DPMS property: {err}"))
        .ok()
        .flatten()
}
