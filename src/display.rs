// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use smithay::utils::Point;
use tracing::{debug, info, warn};

use crate::{
    configuration::{
        DisplayConfiguration, DisplayConfigurationPolicy, OutputConfiguration, PowerMode,
    },
    cursor::{CurrentConfiguration, Cursor},
    device::{self, KmsDevice, OutputId},
    display_buffer::{BypassOption, DisplayBuffer},
    error::KmsError,
    grouping,
    output_container::OutputContainer,
    page_flipper::Frame,
    report::DisplayReport,
    surface::SurfaceFactory,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayOptions {
    pub bypass: BypassOption,
}

struct DisplayState {
    container: OutputContainer,
    current: DisplayConfiguration,
    display_buffers: Vec<Arc<Mutex<DisplayBuffer>>>,
    /// Set by hotplug; the next read of the configuration re-enumerates connectors.
    dirty: bool,
    /// Whether `current` has been applied to the hardware at least once.
    applied: bool,
}

/// The configuration mutex and everything it guards.
struct SharedState(Mutex<DisplayState>);

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        self.0.lock().unwrap()
    }
}

/// The cursor's view of the display. It doesn't keep the outputs alive, so their saved crtcs
/// are restored when the display goes away even if a cursor is still around.
struct ConfigurationView(Weak<SharedState>);

impl CurrentConfiguration for ConfigurationView {
    fn with_current_configuration(
        &self,
        f: &mut dyn FnMut(&DisplayConfiguration, &OutputContainer),
    ) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        let state = shared.lock();
        f(&state.current, &state.container);
    }
}

/// All outputs of all devices and the display buffers driving them.
pub struct Display {
    devices: Vec<Arc<dyn KmsDevice>>,
    state: Arc<SharedState>,
    factory: Arc<dyn SurfaceFactory>,
    report: Arc<dyn DisplayReport>,
    options: DisplayOptions,
    /// Held weakly so the cursor goes away once nobody uses it.
    cursor: Mutex<Weak<Cursor>>,
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("devices", &self.devices)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Display {
    /// Reads the outputs of `devices`, lets `policy` pick a layout and applies it.
    pub fn new(
        devices: Vec<Arc<dyn KmsDevice>>,
        factory: Arc<dyn SurfaceFactory>,
        report: Arc<dyn DisplayReport>,
        options: DisplayOptions,
        policy: &dyn DisplayConfigurationPolicy,
    ) -> Result<Self, KmsError> {
        for device in devices.iter() {
            device::log_details(device.as_ref());
        }

        let mut container = OutputContainer::new(devices.clone(), report.clone());
        container.update_from_hardware_state()?;

        let mut initial = read_hardware_configuration(&container, None);
        policy.apply_to(&mut initial);

        let display = Self {
            devices,
            state: Arc::new(SharedState(Mutex::new(DisplayState {
                container,
                current: initial.clone(),
                display_buffers: Vec::new(),
                dirty: false,
                applied: false,
            }))),
            factory,
            report,
            options,
            cursor: Mutex::new(Weak::new()),
        };

        display.configure(&initial)?;

        Ok(display)
    }

    /// The configuration currently applied, refreshed from the hardware after a hotplug.
    pub fn configuration(&self) -> Result<DisplayConfiguration, KmsError> {
        let mut state = self.state.lock();

        if state.dirty {
            state.container.update_from_hardware_state()?;
            state.current = read_hardware_configuration(&state.container, Some(&state.current));
            state.dirty = false;
        }

        Ok(state.current.clone())
    }

    pub fn configure(&self, conf: &DisplayConfiguration) -> Result<(), KmsError> {
        conf.validate()?;

        {
            let mut state = self.state.lock();
            self.configure_locked(&mut state, conf)?;
        }

        if let Some(cursor) = self.cursor.lock().unwrap().upgrade() {
            cursor.resume();
        }

        Ok(())
    }

    /// Applies `conf` only if that can be done by updating existing display buffers in place.
    pub fn apply_if_configuration_preserves_display_buffers(
        &self,
        conf: &DisplayConfiguration,
    ) -> Result<bool, KmsError> {
        let applied = {
            let mut state = self.state.lock();
            if state.applied && state.current.compatible(conf) {
                self.configure_locked(&mut state, conf)?;
                true
            } else {
                false
            }
        };

        if let Some(cursor) = self.cursor.lock().unwrap().upgrade() {
            cursor.resume();
        }

        Ok(applied)
    }

    fn configure_locked(
        &self,
        state: &mut DisplayState,
        conf: &DisplayConfiguration,
    ) -> Result<(), KmsError> {
        let compatible = state.applied && state.current.compatible(conf);
        debug!(compatible, "Applying display configuration");

        if !compatible {
            // The new display buffers take over the outputs, so let the old ones finish flipping
            for db in state.display_buffers.iter() {
                db.lock().unwrap().wait_for_page_flip()?;
            }

            for output_conf in conf.outputs.iter() {
                if let Some(output) = state.container.get(output_conf.id) {
                    output.clear_cursor();
                    output.reset()?;
                }
            }
        }

        let shared = state.container.devices().len() > 1;
        let mut display_buffers = Vec::new();

        for group in grouping::scanout_groups(conf) {
            let mut outputs = Vec::new();

            for id in group.outputs.iter() {
                let (Some(output), Some(output_conf)) =
                    (state.container.get(*id), conf.output(*id))
                else {
                    continue;
                };

                let offset = output_conf.top_left - group.bounding.loc;
                output.configure(
                    (offset.x.max(0) as u32, offset.y.max(0) as u32),
                    output_conf.current_mode_index.unwrap_or(0),
                );

                if !compatible {
                    output.set_power_mode(output_conf.power_mode);
                    if let Err(err) = output.set_gamma(&output_conf.gamma) {
                        warn!(output = %output_conf.name, "Failed to set gamma: {err}");
                    }
                }

                outputs.push(output);
            }

            if compatible {
                let existing = state.display_buffers.iter().find(|db| {
                    let db = db.lock().unwrap();
                    db.outputs().len() == group.outputs.len()
                        && db
                            .outputs()
                            .iter()
                            .all(|output| group.outputs.contains(&output.output_id()))
                });
                if let Some(db) = existing {
                    db.lock()
                        .unwrap()
                        .set_transformation(group.transform, group.bounding);
                }
                continue;
            }

            let Some(first) = outputs.first() else {
                continue;
            };

            let size = group.transform.transform_size(group.bounding.size);
            let surface = self.factory.create_surface(first.device(), size, shared)?;

            let db = DisplayBuffer::new(
                outputs,
                surface,
                self.report.clone(),
                self.options.bypass,
                group.bounding,
                group.transform,
            )?;
            display_buffers.push(Arc::new(Mutex::new(db)));
        }

        if !compatible {
            info!(count = display_buffers.len(), "Created display buffers");
            state.display_buffers = display_buffers;
        }

        state.current = conf.clone();
        state.applied = true;

        if !compatible {
            clear_connected_unused_outputs(state)?;
        }

        Ok(())
    }

    /// Gives up the devices for a session switch.
    pub fn pause(&self) -> Result<(), KmsError> {
        if let Some(cursor) = self.cursor.lock().unwrap().upgrade() {
            cursor.suspend();
        }

        // Every device is released even if an earlier one failed; the first failure is returned
        let mut result = Ok(());
        for device in self.devices.iter() {
            if let Err(err) = device.release_master() {
                self.report.report_drm_master_failure(device.id(), &err);
                if result.is_ok() {
                    result = Err(KmsError::from_io("drop drm master", err));
                }
            }
        }

        result
    }

    /// Takes the devices back after a session switch.
    ///
    /// Every display buffer does a full modeset on its next post since the crtcs may have been
    /// changed while we were away.
    pub fn resume(&self) -> Result<(), KmsError> {
        for device in self.devices.iter() {
            if let Err(err) = device.acquire_master() {
                self.report.report_drm_master_failure(device.id(), &err);
                return Err(KmsError::from_io("set drm master", err));
            }
        }

        {
            let mut state = self.state.lock();
            for db in state.display_buffers.iter() {
                db.lock().unwrap().schedule_set_crtc();
            }
            clear_connected_unused_outputs(&mut state)?;
        }

        if let Some(cursor) = self.cursor.lock().unwrap().upgrade() {
            cursor.resume();
        }

        Ok(())
    }

    /// The hardware cursor, or `None` if the hardware can't show one and a software cursor
    /// must be used.
    pub fn create_hardware_cursor(&self) -> Option<Arc<Cursor>> {
        let mut weak = self.cursor.lock().unwrap();
        if let Some(cursor) = weak.upgrade() {
            return Some(cursor);
        }

        let configuration: Arc<dyn CurrentConfiguration> =
            Arc::new(ConfigurationView(Arc::downgrade(&self.state)));
        match Cursor::new(configuration) {
            Ok(cursor) => {
                let cursor = Arc::new(cursor);
                *weak = Arc::downgrade(&cursor);
                Some(cursor)
            }
            Err(err) => {
                info!("No hardware cursor, falling back to software: {err}");
                None
            }
        }
    }

    pub fn last_frame_on(&self, id: OutputId) -> Option<Frame> {
        self.state
            .lock()
            .container
            .get(id)
            .map(|output| output.last_frame())
    }

    pub fn for_each_display_buffer(&self, mut f: impl FnMut(&mut DisplayBuffer)) {
        let state = self.state.lock();
        for db in state.display_buffers.iter() {
            f(&mut db.lock().unwrap());
        }
    }

    /// Handles to the display buffers, to be driven from render threads.
    pub fn display_buffers(&self) -> Vec<Arc<Mutex<DisplayBuffer>>> {
        self.state.lock().display_buffers.clone()
    }

    /// Marks the configuration stale after a connector change.
    pub fn handle_hotplug(&self) {
        self.state.lock().dirty = true;
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.state
            .lock()
            .container
            .outputs()
            .map(|output| output.output_id())
            .collect()
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        // Outputs restore their saved crtcs on drop, which must not race a pending flip
        self.for_each_display_buffer(|db| {
            if let Err(err) = db.wait_for_page_flip() {
                warn!("Failed to wait for page flip on shutdown: {err}");
            }
        });
    }
}

/// Turns off connected outputs that are unused or powered down.
fn clear_connected_unused_outputs(state: &mut DisplayState) -> Result<(), KmsError> {
    for conf in state.current.outputs.iter() {
        if !conf.connected || (conf.used && conf.power_mode == PowerMode::On) {
            continue;
        }

        let Some(output) = state.container.get(conf.id) else {
            continue;
        };

        output.clear_crtc()?;
        output.set_power_mode(conf.power_mode);
        if let Err(err) = output.set_gamma(&conf.gamma) {
            debug!(output = %conf.name, "Failed to set gamma on unused output: {err}");
        }
    }

    Ok(())
}

/// Builds a configuration from what the outputs report.
///
/// Layout choices from `previous` (whether an output is used, where and how it's placed) are
/// kept for outputs that are still connected.
fn read_hardware_configuration(
    container: &OutputContainer,
    previous: Option<&DisplayConfiguration>,
) -> DisplayConfiguration {
    let outputs = container
        .outputs()
        .map(|output| {
            let id = output.output_id();
            let prev = previous.and_then(|conf| conf.output(id));

            let mut conf = OutputConfiguration::unknown(id);
            output.update_from_hardware_state(&mut conf);

            match prev {
                Some(prev) if conf.connected => {
                    conf.used = prev.used;
                    conf.top_left = prev.top_left;
                    conf.transform = prev.transform;
                    conf.power_mode = prev.power_mode;
                    if prev.current_mode_index.is_some_and(|idx| idx < conf.modes.len()) {
                        conf.current_mode_index = prev.current_mode_index;
                    }
                }
                _ => {
                    conf.used = false;
                    conf.top_left = Point::default();
                }
            }

            conf
        })
        .collect();

    DisplayConfiguration { outputs }
}
