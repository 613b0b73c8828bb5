//! The display configuration applied by [`Display::configure`](crate::display::Display::configure).

use smithay::utils::{Logical, Point, Rectangle, Size, Transform};

use crate::{
    device::{OutputId, edid::EdidInfo},
    error::KmsError,
    grouping,
    output::gamma::GammaCurves,
};

/// Display power state, in DPMS order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerMode {
    #[default]
    On,
    Standby,
    Suspend,
    Off,
}

impl PowerMode {
    /// The value of the connector's `DPMS` enum property for this state.
    pub fn dpms_value(self) -> u64 {
        match self {
            PowerMode::On => 0,
            PowerMode::Standby => 1,
            PowerMode::Suspend => 2,
            PowerMode::Off => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeInfo {
    pub size: Size<i32, Logical>,
    /// Vertical refresh in Hz, at 0.01 Hz precision.
    pub refresh_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfiguration {
    pub id: OutputId,
    /// The connector name, e.g. `DP-1`.
    pub name: String,
    pub connected: bool,
    /// Whether the output should be scanned out to.
    pub used: bool,
    pub modes: Vec<ModeInfo>,
    pub preferred_mode_index: Option<usize>,
    pub current_mode_index: Option<usize>,
    pub top_left: Point<i32, Logical>,
    pub transform: Transform,
    pub power_mode: PowerMode,
    pub gamma: GammaCurves,
    pub gamma_supported: bool,
    pub physical_size_mm: Option<(u32, u32)>,
    pub edid: Option<EdidInfo>,
}

impl OutputConfiguration {
    /// A disconnected, unused output with nothing known about it yet.
    pub fn unknown(id: OutputId) -> Self {
        Self {
            id,
            name: String::new(),
            connected: false,
            used: false,
            modes: Vec::new(),
            preferred_mode_index: None,
            current_mode_index: None,
            top_left: Point::default(),
            transform: Transform::Normal,
            power_mode: PowerMode::On,
            gamma: GammaCurves::default(),
            gamma_supported: false,
            physical_size_mm: None,
            edid: None,
        }
    }

    pub fn current_mode(&self) -> Option<&ModeInfo> {
        self.current_mode_index.and_then(|idx| self.modes.get(idx))
    }

    /// Whether this output takes part in scanout.
    pub fn is_active(&self) -> bool {
        self.connected && self.used && self.current_mode().is_some()
    }

    /// The area of the shared coordinate space this output shows, after its transform.
    pub fn extents(&self) -> Rectangle<i32, Logical> {
        let size = self
            .current_mode()
            .map(|mode| self.transform.transform_size(mode.size))
            .unwrap_or_default();
        Rectangle::new(self.top_left, size)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayConfiguration {
    pub outputs: Vec<OutputConfiguration>,
}

impl DisplayConfiguration {
    pub fn output(&self, id: OutputId) -> Option<&OutputConfiguration> {
        self.outputs.iter().find(|output| output.id == id)
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut OutputConfiguration> {
        self.outputs.iter_mut().find(|output| output.id == id)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&OutputConfiguration> {
        self.outputs.iter().find(|output| output.name == name)
    }

    /// Checks the configuration can be applied.
    ///
    /// At least one output must be in use, and every used output must be connected with a valid
    /// mode.
    pub fn validate(&self) -> Result<(), KmsError> {
        let mut any_used = false;

        for output in self.outputs.iter().filter(|output| output.used) {
            any_used = true;

            if !output.connected {
                return Err(KmsError::InvalidConfiguration(format!(
                    "{} is used but not connected",
                    output.name
                )));
            }

            if output.current_mode().is_none() {
                return Err(KmsError::InvalidConfiguration(format!(
                    "{} has no valid mode selected",
                    output.name
                )));
            }

            if !output.gamma.is_empty() && output.gamma.size().is_none() {
                return Err(KmsError::InvalidConfiguration(format!(
                    "{} has gamma channels of different lengths",
                    output.name
                )));
            }
        }

        if !any_used {
            return Err(KmsError::InvalidConfiguration(
                "no outputs are in use".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether `other` can be applied without rebuilding display buffers.
    ///
    /// That is the case when the set of outputs is the same, each keeps its mode, power state,
    /// gamma and extents size, and the outputs still group the same way. Positions and
    /// transforms may change as long as the groups do not.
    pub fn compatible(&self, other: &DisplayConfiguration) -> bool {
        if self.outputs.len() != other.outputs.len() {
            return false;
        }

        let outputs_match = self.outputs.iter().all(|conf| {
            other.output(conf.id).is_some_and(|new| {
                conf.connected == new.connected
                    && conf.used == new.used
                    && conf.power_mode == new.power_mode
                    && conf.current_mode_index == new.current_mode_index
                    && conf.gamma == new.gamma
                    && conf.extents().size == new.extents().size
            })
        });

        outputs_match && grouping::same_grouping(self, other)
    }
}

/// Chooses the layout applied to the hardware configuration at startup.
pub trait DisplayConfigurationPolicy {
    fn apply_to(&self, conf: &mut DisplayConfiguration);
}

