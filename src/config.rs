//! The static display layout read from a TOML file.
//!
//! ```toml
//! [options]
//! bypass = true
//! modeset = "atomic"
//!
//! [[output]]
//! name = "DP-1"
//! mode = "2560x1440@144"
//! position = [0, 0]
//!
//! [[output]]
//! name = "HDMI-A-1"
//! transform = "90"
//! ```
//!
//! Connected outputs that aren't listed get their preferred mode and are placed to the right of
//! the outputs before them.

use std::{path::Path, str::FromStr};

use anyhow::Context;
use smithay::utils::{Logical, Point, Transform};
use tracing::{debug, warn};

use crate::{
    configuration::{DisplayConfiguration, DisplayConfigurationPolicy, PowerMode},
    device::drm::ModesetStrategy,
    display::DisplayOptions,
    display_buffer::BypassOption,
};

#[derive(serde::Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StaticDisplayConfig {
    #[serde(default)]
    pub options: Options,
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputEntry>,
}

#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Scan out fullscreen client buffers directly.
    pub bypass: bool,
    pub modeset: Modeset,
    /// Use the hardware cursor if the driver supports one.
    pub cursor: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bypass: true,
            modeset: Modeset::Legacy,
            cursor: true,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Modeset {
    #[default]
    Legacy,
    Atomic,
}

impl From<Modeset> for ModesetStrategy {
    fn from(modeset: Modeset) -> Self {
        match modeset {
            Modeset::Legacy => ModesetStrategy::Legacy,
            Modeset::Atomic => ModesetStrategy::Atomic,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputEntry {
    /// The connector name, e.g. `HDMI-A-1`.
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub mode: Option<ModeSpec>,
    pub position: Option<(i32, i32)>,
    #[serde(default)]
    pub transform: TransformDef,
    #[serde(default)]
    pub power: PowerDef,
}

fn enabled_by_default() -> bool {
    true
}

/// A mode written as `WIDTHxHEIGHT` or `WIDTHxHEIGHT@HZ`.
#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(try_from = "String")]
pub struct ModeSpec {
    pub width: i32,
    pub height: i32,
    pub refresh_hz: Option<f64>,
}

impl FromStr for ModeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (size, refresh) = match s.split_once('@') {
            Some((size, refresh)) => (size, Some(refresh)),
            None => (s, None),
        };

        let (width, height) = size
            .split_once('x')
            .with_context(|| format!("mode `{s}` is not of the form WIDTHxHEIGHT[@HZ]"))?;

        let width = width.trim().parse().with_context(|| format!("bad width in `{s}`"))?;
        let height = height.trim().parse().with_context(|| format!("bad height in `{s}`"))?;
        let refresh_hz = refresh
            .map(|hz| hz.trim().parse::<f64>())
            .transpose()
            .with_context(|| format!("bad refresh rate in `{s}`"))?;

        Ok(Self {
            width,
            height,
            refresh_hz,
        })
    }
}

impl TryFrom<String> for ModeSpec {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformDef {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "90")]
    _90,
    #[serde(rename = "180")]
    _180,
    #[serde(rename = "270")]
    _270,
    #[serde(rename = "flipped")]
    Flipped,
    #[serde(rename = "flipped-90")]
    Flipped90,
    #[serde(rename = "flipped-180")]
    Flipped180,
    #[serde(rename = "flipped-270")]
    Flipped270,
}

impl From<TransformDef> for Transform {
    fn from(transform: TransformDef) -> Self {
        match transform {
            TransformDef::Normal => Transform::Normal,
            TransformDef::_90 => Transform::_90,
            TransformDef::_180 => Transform::_180,
            TransformDef::_270 => Transform::_270,
            TransformDef::Flipped => Transform::Flipped,
            TransformDef::Flipped90 => Transform::Flipped90,
            TransformDef::Flipped180 => Transform::Flipped180,
            TransformDef::Flipped270 => Transform::Flipped270,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerDef {
    #[default]
    On,
    Standby,
    Suspend,
    Off,
}

impl From<PowerDef> for PowerMode {
    fn from(power: PowerDef) -> Self {
        match power {
            PowerDef::On => PowerMode::On,
            PowerDef::Standby => PowerMode::Standby,
            PowerDef::Suspend => PowerMode::Suspend,
            PowerDef::Off => PowerMode::Off,
        }
    }
}

impl StaticDisplayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn display_options(&self) -> DisplayOptions {
        DisplayOptions {
            bypass: if self.options.bypass {
                BypassOption::Allowed
            } else {
                BypassOption::Prohibited
            },
        }
    }

    pub fn entry(&self, name: &str) -> Option<&OutputEntry> {
        self.outputs.iter().find(|entry| entry.name == name)
    }
}

impl FromStr for StaticDisplayConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl DisplayConfigurationPolicy for StaticDisplayConfig {
    fn apply_to(&self, conf: &mut DisplayConfiguration) {
        let mut next_x = 0;

        for output in conf.outputs.iter_mut() {
            if !output.connected || output.modes.is_empty() {
                output.used = false;
                continue;
            }

            let entry = self.entry(&output.name);

            if entry.is_some_and(|entry| !entry.enabled) {
                debug!(output = %output.name, "Output disabled by config");
                output.used = false;
                continue;
            }

            let preferred = output.preferred_mode_index.unwrap_or(0);
            let mode_index = match entry.and_then(|entry| entry.mode) {
                Some(spec) => output
                    .modes
                    .iter()
                    .position(|mode| {
                        mode.size == (spec.width, spec.height).into()
                            && spec
                                .refresh_hz
                                .is_none_or(|hz| (mode.refresh_hz - hz).abs() < 0.5)
                    })
                    .unwrap_or_else(|| {
                        warn!(
                            output = %output.name,
                            "No mode matches {}x{}, using the preferred mode",
                            spec.width,
                            spec.height
                        );
                        preferred
                    }),
                None => preferred,
            };

            output.used = true;
            output.current_mode_index = Some(mode_index.min(output.modes.len() - 1));
            output.transform = entry
                .map(|entry| entry.transform.into())
                .unwrap_or(Transform::Normal);
            output.power_mode = entry.map(|entry| entry.power.into()).unwrap_or_default();
            output.top_left = match entry.and_then(|entry| entry.position) {
                Some(position) => Point::<i32, Logical>::from(position),
                None => (next_x, 0).into(),
            };

            let extents = output.extents();
            next_x = next_x.max(extents.loc.x + extents.size.w);
        }
    }
}
