// SPDX-License-Identifier: GPL-3.0-or-later

//! The hardware cursor, shown through each output's cursor plane.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use smithay::{
    reexports::drm::buffer::DrmFourcc,
    utils::{Logical, Point, Rectangle, Size, Transform},
};
use tracing::{debug, warn};

use crate::{
    configuration::DisplayConfiguration,
    device::{CursorPlane, DumbAllocation, KmsDevice, OutputId},
    error::KmsError,
    output::KmsOutput,
    output_container::OutputContainer,
};

/// Access to the configuration currently applied to the hardware.
pub trait CurrentConfiguration: Send + Sync {
    fn with_current_configuration(
        &self,
        f: &mut dyn FnMut(&DisplayConfiguration, &OutputContainer),
    );
}

/// An ARGB8888 cursor image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub size: Size<i32, Logical>,
    pub hotspot: Point<i32, Logical>,
    /// Tightly packed rows, 4 bytes per pixel.
    pub pixels: Vec<u8>,
}

struct CursorBuffer {
    device: Arc<dyn KmsDevice>,
    allocation: DumbAllocation,
    /// The output rotation the image was last written for.
    transform: Transform,
}

impl CursorBuffer {
    fn plane(&self) -> CursorPlane {
        CursorPlane {
            handle: self.allocation.handle,
            size: self.allocation.size,
        }
    }
}

impl Drop for CursorBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_dumb_buffer(self.allocation.handle) {
            warn!("Failed to destroy cursor buffer: {err}");
        }
    }
}

struct CursorState {
    visible: bool,
    position: Point<i32, Logical>,
    image: Option<CursorImage>,
    buffers: HashMap<OutputId, CursorBuffer>,
    /// The smallest buffer size across all outputs; images are clipped to this.
    min_buffer_size: (u32, u32),
    last_set_failed: bool,
}

pub struct Cursor {
    configuration: Arc<dyn CurrentConfiguration>,
    state: Mutex<CursorState>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Cursor")
            .field("visible", &state.visible)
            .field("position", &state.position)
            .field("buffers", &state.buffers.len())
            .finish()
    }
}

impl Cursor {
    /// Creates cursor buffers for every output and clears their cursor planes.
    ///
    /// Fails if any cursor plane could not be cleared, in which case a software cursor should be
    /// used instead.
    pub fn new(configuration: Arc<dyn CurrentConfiguration>) -> Result<Self, KmsError> {
        let cursor = Self {
            configuration,
            state: Mutex::new(CursorState {
                visible: false,
                position: Point::default(),
                image: None,
                buffers: HashMap::new(),
                min_buffer_size: (u32::MAX, u32::MAX),
                last_set_failed: false,
            }),
        };

        let mut outputs = Vec::new();
        cursor
            .configuration
            .with_current_configuration(&mut |conf, container| {
                outputs.extend(
                    conf.outputs
                        .iter()
                        .filter_map(|output| container.get(output.id)),
                );
            });

        {
            let mut state = cursor.state.lock().unwrap();
            for output in outputs.iter() {
                buffer_for_output(&mut state, output)
                    .map_err(|err| KmsError::from_io_optional("create cursor buffer", err))?;
            }
        }

        cursor.hide();

        if cursor.state.lock().unwrap().last_set_failed {
            return Err(KmsError::Unsupported {
                op: "initial cursor set",
                source: io::Error::other("cursor plane could not be cleared on every output"),
            });
        }

        Ok(cursor)
    }

    /// Shows `image` at the current position.
    pub fn show(&self, image: CursorImage) -> Result<(), KmsError> {
        let mut state = self.state.lock().unwrap();

        let min_size = state.min_buffer_size;
        for buffer in state.buffers.values() {
            write_image(buffer, &image, min_size)
                .map_err(|err| KmsError::from_io("write cursor image", err))?;
        }
        state.image = Some(image);

        // Only show once the image made it into every buffer
        state.visible = true;
        let position = state.position;
        self.place_cursor_at(&mut state, position, true);

        Ok(())
    }

    pub fn move_to(&self, position: Point<i32, Logical>) {
        let mut state = self.state.lock().unwrap();
        self.place_cursor_at(&mut state, position, false);
    }

    pub fn hide(&self) {
        let mut state = self.state.lock().unwrap();
        state.visible = false;
        self.clear(&mut state);
    }

    /// Clears every cursor plane but remembers whether the cursor should be visible.
    pub fn suspend(&self) {
        let mut state = self.state.lock().unwrap();
        self.clear(&mut state);
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        let position = state.position;
        self.place_cursor_at(&mut state, position, true);
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().unwrap().visible
    }

    /// Whether the last placement failed to show the cursor on some output.
    pub fn last_set_failed(&self) -> bool {
        self.state.lock().unwrap().last_set_failed
    }

    fn clear(&self, state: &mut CursorState) {
        let mut failed = false;
        self.configuration
            .with_current_configuration(&mut |_, container| {
                container.for_each_output(|output| {
                    if !output.clear_cursor() {
                        failed = true;
                    }
                });
            });
        state.last_set_failed = failed;
    }

    fn used_outputs(&self) -> Vec<(Arc<KmsOutput>, Rectangle<i32, Logical>, Transform)> {
        let mut outputs = Vec::new();
        self.configuration
            .with_current_configuration(&mut |conf, container| {
                outputs.extend(
                    conf.outputs
                        .iter()
                        .filter(|output| output.used)
                        .filter_map(|output| {
                            let kms_output = container.get(output.id)?;
                            Some((kms_output, output.extents(), output.transform))
                        }),
                );
            });
        outputs
    }

    fn place_cursor_at(
        &self,
        state: &mut CursorState,
        position: Point<i32, Logical>,
        force: bool,
    ) {
        state.position = position;

        if !state.visible {
            return;
        }

        let mut set_on_all_outputs = true;

        for (output, rect, transform) in self.used_outputs() {
            if !rect.contains(position) {
                if force || output.has_cursor() {
                    output.clear_cursor();
                }
                continue;
            }

            let rotation = rotation_of(transform);
            let image_size = state
                .image
                .as_ref()
                .map(|image| image.size)
                .unwrap_or_default();
            let hotspot = state
                .image
                .as_ref()
                .map(|image| image.hotspot)
                .unwrap_or_default();

            let dp = transform_point(rect.size, position - rect.loc, rotation);
            // Drivers disagree on hotspot support, so offset the plane instead
            let hs = transform_point(image_size, hotspot, rotation);
            output.move_cursor((dp.x - hs.x, dp.y - hs.y));

            let min_size = state.min_buffer_size;
            let buffer = match buffer_for_output(state, &output) {
                Ok(buffer) => buffer,
                Err(err) => {
                    warn!(output = %output.name(), "Failed to create cursor buffer: {err}");
                    set_on_all_outputs = false;
                    continue;
                }
            };

            let changed_rotation = buffer.transform != rotation;
            if changed_rotation {
                buffer.transform = rotation;
                if let Some(image) = state.image.as_ref() {
                    let Some(buffer) = state.buffers.get(&output.output_id()) else {
                        continue;
                    };
                    if let Err(err) = write_image(buffer, image, min_size) {
                        warn!(output = %output.name(), "Failed to write cursor image: {err}");
                    }
                }
            }

            let Some(plane) = state
                .buffers
                .get(&output.output_id())
                .map(CursorBuffer::plane)
            else {
                continue;
            };

            if (force || !output.has_cursor() || changed_rotation)
                && (!output.set_cursor(plane) || !output.has_cursor())
            {
                set_on_all_outputs = false;
            }
        }

        state.last_set_failed = !set_on_all_outputs;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.hide();
    }
}

fn buffer_for_output<'a>(
    state: &'a mut CursorState,
    output: &KmsOutput,
) -> io::Result<&'a mut CursorBuffer> {
    let id = output.output_id();

    if !state.buffers.contains_key(&id) {
        let device = output.device().clone();
        let allocation = device.create_dumb_buffer(device.cursor_size(), DrmFourcc::Argb8888)?;
        debug!(output = %output.name(), size = ?allocation.size, "Created cursor buffer");

        state.min_buffer_size = (
            state.min_buffer_size.0.min(allocation.size.0),
            state.min_buffer_size.1.min(allocation.size.1),
        );
        state.buffers.insert(
            id,
            CursorBuffer {
                device,
                allocation,
                transform: Transform::Normal,
            },
        );
    }

    state
        .buffers
        .get_mut(&id)
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
}

/// Cursor planes can't mirror, so flipped outputs use the matching rotation.
fn rotation_of(transform: Transform) -> Transform {
    match transform {
        Transform::Normal | Transform::Flipped => Transform::Normal,
        Transform::_90 | Transform::Flipped90 => Transform::_90,
        Transform::_180 | Transform::Flipped180 => Transform::_180,
        Transform::_270 | Transform::Flipped270 => Transform::_270,
    }
}

/// Maps a point relative to a rect of `size` into the rect's rotated frame.
fn transform_point(
    size: Size<i32, Logical>,
    point: Point<i32, Logical>,
    rotation: Transform,
) -> Point<i32, Logical> {
    match rotation {
        Transform::_90 => (point.y, size.w - point.x).into(),
        Transform::_180 => (size.w - point.x, size.h - point.y).into(),
        Transform::_270 => (size.h - point.y, point.x).into(),
        _ => point,
    }
}

/// Renders `image` rotated for `rotation` into a zero padded `buffer_width` x `buffer_height`
/// ARGB8888 buffer with `pitch` bytes per row. The image is clipped to `min_size`.
fn pad_and_rotate(
    image: &CursorImage,
    rotation: Transform,
    min_size: (u32, u32),
    pitch: u32,
    buffer_height: u32,
) -> Vec<u8> {
    let sideways = matches!(rotation, Transform::_90 | Transform::_270);
    let (min_w, min_h) = if sideways {
        (min_size.1, min_size.0)
    } else {
        min_size
    };

    let w = (image.size.w.max(0) as u32).min(min_w) as usize;
    let h = (image.size.h.max(0) as u32).min(min_h) as usize;
    let image_stride = image.size.w.max(0) as usize * 4;
    let pitch = pitch.max(min_w * 4) as usize;
    let buffer_height = buffer_height.max(min_h) as usize;

    let mut padded = vec![0u8; pitch * buffer_height];

    let (dest_w, dest_h) = if sideways { (h, w) } else { (w, h) };
    for dy in 0..dest_h.min(buffer_height) {
        for dx in 0..dest_w.min(pitch / 4) {
            let (sx, sy) = match rotation {
                Transform::_90 => (w - 1 - dy, dx),
                Transform::_180 => (w - 1 - dx, h - 1 - dy),
                Transform::_270 => (dy, h - 1 - dx),
                _ => (dx, dy),
            };

            let src = sy * image_stride + sx * 4;
            let dest = dy * pitch + dx * 4;
            if let Some(pixel) = image.pixels.get(src..src + 4) {
                padded[dest..dest + 4].copy_from_slice(pixel);
            }
        }
    }

    padded
}

fn write_image(buffer: &CursorBuffer, image: &CursorImage, min_size: (u32, u32)) -> io::Result<()> {
    let data = pad_and_rotate(
        image,
        buffer.transform,
        min_size,
        buffer.allocation.pitch,
        buffer.allocation.size.1,
    );
    buffer
        .device
        .write_dumb_buffer(buffer.allocation.handle, &data)
}
