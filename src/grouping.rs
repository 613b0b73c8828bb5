//! Partitioning of active outputs into scanout groups.
//!
//! Outputs whose extents overlap show the same part of the shared coordinate space, so they
//! are mirrored and rendered once. A rendered buffer can only be scanned out cheaply on the
//! device that owns its memory, so each overlap group is further split per device.

use indexmap::IndexMap;
use smithay::utils::{Logical, Rectangle, Transform};

use crate::{
    configuration::DisplayConfiguration,
    device::{DeviceId, OutputId},
};

/// Outputs that share one render target.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputGroup {
    pub outputs: Vec<OutputId>,
    /// The union of the members' extents.
    pub bounding: Rectangle<i32, Logical>,
    pub transform: Transform,
}

impl OutputGroup {
    /// The device all members live on, if they share one.
    pub fn device(&self) -> Option<DeviceId> {
        let first = self.outputs.first()?.device;
        self.outputs
            .iter()
            .all(|id| id.device == first)
            .then_some(first)
    }
}

/// Groups the active outputs of `conf` by overlapping extents.
///
/// Overlap is transitive: if A overlaps B and B overlaps C, all three end up in one group even
/// if A and C are disjoint. Outputs with different transforms are never grouped together.
pub fn overlap_groups(conf: &DisplayConfiguration) -> Vec<OutputGroup> {
    let mut groups: Vec<OutputGroup> = Vec::new();

    for output in conf.outputs.iter().filter(|output| output.is_active()) {
        let extents = output.extents();

        let mut merged = OutputGroup {
            outputs: vec![output.id],
            bounding: extents,
            transform: output.transform,
        };

        // Pull in every group this output touches; merging may make it touch more
        loop {
            let Some(idx) = groups.iter().position(|group| {
                group.transform == merged.transform && group.bounding.overlaps(merged.bounding)
            }) else {
                break;
            };

            let group = groups.remove(idx);
            let mut outputs = group.outputs;
            outputs.extend(merged.outputs);
            merged = OutputGroup {
                outputs,
                bounding: group.bounding.merge(merged.bounding),
                transform: merged.transform,
            };
        }

        groups.push(merged);
    }

    groups
}

/// Splits a group so every resulting group lives on a single device.
pub fn split_by_device(group: &OutputGroup) -> Vec<OutputGroup> {
    let mut per_device: IndexMap<DeviceId, Vec<OutputId>> = IndexMap::new();
    for id in group.outputs.iter() {
        per_device.entry(id.device).or_default().push(*id);
    }

    per_device
        .into_values()
        .map(|outputs| OutputGroup {
            outputs,
            bounding: group.bounding,
            transform: group.transform,
        })
        .collect()
}

/// All groups that need their own render target.
pub fn scanout_groups(conf: &DisplayConfiguration) -> Vec<OutputGroup> {
    overlap_groups(conf)
        .iter()
        .flat_map(split_by_device)
        .collect()
}

fn group_keys(conf: &DisplayConfiguration) -> Vec<Vec<(u64, u32)>> {
    let mut keys = scanout_groups(conf)
        .into_iter()
        .map(|group| {
            let mut key = group
                .outputs
                .iter()
                .map(|id| (id.device.0, u32::from(id.connector)))
                .collect::<Vec<_>>();
            key.sort_unstable();
            key
        })
        .collect::<Vec<_>>();
    keys.sort_unstable();
    keys
}

/// Whether both configurations partition their outputs into the same groups.
pub fn same_grouping(a: &DisplayConfiguration, b: &DisplayConfiguration) -> bool {
    group_keys(a) == group_keys(b)
}
