use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::{
    device::{KmsDevice, OutputId},
    error::KmsError,
    framebuffer::FramebufferRegistry,
    output::KmsOutput,
    page_flipper::KmsPageFlipper,
    report::DisplayReport,
};

/// Per-device state shared by every output on that device.
#[derive(Debug, Clone)]
pub struct DeviceResources {
    pub device: Arc<dyn KmsDevice>,
    pub flipper: Arc<KmsPageFlipper>,
    pub framebuffers: Arc<FramebufferRegistry>,
}

/// Owns every output on every device and keeps the set in sync with the kernel.
#[derive(Debug)]
pub struct OutputContainer {
    devices: Vec<DeviceResources>,
    outputs: IndexMap<OutputId, Arc<KmsOutput>>,
}

impl OutputContainer {
    pub fn new(devices: Vec<Arc<dyn KmsDevice>>, report: Arc<dyn DisplayReport>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| DeviceResources {
                flipper: Arc::new(KmsPageFlipper::new(device.clone(), report.clone())),
                framebuffers: Arc::new(FramebufferRegistry::new(device.clone())),
                device,
            })
            .collect();

        Self {
            devices,
            outputs: IndexMap::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceResources] {
        &self.devices
    }

    /// Re-enumerates connectors on every device.
    ///
    /// Known outputs are refreshed in place, new connectors get a new output and outputs whose
    /// connector disappeared are dropped.
    pub fn update_from_hardware_state(&mut self) -> Result<(), KmsError> {
        let mut outputs = IndexMap::new();

        for res in self.devices.iter() {
            let resources = res
                .device
                .resources()
                .map_err(|err| KmsError::from_io("get resources", err))?;

            for connector in resources.connectors {
                let id = OutputId {
                    device: res.device.id(),
                    connector,
                };

                let output = match self.outputs.swap_remove(&id) {
                    Some(output) => {
                        output.refresh_hardware_state()?;
                        output
                    }
                    None => {
                        let output = KmsOutput::new(
                            res.device.clone(),
                            connector,
                            res.flipper.clone(),
                            res.framebuffers.clone(),
                        )?;
                        debug!(output = %output.name(), %id, "Found new output");
                        Arc::new(output)
                    }
                };

                outputs.insert(id, output);
            }
        }

        for (id, output) in self.outputs.drain(..) {
            info!(output = %output.name(), %id, "Output removed");
        }
        self.outputs = outputs;

        Ok(())
    }

    pub fn get(&self, id: OutputId) -> Option<Arc<KmsOutput>> {
        self.outputs.get(&id).cloned()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Arc<KmsOutput>> {
        self.outputs.values()
    }

    pub fn for_each_output(&self, mut f: impl FnMut(&Arc<KmsOutput>)) {
        self.outputs.values().for_each(|output| f(output));
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
