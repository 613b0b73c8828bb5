/// Per-channel gamma lookup tables for a crtc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GammaCurves {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaCurves {
    /// An identity ramp with `size` entries per channel.
    pub fn linear(size: usize) -> Self {
        let ramp = match size {
            0 => Vec::new(),
            1 => vec![0xffff],
            _ => {
                let denom = size as u64 - 1;
                (0..size as u64)
                    .map(|i| (0xffff * i / denom) as u16)
                    .collect()
            }
        };

        Self {
            red: ramp.clone(),
            green: ramp.clone(),
            blue: ramp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty() && self.green.is_empty() && self.blue.is_empty()
    }

    /// The common length of all three channels, if they agree.
    pub fn size(&self) -> Option<usize> {
        (self.red.len() == self.green.len() && self.green.len() == self.blue.len())
            .then_some(self.red.len())
    }
}
