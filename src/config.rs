use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// One stacked attention block: `[in_channels, out_channels, inter_channels, stride]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "[usize; 4]")]
pub struct LayerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub inter_channels: usize,
    pub stride: usize,
}

impl From<[usize; 4]> for LayerConfig {
    fn from([in_channels, out_channels, inter_channels, stride]: [usize; 4]) -> Self {
        Self {
            in_channels,
            out_channels,
            inter_channels,
            stride,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DstaConfig {
    pub num_class: usize,
    pub num_point: usize,
    pub num_frame: usize,
    pub num_subset: usize,
    pub num_person: usize,
    pub num_channel: usize,
    #[serde(rename = "config")]
    pub layers: Vec<LayerConfig>,
    pub kernel_size: usize,
    pub glo_reg_s: bool,
    pub att_s: bool,
    pub glo_reg_t: bool,
    pub att_t: bool,
    pub use_temporal_att: bool,
    pub use_spatial_att: bool,
    pub use_pes: bool,
    pub use_pet: bool,
    pub attentiondrop: f64,
    pub dropout: f64,
    pub dropout2d: f64,
}

impl Default for DstaConfig {
    fn default() -> Self {
        let layers = [
            [64, 64, 16, 1],
            [64, 64, 16, 1],
            [64, 128, 32, 2],
            [128, 128, 32, 1],
            [128, 256, 64, 2],
            [256, 256, 64, 1],
            [256, 256, 64, 1],
            [256, 256, 64, 1],
        ];
        Self {
            num_class: 60,
            num_point: 25,
            num_frame: 32,
            num_subset: 4,
            num_person: 2,
            num_channel: 3,
            layers: layers.into_iter().map(LayerConfig::from).collect(),
            kernel_size: 1,
            glo_reg_s: true,
            att_s: true,
            glo_reg_t: false,
            att_t: true,
            use_temporal_att: true,
            use_spatial_att: true,
            use_pes: true,
            use_pet: true,
            attentiondrop: 0.0,
            dropout: 0.0,
            dropout2d: 0.0,
        }
    }
}

impl DstaConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = std::fs::read_to_string(path)?;
        let config: DstaConfig = serde_json::from_str(&config)?;
        Ok(config)
    }

    /// Embedding channels of the first block: `in_channels / 2` for the raw pose
    /// plus `in_channels / 8` for each of the four difference streams.
    pub fn embed_channels(&self) -> Option<(usize, usize)> {
        self.layers
            .first()
            .map(|layer| (layer.in_channels / 2, layer.in_channels / 8))
    }

    /// Frame count seen by each block, rounding `frames / stride` to nearest.
    pub fn frames_per_layer(&self) -> Vec<usize> {
        let mut num_frame = self.num_frame;
        self.layers
            .iter()
            .map(|layer| {
                let frames = num_frame;
                num_frame = next_num_frame(num_frame, layer.stride);
                frames
            })
            .collect()
    }

    /// Layers whose `inter_channels` differs from `out_channels / num_subset`,
    /// the width reference checkpoints are trained with.
    pub fn inter_channel_mismatches(&self) -> Vec<usize> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| {
                layer.inter_channels != layer.out_channels / self.num_subset.max(1)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let first = self
            .layers
            .first()
            .ok_or_else(|| Error::config("at least one layer is required"))?;
        if first.in_channels == 0 || first.in_channels % 8 != 0 {
            return Err(Error::config(format!(
                "first layer in_channels ({}) must be a positive multiple of 8",
                first.in_channels
            )));
        }
        if self.num_frame < 3 {
            return Err(Error::config(format!(
                "num_frame ({}) must cover the two-step differences",
                self.num_frame
            )));
        }
        if self.num_subset == 0 || self.num_class == 0 || self.num_channel == 0 {
            return Err(Error::config(
                "num_subset, num_class and num_channel must be positive",
            ));
        }
        if self.kernel_size % 2 == 0 {
            return Err(Error::config(format!(
                "kernel_size ({}) must be odd",
                self.kernel_size
            )));
        }
        for (name, p) in [
            ("attentiondrop", self.attentiondrop),
            ("dropout", self.dropout),
            ("dropout2d", self.dropout2d),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::config(format!("{name} ({p}) must be in [0, 1)")));
            }
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            if pair[0].out_channels != pair[1].in_channels {
                return Err(Error::config(format!(
                    "layer {} outputs {} channels but layer {} expects {}",
                    i,
                    pair[0].out_channels,
                    i + 1,
                    pair[1].in_channels
                )));
            }
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.stride == 0 || layer.inter_channels == 0 || layer.out_channels == 0 {
                return Err(Error::config(format!(
                    "layer {i}: stride, inter_channels and out_channels must be positive"
                )));
            }
            if self.use_spatial_att && self.att_s && layer.in_channels % self.num_subset != 0 {
                return Err(Error::config(format!(
                    "layer {i}: in_channels ({}) must be divisible by num_subset ({})",
                    layer.in_channels, self.num_subset
                )));
            }
            if self.use_spatial_att && self.use_pes && layer.in_channels % 2 != 0 {
                return Err(Error::config(format!(
                    "layer {i}: spatial positional encoding needs even in_channels ({})",
                    layer.in_channels
                )));
            }
            if self.use_temporal_att && self.use_pet && layer.out_channels % 2 != 0 {
                return Err(Error::config(format!(
                    "layer {i}: temporal positional encoding needs even out_channels ({})",
                    layer.out_channels
                )));
            }
        }
        for i in self.inter_channel_mismatches() {
            let layer = &self.layers[i];
            warn!(
                layer = i,
                inter_channels = layer.inter_channels,
                reference = layer.out_channels / self.num_subset,
                "inter_channels differs from out_channels / num_subset; \
                 reference checkpoints will not load"
            );
        }
        Ok(())
    }
}

pub fn next_num_frame(num_frame: usize, stride: usize) -> usize {
    (num_frame as f64 / stride as f64 + 0.5) as usize
}
