pub mod block;
pub mod positional;
pub mod unfold;

use std::path::Path;

use candle::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};
use tracing::info;

use crate::{
    common::{conv::ConvBn, tensor_ext::TensorExt},
    config::{DstaConfig, next_num_frame},
    dsta::block::{BlockConfig, StAttentionBlock},
    error::{Error, Result},
    graph::AdjacencyGraph,
};

const LEAKY_SLOPE: f64 = 0.1;

/// Skeleton action classifier: (N, M, C, T, V) poses -> (N, num_class) logits.
pub struct DstaNet {
    num_person: usize,
    num_channel: usize,
    num_point: usize,
    num_frame: usize,
    /// Temporal attention biases are (T, T), so clips must be exactly `num_frame` long.
    fixed_frames: bool,
    input_map: ConvBn,
    diff_maps: [ConvBn; 4],
    graph_layers: Vec<StAttentionBlock>,
    drop_out2d: ChannelDropout,
    drop_out: Dropout,
    fc: Linear,
}

impl DstaNet {
    pub fn new(config: &DstaConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let graph = if config.use_spatial_att && config.att_s {
            Some(AdjacencyGraph::new(config.num_point, config.num_subset)?)
        } else {
            None
        };

        let in_channels = config.layers[0].in_channels;
        let embed = |out_channels: usize, name: &str| {
            ConvBn::pointwise(config.num_channel, out_channels, vb.pp(name))
        };
        let input_map = embed(in_channels / 2, "input_map")?;
        let diff_maps = [
            embed(in_channels / 8, "diff_map1")?,
            embed(in_channels / 8, "diff_map2")?,
            embed(in_channels / 8, "diff_map3")?,
            embed(in_channels / 8, "diff_map4")?,
        ];

        let mut num_frame = config.num_frame;
        let mut graph_layers = Vec::with_capacity(config.layers.len());
        for (i, layer) in config.layers.iter().enumerate() {
            let block_config = BlockConfig::from_layer(config, layer, num_frame);
            let block = StAttentionBlock::new(
                &block_config,
                graph.as_ref(),
                vb.pp(format!("graph_layers.{i}")),
            )?;

            let expected = next_num_frame(num_frame, layer.stride);
            let produced = block.out_frames(num_frame);
            if produced != expected {
                return Err(Error::config(format!(
                    "layer {i} turns {num_frame} frames into {produced}, \
                     but the next layer is sized for {expected}"
                )));
            }
            graph_layers.push(block);
            num_frame = expected;
        }

        let out_channels = config.layers[config.layers.len() - 1].out_channels;
        let fc = candle_nn::linear(out_channels, config.num_class, vb.pp("fc"))?;

        info!(
            layers = graph_layers.len(),
            num_class = config.num_class,
            num_point = config.num_point,
            num_frame = config.num_frame,
            topology = ?graph.as_ref().map(|g| g.topology()),
            "built DSTA network"
        );

        Ok(Self {
            num_person: config.num_person,
            num_channel: config.num_channel,
            num_point: config.num_point,
            num_frame: config.num_frame,
            fixed_frames: config.use_temporal_att,
            input_map,
            diff_maps,
            graph_layers,
            drop_out2d: ChannelDropout::new(config.dropout2d),
            drop_out: Dropout::new(config.dropout as f32),
            fc,
        })
    }

    /// Builds the network from a safetensors checkpoint.
    pub fn from_safetensors<P: AsRef<Path>>(
        config: &DstaConfig,
        path: P,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle::safetensors::load(path, device)?;
        info!(path = %path.display(), tensors = tensors.len(), "loaded weights");
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    pub fn num_person(&self) -> usize {
        self.num_person
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, m, c, t, v) = x.dims5()?;
        let frames_ok = if self.fixed_frames {
            t == self.num_frame
        } else {
            (3..=self.num_frame).contains(&t)
        };
        if c != self.num_channel || v != self.num_point || !frames_ok {
            return Err(Error::shape_mismatch(
                "skeleton input (N, M, C, T, V)",
                &[n, m, self.num_channel, self.num_frame, self.num_point],
                &[n, m, c, t, v],
            ));
        }

        let x = reshape_exact(x, &[n * m, c, t, v], "merging batch and person axes")?;
        let mut x = self.embed(&x, train)?;
        for layer in &self.graph_layers {
            x = layer.forward_t(&x, train)?;
        }

        let (_, c_out, t_out, v) = x.dims4()?;
        let x = reshape_exact(&x, &[n, m, c_out, t_out * v], "splitting batch and person axes")?
            .permute((0, 1, 3, 2))?
            .contiguous()?
            .reshape((n, m * t_out * v, c_out, 1))?;
        let x = self.drop_out2d.forward_t(&x, train)?;
        let x = x.mean(3)?.mean(1)?;
        let x = self.drop_out.forward_t(&x, train)?;

        Ok(self.fc.forward(&x)?)
    }

    /// Raw pose plus the four frame-difference streams, each embedded
    /// separately and concatenated on the channel axis.
    fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut streams = vec![self.input_map.forward_t(x, train)?.leaky_relu(LEAKY_SLOPE)?];
        for (map, dif) in self.diff_maps.iter().zip(frame_differences(x)?) {
            streams.push(map.forward_t(&dif, train)?.leaky_relu(LEAKY_SLOPE)?);
        }
        Ok(Tensor::cat(&streams, 1)?)
    }
}

/// One- and two-step frame differences, zero where the step leaves the clip:
/// `x[t]-x[t-1]`, `x[t]-x[t-2]`, `x[t]-x[t+1]`, `x[t]-x[t+2]`.
fn frame_differences(x: &Tensor) -> Result<[Tensor; 4]> {
    let t = x.dim(2)?;
    let dif1 = (x.narrow(2, 1, t - 1)? - x.narrow(2, 0, t - 1)?)?.pad_with_zeros(2, 1, 0)?;
    let dif2 = (x.narrow(2, 2, t - 2)? - x.narrow(2, 0, t - 2)?)?.pad_with_zeros(2, 2, 0)?;
    let dif3 = (x.narrow(2, 0, t - 1)? - x.narrow(2, 1, t - 1)?)?.pad_with_zeros(2, 0, 1)?;
    let dif4 = (x.narrow(2, 0, t - 2)? - x.narrow(2, 2, t - 2)?)?.pad_with_zeros(2, 0, 2)?;
    Ok([dif1, dif2, dif3, dif4])
}

fn reshape_exact(x: &Tensor, dims: &[usize], context: &'static str) -> Result<Tensor> {
    let count: usize = dims.iter().product();
    if count != x.elem_count() {
        return Err(Error::shape_mismatch(context, dims, x.dims()));
    }
    Ok(x.reshape(dims)?)
}

/// Zeroes whole channels (axis 1) of an (N, C, H, W) tensor while training.
#[derive(Debug, Clone, Copy)]
struct ChannelDropout {
    drop_p: f64,
}

impl ChannelDropout {
    fn new(drop_p: f64) -> Self {
        Self { drop_p }
    }
}

impl ModuleT for ChannelDropout {
    fn forward_t(&self, x: &Tensor, train: bool) -> candle::Result<Tensor> {
        if !train || self.drop_p == 0.0 {
            return Ok(x.clone());
        }
        let (n, c, _, _) = x.dims4()?;
        let rand = Tensor::rand(0f32, 1f32, (n, c, 1, 1), x.device())?;
        let drop_p = Tensor::new(self.drop_p as f32, x.device())?.broadcast_as(rand.shape())?;
        let mask = rand
            .ge(&drop_p)?
            .to_dtype(x.dtype())?
            .scalar_div(1.0 - self.drop_p)?;
        x.broadcast_mul(&mask)
    }
}
