use candle::{D, Module, ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder, init::Init};
use tracing::debug;

use crate::{
    common::{
        conv::{Conv2d, Conv2dConfig, ConvBn, Residual},
        tensor_ext::TensorExt,
    },
    config::{DstaConfig, LayerConfig},
    dsta::{
        positional::{Domain, PositionalEncoding},
        unfold::UnfoldTemporalWindows,
    },
    error::{Error, Result},
    graph::AdjacencyGraph,
};

const WINDOW_SIZE: usize = 3;
const LEAKY_SLOPE: f64 = 0.1;
const MASK_FILL: f64 = -9e15;

/// Construction parameters of a single [`StAttentionBlock`].
#[derive(Debug, Clone, PartialEq)]
pub struct BlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub inter_channels: usize,
    pub stride: usize,
    pub kernel_size: usize,
    pub num_subset: usize,
    pub num_node: usize,
    pub num_frame: usize,
    pub glo_reg_s: bool,
    pub att_s: bool,
    pub glo_reg_t: bool,
    pub att_t: bool,
    pub use_temporal_att: bool,
    pub use_spatial_att: bool,
    pub use_pes: bool,
    pub use_pet: bool,
    pub attentiondrop: f64,
}

impl BlockConfig {
    pub fn from_layer(config: &DstaConfig, layer: &LayerConfig, num_frame: usize) -> Self {
        Self {
            in_channels: layer.in_channels,
            out_channels: layer.out_channels,
            inter_channels: layer.inter_channels,
            stride: layer.stride,
            kernel_size: config.kernel_size,
            num_subset: config.num_subset,
            num_node: config.num_point,
            num_frame,
            glo_reg_s: config.glo_reg_s,
            att_s: config.att_s,
            glo_reg_t: config.glo_reg_t,
            att_t: config.att_t,
            use_temporal_att: config.use_temporal_att,
            use_spatial_att: config.use_spatial_att,
            use_pes: config.use_pes,
            use_pet: config.use_pet,
            attentiondrop: config.attentiondrop,
        }
    }

    fn needs_projection(&self) -> bool {
        self.in_channels != self.out_channels || self.stride != 1
    }
}

/// Spatial attention over the skeleton graph followed by temporal attention
/// over frames; (N, in, T, V) -> (N, out, T', V).
pub struct StAttentionBlock {
    in_channels: usize,
    num_node: usize,
    num_frame: usize,
    spatial: SpatialPath,
    temporal: TemporalPath,
}

impl StAttentionBlock {
    pub fn new(
        config: &BlockConfig,
        graph: Option<&AdjacencyGraph>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if config.kernel_size % 2 == 0 || config.stride == 0 {
            return Err(Error::config(format!(
                "block needs an odd kernel_size and a positive stride, got {} and {}",
                config.kernel_size, config.stride
            )));
        }

        debug!(
            in_channels = config.in_channels,
            out_channels = config.out_channels,
            stride = config.stride,
            num_frame = config.num_frame,
            spatial = config.use_spatial_att,
            temporal = config.use_temporal_att,
            "building attention block"
        );

        let spatial = if config.use_spatial_att {
            SpatialPath::Attention(Box::new(SpatialAttention::new(config, graph, vb.clone())?))
        } else {
            let out_nets = ConvBn::new(
                config.in_channels,
                config.out_channels,
                (1, 3),
                Conv2dConfig {
                    padding: (0, 1),
                    ..Default::default()
                },
                vb.pp("out_nets"),
            )?;
            let downs2 = Residual::pointwise(
                config.needs_projection(),
                config.in_channels,
                config.out_channels,
                vb.pp("downs2"),
            )?;
            SpatialPath::Conv { out_nets, downs2 }
        };

        let temporal = if config.use_temporal_att {
            TemporalPath::Attention(Box::new(TemporalAttention::new(config, vb)?))
        } else {
            let out_nett = ConvBn::new(
                config.out_channels,
                config.out_channels,
                (7, 1),
                Conv2dConfig {
                    padding: (3, 0),
                    stride: (config.stride, 1),
                    ..Default::default()
                },
                vb.pp("out_nett"),
            )?;
            let downt2 = Residual::temporal(
                config.needs_projection(),
                config.out_channels,
                config.out_channels,
                config.kernel_size,
                config.stride,
                vb.pp("downt2"),
            )?;
            TemporalPath::Conv { out_nett, downt2 }
        };

        Ok(Self {
            in_channels: config.in_channels,
            num_node: config.num_node,
            num_frame: config.num_frame,
            spatial,
            temporal,
        })
    }

    /// Frame count produced for an input of `frames` frames.
    pub fn out_frames(&self, frames: usize) -> usize {
        let downsample = match &self.temporal {
            TemporalPath::Attention(att) => &att.ff_nett,
            TemporalPath::Conv { out_nett, .. } => out_nett,
        };
        downsample.out_size(frames, self.num_node).0
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, c, t, v) = x.dims4()?;
        if c != self.in_channels || v != self.num_node || t > self.num_frame {
            return Err(Error::shape_mismatch(
                "attention block input",
                &[n, self.in_channels, self.num_frame, self.num_node],
                &[n, c, t, v],
            ));
        }

        let y = match &self.spatial {
            SpatialPath::Attention(att) => att.forward_t(x, train)?,
            SpatialPath::Conv { out_nets, downs2 } => {
                let y = out_nets.forward_t(x, train)?;
                (downs2.forward_t(x, train)? + y)?.leaky_relu(LEAKY_SLOPE)?
            }
        };

        let z = match &self.temporal {
            TemporalPath::Attention(att) => att.forward_t(&y, train)?,
            TemporalPath::Conv { out_nett, downt2 } => {
                let z = out_nett.forward_t(&y, train)?;
                (downt2.forward_t(&y, train)? + z)?.leaky_relu(LEAKY_SLOPE)?
            }
        };

        Ok(z)
    }
}

enum SpatialPath {
    Attention(Box<SpatialAttention>),
    Conv { out_nets: ConvBn, downs2: Residual },
}

enum TemporalPath {
    Attention(Box<TemporalAttention>),
    Conv { out_nett: ConvBn, downt2: Residual },
}

/// Replaces scores of joint pairs outside the graph partition with a large
/// negative value so they vanish under softmax.
#[derive(Debug, Clone)]
pub struct GraphMask {
    keep: Tensor,
    fill: Tensor,
}

impl GraphMask {
    /// `a_sep` is (subset, V, V); the mask is tiled `window` times along the
    /// query axis to match the window-major unfolded layout.
    pub fn new(a_sep: &Tensor, window: usize) -> Result<Self> {
        let tiled = a_sep.repeat((1, window, 1))?;
        let keep = tiled
            .gt(&tiled.zeros_like()?)?
            .to_dtype(a_sep.dtype())?
            .unsqueeze(0)?;
        let fill = keep.affine(-MASK_FILL, MASK_FILL)?;
        Ok(Self { keep, fill })
    }

    pub fn apply(&self, scores: &Tensor) -> Result<Tensor> {
        Ok(scores.broadcast_mul(&self.keep)?.broadcast_add(&self.fill)?)
    }

    /// Masked softmax over the key axis.
    pub fn softmax(&self, scores: &Tensor) -> Result<Tensor> {
        Ok(self.apply(scores)?.softmax(D::Minus1)?)
    }
}

struct SpatialScores {
    in_nets: Conv2d,
    in_nets_upfold: Conv2d,
    diff_net: Conv2d,
    mask: GraphMask,
    graph_a: Tensor,
}

struct SpatialAttention {
    num_subset: usize,
    inter_channels: usize,
    pes: Option<PositionalEncoding>,
    unfold: UnfoldTemporalWindows,
    atts: Tensor,
    scores: Option<SpatialScores>,
    attention0s: Option<Tensor>,
    out_nets: ConvBn,
    ff_nets: ConvBn,
    downs1: Residual,
    downs2: Residual,
    drop: Dropout,
}

impl SpatialAttention {
    fn new(config: &BlockConfig, graph: Option<&AdjacencyGraph>, vb: VarBuilder) -> Result<Self> {
        let BlockConfig {
            in_channels,
            out_channels,
            inter_channels,
            num_subset,
            num_node,
            num_frame,
            ..
        } = *config;
        let device = vb.device();
        let dtype = vb.dtype();

        let scores = if config.att_s {
            let graph = graph.ok_or_else(|| {
                Error::config("spatial attention scores need an adjacency graph")
            })?;
            if graph.num_subset() != num_subset || graph.topology().num_node() != num_node {
                return Err(Error::config(format!(
                    "adjacency graph has {} partitions over {} joints, block expects {} over {}",
                    graph.num_subset(),
                    graph.topology().num_node(),
                    num_subset,
                    num_node
                )));
            }
            if in_channels % num_subset != 0 {
                return Err(Error::config(format!(
                    "in_channels ({in_channels}) must be divisible by num_subset ({num_subset})"
                )));
            }
            let pointwise = Conv2dConfig::default();
            let a_sep = graph.a_sep_tensor(device)?.to_dtype(dtype)?;
            Some(SpatialScores {
                in_nets: Conv2d::new(
                    in_channels,
                    num_subset * inter_channels,
                    (1, 1),
                    pointwise,
                    vb.pp("in_nets"),
                )?,
                in_nets_upfold: Conv2d::new(
                    in_channels,
                    num_subset * inter_channels,
                    (1, 1),
                    pointwise,
                    vb.pp("in_nets_upfold"),
                )?,
                diff_net: Conv2d::new(
                    in_channels,
                    in_channels,
                    (1, 1),
                    pointwise,
                    vb.pp("diff_net"),
                )?,
                mask: GraphMask::new(&a_sep, WINDOW_SIZE)?,
                graph_a: graph.a_tensor(device)?.to_dtype(dtype)?,
            })
        } else {
            None
        };

        let pes = if config.use_pes {
            Some(PositionalEncoding::new(
                in_channels,
                num_node,
                num_frame,
                Domain::Spatial,
                dtype,
                device,
            )?)
        } else {
            None
        };

        let attention_shape = (1, num_subset, num_node * WINDOW_SIZE, num_node);
        let attention0s = if config.glo_reg_s {
            Some(vb.get_with_hints(
                attention_shape,
                "attention0s",
                Init::Const(1.0 / num_node as f64),
            )?)
        } else {
            None
        };

        Ok(Self {
            num_subset,
            inter_channels,
            pes,
            unfold: UnfoldTemporalWindows::new(WINDOW_SIZE, 1, 1)?,
            atts: Tensor::zeros(attention_shape, dtype, device)?,
            scores,
            attention0s,
            out_nets: ConvBn::pointwise(in_channels * num_subset, out_channels, vb.pp("out_nets"))?,
            ff_nets: ConvBn::pointwise(out_channels, out_channels, vb.pp("ff_nets"))?,
            downs1: Residual::pointwise(
                config.needs_projection(),
                in_channels,
                out_channels,
                vb.pp("downs1"),
            )?,
            downs2: Residual::pointwise(
                config.needs_projection(),
                in_channels,
                out_channels,
                vb.pp("downs2"),
            )?,
            drop: Dropout::new(config.attentiondrop as f32),
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, c, t, v) = x.dims4()?;
        let s = self.num_subset;
        let w = self.unfold.window_size();

        let y = match &self.pes {
            Some(pes) => pes.forward(x)?,
            None => x.clone(),
        };
        let upfold = self.unfold.forward(&y)?;

        let mut attention = self.atts.clone();
        if let Some(scores) = &self.scores {
            let ci = self.inter_channels;
            let k = scores.in_nets.forward(&y)?.reshape((n, s, ci * t, v))?;
            let q = scores
                .in_nets_upfold
                .forward(&upfold)?
                .reshape((n, s, ci * t, w * v))?;
            let qk = spatial_affinity(&q, &k)?;
            attention = scores.mask.softmax(&attention.broadcast_add(&qk)?)?;

            let propagated = propagate(&y, &scores.graph_a)?;
            let gate = (scores.diff_net.forward(&propagated)?.repeat((1, 1, 1, w))? - &upfold)?
                .reshape((n, s, c / s, t, w, v))?
                .mean(5)?
                .mean(2)?
                .mean(2)?
                .sigmoid()?;
            attention = attention.broadcast_mul(&tile_gate(&gate, v)?)?;
        }
        if let Some(attention0s) = &self.attention0s {
            attention = attention.broadcast_add(attention0s)?;
        }
        let attention = attention.broadcast_as((n, s, w * v, v))?.contiguous()?;
        let attention = self.drop.forward_t(&attention, train)?;

        let y = spatial_aggregate(&upfold, &attention)?;
        let y = self.out_nets.forward_t(&y, train)?;
        let y = (self.downs1.forward_t(x, train)? + y)?.leaky_relu(LEAKY_SLOPE)?;
        let y = self.ff_nets.forward_t(&y, train)?;
        let y = (self.downs2.forward_t(x, train)? + y)?.leaky_relu(LEAKY_SLOPE)?;

        Ok(y)
    }
}

struct TemporalScores {
    in_nett: Conv2d,
    alphat: Tensor,
}

struct TemporalAttention {
    num_subset: usize,
    inter_channels: usize,
    num_frame: usize,
    pet: Option<PositionalEncoding>,
    attt: Tensor,
    scores: Option<TemporalScores>,
    attention0t: Option<Tensor>,
    out_nett: ConvBn,
    ff_nett: ConvBn,
    downt1: Residual,
    downt2: Residual,
    drop: Dropout,
}

impl TemporalAttention {
    fn new(config: &BlockConfig, vb: VarBuilder) -> Result<Self> {
        let BlockConfig {
            out_channels,
            inter_channels,
            num_subset,
            num_node,
            num_frame,
            kernel_size,
            stride,
            ..
        } = *config;
        let device = vb.device();
        let dtype = vb.dtype();

        let scores = if config.att_t {
            Some(TemporalScores {
                in_nett: Conv2d::new(
                    out_channels,
                    2 * num_subset * inter_channels,
                    (1, 1),
                    Conv2dConfig::default(),
                    vb.pp("in_nett"),
                )?,
                alphat: vb.get_with_hints((1, num_subset, 1, 1), "alphat", Init::Const(1.0))?,
            })
        } else {
            None
        };

        let pet = if config.use_pet {
            Some(PositionalEncoding::new(
                out_channels,
                num_node,
                num_frame,
                Domain::Temporal,
                dtype,
                device,
            )?)
        } else {
            None
        };

        let attention_shape = (1, num_subset, num_frame, num_frame);
        // identity start is written by `init::temporal_identity`
        let attention0t = if config.glo_reg_t {
            Some(vb.get_with_hints(attention_shape, "attention0t", Init::Const(0.0))?)
        } else {
            None
        };

        let ff_nett = ConvBn::new(
            out_channels,
            out_channels,
            (kernel_size, 1),
            Conv2dConfig {
                padding: ((kernel_size - 1) / 2, 0),
                stride: (stride, 1),
                ..Default::default()
            },
            vb.pp("ff_nett"),
        )?;

        Ok(Self {
            num_subset,
            inter_channels,
            num_frame,
            pet,
            attt: Tensor::zeros(attention_shape, dtype, device)?,
            scores,
            attention0t,
            out_nett: ConvBn::pointwise(out_channels * num_subset, out_channels, vb.pp("out_nett"))?,
            ff_nett,
            downt1: Residual::pointwise(
                config.needs_projection(),
                out_channels,
                out_channels,
                vb.pp("downt1"),
            )?,
            downt2: Residual::temporal(
                config.needs_projection(),
                out_channels,
                out_channels,
                kernel_size,
                stride,
                vb.pp("downt2"),
            )?,
            drop: Dropout::new(config.attentiondrop as f32),
        })
    }

    fn forward_t(&self, y: &Tensor, train: bool) -> Result<Tensor> {
        let (n, _, t, v) = y.dims4()?;
        let s = self.num_subset;
        if t != self.num_frame {
            return Err(Error::shape_mismatch(
                "temporal attention frames",
                &[self.num_frame],
                &[t],
            ));
        }

        let z = match &self.pet {
            Some(pet) => pet.forward(y)?,
            None => y.clone(),
        };

        let mut attention = self.attt.clone();
        if let Some(scores) = &self.scores {
            let ci = self.inter_channels;
            let qk = scores.in_nett.forward(&z)?.reshape((n, 2 * s, ci, t, v))?;
            let qk = temporal_affinity(&qk.narrow(1, 0, s)?, &qk.narrow(1, s, s)?)?
                .tanh()?
                .broadcast_mul(&scores.alphat)?;
            attention = attention.broadcast_add(&qk)?;
        }
        if let Some(attention0t) = &self.attention0t {
            attention = attention.broadcast_add(attention0t)?;
        }
        let attention = attention.broadcast_as((n, s, t, t))?.contiguous()?;
        let attention = self.drop.forward_t(&attention, train)?;

        let z = temporal_aggregate(y, &attention)?;
        let z = self.out_nett.forward_t(&z, train)?;
        let z = (self.downt1.forward_t(y, train)? + z)?.leaky_relu(LEAKY_SLOPE)?;
        let z = self.ff_nett.forward_t(&z, train)?;
        let z = (self.downt2.forward_t(y, train)? + z)?.leaky_relu(LEAKY_SLOPE)?;

        Ok(z)
    }
}

/// `nsctu,nsctv->nsuv` scaled by `1 / (C·T)`; queries are (N, S, C·T, U),
/// keys (N, S, C·T, V).
fn spatial_affinity(q: &Tensor, k: &Tensor) -> candle::Result<Tensor> {
    let scale = q.dim(2)? as f64;
    q.transpose(2, 3)?
        .contiguous()?
        .matmul(&k.contiguous()?)?
        .scalar_div(scale)
}

/// `nctu,uv->nctv`
fn propagate(y: &Tensor, a: &Tensor) -> candle::Result<Tensor> {
    let (n, c, t, v) = y.dims4()?;
    y.reshape((n * c * t, v))?.matmul(a)?.reshape((n, c, t, v))
}

/// Spreads the (N, S, W) window gate over the W·V query rows as
/// (N, S, W·V, 1); query row `u` takes the gate of window offset `u mod W`.
fn tile_gate(gate: &Tensor, num_node: usize) -> candle::Result<Tensor> {
    gate.repeat((1, 1, num_node))?.unsqueeze(D::Minus1)
}

/// `nctu,nsuv->nsctv`, flattened to (N, S·C, T, V).
fn spatial_aggregate(upfold: &Tensor, attention: &Tensor) -> candle::Result<Tensor> {
    let (n, c, t, u) = upfold.dims4()?;
    let (_, s, _, v) = attention.dims4()?;
    upfold
        .reshape((n, 1, c * t, u))?
        .broadcast_matmul(&attention.contiguous()?)?
        .reshape((n, s * c, t, v))
}

/// `nsctv,nscqv->nstq` scaled by `1 / (C·V)` over (N, S, C, T, V) inputs.
fn temporal_affinity(q: &Tensor, k: &Tensor) -> candle::Result<Tensor> {
    let (n, s, c, t, v) = q.dims5()?;
    let frames_first = |x: &Tensor| -> candle::Result<Tensor> {
        x.permute((0, 1, 3, 2, 4))?
            .contiguous()?
            .reshape((n, s, t, c * v))
    };
    frames_first(q)?
        .matmul(&frames_first(k)?.t()?.contiguous()?)?
        .scalar_div((c * v) as f64)
}

/// `nctv,nstq->nscqv`, flattened to (N, S·C, T, V).
fn temporal_aggregate(y: &Tensor, attention: &Tensor) -> candle::Result<Tensor> {
    let (n, c, t, v) = y.dims4()?;
    let s = attention.dim(1)?;
    y.permute((0, 1, 3, 2))?
        .contiguous()?
        .reshape((n, 1, c * v, t))?
        .broadcast_matmul(&attention.contiguous()?)?
        .reshape((n, s, c, v, t))?
        .permute((0, 1, 2, 4, 3))?
        .contiguous()?
        .reshape((n, s * c, t, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn block_config(in_channels: usize, out_channels: usize, stride: usize) -> BlockConfig {
        let config = DstaConfig {
            num_point: 25,
            num_subset: 4,
            ..Default::default()
        };
        let layer = LayerConfig {
            in_channels,
            out_channels,
            inter_channels: out_channels / 4,
            stride,
        };
        BlockConfig::from_layer(&config, &layer, 16)
    }

    #[test]
    fn masked_softmax_ignores_disconnected_joints() -> Result<()> {
        let device = Device::Cpu;
        let graph = AdjacencyGraph::new(25, 4)?;
        let a_sep = graph.a_sep_tensor(&device)?;
        let mask = GraphMask::new(&a_sep, WINDOW_SIZE)?;

        for scale in [1.0f32, 1e3, 1e6] {
            let scores = (Tensor::randn(0f32, 1.0, (2, 4, 75, 25), &device)? * scale as f64)?;
            let weights = mask.softmax(&scores)?.reshape((8, 75, 25))?.to_vec3::<f32>()?;
            let partitions = a_sep.to_vec3::<f32>()?;
            for (i, plane) in weights.iter().enumerate() {
                let partition = &partitions[i % 4];
                for (u, row) in plane.iter().enumerate() {
                    let mut total = 0.0;
                    for (v, &weight) in row.iter().enumerate() {
                        if partition[u % 25][v] <= 0.0 {
                            assert!(weight <= 1e-6, "weight {weight} leaked at ({u}, {v})");
                        }
                        total += weight;
                    }
                    assert!((total - 1.0).abs() < 1e-4);
                }
            }
        }
        Ok(())
    }

    fn values(x: &Tensor) -> Result<Vec<f32>> {
        Ok(x.flatten_all()?.to_vec1::<f32>()?)
    }

    // row-major offset of `idx` in a tensor of shape `dims`
    fn at(dims: &[usize], idx: &[usize]) -> usize {
        dims.iter().zip(idx).fold(0, |acc, (d, i)| acc * d + i)
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-4, "entry {i}: {a} != {e}");
        }
    }

    #[test]
    fn spatial_contractions_match_loops() -> Result<()> {
        let device = Device::Cpu;
        let (n, s, c, t, v, w) = (2, 2, 3, 4, 5, 3);
        let u = w * v;

        let q = Tensor::randn(0f32, 1.0, (n, s, c, t, u), &device)?;
        let k = Tensor::randn(0f32, 1.0, (n, s, c, t, v), &device)?;
        let affinity = spatial_affinity(
            &q.reshape((n, s, c * t, u))?,
            &k.reshape((n, s, c * t, v))?,
        )?;
        assert_eq!(affinity.dims4()?, (n, s, u, v));
        let (qv, kv) = (values(&q)?, values(&k)?);
        let mut expected = vec![0f32; n * s * u * v];
        for (ni, si, ui, vi) in index_grid(n, s, u, v) {
            let mut acc = 0.0;
            for ci in 0..c {
                for ti in 0..t {
                    acc += qv[at(&[n, s, c, t, u], &[ni, si, ci, ti, ui])]
                        * kv[at(&[n, s, c, t, v], &[ni, si, ci, ti, vi])];
                }
            }
            expected[at(&[n, s, u, v], &[ni, si, ui, vi])] = acc / (c * t) as f32;
        }
        assert_close(&values(&affinity)?, &expected);

        let upfold = Tensor::randn(0f32, 1.0, (n, c, t, u), &device)?;
        let attention = Tensor::randn(0f32, 1.0, (n, s, u, v), &device)?;
        let y = spatial_aggregate(&upfold, &attention)?;
        assert_eq!(y.dims4()?, (n, s * c, t, v));
        let (xv, av) = (values(&upfold)?, values(&attention)?);
        let mut expected = vec![0f32; n * s * c * t * v];
        for (ni, si, ci, ti) in index_grid(n, s, c, t) {
            for vi in 0..v {
                let acc: f32 = (0..u)
                    .map(|ui| {
                        xv[at(&[n, c, t, u], &[ni, ci, ti, ui])]
                            * av[at(&[n, s, u, v], &[ni, si, ui, vi])]
                    })
                    .sum();
                expected[at(&[n, s, c, t, v], &[ni, si, ci, ti, vi])] = acc;
            }
        }
        assert_close(&values(&y)?, &expected);

        let a = Tensor::randn(0f32, 1.0, (v, v), &device)?;
        let x = Tensor::randn(0f32, 1.0, (n, c, t, v), &device)?;
        let propagated = propagate(&x, &a)?;
        let (xv, av) = (values(&x)?, values(&a)?);
        let mut expected = vec![0f32; n * c * t * v];
        for (ni, ci, ti, vi) in index_grid(n, c, t, v) {
            expected[at(&[n, c, t, v], &[ni, ci, ti, vi])] = (0..v)
                .map(|ui| xv[at(&[n, c, t, v], &[ni, ci, ti, ui])] * av[ui * v + vi])
                .sum();
        }
        assert_close(&values(&propagated)?, &expected);
        Ok(())
    }

    #[test]
    fn gate_cycles_through_window_offsets() -> Result<()> {
        let device = Device::Cpu;
        let (s, w, v) = (2, 3, 4);
        let gate = Tensor::arange(0f32, (s * w) as f32, &device)?.reshape((1, s, w))?;
        let tiled = tile_gate(&gate, v)?;
        assert_eq!(tiled.dims4()?, (1, s, w * v, 1));
        let tiled = values(&tiled)?;
        for si in 0..s {
            for u in 0..w * v {
                assert_eq!(tiled[si * w * v + u], (si * w + u % w) as f32);
            }
        }
        Ok(())
    }

    #[test]
    fn temporal_contractions_match_loops() -> Result<()> {
        let device = Device::Cpu;
        let (n, s, c, t, v) = (2, 3, 2, 5, 4);

        let q = Tensor::randn(0f32, 1.0, (n, s, c, t, v), &device)?;
        let k = Tensor::randn(0f32, 1.0, (n, s, c, t, v), &device)?;
        let affinity = temporal_affinity(&q, &k)?;
        assert_eq!(affinity.dims4()?, (n, s, t, t));
        let (qv, kv) = (values(&q)?, values(&k)?);
        let dims = [n, s, c, t, v];
        let mut expected = vec![0f32; n * s * t * t];
        for (ni, si, ti, qi) in index_grid(n, s, t, t) {
            let mut acc = 0.0;
            for ci in 0..c {
                for vi in 0..v {
                    acc += qv[at(&dims, &[ni, si, ci, ti, vi])]
                        * kv[at(&dims, &[ni, si, ci, qi, vi])];
                }
            }
            expected[at(&[n, s, t, t], &[ni, si, ti, qi])] = acc / (c * v) as f32;
        }
        assert_close(&values(&affinity)?, &expected);

        let y = Tensor::randn(0f32, 1.0, (n, c, t, v), &device)?;
        let attention = Tensor::randn(0f32, 1.0, (n, s, t, t), &device)?;
        let z = temporal_aggregate(&y, &attention)?;
        assert_eq!(z.dims4()?, (n, s * c, t, v));
        let (yv, av) = (values(&y)?, values(&attention)?);
        let mut expected = vec![0f32; n * s * c * t * v];
        for (ni, si, ci, qi) in index_grid(n, s, c, t) {
            for vi in 0..v {
                let acc: f32 = (0..t)
                    .map(|ti| {
                        yv[at(&[n, c, t, v], &[ni, ci, ti, vi])]
                            * av[at(&[n, s, t, t], &[ni, si, ti, qi])]
                    })
                    .sum();
                expected[at(&[n, s, c, t, v], &[ni, si, ci, qi, vi])] = acc;
            }
        }
        assert_close(&values(&z)?, &expected);
        Ok(())
    }

    fn index_grid(
        a: usize,
        b: usize,
        c: usize,
        d: usize,
    ) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        (0..a).flat_map(move |i| {
            (0..b).flat_map(move |j| (0..c).flat_map(move |k| (0..d).map(move |l| (i, j, k, l))))
        })
    }

    #[test]
    fn attention_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let graph = AdjacencyGraph::new(25, 4)?;

        let same = StAttentionBlock::new(&block_config(16, 16, 1), Some(&graph), vb.pp("a"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 16, 16, 25), &device)?;
        assert_eq!(same.forward_t(&x, false)?.dims4()?, (2, 16, 16, 25));

        let down = StAttentionBlock::new(&block_config(16, 32, 2), Some(&graph), vb.pp("b"))?;
        let y = down.forward_t(&x, false)?;
        assert_eq!(y.dims4()?, (2, 32, 8, 25));
        assert_eq!(down.out_frames(16), 8);

        let values = y.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn training_mode_with_global_biases() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let graph = AdjacencyGraph::new(25, 4)?;
        let config = BlockConfig {
            glo_reg_t: true,
            attentiondrop: 0.2,
            ..block_config(16, 16, 1)
        };
        let block = StAttentionBlock::new(&config, Some(&graph), vb)?;
        let x = Tensor::randn(0f32, 1.0, (3, 16, 16, 25), &device)?;
        let y = block.forward_t(&x, true)?;
        assert_eq!(y.dims4()?, (3, 16, 16, 25));
        Ok(())
    }

    #[test]
    fn degenerates_to_plain_convolutions() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = BlockConfig {
            glo_reg_s: false,
            att_s: false,
            glo_reg_t: false,
            att_t: false,
            use_spatial_att: false,
            use_temporal_att: false,
            ..block_config(16, 32, 2)
        };
        // no graph is needed once the spatial scores are gone
        let block = StAttentionBlock::new(&config, None, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 16, 16, 25), &device)?;
        assert_eq!(block.forward_t(&x, false)?.dims4()?, (2, 32, 8, 25));

        for frames in [15, 16] {
            let x = Tensor::randn(0f32, 1.0, (1, 16, frames, 25), &device)?;
            let y = block.forward_t(&x, false)?;
            assert_eq!(y.dim(2)?, crate::config::next_num_frame(frames, 2));
        }
        Ok(())
    }

    #[test]
    fn spatial_attention_without_scores() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = BlockConfig {
            att_s: false,
            use_pes: false,
            ..block_config(16, 16, 1)
        };
        let block = StAttentionBlock::new(&config, None, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 16, 16, 25), &device)?;
        let y = block.forward_t(&x, false)?;
        assert_eq!(y.i(0)?.dims3()?, (16, 16, 25));
        Ok(())
    }

    #[test]
    fn rejects_wrong_inputs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let graph = AdjacencyGraph::new(25, 4)?;
        let block = StAttentionBlock::new(&block_config(16, 16, 1), Some(&graph), vb.pp("a"))?;

        for shape in [(1, 8, 16, 25), (1, 16, 16, 18), (1, 16, 20, 25), (1, 16, 12, 25)] {
            let x = Tensor::zeros(shape, DType::F32, &device)?;
            assert!(matches!(
                block.forward_t(&x, false),
                Err(Error::ShapeMismatch { .. })
            ));
        }

        assert!(matches!(
            StAttentionBlock::new(&block_config(16, 16, 1), None, vb.pp("b")),
            Err(Error::Config(_))
        ));
        let kinetics = AdjacencyGraph::new(18, 4)?;
        assert!(matches!(
            StAttentionBlock::new(&block_config(16, 16, 1), Some(&kinetics), vb.pp("c")),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
