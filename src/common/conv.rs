use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, VarBuilder, init::Init};

use crate::common::tensor_ext::TensorExt;

#[derive(Debug, Clone, Copy)]
pub struct Conv2dConfig {
    pub padding: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: usize,
    pub groups: usize,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            padding: (0, 0),
            stride: (1, 1),
            dilation: 1,
            groups: 1,
        }
    }
}

/// 2D convolution over (batch, channel, height, width) with independent
/// height/width padding and stride.
#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    kernel_size: (usize, usize),
    config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        config: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (
                out_channels,
                in_channels / config.groups,
                kernel_size.0,
                kernel_size.1,
            ),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = match vb.get_with_hints(out_channels, "bias", Init::Const(0.0)) {
            Ok(bias) => Some(bias),
            Err(candle::Error::CannotFindTensor { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            weight,
            bias,
            kernel_size,
            config,
        })
    }

    pub fn out_size(&self, in_height: usize, in_width: usize) -> (usize, usize) {
        let (kernel_height, kernel_width) = self.kernel_size;
        let c = &self.config;
        let out_height =
            (in_height + 2 * c.padding.0 - c.dilation * (kernel_height - 1) - 1) / c.stride.0 + 1;
        let out_width =
            (in_width + 2 * c.padding.1 - c.dilation * (kernel_width - 1) - 1) / c.stride.1 + 1;
        (out_height, out_width)
    }
}

impl Module for Conv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let Conv2dConfig {
            padding,
            stride,
            dilation,
            groups,
        } = self.config;

        // candle only exposes square padding/stride, so the uneven cases are
        // handled by explicit zero padding and subsampling a stride-1 result.
        let x = if padding.0 == padding.1 {
            x.clone()
        } else {
            x.pad_with_zeros(2, padding.0, padding.0)?
                .pad_with_zeros(3, padding.1, padding.1)?
        };
        let padding = if padding.0 == padding.1 { padding.0 } else { 0 };

        let x = if stride.0 == stride.1 {
            x.conv2d(&self.weight, padding, stride.0, dilation, groups)?
        } else {
            x.conv2d(&self.weight, padding, 1, dilation, groups)?
                .subsample(2, stride.0)?
                .subsample(3, stride.1)?
        };

        match &self.bias {
            None => Ok(x),
            Some(bias) => {
                let b = bias.dims1()?;
                let bias = bias.reshape((1, b, 1, 1))?;
                x.broadcast_add(&bias)
            }
        }
    }
}

/// Convolution followed by batch normalization, stored as `{prefix}.0` and
/// `{prefix}.1`.
#[derive(Clone, Debug)]
pub struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        config: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = Conv2d::new(in_channels, out_channels, kernel_size, config, vb.pp("0"))?;
        let bn = candle_nn::batch_norm(out_channels, BatchNormConfig::default(), vb.pp("1"))?;
        Ok(Self { conv, bn })
    }

    pub fn pointwise(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(
            in_channels,
            out_channels,
            (1, 1),
            Conv2dConfig::default(),
            vb,
        )
    }

    pub fn out_size(&self, in_height: usize, in_width: usize) -> (usize, usize) {
        self.conv.out_size(in_height, in_width)
    }
}

impl ModuleT for ConvBn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.bn.forward_t(&x, train)
    }
}

/// Shortcut branch of a residual connection.
#[derive(Clone, Debug)]
pub enum Residual {
    Identity,
    Projection(ConvBn),
}

impl Residual {
    /// 1x1 projection, used when the channel count or the stride changes.
    pub fn pointwise(
        project: bool,
        in_channels: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !project {
            return Ok(Self::Identity);
        }
        Ok(Self::Projection(ConvBn::pointwise(
            in_channels,
            out_channels,
            vb,
        )?))
    }

    /// (kernel x 1) projection that also applies the temporal stride.
    pub fn temporal(
        project: bool,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !project {
            return Ok(Self::Identity);
        }
        let config = Conv2dConfig {
            padding: ((kernel_size - 1) / 2, 0),
            stride: (stride, 1),
            ..Default::default()
        };
        let proj = ConvBn::new(in_channels, out_channels, (kernel_size, 1), config, vb)?;
        Ok(Self::Projection(proj))
    }
}

impl ModuleT for Residual {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Projection(proj) => proj.forward_t(x, train),
        }
    }
}
