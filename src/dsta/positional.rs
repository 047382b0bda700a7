use candle::{DType, Device, IndexOp, Tensor};

use crate::{
    common::tensor_ext::TensorExt,
    error::{Error, Result},
};

const MAX_TIMESCALE: f64 = 10000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Position is the frame index.
    Temporal,
    /// Position is the joint index.
    Spatial,
}

/// Fixed sinusoidal table of shape (1, channel, time, joint).
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    channel: usize,
    joint_num: usize,
    time_len: usize,
    pe: Tensor,
}

impl PositionalEncoding {
    pub fn new(
        channel: usize,
        joint_num: usize,
        time_len: usize,
        domain: Domain,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if channel == 0 || channel % 2 != 0 {
            return Err(Error::config(format!(
                "positional encoding needs an even channel count, got {channel}"
            )));
        }

        let positions: Vec<f32> = (0..time_len)
            .flat_map(|t| {
                (0..joint_num).map(move |v| match domain {
                    Domain::Temporal => t as f32,
                    Domain::Spatial => v as f32,
                })
            })
            .collect();
        let positions = Tensor::from_vec(positions, (time_len * joint_num, 1), device)?;

        let div_term = Tensor::arange_step(0u32, channel as u32, 2, device)?
            .to_dtype(DType::F32)?
            .scalar_mul(-MAX_TIMESCALE.ln() / channel as f64)?
            .exp()?
            .unsqueeze(0)?;

        // stacking on a trailing axis interleaves sin (even) and cos (odd)
        let p_x_d = positions.broadcast_mul(&div_term)?;
        let pe = Tensor::stack(&[p_x_d.sin()?, p_x_d.cos()?], 2)?
            .reshape((time_len, joint_num, channel))?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .to_dtype(dtype)?
            .contiguous()?;

        Ok(Self {
            channel,
            joint_num,
            time_len,
            pe,
        })
    }

    pub fn table(&self) -> &Tensor {
        &self.pe
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, t, v) = x.dims4()?;
        if c != self.channel || v != self.joint_num || t > self.time_len {
            return Err(Error::shape_mismatch(
                "positional encoding",
                &[n, self.channel, self.time_len, self.joint_num],
                &[n, c, t, v],
            ));
        }
        let pe = self.pe.i((.., .., ..t, ..))?;
        Ok(x.broadcast_add(&pe)?)
    }
}
