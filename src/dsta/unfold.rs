use candle::{Tensor, D};

use crate::{
    common::tensor_ext::TensorExt,
    error::{Error, Result},
};

/// Gathers a local window of frames for every time step and lays the
/// windows out along the joint axis: (N, C, T, V) -> (N, C, T', W * V).
///
/// The trailing axis is window-major, so index `w * V + v` holds joint `v`
/// from window offset `w`.
#[derive(Debug, Clone, Copy)]
pub struct UnfoldTemporalWindows {
    window_size: usize,
    window_stride: usize,
    window_dilation: usize,
    padding: usize,
}

impl UnfoldTemporalWindows {
    pub fn new(window_size: usize, window_stride: usize, window_dilation: usize) -> Result<Self> {
        if window_size == 0 || window_stride == 0 || window_dilation == 0 {
            return Err(Error::config(format!(
                "window size, stride and dilation must be positive, got \
                 {window_size}, {window_stride} and {window_dilation}"
            )));
        }
        let padding = (window_size + (window_size - 1) * (window_dilation - 1) - 1) / 2;
        Ok(Self {
            window_size,
            window_stride,
            window_dilation,
            padding,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Frames after unfolding, or `None` when the padded clip is shorter
    /// than one dilated window.
    pub fn out_frames(&self, frames: usize) -> Option<usize> {
        (frames + 2 * self.padding)
            .checked_sub(self.extent())
            .map(|room| room / self.window_stride + 1)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, t, v) = x.dims4()?;
        let out_frames = self.out_frames(t).ok_or_else(|| {
            let min_frames = self.extent().saturating_sub(2 * self.padding);
            Error::shape_mismatch(
                "temporal window unfold",
                &[n, c, min_frames, v],
                &[n, c, t, v],
            )
        })?;
        let span = (out_frames - 1) * self.window_stride + 1;

        let x = x.pad_with_zeros(2, self.padding, self.padding)?;
        let windows = (0..self.window_size)
            .map(|w| {
                x.narrow(2, w * self.window_dilation, span)?
                    .subsample(2, self.window_stride)
            })
            .collect::<candle::Result<Vec<_>>>()?;

        Ok(Tensor::cat(&windows, D::Minus1)?)
    }

    fn extent(&self) -> usize {
        self.window_dilation * (self.window_size - 1) + 1
    }
}
