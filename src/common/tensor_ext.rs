use candle::{Result, Tensor, shape::Dim};

pub trait TensorExt {
    fn size(&self, dim: usize) -> usize;
    fn scalar_mul(&self, value: f64) -> Result<Tensor>;
    fn scalar_div(&self, value: f64) -> Result<Tensor>;
    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor>;
    fn sigmoid(&self) -> Result<Tensor>;
    fn leaky_relu(&self, negative_slope: f64) -> Result<Tensor>;
    fn subsample<D: Dim>(&self, dim: D, step: usize) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn size(&self, dim: usize) -> usize {
        self.dims()[dim]
    }

    fn scalar_mul(&self, value: f64) -> Result<Tensor> {
        self * value
    }

    fn scalar_div(&self, value: f64) -> Result<Tensor> {
        self / value
    }

    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor> {
        candle_nn::ops::softmax(self, dim)
    }

    fn sigmoid(&self) -> Result<Tensor> {
        candle_nn::ops::sigmoid(self)
    }

    // valid for slopes in [0, 1]
    fn leaky_relu(&self, negative_slope: f64) -> Result<Tensor> {
        self.maximum(&self.scalar_mul(negative_slope)?)
    }

    /// Keeps every `step`-th element along `dim`, starting at index 0.
    fn subsample<D: Dim>(&self, dim: D, step: usize) -> Result<Tensor> {
        if step == 1 {
            return Ok(self.clone());
        }
        let dim = dim.to_index(self.shape(), "subsample")?;
        let len = self.dims()[dim];
        let indexes = Tensor::arange_step(0u32, len as u32, step as u32, self.device())?;
        self.index_select(&indexes, dim)
    }
}
