//! Parameter initialisation helpers for freshly created networks.

use candle::Tensor;
use candle_nn::VarMap;
use tracing::debug;

use crate::error::{Error, Result};

const TEMPORAL_BIAS: &str = "attention0t";

/// Resets every global temporal attention bias (`attention0t`) in `varmap`
/// to one identity matrix per subset, so a new network starts out attending
/// each frame to itself. Returns the number of tensors written.
pub fn temporal_identity(varmap: &VarMap) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::config("parameter store lock is poisoned"))?;

    let mut written = 0;
    for (name, var) in data.iter() {
        if !name.ends_with(TEMPORAL_BIAS) {
            continue;
        }
        let (one, num_subset, frames, frames_k) = var.dims4()?;
        if frames != frames_k {
            return Err(Error::shape_mismatch(
                "temporal attention bias",
                &[one, num_subset, frames, frames],
                var.dims(),
            ));
        }
        let eye: Vec<f32> = (0..frames * frames)
            .map(|i| if i / frames == i % frames { 1.0 } else { 0.0 })
            .collect();
        let eye = Tensor::from_vec(eye, (1, 1, frames, frames), var.device())?
            .to_dtype(var.dtype())?
            .repeat((one, num_subset, 1, 1))?;
        var.set(&eye)?;
        debug!(name = name.as_str(), frames, "initialised temporal bias");
        written += 1;
    }
    Ok(written)
}
