//! Error types for network construction and forward passes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no skeleton topology with {0} joints (supported: 18, 25)")]
    UnsupportedJointCount(usize),

    #[error(transparent)]
    Tensor(#[from] candle::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn shape_mismatch(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
