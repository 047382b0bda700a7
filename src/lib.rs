//! Decoupled spatial-temporal attention network (DSTA-Net) for
//! skeleton-based action recognition, built on candle.
//!
//! A clip of `M` people with `V` joints over `T` frames, laid out as
//! `(N, M, C, T, V)`, is classified into `num_class` logits by a stack of
//! [`dsta::block::StAttentionBlock`]s.

pub mod common;
pub mod config;
pub mod dsta;
pub mod error;
pub mod graph;
pub mod init;

pub use config::{DstaConfig, LayerConfig};
pub use dsta::{
    DstaNet,
    block::{BlockConfig, StAttentionBlock},
    positional::{Domain, PositionalEncoding},
    unfold::UnfoldTemporalWindows,
};
pub use error::{Error, Result};
pub use graph::{AdjacencyGraph, Topology};
