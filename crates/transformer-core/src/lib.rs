pub mod config;
pub mod error;
pub mod kernels;
pub mod layer_norm;
pub mod rotary;
pub mod state;
pub mod tensor_utils;

pub use config::{NormConfig, NormMode, RotaryConfig};
pub use error::{LayerError, Result};
pub use kernels::{KernelRegistry, RuntimeRegistry, StaticRegistry};
pub use layer_norm::MixedFusedLayerNorm;
pub use rotary::{apply_rotary_pos_emb, rotate_half, RotaryEmbedding};
pub use state::{LoadReport, LoadState, StateDict};
