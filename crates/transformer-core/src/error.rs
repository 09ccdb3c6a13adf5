use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Cannot apply both 1p and rms layernorm")]
    OnePAndRms,

    #[error("Cannot combine init_weight {0} with 1p layernorm")]
    InitWeightWith1p(f64),

    #[error("Rotary dim must be positive and even, got {0}")]
    InvalidRotaryDim(i64),

    #[error("Rotary base must be finite and greater than 1, got {0}")]
    InvalidRotaryBase(f64),

    #[error("Sequence length interpolation factor must be positive, got {0}")]
    InvalidInterpolationFactor(f64),

    #[error("Normalized shape must be non-empty with positive dims, got {0:?}")]
    InvalidNormalizedShape(Vec<i64>),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, LayerError>;
