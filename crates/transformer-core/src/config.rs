use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};

fn default_rotary_base() -> f64 {
    10000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotaryConfig {
    /// Number of rotated channels per head. Must be even.
    pub dim: i64,
    /// Positions are divided by this factor before computing angles
    /// (linear position interpolation for long-context extension).
    #[serde(default)]
    pub seq_len_interpolation_factor: Option<f64>,
    /// Frequency base, 10000 in the RoFormer formulation.
    #[serde(default = "default_rotary_base")]
    pub rotary_base: f64,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dim: 64,
            seq_len_interpolation_factor: None,
            rotary_base: default_rotary_base(),
        }
    }
}

impl RotaryConfig {
    pub fn new(dim: i64) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    /// Rotates only the leading `rotary_percent` of each head; the rest of the
    /// channels pass through `apply_rotary_pos_emb` untouched.
    pub fn from_head_dim(head_dim: i64, rotary_percent: f64) -> Self {
        let dim = (head_dim as f64 * rotary_percent) as i64;
        Self::new(dim - dim % 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim <= 0 || self.dim % 2 != 0 {
            return Err(LayerError::InvalidRotaryDim(self.dim));
        }
        if !(self.rotary_base.is_finite() && self.rotary_base > 1.0) {
            return Err(LayerError::InvalidRotaryBase(self.rotary_base));
        }
        if let Some(factor) = self.seq_len_interpolation_factor {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(LayerError::InvalidInterpolationFactor(factor));
            }
        }
        Ok(())
    }
}

/// Which normalization a `MixedFusedLayerNorm` computes. Chosen once from the
/// flags of a `NormConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormMode {
    /// `(x - mean) / sqrt(var + eps) * w + b`
    LayerNorm,
    /// LayerNorm with the weight stored as an offset from one.
    LayerNorm1p,
    /// `x / sqrt(mean(x^2) + eps) * w`, no bias.
    Rms,
}

impl NormMode {
    pub fn has_bias(self) -> bool {
        !matches!(self, NormMode::Rms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormConfig {
    /// Trailing dimensions normalized over.
    pub normalized_shape: Vec<i64>,
    pub eps: f64,
    /// Request the persistent kernel. Ignored when the width is unsupported or
    /// the runtime lacks the kernel.
    #[serde(default)]
    pub persist_layer_norm: bool,
    /// Marks weight and bias for sequence-parallel gradient reduction.
    #[serde(default)]
    pub sequence_parallel: bool,
    #[serde(default)]
    pub apply_layernorm_1p: bool,
    #[serde(default)]
    pub apply_layernorm_rms: bool,
    #[serde(default)]
    pub init_weight: Option<f64>,
}

impl Default for NormConfig {
    fn default() -> Self {
        Self {
            normalized_shape: vec![1024],
            eps: 1e-5,
            persist_layer_norm: false,
            sequence_parallel: false,
            apply_layernorm_1p: false,
            apply_layernorm_rms: false,
            init_weight: None,
        }
    }
}

impl NormConfig {
    pub fn new(hidden_size: i64) -> Self {
        Self {
            normalized_shape: vec![hidden_size],
            ..Default::default()
        }
    }

    /// Folds the mode flags into a `NormMode`, rejecting invalid combinations.
    pub fn mode(&self) -> Result<NormMode> {
        if self.apply_layernorm_1p && self.apply_layernorm_rms {
            return Err(LayerError::OnePAndRms);
        }
        if self.apply_layernorm_1p {
            if let Some(w) = self.init_weight {
                return Err(LayerError::InitWeightWith1p(w));
            }
            return Ok(NormMode::LayerNorm1p);
        }
        if self.apply_layernorm_rms {
            return Ok(NormMode::Rms);
        }
        Ok(NormMode::LayerNorm)
    }

    pub fn validate(&self) -> Result<NormMode> {
        if self.normalized_shape.is_empty() || self.normalized_shape.iter().any(|&d| d <= 0) {
            return Err(LayerError::InvalidNormalizedShape(self.normalized_shape.clone()));
        }
        self.mode()
    }

    /// The width used against the persistent kernel allow-list. Only a single
    /// normalized dimension has one.
    pub fn hidden_width(&self) -> Option<i64> {
        match self.normalized_shape.as_slice() {
            [width] => Some(*width),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags() {
        let mut cfg = NormConfig::new(16);
        assert_eq!(cfg.mode().unwrap(), NormMode::LayerNorm);

        cfg.apply_layernorm_rms = true;
        assert_eq!(cfg.mode().unwrap(), NormMode::Rms);
        assert!(!NormMode::Rms.has_bias());

        cfg.apply_layernorm_1p = true;
        assert!(matches!(cfg.mode(), Err(LayerError::OnePAndRms)));

        cfg.apply_layernorm_rms = false;
        assert_eq!(cfg.mode().unwrap(), NormMode::LayerNorm1p);

        cfg.init_weight = Some(0.0);
        assert!(matches!(cfg.mode(), Err(LayerError::InitWeightWith1p(_))));
    }

    #[test]
    fn init_weight_allowed_with_rms() {
        let cfg = NormConfig {
            apply_layernorm_rms: true,
            init_weight: Some(0.5),
            ..NormConfig::new(8)
        };
        assert_eq!(cfg.validate().unwrap(), NormMode::Rms);
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut cfg = NormConfig::new(0);
        assert!(matches!(cfg.validate(), Err(LayerError::InvalidNormalizedShape(_))));
        cfg.normalized_shape.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hidden_width_only_for_single_dim() {
        assert_eq!(NormConfig::new(2048).hidden_width(), Some(2048));
        let cfg = NormConfig {
            normalized_shape: vec![32, 64],
            ..Default::default()
        };
        assert_eq!(cfg.hidden_width(), None);
    }

    #[test]
    fn rotary_validation() {
        assert!(RotaryConfig::new(8).validate().is_ok());
        assert!(matches!(
            RotaryConfig::new(7).validate(),
            Err(LayerError::InvalidRotaryDim(7))
        ));
        assert!(RotaryConfig::new(0).validate().is_err());

        let cfg = RotaryConfig {
            seq_len_interpolation_factor: Some(0.0),
            ..RotaryConfig::new(8)
        };
        assert!(matches!(
            cfg.validate(),
            Err(LayerError::InvalidInterpolationFactor(_))
        ));
    }

    #[test]
    fn rotary_base_validation() {
        for base in [0.0, -10.0, 1.0, f64::NAN, f64::INFINITY] {
            let cfg = RotaryConfig {
                rotary_base: base,
                ..RotaryConfig::new(8)
            };
            assert!(matches!(cfg.validate(), Err(LayerError::InvalidRotaryBase(_))), "base {base}");
        }

        let cfg = RotaryConfig {
            rotary_base: 500000.0,
            ..RotaryConfig::new(8)
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rotary_percent_rounds_to_even() {
        assert_eq!(RotaryConfig::from_head_dim(128, 0.5).dim, 64);
        assert_eq!(RotaryConfig::from_head_dim(10, 0.5).dim, 4);
        assert_eq!(RotaryConfig::from_head_dim(64, 1.0).dim, 64);
    }

    #[test]
    fn yaml_defaults() {
        let cfg: NormConfig = serde_yaml::from_str("normalized_shape: [512]\neps: 1.0e-6\n").unwrap();
        assert_eq!(cfg.normalized_shape, vec![512]);
        assert!(!cfg.persist_layer_norm);
        assert!(cfg.init_weight.is_none());

        let rot: RotaryConfig = serde_yaml::from_str("dim: 32\n").unwrap();
        assert_eq!(rot.rotary_base, 10000.0);
    }
}
