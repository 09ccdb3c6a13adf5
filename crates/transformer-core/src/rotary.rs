use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::config::RotaryConfig;
use crate::error::Result;
use crate::state::{restore, LoadReport, LoadState, StateDict};

const INV_FREQ_KEY: &str = "inv_freq";

/// Produces rotary angles for each position. The inverse frequencies are a
/// derived buffer: they are never saved and never restored.
#[derive(Debug)]
pub struct RotaryEmbedding {
    dim: i64,
    base: f64,
    seq_len_interpolation_factor: Option<f64>,
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    pub fn new(config: &RotaryConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let inv_freq = Self::compute_inv_freq(config.dim, config.rotary_base, device);

        Ok(Self {
            dim: config.dim,
            base: config.rotary_base,
            seq_len_interpolation_factor: config.seq_len_interpolation_factor,
            inv_freq,
        })
    }

    // inv_freq = 1.0 / (base ^ (2j / dim))
    fn compute_inv_freq(dim: i64, base: f64, device: Device) -> Tensor {
        let base = base as f32;
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / base.powf(i as f32 / dim as f32))
            .collect();
        Tensor::from_slice(&inv_freq).to(device)
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }

    pub fn inv_freq(&self) -> &Tensor {
        &self.inv_freq
    }

    /// Casts the frequency buffer, as when the owning layer moves to half
    /// precision.
    pub fn to_kind(&mut self, kind: Kind) {
        self.inv_freq = self.inv_freq.to_kind(kind);
    }

    /// A full precision replacement for the buffer, or `None` when it is
    /// already f32. Recomputed from scratch rather than upcast so no precision
    /// lost in an earlier cast carries over.
    pub fn ensure_fp32(&self) -> Option<Tensor> {
        if self.inv_freq.kind() == Kind::Float {
            return None;
        }
        Some(Self::compute_inv_freq(self.dim, self.base, self.inv_freq.device()))
    }

    /// Rotary angles for positions `offset..offset + max_seq_len`.
    ///
    /// Returns `[max_seq_len, 1, 1, dim]`, broadcastable over batch and heads.
    /// The angle table is duplicated along the last axis so the first and
    /// second half of each head rotate by the same angles.
    ///
    /// With `use_rotary_in_fp32` a non-f32 buffer is replaced by an f32 one,
    /// and stays f32 for every later call.
    pub fn forward(&mut self, max_seq_len: i64, offset: i64, use_rotary_in_fp32: bool) -> Result<Tensor> {
        let device = self.inv_freq.device();
        let mut seq = Tensor::f_arange(max_seq_len, (Kind::Float, device))?.f_add_scalar(offset)?;
        if let Some(factor) = self.seq_len_interpolation_factor {
            seq = seq.f_to_kind(self.inv_freq.kind())?.f_mul_scalar(1.0 / factor)?;
        }

        let upgrade = if use_rotary_in_fp32 { self.ensure_fp32() } else { None };
        let freqs = match upgrade {
            Some(inv_freq) => {
                debug!(from = ?self.inv_freq.kind(), "upgrading rotary inv_freq to f32");
                self.inv_freq = inv_freq;
                seq.f_to_kind(Kind::Float)?.f_outer(&self.inv_freq)?
            }
            None => seq.f_to_kind(self.inv_freq.kind())?.f_outer(&self.inv_freq)?,
        };

        let emb = Tensor::f_cat(&[&freqs, &freqs], -1)?;
        Ok(emb.f_reshape(&[max_seq_len, 1, 1, self.dim])?)
    }
}

impl LoadState for RotaryEmbedding {
    fn named_parameters(&self) -> Vec<(&'static str, &Tensor)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        Vec::new()
    }

    /// Drops any saved `inv_freq` first: older checkpoints persisted it, and a
    /// stale copy of a different size must not block loading.
    fn load_state_dict(&mut self, state: &mut StateDict, prefix: &str) -> Result<LoadReport> {
        if state.remove(&format!("{prefix}{INV_FREQ_KEY}")).is_some() {
            debug!(%prefix, "ignoring persisted rotary inv_freq");
        }
        restore(self.named_parameters_mut(), state, prefix)
    }
}

/// Swaps the halves of the last axis and negates the new first half:
/// `[x1, x2] -> [-x2, x1]`, a quarter turn in every rotation plane.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let chunks = x.f_chunk(2, -1)?;
    let (x1, x2) = (&chunks[0], &chunks[1]);
    Ok(Tensor::f_cat(&[&x2.f_neg()?, x1], -1)?)
}

/// Rotates the leading `freqs.size().last()` channels of `t` by the angles in
/// `freqs`; remaining channels pass through.
///
/// t: [seq_len, ..., dim]
/// freqs: [seq_len, ..., rot_dim], broadcastable against t
pub fn apply_rotary_pos_emb(t: &Tensor, freqs: &Tensor) -> Result<Tensor> {
    let rot_dim = freqs.size().last().copied().unwrap_or(0);
    let dim = t.size().last().copied().unwrap_or(0);

    let t_rot = t.f_narrow(-1, 0, rot_dim)?;
    let t_pass = t.f_narrow(-1, rot_dim, dim - rot_dim)?;

    // (x * cos) + (rotate_half(x) * sin)
    let cos = t_rot.f_mul(&freqs.f_cos()?)?;
    let sin = rotate_half(&t_rot)?.f_mul(&freqs.f_sin()?)?;
    let rotated = cos.f_add(&sin)?;

    Ok(Tensor::f_cat(&[&rotated, &t_pass], -1)?)
}
