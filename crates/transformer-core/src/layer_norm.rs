use tch::{nn, Kind, Tensor};
use tracing::debug;

use crate::config::{NormConfig, NormMode};
use crate::error::Result;
use crate::kernels::{select_kernel, KernelRegistry, LayerNormKernel, RuntimeRegistry};
use crate::state::LoadState;
use crate::tensor_utils::trailing_dims;

/// LayerNorm / RMSNorm over the trailing `normalized_shape` axes, with an
/// optional one-plus weight parameterization and a persistent kernel for
/// supported hidden sizes.
#[derive(Debug)]
pub struct MixedFusedLayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
    normalized_shape: Vec<i64>,
    eps: f64,
    mode: NormMode,
    sequence_parallel: bool,
    kernel: Box<dyn LayerNormKernel>,
}

impl MixedFusedLayerNorm {
    pub fn new(vs: &nn::Path, config: &NormConfig) -> Result<Self> {
        Self::with_registry(vs, config, &RuntimeRegistry)
    }

    pub fn with_registry(
        vs: &nn::Path,
        config: &NormConfig,
        registry: &dyn KernelRegistry,
    ) -> Result<Self> {
        let mode = config.validate()?;
        let shape = config.normalized_shape.as_slice();

        // An init_weight of 0.0 means "unset" here, same as None.
        let weight_init = match (mode, config.init_weight) {
            (NormMode::LayerNorm1p, _) => 0.0,
            (_, Some(w)) if w != 0.0 => w,
            _ => 1.0,
        };
        let weight = vs.var("weight", shape, nn::Init::Const(weight_init));
        let bias = mode
            .has_bias()
            .then(|| vs.var("bias", shape, nn::Init::Const(0.0)));

        // RMS never reaches a LayerNorm kernel
        let persist = config.persist_layer_norm && mode != NormMode::Rms;
        let kernel = select_kernel(persist, shape, registry);
        debug!(?mode, kernel = kernel.name(), ?shape, "built fused layer norm");

        Ok(Self {
            weight,
            bias,
            normalized_shape: config.normalized_shape.clone(),
            eps: config.eps,
            mode,
            sequence_parallel: config.sequence_parallel,
            kernel,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn mode(&self) -> NormMode {
        self.mode
    }

    /// Whether forward runs through the persistent kernel. Always false in
    /// RMS mode.
    pub fn is_persistent(&self) -> bool {
        self.kernel.is_persistent()
    }

    pub fn normalized_shape(&self) -> &[i64] {
        &self.normalized_shape
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Parameters whose gradients need an extra all-reduce across the
    /// sequence-parallel group. Empty unless `sequence_parallel` was set.
    pub fn sequence_parallel_parameters(&self) -> Vec<&Tensor> {
        if !self.sequence_parallel {
            return Vec::new();
        }
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    /// Forward pass:
    /// input: [..., *normalized_shape]
    ///
    /// Panics when the trailing dims of `input` do not match
    /// `normalized_shape`; `f_forward` returns the error instead.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        self.f_forward(input).unwrap()
    }

    pub fn f_forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = match self.mode {
            NormMode::LayerNorm1p => self.weight.f_add_scalar(1.0)?,
            _ => self.weight.shallow_clone(),
        };

        match self.mode {
            NormMode::Rms => self.rms_norm(input, &weight),
            _ => self.kernel.forward(
                input,
                &weight,
                self.bias.as_ref(),
                &self.normalized_shape,
                self.eps,
            ),
        }
    }

    // x * (x.pow(2).mean(normalized axes) + eps).rsqrt() * w, reduced in f32
    fn rms_norm(&self, input: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let dims = trailing_dims(self.normalized_shape.len());
        let x = input.f_to_kind(Kind::Float)?;
        let norm = x
            .f_pow_tensor_scalar(2.0)?
            .f_mean_dim(Some(dims.as_slice()), true, Kind::Float)?
            .f_add_scalar(self.eps)?;

        let output = x.f_mul(&norm.f_rsqrt()?)?.f_to_kind(input.kind())?;
        Ok(output.f_mul(weight)?)
    }
}

impl nn::Module for MixedFusedLayerNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        MixedFusedLayerNorm::forward(self, xs)
    }
}

impl LoadState for MixedFusedLayerNorm {
    fn named_parameters(&self) -> Vec<(&'static str, &Tensor)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        let mut params = vec![("weight", &mut self.weight)];
        if let Some(bias) = &mut self.bias {
            params.push(("bias", bias));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::StaticRegistry;
    use tch::Device;

    fn build(config: &NormConfig) -> (nn::VarStore, MixedFusedLayerNorm) {
        let vs = nn::VarStore::new(Device::Cpu);
        let ln = MixedFusedLayerNorm::with_registry(&vs.root(), config, &StaticRegistry(false)).unwrap();
        (vs, ln)
    }

    fn all_eq(t: &Tensor, v: f64) -> bool {
        let expected = Tensor::full(t.size().as_slice(), v, (Kind::Float, Device::Cpu));
        t.allclose(&expected, 0.0, 0.0, false)
    }

    #[test]
    fn plain_init() {
        let (_vs, ln) = build(&NormConfig::new(8));
        assert_eq!(ln.mode(), NormMode::LayerNorm);
        assert!(all_eq(ln.weight(), 1.0));
        assert!(all_eq(ln.bias().unwrap(), 0.0));
    }

    #[test]
    fn one_p_init_is_zero() {
        let cfg = NormConfig {
            apply_layernorm_1p: true,
            ..NormConfig::new(8)
        };
        let (_vs, ln) = build(&cfg);
        assert!(all_eq(ln.weight(), 0.0));
        assert!(all_eq(ln.bias().unwrap(), 0.0));
    }

    #[test]
    fn rms_has_no_bias() {
        let cfg = NormConfig {
            apply_layernorm_rms: true,
            init_weight: Some(0.5),
            ..NormConfig::new(8)
        };
        let (vs, ln) = build(&cfg);
        assert!(ln.bias().is_none());
        assert!(all_eq(ln.weight(), 0.5));
        assert_eq!(vs.variables().len(), 1);
        assert_eq!(ln.state_dict("").len(), 1);
    }

    #[test]
    fn zero_init_weight_falls_back_to_ones() {
        let cfg = NormConfig {
            init_weight: Some(0.0),
            ..NormConfig::new(4)
        };
        let (_vs, ln) = build(&cfg);
        assert!(all_eq(ln.weight(), 1.0));
    }

    #[test]
    fn sequence_parallel_marks_params() {
        let (_vs, ln) = build(&NormConfig::new(4));
        assert!(ln.sequence_parallel_parameters().is_empty());

        let cfg = NormConfig {
            sequence_parallel: true,
            ..NormConfig::new(4)
        };
        let (_vs, ln) = build(&cfg);
        assert_eq!(ln.sequence_parallel_parameters().len(), 2);
    }

    #[test]
    fn multi_dim_shape() {
        let cfg = NormConfig {
            normalized_shape: vec![3, 4],
            ..Default::default()
        };
        let (_vs, ln) = build(&cfg);
        let x = Tensor::randn(&[2, 3, 4], (Kind::Float, Device::Cpu));
        let y = ln.forward(&x);
        assert_eq!(y.size(), vec![2, 3, 4]);

        let mean = y.mean_dim(Some(&[-2i64, -1][..]), false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-5);
    }
}
