//! LayerNorm kernel strategies and the runtime capability query that picks
//! between them.

use tch::Tensor;
use tracing::debug;

use crate::error::Result;
use crate::tensor_utils::make_viewless_tensor;

/// Hidden sizes supported by the persistent layer norm kernel. Any other
/// width falls back to the non-persistent kernel.
pub const PERSIST_LN_HIDDEN_SIZES: [i64; 24] = [
    1024, 1536, 2048, 2304, 3072, 3840, 4096, 5120, 6144, 8192, 10240, 12288, 12800, 15360, 16384,
    18432, 20480, 24576, 25600, 30720, 32768, 40960, 49152, 65536,
];

/// Setting this variable (to anything) hides the persistent kernel from
/// `RuntimeRegistry`.
pub const NO_PERSIST_ENV: &str = "NO_PERSIST_LAYER_NORM";

/// Answers which optional fused kernels the current runtime provides.
pub trait KernelRegistry {
    fn has_persistent_layer_norm(&self) -> bool;
}

/// Queries the live libtorch runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeRegistry;

impl KernelRegistry for RuntimeRegistry {
    fn has_persistent_layer_norm(&self) -> bool {
        std::env::var_os(NO_PERSIST_ENV).is_none() && tch::Cuda::is_available()
    }
}

/// Fixed answer, for callers that already know the capability.
#[derive(Debug, Clone, Copy)]
pub struct StaticRegistry(pub bool);

impl KernelRegistry for StaticRegistry {
    fn has_persistent_layer_norm(&self) -> bool {
        self.0
    }
}

pub trait LayerNormKernel: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn is_persistent(&self) -> bool;

    /// LayerNorm over the trailing `normalized_shape` axes of `input`.
    fn forward(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        normalized_shape: &[i64],
        eps: f64,
    ) -> Result<Tensor>;
}

/// General-purpose kernel, any normalized shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonPersistentLayerNorm;

impl LayerNormKernel for NonPersistentLayerNorm {
    fn name(&self) -> &'static str {
        "non-persistent"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn forward(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        normalized_shape: &[i64],
        eps: f64,
    ) -> Result<Tensor> {
        Ok(input.f_layer_norm(normalized_shape, Some(weight), bias, eps, true)?)
    }
}

/// Row-wise kernel over a single hidden width. The input is processed as
/// `[rows, hidden]` and the result handed back as a materialized tensor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PersistentLayerNorm;

impl LayerNormKernel for PersistentLayerNorm {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn forward(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        normalized_shape: &[i64],
        eps: f64,
    ) -> Result<Tensor> {
        let hidden: i64 = normalized_shape.iter().product();
        let rows = input.f_reshape(&[-1, hidden])?;
        let (output, _mean, _rstd) = rows.f_native_layer_norm(&[hidden], Some(weight), bias, eps)?;
        let output = output.f_view(input.size().as_slice())?;

        // the reshape back yields a view of the kernel output
        Ok(make_viewless_tensor(&output, input.requires_grad(), true))
    }
}

pub fn is_persist_supported(normalized_shape: &[i64]) -> bool {
    match normalized_shape {
        [width] => PERSIST_LN_HIDDEN_SIZES.contains(width),
        _ => false,
    }
}

/// Picks the kernel once per module. The persistent kernel is used only when
/// requested, supported for this width and present in the runtime.
pub fn select_kernel(
    requested_persistent: bool,
    normalized_shape: &[i64],
    registry: &dyn KernelRegistry,
) -> Box<dyn LayerNormKernel> {
    if !requested_persistent {
        return Box::new(NonPersistentLayerNorm);
    }
    if !is_persist_supported(normalized_shape) {
        debug!(?normalized_shape, "persistent layer norm unsupported for shape, falling back");
        return Box::new(NonPersistentLayerNorm);
    }
    if !registry.has_persistent_layer_norm() {
        debug!("persistent layer norm kernel unavailable, falling back");
        return Box::new(NonPersistentLayerNorm);
    }
    Box::new(PersistentLayerNorm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn selection_policy() {
        let yes = StaticRegistry(true);
        let no = StaticRegistry(false);

        assert!(select_kernel(true, &[1024], &yes).is_persistent());
        assert!(!select_kernel(false, &[1024], &yes).is_persistent());
        assert!(!select_kernel(true, &[1024], &no).is_persistent());
        assert!(!select_kernel(true, &[777], &yes).is_persistent());
        assert!(!select_kernel(true, &[2, 1024], &yes).is_persistent());
    }

    #[test]
    fn allow_list_membership() {
        assert!(is_persist_supported(&[65536]));
        assert!(is_persist_supported(&[12800]));
        assert!(!is_persist_supported(&[1000]));
        assert!(!is_persist_supported(&[]));
    }

    #[test]
    fn kernels_agree() {
        let x = Tensor::randn(&[3, 5, 16], (Kind::Float, Device::Cpu));
        let w = Tensor::randn(&[16], (Kind::Float, Device::Cpu));
        let b = Tensor::randn(&[16], (Kind::Float, Device::Cpu));

        let a = NonPersistentLayerNorm.forward(&x, &w, Some(&b), &[16], 1e-5).unwrap();
        let p = PersistentLayerNorm.forward(&x, &w, Some(&b), &[16], 1e-5).unwrap();
        assert_eq!(p.size(), vec![3, 5, 16]);
        assert!(a.allclose(&p, 1e-5, 1e-5, false));
    }

    #[test]
    fn kernels_report_shape_errors() {
        let x = Tensor::randn(&[3, 12], (Kind::Float, Device::Cpu));
        let w = Tensor::ones(&[16], (Kind::Float, Device::Cpu));

        assert!(NonPersistentLayerNorm.forward(&x, &w, None, &[16], 1e-5).is_err());
        assert!(PersistentLayerNorm.forward(&x, &w, None, &[16], 1e-5).is_err());
    }

    #[test]
    fn env_override_hides_persistent_kernel() {
        std::env::set_var(NO_PERSIST_ENV, "1");
        let available = RuntimeRegistry.has_persistent_layer_norm();
        std::env::remove_var(NO_PERSIST_ENV);

        assert!(!available);
    }
}
