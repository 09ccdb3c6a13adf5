use tch::Tensor;

/// Axis list `[-n, .., -1]` covering the last `n` dimensions.
pub fn trailing_dims(n: usize) -> Vec<i64> {
    (1..=n as i64).rev().map(|d| -d).collect()
}

/// Returns a freshly allocated copy of `inp` that is not a view of any other
/// tensor. Pipeline schedules free activation storage after the forward pass
/// and cannot do so for views.
///
/// With `keep_graph` the copy stays attached to the autograd graph so
/// gradients flow back into `inp`; otherwise it is detached and carries
/// `requires_grad` as given.
pub fn make_viewless_tensor(inp: &Tensor, requires_grad: bool, keep_graph: bool) -> Tensor {
    if keep_graph {
        inp.copy()
    } else {
        inp.detach().copy().set_requires_grad(requires_grad)
    }
}
