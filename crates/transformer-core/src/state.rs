use std::collections::HashMap;

use tch::Tensor;
use tracing::debug;

use crate::error::{LayerError, Result};

/// Named tensors keyed by their full dotted path, e.g. `layers.0.ln.weight`.
pub type StateDict = HashMap<String, Tensor>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

/// Save/restore of a module's persistent tensors.
pub trait LoadState {
    fn named_parameters(&self) -> Vec<(&'static str, &Tensor)>;

    fn named_parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)>;

    fn state_dict(&self, prefix: &str) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (format!("{prefix}{name}"), t.shallow_clone()))
            .collect()
    }

    /// Consumes the entries under `prefix` from `state`.
    fn load_state_dict(&mut self, state: &mut StateDict, prefix: &str) -> Result<LoadReport> {
        restore(self.named_parameters_mut(), state, prefix)
    }
}

/// Copies `{prefix}{name}` entries into the matching parameters without
/// recording gradients. Every shape is checked before anything is copied, so
/// a failed restore leaves both the parameters and `state` untouched.
///
/// Direct children of `prefix` that match no parameter are reported as
/// unexpected and removed. Nested keys (`{prefix}child.name`) belong to
/// submodules and are left in place.
pub fn restore(
    params: Vec<(&'static str, &mut Tensor)>,
    state: &mut StateDict,
    prefix: &str,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut matched = Vec::with_capacity(params.len());

    for (name, param) in params {
        let key = format!("{prefix}{name}");
        let Some(src) = state.get(&key) else {
            report.missing_keys.push(key);
            continue;
        };
        if src.size() != param.size() {
            return Err(LayerError::ShapeMismatch {
                name: key,
                expected: param.size(),
                actual: src.size(),
            });
        }
        matched.push((key, param));
    }

    for (key, param) in matched {
        if let Some(src) = state.remove(&key) {
            tch::no_grad(|| param.f_copy_(&src))?;
            debug!(%key, "restored tensor");
        }
    }

    let mut unexpected: Vec<String> = state
        .keys()
        .filter(|k| is_direct_child(k, prefix))
        .cloned()
        .collect();
    unexpected.sort();
    for key in &unexpected {
        state.remove(key);
    }
    report.unexpected_keys = unexpected;

    Ok(report)
}

fn is_direct_child(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('.'))
}
