use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Adapter weights as they appear on disk. Both conventions normalize to
/// the same additive-delta contract before composition.
#[derive(Debug, Clone)]
pub enum AdapterWeights {
    /// Pre-merged full delta matrix.
    Merged { delta: Array2<f32> },
    /// Low-rank factor pair; the effective delta is `up · down`.
    Factored {
        up: Array2<f32>,
        down: Array2<f32>,
    },
}

impl AdapterWeights {
    /// Shape of the delta this adapter produces for its target tensor.
    pub fn target_shape(&self) -> (usize, usize) {
        match self {
            Self::Merged { delta } => delta.dim(),
            Self::Factored { up, down } => (up.nrows(), down.ncols()),
        }
    }

    fn to_delta(&self) -> Array2<f32> {
        match self {
            Self::Merged { delta } => delta.clone(),
            Self::Factored { up, down } => up.dot(down),
        }
    }

    fn rank_mismatch(&self) -> Option<(usize, usize)> {
        match self {
            Self::Merged { .. } => None,
            Self::Factored { up, down } => {
                (up.ncols() != down.nrows()).then(|| (up.ncols(), down.nrows()))
            }
        }
    }
}

/// A loaded adapter: named deltas keyed by the base tensor they target.
#[derive(Debug, Clone)]
pub struct AdapterDelta {
    pub name: String,
    pub tensors: Vec<(String, AdapterWeights)>,
}

/// Base model weights (the subset adapters can target).
#[derive(Debug, Clone, PartialEq)]
pub struct BaseWeights {
    tensors: BTreeMap<String, Array2<f32>>,
}

impl BaseWeights {
    pub fn new() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Array2<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn tensor(&self, name: &str) -> Option<&Array2<f32>> {
        self.tensors.get(name)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Mean over every element of every tensor; 0.0 for an empty set.
    pub fn mean(&self) -> f32 {
        let (sum, count) = self
            .tensors
            .values()
            .fold((0.0f32, 0usize), |(sum, count), tensor| {
                (sum + tensor.sum(), count + tensor.len())
            });
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    }
}

impl Default for BaseWeights {
    fn default() -> Self {
        Self::new()
    }
}

/// Base weights with an ordered adapter stack applied.
pub type EffectiveModel = BaseWeights;

/// Apply each adapter's delta onto the base weights, scaled by its
/// coefficient, in the order given. Deltas are additive: two adapters
/// targeting the same tensor both contribute, last one does not replace.
/// Deterministic: same base, same ordered list, same scales, same result.
pub fn compose(base: &BaseWeights, adapters: &[(AdapterDelta, f32)]) -> Result<EffectiveModel> {
    // Validate every adapter against the base before mutating anything, so
    // a failing adapter cannot leave a half-composed model.
    for (adapter, _) in adapters {
        for (target, weights) in &adapter.tensors {
            let Some(base_tensor) = base.tensor(target) else {
                return Err(EngineError::IncompatibleAdapter {
                    adapter: adapter.name.clone(),
                    tensor: target.clone(),
                    expected: Vec::new(),
                    actual: shape_vec(weights.target_shape()),
                });
            };

            if let Some((up_cols, down_rows)) = weights.rank_mismatch() {
                return Err(EngineError::IncompatibleAdapter {
                    adapter: adapter.name.clone(),
                    tensor: target.clone(),
                    expected: vec![up_cols],
                    actual: vec![down_rows],
                });
            }

            if weights.target_shape() != base_tensor.dim() {
                return Err(EngineError::IncompatibleAdapter {
                    adapter: adapter.name.clone(),
                    tensor: target.clone(),
                    expected: shape_vec(base_tensor.dim()),
                    actual: shape_vec(weights.target_shape()),
                });
            }
        }
    }

    let mut effective = base.clone();
    for (adapter, scale) in adapters {
        for (target, weights) in &adapter.tensors {
            let delta = weights.to_delta();
            let tensor = effective
                .tensors
                .get_mut(target)
                .expect("validated above");
            tensor.scaled_add(*scale, &delta);
        }
        debug!(
            adapter = %adapter.name,
            scale,
            tensors = adapter.tensors.len(),
            "Applied adapter delta"
        );
    }

    Ok(effective)
}

fn shape_vec(dim: (usize, usize)) -> Vec<usize> {
    vec![dim.0, dim.1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};

    fn base_2x2() -> BaseWeights {
        let mut base = BaseWeights::new();
        base.insert("blocks.0.attn.qkv", arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        base.insert("blocks.0.ffn.w1", Array2::zeros((2, 2)));
        base
    }

    fn merged(name: &str, target: &str, delta: Array2<f32>) -> AdapterDelta {
        AdapterDelta {
            name: name.into(),
            tensors: vec![(target.into(), AdapterWeights::Merged { delta })],
        }
    }

    #[test]
    fn single_adapter_scales_delta() {
        let base = base_2x2();
        let adapter = merged("x", "blocks.0.attn.qkv", arr2(&[[2.0, 0.0], [0.0, 2.0]]));

        let out = compose(&base, &[(adapter, 0.5)]).unwrap();
        let tensor = out.tensor("blocks.0.attn.qkv").unwrap();
        assert_eq!(tensor, &arr2(&[[2.0, 2.0], [3.0, 5.0]]));
        // Untargeted tensors untouched.
        assert_eq!(
            out.tensor("blocks.0.ffn.w1").unwrap(),
            &Array2::<f32>::zeros((2, 2))
        );
    }

    #[test]
    fn factored_matches_equivalent_merged() {
        let base = base_2x2();
        let up = arr2(&[[1.0], [2.0]]);
        let down = arr2(&[[3.0, 4.0]]);
        let expected_delta = up.dot(&down);

        let factored = AdapterDelta {
            name: "f".into(),
            tensors: vec![(
                "blocks.0.attn.qkv".into(),
                AdapterWeights::Factored { up, down },
            )],
        };
        let merged = merged("m", "blocks.0.attn.qkv", expected_delta);

        let out_f = compose(&base, &[(factored, 0.7)]).unwrap();
        let out_m = compose(&base, &[(merged, 0.7)]).unwrap();
        assert_eq!(
            out_f.tensor("blocks.0.attn.qkv").unwrap(),
            out_m.tensor("blocks.0.attn.qkv").unwrap()
        );
    }

    #[test]
    fn composition_is_deterministic() {
        let base = base_2x2();
        let x = merged("x", "blocks.0.attn.qkv", arr2(&[[1.0, 0.0], [0.0, 1.0]]));
        let y = merged("y", "blocks.0.attn.qkv", arr2(&[[0.0, 1.0], [1.0, 0.0]]));

        let stack = [(x, 0.5f32), (y, 0.8f32)];
        let first = compose(&base, &stack).unwrap();
        let second = compose(&base, &stack).unwrap();
        assert_eq!(first, second, "same stack must be bit-identical");
    }

    #[test]
    fn overlapping_adapters_are_additive_and_order_sensitive_overall() {
        let base = base_2x2();
        let x = merged("x", "blocks.0.attn.qkv", arr2(&[[1.0, 1.0], [1.0, 1.0]]));
        let y = merged("y", "blocks.0.attn.qkv", arr2(&[[2.0, 2.0], [2.0, 2.0]]));

        let xy = compose(&base, &[(x.clone(), 0.5), (y.clone(), 0.8)]).unwrap();
        // Additive: base + 0.5*X + 0.8*Y, not replaced by the last one.
        assert_eq!(
            xy.tensor("blocks.0.attn.qkv").unwrap(),
            &arr2(&[[3.1, 4.1], [5.1, 6.1]])
        );

        // Swapped scales over the same targets give a different result.
        let yx = compose(&base, &[(y, 0.5), (x, 0.8)]).unwrap();
        assert_ne!(
            xy.tensor("blocks.0.attn.qkv").unwrap(),
            yx.tensor("blocks.0.attn.qkv").unwrap()
        );
    }

    #[test]
    fn shape_mismatch_is_incompatible_adapter() {
        let base = base_2x2();
        let bad = merged("bad", "blocks.0.attn.qkv", Array2::zeros((3, 3)));

        match compose(&base, &[(bad, 1.0)]).unwrap_err() {
            EngineError::IncompatibleAdapter {
                adapter,
                tensor,
                expected,
                actual,
            } => {
                assert_eq!(adapter, "bad");
                assert_eq!(tensor, "blocks.0.attn.qkv");
                assert_eq!(expected, vec![2, 2]);
                assert_eq!(actual, vec![3, 3]);
            }
            other => panic!("expected IncompatibleAdapter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_target_tensor_is_incompatible_adapter() {
        let base = base_2x2();
        let bad = merged("bad", "blocks.9.missing", Array2::zeros((2, 2)));
        assert!(matches!(
            compose(&base, &[(bad, 1.0)]).unwrap_err(),
            EngineError::IncompatibleAdapter { .. }
        ));
    }

    #[test]
    fn factored_rank_mismatch_is_incompatible_adapter() {
        let base = base_2x2();
        let bad = AdapterDelta {
            name: "bad-rank".into(),
            tensors: vec![(
                "blocks.0.attn.qkv".into(),
                AdapterWeights::Factored {
                    up: Array2::zeros((2, 4)),
                    down: Array2::zeros((3, 2)),
                },
            )],
        };
        assert!(matches!(
            compose(&base, &[(bad, 1.0)]).unwrap_err(),
            EngineError::IncompatibleAdapter { .. }
        ));
    }

    #[test]
    fn failed_compose_leaves_no_partial_state() {
        let base = base_2x2();
        let good = merged("good", "blocks.0.attn.qkv", arr2(&[[1.0, 1.0], [1.0, 1.0]]));
        let bad = merged("bad", "blocks.0.attn.qkv", Array2::zeros((5, 5)));

        // bad is validated before good is applied.
        assert!(compose(&base, &[(good, 1.0), (bad, 1.0)]).is_err());
        assert_eq!(
            base.tensor("blocks.0.attn.qkv").unwrap(),
            &arr2(&[[1.0, 2.0], [3.0, 4.0]])
        );
    }

    #[test]
    fn empty_adapter_list_is_identity() {
        let base = base_2x2();
        let out = compose(&base, &[]).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn mean_tracks_applied_deltas() {
        assert_eq!(BaseWeights::new().mean(), 0.0);

        let base = base_2x2();
        // (1+2+3+4)/8 across the qkv tensor and the zero ffn tensor.
        assert_eq!(base.mean(), 1.25);

        let adapter = merged("x", "blocks.0.ffn.w1", Array2::from_elem((2, 2), 2.0));
        let out = compose(&base, &[(adapter, 0.5)]).unwrap();
        assert_eq!(out.mean(), 1.75);
    }
}
