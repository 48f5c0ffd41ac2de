//! Log-domain Forward–Backward for one observation sequence.
//!
//! Training must start in state 0, so α is pinned there at t = 0 and β is
//! pinned on the terminal state at t = T−1. Posteriors are normalized per
//! frame, which keeps `Σᵢ γ(t, i) = 1` exact whenever the frame has any
//! probability mass at all.

use crate::hmm::PhonemeHmm;
use crate::numerics::log_sum_exp;
use ndarray::{Array1, Array2};

/// α, β and γ matrices (`T × N`) plus the sequence log-likelihood.
#[derive(Debug, Clone)]
pub struct ForwardBackwardResult {
    pub forward: Array2<f64>,
    pub backward: Array2<f64>,
    pub gamma: Array2<f64>,
    /// Per-frame log-likelihood: `log_sum_exp(final α column) / T`.
    pub log_likelihood: f64,
}

impl ForwardBackwardResult {
    fn empty(frames: usize, states: usize) -> Self {
        Self {
            forward: Array2::zeros((frames, states)),
            backward: Array2::zeros((frames, states)),
            gamma: Array2::zeros((frames, states)),
            log_likelihood: f64::NEG_INFINITY,
        }
    }
}

fn log_prob(p: f64) -> f64 {
    if p > 0.0 {
        p.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Runs Forward–Backward over `observations`. Degenerate inputs (no frames
/// or no states) return a zero-filled result with `-inf` likelihood rather
/// than an error; emission evaluation failures are treated as `-inf` mass.
pub fn forward_backward(model: &PhonemeHmm, observations: &[Array1<f64>]) -> ForwardBackwardResult {
    let frames = observations.len();
    let states = model.num_states();
    if frames == 0 || states == 0 {
        return ForwardBackwardResult::empty(frames, states);
    }

    let mut result = ForwardBackwardResult::empty(frames, states);

    // Emissions once up front; they are reused by both passes.
    let mut emissions = Array2::<f64>::from_elem((frames, states), f64::NEG_INFINITY);
    for t in 0..frames {
        for i in 0..states {
            if let Ok(b) = model.states[i].log_emission(observations[t].view()) {
                emissions[[t, i]] = b;
            }
        }
    }

    // Forward pass: start pinned to state 0.
    for i in 0..states {
        result.forward[[0, i]] = if i == 0 {
            emissions[[0, 0]]
        } else {
            f64::NEG_INFINITY
        };
    }
    for t in 1..frames {
        for j in 0..states {
            let mut incoming = Vec::with_capacity(2);
            let self_loop = result.forward[[t - 1, j]];
            if self_loop.is_finite() {
                incoming.push(self_loop + log_prob(model.states[j].transition.self_loop));
            }
            if j > 0 {
                let advance = result.forward[[t - 1, j - 1]];
                if advance.is_finite() {
                    incoming.push(advance + log_prob(model.states[j - 1].transition.next));
                }
            }
            result.forward[[t, j]] = if incoming.is_empty() {
                f64::NEG_INFINITY
            } else {
                log_sum_exp(&incoming) + emissions[[t, j]]
            };
        }
    }

    // Backward pass: must end in the terminal state.
    for i in 0..states {
        result.backward[[frames - 1, i]] = if i == states - 1 {
            0.0
        } else {
            f64::NEG_INFINITY
        };
    }
    for t in (0..frames.saturating_sub(1)).rev() {
        for i in 0..states {
            let mut outgoing = Vec::with_capacity(2);
            let stay = result.backward[[t + 1, i]];
            if stay.is_finite() {
                outgoing.push(
                    log_prob(model.states[i].transition.self_loop) + emissions[[t + 1, i]] + stay,
                );
            }
            if i + 1 < states {
                let advance = result.backward[[t + 1, i + 1]];
                if advance.is_finite() {
                    outgoing.push(
                        log_prob(model.states[i].transition.next) + emissions[[t + 1, i + 1]] + advance,
                    );
                }
            }
            result.backward[[t, i]] = if outgoing.is_empty() {
                f64::NEG_INFINITY
            } else {
                log_sum_exp(&outgoing)
            };
        }
    }

    // Posteriors, normalized per frame.
    for t in 0..frames {
        let joint: Vec<f64> = (0..states)
            .map(|i| result.forward[[t, i]] + result.backward[[t, i]])
            .collect();
        let norm = log_sum_exp(&joint);
        if norm.is_finite() {
            for i in 0..states {
                let value = joint[i] - norm;
                result.gamma[[t, i]] = if value.is_finite() { value.exp() } else { 0.0 };
            }
        }
    }

    // Sequence likelihood from the final α column, reported per frame.
    let final_column: Vec<f64> = (0..states)
        .map(|i| result.forward[[frames - 1, i]])
        .collect();
    let total = log_sum_exp(&final_column);
    result.log_likelihood = if total.is_finite() {
        total / frames as f64
    } else {
        f64::NEG_INFINITY
    };

    result
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::context::ContextDescriptor;
    use ndarray::array;

    /// The 3-state, 1-dimensional chain used across the HMM tests: state
    /// means −1, 0, 1 with variance 0.01.
    pub(crate) fn staircase_model() -> PhonemeHmm {
        let mut model = PhonemeHmm::new(ContextDescriptor::for_phoneme("a"), 3, 1, 1);
        for (i, mean) in [-1.0, 0.0, 1.0].into_iter().enumerate() {
            let component = model.states[i].emission.component_mut(0);
            component.set_mean(array![mean]).unwrap();
            component.set_covariance(array![[0.01]]).unwrap();
            if i < 2 {
                model.states[i].transition.set(0.5, 0.5, 0.0);
            }
        }
        model
    }

    fn staircase_observations() -> Vec<Array1<f64>> {
        vec![
            array![-1.0],
            array![-1.0],
            array![0.0],
            array![0.0],
            array![1.0],
            array![1.0],
        ]
    }

    #[test]
    fn posteriors_pin_the_endpoints() {
        let model = staircase_model();
        let result = forward_backward(&model, &staircase_observations());
        assert!(result.log_likelihood.is_finite());
        assert!(result.gamma[[0, 0]] > 0.999, "gamma(0,0) = {}", result.gamma[[0, 0]]);
        assert!(result.gamma[[5, 2]] > 0.999, "gamma(5,2) = {}", result.gamma[[5, 2]]);
    }

    #[test]
    fn posteriors_sum_to_one_per_frame() {
        let model = staircase_model();
        let result = forward_backward(&model, &staircase_observations());
        for t in 0..6 {
            let sum: f64 = (0..3).map(|i| result.gamma[[t, i]]).sum();
            assert!((sum - 1.0).abs() <= 1e-9, "frame {t} sums to {sum}");
        }
    }

    #[test]
    fn deterministic_across_runs() {
        let model = staircase_model();
        let observations = staircase_observations();
        let a = forward_backward(&model, &observations);
        let b = forward_backward(&model, &observations);
        assert!((a.log_likelihood - b.log_likelihood).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_yield_neg_infinity() {
        let model = staircase_model();
        let result = forward_backward(&model, &[]);
        assert_eq!(result.log_likelihood, f64::NEG_INFINITY);
        assert_eq!(result.gamma.nrows(), 0);

        let empty = PhonemeHmm::new(ContextDescriptor::for_phoneme("a"), 0, 1, 1);
        let result = forward_backward(&empty, &staircase_observations());
        assert_eq!(result.log_likelihood, f64::NEG_INFINITY);
    }

    #[test]
    fn too_short_sequence_has_empty_posteriors() {
        // Two frames cannot traverse three states, so no complete path
        // exists: the posterior mass vanishes while the forward mass (and
        // the reported likelihood) stays finite.
        let model = staircase_model();
        let result = forward_backward(&model, &[array![-1.0], array![-1.0]]);
        assert!(result.log_likelihood.is_finite());
        for t in 0..2 {
            let sum: f64 = (0..3).map(|i| result.gamma[[t, i]]).sum();
            assert_eq!(sum, 0.0);
        }
    }
}
