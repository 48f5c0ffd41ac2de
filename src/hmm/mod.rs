//! Left-to-right HMM building blocks: per-state transitions, states owning
//! their emission mixtures, and the context-dependent phoneme model.
//!
//! The topology is the HTS-style chain: state `i` moves only to `i` or
//! `i+1`, the terminal state carries the exit mass. Skip transitions exist
//! only inside forced alignment (see [`alignment`]) and never in the stored
//! transition parameters.

pub mod alignment;
pub mod forward_backward;
pub mod trainer;

use crate::context::ContextDescriptor;
use crate::error::Result;
use crate::gmm::GaussianMixture;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Default number of states per phoneme model.
pub const DEFAULT_NUM_STATES: usize = 5;

/// Per-state transition probabilities, stored as raw floats and normalized
/// on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub self_loop: f64,
    pub next: f64,
    pub exit: f64,
}

impl Default for StateTransition {
    fn default() -> Self {
        Self {
            self_loop: 0.6,
            next: 0.4,
            exit: 0.0,
        }
    }
}

impl StateTransition {
    /// Terminal-state defaults: no onward transition, most mass exits.
    pub fn terminal() -> Self {
        Self {
            self_loop: 0.3,
            next: 0.0,
            exit: 0.7,
        }
    }

    /// Rescales the three probabilities to sum to one. A degenerate
    /// all-zero triple is left untouched.
    pub fn normalize(&mut self) {
        let sum = self.self_loop + self.next + self.exit;
        if sum > 0.0 {
            self.self_loop /= sum;
            self.next /= sum;
            self.exit /= sum;
        }
    }

    /// Normalizes while enforcing the topology for the state's position:
    /// `next = 0` on the terminal state, `exit = 0` elsewhere.
    pub fn normalize_for_position(&mut self, is_terminal: bool) {
        if is_terminal {
            self.next = 0.0;
        } else {
            self.exit = 0.0;
        }
        self.normalize();
    }

    pub fn set(&mut self, self_loop: f64, next: f64, exit: f64) {
        self.self_loop = self_loop;
        self.next = next;
        self.exit = exit;
        self.normalize();
    }
}

/// One HMM state. The state exclusively owns its emission mixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmState {
    pub id: usize,
    pub emission: GaussianMixture,
    pub transition: StateTransition,
}

impl HmmState {
    pub fn new(id: usize, num_mixtures: usize, feature_dimension: usize) -> Self {
        Self {
            id,
            emission: GaussianMixture::new(num_mixtures, feature_dimension),
            transition: StateTransition::default(),
        }
    }

    pub fn feature_dimension(&self) -> usize {
        self.emission.dimension()
    }

    pub fn log_emission(&self, observation: ArrayView1<f64>) -> Result<f64> {
        self.emission.log_likelihood(observation)
    }

    /// Trains this state's mixture with Baum–Welch posteriors as
    /// observation weights.
    pub fn train_weighted_emissions(
        &mut self,
        observations: &[Array1<f64>],
        weights: &[f64],
        max_iterations: usize,
    ) -> Result<f64> {
        self.emission
            .train_weighted_em(observations, weights, max_iterations, 1e-6)
    }
}

/// A context-dependent phoneme model: an ordered left-to-right state chain,
/// the context it was built for, and the canonical model name used as the
/// map key throughout training and synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonemeHmm {
    pub name: String,
    pub context: ContextDescriptor,
    pub states: Vec<HmmState>,
}

impl PhonemeHmm {
    pub fn new(
        context: ContextDescriptor,
        num_states: usize,
        num_mixtures: usize,
        feature_dimension: usize,
    ) -> Self {
        let name = context.model_name();
        let mut states = Vec::with_capacity(num_states);
        for i in 0..num_states {
            let mut state = HmmState::new(i, num_mixtures, feature_dimension);
            if i == num_states - 1 {
                state.transition = StateTransition::terminal();
            }
            states.push(state);
        }
        Self {
            name,
            context,
            states,
        }
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn feature_dimension(&self) -> usize {
        self.states
            .first()
            .map(|s| s.feature_dimension())
            .unwrap_or(0)
    }

    /// Re-normalizes every state's transition triple for its position.
    pub fn normalize_transitions(&mut self) {
        let last = self.states.len().saturating_sub(1);
        for (i, state) in self.states.iter_mut().enumerate() {
            state.transition.normalize_for_position(i == last);
        }
    }
}
