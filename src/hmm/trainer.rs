//! Baum–Welch training with multi-criteria convergence detection.
//!
//! One `HmmTrainer` drives EM for a single model: Forward–Backward E-step
//! (optionally parallel across sequences with length-aware load balancing),
//! the transition/emission M-step, validation tracking, checkpointing of the
//! best model seen, and a convergence check that only accepts a stop once a
//! confidence score over recent history clears the configured bar.
//! `MultiModelTrainer` fans independent models out across a rayon pool.
//!
//! Training never fails with an error: every run returns `TrainingStats`
//! whose `stop_reason` names the exact criterion that ended it.

use std::collections::BTreeMap;
use std::fmt;

use crate::hmm::alignment::{self, SequenceAlignment};
use crate::hmm::forward_backward::{forward_backward, ForwardBackwardResult};
use crate::hmm::PhonemeHmm;
use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// Posterior weights below this are dropped before emission training.
const MIN_POSTERIOR_WEIGHT: f64 = 1e-10;

/// Knobs for a training run. The defaults are the tuned values the rest of
/// the crate's tests assume.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub max_iterations: usize,
    /// Log-likelihood improvement threshold (per frame).
    pub convergence_threshold: f64,
    /// L2 threshold on transition-parameter change.
    pub parameter_threshold: f64,
    pub convergence_window: usize,
    pub use_validation_set: bool,
    pub validation_split: f64,
    pub enable_adaptive_thresholds: bool,
    pub overfitting_threshold: f64,
    pub patience: usize,
    pub min_improvement: f64,
    pub convergence_confidence: f64,
    pub enable_model_checkpointing: bool,
    pub enable_parallel_training: bool,
    /// 0 = use available parallelism.
    pub num_threads: usize,
    pub min_sequences_per_thread: usize,
    pub enable_load_balancing: bool,
    pub enable_parallel_emission_update: bool,
    /// EM iterations for each state's mixture during the M-step.
    pub gmm_iterations: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-4,
            parameter_threshold: 1e-3,
            convergence_window: 5,
            use_validation_set: true,
            validation_split: 0.1,
            enable_adaptive_thresholds: true,
            overfitting_threshold: 0.005,
            patience: 10,
            min_improvement: 1e-5,
            convergence_confidence: 0.95,
            enable_model_checkpointing: true,
            enable_parallel_training: true,
            num_threads: 0,
            min_sequences_per_thread: 1,
            enable_load_balancing: true,
            enable_parallel_emission_update: true,
            gmm_iterations: 50,
        }
    }
}

/// Which convergence criteria fired in the final check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    LogLikelihood,
    ParameterChange,
    RelativeImprovement,
    Validation,
}

impl fmt::Display for ConvergenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LogLikelihood => write!(f, "log-likelihood"),
            Self::ParameterChange => write!(f, "parameter-change"),
            Self::RelativeImprovement => write!(f, "relative-improvement"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Why a training run stopped. Informational, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged(ConvergenceCriterion),
    Patience,
    Overfitting,
    MaxIterations,
    NoTrainingData,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Converged(criterion) => write!(f, "converged: {criterion}"),
            Self::Patience => write!(f, "early stopping: patience exceeded"),
            Self::Overfitting => write!(f, "early stopping: overfitting detected"),
            Self::MaxIterations => write!(f, "maximum iterations reached"),
            Self::NoTrainingData => write!(f, "no training data provided"),
        }
    }
}

/// Per-run statistics. All the series grow by one entry per iteration, so
/// `log_likelihoods.len() == final_iteration` when the run ends.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub log_likelihoods: Vec<f64>,
    pub validation_scores: Vec<f64>,
    pub parameter_changes: Vec<f64>,
    pub relative_improvements: Vec<f64>,
    pub convergence_confidence_scores: Vec<f64>,
    pub criteria_met: Vec<ConvergenceCriterion>,
    pub final_iteration: usize,
    pub converged: bool,
    pub early_stopped: bool,
    pub final_log_likelihood: f64,
    pub best_validation_score: f64,
    pub best_validation_iteration: usize,
    pub patience_counter: usize,
    pub adaptive_threshold: f64,
    pub convergence_confidence: f64,
    pub stop_reason: Option<StopReason>,
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self {
            log_likelihoods: Vec::new(),
            validation_scores: Vec::new(),
            parameter_changes: Vec::new(),
            relative_improvements: Vec::new(),
            convergence_confidence_scores: Vec::new(),
            criteria_met: Vec::new(),
            final_iteration: 0,
            converged: false,
            early_stopped: false,
            final_log_likelihood: f64::NEG_INFINITY,
            best_validation_score: f64::NEG_INFINITY,
            best_validation_iteration: 0,
            patience_counter: 0,
            adaptive_threshold: 1e-4,
            convergence_confidence: 0.0,
            stop_reason: None,
        }
    }
}

/// EM trainer for one model. Owns the best-checkpoint snapshot for the
/// current run; nothing here is process-wide.
#[derive(Debug, Default)]
pub struct HmmTrainer {
    config: TrainingConfig,
    best_model: Option<PhonemeHmm>,
}

impl HmmTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            best_model: None,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: TrainingConfig) {
        self.config = config;
    }

    /// Trains `model` in place, splitting off a validation set when
    /// configured. Always returns stats, even when no work happened.
    pub fn train_model(
        &mut self,
        model: &mut PhonemeHmm,
        training_sequences: &[Vec<Array1<f64>>],
    ) -> TrainingStats {
        if self.config.use_validation_set && training_sequences.len() > 1 {
            let split = ((training_sequences.len() as f64 * (1.0 - self.config.validation_split))
                .floor() as usize)
                .clamp(1, training_sequences.len() - 1);
            let (train, validation) = training_sequences.split_at(split);
            debug!(
                train = train.len(),
                validation = validation.len(),
                "split training data for validation"
            );
            self.run_training(model, train, validation)
        } else {
            self.run_training(model, training_sequences, &[])
        }
    }

    /// Trains with a caller-supplied validation set, bypassing the split.
    pub fn train_model_with_validation(
        &mut self,
        model: &mut PhonemeHmm,
        training_sequences: &[Vec<Array1<f64>>],
        validation_sequences: &[Vec<Array1<f64>>],
    ) -> TrainingStats {
        self.run_training(model, training_sequences, validation_sequences)
    }

    fn run_training(
        &mut self,
        model: &mut PhonemeHmm,
        train: &[Vec<Array1<f64>>],
        validation: &[Vec<Array1<f64>>],
    ) -> TrainingStats {
        let mut stats = TrainingStats::default();
        self.best_model = None;

        if train.is_empty() {
            stats.stop_reason = Some(StopReason::NoTrainingData);
            return stats;
        }
        info!(
            model = %model.name,
            sequences = train.len(),
            validation = validation.len(),
            "starting HMM training"
        );

        let mut previous_model = model.clone();

        for iteration in 0..self.config.max_iterations {
            // E-step.
            let (fb_results, log_likelihood) = if self.config.enable_parallel_training
                && train.len() > 1
            {
                self.parallel_expectation_step(model, train)
            } else {
                self.expectation_step(model, train)
            };
            stats.log_likelihoods.push(log_likelihood);

            // M-step.
            self.maximization_step(model, train, &fb_results);

            // Validation.
            let validation_improved = if validation.is_empty() {
                false
            } else {
                let score = self.evaluate_model(model, validation);
                stats.validation_scores.push(score);
                let improved = score > stats.best_validation_score;
                if improved {
                    stats.best_validation_score = score;
                    stats.best_validation_iteration = iteration + 1;
                    stats.patience_counter = 0;
                } else {
                    stats.patience_counter += 1;
                }
                improved
            };

            let param_change = transition_l2_distance(&previous_model, model);
            stats.parameter_changes.push(param_change);

            if self.config.enable_model_checkpointing
                && self.should_checkpoint(&stats, validation_improved)
            {
                self.best_model = Some(model.clone());
            }

            previous_model = model.clone();
            stats.final_iteration = iteration + 1;
            stats.final_log_likelihood = log_likelihood;

            debug!(
                iteration = iteration + 1,
                log_likelihood,
                validation = stats.validation_scores.last().copied(),
                param_change,
                "training iteration complete"
            );

            if self.check_early_stopping(&mut stats) {
                stats.early_stopped = true;
                self.restore_best_model(model);
                break;
            }

            if self.check_convergence(&mut stats) {
                stats.converged = true;
                self.restore_best_model(model);
                break;
            }
        }

        if stats.stop_reason.is_none() {
            stats.stop_reason = Some(StopReason::MaxIterations);
            self.restore_best_model(model);
        }

        info!(
            model = %model.name,
            iterations = stats.final_iteration,
            log_likelihood = stats.final_log_likelihood,
            reason = %stats.stop_reason.expect("stop reason set"),
            "training finished"
        );
        stats
    }

    /// Mean per-frame log-likelihood of a test set under `model`.
    pub fn evaluate_model(&self, model: &PhonemeHmm, sequences: &[Vec<Array1<f64>>]) -> f64 {
        aggregate_log_likelihood(
            &sequences
                .iter()
                .map(|s| (forward_backward(model, s).log_likelihood, s.len()))
                .collect::<Vec<_>>(),
        )
    }

    /// Forward–Backward over one sequence; exposed for alignment consumers.
    pub fn forward_backward(
        &self,
        model: &PhonemeHmm,
        observations: &[Array1<f64>],
    ) -> ForwardBackwardResult {
        forward_backward(model, observations)
    }

    pub fn viterbi_alignment(
        &self,
        model: &PhonemeHmm,
        observations: &[Array1<f64>],
        frame_rate: f64,
    ) -> SequenceAlignment {
        alignment::viterbi_alignment(model, observations, frame_rate)
    }

    pub fn forced_alignment(
        &self,
        model: &PhonemeHmm,
        observations: &[Array1<f64>],
        phonemes: &[String],
        frame_rate: f64,
    ) -> SequenceAlignment {
        alignment::forced_alignment(model, observations, phonemes, frame_rate)
    }

    pub fn constrained_alignment(
        &self,
        model: &PhonemeHmm,
        observations: &[Array1<f64>],
        phonemes: &[String],
        time_hints: &[(f64, f64)],
        frame_rate: f64,
    ) -> SequenceAlignment {
        alignment::constrained_alignment(model, observations, phonemes, time_hints, frame_rate)
    }

    pub fn batch_forced_alignment(
        &self,
        models: &BTreeMap<String, PhonemeHmm>,
        sequences: &[Vec<Array1<f64>>],
        phoneme_sequences: &[Vec<String>],
        frame_rate: f64,
    ) -> Vec<SequenceAlignment> {
        alignment::batch_forced_alignment(models, sequences, phoneme_sequences, frame_rate)
    }

    // ---- E-step ---------------------------------------------------------

    fn expectation_step(
        &self,
        model: &PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
    ) -> (Vec<ForwardBackwardResult>, f64) {
        let results: Vec<ForwardBackwardResult> = sequences
            .iter()
            .map(|s| forward_backward(model, s))
            .collect();
        let ll = aggregate_log_likelihood(
            &results
                .iter()
                .zip(sequences)
                .map(|(r, s)| (r.log_likelihood, s.len()))
                .collect::<Vec<_>>(),
        );
        (results, ll)
    }

    fn parallel_expectation_step(
        &self,
        model: &PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
    ) -> (Vec<ForwardBackwardResult>, f64) {
        let threads = self.optimal_thread_count(sequences.len());
        if threads <= 1 {
            return self.expectation_step(model, sequences);
        }
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool,
            Err(error) => {
                warn!(%error, "failed to build worker pool, running E-step sequentially");
                return self.expectation_step(model, sequences);
            }
        };
        debug!(threads, sequences = sequences.len(), "parallel E-step");

        let results: Vec<ForwardBackwardResult> = if self.config.enable_load_balancing {
            let chunks = load_balanced_chunks(sequences, threads);
            let mut slots: Vec<Option<ForwardBackwardResult>> =
                (0..sequences.len()).map(|_| None).collect();
            let computed: Vec<(usize, ForwardBackwardResult)> = pool.install(|| {
                chunks
                    .par_iter()
                    .flat_map_iter(|chunk| {
                        chunk
                            .iter()
                            .map(|&index| (index, forward_backward(model, &sequences[index])))
                    })
                    .collect()
            });
            for (index, result) in computed {
                slots[index] = Some(result);
            }
            slots
                .into_iter()
                .map(|slot| slot.expect("every sequence assigned to a chunk"))
                .collect()
        } else {
            pool.install(|| {
                sequences
                    .par_iter()
                    .map(|s| forward_backward(model, s))
                    .collect()
            })
        };

        let ll = aggregate_log_likelihood(
            &results
                .iter()
                .zip(sequences)
                .map(|(r, s)| (r.log_likelihood, s.len()))
                .collect::<Vec<_>>(),
        );
        (results, ll)
    }

    fn optimal_thread_count(&self, num_sequences: usize) -> usize {
        let configured = if self.config.num_threads > 0 {
            self.config.num_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };
        let max_useful = num_sequences / self.config.min_sequences_per_thread.max(1);
        configured.min(max_useful.max(1))
    }

    // ---- M-step ---------------------------------------------------------

    fn maximization_step(
        &self,
        model: &mut PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
        fb_results: &[ForwardBackwardResult],
    ) {
        self.update_transitions(model, sequences, fb_results);
        if self.config.enable_parallel_training && self.config.enable_parallel_emission_update {
            self.update_emissions_parallel(model, sequences, fb_results);
        } else {
            self.update_emissions(model, sequences, fb_results);
        }
    }

    /// Transition re-estimation with the posterior-product surrogate
    /// `ξ ≈ γ(t,i)·γ(t+1,j)·a(i→j)` accumulated per state.
    fn update_transitions(
        &self,
        model: &mut PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
        fb_results: &[ForwardBackwardResult],
    ) {
        let states = model.num_states();
        let transitions: Vec<(f64, f64)> = model
            .states
            .iter()
            .map(|s| (s.transition.self_loop, s.transition.next))
            .collect();
        let zero = || (vec![0.0; states], vec![0.0; states], vec![0.0; states]);

        let transitions = &transitions;
        let accumulate = move |mut acc: (Vec<f64>, Vec<f64>, Vec<f64>),
                               (sequence, fb): (&Vec<Array1<f64>>, &ForwardBackwardResult)| {
            let frames = sequence.len();
            for t in 0..frames.saturating_sub(1) {
                for i in 0..states {
                    let gamma = fb.gamma[[t, i]];
                    acc.0[i] += gamma * fb.gamma[[t + 1, i]] * transitions[i].0;
                    if i + 1 < states {
                        acc.1[i] += gamma * fb.gamma[[t + 1, i + 1]] * transitions[i].1;
                    }
                    acc.2[i] += gamma;
                }
            }
            acc
        };
        let merge = |mut a: (Vec<f64>, Vec<f64>, Vec<f64>), b: (Vec<f64>, Vec<f64>, Vec<f64>)| {
            for i in 0..states {
                a.0[i] += b.0[i];
                a.1[i] += b.1[i];
                a.2[i] += b.2[i];
            }
            a
        };

        let (self_counts, next_counts, totals) = if self.config.enable_parallel_training {
            sequences
                .par_iter()
                .zip(fb_results.par_iter())
                .fold(zero, |acc, pair| accumulate(acc, pair))
                .reduce(zero, merge)
        } else {
            sequences
                .iter()
                .zip(fb_results.iter())
                .fold(zero(), |acc, pair| accumulate(acc, pair))
        };

        let last = states.saturating_sub(1);
        for i in 0..states {
            if totals[i] > 0.0 {
                model.states[i].transition.self_loop = self_counts[i] / totals[i];
                model.states[i].transition.next = next_counts[i] / totals[i];
                model.states[i].transition.normalize_for_position(i == last);
            }
        }
    }

    fn collect_state_observations(
        state: usize,
        sequences: &[Vec<Array1<f64>>],
        fb_results: &[ForwardBackwardResult],
    ) -> (Vec<Array1<f64>>, Vec<f64>) {
        let mut observations = Vec::new();
        let mut weights = Vec::new();
        for (sequence, fb) in sequences.iter().zip(fb_results) {
            for (t, frame) in sequence.iter().enumerate() {
                let weight = fb.gamma[[t, state]];
                if weight > MIN_POSTERIOR_WEIGHT {
                    observations.push(frame.clone());
                    weights.push(weight);
                }
            }
        }
        (observations, weights)
    }

    fn update_emissions(
        &self,
        model: &mut PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
        fb_results: &[ForwardBackwardResult],
    ) {
        let iterations = self.config.gmm_iterations;
        for (i, state) in model.states.iter_mut().enumerate() {
            let (observations, weights) = Self::collect_state_observations(i, sequences, fb_results);
            if observations.is_empty() {
                continue;
            }
            if let Err(error) = state.train_weighted_emissions(&observations, &weights, iterations) {
                warn!(state = i, %error, "emission update failed, keeping previous mixture");
            }
        }
    }

    /// States own distinct mixtures, so each one trains on its own worker.
    fn update_emissions_parallel(
        &self,
        model: &mut PhonemeHmm,
        sequences: &[Vec<Array1<f64>>],
        fb_results: &[ForwardBackwardResult],
    ) {
        let iterations = self.config.gmm_iterations;
        model
            .states
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, state)| {
                let (observations, weights) =
                    Self::collect_state_observations(i, sequences, fb_results);
                if observations.is_empty() {
                    return;
                }
                if let Err(error) =
                    state.train_weighted_emissions(&observations, &weights, iterations)
                {
                    warn!(state = i, %error, "emission update failed, keeping previous mixture");
                }
            });
    }

    // ---- Checkpointing --------------------------------------------------

    fn should_checkpoint(&self, stats: &TrainingStats, validation_improved: bool) -> bool {
        if !stats.validation_scores.is_empty() {
            return validation_improved;
        }
        if stats.log_likelihoods.len() >= 2 {
            let n = stats.log_likelihoods.len();
            return stats.log_likelihoods[n - 1] - stats.log_likelihoods[n - 2]
                > self.config.convergence_threshold;
        }
        // First iteration with no validation: keep it, anything beats nothing.
        true
    }

    fn restore_best_model(&self, model: &mut PhonemeHmm) {
        if self.config.enable_model_checkpointing {
            if let Some(best) = &self.best_model {
                *model = best.clone();
            }
        }
    }

    // ---- Convergence machinery -----------------------------------------

    fn check_early_stopping(&self, stats: &mut TrainingStats) -> bool {
        if !stats.validation_scores.is_empty() && stats.patience_counter >= self.config.patience {
            stats.stop_reason = Some(StopReason::Patience);
            return true;
        }
        if self.overfitting_detected(stats) {
            stats.stop_reason = Some(StopReason::Overfitting);
            return true;
        }
        false
    }

    fn overfitting_detected(&self, stats: &TrainingStats) -> bool {
        if !self.config.use_validation_set || stats.validation_scores.len() < 5 {
            return false;
        }
        let recent = &stats.validation_scores[stats.validation_scores.len() - 3..];
        let recent_avg: f64 = recent.iter().sum::<f64>() / recent.len() as f64;
        stats.best_validation_score - recent_avg > self.config.overfitting_threshold
    }

    fn check_convergence(&self, stats: &mut TrainingStats) -> bool {
        let mut criteria = Vec::new();

        if self.config.enable_adaptive_thresholds {
            stats.adaptive_threshold = self.adaptive_threshold(stats);
        }

        // 1. Mean log-likelihood improvement over the window.
        let window = self.config.convergence_window;
        if stats.log_likelihoods.len() >= window {
            let n = stats.log_likelihoods.len();
            let improvement =
                (stats.log_likelihoods[n - 1] - stats.log_likelihoods[n - window]) / window as f64;
            if improvement < stats.adaptive_threshold {
                criteria.push(ConvergenceCriterion::LogLikelihood);
            }
        }

        // 2. Parameter change below threshold.
        if let Some(last) = stats.parameter_changes.last() {
            if *last < self.config.parameter_threshold {
                criteria.push(ConvergenceCriterion::ParameterChange);
            }
        }

        // 3. Relative improvement between the two halves of the last 2·window.
        if stats.log_likelihoods.len() >= 2 * window {
            let rel = relative_improvement(&stats.log_likelihoods, window);
            stats.relative_improvements.push(rel);
            if rel < self.config.min_improvement {
                criteria.push(ConvergenceCriterion::RelativeImprovement);
            }
        }

        // 4. Validation stagnation.
        if self.config.use_validation_set && stats.validation_scores.len() >= window {
            let recent = &stats.validation_scores[stats.validation_scores.len() - window..];
            let max_recent = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let max_overall = stats
                .validation_scores
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            if max_recent < max_overall - self.config.convergence_threshold {
                criteria.push(ConvergenceCriterion::Validation);
            }
        }

        if criteria.is_empty() {
            return false;
        }

        // Only accept a stop when the run looks stable enough.
        let confidence = self.convergence_confidence(stats);
        stats.convergence_confidence_scores.push(confidence);
        if confidence < self.config.convergence_confidence {
            debug!(
                confidence,
                required = self.config.convergence_confidence,
                "convergence criteria fired but confidence too low, continuing"
            );
            return false;
        }

        stats.convergence_confidence = confidence;
        stats.stop_reason = Some(StopReason::Converged(criteria[0]));
        stats.criteria_met = criteria;
        true
    }

    /// Combines (i) inverse variance of recent log-likelihoods,
    /// (ii) parameter-change stability and (iii) validation health into one
    /// score in [0, 1].
    fn convergence_confidence(&self, stats: &TrainingStats) -> f64 {
        if stats.log_likelihoods.len() < 3 {
            return 0.0;
        }
        let window = self.config.convergence_window;
        let mut confidence = 0.0;
        let mut parts = 0;

        if stats.log_likelihoods.len() >= window {
            let recent = &stats.log_likelihoods[stats.log_likelihoods.len() - window..];
            let mean: f64 = recent.iter().sum::<f64>() / recent.len() as f64;
            let variance: f64 =
                recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / recent.len() as f64;
            confidence += (-variance * 100.0).exp();
            parts += 1;
        }

        if stats.parameter_changes.len() >= window {
            let recent = &stats.parameter_changes[stats.parameter_changes.len() - window..];
            let stable = recent
                .iter()
                .all(|c| *c <= self.config.parameter_threshold * 2.0);
            confidence += if stable { 1.0 } else { 0.0 };
            parts += 1;
        }

        if stats.validation_scores.len() >= 3 {
            let recent = &stats.validation_scores[stats.validation_scores.len() - 3..];
            let recent_avg: f64 = recent.iter().sum::<f64>() / recent.len() as f64;
            let healthy = recent_avg >= stats.best_validation_score * 0.95
                || recent_avg >= stats.best_validation_score - self.config.convergence_threshold;
            confidence += if healthy { 1.0 } else { 0.5 };
            parts += 1;
        }

        if parts > 0 {
            confidence / parts as f64
        } else {
            0.0
        }
    }

    /// Threshold scaled by the volatility of recent improvements: tightens
    /// when training is stable, loosens when it is noisy.
    fn adaptive_threshold(&self, stats: &TrainingStats) -> f64 {
        let base = self.config.convergence_threshold;
        if stats.log_likelihoods.len() < 5 {
            return base;
        }
        let n = stats.log_likelihoods.len();
        let deltas: Vec<f64> = (n.saturating_sub(10)..n - 1)
            .map(|i| stats.log_likelihoods[i + 1] - stats.log_likelihoods[i])
            .collect();
        if deltas.is_empty() {
            return base;
        }
        let mean: f64 = deltas.iter().sum::<f64>() / deltas.len() as f64;
        let variance: f64 =
            deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / deltas.len() as f64;
        let factor = (variance.sqrt() / base).clamp(0.1, 10.0);
        base * factor
    }
}

/// Mean per-frame log-likelihood from `(per_frame_ll, frames)` pairs.
fn aggregate_log_likelihood(parts: &[(f64, usize)]) -> f64 {
    let mut total = 0.0;
    let mut frames = 0usize;
    for (ll, t) in parts {
        total += ll * *t as f64;
        frames += t;
    }
    if frames > 0 {
        total / frames as f64
    } else {
        f64::NEG_INFINITY
    }
}

/// L2 norm of the transition-parameter difference between two models,
/// averaged over states.
pub fn transition_l2_distance(a: &PhonemeHmm, b: &PhonemeHmm) -> f64 {
    let states = a.num_states().min(b.num_states());
    if states == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..states {
        sum += (a.states[i].transition.self_loop - b.states[i].transition.self_loop).powi(2);
        sum += (a.states[i].transition.next - b.states[i].transition.next).powi(2);
    }
    (sum / states as f64).sqrt()
}

/// Relative improvement between the two halves of the trailing `2·window`
/// entries; +∞ when there is no previous half to compare against.
fn relative_improvement(values: &[f64], window: usize) -> f64 {
    if values.len() < 2 * window || window == 0 {
        return f64::INFINITY;
    }
    let n = values.len();
    let recent: f64 = values[n - window..].iter().sum::<f64>() / window as f64;
    let previous: f64 = values[n - 2 * window..n - window].iter().sum::<f64>() / window as f64;
    if previous.abs() < 1e-12 {
        return f64::INFINITY;
    }
    (recent - previous) / previous.abs()
}

/// Greedy longest-first assignment of sequence indices to `num_chunks`
/// workers, balancing total frame counts.
fn load_balanced_chunks(sequences: &[Vec<Array1<f64>>], num_chunks: usize) -> Vec<Vec<usize>> {
    let mut chunks = vec![Vec::new(); num_chunks.max(1)];
    let mut order: Vec<usize> = (0..sequences.len()).collect();
    order.sort_by(|a, b| sequences[*b].len().cmp(&sequences[*a].len()));
    let mut loads = vec![0usize; chunks.len()];
    for index in order {
        let lightest = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(i, _)| i)
            .unwrap_or(0);
        chunks[lightest].push(index);
        loads[lightest] += sequences[index].len();
    }
    chunks
}

/// Trains many context-dependent models, fanning out across models (they
/// are fully independent). Per-model inner parallelism is disabled so the
/// pool is not oversubscribed from two levels at once.
#[derive(Debug, Default)]
pub struct MultiModelTrainer {
    config: TrainingConfig,
}

impl MultiModelTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn train_models(
        &self,
        models: &mut BTreeMap<String, PhonemeHmm>,
        training_data: &BTreeMap<String, Vec<Vec<Array1<f64>>>>,
    ) -> BTreeMap<String, TrainingStats> {
        let mut per_model_config = self.config.clone();
        if self.config.enable_parallel_training {
            per_model_config.enable_parallel_training = false;
            per_model_config.enable_parallel_emission_update = false;
        }

        let mut entries: Vec<(&String, &mut PhonemeHmm)> = models.iter_mut().collect();
        let train_one = |name: &String, model: &mut PhonemeHmm| -> (String, TrainingStats) {
            let mut trainer = HmmTrainer::new(per_model_config.clone());
            let stats = match training_data.get(name) {
                Some(sequences) => trainer.train_model(model, sequences),
                None => {
                    warn!(model = %name, "no training data for model");
                    let mut stats = TrainingStats::default();
                    stats.stop_reason = Some(StopReason::NoTrainingData);
                    stats
                }
            };
            (name.clone(), stats)
        };

        let results: Vec<(String, TrainingStats)> = if self.config.enable_parallel_training {
            entries
                .par_iter_mut()
                .map(|entry| train_one(entry.0, entry.1))
                .collect()
        } else {
            entries
                .iter_mut()
                .map(|entry| train_one(entry.0, entry.1))
                .collect()
        };
        results.into_iter().collect()
    }

    pub fn evaluate_models(
        &self,
        models: &BTreeMap<String, PhonemeHmm>,
        test_data: &BTreeMap<String, Vec<Vec<Array1<f64>>>>,
    ) -> BTreeMap<String, f64> {
        let trainer = HmmTrainer::new(self.config.clone());
        models
            .iter()
            .map(|(name, model)| {
                let score = test_data
                    .get(name)
                    .map(|sequences| trainer.evaluate_model(model, sequences))
                    .unwrap_or(f64::NEG_INFINITY);
                (name.clone(), score)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ContextDescriptor;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn staircase_sequences(count: usize, seed: u64) -> Vec<Vec<Array1<f64>>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let mut frames = Vec::new();
                for (mean, repeats) in [(-1.0, 3), (0.0, 3), (1.0, 3)] {
                    for _ in 0..repeats {
                        frames.push(array![mean + rng.gen_range(-0.05..0.05)]);
                    }
                }
                frames
            })
            .collect()
    }

    fn fresh_model() -> PhonemeHmm {
        let mut model = PhonemeHmm::new(ContextDescriptor::for_phoneme("a"), 3, 1, 1);
        for (i, mean) in [(-0.8), 0.1, 0.9].into_iter().enumerate() {
            let component = model.states[i].emission.component_mut(0);
            component.set_mean(array![mean]).unwrap();
            component.set_covariance(array![[0.1]]).unwrap();
        }
        model
    }

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            max_iterations: 10,
            use_validation_set: false,
            enable_parallel_training: false,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn training_produces_finite_monotone_stats() {
        let sequences = staircase_sequences(6, 1);
        let mut model = fresh_model();
        let mut trainer = HmmTrainer::new(quick_config());
        let stats = trainer.train_model(&mut model, &sequences);

        assert!(stats.final_iteration >= 1);
        assert_eq!(stats.log_likelihoods.len(), stats.final_iteration);
        assert!(stats.log_likelihoods.iter().all(|ll| ll.is_finite()));
        assert!(stats.stop_reason.is_some());
        // Transitions remain a proper distribution per state.
        for (i, state) in model.states.iter().enumerate() {
            let t = &state.transition;
            assert!((t.self_loop + t.next + t.exit - 1.0).abs() < 1e-9);
            if i == model.states.len() - 1 {
                assert_eq!(t.next, 0.0);
            } else {
                assert_eq!(t.exit, 0.0);
            }
        }
    }

    #[test]
    fn empty_training_data_reports_reason() {
        let mut model = fresh_model();
        let mut trainer = HmmTrainer::new(TrainingConfig::default());
        let stats = trainer.train_model(&mut model, &[]);
        assert_eq!(stats.stop_reason, Some(StopReason::NoTrainingData));
        assert_eq!(stats.final_iteration, 0);
    }

    #[test]
    fn parallel_and_sequential_e_steps_agree() {
        let sequences = staircase_sequences(8, 5);
        let model = fresh_model();

        let sequential = HmmTrainer::new(TrainingConfig {
            enable_parallel_training: false,
            ..TrainingConfig::default()
        });
        let parallel = HmmTrainer::new(TrainingConfig {
            enable_parallel_training: true,
            num_threads: 4,
            ..TrainingConfig::default()
        });

        let (fb_seq, ll_seq) = sequential.expectation_step(&model, &sequences);
        let (fb_par, ll_par) = parallel.parallel_expectation_step(&model, &sequences);
        assert!((ll_seq - ll_par).abs() < 1e-6);
        for (a, b) in fb_seq.iter().zip(&fb_par) {
            assert!((a.log_likelihood - b.log_likelihood).abs() < 1e-6);
        }
    }

    #[test]
    fn parallel_and_sequential_training_agree() {
        let sequences = staircase_sequences(6, 9);

        let mut sequential_model = fresh_model();
        let mut parallel_model = fresh_model();
        let base = TrainingConfig {
            max_iterations: 5,
            use_validation_set: false,
            enable_model_checkpointing: false,
            ..TrainingConfig::default()
        };
        let mut sequential = HmmTrainer::new(TrainingConfig {
            enable_parallel_training: false,
            ..base.clone()
        });
        let mut parallel = HmmTrainer::new(TrainingConfig {
            enable_parallel_training: true,
            num_threads: 4,
            ..base
        });

        let stats_seq = sequential.train_model(&mut sequential_model, &sequences);
        let stats_par = parallel.train_model(&mut parallel_model, &sequences);
        assert!(
            (stats_seq.final_log_likelihood - stats_par.final_log_likelihood).abs() < 1e-3,
            "{} vs {}",
            stats_seq.final_log_likelihood,
            stats_par.final_log_likelihood
        );
    }

    #[test]
    fn load_balancing_spreads_frames() {
        let sequences: Vec<Vec<Array1<f64>>> = [10, 9, 2, 2, 2, 1]
            .iter()
            .map(|len| (0..*len).map(|_| array![0.0]).collect())
            .collect();
        let chunks = load_balanced_chunks(&sequences, 2);
        let load = |chunk: &Vec<usize>| chunk.iter().map(|i| sequences[*i].len()).sum::<usize>();
        let (a, b) = (load(&chunks[0]), load(&chunks[1]));
        assert_eq!(a + b, 26);
        assert!(a.abs_diff(b) <= 2, "loads {a} / {b}");
    }

    #[test]
    fn patience_stops_after_validation_worsens() {
        // Validation improves through iteration 5, then worsens; with
        // patience 3 the run must stop at iteration 8.
        let config = TrainingConfig {
            patience: 3,
            overfitting_threshold: f64::INFINITY,
            ..TrainingConfig::default()
        };
        let trainer = HmmTrainer::new(config);
        let mut stats = TrainingStats::default();
        let scores = [-10.0, -9.0, -8.0, -7.0, -6.0, -6.5, -7.0, -7.5, -8.0, -8.5];

        let mut stopped_at = None;
        for (iteration, score) in scores.iter().enumerate() {
            stats.validation_scores.push(*score);
            if *score > stats.best_validation_score {
                stats.best_validation_score = *score;
                stats.best_validation_iteration = iteration + 1;
                stats.patience_counter = 0;
            } else {
                stats.patience_counter += 1;
            }
            stats.final_iteration = iteration + 1;
            if trainer.check_early_stopping(&mut stats) {
                stopped_at = Some(iteration + 1);
                break;
            }
        }
        assert_eq!(stopped_at, Some(8));
        assert_eq!(stats.stop_reason, Some(StopReason::Patience));
        assert_eq!(stats.best_validation_iteration, 5);
    }

    #[test]
    fn overfitting_detection_trips_on_validation_drop() {
        let trainer = HmmTrainer::new(TrainingConfig::default());
        let mut stats = TrainingStats::default();
        stats.validation_scores = vec![-5.0, -4.0, -3.0, -3.1, -3.2, -3.3];
        stats.best_validation_score = -3.0;
        assert!(trainer.overfitting_detected(&stats));
        assert!(trainer.check_early_stopping(&mut stats));
        assert_eq!(stats.stop_reason, Some(StopReason::Overfitting));
    }

    #[test]
    fn checkpoint_restores_best_validation_model() {
        let sequences = staircase_sequences(6, 3);
        let mut trainer = HmmTrainer::new(quick_config());
        let mut model = fresh_model();
        // Seed a checkpoint manually, then worsen the live model; restore
        // must bring the checkpoint back.
        trainer.best_model = Some(model.clone());
        let reference = model.clone();
        let _ = trainer.train_model(&mut model, &sequences);
        let mut live = model.clone();
        live.states[0].transition.set(0.9, 0.1, 0.0);
        trainer.best_model = Some(reference.clone());
        trainer.restore_best_model(&mut live);
        assert_eq!(live.states[0].transition, reference.states[0].transition);
    }

    #[test]
    fn adaptive_threshold_tracks_volatility() {
        let trainer = HmmTrainer::new(TrainingConfig::default());
        let mut stats = TrainingStats::default();
        // Perfectly smooth improvements shrink the threshold.
        stats.log_likelihoods = (0..10).map(|i| -10.0 + i as f64 * 1e-6).collect();
        let tight = trainer.adaptive_threshold(&stats);
        assert!(tight < trainer.config.convergence_threshold);
        // Wild swings widen it, clamped at 10x.
        stats.log_likelihoods = vec![-10.0, -2.0, -9.0, -1.0, -8.0, -2.0, -9.0];
        let loose = trainer.adaptive_threshold(&stats);
        assert!((loose - trainer.config.convergence_threshold * 10.0).abs() < 1e-12);
    }

    #[test]
    fn multi_model_trainer_covers_every_model() {
        let mut models = BTreeMap::new();
        let mut data = BTreeMap::new();
        for phoneme in ["a", "i"] {
            let model = {
                let mut m = fresh_model();
                m.name = format!("sil-sil-{phoneme}+sil+sil");
                m
            };
            data.insert(model.name.clone(), staircase_sequences(4, 7));
            models.insert(model.name.clone(), model);
        }
        models.insert(
            "sil-sil-u+sil+sil".to_string(),
            PhonemeHmm::new(ContextDescriptor::for_phoneme("u"), 3, 1, 1),
        );

        let trainer = MultiModelTrainer::new(TrainingConfig {
            max_iterations: 3,
            use_validation_set: false,
            ..TrainingConfig::default()
        });
        let stats = trainer.train_models(&mut models, &data);
        assert_eq!(stats.len(), 3);
        assert_eq!(
            stats["sil-sil-u+sil+sil"].stop_reason,
            Some(StopReason::NoTrainingData)
        );
        assert!(stats["sil-sil-a+sil+sil"].final_iteration >= 1);

        let scores = trainer.evaluate_models(&models, &data);
        assert!(scores["sil-sil-a+sil+sil"].is_finite());
        assert_eq!(scores["sil-sil-u+sil+sil"], f64::NEG_INFINITY);
    }
}
