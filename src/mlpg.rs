//! Maximum-Likelihood Parameter Generation.
//!
//! Given per-state means, diagonal variances and durations, MLPG solves for
//! the static trajectory that best explains the stacked static/Δ/ΔΔ
//! observations: `(WᵀPW + reg·I) c = WᵀP o`. Because the precision matrix is
//! diagonal, the system decouples into one banded normal-equation system per
//! static dimension (half-bandwidth 2, the reach of the ΔΔ stencil), which
//! is the banded factorization the problem structure calls for. Cholesky
//! first, banded LU as the fallback.

use crate::error::{ModelError, Result};
use crate::gv::{GvCalculator, GvStatistics};
use crate::hmm::HmmState;
use crate::numerics::{BandedSpd, SolverKind};
use ndarray::Array1;
use tracing::debug;

/// MLPG configuration.
#[derive(Debug, Clone)]
pub struct MlpgConfig {
    pub use_delta_features: bool,
    pub use_delta_delta_features: bool,
    pub use_global_variance: bool,
    /// Added to variances and to the system diagonal.
    pub regularization: f64,
    /// Blend weight of the GV post-pass, in [0, 1].
    pub gv_weight: f64,
}

impl Default for MlpgConfig {
    fn default() -> Self {
        Self {
            use_delta_features: true,
            use_delta_delta_features: true,
            use_global_variance: true,
            regularization: 1e-6,
            gv_weight: 1.0,
        }
    }
}

/// Metrics from one trajectory generation.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryStats {
    /// Rows of the stacked system (`T · expanded_dim`).
    pub matrix_size: usize,
    pub solver: Option<SolverKind>,
    /// `−½ rᵀ P r` of the solved system's residual.
    pub final_log_likelihood: f64,
    /// Mean squared second difference of the generated trajectory.
    pub smoothness: f64,
    /// 1 − relative distance between achieved and target variance after the
    /// GV pass; 1.0 when the pass is disabled.
    pub gv_satisfaction: f64,
}

/// Trajectory generator.
#[derive(Debug, Default)]
pub struct MlpgEngine {
    config: MlpgConfig,
}

/// One row of the W matrix touching at most five frames around `t`.
struct Stencil {
    offsets: [(isize, f64); 5],
    len: usize,
}

impl Stencil {
    fn identity() -> Self {
        Self {
            offsets: [(0, 1.0); 5],
            len: 1,
        }
    }

    /// Central difference `0.5·c(t+1) − 0.5·c(t−1)`, one-sided at the ends.
    fn delta(t: usize, frames: usize) -> Self {
        let mut offsets = [(0isize, 0.0f64); 5];
        let mut len = 0;
        if t > 0 {
            offsets[len] = (-1, -0.5);
            len += 1;
        } else {
            offsets[len] = (0, -0.5);
            len += 1;
        }
        if t + 1 < frames {
            offsets[len] = (1, 0.5);
            len += 1;
        } else {
            offsets[len] = (0, 0.5);
            len += 1;
        }
        Self { offsets, len }
    }

    /// `0.25·c(t−2) − 0.5·c(t−1) + c(t) − 0.5·c(t+1) + 0.25·c(t+2)`, with
    /// out-of-range taps clipped.
    fn delta_delta(t: usize, frames: usize) -> Self {
        let mut offsets = [(0isize, 0.0f64); 5];
        let mut len = 0;
        let taps: [(isize, f64); 5] = [(-2, 0.25), (-1, -0.5), (0, 1.0), (1, -0.5), (2, 0.25)];
        for (offset, coefficient) in taps {
            let target = t as isize + offset;
            if target >= 0 && (target as usize) < frames {
                offsets[len] = (offset, coefficient);
                len += 1;
            }
        }
        Self { offsets, len }
    }

    fn taps(&self) -> &[(isize, f64)] {
        &self.offsets[..self.len]
    }
}

impl MlpgEngine {
    pub fn new(config: MlpgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MlpgConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MlpgConfig) {
        self.config = config;
    }

    /// Generates a smooth trajectory from per-state statistics.
    ///
    /// `means[s]` and `variances[s]` describe state `s` (diagonal
    /// covariance), occupied for `durations[s]` frames. The returned
    /// trajectory has `Σ durations` frames of the static dimension.
    pub fn generate_trajectory(
        &self,
        means: &[Array1<f64>],
        variances: &[Array1<f64>],
        durations: &[usize],
        stats: Option<&mut TrajectoryStats>,
    ) -> Result<Vec<Array1<f64>>> {
        self.validate_inputs(means, variances, durations)?;

        let frames: usize = durations.iter().sum();
        let dimension = means[0].len();
        let mut local_stats = TrajectoryStats::default();

        // Per-frame means and precisions, expanded by state duration.
        let mut frame_mean = Vec::with_capacity(frames);
        let mut frame_precision = Vec::with_capacity(frames);
        for (state, duration) in durations.iter().enumerate() {
            for _ in 0..*duration {
                frame_mean.push(&means[state]);
                frame_precision.push(
                    variances[state].mapv(|v| 1.0 / (v + self.config.regularization)),
                );
            }
        }

        let expansion = 1
            + usize::from(self.config.use_delta_features)
            + usize::from(self.config.use_delta_delta_features);
        local_stats.matrix_size = frames * dimension * expansion;

        // The diagonal precision decouples the normal equations per static
        // dimension; each dimension assembles and solves its own banded
        // system.
        let mut columns: Vec<Array1<f64>> = Vec::with_capacity(dimension);
        for d in 0..dimension {
            let mut system = BandedSpd::new(frames, 2);
            let mut rhs = Array1::<f64>::zeros(frames);
            let mut residual_norm = 0.0f64;

            for t in 0..frames {
                let precision = frame_precision[t][d];

                // Static row: target is the state mean.
                accumulate_row(
                    &mut system,
                    &mut rhs,
                    t,
                    &Stencil::identity(),
                    precision,
                    frame_mean[t][d],
                );
                // Δ and ΔΔ rows target zero.
                if self.config.use_delta_features {
                    accumulate_row(&mut system, &mut rhs, t, &Stencil::delta(t, frames), precision, 0.0);
                }
                if self.config.use_delta_delta_features {
                    accumulate_row(
                        &mut system,
                        &mut rhs,
                        t,
                        &Stencil::delta_delta(t, frames),
                        precision,
                        0.0,
                    );
                }
            }
            system.add_diagonal(self.config.regularization);

            let (solution, solver) = system.solve(&rhs)?;
            local_stats.solver = Some(solver);

            // Residual of the static rows for the reported likelihood.
            for t in 0..frames {
                let r = solution[t] - frame_mean[t][d];
                residual_norm += frame_precision[t][d] * r * r;
            }
            local_stats.final_log_likelihood -= 0.5 * residual_norm;
            columns.push(solution);
        }

        // Un-stack the per-dimension solutions into frames.
        let mut trajectory: Vec<Array1<f64>> = (0..frames)
            .map(|t| Array1::from_iter((0..dimension).map(|d| columns[d][t])))
            .collect();

        if self.config.use_global_variance {
            let target = duration_weighted_variance(variances, durations);
            let before = trajectory.clone();
            trajectory =
                GvCalculator::new().apply_uniform_correction(&trajectory, &target, self.config.gv_weight);
            local_stats.gv_satisfaction = gv_satisfaction(&before, &target);
        } else {
            local_stats.gv_satisfaction = 1.0;
        }

        local_stats.smoothness = trajectory_smoothness(&trajectory);
        debug!(
            frames,
            dimension,
            smoothness = local_stats.smoothness,
            solver = ?local_stats.solver,
            "generated trajectory"
        );

        if let Some(out) = stats {
            *out = local_stats;
        }
        Ok(trajectory)
    }

    /// Generates with per-phoneme GV statistics instead of the
    /// duration-weighted built-in target.
    pub fn generate_trajectory_with_gv(
        &self,
        means: &[Array1<f64>],
        variances: &[Array1<f64>],
        durations: &[usize],
        gv: &GvStatistics,
        phoneme_labels: &[String],
        stats: Option<&mut TrajectoryStats>,
    ) -> Result<Vec<Array1<f64>>> {
        let engine = Self::new(MlpgConfig {
            use_global_variance: false,
            ..self.config.clone()
        });
        let mut local_stats = TrajectoryStats::default();
        let trajectory =
            engine.generate_trajectory(means, variances, durations, Some(&mut local_stats))?;
        let corrected =
            GvCalculator::new().apply_correction(&trajectory, gv, phoneme_labels, self.config.gv_weight);
        local_stats.smoothness = trajectory_smoothness(&corrected);
        if let Some(out) = stats {
            *out = local_stats;
        }
        Ok(corrected)
    }

    /// Extracts means and diagonal variances from the dominant mixture
    /// component of each state, then generates.
    pub fn generate_from_states(
        &self,
        states: &[&HmmState],
        durations: &[usize],
        stats: Option<&mut TrajectoryStats>,
    ) -> Result<Vec<Array1<f64>>> {
        if states.len() != durations.len() {
            return Err(ModelError::InvalidInput(format!(
                "state count {} does not match duration count {}",
                states.len(),
                durations.len()
            )));
        }
        let mut means = Vec::with_capacity(states.len());
        let mut variances = Vec::with_capacity(states.len());
        for state in states {
            if state.emission.num_components() == 0 {
                return Err(ModelError::InvalidInput(
                    "HMM state has no mixture components".into(),
                ));
            }
            let dominant = state
                .emission
                .weights()
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let component = state.emission.component(dominant);
            means.push(component.mean().clone());
            variances.push(component.covariance().diag().to_owned());
        }
        self.generate_trajectory(&means, &variances, durations, stats)
    }

    fn validate_inputs(
        &self,
        means: &[Array1<f64>],
        variances: &[Array1<f64>],
        durations: &[usize],
    ) -> Result<()> {
        if means.is_empty() || variances.is_empty() || durations.is_empty() {
            return Err(ModelError::InvalidInput("MLPG inputs are empty".into()));
        }
        if means.len() != variances.len() || means.len() != durations.len() {
            return Err(ModelError::InvalidInput(format!(
                "MLPG input lengths disagree: {} means, {} variances, {} durations",
                means.len(),
                variances.len(),
                durations.len()
            )));
        }
        let dimension = means[0].len();
        if dimension == 0 {
            return Err(ModelError::InvalidInput("feature dimension is zero".into()));
        }
        for (index, (mean, variance)) in means.iter().zip(variances).enumerate() {
            if mean.len() != dimension || variance.len() != dimension {
                return Err(ModelError::InvalidInput(format!(
                    "inconsistent feature dimension at state {index}"
                )));
            }
            if durations[index] == 0 {
                return Err(ModelError::InvalidInput(format!(
                    "state {index} has zero duration"
                )));
            }
            if variance.iter().any(|v| *v <= 0.0 || !v.is_finite()) {
                return Err(ModelError::InvalidInput(format!(
                    "non-positive variance at state {index}"
                )));
            }
            if mean.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::InvalidInput(format!(
                    "non-finite mean at state {index}"
                )));
            }
        }
        Ok(())
    }
}

/// Adds one W row's contribution to the normal equations:
/// `A += w rᵀr · p`, `b += rᵀ · p · target`.
fn accumulate_row(
    system: &mut BandedSpd,
    rhs: &mut Array1<f64>,
    t: usize,
    stencil: &Stencil,
    precision: f64,
    target: f64,
) {
    for &(offset_i, coefficient_i) in stencil.taps() {
        let row = (t as isize + offset_i) as usize;
        if target != 0.0 {
            rhs[row] += coefficient_i * precision * target;
        }
        for &(offset_j, coefficient_j) in stencil.taps() {
            let col = (t as isize + offset_j) as usize;
            if row >= col {
                system.add(row, col, coefficient_i * coefficient_j * precision);
            }
        }
    }
}

/// Mean squared second difference; 0 for trajectories shorter than 3.
pub fn trajectory_smoothness(trajectory: &[Array1<f64>]) -> f64 {
    if trajectory.len() < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    for t in 1..trajectory.len() - 1 {
        let accel = &trajectory[t + 1] - &(&trajectory[t] * 2.0) + &trajectory[t - 1];
        total += accel.dot(&accel);
    }
    total / (trajectory.len() - 2) as f64
}

/// Duration-weighted mean of the input variances, the default GV target.
fn duration_weighted_variance(variances: &[Array1<f64>], durations: &[usize]) -> Array1<f64> {
    let mut target = Array1::<f64>::zeros(variances[0].len());
    let mut weight_sum = 0.0;
    for (variance, duration) in variances.iter().zip(durations) {
        let weight = *duration as f64;
        target = target + &(variance * weight);
        weight_sum += weight;
    }
    target / weight_sum
}

fn gv_satisfaction(trajectory: &[Array1<f64>], target: &Array1<f64>) -> f64 {
    if trajectory.is_empty() {
        return 0.0;
    }
    let dimension = trajectory[0].len();
    let mut mean = Array1::<f64>::zeros(dimension);
    for frame in trajectory {
        mean = mean + frame;
    }
    mean /= trajectory.len() as f64;
    let mut current = Array1::<f64>::zeros(dimension);
    for frame in trajectory {
        let diff = frame - &mean;
        current = current + &diff * &diff;
    }
    current /= trajectory.len().max(2) as f64 - 1.0;

    let distance = (&current - target).mapv(|v| v * v).sum().sqrt();
    let scale = target.mapv(|v| v * v).sum().sqrt();
    if scale > 0.0 {
        1.0 - distance / scale
    } else {
        0.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn three_state_inputs() -> (Vec<Array1<f64>>, Vec<Array1<f64>>, Vec<usize>) {
        (
            vec![array![-1.0], array![1.0], array![-0.5]],
            vec![array![0.01], array![0.01], array![0.01]],
            vec![10, 10, 10],
        )
    }

    fn max_second_difference(trajectory: &[Array1<f64>]) -> f64 {
        (1..trajectory.len() - 1)
            .map(|t| (trajectory[t + 1][0] - 2.0 * trajectory[t][0] + trajectory[t - 1][0]).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn trajectory_has_expected_shape() {
        let (means, variances, durations) = three_state_inputs();
        let engine = MlpgEngine::new(MlpgConfig::default());
        let mut stats = TrajectoryStats::default();
        let trajectory = engine
            .generate_trajectory(&means, &variances, &durations, Some(&mut stats))
            .unwrap();
        assert_eq!(trajectory.len(), 30);
        assert!(trajectory.iter().all(|f| f.len() == 1));
        assert_eq!(stats.solver, Some(SolverKind::Cholesky));
        assert!(stats.final_log_likelihood.is_finite());
    }

    #[test]
    fn deltas_smooth_the_trajectory() {
        let (means, variances, durations) = three_state_inputs();

        let smooth_engine = MlpgEngine::new(MlpgConfig {
            use_global_variance: false,
            ..MlpgConfig::default()
        });
        let rough_engine = MlpgEngine::new(MlpgConfig {
            use_delta_features: false,
            use_delta_delta_features: false,
            use_global_variance: false,
            ..MlpgConfig::default()
        });

        let smooth = smooth_engine
            .generate_trajectory(&means, &variances, &durations, None)
            .unwrap();
        let rough = rough_engine
            .generate_trajectory(&means, &variances, &durations, None)
            .unwrap();

        let smooth_max = max_second_difference(&smooth);
        let rough_max = max_second_difference(&rough);
        assert!(
            rough_max >= 2.0 * smooth_max,
            "rough {rough_max} vs smooth {smooth_max}"
        );

        // Mid-duration the trajectory sits near each state mean. The ΔΔ
        // stencil has a non-zero DC response (its taps sum to 0.5), so even
        // a long constant segment settles at ~0.8 of its mean.
        assert!((smooth[5][0] - (-1.0)).abs() < 0.35, "mid a = {}", smooth[5][0]);
        assert!((smooth[15][0] - 1.0).abs() < 0.35, "mid b = {}", smooth[15][0]);
        assert!((smooth[25][0] - (-0.5)).abs() < 0.35, "mid c = {}", smooth[25][0]);
        assert!(smooth[5][0] < -0.5 && smooth[15][0] > 0.5, "means ordered");
    }

    #[test]
    fn without_deltas_statics_are_exact() {
        let (means, variances, durations) = three_state_inputs();
        let engine = MlpgEngine::new(MlpgConfig {
            use_delta_features: false,
            use_delta_delta_features: false,
            use_global_variance: false,
            ..MlpgConfig::default()
        });
        let trajectory = engine
            .generate_trajectory(&means, &variances, &durations, None)
            .unwrap();
        // With only static constraints the solution is the stacked means.
        assert!((trajectory[0][0] + 1.0).abs() < 1e-6);
        assert!((trajectory[15][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn input_validation_fails_fast() {
        let engine = MlpgEngine::new(MlpgConfig::default());
        let err = engine.generate_trajectory(&[], &[], &[], None).unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));

        let err = engine
            .generate_trajectory(
                &[array![0.0]],
                &[array![0.0]], // zero variance
                &[5],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));

        let err = engine
            .generate_trajectory(&[array![0.0]], &[array![1.0]], &[0], None)
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));

        let err = engine
            .generate_trajectory(
                &[array![0.0], array![0.0, 1.0]],
                &[array![1.0], array![1.0, 1.0]],
                &[2, 2],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));
    }

    #[test]
    fn smoothness_metric_is_zero_for_lines() {
        let line: Vec<Array1<f64>> = (0..10).map(|t| array![t as f64]).collect();
        assert!(trajectory_smoothness(&line) < 1e-12);
        let bump: Vec<Array1<f64>> = vec![array![0.0], array![1.0], array![0.0]];
        assert!(trajectory_smoothness(&bump) > 1.0);
    }

    #[test]
    fn generate_from_states_uses_dominant_component() {
        use crate::context::ContextDescriptor;
        use crate::hmm::PhonemeHmm;

        let mut model = PhonemeHmm::new(ContextDescriptor::for_phoneme("a"), 2, 2, 1);
        for (i, mean) in [(-2.0), 2.0].into_iter().enumerate() {
            let state = &mut model.states[i];
            state.emission.component_mut(0).set_mean(array![mean]).unwrap();
            state
                .emission
                .component_mut(0)
                .set_covariance(array![[0.05]])
                .unwrap();
            // A decoy component with tiny weight far away.
            state.emission.component_mut(1).set_mean(array![100.0]).unwrap();
            state
                .emission
                .set_weights(vec![0.9, 0.1])
                .unwrap();
        }
        let engine = MlpgEngine::new(MlpgConfig {
            use_global_variance: false,
            ..MlpgConfig::default()
        });
        let states: Vec<&HmmState> = model.states.iter().collect();
        let trajectory = engine.generate_from_states(&states, &[5, 5], None).unwrap();
        assert_eq!(trajectory.len(), 10);
        assert!(trajectory[2][0] < 0.0);
        assert!(trajectory[7][0] > 0.0);
    }

    #[test]
    fn gv_post_pass_pulls_variance_toward_target() {
        let (means, variances, durations) = three_state_inputs();
        let with_gv = MlpgEngine::new(MlpgConfig::default())
            .generate_trajectory(&means, &variances, &durations, None)
            .unwrap();
        let without_gv = MlpgEngine::new(MlpgConfig {
            use_global_variance: false,
            ..MlpgConfig::default()
        })
        .generate_trajectory(&means, &variances, &durations, None)
        .unwrap();
        let spread = |trajectory: &[Array1<f64>]| {
            let mean: f64 =
                trajectory.iter().map(|f| f[0]).sum::<f64>() / trajectory.len() as f64;
            trajectory.iter().map(|f| (f[0] - mean).powi(2)).sum::<f64>() / trajectory.len() as f64
        };
        // The duration-weighted target variance here is 0.01, far below the
        // raw trajectory spread, so the pass contracts toward it.
        assert!(spread(&with_gv) < spread(&without_gv));
        assert!((spread(&with_gv) - 0.01).abs() < 0.005, "spread {}", spread(&with_gv));
    }
}
