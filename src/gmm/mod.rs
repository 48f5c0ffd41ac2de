//! Gaussian mixture models used as HMM emission distributions.
//!
//! The mixture carries the full EM machinery: responsibilities and
//! sufficient statistics, plain and observation-weighted EM steps (the
//! weighted variant is how Baum–Welch posteriors flow in from the trainer),
//! k-means initialization, and AIC/BIC model selection. All likelihood math
//! stays in the log domain; see `numerics::log_sum_exp`.

pub mod component;

pub use component::GaussianComponent;

use crate::error::{ModelError, Result};
use crate::numerics::{self, log_sum_exp, MIN_VARIANCE};
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Weights below this are considered empty and eligible for pruning.
pub const MIN_WEIGHT: f64 = 1e-10;

/// Floor for log-domain quantities, preventing `log(0)` propagation.
const LOG_EPSILON: f64 = -700.0;

/// Accumulated statistics for one component over a data pass:
/// `γ`, `Σ γ·x` and `Σ γ·x·xᵀ`.
#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    pub gamma: f64,
    pub gamma_x: Array1<f64>,
    pub gamma_xx: Array2<f64>,
}

impl SufficientStatistics {
    pub fn new(dimension: usize) -> Self {
        Self {
            gamma: 0.0,
            gamma_x: Array1::zeros(dimension),
            gamma_xx: Array2::zeros((dimension, dimension)),
        }
    }

    pub fn accumulate(&mut self, observation: ArrayView1<f64>, responsibility: f64) {
        self.gamma += responsibility;
        for i in 0..observation.len() {
            self.gamma_x[i] += responsibility * observation[i];
            for j in 0..observation.len() {
                self.gamma_xx[[i, j]] += responsibility * observation[i] * observation[j];
            }
        }
    }

    /// Maximum-likelihood mean and covariance from the accumulators, with
    /// the covariance projected back onto the PSD cone.
    pub fn to_parameters(&self) -> Option<(Array1<f64>, Array2<f64>)> {
        if self.gamma <= 0.0 {
            return None;
        }
        let mean = &self.gamma_x / self.gamma;
        let mut covariance = &self.gamma_xx / self.gamma;
        for i in 0..mean.len() {
            for j in 0..mean.len() {
                covariance[[i, j]] -= mean[i] * mean[j];
            }
        }
        numerics::repair_psd(&mut covariance, MIN_VARIANCE);
        Some((mean, covariance))
    }
}

/// A weighted mixture of Gaussians.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixture {
    components: Vec<GaussianComponent>,
    weights: Vec<f64>,
    dimension: usize,
}

impl GaussianMixture {
    /// Uniformly weighted standard-normal components.
    pub fn new(num_components: usize, dimension: usize) -> Self {
        let uniform = 1.0 / num_components.max(1) as f64;
        Self {
            components: (0..num_components)
                .map(|_| GaussianComponent::new(dimension))
                .collect(),
            weights: vec![uniform; num_components],
            dimension,
        }
    }

    pub fn from_components(components: Vec<GaussianComponent>) -> Result<Self> {
        let dimension = components.first().map(|c| c.dimension()).unwrap_or(0);
        for c in &components {
            if c.dimension() != dimension {
                return Err(ModelError::InvalidDimension {
                    expected: dimension,
                    actual: c.dimension(),
                });
            }
        }
        let uniform = 1.0 / components.len().max(1) as f64;
        let weights = vec![uniform; components.len()];
        Ok(Self {
            components,
            weights,
            dimension,
        })
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn component(&self, index: usize) -> &GaussianComponent {
        &self.components[index]
    }

    pub fn component_mut(&mut self, index: usize) -> &mut GaussianComponent {
        &mut self.components[index]
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        if weights.len() != self.components.len() {
            return Err(ModelError::InvalidDimension {
                expected: self.components.len(),
                actual: weights.len(),
            });
        }
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ModelError::InvalidParameter(
                "mixture weights must be finite and non-negative".into(),
            ));
        }
        self.weights = weights;
        self.normalize_weights();
        Ok(())
    }

    pub fn add_component(&mut self, component: GaussianComponent) -> Result<()> {
        if self.components.is_empty() {
            self.dimension = component.dimension();
        } else if component.dimension() != self.dimension {
            return Err(ModelError::InvalidDimension {
                expected: self.dimension,
                actual: component.dimension(),
            });
        }
        self.weights.push(component.weight());
        self.components.push(component);
        self.normalize_weights();
        Ok(())
    }

    pub fn remove_component(&mut self, index: usize) {
        self.components.remove(index);
        self.weights.remove(index);
        self.normalize_weights();
    }

    /// Rescales weights to sum to one; an all-zero weight vector resets to
    /// uniform.
    pub fn normalize_weights(&mut self) {
        let sum: f64 = self.weights.iter().sum();
        if sum > 0.0 {
            for w in &mut self.weights {
                *w /= sum;
            }
        } else if !self.weights.is_empty() {
            let uniform = 1.0 / self.weights.len() as f64;
            self.weights.fill(uniform);
        }
    }

    pub fn remove_empty_components(&mut self, min_weight: f64) {
        for i in (0..self.components.len()).rev() {
            if self.weights[i] < min_weight && self.components.len() > 1 {
                self.components.remove(i);
                self.weights.remove(i);
            }
        }
        self.normalize_weights();
    }

    pub fn regularize(&mut self, min_variance: f64) {
        for c in &mut self.components {
            c.regularize(min_variance);
        }
        self.remove_empty_components(MIN_WEIGHT);
    }

    /// Per-component `log wₖ + log Nₖ(x)`.
    fn weighted_component_logs(&self, observation: ArrayView1<f64>) -> Result<Vec<f64>> {
        self.components
            .iter()
            .zip(&self.weights)
            .map(|(c, w)| {
                let log_w = if *w > 0.0 { w.ln() } else { LOG_EPSILON };
                Ok(log_w + c.log_pdf(observation)?)
            })
            .collect()
    }

    /// `log p(x)` under the mixture.
    pub fn log_likelihood(&self, observation: ArrayView1<f64>) -> Result<f64> {
        if self.components.is_empty() {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_sum_exp(&self.weighted_component_logs(observation)?))
    }

    /// Posterior component responsibilities for one observation; sums to 1.
    pub fn responsibilities(&self, observation: ArrayView1<f64>) -> Result<Vec<f64>> {
        let logs = self.weighted_component_logs(observation)?;
        let total = log_sum_exp(&logs);
        if !total.is_finite() {
            // Degenerate likelihood everywhere: fall back to uniform so EM
            // can still make progress.
            let uniform = 1.0 / self.components.len().max(1) as f64;
            return Ok(vec![uniform; self.components.len()]);
        }
        Ok(logs.iter().map(|l| (l - total).exp()).collect())
    }

    pub fn most_likely_component(&self, observation: ArrayView1<f64>) -> Result<usize> {
        let logs = self.weighted_component_logs(observation)?;
        Ok(logs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0))
    }

    /// Mean per-observation log-likelihood over a sequence.
    pub fn log_likelihood_sequence(&self, observations: &[Array1<f64>]) -> Result<f64> {
        if observations.is_empty() {
            return Ok(f64::NEG_INFINITY);
        }
        let mut total = 0.0;
        for obs in observations {
            total += self.log_likelihood(obs.view())?;
        }
        Ok(total / observations.len() as f64)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        if self.components.is_empty() {
            return Array1::zeros(self.dimension);
        }
        let mut pick: f64 = rng.gen::<f64>();
        let mut index = self.components.len() - 1;
        for (i, w) in self.weights.iter().enumerate() {
            if pick < *w {
                index = i;
                break;
            }
            pick -= w;
        }
        self.components[index].sample(rng)
    }

    /// One EM step over unweighted observations. Returns the mean
    /// log-likelihood after the update.
    pub fn em_step(&mut self, observations: &[Array1<f64>]) -> Result<f64> {
        self.weighted_em_step_inner(observations, None)
    }

    /// One EM step with an external per-observation weight (HMM state
    /// posteriors during Baum–Welch) multiplied into the responsibilities.
    pub fn weighted_em_step(
        &mut self,
        observations: &[Array1<f64>],
        observation_weights: &[f64],
    ) -> Result<f64> {
        if observations.len() != observation_weights.len() {
            return Err(ModelError::InvalidDimension {
                expected: observations.len(),
                actual: observation_weights.len(),
            });
        }
        self.weighted_em_step_inner(observations, Some(observation_weights))
    }

    fn weighted_em_step_inner(
        &mut self,
        observations: &[Array1<f64>],
        observation_weights: Option<&[f64]>,
    ) -> Result<f64> {
        if observations.is_empty() || self.components.is_empty() {
            return Ok(f64::NEG_INFINITY);
        }

        let mut statistics: Vec<SufficientStatistics> = (0..self.components.len())
            .map(|_| SufficientStatistics::new(self.dimension))
            .collect();

        for (idx, obs) in observations.iter().enumerate() {
            let obs_weight = observation_weights.map(|w| w[idx]).unwrap_or(1.0);
            if obs_weight <= 0.0 {
                continue;
            }
            let resp = self.responsibilities(obs.view())?;
            for (stat, r) in statistics.iter_mut().zip(resp) {
                stat.accumulate(obs.view(), r * obs_weight);
            }
        }

        self.update_from_statistics(&statistics)?;

        match observation_weights {
            None => self.log_likelihood_sequence(observations),
            Some(weights) => {
                let mut total = 0.0;
                let mut total_weight = 0.0;
                for (obs, w) in observations.iter().zip(weights) {
                    if *w > 0.0 {
                        total += w * self.log_likelihood(obs.view())?;
                        total_weight += w;
                    }
                }
                Ok(if total_weight > 0.0 {
                    total / total_weight
                } else {
                    f64::NEG_INFINITY
                })
            }
        }
    }

    fn update_from_statistics(&mut self, statistics: &[SufficientStatistics]) -> Result<()> {
        let total_gamma: f64 = statistics.iter().map(|s| s.gamma).sum();
        if total_gamma <= 0.0 {
            return Ok(());
        }
        for (i, stat) in statistics.iter().enumerate() {
            // Components that collected effectively nothing keep their
            // parameters and are pruned below.
            if stat.gamma <= MIN_WEIGHT {
                continue;
            }
            let weight = stat.gamma / total_gamma;
            self.weights[i] = weight;
            if let Some((mean, covariance)) = stat.to_parameters() {
                self.components[i].set_parameters(mean, covariance, weight)?;
            }
        }
        self.normalize_weights();
        Ok(())
    }

    /// Runs EM until `|ΔLL| < tolerance` or `max_iterations`; returns the
    /// final mean log-likelihood.
    pub fn train_em(
        &mut self,
        observations: &[Array1<f64>],
        max_iterations: usize,
        tolerance: f64,
    ) -> Result<f64> {
        if observations.is_empty() {
            return Ok(f64::NEG_INFINITY);
        }
        let mut previous = self.log_likelihood_sequence(observations)?;
        let mut current = previous;
        for _ in 0..max_iterations {
            current = self.em_step(observations)?;
            if !current.is_finite() && !previous.is_finite() {
                return Err(ModelError::NumericalFailure(
                    "EM diverged to non-finite likelihood".into(),
                ));
            }
            if (current - previous).abs() < tolerance {
                break;
            }
            previous = current;
        }
        self.remove_empty_components(MIN_WEIGHT);
        Ok(current)
    }

    /// Weighted EM loop with the same convergence rule as [`train_em`].
    ///
    /// [`train_em`]: GaussianMixture::train_em
    pub fn train_weighted_em(
        &mut self,
        observations: &[Array1<f64>],
        observation_weights: &[f64],
        max_iterations: usize,
        tolerance: f64,
    ) -> Result<f64> {
        if observations.is_empty() {
            return Ok(f64::NEG_INFINITY);
        }
        let mut previous = f64::NEG_INFINITY;
        let mut current = previous;
        for _ in 0..max_iterations {
            current = self.weighted_em_step(observations, observation_weights)?;
            if current.is_finite() && (current - previous).abs() < tolerance {
                break;
            }
            previous = current;
        }
        self.remove_empty_components(MIN_WEIGHT);
        Ok(current)
    }

    /// K-means initialization: cluster, then fit one component per cluster.
    /// Runs at most `max_iterations` rounds or until no assignment changes.
    pub fn initialize_kmeans<R: Rng + ?Sized>(
        &mut self,
        data: &[Array1<f64>],
        num_components: usize,
        max_iterations: usize,
        rng: &mut R,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(ModelError::InvalidParameter(
                "cannot initialize a mixture from empty data".into(),
            ));
        }
        self.dimension = data[0].len();
        let assignments = kmeans_clustering(data, num_components, max_iterations, rng)?;

        self.components.clear();
        self.weights.clear();

        for k in 0..num_components {
            let cluster: Vec<&Array1<f64>> = data
                .iter()
                .zip(&assignments)
                .filter(|(_, a)| **a == k)
                .map(|(d, _)| d)
                .collect();

            if cluster.is_empty() {
                // Re-seed dead clusters near the overall mean with a scaled
                // copy of the data covariance.
                warn!(cluster = k, "empty k-means cluster, re-seeding randomly");
                let (mean, covariance) = data_moments(data);
                let mut seeded = mean.clone();
                for j in 0..seeded.len() {
                    let jitter: f64 = rng.sample(rand_distr::StandardNormal);
                    seeded[j] += jitter * covariance[[j, j]].max(MIN_VARIANCE).sqrt() * 0.5;
                }
                let mut scaled = covariance * 0.5;
                numerics::repair_psd(&mut scaled, MIN_VARIANCE);
                self.components
                    .push(GaussianComponent::from_parts(seeded, scaled, 1.0)?);
                self.weights.push(1.0 / num_components as f64);
                continue;
            }

            let mut mean = Array1::<f64>::zeros(self.dimension);
            for point in &cluster {
                mean = mean + *point;
            }
            mean /= cluster.len() as f64;

            let mut covariance = Array2::<f64>::zeros((self.dimension, self.dimension));
            for point in &cluster {
                let diff = *point - &mean;
                for i in 0..self.dimension {
                    for j in 0..self.dimension {
                        covariance[[i, j]] += diff[i] * diff[j];
                    }
                }
            }
            covariance /= cluster.len() as f64;
            for i in 0..self.dimension {
                covariance[[i, i]] += MIN_VARIANCE;
            }

            self.components
                .push(GaussianComponent::from_parts(mean, covariance, 1.0)?);
            self.weights.push(cluster.len() as f64 / data.len() as f64);
        }

        self.normalize_weights();
        Ok(())
    }

    /// Free parameter count `K·(D + D(D+1)/2) + (K−1)`.
    pub fn effective_parameters(&self) -> usize {
        if self.components.is_empty() {
            return 0;
        }
        let d = self.dimension;
        let per_component = d + d * (d + 1) / 2;
        self.components.len() * per_component + (self.components.len() - 1)
    }

    /// Akaike information criterion: `−2·LL + 2·p` (total LL, not per-frame).
    pub fn aic(&self, observations: &[Array1<f64>]) -> Result<f64> {
        let ll = self.log_likelihood_sequence(observations)? * observations.len() as f64;
        Ok(-2.0 * ll + 2.0 * self.effective_parameters() as f64)
    }

    /// Bayesian information criterion: `−2·LL + p·log N`.
    pub fn bic(&self, observations: &[Array1<f64>]) -> Result<f64> {
        let ll = self.log_likelihood_sequence(observations)? * observations.len() as f64;
        let n = observations.len() as f64;
        Ok(-2.0 * ll + self.effective_parameters() as f64 * n.ln())
    }

    /// Overall mixture mean `Σ wₖ μₖ`.
    pub fn mean(&self) -> Array1<f64> {
        let mut mean = Array1::<f64>::zeros(self.dimension);
        for (c, w) in self.components.iter().zip(&self.weights) {
            mean = mean + c.mean() * *w;
        }
        mean
    }

    /// Overall mixture covariance `Σ wₖ (Σₖ + (μₖ−μ)(μₖ−μ)ᵀ)`.
    pub fn covariance(&self) -> Array2<f64> {
        let mean = self.mean();
        let mut covariance = Array2::<f64>::zeros((self.dimension, self.dimension));
        for (c, w) in self.components.iter().zip(&self.weights) {
            let diff = c.mean() - &mean;
            for i in 0..self.dimension {
                for j in 0..self.dimension {
                    covariance[[i, j]] += w * (c.covariance()[[i, j]] + diff[i] * diff[j]);
                }
            }
        }
        covariance
    }

    pub fn is_valid(&self) -> bool {
        if self.components.len() != self.weights.len() {
            return false;
        }
        let sum: f64 = self.weights.iter().sum();
        (sum - 1.0).abs() < 1e-6 && self.components.iter().all(|c| c.is_valid())
    }
}

/// Criterion for [`create_from_data`] model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCriterion {
    Aic,
    Bic,
}

/// Fits mixtures with 1..=`max_components` components and keeps the one the
/// criterion prefers.
pub fn create_from_data<R: Rng + ?Sized>(
    data: &[Array1<f64>],
    max_components: usize,
    criterion: SelectionCriterion,
    rng: &mut R,
) -> Result<GaussianMixture> {
    if data.is_empty() {
        return Err(ModelError::InvalidParameter(
            "cannot select a mixture from empty data".into(),
        ));
    }
    let mut best: Option<(f64, GaussianMixture)> = None;
    for k in 1..=max_components.max(1) {
        let mut model = GaussianMixture::new(k, data[0].len());
        model.initialize_kmeans(data, k, 100, rng)?;
        model.train_em(data, 50, 1e-4)?;
        let score = match criterion {
            SelectionCriterion::Aic => -model.aic(data)?,
            SelectionCriterion::Bic => -model.bic(data)?,
        };
        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, model));
        }
    }
    Ok(best.expect("at least one candidate fitted").1)
}

fn data_moments(data: &[Array1<f64>]) -> (Array1<f64>, Array2<f64>) {
    let dim = data[0].len();
    let mut mean = Array1::<f64>::zeros(dim);
    for point in data {
        mean = mean + point;
    }
    mean /= data.len() as f64;
    let mut covariance = Array2::<f64>::zeros((dim, dim));
    for point in data {
        let diff = point - &mean;
        for i in 0..dim {
            for j in 0..dim {
                covariance[[i, j]] += diff[i] * diff[j];
            }
        }
    }
    covariance /= data.len() as f64;
    (mean, covariance)
}

/// Plain Lloyd's algorithm; centroids seeded from uniformly sampled points.
fn kmeans_clustering<R: Rng + ?Sized>(
    data: &[Array1<f64>],
    num_clusters: usize,
    max_iterations: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    if num_clusters == 0 {
        return Err(ModelError::InvalidParameter(
            "k-means requires at least one cluster".into(),
        ));
    }
    let mut centroids: Vec<Array1<f64>> = (0..num_clusters)
        .map(|_| data[rng.gen_range(0..data.len())].clone())
        .collect();
    let mut assignments = vec![0usize; data.len()];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (i, point) in data.iter().enumerate() {
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (k, centroid) in centroids.iter().enumerate() {
                let diff = point - centroid;
                let distance = diff.dot(&diff);
                if distance < best_distance {
                    best_distance = distance;
                    best = k;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        let dim = data[0].len();
        let mut sums = vec![Array1::<f64>::zeros(dim); num_clusters];
        let mut counts = vec![0usize; num_clusters];
        for (point, a) in data.iter().zip(&assignments) {
            sums[*a] = &sums[*a] + point;
            counts[*a] += 1;
        }
        for k in 0..num_clusters {
            if counts[k] > 0 {
                centroids[k] = &sums[k] / counts[k] as f64;
            }
        }
    }
    Ok(assignments)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn two_blob_data(rng: &mut StdRng) -> Vec<Array1<f64>> {
        let unit = Normal::new(0.0, 1.0).unwrap();
        let mut data = Vec::with_capacity(200);
        for i in 0..200 {
            let center = if i % 2 == 0 { -3.0 } else { 3.0 };
            data.push(array![
                center + unit.sample(rng),
                unit.sample(rng)
            ]);
        }
        data
    }

    #[test]
    fn weights_stay_normalized() {
        let mut gmm = GaussianMixture::new(3, 2);
        gmm.set_weights(vec![2.0, 1.0, 1.0]).unwrap();
        let sum: f64 = gmm.weights().iter().sum();
        assert!((sum - 1.0).abs() <= 1e-9);
        assert!(gmm.weights().iter().all(|w| *w >= 0.0));
        gmm.remove_component(0);
        let sum: f64 = gmm.weights().iter().sum();
        assert!((sum - 1.0).abs() <= 1e-9);
    }

    #[test]
    fn responsibilities_sum_to_one() {
        let mut gmm = GaussianMixture::new(2, 1);
        gmm.component_mut(0).set_mean(array![-1.0]).unwrap();
        gmm.component_mut(1).set_mean(array![1.0]).unwrap();
        let resp = gmm.responsibilities(array![0.3].view()).unwrap();
        let sum: f64 = resp.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(resp[1] > resp[0]);
    }

    #[test]
    fn em_monotonically_improves() {
        let mut rng = StdRng::seed_from_u64(11);
        let data = two_blob_data(&mut rng);
        let mut gmm = GaussianMixture::new(2, 2);
        gmm.initialize_kmeans(&data, 2, 100, &mut rng).unwrap();
        let mut previous = gmm.log_likelihood_sequence(&data).unwrap();
        for _ in 0..10 {
            let current = gmm.em_step(&data).unwrap();
            assert!(current >= previous - 1e-6, "{current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn kmeans_em_recovers_two_gaussians() {
        // Scenario: 200 points from N((-3,0), I) and N((3,0), I), K=2.
        let mut rng = StdRng::seed_from_u64(42);
        let data = two_blob_data(&mut rng);
        let mut gmm = GaussianMixture::new(2, 2);
        gmm.initialize_kmeans(&data, 2, 100, &mut rng).unwrap();
        let ll = gmm.train_em(&data, 50, 1e-6).unwrap();

        assert_eq!(gmm.num_components(), 2);
        let mut centers: Vec<f64> = (0..2).map(|i| gmm.component(i).mean()[0]).collect();
        centers.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((centers[0] + 3.0).abs() < 0.3, "left center {}", centers[0]);
        assert!((centers[1] - 3.0).abs() < 0.3, "right center {}", centers[1]);
        for w in gmm.weights() {
            assert!(*w > 0.45 && *w < 0.55, "weight {w}");
        }
        // Expected per-sample log-likelihood of this mixture is about
        // −(ln 2 + ln 2π + 1) ≈ −3.5; anything close means the fit is tight.
        assert!(ll > -4.0, "per-sample log-likelihood {ll}");
    }

    #[test]
    fn weighted_em_downweights_outliers() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut data: Vec<Array1<f64>> = Vec::new();
        let mut weights = Vec::new();
        let unit = Normal::new(0.0, 0.2).unwrap();
        for _ in 0..50 {
            data.push(array![unit.sample(&mut rng)]);
            weights.push(1.0);
        }
        // Heavy outliers with negligible weight should barely move the mean.
        data.push(array![50.0]);
        weights.push(1e-12);
        let mut gmm = GaussianMixture::new(1, 1);
        gmm.train_weighted_em(&data, &weights, 20, 1e-8).unwrap();
        assert!(gmm.component(0).mean()[0].abs() < 0.2);
    }

    #[test]
    fn information_criteria_count_parameters() {
        let gmm = GaussianMixture::new(2, 3);
        // K=2, D=3: 2*(3+6) + 1 = 19
        assert_eq!(gmm.effective_parameters(), 19);
        let data = vec![array![0.0, 0.0, 0.0], array![0.1, 0.0, -0.1]];
        let aic = gmm.aic(&data).unwrap();
        let bic = gmm.bic(&data).unwrap();
        assert!(aic.is_finite() && bic.is_finite());
    }

    #[test]
    fn model_selection_prefers_two_components() {
        let mut rng = StdRng::seed_from_u64(21);
        let data = two_blob_data(&mut rng);
        let model = create_from_data(&data, 3, SelectionCriterion::Bic, &mut rng).unwrap();
        assert_eq!(model.num_components(), 2);
    }

    #[test]
    fn empty_components_are_pruned() {
        let mut gmm = GaussianMixture::new(2, 1);
        gmm.set_weights(vec![1.0, 0.0]).unwrap();
        gmm.remove_empty_components(MIN_WEIGHT);
        assert_eq!(gmm.num_components(), 1);
        assert!((gmm.weights()[0] - 1.0).abs() < 1e-12);
    }
}
