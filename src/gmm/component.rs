//! A single multivariate Gaussian with full covariance.
//!
//! The precision matrix, log-determinant and log normalizer are cached
//! behind a [`OnceCell`] so that read-only evaluation (the common case while
//! aligning and decoding in parallel) never recomputes the inverse, while
//! any mutation of the covariance drops the cache and the next read rebuilds
//! it. `OnceCell` keeps the component `Sync`, which is what lets whole
//! models be shared across worker threads during the E-step.

use crate::error::{ModelError, Result};
use crate::numerics::{self, MIN_VARIANCE};
use ndarray::{Array1, Array2, ArrayView1};
use once_cell::sync::OnceCell;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const LOG_TWO_PI: f64 = 1.8378770664093453;

#[derive(Debug, Clone)]
struct Cache {
    precision: Array2<f64>,
    log_determinant: f64,
    /// `−½(D·log 2π + log|Σ|)`
    log_normalizer: f64,
}

/// One weighted Gaussian mixture component.
#[derive(Debug, Serialize, Deserialize)]
pub struct GaussianComponent {
    #[serde(with = "crate::serde_arrays::array1")]
    mean: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array2")]
    covariance: Array2<f64>,
    weight: f64,
    #[serde(skip)]
    cache: OnceCell<Cache>,
}

impl Clone for GaussianComponent {
    fn clone(&self) -> Self {
        // The cache is cheap to rebuild relative to cloning a matrix and
        // inverse; clones start dirty.
        Self {
            mean: self.mean.clone(),
            covariance: self.covariance.clone(),
            weight: self.weight,
            cache: OnceCell::new(),
        }
    }
}

impl GaussianComponent {
    /// Standard-normal component of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            mean: Array1::zeros(dimension),
            covariance: Array2::eye(dimension),
            weight: 1.0,
            cache: OnceCell::new(),
        }
    }

    pub fn from_parts(mean: Array1<f64>, covariance: Array2<f64>, weight: f64) -> Result<Self> {
        if covariance.nrows() != mean.len() || covariance.ncols() != mean.len() {
            return Err(ModelError::InvalidDimension {
                expected: mean.len(),
                actual: covariance.nrows(),
            });
        }
        if weight < 0.0 || !weight.is_finite() {
            return Err(ModelError::InvalidParameter(format!(
                "component weight must be finite and non-negative, got {weight}"
            )));
        }
        Ok(Self {
            mean,
            covariance,
            weight,
            cache: OnceCell::new(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_mean(&mut self, mean: Array1<f64>) -> Result<()> {
        if mean.len() != self.dimension() {
            return Err(ModelError::InvalidDimension {
                expected: self.dimension(),
                actual: mean.len(),
            });
        }
        // Only the mean changed; the precision cache stays valid.
        self.mean = mean;
        Ok(())
    }

    pub fn set_covariance(&mut self, covariance: Array2<f64>) -> Result<()> {
        if covariance.nrows() != self.dimension() || covariance.ncols() != self.dimension() {
            return Err(ModelError::InvalidDimension {
                expected: self.dimension(),
                actual: covariance.nrows(),
            });
        }
        self.covariance = covariance;
        self.cache = OnceCell::new();
        Ok(())
    }

    pub fn set_weight(&mut self, weight: f64) -> Result<()> {
        if weight < 0.0 || !weight.is_finite() {
            return Err(ModelError::InvalidParameter(format!(
                "component weight must be finite and non-negative, got {weight}"
            )));
        }
        self.weight = weight;
        Ok(())
    }

    pub fn set_parameters(
        &mut self,
        mean: Array1<f64>,
        covariance: Array2<f64>,
        weight: f64,
    ) -> Result<()> {
        self.set_mean(mean)?;
        self.set_covariance(covariance)?;
        self.set_weight(weight)
    }

    fn cache(&self) -> Result<&Cache> {
        self.cache.get_or_try_init(|| {
            let (precision, log_determinant) = numerics::spd_inverse(&self.covariance)?;
            let d = self.dimension() as f64;
            Ok(Cache {
                precision,
                log_determinant,
                log_normalizer: -0.5 * (d * LOG_TWO_PI + log_determinant),
            })
        })
    }

    /// `log N(x | μ, Σ)`.
    pub fn log_pdf(&self, observation: ArrayView1<f64>) -> Result<f64> {
        if observation.len() != self.dimension() {
            return Err(ModelError::InvalidDimension {
                expected: self.dimension(),
                actual: observation.len(),
            });
        }
        let cache = self.cache()?;
        let diff = &observation.to_owned() - &self.mean;
        let mahal = diff.dot(&cache.precision.dot(&diff));
        Ok(cache.log_normalizer - 0.5 * mahal)
    }

    pub fn pdf(&self, observation: ArrayView1<f64>) -> Result<f64> {
        Ok(self.log_pdf(observation)?.exp())
    }

    /// Mahalanobis distance `√((x−μ)ᵀΣ⁻¹(x−μ))`.
    pub fn mahalanobis(&self, observation: ArrayView1<f64>) -> Result<f64> {
        if observation.len() != self.dimension() {
            return Err(ModelError::InvalidDimension {
                expected: self.dimension(),
                actual: observation.len(),
            });
        }
        let cache = self.cache()?;
        let diff = &observation.to_owned() - &self.mean;
        Ok(diff.dot(&cache.precision.dot(&diff)).max(0.0).sqrt())
    }

    pub fn log_determinant(&self) -> Result<f64> {
        Ok(self.cache()?.log_determinant)
    }

    /// Draws a sample via the Cholesky transform `μ + L z`; if the
    /// covariance resists factorization the diagonal square root stands in.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let z = Array1::from_iter((0..self.dimension()).map(|_| rng.sample::<f64, _>(StandardNormal)));
        match numerics::cholesky(&self.covariance) {
            Some(l) => &self.mean + &l.dot(&z),
            None => {
                let std_dev = self.covariance.diag().mapv(|v| v.max(0.0).sqrt());
                &self.mean + &(std_dev * z)
            }
        }
    }

    pub fn sample_n<R: Rng + ?Sized>(&self, rng: &mut R, count: usize) -> Vec<Array1<f64>> {
        (0..count).map(|_| self.sample(rng)).collect()
    }

    /// Finite parameters, non-negative weight, positive-definite covariance.
    pub fn is_valid(&self) -> bool {
        self.mean.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite())
            && self.weight.is_finite()
            && self.weight >= 0.0
            && numerics::cholesky(&self.covariance).is_some()
    }

    /// Floors the covariance diagonal at `min_variance`, repairs positive
    /// definiteness and invalidates the cache.
    pub fn regularize(&mut self, min_variance: f64) {
        for i in 0..self.dimension() {
            if self.covariance[[i, i]] < min_variance {
                self.covariance[[i, i]] = min_variance;
            }
        }
        numerics::repair_psd(&mut self.covariance, min_variance.max(MIN_VARIANCE));
        self.cache = OnceCell::new();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn log_pdf_matches_closed_form_1d() {
        let g = GaussianComponent::from_parts(array![0.0], array![[1.0]], 1.0).unwrap();
        // Standard normal at 0: -0.5 ln(2π)
        let v = g.log_pdf(array![0.0].view()).unwrap();
        assert!((v + 0.5 * LOG_TWO_PI).abs() < 1e-12);
        let v1 = g.log_pdf(array![1.0].view()).unwrap();
        assert!((v1 - (v - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let g = GaussianComponent::new(2);
        assert!(matches!(
            g.log_pdf(array![1.0].view()),
            Err(ModelError::InvalidDimension { .. })
        ));
    }

    #[test]
    fn negative_weight_rejected() {
        let mut g = GaussianComponent::new(1);
        assert!(matches!(
            g.set_weight(-0.5),
            Err(ModelError::InvalidParameter(_))
        ));
        assert!(GaussianComponent::from_parts(array![0.0], array![[1.0]], -1.0).is_err());
    }

    #[test]
    fn regularize_fixes_degenerate_covariance() {
        let mut g =
            GaussianComponent::from_parts(array![0.0, 0.0], array![[0.0, 0.0], [0.0, 0.0]], 1.0)
                .unwrap();
        g.regularize(1e-6);
        assert!(g.is_valid());
        assert!(g.log_determinant().unwrap().is_finite());
    }

    #[test]
    fn cache_invalidated_on_covariance_change() {
        let mut g = GaussianComponent::new(1);
        let before = g.log_pdf(array![0.5].view()).unwrap();
        g.set_covariance(array![[4.0]]).unwrap();
        let after = g.log_pdf(array![0.5].view()).unwrap();
        assert!(after != before);
        // Wider variance, lower peak density.
        assert!(after < g.log_pdf(array![0.0].view()).unwrap());
    }

    #[test]
    fn mahalanobis_of_mean_is_zero() {
        let g = GaussianComponent::from_parts(array![1.0, -1.0], Array2::eye(2) * 2.0, 1.0).unwrap();
        assert!(g.mahalanobis(array![1.0, -1.0].view()).unwrap() < 1e-12);
    }

    #[test]
    fn sampling_tracks_mean() {
        let g = GaussianComponent::from_parts(array![3.0], array![[0.01]], 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let samples = g.sample_n(&mut rng, 200);
        let mean: f64 = samples.iter().map(|s| s[0]).sum::<f64>() / 200.0;
        assert!((mean - 3.0).abs() < 0.05);
    }

    #[test]
    fn serde_round_trip_preserves_log_pdf() {
        let g = GaussianComponent::from_parts(
            array![0.3, -0.7],
            array![[1.5, 0.2], [0.2, 0.9]],
            0.4,
        )
        .unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: GaussianComponent = serde_json::from_str(&json).unwrap();
        let x = array![0.1, 0.2];
        let a = g.log_pdf(x.view()).unwrap();
        let b = back.log_pdf(x.view()).unwrap();
        assert!((a - b).abs() < 1e-12);
        assert!((back.weight() - 0.4).abs() < 1e-15);
    }
}
