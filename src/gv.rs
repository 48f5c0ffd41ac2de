//! Global Variance statistics and trajectory correction.
//!
//! HMM parameter generation over-smooths: the generated trajectory's
//! per-dimension variance collapses well below what real data shows. The
//! calculator here collects per-phoneme and global variance statistics from
//! training data, persists them as JSON, and rescales generated trajectories
//! back toward the target variance.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::hmm::alignment::SequenceAlignment;
use crate::numerics::MIN_VARIANCE;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Clamp range for the per-dimension correction factor.
pub const MIN_GV_WEIGHT: f64 = 0.01;
pub const MAX_GV_WEIGHT: f64 = 2.0;

/// Learning rate of the incremental (EMA) statistics update.
const INCREMENTAL_ALPHA: f64 = 0.1;

/// Variance statistics for one phoneme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonemeGv {
    #[serde(with = "crate::serde_arrays::array1")]
    pub mean: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub var: Array1<f64>,
    pub frame_count: usize,
}

/// Collected GV statistics: a per-phoneme map plus a global fallback. The
/// feature dimension is fixed at initialization; sequences of any other
/// dimension are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GvStatistics {
    pub feature_dimension: usize,
    pub total_frames: usize,
    #[serde(with = "crate::serde_arrays::array1")]
    pub global_gv_mean: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub global_gv_var: Array1<f64>,
    pub phoneme_statistics: BTreeMap<String, PhonemeGv>,
}

impl GvStatistics {
    pub fn new(feature_dimension: usize) -> Self {
        Self {
            feature_dimension,
            total_frames: 0,
            global_gv_mean: Array1::zeros(feature_dimension),
            global_gv_var: Array1::zeros(feature_dimension),
            phoneme_statistics: BTreeMap::new(),
        }
    }

    pub fn has_phoneme(&self, phoneme: &str) -> bool {
        self.phoneme_statistics.contains_key(phoneme)
    }

    /// Target variance for a phoneme, falling back to the global statistics
    /// when the phoneme was never seen.
    pub fn target_variance(&self, phoneme: &str) -> &Array1<f64> {
        self.phoneme_statistics
            .get(phoneme)
            .map(|p| &p.mean)
            .unwrap_or(&self.global_gv_mean)
    }

    /// Structural validity: dimensions agree and variances are finite and
    /// above the floor.
    pub fn is_valid(&self) -> bool {
        self.feature_dimension > 0
            && self.global_gv_mean.len() == self.feature_dimension
            && self.global_gv_var.len() == self.feature_dimension
            && self
                .global_gv_mean
                .iter()
                .all(|v| v.is_finite() && *v >= 0.0)
            && self.global_gv_var.iter().all(|v| v.is_finite() && *v >= MIN_VARIANCE)
            && self.phoneme_statistics.values().all(|p| {
                p.mean.len() == self.feature_dimension && p.var.len() == self.feature_dimension
            })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Computes and applies GV statistics.
#[derive(Debug, Default)]
pub struct GvCalculator;

impl GvCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Unbiased per-dimension sample variance over a sequence's frames,
    /// clamped to at least `MIN_VARIANCE`.
    pub fn sequence_variance(&self, sequence: &[Array1<f64>]) -> Array1<f64> {
        frame_variance(sequence.iter(), sequence.len(), true)
    }

    /// GV statistics from per-frame phoneme labels.
    pub fn calculate_statistics(
        &self,
        sequences: &[Vec<Array1<f64>>],
        phoneme_labels: &[Vec<String>],
    ) -> GvStatistics {
        let dimension = sequences
            .iter()
            .find_map(|s| s.first())
            .map(|f| f.len())
            .unwrap_or(0);
        let mut stats = GvStatistics::new(dimension);
        if dimension == 0 {
            return stats;
        }

        let mut phoneme_frames: BTreeMap<&str, Vec<&Array1<f64>>> = BTreeMap::new();
        let mut all_frames: Vec<&Array1<f64>> = Vec::new();
        for (sequence, labels) in sequences.iter().zip(phoneme_labels) {
            for (frame, label) in sequence.iter().zip(labels) {
                phoneme_frames.entry(label.as_str()).or_default().push(frame);
                all_frames.push(frame);
            }
        }
        self.fill_from_buckets(&mut stats, phoneme_frames, all_frames);
        stats
    }

    /// GV statistics bucketed by alignment boundaries instead of per-frame
    /// labels.
    pub fn calculate_statistics_with_alignment(
        &self,
        sequences: &[Vec<Array1<f64>>],
        alignments: &[SequenceAlignment],
    ) -> GvStatistics {
        let dimension = sequences
            .iter()
            .find_map(|s| s.first())
            .map(|f| f.len())
            .unwrap_or(0);
        let mut stats = GvStatistics::new(dimension);
        if dimension == 0 {
            return stats;
        }

        let mut phoneme_frames: BTreeMap<&str, Vec<&Array1<f64>>> = BTreeMap::new();
        let mut all_frames: Vec<&Array1<f64>> = Vec::new();
        for (sequence, alignment) in sequences.iter().zip(alignments) {
            for boundary in &alignment.boundaries {
                let end = boundary.end_frame.min(sequence.len());
                for frame in &sequence[boundary.start_frame.min(end)..end] {
                    phoneme_frames
                        .entry(boundary.phoneme.as_str())
                        .or_default()
                        .push(frame);
                }
            }
            all_frames.extend(sequence.iter());
        }
        self.fill_from_buckets(&mut stats, phoneme_frames, all_frames);
        stats
    }

    fn fill_from_buckets(
        &self,
        stats: &mut GvStatistics,
        phoneme_frames: BTreeMap<&str, Vec<&Array1<f64>>>,
        all_frames: Vec<&Array1<f64>>,
    ) {
        for (phoneme, frames) in phoneme_frames {
            if frames.is_empty() {
                continue;
            }
            let variance = frame_variance(frames.iter().copied(), frames.len(), false);
            stats.phoneme_statistics.insert(
                phoneme.to_string(),
                PhonemeGv {
                    var: spread_of(&variance),
                    mean: variance,
                    frame_count: frames.len(),
                },
            );
        }
        if !all_frames.is_empty() {
            let variance = frame_variance(all_frames.iter().copied(), all_frames.len(), false);
            stats.global_gv_var = spread_of(&variance);
            stats.global_gv_mean = variance;
            stats.total_frames = all_frames.len();
        }
        debug!(
            phonemes = stats.phoneme_statistics.len(),
            frames = stats.total_frames,
            "collected GV statistics"
        );
    }

    /// Folds one new labelled sequence into existing statistics with an
    /// exponential moving average on the variance vectors.
    pub fn update_statistics(
        &self,
        stats: &mut GvStatistics,
        sequence: &[Array1<f64>],
        phoneme_labels: &[String],
    ) {
        if sequence.is_empty() {
            return;
        }
        if stats.feature_dimension == 0 {
            *stats = GvStatistics::new(sequence[0].len());
        }
        if sequence[0].len() != stats.feature_dimension {
            warn!(
                expected = stats.feature_dimension,
                actual = sequence[0].len(),
                "sequence dimension mismatch in incremental GV update"
            );
            return;
        }

        let mut phoneme_frames: BTreeMap<&str, Vec<&Array1<f64>>> = BTreeMap::new();
        for (frame, label) in sequence.iter().zip(phoneme_labels) {
            phoneme_frames.entry(label.as_str()).or_default().push(frame);
        }
        for (phoneme, frames) in phoneme_frames {
            let variance = frame_variance(frames.iter().copied(), frames.len(), false);
            match stats.phoneme_statistics.get_mut(phoneme) {
                Some(existing) => {
                    existing.mean = &existing.mean * (1.0 - INCREMENTAL_ALPHA)
                        + &variance * INCREMENTAL_ALPHA;
                    existing.frame_count += frames.len();
                }
                None => {
                    stats.phoneme_statistics.insert(
                        phoneme.to_string(),
                        PhonemeGv {
                            var: spread_of(&variance),
                            mean: variance,
                            frame_count: frames.len(),
                        },
                    );
                }
            }
        }

        let sequence_variance = frame_variance(sequence.iter(), sequence.len(), false);
        if stats.total_frames > 0 {
            stats.global_gv_mean = &stats.global_gv_mean * (1.0 - INCREMENTAL_ALPHA)
                + &sequence_variance * INCREMENTAL_ALPHA;
        } else {
            stats.global_gv_var = spread_of(&sequence_variance);
            stats.global_gv_mean = sequence_variance;
        }
        stats.total_frames += sequence.len();
    }

    /// Merges several statistics objects, weighting phoneme variance
    /// vectors by their sample counts.
    pub fn merge(&self, list: &[GvStatistics]) -> GvStatistics {
        let dimension = list
            .iter()
            .find(|s| s.feature_dimension > 0)
            .map(|s| s.feature_dimension)
            .unwrap_or(0);
        let mut merged = GvStatistics::new(dimension);
        if dimension == 0 {
            return merged;
        }

        let mut global_weight = 0.0;
        let mut phoneme_acc: BTreeMap<String, (Array1<f64>, Array1<f64>, usize)> = BTreeMap::new();
        for stats in list.iter().filter(|s| s.feature_dimension == dimension) {
            let weight = stats.total_frames as f64;
            if weight > 0.0 {
                merged.global_gv_mean = &merged.global_gv_mean + &(&stats.global_gv_mean * weight);
                merged.global_gv_var = &merged.global_gv_var + &(&stats.global_gv_var * weight);
                global_weight += weight;
            }
            merged.total_frames += stats.total_frames;
            for (phoneme, gv) in &stats.phoneme_statistics {
                let weight = gv.frame_count as f64;
                let entry = phoneme_acc.entry(phoneme.clone()).or_insert_with(|| {
                    (Array1::zeros(dimension), Array1::zeros(dimension), 0)
                });
                entry.0 = &entry.0 + &(&gv.mean * weight);
                entry.1 = &entry.1 + &(&gv.var * weight);
                entry.2 += gv.frame_count;
            }
        }
        if global_weight > 0.0 {
            merged.global_gv_mean /= global_weight;
            merged.global_gv_var /= global_weight;
        }
        for (phoneme, (mean_acc, var_acc, count)) in phoneme_acc {
            if count == 0 {
                continue;
            }
            merged.phoneme_statistics.insert(
                phoneme,
                PhonemeGv {
                    mean: mean_acc / count as f64,
                    var: var_acc / count as f64,
                    frame_count: count,
                },
            );
        }
        merged
    }

    /// Rescales a generated trajectory toward the target variance.
    ///
    /// For each dimension with usable current and target variance the frame
    /// values move away from the trajectory mean by the clamped factor
    /// `√(target/current)`, blended by `gv_weight` ∈ [0, 1]. Phoneme labels
    /// pick per-phoneme targets with the global statistics as fallback.
    pub fn apply_correction(
        &self,
        trajectory: &[Array1<f64>],
        stats: &GvStatistics,
        phoneme_labels: &[String],
        gv_weight: f64,
    ) -> Vec<Array1<f64>> {
        if trajectory.is_empty() || gv_weight <= 0.0 || stats.feature_dimension == 0 {
            return trajectory.to_vec();
        }
        let dimension = trajectory[0].len();
        if dimension != stats.feature_dimension {
            warn!(
                expected = stats.feature_dimension,
                actual = dimension,
                "trajectory dimension mismatch, skipping GV correction"
            );
            return trajectory.to_vec();
        }

        let mean = trajectory_mean(trajectory);
        let current = frame_variance(trajectory.iter(), trajectory.len(), false);

        let mut corrected: Vec<Array1<f64>> = trajectory.to_vec();
        for (t, frame) in corrected.iter_mut().enumerate() {
            let target = phoneme_labels
                .get(t)
                .map(|p| stats.target_variance(p))
                .unwrap_or(&stats.global_gv_mean);
            for d in 0..dimension {
                if current[d] > MIN_VARIANCE && target[d] > MIN_VARIANCE {
                    let scale =
                        (target[d] / current[d]).sqrt().clamp(MIN_GV_WEIGHT, MAX_GV_WEIGHT);
                    frame[d] = mean[d] + gv_weight * scale * (frame[d] - mean[d]);
                }
            }
        }
        corrected
    }

    /// Uniform-target variant used by the MLPG post-pass: every frame uses
    /// the same target variance vector.
    pub fn apply_uniform_correction(
        &self,
        trajectory: &[Array1<f64>],
        target_variance: &Array1<f64>,
        gv_weight: f64,
    ) -> Vec<Array1<f64>> {
        if trajectory.is_empty() || gv_weight <= 0.0 {
            return trajectory.to_vec();
        }
        let dimension = trajectory[0].len();
        let mean = trajectory_mean(trajectory);
        let current = frame_variance(trajectory.iter(), trajectory.len(), false);

        let mut corrected: Vec<Array1<f64>> = trajectory.to_vec();
        for frame in corrected.iter_mut() {
            for d in 0..dimension.min(target_variance.len()) {
                if current[d] > MIN_VARIANCE && target_variance[d] > MIN_VARIANCE {
                    let scale = (target_variance[d] / current[d])
                        .sqrt()
                        .clamp(MIN_GV_WEIGHT, MAX_GV_WEIGHT);
                    frame[d] = mean[d] + gv_weight * scale * (frame[d] - mean[d]);
                }
            }
        }
        corrected
    }
}

fn trajectory_mean(frames: &[Array1<f64>]) -> Array1<f64> {
    let mut mean = Array1::<f64>::zeros(frames[0].len());
    for frame in frames {
        mean = mean + frame;
    }
    mean / frames.len() as f64
}

/// Per-dimension variance over frames. `unbiased` divides by `n − 1`; in
/// either mode the result is clamped to at least `MIN_VARIANCE`.
fn frame_variance<'a>(
    frames: impl Iterator<Item = &'a Array1<f64>> + Clone,
    count: usize,
    unbiased: bool,
) -> Array1<f64> {
    if count == 0 {
        return Array1::zeros(0);
    }
    let dimension = frames.clone().next().map(|f| f.len()).unwrap_or(0);
    let mut mean = Array1::<f64>::zeros(dimension);
    for frame in frames.clone() {
        mean = mean + frame;
    }
    mean /= count as f64;

    let mut variance = Array1::<f64>::zeros(dimension);
    for frame in frames {
        let diff = frame - &mean;
        variance = variance + &diff * &diff;
    }
    let denominator = if unbiased && count > 1 {
        (count - 1) as f64
    } else {
        count as f64
    };
    variance /= denominator;
    variance.mapv_inplace(|v| v.max(MIN_VARIANCE));
    variance
}

/// Spread estimate stored alongside a variance vector; a single observation
/// of the variance has no spread, so this floors at `MIN_VARIANCE`.
fn spread_of(variance: &Array1<f64>) -> Array1<f64> {
    Array1::from_elem(variance.len(), MIN_VARIANCE)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn labelled_sequences() -> (Vec<Vec<Array1<f64>>>, Vec<Vec<String>>) {
        let seq_a: Vec<Array1<f64>> = vec![
            array![0.0, 10.0],
            array![2.0, 10.0],
            array![4.0, 10.0],
            array![6.0, 10.0],
        ];
        let seq_b: Vec<Array1<f64>> = vec![array![1.0, 5.0], array![1.0, 7.0], array![1.0, 9.0]];
        let labels_a = vec!["a"; 4].into_iter().map(String::from).collect();
        let labels_b = vec!["i"; 3].into_iter().map(String::from).collect();
        (vec![seq_a, seq_b], vec![labels_a, labels_b])
    }

    #[test]
    fn sequence_variance_is_unbiased_and_clamped() {
        let calc = GvCalculator::new();
        let variance = calc.sequence_variance(&[array![0.0, 1.0], array![2.0, 1.0]]);
        // Unbiased variance of {0, 2} is 2; constant dim clamps to the floor.
        assert!((variance[0] - 2.0).abs() < 1e-12);
        assert_eq!(variance[1], MIN_VARIANCE);
    }

    #[test]
    fn statistics_bucket_by_phoneme_with_global_fallback() {
        let (sequences, labels) = labelled_sequences();
        let stats = GvCalculator::new().calculate_statistics(&sequences, &labels);
        assert_eq!(stats.feature_dimension, 2);
        assert_eq!(stats.total_frames, 7);
        assert!(stats.has_phoneme("a"));
        assert!(stats.has_phoneme("i"));
        assert_eq!(stats.phoneme_statistics["a"].frame_count, 4);
        // Phoneme "a" varies in dim 0 only.
        assert!(stats.phoneme_statistics["a"].mean[0] > 1.0);
        assert_eq!(stats.phoneme_statistics["a"].mean[1], MIN_VARIANCE);
        // Unknown phonemes fall back to the global vector.
        assert_eq!(stats.target_variance("o"), &stats.global_gv_mean);
        assert!(stats.is_valid());
    }

    #[test]
    fn incremental_update_moves_statistics() {
        let (sequences, labels) = labelled_sequences();
        let calc = GvCalculator::new();
        let mut stats = calc.calculate_statistics(&sequences, &labels);
        let before = stats.phoneme_statistics["a"].mean[0];
        let frames_before = stats.total_frames;

        // A wildly more varied "a" sequence shifts the EMA upward.
        let new_seq: Vec<Array1<f64>> = vec![array![0.0, 0.0], array![20.0, 0.0]];
        let new_labels: Vec<String> = vec!["a".into(), "a".into()];
        calc.update_statistics(&mut stats, &new_seq, &new_labels);
        assert!(stats.phoneme_statistics["a"].mean[0] > before);
        assert_eq!(stats.total_frames, frames_before + 2);
    }

    #[test]
    fn merge_weights_by_frame_count() {
        let calc = GvCalculator::new();
        let mut a = GvStatistics::new(1);
        a.total_frames = 10;
        a.global_gv_mean = array![1.0];
        a.global_gv_var = array![MIN_VARIANCE];
        a.phoneme_statistics.insert(
            "a".into(),
            PhonemeGv {
                mean: array![1.0],
                var: array![MIN_VARIANCE],
                frame_count: 10,
            },
        );
        let mut b = a.clone();
        b.total_frames = 30;
        b.global_gv_mean = array![5.0];
        b.phoneme_statistics.get_mut("a").unwrap().mean = array![5.0];
        b.phoneme_statistics.get_mut("a").unwrap().frame_count = 30;

        let merged = calc.merge(&[a, b]);
        // (1*10 + 5*30) / 40 = 4
        assert!((merged.global_gv_mean[0] - 4.0).abs() < 1e-12);
        assert!((merged.phoneme_statistics["a"].mean[0] - 4.0).abs() < 1e-12);
        assert_eq!(merged.total_frames, 40);
        assert_eq!(merged.phoneme_statistics["a"].frame_count, 40);
    }

    #[test]
    fn correction_raises_variance_and_preserves_mean() {
        // A low-variance oscillation about 0.5 with a target variance of
        // 2.0: the clamped scale doubles the spread, mean untouched.
        let trajectory: Vec<Array1<f64>> = (0..100)
            .map(|t| {
                let offset = if t % 2 == 0 { -0.7071 } else { 0.7071 };
                Array1::from_elem(4, 0.5 + offset)
            })
            .collect();
        let mut stats = GvStatistics::new(4);
        stats.global_gv_mean = Array1::from_elem(4, 2.0);
        stats.global_gv_var = Array1::from_elem(4, MIN_VARIANCE);
        stats.total_frames = 100;
        let labels: Vec<String> = (0..100).map(|_| "a".to_string()).collect();

        let calc = GvCalculator::new();
        let corrected = calc.apply_correction(&trajectory, &stats, &labels, 1.0);

        let mean = trajectory_mean(&corrected);
        let variance = frame_variance(corrected.iter(), corrected.len(), false);
        for d in 0..4 {
            assert!((mean[d] - 0.5).abs() < 1e-9, "mean[{d}] = {}", mean[d]);
            assert!(
                variance[d] > 1.5 && variance[d] < 2.5,
                "variance[{d}] = {}",
                variance[d]
            );
        }
    }

    #[test]
    fn flat_trajectory_is_left_alone() {
        // Zero current variance is below the floor, so no dimension can be
        // corrected; the trajectory passes through unchanged.
        let trajectory: Vec<Array1<f64>> = (0..10).map(|_| Array1::from_elem(2, 0.5)).collect();
        let mut stats = GvStatistics::new(2);
        stats.global_gv_mean = Array1::from_elem(2, 2.0);
        let labels: Vec<String> = (0..10).map(|_| "a".to_string()).collect();
        let corrected = GvCalculator::new().apply_correction(&trajectory, &stats, &labels, 1.0);
        for (a, b) in trajectory.iter().zip(&corrected) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn json_round_trip_matches_schema() {
        let (sequences, labels) = labelled_sequences();
        let stats = GvCalculator::new().calculate_statistics(&sequences, &labels);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gv.json");
        stats.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["feature_dimension"].is_number());
        assert!(raw["total_frames"].is_number());
        assert!(raw["global_gv_mean"].is_array());
        assert!(raw["global_gv_var"].is_array());
        assert!(raw["phoneme_statistics"]["a"]["mean"].is_array());
        assert!(raw["phoneme_statistics"]["a"]["var"].is_array());
        assert!(raw["phoneme_statistics"]["a"]["frame_count"].is_number());

        let loaded = GvStatistics::load(&path).unwrap();
        assert_eq!(loaded.feature_dimension, stats.feature_dimension);
        assert_eq!(loaded.total_frames, stats.total_frames);
        assert_eq!(loaded.global_gv_mean, stats.global_gv_mean);
        assert_eq!(
            loaded.phoneme_statistics["i"].frame_count,
            stats.phoneme_statistics["i"].frame_count
        );
    }
}
