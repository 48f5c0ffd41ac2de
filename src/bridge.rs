//! Glue between context features and the HMM layer: grouping training data
//! by model name, initializing and training context-dependent models, model
//! persistence, label generation, and the synthesis-side bridge that turns
//! a context sequence into an MLPG trajectory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::LruCache;
use crate::context::labels;
use crate::context::{ContextDescriptor, ContextFeatures, PhonemeTiming};
use crate::error::{ModelError, Result};
use crate::gv::GvStatistics;
use crate::hmm::trainer::{MultiModelTrainer, TrainingConfig, TrainingStats};
use crate::hmm::PhonemeHmm;
use crate::mlpg::{MlpgConfig, MlpgEngine, TrajectoryStats};
use ndarray::Array1;
use tracing::{debug, info, warn};

/// Configuration for context-dependent model construction.
#[derive(Debug, Clone)]
pub struct ContextHmmConfig {
    /// Static acoustic feature dimension before Δ augmentation.
    pub feature_dimension: usize,
    pub num_mixtures_per_state: usize,
    pub num_states_per_phoneme: usize,
    /// Append Δ and ΔΔ to the acoustic features before training.
    pub use_delta_features: bool,
    /// Models with fewer total frames than this are dropped.
    pub min_frames_per_model: usize,
}

impl Default for ContextHmmConfig {
    fn default() -> Self {
        Self {
            feature_dimension: 39,
            num_mixtures_per_state: 1,
            num_states_per_phoneme: 5,
            use_delta_features: true,
            min_frames_per_model: 10,
        }
    }
}

/// One utterance of training material: per-phoneme context features, the
/// matching acoustic frame lists and the phoneme timings.
#[derive(Debug, Clone)]
pub struct TrainingDataBundle {
    pub utterance_id: String,
    pub context_features: Vec<ContextFeatures>,
    /// `acoustic_features[i]` holds the frames of phoneme `i`.
    pub acoustic_features: Vec<Vec<Array1<f64>>>,
    pub timings: Vec<PhonemeTiming>,
}

impl TrainingDataBundle {
    /// Input contract from the training interface: parallel, non-empty
    /// per-phoneme lists.
    pub fn is_valid(&self) -> bool {
        !self.context_features.is_empty()
            && self.context_features.len() == self.timings.len()
            && self.context_features.len() == self.acoustic_features.len()
            && self.acoustic_features.iter().all(|frames| !frames.is_empty())
    }
}

/// Appends Δ and ΔΔ features: central difference in the interior, one-sided
/// at the boundaries. The output dimension is three times the input.
pub fn add_delta_features(frames: &[Array1<f64>]) -> Vec<Array1<f64>> {
    let count = frames.len();
    frames
        .iter()
        .enumerate()
        .map(|(t, frame)| {
            let dim = frame.len();
            let prev = if t > 0 { &frames[t - 1] } else { frame };
            let next = if t + 1 < count { &frames[t + 1] } else { frame };
            let delta = (next - prev) * 0.5;
            let prev_delta = if t > 0 {
                let pp = if t >= 2 { &frames[t - 2] } else { &frames[t - 1] };
                (frame - pp) * 0.5
            } else {
                delta.clone()
            };
            let delta_delta = &delta - &prev_delta;

            let mut out = Array1::<f64>::zeros(dim * 3);
            for d in 0..dim {
                out[d] = frame[d];
                out[dim + d] = delta[d];
                out[2 * dim + d] = delta_delta[d];
            }
            out
        })
        .collect()
}

/// Bridge from context features to trainable models.
#[derive(Debug, Clone, Default)]
pub struct ContextHmmBridge {
    config: ContextHmmConfig,
}

impl ContextHmmBridge {
    pub fn new(config: ContextHmmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextHmmConfig {
        &self.config
    }

    /// The dimension models are built with (after optional Δ augmentation).
    pub fn model_dimension(&self) -> usize {
        if self.config.use_delta_features {
            self.config.feature_dimension * 3
        } else {
            self.config.feature_dimension
        }
    }

    /// Groups acoustic sequences by model name, augmenting with deltas when
    /// configured and dropping models with too little material.
    pub fn prepare_training_sequences(
        &self,
        bundles: &[TrainingDataBundle],
    ) -> BTreeMap<String, Vec<Vec<Array1<f64>>>> {
        let mut grouped: BTreeMap<String, Vec<Vec<Array1<f64>>>> = BTreeMap::new();
        for bundle in bundles {
            if !bundle.is_valid() {
                warn!(utterance = %bundle.utterance_id, "skipping invalid training bundle");
                continue;
            }
            for (features, frames) in bundle.context_features.iter().zip(&bundle.acoustic_features)
            {
                let sequence = if self.config.use_delta_features {
                    add_delta_features(frames)
                } else {
                    frames.clone()
                };
                grouped.entry(features.model_name()).or_default().push(sequence);
            }
        }

        let before = grouped.len();
        grouped.retain(|name, sequences| {
            let frames: usize = sequences.iter().map(Vec::len).sum();
            if frames < self.config.min_frames_per_model {
                warn!(
                    model = %name,
                    frames,
                    minimum = self.config.min_frames_per_model,
                    "dropping sparse model"
                );
                false
            } else {
                true
            }
        });
        info!(
            models = grouped.len(),
            dropped = before - grouped.len(),
            "grouped training sequences by model name"
        );
        grouped
    }

    /// One fresh model per observed context, keyed by model name.
    pub fn initialize_models(
        &self,
        bundles: &[TrainingDataBundle],
        grouped: &BTreeMap<String, Vec<Vec<Array1<f64>>>>,
    ) -> BTreeMap<String, PhonemeHmm> {
        let mut descriptors: BTreeMap<String, ContextDescriptor> = BTreeMap::new();
        for bundle in bundles {
            for features in &bundle.context_features {
                descriptors
                    .entry(features.model_name())
                    .or_insert_with(|| features.descriptor.clone());
            }
        }

        grouped
            .keys()
            .map(|name| {
                let descriptor = descriptors
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| ContextDescriptor::for_phoneme(name.clone()));
                let model = PhonemeHmm::new(
                    descriptor,
                    self.config.num_states_per_phoneme,
                    self.config.num_mixtures_per_state,
                    self.model_dimension(),
                );
                (name.clone(), model)
            })
            .collect()
    }

    /// Full training pass: group, initialize, train every model.
    pub fn train_models(
        &self,
        bundles: &[TrainingDataBundle],
        training_config: &TrainingConfig,
    ) -> Result<(BTreeMap<String, PhonemeHmm>, BTreeMap<String, TrainingStats>)> {
        let grouped = self.prepare_training_sequences(bundles);
        if grouped.is_empty() {
            return Err(ModelError::InvalidInput(
                "no usable training data after grouping".into(),
            ));
        }
        let mut models = self.initialize_models(bundles, &grouped);
        let trainer = MultiModelTrainer::new(training_config.clone());
        let stats = trainer.train_models(&mut models, &grouped);
        Ok((models, stats))
    }

    /// Mean per-frame log-likelihood per model on held-out bundles.
    pub fn evaluate_models(
        &self,
        models: &BTreeMap<String, PhonemeHmm>,
        bundles: &[TrainingDataBundle],
        training_config: &TrainingConfig,
    ) -> BTreeMap<String, f64> {
        let grouped = self.prepare_training_sequences(bundles);
        MultiModelTrainer::new(training_config.clone()).evaluate_models(models, &grouped)
    }

    /// Saves each model as `<sanitized name>.json` in `directory`.
    pub fn save_models(
        &self,
        models: &BTreeMap<String, PhonemeHmm>,
        directory: impl AsRef<Path>,
    ) -> Result<()> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory)?;
        for (name, model) in models {
            let path = directory.join(format!("{}.json", sanitize_model_name(name)));
            std::fs::write(&path, serde_json::to_string_pretty(model)?)?;
        }
        info!(models = models.len(), directory = %directory.display(), "saved models");
        Ok(())
    }

    /// Loads every `*.json` model from `directory`, keyed by model name.
    pub fn load_models(&self, directory: impl AsRef<Path>) -> Result<BTreeMap<String, PhonemeHmm>> {
        let mut models = BTreeMap::new();
        for entry in std::fs::read_dir(directory.as_ref())? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let json = std::fs::read_to_string(&path)?;
                let model: PhonemeHmm = serde_json::from_str(&json)?;
                models.insert(model.name.clone(), model);
            }
        }
        info!(models = models.len(), "loaded models");
        Ok(models)
    }

    /// Writes one HTS label file per bundle into `directory`.
    pub fn generate_labels(
        &self,
        bundles: &[TrainingDataBundle],
        directory: impl AsRef<Path>,
    ) -> Result<()> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory)?;
        for bundle in bundles {
            let descriptors: Vec<ContextDescriptor> = bundle
                .context_features
                .iter()
                .map(|f| f.descriptor.clone())
                .collect();
            let path = directory.join(format!("{}.lab", sanitize_model_name(&bundle.utterance_id)));
            labels::write_label_file(path, &descriptors, &bundle.timings)?;
        }
        Ok(())
    }
}

fn sanitize_model_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Pipeline configuration: context construction, training, output layout.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub context: ContextHmmConfig,
    pub training: TrainingConfig,
    pub output_directory: PathBuf,
    pub generate_labels: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context: ContextHmmConfig::default(),
            training: TrainingConfig::default(),
            output_directory: PathBuf::from("./hmm_models"),
            generate_labels: true,
        }
    }
}

/// End-to-end training driver: group → train → save (+ labels).
#[derive(Debug, Default)]
pub struct TrainingPipeline {
    config: PipelineConfig,
    trained_models: BTreeMap<String, PhonemeHmm>,
    training_stats: BTreeMap<String, TrainingStats>,
}

impl TrainingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            trained_models: BTreeMap::new(),
            training_stats: BTreeMap::new(),
        }
    }

    pub fn trained_models(&self) -> &BTreeMap<String, PhonemeHmm> {
        &self.trained_models
    }

    pub fn training_stats(&self) -> &BTreeMap<String, TrainingStats> {
        &self.training_stats
    }

    pub fn run(&mut self, bundles: &[TrainingDataBundle]) -> Result<()> {
        info!(bundles = bundles.len(), "starting training pipeline");
        let bridge = ContextHmmBridge::new(self.config.context.clone());
        let (models, stats) = bridge.train_models(bundles, &self.config.training)?;
        self.trained_models = models;
        self.training_stats = stats;

        bridge.save_models(&self.trained_models, &self.config.output_directory)?;
        if self.config.generate_labels {
            bridge.generate_labels(bundles, self.config.output_directory.join("labels"))?;
        }
        let converged = self
            .training_stats
            .values()
            .filter(|s| s.converged)
            .count();
        info!(
            models = self.trained_models.len(),
            converged,
            "training pipeline finished"
        );
        Ok(())
    }
}

/// Configuration of the synthesis-side bridge.
#[derive(Debug, Clone)]
pub struct MlpgBridgeConfig {
    /// Acoustic frame rate used to convert phoneme durations to frames.
    pub frame_rate: f64,
    /// Fallback phoneme duration when a context has no usable timing.
    pub base_duration_ms: f64,
    /// Bound on the prosodic duration scaling, as a fraction of 1.0.
    pub duration_variance: f64,
    pub max_cache_size: usize,
    pub mlpg: MlpgConfig,
}

impl Default for MlpgBridgeConfig {
    fn default() -> Self {
        Self {
            frame_rate: 200.0,
            base_duration_ms: 100.0,
            duration_variance: 0.3,
            max_cache_size: 1000,
            mlpg: MlpgConfig::default(),
        }
    }
}

/// Synthesis bridge: context sequence → model lookup → duration expansion →
/// MLPG trajectory, with an LRU cache over per-model state statistics.
#[derive(Debug)]
pub struct ContextMlpgBridge {
    config: MlpgBridgeConfig,
    engine: MlpgEngine,
    state_cache: LruCache<Vec<(Array1<f64>, Array1<f64>)>>,
    cache_hits: usize,
    cache_requests: usize,
}

impl Default for ContextMlpgBridge {
    fn default() -> Self {
        Self::new(MlpgBridgeConfig::default())
    }
}

impl ContextMlpgBridge {
    pub fn new(config: MlpgBridgeConfig) -> Self {
        Self {
            engine: MlpgEngine::new(config.mlpg.clone()),
            state_cache: LruCache::new(config.max_cache_size),
            cache_hits: 0,
            cache_requests: 0,
            config,
        }
    }

    pub fn config(&self) -> &MlpgBridgeConfig {
        &self.config
    }

    pub fn cache_len(&self) -> usize {
        self.state_cache.len()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.cache_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.cache_requests as f64
        }
    }

    pub fn clear_cache(&mut self) {
        self.state_cache.clear();
        self.cache_hits = 0;
        self.cache_requests = 0;
    }

    /// Looks a context's model up by quinphone key, then triphone, then the
    /// bare center phoneme, then `default_model`.
    pub fn select_model<'a>(
        &self,
        descriptor: &ContextDescriptor,
        models: &'a BTreeMap<String, PhonemeHmm>,
        default_model: Option<&str>,
    ) -> Result<&'a PhonemeHmm> {
        let quinphone = descriptor.model_name();
        if let Some(model) = models.get(&quinphone) {
            return Ok(model);
        }
        let triphone = descriptor.triphone_name();
        if let Some(model) = models.values().find(|m| m.context.triphone_name() == triphone) {
            debug!(context = %quinphone, fallback = %triphone, "triphone fallback");
            return Ok(model);
        }
        if let Some(model) = models.values().find(|m| m.context.current == descriptor.current) {
            debug!(context = %quinphone, fallback = %descriptor.current, "center-phoneme fallback");
            return Ok(model);
        }
        if let Some(name) = default_model {
            if let Some(model) = models.get(name) {
                warn!(context = %quinphone, default = %name, "using default model");
                return Ok(model);
            }
        }
        Err(ModelError::MissingModel(quinphone))
    }

    /// Frames for one phoneme, scaled by a clamped prosodic factor and
    /// never shorter than one frame per state.
    pub fn phoneme_duration_frames(&self, features: &ContextFeatures, num_states: usize) -> usize {
        let duration_ms = {
            let timed = features.timing.duration_ms();
            if timed > 0.0 {
                timed
            } else {
                self.config.base_duration_ms
            }
        };
        let factor = (duration_ms / self.config.base_duration_ms)
            .clamp(1.0 - self.config.duration_variance, 1.0 + self.config.duration_variance);
        let prosodic_ms = self.config.base_duration_ms * factor;
        let frames = (prosodic_ms * self.config.frame_rate / 1000.0).round() as usize;
        frames.max(num_states)
    }

    /// Splits a phoneme's frame budget across its states, spreading the
    /// remainder from the middle outwards.
    pub fn distribute_state_durations(&self, frames: usize, num_states: usize) -> Vec<usize> {
        let mut durations = vec![frames / num_states; num_states];
        let mut remainder = frames % num_states;
        let middle = num_states / 2;
        let mut offset = 0usize;
        while remainder > 0 {
            let lower = middle.saturating_sub(offset);
            if remainder > 0 && lower < num_states {
                durations[lower] += 1;
                remainder -= 1;
            }
            let upper = middle + offset + 1;
            if remainder > 0 && upper < num_states {
                durations[upper] += 1;
                remainder -= 1;
            }
            offset += 1;
            if offset > num_states {
                break;
            }
        }
        durations
    }

    fn state_statistics(&mut self, model: &PhonemeHmm) -> Vec<(Array1<f64>, Array1<f64>)> {
        self.cache_requests += 1;
        if let Some(cached) = self.state_cache.get(&model.name) {
            self.cache_hits += 1;
            return cached;
        }
        let statistics: Vec<(Array1<f64>, Array1<f64>)> = model
            .states
            .iter()
            .map(|state| {
                let dominant = state
                    .emission
                    .weights()
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let component = state.emission.component(dominant);
                (
                    component.mean().clone(),
                    component.covariance().diag().to_owned(),
                )
            })
            .collect();
        self.state_cache.put(model.name.clone(), statistics.clone());
        statistics
    }

    /// Generates the acoustic trajectory for a context sequence.
    ///
    /// Per-phoneme models are selected from `models`, state durations are
    /// expanded from the context timing, and the stacked statistics go
    /// through MLPG. When `gv` is given, its per-phoneme statistics correct
    /// the result in place of the engine's built-in GV target.
    pub fn generate_trajectory(
        &mut self,
        contexts: &[ContextFeatures],
        models: &BTreeMap<String, PhonemeHmm>,
        default_model: Option<&str>,
        gv: Option<&GvStatistics>,
        stats: Option<&mut TrajectoryStats>,
    ) -> Result<Vec<Array1<f64>>> {
        if contexts.is_empty() {
            return Err(ModelError::InvalidInput("empty context sequence".into()));
        }

        let mut means = Vec::new();
        let mut variances = Vec::new();
        let mut durations = Vec::new();
        let mut frame_phonemes: Vec<String> = Vec::new();

        for features in contexts {
            let model = self.select_model(&features.descriptor, models, default_model)?;
            let statistics = self.state_statistics(model);
            let frames = self.phoneme_duration_frames(features, model.num_states());
            let state_durations = self.distribute_state_durations(frames, model.num_states());
            for ((mean, variance), duration) in statistics.into_iter().zip(state_durations) {
                means.push(mean);
                variances.push(variance);
                durations.push(duration);
                for _ in 0..duration {
                    frame_phonemes.push(features.descriptor.current.clone());
                }
            }
        }
        // Zero-duration states would fail MLPG validation.
        let mut filtered_means = Vec::with_capacity(means.len());
        let mut filtered_variances = Vec::with_capacity(variances.len());
        let mut filtered_durations = Vec::with_capacity(durations.len());
        for ((mean, variance), duration) in means.into_iter().zip(variances).zip(durations) {
            if duration > 0 {
                filtered_means.push(mean);
                filtered_variances.push(variance);
                filtered_durations.push(duration);
            }
        }

        match gv {
            Some(gv_stats) => self.engine.generate_trajectory_with_gv(
                &filtered_means,
                &filtered_variances,
                &filtered_durations,
                gv_stats,
                &frame_phonemes,
                stats,
            ),
            None => self.engine.generate_trajectory(
                &filtered_means,
                &filtered_variances,
                &filtered_durations,
                stats,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::{ContextFeatureExtractor, ExtractionConfig};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn synthetic_bundle(id: &str, seed: u64) -> TrainingDataBundle {
        let phonemes = vec![
            PhonemeTiming::new("sil", 0.0, 50.0),
            PhonemeTiming::new("a", 50.0, 150.0).with_note(60, 90),
            PhonemeTiming::new("i", 150.0, 250.0).with_note(62, 90),
            PhonemeTiming::new("sil", 250.0, 300.0),
        ];
        let mut extractor = ContextFeatureExtractor::new(ExtractionConfig::default());
        let context_features = extractor.extract_batch(&phonemes).unwrap();

        let mut rng = StdRng::seed_from_u64(seed);
        let acoustic_features: Vec<Vec<Array1<f64>>> = phonemes
            .iter()
            .enumerate()
            .map(|(p, _)| {
                (0..12)
                    .map(|_| array![p as f64 + rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1)])
                    .collect()
            })
            .collect();

        TrainingDataBundle {
            utterance_id: id.to_string(),
            context_features,
            acoustic_features,
            timings: phonemes,
        }
    }

    fn small_config() -> ContextHmmConfig {
        ContextHmmConfig {
            feature_dimension: 2,
            num_mixtures_per_state: 1,
            num_states_per_phoneme: 3,
            use_delta_features: false,
            min_frames_per_model: 10,
        }
    }

    fn quick_training() -> TrainingConfig {
        TrainingConfig {
            max_iterations: 3,
            use_validation_set: false,
            enable_parallel_training: false,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn delta_augmentation_triples_dimension() {
        let frames = vec![array![0.0], array![1.0], array![2.0], array![3.0]];
        let augmented = add_delta_features(&frames);
        assert_eq!(augmented.len(), 4);
        assert_eq!(augmented[0].len(), 3);
        // Interior delta is the central difference.
        assert!((augmented[2][1] - 1.0).abs() < 1e-12);
        // Statics are untouched.
        for (t, frame) in augmented.iter().enumerate() {
            assert_eq!(frame[0], t as f64);
        }
    }

    #[test]
    fn grouping_drops_sparse_models() {
        let bridge = ContextHmmBridge::new(small_config());
        let bundles = vec![synthetic_bundle("utt1", 1), synthetic_bundle("utt2", 2)];
        let grouped = bridge.prepare_training_sequences(&bundles);
        // Each context appears twice with 12 frames each: kept.
        assert!(!grouped.is_empty());
        for sequences in grouped.values() {
            let frames: usize = sequences.iter().map(Vec::len).sum();
            assert!(frames >= 10);
        }
        // Names are quinphone keys.
        assert!(grouped.keys().any(|k| k.contains("-a+")));
    }

    #[test]
    fn train_save_load_round_trip() {
        let bridge = ContextHmmBridge::new(small_config());
        let bundles = vec![synthetic_bundle("utt1", 1), synthetic_bundle("utt2", 2)];
        let (models, stats) = bridge.train_models(&bundles, &quick_training()).unwrap();
        assert_eq!(models.len(), stats.len());
        assert!(!models.is_empty());
        for (name, model) in &models {
            assert_eq!(&model.name, name);
            assert_eq!(model.num_states(), 3);
            assert_eq!(model.feature_dimension(), 2);
        }

        let dir = tempfile::tempdir().unwrap();
        bridge.save_models(&models, dir.path()).unwrap();
        let loaded = bridge.load_models(dir.path()).unwrap();
        assert_eq!(loaded.len(), models.len());
        for (name, model) in &models {
            let restored = &loaded[name];
            assert_eq!(restored.num_states(), model.num_states());
            // Emission parameters survive the round trip bit-exactly enough
            // to score identically.
            let x = array![0.5, 0.0];
            let a = model.states[0].log_emission(x.view()).unwrap();
            let b = restored.states[0].log_emission(x.view()).unwrap();
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn pipeline_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = TrainingPipeline::new(PipelineConfig {
            context: small_config(),
            training: quick_training(),
            output_directory: dir.path().to_path_buf(),
            generate_labels: true,
        });
        let bundles = vec![synthetic_bundle("utt1", 1), synthetic_bundle("utt2", 2)];
        pipeline.run(&bundles).unwrap();
        assert!(!pipeline.trained_models().is_empty());
        assert_eq!(pipeline.trained_models().len(), pipeline.training_stats().len());
        // Model JSONs and label files landed on disk.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(files.len() > 1);
        assert!(dir.path().join("labels").join("utt1.lab").exists());
    }

    #[test]
    fn synthesis_bridge_generates_full_length_trajectory() {
        let bridge = ContextHmmBridge::new(small_config());
        let bundles = vec![synthetic_bundle("utt1", 1), synthetic_bundle("utt2", 2)];
        let (models, _) = bridge.train_models(&bundles, &quick_training()).unwrap();

        let mut synth = ContextMlpgBridge::new(MlpgBridgeConfig {
            frame_rate: 100.0,
            ..MlpgBridgeConfig::default()
        });
        let contexts = &bundles[0].context_features;
        let trajectory = synth
            .generate_trajectory(contexts, &models, None, None, None)
            .unwrap();
        let expected: usize = contexts
            .iter()
            .map(|c| {
                let model = synth.select_model(&c.descriptor, &models, None).unwrap();
                synth.phoneme_duration_frames(c, model.num_states())
            })
            .sum();
        assert_eq!(trajectory.len(), expected);
        assert!(trajectory.iter().all(|f| f.len() == 2));

        // Second call hits the state cache.
        let _ = synth
            .generate_trajectory(contexts, &models, None, None, None)
            .unwrap();
        assert!(synth.cache_hit_rate() > 0.0);
        assert!(synth.cache_len() <= synth.config().max_cache_size);
    }

    #[test]
    fn missing_model_is_an_error_without_default() {
        let synth = ContextMlpgBridge::default();
        let models = BTreeMap::new();
        let descriptor = ContextDescriptor::for_phoneme("a");
        let err = synth.select_model(&descriptor, &models, None).unwrap_err();
        assert!(matches!(err, ModelError::MissingModel(_)));
    }

    #[test]
    fn fallback_chain_reaches_center_phoneme_and_default() {
        let bridge = ContextHmmBridge::new(small_config());
        let bundles = vec![synthetic_bundle("utt1", 1)];
        let grouped = bridge.prepare_training_sequences(&bundles);
        let models = bridge.initialize_models(&bundles, &grouped);
        let synth = ContextMlpgBridge::default();

        // A context never seen in training, same center phoneme.
        let mut descriptor = ContextDescriptor::for_phoneme("a");
        descriptor.left = "o".into();
        descriptor.right = "o".into();
        let selected = synth.select_model(&descriptor, &models, None).unwrap();
        assert_eq!(selected.context.current, "a");

        // Unknown phoneme falls through to the configured default.
        let descriptor = ContextDescriptor::for_phoneme("zz");
        let default_name = models.keys().next().unwrap().clone();
        let selected = synth
            .select_model(&descriptor, &models, Some(&default_name))
            .unwrap();
        assert_eq!(&selected.name, &default_name);
    }

    #[test]
    fn durations_cover_requested_frames() {
        let synth = ContextMlpgBridge::default();
        for frames in [3, 7, 10, 23] {
            let durations = synth.distribute_state_durations(frames, 3);
            assert_eq!(durations.iter().sum::<usize>(), frames);
            assert_eq!(durations.len(), 3);
        }
    }
}
