//! Context feature extraction: quinphone windows, prosodic/position
//! encoding, musical context and feature normalization.
//!
//! The extractor consumes `(phoneme, start_ms, end_ms, note?, vcv?)` records
//! and produces per-phoneme [`ContextFeatures`] whose flattened vector feeds
//! training, plus a [`ContextDescriptor`] carrying the quinphone key that
//! names the HMM for that context. The key is deterministic from the window,
//! which is what keeps training-time grouping and synthesis-time lookup in
//! agreement.

pub mod labels;
pub mod phonemes;

pub use phonemes::{JapanesePhonemeClassifier, PhonemeFeatures, PhonemeInventory};

use crate::cache::LruCache;
use crate::error::{ModelError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Padding symbol used at utterance boundaries and as quinphone filler.
pub const SILENCE_SYMBOL: &str = "sil";

/// A MIDI note attached to a phoneme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiNote {
    pub note_number: u8,
    pub velocity: u8,
}

impl MidiNote {
    /// Equal-temperament frequency, A4 = 440 Hz.
    pub fn frequency_hz(&self) -> f64 {
        440.0 * 2.0_f64.powf((self.note_number as f64 - 69.0) / 12.0)
    }

    /// Pitch offset from A4 in cents.
    pub fn pitch_cents(&self) -> f64 {
        (self.note_number as f64 - 69.0) * 100.0
    }
}

/// A vowel-consonant-vowel segment from a VCV voicebank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VcvPattern {
    pub preceding_vowel: String,
    pub consonant: String,
    pub vowel: String,
    pub transition_ms: f64,
}

/// One timed phoneme of an utterance, the extractor's input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhonemeTiming {
    pub phoneme: String,
    pub start_ms: f64,
    pub end_ms: f64,
    pub note: Option<MidiNote>,
    pub vcv: Option<VcvPattern>,
    /// Timing accuracy in [0, 1]; 1.0 for hand-labelled data.
    pub confidence: f64,
    pub valid: bool,
}

impl PhonemeTiming {
    pub fn new(phoneme: impl Into<String>, start_ms: f64, end_ms: f64) -> Self {
        Self {
            phoneme: phoneme.into(),
            start_ms,
            end_ms,
            note: None,
            vcv: None,
            confidence: 1.0,
            valid: true,
        }
    }

    pub fn with_note(mut self, note_number: u8, velocity: u8) -> Self {
        self.note = Some(MidiNote {
            note_number,
            velocity,
        });
        self
    }

    pub fn duration_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }
}

/// Position of a phoneme within its linguistic units, 16 values flat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionEncoding {
    // Normalized positions in [0, 1].
    pub position_in_syllable: f64,
    pub position_in_mora: f64,
    pub position_in_word: f64,
    pub position_in_phrase: f64,
    pub position_in_utterance: f64,
    // Boundary flags.
    pub is_syllable_initial: bool,
    pub is_syllable_final: bool,
    pub is_word_initial: bool,
    pub is_word_final: bool,
    pub is_phrase_initial: bool,
    pub is_phrase_final: bool,
    // Accent and prosody.
    pub accent_strength: f64,
    pub has_accent: bool,
    /// Mora index of the accent nucleus, -1 when the word has none.
    pub accent_position: i32,
    pub is_major_phrase_boundary: bool,
    pub is_minor_phrase_boundary: bool,
}

impl PositionEncoding {
    pub const ENCODING_SIZE: usize = 16;

    pub fn to_vector(self) -> [f64; Self::ENCODING_SIZE] {
        [
            self.position_in_syllable,
            self.position_in_mora,
            self.position_in_word,
            self.position_in_phrase,
            self.position_in_utterance,
            self.is_syllable_initial as u8 as f64,
            self.is_syllable_final as u8 as f64,
            self.is_word_initial as u8 as f64,
            self.is_word_final as u8 as f64,
            self.is_phrase_initial as u8 as f64,
            self.is_phrase_final as u8 as f64,
            self.accent_strength,
            self.has_accent as u8 as f64,
            self.accent_position as f64,
            self.is_major_phrase_boundary as u8 as f64,
            self.is_minor_phrase_boundary as u8 as f64,
        ]
    }
}

/// Accent detected over a phrase: the nucleus mora and its strength.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccentInfo {
    pub position: Option<usize>,
    pub strength: f64,
}

/// Syllable/mora segmentation, phrase boundaries and accent detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionEncoder {
    classifier: JapanesePhonemeClassifier,
}

impl PositionEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups phoneme indices into syllables. Japanese syllables close on
    /// their vowel; the moraic nasal and the geminate form their own unit.
    pub fn syllables(&self, phonemes: &[PhonemeTiming]) -> Vec<Vec<usize>> {
        let mut syllables = Vec::new();
        let mut current = Vec::new();
        for (index, timing) in phonemes.iter().enumerate() {
            let phoneme = timing.phoneme.as_str();
            if self.classifier.is_silence(phoneme) {
                if !current.is_empty() {
                    syllables.push(std::mem::take(&mut current));
                }
                syllables.push(vec![index]);
                continue;
            }
            current.push(index);
            let closes = self.classifier.is_vowel(phoneme)
                || phoneme == "N"
                || phoneme == "Q"
                || phoneme.ends_with(['a', 'i', 'u', 'e', 'o']);
            if closes {
                syllables.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            syllables.push(current);
        }
        syllables
    }

    /// Mora segmentation; identical to syllables except long vowels count
    /// their second half as a separate mora slot.
    pub fn mora(&self, phonemes: &[PhonemeTiming]) -> Vec<Vec<usize>> {
        // The phoneme inventory keeps long vowels as single symbols, so the
        // mora grouping coincides with the syllable grouping here.
        self.syllables(phonemes)
    }

    /// Phrase boundaries: a phrase break before every silence.
    pub fn phrase_boundaries(&self, phonemes: &[PhonemeTiming]) -> Vec<bool> {
        phonemes
            .iter()
            .map(|t| self.classifier.is_silence(&t.phoneme))
            .collect()
    }

    /// Pitch-peak accent detection: the mora holding the highest MIDI note
    /// carries the accent; strength is its velocity over 127.
    pub fn detect_accent(&self, phonemes: &[PhonemeTiming]) -> AccentInfo {
        let mut best: Option<(usize, MidiNote)> = None;
        for (index, timing) in phonemes.iter().enumerate() {
            if let Some(note) = timing.note {
                let better = best
                    .map(|(_, current)| note.note_number > current.note_number)
                    .unwrap_or(true);
                if better {
                    best = Some((index, note));
                }
            }
        }
        match best {
            Some((index, note)) => {
                let mora = self.mora(phonemes);
                let position = mora.iter().position(|unit| unit.contains(&index));
                AccentInfo {
                    position,
                    strength: note.velocity as f64 / 127.0,
                }
            }
            None => AccentInfo::default(),
        }
    }

    /// Full position encoding for one phoneme.
    pub fn encode(
        &self,
        phonemes: &[PhonemeTiming],
        index: usize,
        accent: &AccentInfo,
    ) -> PositionEncoding {
        let mut encoding = PositionEncoding::default();
        if phonemes.is_empty() || index >= phonemes.len() {
            return encoding;
        }
        let total = phonemes.len();
        encoding.position_in_utterance = index as f64 / total.max(1) as f64;

        let syllables = self.syllables(phonemes);
        if let Some(syllable) = syllables.iter().find(|unit| unit.contains(&index)) {
            let offset = syllable.iter().position(|i| *i == index).unwrap_or(0);
            encoding.position_in_syllable = offset as f64 / syllable.len() as f64;
            encoding.position_in_mora = encoding.position_in_syllable;
            encoding.is_syllable_initial = offset == 0;
            encoding.is_syllable_final = offset + 1 == syllable.len();
        }

        // Phrases span between silences; within a phrase, syllables stand
        // in for words (sung Japanese carries no word segmentation).
        let boundaries = self.phrase_boundaries(phonemes);
        let phrase_start = (0..=index).rev().find(|i| boundaries[*i]).map(|i| i + 1).unwrap_or(0);
        let phrase_end = (index..total).find(|i| boundaries[*i]).unwrap_or(total);
        let phrase_len = phrase_end.saturating_sub(phrase_start).max(1);
        encoding.position_in_phrase = (index.saturating_sub(phrase_start)) as f64 / phrase_len as f64;
        encoding.position_in_word = encoding.position_in_phrase;
        encoding.is_phrase_initial = index == phrase_start;
        encoding.is_phrase_final = index + 1 == phrase_end;
        encoding.is_word_initial = encoding.is_syllable_initial;
        encoding.is_word_final = encoding.is_syllable_final;
        encoding.is_major_phrase_boundary = index == phrase_start && phrase_start == 0;
        encoding.is_minor_phrase_boundary = encoding.is_phrase_initial && phrase_start > 0;

        encoding.accent_strength = accent.strength;
        encoding.accent_position = accent.position.map(|p| p as i32).unwrap_or(-1);
        if let Some(position) = accent.position {
            let mora = self.mora(phonemes);
            encoding.has_accent = mora
                .get(position)
                .map(|unit| unit.contains(&index))
                .unwrap_or(false);
        }
        encoding
    }
}

/// Quinphone plus prosodic and musical context for one phoneme. This is the
/// descriptor stored on each trained model and rendered into HTS labels.
///
/// Position counters are 1-based and at least 1; `current` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDescriptor {
    pub left_left: String,
    pub left: String,
    pub current: String,
    pub right: String,
    pub right_right: String,

    pub position_in_syllable: usize,
    pub syllable_length: usize,
    pub syllables_from_phrase_start: usize,
    pub syllables_to_phrase_end: usize,
    pub position_in_word: usize,
    pub word_length: usize,
    pub words_from_phrase_start: usize,
    pub words_to_phrase_end: usize,
    pub phrase_length_syllables: usize,
    pub phrase_length_words: usize,

    pub pitch_cents: f64,
    pub note_duration_ms: f64,
    pub tempo_bpm: f64,
    pub beat_position: usize,

    pub is_stressed: bool,
    pub is_accented: bool,
    pub stress_level: usize,
}

impl ContextDescriptor {
    /// Context-free descriptor with silence padding all around.
    pub fn for_phoneme(phoneme: impl Into<String>) -> Self {
        Self {
            left_left: SILENCE_SYMBOL.to_string(),
            left: SILENCE_SYMBOL.to_string(),
            current: phoneme.into(),
            right: SILENCE_SYMBOL.to_string(),
            right_right: SILENCE_SYMBOL.to_string(),
            position_in_syllable: 1,
            syllable_length: 1,
            syllables_from_phrase_start: 1,
            syllables_to_phrase_end: 1,
            position_in_word: 1,
            word_length: 1,
            words_from_phrase_start: 1,
            words_to_phrase_end: 1,
            phrase_length_syllables: 1,
            phrase_length_words: 1,
            pitch_cents: 0.0,
            note_duration_ms: 500.0,
            tempo_bpm: 120.0,
            beat_position: 1,
            is_stressed: false,
            is_accented: false,
            stress_level: 0,
        }
    }

    /// The canonical quinphone model key `LL-L-C+R+RR`. Deterministic from
    /// the context window; training and synthesis both key on it.
    pub fn model_name(&self) -> String {
        format!(
            "{}-{}-{}+{}+{}",
            self.left_left, self.left, self.current, self.right, self.right_right
        )
    }

    /// Reduced triphone key `L-C+R`, used as a synthesis-time fallback.
    pub fn triphone_name(&self) -> String {
        format!("{}-{}+{}", self.left, self.current, self.right)
    }

    pub fn is_valid(&self) -> bool {
        !self.current.is_empty()
            && self.position_in_syllable >= 1
            && self.syllable_length >= 1
            && self.position_in_word >= 1
            && self.word_length >= 1
            && self.phrase_length_syllables >= 1
    }
}

/// Configuration of the context window.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// ±N phonemes around the center (window length `2N + 1`).
    pub phoneme_window: usize,
    pub enable_padding: bool,
    pub padding_symbol: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            phoneme_window: 3,
            enable_padding: true,
            padding_symbol: SILENCE_SYMBOL.to_string(),
        }
    }
}

/// Extracts padded phoneme windows.
#[derive(Debug, Clone, Default)]
pub struct ContextWindowExtractor {
    pub config: WindowConfig,
    classifier: JapanesePhonemeClassifier,
}

impl ContextWindowExtractor {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            classifier: JapanesePhonemeClassifier::new(),
        }
    }

    /// Phoneme names in the window around `index`, padded at the edges.
    pub fn window_names(&self, phonemes: &[PhonemeTiming], index: usize) -> Vec<String> {
        let w = self.config.phoneme_window as isize;
        (-w..=w)
            .map(|offset| {
                let target = index as isize + offset;
                if target >= 0 && (target as usize) < phonemes.len() {
                    phonemes[target as usize].phoneme.clone()
                } else if self.config.enable_padding {
                    self.config.padding_symbol.clone()
                } else {
                    String::new()
                }
            })
            .collect()
    }

    pub fn phoneme_features(&self, phonemes: &[PhonemeTiming], index: usize) -> Vec<PhonemeFeatures> {
        self.window_names(phonemes, index)
            .iter()
            .map(|name| self.classifier.classify(name))
            .collect()
    }
}

/// Context features for one phoneme: windowed articulatory and position
/// features plus the current frame's timing, note and VCV information.
#[derive(Debug, Clone)]
pub struct ContextFeatures {
    pub phoneme_context: Vec<PhonemeFeatures>,
    pub position_context: Vec<PositionEncoding>,
    pub timing: PhonemeTiming,
    pub descriptor: ContextDescriptor,
    pub frame_index: usize,
}

impl ContextFeatures {
    pub fn model_name(&self) -> String {
        self.descriptor.model_name()
    }

    /// Flattens into one vector: window × 32 articulatory bits, window × 16
    /// position values, a timing triple, a normalized MIDI triple and the
    /// VCV quadruple.
    pub fn to_feature_vector(&self, config: &ExtractionConfig) -> Array1<f64> {
        let mut values = Vec::with_capacity(
            self.phoneme_context.len() * PhonemeFeatures::FEATURE_SIZE
                + self.position_context.len() * PositionEncoding::ENCODING_SIZE
                + 10,
        );
        for features in &self.phoneme_context {
            values.extend_from_slice(&features.to_vector());
        }
        for encoding in &self.position_context {
            values.extend_from_slice(&encoding.to_vector());
        }
        if config.include_timing_features {
            values.push(self.timing.duration_ms());
            values.push(self.timing.confidence);
            values.push(if self.timing.valid { 1.0 } else { 0.0 });
        }
        if config.include_midi_features {
            match self.timing.note {
                Some(note) => {
                    values.push(note.note_number as f64 / 127.0);
                    values.push(note.velocity as f64 / 127.0);
                    values.push(note.frequency_hz() / 4000.0);
                }
                None => values.extend_from_slice(&[0.0, 0.0, 0.0]),
            }
        }
        if config.include_vcv_features {
            let classifier = JapanesePhonemeClassifier::new();
            match &self.timing.vcv {
                Some(vcv) => {
                    values.push(classifier.classify(&vcv.preceding_vowel).to_vector().iter().sum::<f64>());
                    values.push(classifier.classify(&vcv.consonant).to_vector().iter().sum::<f64>());
                    values.push(classifier.classify(&vcv.vowel).to_vector().iter().sum::<f64>());
                    values.push(vcv.transition_ms);
                }
                None => values.extend_from_slice(&[0.0, 0.0, 0.0, 0.0]),
            }
        }
        Array1::from(values)
    }
}

/// Normalization strategy for extracted feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormalizationKind {
    None,
    #[default]
    ZScore,
    MinMax,
    Robust,
    Quantile,
    Log,
}

/// Fitted per-dimension statistics for every normalization variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizerParams {
    #[serde(with = "crate::serde_arrays::array1")]
    pub mean: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub std_dev: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub min: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub max: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub median: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub q25: Array1<f64>,
    #[serde(with = "crate::serde_arrays::array1")]
    pub q75: Array1<f64>,
    pub is_fitted: bool,
}

/// Feature normalizer dispatching on a tagged variant. Incremental fitting
/// uses Welford's single-pass update and only maintains the moment-based
/// parameters; the quantile knots need a full batch fit.
#[derive(Debug, Clone, Default)]
pub struct FeatureNormalizer {
    pub kind: NormalizationKind,
    params: NormalizerParams,
    sample_count: usize,
    welford_mean: Array1<f64>,
    welford_m2: Array1<f64>,
}

impl FeatureNormalizer {
    pub fn new(kind: NormalizationKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn params(&self) -> &NormalizerParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_fitted
    }

    /// Batch fit over training vectors.
    pub fn fit(&mut self, data: &[Array1<f64>]) -> Result<()> {
        if data.is_empty() {
            return Err(ModelError::InvalidParameter(
                "cannot fit a normalizer on empty data".into(),
            ));
        }
        let dimension = data[0].len();
        if let Some(mismatch) = data.iter().find(|v| v.len() != dimension) {
            return Err(ModelError::InvalidDimension {
                expected: dimension,
                actual: mismatch.len(),
            });
        }

        let mut mean = Array1::<f64>::zeros(dimension);
        for v in data {
            mean = mean + v;
        }
        mean /= data.len() as f64;
        let mut variance = Array1::<f64>::zeros(dimension);
        for v in data {
            let diff = v - &mean;
            variance = variance + &diff * &diff;
        }
        variance /= data.len() as f64;

        let mut min = Array1::from_elem(dimension, f64::INFINITY);
        let mut max = Array1::from_elem(dimension, f64::NEG_INFINITY);
        for v in data {
            for d in 0..dimension {
                min[d] = min[d].min(v[d]);
                max[d] = max[d].max(v[d]);
            }
        }

        let mut median = Array1::<f64>::zeros(dimension);
        let mut q25 = Array1::<f64>::zeros(dimension);
        let mut q75 = Array1::<f64>::zeros(dimension);
        let mut column: Vec<f64> = Vec::with_capacity(data.len());
        for d in 0..dimension {
            column.clear();
            column.extend(data.iter().map(|v| v[d]));
            column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            median[d] = percentile(&column, 0.5);
            q25[d] = percentile(&column, 0.25);
            q75[d] = percentile(&column, 0.75);
        }

        self.sample_count = data.len();
        self.welford_mean = mean.clone();
        self.welford_m2 = &variance * data.len() as f64;
        self.params = NormalizerParams {
            mean,
            std_dev: variance.mapv(f64::sqrt),
            min,
            max,
            median,
            q25,
            q75,
            is_fitted: true,
        };
        Ok(())
    }

    /// Single-pass Welford update; keeps mean/std/min/max current without
    /// revisiting old samples.
    pub fn fit_incremental(&mut self, sample: &Array1<f64>) {
        if self.sample_count == 0 {
            self.welford_mean = sample.clone();
            self.welford_m2 = Array1::zeros(sample.len());
            self.params.min = sample.clone();
            self.params.max = sample.clone();
            self.params.median = sample.clone();
            self.params.q25 = sample.clone();
            self.params.q75 = sample.clone();
            self.sample_count = 1;
        } else {
            self.sample_count += 1;
            let n = self.sample_count as f64;
            for d in 0..sample.len().min(self.welford_mean.len()) {
                let delta = sample[d] - self.welford_mean[d];
                self.welford_mean[d] += delta / n;
                let delta2 = sample[d] - self.welford_mean[d];
                self.welford_m2[d] += delta * delta2;
                self.params.min[d] = self.params.min[d].min(sample[d]);
                self.params.max[d] = self.params.max[d].max(sample[d]);
            }
        }
        self.params.mean = self.welford_mean.clone();
        self.params.std_dev = (&self.welford_m2 / self.sample_count.max(1) as f64).mapv(f64::sqrt);
        self.params.is_fitted = true;
    }

    pub fn normalize(&self, features: &Array1<f64>) -> Result<Array1<f64>> {
        if self.kind == NormalizationKind::None {
            return Ok(features.clone());
        }
        if !self.params.is_fitted {
            return Err(ModelError::InvalidParameter(
                "normalizer has not been fitted".into(),
            ));
        }
        let p = &self.params;
        let out = match self.kind {
            NormalizationKind::None => features.clone(),
            NormalizationKind::ZScore => {
                let mut out = features - &p.mean;
                for d in 0..out.len() {
                    out[d] /= p.std_dev[d].max(1e-12);
                }
                out
            }
            NormalizationKind::MinMax => {
                let mut out = features.clone();
                for d in 0..out.len() {
                    let range = (p.max[d] - p.min[d]).max(1e-12);
                    out[d] = (features[d] - p.min[d]) / range;
                }
                out
            }
            NormalizationKind::Robust => {
                let mut out = features.clone();
                for d in 0..out.len() {
                    let iqr = (p.q75[d] - p.q25[d]).max(1e-12);
                    out[d] = (features[d] - p.median[d]) / iqr;
                }
                out
            }
            NormalizationKind::Quantile => {
                let mut out = features.clone();
                for d in 0..out.len() {
                    out[d] = quantile_position(
                        features[d],
                        p.min[d],
                        p.q25[d],
                        p.median[d],
                        p.q75[d],
                        p.max[d],
                    );
                }
                out
            }
            NormalizationKind::Log => features.mapv(|v| v.signum() * (1.0 + v.abs()).ln()),
        };
        Ok(out)
    }

    /// Exact inverse for z-score and min-max; other variants lose the
    /// information needed to invert and refuse.
    pub fn denormalize(&self, normalized: &Array1<f64>) -> Result<Array1<f64>> {
        let p = &self.params;
        match self.kind {
            NormalizationKind::None => Ok(normalized.clone()),
            NormalizationKind::ZScore => {
                if !p.is_fitted {
                    return Err(ModelError::InvalidParameter(
                        "normalizer has not been fitted".into(),
                    ));
                }
                let mut out = normalized.clone();
                for d in 0..out.len() {
                    out[d] = normalized[d] * p.std_dev[d].max(1e-12) + p.mean[d];
                }
                Ok(out)
            }
            NormalizationKind::MinMax => {
                if !p.is_fitted {
                    return Err(ModelError::InvalidParameter(
                        "normalizer has not been fitted".into(),
                    ));
                }
                let mut out = normalized.clone();
                for d in 0..out.len() {
                    let range = (p.max[d] - p.min[d]).max(1e-12);
                    out[d] = normalized[d] * range + p.min[d];
                }
                Ok(out)
            }
            other => Err(ModelError::InvalidParameter(format!(
                "normalization {other:?} has no inverse transform"
            ))),
        }
    }

    pub fn normalize_batch(&self, features: &[Array1<f64>]) -> Result<Vec<Array1<f64>>> {
        features.iter().map(|f| self.normalize(f)).collect()
    }
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = fraction * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let t = position - low as f64;
        sorted[low] * (1.0 - t) + sorted[high] * t
    }
}

/// Piecewise-linear CDF through the fitted quantile knots, mapping a value
/// to [0, 1].
fn quantile_position(value: f64, min: f64, q25: f64, median: f64, q75: f64, max: f64) -> f64 {
    let knots = [(min, 0.0), (q25, 0.25), (median, 0.5), (q75, 0.75), (max, 1.0)];
    if value <= min {
        return 0.0;
    }
    if value >= max {
        return 1.0;
    }
    for pair in knots.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if value <= x1 {
            if (x1 - x0).abs() < 1e-12 {
                return y1;
            }
            return y0 + (value - x0) / (x1 - x0) * (y1 - y0);
        }
    }
    1.0
}

/// Extractor configuration.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub window: WindowConfig,
    pub normalization: NormalizationKind,
    pub include_midi_features: bool,
    pub include_vcv_features: bool,
    pub include_timing_features: bool,
    pub enable_caching: bool,
    pub max_cache_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            normalization: NormalizationKind::ZScore,
            include_midi_features: true,
            include_vcv_features: true,
            include_timing_features: true,
            enable_caching: true,
            max_cache_size: 1000,
        }
    }
}

/// Main context feature extractor.
#[derive(Debug, Clone)]
pub struct ContextFeatureExtractor {
    config: ExtractionConfig,
    window_extractor: ContextWindowExtractor,
    position_encoder: PositionEncoder,
    pub normalizer: FeatureNormalizer,
    cache: LruCache<ContextFeatures>,
}

impl Default for ContextFeatureExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl ContextFeatureExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            window_extractor: ContextWindowExtractor::new(config.window.clone()),
            position_encoder: PositionEncoder::new(),
            normalizer: FeatureNormalizer::new(config.normalization),
            cache: LruCache::new(if config.enable_caching {
                config.max_cache_size
            } else {
                0
            }),
            config,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Extracts context features for the phoneme at `index`.
    pub fn extract(&mut self, phonemes: &[PhonemeTiming], index: usize) -> Result<ContextFeatures> {
        if index >= phonemes.len() {
            return Err(ModelError::InvalidInput(format!(
                "phoneme index {index} out of range ({} phonemes)",
                phonemes.len()
            )));
        }
        let key = self.cache_key(phonemes, index);
        if self.config.enable_caching {
            if let Some(cached) = self.cache.get(&key) {
                return Ok(cached);
            }
        }

        let accent = self.position_encoder.detect_accent(phonemes);
        let window = self.config.window.phoneme_window;
        let position_context: Vec<PositionEncoding> = (-(window as isize)..=window as isize)
            .map(|offset| {
                let target = index as isize + offset;
                if target >= 0 && (target as usize) < phonemes.len() {
                    self.position_encoder.encode(phonemes, target as usize, &accent)
                } else {
                    PositionEncoding::default()
                }
            })
            .collect();

        let features = ContextFeatures {
            phoneme_context: self.window_extractor.phoneme_features(phonemes, index),
            position_context,
            timing: phonemes[index].clone(),
            descriptor: self.build_descriptor(phonemes, index, &accent),
            frame_index: index,
        };

        if self.config.enable_caching {
            self.cache.put(key, features.clone());
        }
        Ok(features)
    }

    /// Extracts the whole utterance.
    pub fn extract_batch(&mut self, phonemes: &[PhonemeTiming]) -> Result<Vec<ContextFeatures>> {
        (0..phonemes.len()).map(|i| self.extract(phonemes, i)).collect()
    }

    /// Flattens features and applies the configured normalization when the
    /// normalizer has been fitted.
    pub fn features_to_vector(&self, features: &ContextFeatures) -> Result<Array1<f64>> {
        let raw = features.to_feature_vector(&self.config);
        if self.normalizer.is_fitted() {
            self.normalizer.normalize(&raw)
        } else {
            Ok(raw)
        }
    }

    /// Fits the normalizer on a batch of extracted features.
    pub fn train_normalizer(&mut self, features: &[ContextFeatures]) -> Result<()> {
        let vectors: Vec<Array1<f64>> = features
            .iter()
            .map(|f| f.to_feature_vector(&self.config))
            .collect();
        self.normalizer.fit(&vectors)?;
        debug!(samples = vectors.len(), "fitted feature normalizer");
        Ok(())
    }

    fn cache_key(&self, phonemes: &[PhonemeTiming], index: usize) -> String {
        // Context digest: the window's names and the frame timing pin the
        // output entirely.
        let names = self.window_extractor.window_names(phonemes, index);
        format!(
            "{}|{}|{:.3}|{:.3}|{}",
            names.join("."),
            index,
            phonemes[index].start_ms,
            phonemes[index].end_ms,
            phonemes.len()
        )
    }

    fn build_descriptor(
        &self,
        phonemes: &[PhonemeTiming],
        index: usize,
        accent: &AccentInfo,
    ) -> ContextDescriptor {
        let names = self.window_extractor.window_names(phonemes, index);
        let center = names.len() / 2;
        let mut descriptor = ContextDescriptor::for_phoneme(names[center].clone());
        descriptor.left_left = names[center.saturating_sub(2)].clone();
        descriptor.left = names[center.saturating_sub(1)].clone();
        descriptor.right = names.get(center + 1).cloned().unwrap_or_else(|| SILENCE_SYMBOL.into());
        descriptor.right_right = names.get(center + 2).cloned().unwrap_or_else(|| SILENCE_SYMBOL.into());

        let syllables = self.position_encoder.syllables(phonemes);
        if let Some(position) = syllables.iter().position(|unit| unit.contains(&index)) {
            let unit = &syllables[position];
            descriptor.position_in_syllable =
                unit.iter().position(|i| *i == index).unwrap_or(0) + 1;
            descriptor.syllable_length = unit.len();
            descriptor.syllables_from_phrase_start = position + 1;
            descriptor.syllables_to_phrase_end = syllables.len() - position;
            descriptor.phrase_length_syllables = syllables.len();
            // Sung Japanese carries no word segmentation; syllables stand
            // in for words.
            descriptor.position_in_word = descriptor.position_in_syllable;
            descriptor.word_length = descriptor.syllable_length;
            descriptor.words_from_phrase_start = descriptor.syllables_from_phrase_start;
            descriptor.words_to_phrase_end = descriptor.syllables_to_phrase_end;
            descriptor.phrase_length_words = descriptor.phrase_length_syllables;
        }

        let timing = &phonemes[index];
        descriptor.note_duration_ms = timing.duration_ms();
        if let Some(note) = timing.note {
            descriptor.pitch_cents = note.pitch_cents();
        }
        if let Some(accent_position) = accent.position {
            let mora = self.position_encoder.mora(phonemes);
            descriptor.is_accented = mora
                .get(accent_position)
                .map(|unit| unit.contains(&index))
                .unwrap_or(false);
            descriptor.is_stressed = descriptor.is_accented;
            descriptor.stress_level = if descriptor.is_accented {
                (accent.strength * 3.0).round() as usize
            } else {
                0
            };
        }
        descriptor
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn utterance() -> Vec<PhonemeTiming> {
        vec![
            PhonemeTiming::new("sil", 0.0, 100.0),
            PhonemeTiming::new("k", 100.0, 150.0).with_note(60, 80),
            PhonemeTiming::new("a", 150.0, 300.0).with_note(64, 100),
            PhonemeTiming::new("N", 300.0, 400.0).with_note(62, 70),
            PhonemeTiming::new("sil", 400.0, 500.0),
        ]
    }

    #[test]
    fn quinphone_key_is_deterministic() {
        let mut extractor = ContextFeatureExtractor::new(ExtractionConfig::default());
        let phonemes = utterance();
        let features = extractor.extract(&phonemes, 2).unwrap();
        assert_eq!(features.model_name(), "sil-k-a+N+sil");
        assert_eq!(features.descriptor.triphone_name(), "k-a+N");
        // Same inputs, same key, cached or not.
        let again = extractor.extract(&phonemes, 2).unwrap();
        assert_eq!(again.model_name(), "sil-k-a+N+sil");
        assert!(features.descriptor.is_valid());
    }

    #[test]
    fn window_pads_with_silence() {
        let extractor = ContextWindowExtractor::new(WindowConfig::default());
        let phonemes = utterance();
        let names = extractor.window_names(&phonemes, 0);
        assert_eq!(names.len(), 7);
        assert_eq!(names[0], "sil");
        assert_eq!(names[3], "sil");
        assert_eq!(names[4], "k");
        let features = extractor.phoneme_features(&phonemes, 2);
        assert_eq!(features.len(), 7);
        assert!(features[3].is_vowel); // center is "a"
    }

    #[test]
    fn syllables_close_on_vowels() {
        let encoder = PositionEncoder::new();
        let phonemes = utterance();
        let syllables = encoder.syllables(&phonemes);
        // [sil] [k a] [N] [sil]
        assert_eq!(syllables.len(), 4);
        assert_eq!(syllables[1], vec![1, 2]);
        assert_eq!(syllables[2], vec![3]);
    }

    #[test]
    fn accent_lands_on_pitch_peak() {
        let encoder = PositionEncoder::new();
        let phonemes = utterance();
        let accent = encoder.detect_accent(&phonemes);
        // The peak note (64) is on "a", the second syllable.
        assert_eq!(accent.position, Some(1));
        assert!((accent.strength - 100.0 / 127.0).abs() < 1e-12);

        let encoding = encoder.encode(&phonemes, 2, &accent);
        assert!(encoding.has_accent);
        assert!(encoding.is_syllable_final);
        assert_eq!(encoding.accent_position, 1);
    }

    #[test]
    fn position_vector_is_16_wide() {
        let encoder = PositionEncoder::new();
        let phonemes = utterance();
        let accent = encoder.detect_accent(&phonemes);
        let v = encoder.encode(&phonemes, 1, &accent).to_vector();
        assert_eq!(v.len(), PositionEncoding::ENCODING_SIZE);
    }

    #[test]
    fn feature_vector_has_documented_layout() {
        let mut extractor = ContextFeatureExtractor::new(ExtractionConfig::default());
        let phonemes = utterance();
        let features = extractor.extract(&phonemes, 2).unwrap();
        let vector = features.to_feature_vector(extractor.config());
        // 7 × 32 + 7 × 16 + 3 timing + 3 midi + 4 vcv
        assert_eq!(vector.len(), 7 * 32 + 7 * 16 + 10);
        // Timing triple sits right after the windowed blocks.
        let offset = 7 * 32 + 7 * 16;
        assert!((vector[offset] - 150.0).abs() < 1e-9); // duration of "a"
        assert_eq!(vector[offset + 2], 1.0); // valid flag
    }

    #[test]
    fn zscore_round_trips() {
        let data = vec![
            array![1.0, 10.0],
            array![2.0, 20.0],
            array![3.0, 30.0],
            array![4.0, 40.0],
        ];
        let mut normalizer = FeatureNormalizer::new(NormalizationKind::ZScore);
        normalizer.fit(&data).unwrap();
        for v in &data {
            let normalized = normalizer.normalize(v).unwrap();
            let back = normalizer.denormalize(&normalized).unwrap();
            for d in 0..2 {
                assert!((back[d] - v[d]).abs() < 1e-9);
            }
        }
        // Normalized data is centered with unit spread.
        let normalized = normalizer.normalize(&array![2.5, 25.0]).unwrap();
        assert!(normalized[0].abs() < 1e-9);
    }

    #[test]
    fn minmax_round_trips_and_bounds() {
        let data = vec![array![0.0], array![5.0], array![10.0]];
        let mut normalizer = FeatureNormalizer::new(NormalizationKind::MinMax);
        normalizer.fit(&data).unwrap();
        let normalized = normalizer.normalize(&array![5.0]).unwrap();
        assert!((normalized[0] - 0.5).abs() < 1e-12);
        let back = normalizer.denormalize(&normalized).unwrap();
        assert!((back[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn non_invertible_kinds_refuse_denormalize() {
        let data = vec![array![1.0], array![2.0], array![3.0]];
        for kind in [
            NormalizationKind::Robust,
            NormalizationKind::Quantile,
            NormalizationKind::Log,
        ] {
            let mut normalizer = FeatureNormalizer::new(kind);
            normalizer.fit(&data).unwrap();
            let normalized = normalizer.normalize(&array![2.0]).unwrap();
            assert!(matches!(
                normalizer.denormalize(&normalized),
                Err(ModelError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn quantile_maps_knots() {
        let data: Vec<Array1<f64>> = (0..101).map(|i| array![i as f64]).collect();
        let mut normalizer = FeatureNormalizer::new(NormalizationKind::Quantile);
        normalizer.fit(&data).unwrap();
        assert!((normalizer.normalize(&array![0.0]).unwrap()[0]).abs() < 1e-12);
        assert!((normalizer.normalize(&array![50.0]).unwrap()[0] - 0.5).abs() < 1e-9);
        assert!((normalizer.normalize(&array![100.0]).unwrap()[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn welford_matches_batch_fit() {
        let data = vec![array![1.0, -2.0], array![3.0, 0.0], array![5.0, 2.0]];
        let mut batch = FeatureNormalizer::new(NormalizationKind::ZScore);
        batch.fit(&data).unwrap();
        let mut incremental = FeatureNormalizer::new(NormalizationKind::ZScore);
        for v in &data {
            incremental.fit_incremental(v);
        }
        for d in 0..2 {
            assert!((batch.params().mean[d] - incremental.params().mean[d]).abs() < 1e-9);
            assert!((batch.params().std_dev[d] - incremental.params().std_dev[d]).abs() < 1e-9);
        }
    }

    #[test]
    fn cache_is_bounded_and_transparent() {
        let mut extractor = ContextFeatureExtractor::new(ExtractionConfig {
            max_cache_size: 2,
            ..ExtractionConfig::default()
        });
        let phonemes = utterance();
        let a = extractor.extract(&phonemes, 1).unwrap();
        let _ = extractor.extract(&phonemes, 2).unwrap();
        let _ = extractor.extract(&phonemes, 3).unwrap();
        assert!(extractor.cache_len() <= 2);
        // Re-extraction (now a cache miss) still yields the same result.
        let again = extractor.extract(&phonemes, 1).unwrap();
        assert_eq!(a.model_name(), again.model_name());
        assert_eq!(a.timing, again.timing);
        extractor.clear_cache();
        assert_eq!(extractor.cache_len(), 0);
    }
}
