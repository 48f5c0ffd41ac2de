//! Viterbi decoding and phoneme alignment.
//!
//! Plain decoding runs the usual max-product trellis over one model. Forced
//! and time-constrained alignment instead build a chain of per-phoneme model
//! copies, so a multi-phoneme utterance walks the chain left to right; each
//! non-final model's exit mass becomes the hand-off probability into the
//! next model's entry state. Boundary extraction then reads phoneme spans
//! straight off the chain path, with the within-model state index reported
//! to callers (it retrogrades exactly where one phoneme hands off to the
//! next).

use std::collections::BTreeMap;

use crate::hmm::forward_backward::{forward_backward, ForwardBackwardResult};
use crate::hmm::{HmmState, PhonemeHmm, StateTransition};
use ndarray::{Array1, Array2};
use tracing::warn;

/// Fixed log-penalty for the skip transition (`j ← j−2`) in forced
/// alignment. Steep enough that skips only fire when a state truly has no
/// support.
const SKIP_PENALTY: f64 = -2.0;

/// Additive log-penalty for frames that sit outside a phoneme's hinted time
/// window in constrained alignment. A soft cost, never an exclusion.
const TIMING_PENALTY: f64 = -4.0;

/// Fraction of the sequence a frame may deviate from its hinted window
/// before the timing penalty applies.
const TIMING_TOLERANCE: f64 = 0.2;

/// Transition probabilities are floored here before entering log space so a
/// zeroed parameter cannot poison an otherwise viable path.
const PROB_FLOOR: f64 = 1e-10;

/// One aligned phoneme span. Within an alignment, spans are contiguous
/// (`end[i] == start[i+1]`) and cover the full frame range.
#[derive(Debug, Clone, PartialEq)]
pub struct PhonemeBoundary {
    pub start_frame: usize,
    /// Exclusive.
    pub end_frame: usize,
    pub phoneme: String,
    /// Mean state posterior of the chosen path inside the span, in [0, 1].
    pub confidence: f64,
    pub duration_ms: f64,
}

/// Result of Viterbi decoding or alignment over one sequence.
#[derive(Debug, Clone)]
pub struct SequenceAlignment {
    /// Within-model state index per frame.
    pub state_sequence: Vec<usize>,
    pub frame_to_state: Vec<usize>,
    /// Log emission score of the chosen state per frame.
    pub frame_scores: Vec<f64>,
    /// Posterior probability of the chosen state per frame.
    pub state_posteriors: Vec<f64>,
    pub boundaries: Vec<PhonemeBoundary>,
    pub total_score: f64,
    pub average_confidence: f64,
    pub frame_rate: f64,
}

impl SequenceAlignment {
    fn empty(frame_rate: f64) -> Self {
        Self {
            state_sequence: Vec::new(),
            frame_to_state: Vec::new(),
            frame_scores: Vec::new(),
            state_posteriors: Vec::new(),
            boundaries: Vec::new(),
            total_score: f64::NEG_INFINITY,
            average_confidence: 0.0,
            frame_rate,
        }
    }

    pub fn total_duration_ms(&self) -> f64 {
        if self.frame_to_state.is_empty() {
            0.0
        } else {
            self.frame_to_state.len() as f64 / self.frame_rate * 1000.0
        }
    }

    pub fn phoneme_at_frame(&self, frame: usize) -> Option<&PhonemeBoundary> {
        self.boundaries
            .iter()
            .find(|b| frame >= b.start_frame && frame < b.end_frame)
    }
}

fn floored_log(p: f64) -> f64 {
    p.max(PROB_FLOOR).ln()
}

/// Most likely state path through one model, must start in state 0.
///
/// Ties between staying and advancing break toward the self-loop, so the
/// path is as lazy as the scores allow.
pub fn viterbi_alignment(
    model: &PhonemeHmm,
    observations: &[Array1<f64>],
    frame_rate: f64,
) -> SequenceAlignment {
    let frames = observations.len();
    let states = model.num_states();
    if frames == 0 || states == 0 {
        return SequenceAlignment::empty(frame_rate);
    }

    let emissions = emission_matrix(&model.states, observations);
    let mut trellis = Array2::<f64>::from_elem((frames, states), f64::NEG_INFINITY);
    let mut backpointer = Array2::<usize>::zeros((frames, states));

    trellis[[0, 0]] = emissions[[0, 0]];
    for t in 1..frames {
        for j in 0..states {
            let mut best = f64::NEG_INFINITY;
            let mut from = j;
            let stay = trellis[[t - 1, j]];
            if stay.is_finite() {
                best = stay + floored_log(model.states[j].transition.self_loop);
            }
            if j > 0 {
                let advance = trellis[[t - 1, j - 1]];
                if advance.is_finite() {
                    let score = advance + floored_log(model.states[j - 1].transition.next);
                    if score > best {
                        best = score;
                        from = j - 1;
                    }
                }
            }
            if best.is_finite() {
                trellis[[t, j]] = best + emissions[[t, j]];
                backpointer[[t, j]] = from;
            }
        }
    }

    let mut path = vec![0usize; frames];
    let mut best_final = 0;
    for i in 1..states {
        if trellis[[frames - 1, i]] > trellis[[frames - 1, best_final]] {
            best_final = i;
        }
    }
    path[frames - 1] = best_final;
    for t in (0..frames - 1).rev() {
        path[t] = backpointer[[t + 1, path[t + 1]]];
    }

    let fb = forward_backward(model, observations);
    finish_alignment(path.clone(), path, &emissions, &fb, Vec::new(), frame_rate)
}

/// Forced alignment of a known phoneme sequence against one model reused
/// for every phoneme.
pub fn forced_alignment(
    model: &PhonemeHmm,
    observations: &[Array1<f64>],
    phonemes: &[String],
    frame_rate: f64,
) -> SequenceAlignment {
    let models: Vec<&PhonemeHmm> = phonemes.iter().map(|_| model).collect();
    align_chain(&models, observations, phonemes, None, frame_rate)
}

/// Forced alignment with per-phoneme `(start_ms, end_ms)` timing hints.
pub fn constrained_alignment(
    model: &PhonemeHmm,
    observations: &[Array1<f64>],
    phonemes: &[String],
    time_hints: &[(f64, f64)],
    frame_rate: f64,
) -> SequenceAlignment {
    if time_hints.len() != phonemes.len() {
        warn!(
            hints = time_hints.len(),
            phonemes = phonemes.len(),
            "timing hint count does not match phoneme count, ignoring hints"
        );
        return forced_alignment(model, observations, phonemes, frame_rate);
    }
    let models: Vec<&PhonemeHmm> = phonemes.iter().map(|_| model).collect();
    align_chain(&models, observations, phonemes, Some(time_hints), frame_rate)
}

/// Aligns each sequence against its phoneme sequence, selecting a model per
/// phoneme from the map (exact key, then matching center phoneme, then any).
pub fn batch_forced_alignment(
    models: &BTreeMap<String, PhonemeHmm>,
    sequences: &[Vec<Array1<f64>>],
    phoneme_sequences: &[Vec<String>],
    frame_rate: f64,
) -> Vec<SequenceAlignment> {
    if sequences.len() != phoneme_sequences.len() {
        warn!(
            sequences = sequences.len(),
            phoneme_sequences = phoneme_sequences.len(),
            "batch alignment input counts differ"
        );
        return Vec::new();
    }
    sequences
        .iter()
        .zip(phoneme_sequences)
        .map(|(sequence, phonemes)| {
            if phonemes.is_empty() || models.is_empty() {
                return SequenceAlignment::empty(frame_rate);
            }
            let selected: Vec<&PhonemeHmm> = phonemes
                .iter()
                .filter_map(|p| select_model(models, p))
                .collect();
            if selected.len() != phonemes.len() {
                return SequenceAlignment::empty(frame_rate);
            }
            align_chain(&selected, sequence, phonemes, None, frame_rate)
        })
        .collect()
}

/// Model lookup used during batch alignment: exact model-name match first,
/// then any model whose context center is the phoneme, then the first model
/// in the map. `None` only for an empty map.
pub fn select_model<'a>(
    models: &'a BTreeMap<String, PhonemeHmm>,
    phoneme: &str,
) -> Option<&'a PhonemeHmm> {
    if let Some(model) = models.get(phoneme) {
        return Some(model);
    }
    models
        .values()
        .find(|m| m.context.current == phoneme)
        .or_else(|| models.values().next())
}

/// Concatenates per-phoneme models into one left-to-right chain. The exit
/// mass of each non-final model becomes the transition into the next
/// model's entry state.
fn build_chain(models: &[&PhonemeHmm]) -> (PhonemeHmm, Vec<usize>) {
    let mut states: Vec<HmmState> = Vec::new();
    let mut phoneme_of_state: Vec<usize> = Vec::new();
    for (p, model) in models.iter().enumerate() {
        let last_model = p + 1 == models.len();
        for (i, state) in model.states.iter().enumerate() {
            let mut state = state.clone();
            state.id = states.len();
            let terminal_state = i + 1 == model.states.len();
            if terminal_state && !last_model {
                // Hand off to the next phoneme: the exit probability
                // becomes the advance probability inside the chain.
                let exit = state.transition.exit.max(state.transition.next);
                state.transition = StateTransition {
                    self_loop: state.transition.self_loop,
                    next: exit,
                    exit: 0.0,
                };
                state.transition.normalize();
            }
            phoneme_of_state.push(p);
            states.push(state);
        }
    }
    let chain = PhonemeHmm {
        name: models
            .iter()
            .map(|m| m.context.current.as_str())
            .collect::<Vec<_>>()
            .join("."),
        context: models[0].context.clone(),
        states,
    };
    (chain, phoneme_of_state)
}

fn emission_matrix(states: &[HmmState], observations: &[Array1<f64>]) -> Array2<f64> {
    let mut emissions = Array2::<f64>::from_elem((observations.len(), states.len()), f64::NEG_INFINITY);
    for (t, obs) in observations.iter().enumerate() {
        for (i, state) in states.iter().enumerate() {
            if let Ok(b) = state.log_emission(obs.view()) {
                emissions[[t, i]] = b;
            }
        }
    }
    emissions
}

fn align_chain(
    models: &[&PhonemeHmm],
    observations: &[Array1<f64>],
    phonemes: &[String],
    time_hints: Option<&[(f64, f64)]>,
    frame_rate: f64,
) -> SequenceAlignment {
    let frames = observations.len();
    if frames == 0 || models.is_empty() || models.iter().any(|m| m.num_states() == 0) {
        return SequenceAlignment::empty(frame_rate);
    }

    let (chain, phoneme_of_state) = build_chain(models);
    let states = chain.num_states();
    let first_model_states = models[0].num_states();

    let mut emissions = emission_matrix(&chain.states, observations);

    // Soft timing penalties from the hints.
    if let Some(hints) = time_hints {
        let slack = (TIMING_TOLERANCE * frames as f64).round() as i64;
        let windows: Vec<(i64, i64)> = hints
            .iter()
            .map(|(start_ms, end_ms)| {
                let start = (start_ms * frame_rate / 1000.0) as i64;
                let end = (end_ms * frame_rate / 1000.0) as i64;
                (start.clamp(0, frames as i64), end.clamp(0, frames as i64))
            })
            .collect();
        for t in 0..frames {
            for j in 0..states {
                let (start, end) = windows[phoneme_of_state[j]];
                let t = t as i64;
                if t < start - slack || t >= end + slack {
                    emissions[[t as usize, j]] += TIMING_PENALTY;
                }
            }
        }
    }

    // Forced-alignment trellis: relaxed initialization over the first
    // phoneme's states, self/advance transitions, penalized skips.
    let mut trellis = Array2::<f64>::from_elem((frames, states), f64::NEG_INFINITY);
    let mut backpointer = Array2::<usize>::zeros((frames, states));
    for i in 0..first_model_states {
        trellis[[0, i]] = emissions[[0, i]];
    }
    for t in 1..frames {
        for j in 0..states {
            let mut best = f64::NEG_INFINITY;
            let mut from = j;
            let stay = trellis[[t - 1, j]];
            if stay.is_finite() {
                best = stay + floored_log(chain.states[j].transition.self_loop);
            }
            if j > 0 {
                let advance = trellis[[t - 1, j - 1]];
                if advance.is_finite() {
                    let score = advance + floored_log(chain.states[j - 1].transition.next);
                    if score > best {
                        best = score;
                        from = j - 1;
                    }
                }
            }
            // Skip transition, constrained so it can never jump clean over
            // a phoneme.
            if j > 1 && phoneme_of_state[j] - phoneme_of_state[j - 2] <= 1 {
                let skip = trellis[[t - 1, j - 2]];
                if skip.is_finite() {
                    let score = skip + SKIP_PENALTY;
                    if score > best {
                        best = score;
                        from = j - 2;
                    }
                }
            }
            if best.is_finite() {
                trellis[[t, j]] = best + emissions[[t, j]];
                backpointer[[t, j]] = from;
            }
        }
    }

    // The path must finish inside the last phoneme whenever that is
    // reachable at all.
    let last_phoneme = models.len() - 1;
    let mut best_final = None;
    for j in 0..states {
        if phoneme_of_state[j] == last_phoneme && trellis[[frames - 1, j]].is_finite() {
            if best_final
                .map(|b: usize| trellis[[frames - 1, j]] > trellis[[frames - 1, b]])
                .unwrap_or(true)
            {
                best_final = Some(j);
            }
        }
    }
    let best_final = best_final.unwrap_or_else(|| {
        let mut best = 0;
        for j in 1..states {
            if trellis[[frames - 1, j]] > trellis[[frames - 1, best]] {
                best = j;
            }
        }
        warn!(
            "sequence too short to traverse all {} phonemes, truncating alignment",
            models.len()
        );
        best
    });

    let mut chain_path = vec![0usize; frames];
    chain_path[frames - 1] = best_final;
    for t in (0..frames - 1).rev() {
        chain_path[t] = backpointer[[t + 1, chain_path[t + 1]]];
    }

    // Posteriors over the same chain for confidence scoring.
    let fb = forward_backward(&chain, observations);

    // Boundaries straight from the phoneme spans of the chain path.
    let mut boundaries = Vec::new();
    let mut span_start = 0usize;
    for t in 1..=frames {
        let closing = t == frames || phoneme_of_state[chain_path[t]] != phoneme_of_state[chain_path[span_start]];
        if closing {
            let p = phoneme_of_state[chain_path[span_start]];
            let confidence = span_confidence(&fb, &chain_path, span_start, t);
            boundaries.push(PhonemeBoundary {
                start_frame: span_start,
                end_frame: t,
                phoneme: phonemes[p].clone(),
                confidence,
                duration_ms: (t - span_start) as f64 / frame_rate * 1000.0,
            });
            span_start = t;
        }
    }

    // Within-model state indices are what callers see.
    let model_state_offsets: Vec<usize> = {
        let mut offsets = Vec::with_capacity(models.len());
        let mut acc = 0;
        for m in models {
            offsets.push(acc);
            acc += m.num_states();
        }
        offsets
    };
    let within_path: Vec<usize> = chain_path
        .iter()
        .map(|&s| s - model_state_offsets[phoneme_of_state[s]])
        .collect();

    finish_alignment(within_path, chain_path, &emissions, &fb, boundaries, frame_rate)
}

fn span_confidence(
    fb: &ForwardBackwardResult,
    chain_path: &[usize],
    start: usize,
    end: usize,
) -> f64 {
    if end <= start {
        return 0.0;
    }
    let total: f64 = (start..end).map(|t| fb.gamma[[t, chain_path[t]]]).sum();
    total / (end - start) as f64
}

fn finish_alignment(
    state_sequence: Vec<usize>,
    scored_path: Vec<usize>,
    emissions: &Array2<f64>,
    fb: &ForwardBackwardResult,
    boundaries: Vec<PhonemeBoundary>,
    frame_rate: f64,
) -> SequenceAlignment {
    let frames = state_sequence.len();
    let frame_scores: Vec<f64> = (0..frames).map(|t| emissions[[t, scored_path[t]]]).collect();
    let state_posteriors: Vec<f64> = (0..frames).map(|t| fb.gamma[[t, scored_path[t]]]).collect();
    let total_score: f64 = frame_scores.iter().sum();
    let average_confidence = if frames > 0 {
        state_posteriors.iter().sum::<f64>() / frames as f64
    } else {
        0.0
    };
    SequenceAlignment {
        frame_to_state: state_sequence.clone(),
        state_sequence,
        frame_scores,
        state_posteriors,
        boundaries,
        total_score,
        average_confidence,
        frame_rate,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hmm::forward_backward::test::staircase_model;
    use ndarray::array;

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
    fn viterbi_recovers_the_staircase() {
        let model = staircase_model();
        let alignment = viterbi_alignment(&model, &staircase_observations(), 100.0);
        assert_eq!(alignment.state_sequence, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(alignment.state_sequence.len(), 6);
        assert!(alignment.total_score.is_finite());
        // Left-to-right: never decreasing.
        for pair in alignment.state_sequence.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn forced_alignment_extracts_clean_boundaries() {
        // Three phonemes, three frames each, one frame per state.
        let model = staircase_model();
        let observations: Vec<Array1<f64>> = vec![
            array![-1.0],
            array![0.0],
            array![1.0],
            array![-1.0],
            array![0.0],
            array![1.0],
            array![-1.0],
            array![0.0],
            array![1.0],
        ];
        let phonemes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let alignment = forced_alignment(&model, &observations, &phonemes, 100.0);

        assert_eq!(alignment.boundaries.len(), 3);
        let spans: Vec<(usize, usize, &str)> = alignment
            .boundaries
            .iter()
            .map(|b| (b.start_frame, b.end_frame, b.phoneme.as_str()))
            .collect();
        assert_eq!(spans, vec![(0, 3, "a"), (3, 6, "b"), (6, 9, "c")]);
        for b in &alignment.boundaries {
            assert!((b.duration_ms - 30.0).abs() < 1e-9);
        }
        assert!(
            alignment.average_confidence > 0.8,
            "confidence {}",
            alignment.average_confidence
        );
        // The within-model path retrogrades exactly at the hand-offs.
        assert_eq!(alignment.state_sequence[2], 2);
        assert_eq!(alignment.state_sequence[3], 0);
    }

    #[test]
    fn forced_boundaries_are_contiguous_and_cover() {
        let model = staircase_model();
        let observations: Vec<Array1<f64>> = (0..12)
            .map(|i| array![[-1.0, 0.0, 1.0][(i / 2) % 3]])
            .collect();
        let phonemes: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let alignment = forced_alignment(&model, &observations, &phonemes, 100.0);
        assert!(!alignment.boundaries.is_empty());
        assert_eq!(alignment.boundaries[0].start_frame, 0);
        assert_eq!(alignment.boundaries.last().unwrap().end_frame, 12);
        for pair in alignment.boundaries.windows(2) {
            assert_eq!(pair[0].end_frame, pair[1].start_frame);
        }
        let names: Vec<&str> = alignment.boundaries.iter().map(|b| b.phoneme.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn constrained_alignment_respects_hints() {
        let model = staircase_model();
        let observations: Vec<Array1<f64>> = vec![
            array![-1.0],
            array![0.0],
            array![1.0],
            array![-1.0],
            array![0.0],
            array![1.0],
        ];
        let phonemes: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        // Hints agree with the natural split at frame 3 (100 fps → 10 ms/frame).
        let hints = vec![(0.0, 30.0), (30.0, 60.0)];
        let alignment = constrained_alignment(&model, &observations, &phonemes, &hints, 100.0);
        assert_eq!(alignment.boundaries.len(), 2);
        assert_eq!(alignment.boundaries[0].end_frame, 3);
        // Mismatched hint count degrades to plain forced alignment.
        let alignment = constrained_alignment(&model, &observations, &phonemes, &[(0.0, 60.0)], 100.0);
        assert_eq!(alignment.boundaries.len(), 2);
    }

    #[test]
    fn batch_alignment_produces_one_result_per_sequence() {
        let model = staircase_model();
        let mut models = BTreeMap::new();
        models.insert(model.name.clone(), model);
        let sequences = vec![
            vec![array![-1.0], array![0.0], array![1.0]],
            vec![array![-1.0], array![0.0], array![1.0], array![1.0]],
        ];
        let phoneme_sequences = vec![
            vec!["a".to_string()],
            vec!["a".to_string()],
        ];
        let alignments = batch_forced_alignment(&models, &sequences, &phoneme_sequences, 100.0);
        assert_eq!(alignments.len(), 2);
        assert_eq!(alignments[0].boundaries.len(), 1);
        assert_eq!(alignments[1].boundaries[0].end_frame, 4);
    }

    #[test]
    fn empty_inputs_yield_empty_alignment() {
        let model = staircase_model();
        let alignment = viterbi_alignment(&model, &[], 100.0);
        assert!(alignment.state_sequence.is_empty());
        assert_eq!(alignment.total_score, f64::NEG_INFINITY);
    }
}
