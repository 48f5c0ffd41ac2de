//! HTS-style label output.
//!
//! Each line carries two timestamps in HTS 100 ns units followed by the
//! context label. The quinphone block uses the HTS separator convention
//! (`LL-L+C++R+RR`), the surrounding blocks encode syllable, word, phrase
//! and musical context.

use std::path::Path;

use crate::context::{ContextDescriptor, PhonemeTiming};
use crate::error::{ModelError, Result};
use tracing::info;

/// HTS timestamps count 100 ns units: 10 000 per millisecond.
pub const HTS_UNITS_PER_MS: f64 = 10_000.0;

/// One label line before rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEntry {
    pub start_ms: f64,
    pub end_ms: f64,
    pub label: String,
}

impl LabelEntry {
    pub fn new(descriptor: &ContextDescriptor, start_ms: f64, end_ms: f64) -> Self {
        Self {
            start_ms,
            end_ms,
            label: hts_label(descriptor),
        }
    }

    /// Renders `start end label` with timestamps in 100 ns units.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            (self.start_ms * HTS_UNITS_PER_MS).round() as i64,
            (self.end_ms * HTS_UNITS_PER_MS).round() as i64,
            self.label
        )
    }
}

/// Renders the context label:
/// `/A:a1_a2/B:b1_b2/C:LL-L+C++R+RR/D:d1_d2/E:e1_e2/F:f1_f2/G:g1_g2/H:h1_h2/I:i1_i2_i3`.
pub fn hts_label(descriptor: &ContextDescriptor) -> String {
    format!(
        "/A:{}_{}/B:{}_{}/C:{}-{}+{}++{}+{}/D:{}_{}/E:{}_{}/F:{}_{}/G:{}_{}/H:{}_{}/I:{}_{}_{}",
        descriptor.syllables_from_phrase_start,
        descriptor.syllables_to_phrase_end,
        descriptor.position_in_syllable,
        descriptor.syllable_length,
        descriptor.left_left,
        descriptor.left,
        descriptor.current,
        descriptor.right,
        descriptor.right_right,
        descriptor.position_in_word,
        descriptor.word_length,
        descriptor.words_from_phrase_start,
        descriptor.words_to_phrase_end,
        descriptor.phrase_length_syllables,
        descriptor.phrase_length_words,
        descriptor.pitch_cents as i64,
        descriptor.note_duration_ms as i64,
        descriptor.tempo_bpm as i64,
        descriptor.beat_position,
        descriptor.is_stressed as u8,
        descriptor.is_accented as u8,
        descriptor.stress_level,
    )
}

/// Builds label entries from parallel descriptor/timing sequences.
pub fn build_labels(
    descriptors: &[ContextDescriptor],
    timings: &[PhonemeTiming],
) -> Result<Vec<LabelEntry>> {
    if descriptors.len() != timings.len() {
        return Err(ModelError::InvalidInput(format!(
            "descriptor count {} does not match timing count {}",
            descriptors.len(),
            timings.len()
        )));
    }
    Ok(descriptors
        .iter()
        .zip(timings)
        .map(|(descriptor, timing)| LabelEntry::new(descriptor, timing.start_ms, timing.end_ms))
        .collect())
}

/// Renders a full label file.
pub fn render_label_file(entries: &[LabelEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    out
}

/// Writes a label file to disk.
pub fn write_label_file(
    path: impl AsRef<Path>,
    descriptors: &[ContextDescriptor],
    timings: &[PhonemeTiming],
) -> Result<()> {
    let entries = build_labels(descriptors, timings)?;
    std::fs::write(path.as_ref(), render_label_file(&entries))?;
    info!(
        path = %path.as_ref().display(),
        labels = entries.len(),
        "wrote label file"
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ContextDescriptor;

    fn descriptor() -> ContextDescriptor {
        let mut d = ContextDescriptor::for_phoneme("a");
        d.left = "k".into();
        d.right = "N".into();
        d.pitch_cents = -500.0;
        d.note_duration_ms = 150.0;
        d
    }

    #[test]
    fn timestamps_are_100ns_units() {
        let entry = LabelEntry::new(&descriptor(), 100.0, 250.0);
        let line = entry.to_line();
        let mut parts = line.split_whitespace();
        assert_eq!(parts.next(), Some("1000000"));
        assert_eq!(parts.next(), Some("2500000"));
        let label = parts.next().unwrap();
        assert!(label.starts_with("/A:"));
    }

    #[test]
    fn quinphone_block_uses_hts_separators() {
        let label = hts_label(&descriptor());
        assert!(label.contains("/C:sil-k+a++N+sil"), "{label}");
        assert!(label.contains("/G:-500_150"), "{label}");
        assert!(label.contains("/H:120_1"), "{label}");
        assert!(label.contains("/I:0_0_0"), "{label}");
    }

    #[test]
    fn label_file_has_one_line_per_phoneme() {
        let descriptors = vec![descriptor(), descriptor()];
        let timings = vec![
            PhonemeTiming::new("a", 0.0, 100.0),
            PhonemeTiming::new("a", 100.0, 200.0),
        ];
        let entries = build_labels(&descriptors, &timings).unwrap();
        let rendered = render_label_file(&entries);
        assert_eq!(rendered.lines().count(), 2);
        assert!(rendered.lines().all(|l| l.split_whitespace().count() == 3));

        assert!(build_labels(&descriptors, &timings[..1]).is_err());
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utterance.lab");
        let descriptors = vec![descriptor()];
        let timings = vec![PhonemeTiming::new("a", 0.0, 100.0)];
        write_label_file(&path, &descriptors, &timings).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("0 1000000 /A:"));
    }
}
