//! Statistical core of the NexusSynth singing-voice synthesizer.
//!
//! This crate covers the HMM side of an HTS-style synthesis pipeline,
//! specialised for sung Japanese: context feature extraction with musical
//! (pitch/duration/tempo) context, Gaussian-mixture emissions with EM
//! training, Baum–Welch model training with multi-criteria convergence
//! detection, Viterbi decoding and forced alignment with per-phoneme
//! boundaries, Global Variance statistics, and MLPG trajectory generation
//! under static/Δ/ΔΔ constraints.
//!
//! What it deliberately does *not* do: waveform analysis or synthesis,
//! voicebank/MIDI file parsing, or audio I/O. The crate consumes
//! pre-extracted acoustic frame vectors plus parsed phoneme timing records
//! and produces trained models and smooth parameter trajectories for a
//! vocoder to render.
//!
//! A typical training run goes through [`bridge::TrainingPipeline`]:
//! context features are extracted per phoneme, acoustic sequences are
//! grouped under quinphone model names, one [`hmm::PhonemeHmm`] is trained
//! per context with [`hmm::trainer::MultiModelTrainer`], and the models are
//! persisted as JSON. At synthesis time [`bridge::ContextMlpgBridge`] maps
//! a context sequence back onto the trained models, expands state
//! durations, and runs [`mlpg::MlpgEngine`] with an optional
//! [`gv`](crate::gv) correction pass.

use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

mod cache;

pub mod bridge;
pub mod context;
pub mod error;
pub mod gmm;
pub mod gv;
pub mod hmm;
pub mod mlpg;
pub mod numerics;
pub mod serde_arrays;

pub use error::{ModelError, Result};

/// Convenience function to set up logging for binaries and tests driving
/// this crate. Defaults the crate to `info` unless `RUST_LOG` says
/// otherwise.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("nexussynth=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    // A second initialisation (tests) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
