//! Sample analysis: decode and the music/speech gate

pub mod decoder;
pub mod feature_gate;

pub use decoder::{decode_sample, DecodedAudio};
pub use feature_gate::{FeatureGate, GateVerdict, DEFAULT_MUSIC_THRESHOLD};
