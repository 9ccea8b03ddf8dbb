//! Music/speech gate
//!
//! Classifies a decoded sample as music or non-music before any recognition
//! work is spent on it. Operates on fixed-size frames (2048 samples, hop
//! 512): per-frame RMS energy, zero-crossing rate, and FFT spectral centroid
//! and rolloff, combined into a single 0-100 music likelihood by a fixed
//! weighted sum.
//!
//! The weights, per-axis normalization references and the decision threshold
//! are policy constants carried over from observed tuning, exposed through
//! configuration rather than derived.

use crate::analysis::decoder::DecodedAudio;
use radiowatch_common::{Error, Result};
use rustfft::{num_complex::Complex, FftPlanner};

/// Analysis frame size in samples
const FRAME_SIZE: usize = 2048;
/// Hop between consecutive frames
const HOP_SIZE: usize = 512;

/// Frames below this RMS count as silent for spectral purposes
const SILENCE_FLOOR: f64 = 1e-4;

/// Spectral rolloff energy fraction
const ROLLOFF_FRACTION: f64 = 0.85;

// Axis normalization references. Each axis independently saturates at 100
// before weighting.
const CENTROID_BAND_LOW_HZ: f64 = 50.0;
const CENTROID_BAND_FULL_LOW_HZ: f64 = 500.0;
const CENTROID_BAND_FULL_HIGH_HZ: f64 = 4000.0;
const CENTROID_BAND_HIGH_HZ: f64 = 8000.0;
const ROLLOFF_RISE_HZ: f64 = 1500.0;
const ROLLOFF_FALL_LOW_HZ: f64 = 10000.0;
const ROLLOFF_FALL_HIGH_HZ: f64 = 20000.0;
const ZCR_REF: f64 = 0.25;
const RMS_CV_REF: f64 = 1.0;

// Axis weights (sum 1.0): centroid 25, RMS stability 25, inverse ZCR 20,
// rolloff 30.
const WEIGHT_CENTROID: f64 = 0.25;
const WEIGHT_RMS_STABILITY: f64 = 0.25;
const WEIGHT_INVERSE_ZCR: f64 = 0.20;
const WEIGHT_ROLLOFF: f64 = 0.30;

/// Default likelihood threshold for the music decision
pub const DEFAULT_MUSIC_THRESHOLD: f64 = 30.0;

/// Gate verdict for one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateVerdict {
    pub is_music: bool,
    /// Music likelihood, 0-100
    pub likelihood: f64,
}

/// Music/speech feature gate
#[derive(Debug, Clone)]
pub struct FeatureGate {
    threshold: f64,
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self::new(DEFAULT_MUSIC_THRESHOLD)
    }
}

impl FeatureGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Classify a decoded sample.
    ///
    /// Samples shorter than one frame score 0 (too short to call music);
    /// an empty buffer is a decode-stage defect and errors.
    pub fn analyze(&self, audio: &DecodedAudio) -> Result<GateVerdict> {
        if audio.samples.is_empty() {
            return Err(Error::Decode("empty sample buffer".to_string()));
        }

        let likelihood = if audio.samples.len() < FRAME_SIZE {
            0.0
        } else {
            self.compute_likelihood(&audio.samples, audio.sample_rate)
        };

        let verdict = GateVerdict {
            is_music: likelihood >= self.threshold,
            likelihood,
        };

        tracing::debug!(
            likelihood = format!("{:.1}", verdict.likelihood),
            is_music = verdict.is_music,
            "Feature gate verdict"
        );

        Ok(verdict)
    }

    fn compute_likelihood(&self, samples: &[f32], sample_rate: u32) -> f64 {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FRAME_SIZE);

        // Hann window, computed once
        let window: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / (FRAME_SIZE - 1) as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        let mut frame_rms: Vec<f64> = Vec::new();
        let mut centroids: Vec<f64> = Vec::new();
        let mut rolloffs: Vec<f64> = Vec::new();
        let mut zcrs: Vec<f64> = Vec::new();
        let mut buffer: Vec<Complex<f32>> = vec![Complex::default(); FRAME_SIZE];

        let bin_hz = sample_rate as f64 / FRAME_SIZE as f64;

        for frame in samples.windows(FRAME_SIZE).step_by(HOP_SIZE) {
            let rms = compute_rms(frame);
            frame_rms.push(rms);

            // Spectral and crossing features only for audible frames
            if rms < SILENCE_FLOOR {
                continue;
            }

            zcrs.push(compute_zero_crossing_rate(frame));

            for (i, (&s, &w)) in frame.iter().zip(window.iter()).enumerate() {
                buffer[i] = Complex::new(s * w, 0.0);
            }
            fft.process(&mut buffer);

            // Magnitude-squared spectrum up to Nyquist
            let spectrum: Vec<f64> = buffer[..FRAME_SIZE / 2]
                .iter()
                .map(|c| (c.norm_sqr()) as f64)
                .collect();

            let total: f64 = spectrum.iter().sum();
            if total < f64::EPSILON {
                continue;
            }

            let centroid: f64 = spectrum
                .iter()
                .enumerate()
                .map(|(i, &m)| i as f64 * bin_hz * m)
                .sum::<f64>()
                / total;
            centroids.push(centroid);

            let target = total * ROLLOFF_FRACTION;
            let mut cumulative = 0.0;
            let mut rolloff = (FRAME_SIZE / 2) as f64 * bin_hz;
            for (i, &m) in spectrum.iter().enumerate() {
                cumulative += m;
                if cumulative >= target {
                    rolloff = i as f64 * bin_hz;
                    break;
                }
            }
            rolloffs.push(rolloff);
        }

        if centroids.is_empty() {
            // Nothing audible in the sample
            return 0.0;
        }

        let centroid_score = band_score(
            mean(&centroids),
            CENTROID_BAND_LOW_HZ,
            CENTROID_BAND_FULL_LOW_HZ,
            CENTROID_BAND_FULL_HIGH_HZ,
            CENTROID_BAND_HIGH_HZ,
        );
        let rolloff_score = band_score(
            mean(&rolloffs),
            0.0,
            ROLLOFF_RISE_HZ,
            ROLLOFF_FALL_LOW_HZ,
            ROLLOFF_FALL_HIGH_HZ,
        );
        let inverse_zcr_score = (1.0 - mean(&zcrs) / ZCR_REF).clamp(0.0, 1.0) * 100.0;

        // RMS stability over all frames, silent ones included: bursty
        // energy (speech cadence, jingles over talk) reads as instability.
        let rms_mean = mean(&frame_rms);
        let stability_score = if rms_mean < SILENCE_FLOOR {
            0.0
        } else {
            let variance = frame_rms
                .iter()
                .map(|&r| (r - rms_mean).powi(2))
                .sum::<f64>()
                / frame_rms.len() as f64;
            let cv = variance.sqrt() / rms_mean;
            (1.0 - cv / RMS_CV_REF).clamp(0.0, 1.0) * 100.0
        };

        let likelihood = WEIGHT_CENTROID * centroid_score
            + WEIGHT_RMS_STABILITY * stability_score
            + WEIGHT_INVERSE_ZCR * inverse_zcr_score
            + WEIGHT_ROLLOFF * rolloff_score;

        tracing::trace!(
            centroid_score = format!("{:.1}", centroid_score),
            stability_score = format!("{:.1}", stability_score),
            inverse_zcr_score = format!("{:.1}", inverse_zcr_score),
            rolloff_score = format!("{:.1}", rolloff_score),
            "Feature gate axes"
        );

        likelihood.clamp(0.0, 100.0)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn compute_rms(frame: &[f32]) -> f64 {
    let sum_squares: f64 = frame.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum_squares / frame.len() as f64).sqrt()
}

/// Zero crossings per sample pair, in [0, 1]
fn compute_zero_crossing_rate(frame: &[f32]) -> f64 {
    let crossings = frame
        .windows(2)
        .filter(|w| (w[0] >= 0.0 && w[1] < 0.0) || (w[0] < 0.0 && w[1] >= 0.0))
        .count();
    crossings as f64 / (frame.len() - 1) as f64
}

/// Trapezoid band score: 0 outside [low, high], 100 inside
/// [full_low, full_high], linear on the shoulders.
fn band_score(value: f64, low: f64, full_low: f64, full_high: f64, high: f64) -> f64 {
    if value <= low || value >= high {
        0.0
    } else if value < full_low {
        (value - low) / (full_low - low) * 100.0
    } else if value <= full_high {
        100.0
    } else {
        (high - value) / (high - full_high) * 100.0
    }
}
