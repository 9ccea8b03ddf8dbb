//! Audio decoding
//!
//! Decodes a fetched stream sample (raw container bytes) to mono f32 PCM
//! using symphonia. Stream samples are cut off mid-frame by the bounded
//! fetch, so a decode error after some audio has been produced is treated as
//! end-of-sample rather than failure; an error before any audio decodes is a
//! real decode failure.

use radiowatch_common::{Error, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded audio sample
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono audio samples (f32, range [-1.0, 1.0])
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Original channel count
    pub channels: usize,
    /// Decoded length in seconds; attached to every downstream result so no
    /// later stage recomputes it from raw bytes
    pub duration_seconds: f64,
}

/// Decode raw sample bytes to mono f32 PCM
///
/// `content_type_hint` is the stream's Content-Type (e.g. "audio/mpeg") and
/// helps symphonia probe truncated containers.
pub fn decode_sample(bytes: Vec<u8>, content_type_hint: Option<&str>) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty sample buffer".to_string()));
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(mime) = content_type_hint {
        hint.mime_type(mime);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Decode(format!("probe failed: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Decode("no audio track in sample".to_string()))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Decode("sample rate unknown".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| Error::Decode("channel layout unknown".to_string()))?;
    let channel_count = channels.count();

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(format!("decoder init failed: {}", e)))?;

    let mut mono: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // Truncated container: stop at whatever decoded cleanly
            Err(_) => break,
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(_) => break,
        };

        let buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec())
        });
        buf.copy_interleaved_ref(decoded);

        // Average interleaved channels to mono
        for frame in buf.samples().chunks_exact(channel_count) {
            mono.push(frame.iter().sum::<f32>() / channel_count as f32);
        }
    }

    if mono.is_empty() {
        return Err(Error::Decode("no audio decoded from sample".to_string()));
    }

    let duration_seconds = mono.len() as f64 / sample_rate as f64;

    tracing::debug!(
        total_samples = mono.len(),
        sample_rate,
        channels = channel_count,
        duration_seconds = format!("{:.2}", duration_seconds),
        "Sample decoding complete"
    );

    Ok(DecodedAudio {
        samples: mono,
        sample_rate,
        channels: channel_count,
        duration_seconds,
    })
}
