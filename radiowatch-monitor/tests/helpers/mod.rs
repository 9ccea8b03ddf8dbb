//! Shared fixtures for the pipeline integration tests:
//! WAV generators and a minimal in-process stream server.

#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Harmonic-rich steady tone; reliably gates as music
pub fn harmonic_tone(duration_secs: f32, sample_rate: u32) -> Vec<f32> {
    let num_samples = (duration_secs * sample_rate as f32) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let mut s = 0.0f32;
            for k in 1..=12 {
                s += (2.0 * std::f32::consts::PI * 220.0 * k as f32 * t).sin() / k as f32;
            }
            s * 0.3
        })
        .collect()
}

/// Encode mono f32 samples as an in-memory 16-bit WAV
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn music_wav() -> Vec<u8> {
    wav_bytes(&harmonic_tone(2.0, 22050), 22050)
}

pub fn silence_wav() -> Vec<u8> {
    wav_bytes(&vec![0.0; 2 * 22050], 22050)
}

/// Minimal HTTP stream stub: serves the current payload to every
/// connection, tracks peak concurrent connections.
pub struct StubStream {
    addr: SocketAddr,
    payload: Arc<Mutex<Vec<u8>>>,
    max_active: Arc<AtomicUsize>,
}

impl StubStream {
    pub async fn start(initial_payload: Vec<u8>, response_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = Arc::new(Mutex::new(initial_payload));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let accept_payload = Arc::clone(&payload);
        let accept_active = Arc::clone(&active);
        let accept_max = Arc::clone(&max_active);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let payload = Arc::clone(&accept_payload);
                let active = Arc::clone(&accept_active);
                let max_active = Arc::clone(&accept_max);
                tokio::spawn(async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now_active, Ordering::SeqCst);

                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;

                    if !response_delay.is_zero() {
                        tokio::time::sleep(response_delay).await;
                    }

                    let body = payload.lock().await.clone();
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;

                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            payload,
            max_active,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    /// Swap what subsequent connections receive
    pub async fn set_payload(&self, bytes: Vec<u8>) {
        *self.payload.lock().await = bytes;
    }

    /// Peak number of simultaneous connections served so far
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}
