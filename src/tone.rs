//! tone.rs — Confidence beeps.
//! A short enveloped sine is rendered to WAV with `hound` and played through
//! rodio (feature `audio`) or `aplay` when built without it.

use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::feedback::ToneSink;

pub const SAMPLE_RATE: u32 = 44_100;

/// An eighth note at 120 bpm.
pub const EIGHTH_NOTE: Duration = Duration::from_millis(250);

/// Render a mono 16-bit sine at `freq_hz` into WAV bytes.
///
/// A 10 ms linear attack and release keep the edges click-free.
pub fn synthesize_tone(freq_hz: f32, duration: Duration, volume: f32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let total = (duration.as_secs_f32() * SAMPLE_RATE as f32) as usize;
    let ramp = ((SAMPLE_RATE as f32 * 0.010) as usize).min(total / 2).max(1);
    let amplitude = volume.clamp(0.0, 1.0) * i16::MAX as f32;

    let mut cursor = Cursor::new(Vec::with_capacity(44 + total * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for n in 0..total {
            let envelope = if n < ramp {
                n as f32 / ramp as f32
            } else if n >= total - ramp {
                (total - n) as f32 / ramp as f32
            } else {
                1.0
            };
            let t = n as f32 / SAMPLE_RATE as f32;
            let sample = (t * freq_hz * std::f32::consts::TAU).sin() * amplitude * envelope;
            writer.write_sample(sample as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Plays each tone on a short-lived background thread so the loop never waits.
pub struct WavTonePlayer {
    volume: f32,
}

impl WavTonePlayer {
    pub fn new(volume: f32) -> Self {
        Self { volume }
    }
}

impl ToneSink for WavTonePlayer {
    fn play(&mut self, freq_hz: f32, duration: Duration) {
        let wav = match synthesize_tone(freq_hz, duration, self.volume) {
            Ok(wav) => wav,
            Err(e) => {
                warn!("Tone synthesis failed: {}", e);
                return;
            }
        };
        debug!("Tone {:.0} Hz for {} ms", freq_hz, duration.as_millis());
        std::thread::spawn(move || {
            if let Err(e) = play_wav_blocking(&wav) {
                warn!("Tone playback error: {}", e);
            }
        });
    }
}

/// Play WAV bytes through the default audio output. Blocks until done.
#[cfg(feature = "audio")]
pub fn play_wav_blocking(wav_data: &[u8]) -> Result<(), String> {
    use rodio::{Decoder, OutputStream, Sink};
    use std::io::BufReader;

    let (_stream, handle) =
        OutputStream::try_default().map_err(|e| format!("Cannot open audio output: {e}"))?;
    let sink = Sink::try_new(&handle).map_err(|e| format!("Cannot create audio sink: {e}"))?;
    let source = Decoder::new(BufReader::new(Cursor::new(wav_data.to_vec())))
        .map_err(|e| format!("Cannot decode WAV: {e}"))?;
    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}

/// Play WAV bytes by piping them into `aplay`. Blocks until done.
#[cfg(not(feature = "audio"))]
pub fn play_wav_blocking(wav_data: &[u8]) -> Result<(), String> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("aplay")
        .arg("-q")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("aplay execution error: {e}"))?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(wav_data)
            .map_err(|e| format!("aplay stdin error: {e}"))?;
    }
    let status = child.wait().map_err(|e| format!("aplay wait error: {e}"))?;
    if !status.success() {
        return Err(format!("aplay exited with {status}"));
    }
    Ok(())
}
