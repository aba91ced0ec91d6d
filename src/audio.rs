//! PCM helpers shared by the VAD, the TTS engines and the sound bank.
//!
//! All call audio is 16-bit little-endian mono PCM at the call sample rate.

use std::io::{Cursor, Read, Seek};
use std::path::Path;

/// Error type for audio conversion operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Convert i16 PCM samples to little-endian bytes
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian bytes to i16 PCM samples. A trailing odd byte is dropped.
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Seconds of audio in a PCM byte buffer.
pub fn pcm_duration_secs(bytes: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    bytes as f64 / (sample_rate as f64 * 2.0)
}

/// Root-mean-square level normalized to 0.0..=1.0.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler. Good enough for speech prompts.
///
/// Output sample `i` sits at input position `i * from_rate / to_rate`.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let (from, to) = (from_rate as u64, to_rate as u64);
    let out_len = (samples.len() as u64 * to / from) as usize;
    let last = samples.len() - 1;

    (0..out_len as u64)
        .map(|i| {
            let pos = i * from;
            let idx = (pos / to) as usize;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            interpolate(a, b, pos % to, to)
        })
        .collect()
}

/// Point `rem / to` of the way from `a` to `b`.
pub(crate) fn interpolate(a: i16, b: i16, rem: u64, to: u64) -> i16 {
    let (a, b) = (a as f64, b as f64);
    (a + (b - a) * (rem as f64 / to as f64)).round() as i16
}

/// Decode a WAV stream into mono PCM at `target_rate`.
pub fn decode_wav<R: Read>(reader: R, target_rate: u32) -> Result<Vec<i16>> {
    let mut wav = hound::WavReader::new(reader)?;
    let spec = wav.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => wav.samples::<i16>().collect::<std::result::Result<_, _>>()?,
        (hound::SampleFormat::Int, bits) if bits > 16 && bits <= 32 => {
            let shift = bits - 16;
            wav.samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<std::result::Result<_, _>>()?
        }
        (hound::SampleFormat::Float, 32) => wav
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<_, _>>()?,
        (format, bits) => {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} {} bit",
                format, bits
            )))
        }
    };

    let mono = downmix(&samples, spec.channels);
    Ok(resample_linear(&mono, spec.sample_rate, target_rate))
}

/// Decode an in-memory WAV file into mono PCM bytes at `target_rate`.
pub fn wav_bytes_to_pcm(wav: &[u8], target_rate: u32) -> Result<Vec<u8>> {
    let samples = decode_wav(Cursor::new(wav), target_rate)?;
    Ok(i16_slice_to_u8(&samples))
}

/// Encode mono 16-bit PCM samples as a WAV file in memory.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    write_wav(&mut cursor, samples, sample_rate)?;
    Ok(cursor.into_inner())
}

/// Save mono 16-bit PCM samples to a WAV file.
pub fn save_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let file = std::fs::File::create(path).map_err(hound::Error::IoError)?;
    let mut writer = std::io::BufWriter::new(file);
    write_wav(&mut writer, samples, sample_rate)
}

fn write_wav<W: std::io::Write + Seek>(out: W, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::new(out, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
