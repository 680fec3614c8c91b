//! # Raw PCM Helpers
//!
//! Clients stream raw 16-bit little-endian PCM. These helpers are the only place
//! that interprets those bytes: decoding samples for energy measurement and
//! wrapping a byte run in a WAV container for the recognition engine.

use crate::config::AudioFormatConfig;
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Decode 16-bit little-endian samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    let even = &data[..data.len() - data.len() % 2];
    let mut cursor = Cursor::new(even);
    let mut samples = Vec::with_capacity(even.len() / 2);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    samples
}

/// Mean squared sample value of a frame. An empty frame has zero energy.
pub fn mean_square_energy(data: &[u8]) -> f64 {
    let samples = decode_samples(data);
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();
    sum / samples.len() as f64
}

/// Seconds of audio represented by `byte_len` bytes in the given format.
pub fn duration_secs(byte_len: usize, format: &AudioFormatConfig) -> f64 {
    let rate = format.bytes_per_second();
    if rate == 0 {
        return 0.0;
    }
    byte_len as f64 / rate as f64
}

/// Wrap raw PCM bytes in a WAV container (integer PCM, configured rate and channels).
///
/// The engine is handed a complete file rather than bare samples so the
/// channel count, sample width and rate always travel with the audio.
pub fn encode_wav(pcm: &[u8], format: &AudioFormatConfig) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bit_depth,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("failed to start WAV container")?;
        for sample in decode_samples(pcm) {
            writer
                .write_sample(sample)
                .context("failed to write PCM sample")?;
        }
        writer.finalize().context("failed to finalize WAV container")?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormatConfig {
        AudioFormatConfig {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }

    #[test]
    fn test_decode_drops_trailing_byte() {
        let data = [0x01, 0x00, 0xff, 0xff, 0x7f];
        assert_eq!(decode_samples(&data), vec![1, -1]);
    }

    #[test]
    fn test_energy() {
        assert_eq!(mean_square_energy(&[]), 0.0);
        assert_eq!(mean_square_energy(&[0x05]), 0.0);

        let mut data = Vec::new();
        for sample in [1000i16, -1000, 1000, -1000] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        assert_eq!(mean_square_energy(&data), 1_000_000.0);
    }

    #[test]
    fn test_duration() {
        assert_eq!(duration_secs(32000, &format()), 1.0);
        assert_eq!(duration_secs(8000, &format()), 0.25);
    }

    #[test]
    fn test_wav_container() {
        let pcm: Vec<u8> = [0i16, 100, -100, 32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = encode_wav(&pcm, &format()).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > pcm.len());

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 100, -100, 32767]);
    }
}
