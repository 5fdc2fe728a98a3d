use anyhow::Result;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;
use std::path::Path;

/// Save mono 16 kHz samples as a 16-bit WAV file. Used for debug dumps
/// of closed speech segments.
pub fn save_wav_file<P: AsRef<Path>>(file_path: P, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(file_path.as_ref(), spec)?;
    for sample in samples {
        let sample_i16 = (sample * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
        writer.write_sample(sample_i16)?;
    }
    writer.finalize()?;

    debug!("Saved WAV file: {:?}", file_path.as_ref());
    Ok(())
}

/// Convert f32 samples to little-endian 16-bit PCM bytes for the wire.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_clamps_and_scales() {
        let bytes = samples_to_pcm16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32_767);
        // Overdriven input clamps instead of wrapping.
        assert_eq!(i16::from_le_bytes([bytes[6], bytes[7]]), 32_767);
    }
}
