//! Audio helpers: WAV encode/decode, PCM conversion, resampling and
//! time-stretching
//!
//! All sample buffers are mono `f32` in `[-1.0, 1.0]`.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use std::io::Cursor;

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input block size for the FFT resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Overlap-add frame length
const STRETCH_FRAME: usize = 1024;

/// Overlap-add synthesis hop (75% overlap)
const STRETCH_HOP: usize = STRETCH_FRAME / 4;

/// Encode mono samples as a 16-bit PCM WAV file
///
/// # Errors
///
/// Returns error if the WAV writer fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(to_i16(s))?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Write mono samples to a 16-bit PCM WAV file on disk
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn write_wav(path: &std::path::Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let bytes = samples_to_wav(samples, sample_rate)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Decode a WAV file into mono samples and its sample rate
///
/// Multi-channel input is mixed down by averaging.
///
/// # Errors
///
/// Returns error if the data is not a readable WAV file
pub fn wav_to_samples(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| int_to_f32(v, scale)))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / usize_to_f32(frame.len()))
            .collect()
    };

    Ok((samples, spec.sample_rate))
}

/// Decode raw little-endian signed 16-bit PCM
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_to_samples(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Resample mono audio from one rate to another
///
/// Returns the input unchanged when the rates match. The output length is
/// the input length scaled by the rate ratio.
///
/// # Errors
///
/// Returns error if the resampler cannot be constructed or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(Error::Audio("sample rate must be positive".to_string()));
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("failed to create resampler: {e}")))?;

    let expected = expected_len(samples.len(), from_rate, to_rate);
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let frames = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }

    let rest: [&[f32]; 1] = [chunks.remainder()];
    if !rest[0].is_empty() {
        let frames = resampler
            .process_partial(Some(&rest[..]), None)
            .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }

    // Flush the filter tail until the delayed signal is fully out
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let start = delay.min(out.len());
    let mut trimmed = out.split_off(start);
    trimmed.truncate(expected);
    Ok(trimmed)
}

/// Change playback speed without changing pitch or sample rate
///
/// `speed` > 1.0 shortens the audio, < 1.0 lengthens it. Uses windowed
/// overlap-add with a fixed synthesis hop.
///
/// # Errors
///
/// Returns error if `speed` is not a positive finite number
pub fn time_stretch(samples: &[f32], speed: f32) -> Result<Vec<f32>> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(Error::Audio(format!("invalid speed factor: {speed}")));
    }
    if (speed - 1.0).abs() < f32::EPSILON || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let out_len = expected_stretch_len(samples.len(), speed);
    if samples.len() < STRETCH_FRAME {
        return Ok(linear_stretch(samples, out_len));
    }

    let window: Vec<f32> = (0..STRETCH_FRAME)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * usize_to_f32(i) / usize_to_f32(STRETCH_FRAME);
            0.5 - 0.5 * phase.cos()
        })
        .collect();

    let mut out = vec![0.0_f32; out_len + STRETCH_FRAME];
    let mut norm = vec![0.0_f32; out_len + STRETCH_FRAME];

    let analysis_hop = f64::from(speed) * STRETCH_HOP as f64;
    let last_start = samples.len() - STRETCH_FRAME;

    let mut frame_index = 0usize;
    loop {
        let synth_pos = frame_index * STRETCH_HOP;
        if synth_pos >= out_len {
            break;
        }
        let analysis_pos = ((frame_index as f64 * analysis_hop).round() as usize).min(last_start);

        for (i, w) in window.iter().enumerate() {
            out[synth_pos + i] += samples[analysis_pos + i] * w;
            norm[synth_pos + i] += w;
        }
        frame_index += 1;
    }

    out.truncate(out_len);
    for (s, n) in out.iter_mut().zip(norm) {
        if n > 1e-3 {
            *s /= n;
        }
    }

    Ok(out)
}

/// Duration in seconds of `len` samples at `sample_rate`
#[must_use]
pub fn duration_secs(len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    len as f64 / f64::from(sample_rate)
}

fn linear_stretch(samples: &[f32], out_len: usize) -> Vec<f32> {
    if out_len == 0 {
        return Vec::new();
    }
    let last = samples.len() - 1;
    let step = last as f64 / (out_len.max(2) - 1) as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx].mul_add(1.0 - frac, samples[next] * frac)
        })
        .collect()
}

fn expected_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    let scaled = (len as u128 * u128::from(to_rate)).div_ceil(u128::from(from_rate));
    usize::try_from(scaled).unwrap_or(usize::MAX)
}

fn expected_stretch_len(len: usize, speed: f32) -> usize {
    (len as f64 / f64::from(speed)).round() as usize
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn int_scale(bits: u16) -> f32 {
    (1_i64 << (bits.clamp(1, 32) - 1)) as f32
}

fn int_to_f32(value: i32, scale: f32) -> f32 {
    value as f32 / scale
}

fn usize_to_f32(value: usize) -> f32 {
    value as f32
}
