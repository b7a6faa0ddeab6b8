/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! The shared-read waveform container.
use core::f64::consts::PI;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::wav;

/// A monophonic floating-point waveform with a fixed sample rate.
///
/// The sample storage is shared behind an [Arc], so cloning a [Sound] is cheap
/// and every clone may be read concurrently from multiple decoder back-ends.
/// Samples are nominally in the `-1.0..=1.0` range.
#[derive(Clone, Debug)]
pub struct Sound {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

/// A growable waveform buffer for assembling dumps and recordings.
///
/// Unlike [Sound] it is exclusively owned and writable at random offsets.
#[derive(Clone, Debug)]
pub struct SoundBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Sound {
    /// Creates a waveform from raw samples.
    pub fn new<T: Into<Arc<[f32]>>>(samples: T, sample_rate: u32) -> Self {
        assert!(sample_rate != 0);
        Sound { samples: samples.into(), sample_rate }
    }

    /// Reads a waveform from a **WAV** file.
    ///
    /// Only 16-bit PCM input is accepted; stereo files are averaged to mono.
    pub fn from_wav_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let (samples, sample_rate) = wav::read_wav(path)?;
        Ok(Sound::new(samples, sample_rate))
    }

    /// Writes the waveform to a mono 16-bit PCM **WAV** file.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        wav::write_wav(path, &self.samples, self.sample_rate)
    }

    /// Returns the length in samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if the waveform contains no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns a view of the raw samples.
    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Fills `buf` with samples starting at the (possibly negative) offset
    /// `start`. Positions outside the waveform read as zero.
    ///
    /// Callable from any thread.
    pub fn read_into(&self, start: i64, buf: &mut [f32]) {
        let len = self.samples.len() as i64;
        for (i, y) in buf.iter_mut().enumerate() {
            let x = start + i as i64;
            *y = if x >= 0 && x < len { self.samples[x as usize] } else { 0.0 };
        }
    }

    /// Returns a copy limited to the given time interval.
    ///
    /// `skip_seconds` of audio is dropped from the front and at most
    /// `max_seconds` is kept. Either may exceed the waveform, in which case
    /// the result is shortened accordingly.
    pub fn clip(&self, skip_seconds: f64, max_seconds: f64) -> Sound {
        let rate = self.sample_rate as f64;
        let skip = ((skip_seconds * rate).round().max(0.0) as usize).min(self.samples.len());
        let keep = ((max_seconds * rate).round().max(0.0) as usize).min(self.samples.len() - skip);
        Sound::new(&self.samples[skip..skip + keep], self.sample_rate)
    }

    /// Reduces the sample rate by the integer `down_factor`.
    ///
    /// Uses a Hann-windowed sinc kernel of `8 * down_factor` one-sided taps,
    /// normalized to unit sum. A factor of 1 returns a clone.
    pub fn downsample(&self, down_factor: u32) -> Sound {
        assert!(down_factor > 0);
        if down_factor == 1 {
            return self.clone();
        }
        let coeffs = downsampling_kernel(down_factor as usize);
        let src = &self.samples[..];
        let out_len = src.len() / down_factor as usize;
        let mut samples = Vec::with_capacity(out_len);
        let at = |x: i64| -> f32 {
            if x >= 0 && (x as usize) < src.len() { src[x as usize] } else { 0.0 }
        };
        for i in 0..out_len {
            let j = (i * down_factor as usize) as i64;
            let mut s = coeffs[0] * at(j);
            for (k, c) in coeffs.iter().enumerate().skip(1) {
                s += c * (at(j + k as i64) + at(j - k as i64));
            }
            samples.push(s);
        }
        Sound::new(samples, self.sample_rate / down_factor)
    }
}

// One-sided Hann-windowed sinc, sum (counting mirrored taps) normalized to 1.
fn downsampling_kernel(down_factor: usize) -> Vec<f32> {
    let coeff_cnt = 8 * down_factor;
    let mut coeffs = Vec::with_capacity(coeff_cnt);
    for i in 0..coeff_cnt {
        let x = i as f64 / down_factor as f64;
        let sinc = if i == 0 { 1.0 } else { (PI * x).sin() / (PI * x) };
        let window = 1.0 + (PI * i as f64 / coeff_cnt as f64).cos();
        coeffs.push((sinc * window) as f32);
    }
    let sum: f32 = coeffs[0] + 2.0 * coeffs[1..].iter().sum::<f32>();
    for c in coeffs.iter_mut() {
        *c /= sum;
    }
    coeffs
}

impl SoundBuffer {
    /// Creates an empty buffer with the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        assert!(sample_rate != 0);
        SoundBuffer { samples: Vec::new(), sample_rate }
    }

    /// Creates a zero-filled buffer of `len` samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        assert!(sample_rate != 0);
        SoundBuffer { samples: vec![0.0; len], sample_rate }
    }

    /// Returns the length in samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if the buffer contains no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Appends samples at the end of the buffer.
    pub fn append(&mut self, buf: &[f32]) {
        self.samples.extend_from_slice(buf);
    }

    /// Writes samples at the given offset, growing the buffer when needed.
    ///
    /// The part of `buf` that would land left of offset zero is discarded.
    pub fn write(&mut self, start: i64, buf: &[f32]) {
        let (skip, start) = if start < 0 { ((-start) as usize, 0usize) } else { (0, start as usize) };
        if skip >= buf.len() {
            return;
        }
        let buf = &buf[skip..];
        let end = start + buf.len();
        if end > self.samples.len() {
            self.samples.resize(end, 0.0);
        }
        self.samples[start..end].copy_from_slice(buf);
    }

    /// Freezes the buffer into a shareable [Sound].
    pub fn into_sound(self) -> Sound {
        Sound::new(self.samples, self.sample_rate)
    }

    /// Writes the buffer to a mono 16-bit PCM **WAV** file.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        wav::write_wav(path, &self.samples, self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_into_pads_with_zeros() {
        let snd = Sound::new(vec![1.0, 2.0, 3.0], 44100);
        let mut buf = [9.0f32; 7];
        snd.read_into(-2, &mut buf);
        assert_eq!(buf, [0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn clip_limits_interval() {
        let samples: Vec<f32> = (0..44100).map(|i| i as f32).collect();
        let snd = Sound::new(samples, 44100);
        let clipped = snd.clip(0.5, 0.25);
        assert_eq!(clipped.len(), 11025);
        assert_eq!(clipped.samples()[0], 22050.0);
        // clipping past the end yields what remains
        let tail = snd.clip(0.9, 10.0);
        assert_eq!(tail.len(), 4410);
    }

    #[test]
    fn downsampling_kernel_sums_to_one() {
        for factor in [2usize, 3, 4] {
            let coeffs = downsampling_kernel(factor);
            assert_eq!(coeffs.len(), 8 * factor);
            let sum = coeffs[0] + 2.0 * coeffs[1..].iter().sum::<f32>();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn downsample_preserves_dc() {
        let snd = Sound::new(vec![0.5f32; 4410], 44100);
        let down = snd.downsample(2);
        assert_eq!(down.sample_rate(), 22050);
        assert_eq!(down.len(), 2205);
        // away from the edges the constant level must be preserved
        for &y in &down.samples()[20..down.len() - 20] {
            assert!((y - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn buffer_write_grows_and_overwrites() {
        let mut buf = SoundBuffer::new(44100);
        buf.write(2, &[1.0, 1.0]);
        assert_eq!(buf.len(), 4);
        buf.write(-1, &[2.0, 3.0]);
        let snd = buf.into_sound();
        assert_eq!(snd.samples(), &[3.0, 0.0, 1.0, 1.0]);
    }
}
