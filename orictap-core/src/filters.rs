/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! Signal processing primitives used throughout the decoder.

All filters here are pure functions over contiguous sample slices. The
caller pre-pads the input by the filter margin; outputs are shorter than
inputs by `filterlen - 1`. Impossible length arguments are precondition
violations and panic, they are not recoverable errors.
*/
use core::f32::consts::PI;

/// Cubic interpolation of `vals` at the fractional index `x`.
///
/// Positions outside the slice read as zero.
pub fn interp(vals: &[f32], x: f32) -> f32 {
    let x0 = x.floor() as i64;
    let frac = x - x0 as f32;
    let at = |i: i64| -> f32 {
        if i >= 0 && (i as usize) < vals.len() { vals[i as usize] } else { 0.0 }
    };
    let y0 = at(x0 - 1);
    let y1 = at(x0);
    let y2 = at(x0 + 1);
    let y3 = at(x0 + 2);
    y1 + frac * (y2 - y0
        + frac * (2.0 * y0 - 5.0 * y1 + 4.0 * y2 - y3
            + frac * (-y0 + 3.0 * y1 - 3.0 * y2 + y3))) / 2.0
}

/// Linear interpolation of `vals` at the fractional index `x`.
///
/// Positions outside the slice read as zero.
#[inline]
pub fn interp_lin(vals: &[f32], x: f32) -> f32 {
    let x0 = x.floor() as i64;
    let frac = x - x0 as f32;
    let at = |i: i64| -> f32 {
        if i >= 0 && (i as usize) < vals.len() { vals[i as usize] } else { 0.0 }
    };
    let y0 = at(x0);
    let y1 = at(x0 + 1);
    y0 + frac * (y1 - y0)
}

macro_rules! running_minmax {
    ($name:ident, $cmp:expr, $doc:expr) => {
        #[doc = $doc]
        ///
        /// Uses the two-pass block algorithm: one left sweep and one right
        /// sweep per `filterlen`-sized block, so each output sample costs an
        /// amortized O(1) comparisons regardless of the window length.
        ///
        /// Requires `dst.len() == src.len() - filterlen + 1`.
        pub fn $name(dst: &mut [f32], src: &[f32], filterlen: usize) {
            let combine: fn(f32, f32) -> f32 = $cmp;
            assert!(filterlen > 0);
            assert_eq!(dst.len(), src.len() - filterlen + 1);

            // Trivially evaluate leading outputs until the remaining
            // output length is a multiple of the block size.
            let lead = dst.len() % filterlen;
            for i in 0..lead {
                let mut acc = src[i];
                for &y in &src[i + 1..i + filterlen] {
                    acc = combine(acc, y);
                }
                dst[i] = acc;
            }

            let mut i = lead;
            while i < dst.len() {
                // Starting element of the block
                let mut acc = src[i + filterlen - 1];
                dst[i + filterlen - 1] = acc;

                // Left sweep
                for j in (0..filterlen - 1).rev() {
                    acc = combine(acc, src[i + j]);
                    dst[i + j] = acc;
                }

                // Right sweep, reusing the starting element
                acc = src[i + filterlen - 1];
                for j in 1..filterlen {
                    acc = combine(acc, src[i + filterlen - 1 + j]);
                    dst[i + j] = combine(acc, dst[i + j]);
                }
                i += filterlen;
            }
        }
    };
}

running_minmax!(running_min, |a, b| if b < a { b } else { a },
    "Running minimum over a window of `filterlen` samples.");
running_minmax!(running_max, |a, b| if b > a { b } else { a },
    "Running maximum over a window of `filterlen` samples.");

/// Low-pass filter with a Hann kernel of odd length `filterlen`.
///
/// The kernel is `1 + cos(2 pi (i - filterlen/2) / filterlen)` normalized to
/// unit sum. Implemented as a sliding sum with a constant and two quadrature
/// accumulators updated by the single-sample difference at each step, so one
/// output costs O(1) regardless of the kernel length.
///
/// Requires an odd `filterlen` and `dst.len() == src.len() - filterlen + 1`.
pub fn hann_lowpass(dst: &mut [f32], src: &[f32], filterlen: usize) {
    assert!(filterlen > 0);
    assert!(filterlen & 1 == 1);
    assert_eq!(dst.len(), src.len() - filterlen + 1);

    let mut ckern = vec![0.0f32; filterlen];
    let mut skern = vec![0.0f32; filterlen];
    let k = 2.0 * PI / filterlen as f32;
    let mut csum = 0.0f32;
    for i in 0..filterlen {
        let phi = k * (i as f32 - (filterlen / 2) as f32);
        ckern[i] = phi.cos();
        skern[i] = phi.sin();
        csum += ckern[i];
    }

    // Normalizes the Hann kernel sum to 1
    let kh = 1.0 / (filterlen as f32 + csum);

    // Initial window position
    let mut r = 0.0f32;
    let mut c = 0.0f32;
    let mut s = 0.0f32;
    for i in 0..filterlen {
        let x = src[i];
        r += x;
        c += x * ckern[i];
        s += x * skern[i];
    }
    dst[0] = kh * (r + c);

    // Incremental update for the remaining positions
    for i in 1..dst.len() {
        let dx = src[i + filterlen - 1] - src[i - 1];
        let j = (i - 1) % filterlen;

        r += dx;
        c += dx * ckern[j];
        s += dx * skern[j];

        let j = (i + filterlen / 2) % filterlen;
        dst[i] = kh * (ckern[j] * c + skern[j] * s + r);
    }
}

/// A Hann low-pass reader over a shared-read waveform.
///
/// Handles the pre-padding margin internally so callers can read the
/// filtered signal at arbitrary (even negative) offsets.
pub struct Lowpass {
    src: orictap_audio::Sound,
    filterlen: usize,
    ibuf: Vec<f32>,
}

impl Lowpass {
    /// Creates a low-pass reader with the given odd kernel length.
    pub fn new(src: orictap_audio::Sound, filterlen: usize) -> Self {
        assert!(filterlen & 1 == 1);
        Lowpass { src, filterlen, ibuf: Vec::new() }
    }

    /// Returns the sample rate of the source waveform.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.src.sample_rate()
    }

    /// Returns the length of the source waveform in samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.src.len()
    }

    /// Returns `true` if the source waveform is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    /// Reads the low-passed signal starting at the sample offset `start`.
    pub fn read(&mut self, start: i64, buf: &mut [f32]) {
        let margin = self.filterlen / 2;
        self.ibuf.resize(buf.len() + 2 * margin, 0.0);
        self.src.read_into(start - margin as i64, &mut self.ibuf);
        hann_lowpass(buf, &self.ibuf, self.filterlen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_min(src: &[f32], filterlen: usize) -> Vec<f32> {
        src.windows(filterlen)
            .map(|w| w.iter().copied().fold(f32::INFINITY, f32::min))
            .collect()
    }

    fn brute_max(src: &[f32], filterlen: usize) -> Vec<f32> {
        src.windows(filterlen)
            .map(|w| w.iter().copied().fold(f32::NEG_INFINITY, f32::max))
            .collect()
    }

    #[test]
    fn interp_hits_sample_points() {
        let vals = [0.0, 1.0, 4.0, 9.0, 16.0];
        for (i, &v) in vals.iter().enumerate() {
            assert_eq!(interp(&vals, i as f32), v);
            assert_eq!(interp_lin(&vals, i as f32), v);
        }
        // cubic interpolation reproduces a parabola exactly in the interior
        assert!((interp(&vals, 1.5) - 2.25).abs() < 1e-5);
        assert_eq!(interp_lin(&vals, 1.5), 2.5);
        // implicit zero outside
        assert_eq!(interp(&vals, -7.0), 0.0);
        assert_eq!(interp_lin(&vals, 99.0), 0.0);
    }

    #[test]
    fn running_minmax_match_brute_force() {
        let src: Vec<f32> = (0..97)
            .map(|i| ((i * 37 + 11) % 41) as f32 - 20.0)
            .collect();
        for filterlen in [1usize, 2, 3, 5, 8, 13] {
            let outlen = src.len() - filterlen + 1;
            let mut dst = vec![0.0f32; outlen];
            running_min(&mut dst, &src, filterlen);
            assert_eq!(dst, brute_min(&src, filterlen), "min len {}", filterlen);
            running_max(&mut dst, &src, filterlen);
            assert_eq!(dst, brute_max(&src, filterlen), "max len {}", filterlen);
        }
    }

    #[test]
    fn hann_lowpass_sizing_and_unit_gain() {
        for filterlen in [1usize, 3, 15, 63] {
            let src = vec![1.0f32; filterlen + 99];
            let mut dst = vec![0.0f32; 100];
            hann_lowpass(&mut dst, &src, filterlen);
            assert_eq!(dst.len(), src.len() - filterlen + 1);
            // kernel sums to one: a constant input passes unchanged
            for &y in dst.iter() {
                assert!((y - 1.0).abs() < 1e-5, "len {}: {}", filterlen, y);
            }
        }
    }

    #[test]
    fn hann_lowpass_matches_direct_convolution() {
        let filterlen = 21usize;
        let src: Vec<f32> = (0..200)
            .map(|i| (i as f32 * 0.37).sin() + 0.3 * (i as f32 * 1.7).cos())
            .collect();
        let mut dst = vec![0.0f32; src.len() - filterlen + 1];
        hann_lowpass(&mut dst, &src, filterlen);

        let k = 2.0 * PI / filterlen as f32;
        let kern: Vec<f32> = (0..filterlen)
            .map(|i| 1.0 + (k * (i as f32 - (filterlen / 2) as f32)).cos())
            .collect();
        let ksum: f32 = kern.iter().sum();
        for (i, &y) in dst.iter().enumerate() {
            let direct: f32 = kern.iter()
                .zip(&src[i..i + filterlen])
                .map(|(k, x)| k * x)
                .sum::<f32>() / ksum;
            assert!((y - direct).abs() < 1e-4, "at {}: {} vs {}", i, y, direct);
        }
    }

    #[test]
    fn hann_lowpass_attenuates_high_frequency() {
        let filterlen = 41usize;
        // alternating signal at the Nyquist rate
        let src: Vec<f32> = (0..300).map(|i| if i & 1 == 0 { 1.0 } else { -1.0 }).collect();
        let mut dst = vec![0.0f32; src.len() - filterlen + 1];
        hann_lowpass(&mut dst, &src, filterlen);
        for &y in dst.iter() {
            assert!(y.abs() < 0.01);
        }
    }
}
