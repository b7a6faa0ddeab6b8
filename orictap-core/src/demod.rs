/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! Quadrature demodulator for tapes with faded high-frequency content.

```text
   .----.  .----.                    .-----------------------------.
.->|*cos|->| LP |--.                 |  .---.                      |
|  '----'  '----'  |  .---.  .----.  +->|min|--.                 - v
+                   =>|abs|->|down|--+  '---'  |  .---.  .----. +.---.
|  .----.  .----.  |  '---'  '----'  |          =>|avg|->| LP |->| + |-->
'->|*sin|->| LP |--'                 |  .---.  |  '---'  '----'  '---'
   '----'  '----'                    '->|max|--'
                                        '---'
|<---------- demodulation --------->|<----------- balancing ---------->|
```

The carrier is 1200 Hz for the low band (the nominal '1' pattern) or
2400 Hz for the high band (the nominal '0' pattern). The magnitude is
down-sampled to half the nominal bit rate, then thresholded so that zero
crossings of the output correspond to bit phase with '1' positive.
*/
use core::f64::consts::PI;

use orictap_audio::Sound;

use crate::filters::{hann_lowpass, interp, running_max, running_min};

/// Demodulates one carrier band of a shared-read waveform.
///
/// Exposes a [Sound]-like read interface at the subsampled rate of
/// `f_ref / 2` (nominally 2400 Hz).
pub struct Demodulator {
    src: Sound,
    use_high_band: bool,
    ss_rate: u32,
    ss_len: usize,
    t_carrier: usize, // carrier period in input samples
    t_lowpass: usize,
    dm_ckern: Vec<f32>,
    dm_skern: Vec<f32>,
    dm_cbuf: Vec<f32>,
    dm_sbuf: Vec<f32>,
    dm_obuf0: Vec<f32>,
    dm_obuf1: Vec<f32>,
    dsin_buf: Vec<f32>,
    mm_filterlen: usize,
    th_filterlen: usize,
    mm_ibuf: Vec<f32>,
    mm_m0buf: Vec<f32>,
    mm_m1buf: Vec<f32>,
}

impl Demodulator {
    /// Creates a demodulator for the low (1200 Hz) or high (2400 Hz) band.
    ///
    /// `f_ref_hz` is the nominal physical symbol rate.
    pub fn new(src: Sound, f_ref_hz: u32, use_high_band: bool) -> Self {
        let carrier_hz = f_ref_hz / if use_high_band { 2 } else { 4 };
        let ss_rate = f_ref_hz / 2;
        let src_rate = src.sample_rate();

        // Length of the entire tape in subsampled resolution
        let ss_len = (0.5 + src.len() as f64 * ss_rate as f64 / src_rate as f64)
            .floor() as usize;

        // Carrier period in input samples
        let t_carrier = ((src_rate + carrier_hz / 2) / carrier_hz) as usize;

        // Low-pass kernel sized to 16 cycles of the reference clock
        let t_lowpass = (16 * src_rate / f_ref_hz | 1) as usize;

        let k = 2.0 * PI / t_carrier as f64;
        let mut dm_ckern = Vec::with_capacity(t_carrier);
        let mut dm_skern = Vec::with_capacity(t_carrier);
        for i in 0..t_carrier {
            let phi = k * i as f64;
            dm_ckern.push(phi.cos() as f32);
            dm_skern.push(phi.sin() as f32);
        }

        // Min/max window of 256 subsampled reference periods; threshold
        // smoothing three times that. One byte is 209/4 carrier periods.
        let mm_filterlen = (256 * ss_rate / f_ref_hz | 1) as usize;
        let th_filterlen = 3 * mm_filterlen | 1;

        Demodulator {
            src, use_high_band, ss_rate, ss_len, t_carrier, t_lowpass,
            dm_ckern, dm_skern,
            dm_cbuf: Vec::new(), dm_sbuf: Vec::new(),
            dm_obuf0: Vec::new(), dm_obuf1: Vec::new(),
            dsin_buf: Vec::new(),
            mm_filterlen, th_filterlen,
            mm_ibuf: Vec::new(), mm_m0buf: Vec::new(), mm_m1buf: Vec::new(),
        }
    }

    /// Returns the subsampled output rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.ss_rate
    }

    /// Returns the output length in subsampled samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.ss_len
    }

    /// Returns `true` if the output is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ss_len == 0
    }

    // Demodulated magnitude at the full input resolution.
    fn read_demod_fullres(&mut self, start: i64, len: usize) {
        let filter_margin = self.t_lowpass / 2;
        let ibuf_len = len + 2 * filter_margin;

        self.dm_cbuf.resize(ibuf_len, 0.0);
        self.dm_sbuf.resize(ibuf_len, 0.0);
        self.dm_obuf0.resize(len, 0.0);
        self.dm_obuf1.resize(len, 0.0);

        self.src.read_into(start - filter_margin as i64, &mut self.dm_cbuf);

        // Cosine and sine multiplied versions
        for i in 0..ibuf_len {
            let j = i % self.t_carrier;
            let x = self.dm_cbuf[i];
            self.dm_sbuf[i] = x * self.dm_skern[j];
            self.dm_cbuf[i] = x * self.dm_ckern[j];
        }

        hann_lowpass(&mut self.dm_obuf0, &self.dm_cbuf, self.t_lowpass);
        hann_lowpass(&mut self.dm_obuf1, &self.dm_sbuf, self.t_lowpass);

        for (c, s) in self.dm_obuf0.iter_mut().zip(self.dm_obuf1.iter()) {
            *c = (*c * *c + s * s).sqrt();
        }
    }

    // Demodulated magnitude at the subsampled rate.
    fn read_demod(&mut self, start: i64, buf: &mut [f32]) {
        let src_rate = self.src.sample_rate();
        let k_subsamp = src_rate as f64 / self.ss_rate as f64;

        let interp_filter_margin = 3i64;
        let t0 = (k_subsamp * start as f64).floor() as i64 - interp_filter_margin;
        let t1 = (k_subsamp * (start + buf.len() as i64 - 1) as f64).ceil() as i64
            + interp_filter_margin;
        let dsin_len = (t1 + 1 - t0) as usize;

        self.read_demod_fullres(t0, dsin_len);
        core::mem::swap(&mut self.dsin_buf, &mut self.dm_obuf0);

        for (i, y) in buf.iter_mut().enumerate() {
            let x = k_subsamp * (start + i as i64) as f64 - t0 as f64;
            *y = interp(&self.dsin_buf, x as f32);
        }
    }

    /// Reads the balanced, demodulated signal at the subsampled rate.
    ///
    /// Output sign is arranged so that '1' bits are positive regardless
    /// of the selected band.
    pub fn read(&mut self, start: i64, buf: &mut [f32]) {
        let len = buf.len();
        let mm_margin = self.mm_filterlen / 2;
        let th_margin = self.th_filterlen / 2;
        let mbuf_len = len + 2 * th_margin;
        let ibuf_len = mbuf_len + 2 * mm_margin;

        self.mm_ibuf.resize(ibuf_len, 0.0);
        self.mm_m0buf.resize(mbuf_len, 0.0);
        self.mm_m1buf.resize(mbuf_len, 0.0);

        let mut ibuf = core::mem::take(&mut self.mm_ibuf);
        self.read_demod(start - (mm_margin + th_margin) as i64, &mut ibuf);
        self.mm_ibuf = ibuf;

        running_min(&mut self.mm_m0buf, &self.mm_ibuf, self.mm_filterlen);
        running_max(&mut self.mm_m1buf, &self.mm_ibuf, self.mm_filterlen);

        // Threshold level blending 65% min and 35% max. Compared to 50-50
        // averaging this keeps decoding through dips in signal strength,
        // even when the magnitude falls below half.
        for (m0, &m1) in self.mm_m0buf.iter_mut().zip(self.mm_m1buf.iter()) {
            *m0 = 0.65 * *m0 + 0.35 * m1;
        }

        hann_lowpass(buf, &self.mm_m0buf, self.th_filterlen);

        let interior = &self.mm_ibuf[mm_margin + th_margin..mm_margin + th_margin + len];
        if self.use_high_band {
            // The magnitude indicates a '1': subtract the threshold.
            for (y, &x) in buf.iter_mut().zip(interior.iter()) {
                *y = x - *y;
            }
        } else {
            // The magnitude indicates a '0': subtract and negate, putting
            // '1' in the positive direction.
            for (y, &x) in buf.iter_mut().zip(interior.iter()) {
                *y -= x;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 16 half-cycles of the bit carrier, like the slow-format encoder emits
    fn slow_bit(samples: &mut Vec<f32>, rate: u32, val: bool) {
        let f_bit = 4800.0;
        let half_cycles = 16;
        let seg = rate as f32 / f_bit; // samples per switching slot at 4800 Hz
        for i in 0..(half_cycles as f32 * seg) as usize {
            let phase = (i as f32 / seg) as usize;
            let y = if val {
                // '1' toggles every slot: 2400 Hz
                if phase & 1 == 0 { 0.6 } else { -0.6 }
            } else {
                // '0' toggles every other slot: 1200 Hz
                if (phase / 2) & 1 == 0 { 0.6 } else { -0.6 }
            };
            samples.push(y);
        }
    }

    #[test]
    fn low_band_separates_ones_from_zeros() {
        let rate = 44100;
        let mut samples = Vec::new();
        // long runs so the balancing window sees both symbols
        for _ in 0..100 {
            slow_bit(&mut samples, rate, true);
        }
        for _ in 0..100 {
            slow_bit(&mut samples, rate, false);
        }
        for _ in 0..100 {
            slow_bit(&mut samples, rate, true);
        }
        let snd = Sound::new(samples, rate);
        let mut demod = Demodulator::new(snd, 4800, false);
        assert_eq!(demod.sample_rate(), 2400);

        // one bit is 16 half-cycles at 4800 Hz = 8 output samples
        let mut buf = vec![0.0f32; 300 * 8];
        demod.read(0, &mut buf);

        // sample the middle of each run of a hundred bits
        let mid_one: f32 = buf[40 * 8..60 * 8].iter().sum::<f32>() / (20.0 * 8.0);
        let mid_zero: f32 = buf[140 * 8..160 * 8].iter().sum::<f32>() / (20.0 * 8.0);
        assert!(mid_one > 0.0, "ones should be positive: {}", mid_one);
        assert!(mid_zero < 0.0, "zeros should be negative: {}", mid_zero);
    }

    #[test]
    fn high_band_has_matching_polarity() {
        let rate = 44100;
        let mut samples = Vec::new();
        for _ in 0..100 {
            slow_bit(&mut samples, rate, false);
        }
        for _ in 0..100 {
            slow_bit(&mut samples, rate, true);
        }
        for _ in 0..100 {
            slow_bit(&mut samples, rate, false);
        }
        let snd = Sound::new(samples, rate);
        let mut demod = Demodulator::new(snd, 4800, true);
        let mut buf = vec![0.0f32; 300 * 8];
        demod.read(0, &mut buf);
        let mid_zero: f32 = buf[40 * 8..60 * 8].iter().sum::<f32>() / (20.0 * 8.0);
        let mid_one: f32 = buf[140 * 8..160 * 8].iter().sum::<f32>() / (20.0 * 8.0);
        assert!(mid_one > 0.0, "ones should be positive: {}", mid_one);
        assert!(mid_zero < 0.0, "zeros should be negative: {}", mid_zero);
    }
}
