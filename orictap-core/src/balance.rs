/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! The balancer: a nonlinear high-pass filter removing signal offset.

```text
          .-----------------------------.
          |  .---.                      |
Input     +->|min|--.                 + v
signal  --+  '---'  |  .---.  .----. -.---.
          |          =>|avg|->| LP |->| + |-->  balanced output
          |  .---.  |  '---'  '----'  '---'
          '->|max|--'
             '---'
```

The running min/max midline tracks slow tape-level drift; subtracting its
low-passed version re-centers the signal around zero. Half the smoothed
max-min difference doubles as an instantaneous amplitude estimate.
*/
use orictap_audio::Sound;

use crate::filters::{hann_lowpass, running_max, running_min};

/// The balancing filter over a shared-read waveform.
///
/// Exposes a [Sound]-like read interface; the window-sized scratch buffers
/// are owned by the instance and grown lazily.
pub struct Balancer {
    src: Sound,
    mm_filterlen: usize, // length of the min/max filters
    lp_filterlen: usize, // length of the midline smoothing filter
    ibuf: Vec<f32>,
    m0buf: Vec<f32>,
    m1buf: Vec<f32>,
}

impl Balancer {
    /// Creates a balancer with the given odd filter lengths.
    pub fn new(src: Sound, mm_filterlen: usize, lp_filterlen: usize) -> Self {
        assert!(mm_filterlen & 1 == 1);
        assert!(lp_filterlen & 1 == 1);
        Balancer {
            src, mm_filterlen, lp_filterlen,
            ibuf: Vec::new(), m0buf: Vec::new(), m1buf: Vec::new(),
        }
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

    /// Reads the balanced signal starting at the sample offset `start`.
    pub fn read(&mut self, start: i64, buf: &mut [f32]) {
        self.balance(start, buf, None)
    }

    /// Reads the balanced signal and the amplitude estimate.
    pub fn read_with_amplitude(&mut self, start: i64, buf: &mut [f32], abuf: &mut [f32]) {
        self.balance(start, buf, Some(abuf))
    }

    fn balance(&mut self, start: i64, buf: &mut [f32], abuf: Option<&mut [f32]>) {
        let len = buf.len();
        let mm_margin = self.mm_filterlen >> 1;
        let lp_margin = self.lp_filterlen >> 1;
        let mbuf_len = len + 2 * lp_margin;
        let ibuf_len = mbuf_len + 2 * mm_margin;

        self.ibuf.resize(ibuf_len, 0.0);
        self.m0buf.resize(mbuf_len, 0.0);
        self.m1buf.resize(mbuf_len, 0.0);

        self.src.read_into(start - (mm_margin + lp_margin) as i64, &mut self.ibuf);

        running_min(&mut self.m0buf, &self.ibuf, self.mm_filterlen);
        running_max(&mut self.m1buf, &self.ibuf, self.mm_filterlen);

        // Midline between the extremes, and their half difference as an
        // amplitude estimate.
        for (m0, m1) in self.m0buf.iter_mut().zip(self.m1buf.iter_mut()) {
            let lo = *m0;
            let hi = *m1;
            *m0 = 0.5 * (lo + hi);
            *m1 = 0.5 * (hi - lo);
        }

        // Smooth the midline, then subtract it from the input.
        hann_lowpass(buf, &self.m0buf, self.lp_filterlen);
        let interior = &self.ibuf[mm_margin + lp_margin..mm_margin + lp_margin + len];
        for (y, &x) in buf.iter_mut().zip(interior.iter()) {
            *y = x - *y;
        }

        if let Some(abuf) = abuf {
            hann_lowpass(abuf, &self.m1buf, self.lp_filterlen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_constant_offset() {
        // square wave riding on a large DC offset
        let samples: Vec<f32> = (0..8000)
            .map(|i| 0.4 + if (i / 9) & 1 == 0 { 0.25 } else { -0.25 })
            .collect();
        let snd = Sound::new(samples, 44100);
        let mut balancer = Balancer::new(snd, 41, 111);
        let mut buf = vec![0.0f32; 4000];
        let mut abuf = vec![0.0f32; 4000];
        balancer.read_with_amplitude(2000, &mut buf, &mut abuf);
        let mean: f32 = buf.iter().sum::<f32>() / buf.len() as f32;
        assert!(mean.abs() < 0.01, "residual offset {}", mean);
        // amplitude estimate is near the true half swing
        let amp: f32 = abuf.iter().sum::<f32>() / abuf.len() as f32;
        assert!((amp - 0.25).abs() < 0.05, "amplitude {}", amp);
    }

    #[test]
    fn tracks_slow_drift() {
        // same square wave with a slow ramp underneath
        let samples: Vec<f32> = (0..16000)
            .map(|i| i as f32 * 4e-5 + if (i / 9) & 1 == 0 { 0.25 } else { -0.25 })
            .collect();
        let snd = Sound::new(samples, 44100);
        let mut balancer = Balancer::new(snd, 41, 111);
        let mut buf = vec![0.0f32; 6000];
        balancer.read(5000, &mut buf);
        let mean: f32 = buf.iter().sum::<f32>() / buf.len() as f32;
        assert!(mean.abs() < 0.01, "residual drift {}", mean);
    }
}
