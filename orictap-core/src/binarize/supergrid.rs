/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! The revised grid binarizer with sub-sample grid inertia.
use orictap_audio::Sound;

use crate::filters::{hann_lowpass, interp_lin, Lowpass};
use super::{discard_before_rise, window_margin, BitEvent};

const INVALID_GRID_SCORE: f32 = -1e20;
const BOUNDARY_GRID_SCORE: f32 = 1e10;

// Upscale factor for the Viterbi propagation. Higher values are slower but
// allow higher grid inertia.
const SCALE: usize = 4;

/// A binarizer tracking the clock grid on a `SCALE`-upsampled lattice.
///
/// The signal is band-passed (long Hann minus short Hann), its magnitude
/// re-balanced into an edge detection function, and a Viterbi with one
/// state per stride length walks the upsampled grid, allowing the stride
/// to drift by one sub-sample step per grid point. This keeps the jitter
/// of the plain grid binarizer out of the extracted bit clock.
pub struct SuperBinarizer {
    long_filter: Lowpass,
    short_filter: Lowpass,
    long_buf: Vec<f32>,
    band_buf: Vec<f32>,
    mag_buf: Vec<f32>,
    edf_buf: Vec<f32>,
    grid_scores: Vec<f32>,
    grid_pred_ss: Vec<u8>,
}

impl SuperBinarizer {
    /// Creates a super binarizer over the given waveform.
    ///
    /// `t_ref` is the nominal physical bit period in samples.
    pub fn new(src: Sound, t_ref: f64) -> Self {
        let long_filterlen = ((12.0 * t_ref).floor() as usize) | 1;
        let short_filterlen = ((2.0 * t_ref).floor() as usize) | 1;
        SuperBinarizer {
            long_filter: Lowpass::new(src.clone(), long_filterlen),
            short_filter: Lowpass::new(src, short_filterlen),
            long_buf: Vec::new(),
            band_buf: Vec::new(),
            mag_buf: Vec::new(),
            edf_buf: Vec::new(),
            grid_scores: Vec::new(),
            grid_pred_ss: Vec::new(),
        }
    }

    /// Returns the sample rate of the source waveform.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.long_filter.sample_rate()
    }

    /// Returns the length of the source waveform in samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.long_filter.len()
    }

    /// See [Binarizer::read][super::Binarizer::read].
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &mut self,
        events: &mut Vec<BitEvent>,
        core_start: i64,
        core_len: usize,
        dbgbuf: &mut [f32],
        given_rise_edge: Option<i32>,
        t_clk: f64,
        dt_clk: f64,
    ) {
        let margin = window_margin(self.sample_rate());
        let bufsize = margin + core_len + margin;

        let given_rise_edge = given_rise_edge.map(|x| x + margin as i32);

        self.long_buf.resize(bufsize, 0.0);
        self.band_buf.resize(bufsize, 0.0);
        self.mag_buf.resize(bufsize, 0.0);
        self.edf_buf.resize(bufsize, 0.0);

        // Band pass: long minus short Hann.
        let mut long_buf = core::mem::take(&mut self.long_buf);
        let mut band_buf = core::mem::take(&mut self.band_buf);
        self.long_filter.read(core_start - margin as i64, &mut long_buf);
        self.short_filter.read(core_start - margin as i64, &mut band_buf);
        for (band, &long) in band_buf.iter_mut().zip(long_buf.iter()) {
            *band -= long;
        }
        self.long_buf = long_buf;
        self.band_buf = band_buf;

        dbgbuf[..core_len].copy_from_slice(&self.band_buf[margin..margin + core_len]);

        // Magnitude of the band-passed signal.
        for (mag, &band) in self.mag_buf.iter_mut().zip(self.band_buf.iter()) {
            *mag = band.abs();
        }

        // Re-balance the magnitude with a twice-long filter, rejecting
        // period 4, to form the edge detection function.
        let mid_filterlen = ((4.0 * self.sample_rate() as f64 / 4800.0).floor() as usize) | 1;
        let mid_margin = mid_filterlen / 2;
        hann_lowpass(&mut self.edf_buf[mid_margin..bufsize - mid_margin],
                     &self.mag_buf, mid_filterlen);
        for edf in self.edf_buf[..mid_margin].iter_mut() {
            *edf = 0.0;
        }
        for i in mid_margin..bufsize - mid_margin {
            self.edf_buf[i] = self.mag_buf[i] - self.edf_buf[i];
        }
        for edf in self.edf_buf[bufsize - mid_margin..].iter_mut() {
            *edf = 0.0;
        }

        // Forward propagation on the upsampled lattice. Each state
        // represents an incoming stride of (di_min + s) / SCALE samples.
        let di_min = SCALE * (0.5 + t_clk - dt_clk).floor() as usize;
        let di_max = SCALE * (0.5 + t_clk + dt_clk).floor() as usize;
        let ns = di_max - di_min + 1;
        debug_assert!(ns < 256); // states index as u8

        let ni = SCALE * bufsize;
        self.grid_scores.clear();
        self.grid_pred_ss.clear();
        for i in 0..ni {
            let score = if i >= di_max { INVALID_GRID_SCORE }
                else if given_rise_edge.is_some() { -BOUNDARY_GRID_SCORE }
                else { 0.0 };
            for _ in 0..ns {
                self.grid_scores.push(score);
                self.grid_pred_ss.push((ns / 2) as u8);
            }
        }

        let kscale = 1.0 / SCALE as f32;
        let boundary_i = given_rise_edge.map(|x| SCALE as i32 * x);
        for i in 0..ni {
            let mut score = interp_lin(&self.edf_buf, kscale * i as f32);
            if boundary_i == Some(i as i32) {
                score += BOUNDARY_GRID_SCORE;
            }
            for s in 0..ns {
                self.grid_scores[i * ns + s] += score;
            }

            for s0 in 0..ns {
                let lo = if s0 == 0 { 0 } else { s0 - 1 };
                let hi = (s0 + 1).min(ns - 1);
                for s1 in lo..=hi {
                    let i1 = i + di_min + s1;
                    if i1 < ni {
                        let a0 = i * ns + s0;
                        let a1 = i1 * ns + s1;
                        if self.grid_scores[a1] < self.grid_scores[a0] {
                            self.grid_scores[a1] = self.grid_scores[a0];
                            self.grid_pred_ss[a1] = s0 as u8;
                        }
                    }
                }
            }
        }

        // Find the best end state within the last stride.
        let mut best_i = ni - 1;
        let mut best_s = 0usize;
        let mut best_r = self.grid_scores[best_i * ns + best_s];
        for i in ni - di_max..ni {
            for s in 0..ns {
                if best_r < self.grid_scores[i * ns + s] {
                    best_r = self.grid_scores[i * ns + s];
                    best_i = i;
                    best_s = s;
                }
            }
        }

        // Backtrace and set grid points.
        let first = events.len();
        let lower = boundary_i.unwrap_or(0).max(0);
        let mut i = best_i as i32;
        let mut s = best_s;
        let mut found_given_edge = false;
        while i >= lower {
            let x = i as usize / SCALE;
            debug_assert!(x < bufsize);
            events.push(BitEvent { pos: x as i32, val: false });
            if boundary_i == Some(i) {
                found_given_edge = true;
            }
            let sp = self.grid_pred_ss[i as usize * ns + s] as usize;
            i -= (di_min + s) as i32;
            s = sp;
        }
        if let Some(edge) = given_rise_edge {
            debug_assert!(edge >= bufsize as i32 || found_given_edge);
        }
        events[first..].reverse();

        // Discriminate bits from the band-passed signal at the grid points.
        for evt in events[first..].iter_mut() {
            let x = evt.pos;
            evt.val = x >= 0 && (x as usize) < bufsize && self.band_buf[x as usize] > 0.0;
        }

        // Pulse lengths are not constrained here, so anything before the
        // leftmost rise edge (or the boundary edge) is unreliable.
        discard_before_rise(events, first, given_rise_edge);

        for evt in events[first..].iter_mut() {
            evt.pos -= margin as i32;
        }
    }
}
