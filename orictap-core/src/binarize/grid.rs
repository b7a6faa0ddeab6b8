/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! The grid binarizer: edge detection plus clock-grid extraction.
use orictap_audio::Sound;

use crate::filters::{interp, interp_lin, Lowpass};
use super::{discard_before_rise, window_margin, BitEvent};

const INVALID_GRID_SCORE: f32 = -1e20;
const BOUNDARY_GRID_SCORE: f32 = 1e10;

/// A binarizer that peak-picks a one-clock-spaced grid over an edge
/// detection function, then discriminates bit polarity at the grid points.
pub struct GridBinarizer {
    lowpass: Lowpass,
    lpbuf: Vec<f32>,
    edfbuf: Vec<f32>,
    edfbuf2: Vec<f32>,
    grid_scores: Vec<f32>,
    grid_pred: Vec<i32>,
}

impl GridBinarizer {
    /// Creates a grid binarizer over the given waveform.
    ///
    /// `t_ref` is the nominal physical bit period in samples.
    pub fn new(src: Sound, t_ref: f64) -> Self {
        let lp_filterlen = ((2.0 * t_ref).floor() as usize) | 1;
        GridBinarizer {
            lowpass: Lowpass::new(src, lp_filterlen),
            lpbuf: Vec::new(),
            edfbuf: Vec::new(),
            edfbuf2: Vec::new(),
            grid_scores: Vec::new(),
            grid_pred: Vec::new(),
        }
    }

    /// Returns the sample rate of the source waveform.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.lowpass.sample_rate()
    }

    /// Returns the length of the source waveform in samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.lowpass.len()
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

        self.lpbuf.resize(bufsize, 0.0);
        self.edfbuf.resize(bufsize, 0.0);
        self.edfbuf2.resize(bufsize, 0.0);

        let mut lpbuf = core::mem::take(&mut self.lpbuf);
        self.lowpass.read(core_start - margin as i64, &mut lpbuf);
        self.lpbuf = lpbuf;

        dbgbuf[..core_len].copy_from_slice(&self.lpbuf[margin..margin + core_len]);

        let given_rise_edge = given_rise_edge.map(|x| x + margin as i32);

        let t_clk_min = (0.5 + t_clk - dt_clk).floor() as i32;
        let t_clk_max = (0.5 + t_clk + dt_clk).floor() as i32;
        let t_clk_typ = (0.5 + t_clk).floor() as i32;
        let t_clk = t_clk as f32;

        // Pass 1: the edge detection function, the Euclidean norm of five
        // 4-tap wave packet correlators sampled half a clock apart.
        for i in 0..bufsize {
            let y0 = interp_lin(&self.lpbuf, i as f32 - 1.5 * t_clk);
            let y1 = interp_lin(&self.lpbuf, i as f32 - 0.5 * t_clk);
            let y2 = interp_lin(&self.lpbuf, i as f32 + 0.5 * t_clk);
            let y3 = interp_lin(&self.lpbuf, i as f32 + 1.5 * t_clk);

            let c0010 = -0.25 * y0 - 0.25 * y1 + 0.75 * y2 - 0.25 * y3;
            let c0011 = -0.5 * y0 - 0.5 * y1 + 0.5 * y2 + 0.5 * y3;
            let c0100 = -0.25 * y0 + 0.75 * y1 - 0.25 * y2 - 0.25 * y3;
            let c0101 = -0.5 * y0 + 0.5 * y1 - 0.5 * y2 + 0.5 * y3;
            let c0110 = -0.5 * y0 + 0.5 * y1 + 0.5 * y2 - 0.5 * y3;

            self.edfbuf[i] = (c0010 * c0010 + c0011 * c0011 + c0100 * c0100
                + c0101 * c0101 + c0110 * c0110).sqrt();
        }

        // Subtract the two half-period neighbors to get a zero-average
        // signal. The peak picking maximization needs this, it cannot work
        // on regions of constant sign.
        for i in 0..bufsize {
            self.edfbuf2[i] = self.edfbuf[i]
                - 0.5 * interp_lin(&self.edfbuf, i as f32 - 0.5 * t_clk)
                - 0.5 * interp_lin(&self.edfbuf, i as f32 + 0.5 * t_clk);
        }
        self.edfbuf.copy_from_slice(&self.edfbuf2);

        // Periodic averaging with the expected clock.
        for i in 0..bufsize {
            self.edfbuf2[i] = (
                0.5 * interp_lin(&self.edfbuf, i as f32 - 3.0 * t_clk)
                + interp_lin(&self.edfbuf, i as f32 - 2.0 * t_clk)
                + interp_lin(&self.edfbuf, i as f32 - t_clk)
                + self.edfbuf[i]
                + interp_lin(&self.edfbuf, i as f32 + t_clk)
                + interp_lin(&self.edfbuf, i as f32 + 2.0 * t_clk)
                + 0.5 * interp_lin(&self.edfbuf, i as f32 + 3.0 * t_clk)
            ) / 6.0;
        }
        self.edfbuf.copy_from_slice(&self.edfbuf2);

        // Pass 2: grid extraction.
        self.grid_scores.clear();
        self.grid_pred.clear();
        for i in 0..bufsize as i32 {
            self.grid_scores.push(
                if i >= t_clk_max { INVALID_GRID_SCORE }
                else if given_rise_edge.is_some() { -BOUNDARY_GRID_SCORE }
                else { 0.0 });
            self.grid_pred.push(i - t_clk_typ);
        }

        // Forward propagation
        for i in 0..bufsize {
            self.grid_scores[i] += self.edfbuf[i];
            if given_rise_edge == Some(i as i32) {
                self.grid_scores[i] += BOUNDARY_GRID_SCORE;
            }
            let score = self.grid_scores[i];
            let lo = i + t_clk_min as usize;
            let hi = (i + t_clk_max as usize).min(bufsize - 1);
            for i1 in lo..=hi {
                if self.grid_scores[i1] < score {
                    self.grid_scores[i1] = score;
                    self.grid_pred[i1] = i as i32;
                }
            }
        }

        // Find the best end state among the last clock period.
        let mut best_x = bufsize as i32 - 1;
        let mut best_r = self.grid_scores[best_x as usize];
        for x in bufsize - t_clk_max as usize..bufsize {
            if best_r < self.grid_scores[x] {
                best_r = self.grid_scores[x];
                best_x = x as i32;
            }
        }

        // Backtrace the grid points (in backwards order).
        let first = events.len();
        let lower = given_rise_edge.unwrap_or(0).max(0);
        let mut x = best_x;
        let mut found_given_edge = false;
        while x >= lower {
            events.push(BitEvent { pos: x, val: false });
            if given_rise_edge == Some(x) {
                found_given_edge = true;
            }
            x = self.grid_pred[x as usize];
        }
        if let Some(edge) = given_rise_edge {
            debug_assert!(edge >= bufsize as i32 || found_given_edge);
        }
        events[first..].reverse();

        // Pass 3: discriminate bits. Each bit is interpreted on its own
        // from the low-passed signal around the grid points.
        let evt_cnt = events.len() - first;
        for i in 0..evt_cnt {
            let evts = &events[first..];
            let x1 = evts[i].pos as f32;
            let x0 = if i > 0 { evts[i - 1].pos as f32 } else { x1 - t_clk };
            let x2 = if i + 1 < evt_cnt { evts[i + 1].pos as f32 } else { x1 + t_clk };
            let x3 = if i + 2 < evt_cnt { evts[i + 2].pos as f32 } else { x2 + t_clk };

            let y0 = interp(&self.lpbuf, (x0 + x1) / 2.0);
            let y1 = interp(&self.lpbuf, (x1 + x2) / 2.0);
            let y2 = interp(&self.lpbuf, (x2 + x3) / 2.0);

            events[first + i].val = 2.0 * y1 > y0 + y2;
        }

        // Pulse lengths are not constrained here, so anything before the
        // leftmost rise edge (or the boundary edge) is unreliable.
        discard_before_rise(events, first, given_rise_edge);

        for evt in events[first..].iter_mut() {
            evt.pos -= margin as i32;
        }
    }
}
