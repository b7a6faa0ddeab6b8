/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! The demodulation based decoder back-end, slow format only.

Two demodulators run in parallel over the low and high carrier bands. A
three-macro-state Viterbi locates byte onsets in the combined signal, then
the 13 bit levels of each byte are sampled at the nominal bit centers and
thresholded, mixing the two bands by their per-byte noise estimates.
*/
use std::collections::VecDeque;

use orictap_audio::Sound;

use crate::demod::Demodulator;
use crate::filters::interp_lin;
use crate::framing::{data_bits, is_parity_ok, is_sync_ok};
use crate::SLOW_BITS_PER_BYTE;
use super::dump::DumpWriter;
use super::{Band, DecodedByte, DecoderConfig};

const FORCED_SCORE: f32 = -1e20;

/// Viterbi byte segmentation of the demodulated signal.
///
/// Only the start and stop bits are detected, the data and parity bits in
/// between are treated as don't-care:
///
/// ```text
/// +--+--------------------------+--------+
/// |0 |x  x  x  x  x  x  x  x  x |1  1  1 |
/// +--+--------------------------+--------+
/// <A>|<           D            >|<  E   >|
/// ```
///
/// A byte is 209 cycles; start and stop take 16 and 49 of them. 'A' is
/// scored as `-y`, 'E' as `y` and 'D' as `k_d * |y|`; scoring 'D' keeps the
/// optimization from squeezing in as many syncs as possible, while too
/// high a `k_d` would make it avoid syncs instead. The segment lengths
/// stretch with the clock search window. Returns start-bit onsets.
fn demod_viterbi(
    onsets: &mut Vec<i32>,
    buf: &[f32],
    given_onset: Option<i32>,
    t_clk: f64,
    dt_clk: f64,
) {
    let k_d = 0.6f32;
    let t_clk_min = t_clk - dt_clk;
    let t_clk_max = t_clk + dt_clk;

    let t_a_min = (0.5 + 16.0 * t_clk_min).floor() as usize;
    let t_a_max = (0.5 + 16.0 * t_clk_max).floor() as usize;
    let t_e_min = (0.5 + 49.0 * t_clk_min).floor() as usize;
    let t_e_max = (0.5 + 49.0 * t_clk_max).floor() as usize;
    let t_d_min = (0.5 + 209.0 * t_clk_min).floor() as usize - t_a_min - t_e_min;
    let t_d_max = (0.5 + 209.0 * t_clk_max).floor() as usize - t_a_max - t_e_max;

    let ns = t_a_max + t_d_max + t_e_max;
    let len = buf.len();
    onsets.clear();
    if len < 2 || ns < 3 {
        return;
    }

    let s_a = 0usize;
    let s_d = t_a_max;
    let s_e = t_a_max + t_d_max;

    // Score the initial state against the first signal level.
    let mut scores = vec![0.0f32; ns];
    let y = buf[0];
    for (s, score) in scores.iter_mut().enumerate() {
        *score = if s < s_d { -y } else if s < s_e { k_d * y.abs() } else { y };
    }
    if given_onset == Some(0) {
        for score in scores[1..].iter_mut() {
            *score = FORCED_SCORE;
        }
    }

    let mut pred = vec![0i16; len * 3];

    // Elasticity: shortcuts from t_min-1..t_max-1 to t_max.
    // .--.  .--.  .--.  .--.  .--.  .--.  .--.
    // |  +->|  +->|  +->|  +->|  +->|  +->|  ++>
    // '--'  '--'  '--'  '-+'  '-+'  '-+'  '--'|
    //                     '-----+-----+-------+
    //  0                 t_min-1          t_max-1
    for i in 1..len {
        let mut pred_a = s_e + t_e_max - 1;
        let mut pred_d = s_a + t_a_max - 1;
        let mut pred_e = s_d + t_d_max - 1;
        let mut score_a = scores[pred_a];
        let mut score_d = scores[pred_d];
        let mut score_e = scores[pred_e];

        for s in s_e + t_e_min - 1..s_e + t_e_max - 1 {
            if score_a < scores[s] {
                score_a = scores[s];
                pred_a = s;
            }
        }
        for s in s_a + t_a_min - 1..s_a + t_a_max - 1 {
            if score_d < scores[s] {
                score_d = scores[s];
                pred_d = s;
            }
        }
        for s in s_d + t_d_min - 1..s_d + t_d_max - 1 {
            if score_e < scores[s] {
                score_e = scores[s];
                pred_e = s;
            }
        }

        pred[i * 3] = pred_a as i16;
        pred[i * 3 + 1] = pred_d as i16;
        pred[i * 3 + 2] = pred_e as i16;

        // Level-keeping transitions roll in from states to the left.
        scores.copy_within(0..ns - 1, 1);
        scores[s_a] = score_a;
        scores[s_d] = score_d;
        scores[s_e] = score_e;

        let y = buf[i];
        for score in scores[s_a..s_d].iter_mut() {
            *score -= y;
        }
        let dm = k_d * y.abs();
        for score in scores[s_d..s_e].iter_mut() {
            *score += dm;
        }
        for score in scores[s_e..ns].iter_mut() {
            *score += y;
        }

        if given_onset == Some(i as i32) {
            for score in scores[1..].iter_mut() {
                *score = FORCED_SCORE;
            }
        }
    }

    // Backtrace from the best end state, noting start-bit onsets.
    let mut s = 0usize;
    let mut score = scores[s];
    for (s1, &y) in scores.iter().enumerate() {
        if score < y {
            score = y;
            s = s1;
        }
    }
    for i in (0..len - 1).rev() {
        s = if s == s_a { pred[(i + 1) * 3] as usize }
            else if s == s_d { pred[(i + 1) * 3 + 1] as usize }
            else if s == s_e { pred[(i + 1) * 3 + 2] as usize }
            else { s - 1 };
        if s == s_a {
            onsets.push(i as i32);
        }
    }
    onsets.reverse();
}

/// The slow-only decoder back-end based on quadrature demodulation.
pub struct DemodDecoder {
    demod0: Demodulator,
    demod1: Demodulator,
    band: Band,

    // Clip interval
    start_pos: i64,
    end_pos: i64,

    // Clock parameters
    t_ref: f64,  // nominal physical bit period
    t_clk: f64,  // center of the current search window
    dt_min: f64, // minimum search window half width
    dt_max: f64, // maximum search window half width
    dt_clk: f64, // current search window half width

    // Window and hop size
    windowlen: usize,
    hopsize: usize,
    window_offs: i64,
    fno: u64,
    buf0: Vec<f32>, // low band demodulated signal
    buf1: Vec<f32>, // high band demodulated signal
    buf: Vec<f32>,  // selected demodulated signal

    onset_buf: Vec<i32>,
    boundary_byte_onset: Option<i64>, // onset for the viterbi boundary
    last_byte_onset: Option<i64>,     // location of the last emitted byte

    bytes: VecDeque<DecodedByte>,

    dump: Option<DumpWriter>,
    dump_buf: Vec<f32>,
}

impl DemodDecoder {
    /// Creates the back-end over the given waveform.
    pub fn new(src: Sound, config: &DecoderConfig) -> DemodDecoder {
        let demod0 = Demodulator::new(src.clone(), config.f_ref, false);
        let demod1 = Demodulator::new(src, config.f_ref, true);

        let ss_sample_rate = demod0.sample_rate();
        let (start_pos, end_pos) = config.clip_range(ss_sample_rate, demod0.len());

        let t_ref = ss_sample_rate as f64 / config.f_ref as f64;
        let dt_min = 0.07 * t_ref;
        let dt_max = 0.25 * t_ref;

        // 10 nominal byte times per window, hopping by half.
        let windowlen = ((0.5 + 10.0 * SLOW_BITS_PER_BYTE as f64 * t_ref).floor() as usize) & !3;
        let hopsize = windowlen / 2;
        debug_assert!(hopsize & 1 == 0);

        // Start with the waveform start as the middle hop of the window.
        let window_offs = start_pos - start_pos.rem_euclid(hopsize as i64)
            - (windowlen / 2) as i64 + (hopsize / 2) as i64;

        let dump = config.dump.then(|| {
            let dump_len = (end_pos - start_pos) as usize;
            DumpWriter::new("dump-demod.wav", dump_len, ss_sample_rate)
        });

        DemodDecoder {
            demod0, demod1,
            band: config.band,
            start_pos, end_pos,
            t_ref, t_clk: t_ref, dt_min, dt_max, dt_clk: dt_max,
            windowlen, hopsize, window_offs, fno: 0,
            buf0: vec![0.0; windowlen],
            buf1: vec![0.0; windowlen],
            buf: vec![0.0; windowlen],
            onset_buf: Vec::new(),
            boundary_byte_onset: None,
            last_byte_onset: None,
            bytes: VecDeque::new(),
            dump,
            dump_buf: vec![0.0; windowlen],
        }
    }

    // Decodes one window; returns false when there is nothing left.
    fn decode_window(&mut self) -> bool {
        if self.window_offs >= self.end_pos {
            return false;
        }
        let first_window = self.fno == 0;
        let last_window = self.window_offs + self.hopsize as i64 >= self.end_pos;
        let windowlen = self.windowlen;

        // Move the overlapping half of the previous window left.
        let mut skip = 0usize;
        if !first_window {
            skip = windowlen - self.hopsize;
            self.buf0.copy_within(self.hopsize.., 0);
            self.buf1.copy_within(self.hopsize.., 0);
        }

        self.demod0.read(self.window_offs + skip as i64, &mut self.buf0[skip..]);
        self.demod1.read(self.window_offs + skip as i64, &mut self.buf1[skip..]);

        // Select band(s) for sync detection.
        for i in 0..windowlen {
            self.buf[i] = match self.band {
                Band::Low => self.buf0[i],
                Band::High => self.buf1[i],
                Band::Dual => self.buf0[i] + self.buf1[i],
            };
        }

        // Constrain the viterbi to pass through the boundary onset.
        let given_onset = match self.boundary_byte_onset {
            Some(onset) if !first_window
                && onset >= self.window_offs
                && onset < self.window_offs + windowlen as i64 =>
                Some((onset - self.window_offs) as i32),
            _ => None,
        };

        let mut onset_buf = core::mem::take(&mut self.onset_buf);
        demod_viterbi(&mut onset_buf, &self.buf, given_onset, self.t_clk, self.dt_clk);
        self.onset_buf = onset_buf;
        let onset_cnt = self.onset_buf.len();

        // Portion of the window to convert in this pass.
        let right_limit = if last_window { windowlen } else { (windowlen + self.hopsize) / 2 };

        let t_half_byte = (0.5 + 209.0 * self.t_ref / 2.0) as i64;
        let k_time = 1.0 / self.demod0.sample_rate() as f64;
        let mut perfect_byte_run = 0;

        debug_assert!(self.bytes.is_empty());
        for i in 0..onset_cnt.saturating_sub(1) {
            let x0 = self.onset_buf[i];
            let x1 = self.onset_buf[i + 1];
            let onset = self.window_offs + x0 as i64;

            if x0 >= right_limit as i32 {
                continue; // dealt with in the next window instead
            }
            if let Some(last) = self.last_byte_onset {
                if onset - last < t_half_byte {
                    continue; // too close to the last accepted byte
                }
            }
            if onset < self.start_pos - t_half_byte || onset > self.end_pos {
                continue; // outside the user specified scan range
            }

            // Sample the 13 bit levels in both bands at the bit centers.
            let mut levels = [[0.0f32; 13]; 2];
            for b in 0..13 {
                let x = x0 as f64 + ((16.0 / 209.0) * b as f64 + 8.0 / 209.0) * (x1 - x0) as f64;
                levels[0][b] = interp_lin(&self.buf0, x as f32);
                levels[1][b] = interp_lin(&self.buf1, x as f32);
            }

            // Normalize the levels to the 0..1 range per band.
            let mut norm_levels = [[0.0f32; 13]; 2];
            for c in 0..2 {
                let mut ymin = levels[c][0];
                let mut ymax = levels[c][0];
                for &y in levels[c].iter() {
                    ymin = ymin.min(y);
                    ymax = ymax.max(y);
                }
                for (norm, &y) in norm_levels[c].iter_mut().zip(levels[c].iter()) {
                    *norm = if ymax > ymin { (y - ymin) / (ymax - ymin) } else { 0.5 };
                }
            }

            let mut mix_levels = [0.0f32; 13];
            if self.band == Band::Dual {
                // Noise variance of each band, assuming the sync bits and
                // treating data bits as whichever value is closer.
                let mut noise = [0.0f32; 2];
                for c in 0..2 {
                    let mut e = norm_levels[c][0] * norm_levels[c][0];
                    for b in 1..10 {
                        let d = norm_levels[c][b].min(1.0 - norm_levels[c][b]);
                        e += d * d;
                    }
                    for b in 10..13 {
                        let d = 1.0 - norm_levels[c][b];
                        e += d * d;
                    }
                    noise[c] = e;
                }

                // Mix so the resulting noise variance is minimized.
                let (v0, v1) = (noise[0], noise[1]);
                let k0 = if v0 + v1 > 0.0 { v1 / (v0 + v1) } else { 0.5 };
                for b in 0..13 {
                    mix_levels[b] = k0 * norm_levels[0][b] + (1.0 - k0) * norm_levels[1][b] - 0.5;
                }
            } else {
                // Use just the user-selected band.
                let csel = if self.band == Band::Low { 0 } else { 1 };
                mix_levels.copy_from_slice(&levels[csel]);
            }

            let mut z = 0u16;
            for (b, &level) in mix_levels.iter().enumerate() {
                z |= ((level > 0.0) as u16) << b;
            }

            let byte = DecodedByte {
                time: k_time * onset as f64,
                slow: true,
                byte: data_bits(z),
                parity_error: !is_parity_ok(z),
                sync_error: !is_sync_ok(z),
            };
            self.bytes.push_back(byte);
            self.last_byte_onset = Some(onset);

            // Tune the clock search window.
            if !byte.sync_error && !byte.parity_error {
                // Perfect byte: narrow in on the measured period.
                self.t_clk = (15.0 * self.t_clk + (x1 - x0) as f64 / 209.0) / 16.0;
                self.dt_clk = (15.0 * self.dt_clk + self.dt_min) / 16.0;
                perfect_byte_run += 1;
                if perfect_byte_run >= 2 {
                    // a boundary condition for the next viterbi window
                    self.boundary_byte_onset = Some(onset);
                }
            } else {
                // Imperfect byte: widen back towards the defaults.
                self.t_clk = (15.0 * self.t_clk + self.t_ref) / 16.0;
                self.dt_clk = (15.0 * self.dt_clk + self.dt_max) / 16.0;
                perfect_byte_run = 0;
            }
        }

        if let Some(dump) = self.dump.as_mut() {
            let mut maxval = self.buf[0];
            for (d, &y) in self.dump_buf.iter_mut().zip(self.buf.iter()) {
                *d = y;
                maxval = maxval.max(y);
            }
            // a spike on every start bit onset
            for &x in self.onset_buf.iter() {
                if x >= 0 && (x as usize) < windowlen {
                    self.dump_buf[x as usize] = 1.5 * maxval;
                }
            }
            // write out the core part only
            let core = (windowlen - self.hopsize) / 2;
            dump.write(self.window_offs + core as i64 - self.start_pos,
                       &self.dump_buf[core..core + self.hopsize]);
        }

        self.window_offs += self.hopsize as i64;
        self.fno += 1;
        true
    }

    /// Produces the next byte, or `None` at the end of the tape.
    pub fn decode_byte(&mut self) -> Option<DecodedByte> {
        while self.bytes.is_empty() {
            if !self.decode_window() {
                if let Some(dump) = self.dump.as_mut() {
                    dump.finish();
                }
                return None;
            }
        }
        self.bytes.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viterbi_finds_byte_onsets_in_synthetic_signal() {
        // synthesize the demodulated shape of three slow bytes at the
        // subsampled rate: 2 samples per cycle, 209 cycles per byte
        let t_clk = 0.5f64;
        let byte_len = 105usize; // ~209 * 0.5
        let start_len = 8usize; // 16 cycles
        let stop_len = 25usize; // 49 cycles
        let mut buf = Vec::new();
        buf.extend(std::iter::repeat(1.0f32).take(30)); // leader reads high
        for _ in 0..3 {
            buf.extend(std::iter::repeat(-1.0f32).take(start_len));
            buf.extend((0..byte_len - start_len - stop_len)
                .map(|i| if (i / 4) & 1 == 0 { 1.0f32 } else { -1.0 }));
            buf.extend(std::iter::repeat(1.0f32).take(stop_len));
        }
        buf.extend(std::iter::repeat(1.0f32).take(30));

        let mut onsets = Vec::new();
        demod_viterbi(&mut onsets, &buf, None, t_clk, 0.15 * t_clk);
        // the three start bits sit at 30, 135, 240
        for expected in [30i32, 135, 240] {
            assert!(
                onsets.iter().any(|&x| (x - expected).abs() <= 4),
                "onset near {} missing from {:?}", expected, onsets);
        }
    }

    #[test]
    fn viterbi_passes_through_a_given_onset() {
        let buf = vec![0.1f32; 700];
        let mut onsets = Vec::new();
        demod_viterbi(&mut onsets, &buf, Some(303), 0.5, 0.1);
        assert!(onsets.contains(&303), "forced onset missing from {:?}", onsets);
    }
}
