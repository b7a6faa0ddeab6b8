/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! The dual decoder: a two-stage back-end for both tape formats.

Works in two steps per window:

* binarization, format neutral, by the configured [Binarizer],
* bit-to-byte framing, with the slow and fast framers running in parallel
  over the same bit events when both formats are enabled.

The bit-event stream carries a boundary rising edge re-emitted from the
previous window so the binarizer Viterbi splices without phase ambiguity;
the byte framers are anchored at the last perfectly framed byte.
*/
use std::collections::VecDeque;

use orictap_audio::Sound;

use crate::binarize::{Binarizer, BitEvent};
use crate::framing::{
    data_bits, decode_fast_bytes, decode_slow_bytes, is_parity_ok, is_sync_ok, ByteEvent,
};
use crate::{FAST_BITS_PER_BYTE, SLOW_BITS_PER_BYTE};
use super::dump::DumpWriter;
use super::{DecodedByte, DecoderConfig, Fdec};

// Per-format byte framing state.
struct ByteFramer {
    enabled: bool,
    events: Vec<ByteEvent>,
    times: Vec<f64>,
    boundary_x: i64, // bit index anchoring the framer, negative when unknown
    last_x: Option<i64>, // sample location of the last emitted byte
    emit: std::ops::Range<usize>,
}

impl Default for ByteFramer {
    fn default() -> Self {
        ByteFramer {
            enabled: false,
            events: Vec::new(),
            times: Vec::new(),
            boundary_x: -1,
            last_x: None,
            emit: 0..0,
        }
    }
}

/// The two-stage decoder back-end capable of both formats.
pub struct DualDecoder {
    binarizer: Binarizer,
    fdec: Fdec,
    sample_rate: u32,

    // Clip interval
    start_pos: i64,
    end_pos: i64,

    // Clock parameters
    t_ref: f64,
    t_clk: f64,
    dt_min: f64,
    dt_max: f64,
    dt_clk: f64,

    // Window and hop size
    windowlen: usize,
    hopsize: usize,
    window_offs: i64,

    bit_evts: Vec<BitEvent>,

    framers: [ByteFramer; 2], // [0] = fast, [1] = slow

    emitted: VecDeque<DecodedByte>,

    dump: Option<DumpWriter>,
    dump_buf: Vec<f32>,
}

impl DualDecoder {
    /// Creates the back-end over the given waveform.
    ///
    /// At least one of `enable_fast` / `enable_slow` should be set; with
    /// both, the two framers run in parallel for format auto-detection.
    pub fn new(
        src: Sound,
        config: &DecoderConfig,
        enable_fast: bool,
        enable_slow: bool,
    ) -> DualDecoder {
        let sample_rate = src.sample_rate();
        let (start_pos, end_pos) = config.clip_range(sample_rate, src.len());

        let t_ref = sample_rate as f64 / config.f_ref as f64;
        // The search half width can be at most 20%, as 2*1.2 = 3.8 is just
        // short of a 3-period looking like a 2-period.
        let dt_max = 0.20 * t_ref;
        let dt_min = 0.07 * t_ref;

        let binarizer = Binarizer::new(config.binner, src, t_ref);

        // 10 nominal byte times per window, hopping by half.
        let windowlen = ((0.5 + 10.0 * SLOW_BITS_PER_BYTE as f64 * t_ref).floor() as usize) & !3;
        let hopsize = windowlen / 2;
        debug_assert!(hopsize & 1 == 0);

        // Start with the waveform start as the middle hop of the window.
        let window_offs = start_pos - start_pos.rem_euclid(hopsize as i64)
            - (windowlen / 2) as i64 + (hopsize / 2) as i64;

        let dump = config.dump.then(|| {
            let dump_len = (end_pos - start_pos) as usize;
            DumpWriter::new("dump-dual.wav", dump_len, sample_rate)
        });

        let mut framers: [ByteFramer; 2] = Default::default();
        framers[0].enabled = enable_fast;
        framers[1].enabled = enable_slow;

        DualDecoder {
            binarizer,
            fdec: config.fdec,
            sample_rate,
            start_pos, end_pos,
            t_ref, t_clk: t_ref, dt_min, dt_max, dt_clk: dt_max,
            windowlen, hopsize, window_offs,
            bit_evts: Vec::new(),
            framers,
            emitted: VecDeque::new(),
            dump,
            dump_buf: vec![0.0; windowlen],
        }
    }

    // Frames bytes out of the binarized bit window and queues the range
    // that falls into this window's responsibility.
    fn decode_byte_window(&mut self, last_window: bool) {
        let mut detected_t_clk = self.t_ref;
        let mut detected_dt_clk = self.dt_max;

        let bin_vals: Vec<bool> = self.bit_evts.iter().map(|e| e.val).collect();

        for slow in 0..2 {
            let framer = &mut self.framers[slow];
            if !framer.enabled {
                continue; // only run the asked-for format
            }

            let right_limit = if last_window { self.windowlen }
                else { (self.windowlen + self.hopsize) / 2 };
            let k_time = 1.0 / self.sample_rate as f64;

            let boundary = usize::try_from(framer.boundary_x).ok();
            framer.events = if slow == 1 {
                decode_slow_bytes(&bin_vals, boundary)
            } else {
                decode_fast_bytes(self.fdec, &bin_vals, boundary)
            };

            let nominal_bins_per_byte =
                if slow == 1 { SLOW_BITS_PER_BYTE } else { FAST_BITS_PER_BYTE };
            let t_half_byte = (0.5 + nominal_bins_per_byte as f64 * self.t_ref / 2.0) as i64;
            let mut healthy_byte_cnt = 0usize;
            let mut healthy_bit_cnt = 0usize;
            let mut healthy_samples = 0.0f64;

            framer.times.clear();
            framer.times.resize(framer.events.len(), 0.0);
            framer.emit = 0..0;

            for i in 0..framer.events.len() {
                let bix = framer.events[i].bit_index;
                debug_assert!(bix < self.bit_evts.len());
                // global sample offset of the byte onset
                let x = self.window_offs + self.bit_evts[bix].pos as i64;
                framer.times[i] = k_time * x as f64;

                if x >= self.window_offs + right_limit as i64 {
                    continue; // dealt with in the next window instead
                }
                if let Some(last) = framer.last_x {
                    if x - last < t_half_byte {
                        continue; // too close to the last accepted byte
                    }
                }
                if x < self.start_pos - t_half_byte || x > self.end_pos {
                    continue; // outside the user specified scan range
                }

                let z = framer.events[i].code;

                if framer.emit.end == 0 {
                    framer.emit.start = i;
                }
                framer.emit.end = i + 1;
                framer.last_x = Some(x);

                if is_parity_ok(z) && is_sync_ok(z) && i + 1 < framer.events.len() {
                    framer.boundary_x = bix as i64;

                    let bix1 = framer.events[i + 1].bit_index;
                    healthy_byte_cnt += 1;
                    if slow == 1 {
                        healthy_bit_cnt += 209;
                    } else {
                        healthy_bit_cnt += 27;
                        for b in 0..13 {
                            healthy_bit_cnt += (z >> b & 1 == 0) as usize;
                        }
                    }
                    healthy_samples +=
                        (self.bit_evts[bix1].pos - self.bit_evts[bix].pos) as f64;
                }
            }

            let emit_cnt = framer.emit.len();
            let health = if emit_cnt == 0 { 0.0 }
                else { healthy_byte_cnt as f64 / emit_cnt as f64 };
            if health > 0.95 {
                detected_t_clk = healthy_samples / healthy_bit_cnt as f64;
                detected_dt_clk = self.dt_min;
            }
        }

        // Narrow or widen the clock search window with exponential decay,
        // approximating the per-byte 15/16 tuning of the demodulation
        // decoder over a 5-byte window.
        self.t_clk = 0.75 * self.t_clk + 0.25 * detected_t_clk;
        self.dt_clk = 0.75 * self.dt_clk + 0.25 * detected_dt_clk;
    }

    // Rebases the framer anchors after bit events were dropped on the left.
    fn advance_byte_window(&mut self, advance_bits: usize) {
        for framer in self.framers.iter_mut() {
            // anchors going negative are simply forgotten
            framer.boundary_x -= advance_bits as i64;
        }
    }

    fn decode_window(&mut self) -> bool {
        if self.window_offs >= self.end_pos {
            return false;
        }
        let last_window = self.window_offs + self.hopsize as i64 >= self.end_pos;

        // Boundary condition, and viterbi skipping, based on old events.
        let mut given_rise_edge: Option<i32> = None;
        if let Some(last) = self.bit_evts.pop() {
            // Skip the portion that was already binarized; the binarizer
            // outputs the boundary rise edge again.
            given_rise_edge = Some(last.pos);
        }

        // By default the core starts a quarter into the legacy window; a
        // reasonable boundary condition replaces that.
        let mut core_start = self.window_offs + ((self.windowlen - self.hopsize) / 2) as i64;
        if let Some(edge) = given_rise_edge {
            if edge >= 0 && (edge as i64) < (self.windowlen / 2) as i64 {
                core_start = self.window_offs + edge as i64;
            }
        }
        let core_end = self.window_offs + ((self.windowlen + self.hopsize) / 2) as i64;
        let core_len = (core_end - core_start) as usize;
        let old_cnt = self.bit_evts.len();

        let core_skip = (core_start - self.window_offs) as i32;
        let given_rise_edge = given_rise_edge
            .map(|edge| edge - core_skip)
            .filter(|&edge| edge >= 0);

        // Run the binarizer; the first new event is a rise event.
        let mut bit_evts = core::mem::take(&mut self.bit_evts);
        let mut dump_buf = core::mem::take(&mut self.dump_buf);
        self.binarizer.read(
            &mut bit_evts,
            core_start,
            core_len,
            &mut dump_buf[core_skip as usize..core_skip as usize + core_len],
            given_rise_edge,
            self.t_clk,
            self.dt_clk,
        );
        self.dump_buf = dump_buf;
        // adjust for the skipped part of the window
        for evt in bit_evts[old_cnt..].iter_mut() {
            evt.pos += core_skip;
        }
        self.bit_evts = bit_evts;

        self.decode_byte_window(last_window);

        // Queue the bytes of whichever framers ran, merged chronologically.
        {
            let (fast, slow) = self.framers.split_at_mut(1);
            let fast = &mut fast[0];
            let slow = &mut slow[0];
            loop {
                let have_fast = !fast.emit.is_empty();
                let have_slow = !slow.emit.is_empty();
                let pick_slow = match (have_fast, have_slow) {
                    (false, false) => break,
                    (false, true) => true,
                    (true, false) => false,
                    (true, true) => slow.times[slow.emit.start] < fast.times[fast.emit.start],
                };
                let framer = if pick_slow { &mut *slow } else { &mut *fast };
                let i = framer.emit.start;
                framer.emit.start += 1;
                let z = framer.events[i].code;
                self.emitted.push_back(DecodedByte {
                    time: framer.times[i],
                    slow: pick_slow,
                    byte: data_bits(z),
                    parity_error: !is_parity_ok(z),
                    sync_error: !is_sync_ok(z),
                });
            }
        }

        // Save the diagnostic rendition: spikes on the bit onsets.
        if let Some(dump) = self.dump.as_mut() {
            for evt in self.bit_evts.iter() {
                let x = evt.pos;
                if x >= 0 && (x as usize) < self.windowlen {
                    self.dump_buf[x as usize] = if evt.val { 0.8 } else { -0.8 };
                }
            }
            dump.write(core_start - self.start_pos,
                       &self.dump_buf[core_skip as usize..core_skip as usize + core_len]);
        }

        let right_limit = if last_window { self.windowlen }
            else { (self.windowlen + self.hopsize) / 2 };
        let right_limit = right_limit as i32;
        while self.bit_evts.last().map_or(false, |evt| evt.pos > right_limit) {
            self.bit_evts.pop();
        }

        // Discard events that will be to the left of the next window.
        let mut delete_left = 0usize;
        while delete_left < self.bit_evts.len() && self.bit_evts[delete_left].pos < 0 {
            delete_left += 1;
        }

        // Discard bit events to the right of the window core, they will be
        // analyzed more reliably in the next window. The last kept event
        // must however be a rise edge.
        let mut delete_right = 0usize;
        for i in (delete_left..self.bit_evts.len()).rev() {
            if i > 0 && !self.bit_evts[i - 1].val && self.bit_evts[i].val {
                // a rise edge at i
                if self.bit_evts[i].pos >= right_limit {
                    delete_right = self.bit_evts.len() - 1 - i;
                }
            }
        }

        let keep_cnt = self.bit_evts.len().saturating_sub(delete_left + delete_right);
        self.bit_evts.truncate(delete_left + keep_cnt);
        self.bit_evts.drain(..delete_left);

        // Change the frame of reference to the next window.
        for evt in self.bit_evts.iter_mut() {
            evt.pos -= self.hopsize as i32;
        }
        self.advance_byte_window(delete_left);

        self.window_offs += self.hopsize as i64;
        true
    }

    /// Produces the next byte, or `None` at the end of the tape.
    ///
    /// When both formats are enabled the output is a chronological mixture
    /// of slow and fast byte events.
    pub fn decode_byte(&mut self) -> Option<DecodedByte> {
        while self.emitted.is_empty() {
            if !self.decode_window() {
                if let Some(dump) = self.dump.as_mut() {
                    dump.finish();
                }
                return None;
            }
        }
        self.emitted.pop_front()
    }
}
