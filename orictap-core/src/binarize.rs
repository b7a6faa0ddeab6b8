/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! Binarizers: extractors of physical bit events from a filtered signal.

Three algorithmically distinct implementations share one contract. Each
call interprets a *core* region of the waveform plus internal margins of
about 0.05 s on each side and produces a sequence of [BitEvent]s:

* coordinates are relative to the core start and may be slightly negative,
* the first returned event is always a rising edge,
* when a boundary rising edge is supplied the Viterbi is forced through it
  and every event preceding it is discarded, which lets consecutive windows
  splice without phase ambiguity.
*/
use orictap_audio::Sound;

mod grid;
mod pattern;
mod supergrid;

pub use grid::GridBinarizer;
pub use pattern::PatternBinarizer;
pub use supergrid::SuperBinarizer;

use crate::decode::Binner;

/// A physical bit onset detected by a binarizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitEvent {
    /// Sample offset relative to the core start of the producing call.
    pub pos: i32,
    /// The value transitioned to (or sustained): `true` is high.
    pub val: bool,
}

/// Margin kept on each side of the core window.
///
/// About 0.05 s, 2205 samples at 44.1 kHz; compare with a slow byte
/// which spans 1920 samples.
pub(crate) fn window_margin(sample_rate: u32) -> usize {
    (24 * sample_rate / 441) as usize
}

/// One of the three interchangeable binarizers.
///
/// A tagged variant rather than a trait object: the selection happens once
/// per decode while the `read` call sits on the hot path.
pub enum Binarizer {
    Pattern(PatternBinarizer),
    Grid(GridBinarizer),
    Super(SuperBinarizer),
}

impl Binarizer {
    /// Creates the binarizer selected by `binner`.
    ///
    /// `t_ref` is the nominal physical bit period in samples.
    pub fn new(binner: Binner, src: Sound, t_ref: f64) -> Self {
        match binner {
            Binner::Pattern => Binarizer::Pattern(PatternBinarizer::new(src, t_ref)),
            Binner::Grid => Binarizer::Grid(GridBinarizer::new(src, t_ref)),
            Binner::Super => Binarizer::Super(SuperBinarizer::new(src, t_ref)),
        }
    }

    /// Returns the sample rate of the source waveform.
    pub fn sample_rate(&self) -> u32 {
        match self {
            Binarizer::Pattern(b) => b.sample_rate(),
            Binarizer::Grid(b) => b.sample_rate(),
            Binarizer::Super(b) => b.sample_rate(),
        }
    }

    /// Returns the length of the source waveform in samples.
    pub fn len(&self) -> usize {
        match self {
            Binarizer::Pattern(b) => b.len(),
            Binarizer::Grid(b) => b.len(),
            Binarizer::Super(b) => b.len(),
        }
    }

    /// Extracts bit events from the window `[core_start, core_start + core_len)`.
    ///
    /// Events are appended to `events` with positions relative to
    /// `core_start`. `dbgbuf` (of `core_len` samples) receives a diagnostic
    /// rendition of the interpreted signal. When `given_rise_edge` is
    /// present the Viterbi is forced through a rising edge at that core
    /// offset and it becomes the first returned event.
    ///
    /// `t_clk` is the expected clock period in samples and `dt_clk` the
    /// half-range of the clock search window.
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
        match self {
            Binarizer::Pattern(b) =>
                b.read(events, core_start, core_len, dbgbuf, given_rise_edge, t_clk, dt_clk),
            Binarizer::Grid(b) =>
                b.read(events, core_start, core_len, dbgbuf, given_rise_edge, t_clk, dt_clk),
            Binarizer::Super(b) =>
                b.read(events, core_start, core_len, dbgbuf, given_rise_edge, t_clk, dt_clk),
        }
    }
}

// Drops events preceding the leftmost rising edge (or the boundary edge,
// when one was requested and found).
pub(crate) fn discard_before_rise(
    events: &mut Vec<BitEvent>,
    first: usize,
    given_rise_edge: Option<i32>,
) {
    let mut discard = 0;
    let evts = &events[first..];
    while discard < evts.len() {
        if let Some(edge) = given_rise_edge {
            if evts[discard].pos == edge {
                break;
            }
        }
        if discard > 0 && evts[discard].val && !evts[discard - 1].val {
            break;
        }
        discard += 1;
    }
    events.drain(first..first + discard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Binner;

    // A clean fast-format-like square wave: each '1' is high+low one clock,
    // each '0' is high one clock + low two clocks.
    fn square_bits(bits: &[bool], t_clk: usize) -> Vec<f32> {
        let mut samples = Vec::new();
        for &b in bits {
            for _ in 0..t_clk {
                samples.push(0.5);
            }
            let low = if b { t_clk } else { 2 * t_clk };
            for _ in 0..low {
                samples.push(-0.5);
            }
        }
        samples
    }

    fn run_binarizer(binner: Binner) -> Vec<BitEvent> {
        let t_clk = 9usize;
        let bits = [true, false, true, true, false, false, true, false, true, true,
                    true, false, false, true, false, true, true, false, true, false];
        let mut pattern = Vec::new();
        // surround with enough lead/trail level for the margins
        pattern.extend(std::iter::repeat(0.0).take(4000));
        pattern.extend(square_bits(&bits, t_clk));
        pattern.extend(std::iter::repeat(0.0).take(4000));
        let snd = Sound::new(pattern, 44100);
        let mut binarizer = Binarizer::new(binner, snd, t_clk as f64);
        let mut events = Vec::new();
        let core_len = 2000;
        let mut dbg = vec![0.0f32; core_len];
        binarizer.read(&mut events, 3500, core_len, &mut dbg, None,
                       t_clk as f64, 0.2 * t_clk as f64);
        events
    }

    #[test]
    fn pattern_binarizer_first_event_is_a_rise() {
        let events = run_binarizer(Binner::Pattern);
        assert!(!events.is_empty());
        assert!(events[0].val, "first event must be a rising edge");
    }

    #[test]
    fn grid_binarizer_produces_clock_spaced_events() {
        let events = run_binarizer(Binner::Grid);
        assert!(events.len() > 10);
        assert!(events[0].val);
        for pair in events.windows(2) {
            let dx = pair[1].pos - pair[0].pos;
            assert!(dx >= 7 && dx <= 11, "grid spacing {} out of range", dx);
        }
    }

    #[test]
    fn super_binarizer_produces_clock_spaced_events() {
        let events = run_binarizer(Binner::Super);
        assert!(events.len() > 10);
        assert!(events[0].val);
        for pair in events.windows(2) {
            let dx = pair[1].pos - pair[0].pos;
            assert!(dx >= 7 && dx <= 11, "grid spacing {} out of range", dx);
        }
    }
}
