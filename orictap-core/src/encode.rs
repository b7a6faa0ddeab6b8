/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! The tape encoder: byte stream to Oric tape waveform.

Each physical bit switches the output level through a raised-cosine ramp
at the 4800 Hz cycle rate. The slow format spends 16 half-cycles per bit
(1200 Hz for '0', 2400 Hz for '1'), the fast format two or three. Samples
are produced on demand into a [SampleSink], which may be a WAV file, an
audio output device or an in-memory buffer; the caller polls the sink for
playback progress.
*/
use std::io::{self, Read};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use orictap_audio::SampleSink;

/// Sample rate of the produced waveform in Hz.
pub const ENCODER_RATE: u32 = 44100;

const ENCODER_BUFSIZE: usize = 1024;
const RAMP_LEN: usize = 441; // samples in the ramp template
const RAMP_STEP: usize = 48; // step for the 4800 Hz switching rate

// 60% of the available amplitude range is used.
const AMPLITUDE: f32 = 0.6;

/// Encodes bytes as an Oric tape signal into a [SampleSink].
pub struct TapeEncoder<S: SampleSink> {
    sink: S,
    slow: bool,
    ok: bool,
    put_phys_bits: u64,
    buf: Vec<f32>,
    ramp: [f32; RAMP_LEN],
    ramp_phase: usize, // 0..RAMP_LEN-1
    last_y: f32,
    last_bit: bool,
}

impl<S: SampleSink> TapeEncoder<S> {
    /// Creates an encoder emitting the slow or fast format into `sink`.
    pub fn new(sink: S, slow: bool) -> TapeEncoder<S> {
        // the ramp template runs from 0.0 to 1.0
        let mut ramp = [0.0f32; RAMP_LEN];
        let k = core::f32::consts::PI / RAMP_LEN as f32;
        for (i, r) in ramp.iter_mut().enumerate() {
            *r = 0.5 - 0.5 * (k * i as f32).cos();
        }
        TapeEncoder {
            sink,
            slow,
            ok: true,
            put_phys_bits: 0,
            buf: Vec::with_capacity(ENCODER_BUFSIZE),
            ramp,
            ramp_phase: 0,
            last_y: 0.0,
            last_bit: false,
        }
    }

    fn emit_flush(&mut self) {
        if !self.buf.is_empty() && self.ok {
            self.ok = self.sink.write(&self.buf);
        }
        self.buf.clear();
    }

    fn emit_sample(&mut self, y: f32) {
        self.buf.push(y);
        if self.buf.len() == ENCODER_BUFSIZE {
            self.emit_flush();
        }
    }

    // Switches to the value via a cosine ramp of one cycle time.
    fn ramp_to(&mut self, y: f32) {
        let y0 = self.last_y;
        while self.ramp_phase < RAMP_LEN {
            let yy = y0 + self.ramp[self.ramp_phase] * (y - y0);
            self.emit_sample(yy);
            self.ramp_phase += RAMP_STEP;
        }
        self.ramp_phase -= RAMP_LEN;
        self.last_y = y;
    }

    fn emit_bit(&mut self, val: bool) {
        self.ramp_to(if val { AMPLITUDE } else { -AMPLITUDE });
        self.last_bit = val;
        self.put_phys_bits += 1;
    }

    fn encode_bit(&mut self, val: bool) {
        let polarity = self.last_bit;
        if self.slow {
            for i in 0..16u32 {
                // '1' is 2400 Hz, '0' is 1200 Hz
                let y = if val { i & 1 == 0 } else { i & 2 == 0 };
                self.emit_bit(y ^ polarity);
            }
        } else {
            self.emit_bit(!polarity);
            self.emit_bit(polarity);
            if !val {
                self.emit_bit(polarity);
            }
        }
    }

    /// Encodes one byte: start bit, 8 data bits LSB first, odd parity,
    /// three stop bits and the extra half cycle.
    pub fn put_byte(&mut self, byte: u8) {
        self.encode_bit(false); // start bit
        let mut parity = true;
        for i in 0..8 {
            let bit = byte >> i & 1 == 1;
            self.encode_bit(bit);
            parity ^= bit;
        }
        self.encode_bit(parity); // odd parity
        self.encode_bit(true); // stop bits
        self.encode_bit(true);
        self.encode_bit(true);
        let bit = !self.last_bit;
        self.emit_bit(bit); // extra cycle
    }

    /// Encodes a tape archive byte stream.
    ///
    /// A standard preamble (three or more `0x16` then `0x24`) is prolonged
    /// to about two thirds of a second so the decoders can settle on it; a
    /// nonstandard preamble is passed through with a warning.
    pub fn put_archive<R: Read>(&mut self, mut read: R) -> io::Result<()> {
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes)?;

        let mut pos = 0usize;
        let mut n = 0usize;
        while pos < bytes.len() && bytes[pos] == 0x16 {
            n += 1;
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == 0x24 && n >= 3 {
            // Prolong the sync: three lone 0x16 bytes would fool even our
            // own decoders.
            let nn = if self.slow { 15 } else { 99 };
            for _ in 0..n.max(nn) {
                self.put_byte(0x16);
            }
            // the 0x24 goes out with the remainder below
        } else {
            warn!("Tape archive not introduced by standard sync");
            pos = 0;
        }

        for &byte in &bytes[pos..] {
            self.put_byte(byte);
        }
        Ok(())
    }

    /// Returns the total signal duration queued so far, in seconds.
    pub fn duration(&self) -> f64 {
        if self.put_phys_bits == 0 {
            return 0.0; // no ramp-out in this case
        }
        // one cycle is RAMP_LEN / RAMP_STEP samples, i.e. 1/4800 s
        let cycle_time = RAMP_LEN as f64 / RAMP_STEP as f64 / ENCODER_RATE as f64;
        cycle_time * (self.put_phys_bits + 1) as f64 // one extra for the end ramp
    }

    /// Returns how many seconds have reached the sink's consumer.
    pub fn elapsed_time(&self) -> f64 {
        let t = self.sink.elapsed_time();
        let t1 = self.duration();
        // land exactly on the duration in spite of rounding
        let tol = 10.0 / ENCODER_RATE as f64;
        if t > t1 - tol { t1 } else { t }
    }

    /// Returns how many seconds are still to be consumed.
    pub fn time_left(&self) -> f64 {
        self.duration() - self.elapsed_time()
    }

    /// Waits up to `timeout` seconds for the sink to drain.
    pub fn flush(&mut self, timeout: f64) {
        self.emit_flush();
        self.sink.flush(timeout);
    }

    /// Ramps the signal out and closes the sink.
    ///
    /// Returns `false` when any sample write failed.
    pub fn finish(&mut self) -> bool {
        if self.put_phys_bits != 0 {
            self.ramp_to(0.0);
        }
        self.emit_flush();
        self.ok &= self.sink.close();
        self.ok
    }

    /// Gives the sink back, without closing it.
    pub fn into_inner(mut self) -> S {
        self.emit_flush();
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orictap_audio::SoundBuffer;

    fn encode(bytes: &[u8], slow: bool) -> (TapeEncoder<SoundBuffer>, usize) {
        let mut enc = TapeEncoder::new(SoundBuffer::new(ENCODER_RATE), slow);
        for &b in bytes {
            enc.put_byte(b);
        }
        let bits = enc.put_phys_bits as usize;
        (enc, bits)
    }

    #[test]
    fn slow_byte_spans_209_cycles() {
        let (_, bits) = encode(&[0x00], true);
        assert_eq!(bits, 209);
        let (_, bits) = encode(&[0xff], true);
        assert_eq!(bits, 209);
    }

    #[test]
    fn fast_byte_length_depends_on_zero_bits() {
        // shortest: 0xff has 1 start zero and an all-ones rest
        let (_, bits) = encode(&[0xff], false);
        assert_eq!(bits, 28);
        // longest: 0x00 has 9 zero bits (8 data + parity)
        let (_, bits) = encode(&[0x00], false);
        assert_eq!(bits, 36);
        // the sync byte
        let (_, bits) = encode(&[0x16], false);
        assert_eq!(bits, 34);
    }

    #[test]
    fn duration_matches_sample_count() {
        let (mut enc, _) = encode(&[0x16, 0x16, 0x16, 0x24, 0x55], false);
        let duration = enc.duration();
        assert!(enc.finish());
        let snd = enc.into_inner().into_sound();
        let produced = snd.len() as f64 / ENCODER_RATE as f64;
        assert!((produced - duration).abs() < 0.01,
                "{} produced vs {} declared", produced, duration);
    }

    #[test]
    fn signal_stays_within_amplitude() {
        let (mut enc, _) = encode(&[0xa5, 0x0f], true);
        enc.finish();
        let snd = enc.into_inner().into_sound();
        assert!(!snd.is_empty());
        for &y in snd.samples() {
            assert!(y.abs() <= AMPLITUDE + 1e-5);
        }
    }

    #[test]
    fn archive_preamble_is_prolonged() {
        let archive = [0x16u8, 0x16, 0x16, 0x24, 0x00];
        let mut enc = TapeEncoder::new(SoundBuffer::new(ENCODER_RATE), false);
        enc.put_archive(&archive[..]).unwrap();
        // 99 sync bytes of 34 cycles each, plus 0x24 and 0x00
        assert_eq!(enc.put_phys_bits, 99 * 34 + 34 + 36);
    }

    #[test]
    fn nonstandard_archive_passes_through() {
        let archive = [0x16u8, 0x16, 0x24, 0x01]; // only two sync bytes
        let mut enc = TapeEncoder::new(SoundBuffer::new(ENCODER_RATE), false);
        enc.put_archive(&archive[..]).unwrap();
        let per_16 = 34;
        let per_24 = 34;
        let per_01 = 36;
        assert_eq!(enc.put_phys_bits, 2 * per_16 + per_24 + per_01);
    }
}
