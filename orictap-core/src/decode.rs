/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! Decoder back-ends, their chronological merger and format auto-detection.

Three waveform back-ends exist:

* [DemodDecoder][demod::DemodDecoder] - demodulation based, slow format only,
* [XenonDecoder][xenon::XenonDecoder] - peak-location and area based, fast only,
* [DualDecoder][dual::DualDecoder] - two-stage binarizer + framer, both formats,

plus the [TrivialDecoder][trivial::TrivialDecoder] reading `.tap` archives
unchanged. [TapeDecoder] runs up to two of them concurrently over the same
waveform, interleaves their output chronologically and feeds the selected
format to the [TapeParser][crate::parse::TapeParser].
*/
use std::collections::VecDeque;
use std::io;
use std::path::Path;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use orictap_audio::Sound;

use crate::fmt_time;
use crate::parse::{TapeFile, TapeParser};

pub mod demod;
pub mod dual;
mod dump;
pub mod trivial;
pub mod xenon;

use demod::DemodDecoder;
use dual::DualDecoder;
use trivial::TrivialDecoder;
use xenon::XenonDecoder;

/// A byte decoded from tape.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DecodedByte {
    /// Onset in seconds.
    pub time: f64,
    /// Set when the byte was read in the slow format.
    pub slow: bool,
    /// The data byte.
    pub byte: u8,
    /// Set when the parity bit was incorrect.
    pub parity_error: bool,
    /// Set when a start or stop bit was incorrect.
    pub sync_error: bool,
}

/// Carrier band selection for the demodulation based decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Band {
    /// Listen to the 1200 Hz band only.
    Low,
    /// Listen to the 2400 Hz band only.
    High,
    /// Mix both bands, weighted by their per-byte noise estimates.
    #[default]
    Dual,
}

/// Bit recognition method of the Xenon decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cue {
    /// Always use the underside-area reader.
    Area,
    /// Always use the wide-peak reader.
    Wide,
    /// Choose per byte based on peak-height stability.
    #[default]
    Auto,
}

/// Bit extractor selection for the dual decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Binner {
    /// The pattern-matching binarizer.
    #[default]
    Pattern,
    /// The grid binarizer.
    Grid,
    /// The revised grid binarizer.
    Super,
}

/// Fast-format byte framer selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fdec {
    /// The 28-state DP over raw bit bins.
    #[default]
    Orig,
    /// The pulse-length correlation DP.
    Plen,
    /// The 108-state pipeline DP.
    Barrel,
}

/// Settings of a decode, constructed once and immutable for its duration.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Start of the scanned interval in seconds.
    pub start: Option<f64>,
    /// End of the scanned interval in seconds.
    pub end: Option<f64>,
    /// Log a hex dump and per-event diagnostics.
    pub verbose: bool,
    /// Decode only the fast format.
    pub fast: bool,
    /// Decode only the slow format.
    pub slow: bool,
    /// Use the dual-mode two-stage decoder.
    pub dual: bool,
    /// Write intermediate waveforms named `dump-<backend>.wav`.
    pub dump: bool,
    /// Bit extractor for the dual decoder.
    pub binner: Binner,
    /// Band selection for the demodulation based decoder.
    pub band: Band,
    /// Bit recognition method of the Xenon decoder.
    pub cue: Cue,
    /// Fast-format byte framer.
    pub fdec: Fdec,
    /// Nominal physical bit frequency in Hz.
    pub f_ref: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            start: None,
            end: None,
            verbose: false,
            fast: false,
            slow: false,
            dual: false,
            dump: false,
            binner: Binner::default(),
            band: Band::default(),
            cue: Cue::default(),
            fdec: Fdec::default(),
            f_ref: crate::F_REF_HZ,
        }
    }
}

impl DecoderConfig {
    // Clip interval in sample positions of the given rate.
    pub(crate) fn clip_range(&self, sample_rate: u32, full_len: usize) -> (i64, i64) {
        let mut start_pos = 0i64;
        if let Some(start) = self.start {
            start_pos = (0.5 + start * sample_rate as f64).floor() as i64;
        }
        let mut end_pos = full_len as i64;
        if let Some(end) = self.end {
            end_pos = (0.5 + end * sample_rate as f64).floor() as i64;
        }
        end_pos = end_pos.min(full_len as i64);
        // avoid an empty interval (also keeps the dump length positive)
        end_pos = end_pos.max(start_pos + 1);
        (start_pos, end_pos)
    }
}

// One of the decoder back-ends, dispatched statically.
enum Backend {
    Trivial(TrivialDecoder),
    Demod(DemodDecoder),
    Xenon(XenonDecoder),
    Dual(Box<DualDecoder>),
}

impl Backend {
    fn decode_byte(&mut self) -> Option<DecodedByte> {
        match self {
            Backend::Trivial(dec) => dec.decode_byte(),
            Backend::Demod(dec) => dec.decode_byte(),
            Backend::Xenon(dec) => dec.decode_byte(),
            Backend::Dual(dec) => dec.decode_byte(),
        }
    }
}

/// The common front-end to the decoder back-ends.
///
/// Pulls decoded bytes from up to two back-ends, merges them in time order
/// and routes the selected format through the tape parser. Files are
/// produced by pull: [TapeDecoder::read_file] or the [TapeDecoder::files]
/// iterator.
pub struct TapeDecoder {
    backend0: Option<Backend>,
    backend1: Option<Backend>,
    peek0: Option<DecodedByte>,
    peek1: Option<DecodedByte>,
    select_fast: bool,
    select_slow: bool,
    parser: TapeParser,
    produced: VecDeque<TapeFile>,
    flushed: bool,
}

impl TapeDecoder {
    /// Opens `path` as either a **WAV** waveform or a `.tap` archive.
    ///
    /// A waveform at an integer multiple of 44.1 kHz is downsampled to the
    /// native rate first. Anything that does not parse as **WAV** is read
    /// as an archive byte stream.
    pub fn open<P: AsRef<Path>>(path: P, config: &DecoderConfig) -> io::Result<TapeDecoder> {
        match Sound::from_wav_file(&path) {
            Ok(mut sound) => {
                let rate = sound.sample_rate();
                if rate > 44100 && rate % 44100 == 0 {
                    let factor = rate / 44100;
                    info!("downsampling {} Hz input by {}", rate, factor);
                    sound = sound.downsample(factor);
                }
                Ok(TapeDecoder::from_waveform(sound, config))
            }
            Err(e) if matches!(e.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof) =>
            {
                debug!("not a WAV file ({}), reading as tape archive", e);
                let archive = TrivialDecoder::open(&path, config)?;
                Ok(TapeDecoder::from_backends(Some(Backend::Trivial(archive)), None, config))
            }
            Err(e) => Err(e),
        }
    }

    /// Creates a decoder over an in-memory waveform.
    pub fn from_waveform(src: Sound, config: &DecoderConfig) -> TapeDecoder {
        let (backend0, backend1) = if config.dual {
            // Dual format two-stage decoder. Enable just one format when
            // clearly specified, otherwise both for auto-detection.
            let decode_fast = config.fast || !config.slow;
            let decode_slow = config.slow || !config.fast;
            (Some(Backend::Dual(Box::new(
                DualDecoder::new(src, config, decode_fast, decode_slow)))), None)
        } else {
            // Fast format: the Xenon decoder. Slow format: the demodulation
            // based decoder, faster and more accurate than the dual one but
            // limited to the slow format.
            let fast = (!config.slow)
                .then(|| Backend::Xenon(XenonDecoder::new(src.clone(), config)));
            let slow = (!config.fast)
                .then(|| Backend::Demod(DemodDecoder::new(src, config)));
            (fast, slow)
        };
        TapeDecoder::from_backends(backend0, backend1, config)
    }

    /// Creates a decoder over an archive byte stream.
    pub fn from_archive<R: io::Read + 'static>(read: R, config: &DecoderConfig) -> TapeDecoder {
        let archive = TrivialDecoder::new(read, config);
        TapeDecoder::from_backends(Some(Backend::Trivial(archive)), None, config)
    }

    fn from_backends(
        mut backend0: Option<Backend>,
        mut backend1: Option<Backend>,
        config: &DecoderConfig,
    ) -> TapeDecoder {
        // Select slow or fast when clearly specified, otherwise leave both
        // unselected for the sync-driven auto-detection.
        let select_fast = config.fast && !config.slow;
        let select_slow = config.slow && !config.fast;
        // Keep one byte of look-ahead per back-end.
        let peek0 = backend0.as_mut().and_then(Backend::decode_byte);
        let peek1 = backend1.as_mut().and_then(Backend::decode_byte);
        TapeDecoder {
            backend0, backend1, peek0, peek1,
            select_fast, select_slow,
            parser: TapeParser::new(config.verbose),
            produced: VecDeque::new(),
            flushed: false,
        }
    }

    /// Retrieves one decoded byte, weaving together up to two back-ends.
    ///
    /// Bytes of the unselected format are consumed internally; a clean sync
    /// byte observed while the parser is idle switches the selection. While
    /// the parser is idle, bytes carrying errors are consumed but not
    /// returned, so a raw decode starts at real data.
    ///
    /// Returns `None` at the end of the tape.
    pub fn read_byte(&mut self) -> Option<DecodedByte> {
        while self.peek0.is_some() || self.peek1.is_some() {
            let take0 = match (&self.peek0, &self.peek1) {
                (Some(b0), Some(b1)) => b0.time <= b1.time,
                (Some(_), None) => true,
                _ => false,
            };
            let b = if take0 {
                let b = self.peek0.take().unwrap();
                self.peek0 = self.backend0.as_mut().and_then(Backend::decode_byte);
                b
            } else {
                let b = self.peek1.take().unwrap();
                self.peek1 = self.backend1.as_mut().and_then(Backend::decode_byte);
                b
            };

            let idle = self.parser.is_idle();

            // Detect sync, perform a format switch.
            if b.byte == 0x16 && !b.sync_error && !b.parity_error && idle {
                if if b.slow { !self.select_slow } else { !self.select_fast } {
                    info!("{}  Detected {} format", fmt_time(b.time),
                          if b.slow { "slow" } else { "fast" });
                }
                self.select_fast = !b.slow;
                self.select_slow = b.slow;
            }

            let selected = if b.slow { self.select_slow } else { self.select_fast };
            if selected {
                if let Some(file) = self.parser.put_byte(&b) {
                    self.produced.push_back(file);
                }
                // Do not return bytes with errors unless inside a file.
                if (!b.sync_error && !b.parity_error) || !idle {
                    return Some(b);
                }
            }
        }
        None
    }

    /// Decodes up to the next parsed file.
    ///
    /// Returns `None` when the tape holds no further file.
    pub fn read_file(&mut self) -> Option<TapeFile> {
        loop {
            if let Some(file) = self.produced.pop_front() {
                return Some(file);
            }
            if self.read_byte().is_none() {
                if !self.flushed {
                    self.flushed = true;
                    // the flush itself might still produce a file
                    if let Some(file) = self.parser.flush() {
                        return Some(file);
                    }
                }
                return self.produced.pop_front();
            }
        }
    }

    /// Returns an iterator draining all remaining files from the tape.
    pub fn files(&mut self) -> Files<'_> {
        Files { decoder: self }
    }
}

/// Iterator over the files remaining on a tape, see [TapeDecoder::files].
pub struct Files<'a> {
    decoder: &'a mut TapeDecoder,
}

impl<'a> Iterator for Files<'a> {
    type Item = TapeFile;

    fn next(&mut self) -> Option<TapeFile> {
        self.decoder.read_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_range_defaults_to_full_length() {
        let config = DecoderConfig::default();
        assert_eq!(config.clip_range(44100, 88200), (0, 88200));
    }

    #[test]
    fn clip_range_honors_interval() {
        let config = DecoderConfig {
            start: Some(1.0),
            end: Some(1.5),
            ..DecoderConfig::default()
        };
        assert_eq!(config.clip_range(44100, 882000), (44100, 66150));
        // an end past the waveform is clamped
        let config = DecoderConfig { end: Some(1e6), ..config };
        assert_eq!(config.clip_range(44100, 88200), (44100, 88200));
    }

    #[test]
    fn archive_bytes_pass_through() {
        let archive: &[u8] = &[0x16, 0x16, 0x16, 0x24, 0x00, 0x55, 0xaa, 0xff];
        let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
        let mut dec = TapeDecoder::from_archive(archive, &config);
        let mut bytes = Vec::new();
        while let Some(b) = dec.read_byte() {
            assert!(!b.sync_error && !b.parity_error);
            bytes.push(b.byte);
        }
        assert_eq!(bytes, archive);
    }

    #[test]
    fn merged_times_are_monotone() {
        let archive: Vec<u8> = (0..100u8).collect();
        let config = DecoderConfig { slow: true, ..DecoderConfig::default() };
        let mut dec = TapeDecoder::from_archive(io::Cursor::new(archive), &config);
        let mut last = f64::MIN;
        while let Some(b) = dec.read_byte() {
            assert!(b.time >= last);
            last = b.time;
        }
    }
}
