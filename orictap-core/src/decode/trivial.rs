/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! The trivial decoder: a byte-rate-paced `.tap` archive read.
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::{FAST_BITS_PER_BYTE, SLOW_BITS_PER_BYTE};
use super::{DecodedByte, DecoderConfig};

/// Extracts the byte stream of a `.tap` archive unchanged.
///
/// Timestamps are synthesized at the nominal byte pace of the configured
/// format so the downstream merger and parser remain oblivious of the
/// source. No sync or parity errors are ever produced.
pub struct TrivialDecoder {
    read: Box<dyn Read>,
    slow: bool,
    start: Option<f64>,
    end: Option<f64>,
    dt: f64,
    time: f64,
    eof: bool,
}

impl TrivialDecoder {
    /// Creates a decoder over an archive byte stream.
    pub fn new<R: Read + 'static>(read: R, config: &DecoderConfig) -> TrivialDecoder {
        let slow = config.slow;
        let bits = if slow { SLOW_BITS_PER_BYTE } else { FAST_BITS_PER_BYTE };
        TrivialDecoder {
            read: Box::new(read),
            slow,
            start: config.start,
            end: config.end,
            dt: bits as f64 / config.f_ref as f64,
            time: 0.0,
            eof: false,
        }
    }

    /// Opens an archive file.
    pub fn open<P: AsRef<Path>>(path: P, config: &DecoderConfig) -> io::Result<TrivialDecoder> {
        let file = File::open(path)?;
        Ok(TrivialDecoder::new(BufReader::new(file), config))
    }

    /// Produces the next byte, or `None` at the end of the archive.
    pub fn decode_byte(&mut self) -> Option<DecodedByte> {
        if self.eof {
            return None;
        }
        let mut byte = 0u8;
        loop {
            match self.read.read(core::slice::from_mut(&mut byte)) {
                Ok(0) => {
                    self.eof = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("tape archive read error: {}", e);
                    self.eof = true;
                    return None;
                }
            }
            let time = self.time;
            self.time += self.dt;

            // Discard bytes outside the user specified time interval.
            if let Some(start) = self.start {
                if time < start {
                    continue;
                }
            }
            if let Some(end) = self.end {
                if time >= end {
                    self.eof = true;
                    return None;
                }
            }
            return Some(DecodedByte {
                time,
                slow: self.slow,
                byte,
                parity_error: false,
                sync_error: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paces_bytes_at_the_nominal_rate() {
        let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
        let mut dec = TrivialDecoder::new(&[1u8, 2, 3][..], &config);
        let b0 = dec.decode_byte().unwrap();
        let b1 = dec.decode_byte().unwrap();
        assert_eq!(b0.byte, 1);
        assert_eq!(b1.byte, 2);
        assert!((b1.time - b0.time - 32.0 / 4800.0).abs() < 1e-12);
        assert!(!b0.slow);
        assert!(dec.decode_byte().is_some());
        assert!(dec.decode_byte().is_none());
    }

    #[test]
    fn respects_the_clip_interval() {
        let dt = 209.0 / 4800.0;
        let config = DecoderConfig {
            slow: true,
            start: Some(1.5 * dt),
            end: Some(3.5 * dt),
            ..DecoderConfig::default()
        };
        let mut dec = TrivialDecoder::new(&[0u8, 1, 2, 3, 4, 5][..], &config);
        let bytes: Vec<u8> = core::iter::from_fn(|| dec.decode_byte()).map(|b| b.byte).collect();
        assert_eq!(bytes, [2, 3]);
    }
}
