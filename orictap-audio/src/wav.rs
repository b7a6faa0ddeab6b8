/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! **WAV** file reading and writing on top of [hound].
use std::fs::File;
use std::io::{self, BufWriter, Error, ErrorKind};
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::host::SampleSink;

// Samples are scaled to the +-1.0 range the audio devices use.
const SAMPLE_SCALE: f32 = 1.0 / 32768.0;

fn hound_err(e: hound::Error) -> Error {
    match e {
        hound::Error::IoError(e) => e,
        e => Error::new(ErrorKind::InvalidData, e.to_string()),
    }
}

/// Reads a **WAV** file into monophonic float samples.
///
/// Accepts 16-bit integer PCM only. Multi-channel content is averaged down
/// to a single channel. Returns the samples and the sample rate.
pub fn read_wav<P: AsRef<Path>>(path: P) -> io::Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path).map_err(hound_err)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::new(ErrorKind::InvalidData,
            format!("unsupported WAV sample format: {} bit {:?}",
                    spec.bits_per_sample, spec.sample_format)));
    }
    let channels = spec.channels.max(1) as usize;
    let frames = reader.duration() as usize;
    let mut samples = Vec::with_capacity(frames);
    let mut iter = reader.samples::<i16>();
    let frame_scale = SAMPLE_SCALE / channels as f32;
    for _ in 0..frames {
        let mut acc = 0.0f32;
        for _ in 0..channels {
            match iter.next() {
                Some(res) => acc += res.map_err(hound_err)? as f32,
                None => return Ok((samples, spec.sample_rate)),
            }
        }
        samples.push(acc * frame_scale);
    }
    Ok((samples, spec.sample_rate))
}

/// Writes float samples as a mono 16-bit PCM **WAV** file.
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> io::Result<()> {
    let mut sink = WavSink::create(path, sample_rate)?;
    if !sink.write(samples) {
        return Err(Error::new(ErrorKind::Other, "WAV sample write failed"));
    }
    sink.finalize()
}

/// A streaming mono 16-bit PCM **WAV** writer.
///
/// Implements [SampleSink] so the tape encoder and the recorder loop can
/// target a file the same way they target a live audio output.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    sample_rate: u32,
    written: u64,
    ok: bool,
}

impl WavSink {
    /// Creates the target file, truncating any previous content.
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> io::Result<WavSink> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(hound_err)?;
        Ok(WavSink { writer: Some(writer), sample_rate, written: 0, ok: true })
    }

    /// Finishes the file, patching up the WAV header.
    pub fn finalize(mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(hound_err)?;
        }
        if self.ok { Ok(()) } else { Err(Error::new(ErrorKind::Other, "WAV sample write failed")) }
    }
}

impl SampleSink for WavSink {
    fn write(&mut self, buf: &[f32]) -> bool {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return false,
        };
        for &y in buf {
            let y = (y.clamp(-1.0, 1.0) / SAMPLE_SCALE).round() as i32;
            let y = y.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            if let Err(e) = writer.write_sample(y) {
                log::error!("WAV write error: {}", hound_err(e));
                self.ok = false;
                return false;
            }
        }
        self.written += buf.len() as u64;
        self.ok
    }

    fn flush(&mut self, _timeout: f64) {}

    fn elapsed_time(&self) -> f64 {
        // a file sink consumes instantly
        self.written as f64 / self.sample_rate as f64
    }

    fn close(&mut self) -> bool {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::error!("WAV finalize error: {}", hound_err(e));
                self.ok = false;
            }
        }
        self.ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_roundtrip_mono() -> io::Result<()> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orictap_wav_test_{}.wav", std::process::id()));
        let samples: Vec<f32> = (0..1000)
            .map(|i| (i as f32 * 0.01).sin() * 0.6)
            .collect();
        write_wav(&path, &samples, 44100)?;
        let (read, rate) = read_wav(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(rate, 44100);
        assert_eq!(read.len(), samples.len());
        for (a, b) in read.iter().zip(samples.iter()) {
            assert!((a - b).abs() < SAMPLE_SCALE);
        }
        Ok(())
    }

    #[test]
    fn read_rejects_garbage() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orictap_tap_test_{}.tap", std::process::id()));
        std::fs::write(&path, [0x16, 0x16, 0x16, 0x24, 0x00]).unwrap();
        let res = read_wav(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(res.is_err());
    }
}
