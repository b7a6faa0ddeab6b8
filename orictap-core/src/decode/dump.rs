/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
//! Diagnostic waveform dumps written by the decoder back-ends.
use orictap_audio::SoundBuffer;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

// Accumulates the diagnostic rendition of a decode and writes it to a WAV
// file when the back-end reaches the end of the tape.
pub(crate) struct DumpWriter {
    buffer: SoundBuffer,
    path: &'static str,
    written: bool,
}

impl DumpWriter {
    pub(crate) fn new(path: &'static str, len: usize, sample_rate: u32) -> DumpWriter {
        DumpWriter {
            buffer: SoundBuffer::silence(len, sample_rate),
            path,
            written: false,
        }
    }

    pub(crate) fn write(&mut self, start: i64, buf: &[f32]) {
        self.buffer.write(start, buf);
    }

    // Writes the dump file once.
    pub(crate) fn finish(&mut self) {
        if self.written {
            return;
        }
        self.written = true;
        info!("Writing dump to {}", self.path);
        if let Err(e) = self.buffer.write_to_file(self.path) {
            error!("Couldn't write {}: {}", self.path, e);
        }
    }
}
