/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! Audio playback and capture implemented with [cpal](https://crates.io/crates/cpal).

The playback and capture FIFOs are drained and filled by the **cpal** audio
thread; every inquiry method ([SoundPlayer::elapsed_time],
[SoundRecorder::elapsed_time]) is safe to call from any thread. Cancellation
is cooperative: a stop flag checked by the pipeline ends the transfer while
all samples buffered so far are retained.
*/
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use cpal::{
    Sample, SampleFormat, Stream,
    BuildStreamError, DefaultStreamConfigError, PlayStreamError,
    traits::{DeviceTrait, HostTrait, StreamTrait}
};

use crate::sound::SoundBuffer;

/// A list specifying categories of [AudioError] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioErrorKind {
    /// The audio subsystem host or a suitable device is not available.
    AudioSubsystem,
    /// An audio stream could not be created or started.
    AudioStream,
    /// The desired audio parameters cannot be satisfied.
    InvalidArguments,
}

/// A common error type returned by the audio device methods in this module.
#[derive(Debug, Clone)]
pub struct AudioError {
    description: String,
    kind: AudioErrorKind,
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description.fmt(f)
    }
}

impl Error for AudioError {}

impl AudioError {
    /// Returns the corresponding category for this error.
    pub fn kind(&self) -> AudioErrorKind {
        self.kind
    }
}

impl From<(String, AudioErrorKind)> for AudioError {
    fn from((description, kind): (String, AudioErrorKind)) -> Self {
        AudioError { description, kind }
    }
}

impl From<DefaultStreamConfigError> for AudioError {
    fn from(e: DefaultStreamConfigError) -> Self {
        (e.to_string(), AudioErrorKind::AudioSubsystem).into()
    }
}

impl From<BuildStreamError> for AudioError {
    fn from(e: BuildStreamError) -> Self {
        (e.to_string(), AudioErrorKind::AudioStream).into()
    }
}

impl From<PlayStreamError> for AudioError {
    fn from(e: PlayStreamError) -> Self {
        (e.to_string(), AudioErrorKind::AudioStream).into()
    }
}

/// A consumer of monophonic float samples.
///
/// Unites the offline and live sample destinations: the tape encoder and the
/// recording loop write to a [SampleSink] without knowing whether it is a
/// WAV file, an audio output device or an in-memory buffer.
pub trait SampleSink {
    /// Consumes a buffer of samples. Returns `false` when the sink failed.
    fn write(&mut self, buf: &[f32]) -> bool;
    /// Waits up to `timeout` seconds for queued samples to drain.
    /// A zero timeout returns immediately.
    fn flush(&mut self, timeout: f64);
    /// Returns how many seconds of audio the sink has consumed so far.
    fn elapsed_time(&self) -> f64;
    /// Finishes the sink. Returns `false` when any write failed.
    fn close(&mut self) -> bool;
}

impl SampleSink for SoundBuffer {
    fn write(&mut self, buf: &[f32]) -> bool {
        self.append(buf);
        true
    }

    fn flush(&mut self, _timeout: f64) {}

    fn elapsed_time(&self) -> f64 {
        self.len() as f64 / self.sample_rate() as f64
    }

    fn close(&mut self) -> bool {
        true
    }
}

#[derive(Default)]
struct PlayerShared {
    queue: Mutex<VecDeque<f32>>,
    queued: AtomicU64,
    played: AtomicU64,
    stopping: AtomicBool,
}

/// Audio playback to the default output device.
///
/// Samples written via [SampleSink::write] are queued in a FIFO drained by
/// the audio callback; writes never block. Use [SampleSink::flush] to wait
/// for the queue to drain, polling from 10 ms up to 1 s intervals.
pub struct SoundPlayer {
    _stream: Stream,
    shared: Arc<PlayerShared>,
    sample_rate: u32,
    ok: bool,
}

fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        shared: Arc<PlayerShared>,
    ) -> Result<Stream, BuildStreamError>
    where T: cpal::SizedSample + cpal::FromSample<f32>
{
    let channels = config.channels as usize;
    device.build_output_stream(config, move |data: &mut [T], _| {
        let mut queue = shared.queue.lock().unwrap();
        let mut consumed = 0u64;
        for frame in data.chunks_mut(channels) {
            let y = match queue.pop_front() {
                Some(y) => { consumed += 1; T::from_sample(y) }
                None => T::EQUILIBRIUM,
            };
            for sample in frame.iter_mut() {
                *sample = y;
            }
        }
        drop(queue);
        shared.played.fetch_add(consumed, Ordering::AcqRel);
    }, |e| error!("audio output error: {}", e), None)
}

impl SoundPlayer {
    /// Opens the default output device for playback at the given rate.
    pub fn open(sample_rate: u32) -> Result<SoundPlayer, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device()
            .ok_or_else(|| ("no default audio output device".to_string(),
                            AudioErrorKind::AudioSubsystem))?;
        let default_config = device.default_output_config()?;
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let shared = Arc::new(PlayerShared::default());
        let stream = match default_config.sample_format() {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, shared.clone()),
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, shared.clone()),
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, shared.clone()),
            sf => return Err((format!("unsupported sample format: {:?}", sf),
                              AudioErrorKind::InvalidArguments).into()),
        }?;
        stream.play()?;
        Ok(SoundPlayer { _stream: stream, shared, sample_rate, ok: true })
    }

    /// Returns `true` while queued samples remain to be played.
    pub fn is_playing(&self) -> bool {
        let shared = &self.shared;
        !shared.stopping.load(Ordering::Acquire) &&
            shared.played.load(Ordering::Acquire) < shared.queued.load(Ordering::Acquire)
    }

    /// Stops playback, discarding queued audio.
    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
    }
}

impl SampleSink for SoundPlayer {
    fn write(&mut self, buf: &[f32]) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            return false;
        }
        self.shared.queue.lock().unwrap().extend(buf.iter().copied());
        self.shared.queued.fetch_add(buf.len() as u64, Ordering::AcqRel);
        self.ok
    }

    fn flush(&mut self, timeout: f64) {
        if timeout <= 0.0 {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs_f64(timeout.min(1e9));
        let mut interval = Duration::from_millis(10);
        while self.is_playing() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let wait = interval.min(deadline - now);
            std::thread::sleep(wait);
            // back off towards 1 s polls on long waits
            interval = (interval * 2).min(Duration::from_secs(1));
        }
    }

    fn elapsed_time(&self) -> f64 {
        self.shared.played.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn close(&mut self) -> bool {
        self.flush(1e9);
        self.ok
    }
}

#[derive(Default)]
struct RecorderShared {
    queue: Mutex<VecDeque<f32>>,
    captured: AtomicU64,
    stopped: AtomicBool,
}

/// Audio capture from the default input device.
///
/// The audio callback pushes monophonic samples (multi-channel input is
/// averaged) into a FIFO; [SoundRecorder::read] blocks at quarter-chunk poll
/// intervals until enough samples arrive or the stream is stopped. Samples
/// captured before the stop signal are retained.
pub struct SoundRecorder {
    stream: Option<Stream>,
    shared: Arc<RecorderShared>,
    sample_rate: u32,
    chunk_len: usize,
}

fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        shared: Arc<RecorderShared>,
    ) -> Result<Stream, BuildStreamError>
    where T: cpal::SizedSample, f32: cpal::FromSample<T>
{
    let channels = config.channels.max(1) as usize;
    let scale = 1.0 / channels as f32;
    device.build_input_stream(config, move |data: &[T], _| {
        if shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut queue = shared.queue.lock().unwrap();
        let mut captured = 0u64;
        for frame in data.chunks(channels) {
            let y: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
            queue.push_back(y * scale);
            captured += 1;
        }
        drop(queue);
        shared.captured.fetch_add(captured, Ordering::AcqRel);
    }, |e| error!("audio input error: {}", e), None)
}

impl SoundRecorder {
    /// Opens the default input device for capture at the given rate.
    ///
    /// `chunk_len` sets the granularity [SoundRecorder::read] polls with.
    pub fn open(sample_rate: u32, chunk_len: usize) -> Result<SoundRecorder, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device()
            .ok_or_else(|| ("no default audio input device".to_string(),
                            AudioErrorKind::AudioSubsystem))?;
        let default_config = device.default_input_config()?;
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let shared = Arc::new(RecorderShared::default());
        let stream = match default_config.sample_format() {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, shared.clone()),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, shared.clone()),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, shared.clone()),
            sf => return Err((format!("unsupported sample format: {:?}", sf),
                              AudioErrorKind::InvalidArguments).into()),
        }?;
        Ok(SoundRecorder { stream: Some(stream), shared, sample_rate, chunk_len })
    }

    /// Starts capturing.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.as_ref() {
            stream.play()?;
        }
        Ok(())
    }

    /// Stops capturing. Samples already buffered remain readable.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.stream = None;
    }

    /// Returns `true` until [SoundRecorder::stop] is called.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Returns the capture duration in seconds. Callable from any thread.
    pub fn elapsed_time(&self) -> f64 {
        self.shared.captured.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    /// Fills `buf` with captured samples, blocking until enough are
    /// available or the stream has been stopped.
    ///
    /// Returns `false` when the stream has stopped and no samples remain;
    /// a final partial chunk is zero-padded.
    pub fn read(&mut self, buf: &mut [f32]) -> bool {
        let poll = Duration::from_secs_f64(
            self.chunk_len.max(1) as f64 / (4.0 * self.sample_rate as f64));
        let mut filled = 0;
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                while filled < buf.len() {
                    match queue.pop_front() {
                        Some(y) => { buf[filled] = y; filled += 1; }
                        None => break,
                    }
                }
            }
            if filled == buf.len() {
                return true;
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                buf[filled..].fill(0.0);
                return filled > 0;
            }
            std::thread::sleep(poll);
        }
    }
}
