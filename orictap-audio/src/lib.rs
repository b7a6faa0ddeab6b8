/*
    orictap-audio: waveform container and audio I/O for the orictap tape tools.
    Copyright (C) 2022-2023  Rafal Michalski

    orictap-audio is free software: you can redistribute it and/or modify
    it under the terms of the GNU Lesser General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    orictap-audio is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
/*! Waveform representation and audio I/O.

This crate provides the audio-side collaborators of the tape decoding core:

* [Sound] - a shared-read, monophonic floating-point waveform with a known
  sample rate and finite length, loadable from **WAV** files.
* [SoundBuffer] - a growable waveform used to assemble diagnostic dumps and
  in-memory recordings.
* [wav] - **WAV** file reading and the streaming [wav::WavSink] writer.
* [host] - audio playback and capture on top of
  [cpal](https://crates.io/crates/cpal), and the [host::SampleSink] trait
  uniting offline and live sample consumers.
*/
pub mod host;
pub mod sound;
pub mod wav;

pub use host::{AudioError, AudioErrorKind, SampleSink, SoundPlayer, SoundRecorder};
pub use sound::{Sound, SoundBuffer};
