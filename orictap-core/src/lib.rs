/*
    orictap-core: the Oric tape signal decoding core.
    Copyright (C) 2022-2023  Rafal Michalski

    orictap-core is free software: you can redistribute it and/or modify
    it under the terms of the GNU Lesser General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    orictap-core is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
/*! Decoding and encoding of Oric-1 / Oric Atmos cassette tapes.

The decode pipeline is a leaf-first composition over a shared-read
[Sound][orictap_audio::Sound] waveform:

```text
waveform -> filters -> (binarizers | demodulator) -> byte framers
         -> back-ends -> chronological merger -> tape parser -> files
```

* [filters] - interpolation, running min/max and the Hann low-pass.
* [balance] - the nonlinear high-pass removing slow tape-level drift.
* [demod] - quadrature demodulation of the 1200/2400 Hz carriers.
* [binarize] - three interchangeable bit-event extractors.
* [framing] - 13-bit byte framing from bit events, slow and fast.
* [decode] - the decoder back-ends, their chronological merger and the
  format auto-detection.
* [parse] - the byte-stream to [TapeFile][parse::TapeFile] state machine.
* [encode] - the tape signal generator.

A decode is driven entirely by pull: [TapeDecoder][decode::TapeDecoder]
produces bytes which produce windows which read samples. No thread or
synchronization primitive takes part in the pipeline.
*/
pub mod balance;
pub mod binarize;
pub mod decode;
pub mod demod;
pub mod encode;
pub mod filters;
pub mod framing;
pub mod parse;

pub use decode::{Band, Binner, Cue, DecodedByte, DecoderConfig, Fdec, TapeDecoder};
pub use encode::TapeEncoder;
pub use parse::{TapeFile, TapeParser};

/// The nominal physical bit frequency of the Oric tape interface, in Hz.
pub const F_REF_HZ: u32 = 4800;

/// Physical bits (clock cycles) in one slow-format byte.
pub const SLOW_BITS_PER_BYTE: u32 = 209;

/// Nominal clock cycles in one fast-format byte.
pub const FAST_BITS_PER_BYTE: u32 = 32;

/// Formats a time coordinate in seconds as `MM:SS.CC`.
///
/// Slightly negative onsets (the first byte may protrude left of zero)
/// are clamped to zero.
pub fn fmt_time(time: f64) -> String {
    let mut cent = (100.0 * time).floor() as i64;
    if cent < 0 {
        cent = 0;
    }
    let secs = cent / 100;
    format!("{:02}:{:02}.{:02}", secs / 60, secs % 60, cent % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_formatting() {
        assert_eq!(fmt_time(0.0), "00:00.00");
        assert_eq!(fmt_time(-0.3), "00:00.00");
        assert_eq!(fmt_time(61.25), "01:01.25");
        assert_eq!(fmt_time(600.999), "10:00.99");
    }
}
