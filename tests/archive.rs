/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the main.rs file.
*/
//! End-to-end archive scenarios: encode, decode and parse whole files.
use orictap_audio::{Sound, SoundBuffer};
use orictap_core::decode::{DecoderConfig, TapeDecoder};
use orictap_core::encode::{TapeEncoder, ENCODER_RATE};
use orictap_core::filters::interp;
use orictap_core::parse::TapeFile;

fn archive_bytes(name: &[u8], start: u16, end: u16, autorun: bool, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
    bytes.extend_from_slice(&[
        0x00, 0x00, 0x00, if autorun { 0xc7 } else { 0x00 },
        (end >> 8) as u8, end as u8,
        (start >> 8) as u8, start as u8,
        0x00,
    ]);
    bytes.extend_from_slice(name);
    bytes.push(0);
    bytes.extend_from_slice(payload);
    bytes
}

fn encode_archive(archive: &[u8], slow: bool) -> Sound {
    let mut enc = TapeEncoder::new(SoundBuffer::new(ENCODER_RATE), slow);
    enc.put_archive(archive).unwrap();
    assert!(enc.finish());
    enc.into_inner().into_sound()
}

fn decode_files(sound: Sound, config: &DecoderConfig) -> Vec<TapeFile> {
    let mut dec = TapeDecoder::from_waveform(sound, config);
    dec.files().collect()
}

#[test]
fn single_basic_file_roundtrip() {
    let payload: Vec<u8> = (0..10).collect();
    let archive = archive_bytes(b"HELLO", 0x501, 0x50a, false, &payload);
    let sound = encode_archive(&archive, false);
    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);

    assert_eq!(files.len(), 1, "expected one file");
    let file = &files[0];
    assert_eq!(file.name_str(), "HELLO");
    assert_eq!(file.start_addr, 0x501);
    assert_eq!(file.end_addr, 0x50a);
    assert_eq!(file.len, 10);
    assert_eq!(file.payload, payload);
    assert!(file.basic);
    assert!(!file.autorun);
    assert!(!file.slow);
    assert_eq!(file.sync_errors, 0);
    assert_eq!(file.parity_errors, 0);
}

#[test]
fn single_file_roundtrip_slow() {
    let payload: Vec<u8> = (0..10).collect();
    let archive = archive_bytes(b"HELLO", 0x501, 0x50a, false, &payload);
    let sound = encode_archive(&archive, true);
    let config = DecoderConfig { slow: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);

    assert_eq!(files.len(), 1, "expected one file");
    let file = &files[0];
    assert_eq!(file.name_str(), "HELLO");
    assert_eq!(file.payload, payload);
    assert!(file.slow);
    assert_eq!(file.sync_errors + file.parity_errors, 0);
}

#[test]
fn two_files_back_to_back() {
    let payload1: Vec<u8> = (0..32).map(|i| i * 3).collect();
    let payload2 = vec![0x5a; 16];
    let mut archive = archive_bytes(b"FIRST", 0x400, 0x41f, false, &payload1);
    archive.extend(archive_bytes(b"SECOND", 0x800, 0x80f, true, &payload2));
    let sound = encode_archive(&archive, false);
    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);

    assert_eq!(files.len(), 2, "expected two files");
    assert_eq!(files[0].name_str(), "FIRST");
    assert_eq!(files[0].payload, payload1);
    assert_eq!(files[0].sync_errors + files[0].parity_errors, 0);
    assert_eq!(files[1].name_str(), "SECOND");
    assert_eq!(files[1].payload, payload2);
    assert!(files[1].autorun);
    assert_eq!(files[1].sync_errors + files[1].parity_errors, 0);
    assert!(files[0].end_time <= files[1].end_time);
}

#[test]
fn tap_to_wav_to_tap_is_identity() {
    // decode the waveform back to a byte stream and compare it with the
    // original archive content (the prolonged preamble precedes it)
    let payload: Vec<u8> = (0..48).map(|i| (i * 11 + 3) as u8).collect();
    let archive = archive_bytes(b"LOOP", 0x1000, 0x102f, false, &payload);
    let sound = encode_archive(&archive, false);
    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let mut dec = TapeDecoder::from_waveform(sound, &config);
    let mut bytes = Vec::new();
    while let Some(b) = dec.read_byte() {
        bytes.push(b.byte);
    }
    // skip the prolonged sync run, find the 0x24 marker
    let sync_end = bytes.iter().position(|&b| b == 0x24).expect("sync marker");
    assert!(sync_end >= 3, "too short a preamble");
    assert!(bytes[..sync_end].iter().all(|&b| b == 0x16));
    let rest = &bytes[sync_end..];
    // everything from the marker on reproduces the archive sans preamble
    assert!(rest.len() >= archive.len() - 3);
    assert_eq!(&rest[..archive.len() - 3], &archive[3..]);
}

#[test]
fn corrupted_payload_still_yields_the_file() {
    let payload: Vec<u8> = (0..10).collect();
    let archive = archive_bytes(b"HELLO", 0x501, 0x50a, false, &payload);
    let sound = encode_archive(&archive, false);

    // zero out a 100-sample window inside the payload region
    let mut samples = sound.samples().to_vec();
    let hole = samples.len() - 2500;
    for y in samples[hole..hole + 100].iter_mut() {
        *y = 0.0;
    }
    let sound = Sound::new(samples, ENCODER_RATE);

    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);
    assert_eq!(files.len(), 1, "the file must still be emitted");
    let file = &files[0];
    assert_eq!(file.name_str(), "HELLO");
    assert_eq!(file.len, 10);
    assert_eq!(file.payload.len(), 10);
    assert!(file.sync_errors + file.parity_errors >= 1,
            "corruption must surface as at least one error");
}

#[test]
fn noisy_waveform_still_decodes_cleanly() {
    use rand::{Rng, SeedableRng};
    let payload: Vec<u8> = (0..24).map(|i| (i * 7 + 1) as u8).collect();
    let archive = archive_bytes(b"NOISY", 0x600, 0x617, false, &payload);
    let sound = encode_archive(&archive, false);

    // additive noise at about -20 dB of the signal amplitude
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x0116);
    let samples: Vec<f32> = sound.samples().iter()
        .map(|&y| y + rng.gen_range(-0.06..0.06))
        .collect();
    let sound = Sound::new(samples, ENCODER_RATE);

    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].payload, payload);
    assert_eq!(files[0].sync_errors + files[0].parity_errors, 0);
}

// Resamples a waveform with a sample clock scaled linearly from
// `factor0` at the start to `factor1` at the end.
fn stretch(sound: &Sound, factor0: f64, factor1: f64) -> Sound {
    let src = sound.samples();
    let mut samples = Vec::new();
    let mut pos = 0.0f64;
    let len = src.len() as f64;
    while pos < len - 1.0 {
        samples.push(interp(src, pos as f32));
        let factor = factor0 + (factor1 - factor0) * pos / len;
        pos += 1.0 / factor;
    }
    Sound::new(samples, sound.sample_rate())
}

#[test]
fn clock_drift_is_tracked() {
    // 200 payload bytes under a clock stretching linearly to +10%; the
    // adaptive per-window clock must keep at least 95% of the tail bytes
    let payload = vec![0x55u8; 200];
    let archive = archive_bytes(b"DRIFT", 0x2000, 0x20c7, false, &payload);
    let sound = encode_archive(&archive, false);
    let sound = stretch(&sound, 1.0, 1.1);

    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let files = decode_files(sound, &config);
    assert_eq!(files.len(), 1, "the stretched file must still parse");
    let file = &files[0];
    assert_eq!(file.len, 200);
    let good = file.payload.iter().filter(|&&b| b == 0x55).count();
    assert!(good * 100 >= 95 * payload.len(),
            "only {} of {} payload bytes survived the drift", good, payload.len());
    // the last quartile specifically must be mostly intact
    let tail = &file.payload[150..];
    let tail_good = tail.iter().filter(|&&b| b == 0x55).count();
    assert!(tail_good * 100 >= 95 * tail.len(),
            "only {} of {} tail bytes survived the drift", tail_good, tail.len());
}
