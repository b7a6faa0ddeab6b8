/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the main.rs file.
*/
//! Encode-then-decode loopback tests over in-memory waveforms.
use orictap_audio::{Sound, SoundBuffer};
use orictap_core::decode::{DecodedByte, DecoderConfig, TapeDecoder};
use orictap_core::encode::{TapeEncoder, ENCODER_RATE};

const TESTVECTOR: [u8; 8] = [0x16, 0x16, 0x16, 0x24, 0x00, 0x55, 0xaa, 0xff];

fn encode_bytes(bytes: &[u8], slow: bool) -> Sound {
    let mut enc = TapeEncoder::new(SoundBuffer::new(ENCODER_RATE), slow);
    for &b in bytes {
        enc.put_byte(b);
    }
    assert!(enc.finish());
    enc.into_inner().into_sound()
}

fn decode_all(sound: Sound, config: &DecoderConfig) -> Vec<DecodedByte> {
    let mut dec = TapeDecoder::from_waveform(sound, config);
    let mut bytes = Vec::new();
    while let Some(b) = dec.read_byte() {
        bytes.push(b);
    }
    bytes
}

fn check_loopback(slow: bool, dual: bool) {
    let sound = encode_bytes(&TESTVECTOR, slow);
    let config = DecoderConfig {
        fast: !slow,
        slow,
        dual,
        ..DecoderConfig::default()
    };
    let decoded = decode_all(sound, &config);

    assert!(decoded.len() >= TESTVECTOR.len(),
            "decoded too few bytes ({} of {})", decoded.len(), TESTVECTOR.len());
    assert!(decoded.len() <= TESTVECTOR.len() + 50,
            "decoded too many bytes ({})", decoded.len());
    for (i, (b, &expected)) in decoded.iter().zip(TESTVECTOR.iter()).enumerate() {
        assert_eq!(b.byte, expected, "byte {} differs", i);
        assert!(!b.sync_error, "sync error at byte {}", i);
        assert!(!b.parity_error, "parity error at byte {}", i);
        assert_eq!(b.slow, slow, "format flag at byte {}", i);
    }
}

#[test]
fn loopback_fast() {
    check_loopback(false, false);
}

#[test]
fn loopback_slow() {
    check_loopback(true, false);
}

#[test]
fn loopback_fast_dual() {
    check_loopback(false, true);
}

#[test]
fn loopback_slow_dual() {
    check_loopback(true, true);
}

#[test]
fn loopback_auto_detects_fast_format() {
    // neither format forced: the clean sync bytes must lock the selection
    let sound = encode_bytes(&TESTVECTOR, false);
    let config = DecoderConfig::default();
    let decoded = decode_all(sound, &config);
    assert!(decoded.len() >= TESTVECTOR.len());
    for (b, &expected) in decoded.iter().zip(TESTVECTOR.iter()) {
        assert_eq!(b.byte, expected);
        assert!(!b.slow);
    }
}

#[test]
fn loopback_times_are_monotone() {
    let sound = encode_bytes(&TESTVECTOR, false);
    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let decoded = decode_all(sound, &config);
    let mut last = f64::MIN;
    for b in decoded.iter() {
        assert!(b.time >= last, "time went backwards: {} after {}", b.time, last);
        last = b.time;
    }
}

#[test]
fn loopback_longer_payload() {
    let mut bytes = vec![0x16u8; 12];
    bytes.push(0x24);
    bytes.extend((0u16..64).map(|i| (i * 37 % 251) as u8));
    let sound = encode_bytes(&bytes, false);
    let config = DecoderConfig { fast: true, ..DecoderConfig::default() };
    let decoded = decode_all(sound, &config);
    assert!(decoded.len() >= bytes.len());
    for (i, (b, &expected)) in decoded.iter().zip(bytes.iter()).enumerate() {
        assert_eq!(b.byte, expected, "byte {} differs", i);
        assert!(!b.sync_error && !b.parity_error, "errors at byte {}", i);
    }
}
