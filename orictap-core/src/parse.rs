/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the lib.rs file.
*/
/*! The tape parser: assembling named files out of a decoded byte stream.

A three-phase state machine scouts the stream for files:

* **Sync** - counts consecutive `0x16` bytes; a `0x24` after at least
  three of them opens a header. A limited number of stray bytes is
  tolerated in the preamble.
* **Header** - captures the 9 header bytes; unsupported file types are
  rejected with a log message.
* **Name** - accumulates the zero-terminated file name of at most 16
  bytes, then derives the addresses and payload length.

Payload collection runs concurrently with the state machine above, so the
next file's preamble can be scouted while payload bytes are still being
written. A payload interrupted by a new valid header is padded out with
`0xcd` bytes and emitted, the pads counted in both error categories.
*/
use std::borrow::Cow;

use arrayvec::ArrayVec;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use crate::decode::DecodedByte;
use crate::fmt_time;
use crate::{F_REF_HZ, FAST_BITS_PER_BYTE, SLOW_BITS_PER_BYTE};

/// BASIC or machine-code data, as encoded in the header file type.
pub const FILETYPE_BASIC: u8 = 0x00;
/// A machine-code / data file.
pub const FILETYPE_DATA: u8 = 0x80;

const PAD_BYTE: u8 = 0xcd;

/// A file extracted from tape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TapeFile {
    /// The raw 9-byte header.
    pub header: [u8; 9],
    /// Load address of the first payload byte.
    pub start_addr: u16,
    /// Load address of the last payload byte (inclusive).
    pub end_addr: u16,
    /// Payload length in bytes, 1..=65536.
    pub len: usize,
    /// Set for a BASIC file, clear for a DATA file.
    pub basic: bool,
    /// Set when the file requests automatic start.
    pub autorun: bool,
    /// Set when the file was read in the slow format.
    pub slow: bool,
    /// File name, up to 16 bytes, without the terminating zero.
    pub name: ArrayVec<u8, 16>,
    /// The payload bytes; holds exactly `len` bytes once emitted.
    pub payload: Vec<u8>,
    /// Bytes with a start/stop bit violation (pad bytes included).
    pub sync_errors: u32,
    /// Bytes with a parity mismatch but correct sync.
    pub parity_errors: u32,
    /// Onset of the first byte, in seconds.
    pub start_time: f64,
    /// Time just past the last byte, in seconds.
    pub end_time: f64,
}

impl TapeFile {
    /// Returns the file name as text, lossily decoded.
    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Sync,
    Header,
    Name,
}

/// Decodes a byte stream into [TapeFile]s.
///
/// Feed bytes with [TapeParser::put_byte] and finish the stream with
/// [TapeParser::flush]; both return a file whenever one completes.
pub struct TapeParser {
    section: Section,
    section_offs: usize,
    slow: bool,
    consecutive_non_16: u32,
    consecutive_bad_bytes: u32,

    scout_file: TapeFile,   // file in early stage processing

    payload_active: bool,
    payload_offs: usize,
    payload_file: TapeFile, // file in late stage processing

    verbose: bool,

    printbuf: ArrayVec<DecodedByte, 16>,
    printbuf_payload: bool,
    printbuf_section: Section,
    printbuf_addr: u16,

    last_time: f64,
}

impl TapeParser {
    /// Creates a parser; with `verbose` a hex dump of everything scanned
    /// is written to the log.
    pub fn new(verbose: bool) -> TapeParser {
        TapeParser {
            section: Section::Sync,
            section_offs: 0,
            slow: false,
            // assume some bad bytes were seen before the stream began
            consecutive_non_16: 100,
            consecutive_bad_bytes: 100,
            scout_file: TapeFile::default(),
            payload_active: false,
            payload_offs: 0,
            payload_file: TapeFile::default(),
            verbose,
            printbuf: ArrayVec::new(),
            printbuf_payload: false,
            printbuf_section: Section::Sync,
            printbuf_addr: 0,
            last_time: 0.0,
        }
    }

    /// Returns `true` while the parser is scouting for sync with no
    /// payload in progress.
    pub fn is_idle(&self) -> bool {
        self.section == Section::Sync && !self.payload_active
    }

    fn reset(&mut self) {
        self.section = Section::Sync;
        self.section_offs = 0;
        self.slow = false;
        self.consecutive_non_16 = 100;
        self.consecutive_bad_bytes = 100;
        self.payload_active = false;
        self.payload_offs = 0;
        self.scout_file = TapeFile::default();
        self.payload_file = TapeFile::default();
    }

    // Flushes the hex dump row, in a format similar to hexdump -C.
    fn print_flush(&mut self) {
        if self.printbuf.is_empty() {
            return;
        }
        if self.verbose {
            // 5-wide column with the section type or the payload address
            let abuf = if self.printbuf_payload {
                format!("{:04x} ", self.printbuf_addr)
            } else {
                match self.printbuf_section {
                    Section::Header => "Hdr  ".to_string(),
                    Section::Name => "Name ".to_string(),
                    Section::Sync => "Sync ".to_string(),
                }
            };
            let mut hbuf = String::with_capacity(3 * 16);
            let mut tbuf = String::with_capacity(16);
            for b in self.printbuf.iter() {
                let c = if b.sync_error { '!' } else if b.parity_error { '?' } else { ' ' };
                hbuf.push_str(&format!("{:02x}{}", b.byte, c));
                tbuf.push(if b.byte.is_ascii_graphic() || b.byte == b' ' {
                    b.byte as char
                } else {
                    '.'
                });
            }
            for _ in self.printbuf.len()..16 {
                hbuf.push_str("   ");
            }
            info!("{}  {} {} |{}|", fmt_time(self.printbuf[0].time), abuf, hbuf, tbuf);
        }
        self.printbuf.clear();
    }

    // Records a byte for the hex dump.
    fn print_byte(&mut self, b: &DecodedByte) {
        if !self.printbuf.is_empty()
            && (self.printbuf_payload != self.payload_active
                || self.printbuf_section != self.section)
        {
            self.print_flush();
        }
        self.printbuf_payload = self.payload_active;
        self.printbuf_section = self.section;
        if self.printbuf.is_empty() {
            self.printbuf_addr = self.payload_file.start_addr
                .wrapping_add(self.payload_offs as u16);
        }
        self.printbuf.push(*b);
        if self.printbuf.is_full()
            || (self.printbuf_payload
                && (self.printbuf_addr & 15) as usize + self.printbuf.len() == 16)
        {
            self.print_flush();
        }
    }

    /// Processes one decoded byte.
    ///
    /// Returns a completed [TapeFile] when this byte finished one.
    pub fn put_byte(&mut self, b: &DecodedByte) -> Option<TapeFile> {
        let mut emitted = None;

        if self.slow != b.slow {
            if !self.is_idle() {
                // a format change truncates any ongoing file
                emitted = self.flush();
            }
            self.slow = b.slow;
        }

        if self.verbose {
            self.print_byte(b);
        } else {
            self.print_flush();
        }

        // Extend the end time of the file past this byte, 1.5 byte times
        // ahead, to give downstream listings some margin.
        let bits = if b.slow { SLOW_BITS_PER_BYTE } else { FAST_BITS_PER_BYTE };
        let t_byte = bits as f64 / F_REF_HZ as f64;
        self.scout_file.end_time = b.time + 1.5 * t_byte;
        self.payload_file.end_time = self.scout_file.end_time;

        if self.payload_active {
            debug_assert!(self.payload_offs < self.payload_file.len);
            self.payload_file.payload.push(b.byte);
            self.payload_offs += 1;

            // Errors count in mutually exclusive categories, one per byte.
            self.payload_file.sync_errors += b.sync_error as u32;
            self.payload_file.parity_errors += (b.parity_error && !b.sync_error) as u32;

            if self.payload_offs == self.payload_file.len {
                self.print_flush();
                if self.verbose {
                    info!("{}  File finished, {} sync errors, {} parity errors",
                          fmt_time(self.payload_file.end_time),
                          self.payload_file.sync_errors,
                          self.payload_file.parity_errors);
                }
                debug_assert!(emitted.is_none());
                emitted = Some(self.take_payload_file());
            }
        }

        if b.byte != 0x16 {
            self.consecutive_non_16 += 1;
        } else {
            self.consecutive_non_16 = 0;
        }
        if b.sync_error || b.parity_error {
            self.consecutive_bad_bytes += 1;
        } else {
            self.consecutive_bad_bytes = 0;
        }

        match self.section {
            Section::Sync => {
                // The Oric writes 16,16,16,24 but accepts 16,16,16,A,24
                // where A is any random sequence. Missed versus phantom
                // files are balanced by allowing any A free of 8 non-16
                // bytes in a row with sync/parity errors in the last ones;
                // with an old file still in progress sync must be strict.
                if self.section_offs == 0 {
                    self.scout_file.start_time = b.time;
                }
                if b.byte == 0x16 {
                    self.section_offs += 1;
                } else if b.byte == 0x24 && self.section_offs >= 3 {
                    self.print_flush();
                    if self.verbose {
                        info!("{}  Found sync, {} leading bytes",
                              fmt_time(b.time), self.section_offs);
                    }
                    self.section = Section::Header;
                    self.section_offs = 0;
                    self.scout_file.sync_errors = 0;
                    self.scout_file.parity_errors = 0;
                } else if self.section_offs >= 3
                    && !self.payload_active
                    && (self.consecutive_non_16 < 8 || self.consecutive_bad_bytes < 4)
                {
                    // within tolerance, accept some stray bytes
                    self.section_offs += 1;
                } else {
                    // reset the sync search
                    self.section_offs = 0;
                }
            }
            Section::Header => {
                //  +-----+-----------+---------------------------------------------------+
                //  |Bytes| Name      | Values                                            |
                //  +-----+-----------+---------------------------------------------------+
                //  |  0  | datatype0 | Ignored for BASIC/DATA. $00=Real/String, $80=Int  |
                //  |  1  | datatype1 | Ignored for BASIC/DATA. $00=Int/Real, $FF=String  |
                //  |  2  | filetype  | $00 = BASIC, $80 = DATA, $40 = ARRAY (v1.1 only)  |
                //  |  3  | autorun   | Autorun enabled when nonzero ($00 or $C7)         |
                //  | 4-5 | endaddr   | End address (inclusive), high byte first          |
                //  | 6-7 | startaddr | Start address, high byte first                    |
                //  |  8  | unused8   | Ignored for BASIC/DATA. The value can vary.       |
                //  +-----+-----------+---------------------------------------------------+
                debug_assert!(self.section_offs < 9);
                self.scout_file.header[self.section_offs] = b.byte;
                self.section_offs += 1;

                self.scout_file.sync_errors += b.sync_error as u32;
                self.scout_file.parity_errors += (b.parity_error && !b.sync_error) as u32;

                if self.section_offs == 9 {
                    let filetype = self.scout_file.header[2];
                    if filetype == FILETYPE_BASIC || filetype == FILETYPE_DATA {
                        self.section = Section::Name;
                        self.section_offs = 0;
                        self.scout_file.name.clear();
                    } else {
                        self.print_flush();
                        if self.verbose {
                            info!("{}  Unsupported header, ignoring file", fmt_time(b.time));
                        } else if self.scout_file.sync_errors > 0
                            || self.scout_file.parity_errors > 0
                        {
                            // likely decoding quality rather than an exotic file type
                            warn!("Corrupted header, ignoring file at {}",
                                  fmt_time(self.scout_file.start_time));
                        } else {
                            warn!("Unsupported header, ignoring file at {}",
                                  fmt_time(self.scout_file.start_time));
                        }
                        self.section = Section::Sync;
                        self.section_offs = 0;
                    }
                }
            }
            Section::Name => {
                self.scout_file.sync_errors += b.sync_error as u32;
                self.scout_file.parity_errors += (b.parity_error && !b.sync_error) as u32;
                self.section_offs += 1;

                if b.byte == 0 {
                    let header = &self.scout_file.header;
                    let filetype = header[2];
                    let end_addr = u16::from_be_bytes([header[4], header[5]]);
                    let start_addr = u16::from_be_bytes([header[6], header[7]]);

                    // length 1..=65536
                    let len = end_addr.wrapping_sub(start_addr) as usize + 1;

                    self.scout_file.start_addr = start_addr;
                    self.scout_file.end_addr = end_addr;
                    self.scout_file.len = len;
                    self.scout_file.autorun = header[3] != 0;
                    self.scout_file.basic = filetype == FILETYPE_BASIC;
                    self.scout_file.slow = b.slow;

                    // A new file takes priority over a previous one still
                    // collecting its payload.
                    debug_assert!(emitted.is_none());
                    emitted = self.flush_payload();

                    if self.verbose {
                        self.print_flush();
                        info!("{}  Found {}", fmt_time(b.time), self.scout_file.name_str());
                    }

                    // Spawn two parallel activities: collect the payload
                    // and scan for the next sync.
                    self.payload_active = true;
                    self.payload_offs = 0;
                    self.payload_file = self.scout_file.clone();
                    self.payload_file.payload = Vec::with_capacity(len);
                    self.section = Section::Sync;
                    self.section_offs = 0;
                } else if self.scout_file.name.try_push(b.byte).is_err() {
                    // 17 bytes without a zero terminator
                    self.print_flush();
                    if self.verbose {
                        info!("{}  Too long file name, ignoring file", fmt_time(b.time));
                    } else if self.scout_file.sync_errors > 0
                        || self.scout_file.parity_errors > 0
                    {
                        warn!("Corrupted file name, ignoring file at {}",
                              fmt_time(self.scout_file.start_time));
                    } else {
                        warn!("Too long file name, ignoring file at {}",
                              fmt_time(self.scout_file.start_time));
                    }
                    self.scout_file.name.clear();
                    self.section = Section::Sync;
                    self.section_offs = 0;
                }
            }
        }

        self.last_time = b.time;
        emitted
    }

    // Emits the completed payload file.
    fn take_payload_file(&mut self) -> TapeFile {
        self.payload_active = false;
        core::mem::take(&mut self.payload_file)
    }

    // Truncates and emits the file currently collecting its payload.
    fn flush_payload(&mut self) -> Option<TapeFile> {
        if !self.payload_active {
            return None;
        }
        let missing_bytes = self.payload_file.len - self.payload_offs;
        warn!("File truncated with {} missing bytes", missing_bytes);

        // Pad the file to its expected length.
        for _ in 0..missing_bytes {
            self.payload_file.payload.push(PAD_BYTE);
            self.payload_file.sync_errors += 1;
            self.payload_file.parity_errors += 1;
        }
        self.payload_offs = self.payload_file.len;
        if self.verbose {
            info!("{}  File truncated, {} sync errors, {} parity errors",
                  fmt_time(self.payload_file.end_time),
                  self.payload_file.sync_errors,
                  self.payload_file.parity_errors);
        }
        Some(self.take_payload_file())
    }

    /// Finishes parsing at the end of the tape.
    ///
    /// An interrupted payload is padded out and returned.
    pub fn flush(&mut self) -> Option<TapeFile> {
        self.print_flush();
        let emitted = self.flush_payload();
        self.reset();
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte(b: u8) -> DecodedByte {
        DecodedByte { time: 0.0, slow: false, byte: b, parity_error: false, sync_error: false }
    }

    fn feed(parser: &mut TapeParser, bytes: &[u8]) -> Vec<TapeFile> {
        let mut time = 0.0;
        let mut files = Vec::new();
        for &b in bytes {
            let mut d = byte(b);
            d.time = time;
            time += 32.0 / 4800.0;
            if let Some(file) = parser.put_byte(&d) {
                files.push(file);
            }
        }
        files
    }

    fn archive(name: &[u8], start: u16, end: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00,
                                  (end >> 8) as u8, end as u8,
                                  (start >> 8) as u8, start as u8,
                                  0x00]);
        bytes.extend_from_slice(name);
        bytes.push(0);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn parses_a_simple_file() {
        let payload: Vec<u8> = (0..10).collect();
        let bytes = archive(b"HELLO", 0x501, 0x50a, &payload);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.name_str(), "HELLO");
        assert_eq!(file.start_addr, 0x501);
        assert_eq!(file.end_addr, 0x50a);
        assert_eq!(file.len, 10);
        assert_eq!(file.payload, payload);
        assert!(file.basic);
        assert!(!file.autorun);
        assert_eq!(file.sync_errors, 0);
        assert_eq!(file.parity_errors, 0);
        assert!(parser.is_idle());
    }

    #[test]
    fn parses_two_files_back_to_back() {
        let mut bytes = archive(b"ONE", 0x400, 0x403, &[1, 2, 3, 4]);
        bytes.extend(archive(b"TWO", 0x800, 0x801, &[5, 6]));
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name_str(), "ONE");
        assert_eq!(files[0].payload, [1, 2, 3, 4]);
        assert_eq!(files[1].name_str(), "TWO");
        assert_eq!(files[1].payload, [5, 6]);
        assert_eq!(files[0].sync_errors + files[0].parity_errors, 0);
        assert_eq!(files[1].sync_errors + files[1].parity_errors, 0);
    }

    #[test]
    fn sync_tolerates_a_stray_byte() {
        // 16 16 16 X 24 parses as a valid sync for any clean X
        let payload = [0xaau8];
        let mut bytes = vec![0x16, 0x16, 0x16, 0x42];
        bytes.extend(&archive(b"X", 0x100, 0x100, &payload)[3..]);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].payload, payload);
    }

    #[test]
    fn sync_rejects_heavy_garbage() {
        // 8 consecutive non-16 bytes, all bad, break the preamble
        let mut parser = TapeParser::new(false);
        let mut time = 0.0;
        let mut files = Vec::new();
        let mut put = |parser: &mut TapeParser, b: u8, bad: bool| {
            let d = DecodedByte {
                time, slow: false, byte: b,
                parity_error: false, sync_error: bad,
            };
            time += 32.0 / 4800.0;
            if let Some(f) = parser.put_byte(&d) {
                files.push(f);
            }
        };
        for _ in 0..3 {
            put(&mut parser, 0x16, false);
        }
        for _ in 0..8 {
            put(&mut parser, 0x99, true);
        }
        put(&mut parser, 0x24, false);
        // the 0x24 must not have opened a header
        assert!(parser.is_idle() || files.is_empty());
        assert!(files.is_empty());
    }

    #[test]
    fn wrapping_length_semantics() {
        // start == end gives length 1
        let bytes = archive(b"A", 0x200, 0x200, &[7]);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].len, 1);

        // end == start - 1 (mod 65536) gives length 65536
        let payload = vec![0u8; 65536];
        let bytes = archive(b"B", 0x200, 0x1ff, &payload);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].len, 65536);
        assert_eq!(files[0].payload.len(), 65536);
    }

    #[test]
    fn interrupted_payload_is_padded_and_emitted() {
        // the first file declares 8 bytes but only 2 arrive before the
        // next file's preamble
        let mut bytes = archive(b"LONG", 0x100, 0x107, &[0x11, 0x22]);
        bytes.extend(archive(b"NEXT", 0x300, 0x301, &[0x33, 0x44]));
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert_eq!(files.len(), 2);
        let truncated = &files[0];
        assert_eq!(truncated.name_str(), "LONG");
        assert_eq!(truncated.payload.len(), 8);
        assert_eq!(&truncated.payload[..2], &[0x11, 0x22]);
        assert!(truncated.payload[2..].iter().all(|&b| b == PAD_BYTE));
        assert_eq!(truncated.sync_errors, 6);
        assert_eq!(truncated.parity_errors, 6);
        assert_eq!(files[1].name_str(), "NEXT");
        assert_eq!(files[1].payload, [0x33, 0x44]);
    }

    #[test]
    fn unterminated_name_rejects_the_file() {
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00, 0x01, 0x00, 0]);
        bytes.extend_from_slice(&[b'N'; 17]); // no zero within 17 bytes
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert!(files.is_empty());
    }

    #[test]
    fn unsupported_filetype_rejects_the_file() {
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0, 0, 0x40, 0, 0x01, 0x00, 0x01, 0x00, 0]);
        bytes.extend_from_slice(b"ARRAY\0\x07");
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert!(files.is_empty());
    }

    #[test]
    fn format_flag_change_flushes_the_file() {
        let bytes = archive(b"CUT", 0x100, 0x103, &[1, 2]);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        assert!(files.is_empty()); // 2 of 4 payload bytes still missing
        // a slow-format byte arrives mid-file
        let d = DecodedByte { time: 1.0, slow: true, byte: 0x16,
                              parity_error: false, sync_error: false };
        let mut parser2 = parser;
        let file = parser2.put_byte(&d);
        let file = file.expect("truncated file on format change");
        assert_eq!(file.payload.len(), 4);
        assert_eq!(&file.payload[..2], &[1, 2]);
    }

    #[test]
    fn end_time_has_margin_past_the_last_byte() {
        let bytes = archive(b"T", 0x100, 0x100, &[9]);
        let mut parser = TapeParser::new(false);
        let files = feed(&mut parser, &bytes);
        let dt = 32.0 / 4800.0;
        let last_byte_time = (bytes.len() - 1) as f64 * dt;
        assert!((files[0].end_time - (last_byte_time + 1.5 * dt)).abs() < 1e-9);
        assert!(files[0].start_time >= 0.0);
    }
}
