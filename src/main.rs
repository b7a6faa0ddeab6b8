/*
    orictap: recover, inspect, encode and play Oric cassette tapes.
    Copyright (C) 2022-2023  Rafal Michalski

    orictap is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    orictap is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

use orictap_core::fmt_time;
use orictap_core::decode::{Band, Binner, Cue, DecoderConfig, Fdec, TapeDecoder};
use orictap_core::encode::{TapeEncoder, ENCODER_RATE};
use orictap_core::parse::TapeFile;
use orictap_audio::{SampleSink, Sound, SoundPlayer, SoundRecorder};
use orictap_audio::wav::WavSink;

mod args;
use args::parse_time_arg;

#[derive(Parser)]
#[command(name = "orictap", version, about = "A tool for managing Oric tapes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Start time (mm:ss[.cc] or seconds)
    #[arg(short = 'S', long, global = true, value_parser = parse_time_arg)]
    start: Option<f64>,

    /// End time (mm:ss[.cc] or seconds)
    #[arg(short = 'E', long, global = true, value_parser = parse_time_arg)]
    end: Option<f64>,

    /// Use the fast tape format
    #[arg(short, long, global = true, conflicts_with = "slow")]
    fast: bool,

    /// Use the slow tape format
    #[arg(short, long, global = true)]
    slow: bool,

    /// Use the dual-mode two-stage decoder
    #[arg(short = '2', long, global = true)]
    dual: bool,

    /// Print a hex dump and diagnostic information
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Write intermediate waveform(s) named dump-<backend>.wav
    #[arg(short = 'D', long, global = true)]
    dump: bool,

    /// Decoder bit rate in Hz
    #[arg(short = 'c', long, global = true, default_value_t = 4800)]
    clock: u32,

    /// Listen to the 1200 Hz band only, ignore 2400 Hz
    #[arg(long, global = true, conflicts_with = "high_band")]
    low_band: bool,

    /// Listen to the 2400 Hz band only, ignore 1200 Hz
    #[arg(long, global = true)]
    high_band: bool,

    /// Use only the area measure to read bits
    #[arg(long, global = true, conflicts_with = "wide_cue")]
    area_cue: bool,

    /// Use only the wide pulse location to read bits
    #[arg(long, global = true)]
    wide_cue: bool,

    /// Use the alternative bit extractor named Grid
    #[arg(long, global = true, conflicts_with = "super_")]
    grid: bool,

    /// Use the alternative bit extractor named Super
    #[arg(long = "super", global = true)]
    super_: bool,

    /// Use the alternative fast decoder named PLEN
    #[arg(long, global = true, conflicts_with = "barrel")]
    plen: bool,

    /// Use the alternative fast decoder named Barrel
    #[arg(long, global = true)]
    barrel: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List the contents of a tape
    #[command(visible_alias = "l")]
    List {
        /// Input .wav or .tap file
        input: PathBuf,
    },
    /// Extract files from a tape
    #[command(visible_alias = "x")]
    Extract {
        /// Input .wav or .tap file
        input: PathBuf,
        /// Directory to extract files into
        #[arg(short = 'O', long)]
        output_dir: Option<PathBuf>,
    },
    /// Decode a waveform to a tape archive
    #[command(visible_alias = "d")]
    Decode {
        /// Input .wav file
        input: PathBuf,
        /// Output .tap file
        output: PathBuf,
    },
    /// Encode a tape archive into a waveform
    #[command(visible_alias = "e")]
    Encode {
        /// Input .tap file
        input: PathBuf,
        /// Output .wav file; plays to the speaker when absent
        output: Option<PathBuf>,
    },
    /// Play a waveform or tape archive to the audio output device
    #[command(visible_alias = "p")]
    Play {
        /// Input .wav or .tap file
        input: PathBuf,
    },
    /// Record a waveform from the audio input device
    #[command(visible_alias = "r")]
    Record {
        /// Output .wav file
        output: PathBuf,
    },
}

impl Cli {
    fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            start: self.start,
            end: self.end,
            verbose: self.verbose,
            fast: self.fast,
            slow: self.slow,
            dual: self.dual,
            dump: self.dump,
            binner: if self.grid { Binner::Grid }
                else if self.super_ { Binner::Super }
                else { Binner::Pattern },
            band: if self.low_band { Band::Low }
                else if self.high_band { Band::High }
                else { Band::Dual },
            cue: if self.area_cue { Cue::Area }
                else if self.wide_cue { Cue::Wide }
                else { Cue::Auto },
            fdec: if self.plen { Fdec::Plen }
                else if self.barrel { Fdec::Barrel }
                else { Fdec::Orig },
            f_ref: self.clock,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { log::Level::Info } else { log::Level::Warn };
    simple_logger::init_with_level(log_level).expect("logger initialization");

    let config = cli.decoder_config();
    let result = match &cli.command {
        Command::List { input } => list(&config, input),
        Command::Extract { input, output_dir } => extract(&config, input, output_dir.as_deref()),
        Command::Decode { input, output } => decode(&config, input, output),
        Command::Encode { input, output } => encode(input, output.as_deref(), cli.slow),
        Command::Play { input } => play(input, cli.slow),
        Command::Record { output } => record(output),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/****************************************************************************/
/*                            FILE NAME HELPERS                             */
/****************************************************************************/

// Checks if the name from tape can be used for an extracted file: it must
// be non-empty printable ASCII free of characters that are illegal on
// Windows, and must not collide with our auto-generated placeholders.
fn is_valid_file_name(name: &[u8]) -> bool {
    if name.is_empty() || name.starts_with(b"FILE_AT_") {
        return false;
    }
    name.iter().all(|&c| {
        (32..127).contains(&c) && !b"\\/:*?\"<>|".contains(&c)
    })
}

// Adjusts a file name from tape so it can be used on disk, making it
// unique among the names used so far.
fn adjust_file_name(
    used_names: &mut HashSet<String>,
    file: &TapeFile,
    add_extension: bool,
) -> String {
    let valid_name = if is_valid_file_name(&file.name) {
        file.name_str().into_owned()
    } else {
        let sec0 = file.start_time.max(0.0).floor() as u64;
        format!("FILE_AT_{:02}_{:02}", sec0 / 60, sec0 % 60)
    };

    // Append -<n> until the name becomes unique.
    let mut unique_name = valid_name.clone();
    let mut unique_no = 0;
    while used_names.contains(&unique_name) {
        unique_no += 1;
        unique_name = format!("{}-{}", valid_name, unique_no);
    }
    used_names.insert(unique_name.clone());

    if add_extension {
        unique_name.push_str(".tap");
    }
    unique_name
}

/****************************************************************************/
/*                                  LIST                                    */
/****************************************************************************/

fn list_file(verbose: bool, file: &TapeFile, unique_name: &str) {
    let sec0 = file.start_time.max(0.0).floor() as u64;
    let sec1 = file.end_time.max(0.0).ceil() as u64;
    if verbose {
        let at = fmt_time(file.end_time);
        info!("{}  Location:      {:02}:{:02} - {:02}:{:02}",
              at, sec0 / 60, sec0 % 60, sec1 / 60, sec1 % 60);
        info!("{}  Start address: ${:04x}", at, file.start_addr);
        info!("{}  End address:   ${:04x}", at, file.end_addr);
        info!("{}  Length:        {} bytes", at, file.len);
        info!("{}  Type:          {}", at, if file.basic { "BASIC" } else { "DATA" });
        info!("{}  Autorun:       {}", at, if file.autorun { "Yes" } else { "No" });
        info!("{}  Format:        {}", at, if file.slow { "Slow" } else { "Fast" });
        info!("{}  Sync errors:   {}", at, file.sync_errors);
        info!("{}  Parity errors: {}", at, file.parity_errors);
        info!("{}  Original name: {}", at, file.name_str());
        info!("{}  Extracted as:  {}", at, unique_name);
    } else {
        println!("{:02}:{:02} - {:02}:{:02} {:8}  {} {} {} {:8}  {}",
            sec0 / 60, sec0 % 60, sec1 / 60, sec1 % 60,
            file.len,
            if file.basic { 'B' } else { '-' },
            if file.autorun { 'A' } else { '-' },
            if file.slow { 'S' } else { '-' },
            file.sync_errors + file.parity_errors,
            unique_name);
    }
}

fn list(config: &DecoderConfig, input: &Path) -> io::Result<ExitCode> {
    let mut file_cnt = 0usize;
    let mut len_sum = 0usize;
    let mut error_sum = 0u32;
    let mut used_names = HashSet::new();

    if !config.verbose {
        println!("-------------  -------  -----  -------  ---------------");
        println!("Location       Length   Flags  Errors   Name           ");
        println!("-------------  -------  -----  -------  ---------------");
    }

    let mut dec = TapeDecoder::open(input, config)?;
    while let Some(file) = dec.read_file() {
        let unique_name = adjust_file_name(&mut used_names, &file, false);
        list_file(config.verbose, &file, &unique_name);
        if config.verbose {
            info!("{}  ---------------------------------------", fmt_time(file.end_time));
        }
        file_cnt += 1;
        len_sum += file.len;
        error_sum += file.sync_errors + file.parity_errors;
    }

    if config.verbose {
        info!("Total length:  {} bytes", len_sum);
        info!("Total errors:  {}", error_sum);
        info!("File count:    {}", file_cnt);
    } else {
        if file_cnt != 0 {
            println!("-------------  -------  -----  -------  ---------------");
        }
        println!("              {:8}        {:8}  {} file(s)", len_sum, error_sum, file_cnt);
    }
    Ok(ExitCode::SUCCESS)
}

/****************************************************************************/
/*                                 EXTRACT                                  */
/****************************************************************************/

// Creates or re-uses the destination directory.
fn prepare_dest_dir(dir: &Path, verbose: bool) -> io::Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {
            if verbose {
                info!("Using existing destination directory {}", dir.display());
            }
            Ok(())
        }
        Ok(_) => Err(io::Error::new(io::ErrorKind::AlreadyExists,
                     format!("{} is not a directory", dir.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if verbose {
                info!("Creating destination directory {}", dir.display());
            }
            std::fs::create_dir(dir)
        }
        Err(e) => Err(e),
    }
}

// Writes one extracted file in the on-disk tape framing:
// preamble | header | name NUL | payload.
fn write_extracted_file(path: &Path, file: &TapeFile) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&[0x16, 0x16, 0x16, 0x24])?;
    out.write_all(&file.header)?;
    out.write_all(&file.name)?;
    out.write_all(&[0])?;
    out.write_all(&file.payload)?;
    out.flush()
}

fn extract(config: &DecoderConfig, input: &Path, output_dir: Option<&Path>) -> io::Result<ExitCode> {
    if let Some(dir) = output_dir {
        prepare_dest_dir(dir, config.verbose)?;
    }

    let mut error_sum = 0u32;
    let mut used_names = HashSet::new();

    let mut dec = TapeDecoder::open(input, config)?;
    while let Some(file) = dec.read_file() {
        let unique_name = adjust_file_name(&mut used_names, &file, true);
        let full_name = match output_dir {
            Some(dir) => dir.join(&unique_name),
            None => PathBuf::from(&unique_name),
        };

        if config.verbose {
            info!("{}  Extracting {}, {} sync errors, {} parity errors",
                  fmt_time(file.end_time), full_name.display(),
                  file.sync_errors, file.parity_errors);
        } else {
            print!("Extracting {}", full_name.display());
            if file.sync_errors != 0 {
                print!(", {} sync errors", file.sync_errors);
            }
            if file.parity_errors != 0 {
                print!(", {} parity errors", file.parity_errors);
            }
            println!();
        }

        write_extracted_file(&full_name, &file)
            .map_err(|e| io::Error::new(e.kind(),
                format!("{}: {}", full_name.display(), e)))?;

        if config.verbose {
            info!("{}  ---------------------------------------", fmt_time(file.end_time));
        }
        error_sum += file.sync_errors + file.parity_errors;
    }

    if error_sum != 0 {
        error!("Errors were encountered during extraction");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/****************************************************************************/
/*                                 DECODE                                   */
/****************************************************************************/

fn decode(config: &DecoderConfig, input: &Path, output: &Path) -> io::Result<ExitCode> {
    println!("Decoding {} to {}", input.display(), output.display());
    let mut dec = TapeDecoder::open(input, config)?;

    let mut sync_errors = 0u64;
    let mut parity_errors = 0u64;
    let mut bytes = 0u64;

    let mut out = BufWriter::new(File::create(output)?);
    while let Some(b) = dec.read_byte() {
        bytes += 1;
        // count errors in mutually exclusive categories, one per byte
        sync_errors += b.sync_error as u64;
        parity_errors += (b.parity_error && !b.sync_error) as u64;
        out.write_all(core::slice::from_ref(&b.byte))
            .map_err(|e| io::Error::new(e.kind(),
                format!("error writing {}: {}", output.display(), e)))?;
    }
    out.flush()?;

    println!("Decoded {} bytes, {} sync errors, {} parity errors",
             bytes, sync_errors, parity_errors);
    Ok(if sync_errors != 0 || parity_errors != 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/****************************************************************************/
/*                             ENCODE AND PLAY                              */
/****************************************************************************/

fn print_playing(t: u64, t1: u64) {
    print!("\rPlaying {:02}:{:02} / {:02}:{:02}", t / 60, t % 60, t1 / 60, t1 % 60);
    let _ = io::stdout().flush();
}

fn encode_to_sink<S: SampleSink>(sink: S, input: &Path, slow: bool, progress: bool)
    -> io::Result<ExitCode>
{
    let mut enc = TapeEncoder::new(sink, slow);
    let archive = File::open(input)?;
    enc.put_archive(io::BufReader::new(archive))?;

    if progress {
        // loop while playing to present the time progress
        let t1 = enc.duration().floor() as u64;
        for t in 0..=t1 {
            let te = enc.elapsed_time();
            if te < t as f64 - 0.01 {
                enc.flush(t as f64 - te);
            }
            print_playing(t, t1);
        }
        enc.flush(1e9); // wait out the last fraction of a second
        println!();
    }

    if !enc.finish() {
        return Err(io::Error::new(io::ErrorKind::Other, "sample output failed"));
    }
    Ok(ExitCode::SUCCESS)
}

fn encode(input: &Path, output: Option<&Path>, slow: bool) -> io::Result<ExitCode> {
    match output {
        Some(output) => {
            println!("Converting tape archive {} to WAV file {}",
                     input.display(), output.display());
            let sink = WavSink::create(output, ENCODER_RATE)?;
            encode_to_sink(sink, input, slow, false)
                .map_err(|e| io::Error::new(e.kind(),
                    format!("write to {} failed: {}", output.display(), e)))
        }
        None => {
            println!("Playing tape archive {}", input.display());
            let player = SoundPlayer::open(ENCODER_RATE)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            encode_to_sink(player, input, slow, true)
        }
    }
}

fn play(input: &Path, slow: bool) -> io::Result<ExitCode> {
    match Sound::from_wav_file(input) {
        Ok(sound) => {
            // play the waveform as is
            let mut player = SoundPlayer::open(sound.sample_rate())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            player.write(sound.samples());
            let t1 = sound.duration().floor() as u64;
            for t in 0..=t1 {
                let te = player.elapsed_time();
                if te < t as f64 - 0.01 {
                    player.flush(t as f64 - te);
                }
                print_playing(t, t1);
            }
            player.flush(1e9); // wait out the last fraction of a second
            println!();
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            // not a waveform: encode the archive and play it
            encode(input, None, slow)
        }
        Err(e) => Err(e),
    }
}

/****************************************************************************/
/*                                 RECORD                                   */
/****************************************************************************/

fn record(output: &Path) -> io::Result<ExitCode> {
    let sample_rate = 44100u32;
    let chunk_len = (sample_rate as f64 / 10.0).round() as usize;
    let mut chunk = vec![0.0f32; chunk_len];

    let stopping = Arc::new(AtomicBool::new(false));
    {
        let stopping = stopping.clone();
        ctrlc::set_handler(move || stopping.store(true, Ordering::Release))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }

    let mut recorder = SoundRecorder::open(sample_rate, chunk_len)
        .map_err(|e| io::Error::new(io::ErrorKind::Other,
            format!("error opening audio input: {}", e)))?;
    let mut sink = WavSink::create(output, sample_rate)?;
    recorder.start()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    print!("Recording {:02}:{:02}", 0, 0);
    let _ = io::stdout().flush();

    let mut write_ok = true;
    let mut read_ok = true;
    while read_ok && write_ok {
        read_ok = recorder.read(&mut chunk);
        if !read_ok {
            break;
        }
        let time = recorder.elapsed_time();

        // RMS of the chunk: sum((x - a)^2) = sum(x2) + n*a2 - 2*a*sum(x)
        let sum_x: f32 = chunk.iter().sum();
        let sum_x2: f32 = chunk.iter().map(|x| x * x).sum();
        let n = chunk_len as f32;
        let a = sum_x / n;
        let rms = (sum_x2 / n + a * a - 2.0 * a * sum_x / n).max(0.0).sqrt();

        // a 20-step logarithmic volume scale
        let (rms_low, rms_high) = (0.001f32, 0.9f32);
        let steps = 20usize;
        let vol = if rms <= rms_low { 0 }
            else if rms >= rms_high { steps - 1 }
            else {
                (0.5 + (steps - 1) as f32 * (rms / rms_low).ln()
                    / (rms_high / rms_low).ln()).floor() as usize
            };
        let indicator: String = (0..steps).map(|i| if vol > i { '#' } else { '-' }).collect();

        let secs = time.floor() as u64;
        print!("\rRecording {:02}:{:02} |{}|", secs / 60, secs % 60, indicator);
        let _ = io::stdout().flush();

        if stopping.load(Ordering::Acquire) {
            recorder.stop();
            break;
        }
        write_ok = sink.write(&chunk);
    }
    println!();

    if stopping.load(Ordering::Acquire) {
        println!("Recording stopped");
        sink.finalize()?;
        return Ok(ExitCode::SUCCESS);
    }
    if !read_ok {
        error!("Error reading audio input");
    } else if !write_ok {
        error!("Error writing {}", output.display());
    }
    sink.finalize()?;
    Ok(ExitCode::FAILURE)
}
