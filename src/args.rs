/*
    Copyright (C) 2022-2023  Rafal Michalski

    This file is part of orictap, a tool for recovering Oric tape recordings.

    For the full copyright notice, see the main.rs file.
*/
//! Command line time argument parsing.
use nom::branch::alt;
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::number::complete::double;
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;

fn decimal(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse)(input)
}

// mm:ss with an optional .cc fraction
fn minutes_seconds(input: &str) -> IResult<&str, f64> {
    map(
        tuple((
            separated_pair(decimal, char(':'), decimal),
            opt(preceded(char('.'), digit1)),
        )),
        |((mins, secs), frac)| {
            let mut time = f64::from(mins) * 60.0 + f64::from(secs);
            if let Some(frac) = frac {
                // fractional digits after the decimal point
                let scale = 10f64.powi(frac.len() as i32);
                time += frac.parse::<f64>().unwrap_or(0.0) / scale;
            }
            time
        },
    )(input)
}

/// Parses a time argument: either `mm:ss[.cc]` or plain (fractional)
/// seconds. Used as a [clap] value parser.
pub fn parse_time_arg(input: &str) -> Result<f64, String> {
    let time = all_consuming(alt((minutes_seconds, double)))(input.trim())
        .map(|(_, time)| time)
        .map_err(|_| format!("invalid time: {:?}, expected mm:ss[.cc] or seconds", input))?;
    if time.is_sign_negative() || !time.is_finite() {
        return Err(format!("invalid time: {:?}, expected a non-negative value", input));
    }
    Ok(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_and_seconds() {
        assert_eq!(parse_time_arg("1:30"), Ok(90.0));
        assert_eq!(parse_time_arg("00:05"), Ok(5.0));
        assert_eq!(parse_time_arg("10:00.50"), Ok(600.5));
        assert_eq!(parse_time_arg("0:01.25"), Ok(1.25));
    }

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_time_arg("42"), Ok(42.0));
        assert_eq!(parse_time_arg("1.5"), Ok(1.5));
        assert_eq!(parse_time_arg(" 3 "), Ok(3.0));
    }

    #[test]
    fn rejects_nonsense() {
        assert!(parse_time_arg("").is_err());
        assert!(parse_time_arg("1:2:3").is_err());
        assert!(parse_time_arg("mm:ss").is_err());
        assert!(parse_time_arg("-5").is_err());
        assert!(parse_time_arg("1:").is_err());
    }
}
