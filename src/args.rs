//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Command-line argument parsing.
//!

use std::path::PathBuf;
use std::time::Duration;

mod cmdline {
    pub const ENABLE_LOGGING: &str = "log";
    pub const CONFIG: &str = "config";
    pub const FRAMES: &str = "frames";
    pub const EXPOSURE: &str = "exposure";
    pub const LIVE: &str = "live";
}

#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub logging: bool,
    pub config: Option<PathBuf>,
    pub nb_frames: Option<u64>,
    /// Exposure time in seconds.
    pub exposure: Option<f64>,
    /// Live mode duration.
    pub live: Option<Duration>
}

fn single_value<'a>(values: &'a std::collections::HashMap<String, Vec<String>>, option: &str) -> Result<Option<&'a str>, String> {
    match values.get(option) {
        None => Ok(None),
        Some(v) if v.len() == 1 => Ok(Some(&v[0])),
        Some(_) => Err(format!("Option --{} expects one value.", option))
    }
}

fn parse_value<T: std::str::FromStr>(
    values: &std::collections::HashMap<String, Vec<String>>,
    option: &str
) -> Result<Option<T>, String> {
    match single_value(values, option)? {
        None => Ok(None),
        Some(s) => s.parse::<T>().map(Some).map_err(|_| format!("Invalid value of --{}: {}.", option, s))
    }
}

/// Returns a message describing the first invalid argument, if any.
pub fn parse_command_line<I: Iterator<Item=String>>(stream: I) -> Result<Args, String> {
    let allowed_options = vec![
        cmdline::ENABLE_LOGGING,
        cmdline::CONFIG,
        cmdline::FRAMES,
        cmdline::EXPOSURE,
        cmdline::LIVE
    ];

    // key: option name
    let mut option_values = std::collections::HashMap::<String, Vec<String>>::new();

    let mut current: Option<String> = None;

    for arg in stream.skip(1) /*skip the binary name*/ {
        if arg.starts_with("--") {
            match &arg[2..] {
                x if !allowed_options.contains(&x) => return Err(format!("Unknown command-line option: {}.", x)),

                opt => {
                    option_values.entry(opt.to_string()).or_insert_with(Vec::new);
                    current = Some(opt.to_string());
                }
            }
        } else {
            match current.as_ref().and_then(|opt| option_values.get_mut(opt)) {
                Some(values) => values.push(arg),
                None => return Err(format!("Unexpected value: {}.", arg))
            }
        }
    }

    if let Some(values) = option_values.get(cmdline::ENABLE_LOGGING) {
        if !values.is_empty() { return Err(format!("Option --{} takes no value.", cmdline::ENABLE_LOGGING)); }
    }

    let exposure_ms: Option<f64> = parse_value(&option_values, cmdline::EXPOSURE)?;
    if let Some(ms) = exposure_ms {
        if !(ms > 0.0) { return Err(format!("Invalid value of --{}: {}.", cmdline::EXPOSURE, ms)); }
    }

    let live_s: Option<f64> = parse_value(&option_values, cmdline::LIVE)?;
    let live = match live_s {
        Some(s) if s > 0.0 && s.is_finite() => Some(Duration::from_secs_f64(s)),
        Some(s) => return Err(format!("Invalid value of --{}: {}.", cmdline::LIVE, s)),
        None => None
    };

    Ok(Args{
        logging: option_values.contains_key(cmdline::ENABLE_LOGGING),
        config: single_value(&option_values, cmdline::CONFIG)?.map(PathBuf::from),
        nb_frames: parse_value(&option_values, cmdline::FRAMES)?,
        exposure: exposure_ms.map(|ms| ms / 1000.0),
        live
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Result<Args, String> {
        parse_command_line(std::iter::once("pgcam".to_string()).chain(line.split_whitespace().map(String::from)))
    }

    #[test]
    fn given_no_options_defaults_are_returned() {
        assert_eq!(Args::default(), args("").unwrap());
    }

    #[test]
    fn given_all_options_values_are_parsed() {
        let parsed = args("--log --config /tmp/pg.toml --frames 20 --exposure 12.5 --live 1.5").unwrap();
        assert!(parsed.logging);
        assert_eq!(Some(PathBuf::from("/tmp/pg.toml")), parsed.config);
        assert_eq!(Some(20), parsed.nb_frames);
        assert_eq!(Some(0.0125), parsed.exposure);
        assert_eq!(Some(Duration::from_millis(1500)), parsed.live);
    }

    #[test]
    fn given_invalid_input_error_is_reported() {
        assert!(args("--verbose").is_err());
        assert!(args("20").is_err());
        assert!(args("--frames twenty").is_err());
        assert!(args("--frames 1 2").is_err());
        assert!(args("--log yes").is_err());
        assert!(args("--exposure 0").is_err());
        assert!(args("--live -1").is_err());
        assert_eq!(Err("Invalid value of --frames: abc.".to_string()), args("--log --frames abc"));
    }
}
