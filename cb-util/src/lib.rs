// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::info;
use simplelog as sl;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod json_file;

pub use json_file::{JsonLoad, JsonSave};

pub fn full_version(semver: &str) -> String {
    let mut ver = semver.to_string();
    let sha = env!("VERGEN_GIT_SHA");
    if sha.len() > 0 && !sha.starts_with("VERGEN") {
        ver += " ";
        ver += sha.get(..7).unwrap_or(sha);
    }
    ver + " " + env!("VERGEN_CARGO_TARGET_TRIPLE")
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

fn format_duration_internal(dur: f64, zero: &str) -> String {
    // (unit in seconds, value at which the next unit takes over, suffix)
    const UNITS: &[(f64, f64, &str)] = &[
        (0.000_000_001, 1000.0, "n"),
        (0.000_001, 1000.0, "u"),
        (0.001, 1000.0, "m"),
        (1.0, 60.0, "s"),
        (60.0, 60.0, "M"),
        (3600.0, 24.0, "H"),
        (3600.0 * 24.0, 365.0, "D"),
    ];

    if dur <= 0.0 {
        return zero.to_string();
    }
    for (unit, max, suffix) in UNITS.iter() {
        let v = dur / unit;
        if v < 99.95 {
            return format!("{:.1}{}", v.max(0.1), suffix);
        } else if v < *max {
            return format!("{:.0}{}", v, suffix);
        }
    }
    "INF".into()
}

pub fn format_duration(dur: f64) -> String {
    format_duration_internal(dur, "0")
}

pub fn format_duration_dashed(dur: f64) -> String {
    format_duration_internal(dur, "-")
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 => sl::LevelFilter::Info,
            1 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

/// Command line handling shared by the binaries. `clap_app()` is separate
/// from `match_cmdline()` so that tests can feed arbitrary argv.
pub trait CmdlineArgs
where
    Self: Default,
{
    fn clap_app() -> clap::App<'static, 'static>;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<()>;

    fn match_cmdline() -> clap::ArgMatches<'static> {
        Self::clap_app().get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn init_args_and_logging() -> Result<Self> {
        let matches = Self::match_cmdline();
        init_logging(Self::verbosity(&matches));

        let mut args = Self::default();
        args.process_cmdline(&matches)?;
        Ok(args)
    }
}

static PROG_EXITING: AtomicBool = AtomicBool::new(false);

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, finishing the current step...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_EXITING.store(true, Ordering::Relaxed);
}

pub fn prog_exiting() -> bool {
    PROG_EXITING.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.0, "0"),
            (0.000003932, "3.9u"),
            (0.0125, "12.5m"),
            (0.3, "300m"),
            (42.0, "42.0s"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            println!("{} -> {} ({})", pair.0, &result, pair.1);
            assert_eq!(&result, pair.1);
        }
        assert_eq!(super::format_duration_dashed(0.0), "-");
    }

    #[test]
    fn test_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("min_cbm_bits");
        std::fs::write(&path, "").unwrap();
        assert!(super::read_one_line(&path).is_err());

        std::fs::write(&path, "2\n3\n").unwrap();
        assert_eq!(super::read_one_line(&path).unwrap(), "2");
    }
}
