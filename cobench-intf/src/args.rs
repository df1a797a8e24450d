// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use cb_util::*;

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-c, --cmd=[FILE]          'Newline separated command list (dfl: {dfl_cmd})'
             -r, --result=[FILE]       'Result json file (dfl: TIMESTAMP.cobench.json)'
             -n, --runs=[NR]           'Minimum number of invocations per slot (dfl: {dfl_runs})'
                 --variance=[DIFF|off] 'Variance stability threshold in secs^2 or off (dfl: {dfl_variance})'
                 --cpus0=[LIST]        'CPUs for the first slot (dfl: {dfl_cpus0})'
                 --cpus1=[LIST]        'CPUs for the second slot (dfl: {dfl_cpus1})'
             -t, --threads=[NR]        'Thread count exported to the workloads (dfl: {dfl_threads})'
                 --hermitcore          'Run workloads under numactl with HERMIT_* environment'
                 --cat                 'Sweep L3 cache partition sizes with CAT'
                 --cat-chunk=[BITS]    'Cache ways added per sweep step (dfl: {dfl_cat_chunk})'
                 --cat-inverse         'Give the first slot the high end of the cache ways'
                 --resctrl=[PATH]      'resctrl mount point (dfl: {dfl_resctrl})'
                 --perf=[EVENTS]       'Wrap workloads in perf stat -e EVENTS'
                 --log-dir=[DIR]       'Directory for workload output logs (dfl: {dfl_log_dir})'
                 --no-cosched          'Only run individual measurements'
             -v...                     'Sets the level of verbosity'",
            dfl_cmd = dfl.cmd_file,
            dfl_runs = dfl.runs,
            dfl_variance = dfl.variance_diff.unwrap_or(0.0),
            dfl_cpus0 = dfl.cpus[0],
            dfl_cpus1 = dfl.cpus[1],
            dfl_threads = dfl.threads,
            dfl_cat_chunk = dfl.cat_chunk,
            dfl_resctrl = dfl.resctrl_path,
            dfl_log_dir = dfl.log_dir,
        )
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Run,
    Format,
}

#[derive(Debug, Clone)]
pub struct Args {
    pub mode: Mode,
    pub result: Option<String>,
    pub cmd_file: String,
    pub runs: u32,
    pub variance_diff: Option<f64>,
    pub cpus: [String; 2],
    pub threads: u32,
    pub hermitcore: bool,
    pub cat: bool,
    pub cat_chunk: u32,
    pub cat_inverse: bool,
    pub resctrl_path: String,
    pub perf_events: Option<String>,
    pub log_dir: String,
    pub no_cosched: bool,
    pub format_src: String,
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::Run,
            result: None,
            cmd_file: "cmd.txt".into(),
            runs: 2,
            variance_diff: Some(0.001),
            cpus: ["0-4".into(), "5-9".into()],
            threads: 5,
            hermitcore: false,
            cat: false,
            cat_chunk: 2,
            cat_inverse: false,
            resctrl_path: "/sys/fs/resctrl/".into(),
            perf_events: None,
            log_dir: ".".into(),
            no_cosched: false,
            format_src: "".into(),
            verbosity: 0,
        }
    }
}

fn parse_variance(v: &str) -> Result<Option<f64>> {
    if v == "off" {
        return Ok(None);
    }
    let diff = v
        .parse::<f64>()
        .with_context(|| format!("invalid --variance {:?}", v))?;
    Ok(Some(diff))
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.runs < 1 {
            bail!("--runs must be at least 1");
        }
        if self.cat_chunk < 1 {
            bail!("--cat-chunk must be at least 1");
        }
        if let Some(diff) = self.variance_diff {
            if !diff.is_finite() || diff < 0.0 {
                bail!("--variance must be a non-negative number or off, got {}", diff);
            }
        }
        for (i, cpus) in self.cpus.iter().enumerate() {
            if cpus.trim().len() == 0 {
                bail!("--cpus{} is empty", i);
            }
        }
        if self.threads < 1 {
            bail!("--threads must be at least 1");
        }
        Ok(())
    }

    /// Freeze the run parameters together with the command list.
    pub fn commandline(&self, commands: &[String], cat_dirs: &[String]) -> CommandlineConfig {
        CommandlineConfig {
            version: super::FULL_VERSION.clone(),
            runs: self.runs,
            variance_diff: self.variance_diff,
            cpus: self.cpus.clone(),
            threads: self.threads,
            hermitcore: self.hermitcore,
            cat: self.cat,
            cat_chunk: self.cat_chunk,
            cat_inverse: self.cat_inverse,
            cat_dirs: cat_dirs.to_vec(),
            resctrl_path: self.resctrl_path.clone(),
            perf_events: self.perf_events.clone(),
            commands: commands.to_vec(),
        }
    }
}

impl CmdlineArgs for Args {
    #[allow(dangerous_implicit_autorefs)]
    fn clap_app() -> clap::App<'static, 'static> {
        clap::App::new("cobench")
            .version((*super::FULL_VERSION).as_str())
            .author(clap::crate_authors!("\n"))
            .about("Co-scheduling interference benchmark with L3 CAT sweep")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .args_from_usage(&ARGS_STR)
            .subcommand(
                clap::SubCommand::with_name("format")
                    .about("Prints a summary of a result file")
                    .arg(
                        clap::Arg::with_name("RESULT")
                            .required(true)
                            .help("Result json file to format"),
                    ),
            )
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        let dfl = Args::default();

        if let Some(v) = matches.value_of("cmd") {
            self.cmd_file = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.cmd_file.clone()
            };
        }
        if let Some(v) = matches.value_of("result") {
            self.result = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
        }
        if let Some(v) = matches.value_of("runs") {
            self.runs = v
                .parse::<u32>()
                .with_context(|| format!("invalid --runs {:?}", v))?;
        }
        if let Some(v) = matches.value_of("variance") {
            self.variance_diff = parse_variance(v)?;
        }
        for (i, key) in ["cpus0", "cpus1"].iter().enumerate() {
            if let Some(v) = matches.value_of(key) {
                self.cpus[i] = v.to_string();
            }
        }
        if let Some(v) = matches.value_of("threads") {
            self.threads = v
                .parse::<u32>()
                .with_context(|| format!("invalid --threads {:?}", v))?;
        }
        if let Some(v) = matches.value_of("cat-chunk") {
            self.cat_chunk = v
                .parse::<u32>()
                .with_context(|| format!("invalid --cat-chunk {:?}", v))?;
        }
        if let Some(v) = matches.value_of("resctrl") {
            self.resctrl_path = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.resctrl_path.clone()
            };
        }
        if let Some(v) = matches.value_of("perf") {
            self.perf_events = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
        }
        if let Some(v) = matches.value_of("log-dir") {
            self.log_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.log_dir.clone()
            };
        }

        self.hermitcore = matches.is_present("hermitcore");
        self.cat = matches.is_present("cat");
        self.cat_inverse = matches.is_present("cat-inverse");
        self.no_cosched = matches.is_present("no-cosched");
        self.verbosity = Self::verbosity(matches);

        if let ("format", Some(subm)) = matches.subcommand() {
            self.mode = Mode::Format;
            self.format_src = subm.value_of("RESULT").unwrap_or("").to_string();
        }

        Ok(())
    }
}

/// Frozen run parameters recorded in the result file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandlineConfig {
    pub version: String,
    pub runs: u32,
    pub variance_diff: Option<f64>,
    pub cpus: [String; 2],
    pub threads: u32,
    pub hermitcore: bool,
    pub cat: bool,
    pub cat_chunk: u32,
    pub cat_inverse: bool,
    pub cat_dirs: Vec<String>,
    pub resctrl_path: String,
    pub perf_events: Option<String>,
    pub commands: Vec<String>,
}
