// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::trace;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use cobench_intf::Sample;

/// One timed invocation of a workload. The coordinator only talks to
/// workloads through this so that it can be driven by fakes in tests.
pub trait Invoke: Send {
    fn name(&self) -> &str;
    fn invoke(&mut self) -> Result<Sample>;
}

pub struct Workload {
    cmd: String,
    cpus: String,
    threads: u32,
    hermitcore: bool,
    perf_events: Option<String>,
    log: Option<fs::File>,
}

impl Workload {
    pub fn new(cmd: &str, cpus: &str, threads: u32) -> Self {
        Self {
            cmd: cmd.to_string(),
            cpus: cpus.to_string(),
            threads,
            hermitcore: false,
            perf_events: None,
            log: None,
        }
    }

    pub fn hermitcore(mut self, on: bool) -> Self {
        self.hermitcore = on;
        self
    }

    pub fn perf_events(mut self, events: Option<&str>) -> Self {
        self.perf_events = events.map(|x| x.to_string());
        self
    }

    /// Append the output of every invocation to `path`.
    pub fn log_to(mut self, path: &Path) -> Result<Self> {
        let f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {:?}", path))?;
        self.log = Some(f);
        Ok(self)
    }

    fn command(&self) -> Command {
        let shell_cmd = match self.perf_events.as_ref() {
            Some(events) => format!("perf stat -e {} {}", events, &self.cmd),
            None => self.cmd.clone(),
        };

        let mut cmd;
        if self.hermitcore {
            cmd = Command::new("numactl");
            cmd.args(&["--physcpubind", &self.cpus, "/bin/sh"])
                .env("HERMIT_CPUS", format!("{}", self.threads))
                .env("HERMIT_MEM", "4G")
                .env("HERMIT_ISLE", "uhyve");
        } else {
            cmd = Command::new("/bin/sh");
            cmd.env("GOMP_CPU_AFFINITY", &self.cpus)
                .env("OMP_NUM_THREADS", format!("{}", self.threads));
        }
        cmd.arg("-c").arg(shell_cmd);
        cmd
    }
}

impl Invoke for Workload {
    fn name(&self) -> &str {
        &self.cmd
    }

    fn invoke(&mut self) -> Result<Sample> {
        let mut cmd = self.command();
        trace!("runner: {:?}", &cmd);

        let started_at = Instant::now();
        let output = cmd
            .output()
            .with_context(|| format!("spawning {:?}", &self.cmd))?;
        let runtime = started_at.elapsed();

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text += &String::from_utf8_lossy(&output.stderr);

        if let Some(log) = self.log.as_mut() {
            log.write_all(text.as_bytes())
                .with_context(|| format!("logging output of {:?}", &self.cmd))?;
        }

        if !output.status.success() {
            bail!("{:?} failed ({})", &self.cmd, &output.status);
        }
        Ok(Sample::new(runtime, Some(text)))
    }
}
