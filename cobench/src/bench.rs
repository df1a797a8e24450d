// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{error, info, warn};
use std::path::Path;

use super::cat::{self, CatCtl};
use super::commands::{command_pairs, fresh_log_path, pretty_name};
use super::cosched::{CoSched, SlotResult};
use super::runner::Workload;
use cb_util::*;
use cobench_intf::{Args, RuntimeAggregate, RuntimeStats};

pub struct Bench {
    args: Args,
    cat: Option<CatCtl>,
    masks: Vec<[u64; 2]>,
    cosched: CoSched,
    pub stats: RuntimeStats,
}

impl Bench {
    pub fn new(args: Args, commands: &[String], cat: Option<CatCtl>) -> Result<Self> {
        let masks = match cat.as_ref() {
            Some(ctl) => {
                let caps = ctl.caps();
                cat::generate_masks(caps.min_bits, caps.num_bits, args.cat_chunk, args.cat_inverse)?
            }
            None => vec![],
        };
        let cat_dirs = cat.as_ref().map(|ctl| ctl.dirs()).unwrap_or_default();
        let stats = RuntimeStats::new(args.commandline(commands, &cat_dirs));
        let cosched = CoSched::new(args.runs, args.variance_diff);

        Ok(Self {
            args,
            cat,
            masks,
            cosched,
            stats,
        })
    }

    pub fn masks(&self) -> &[[u64; 2]] {
        &self.masks
    }

    fn workload(&self, cmd: &str, slot: usize, log_name: &str) -> Result<Workload> {
        let log_path = fresh_log_path(Path::new(&self.args.log_dir), log_name);
        Workload::new(cmd, &self.args.cpus[slot], self.args.threads)
            .hermitcore(self.args.hermitcore)
            .perf_events(self.args.perf_events.as_deref())
            .log_to(&log_path)
    }

    fn apply_masks(&self, masks: Option<[u64; 2]>) -> Result<()> {
        let ctl = match self.cat.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };
        match masks {
            Some(masks) => ctl.write_schemata(masks),
            None => {
                let full = cat::full_mask(ctl.caps().num_bits);
                ctl.write_schemata([full, full])
            }
        }
    }

    /// Apply `masks` and run `cmds` side by side. Failures are logged and
    /// turn into None so that the sweep can move on.
    fn run_step(&self, cmds: &[&str], masks: Option<[u64; 2]>) -> Option<Vec<SlotResult>> {
        let desc = match masks {
            Some(m) => format!("{:?} cat={:x?}", cmds, &m[..cmds.len()]),
            None => format!("{:?}", cmds),
        };

        if let Err(e) = self.apply_masks(masks) {
            error!("bench: failed to apply CAT masks for {} ({:#})", &desc, &e);
            return None;
        }

        let mut workloads = vec![];
        for (slot, cmd) in cmds.iter().enumerate() {
            let mut log_name = pretty_name(cmd);
            for (i, partner) in cmds.iter().enumerate() {
                if i != slot {
                    log_name += &format!("-{}", pretty_name(partner));
                }
            }
            if let Some(m) = masks {
                log_name += &format!("-{:x}", m[slot]);
            }
            match self.workload(cmd, slot, &log_name) {
                Ok(v) => workloads.push(v),
                Err(e) => {
                    error!("bench: failed to set up {} ({:#})", &desc, &e);
                    return None;
                }
            }
        }

        match self.cosched.run(workloads) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("bench: {} failed, skipping ({})", &desc, &e);
                None
            }
        }
    }

    fn log_result(&self, cmd: &str, what: &str, nr_void: u32, agg: Option<&RuntimeAggregate>) {
        let agg = match agg {
            Some(v) => v,
            None => return,
        };
        let slowdown = match self.stats.slowdown(cmd, agg) {
            Some(v) => format!("{:.3}x", v),
            None => "-".into(),
        };
        info!(
            "{:?} {}: mean={} stdev={} runs={} void={} slowdown={}",
            cmd,
            what,
            format_duration(agg.mean),
            format_duration(agg.stdev),
            agg.runs,
            nr_void,
            slowdown,
        );
    }

    /// Reference and CAT runs of `cmd` alone. Returns whether the reference
    /// could be recorded.
    pub fn run_individual(&mut self, cmd: &str) -> bool {
        let res = match self.run_step(&[cmd], None) {
            Some(mut v) => v.remove(0),
            None => return false,
        };
        self.stats.record_reference(cmd, res.samples);
        self.log_result(cmd, "alone", res.nr_void, self.stats.reference(cmd));

        for masks in self.masks.clone() {
            if prog_exiting() {
                break;
            }
            if let Some(mut v) = self.run_step(&[cmd], Some(masks)) {
                let res = v.remove(0);
                self.stats.record_cat(cmd, masks[0], res.samples);
                self.log_result(
                    cmd,
                    &format!("alone cat={:x}", masks[0]),
                    res.nr_void,
                    self.stats.cat(cmd, masks[0]),
                );
            }
        }
        true
    }

    fn record_pair(&mut self, pair: &[&str; 2], masks: Option<[u64; 2]>, results: Vec<SlotResult>) {
        for (slot, res) in results.into_iter().enumerate() {
            let (cmd, partner) = (pair[slot], pair[1 - slot]);
            match masks {
                Some(m) => {
                    self.stats
                        .record_cosched_cat(cmd, partner, m[slot], res.samples);
                    self.log_result(
                        cmd,
                        &format!("with {:?} cat={:x}", partner, m[slot]),
                        res.nr_void,
                        self.stats.cosched_cat(cmd, partner, m[slot]),
                    );
                }
                None => {
                    self.stats.record_cosched(cmd, partner, res.samples);
                    self.log_result(
                        cmd,
                        &format!("with {:?}", partner),
                        res.nr_void,
                        self.stats.cosched(cmd, partner),
                    );
                }
            }
        }
    }

    /// Co-scheduled runs of `pair` without and with CAT.
    pub fn run_pair(&mut self, pair: [&str; 2]) {
        if let Some(results) = self.run_step(&pair, None) {
            self.record_pair(&pair, None, results);
        }

        for masks in self.masks.clone() {
            if prog_exiting() {
                return;
            }
            if let Some(results) = self.run_step(&pair, Some(masks)) {
                self.record_pair(&pair, Some(masks), results);
            }
        }
    }

    pub fn run(&mut self, commands: &[String]) {
        let mut ready = vec![];
        for cmd in commands.iter() {
            if prog_exiting() {
                return;
            }
            info!("bench: running {:?} alone", cmd);
            if self.run_individual(cmd) {
                ready.push(cmd.clone());
            } else {
                warn!("bench: no reference for {:?}, excluding it from pairs", cmd);
            }
        }

        if self.args.no_cosched {
            return;
        }

        let pairs = command_pairs(&ready);
        for (i, pair) in pairs.iter().enumerate() {
            if prog_exiting() {
                return;
            }
            info!("bench: running pair {}/{} {:?}", i + 1, pairs.len(), pair);
            self.run_pair([pair[0].as_str(), pair[1].as_str()]);
        }
    }

    pub fn into_parts(self) -> (RuntimeStats, Option<CatCtl>) {
        (self.stats, self.cat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn test_args(dir: &Path) -> Args {
        let mut args = Args::default();
        args.runs = 2;
        args.variance_diff = None;
        args.log_dir = dir.to_string_lossy().to_string();
        args
    }

    #[test]
    fn test_failed_pair_is_skipped() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let cnt = dir.path().join("nr_runs");
        // Succeeds for the two reference runs and the first co-scheduled
        // run, fails on the second co-scheduled run.
        let a = format!(
            "n=$(cat {cnt:?} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {cnt:?}; test $n -ne 4",
            cnt = cnt
        );
        let b = "true".to_string();
        let cmds = vec![a.clone(), b.clone()];

        let mut bench = Bench::new(test_args(dir.path()), &cmds, None).unwrap();
        assert!(bench.masks().is_empty());
        bench.run(&cmds);

        let stats = &bench.stats;
        assert_eq!(stats.reference(&a).unwrap().runs, 2);
        assert_eq!(stats.reference(&b).unwrap().runs, 2);
        assert!(stats.cosched(&a, &b).is_none());
        assert!(stats.cosched(&b, &a).is_none());
        assert_eq!(fs::read_to_string(&cnt).unwrap().trim(), "4");
        assert!(dir.path().join("true.log").exists());
    }

    #[test]
    fn test_rerun_gets_fresh_logs() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("echo.log");
        fs::write(&stale, "stale\n").unwrap();
        let cmds = vec!["echo hello".to_string(), "true".to_string()];

        let mut args = test_args(dir.path());
        args.no_cosched = true;
        let mut bench = Bench::new(args, &cmds, None).unwrap();
        bench.run(&cmds);

        assert_eq!(fs::read_to_string(&stale).unwrap(), "stale\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("echo.1.log")).unwrap(),
            "hello\nhello\n"
        );
    }

    #[test]
    fn test_missing_reference_excludes_pairs() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let cmds = vec!["false".to_string(), "true".to_string(), ":".to_string()];

        let mut bench = Bench::new(test_args(dir.path()), &cmds, None).unwrap();
        bench.run(&cmds);

        let (stats, _) = bench.into_parts();
        assert_eq!(stats.applications(), vec![":", "true"]);
        assert!(stats.cosched("true", ":").is_some());
        assert!(stats.cosched(":", "true").is_some());
        assert_eq!(stats.commandline.commands, cmds);
    }

    #[test]
    fn test_no_cosched() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut args = test_args(dir.path());
        args.no_cosched = true;
        let cmds = vec!["true".to_string(), ":".to_string()];

        let mut bench = Bench::new(args, &cmds, None).unwrap();
        bench.run(&cmds);
        assert!(bench.stats.reference("true").is_some());
        assert!(bench.stats.cosched("true", ":").is_none());
    }

    #[test]
    fn test_cat_sweep() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("resctrl");
        fs::create_dir_all(root.join("info/L3")).unwrap();
        fs::write(root.join("info/L3/min_cbm_bits"), "1\n").unwrap();
        fs::write(root.join("info/L3/cbm_mask"), "f\n").unwrap();

        let mut args = test_args(dir.path());
        args.cat = true;
        let ctl = CatCtl::setup(&root, &args.cpus).unwrap();
        let cmds = vec!["true".to_string(), "sleep 0".to_string()];

        let mut bench = Bench::new(args, &cmds, Some(ctl)).unwrap();
        assert_eq!(bench.masks().len(), 3);
        bench.run(&cmds);

        let stats = &bench.stats;
        let ways = |m: &std::collections::BTreeMap<u32, RuntimeAggregate>| {
            m.keys().cloned().collect::<Vec<u32>>()
        };
        assert_eq!(ways(stats.cat_runtimes("true").unwrap()), vec![1, 3, 4]);
        assert_eq!(ways(stats.cosched_cat_runtimes("true", "sleep 0").unwrap()), vec![1, 3, 4]);
        assert_eq!(ways(stats.cosched_cat_runtimes("sleep 0", "true").unwrap()), vec![1, 3, 4]);
        assert!(stats.cosched_cat("true", "sleep 0", 0x1).is_some());
        assert_eq!(stats.commandline.cat_dirs.len(), 2);

        // The sweep ends with full access for both groups.
        for name in cat::CAT_DIR_NAMES.iter() {
            assert_eq!(
                fs::read_to_string(root.join(name).join("schemata")).unwrap(),
                "L3:0=f;1=f\n"
            );
        }
        assert!(dir.path().join("true-sleep-1.log").exists());
        assert!(dir.path().join("sleep-true-8.log").exists());
    }
}
