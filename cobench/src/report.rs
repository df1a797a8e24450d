// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use std::fmt::Write;

use cb_util::*;
use cobench_intf::{extract_counters, RuntimeAggregate, RuntimeStats};

fn format_agg(buf: &mut String, stats: &RuntimeStats, cmd: &str, label: &str, agg: &RuntimeAggregate) {
    let slowdown = match stats.slowdown(cmd, agg) {
        Some(v) => format!("{:>7.3}x", v),
        None => format!("{:>8}", "-"),
    };
    writeln!(
        buf,
        "  {:<32} mean={:>6} stdev={:>6} runs={:<3} slowdown={}",
        label,
        format_duration(agg.mean),
        format_duration_dashed(agg.stdev),
        agg.runs,
        slowdown
    )
    .unwrap();
}

pub fn format_stats(stats: &RuntimeStats) -> String {
    let cl = &stats.commandline;
    let mut buf = String::new();

    writeln!(
        buf,
        "[cobench result] version={} runs={} variance={} cpus={}/{} threads={}",
        &cl.version,
        cl.runs,
        match cl.variance_diff {
            Some(v) => format!("{}", v),
            None => "off".into(),
        },
        &cl.cpus[0],
        &cl.cpus[1],
        cl.threads,
    )
    .unwrap();
    if cl.cat {
        writeln!(
            buf,
            "  cat: chunk={} inverse={} resctrl={}",
            cl.cat_chunk, cl.cat_inverse, &cl.resctrl_path
        )
        .unwrap();
    }

    for cmd in stats.applications() {
        let app = match stats.application(cmd) {
            Some(v) => v,
            None => continue,
        };
        writeln!(buf, "\n{:?}", cmd).unwrap();
        format_agg(&mut buf, stats, cmd, "alone", &app.reference);

        for (ways, agg) in app.cat.iter() {
            format_agg(&mut buf, stats, cmd, &format!("alone cat={}", ways), agg);
        }
        for (partner, agg) in app.cosched.iter() {
            format_agg(&mut buf, stats, cmd, &format!("with {}", partner), agg);
        }
        for (partner, per_ways) in app.cosched_cat.iter() {
            for (ways, agg) in per_ways.iter() {
                format_agg(
                    &mut buf,
                    stats,
                    cmd,
                    &format!("with {} cat={}", partner, ways),
                    agg,
                );
            }
        }

        let counters = extract_counters(&app.reference);
        if counters.len() > 0 {
            writeln!(buf, "  perf:").unwrap();
            for c in counters.iter() {
                writeln!(
                    buf,
                    "    {:<30} mean={:.1} stdev={:.1}",
                    &c.name, c.mean, c.stdev
                )
                .unwrap();
            }
        }
    }

    buf
}

pub fn format_result_file(path: &str) -> Result<()> {
    let stats = RuntimeStats::load(path)?;
    print!("{}", &format_stats(&stats));
    Ok(())
}
