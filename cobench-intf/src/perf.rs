// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::RuntimeAggregate;

const PERF_HEADER: &str = "Performance counter stats for";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfCounter {
    pub name: String,
    pub mean: f64,
    pub stdev: f64,
    pub variance: f64,
}

fn parse_counter_line(line: &str) -> Option<(String, f64)> {
    // "  1,234,567      cycles      #    3.1 GHz"
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let mut toks = line.split_whitespace();
    let value = toks.next()?.replace(',', "").parse::<f64>().ok()?;
    let name = toks.last()?;
    Some((name.to_string(), value))
}

fn scan_output(output: &str, coll: &mut BTreeMap<String, Vec<f64>>) {
    let start = match output.find(PERF_HEADER) {
        Some(v) => v,
        None => return,
    };

    let mut lines = output[start..].lines().skip(1).skip_while(|l| l.trim().len() == 0);
    while let Some(line) = lines.next() {
        if line.trim().len() == 0 {
            break;
        }
        match parse_counter_line(line) {
            Some((name, value)) => {
                debug!("perf: {}={}", &name, value);
                coll.entry(name).or_default().push(value);
            }
            None => warn!("perf: failed to parse counter line {:?}", line.trim()),
        }
    }
}

/// Collect the `perf stat` counters printed by each sample of `agg`.
/// Counters are returned sorted by name.
pub fn extract_counters(agg: &RuntimeAggregate) -> Vec<PerfCounter> {
    let mut coll = BTreeMap::<String, Vec<f64>>::new();
    for sample in agg.samples() {
        if let Some(output) = sample.output.as_ref() {
            scan_output(output, &mut coll);
        }
    }

    coll.into_iter()
        .map(|(name, vals)| {
            let mean = statistical::mean(&vals);
            let variance = statistical::population_variance(&vals, Some(mean));
            PerfCounter {
                name,
                mean,
                stdev: variance.sqrt(),
                variance,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sample, NO_CAT_MASK};
    use std::time::Duration;

    const OUTPUT_A: &str = "bt.C.x: done

 Performance counter stats for '/global/work/share/npb/bt.C.x':

       31162368.00 Bytes intel_cqm/llc_occupancy/
        7,313,911,210      LLC-load-misses           #   12.3% of all LL-cache hits
     <not counted>      LLC-store-misses

      12.345678901 seconds time elapsed
";

    const OUTPUT_B: &str = " Performance counter stats for '/global/work/share/npb/bt.C.x':

       31162370.00 Bytes intel_cqm/llc_occupancy/
        7313911214      LLC-load-misses

";

    #[test]
    fn test_extract_counters() {
        let _ = ::env_logger::try_init();
        let agg = RuntimeAggregate::new(
            NO_CAT_MASK,
            vec![
                Sample::new(Duration::from_secs(12), Some(OUTPUT_A.into())),
                Sample::new(Duration::from_secs(12), Some(OUTPUT_B.into())),
                Sample::new(Duration::from_secs(12), Some("no perf here".into())),
                Sample::new(Duration::from_secs(12), None),
            ],
        );

        let counters = extract_counters(&agg);
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].name, "LLC-load-misses");
        assert_eq!(counters[0].mean, 7313911212.0);
        assert_eq!(counters[0].variance, 4.0);
        assert_eq!(counters[0].stdev, 2.0);
        assert_eq!(counters[1].name, "intel_cqm/llc_occupancy/");
        assert_eq!(counters[1].mean, 31162369.0);
    }

    #[test]
    fn test_no_counters() {
        let _ = ::env_logger::try_init();
        let agg = RuntimeAggregate::new(NO_CAT_MASK, vec![]);
        assert!(extract_counters(&agg).is_empty());
    }
}
