// Copyright (c) Facebook, Inc. and its affiliates.
//
// Runtime statistics store. Every measurement ends up here keyed by the
// command, optionally the co-scheduled partner and the number of cache ways
// it was allowed to use. Raw samples are retained and all derived
// statistics are recomputed from them on every merge and after loading.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::CommandlineConfig;
use cb_util::*;

/// CAT mask used for runs without cache partitioning.
pub const NO_CAT_MASK: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub runtime: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Sample {
    pub fn new(runtime: Duration, output: Option<String>) -> Self {
        Self { runtime, output }
    }

    pub fn secs(&self) -> f64 {
        self.runtime.as_secs_f64()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeAggregate {
    pub mean: f64,
    pub stdev: f64,
    pub variance: f64,
    pub sum: f64,
    pub runs: usize,
    pub raw: BTreeMap<u64, Vec<Sample>>,
}

impl RuntimeAggregate {
    pub fn new(mask: u64, samples: Vec<Sample>) -> Self {
        let mut agg = Self::default();
        agg.merge(mask, samples);
        agg
    }

    pub fn merge(&mut self, mask: u64, samples: Vec<Sample>) {
        if samples.len() > 0 {
            self.raw.entry(mask).or_default().extend(samples);
        }
        self.recompute();
    }

    pub fn merge_aggregate(&mut self, other: &RuntimeAggregate) {
        for (mask, samples) in other.raw.iter() {
            self.raw.entry(*mask).or_default().extend(samples.iter().cloned());
        }
        self.recompute();
    }

    /// Samples of all buckets in ascending mask order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.raw.values().flatten()
    }

    pub fn runtimes(&self) -> Vec<f64> {
        self.samples().map(|s| s.secs()).collect()
    }

    pub fn recompute(&mut self) {
        // Sorted so that the float sums don't depend on the merge order.
        let mut data = self.runtimes();
        data.sort_by(|a, b| a.total_cmp(b));
        self.runs = data.len();
        if data.len() == 0 {
            self.mean = 0.0;
            self.stdev = 0.0;
            self.variance = 0.0;
            self.sum = 0.0;
            return;
        }

        self.sum = data.iter().sum();
        self.mean = statistical::mean(&data);
        self.variance = statistical::population_variance(&data, Some(self.mean));
        self.stdev = statistical::population_standard_deviation(&data, Some(self.mean));
    }

    /// Express every sample as a ratio to `reference_mean`. The ratio is
    /// stored as the sample duration in seconds and all samples land in the
    /// NO_CAT_MASK bucket.
    pub fn normalize(&self, reference_mean: f64) -> Result<Self> {
        if !reference_mean.is_finite() || reference_mean <= 0.0 {
            bail!("invalid reference mean {} for normalization", reference_mean);
        }

        let mut normalized = Vec::with_capacity(self.runs);
        for sample in self.samples() {
            let ratio = sample.secs() / reference_mean;
            match Duration::try_from_secs_f64(ratio) {
                Ok(runtime) => normalized.push(Sample::new(runtime, sample.output.clone())),
                Err(e) => bail!("failed to normalize {}s by {}s ({})", sample.secs(), reference_mean, &e),
            }
        }
        Ok(Self::new(NO_CAT_MASK, normalized))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationRecord {
    pub reference: RuntimeAggregate,
    /// popcount(mask) -> runs alone with the mask applied
    pub cat: BTreeMap<u32, RuntimeAggregate>,
    /// partner -> runs next to the partner without CAT
    pub cosched: BTreeMap<String, RuntimeAggregate>,
    /// partner -> popcount(mask) -> runs next to the partner with CAT
    pub cosched_cat: BTreeMap<String, BTreeMap<u32, RuntimeAggregate>>,
}

impl ApplicationRecord {
    fn for_each_aggregate_mut<F: FnMut(&mut RuntimeAggregate)>(&mut self, mut f: F) {
        f(&mut self.reference);
        self.cat.values_mut().for_each(&mut f);
        self.cosched.values_mut().for_each(&mut f);
        for per_mask in self.cosched_cat.values_mut() {
            per_mask.values_mut().for_each(&mut f);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeStats {
    pub commandline: CommandlineConfig,
    pub runtimes: BTreeMap<String, ApplicationRecord>,
}

impl RuntimeStats {
    pub fn new(commandline: CommandlineConfig) -> Self {
        Self {
            commandline,
            runtimes: Default::default(),
        }
    }

    fn app_mut(&mut self, cmd: &str) -> &mut ApplicationRecord {
        match self.runtimes.get_mut(cmd) {
            Some(app) => app,
            None => panic!("no reference runtime recorded for {:?}", cmd),
        }
    }

    pub fn record_reference(&mut self, cmd: &str, samples: Vec<Sample>) -> &RuntimeAggregate {
        let app = self.runtimes.entry(cmd.to_string()).or_default();
        app.reference.merge(NO_CAT_MASK, samples);
        &app.reference
    }

    pub fn record_cat(&mut self, cmd: &str, mask: u64, samples: Vec<Sample>) -> &RuntimeAggregate {
        let agg = self
            .app_mut(cmd)
            .cat
            .entry(mask.count_ones())
            .or_default();
        agg.merge(mask, samples);
        agg
    }

    pub fn record_cosched(
        &mut self,
        cmd: &str,
        partner: &str,
        samples: Vec<Sample>,
    ) -> &RuntimeAggregate {
        let agg = self
            .app_mut(cmd)
            .cosched
            .entry(partner.to_string())
            .or_default();
        agg.merge(NO_CAT_MASK, samples);
        agg
    }

    pub fn record_cosched_cat(
        &mut self,
        cmd: &str,
        partner: &str,
        mask: u64,
        samples: Vec<Sample>,
    ) -> &RuntimeAggregate {
        let agg = self
            .app_mut(cmd)
            .cosched_cat
            .entry(partner.to_string())
            .or_default()
            .entry(mask.count_ones())
            .or_default();
        agg.merge(mask, samples);
        agg
    }

    pub fn applications(&self) -> Vec<&str> {
        self.runtimes.keys().map(|k| k.as_str()).collect()
    }

    pub fn application(&self, cmd: &str) -> Option<&ApplicationRecord> {
        self.runtimes.get(cmd)
    }

    pub fn reference(&self, cmd: &str) -> Option<&RuntimeAggregate> {
        self.runtimes.get(cmd).map(|app| &app.reference)
    }

    pub fn cat(&self, cmd: &str, mask: u64) -> Option<&RuntimeAggregate> {
        self.cat_runtimes(cmd)?.get(&mask.count_ones())
    }

    pub fn cat_runtimes(&self, cmd: &str) -> Option<&BTreeMap<u32, RuntimeAggregate>> {
        self.runtimes.get(cmd).map(|app| &app.cat)
    }

    pub fn cosched(&self, cmd: &str, partner: &str) -> Option<&RuntimeAggregate> {
        self.runtimes.get(cmd)?.cosched.get(partner)
    }

    pub fn cosched_cat(&self, cmd: &str, partner: &str, mask: u64) -> Option<&RuntimeAggregate> {
        self.cosched_cat_runtimes(cmd, partner)?
            .get(&mask.count_ones())
    }

    pub fn cosched_cat_runtimes(
        &self,
        cmd: &str,
        partner: &str,
    ) -> Option<&BTreeMap<u32, RuntimeAggregate>> {
        self.runtimes.get(cmd)?.cosched_cat.get(partner)
    }

    fn normalized(&self, cmd: &str, agg: Option<&RuntimeAggregate>) -> Option<RuntimeAggregate> {
        let ref_mean = self.reference(cmd)?.mean;
        agg?.normalize(ref_mean).ok()
    }

    pub fn reference_normalized(&self, cmd: &str) -> Option<RuntimeAggregate> {
        self.normalized(cmd, self.reference(cmd))
    }

    pub fn cat_normalized(&self, cmd: &str, mask: u64) -> Option<RuntimeAggregate> {
        self.normalized(cmd, self.cat(cmd, mask))
    }

    pub fn cosched_normalized(&self, cmd: &str, partner: &str) -> Option<RuntimeAggregate> {
        self.normalized(cmd, self.cosched(cmd, partner))
    }

    pub fn cosched_cat_normalized(
        &self,
        cmd: &str,
        partner: &str,
        mask: u64,
    ) -> Option<RuntimeAggregate> {
        self.normalized(cmd, self.cosched_cat(cmd, partner, mask))
    }

    /// Mean of `agg` relative to the reference mean of `cmd`.
    pub fn slowdown(&self, cmd: &str, agg: &RuntimeAggregate) -> Option<f64> {
        match self.reference(cmd) {
            Some(rf) if rf.mean > 0.0 => Some(agg.mean / rf.mean),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.as_json()?.into_bytes())
    }

    pub fn restore(body: &[u8]) -> Result<Self> {
        Self::from_json(body)
    }
}

impl JsonLoad for RuntimeStats {
    fn loaded(&mut self) -> Result<()> {
        for app in self.runtimes.values_mut() {
            app.for_each_aggregate_mut(|agg| agg.recompute());
        }
        Ok(())
    }
}

impl JsonSave for RuntimeStats {}
