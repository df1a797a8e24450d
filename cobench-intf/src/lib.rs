// Copyright (c) Facebook, Inc. and its affiliates.
use cb_util::*;

pub mod args;
pub mod perf;
pub mod stats;

pub use args::{Args, CommandlineConfig, Mode};
pub use perf::{extract_counters, PerfCounter};
pub use stats::{ApplicationRecord, RuntimeAggregate, RuntimeStats, Sample, NO_CAT_MASK};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
