// Copyright (c) Facebook, Inc. and its affiliates.
//
// L3 cache allocation through resctrl. Each co-scheduling slot gets its own
// resource group whose cpus are the slot's cpus. The sweep walks the number
// of cache ways given to each slot from isolated to fully shared.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cb_util::*;

pub const CAT_DIR_NAMES: [&str; 2] = ["cobench0", "cobench1"];

lazy_static::lazy_static! {
    static ref CPU_RANGE_RE: regex::Regex = regex::Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap();
}

/// Mask with the lowest `n` bits set.
pub fn set_first_n(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// Mask with the highest `n` of `num_bits` bits set.
pub fn set_last_n(n: u32, num_bits: u32) -> u64 {
    let n = n.min(num_bits);
    set_first_n(n) << (num_bits - n)
}

pub fn full_mask(num_bits: u32) -> u64 {
    set_first_n(num_bits)
}

/// Generate the (slot0, slot1) mask pairs for the sweep. The number of ways
/// goes from `min_bits` to `num_bits - min_bits` in `chunk` steps; one slot
/// takes the ways from the bottom and the other from the top. The last pair
/// always restores full access for both slots. A group needs at least one
/// way, so `min_bits` of 0 is treated as 1.
pub fn generate_masks(
    min_bits: u32,
    num_bits: u32,
    chunk: u32,
    inverse: bool,
) -> Result<Vec<[u64; 2]>> {
    if chunk < 1 {
        bail!("CAT sweep chunk must be at least 1");
    }
    if num_bits == 0 || num_bits > 64 {
        bail!("invalid number of CAT bits {}", num_bits);
    }

    let min_bits = min_bits.max(1);
    let mut masks = vec![];
    if let Some(max_bits) = num_bits.checked_sub(min_bits) {
        let mut bits = min_bits;
        while bits <= max_bits {
            let (low, high) = (set_first_n(bits), set_last_n(bits, num_bits));
            masks.push(if inverse { [high, low] } else { [low, high] });
            bits = match bits.checked_add(chunk) {
                Some(v) => v,
                None => break,
            };
        }
    }

    let full = full_mask(num_bits);
    masks.push([full, full]);
    Ok(masks)
}

pub fn parse_cpu_list(list: &str) -> Result<BTreeSet<u32>> {
    let mut cpus = BTreeSet::new();
    for tok in list.split(',').map(|x| x.trim()).filter(|x| x.len() > 0) {
        let caps = match CPU_RANGE_RE.captures(tok) {
            Some(v) => v,
            None => bail!("invalid cpu list {:?}", list),
        };
        let mut start = caps[1].parse::<u32>()?;
        let mut end = match caps.get(2) {
            Some(v) => v.as_str().parse::<u32>()?,
            None => start,
        };
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        cpus.extend(start..=end);
    }
    if cpus.is_empty() {
        bail!("empty cpu list {:?}", list);
    }
    Ok(cpus)
}

/// Format `cpus` the way resctrl's `cpus` file expects: comma separated
/// 32bit hex words, most significant first.
pub fn format_cpumask(cpus: &BTreeSet<u32>) -> String {
    let nr_words = cpus.iter().next_back().map(|max| *max as usize / 32 + 1).unwrap_or(1);
    let mut words = vec![0u32; nr_words];
    for cpu in cpus.iter() {
        words[*cpu as usize / 32] |= 1 << (cpu % 32);
    }
    words
        .iter()
        .rev()
        .map(|w| format!("{:x}", w))
        .collect::<Vec<String>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatCaps {
    pub min_bits: u32,
    pub num_bits: u32,
}

pub fn read_cat_caps(root: &Path) -> Result<CatCaps> {
    let min_path = root.join("info/L3/min_cbm_bits");
    let mask_path = root.join("info/L3/cbm_mask");

    let min_bits = read_one_line(&min_path)
        .with_context(|| format!("reading {:?}", &min_path))?
        .trim()
        .parse::<u32>()
        .with_context(|| format!("parsing {:?}", &min_path))?;
    let cbm_mask = u64::from_str_radix(
        read_one_line(&mask_path)
            .with_context(|| format!("reading {:?}", &mask_path))?
            .trim(),
        16,
    )
    .with_context(|| format!("parsing {:?}", &mask_path))?;

    Ok(CatCaps {
        min_bits,
        num_bits: cbm_mask.count_ones(),
    })
}

pub struct CatCtl {
    dirs: Vec<PathBuf>,
    caps: CatCaps,
}

impl CatCtl {
    /// Create the per-slot resource groups, bind the slots' cpus and give
    /// both slots the full cache.
    pub fn setup(root: &Path, cpus: &[String; 2]) -> Result<Self> {
        let caps = read_cat_caps(root)?;
        info!(
            "cat: {} cache ways, at least {} per group",
            caps.num_bits, caps.min_bits
        );

        let mut dirs = vec![];
        for (name, cpus) in CAT_DIR_NAMES.iter().zip(cpus.iter()) {
            let dir = root.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("cat: {:?} already exists, reusing", &dir)
                }
                Err(e) => Err(e).with_context(|| format!("creating {:?}", &dir))?,
            }

            let cpumask = format_cpumask(&parse_cpu_list(cpus)?);
            debug!("cat: {:?} cpus={}", &dir, &cpumask);
            fs::write(dir.join("cpus"), cpumask + "\n")
                .with_context(|| format!("writing cpus of {:?}", &dir))?;
            dirs.push(dir);
        }

        let ctl = Self { dirs, caps };
        let full = full_mask(caps.num_bits);
        ctl.write_schemata([full, full])?;
        Ok(ctl)
    }

    pub fn caps(&self) -> CatCaps {
        self.caps
    }

    pub fn dirs(&self) -> Vec<String> {
        self.dirs
            .iter()
            .map(|d| d.to_string_lossy().to_string())
            .collect()
    }

    pub fn write_schemata(&self, masks: [u64; 2]) -> Result<()> {
        for (dir, mask) in self.dirs.iter().zip(masks.iter()) {
            let line = format!("L3:0={:x};1={:x}\n", mask, mask);
            debug!("cat: {:?} schemata={}", dir, line.trim());
            fs::write(dir.join("schemata"), &line)
                .with_context(|| format!("writing schemata of {:?}", dir))?;
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        for dir in self.dirs.iter() {
            fs::remove_dir(dir).with_context(|| format!("removing {:?}", dir))?;
        }
        Ok(())
    }
}
