// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::Local;
use log::{error, info, warn};
use std::path::Path;
use std::process::exit;

use cb_util::*;
use cobench_intf::{Args, Mode};

mod bench;
mod cat;
mod commands;
mod cosched;
mod report;
mod runner;

use bench::Bench;
use cat::CatCtl;

fn result_path(args: &Args) -> String {
    match args.result.as_ref() {
        Some(v) => v.clone(),
        None => format!("{}.cobench.json", Local::now().format("%Y-%m-%d-%H-%M-%S")),
    }
}

fn main() {
    setup_prog_state();

    let args = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process arguments ({:#})", &e);
        exit(1);
    });
    if let Err(e) = args.validate() {
        error!("Invalid arguments ({:#})", &e);
        exit(1);
    }

    if args.mode == Mode::Format {
        if let Err(e) = report::format_result_file(&args.format_src) {
            error!("Failed to format {:?} ({:#})", &args.format_src, &e);
            exit(1);
        }
        return;
    }

    let cmds = commands::read_commands(&args.cmd_file).unwrap_or_else(|e| {
        error!("Failed to read commands ({:#})", &e);
        exit(1);
    });
    let cmds = commands::unique_commands(&cmds);
    if cmds.len() < 2 {
        error!("At least two distinct commands are required in {:?}", &args.cmd_file);
        exit(1);
    }

    let cat = if args.cat {
        match CatCtl::setup(Path::new(&args.resctrl_path), &args.cpus) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("Failed to set up CAT ({:#})", &e);
                exit(1);
            }
        }
    } else {
        None
    };

    let result = result_path(&args);
    let mut bench = match Bench::new(args, &cmds, cat) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to prepare the benchmark ({:#})", &e);
            exit(1);
        }
    };

    info!(
        "Running {} commands, {} pairs, {} CAT steps each",
        cmds.len(),
        commands::command_pairs(&cmds).len(),
        bench.masks().len()
    );
    bench.run(&cmds);
    if prog_exiting() {
        warn!("Interrupted, saving partial results");
    }

    let (stats, cat) = bench.into_parts();
    let mut failed = false;
    match stats.save(&result) {
        Ok(()) => info!("Results saved to {:?}", &result),
        Err(e) => {
            error!("Failed to save results to {:?} ({:#})", &result, &e);
            failed = true;
        }
    }
    if let Some(ctl) = cat {
        if let Err(e) = ctl.reset() {
            warn!("Failed to remove CAT groups ({:#})", &e);
        }
    }
    if failed {
        exit(1);
    }
}
