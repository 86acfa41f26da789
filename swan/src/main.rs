// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{error, info, warn};
use std::process::exit;
use std::sync::Arc;

use swan_intf::{EX_OK, EX_SOFTWARE};
use swan_util::conf::{self, Flag, ParsedArgs};
use swan_util::*;

mod error;
mod executor;
mod experiment;
mod isolation;
mod loadgen;
mod metadata;
mod parse;
mod phase;
mod platform;
mod telemetry;
mod workloads;

use error::{exit_code_of, SwanError};
use experiment::{Experiment, ExperimentConfig, ExperimentParts};
use metadata::{FileStore, MetadataStoreRef};

lazy_static::lazy_static! {
    static ref LOG_LEVEL: Flag<String> = conf::string_flag(
        "log_level",
        "One of error, warn, info, debug and trace. Overrides -v",
        "info",
    );
}

fn register_flags() {
    lazy_static::initialize(&LOG_LEVEL);
    isolation::register_flags();
    executor::register_flags();
    workloads::register_flags();
    loadgen::register_flags();
    telemetry::register_flags();
    metadata::register_flags();
    experiment::register_flags();
}

/// Registers and parses every flag. Any failure is a usage error.
fn parse_flags<I, T>(args: I) -> Result<ParsedArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    register_flags();
    conf::parse_args("swan", args).map_err(|e| SwanError::Config(format!("{:#}", &e)).into())
}

fn run() -> Result<()> {
    let cfg = ExperimentConfig::from_flags()?;
    let parts = ExperimentParts::from_flags()?;

    let exp = Experiment::create(cfg, parts)?;
    println!("{}", &exp.id);

    let store: MetadataStoreRef = Arc::new(FileStore::open_from_flags()?);
    let mut exp = exp.with_store(store);
    exp.record_metadata(
        platform::facts(telemetry::collector_path().as_deref()),
        metadata::environ_from_flags(),
        conf::values(),
    )?;

    let res = exp.run();
    match exp.save_record() {
        Ok(()) => info!("swan: Results saved in {:?}", exp.record_path()),
        Err(e) => warn!("swan: Failed to save the experiment record ({:#})", &e),
    }
    res
}

fn main() {
    let parsed = match parse_flags(std::env::args_os()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("swan: {:#}", &e);
            exit(exit_code_of(&e));
        }
    };

    if parsed.config_dump {
        print!("{}", conf::dump());
        exit(EX_OK);
    }

    let level_name = match LOG_LEVEL.is_set() {
        true => Some(LOG_LEVEL.value()),
        false => None,
    };
    let level = match log_level_from(parsed.verbosity, level_name.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            let e: anyhow::Error = SwanError::Config(format!("{:#}", &e)).into();
            eprintln!("swan: {:#}", &e);
            exit(exit_code_of(&e));
        }
    };
    init_logging(level);

    if let Err(e) = setup_prog_state() {
        error!("swan: {:#}", &e);
        exit(EX_SOFTWARE);
    }

    let code = match run() {
        Ok(()) => EX_OK,
        Err(e) => {
            error!("swan: {:#}", &e);
            exit_code_of(&e)
        }
    };
    flush_logging();
    exit(code);
}
