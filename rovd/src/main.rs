// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::cli::{Cli, Commands, FeedArgs, OracleArgs, RunArgs, StoreArgs};
use crate::daemon::{
    open_store, pump_stdin, start_feed, start_validators, Persistence,
    WORK_QUEUE,
};
use crate::log::rovd_log;
use anyhow::{Context, Result};
use clap::Parser;
use feed::FeedLine;
use rov::{Coordinator, PipelineItem, Validator, Work};
use rov_common::log::build_logger;
use rov_common::Shutdown;
use slog::Logger;
use std::io::Write;
use std::sync::mpsc;

mod cli;
mod daemon;
mod log;

pub const COMPONENT_ROVD: &str = "rovd";
pub const MOD_DAEMON: &str = "daemon";

const UNIT: &str = "main";

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Stdout carries pipeline lines, so logs go to stderr.
    let log = build_logger(std::io::stderr(), cli.log_level);
    match cli.command {
        Commands::Run(args) => run(args, log),
        Commands::Parse(args) => parse(args, log),
        Commands::Validate(args) => validate(args, log),
        Commands::Store(args) => store(args, log),
    }
}

/// Feed, validation and storage in one process.
fn run(args: RunArgs, log: Logger) -> Result<()> {
    rovd_log!(log, info, "starting route origin validation pipeline");
    let shutdown = Shutdown::new();
    let store = open_store(&args.store, &log)?;
    let coordinator =
        Coordinator::new(args.store.coordinator_config(), log.clone());
    let persistence =
        Persistence::start(store, coordinator.clone(), &args.store, &log)?;
    let (dispatcher, validators) =
        start_validators(&args.oracle, &coordinator, &log)?;

    {
        let shutdown = shutdown.clone();
        let coordinator = coordinator.clone();
        let log = log.clone();
        ctrlc::set_handler(move || {
            rovd_log!(log, info, "shutdown requested");
            shutdown.trigger();
            coordinator.send(PipelineItem::Stop);
        })
        .context("install signal handler")?;
    }

    let readers =
        start_feed(&args.feed, &shutdown, move |e| dispatcher.dispatch(e), &log)?;

    // Readers end on shutdown or end of input. Dropping their dispatchers
    // disconnects the validators, which drain and exit.
    for thread in readers.into_iter().chain(validators) {
        let name = thread.name().to_string();
        if !thread.join() {
            rovd_log!(log, error, "{name} panicked");
        }
    }
    coordinator.send(PipelineItem::Stop);
    persistence.finish();
    rovd_log!(log, info, "pipeline stopped");
    Ok(())
}

/// Feed only: route event lines on stdout.
fn parse(args: FeedArgs, log: Logger) -> Result<()> {
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger())
            .context("install signal handler")?;
    }

    let (tx, rx) = mpsc::sync_channel(WORK_QUEUE);
    let readers =
        start_feed(&args, &shutdown, move |e| tx.send(e).is_ok(), &log)?;

    let mut out = std::io::stdout().lock();
    for event in rx {
        let line = match FeedLine::Event(event).to_line() {
            Ok(line) => line,
            Err(e) => {
                rovd_log!(log, warn, "event not encodable: {e}");
                continue;
            }
        };
        if let Err(e) = writeln!(out, "{line}") {
            rovd_log!(log, error, "stdout closed: {e}");
            shutdown.trigger();
            break;
        }
    }
    for reader in readers {
        reader.join();
    }
    writeln!(out, "{}", FeedLine::Stop.to_line()?).context("write stop")?;
    Ok(())
}

/// Validation only: route event lines in, pipeline lines out.
fn validate(args: OracleArgs, log: Logger) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(WORK_QUEUE);
    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(Work::Stop);
        })
        .context("install signal handler")?;
    }

    let input = log.clone();
    let stop = tx.clone();
    pump_stdin(
        move |line| match FeedLine::parse_line(line) {
            Ok(FeedLine::Event(e)) => tx.send(Work::Event(e)).is_ok(),
            Ok(FeedLine::Stop) => {
                let _ = tx.send(Work::Stop);
                false
            }
            Err(e) => {
                rovd_log!(input, warn, "malformed route event dropped: {e}");
                true
            }
        },
        move || {
            let _ = stop.send(Work::Stop);
        },
        &log,
    )?;

    let mut out = std::io::stdout().lock();
    let validator = Validator::new(args.config(), log.clone());
    let stats = validator.run(rx, |item| match item.to_line() {
        Ok(line) => writeln!(out, "{line}").is_ok(),
        Err(e) => {
            rovd_log!(log, warn, "pipeline message not encodable: {e}");
            true
        }
    });
    out.flush().context("flush stdout")?;
    rovd_log!(log, info, "validation finished";
        "validated" => stats.validated,
        "errors" => stats.errors
    );
    Ok(())
}

/// Storage only: pipeline lines in.
fn store(args: StoreArgs, log: Logger) -> Result<()> {
    let store = open_store(&args, &log)?;
    let coordinator = Coordinator::new(args.coordinator_config(), log.clone());
    let persistence =
        Persistence::start(store, coordinator.clone(), &args, &log)?;

    {
        let coordinator = coordinator.clone();
        ctrlc::set_handler(move || {
            coordinator.send(PipelineItem::Stop);
        })
        .context("install signal handler")?;
    }

    let input = log.clone();
    let c = coordinator.clone();
    pump_stdin(
        move |line| match PipelineItem::parse_line(line) {
            Ok(PipelineItem::Stop) => {
                c.send(PipelineItem::Stop);
                false
            }
            Ok(item) => c.send(item),
            Err(e) => {
                rovd_log!(input, warn, "malformed pipeline line dropped: {e}");
                true
            }
        },
        move || {
            coordinator.send(PipelineItem::Stop);
        },
        &log,
    )?;

    persistence.finish();
    Ok(())
}
