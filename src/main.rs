#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::result_map_unit_fn,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used,
    clippy::used_underscore_binding,
    clippy::used_underscore_items
)]

mod actions;
mod config;
mod error;
mod launch;
mod logger;
mod loopdev;
mod mounts;
mod namespace;
mod privilege;
mod supervisor;
mod templates;
mod types;
mod util;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::CompleteEnv;
use config::{cli, resolve_config};

use error::{EXIT_ABORT, Error, exit_code_for};
use log::{Log, error};
use logger::LaunchLogger;
use nix::unistd::geteuid;
use privilege::Governor;
use serde_json::Value;
use util::{
    print_json_output, resolve_invoker, set_json_output,
    set_should_print_output,
};

use clap::Parser;

pub fn main() {
    let logger = match LaunchLogger::new(log::LevelFilter::Info).init() {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("ABORT: Failed to initialize logger: {}", e);
            std::process::exit(EXIT_ABORT);
        }
    };

    let code = match run(logger) {
        Ok(code) => code,
        Err(e) => {
            // We may have failed before the config was loaded, in which case
            // everything logged so far is still held back.
            logger.print_deferred();
            error!("ABORT: {:#}", e);
            exit_code_for(&e)
        }
    };
    logger.flush();
    std::process::exit(code);
}

fn run(logger: &LaunchLogger) -> Result<i32> {
    // Stop being root before anything else, going by the real ids alone.
    // Only then do we look at the environment to find out who invoked us.
    let privileged = geteuid().is_root();
    let governor = Governor::for_real_ids().context("Reading process ids")?;
    if privileged {
        governor.restrict()?;
    }

    let cli: cli::Args = cli::Args::parse();
    if let Some(log_level) = cli.log_level {
        logger.set_level(log_level);
    }

    let invoker = resolve_invoker().context("Resolving invoking user")?;
    let governor = if privileged {
        governor.hand_over(&invoker)?
    } else {
        governor
    };

    // This is tab completion stuff. This function will not return if there
    // is tab completion requested.
    if std::env::var("COMPLETE").is_ok() {
        CompleteEnv::with_factory(cli::Args::command).complete();
        return Ok(0);
    }

    let json = cli.json;
    let action = cli.action.clone();
    let config = resolve_config(cli);

    // Now that we've loaded the config, we can set the log level and print
    // out any deferred messages emitted while we were loading it.
    if let Ok(config) = &config {
        logger.set_level(config.log_level);
    }
    logger.print_deferred();
    let config = config.context("Resolving config")?;

    set_should_print_output(!json);

    // Handle the action if one was specified
    if let Some(action) = action {
        let result = match action {
            cli::Action::Config { keys } => actions::config(&config, keys),
        };
        if json {
            if let Err(e) = &result {
                set_json_output("status", &Value::String("error".to_string()));
                set_json_output("error", &Value::String(e.to_string()));
            } else {
                set_json_output(
                    "status",
                    &Value::String("success".to_string()),
                );
            }
            print_json_output()?;
        }
        logger.flush();
        return result.map(|()| 0);
    }

    // Ensure we were started as root
    if !privileged {
        return Err(Error::NotPrivileged.into());
    }

    launch::launch(&config, &invoker, &governor)
}
