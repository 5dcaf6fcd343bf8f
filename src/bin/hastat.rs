// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use hastat_lib::commands::{self, Cli};

/// The hastat binary follows the DRBD and CRM status of a cluster.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("HASTAT_LOG", "warn")).init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
