// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::{load_cluster, Cli, HandledResult};

pub fn validate(args: &Cli) -> HandledResult<()> {
    let cluster = load_cluster(args)?;

    cluster.print_summary();

    Ok(())
}
