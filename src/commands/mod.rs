// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod dry_run;
pub mod monitor;
pub mod proxy;
pub mod status;
pub mod validate;

use std::sync::Arc;

use {dry_run::DryRunArgs, proxy::ProxyArgs, status::StatusArgs};

use clap::{Parser, Subcommand};

use crate::cluster::Cluster;

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow the cluster and log every change until interrupted.
    Monitor,
    /// Poll the cluster once and print what was found.
    Status(StatusArgs),
    /// Check the configuration file.
    Validate,
    /// Parse a DRBD proxy section and print its settings.
    Proxy(ProxyArgs),
    /// Show what an action would do without applying it.
    DryRun(DryRunArgs),
}

/// Load the cluster named by the command line. Problems are reported where they are found.
fn load_cluster(cli: &Cli) -> HandledResult<Arc<Cluster>> {
    let cluster = Cluster::new(cli.config.as_deref()).handle_err(|_| {})?;
    Ok(Arc::new(cluster))
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Validate => return validate::validate(cli),
        Commands::Proxy(args) => return proxy::proxy(args),
        _ => {}
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        let cluster = load_cluster(cli)?;
        match &cli.command {
            Commands::Monitor => monitor::monitor(cluster).await,
            Commands::Status(args) => status::status(cli, cluster, args).await,
            Commands::DryRun(args) => dry_run::dry_run(cluster, args).await,
            _ => unreachable!(),
        }
    })
}
