// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use clap::{Args, Subcommand};

use crate::{
    cluster::Cluster,
    commands::{Handle, HandledResult},
    probe::{ProbeAction, ProbeCoordinator},
};

#[derive(Args, Debug, Clone)]
pub struct DryRunArgs {
    #[command(subcommand)]
    target: DryRunTarget,
}

#[derive(Subcommand, Debug, Clone)]
enum DryRunTarget {
    /// Simulate the cluster's next transition, after running an optional command in test mode.
    Crm {
        /// Host to simulate on; the DC by default.
        #[arg(long)]
        host: Option<String>,

        /// Command template to run first.
        #[arg(long)]
        command: Option<String>,

        /// Placeholder values for the command, as NAME=VALUE.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Show what drbdadm would do for an action on a resource.
    Drbd {
        action: String,
        resource: String,

        /// Hosts to run on; every host by default.
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("'{s}' is not NAME=VALUE"))
}

pub async fn dry_run(cluster: Arc<Cluster>, args: &DryRunArgs) -> HandledResult<()> {
    let probes = ProbeCoordinator::new(cluster);

    match &args.target {
        DryRunTarget::Crm {
            host,
            command,
            vars,
        } => {
            let action = command.as_deref().map(|command| {
                vars.iter()
                    .fold(ProbeAction::new(command), |action, (k, v)| action.var(k, v))
            });
            let ptest = probes
                .crm_probe(host.as_deref(), action)
                .wait()
                .await
                .handle_err(|e| eprintln!("Dry run failed: {e}"))?;
            println!("{}", ptest.summary());
        }
        DryRunTarget::Drbd {
            action,
            resource,
            hosts,
        } => {
            let hosts = if hosts.is_empty() {
                None
            } else {
                Some(hosts.clone())
            };
            let data = probes
                .drbd_probe(hosts, action, resource)
                .wait()
                .await
                .handle_err(|e| eprintln!("Dry run failed: {e}"))?;
            println!("{}", data.summary());
        }
    }

    Ok(())
}
