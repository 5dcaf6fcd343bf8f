// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    cluster::Cluster,
    commands::{Cli, HandledResult},
    host::Feed,
    poller::Poller,
};

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Seconds to wait for the first response of every feed.
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

pub async fn status(cli: &Cli, cluster: Arc<Cluster>, args: &StatusArgs) -> HandledResult<()> {
    let poller = Poller::new(Arc::clone(&cluster));
    poller.start_all();

    let ready = async {
        for feed in Feed::ALL {
            poller.wait_ready(feed).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(args.timeout), ready)
        .await
        .is_err()
    {
        eprintln!("Not every host answered within {} seconds.", args.timeout);
    }
    poller.stop_all().await;

    print_status(&cluster, cli.verbose);
    Ok(())
}

fn flag(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "failed"
    }
}

fn print_status(cluster: &Cluster, verbose: bool) {
    println!("Cluster {}:", cluster.name());
    for host in cluster.hosts() {
        let dc = if cluster.is_real_dc(host) { " (dc)" } else { "" };
        println!(
            "  {host}{dc}: {:?}, drbd {}, crm {}{}",
            host.get_status(),
            flag(host.is_drbd_status_ok()),
            flag(host.is_crm_status_ok()),
            if cluster.is_standby(host) { ", standby" } else { "" },
        );
    }

    if let Some(status) = cluster.store().cluster_status() {
        println!("Resources:");
        for res in status.resources() {
            println!(
                "  {} [{}] {} on {}",
                res.id,
                res.kind,
                res.role.as_deref().unwrap_or("-"),
                res.running_on.join(", ")
            );
            if verbose {
                for (op, params) in &res.operations {
                    let params: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    println!("    {op}: {}", params.join(" "));
                }
            }
        }
    } else if cluster.crm_status_failed() {
        println!("No crm status.");
    }

    let resources = cluster.store().lock_drbd_resources();
    if !resources.is_empty() {
        println!("DRBD:");
    }
    for res in resources.values() {
        for vol in res.volumes.values() {
            let disks: Vec<String> = vol
                .host_disks
                .iter()
                .map(|(host, disk)| format!("{host}:{disk}"))
                .collect();
            println!(
                "  {}/{} {} {}",
                res.name,
                vol.number,
                vol.device.as_deref().unwrap_or("-"),
                disks.join(" ")
            );
        }
        if verbose {
            if let Some(proxy) = &res.proxy {
                for (key, value) in proxy.iter() {
                    println!("    proxy {key} = {value}");
                }
            }
        }
    }
}
