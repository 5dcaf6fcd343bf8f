// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::{
    cluster::{Cluster, ClusterEvent},
    commands::{Handle, HandledResult},
    poller::Poller,
};

/// Poll every feed of every host and print the changes as they come, until Ctrl-C.
pub async fn monitor(cluster: Arc<Cluster>) -> HandledResult<()> {
    let poller = Poller::new(Arc::clone(&cluster));
    let mut events = cluster.subscribe();
    poller.start_all();

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal.handle_err(|e| eprintln!("Could not wait for Ctrl-C: {e}"));
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&cluster, &event),
                Err(RecvError::Lagged(missed)) => log::warn!("missed {missed} cluster events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    poller.stop_all().await;
    result
}

fn print_event(cluster: &Cluster, event: &ClusterEvent) {
    match event {
        ClusterEvent::Connectivity { host, connected } => {
            println!("{host}: {}", if *connected { "connected" } else { "disconnected" })
        }
        ClusterEvent::DrbdStatusOk { host, ok } => {
            println!("{host}: drbd status {}", if *ok { "ok" } else { "failed" })
        }
        ClusterEvent::CrmStatusOk { host, ok } => {
            println!("{host}: crm status {}", if *ok { "ok" } else { "failed" })
        }
        ClusterEvent::DrbdChanged { host } => {
            let resources = cluster.store().lock_drbd_resources().len();
            println!("{host}: drbd changed, {resources} resources known");
        }
        ClusterEvent::CrmChanged => match cluster.store().declared_dc() {
            Some(dc) => println!("crm status updated, dc is {dc}"),
            None => println!("crm status updated, no dc"),
        },
        ClusterEvent::ServerStatus { host } => log::debug!("{host}: server status updated"),
        ClusterEvent::FeedReady { host, feed } => log::info!("{host}: {feed} ready"),
        ClusterEvent::ProbeFinished => {}
    }
}
