// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;

use super::{finish, LoopContext};
use crate::{
    cluster::ClusterEvent,
    crm::ClusterStatus,
    host::{Feed, FeedState, Host, HostStatus},
    parser::CrmRecord,
    remote::{ExecEvent, ExitKind, CRM_STATUS},
};

/// Follow the CRM status of the cluster, always asking the host the DC selector picks, until the
/// loop is stopped.
pub(crate) async fn crm_status_loop(ctx: LoopContext) {
    let cluster = &ctx.cluster;

    while !ctx.is_stopped() {
        let Some(host) = cluster.dc_host() else {
            log::debug!("no host to ask for the crm status");
            if !ctx.pause(cluster.intervals().no_dc_retry()).await {
                break;
            }
            continue;
        };
        if host.get_status() == HostStatus::Down {
            log::debug!("{host}: not connected, not asking for the crm status");
            if !ctx.pause(cluster.intervals().connect_retry()).await {
                break;
            }
            continue;
        }

        host.set_feed_state(Feed::Crm, FeedState::Polling);
        let parsed = poll_once(&ctx, &host).await;
        host.set_feed_state(
            Feed::Crm,
            if parsed {
                FeedState::ParsedOk
            } else {
                FeedState::ParsedFailed
            },
        );

        if !ctx.pause(cluster.intervals().crm_restart()).await {
            break;
        }
    }

    for host in cluster.hosts() {
        finish(host, Feed::Crm);
    }
}

/// One run of the status command on `host`. Returns false if it did not deliver a usable status.
async fn poll_once(ctx: &LoopContext, host: &Host) -> bool {
    let cluster = &ctx.cluster;
    host.lock_crm_status().await.clear();

    let mut handle = cluster.channel().execute(host, CRM_STATUS, &HashMap::new());
    let mut got_output = false;
    let mut parsed = true;

    while let Some(event) = ctx.next_event(&mut handle).await {
        let (chunk, exit_code) = match event {
            ExecEvent::Output(chunk) => (chunk, None),
            ExecEvent::Done(rest) => (rest, Some(0)),
            ExecEvent::DoneError { output, exit_code } => (output, Some(exit_code)),
        };

        if !chunk.is_empty() {
            got_output = true;
            parsed &= process(ctx, host, &chunk).await;
        }

        let Some(exit_code) = exit_code else {
            continue;
        };
        ctx.first_response(host, Feed::Crm);
        match ExitKind::from_code(exit_code) {
            ExitKind::Success if !got_output => {
                log::debug!("{host}: no crm status output");
                cluster.mark_crm_offline(host, false);
                parsed = false;
            }
            ExitKind::Success => {
                let online = cluster
                    .store()
                    .crm_state()
                    .status
                    .as_ref()
                    .is_some_and(|s| s.is_online(host.name()));
                cluster.set_crm_status_ok(host, online);
            }
            ExitKind::Intentional => log::debug!("{host}: crm status stopped ({exit_code})"),
            ExitKind::ConnectionLost => {
                log::warn!("{host}: crm status: connection lost?");
                cluster.set_connected(host, false);
                cluster.mark_crm_offline(host, true);
                parsed = false;
            }
            ExitKind::Failed => {
                log::debug!("{host}: crm status failed with exit code {exit_code}");
                cluster.mark_crm_offline(host, true);
                parsed = false;
            }
        }
        return parsed;
    }

    false
}

/// Feed a chunk to the frame buffer of `host` and apply the frame it completes, if any.
async fn process(ctx: &LoopContext, host: &Host, chunk: &str) -> bool {
    let mut frames = host.lock_crm_status().await;
    frames.push(chunk);

    let mut parsed = true;
    while let Some(record) = frames.next_record() {
        ctx.first_response(host, Feed::Crm);
        parsed &= apply(ctx, host, record);
    }
    parsed
}

fn apply(ctx: &LoopContext, host: &Host, record: CrmRecord) -> bool {
    let cluster = &ctx.cluster;
    match record {
        CrmRecord::Error => {
            log::debug!("{host}: crm status error");
            cluster.mark_crm_offline(host, false);
            false
        }
        CrmRecord::Stopped => {
            log::debug!("{host}: cluster stack is stopped");
            cluster.mark_crm_offline(host, false);
            false
        }
        CrmRecord::Status(frame) => match ClusterStatus::parse_frame(&frame) {
            Ok(status) => {
                let online = status.is_online(host.name());
                if cluster.store().sync_crm_resources(&status) {
                    log::debug!("crm resources updated from {host}");
                }
                cluster.store().set_cluster_status(status);
                cluster.notify(ClusterEvent::CrmChanged);

                if online {
                    cluster.set_crm_status_ok(host, true);
                    cluster.set_crm_status_from_online();
                } else {
                    cluster.set_crm_status_ok(host, false);
                }
                true
            }
            Err(e) => {
                log::warn!("{host}: could not parse crm status: {e}");
                false
            }
        },
    }
}
