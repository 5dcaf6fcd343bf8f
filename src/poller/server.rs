// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, sync::Arc};

use super::{finish, is_intentional, LoopContext};
use crate::{
    cluster::ClusterEvent,
    host::{Feed, FeedState, Host},
    parser::HwInfo,
    remote::HW_INFO,
};

/// Refresh the block devices, cluster stack state and VMs of `host` every `server_status`
/// interval, until the loop is stopped.
pub(crate) async fn server_status_loop(ctx: LoopContext, host: Arc<Host>) {
    let cluster = &ctx.cluster;

    while ctx.wait_for_connection(&host).await {
        host.set_feed_state(Feed::ServerStatus, FeedState::Polling);
        let handle = cluster.channel().execute(&host, HW_INFO, &HashMap::new());
        let state = match ctx.collect(handle).await {
            Ok(output) => {
                let info = HwInfo::parse(&output);
                host.set_block_devices(info.block_devices);
                host.set_stack(info.stack);
                cluster.store().set_vms(host.name(), info.vms);
                cluster.notify(ClusterEvent::ServerStatus {
                    host: host.name().to_string(),
                });
                FeedState::ParsedOk
            }
            Err(e) if is_intentional(&e) => FeedState::ParsedOk,
            Err(e) => {
                log::debug!("{host}: hw info failed: {e}");
                FeedState::ParsedFailed
            }
        };
        ctx.first_response(&host, Feed::ServerStatus);
        host.set_feed_state(Feed::ServerStatus, state);

        if !ctx.pause(cluster.intervals().server_status()).await {
            break;
        }
    }

    finish(&host, Feed::ServerStatus);
}
