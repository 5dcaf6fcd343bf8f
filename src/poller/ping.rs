// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, sync::Arc};

use super::{finish, is_intentional, LoopContext};
use crate::{
    host::{Feed, FeedState, Host},
    remote::PING,
};

/// Check that `host` can be reached, every `ping` interval, until the loop is stopped. This is
/// the only loop that marks a host connected again after it was lost.
pub(crate) async fn ping_loop(ctx: LoopContext, host: Arc<Host>) {
    let cluster = &ctx.cluster;

    while !ctx.is_stopped() {
        host.set_feed_state(Feed::Ping, FeedState::Polling);
        let handle = cluster.channel().execute(&host, PING, &HashMap::new());
        let state = match ctx.collect(handle).await {
            Ok(_) => {
                cluster.set_connected(&host, true);
                FeedState::ParsedOk
            }
            Err(e) if is_intentional(&e) => FeedState::ParsedOk,
            Err(e) => {
                log::debug!("{host}: ping failed: {e}");
                cluster.set_connected(&host, false);
                FeedState::ParsedFailed
            }
        };
        ctx.first_response(&host, Feed::Ping);
        host.set_feed_state(Feed::Ping, state);

        if !ctx.pause(cluster.intervals().ping()).await {
            break;
        }
    }

    finish(&host, Feed::Ping);
}
