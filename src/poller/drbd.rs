// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, sync::Arc};

use super::{finish, LoopContext};
use crate::{
    cluster::ClusterEvent,
    drbd::{event::DrbdEvent, DrbdConfig},
    host::{Feed, FeedState, Host},
    parser::{DrbdLineBuffer, DrbdRecord},
    remote::{ExecEvent, ExitKind, DRBD_STATUS},
};

/// Follow the DRBD status of `host` until the loop is stopped.
pub(crate) async fn drbd_status_loop(ctx: LoopContext, host: Arc<Host>) {
    ctx.cluster.set_drbd_status_ok(&host, false);

    while ctx.wait_for_connection(&host).await {
        host.set_feed_state(Feed::Drbd, FeedState::Polling);
        let parsed = poll_once(&ctx, &host).await;
        host.set_feed_state(
            Feed::Drbd,
            if parsed {
                FeedState::ParsedOk
            } else {
                FeedState::ParsedFailed
            },
        );

        if !ctx.pause(ctx.cluster.intervals().drbd_restart()).await {
            break;
        }
    }

    finish(&host, Feed::Drbd);
}

/// One run of the status command. Returns false if any part of its output could not be used.
async fn poll_once(ctx: &LoopContext, host: &Host) -> bool {
    let cluster = &ctx.cluster;
    let mut handle = cluster
        .channel()
        .execute(host, DRBD_STATUS, &HashMap::new());
    let mut lines = DrbdLineBuffer::new();
    let mut no_module = false;
    let mut parsed = true;

    while let Some(event) = ctx.next_event(&mut handle).await {
        let (chunk, exit_code) = match event {
            ExecEvent::Output(chunk) => (chunk, None),
            ExecEvent::Done(rest) => (rest, Some(0)),
            ExecEvent::DoneError { output, exit_code } => (output, Some(exit_code)),
        };

        if !chunk.is_empty() && !no_module {
            lines.push(&chunk);
            let processed = process(ctx, host, &mut lines).await;
            if processed.no_module {
                log::info!("{host}: drbd module is not loaded");
                cluster.set_drbd_status_ok(host, false);
                no_module = true;
            } else if processed.records > 0 {
                cluster.set_drbd_status_ok(host, true);
            }
            if processed.failed {
                parsed = false;
            }
        }

        let Some(exit_code) = exit_code else {
            continue;
        };
        ctx.first_response(host, Feed::Drbd);
        match ExitKind::from_code(exit_code) {
            ExitKind::Success => {}
            ExitKind::Intentional => log::debug!("{host}: drbd status stopped ({exit_code})"),
            ExitKind::ConnectionLost => {
                log::warn!("{host}: drbd status: connection lost?");
                cluster.set_drbd_status_ok(host, false);
                cluster.set_connected(host, false);
                parsed = false;
            }
            ExitKind::Failed => {
                log::debug!("{host}: drbd status failed with exit code {exit_code}");
                cluster.set_drbd_status_ok(host, false);
                parsed = false;
            }
        }
        return parsed;
    }

    false
}

/// What one pass over the line buffer found.
#[derive(Debug, Default)]
struct Processed {
    /// Config and event records handled.
    records: usize,
    failed: bool,
    no_module: bool,
}

/// Apply every complete record in `lines` to the host and the store, in arrival order.
async fn process(ctx: &LoopContext, host: &Host, lines: &mut DrbdLineBuffer) -> Processed {
    let cluster = &ctx.cluster;
    let mut state = host.lock_drbd_status().await;
    let mut result = Processed::default();

    while let Some(record) = lines.next_record() {
        ctx.first_response(host, Feed::Drbd);
        match record {
            DrbdRecord::NoModule => {
                state.clear();
                result.no_module = true;
                return result;
            }
            DrbdRecord::Config(xml) => match DrbdConfig::parse(&xml) {
                Ok(config) => {
                    result.records += 1;
                    let config = Arc::new(config);
                    state.set_config(Arc::clone(&config));
                    if cluster.store().reconcile_drbd(&config, cluster.hosts()) {
                        log::debug!("{host}: drbd resources updated");
                    }
                    cluster.notify(ClusterEvent::DrbdChanged {
                        host: host.name().to_string(),
                    });
                }
                Err(e) => {
                    log::warn!("{host}: could not parse drbd config: {e}");
                    result.failed = true;
                }
            },
            DrbdRecord::Event(line) => {
                result.records += 1;
                match DrbdEvent::parse(&line) {
                    Some(event) => {
                        if state.apply(&event) {
                            cluster.notify(ClusterEvent::DrbdChanged {
                                host: host.name().to_string(),
                            });
                        }
                    }
                    None => log::debug!("{host}: unknown drbd event '{line}'"),
                }
            }
        }
    }

    result
}
