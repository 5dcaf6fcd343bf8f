// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The polling loops that keep the cluster model up to date.
//!
//! Every host runs one loop per feed (DRBD status, ping, server status). The CRM status has a
//! single loop for the whole cluster that asks whichever host the DC selector picks. A loop
//! starts a long running status command, feeds its output to the parser, and once the command
//! ends waits a moment and starts it again, until the loop is stopped.
//!
//! Stopping is cooperative: the loop's token is canceled, the running command is asked to stop
//! and the loop exits once the command has ended. [`Poller::stop`] waits for that to happen.

pub mod crm;
pub mod drbd;
pub mod ping;
pub mod server;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::{Cluster, ClusterEvent},
    host::{Feed, FeedState, Host, HostStatus},
    remote::{ExecError, ExecEvent, ExecHandle, ExitKind},
};

/// A one-shot signal: counted down once, waited on by any number of tasks.
#[derive(Debug)]
pub struct Latch {
    done: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            done: watch::channel(false).0,
        }
    }

    /// Returns true only for the call that released the latch.
    pub fn count_down(&self) -> bool {
        self.done.send_if_modified(|done| !std::mem::replace(done, true))
    }

    pub fn is_released(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// What a polling loop works with.
#[derive(Debug, Clone)]
pub(crate) struct LoopContext {
    pub cluster: Arc<Cluster>,
    pub token: CancellationToken,
    pub first_response: Arc<Latch>,
}

impl LoopContext {
    /// Sleep for `duration`. Returns false if the loop was stopped in the meantime.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.token.is_cancelled(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Release the first-response latch, announcing it the first time.
    pub fn first_response(&self, host: &Host, feed: Feed) {
        if self.first_response.count_down() {
            log::info!("{host}: first {feed} response");
            self.cluster.notify(ClusterEvent::FeedReady {
                host: host.name().to_string(),
                feed,
            });
        }
    }

    /// Wait while the host is known to be disconnected. Returns false if the loop was stopped.
    pub async fn wait_for_connection(&self, host: &Host) -> bool {
        while host.get_status() == HostStatus::Down {
            log::debug!("{host}: waiting for the connection");
            if !self.pause(self.cluster.intervals().connect_retry()).await {
                return false;
            }
        }
        !self.is_stopped()
    }

    /// The next event of a running command. When the loop is stopped the command is asked to
    /// end; its completion event still arrives.
    pub async fn next_event(&self, handle: &mut ExecHandle) -> Option<ExecEvent> {
        loop {
            let requested = handle.is_cancel_requested();
            tokio::select! {
                _ = self.token.cancelled(), if !requested => handle.cancel(),
                event = handle.next() => return event,
            }
        }
    }

    /// Run a short command to its end and collect its output, asking it to end early if the
    /// loop is stopped.
    pub async fn collect(&self, mut handle: ExecHandle) -> Result<String, ExecError> {
        let mut output = String::new();
        while let Some(event) = self.next_event(&mut handle).await {
            match event {
                ExecEvent::Output(chunk) => output.push_str(&chunk),
                ExecEvent::Done(rest) => {
                    output.push_str(&rest);
                    return Ok(output);
                }
                ExecEvent::DoneError {
                    output: rest,
                    exit_code,
                } => {
                    output.push_str(&rest);
                    return Err(ExecError::Failed { exit_code, output });
                }
            }
        }
        Err(ExecError::Closed)
    }
}

/// Whether a failed command was ended on purpose, by us or by the status script.
pub(crate) fn is_intentional(error: &ExecError) -> bool {
    matches!(
        error,
        ExecError::Failed { exit_code, .. } if ExitKind::from_code(*exit_code) == ExitKind::Intentional
    )
}

#[derive(Debug)]
struct FeedLoops {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    latches: Vec<Arc<Latch>>,
}

/// Owns the polling loops of a cluster.
#[derive(Debug)]
pub struct Poller {
    cluster: Arc<Cluster>,
    loops: Mutex<HashMap<Feed, FeedLoops>>,
}

impl Poller {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Poller {
            cluster,
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Start the loops of `feed`. Does nothing if they are already running.
    pub fn start(&self, feed: Feed) {
        let mut loops = self.loops.lock().unwrap();
        if loops.contains_key(&feed) {
            return;
        }

        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut latches = Vec::new();
        let mut context = || {
            let latch = Arc::new(Latch::new());
            latches.push(Arc::clone(&latch));
            LoopContext {
                cluster: Arc::clone(&self.cluster),
                token: token.clone(),
                first_response: latch,
            }
        };

        if feed == Feed::Crm {
            tasks.push(tokio::spawn(crm::crm_status_loop(context())));
        } else {
            for host in self.cluster.hosts() {
                let ctx = context();
                let host = Arc::clone(host);
                tasks.push(match feed {
                    Feed::Drbd => tokio::spawn(drbd::drbd_status_loop(ctx, host)),
                    Feed::Ping => tokio::spawn(ping::ping_loop(ctx, host)),
                    Feed::ServerStatus => tokio::spawn(server::server_status_loop(ctx, host)),
                    Feed::Crm => unreachable!(),
                });
            }
        }

        log::debug!("started {feed} polling");
        loops.insert(
            feed,
            FeedLoops {
                token,
                tasks,
                latches,
            },
        );
    }

    pub fn start_all(&self) {
        for feed in Feed::ALL {
            self.start(feed);
        }
    }

    pub fn is_running(&self, feed: Feed) -> bool {
        self.loops.lock().unwrap().contains_key(&feed)
    }

    /// Stop the loops of `feed` and wait until they have ended.
    pub async fn stop(&self, feed: Feed) {
        let loops = self.loops.lock().unwrap().remove(&feed);
        let Some(loops) = loops else {
            return;
        };
        loops.token.cancel();
        for result in future::join_all(loops.tasks).await {
            if let Err(e) = result {
                log::error!("{feed} polling task failed: {e}");
            }
        }
        future::join_all(
            self.cluster
                .hosts()
                .iter()
                .map(|host| host.wait_for_feed_finish(feed)),
        )
        .await;
        log::debug!("stopped {feed} polling");
    }

    pub async fn stop_all(&self) {
        future::join_all(Feed::ALL.map(|feed| self.stop(feed))).await;
    }

    /// Wait until every loop of `feed` got its first response.
    pub async fn wait_ready(&self, feed: Feed) {
        let latches = self
            .loops
            .lock()
            .unwrap()
            .get(&feed)
            .map(|loops| loops.latches.clone())
            .unwrap_or_default();
        for latch in latches {
            latch.wait().await;
        }
    }
}

/// Mark the end of a loop on `host`.
pub(crate) fn finish(host: &Host, feed: Feed) {
    host.set_feed_state(feed, FeedState::Canceled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_releases_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let latch = Arc::new(Latch::new());
            let waiter = {
                let latch = Arc::clone(&latch);
                tokio::spawn(async move { latch.wait().await })
            };

            assert!(!latch.is_released());
            assert!(latch.count_down());
            assert!(!latch.count_down());
            assert!(latch.is_released());
            waiter.await.unwrap();
            latch.wait().await;
        });
    }
}
