// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use tokio::sync::{watch, MutexGuard};

use crate::{drbd::HostDrbdState, parser::CrmFrameBuffer};

#[derive(Debug, Clone)]
struct HostAddress {
    name: String,
    port: u16,
    user: Option<String>,
}

/// Whether the host can be reached over its remote execution channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

/// The cluster communication layers that a CRM can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStack {
    Heartbeat,
    Corosync,
    Openais,
}

/// State of a single system service as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    Stopping,
    #[default]
    Unknown,
}

impl From<&str> for ServiceState {
    fn from(s: &str) -> Self {
        match s {
            "running" | "on" => Self::Running,
            "stopped" | "off" => Self::Stopped,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            _ => Self::Unknown,
        }
    }
}

/// The cluster stack services of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackState {
    pub heartbeat: ServiceState,
    pub corosync: ServiceState,
    pub openais: ServiceState,
    pub pacemaker: ServiceState,
}

impl StackState {
    /// The communication layer running on the host, if any.
    pub fn running_stack(&self) -> Option<ClusterStack> {
        if self.heartbeat == ServiceState::Running {
            Some(ClusterStack::Heartbeat)
        } else if self.corosync == ServiceState::Running {
            Some(ClusterStack::Corosync)
        } else if self.openais == ServiceState::Running {
            Some(ClusterStack::Openais)
        } else {
            None
        }
    }

    /// Whether any communication layer is being started or stopped.
    pub fn is_transitioning(&self) -> bool {
        [self.heartbeat, self.corosync, self.openais]
            .iter()
            .any(|s| matches!(s, ServiceState::Starting | ServiceState::Stopping))
    }
}

/// The status feeds polled on every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feed {
    Drbd,
    Crm,
    Ping,
    ServerStatus,
}

impl Feed {
    pub const ALL: [Feed; 4] = [Feed::Drbd, Feed::Crm, Feed::Ping, Feed::ServerStatus];

    fn index(self) -> usize {
        match self {
            Feed::Drbd => 0,
            Feed::Crm => 1,
            Feed::Ping => 2,
            Feed::ServerStatus => 3,
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Feed::Drbd => "drbd status",
                Feed::Crm => "crm status",
                Feed::Ping => "ping",
                Feed::ServerStatus => "server status",
            }
        )
    }
}

/// Where the polling loop of one feed on one host is.
///
/// `Idle -> Polling -> (ParsedOk | ParsedFailed) -> Polling -> ... -> Canceled`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Polling,
    ParsedOk,
    ParsedFailed,
    Canceled,
}

/// A cluster member whose DRBD and CRM status is being followed.
#[derive(Debug)]
pub struct Host {
    address: HostAddress,
    status: Mutex<HostStatus>,
    stack: Mutex<StackState>,
    block_devices: Mutex<BTreeSet<String>>,

    drbd_status_ok: AtomicBool,
    crm_status_ok: AtomicBool,

    /// Held while DRBD status of this host is mutated: configuration dumps are parsed and events
    /// are applied under it.
    drbd_status: tokio::sync::Mutex<HostDrbdState>,

    /// Held while CRM status output of this host is parsed, and by dry-run probes on this host so
    /// that probe output never interleaves with the live status.
    crm_status: tokio::sync::Mutex<CrmFrameBuffer>,

    feeds: [watch::Sender<FeedState>; 4],
}

impl Host {
    pub fn new(name: &str, port: Option<u16>, user: Option<String>) -> Self {
        Host {
            address: HostAddress {
                name: name.to_string(),
                port: match port {
                    Some(p) => p,
                    None => crate::remote_port(),
                },
                user,
            },
            status: Mutex::new(HostStatus::Unknown),
            stack: Mutex::new(StackState::default()),
            block_devices: Mutex::new(BTreeSet::new()),
            drbd_status_ok: AtomicBool::new(false),
            crm_status_ok: AtomicBool::new(false),
            drbd_status: tokio::sync::Mutex::new(HostDrbdState::default()),
            crm_status: tokio::sync::Mutex::new(CrmFrameBuffer::new()),
            feeds: Feed::ALL.map(|_| watch::channel(FeedState::Idle).0),
        }
    }

    /// Create a Host object from a given config::Host object.
    pub fn from_config(config: &crate::config::Host) -> Self {
        let (name, port) = Self::get_host_port(&config.hostname);
        Host::new(name, port, config.user.clone())
    }

    /// Given a string that may be of the form "<address>:<port number>", split it out into the
    /// address and port number portions.
    fn get_host_port(host_str: &str) -> (&str, Option<u16>) {
        match host_str.split_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(e) => {
                    log::warn!("ignoring invalid port in '{host_str}': {e}");
                    (host, None)
                }
            },
            None => (host_str, None),
        }
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn user(&self) -> &str {
        self.address.user.as_deref().unwrap_or("root")
    }

    /// The login destination for the remote execution channel.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user(), self.name())
    }

    pub fn get_status(&self) -> HostStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.get_status() == HostStatus::Up
    }

    /// Returns whether the connectivity state changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        let new = if connected {
            HostStatus::Up
        } else {
            HostStatus::Down
        };
        let mut status = self.status.lock().unwrap();
        let changed = *status != new;
        *status = new;
        changed
    }

    pub fn stack(&self) -> StackState {
        *self.stack.lock().unwrap()
    }

    pub fn set_stack(&self, stack: StackState) {
        *self.stack.lock().unwrap() = stack;
    }

    /// Whether a recognized cluster communication layer is running on the host.
    pub fn is_stack_running(&self) -> bool {
        self.stack().running_stack().is_some()
    }

    pub fn set_block_devices(&self, devices: BTreeSet<String>) {
        *self.block_devices.lock().unwrap() = devices;
    }

    pub fn has_block_device(&self, device: &str) -> bool {
        self.block_devices.lock().unwrap().contains(device)
    }

    pub fn is_drbd_status_ok(&self) -> bool {
        self.drbd_status_ok.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub fn set_drbd_status_ok(&self, ok: bool) -> bool {
        self.drbd_status_ok.swap(ok, Ordering::SeqCst) != ok
    }

    pub fn is_crm_status_ok(&self) -> bool {
        self.crm_status_ok.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub fn set_crm_status_ok(&self, ok: bool) -> bool {
        self.crm_status_ok.swap(ok, Ordering::SeqCst) != ok
    }

    pub async fn lock_drbd_status(&self) -> MutexGuard<'_, HostDrbdState> {
        self.drbd_status.lock().await
    }

    pub async fn lock_crm_status(&self) -> MutexGuard<'_, CrmFrameBuffer> {
        self.crm_status.lock().await
    }

    pub fn feed_state(&self, feed: Feed) -> FeedState {
        *self.feeds[feed.index()].borrow()
    }

    pub fn set_feed_state(&self, feed: Feed, state: FeedState) {
        let old = self.feeds[feed.index()].send_replace(state);
        if old != state {
            log::debug!("{feed} on {}: {old:?} -> {state:?}", self.name());
        }
    }

    /// Wait until the polling loop of `feed` on this host is not running anymore.
    pub async fn wait_for_feed_finish(&self, feed: Feed) {
        let mut rx = self.feeds[feed.index()].subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, FeedState::Idle | FeedState::Canceled))
            .await;
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_split() {
        let host = Host::from_config(&crate::config::Host {
            hostname: "node1:2222".to_string(),
            user: None,
        });
        assert_eq!(host.name(), "node1");
        assert_eq!(host.port(), 2222);
        assert_eq!(host.destination(), "root@node1");

        let host = Host::new("node2", Some(22), Some("admin".to_string()));
        assert_eq!(host.destination(), "admin@node2");
    }

    #[test]
    fn flag_setters_report_changes() {
        let host = Host::new("node1", Some(22), None);
        assert!(!host.is_crm_status_ok());
        assert!(host.set_crm_status_ok(true));
        assert!(!host.set_crm_status_ok(true));
        assert!(host.set_crm_status_ok(false));

        assert!(host.set_connected(true));
        assert!(!host.set_connected(true));
        assert!(host.is_connected());
    }

    #[test]
    fn feed_finish_signal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let host = std::sync::Arc::new(Host::new("node1", Some(22), None));
            host.set_feed_state(Feed::Drbd, FeedState::Polling);

            let waiter = {
                let host = std::sync::Arc::clone(&host);
                tokio::spawn(async move { host.wait_for_feed_finish(Feed::Drbd).await })
            };
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());

            host.set_feed_state(Feed::Drbd, FeedState::Canceled);
            waiter.await.unwrap();
            assert_eq!(host.feed_state(Feed::Drbd), FeedState::Canceled);
        });
    }
}
