// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{error::Error, sync::Arc};

use tokio::sync::broadcast;

use crate::{
    config::{Config, Intervals, ProbePolicy},
    dc::DcSelector,
    host::{Feed, Host},
    remote::{CommandTemplates, ProcessChannel, RemoteChannel},
    store::ClusterStore,
};

/// Capacity of the event bus. Subscribers that fall further behind miss events.
const EVENT_CAPACITY: usize = 256;

/// Notifications that something changed and the views of the cluster should be refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Connectivity { host: String, connected: bool },
    DrbdStatusOk { host: String, ok: bool },
    CrmStatusOk { host: String, ok: bool },
    /// A host sent a new DRBD configuration, or a DRBD event changed its state.
    DrbdChanged { host: String },
    /// A new CRM status snapshot was stored.
    CrmChanged,
    ServerStatus { host: String },
    /// The first response of a polling loop arrived.
    FeedReady { host: String, feed: Feed },
    ProbeFinished,
}

/// Cluster is the shared state that the pollers and the probe coordinator work on: the hosts,
/// the store holding the model of the cluster, the DC selector and the channel used to reach the
/// hosts.
#[derive(Debug)]
pub struct Cluster {
    name: Option<String>,
    hosts: Vec<Arc<Host>>,
    store: ClusterStore,
    selector: DcSelector,
    channel: Arc<dyn RemoteChannel>,
    intervals: Intervals,
    probe_policy: ProbePolicy,
    events: broadcast::Sender<ClusterEvent>,
}

impl Cluster {
    /// Load the configuration from `path`, or from the default location, and reach the hosts
    /// through the ssh client.
    pub fn new(path: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let path = match path {
            Some(path) => path.to_string(),
            None => crate::default_config_path(),
        };
        let config = std::fs::read_to_string(&path).inspect_err(|e| {
            eprintln!("Could not open config file \"{path}\": {e}");
        })?;
        let config = Config::from_toml(&config).inspect_err(|e| {
            eprintln!("Invalid config file \"{path}\": {e}");
        })?;
        let channel = ProcessChannel::new(
            &crate::default_ssh_binary(),
            CommandTemplates::with_overrides(&config.commands),
        );
        Ok(Self::from_config(&config, Arc::new(channel)))
    }

    pub fn from_config(conf: &Config, channel: Arc<dyn RemoteChannel>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Cluster {
            name: conf.name.clone(),
            hosts: conf
                .hosts
                .iter()
                .map(|h| Arc::new(Host::from_config(h)))
                .collect(),
            store: ClusterStore::new(conf.store),
            selector: DcSelector::new(),
            channel,
            intervals: conf.intervals,
            probe_policy: conf.probe,
            events,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("cluster")
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Get reference to host from host string
    pub fn get_host_by_name(&self, name: &str) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn selector(&self) -> &DcSelector {
        &self.selector
    }

    pub fn channel(&self) -> &Arc<dyn RemoteChannel> {
        &self.channel
    }

    pub fn intervals(&self) -> &Intervals {
        &self.intervals
    }

    pub fn probe_policy(&self) -> &ProbePolicy {
        &self.probe_policy
    }

    pub fn print_summary(&self) {
        println!("Cluster {}:", self.name());
        for host in &self.hosts {
            println!("  {} (port {}, user {})", host.name(), host.port(), host.user());
        }
        let i = &self.intervals;
        println!(
            "Intervals: crm {}s, drbd {}s, ping {}s, server status {}s, no dc {}s, reconnect {}s",
            i.crm_restart, i.drbd_restart, i.ping, i.server_status, i.no_dc_retry, i.connect_retry
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn notify(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    /// The host to ask for the CRM status.
    pub fn dc_host(&self) -> Option<Arc<Host>> {
        let declared = self.store.declared_dc();
        self.selector.select(&self.hosts, declared.as_deref())
    }

    /// The host the CRM status is currently asked from. Unlike [`Cluster::dc_host`] this does not
    /// move the selection on.
    pub fn current_dc_host(&self) -> Option<Arc<Host>> {
        let declared = self.store.declared_dc();
        self.selector.current(&self.hosts, declared.as_deref())
    }

    /// Whether `host` is the DC the CRM itself declared, as opposed to a fallback choice.
    pub fn is_real_dc(&self, host: &Host) -> bool {
        self.selector.is_real_dc(host)
    }

    /// True when no host has a working CRM status.
    pub fn crm_status_failed(&self) -> bool {
        !self.hosts.iter().any(|h| h.is_crm_status_ok())
    }

    pub fn is_standby(&self, host: &Host) -> bool {
        self.store
            .crm_state()
            .status
            .as_ref()
            .is_some_and(|s| s.is_standby(host.name()))
    }

    pub fn set_connected(&self, host: &Host, connected: bool) {
        if host.set_connected(connected) {
            log::info!(
                "{host} is {}",
                if connected { "connected" } else { "disconnected" }
            );
            self.notify(ClusterEvent::Connectivity {
                host: host.name().to_string(),
                connected,
            });
        }
    }

    pub fn set_drbd_status_ok(&self, host: &Host, ok: bool) {
        if host.set_drbd_status_ok(ok) {
            log::debug!("{host}: drbd status ok: {ok}");
            self.notify(ClusterEvent::DrbdStatusOk {
                host: host.name().to_string(),
                ok,
            });
        }
    }

    pub fn set_crm_status_ok(&self, host: &Host, ok: bool) {
        if host.set_crm_status_ok(ok) {
            log::debug!("{host}: crm status ok: {ok}");
            self.notify(ClusterEvent::CrmStatusOk {
                host: host.name().to_string(),
                ok,
            });
        }
    }

    /// Make the CRM status flag of every host mirror whether the current snapshot reports it
    /// online.
    pub fn set_crm_status_from_online(&self) {
        let online: Vec<bool> = {
            let crm = self.store.crm_state();
            self.hosts
                .iter()
                .map(|h| crm.status.as_ref().is_some_and(|s| s.is_online(h.name())))
                .collect()
        };
        for (host, online) in self.hosts.iter().zip(online) {
            self.set_crm_status_ok(host, online);
        }
    }

    /// Record that the CRM status of `host` could not be obtained: the host is offline in the
    /// current snapshot and its CRM status flag is cleared. With `forget_dc` the declared DC is
    /// dropped as well so that the next DC selection does not insist on it.
    pub fn mark_crm_offline(&self, host: &Host, forget_dc: bool) {
        {
            let mut crm = self.store.crm_state_mut();
            if let Some(status) = crm.status.as_mut() {
                status.set_online(host.name(), false);
                if forget_dc {
                    status.set_dc(None);
                }
            }
        }
        self.set_crm_status_ok(host, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crm::status::tests::STATUS_FRAME, crm::ClusterStatus, test_env::ScriptedChannel};

    fn two_nodes() -> Cluster {
        let conf = Config::from_toml(
            r#"
            [[hosts]]
            hostname = "node1"
            [[hosts]]
            hostname = "node2:2222"
            user = "admin"
            "#,
        )
        .unwrap();
        Cluster::from_config(&conf, Arc::new(ScriptedChannel::new()))
    }

    #[test]
    fn build_from_config() {
        let cluster = two_nodes();
        assert_eq!(cluster.hosts().len(), 2);
        assert_eq!(cluster.get_host_by_name("node2").unwrap().port(), 2222);
        assert!(cluster.get_host_by_name("node3").is_none());
        assert!(cluster.crm_status_failed());
    }

    #[test]
    fn crm_flags_follow_online_nodes() {
        let cluster = two_nodes();
        let mut events = cluster.subscribe();
        cluster
            .store()
            .set_cluster_status(ClusterStatus::parse_frame(STATUS_FRAME).unwrap());

        cluster.set_crm_status_from_online();
        assert!(cluster.hosts()[0].is_crm_status_ok());
        assert!(!cluster.hosts()[1].is_crm_status_ok());
        assert!(!cluster.crm_status_failed());
        assert!(cluster.is_standby(&cluster.hosts()[1]));
        assert_eq!(
            events.try_recv().unwrap(),
            ClusterEvent::CrmStatusOk {
                host: "node1".to_string(),
                ok: true
            }
        );
        assert!(events.try_recv().is_err());

        cluster.mark_crm_offline(&cluster.hosts()[0], true);
        assert!(cluster.crm_status_failed());
        assert_eq!(cluster.store().declared_dc(), None);
    }
}
