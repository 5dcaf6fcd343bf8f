// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Config, along with its children, is the model for a monitored DRBD / Pacemaker cluster as
/// written in the configuration file. The config file is deserialized into a Config object.
///
/// The model used in the config file is intentionally different from the model used to track
/// the status of the cluster in memory (see `store` and `host`). Since they are decoupled, the
/// dynamic model can be changed without needing to change the configuration file format.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    /// Name of the cluster, only used for log messages.
    #[serde(default)]
    pub name: Option<String>,

    pub hosts: Vec<Host>,

    #[serde(default)]
    pub intervals: Intervals,

    /// Command templates, keyed by template id. Entries here override the built-in defaults.
    #[serde(default)]
    pub commands: HashMap<String, String>,

    #[serde(default)]
    pub store: StorePolicy,

    #[serde(default)]
    pub probe: ProbePolicy,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a Host to the given Cluster.
    pub fn add_host(&mut self, h: Host) {
        self.hosts.push(h);
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Host {
    /// Either "<address>" or "<address>:<port>".
    pub hostname: String,

    /// The remote user to log in as. Defaults to root.
    #[serde(default)]
    pub user: Option<String>,
}

/// Delays used by the polling loops, in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct Intervals {
    /// Sleep between two CRM status commands.
    pub crm_restart: u64,
    /// Sleep between two DRBD status commands.
    pub drbd_restart: u64,
    pub ping: u64,
    pub server_status: u64,
    /// Sleep when no host can be asked for the CRM status.
    pub no_dc_retry: u64,
    /// Sleep while waiting for the first host to connect.
    pub connect_retry: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            crm_restart: 5,
            drbd_restart: 10,
            ping: 10,
            server_status: 10,
            no_dc_retry: 5,
            connect_retry: 30,
        }
    }
}

impl Intervals {
    pub fn crm_restart(&self) -> Duration {
        Duration::from_secs(self.crm_restart)
    }

    pub fn drbd_restart(&self) -> Duration {
        Duration::from_secs(self.drbd_restart)
    }

    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping)
    }

    pub fn server_status(&self) -> Duration {
        Duration::from_secs(self.server_status)
    }

    pub fn no_dc_retry(&self) -> Duration {
        Duration::from_secs(self.no_dc_retry)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(default)]
pub struct StorePolicy {
    /// Remove DRBD volumes that are no longer reported, right when a new configuration dump is
    /// reconciled. When false, stale entries are kept so that transient gaps in the disk mapping
    /// do not tear down resources.
    pub prune_stale_drbd: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct ProbePolicy {
    /// Run CRM dry-run probes on the DC host when the caller does not name a host.
    pub crm_probe_on_dc: bool,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            crm_probe_on_dc: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config = Config::from_toml(
            r#"
            [[hosts]]
            hostname = "node1"

            [[hosts]]
            hostname = "node2:2222"
            user = "admin"
            "#,
        )
        .unwrap();

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].user.as_deref(), Some("admin"));
        assert_eq!(config.intervals.crm_restart(), Duration::from_secs(5));
        assert!(!config.store.prune_stale_drbd);
        assert!(config.probe.crm_probe_on_dc);
    }

    #[test]
    fn parse_overrides() {
        let config = Config::from_toml(
            r#"
            name = "pair"
            hosts = [{ hostname = "a" }, { hostname = "b" }]

            [intervals]
            drbd_restart = 3

            [commands]
            Ping = "true"

            [store]
            prune_stale_drbd = true
            "#,
        )
        .unwrap();

        assert_eq!(config.name.as_deref(), Some("pair"));
        assert_eq!(config.intervals.drbd_restart(), Duration::from_secs(3));
        assert_eq!(config.intervals.ping(), Duration::from_secs(10));
        assert_eq!(config.commands.get("Ping").map(String::as_str), Some("true"));
        assert!(config.store.prune_stale_drbd);
    }
}
