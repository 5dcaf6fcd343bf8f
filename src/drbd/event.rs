// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, sync::Arc};

use super::{DrbdConfig, DEFAULT_VOLUME};

/// A single incremental DRBD state change.
///
/// Two line formats are understood. The short one names the resource (optionally with a volume)
/// followed either by a bare connection state or by `key:value` fields:
///
/// ```text
/// r0 connected
/// r0/0 cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate
/// ```
///
/// The other is the one printed by `drbdsetup events2`:
///
/// ```text
/// change resource name:r0 role:Primary
/// change peer-device name:r0 peer-node-id:1 conn-name:node2 volume:0 peer-disk:UpToDate
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrbdEvent {
    pub resource: String,
    pub volume: Option<String>,
    pub connection: Option<String>,
    pub role: Option<String>,
    pub peer_role: Option<String>,
    pub disk: Option<String>,
    pub peer_disk: Option<String>,
}

fn split_pair(value: &str) -> (Option<String>, Option<String>) {
    match value.split_once('/') {
        Some((local, peer)) => (Some(local.to_string()), Some(peer.to_string())),
        None => (Some(value.to_string()), None),
    }
}

impl DrbdEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let first = fields.next()?;
        match first {
            "exists" | "create" | "change" | "destroy" | "call" | "response" => {
                Self::parse_events2(fields)
            }
            _ => Self::parse_short(first, fields),
        }
    }

    fn parse_short<'a>(target: &str, fields: impl Iterator<Item = &'a str>) -> Option<Self> {
        let mut event = DrbdEvent::default();
        match target.split_once('/') {
            Some((res, vol)) => {
                event.resource = res.to_string();
                event.volume = Some(vol.to_string());
            }
            None => event.resource = target.to_string(),
        }
        if event.resource.is_empty() {
            return None;
        }

        for field in fields {
            match field.split_once(':') {
                Some(("cs", v)) => event.connection = Some(v.to_string()),
                Some(("ro", v)) => (event.role, event.peer_role) = split_pair(v),
                Some(("ds", v)) => (event.disk, event.peer_disk) = split_pair(v),
                Some(_) => {}
                None => event.connection = Some(field.to_string()),
            }
        }
        Some(event)
    }

    fn parse_events2<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<Self> {
        let object = fields.next()?;
        let mut event = DrbdEvent::default();

        for field in fields {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            if key == "name" {
                event.resource = value.to_string();
                continue;
            }
            let value = Some(value.to_string());
            match (object, key) {
                (_, "volume") => event.volume = value,
                (_, "connection") => event.connection = value,
                ("resource", "role") => event.role = value,
                ("connection", "role") => event.peer_role = value,
                ("device", "disk") => event.disk = value,
                ("peer-device", "peer-disk") => event.peer_disk = value,
                _ => {}
            }
        }

        if event.resource.is_empty() {
            None
        } else {
            Some(event)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeState {
    pub disk: Option<String>,
    pub peer_disk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceState {
    pub connection: Option<String>,
    pub role: Option<String>,
    pub peer_role: Option<String>,
    pub volumes: BTreeMap<String, VolumeState>,
}

fn update(slot: &mut Option<String>, value: &Option<String>) -> bool {
    match value {
        Some(v) if slot.as_deref() != Some(v.as_str()) => {
            *slot = Some(v.clone());
            true
        }
        _ => false,
    }
}

/// DRBD status of one host: the latest configuration dump it sent and the state its events
/// reported since then.
#[derive(Debug, Default)]
pub struct HostDrbdState {
    config: Option<Arc<DrbdConfig>>,
    resources: BTreeMap<String, ResourceState>,
}

impl HostDrbdState {
    pub fn config(&self) -> Option<Arc<DrbdConfig>> {
        self.config.clone()
    }

    /// Replace the configuration. State of resources that are not configured anymore is dropped.
    pub fn set_config(&mut self, config: Arc<DrbdConfig>) {
        self.resources.retain(|name, _| config.has_resource(name));
        self.config = Some(config);
    }

    pub fn clear(&mut self) {
        self.config = None;
        self.resources.clear();
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Apply an event to the state. Events for resources missing from the configuration are
    /// ignored. Returns whether anything changed.
    pub fn apply(&mut self, event: &DrbdEvent) -> bool {
        let known = self
            .config
            .as_ref()
            .is_some_and(|c| c.has_resource(&event.resource));
        if !known {
            log::debug!("ignoring drbd event for unknown resource '{}'", event.resource);
            return false;
        }

        let res = self.resources.entry(event.resource.clone()).or_default();
        let mut changed = update(&mut res.connection, &event.connection);
        changed |= update(&mut res.role, &event.role);
        changed |= update(&mut res.peer_role, &event.peer_role);

        if event.disk.is_some() || event.peer_disk.is_some() {
            let vnr = event.volume.as_deref().unwrap_or(DEFAULT_VOLUME);
            let vol = res.volumes.entry(vnr.to_string()).or_default();
            changed |= update(&mut vol.disk, &event.disk);
            changed |= update(&mut vol.peer_disk, &event.peer_disk);
        }
        changed
    }
}
