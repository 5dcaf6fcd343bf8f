// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The in-memory model of the cluster that the status pollers keep up to date.
//!
//! Every map has its own lock and is reached through an accessor returning a guard, so a caller
//! holds the lock for exactly as long as it keeps the guard. When more than one map is needed
//! for a single update the locks are taken in this order:
//!
//! name-to-service -> DRBD resources -> DRBD devices -> CRM ids
//!
//! The VM map and the CRM snapshot are never locked together with another map. The per-host
//! status locks in [`Host`] are always taken before any lock of this module.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use regex::Regex;

use crate::{
    config::StorePolicy,
    crm::{ClusterStatus, CrmResource, DrbdTestData, PtestData},
    drbd::{DrbdConfig, VolumeKey, DEFAULT_VOLUME},
    host::Host,
    parser::{ProxyConfig, VmInfo},
};

/// Service name -> id (lower case) -> resource.
pub type ServiceMap = HashMap<String, BTreeMap<String, Arc<CrmResource>>>;

/// CRM id -> resource.
pub type CrmIdMap = HashMap<String, Arc<CrmResource>>;

/// DRBD device path -> the volume it belongs to.
pub type DeviceMap = BTreeMap<String, VolumeKey>;

const DEV_DRBD_BY_RES: &str = r"^/dev/drbd/by-res/([^/]+)(?:/(\d+))?$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrbdVolume {
    /// Name of the resource owning this volume.
    pub resource: String,
    pub number: String,
    pub device: Option<String>,
    /// Backing block device per cluster member.
    pub host_disks: BTreeMap<String, String>,
}

impl DrbdVolume {
    pub fn key(&self) -> VolumeKey {
        (self.resource.clone(), self.number.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrbdResource {
    pub name: String,
    pub volumes: BTreeMap<String, DrbdVolume>,
    pub proxy: Option<ProxyConfig>,
}

/// The current CRM snapshot and the result of the last CRM dry-run attached to it.
#[derive(Debug, Default)]
pub struct CrmState {
    pub status: Option<ClusterStatus>,
    pub ptest: Option<PtestData>,
}

#[derive(Debug, Default)]
pub struct ClusterStore {
    policy: StorePolicy,

    name_to_service: Mutex<ServiceMap>,
    drbd_resources: Mutex<BTreeMap<String, DrbdResource>>,
    drbd_devices: Mutex<DeviceMap>,
    crm_ids: Mutex<CrmIdMap>,
    vms: Mutex<BTreeMap<String, Vec<VmInfo>>>,

    crm: RwLock<CrmState>,
    drbd_test: Mutex<Option<DrbdTestData>>,
}

/// The next free numeric id among `ids`, or for a clone or master/slave set around a resource
/// with id `contained`, the next free `<contained>[_<n>]` id.
fn next_id<'a>(ids: impl Iterator<Item = &'a str>, contained: Option<&str>) -> String {
    let pattern = match contained {
        Some(c) => format!(r"^{}_(\d+)$", regex::escape(&c.to_lowercase())),
        None => r"^(\d+)$".to_string(),
    };
    let Ok(re) = Regex::new(&pattern) else {
        log::error!("could not build id pattern '{pattern}'");
        return contained.map(str::to_string).unwrap_or_else(|| "1".to_string());
    };

    let mut index: u64 = 0;
    for id in ids {
        if contained.is_some_and(|c| c.eq_ignore_ascii_case(id)) {
            index += 1;
        }
        let Some(caps) = re.captures(id) else {
            continue;
        };
        match caps[1].parse::<u64>() {
            Ok(i) => index = index.max(i),
            Err(e) => log::warn!("could not parse id suffix '{}': {e}", &caps[1]),
        }
    }

    match contained {
        None => (index + 1).to_string(),
        Some(c) if index == 0 => c.to_string(),
        Some(c) => format!("{c}_{}", index + 1),
    }
}

/// `id` if no other resource holds it in `ids`, otherwise the first free `id_2`, `id_3`, ...
/// `owner` may keep the id it already holds.
fn free_id_in(
    ids: &BTreeMap<String, Arc<CrmResource>>,
    id: &str,
    owner: Option<&Arc<CrmResource>>,
) -> String {
    let taken = |candidate: &str| {
        ids.get(&candidate.to_lowercase())
            .is_some_and(|other| !owner.is_some_and(|o| Arc::ptr_eq(o, other)))
    };
    let mut candidate = id.to_string();
    let mut index = 2;
    while taken(&candidate) {
        candidate = format!("{id}_{index}");
        index += 1;
    }
    candidate
}

impl ClusterStore {
    pub fn new(policy: StorePolicy) -> Self {
        ClusterStore {
            policy,
            ..Default::default()
        }
    }

    pub fn lock_name_to_service(&self) -> MutexGuard<'_, ServiceMap> {
        self.name_to_service.lock().unwrap()
    }

    pub fn lock_drbd_resources(&self) -> MutexGuard<'_, BTreeMap<String, DrbdResource>> {
        self.drbd_resources.lock().unwrap()
    }

    pub fn lock_drbd_devices(&self) -> MutexGuard<'_, DeviceMap> {
        self.drbd_devices.lock().unwrap()
    }

    pub fn lock_crm_ids(&self) -> MutexGuard<'_, CrmIdMap> {
        self.crm_ids.lock().unwrap()
    }

    pub fn lock_vms(&self) -> MutexGuard<'_, BTreeMap<String, Vec<VmInfo>>> {
        self.vms.lock().unwrap()
    }

    pub fn crm_state(&self) -> RwLockReadGuard<'_, CrmState> {
        self.crm.read().unwrap()
    }

    pub fn crm_state_mut(&self) -> RwLockWriteGuard<'_, CrmState> {
        self.crm.write().unwrap()
    }

    pub fn lock_drbd_test(&self) -> MutexGuard<'_, Option<DrbdTestData>> {
        self.drbd_test.lock().unwrap()
    }

    /// Register a CRM resource under its service name, allocating an id if it has none yet.
    /// Returns the id.
    ///
    /// New ids are the highest numeric id of the service name plus one. Clone and master/slave
    /// sets take the id of the resource they contain, e.g. `drbd_1`, suffixed with `_2`, `_3`, ...
    /// when that is taken. A resource whose id is already taken by another resource of the same
    /// service name is moved to the first free `<id>_<n>`.
    pub fn add_service(&self, resource: Arc<CrmResource>) -> String {
        let mut services = self.lock_name_to_service();
        let ids = services.entry(resource.name().to_string()).or_default();

        let id = match resource.id() {
            Some(id) => {
                let free = free_id_in(ids, &id, Some(&resource));
                if free != id {
                    log::warn!("{} id '{id}' is taken, using '{free}'", resource.name());
                    resource.reassign_id(free.clone());
                }
                free
            }
            None => {
                let contained = resource.inner().and_then(|inner| inner.contained_id());
                let id = next_id(ids.keys().map(String::as_str), contained.as_deref());
                resource.set_id(id.clone());
                id
            }
        };
        ids.insert(id.to_lowercase(), Arc::clone(&resource));

        if let Some(crm_id) = resource.crm_id() {
            self.lock_crm_ids().insert(crm_id, resource);
        }
        id
    }

    /// `id` if it is not taken for `service_name` yet, otherwise the first free `id_2`, `id_3`, ...
    pub fn free_id(&self, service_name: &str, id: &str) -> String {
        let services = self.lock_name_to_service();
        match services.get(service_name) {
            Some(ids) => free_id_in(ids, id, None),
            None => id.to_string(),
        }
    }

    pub fn service(&self, service_name: &str, id: &str) -> Option<Arc<CrmResource>> {
        self.lock_name_to_service()
            .get(service_name)?
            .get(&id.to_lowercase())
            .cloned()
    }

    pub fn service_by_crm_id(&self, crm_id: &str) -> Option<Arc<CrmResource>> {
        self.lock_crm_ids().get(crm_id).cloned()
    }

    /// Bring the CRM resources in line with a status snapshot: resources it reports for the first
    /// time are registered under their CRM id, the operations of known ones are updated and the
    /// ones it does not report anymore are removed. Returns whether anything changed.
    pub fn sync_crm_resources(&self, status: &ClusterStatus) -> bool {
        let mut services = self.lock_name_to_service();
        let mut crm_ids = self.lock_crm_ids();
        let mut changed = false;

        for res_status in status.resources() {
            if let Some(known) = crm_ids.get(&res_status.id) {
                if known.operations() != res_status.operations {
                    for (op, params) in &res_status.operations {
                        known.set_operation(op, params.clone());
                    }
                    changed = true;
                }
                continue;
            }

            let resource = Arc::new(CrmResource::from_status(res_status));
            log::debug!("new crm resource {resource}");
            let ids = services.entry(resource.name().to_string()).or_default();
            let id = resource.id().unwrap_or_default();
            let free = free_id_in(ids, &id, Some(&resource));
            if free != id {
                log::debug!("{resource}: id '{id}' is taken, using '{free}'");
                resource.reassign_id(free.clone());
            }
            ids.insert(free.to_lowercase(), Arc::clone(&resource));
            crm_ids.insert(res_status.id.clone(), resource);
            changed = true;
        }

        let removed: Vec<String> = crm_ids
            .keys()
            .filter(|id| status.resource(id).is_none())
            .cloned()
            .collect();
        for crm_id in removed {
            let Some(resource) = crm_ids.remove(&crm_id) else {
                continue;
            };
            log::debug!("crm resource {crm_id} is gone");
            if let (Some(ids), Some(id)) = (services.get_mut(resource.name()), resource.id()) {
                let key = id.to_lowercase();
                if ids.get(&key).is_some_and(|r| Arc::ptr_eq(r, &resource)) {
                    ids.remove(&key);
                }
            }
            changed = true;
        }

        changed
    }

    /// Replace the CRM snapshot. A dry-run result attached to the previous snapshot stays attached.
    pub fn set_cluster_status(&self, status: ClusterStatus) {
        self.crm_state_mut().status = Some(status);
    }

    pub fn cluster_status(&self) -> Option<ClusterStatus> {
        self.crm_state().status.clone()
    }

    /// The DC declared by the current snapshot.
    pub fn declared_dc(&self) -> Option<String> {
        self.crm_state()
            .status
            .as_ref()
            .and_then(|s| s.dc().map(str::to_string))
    }

    /// Returns whether the VMs of the host changed.
    pub fn set_vms(&self, host: &str, vms: Vec<VmInfo>) -> bool {
        let mut map = self.lock_vms();
        if map.get(host) == Some(&vms) {
            return false;
        }
        map.insert(host.to_string(), vms);
        true
    }

    /// Merge a DRBD configuration dump into the resource and device maps.
    ///
    /// A volume is taken over once at least two cluster members resolve its backing disk to a
    /// block device they reported. Entries naming hosts outside the cluster or unknown disks are
    /// skipped. Volumes missing from the dump are kept unless the store policy asks for pruning.
    /// Returns whether anything changed.
    pub fn reconcile_drbd(&self, config: &DrbdConfig, hosts: &[Arc<Host>]) -> bool {
        let mut resources = self.lock_drbd_resources();
        let mut devices = self.lock_drbd_devices();
        let mut changed = false;
        let mut seen: BTreeSet<VolumeKey> = BTreeSet::new();

        for (res_name, vnr) in config.volume_keys() {
            let Some(disks) = config.host_disk_map(&res_name, &vnr) else {
                continue;
            };

            let mut resolved = BTreeMap::new();
            for (host_name, disk) in disks {
                let Some(host) = hosts.iter().find(|h| h.name() == host_name) else {
                    log::warn!("drbd resource {res_name}/{vnr}: host {host_name} is not a cluster member");
                    continue;
                };
                if host.has_block_device(disk) {
                    resolved.insert(host_name.clone(), disk.clone());
                } else if disk.starts_with("/dev/drbd") {
                    // stacked on another drbd device
                    log::trace!("drbd resource {res_name}/{vnr}: {disk} on {host_name} is stacked");
                } else {
                    log::warn!("drbd resource {res_name}/{vnr}: unknown disk {disk} on {host_name}");
                }
            }
            if resolved.len() < 2 {
                continue;
            }

            let device = config.drbd_device(&res_name, &vnr).map(str::to_string);
            let volume = DrbdVolume {
                resource: res_name.clone(),
                number: vnr.clone(),
                device: device.clone(),
                host_disks: resolved,
            };
            seen.insert(volume.key());

            let resource = resources
                .entry(res_name.clone())
                .or_insert_with(|| DrbdResource {
                    name: res_name.clone(),
                    volumes: BTreeMap::new(),
                    proxy: None,
                });
            let proxy = config.proxy(&res_name).cloned();
            if resource.proxy != proxy {
                resource.proxy = proxy;
                changed = true;
            }
            if resource.volumes.get(&vnr) != Some(&volume) {
                log::debug!("drbd volume {res_name}/{vnr} updated");
                resource.volumes.insert(vnr.clone(), volume);
                changed = true;
            }
            if let Some(dev) = device {
                if devices.get(&dev) != Some(&(res_name.clone(), vnr.clone())) {
                    devices.insert(dev, (res_name, vnr));
                    changed = true;
                }
            }
        }

        if self.policy.prune_stale_drbd {
            for resource in resources.values_mut() {
                let before = resource.volumes.len();
                resource
                    .volumes
                    .retain(|vnr, _| seen.contains(&(resource.name.clone(), vnr.clone())));
                changed |= before != resource.volumes.len();
            }
            resources.retain(|name, res| {
                if res.volumes.is_empty() {
                    log::debug!("removing stale drbd resource {name}");
                }
                !res.volumes.is_empty()
            });
            devices.retain(|_, key| seen.contains(key));
        }

        changed
    }

    /// The volume behind a DRBD device, given either as `/dev/drbd/by-res/<res>[/<vol>]` or as
    /// the device path of the volume, e.g. `/dev/drbd0`.
    pub fn drbd_volume_from_dev(&self, dev: &str) -> Option<VolumeKey> {
        if let Ok(re) = Regex::new(DEV_DRBD_BY_RES) {
            if let Some(caps) = re.captures(dev) {
                let res = caps[1].to_string();
                let vnr = caps
                    .get(2)
                    .map_or(DEFAULT_VOLUME, |m| m.as_str())
                    .to_string();
                let resources = self.lock_drbd_resources();
                return resources
                    .get(&res)
                    .filter(|r| r.volumes.contains_key(&vnr))
                    .map(|_| (res, vnr));
            }
        }
        self.lock_drbd_devices().get(dev).cloned()
    }

    pub fn drbd_volume(&self, key: &VolumeKey) -> Option<DrbdVolume> {
        self.lock_drbd_resources()
            .get(&key.0)?
            .volumes
            .get(&key.1)
            .cloned()
    }

    /// Attach a CRM dry-run result to the current snapshot. `None` invalidates the previous one.
    pub fn set_ptest(&self, ptest: Option<PtestData>) {
        self.crm_state_mut().ptest = ptest;
    }

    pub fn ptest(&self) -> Option<PtestData> {
        self.crm_state().ptest.clone()
    }

    pub fn set_drbd_test(&self, data: Option<DrbdTestData>) {
        *self.lock_drbd_test() = data;
    }

    pub fn drbd_test(&self) -> Option<DrbdTestData> {
        self.lock_drbd_test().clone()
    }
}
