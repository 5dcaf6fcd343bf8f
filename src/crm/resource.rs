// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, OnceLock},
};

use super::ResourceStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    #[default]
    Primitive,
    Stonith,
    Group,
    Clone,
    MasterSlave,
}

impl ServiceKind {
    /// Prefix of the CRM id of resources of this kind.
    pub fn crm_id_prefix(self) -> &'static str {
        match self {
            ServiceKind::Primitive => "res_",
            ServiceKind::Stonith => "stonith_",
            ServiceKind::Group => "grp_",
            ServiceKind::Clone => "cl_",
            ServiceKind::MasterSlave => "ms_",
        }
    }

    /// Service name used for resources of this kind that have no agent.
    fn container_name(self) -> Option<&'static str> {
        match self {
            ServiceKind::Group => Some("Group"),
            ServiceKind::Clone => Some("Clone"),
            ServiceKind::MasterSlave => Some("Master/Slave"),
            _ => None,
        }
    }

    pub fn is_container(self) -> bool {
        self.container_name().is_some()
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceKind::Primitive => "primitive",
            ServiceKind::Stonith => "stonith",
            ServiceKind::Group => "group",
            ServiceKind::Clone => "clone",
            ServiceKind::MasterSlave => "master/slave",
        };
        write!(f, "{s}")
    }
}

/// A resource managed by the CRM.
///
/// The id is assigned once, either from the id the CRM reports or by the user or store before the
/// resource is registered. The store only moves it to a free `<id>_<n>` when it is already taken.
#[derive(Debug)]
pub struct CrmResource {
    name: String,
    kind: ServiceKind,
    class: Option<String>,
    provider: Option<String>,
    inner: Option<Arc<CrmResource>>,
    id: Mutex<Option<String>>,
    crm_id: OnceLock<String>,
    operations: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl CrmResource {
    /// A primitive (or stonith) resource using the agent `class[:provider]:type`.
    pub fn primitive(agent: &str) -> Self {
        let mut parts: Vec<&str> = agent.split(':').filter(|p| !p.is_empty()).collect();
        let name = parts.pop().unwrap_or(agent).to_string();
        let class = parts.first().map(|c| c.to_string());
        let provider = parts.get(1).map(|p| p.to_string());
        let kind = if class.as_deref() == Some("stonith") {
            ServiceKind::Stonith
        } else {
            ServiceKind::Primitive
        };
        Self::build(name, kind, class, provider, None)
    }

    pub fn group() -> Self {
        Self::build("Group".to_string(), ServiceKind::Group, None, None, None)
    }

    /// A clone or master/slave set around `inner`.
    pub fn clone_of(inner: Arc<CrmResource>, master_slave: bool) -> Self {
        let kind = if master_slave {
            ServiceKind::MasterSlave
        } else {
            ServiceKind::Clone
        };
        let name = kind.container_name().unwrap_or("Clone").to_string();
        Self::build(name, kind, None, None, Some(inner))
    }

    fn build(
        name: String,
        kind: ServiceKind,
        class: Option<String>,
        provider: Option<String>,
        inner: Option<Arc<CrmResource>>,
    ) -> Self {
        CrmResource {
            name,
            kind,
            class,
            provider,
            inner,
            id: Mutex::new(None),
            crm_id: OnceLock::new(),
            operations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build a resource from its entry in the cluster status, taking over its CRM id.
    pub fn from_status(status: &ResourceStatus) -> Self {
        let res = match status.kind {
            ServiceKind::Primitive | ServiceKind::Stonith => Self::primitive(&status.agent),
            kind => Self::build(
                kind.container_name().unwrap_or_default().to_string(),
                kind,
                None,
                None,
                None,
            ),
        };
        res.set_id_from_crm_id(&status.id);
        *res.operations.lock().unwrap() = status.operations.clone();
        res
    }

    /// The service name, e.g. the agent type `IPaddr2` or `Group`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn inner(&self) -> Option<&Arc<CrmResource>> {
        self.inner.as_ref()
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    /// Assign the id. Returns false if the resource already had one, which is then kept.
    pub fn set_id(&self, id: String) -> bool {
        let mut current = self.id.lock().unwrap();
        if current.is_some() {
            return false;
        }
        *current = Some(id);
        true
    }

    /// Replace the id when the store finds it taken.
    pub(crate) fn reassign_id(&self, id: String) {
        *self.id.lock().unwrap() = Some(id);
    }

    /// Take over a CRM id and derive the id from it: the kind's prefix (and service name for
    /// primitives) is stripped when present, otherwise the CRM id is the id.
    pub fn set_id_from_crm_id(&self, crm_id: &str) -> bool {
        let _ = self.crm_id.set(crm_id.to_string());
        let prefix = match self.kind {
            ServiceKind::Primitive | ServiceKind::Stonith => {
                format!("{}{}_", self.kind.crm_id_prefix(), self.name)
            }
            kind => kind.crm_id_prefix().to_string(),
        };
        let id = crm_id.strip_prefix(prefix.as_str()).unwrap_or(crm_id);
        self.set_id(id.to_string())
    }

    /// The id of the resource in the CRM, or None until the resource has an id.
    pub fn crm_id(&self) -> Option<String> {
        if let Some(crm_id) = self.crm_id.get() {
            return Some(crm_id.clone());
        }
        let id = self.id()?;
        Some(match self.kind {
            ServiceKind::Primitive | ServiceKind::Stonith => {
                format!("{}{}_{}", self.kind.crm_id_prefix(), self.name, id)
            }
            kind => format!("{}{}", kind.crm_id_prefix(), id),
        })
    }

    /// The id a contained clone or master/slave set derives its own id from.
    pub(crate) fn contained_id(&self) -> Option<String> {
        Some(format!("{}_{}", self.name, self.id()?))
    }

    pub fn operations(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.operations.lock().unwrap().clone()
    }

    pub fn set_operation(&self, op: &str, params: BTreeMap<String, String>) {
        self.operations.lock().unwrap().insert(op.to_string(), params);
    }
}

impl fmt::Display for CrmResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.crm_id() {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "{} ({})", self.name, self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_split() {
        let res = CrmResource::primitive("ocf::heartbeat:IPaddr2");
        assert_eq!(res.name(), "IPaddr2");
        assert_eq!(res.class(), Some("ocf"));
        assert_eq!(res.provider(), Some("heartbeat"));
        assert_eq!(res.kind(), ServiceKind::Primitive);

        let res = CrmResource::primitive("stonith:fence_ipmilan");
        assert_eq!(res.name(), "fence_ipmilan");
        assert_eq!(res.kind(), ServiceKind::Stonith);
        assert_eq!(res.provider(), None);
    }

    #[test]
    fn crm_ids() {
        let res = CrmResource::primitive("ocf::heartbeat:IPaddr2");
        assert_eq!(res.crm_id(), None);
        assert!(res.set_id("3".to_string()));
        assert!(!res.set_id("4".to_string()));
        assert_eq!(res.crm_id().as_deref(), Some("res_IPaddr2_3"));

        let group = CrmResource::group();
        group.set_id("1".to_string());
        assert_eq!(group.crm_id().as_deref(), Some("grp_1"));

        let drbd = Arc::new(CrmResource::primitive("ocf:linbit:drbd"));
        drbd.set_id("1".to_string());
        let ms = CrmResource::clone_of(Arc::clone(&drbd), true);
        ms.set_id(drbd.contained_id().unwrap());
        assert_eq!(ms.crm_id().as_deref(), Some("ms_drbd_1"));
    }

    #[test]
    fn ids_from_crm_ids() {
        let res = CrmResource::primitive("ocf::heartbeat:IPaddr2");
        res.set_id_from_crm_id("res_IPaddr2_7");
        assert_eq!(res.id().as_deref(), Some("7"));

        let res = CrmResource::primitive("ocf::heartbeat:IPaddr2");
        res.set_id_from_crm_id("my_ip");
        assert_eq!(res.id().as_deref(), Some("my_ip"));
        assert_eq!(res.crm_id().as_deref(), Some("my_ip"));
    }
}
