// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};

use super::ServiceKind;
use crate::parser::{
    crm::{FRAME_END, FRAME_START},
    ConfigError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub online: bool,
    pub standby: bool,
}

/// A resource as reported in the status, e.g.
/// `<resource id="res_IPaddr2_1" resource_agent="ocf::heartbeat:IPaddr2" role="Started">`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub id: String,
    pub kind: ServiceKind,
    /// Agent in `class[:provider]:type` form; empty for groups and clones.
    pub agent: String,
    pub role: Option<String>,
    pub target_role: Option<String>,
    /// Nodes the resource is running on.
    pub running_on: Vec<String>,
    /// Id of the group or clone containing this resource.
    pub parent: Option<String>,
    /// Operation name -> operation parameters (interval, timeout, role, ...).
    pub operations: BTreeMap<String, BTreeMap<String, String>>,
}

/// A constraint definition. Its kind is the element name (`rsc_location`, `rsc_colocation`,
/// `rsc_order`), the attributes are carried as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraint {
    pub kind: String,
    pub id: String,
    pub attributes: BTreeMap<String, String>,
}

/// The state of the whole cluster as last reported by the DC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    dc: Option<String>,
    nodes: BTreeMap<String, NodeStatus>,
    resources: BTreeMap<String, ResourceStatus>,
    constraints: Vec<Constraint>,
}

fn attributes(e: &BytesStart) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut map = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        map.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(map)
}

fn is_true(attrs: &BTreeMap<String, String>, key: &str) -> bool {
    attrs.get(key).is_some_and(|v| v == "true")
}

fn required(
    attrs: &mut BTreeMap<String, String>,
    element: &'static str,
    attribute: &'static str,
) -> Result<String, ConfigError> {
    attrs
        .remove(attribute)
        .ok_or(ConfigError::MissingAttribute { element, attribute })
}

/// Strip the frame markers, leaving the XML body.
fn frame_body(frame: &str) -> &str {
    let body = match frame.find(FRAME_START) {
        Some(pos) => &frame[pos + FRAME_START.len()..],
        None => frame,
    };
    let body = match body.rfind(FRAME_END) {
        Some(pos) => &body[..pos],
        None => body,
    };
    body.trim()
}

impl ClusterStatus {
    /// Parse a complete status frame whose body is `crm_mon` style XML:
    ///
    /// ```text
    /// <crm_mon>
    ///   <summary><current_dc present="true" name="node1"/></summary>
    ///   <nodes><node name="node1" online="true" standby="false"/></nodes>
    ///   <resources>
    ///     <resource id="res_Dummy_1" resource_agent="ocf::heartbeat:Dummy" role="Started">
    ///       <node name="node1"/>
    ///       <op name="monitor" interval="10s" timeout="20s"/>
    ///     </resource>
    ///     <group id="grp_1"> ... </group>
    ///     <clone id="ms_drbd_1" multi_state="true"> ... </clone>
    ///   </resources>
    ///   <constraints><rsc_location id="loc_1" rsc="grp_1" node="node1" score="INFINITY"/></constraints>
    /// </crm_mon>
    /// ```
    pub fn parse_frame(frame: &str) -> Result<Self, ConfigError> {
        let mut reader = Reader::from_str(frame_body(frame));
        reader.trim_text(true);

        let mut status = ClusterStatus::default();
        let mut saw_root = false;
        let mut in_nodes = false;
        let mut in_constraints = false;
        let mut parents: Vec<String> = Vec::new();
        let mut resource: Option<ResourceStatus> = None;

        loop {
            let event = reader.read_event()?;
            let (e, empty) = match &event {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(e) => {
                    match e.name().as_ref() {
                        b"nodes" => in_nodes = false,
                        b"constraints" => in_constraints = false,
                        b"group" | b"clone" => {
                            parents.pop();
                        }
                        b"resource" => status.insert_resource(resource.take()),
                        _ => {}
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            let name = e.name();
            match name.as_ref() {
                b"crm_mon" => saw_root = true,
                b"current_dc" => {
                    let attrs = attributes(e)?;
                    if is_true(&attrs, "present") {
                        status.dc = attrs.get("name").cloned();
                    }
                }
                b"nodes" => in_nodes = !empty,
                b"constraints" => in_constraints = !empty,
                b"node" if in_nodes => {
                    let mut attrs = attributes(e)?;
                    let node = required(&mut attrs, "node", "name")?;
                    status.nodes.insert(
                        node,
                        NodeStatus {
                            online: is_true(&attrs, "online"),
                            standby: is_true(&attrs, "standby"),
                        },
                    );
                }
                b"node" => {
                    if let Some(res) = resource.as_mut() {
                        let mut attrs = attributes(e)?;
                        res.running_on.push(required(&mut attrs, "node", "name")?);
                    }
                }
                b"op" => {
                    if let Some(res) = resource.as_mut() {
                        let mut attrs = attributes(e)?;
                        let op = required(&mut attrs, "op", "name")?;
                        res.operations.insert(op, attrs);
                    }
                }
                b"group" | b"clone" => {
                    let mut attrs = attributes(e)?;
                    let element = if name.as_ref() == b"group" { "group" } else { "clone" };
                    let id = required(&mut attrs, element, "id")?;
                    let kind = match element {
                        "group" => ServiceKind::Group,
                        _ if is_true(&attrs, "multi_state") => ServiceKind::MasterSlave,
                        _ => ServiceKind::Clone,
                    };
                    status.insert_resource(Some(ResourceStatus {
                        id: id.clone(),
                        kind,
                        parent: parents.last().cloned(),
                        target_role: attrs.remove("target_role"),
                        ..Default::default()
                    }));
                    if !empty {
                        parents.push(id);
                    }
                }
                b"resource" => {
                    let mut attrs = attributes(e)?;
                    let agent = attrs.remove("resource_agent").unwrap_or_default();
                    let res = ResourceStatus {
                        id: required(&mut attrs, "resource", "id")?,
                        kind: if agent.starts_with("stonith:") {
                            ServiceKind::Stonith
                        } else {
                            ServiceKind::Primitive
                        },
                        agent,
                        role: attrs.remove("role"),
                        target_role: attrs.remove("target_role"),
                        parent: parents.last().cloned(),
                        ..Default::default()
                    };
                    if empty {
                        status.insert_resource(Some(res));
                    } else {
                        resource = Some(res);
                    }
                }
                kind if in_constraints => {
                    let mut attrs = attributes(e)?;
                    status.constraints.push(Constraint {
                        kind: String::from_utf8_lossy(kind).into_owned(),
                        id: attrs.remove("id").unwrap_or_default(),
                        attributes: attrs,
                    });
                }
                _ => {}
            }
        }

        if !saw_root {
            return Err(ConfigError::Invalid(
                "crm status frame has no crm_mon element".to_string(),
            ));
        }
        Ok(status)
    }

    fn insert_resource(&mut self, resource: Option<ResourceStatus>) {
        if let Some(res) = resource {
            self.resources.insert(res.id.clone(), res);
        }
    }

    /// The DC declared by this status report.
    pub fn dc(&self) -> Option<&str> {
        self.dc.as_deref()
    }

    pub fn set_dc(&mut self, dc: Option<String>) {
        self.dc = dc;
    }

    pub fn is_online(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|n| n.online)
    }

    pub fn set_online(&mut self, node: &str, online: bool) {
        self.nodes.entry(node.to_string()).or_default().online = online;
    }

    pub fn is_standby(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|n| n.standby)
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeStatus> {
        &self.nodes
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceStatus> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceStatus> {
        self.resources.values()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
}
