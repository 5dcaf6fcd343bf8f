// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The DRBD configuration as dumped by `drbdadm dump-xml`, and the per-host state derived from
//! DRBD events.

pub mod event;

use std::collections::BTreeMap;

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};

use crate::parser::{ConfigError, ProxyConfig};

pub use event::{DrbdEvent, HostDrbdState, ResourceState, VolumeState};

/// Volume number used by configurations that predate multiple volumes per resource.
pub const DEFAULT_VOLUME: &str = "0";

/// A (resource name, volume number) pair.
pub type VolumeKey = (String, String);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeConfig {
    /// The DRBD device, e.g. /dev/drbd0.
    pub device: Option<String>,
    /// Backing block device per host name.
    pub disks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceConfig {
    pub name: String,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub proxy: Option<ProxyConfig>,
}

/// A full DRBD configuration dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrbdConfig {
    resources: BTreeMap<String, ResourceConfig>,
    common_proxy: Option<ProxyConfig>,
}

/// Which text content the parser is currently collecting.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Text {
    Device,
    Disk,
    Proxy,
}

fn required_attr(
    e: &BytesStart,
    element: &'static str,
    attribute: &'static str,
) -> Result<String, ConfigError> {
    match e.try_get_attribute(attribute)? {
        Some(attr) => Ok(attr.unescape_value()?.into_owned()),
        None => Err(ConfigError::MissingAttribute { element, attribute }),
    }
}

impl DrbdConfig {
    /// Parse the XML produced by `drbdadm dump-xml`.
    ///
    /// Both the single volume layout (`device` and `disk` directly under `host`) and the
    /// multi-volume layout (`volume vnr=".."` under `host`) are understood. The proxy section is
    /// carried as text in a `proxy` element. Any error discards the whole dump.
    pub fn parse(xml: &str) -> Result<Self, ConfigError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut config = DrbdConfig::default();
        let mut resource: Option<ResourceConfig> = None;
        let mut host: Option<String> = None;
        let mut volume: Option<String> = None;
        let mut text: Option<Text> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"resource" => {
                        resource = Some(ResourceConfig {
                            name: required_attr(&e, "resource", "name")?,
                            ..Default::default()
                        })
                    }
                    b"host" => host = Some(required_attr(&e, "host", "name")?),
                    b"volume" => volume = Some(required_attr(&e, "volume", "vnr")?),
                    b"device" => text = Some(Text::Device),
                    b"disk" => text = Some(Text::Disk),
                    b"proxy" => text = Some(Text::Proxy),
                    _ => {}
                },
                Event::Text(t) => {
                    let value = t.unescape()?;
                    let value = value.trim();
                    match (text, resource.as_mut()) {
                        (Some(Text::Proxy), Some(res)) => res.proxy = ProxyConfig::parse(value)?,
                        (Some(Text::Proxy), None) => config.common_proxy = ProxyConfig::parse(value)?,
                        (Some(kind), Some(res)) => {
                            let Some(host) = host.as_ref() else {
                                continue;
                            };
                            let vnr = volume.as_deref().unwrap_or(DEFAULT_VOLUME);
                            let vol = res.volumes.entry(vnr.to_string()).or_default();
                            if kind == Text::Device {
                                if vol.device.is_none() {
                                    vol.device = Some(value.to_string());
                                }
                            } else {
                                vol.disks.insert(host.clone(), value.to_string());
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"resource" => {
                        if let Some(res) = resource.take() {
                            config.resources.insert(res.name.clone(), res);
                        }
                    }
                    b"host" => host = None,
                    b"volume" => volume = None,
                    b"device" | b"disk" | b"proxy" => text = None,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if resource.is_some() {
            return Err(ConfigError::Invalid(
                "resource element is never closed".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.get(name)
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.resources.values()
    }

    /// Every (resource, volume) pair of the configuration.
    pub fn volume_keys(&self) -> impl Iterator<Item = VolumeKey> + '_ {
        self.resources.values().flat_map(|res| {
            res.volumes
                .keys()
                .map(move |vnr| (res.name.clone(), vnr.clone()))
        })
    }

    pub fn volume(&self, resource: &str, volume: &str) -> Option<&VolumeConfig> {
        self.resources.get(resource)?.volumes.get(volume)
    }

    pub fn drbd_device(&self, resource: &str, volume: &str) -> Option<&str> {
        self.volume(resource, volume)?.device.as_deref()
    }

    /// Backing block device per host for the given volume.
    pub fn host_disk_map(&self, resource: &str, volume: &str) -> Option<&BTreeMap<String, String>> {
        self.volume(resource, volume).map(|v| &v.disks)
    }

    /// The proxy section of a resource, falling back to the one in the common section.
    pub fn proxy(&self, resource: &str) -> Option<&ProxyConfig> {
        self.resources
            .get(resource)
            .and_then(|r| r.proxy.as_ref())
            .or(self.common_proxy.as_ref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TWO_NODE_DUMP: &str = r#"<config file="/etc/drbd.conf">
        <common><proxy>proxy { memlimit 64M; }</proxy></common>
        <resource name="r0">
            <host name="node1">
                <volume vnr="0">
                    <device minor="0">/dev/drbd0</device>
                    <disk>/dev/sdb1</disk>
                    <meta-disk>internal</meta-disk>
                </volume>
                <volume vnr="1">
                    <device minor="1">/dev/drbd1</device>
                    <disk>/dev/sdc1</disk>
                </volume>
                <address family="ipv4" port="7788">10.0.0.1</address>
            </host>
            <host name="node2">
                <volume vnr="0">
                    <device minor="0">/dev/drbd0</device>
                    <disk>/dev/sdb1</disk>
                </volume>
                <volume vnr="1">
                    <device minor="1">/dev/drbd1</device>
                    <disk>/dev/sdc1</disk>
                </volume>
                <address family="ipv4" port="7788">10.0.0.2</address>
            </host>
        </resource>
        <resource name="r1">
            <host name="node1"><device minor="2">/dev/drbd2</device><disk>/dev/sdd</disk></host>
            <host name="node2"><device minor="2">/dev/drbd2</device><disk>/dev/sdd</disk></host>
            <proxy>proxy { memlimit 100M; plugin { zlib level 9; } }</proxy>
        </resource>
    </config>"#;

    #[test]
    fn parse_dump() {
        let config = DrbdConfig::parse(TWO_NODE_DUMP).unwrap();

        let keys: Vec<_> = config.volume_keys().collect();
        assert_eq!(
            keys,
            vec![
                ("r0".to_string(), "0".to_string()),
                ("r0".to_string(), "1".to_string()),
                ("r1".to_string(), "0".to_string()),
            ]
        );
        assert_eq!(config.drbd_device("r0", "1"), Some("/dev/drbd1"));
        assert_eq!(config.drbd_device("r1", DEFAULT_VOLUME), Some("/dev/drbd2"));

        let disks = config.host_disk_map("r0", "0").unwrap();
        assert_eq!(disks.get("node1").map(String::as_str), Some("/dev/sdb1"));
        assert_eq!(disks.get("node2").map(String::as_str), Some("/dev/sdb1"));

        assert_eq!(config.proxy("r0").unwrap().get("memlimit"), Some("64M"));
        assert_eq!(config.proxy("r1").unwrap().plugin("zlib"), Some("level 9"));
    }

    #[test]
    fn malformed_proxy_discards_dump() {
        let xml = r#"<config><resource name="r0"><proxy>proxy { memlimit 1M;</proxy></resource></config>"#;
        assert!(matches!(
            DrbdConfig::parse(xml),
            Err(ConfigError::Unterminated("proxy"))
        ));
    }

    #[test]
    fn missing_resource_name() {
        assert!(matches!(
            DrbdConfig::parse("<config><resource><host name=\"a\"/></resource></config>"),
            Err(ConfigError::MissingAttribute {
                element: "resource",
                attribute: "name"
            })
        ));
    }

    #[test]
    fn truncated_dump() {
        assert!(DrbdConfig::parse("<config><resource name=\"r0\"><host name=\"a\">").is_err());
    }
}
