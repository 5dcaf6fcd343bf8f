// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeSet;

use crate::host::{ServiceState, StackState};

/// A virtual machine as reported by a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub name: String,
    pub state: String,
}

/// The periodic hardware info report of a host.
///
/// The report consists of sections, each introduced by a `--<section>--` line:
///
/// ```text
/// --disk-info--
/// /dev/sdb1 size:1048576
/// --installation-info--
/// corosync:running
/// pacemaker:running
/// heartbeat:stopped
/// --vm-info--
/// vm1 running
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HwInfo {
    pub block_devices: BTreeSet<String>,
    pub stack: StackState,
    pub vms: Vec<VmInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Disks,
    Installation,
    Vms,
    Unknown,
}

impl HwInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();
        let mut section = Section::Unknown;

        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line
                .strip_prefix("--")
                .and_then(|l| l.strip_suffix("--"))
            {
                section = match name {
                    "disk-info" => Section::Disks,
                    "installation-info" => Section::Installation,
                    "vm-info" => Section::Vms,
                    other => {
                        log::trace!("skipping hw info section '{other}'");
                        Section::Unknown
                    }
                };
                continue;
            }

            match section {
                Section::Disks => {
                    if let Some(dev) = line.split_whitespace().next() {
                        info.block_devices.insert(dev.to_string());
                    }
                }
                Section::Installation => {
                    let Some((service, state)) = line.split_once(':') else {
                        continue;
                    };
                    let state = ServiceState::from(state.trim());
                    match service.trim() {
                        "heartbeat" => info.stack.heartbeat = state,
                        "corosync" => info.stack.corosync = state,
                        "openais" => info.stack.openais = state,
                        "pacemaker" => info.stack.pacemaker = state,
                        _ => {}
                    }
                }
                Section::Vms => {
                    let mut fields = line.split_whitespace();
                    if let Some(name) = fields.next() {
                        info.vms.push(VmInfo {
                            name: name.to_string(),
                            state: fields.next().unwrap_or("unknown").to_string(),
                        });
                    }
                }
                Section::Unknown => {}
            }
        }

        info
    }
}
