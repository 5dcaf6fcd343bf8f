// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::{Arc, Mutex};

use crate::host::Host;

#[derive(Debug, Default)]
struct DcState {
    /// The host returned by the last selection.
    last: Option<String>,
    /// Set when the last selection was the DC declared by the CRM itself.
    reported_by_crm: Option<String>,
}

/// Picks the host to ask for the CRM status.
///
/// The DC declared by the last status report is used while it answers and runs a cluster stack.
/// Otherwise the hosts are scanned round robin, starting after the previously selected one, for a
/// connected host running a cluster stack. If there is none the first host is used.
#[derive(Debug, Default)]
pub struct DcSelector {
    state: Mutex<DcState>,
}

fn is_usable_dc(host: &Host) -> bool {
    host.is_crm_status_ok() && !host.stack().is_transitioning() && host.is_stack_running()
}

impl DcSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns None only when there are no hosts.
    pub fn select(&self, hosts: &[Arc<Host>], declared_dc: Option<&str>) -> Option<Arc<Host>> {
        let mut state = self.state.lock().unwrap();

        if let Some(dc) = declared_dc
            .and_then(|dc| hosts.iter().find(|h| h.name() == dc))
            .filter(|h| is_usable_dc(h))
        {
            state.last = Some(dc.name().to_string());
            state.reported_by_crm = Some(dc.name().to_string());
            return Some(Arc::clone(dc));
        }

        state.reported_by_crm = None;
        let first = hosts.first()?;
        let last_index = state
            .last
            .as_ref()
            .and_then(|last| hosts.iter().position(|h| h.name() == last))
            .unwrap_or(0);

        let chosen = (1..=hosts.len())
            .map(|step| &hosts[(last_index + step) % hosts.len()])
            .find(|h| h.is_connected() && h.is_stack_running())
            .unwrap_or_else(|| {
                log::debug!("no host qualifies as dc, falling back to {first}");
                first
            });

        state.last = Some(chosen.name().to_string());
        Some(Arc::clone(chosen))
    }

    /// The host the CRM status is currently asked from, without moving the round robin on: the
    /// usable declared DC, else the last selected host, else the first connected host running a
    /// cluster stack, else the first host.
    pub fn current(&self, hosts: &[Arc<Host>], declared_dc: Option<&str>) -> Option<Arc<Host>> {
        if let Some(dc) = declared_dc
            .and_then(|dc| hosts.iter().find(|h| h.name() == dc))
            .filter(|h| is_usable_dc(h))
        {
            return Some(Arc::clone(dc));
        }

        let last = self.state.lock().unwrap().last.clone();
        last.and_then(|last| hosts.iter().find(|h| h.name() == last))
            .or_else(|| {
                hosts
                    .iter()
                    .find(|h| h.is_connected() && h.is_stack_running())
            })
            .or_else(|| hosts.first())
            .cloned()
    }

    /// Whether the last selection picked `host` because the CRM declared it the DC.
    pub fn is_real_dc(&self, host: &Host) -> bool {
        self.state.lock().unwrap().reported_by_crm.as_deref() == Some(host.name())
    }

    pub fn last_selected(&self) -> Option<String> {
        self.state.lock().unwrap().last.clone()
    }
}
