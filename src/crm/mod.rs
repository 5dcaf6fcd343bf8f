// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Cluster resource manager model: the status snapshot reported by the DC, the resources it
//! manages, and the results of dry-run probes.

pub mod resource;
pub mod status;

use std::collections::BTreeMap;

pub use resource::{CrmResource, ServiceKind};
pub use status::{ClusterStatus, Constraint, NodeStatus, ResourceStatus};

/// The output of a CRM dry-run (ptest / crm_simulate) probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtestData {
    raw: String,
    actions: Vec<String>,
}

impl PtestData {
    /// Keep the raw output and pull out the lines of its transition summary, e.g.
    /// `* Start res_IPaddr2_1 (node1)`.
    pub fn new(raw: &str) -> Self {
        let actions = raw
            .lines()
            .skip_while(|l| !l.trim_start().starts_with("Transition Summary:"))
            .skip(1)
            .map(str::trim)
            .take_while(|l| l.is_empty() || l.starts_with('*'))
            .filter_map(|l| l.strip_prefix('*'))
            .map(|l| l.trim().to_string())
            .collect();

        PtestData {
            raw: raw.to_string(),
            actions,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Short text describing what the probed action would do.
    pub fn summary(&self) -> String {
        if self.actions.is_empty() {
            "no changes".to_string()
        } else {
            self.actions.join("\n")
        }
    }
}

/// The output of a DRBD dry-run probe, per host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrbdTestData {
    pub per_host: BTreeMap<String, String>,
}

impl DrbdTestData {
    pub fn summary(&self) -> String {
        self.per_host
            .iter()
            .map(|(host, out)| format!("{host}:\n{}", out.trim_end()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptest_transition_summary() {
        let data = PtestData::new(
            "Current cluster status:\nOnline: [ node1 node2 ]\n\n\
             Transition Summary:\n * Start      res_IPaddr2_1     (node1)\n\
             * Move res_Dummy_1 (node1 -> node2)\n\nExecuting cluster transition:\n * Resource action: foo\n",
        );
        assert_eq!(
            data.actions(),
            &[
                "Start      res_IPaddr2_1     (node1)".to_string(),
                "Move res_Dummy_1 (node1 -> node2)".to_string()
            ]
        );

        assert_eq!(PtestData::new("Transition Summary:\n").summary(), "no changes");
    }
}
