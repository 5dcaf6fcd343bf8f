// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Dry-run probes: "what would happen if this action were applied".
//!
//! A probe runs an action in test mode on the target host(s) and then asks for the simulated
//! outcome. Probes are serialized by a lock of their own, so at most one probe is in flight in
//! the whole cluster. The lock is never taken while a store lock is held.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::{
    cluster::{Cluster, ClusterEvent},
    crm::{DrbdTestData, PtestData},
    host::Host,
    poller::Latch,
    remote::{run_to_completion, ExecError, DRBD_TEST, PTEST},
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no host to run the probe on: {0}")]
    NoHost(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("probe was aborted")]
    Aborted,
}

/// A command to run in test mode before the outcome is simulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAction {
    pub command: String,
    pub vars: HashMap<String, String>,
}

impl ProbeAction {
    pub fn new(command: &str) -> Self {
        ProbeAction {
            command: command.to_string(),
            vars: HashMap::new(),
        }
    }

    pub fn var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

/// A probe running in the background.
#[derive(Debug)]
pub struct ProbeHandle<T> {
    done: Arc<Latch>,
    result: oneshot::Receiver<Result<T, ProbeError>>,
}

impl<T> ProbeHandle<T> {
    pub fn is_done(&self) -> bool {
        self.done.is_released()
    }

    /// Wait for the probe to finish without taking its result.
    pub async fn finished(&self) {
        self.done.wait().await
    }

    pub async fn wait(self) -> Result<T, ProbeError> {
        self.result.await.unwrap_or(Err(ProbeError::Aborted))
    }
}

/// Runs dry-run probes against the cluster, one at a time.
#[derive(Debug)]
pub struct ProbeCoordinator {
    cluster: Arc<Cluster>,
    lock: Arc<Mutex<()>>,
}

impl ProbeCoordinator {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        ProbeCoordinator {
            cluster,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Start a CRM dry-run probe on `host`, or on the DC when no host is given. The result is
    /// attached to the current CRM status snapshot.
    pub fn crm_probe(&self, host: Option<&str>, action: Option<ProbeAction>) -> ProbeHandle<PtestData> {
        let host = host.map(str::to_string);
        let cluster = Arc::clone(&self.cluster);
        let lock = Arc::clone(&self.lock);
        self.spawn(async move {
            let _probe = lock.lock().await;
            cluster.store().set_ptest(None);

            let host = crm_probe_host(&cluster, host.as_deref())?;
            // keep the live status from being parsed while the simulation runs
            let _status = host.lock_crm_status().await;

            if let Some(action) = action {
                run_to_completion(cluster.channel().execute(&host, &action.command, &action.vars))
                    .await?;
            }
            let output =
                run_to_completion(cluster.channel().execute(&host, PTEST, &HashMap::new())).await?;

            let ptest = PtestData::new(&output);
            log::debug!("{host}: ptest: {}", ptest.summary());
            cluster.store().set_ptest(Some(ptest.clone()));
            Ok(ptest)
        })
    }

    /// Start a DRBD dry-run of `action` on `resource` on the given hosts, or on every host. The
    /// output of each host is kept, including the output of a dry-run that failed.
    pub fn drbd_probe(
        &self,
        hosts: Option<Vec<String>>,
        action: &str,
        resource: &str,
    ) -> ProbeHandle<DrbdTestData> {
        let cluster = Arc::clone(&self.cluster);
        let lock = Arc::clone(&self.lock);
        let vars = HashMap::from([
            ("ACTION".to_string(), action.to_string()),
            ("RESOURCE".to_string(), resource.to_string()),
        ]);
        self.spawn(async move {
            let _probe = lock.lock().await;
            cluster.store().set_drbd_test(None);

            let targets: Vec<Arc<Host>> = match hosts {
                Some(names) => names
                    .iter()
                    .map(|name| {
                        cluster
                            .get_host_by_name(name)
                            .cloned()
                            .ok_or_else(|| ProbeError::NoHost(name.clone()))
                    })
                    .collect::<Result<_, _>>()?,
                None => cluster.hosts().to_vec(),
            };
            if targets.is_empty() {
                return Err(ProbeError::NoHost("no hosts given".to_string()));
            }

            let mut data = DrbdTestData::default();
            for host in targets {
                let _status = host.lock_drbd_status().await;
                let output =
                    match run_to_completion(cluster.channel().execute(&host, DRBD_TEST, &vars)).await {
                        Ok(output) => output,
                        Err(ExecError::Failed { output, exit_code }) => {
                            log::debug!("{host}: drbd dry-run exited with {exit_code}");
                            output
                        }
                        Err(e) => return Err(e.into()),
                    };
                data.per_host.insert(host.name().to_string(), output);
            }

            cluster.store().set_drbd_test(Some(data.clone()));
            Ok(data)
        })
    }

    fn spawn<T, F>(&self, probe: F) -> ProbeHandle<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T, ProbeError>> + Send + 'static,
    {
        let done = Arc::new(Latch::new());
        let (tx, rx) = oneshot::channel();
        let cluster = Arc::clone(&self.cluster);
        let latch = Arc::clone(&done);
        tokio::spawn(async move {
            let result = probe.await;
            if let Err(e) = &result {
                log::warn!("probe failed: {e}");
            }
            let _ = tx.send(result);
            latch.count_down();
            cluster.notify(ClusterEvent::ProbeFinished);
        });

        ProbeHandle { done, result: rx }
    }
}

fn crm_probe_host(cluster: &Cluster, name: Option<&str>) -> Result<Arc<Host>, ProbeError> {
    match name {
        Some(name) => cluster
            .get_host_by_name(name)
            .cloned()
            .ok_or_else(|| ProbeError::NoHost(name.to_string())),
        None if cluster.probe_policy().crm_probe_on_dc => cluster
            .current_dc_host()
            .ok_or_else(|| ProbeError::NoHost("no dc".to_string())),
        None => cluster
            .hosts()
            .iter()
            .find(|h| h.is_connected())
            .or_else(|| cluster.hosts().first())
            .cloned()
            .ok_or_else(|| ProbeError::NoHost("no hosts configured".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        crm::{status::tests::STATUS_FRAME, ClusterStatus},
        host::{ServiceState, StackState},
        test_env::{test_cluster, Script, ScriptedChannel},
    };

    const PTEST_OUTPUT: &str = "Current cluster status:\n\
        Online: [ node1 ]\n\
        \n\
        Transition Summary:\n\
        * Start   res_IPaddr2_1 (node1)\n";

    #[test]
    fn crm_probe_on_dc() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(ScriptedChannel::new());
            let cluster = test_cluster(&["node1", "node2"], Arc::clone(&channel));
            cluster
                .store()
                .set_cluster_status(ClusterStatus::parse_frame(STATUS_FRAME).unwrap());
            channel.push("node1", "CrmStart", Script::output(&[]));
            channel.push("node1", PTEST, Script::output(&[PTEST_OUTPUT]));

            let probes = ProbeCoordinator::new(Arc::clone(&cluster));
            let mut events = cluster.subscribe();
            let handle = probes.crm_probe(
                None,
                Some(ProbeAction::new("CrmStart").var("RESOURCE", "res_IPaddr2_1")),
            );
            handle.finished().await;
            assert!(handle.is_done());
            let ptest = handle.wait().await.unwrap();

            assert_eq!(ptest.actions(), ["Start   res_IPaddr2_1 (node1)"]);
            assert_eq!(cluster.store().ptest(), Some(ptest));
            assert_eq!(events.recv().await.unwrap(), ClusterEvent::ProbeFinished);

            let calls = channel.calls();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].command, "CrmStart");
            assert_eq!(calls[0].vars["RESOURCE"], "res_IPaddr2_1");
            assert_eq!(calls[1].command, PTEST);
        });
    }

    #[test]
    fn dry_run_on_dc_keeps_status_rotation() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(ScriptedChannel::new());
            let cluster = test_cluster(&["node1", "node2", "node3"], Arc::clone(&channel));
            for host in cluster.hosts() {
                host.set_connected(true);
                host.set_stack(StackState {
                    corosync: ServiceState::Running,
                    ..Default::default()
                });
            }
            channel.push("node2", PTEST, Script::output(&[PTEST_OUTPUT]));

            // the status loop has moved on to node2
            assert_eq!(cluster.dc_host().unwrap().name(), "node2");

            let probes = ProbeCoordinator::new(Arc::clone(&cluster));
            probes.crm_probe(None, None).wait().await.unwrap();
            let calls = channel.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].host, "node2");

            assert_eq!(cluster.selector().last_selected().as_deref(), Some("node2"));
            assert_eq!(cluster.dc_host().unwrap().name(), "node3");
        });
    }

    #[test]
    fn probes_run_one_at_a_time() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(ScriptedChannel::new());
            let cluster = test_cluster(&["node1"], Arc::clone(&channel));
            channel.push("node1", "First", Script::output(&["x"]).delay(Duration::from_millis(50)));
            channel.push(
                "node1",
                PTEST,
                Script::output(&[PTEST_OUTPUT]).delay(Duration::from_millis(50)),
            );
            channel.push("node1", "Second", Script::output(&[]));
            channel.push("node1", PTEST, Script::output(&["Transition Summary:\n"]));

            let probes = ProbeCoordinator::new(Arc::clone(&cluster));
            let first = probes.crm_probe(Some("node1"), Some(ProbeAction::new("First")));
            channel.wait_for_calls("node1", "First", 1).await;
            let second = probes.crm_probe(Some("node1"), Some(ProbeAction::new("Second")));

            assert_eq!(first.wait().await.unwrap().actions().len(), 1);
            assert_eq!(second.wait().await.unwrap().summary(), "no changes");

            let commands: Vec<String> = channel.calls().into_iter().map(|c| c.command).collect();
            assert_eq!(commands, ["First", PTEST, "Second", PTEST]);
        });
    }

    #[test]
    fn failed_probe_clears_previous_result() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(ScriptedChannel::new());
            let cluster = test_cluster(&["node1"], Arc::clone(&channel));
            channel.push("node1", PTEST, Script::output(&[PTEST_OUTPUT]));
            channel.push("node1", PTEST, Script::fail(1));

            let probes = ProbeCoordinator::new(Arc::clone(&cluster));
            probes.crm_probe(None, None).wait().await.unwrap();
            assert!(cluster.store().ptest().is_some());

            let result = probes.crm_probe(None, None).wait().await;
            assert!(matches!(
                result,
                Err(ProbeError::Exec(ExecError::Failed { exit_code: 1, .. }))
            ));
            assert_eq!(cluster.store().ptest(), None);

            assert!(matches!(
                probes.crm_probe(Some("node9"), None).wait().await,
                Err(ProbeError::NoHost(_))
            ));
        });
    }

    #[test]
    fn drbd_probe_every_host() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(ScriptedChannel::new());
            let cluster = test_cluster(&["node1", "node2"], Arc::clone(&channel));
            channel.push("node1", DRBD_TEST, Script::output(&["drbdsetup primary 0\n"]));
            channel.push("node2", DRBD_TEST, Script::output(&["not allowed\n"]).exit(10));

            let probes = ProbeCoordinator::new(Arc::clone(&cluster));
            let data = probes.drbd_probe(None, "primary", "r0").wait().await.unwrap();

            assert_eq!(data.per_host["node1"], "drbdsetup primary 0\n");
            assert_eq!(data.per_host["node2"], "not allowed\n");
            assert_eq!(data.summary(), "node1:\ndrbdsetup primary 0\nnode2:\nnot allowed");
            assert_eq!(cluster.store().drbd_test(), Some(data));

            let calls = channel.calls();
            assert!(calls
                .iter()
                .all(|c| c.vars["ACTION"] == "primary" && c.vars["RESOURCE"] == "r0"));

            assert!(matches!(
                probes
                    .drbd_probe(Some(vec!["node3".to_string()]), "primary", "r0")
                    .wait()
                    .await,
                Err(ProbeError::NoHost(name)) if name == "node3"
            ));
            assert_eq!(cluster.store().drbd_test(), None);
        });
    }
}
