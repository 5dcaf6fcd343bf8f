// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use tokio::{runtime::Runtime, sync::broadcast};

    use hastat_lib::{
        cluster::{Cluster, ClusterEvent},
        host::{ClusterStack, Feed, FeedState, HostStatus},
        parser::crm::ERROR_FRAME,
        poller::Poller,
        remote::{CRM_STATUS, DRBD_STATUS, HW_INFO, PING},
        test_env::*,
    };

    const STATUS_FRAME: &str = "---start---\r\n\
        <crm_mon version=\"2.0\">\
          <summary><current_dc present=\"true\" name=\"node1\"/></summary>\
          <nodes>\
            <node name=\"node1\" online=\"true\" standby=\"false\"/>\
            <node name=\"node2\" online=\"false\" standby=\"false\"/>\
          </nodes>\
          <resources>\
            <resource id=\"res_IPaddr2_1\" resource_agent=\"ocf::heartbeat:IPaddr2\" role=\"Started\">\
              <node name=\"node1\"/>\
            </resource>\
          </resources>\
        </crm_mon>\r\n---done---\r\n";

    const DRBD_DUMP: &str = "drbd:<config>\
        <resource name=\"r0\">\
          <host name=\"node1\"><volume vnr=\"0\"><device minor=\"0\">/dev/drbd0</device><disk>/dev/sdb1</disk></volume></host>\
          <host name=\"node2\"><volume vnr=\"0\"><device minor=\"0\">/dev/drbd0</device><disk>/dev/sdb1</disk></volume></host>\
        </resource>\
        </config>\n";

    fn block_devices(devices: &[&str]) -> BTreeSet<String> {
        devices.iter().map(|d| d.to_string()).collect()
    }

    fn drain(events: &mut broadcast::Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
        let mut all = Vec::new();
        while let Ok(event) = events.try_recv() {
            all.push(event);
        }
        all
    }

    fn two_nodes() -> (Arc<ScriptedChannel>, Arc<Cluster>) {
        let channel = Arc::new(ScriptedChannel::new());
        let cluster = test_cluster(&["node1", "node2"], Arc::clone(&channel));
        (channel, cluster)
    }

    #[test]
    fn crm_error_frame_clears_ok_once() {
        let (channel, cluster) = two_nodes();
        channel.push(
            "node1",
            CRM_STATUS,
            Script::output(&[STATUS_FRAME, ERROR_FRAME])
                .delay(Duration::from_millis(20))
                .until_canceled(),
        );

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut events = cluster.subscribe();
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Crm);

            let node1 = Arc::clone(&cluster.hosts()[0]);
            wait_until(|| cluster.store().service_by_crm_id("res_IPaddr2_1").is_some()).await;
            wait_until(|| {
                !node1.is_crm_status_ok()
                    && cluster
                        .store()
                        .cluster_status()
                        .is_some_and(|s| !s.is_online("node1"))
            })
            .await;
            poller.stop(Feed::Crm).await;

            let flags: Vec<ClusterEvent> = drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, ClusterEvent::CrmStatusOk { .. }))
                .collect();
            assert_eq!(
                flags,
                vec![
                    ClusterEvent::CrmStatusOk {
                        host: "node1".to_string(),
                        ok: true
                    },
                    ClusterEvent::CrmStatusOk {
                        host: "node1".to_string(),
                        ok: false
                    },
                ]
            );
            assert!(!cluster.hosts()[1].is_crm_status_ok());
            assert_eq!(cluster.store().declared_dc().as_deref(), Some("node1"));
            assert_eq!(channel.call_count("node2", CRM_STATUS), 0);
        });
    }

    #[test]
    fn intentional_exit_keeps_ok_flag() {
        let (channel, cluster) = two_nodes();
        channel.push("node1", DRBD_STATUS, Script::output(&["event:r0 connected\n"]).exit(100));
        channel.push("node2", DRBD_STATUS, Script::output(&["noise\n"]).exit(1));

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Drbd);

            channel.wait_for_calls("node1", DRBD_STATUS, 2).await;
            channel.wait_for_calls("node2", DRBD_STATUS, 2).await;
            assert!(cluster.hosts()[0].is_drbd_status_ok());
            assert!(!cluster.hosts()[1].is_drbd_status_ok());
            assert_eq!(cluster.hosts()[0].feed_state(Feed::Drbd), FeedState::Polling);

            poller.stop(Feed::Drbd).await;
            assert!(cluster.hosts()[0].is_drbd_status_ok());
        });
    }

    #[test]
    fn connection_lost_marks_host_disconnected() {
        let (channel, cluster) = two_nodes();
        channel.push("node1", CRM_STATUS, Script::output(&[STATUS_FRAME]).exit(255));
        channel.push("node2", PING, Script::fail(255));

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Crm);

            let node1 = Arc::clone(&cluster.hosts()[0]);
            wait_until(|| node1.get_status() == HostStatus::Down).await;
            assert!(!node1.is_crm_status_ok());
            assert_eq!(cluster.store().declared_dc(), None);
            poller.stop(Feed::Crm).await;

            // a ping brings the host back
            channel.push("node1", PING, Script::output(&["pong\n"]));
            poller.start(Feed::Ping);
            wait_until(|| node1.is_connected()).await;

            let node2 = Arc::clone(&cluster.hosts()[1]);
            wait_until(|| node2.get_status() == HostStatus::Down).await;
            poller.stop(Feed::Ping).await;
        });
    }

    #[test]
    fn drbd_config_and_events() {
        let (channel, cluster) = two_nodes();
        for host in cluster.hosts() {
            host.set_block_devices(block_devices(&["/dev/sda", "/dev/sdb1"]));
            channel.push(
                host.name(),
                DRBD_STATUS,
                Script::output(&[
                    &DRBD_DUMP[..40],
                    &DRBD_DUMP[40..],
                    "event:r0 connected\nevent:r0/0 cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate\n",
                    "event:r9 connected\n",
                ])
                .until_canceled(),
            );
        }

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Drbd);
            poller.wait_ready(Feed::Drbd).await;

            for host in cluster.hosts() {
                channel.wait_for_calls(host.name(), DRBD_STATUS, 1).await;
                wait_until(|| host.is_drbd_status_ok()).await;
            }
            let node1 = Arc::clone(&cluster.hosts()[0]);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                {
                    let state = node1.lock_drbd_status().await;
                    if let Some(r0) = state.resource("r0") {
                        if r0.volumes.contains_key("0") {
                            assert_eq!(r0.connection.as_deref(), Some("Connected"));
                            assert_eq!(r0.role.as_deref(), Some("Primary"));
                            assert_eq!(r0.volumes["0"].peer_disk.as_deref(), Some("UpToDate"));
                            assert!(state.resource("r9").is_none());
                            break;
                        }
                    }
                }
                assert!(tokio::time::Instant::now() < deadline);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            poller.stop(Feed::Drbd).await;

            // both hosts sent the same dump: one resource with one volume
            let resources = cluster.store().lock_drbd_resources().clone();
            assert_eq!(resources.len(), 1);
            assert_eq!(resources["r0"].volumes.len(), 1);
            assert_eq!(
                resources["r0"].volumes["0"].host_disks.keys().collect::<Vec<_>>(),
                vec!["node1", "node2"]
            );
            assert_eq!(
                cluster.store().drbd_volume_from_dev("/dev/drbd0"),
                Some(("r0".to_string(), "0".to_string()))
            );
            assert_eq!(
                cluster.store().drbd_volume_from_dev("/dev/drbd/by-res/r0"),
                Some(("r0".to_string(), "0".to_string()))
            );
        });
    }

    #[test]
    fn missing_drbd_module() {
        let (channel, cluster) = two_nodes();
        for _ in 0..3 {
            channel.push(
                "node1",
                DRBD_STATUS,
                Script::output(&["--nm--\n", "event:r0 connected\n"]),
            );
        }

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut events = cluster.subscribe();
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Drbd);

            // Three full cycles, then the unscripted fourth run blocks.
            channel.wait_for_calls("node1", DRBD_STATUS, 4).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            poller.stop(Feed::Drbd).await;

            let node1 = Arc::clone(&cluster.hosts()[0]);
            assert!(!node1.is_drbd_status_ok());
            let flags: Vec<_> = drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, ClusterEvent::DrbdStatusOk { host, .. } if host == "node1"))
                .collect();
            assert!(
                flags.is_empty(),
                "the flag never turns on without the module: {flags:?}"
            );
            assert!(node1.lock_drbd_status().await.config().is_none());
        });
    }

    #[test]
    fn server_status_updates_host() {
        let (channel, cluster) = two_nodes();
        channel.push(
            "node1",
            HW_INFO,
            Script::output(&[
                "--disk-info--\n/dev/sdb1 size:1024\n",
                "--installation-info--\ncorosync:running\npacemaker:running\n--vm-info--\nvm1 running\n",
            ]),
        );

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut events = cluster.subscribe();
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::ServerStatus);

            let node1 = Arc::clone(&cluster.hosts()[0]);
            wait_until(|| node1.is_stack_running()).await;
            assert_eq!(node1.stack().running_stack(), Some(ClusterStack::Corosync));
            assert!(node1.has_block_device("/dev/sdb1"));
            assert_eq!(cluster.store().lock_vms()["node1"][0].name, "vm1");

            poller.stop(Feed::ServerStatus).await;
            assert!(drain(&mut events).contains(&ClusterEvent::ServerStatus {
                host: "node1".to_string()
            }));
        });
    }

    #[test]
    fn first_response_announced_once() {
        let (channel, cluster) = two_nodes();
        for host in ["node1", "node2"] {
            channel.push(host, PING, Script::output(&["pong\n"]));
            channel.push(host, PING, Script::output(&["pong\n"]));
        }

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut events = cluster.subscribe();
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start(Feed::Ping);
            poller.wait_ready(Feed::Ping).await;
            channel.wait_for_calls("node1", PING, 3).await;
            channel.wait_for_calls("node2", PING, 3).await;
            poller.stop(Feed::Ping).await;

            let ready: Vec<ClusterEvent> = drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, ClusterEvent::FeedReady { .. }))
                .collect();
            assert_eq!(ready.len(), 2);
            assert!(ready.contains(&ClusterEvent::FeedReady {
                host: "node2".to_string(),
                feed: Feed::Ping
            }));
        });
    }

    #[test]
    fn stop_waits_for_every_loop() {
        let (channel, cluster) = two_nodes();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let poller = Poller::new(Arc::clone(&cluster));
            poller.start_all();
            poller.start_all();
            for feed in Feed::ALL {
                assert!(poller.is_running(feed));
            }
            channel.wait_for_calls("node1", DRBD_STATUS, 1).await;
            channel.wait_for_calls("node2", PING, 1).await;
            channel.wait_for_calls("node1", CRM_STATUS, 1).await;

            poller.stop_all().await;
            for feed in Feed::ALL {
                assert!(!poller.is_running(feed));
                for host in cluster.hosts() {
                    assert_eq!(host.feed_state(feed), FeedState::Canceled);
                }
            }
            assert_eq!(channel.call_count("node1", DRBD_STATUS), 1);
            assert_eq!(channel.call_count("node2", DRBD_STATUS), 1);
        });
    }
}
