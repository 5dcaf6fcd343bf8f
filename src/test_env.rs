// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::Cluster,
    config::{Config, Host as HostConfig, Intervals},
    host::Host,
    remote::{ExecEvent, ExecHandle, RemoteChannel, EXIT_TERMINATED},
};

/// One scripted run of a command: the chunks it prints and how it ends.
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: Vec<String>,
    exit_code: i32,
    until_canceled: bool,
    delay: Duration,
}

impl Script {
    /// A run printing `chunks` and then exiting successfully.
    pub fn output(chunks: &[&str]) -> Self {
        Script {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A run printing nothing and exiting with `exit_code`.
    pub fn fail(exit_code: i32) -> Self {
        Script {
            exit_code,
            ..Default::default()
        }
    }

    pub fn exit(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// After its chunks, the run keeps going until it is canceled, then exits as if it was
    /// killed with SIGTERM.
    pub fn until_canceled(mut self) -> Self {
        self.until_canceled = true;
        self
    }

    /// Wait `delay` before every chunk.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A recorded call of [`RemoteChannel::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub host: String,
    pub command: String,
    pub vars: HashMap<String, String>,
}

/// A RemoteChannel replaying scripted runs per (host, command) and recording every call.
///
/// When the scripts of a (host, command) pair are used up, further runs print nothing and only
/// end when they are canceled.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    scripts: Mutex<HashMap<(String, String), VecDeque<Script>>>,
    calls: Mutex<Vec<Invocation>>,
}

async fn play(script: Script, events: mpsc::UnboundedSender<ExecEvent>, cancel: CancellationToken) {
    for chunk in script.chunks {
        if !script.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(script.delay) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        let _ = events.send(ExecEvent::Output(chunk));
    }

    if script.until_canceled {
        cancel.cancelled().await;
    }
    let event = if cancel.is_cancelled() {
        ExecEvent::DoneError {
            output: String::new(),
            exit_code: EXIT_TERMINATED,
        }
    } else if script.exit_code == 0 {
        ExecEvent::Done(String::new())
    } else {
        ExecEvent::DoneError {
            output: String::new(),
            exit_code: script.exit_code,
        }
    };
    let _ = events.send(event);
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run of `command` on `host`.
    pub fn push(&self, host: &str, command: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry((host.to_string(), command.to_string()))
            .or_default()
            .push_back(script);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, host: &str, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.host == host && c.command == command)
            .count()
    }

    /// Wait until `command` was started on `host` at least `count` times. Panics after 10 seconds.
    pub async fn wait_for_calls(&self, host: &str, command: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.call_count(host, command) < count {
            if tokio::time::Instant::now() > deadline {
                panic!("{command} on {host} was not started {count} times");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl RemoteChannel for ScriptedChannel {
    fn execute(&self, host: &Host, command: &str, vars: &HashMap<String, String>) -> ExecHandle {
        self.calls.lock().unwrap().push(Invocation {
            host: host.name().to_string(),
            command: command.to_string(),
            vars: vars.clone(),
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(host.name().to_string(), command.to_string()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::default().until_canceled());

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(play(script, tx, cancel.clone()));
        ExecHandle::new(rx, cancel)
    }
}

/// Build a cluster of `hosts` reached through `channel`. Polling loops restart at once; a
/// disconnected host is retried after a second.
pub fn test_cluster(hosts: &[&str], channel: Arc<ScriptedChannel>) -> Arc<Cluster> {
    let mut config = Config::new();
    for host in hosts {
        config.add_host(HostConfig {
            hostname: host.to_string(),
            user: None,
        });
    }
    config.intervals = Intervals {
        crm_restart: 0,
        drbd_restart: 0,
        ping: 0,
        server_status: 0,
        no_dc_retry: 0,
        connect_retry: 1,
    };
    Arc::new(Cluster::from_config(&config, channel))
}

/// Wait until `condition` holds. Panics after 10 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
