// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The channel used to run commands on cluster hosts.
//!
//! A command is started with [`RemoteChannel::execute`], which returns at once. Its output then
//! arrives as a sequence of [`ExecEvent`]s on the returned [`ExecHandle`]: any number of output
//! chunks followed by exactly one completion event.

pub mod process;

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::host::Host;

pub use process::ProcessChannel;

pub const DRBD_STATUS: &str = "DrbdStatus";
pub const CRM_STATUS: &str = "CrmStatus";
pub const PING: &str = "Ping";
pub const HW_INFO: &str = "HwInfo";
pub const PTEST: &str = "Ptest";
pub const DRBD_TEST: &str = "DrbdTest";

/// Exit code of a command that was terminated with SIGTERM.
pub const EXIT_TERMINATED: i32 = 143;

/// Exit code the status scripts use when they are told to stop.
pub const EXIT_STOPPED: i32 = 100;

/// Exit code of ssh when the connection failed or was lost.
pub const EXIT_CONNECTION_LOST: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// A chunk of output. Chunks are not aligned to lines or records.
    Output(String),

    /// The command finished successfully. Carries output not yet delivered as a chunk.
    Done(String),

    /// The command finished with a non-zero exit code.
    DoneError { output: String, exit_code: i32 },
}

/// How a command ended, as far as the status pollers are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// The command was stopped on purpose.
    Intentional,
    /// The connection to the host is probably gone.
    ConnectionLost,
    Failed,
}

impl ExitKind {
    pub fn from_code(exit_code: i32) -> Self {
        match exit_code {
            0 => ExitKind::Success,
            EXIT_TERMINATED | EXIT_STOPPED => ExitKind::Intentional,
            EXIT_CONNECTION_LOST => ExitKind::ConnectionLost,
            _ => ExitKind::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' has unresolved placeholder {placeholder}")]
    Unresolved { command: String, placeholder: String },

    #[error("command failed with exit code {exit_code}: {output}")]
    Failed { exit_code: i32, output: String },

    #[error("channel closed before the command finished")]
    Closed,

    #[error("could not start command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The receiving end of a running command.
#[derive(Debug)]
pub struct ExecHandle {
    events: mpsc::UnboundedReceiver<ExecEvent>,
    cancel: CancellationToken,
}

impl ExecHandle {
    pub fn new(events: mpsc::UnboundedReceiver<ExecEvent>, cancel: CancellationToken) -> Self {
        ExecHandle { events, cancel }
    }

    /// A handle whose command ends at once with `exit_code`, without running anything.
    pub fn failed(output: String, exit_code: i32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ExecEvent::DoneError { output, exit_code });
        ExecHandle::new(rx, CancellationToken::new())
    }

    /// The next event, or None once the command has finished and every event was received.
    pub async fn next(&mut self) -> Option<ExecEvent> {
        self.events.recv().await
    }

    /// Ask for the command to be stopped. The command still delivers its completion event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs commands on cluster hosts.
pub trait RemoteChannel: Send + Sync + std::fmt::Debug {
    /// Start the command registered under `command` on `host`, with the given `@NAME@`
    /// substitutions.
    fn execute(&self, host: &Host, command: &str, vars: &HashMap<String, String>) -> ExecHandle;
}

/// Wait for a command to finish and collect all of its output.
pub async fn run_to_completion(mut handle: ExecHandle) -> Result<String, ExecError> {
    let mut output = String::new();
    while let Some(event) = handle.next().await {
        match event {
            ExecEvent::Output(chunk) => output.push_str(&chunk),
            ExecEvent::Done(rest) => {
                output.push_str(&rest);
                return Ok(output);
            }
            ExecEvent::DoneError {
                output: rest,
                exit_code,
            } => {
                output.push_str(&rest);
                return Err(ExecError::Failed { exit_code, output });
            }
        }
    }
    Err(ExecError::Closed)
}

/// Shell commands by name, with `@NAME@` placeholders.
#[derive(Debug, Clone)]
pub struct CommandTemplates {
    templates: HashMap<String, String>,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        let templates = [
            (DRBD_STATUS, "/usr/local/bin/hastat-helper drbd-status"),
            (CRM_STATUS, "/usr/local/bin/hastat-helper crm-status"),
            (PING, "echo pong"),
            (HW_INFO, "/usr/local/bin/hastat-helper hw-info"),
            (PTEST, "crm_simulate -S -L"),
            (DRBD_TEST, "drbdadm -d @ACTION@ @RESOURCE@"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        CommandTemplates { templates }
    }
}

impl CommandTemplates {
    /// The built-in templates, overridden by `overrides`.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut templates = Self::default();
        templates.templates.extend(overrides.clone());
        templates
    }

    /// Resolve a template for `host`. `@HOST@` and `@PORT@` are always available.
    pub fn render(
        &self,
        command: &str,
        host: &Host,
        vars: &HashMap<String, String>,
    ) -> Result<String, ExecError> {
        let mut rendered = self
            .templates
            .get(command)
            .ok_or_else(|| ExecError::UnknownCommand(command.to_string()))?
            .replace("@HOST@", host.name())
            .replace("@PORT@", &host.port().to_string());

        for (name, value) in vars {
            rendered = rendered.replace(&format!("@{name}@"), value);
        }

        if let Ok(re) = Regex::new(r"@[A-Z][A-Z_]*@") {
            if let Some(m) = re.find(&rendered) {
                return Err(ExecError::Unresolved {
                    command: command.to_string(),
                    placeholder: m.as_str().to_string(),
                });
            }
        }

        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitKind::from_code(0), ExitKind::Success);
        assert_eq!(ExitKind::from_code(143), ExitKind::Intentional);
        assert_eq!(ExitKind::from_code(100), ExitKind::Intentional);
        assert_eq!(ExitKind::from_code(255), ExitKind::ConnectionLost);
        assert_eq!(ExitKind::from_code(1), ExitKind::Failed);
    }

    #[test]
    fn render_templates() {
        let host = Host::new("node1", Some(2222), None);
        let templates = CommandTemplates::with_overrides(&vars(&[(
            "Custom",
            "check @HOST@:@PORT@ @RESOURCE@",
        )]));

        assert_eq!(
            templates
                .render("Custom", &host, &vars(&[("RESOURCE", "r0")]))
                .unwrap(),
            "check node1:2222 r0"
        );
        assert!(matches!(
            templates.render("Custom", &host, &HashMap::new()),
            Err(ExecError::Unresolved { placeholder, .. }) if placeholder == "@RESOURCE@"
        ));
        assert!(matches!(
            templates.render("Nope", &host, &HashMap::new()),
            Err(ExecError::UnknownCommand(_))
        ));
        assert_eq!(
            templates.render(PING, &host, &HashMap::new()).unwrap(),
            "echo pong"
        );
    }

    #[test]
    fn collect_output() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(ExecEvent::Output("a".to_string())).unwrap();
            tx.send(ExecEvent::Output("b".to_string())).unwrap();
            tx.send(ExecEvent::Done("c".to_string())).unwrap();
            let out = run_to_completion(ExecHandle::new(rx, CancellationToken::new())).await;
            assert_eq!(out.unwrap(), "abc");

            let out = run_to_completion(ExecHandle::failed("boom".to_string(), 2)).await;
            assert!(matches!(out, Err(ExecError::Failed { exit_code: 2, .. })));

            let (tx, rx) = mpsc::unbounded_channel();
            drop(tx);
            let out = run_to_completion(ExecHandle::new(rx, CancellationToken::new())).await;
            assert!(matches!(out, Err(ExecError::Closed)));
        });
    }
}
