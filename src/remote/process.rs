// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, os::unix::process::ExitStatusExt, process::Stdio};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::{CommandTemplates, ExecEvent, ExecHandle, RemoteChannel, EXIT_CONNECTION_LOST};
use crate::host::Host;

/// Runs commands on the hosts through the ssh client.
#[derive(Debug)]
pub struct ProcessChannel {
    ssh: String,
    templates: CommandTemplates,
}

impl ProcessChannel {
    pub fn new(ssh: &str, templates: CommandTemplates) -> Self {
        ProcessChannel {
            ssh: ssh.to_string(),
            templates,
        }
    }
}

/// Take the decodable part out of `pending`, leaving an incomplete trailing character for the
/// next read. Invalid sequences become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(s) => {
                out.push_str(s);
                start = pending.len();
            }
            Err(e) => {
                let valid = start + e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[start..valid]));
                let Some(len) = e.error_len() else {
                    start = valid;
                    break;
                };
                out.push(char::REPLACEMENT_CHARACTER);
                start = valid + len;
            }
        }
    }
    pending.drain(..start);
    out
}

fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        log::debug!("could not terminate command {pid}: {e}");
    }
}

async fn run(mut cmd: Command, events: mpsc::UnboundedSender<ExecEvent>, cancel: CancellationToken) {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = events.send(ExecEvent::DoneError {
                output: format!("could not start command: {e}"),
                exit_code: EXIT_CONNECTION_LOST,
            });
            return;
        }
    };

    let mut pending = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = [0u8; 4096];
        let mut canceled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !canceled => {
                    canceled = true;
                    terminate(&child);
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let chunk = take_utf8(&mut pending);
                        if !chunk.is_empty() {
                            let _ = events.send(ExecEvent::Output(chunk));
                        }
                    }
                    Err(e) => {
                        log::warn!("error reading command output: {e}");
                        break;
                    }
                },
            }
        }
    }

    let rest = String::from_utf8_lossy(&pending).into_owned();
    let event = match child.wait().await {
        Ok(status) if status.success() => ExecEvent::Done(rest),
        Ok(status) => ExecEvent::DoneError {
            output: rest,
            exit_code: status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(-1),
        },
        Err(e) => ExecEvent::DoneError {
            output: format!("{rest}{e}"),
            exit_code: -1,
        },
    };
    let _ = events.send(event);
}

impl RemoteChannel for ProcessChannel {
    fn execute(&self, host: &Host, command: &str, vars: &HashMap<String, String>) -> ExecHandle {
        let script = match self.templates.render(command, host, vars) {
            Ok(script) => script,
            Err(e) => return ExecHandle::failed(e.to_string(), -1),
        };
        log::trace!("{}: running '{script}'", host.name());

        let mut cmd = Command::new(&self.ssh);
        cmd.args(["-o", "BatchMode=yes", "-p"])
            .arg(host.port().to_string())
            .arg(host.destination())
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(cmd, tx, cancel.clone()));
        ExecHandle::new(rx, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_split_across_reads() {
        let bytes = "né".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut pending), "n");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_byte_keeps_partial_tail() {
        let e = "é".as_bytes();
        let mut pending = b"a\xffn".to_vec();
        pending.push(e[0]);
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}n");
        assert_eq!(pending, [e[0]]);

        pending.push(e[1]);
        pending.extend_from_slice(b"\xfe\xff");
        assert_eq!(take_utf8(&mut pending), "é\u{FFFD}\u{FFFD}");
        assert!(pending.is_empty());
    }

    /// A stand-in for the ssh client that runs the command locally.
    fn fake_ssh(name: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("hastat-fake-ssh-{name}-{}", std::process::id()));
        // -o BatchMode=yes -p <port> <destination> <command>
        std::fs::write(&path, "#!/bin/sh\nshift 5\nexec sh -c \"$1\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn local_channel(name: &str, command: &str) -> ProcessChannel {
        ProcessChannel::new(
            &fake_ssh(name),
            CommandTemplates::with_overrides(&HashMap::from([(
                "Test".to_string(),
                command.to_string(),
            )])),
        )
    }

    #[test]
    fn local_command_output() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let host = Host::new("node1", Some(22), None);

            let channel = local_channel("echo", "echo hello @HOST@");
            let out = crate::remote::run_to_completion(channel.execute(&host, "Test", &HashMap::new()))
                .await
                .unwrap();
            assert_eq!(out, "hello node1\n");

            let channel = local_channel("fail", "echo oops; exit 3");
            let out =
                crate::remote::run_to_completion(channel.execute(&host, "Test", &HashMap::new())).await;
            assert!(matches!(
                out,
                Err(crate::remote::ExecError::Failed { exit_code: 3, output }) if output == "oops\n"
            ));
        });
    }

    #[test]
    fn cancel_terminates_command() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let host = Host::new("node1", Some(22), None);
            let channel = local_channel("sleep", "exec sleep 30");
            let mut handle = channel.execute(&host, "Test", &HashMap::new());
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            handle.cancel();

            let event = tokio::time::timeout(std::time::Duration::from_secs(10), handle.next())
                .await
                .unwrap();
            assert_eq!(
                event,
                Some(ExecEvent::DoneError {
                    output: String::new(),
                    exit_code: 143
                })
            );
        });
    }
}
