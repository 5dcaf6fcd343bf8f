// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod crm;
pub mod dc;
pub mod drbd;
pub mod host;
pub mod parser;
pub mod poller;
pub mod probe;
pub mod remote;
pub mod store;
pub mod test_env;

/// Gets the port that remote hosts accept SSH connections on.
pub fn remote_port() -> u16 {
    match std::env::var("HASTAT_PORT") {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("HASTAT_PORT '{port}' is not a valid port number, using 22");
            22
        }),
        Err(_) => 22,
    }
}

pub fn default_config_path() -> String {
    match std::env::var("HASTAT_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/hastat/hastat.conf".to_string(),
    }
}

pub fn default_ssh_binary() -> String {
    match std::env::var("HASTAT_SSH") {
        Ok(ssh) => ssh,
        Err(_) => "ssh".to_string(),
    }
}
