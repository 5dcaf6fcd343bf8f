// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use super::strip_reset_markers;

/// Sent instead of any status when the DRBD kernel module is not loaded on the host.
pub const NO_MODULE: &str = "--nm--";

pub const CONFIG_TAG: &str = "drbd:";
pub const EVENT_TAG: &str = "event:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrbdRecord {
    /// A full configuration dump; the payload is the XML document.
    Config(String),

    /// A single incremental event line, without its tag.
    Event(String),

    /// The DRBD module is not present on the host.
    NoModule,
}

/// Accumulates the output of the DRBD status command, which is line oriented. Every line starts
/// with a tag telling whether it carries a configuration dump or an event.
#[derive(Debug, Default)]
pub struct DrbdLineBuffer {
    buffer: String,
}

impl DrbdLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        strip_reset_markers(&mut self.buffer);
    }

    /// Take the next complete tagged line out of the buffer. An unterminated trailing line stays
    /// buffered until the rest of it arrives.
    ///
    /// After `NoModule` is returned the rest of the buffered output is discarded.
    pub fn next_record(&mut self) -> Option<DrbdRecord> {
        loop {
            let Some(newline) = self.buffer.find('\n') else {
                if self.buffer.trim() == NO_MODULE {
                    self.buffer.clear();
                    return Some(DrbdRecord::NoModule);
                }
                return None;
            };

            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.trim() == NO_MODULE {
                self.buffer.clear();
                return Some(DrbdRecord::NoModule);
            }
            if let Some(xml) = line.strip_prefix(CONFIG_TAG) {
                return Some(DrbdRecord::Config(xml.to_string()));
            }
            if let Some(event) = line.strip_prefix(EVENT_TAG) {
                return Some(DrbdRecord::Event(event.trim().to_string()));
            }
            if !line.trim().is_empty() {
                log::trace!("ignoring untagged drbd status line: '{line}'");
            }
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
