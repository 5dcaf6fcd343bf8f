// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use super::strip_reset_markers;

pub const FRAME_START: &str = "---start---";
pub const FRAME_END: &str = "---done---";

/// The whole frame the status script sends when it could not get the cluster status.
pub const ERROR_FRAME: &str = "---start---\r\nerror\r\n\r\n---done---\r\n";

/// Text the status script reports when the cluster stack is not running on the host.
const STACK_STOPPED: &str = "is stopped";

/// A complete CRM status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmRecord {
    /// A status frame, including its start and end markers.
    Status(String),

    /// The literal error frame.
    Error,

    /// The cluster stack is stopped on the reporting host.
    Stopped,
}

/// Accumulates the output of the CRM status command and cuts it into frames delimited by
/// `---start---` and `---done---`.
///
/// When more than one complete frame is buffered only the last one is returned: everything
/// before it is stale and dropped.
#[derive(Debug, Default)]
pub struct CrmFrameBuffer {
    buffer: String,
}

impl CrmFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        strip_reset_markers(&mut self.buffer);
    }

    /// Take the newest complete frame out of the buffer, if there is one. Anything after that
    /// frame stays buffered.
    pub fn next_record(&mut self) -> Option<CrmRecord> {
        let end = self.last_complete_frame_end()?;

        let Some(start) = self.buffer[..end].rfind(FRAME_START) else {
            log::debug!("dropping crm status output without start marker");
            self.buffer.drain(..end);
            return None;
        };

        let frame = self.buffer[start..end].to_string();
        self.buffer.drain(..end);

        Some(if frame == ERROR_FRAME {
            CrmRecord::Error
        } else if frame.contains(STACK_STOPPED) {
            CrmRecord::Stopped
        } else {
            CrmRecord::Status(frame)
        })
    }

    /// Byte offset just past the line terminator of the last `---done---` marker that already has
    /// its terminator.
    fn last_complete_frame_end(&self) -> Option<usize> {
        self.buffer
            .rmatch_indices(FRAME_END)
            .find_map(|(pos, _)| {
                let after = pos + FRAME_END.len();
                let tail = &self.buffer[after..];
                if tail.starts_with("\r\n") {
                    Some(after + 2)
                } else if tail.starts_with('\n') {
                    Some(after + 1)
                } else {
                    None
                }
            })
    }

    /// Output received so far that is not part of a complete frame.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
