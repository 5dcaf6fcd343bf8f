// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Incremental parsing of the output of the long running status commands.
//!
//! The remote side delivers its output in chunks with no alignment to record boundaries. The
//! buffers in this module accumulate chunks and hand out complete records in arrival order.

pub mod crm;
pub mod drbd;
pub mod hwinfo;
pub mod proxy;

use thiserror::Error;

pub use {
    crm::{CrmFrameBuffer, CrmRecord},
    drbd::{DrbdLineBuffer, DrbdRecord},
    hwinfo::{HwInfo, VmInfo},
    proxy::ProxyConfig,
};

/// Liveness pulse that the remote status scripts inject into their output. It carries no data
/// and is removed wherever it appears.
pub const RESET_MARKER: &str = "---reset---\r\n";

/// Errors raised while parsing configuration data received from a host.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{section} config: unexpected token: '{found}', expected '{expected}'")]
    UnexpectedToken {
        section: &'static str,
        found: String,
        expected: &'static str,
    },

    #[error("{0} config: block is never closed")]
    Unterminated(&'static str),

    #[error("{0} config: statement is not terminated by ';'")]
    UnterminatedStatement(&'static str),

    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("element '{element}' is missing attribute '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Remove every complete reset marker from `buffer`. A marker that is cut in half by a chunk
/// boundary stays until the next chunk completes it.
pub(crate) fn strip_reset_markers(buffer: &mut String) {
    while let Some(pos) = buffer.find(RESET_MARKER) {
        buffer.replace_range(pos..pos + RESET_MARKER.len(), "");
    }
}
