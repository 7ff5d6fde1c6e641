#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct System {
    /// Unix socket the probe collaborator streams raw event records on.
    pub socket: PathBuf,

    /// Page size override in bytes. Unset means the system page size.
    pub pagesize: Option<u64>,
}

impl Default for System {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/vmtrace/probe.sock"),
            pagesize: None,
        }
    }
}
