// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Datapath configuration.

use serde::Deserialize;
use serde::Serialize;
use std::num::NonZeroU32;
use std::path::Path;
use thiserror::Error;

pub const PORT_TABLE_DEF_MAX_ENTRIES: u32 = 1024;
pub const FLOW_TABLE_DEF_MAX_ENTRIES: u32 = 8192;

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("failed to read {path}: {err}")]
    Io { path: String, err: std::io::Error },

    #[error("bad config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables of a [`crate::Datapath`] and its transport.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineCfg {
    /// Maximum number of vports.
    pub max_ports: NonZeroU32,
    /// Maximum number of installed flows.
    pub max_flows: NonZeroU32,
    /// Depth of each request and response channel.
    pub channel_depth: usize,
    /// Depth of the upcall queue; upcalls beyond it are dropped.
    pub upcall_depth: usize,
    /// Packets held per port transmit queue before tail drop.
    pub tx_queue_depth: usize,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            max_ports: NonZeroU32::new(PORT_TABLE_DEF_MAX_ENTRIES)
                .unwrap_or(NonZeroU32::MIN),
            max_flows: NonZeroU32::new(FLOW_TABLE_DEF_MAX_ENTRIES)
                .unwrap_or(NonZeroU32::MIN),
            channel_depth: 64,
            upcall_depth: 256,
            tx_queue_depth: 512,
        }
    }
}

impl EngineCfg {
    pub fn from_toml(s: &str) -> Result<Self, CfgError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, CfgError> {
        let s = std::fs::read_to_string(path).map_err(|err| CfgError::Io {
            path: path.display().to_string(),
            err,
        })?;
        Self::from_toml(&s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg = EngineCfg::from_toml("max_flows = 4\nupcall_depth = 1\n")
            .unwrap();
        assert_eq!(cfg.max_flows.get(), 4);
        assert_eq!(cfg.upcall_depth, 1);
        assert_eq!(cfg.max_ports.get(), PORT_TABLE_DEF_MAX_ENTRIES);
    }

    #[test]
    fn reject_unknown_and_zero() {
        assert!(EngineCfg::from_toml("max_flow = 4").is_err());
        assert!(EngineCfg::from_toml("max_ports = 0").is_err());
    }
}
