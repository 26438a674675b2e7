// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A reference datapath speaking the dpif message protocol.
//!
//! The datapath keeps a bounded port table and a bounded flow table,
//! serves vport, flow and packet requests from a single thread, and
//! offers [`Datapath::receive`] as the entry point of the packet path.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cfg;
pub mod checksum;
pub mod datapath;
pub mod server;
pub mod stat;
pub mod table;
pub mod xform;

pub use cfg::EngineCfg;
pub use datapath::Datapath;
pub use datapath::DatapathStats;
pub use datapath::Verdict;
pub use server::Server;
pub use server::spawn;
