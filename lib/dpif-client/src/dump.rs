// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Table walks.
//!
//! A dump asks the datapath for one entry at a time. The first request
//! carries no cursor; each following request carries the previous
//! entry as its cursor and sets `DUMP_CONTINUE`. The datapath ends the
//! walk with the `DUMP_DONE` status. Entries present for the whole walk
//! are returned; entries added or removed meanwhile may or may not be.
//!
//! ```text
//!   Start ──> Iterating ──> Done
//!     │           │
//!     └───────────┴──> Error
//! ```
//!
//! Any failure moves the walk to `Error`, discards the cursor, and
//! ends iteration. [`PortDump::restart`] and [`FlowDump::restart`]
//! return to `Start`.

use crate::DpifHdl;
use crate::Error;
use dpif_api::ActionList;
use dpif_api::DpifFlowStats;
use dpif_api::FlowCmd;
use dpif_api::FlowKey;
use dpif_api::FlowKeyBytes;
use dpif_api::FlowMessage;
use dpif_api::MsgFlags;
use dpif_api::Status;
use dpif_api::VportCmd;
use dpif_api::VportMessage;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DumpState {
    Start,
    Iterating,
    Done,
    Error,
}

/// The cursor of a vport walk: the last vport returned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PortDumpState {
    pub vport: VportMessage,
}

/// The cursor of a flow walk, plus scratch the walk reuses for every
/// entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowDumpState {
    /// The last flow returned.
    pub flow: FlowMessage,
    /// `flow`'s counters in datapath-interface form.
    pub stats: DpifFlowStats,
    /// The encoded key of `flow`, which is the next request's cursor.
    pub key_buf: FlowKeyBytes,
    pub actions_buf: ActionList,
}

impl Default for FlowDumpState {
    fn default() -> Self {
        Self {
            flow: FlowMessage::default(),
            stats: DpifFlowStats::default(),
            key_buf: FlowKey::default().id(),
            actions_buf: ActionList::new(),
        }
    }
}

/// An in-progress walk of the vport table.
///
/// Yields one `VportMessage` per vport. A failure is yielded once, after
/// which the walk is over until restarted.
#[derive(Debug)]
pub struct PortDump<'a> {
    hdl: &'a DpifHdl,
    state: DumpState,
    cursor: PortDumpState,
}

impl<'a> PortDump<'a> {
    pub(crate) fn new(hdl: &'a DpifHdl) -> Self {
        Self { hdl, state: DumpState::Start, cursor: Default::default() }
    }

    pub fn state(&self) -> DumpState {
        self.state
    }

    pub fn cursor(&self) -> &PortDumpState {
        &self.cursor
    }

    /// Begin the walk again from the first vport.
    pub fn restart(&mut self) {
        self.state = DumpState::Start;
        self.cursor = Default::default();
    }

    fn request(&self) -> VportMessage {
        let mut body = VportMessage::new(VportCmd::Dump);
        if self.state == DumpState::Iterating {
            body.flags = MsgFlags::DUMP_CONTINUE;
            body.port_no = self.cursor.vport.port_no;
        }
        body
    }
}

impl Iterator for PortDump<'_> {
    type Item = Result<VportMessage, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, DumpState::Done | DumpState::Error) {
            return None;
        }

        match self.hdl.vport_cmd(VportCmd::Dump, self.request()) {
            Ok(resp) if resp.status == Status::DUMP_DONE => {
                self.state = DumpState::Done;
                None
            }

            Ok(resp) => {
                self.state = DumpState::Iterating;
                self.cursor.vport = resp.body.clone();
                Some(Ok(resp.body))
            }

            Err(e) => {
                self.state = DumpState::Error;
                self.cursor = Default::default();
                Some(Err(e))
            }
        }
    }
}

/// An in-progress walk of the flow table.
///
/// Yields one `FlowMessage` per flow, with its actions and counters.
#[derive(Debug)]
pub struct FlowDump<'a> {
    hdl: &'a DpifHdl,
    state: DumpState,
    cursor: FlowDumpState,
}

impl<'a> FlowDump<'a> {
    pub(crate) fn new(hdl: &'a DpifHdl) -> Self {
        Self { hdl, state: DumpState::Start, cursor: Default::default() }
    }

    pub fn state(&self) -> DumpState {
        self.state
    }

    pub fn cursor(&self) -> &FlowDumpState {
        &self.cursor
    }

    pub fn restart(&mut self) {
        self.state = DumpState::Start;
        self.cursor = Default::default();
    }

    fn request(&self) -> FlowMessage {
        match self.state {
            DumpState::Iterating => FlowMessage {
                flags: MsgFlags::DUMP_CONTINUE,
                ..FlowMessage::new(FlowCmd::Dump, self.cursor.key_buf.key())
            },
            _ => FlowMessage::new(FlowCmd::Dump, FlowKey::default()),
        }
    }
}

impl Iterator for FlowDump<'_> {
    type Item = Result<FlowMessage, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, DumpState::Done | DumpState::Error) {
            return None;
        }

        match self.hdl.flow_cmd(FlowCmd::Dump, self.request()) {
            Ok(resp) if resp.status == Status::DUMP_DONE => {
                self.state = DumpState::Done;
                None
            }

            Ok(resp) => {
                let flow = resp.body;
                self.state = DumpState::Iterating;
                self.cursor.stats = DpifFlowStats::from(flow.stats);
                self.cursor.key_buf = flow.key.id();
                self.cursor.actions_buf.clone_from(&flow.actions);
                self.cursor.flow = flow.clone();
                Some(Ok(flow))
            }

            Err(e) => {
                self.state = DumpState::Error;
                self.cursor = Default::default();
                Some(Err(e))
            }
        }
    }
}
