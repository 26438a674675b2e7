// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The vswitch side of the dpif protocol.
//!
//! A [`DpifHdl`] owns the client end of a transport and turns each
//! control operation into one request/response round trip. The handle
//! is `Sync`: any number of threads may issue requests at once, and
//! responses are matched back to their senders by the message id.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod dump;
pub mod print;

pub use dump::DumpState;
pub use dump::FlowDump;
pub use dump::FlowDumpState;
pub use dump::PortDump;
pub use dump::PortDumpState;

use dpif_api::ActionList;
use dpif_api::DecodeError;
use dpif_api::DpifError;
use dpif_api::EncodeError;
use dpif_api::FamilyMsg;
use dpif_api::FlowCmd;
use dpif_api::FlowKey;
use dpif_api::FlowMessage;
use dpif_api::MsgFlags;
use dpif_api::PORT_NO_ANY;
use dpif_api::PacketCmd;
use dpif_api::PacketMessage;
use dpif_api::PortName;
use dpif_api::Request;
use dpif_api::Response;
use dpif_api::Upcall;
use dpif_api::VportCmd;
use dpif_api::VportMessage;
use dpif_api::VportStats;
use dpif_api::VportType;
use dpif_link::ClientEnd;
use dpif_link::ClientLink;
use dpif_link::Frame;
use dpif_link::LinkError;
use dpif_link::UpcallRx;
use slog::Logger;
use slog::debug;
use slog::o;
use std::collections::BTreeMap;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// A command of any family, for error reporting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Vport(VportCmd),
    Flow(FlowCmd),
    Packet(PacketCmd),
}

impl From<VportCmd> for Command {
    fn from(cmd: VportCmd) -> Self {
        Self::Vport(cmd)
    }
}

impl From<FlowCmd> for Command {
    fn from(cmd: FlowCmd) -> Self {
        Self::Flow(cmd)
    }
}

impl From<PacketCmd> for Command {
    fn from(cmd: PacketCmd) -> Self {
        Self::Packet(cmd)
    }
}

/// Errors related to talking to the datapath.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failed: {0}")]
    Link(#[from] LinkError),

    #[error("request encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("response decoding failed: {0}")]
    Decode(#[from] DecodeError),

    /// The datapath answered with a negative status.
    #[error("command {0:?} failed: {1}")]
    CommandError(Command, DpifError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct DemuxState {
    /// Some thread is blocked receiving on the channel.
    reading: bool,
    /// Frames received on behalf of other threads, by message id.
    pending: BTreeMap<u32, Frame>,
}

/// One family's response path, shared between threads.
///
/// Whichever waiter finds the channel idle becomes the reader. Frames
/// for other ids are parked in `pending` and their owners woken.
#[derive(Debug)]
struct Demux<M> {
    end: ClientEnd<M>,
    state: Mutex<DemuxState>,
    cv: Condvar,
}

impl<M: FamilyMsg> Demux<M> {
    fn new(end: ClientEnd<M>) -> Self {
        Self {
            end,
            state: Mutex::new(DemuxState {
                reading: false,
                pending: BTreeMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn transact(&self, req: &Request<M>) -> Result<Response<M>, Error> {
        // Vport and flow bodies always carry an id.
        let id = req.body.id().unwrap_or_default();
        self.end.send(req, &[])?;

        let mut st = lock(&self.state);
        loop {
            if let Some(frame) = st.pending.remove(&id) {
                return Ok(frame.response()?);
            }

            if st.reading {
                st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            st.reading = true;
            drop(st);
            let res = self.end.recv_frame();
            st = lock(&self.state);
            st.reading = false;
            self.cv.notify_all();

            let frame = res?;
            match frame.raw_id() {
                Some(rid) if rid == id => return Ok(frame.response()?),
                Some(rid) => {
                    st.pending.insert(rid, frame);
                }
                None => {
                    return Err(LinkError::ShortFrame { given: frame.len() }
                        .into());
                }
            }
        }
    }
}

/// The handle used to send control operations to the datapath.
#[derive(Debug)]
pub struct DpifHdl {
    vport: Demux<VportMessage>,
    flow: Demux<FlowMessage>,
    // Packet bodies carry no id, so one request is outstanding at a
    // time.
    packet: Mutex<ClientEnd<PacketMessage>>,
    upcall: UpcallRx,
    next_id: AtomicU32,
    log: Logger,
}

impl DpifHdl {
    pub fn new(link: ClientLink) -> Self {
        Self::with_log(link, Logger::root(slog::Discard, o!()))
    }

    pub fn with_log(link: ClientLink, log: Logger) -> Self {
        let ClientLink { vport, flow, packet, upcall } = link;
        Self {
            vport: Demux::new(vport),
            flow: Demux::new(flow),
            packet: Mutex::new(packet),
            upcall,
            next_id: AtomicU32::new(1),
            log,
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one vport command, returning the response on any
    /// non-negative status.
    pub(crate) fn vport_cmd(
        &self,
        cmd: VportCmd,
        mut body: VportMessage,
    ) -> Result<Response<VportMessage>, Error> {
        body.id = self.next_id();
        debug!(self.log, "vport request";
            "cmd" => ?cmd, "id" => body.id, "port_no" => body.port_no);
        let resp = self.vport.transact(&Request::new(cmd, body))?;
        if resp.status.is_err() {
            let err = DpifError::from_status(VportMessage::FAMILY, resp.status);
            return Err(Error::CommandError(cmd.into(), err));
        }
        Ok(resp)
    }

    /// Run one flow command, returning the response on any
    /// non-negative status.
    pub(crate) fn flow_cmd(
        &self,
        cmd: FlowCmd,
        mut body: FlowMessage,
    ) -> Result<Response<FlowMessage>, Error> {
        body.id = self.next_id();
        debug!(self.log, "flow request"; "cmd" => ?cmd, "id" => body.id);
        let resp = self.flow.transact(&Request::new(cmd, body))?;
        if resp.status.is_err() {
            let err = DpifError::from_status(FlowMessage::FAMILY, resp.status);
            return Err(Error::CommandError(cmd.into(), err));
        }
        Ok(resp)
    }

    /// Create a vport. With `port_no` of `None` the datapath picks the
    /// lowest free number.
    pub fn port_new(
        &self,
        name: &str,
        vport_type: VportType,
        port_no: Option<u32>,
    ) -> Result<VportMessage, Error> {
        let body = VportMessage {
            name: PortName::new(name)?,
            vport_type,
            port_no: port_no.unwrap_or(PORT_NO_ANY),
            ..VportMessage::new(VportCmd::New)
        };
        Ok(self.vport_cmd(VportCmd::New, body)?.body)
    }

    /// Delete a vport, returning its final state.
    pub fn port_del(&self, port_no: u32) -> Result<VportMessage, Error> {
        let body = VportMessage { port_no, ..VportMessage::new(VportCmd::Del) };
        Ok(self.vport_cmd(VportCmd::Del, body)?.body)
    }

    pub fn port_get(&self, port_no: u32) -> Result<VportMessage, Error> {
        let body = VportMessage { port_no, ..VportMessage::new(VportCmd::Get) };
        Ok(self.vport_cmd(VportCmd::Get, body)?.body)
    }

    pub fn port_get_by_name(&self, name: &str) -> Result<VportMessage, Error> {
        let body = VportMessage {
            name: PortName::new(name)?,
            ..VportMessage::new(VportCmd::Get)
        };
        Ok(self.vport_cmd(VportCmd::Get, body)?.body)
    }

    /// The counters of the vport named `name`.
    pub fn port_stats(&self, name: &str) -> Result<VportStats, Error> {
        Ok(self.port_get_by_name(name)?.stats)
    }

    /// Install or modify a flow.
    ///
    /// `flags` selects between creating (`CREATE`), replacing the
    /// actions of an existing flow (`MODIFY`), or either. With `clear`
    /// the counters of a modified flow are reset after being reported.
    pub fn flow_put(
        &self,
        key: &FlowKey,
        actions: &ActionList,
        flags: MsgFlags,
        clear: bool,
    ) -> Result<FlowMessage, Error> {
        let body = FlowMessage {
            flags,
            actions: actions.clone(),
            clear,
            ..FlowMessage::new(FlowCmd::New, *key)
        };
        Ok(self.flow_cmd(FlowCmd::New, body)?.body)
    }

    /// Read a flow's actions and counters, resetting the counters if
    /// `clear` is set.
    pub fn flow_get(
        &self,
        key: &FlowKey,
        clear: bool,
    ) -> Result<FlowMessage, Error> {
        let body =
            FlowMessage { clear, ..FlowMessage::new(FlowCmd::Get, *key) };
        Ok(self.flow_cmd(FlowCmd::Get, body)?.body)
    }

    /// Delete a flow, returning its final counters.
    pub fn flow_del(&self, key: &FlowKey) -> Result<FlowMessage, Error> {
        let body = FlowMessage::new(FlowCmd::Del, *key);
        Ok(self.flow_cmd(FlowCmd::Del, body)?.body)
    }

    /// Delete every flow.
    pub fn flow_flush(&self) -> Result<(), Error> {
        let body = FlowMessage::new(FlowCmd::Flush, FlowKey::default());
        self.flow_cmd(FlowCmd::Flush, body)?;
        Ok(())
    }

    /// Run `actions` on `packet` in the datapath, bypassing the flow
    /// table.
    pub fn execute(
        &self,
        actions: &ActionList,
        packet: &[u8],
    ) -> Result<(), Error> {
        let cmd = PacketCmd::Execute;
        let req = Request::new(cmd, PacketMessage::new(actions.clone()));
        debug!(self.log, "packet request";
            "actions" => actions.len(), "len" => packet.len());

        let end = lock(&self.packet);
        end.send(&req, packet)?;
        let resp = end.recv()?;
        if resp.status.is_err() {
            let err =
                DpifError::from_status(PacketMessage::FAMILY, resp.status);
            return Err(Error::CommandError(cmd.into(), err));
        }
        Ok(())
    }

    /// Block until the datapath sends an upcall.
    pub fn recv_upcall(&self) -> Result<(Upcall, Vec<u8>), Error> {
        Ok(self.upcall.recv()?)
    }

    /// Return a queued upcall, if any.
    pub fn try_recv_upcall(&self) -> Result<Option<(Upcall, Vec<u8>)>, Error> {
        Ok(self.upcall.try_recv()?)
    }

    /// Walk the vport table.
    pub fn port_dump(&self) -> PortDump<'_> {
        PortDump::new(self)
    }

    /// Walk the flow table.
    pub fn flow_dump(&self) -> FlowDump<'_> {
        FlowDump::new(self)
    }
}
