// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The request-serving loop.

use crate::cfg::EngineCfg;
use crate::datapath::Datapath;
use crossbeam_channel::select;
use dpif_api::DpifError;
use dpif_api::Family;
use dpif_api::FamilyMsg;
use dpif_api::FlowMessage;
use dpif_api::PacketMessage;
use dpif_api::Request;
use dpif_api::Response;
use dpif_api::VportMessage;
use dpif_link::ClientLink;
use dpif_link::EngineEnd;
use dpif_link::EngineLink;
use dpif_link::Frame;
use dpif_link::LinkError;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A family body the server can fill in when it rejects a request
/// without having decoded it.
pub trait RejectBody: FamilyMsg + Default {
    fn with_id(id: Option<u32>) -> Self;
}

impl RejectBody for VportMessage {
    fn with_id(id: Option<u32>) -> Self {
        Self { id: id.unwrap_or_default(), ..Default::default() }
    }
}

impl RejectBody for FlowMessage {
    fn with_id(id: Option<u32>) -> Self {
        Self { id: id.unwrap_or_default(), ..Default::default() }
    }
}

impl RejectBody for PacketMessage {
    fn with_id(_id: Option<u32>) -> Self {
        Self::default()
    }
}

/// Owns the datapath's ends of the transport and answers requests one
/// at a time.
pub struct Server {
    dp: Arc<Datapath>,
    vport: EngineEnd<VportMessage>,
    flow: EngineEnd<FlowMessage>,
    packet: EngineEnd<PacketMessage>,
    log: Logger,
}

impl Server {
    pub fn new(dp: Arc<Datapath>, link: EngineLink, log: Logger) -> Self {
        let EngineLink { vport, flow, packet, upcall: _ } = link;
        Self { dp, vport, flow, packet, log }
    }

    /// Serve until the vswitch side hangs up.
    pub fn run(self) {
        info!(self.log, "serving");

        loop {
            let (family, frame) = select! {
                recv(self.vport.receiver()) -> f => (Family::Vport, f),
                recv(self.flow.receiver()) -> f => (Family::Flow, f),
                recv(self.packet.receiver()) -> f => (Family::Packet, f),
            };

            let Ok(frame) = frame else {
                break;
            };

            let res = match family {
                Family::Vport => self.dispatch(&self.vport, &frame, |req, _| {
                    self.dp.handle_vport(req)
                }),
                Family::Flow => self.dispatch(&self.flow, &frame, |req, _| {
                    self.dp.handle_flow(req)
                }),
                Family::Packet => {
                    self.dispatch(&self.packet, &frame, |req, pkt| {
                        self.dp.handle_packet(req, pkt)
                    })
                }
            };

            if let Err(e) = res {
                warn!(self.log, "reply failed"; "err" => %e);
                if matches!(e, LinkError::Disconnected(_)) {
                    break;
                }
            }
        }

        info!(self.log, "client disconnected, stopping");
    }

    /// Decode a request frame and hand it to `handle`. A frame that
    /// does not decode is answered with `-EPROTO` and never applied.
    fn dispatch<M, F>(
        &self,
        end: &EngineEnd<M>,
        frame: &Frame,
        handle: F,
    ) -> Result<(), LinkError>
    where
        M: RejectBody,
        F: FnOnce(&Request<M>, &[u8]) -> Response<M>,
    {
        let family = M::FAMILY;
        let resp = match frame.request::<M>() {
            Ok(req) => handle(&req, frame.payload()),
            Err(e) => {
                warn!(self.log, "undecodable request";
                    "family" => %family, "len" => frame.len(), "err" => %e);
                let err = DpifError::DecodeReq(e.to_string());
                Response::new(err.status(), M::with_id(frame.raw_id()))
            }
        };

        debug!(self.log, "reply";
            "family" => %family, "status" => %resp.status);
        end.reply(&resp, &[])
    }
}

/// Start a datapath on its own thread.
///
/// Returns the vswitch's end of the transport, a handle to the
/// datapath for driving the packet path, and the serving thread.
pub fn spawn(
    cfg: EngineCfg,
    log: &Logger,
) -> std::io::Result<(ClientLink, Arc<Datapath>, JoinHandle<()>)> {
    let (client, engine) =
        dpif_link::link(cfg.channel_depth, cfg.upcall_depth);
    let dp = Arc::new(Datapath::new(
        cfg,
        engine.upcall.clone(),
        log.new(o!("component" => "datapath")),
    ));
    let server = Server::new(
        Arc::clone(&dp),
        engine,
        log.new(o!("component" => "server")),
    );

    let hdl = std::thread::Builder::new()
        .name("dpif-engine".into())
        .spawn(move || server.run())?;

    Ok((client, dp, hdl))
}
