// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! dpif datapath administration library

pub mod scenario;

use dpif_api::FlowMessage;
use dpif_api::MsgFlags;
use dpif_api::TcpFlags;
use dpif_api::VportMessage;
use dpif_client::DpifHdl;
use dpif_client::Error;
use dpif_engine::Datapath;
use dpif_engine::Verdict;
use dpif_link::ClientLink;
use scenario::PortMap;
use scenario::Scenario;
use scenario::ScenarioError;
use scenario::frame_for;
use slog::Logger;
use slog::info;
use std::ops::Deref;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    Client(#[from] Error),
}

/// What happened to the packets a scenario injected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Replay {
    pub hits: u64,
    pub upcalls: u64,
    pub lost: u64,
    pub no_port: u64,
    /// Upcalls read back from the datapath.
    pub received: u64,
}

/// The handle used to send administration commands to a datapath.
#[derive(Debug)]
pub struct DpifAdm {
    hdl: DpifHdl,
    log: Logger,
}

impl Deref for DpifAdm {
    type Target = DpifHdl;

    fn deref(&self) -> &Self::Target {
        &self.hdl
    }
}

impl DpifAdm {
    pub fn new(link: ClientLink, log: Logger) -> Self {
        Self { hdl: DpifHdl::with_log(link, log.clone()), log }
    }

    /// Every vport, in table order.
    pub fn ports(&self) -> Result<Vec<VportMessage>, Error> {
        self.port_dump().collect()
    }

    /// Every flow, in table order.
    pub fn flows(&self) -> Result<Vec<FlowMessage>, Error> {
        self.flow_dump().collect()
    }

    /// Create the scenario's ports and install its flows, returning the
    /// port numbers the datapath assigned.
    pub fn apply(&self, sc: &Scenario) -> Result<PortMap, AdmError> {
        let mut ports = PortMap::new();
        for spec in &sc.ports {
            let port =
                self.port_new(&spec.name, spec.vport_type()?, spec.port_no)?;
            info!(self.log, "created port";
                "name" => &spec.name, "port_no" => port.port_no);
            ports.insert(spec.name.clone(), port.port_no);
        }

        for spec in &sc.flows {
            let key = spec.key.to_key(&ports)?;
            let actions = spec.to_actions(&ports)?;
            self.flow_put(&key, &actions, MsgFlags::CREATE, false)?;
            info!(self.log, "installed flow";
                "key" => %key, "actions" => %actions);
        }

        Ok(ports)
    }

    /// Push the scenario's packets through `dp`'s packet path, then
    /// collect the upcalls they raised.
    pub fn replay(
        &self,
        sc: &Scenario,
        ports: &PortMap,
        dp: &Datapath,
    ) -> Result<Replay, AdmError> {
        let mut replay = Replay::default();
        for spec in &sc.packets {
            let key = spec.key.to_key(ports)?;
            let pkt = frame_for(&key, spec.len);
            for _ in 0..spec.count {
                match dp.receive(&key, &pkt, TcpFlags::empty()) {
                    Verdict::Hit { .. } => replay.hits += 1,
                    Verdict::Upcall => replay.upcalls += 1,
                    Verdict::Lost => replay.lost += 1,
                    Verdict::NoPort => replay.no_port += 1,
                }
            }
        }

        while let Some((up, pkt)) = self.try_recv_upcall()? {
            info!(self.log, "upcall";
                "cmd" => %up.cmd, "key" => %up.key, "len" => pkt.len());
            replay.received += 1;
        }

        Ok(replay)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    const SCENARIO: &str = r#"
        [[ports]]
        name = "eth0"

        [[ports]]
        name = "eth1"

        [[flows]]
        in_port = "eth0"
        ip_proto = 17
        tran_dst_port = 53
        actions = [{ type = "output", port = "eth1" }]

        [[packets]]
        in_port = "eth0"
        ip_proto = 17
        tran_dst_port = 53
        count = 4

        [[packets]]
        in_port = "eth1"
        ip_proto = 17
        tran_dst_port = 53
        count = 2
    "#;

    #[test]
    fn apply_and_replay() {
        let log = Logger::root(slog::Discard, o!());
        let sc = Scenario::from_toml(SCENARIO).unwrap();
        let (link, dp, engine) =
            dpif_engine::spawn(sc.engine.clone(), &log).unwrap();
        let adm = DpifAdm::new(link, log);

        let ports = adm.apply(&sc).unwrap();
        assert_eq!(ports["eth0"], 0);
        assert_eq!(ports["eth1"], 1);

        let replay = adm.replay(&sc, &ports, &dp).unwrap();
        assert_eq!(
            replay,
            Replay {
                hits: 4,
                upcalls: 2,
                lost: 0,
                no_port: 0,
                received: 2
            }
        );

        let flows = adm.flows().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].stats.packet_count, 4);
        assert_eq!(adm.ports().unwrap()[1].stats.tx, 4);

        drop(adm);
        engine.join().unwrap();
    }
}
