// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datapath: port and flow tables, the packet path, and the
//! command handlers.
//!
//! Table mutation happens only on the request-serving thread. The
//! packet path takes read locks just long enough to clone an `Arc` to
//! the entry it needs. A flow hit is accounted before that read lock
//! is released.

use crate::cfg::EngineCfg;
use crate::stat::FlowCounters;
use crate::stat::PortCounters;
use crate::table::Table;
use crate::xform;
use dpif_api::ActionList;
use dpif_api::DpifError;
use dpif_api::FlowCmd;
use dpif_api::FlowKey;
use dpif_api::FlowKeyBytes;
use dpif_api::FlowMessage;
use dpif_api::FlowStats;
use dpif_api::MsgFlags;
use dpif_api::PORT_NO_ANY;
use dpif_api::PacketCmd;
use dpif_api::PacketMessage;
use dpif_api::PortName;
use dpif_api::Request;
use dpif_api::Response;
use dpif_api::Status;
use dpif_api::TcpFlags;
use dpif_api::Upcall;
use dpif_api::UpcallCmd;
use dpif_api::VportCmd;
use dpif_api::VportExt;
use dpif_api::VportMessage;
use dpif_api::VportType;
use dpif_link::UpcallTx;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

type Result<T> = core::result::Result<T, DpifError>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A virtual port.
#[derive(Debug)]
pub struct Port {
    pub port_no: u32,
    pub name: PortName,
    pub vport_type: VportType,
    pub stats: PortCounters,
    txq: Mutex<VecDeque<Vec<u8>>>,
    txq_depth: usize,
}

impl Port {
    fn new(
        port_no: u32,
        name: PortName,
        vport_type: VportType,
        txq_depth: usize,
    ) -> Self {
        Self {
            port_no,
            name,
            vport_type,
            stats: PortCounters::default(),
            txq: Mutex::new(VecDeque::new()),
            txq_depth,
        }
    }

    /// Queue a packet for transmission, tail dropping when full.
    fn transmit(&self, pkt: Vec<u8>) -> bool {
        let mut q = self.txq.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() >= self.txq_depth {
            self.stats.tx_drop.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.stats.hit_tx(pkt.len() as u64);
        q.push_back(pkt);
        true
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        let mut q = self.txq.lock().unwrap_or_else(PoisonError::into_inner);
        q.drain(..).collect()
    }

    fn to_msg(&self, id: u32, cmd: u8) -> VportMessage {
        VportMessage {
            id,
            cmd,
            flags: MsgFlags::empty(),
            port_no: self.port_no,
            name: self.name.clone(),
            vport_type: self.vport_type,
            ext: VportExt::default(),
            stats: self.stats.snapshot(),
        }
    }
}

/// An installed flow. Modifying a flow swaps in a new `Flow` that
/// shares the old one's counters.
#[derive(Debug)]
pub struct Flow {
    pub key: FlowKey,
    pub actions: ActionList,
    pub stats: Arc<FlowCounters>,
}

/// What the packet path did with a received packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// A flow matched; the packet went out on this many ports.
    Hit { outputs: usize },
    /// No flow matched and the packet was handed to the vswitch.
    Upcall,
    /// No flow matched and the upcall queue was full.
    Lost,
    /// The ingress port does not exist.
    NoPort,
}

/// Datapath-wide counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DatapathStats {
    pub hits: u64,
    pub misses: u64,
    pub lost: u64,
}

#[derive(Debug, Default)]
struct DatapathCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    lost: AtomicU64,
}

pub struct Datapath {
    cfg: EngineCfg,
    log: Logger,
    epoch: Instant,
    ports: RwLock<Table<u32, Arc<Port>>>,
    flows: RwLock<Table<FlowKeyBytes, Arc<Flow>>>,
    upcall: UpcallTx,
    counters: DatapathCounters,
}

impl Datapath {
    pub fn new(cfg: EngineCfg, upcall: UpcallTx, log: Logger) -> Self {
        let ports = RwLock::new(Table::new(cfg.max_ports));
        let flows = RwLock::new(Table::new(cfg.max_flows));
        Self {
            cfg,
            log,
            epoch: Instant::now(),
            ports,
            flows,
            upcall,
            counters: DatapathCounters::default(),
        }
    }

    pub fn cfg(&self) -> &EngineCfg {
        &self.cfg
    }

    pub fn num_ports(&self) -> usize {
        read(&self.ports).len()
    }

    pub fn num_flows(&self) -> usize {
        read(&self.flows).len()
    }

    pub fn stats(&self) -> DatapathStats {
        DatapathStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            lost: self.counters.lost.load(Ordering::Relaxed),
        }
    }

    /// Milliseconds since the datapath started, never zero so that a
    /// used flow is distinguishable from an unused one.
    fn now_ms(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64).max(1)
    }

    fn port(&self, port_no: u32) -> Option<Arc<Port>> {
        read(&self.ports).get(&port_no).cloned()
    }

    fn port_by_name(&self, name: &PortName) -> Option<Arc<Port>> {
        read(&self.ports)
            .iter()
            .find(|(_, p)| &p.name == name)
            .map(|(_, p)| Arc::clone(p))
    }

    /// Take everything queued for transmission on `port_no`.
    pub fn take_tx(&self, port_no: u32) -> Option<Vec<Vec<u8>>> {
        self.port(port_no).map(|p| p.drain())
    }

    // ================================================================
    // Packet path
    // ================================================================

    /// Process a packet arriving on `key.in_port`.
    ///
    /// `key` is the packet's already-extracted flow key and
    /// `tcp_flags` its TCP flags, if any.
    pub fn receive(
        &self,
        key: &FlowKey,
        packet: &[u8],
        tcp_flags: TcpFlags,
    ) -> Verdict {
        let Some(port) = self.port(key.in_port) else {
            return Verdict::NoPort;
        };
        let len = packet.len() as u64;
        port.stats.hit_rx(len);

        // The hit is accounted under the table lock so a delete that
        // follows it reports it.
        let now = self.now_ms();
        let flow = read(&self.flows).get(&key.id()).map(|flow| {
            flow.stats.hit(len, tcp_flags, now);
            Arc::clone(flow)
        });
        match flow {
            Some(flow) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let outputs = self.transmit(&flow.actions, packet);
                Verdict::Hit { outputs }
            }

            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let up = Upcall { cmd: UpcallCmd::Miss, key: *key };
                match self.upcall.send(&up, packet) {
                    Ok(()) => Verdict::Upcall,
                    Err(e) => {
                        self.counters.lost.fetch_add(1, Ordering::Relaxed);
                        port.stats.rx_drop.fetch_add(1, Ordering::Relaxed);
                        debug!(self.log, "upcall lost"; "err" => %e);
                        Verdict::Lost
                    }
                }
            }
        }
    }

    /// Run `actions` on `packet` and queue the results on their output
    /// ports. Returns the number of packets queued.
    fn transmit(&self, actions: &ActionList, packet: &[u8]) -> usize {
        let mut sent = 0;
        for emit in xform::execute(actions, packet) {
            match self.port(emit.port) {
                Some(port) => {
                    if port.transmit(emit.packet) {
                        sent += 1;
                    }
                }
                None => {
                    self.counters.lost.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        sent
    }

    fn check_outputs(&self, actions: &ActionList) -> Result<()> {
        let ports = read(&self.ports);
        match actions.output_ports().find(|p| !ports.contains(p)) {
            Some(port) => Err(DpifError::NoSuchOutput(port)),
            None => Ok(()),
        }
    }

    // ================================================================
    // Vport family
    // ================================================================

    pub fn handle_vport(
        &self,
        req: &Request<VportMessage>,
    ) -> Response<VportMessage> {
        let body = &req.body;
        debug!(self.log, "vport request";
            "cmd" => req.cmd, "id" => body.id, "port_no" => body.port_no,
            "name" => %body.name);

        let res = match req.command() {
            Ok(VportCmd::New) => self.port_new(body),
            Ok(VportCmd::Del) => self.port_del(body),
            Ok(VportCmd::Get) => self.port_get(body),
            Ok(VportCmd::Dump) => self.port_dump(body),
            Err(cmd) => Err(DpifError::BadCommand(cmd)),
        };

        match res {
            Ok((status, msg)) => Response::new(status, msg),
            Err(e) => {
                warn!(self.log, "vport request failed";
                    "cmd" => req.cmd, "id" => body.id, "err" => %e);
                Response::new(e.status(), body.clone())
            }
        }
    }

    fn port_new(&self, req: &VportMessage) -> Result<(Status, VportMessage)> {
        if req.name.is_empty() {
            return Err(DpifError::Invalid("port name is required".into()));
        }

        let mut ports = write(&self.ports);
        if ports.iter().any(|(_, p)| p.name == req.name) {
            return Err(DpifError::PortExists(req.name.to_string()));
        }

        let port_no = if req.port_no == PORT_NO_ANY {
            // Table keys are ordered: the first gap is the lowest free
            // number.
            let mut next = 0u32;
            for (no, _) in ports.iter() {
                if *no != next {
                    break;
                }
                next += 1;
            }
            next
        } else if ports.contains(&req.port_no) {
            return Err(DpifError::PortExists(req.name.to_string()));
        } else {
            req.port_no
        };

        if port_no == PORT_NO_ANY {
            return Err(DpifError::TableFull(ports.get_limit().get()));
        }

        let port = Arc::new(Port::new(
            port_no,
            req.name.clone(),
            req.vport_type,
            self.cfg.tx_queue_depth,
        ));
        if let Err(e) = ports.add(port_no, Arc::clone(&port)) {
            info!(self.log, "port table full";
                "limit" => ports.get_limit().get());
            return Err(e);
        }

        info!(self.log, "port added";
            "port_no" => port_no, "name" => %port.name,
            "type" => %port.vport_type);
        Ok((Status::OK, port.to_msg(req.id, req.cmd)))
    }

    fn lookup_port(&self, req: &VportMessage) -> Result<Arc<Port>> {
        let port = if req.name.is_empty() {
            self.port(req.port_no)
        } else {
            self.port_by_name(&req.name)
        };
        port.ok_or(DpifError::PortNotFound)
    }

    fn port_del(&self, req: &VportMessage) -> Result<(Status, VportMessage)> {
        let port = self.lookup_port(req)?;
        write(&self.ports).remove(&port.port_no);
        info!(self.log, "port removed";
            "port_no" => port.port_no, "name" => %port.name);
        Ok((Status::OK, port.to_msg(req.id, req.cmd)))
    }

    fn port_get(&self, req: &VportMessage) -> Result<(Status, VportMessage)> {
        let port = self.lookup_port(req)?;
        Ok((Status::OK, port.to_msg(req.id, req.cmd)))
    }

    fn port_dump(&self, req: &VportMessage) -> Result<(Status, VportMessage)> {
        let cursor =
            req.flags.contains(MsgFlags::DUMP_CONTINUE).then_some(req.port_no);
        let ports = read(&self.ports);
        match ports.next_after(cursor.as_ref()) {
            Some((_, port)) => Ok((Status::OK, port.to_msg(req.id, req.cmd))),
            None => Ok((Status::DUMP_DONE, req.clone())),
        }
    }

    // ================================================================
    // Flow family
    // ================================================================

    pub fn handle_flow(
        &self,
        req: &Request<FlowMessage>,
    ) -> Response<FlowMessage> {
        let body = &req.body;
        debug!(self.log, "flow request";
            "cmd" => req.cmd, "id" => body.id, "key" => %body.key);

        let res = match req.command() {
            Ok(FlowCmd::New) => self.flow_put(body),
            Ok(FlowCmd::Del) => self.flow_del(body),
            Ok(FlowCmd::Get) => self.flow_get(body),
            Ok(FlowCmd::Dump) => self.flow_dump(body),
            Ok(FlowCmd::Flush) => self.flow_flush(body),
            Err(cmd) => Err(DpifError::BadCommand(cmd)),
        };

        match res {
            Ok((status, msg)) => Response::new(status, msg),
            Err(e) => {
                warn!(self.log, "flow request failed";
                    "cmd" => req.cmd, "id" => body.id, "err" => %e);
                Response::new(e.status(), body.clone())
            }
        }
    }

    fn flow_msg(
        req: &FlowMessage,
        flow: &Flow,
        stats: FlowStats,
    ) -> FlowMessage {
        FlowMessage {
            id: req.id,
            cmd: req.cmd,
            flags: MsgFlags::empty(),
            key: flow.key,
            stats,
            actions: flow.actions.clone(),
            clear: false,
        }
    }

    fn flow_put(&self, req: &FlowMessage) -> Result<(Status, FlowMessage)> {
        self.check_outputs(&req.actions)?;

        let id = req.key.id();
        let mut flows = write(&self.flows);
        let (flow, stats) = match flows.get(&id) {
            Some(old) => {
                if !req.flags.contains(MsgFlags::MODIFY) {
                    return Err(DpifError::FlowExists);
                }
                let stats = if req.clear {
                    old.stats.take()
                } else {
                    old.stats.snapshot()
                };
                let flow = Flow {
                    key: req.key,
                    actions: req.actions.clone(),
                    stats: Arc::clone(&old.stats),
                };
                (flow, stats)
            }

            None => {
                if !req.flags.contains(MsgFlags::CREATE) {
                    return Err(DpifError::FlowNotFound);
                }
                let flow = Flow {
                    key: req.key,
                    actions: req.actions.clone(),
                    stats: Arc::new(FlowCounters::default()),
                };
                (flow, Default::default())
            }
        };

        let flow = Arc::new(flow);
        if let Err(e) = flows.add(id, Arc::clone(&flow)) {
            info!(self.log, "flow table full";
                "limit" => flows.get_limit().get());
            return Err(e);
        }

        debug!(self.log, "flow installed";
            "key" => %flow.key, "actions" => %flow.actions);
        Ok((Status::OK, Self::flow_msg(req, &flow, stats)))
    }

    fn flow_del(&self, req: &FlowMessage) -> Result<(Status, FlowMessage)> {
        let flow = write(&self.flows)
            .remove(&req.key.id())
            .ok_or(DpifError::FlowNotFound)?;
        // Every hit on this flow happened before the write lock was
        // taken, so these are the final counters.
        let stats = flow.stats.snapshot();
        Ok((Status::OK, Self::flow_msg(req, &flow, stats)))
    }

    fn flow_get(&self, req: &FlowMessage) -> Result<(Status, FlowMessage)> {
        let flow = read(&self.flows)
            .get(&req.key.id())
            .cloned()
            .ok_or(DpifError::FlowNotFound)?;
        let stats =
            if req.clear { flow.stats.take() } else { flow.stats.snapshot() };
        Ok((Status::OK, Self::flow_msg(req, &flow, stats)))
    }

    fn flow_dump(&self, req: &FlowMessage) -> Result<(Status, FlowMessage)> {
        let cursor = req
            .flags
            .contains(MsgFlags::DUMP_CONTINUE)
            .then(|| req.key.id());
        let flows = read(&self.flows);
        match flows.next_after(cursor.as_ref()) {
            Some((_, flow)) => {
                let stats = flow.stats.snapshot();
                Ok((Status::OK, Self::flow_msg(req, flow, stats)))
            }
            None => Ok((Status::DUMP_DONE, req.clone())),
        }
    }

    fn flow_flush(&self, req: &FlowMessage) -> Result<(Status, FlowMessage)> {
        let mut flows = write(&self.flows);
        let n = flows.len();
        flows.clear();
        info!(self.log, "flows flushed"; "count" => n);
        Ok((Status::OK, req.clone()))
    }

    // ================================================================
    // Packet family
    // ================================================================

    /// Execute a packet message against the attached `packet`.
    pub fn handle_packet(
        &self,
        req: &Request<PacketMessage>,
        packet: &[u8],
    ) -> Response<PacketMessage> {
        let res = match req.command() {
            Ok(PacketCmd::Execute) => self.execute(&req.body.actions, packet),
            Err(cmd) => Err(DpifError::BadCommand(cmd)),
        };

        match res {
            Ok(sent) => {
                debug!(self.log, "packet executed";
                    "len" => packet.len(), "actions" => %req.body.actions,
                    "sent" => sent);
                Response::new(Status::OK, req.body.clone())
            }
            Err(e) => {
                warn!(self.log, "packet execute failed"; "err" => %e);
                Response::new(e.status(), req.body.clone())
            }
        }
    }

    fn execute(&self, actions: &ActionList, packet: &[u8]) -> Result<usize> {
        if packet.is_empty() {
            return Err(DpifError::Invalid("no packet attached".into()));
        }
        self.check_outputs(actions)?;
        Ok(self.transmit(actions, packet))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xform::test::tcp_frame;
    use dpif_api::Action;
    use dpif_api::ETHER_TYPE_IPV4;
    use dpif_api::IP_PROTO_TCP;
    use dpif_link::UpcallRx;
    use std::num::NonZeroU32;
    use std::sync::Barrier;
    use std::thread;

    fn datapath(cfg: EngineCfg) -> (Datapath, UpcallRx) {
        let (client, engine) = dpif_link::link(4, cfg.upcall_depth);
        let log = Logger::root(slog::Discard, slog::o!());
        (Datapath::new(cfg, engine.upcall, log), client.upcall)
    }

    fn vport_req(cmd: VportCmd, name: &str) -> Request<VportMessage> {
        let mut body = VportMessage::new(cmd);
        body.id = 1;
        body.port_no = PORT_NO_ANY;
        body.name = PortName::new(name).unwrap();
        body.vport_type = VportType::Phy;
        Request::new(cmd, body)
    }

    fn add_port(dp: &Datapath, name: &str) -> u32 {
        let resp = dp.handle_vport(&vport_req(VportCmd::New, name));
        assert_eq!(resp.status, Status::OK);
        resp.body.port_no
    }

    fn https_key(in_port: u32) -> FlowKey {
        FlowKey {
            in_port,
            ether_type: ETHER_TYPE_IPV4,
            ip_proto: IP_PROTO_TCP,
            tran_src_port: 443,
            tran_dst_port: 50000,
            ..Default::default()
        }
    }

    fn flow_req(
        cmd: FlowCmd,
        key: FlowKey,
        flags: MsgFlags,
        actions: &[Action],
    ) -> Request<FlowMessage> {
        let mut body = FlowMessage::new(cmd, key);
        body.id = 2;
        body.flags = flags;
        body.actions = ActionList::try_from(actions).unwrap();
        Request::new(cmd, body)
    }

    #[test]
    fn port_numbers_fill_gaps() {
        let (dp, _up) = datapath(EngineCfg::default());
        assert_eq!(add_port(&dp, "p0"), 0);
        assert_eq!(add_port(&dp, "p1"), 1);
        assert_eq!(add_port(&dp, "p2"), 2);

        let mut del = vport_req(VportCmd::Del, "p1");
        del.body.port_no = 0;
        assert_eq!(dp.handle_vport(&del).status, Status::OK);
        assert_eq!(add_port(&dp, "p3"), 1);
    }

    #[test]
    fn duplicate_port_name_rejected() {
        let (dp, _up) = datapath(EngineCfg::default());
        add_port(&dp, "eth0");
        let resp = dp.handle_vport(&vport_req(VportCmd::New, "eth0"));
        assert_eq!(
            resp.status,
            DpifError::PortExists(String::new()).status()
        );
        assert_eq!(resp.body.id, 1);
    }

    #[test]
    fn port_table_limit() {
        let cfg = EngineCfg {
            max_ports: NonZeroU32::new(1).unwrap(),
            ..Default::default()
        };
        let (dp, _up) = datapath(cfg);
        add_port(&dp, "a");
        let resp = dp.handle_vport(&vport_req(VportCmd::New, "b"));
        assert_eq!(resp.status, DpifError::TableFull(1).status());
    }

    #[test]
    fn get_by_name_and_number() {
        let (dp, _up) = datapath(EngineCfg::default());
        let no = add_port(&dp, "vhost0");

        let by_name = dp.handle_vport(&vport_req(VportCmd::Get, "vhost0"));
        assert_eq!(by_name.body.port_no, no);

        let mut by_no = vport_req(VportCmd::Get, "");
        by_no.body.port_no = no;
        let resp = dp.handle_vport(&by_no);
        assert_eq!(resp.body.name.as_str(), "vhost0");
        assert_eq!(resp.body.vport_type, VportType::Phy);

        let missing = dp.handle_vport(&vport_req(VportCmd::Get, "nope"));
        assert_eq!(missing.status, DpifError::PortNotFound.status());
    }

    #[test]
    fn flow_put_flags() {
        let (dp, _up) = datapath(EngineCfg::default());
        let p = add_port(&dp, "p0");
        let key = https_key(p);
        let out = [Action::Output { port: p }];

        let resp = dp.handle_flow(&flow_req(
            FlowCmd::New,
            key,
            MsgFlags::MODIFY,
            &out,
        ));
        assert_eq!(resp.status, DpifError::FlowNotFound.status());

        let resp = dp.handle_flow(&flow_req(
            FlowCmd::New,
            key,
            MsgFlags::CREATE,
            &out,
        ));
        assert_eq!(resp.status, Status::OK);

        let resp = dp.handle_flow(&flow_req(
            FlowCmd::New,
            key,
            MsgFlags::CREATE,
            &out,
        ));
        assert_eq!(resp.status, DpifError::FlowExists.status());

        let resp = dp.handle_flow(&flow_req(
            FlowCmd::New,
            key,
            MsgFlags::CREATE | MsgFlags::MODIFY,
            &[],
        ));
        assert_eq!(resp.status, Status::OK);
        assert!(resp.body.actions.is_empty());
        assert_eq!(dp.num_flows(), 1);
    }

    #[test]
    fn flow_put_needs_existing_outputs() {
        let (dp, _up) = datapath(EngineCfg::default());
        let resp = dp.handle_flow(&flow_req(
            FlowCmd::New,
            https_key(0),
            MsgFlags::CREATE,
            &[Action::Output { port: 9 }],
        ));
        assert_eq!(resp.status, DpifError::NoSuchOutput(9).status());
        assert_eq!(dp.num_flows(), 0);
    }

    #[test]
    fn receive_hits_and_misses() {
        let (dp, up) = datapath(EngineCfg::default());
        let p0 = add_port(&dp, "p0");
        let p1 = add_port(&dp, "p1");
        let key = https_key(p0);
        let pkt = tcp_frame(443, 50000);

        assert_eq!(dp.receive(&key, &pkt, TcpFlags::SYN), Verdict::Upcall);
        let (upcall, bytes) = up.recv().unwrap();
        assert_eq!(upcall.cmd, UpcallCmd::Miss);
        assert_eq!(upcall.key, key);
        assert_eq!(bytes, pkt);

        dp.handle_flow(&flow_req(
            FlowCmd::New,
            key,
            MsgFlags::CREATE,
            &[Action::Output { port: p1 }],
        ));
        assert_eq!(
            dp.receive(&key, &pkt, TcpFlags::ACK),
            Verdict::Hit { outputs: 1 }
        );
        assert_eq!(dp.take_tx(p1), Some(vec![pkt.clone()]));

        let get = dp.handle_flow(&flow_req(
            FlowCmd::Get,
            key,
            MsgFlags::empty(),
            &[],
        ));
        assert_eq!(get.body.stats.packet_count, 1);
        assert_eq!(get.body.stats.byte_count, pkt.len() as u64);
        assert_eq!(get.body.stats.tcp_flags, TcpFlags::ACK);
        assert!(get.body.stats.used > 0);

        let rx = dp.port(p0).unwrap().stats.snapshot();
        assert_eq!(rx.rx, 2);
        let tx = dp.port(p1).unwrap().stats.snapshot();
        assert_eq!(tx.tx, 1);
        assert_eq!(
            dp.stats(),
            DatapathStats { hits: 1, misses: 1, lost: 0 }
        );

        let unknown = FlowKey { in_port: 77, ..key };
        assert_eq!(
            dp.receive(&unknown, &pkt, TcpFlags::empty()),
            Verdict::NoPort
        );
    }

    #[test]
    fn full_upcall_queue_counts_drop() {
        let cfg = EngineCfg { upcall_depth: 1, ..Default::default() };
        let (dp, _up) = datapath(cfg);
        let p = add_port(&dp, "p0");
        let key = https_key(p);
        assert_eq!(dp.receive(&key, &[1], TcpFlags::empty()), Verdict::Upcall);
        assert_eq!(dp.receive(&key, &[1], TcpFlags::empty()), Verdict::Lost);
        assert_eq!(dp.port(p).unwrap().stats.snapshot().rx_drop, 1);
    }

    #[test]
    fn get_with_clear_resets() {
        let (dp, _up) = datapath(EngineCfg::default());
        let p = add_port(&dp, "p0");
        let key = https_key(p);
        dp.handle_flow(&flow_req(FlowCmd::New, key, MsgFlags::CREATE, &[]));
        for _ in 0..3 {
            dp.receive(&key, &[0; 60], TcpFlags::empty());
        }

        let mut get = flow_req(FlowCmd::Get, key, MsgFlags::empty(), &[]);
        get.body.clear = true;
        assert_eq!(dp.handle_flow(&get).body.stats.packet_count, 3);
        assert_eq!(dp.handle_flow(&get).body.stats.packet_count, 0);
    }

    #[test]
    fn delete_returns_final_stats() {
        let (dp, _up) = datapath(EngineCfg::default());
        let p = add_port(&dp, "p0");
        let key = https_key(p);
        dp.handle_flow(&flow_req(FlowCmd::New, key, MsgFlags::CREATE, &[]));
        dp.receive(&key, &[0; 60], TcpFlags::empty());

        let del_req = flow_req(FlowCmd::Del, key, MsgFlags::empty(), &[]);
        let del = dp.handle_flow(&del_req);
        assert_eq!(del.status, Status::OK);
        assert_eq!(del.body.stats.packet_count, 1);

        let again = dp.handle_flow(&del_req);
        assert_eq!(again.status, DpifError::FlowNotFound.status());
    }

    #[test]
    fn delete_racing_traffic_reports_every_hit() {
        let cfg = EngineCfg { upcall_depth: 1, ..Default::default() };
        let (dp, _up) = datapath(cfg);
        let p = add_port(&dp, "p0");
        let key = https_key(p);
        dp.handle_flow(&flow_req(FlowCmd::New, key, MsgFlags::CREATE, &[]));
        let start = Barrier::new(2);

        let (hits, del) = thread::scope(|s| {
            let sender = s.spawn(|| {
                start.wait();
                (0..20_000)
                    .filter(|_| {
                        matches!(
                            dp.receive(&key, &[0; 60], TcpFlags::empty()),
                            Verdict::Hit { .. }
                        )
                    })
                    .count() as u64
            });

            start.wait();
            thread::yield_now();
            let del_req = flow_req(FlowCmd::Del, key, MsgFlags::empty(), &[]);
            let del = dp.handle_flow(&del_req);
            (sender.join().unwrap(), del)
        });

        assert_eq!(del.status, Status::OK);
        assert_eq!(del.body.stats.packet_count, hits);
        assert_eq!(del.body.stats.byte_count, hits * 60);
    }

    #[test]
    fn flow_dump_walks_in_key_order_and_flush_empties() {
        let (dp, _up) = datapath(EngineCfg::default());
        let p = add_port(&dp, "p0");
        for port in [10u16, 30, 20] {
            let key = FlowKey { tran_src_port: port, ..https_key(p) };
            dp.handle_flow(&flow_req(FlowCmd::New, key, MsgFlags::CREATE, &[]));
        }

        let mut req =
            flow_req(FlowCmd::Dump, FlowKey::default(), MsgFlags::empty(), &[]);
        let mut seen = vec![];
        loop {
            let resp = dp.handle_flow(&req);
            if resp.status == Status::DUMP_DONE {
                break;
            }
            seen.push(resp.body.key.tran_src_port);
            req.body.key = resp.body.key;
            req.body.flags = MsgFlags::DUMP_CONTINUE;
        }
        seen.sort();
        assert_eq!(seen, vec![10, 20, 30]);

        dp.handle_flow(&flow_req(
            FlowCmd::Flush,
            FlowKey::default(),
            MsgFlags::empty(),
            &[],
        ));
        assert_eq!(dp.num_flows(), 0);
    }

    #[test]
    fn execute_delivers_to_outputs() {
        let (dp, _up) = datapath(EngineCfg::default());
        let a = add_port(&dp, "a");
        let b = add_port(&dp, "b");
        let actions = ActionList::try_from(
            &[Action::Output { port: a }, Action::Output { port: b }][..],
        )
        .unwrap();
        let req = Request::new(PacketCmd::Execute, PacketMessage::new(actions));

        let resp = dp.handle_packet(&req, &[7; 64]);
        assert_eq!(resp.status, Status::OK);
        assert_eq!(dp.take_tx(a).unwrap().len(), 1);
        assert_eq!(dp.take_tx(b).unwrap().len(), 1);
        assert_eq!(dp.port(b).unwrap().stats.snapshot().tx_bytes, 64);

        let resp = dp.handle_packet(&req, &[]);
        assert_eq!(
            resp.status,
            DpifError::Invalid(String::new()).status()
        );
    }

    #[test]
    fn tx_queue_tail_drops() {
        let cfg = EngineCfg { tx_queue_depth: 1, ..Default::default() };
        let (dp, _up) = datapath(cfg);
        let a = add_port(&dp, "a");
        let actions =
            ActionList::try_from(&[Action::Output { port: a }][..]).unwrap();
        let req = Request::new(PacketCmd::Execute, PacketMessage::new(actions));
        dp.handle_packet(&req, &[1; 10]);
        dp.handle_packet(&req, &[1; 10]);
        let stats = dp.port(a).unwrap().stats.snapshot();
        assert_eq!((stats.tx, stats.tx_drop), (1, 1));
    }

    #[test]
    fn unknown_command() {
        let (dp, _up) = datapath(EngineCfg::default());
        let mut req = vport_req(VportCmd::Get, "x");
        req.cmd = 42;
        let resp = dp.handle_vport(&req);
        assert_eq!(resp.status, DpifError::BadCommand(42).status());
    }
}
