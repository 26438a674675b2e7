// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Scenario files: a datapath config plus the ports, flows and traffic
//! to apply to it.
//!
//! ```toml
//! [engine]
//! max_flows = 64
//!
//! [[ports]]
//! name = "eth0"
//! type = "phy"
//!
//! [[flows]]
//! in_port = "eth0"
//! ip_proto = 6
//! tran_dst_port = 443
//! actions = [{ type = "output", port = "eth1" }]
//!
//! [[packets]]
//! in_port = "eth0"
//! ip_proto = 6
//! tran_dst_port = 443
//! count = 10
//! ```

use dpif_api::Action;
use dpif_api::ActionList;
use dpif_api::ETHER_TYPE_IPV4;
use dpif_api::FlowKey;
use dpif_api::IP_PROTO_TCP;
use dpif_api::IP_PROTO_UDP;
use dpif_api::Ipv4Addr;
use dpif_api::Ipv4Rewrite;
use dpif_api::MacAddr;
use dpif_api::VportType;
use dpif_engine::EngineCfg;
use dpif_engine::checksum::Checksum;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {path}: {err}")]
    Io { path: String, err: std::io::Error },

    #[error("bad scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown port {0:?}")]
    UnknownPort(String),

    #[error("bad {field} {value:?}: {err}")]
    BadField { field: &'static str, value: String, err: String },

    #[error("too many actions: {0}")]
    Actions(#[from] dpif_api::EncodeError),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub engine: EngineCfg,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
    #[serde(default)]
    pub packets: Vec<PacketSpec>,
}

impl Scenario {
    pub fn from_toml(s: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let s = std::fs::read_to_string(path).map_err(|err| {
            ScenarioError::Io { path: path.display().to_string(), err }
        })?;
        Self::from_toml(&s)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_vport_type")]
    pub vport_type: String,
    /// Let the datapath choose when absent.
    pub port_no: Option<u32>,
}

fn default_vport_type() -> String {
    "phy".to_string()
}

impl PortSpec {
    pub fn vport_type(&self) -> Result<VportType, ScenarioError> {
        parse("type", &self.vport_type)
    }
}

/// Match fields of a flow or packet. Ports are named; addresses use
/// their usual text forms.
#[derive(Clone, Debug, Deserialize)]
pub struct MatchSpec {
    pub in_port: String,
    pub ether_src: Option<String>,
    pub ether_dst: Option<String>,
    #[serde(default = "default_ether_type")]
    pub ether_type: u16,
    #[serde(default)]
    pub vlan_id: u16,
    #[serde(default)]
    pub vlan_prio: u8,
    pub ip_src: Option<String>,
    pub ip_dst: Option<String>,
    #[serde(default)]
    pub ip_proto: u8,
    #[serde(default)]
    pub ip_tos: u8,
    #[serde(default = "default_ttl")]
    pub ip_ttl: u8,
    #[serde(default)]
    pub tran_src_port: u16,
    #[serde(default)]
    pub tran_dst_port: u16,
}

fn default_ether_type() -> u16 {
    ETHER_TYPE_IPV4
}

fn default_ttl() -> u8 {
    64
}

#[derive(Clone, Debug, Deserialize)]
pub struct FlowSpec {
    #[serde(flatten)]
    pub key: MatchSpec,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PacketSpec {
    #[serde(flatten)]
    pub key: MatchSpec,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_len")]
    pub len: usize,
}

fn default_count() -> u32 {
    1
}

fn default_len() -> usize {
    64
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionSpec {
    Output { port: String },
    PopVlan,
    PushVlan { tci: u16 },
    SetEthernet { src: String, dst: String },
    SetIpv4 { src: String, dst: String, proto: u8, tos: u8, ttl: u8 },
    SetTcp { src: u16, dst: u16 },
    SetUdp { src: u16, dst: u16 },
}

fn parse<T>(field: &'static str, value: &str) -> Result<T, ScenarioError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| ScenarioError::BadField {
        field,
        value: value.to_string(),
        err: e.to_string(),
    })
}

fn parse_opt<T>(
    field: &'static str,
    value: &Option<String>,
) -> Result<T, ScenarioError>
where
    T: FromStr + Default,
    T::Err: Display,
{
    value.as_deref().map(|v| parse(field, v)).unwrap_or(Ok(T::default()))
}

/// Port names resolved to numbers.
pub type PortMap = BTreeMap<String, u32>;

fn port_no(ports: &PortMap, name: &str) -> Result<u32, ScenarioError> {
    ports
        .get(name)
        .copied()
        .ok_or_else(|| ScenarioError::UnknownPort(name.to_string()))
}

impl MatchSpec {
    pub fn to_key(&self, ports: &PortMap) -> Result<FlowKey, ScenarioError> {
        Ok(FlowKey {
            in_port: port_no(ports, &self.in_port)?,
            ether_dst: parse_opt::<MacAddr>("ether_dst", &self.ether_dst)?,
            ether_src: parse_opt::<MacAddr>("ether_src", &self.ether_src)?,
            ether_type: self.ether_type,
            vlan_id: self.vlan_id,
            vlan_prio: self.vlan_prio,
            ip_src: parse_opt::<Ipv4Addr>("ip_src", &self.ip_src)?,
            ip_dst: parse_opt::<Ipv4Addr>("ip_dst", &self.ip_dst)?,
            ip_proto: self.ip_proto,
            ip_tos: self.ip_tos,
            ip_ttl: self.ip_ttl,
            ip_frag: 0,
            tran_src_port: self.tran_src_port,
            tran_dst_port: self.tran_dst_port,
        })
    }
}

impl ActionSpec {
    pub fn to_action(&self, ports: &PortMap) -> Result<Action, ScenarioError> {
        let act = match self {
            Self::Output { port } => {
                Action::Output { port: port_no(ports, port)? }
            }
            Self::PopVlan => Action::PopVlan,
            Self::PushVlan { tci } => Action::push_vlan(*tci),
            Self::SetEthernet { src, dst } => Action::SetEthernet {
                src: parse("ether_src", src)?,
                dst: parse("ether_dst", dst)?,
            },
            Self::SetIpv4 { src, dst, proto, tos, ttl } => {
                Action::SetIpv4(Ipv4Rewrite {
                    src: parse("ip_src", src)?,
                    dst: parse("ip_dst", dst)?,
                    proto: *proto,
                    tos: *tos,
                    ttl: *ttl,
                    frag: 0,
                })
            }
            Self::SetTcp { src, dst } => {
                Action::SetTcp { src: *src, dst: *dst }
            }
            Self::SetUdp { src, dst } => {
                Action::SetUdp { src: *src, dst: *dst }
            }
        };
        Ok(act)
    }
}

impl FlowSpec {
    pub fn to_actions(
        &self,
        ports: &PortMap,
    ) -> Result<ActionList, ScenarioError> {
        let mut list = ActionList::new();
        for spec in &self.actions {
            list.push(spec.to_action(ports)?)?;
        }
        Ok(list)
    }
}

/// Build a frame of at least `len` bytes whose headers match `key`.
pub fn frame_for(key: &FlowKey, len: usize) -> Vec<u8> {
    let mut pkt = vec![];
    pkt.extend_from_slice(&key.ether_dst.bytes());
    pkt.extend_from_slice(&key.ether_src.bytes());
    pkt.extend_from_slice(&key.ether_type.to_be_bytes());

    if key.ether_type == ETHER_TYPE_IPV4 {
        let l4_len = match key.ip_proto {
            IP_PROTO_TCP => 20,
            IP_PROTO_UDP => 8,
            _ => 0,
        };
        let body = len.saturating_sub(pkt.len() + 20).max(l4_len);
        let tot_len = u16::try_from(20 + body).unwrap_or(u16::MAX);

        let mut ip = vec![0x45, key.ip_tos];
        ip.extend_from_slice(&tot_len.to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0x40, 0, key.ip_ttl, key.ip_proto, 0, 0]);
        ip.extend_from_slice(&key.ip_src.bytes());
        ip.extend_from_slice(&key.ip_dst.bytes());
        let hc = Checksum::compute(&ip).to_header();
        ip[10..12].copy_from_slice(&hc);
        pkt.extend_from_slice(&ip);

        let l4 = pkt.len();
        pkt.resize(l4 + body, 0);
        if l4_len > 0 {
            pkt[l4..l4 + 2].copy_from_slice(&key.tran_src_port.to_be_bytes());
            pkt[l4 + 2..l4 + 4]
                .copy_from_slice(&key.tran_dst_port.to_be_bytes());
        }
        if key.ip_proto == IP_PROTO_TCP {
            // Data offset of a bare header.
            pkt[l4 + 12] = 0x50;
        }
    }

    if pkt.len() < len {
        pkt.resize(len, 0);
    }
    pkt
}

#[cfg(test)]
mod test {
    use super::*;

    const SCENARIO: &str = r#"
        [engine]
        max_flows = 8

        [[ports]]
        name = "eth0"

        [[ports]]
        name = "vhu0"
        type = "vhost"
        port_no = 5

        [[flows]]
        in_port = "eth0"
        ip_proto = 6
        tran_src_port = 443
        tran_dst_port = 50000
        actions = [
            { type = "push_vlan", tci = 100 },
            { type = "output", port = "vhu0" },
        ]

        [[packets]]
        in_port = "eth0"
        ip_proto = 6
        tran_src_port = 443
        tran_dst_port = 50000
        count = 3
    "#;

    fn ports() -> PortMap {
        [("eth0".to_string(), 0), ("vhu0".to_string(), 5)].into()
    }

    #[test]
    fn parse_scenario() {
        let sc = Scenario::from_toml(SCENARIO).unwrap();
        assert_eq!(sc.engine.max_flows.get(), 8);
        assert_eq!(sc.ports.len(), 2);
        assert_eq!(sc.ports[0].vport_type().unwrap(), VportType::Phy);
        assert_eq!(sc.ports[1].vport_type().unwrap(), VportType::Vhost);
        assert_eq!(sc.ports[1].port_no, Some(5));
        assert_eq!(sc.packets[0].count, 3);

        let ports = ports();
        let flow = &sc.flows[0];
        let key = flow.key.to_key(&ports).unwrap();
        assert_eq!(key.in_port, 0);
        assert_eq!(key.ether_type, ETHER_TYPE_IPV4);
        assert_eq!(key.ip_ttl, 64);
        assert_eq!(key.tran_dst_port, 50000);

        let acts = flow.to_actions(&ports).unwrap();
        assert_eq!(
            acts.as_slice(),
            &[Action::push_vlan(100), Action::Output { port: 5 }]
        );
    }

    #[test]
    fn unknown_output_port() {
        let spec = ActionSpec::Output { port: "nope".to_string() };
        assert!(matches!(
            spec.to_action(&ports()),
            Err(ScenarioError::UnknownPort(p)) if p == "nope"
        ));
    }

    #[test]
    fn bad_address() {
        let sc = Scenario::from_toml(
            "[[flows]]\nin_port = \"eth0\"\nip_src = \"10.0.0\"\n",
        )
        .unwrap();
        assert!(matches!(
            sc.flows[0].key.to_key(&ports()),
            Err(ScenarioError::BadField { field: "ip_src", .. })
        ));
    }

    #[test]
    fn frame_matches_key() {
        let key = FlowKey {
            ether_type: ETHER_TYPE_IPV4,
            ip_proto: IP_PROTO_TCP,
            ip_ttl: 64,
            tran_src_port: 443,
            tran_dst_port: 50000,
            ..Default::default()
        };
        let pkt = frame_for(&key, 64);
        assert_eq!(pkt.len(), 64);
        assert_eq!(&pkt[12..14], &[0x08, 0x00]);
        assert_eq!(pkt[14 + 9], IP_PROTO_TCP);
        assert_eq!(&pkt[34..36], &443u16.to_be_bytes());
        assert_eq!(&pkt[36..38], &50000u16.to_be_bytes());

        let mut hdr = pkt[14..34].to_vec();
        assert_eq!(Checksum::compute(&hdr).to_header(), [0, 0]);
        hdr[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(Checksum::compute(&hdr).to_header(), [pkt[24], pkt[25]]);
    }
}
