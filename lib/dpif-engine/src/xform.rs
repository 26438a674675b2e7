// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Apply an action list to packet bytes.
//!
//! Actions run in order against a working copy of the packet; an
//! output emits the packet as it stands at that point. A rewrite whose
//! header is absent or truncated leaves the packet untouched, as does a
//! pop on an untagged frame. Checksums are updated incrementally.

use crate::checksum::Checksum;
use dpif_api::Action;
use dpif_api::ActionList;
use dpif_api::ETHER_TYPE_IPV4;
use dpif_api::IP_PROTO_TCP;
use dpif_api::IP_PROTO_UDP;
use dpif_api::Ipv4Rewrite;
use dpif_api::MacAddr;

const ETHER_HDR_LEN: usize = 14;
const VLAN_HDR_LEN: usize = 4;
const ETHER_TYPE_QINQ: u16 = 0x88a8;
const IPV4_HDR_MIN: usize = 20;
const TCP_CSUM_OFF: usize = 16;
const UDP_CSUM_OFF: usize = 6;
const UDP_HDR_LEN: usize = 8;

/// A packet emitted on a port by an output action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Emit {
    pub port: u32,
    pub packet: Vec<u8>,
}

/// Run `actions` on `packet`, returning everything it output.
pub fn execute(actions: &ActionList, packet: &[u8]) -> Vec<Emit> {
    let mut pkt = packet.to_vec();
    let mut out = vec![];

    for act in actions {
        match *act {
            Action::Output { port } => {
                out.push(Emit { port, packet: pkt.clone() });
            }
            Action::PopVlan => pop_vlan(&mut pkt),
            Action::PushVlan { tpid, tci } => push_vlan(&mut pkt, tpid, tci),
            Action::SetEthernet { src, dst } => {
                set_ethernet(&mut pkt, src, dst)
            }
            Action::SetIpv4(rw) => set_ipv4(&mut pkt, &rw),
            Action::SetTcp { src, dst } => {
                set_l4_ports(&mut pkt, IP_PROTO_TCP, src, dst)
            }
            Action::SetUdp { src, dst } => {
                set_l4_ports(&mut pkt, IP_PROTO_UDP, src, dst)
            }
        }
    }

    out
}

fn ether_type_at(pkt: &[u8], off: usize) -> Option<u16> {
    let b = pkt.get(off..off + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn is_vlan_type(et: u16) -> bool {
    et == dpif_api::ETHER_TYPE_VLAN || et == ETHER_TYPE_QINQ
}

/// The offset of the IPv4 header and its length, if the frame carries
/// a complete one.
fn ipv4_hdr(pkt: &[u8]) -> Option<(usize, usize)> {
    let (et, l3) = match ether_type_at(pkt, 12)? {
        et if is_vlan_type(et) => {
            (ether_type_at(pkt, 16)?, ETHER_HDR_LEN + VLAN_HDR_LEN)
        }
        et => (et, ETHER_HDR_LEN),
    };

    if et != ETHER_TYPE_IPV4 {
        return None;
    }

    let ihl = usize::from(*pkt.get(l3)? & 0x0f) * 4;
    if ihl < IPV4_HDR_MIN || pkt.len() < l3 + ihl {
        return None;
    }

    Some((l3, ihl))
}

/// Is this the first (or only) fragment, i.e. does it hold the L4
/// header?
fn has_l4_hdr(pkt: &[u8], l3: usize) -> bool {
    let frag = u16::from_be_bytes([pkt[l3 + 6], pkt[l3 + 7]]);
    frag & 0x1fff == 0
}

/// Apply a pseudo-header or port change to the L4 checksum of `proto`.
fn update_l4_csum(
    pkt: &mut [u8],
    l4: usize,
    proto: u8,
    old: &[u8],
    new: &[u8],
) {
    let off = match proto {
        IP_PROTO_TCP => l4 + TCP_CSUM_OFF,
        IP_PROTO_UDP => l4 + UDP_CSUM_OFF,
        _ => return,
    };

    let Some(field) = pkt.get_mut(off..off + 2) else {
        return;
    };

    // A zero UDP checksum means "none".
    if proto == IP_PROTO_UDP && field == [0, 0] {
        return;
    }

    let mut csum = Checksum::from_header([field[0], field[1]]);
    csum.replace(old, new);
    let mut hc = csum.to_header();
    if proto == IP_PROTO_UDP && hc == [0, 0] {
        hc = [0xff, 0xff];
    }
    field.copy_from_slice(&hc);
}

fn pop_vlan(pkt: &mut Vec<u8>) {
    match ether_type_at(pkt, 12) {
        Some(et) if is_vlan_type(et) && pkt.len() >= 16 => {
            pkt.drain(12..16);
        }
        _ => {}
    }
}

fn push_vlan(pkt: &mut Vec<u8>, tpid: u16, tci: u16) {
    if pkt.len() < 12 {
        return;
    }

    let [t0, t1] = tpid.to_be_bytes();
    let [c0, c1] = tci.to_be_bytes();
    let tail = pkt.split_off(12);
    pkt.extend_from_slice(&[t0, t1, c0, c1]);
    pkt.extend_from_slice(&tail);
}

fn set_ethernet(pkt: &mut [u8], src: MacAddr, dst: MacAddr) {
    if pkt.len() < 12 {
        return;
    }

    pkt[0..6].copy_from_slice(&dst.bytes());
    pkt[6..12].copy_from_slice(&src.bytes());
}

fn set_ipv4(pkt: &mut [u8], rw: &Ipv4Rewrite) {
    let Some((l3, ihl)) = ipv4_hdr(pkt) else {
        return;
    };

    let old_proto = pkt[l3 + 9];
    let mut old_addrs = [0u8; 8];
    old_addrs.copy_from_slice(&pkt[l3 + 12..l3 + 20]);
    let mut new_addrs = [0u8; 8];
    new_addrs[..4].copy_from_slice(&rw.src.bytes());
    new_addrs[4..].copy_from_slice(&rw.dst.bytes());

    // The fragment field describes the packet; it is not rewritable.
    pkt[l3 + 1] = rw.tos;
    pkt[l3 + 8] = rw.ttl;
    pkt[l3 + 9] = rw.proto;
    pkt[l3 + 12..l3 + 20].copy_from_slice(&new_addrs);

    pkt[l3 + 10..l3 + 12].copy_from_slice(&[0, 0]);
    let hc = Checksum::compute(&pkt[l3..l3 + ihl]).to_header();
    pkt[l3 + 10..l3 + 12].copy_from_slice(&hc);

    if has_l4_hdr(pkt, l3) {
        let l4 = l3 + ihl;
        update_l4_csum(pkt, l4, old_proto, &old_addrs, &new_addrs);
        if old_proto == rw.proto {
            return;
        }
        update_l4_csum(pkt, l4, old_proto, &[0, old_proto], &[0, rw.proto]);
    }
}

fn set_l4_ports(pkt: &mut [u8], proto: u8, src: u16, dst: u16) {
    let Some((l3, ihl)) = ipv4_hdr(pkt) else {
        return;
    };

    if pkt[l3 + 9] != proto || !has_l4_hdr(pkt, l3) {
        return;
    }

    let l4 = l3 + ihl;
    let min = match proto {
        IP_PROTO_TCP => TCP_CSUM_OFF + 2,
        _ => UDP_HDR_LEN,
    };
    if pkt.len() < l4 + min {
        return;
    }

    let mut old = [0u8; 4];
    old.copy_from_slice(&pkt[l4..l4 + 4]);
    let mut new = [0u8; 4];
    new[..2].copy_from_slice(&src.to_be_bytes());
    new[2..].copy_from_slice(&dst.to_be_bytes());

    pkt[l4..l4 + 4].copy_from_slice(&new);
    update_l4_csum(pkt, l4, proto, &old, &new);
}
