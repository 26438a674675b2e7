// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow key.
//!
//! A flow key is both the classification tuple of a packet and the
//! lookup key of the datapath flow table. Two keys describe the same
//! flow if and only if their encodings are byte-for-byte equal, so the
//! encoding must never contain padding.

use super::codec::DecodeError;
use super::codec::read_raw;
use super::ip::Ipv4Addr;
use super::mac::MacAddr;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;

/// The number of bytes in an encoded [`FlowKey`].
pub const FLOW_KEY_LEN: usize = 37;

/// The wire representation of a flow key.
///
/// Every field is byte-aligned, so `repr(C)` yields a packed layout;
/// the `IntoBytes` derive refuses to compile if padding ever sneaks in.
/// Scalars are little-endian; addresses are kept in the order they
/// appear in the packet.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    PartialEq,
    Unaligned,
)]
#[repr(C)]
pub struct FlowKeyRaw {
    pub in_port: U32,
    pub ether_dst: [u8; 6],
    pub ether_src: [u8; 6],
    pub ether_type: U16,
    pub vlan_id: U16,
    pub vlan_prio: u8,
    pub ip_src: [u8; 4],
    pub ip_dst: [u8; 4],
    pub ip_proto: u8,
    pub ip_tos: u8,
    pub ip_ttl: u8,
    pub ip_frag: u8,
    pub tran_src_port: U16,
    pub tran_dst_port: U16,
}

const _: () = assert!(core::mem::size_of::<FlowKeyRaw>() == FLOW_KEY_LEN);

/// The classification fields of a packet.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowKey {
    pub in_port: u32,
    pub ether_dst: MacAddr,
    pub ether_src: MacAddr,
    pub ether_type: u16,
    pub vlan_id: u16,
    pub vlan_prio: u8,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ip_proto: u8,
    pub ip_tos: u8,
    pub ip_ttl: u8,
    pub ip_frag: u8,
    pub tran_src_port: u16,
    pub tran_dst_port: u16,
}

impl FlowKey {
    /// Encode the key into its fixed-size wire form.
    pub fn encode(&self) -> [u8; FLOW_KEY_LEN] {
        let mut out = [0u8; FLOW_KEY_LEN];
        out.copy_from_slice(self.to_raw().as_bytes());
        out
    }

    /// Decode a key from its fixed-size wire form.
    ///
    /// This cannot fail: every bit pattern is a valid key.
    pub fn decode(bytes: &[u8; FLOW_KEY_LEN]) -> Self {
        let raw: FlowKeyRaw = zerocopy::transmute!(*bytes);
        Self::from(&raw)
    }

    /// Decode a key from the front of an arbitrary slice.
    pub fn from_slice(buf: &[u8]) -> Result<Self, DecodeError> {
        read_raw::<FlowKeyRaw>(buf).map(Self::from)
    }

    /// Do `self` and `other` identify the same flow?
    ///
    /// Flow identity is defined over the encoded bytes.
    pub fn same_flow(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }

    pub fn to_raw(&self) -> FlowKeyRaw {
        FlowKeyRaw {
            in_port: U32::new(self.in_port),
            ether_dst: self.ether_dst.bytes(),
            ether_src: self.ether_src.bytes(),
            ether_type: U16::new(self.ether_type),
            vlan_id: U16::new(self.vlan_id),
            vlan_prio: self.vlan_prio,
            ip_src: self.ip_src.bytes(),
            ip_dst: self.ip_dst.bytes(),
            ip_proto: self.ip_proto,
            ip_tos: self.ip_tos,
            ip_ttl: self.ip_ttl,
            ip_frag: self.ip_frag,
            tran_src_port: U16::new(self.tran_src_port),
            tran_dst_port: U16::new(self.tran_dst_port),
        }
    }

    /// The raw-byte identity of this key, suitable as a table key.
    pub fn id(&self) -> FlowKeyBytes {
        FlowKeyBytes(self.encode())
    }
}

impl From<&FlowKeyRaw> for FlowKey {
    fn from(raw: &FlowKeyRaw) -> Self {
        Self {
            in_port: raw.in_port.get(),
            ether_dst: MacAddr::from(raw.ether_dst),
            ether_src: MacAddr::from(raw.ether_src),
            ether_type: raw.ether_type.get(),
            vlan_id: raw.vlan_id.get(),
            vlan_prio: raw.vlan_prio,
            ip_src: Ipv4Addr::from(raw.ip_src),
            ip_dst: Ipv4Addr::from(raw.ip_dst),
            ip_proto: raw.ip_proto,
            ip_tos: raw.ip_tos,
            ip_ttl: raw.ip_ttl,
            ip_frag: raw.ip_frag,
            tran_src_port: raw.tran_src_port.get(),
            tran_dst_port: raw.tran_dst_port.get(),
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "in_port={},dl_src={},dl_dst={},dl_type={:#06x}",
            self.in_port, self.ether_src, self.ether_dst, self.ether_type,
        )?;

        if self.vlan_id != 0 || self.vlan_prio != 0 {
            write!(f, ",vlan={}/{}", self.vlan_id, self.vlan_prio)?;
        }

        write!(
            f,
            ",nw_src={},nw_dst={},nw_proto={},nw_tos={},nw_ttl={},\
             nw_frag={},tp_src={},tp_dst={}",
            self.ip_src,
            self.ip_dst,
            self.ip_proto,
            self.ip_tos,
            self.ip_ttl,
            self.ip_frag,
            self.tran_src_port,
            self.tran_dst_port,
        )
    }
}

/// The encoded bytes of a [`FlowKey`], compared and ordered as raw
/// memory.
///
/// This is the type the datapath hashes and orders its flow table by.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FlowKeyBytes(pub [u8; FLOW_KEY_LEN]);

impl FlowKeyBytes {
    pub fn key(&self) -> FlowKey {
        FlowKey::decode(&self.0)
    }
}

impl From<&FlowKey> for FlowKeyBytes {
    fn from(key: &FlowKey) -> Self {
        key.id()
    }
}

impl AsRef<[u8]> for FlowKeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
