// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Port and flow statistics as they travel in messages.
//!
//! Counters only ever grow; they are written by the datapath and read
//! by the vswitch.

use super::tcp::TcpFlags;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::U64;

/// The number of bytes in encoded [`VportStats`].
pub const VPORT_STATS_LEN: usize = 64;

/// The number of bytes in encoded [`FlowStats`], trailing padding
/// included.
pub const FLOW_STATS_LEN: usize = 32;

#[derive(
    Clone,
    Copy,
    Debug,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct VportStatsRaw {
    pub rx: U64,
    pub tx: U64,
    pub rx_bytes: U64,
    pub tx_bytes: U64,
    pub rx_drop: U64,
    pub tx_drop: U64,
    pub rx_error: U64,
    pub tx_error: U64,
}

const _: () = assert!(core::mem::size_of::<VportStatsRaw>() == VPORT_STATS_LEN);

/// Counters of a virtual port.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct VportStats {
    /// Received packets.
    pub rx: u64,
    /// Transmitted packets.
    pub tx: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_drop: u64,
    pub tx_drop: u64,
    pub rx_error: u64,
    pub tx_error: u64,
}

impl VportStats {
    pub fn to_raw(&self) -> VportStatsRaw {
        VportStatsRaw {
            rx: U64::new(self.rx),
            tx: U64::new(self.tx),
            rx_bytes: U64::new(self.rx_bytes),
            tx_bytes: U64::new(self.tx_bytes),
            rx_drop: U64::new(self.rx_drop),
            tx_drop: U64::new(self.tx_drop),
            rx_error: U64::new(self.rx_error),
            tx_error: U64::new(self.tx_error),
        }
    }
}

impl From<&VportStatsRaw> for VportStats {
    fn from(raw: &VportStatsRaw) -> Self {
        Self {
            rx: raw.rx.get(),
            tx: raw.tx.get(),
            rx_bytes: raw.rx_bytes.get(),
            tx_bytes: raw.tx_bytes.get(),
            rx_drop: raw.rx_drop.get(),
            tx_drop: raw.tx_drop.get(),
            rx_error: raw.rx_error.get(),
            tx_error: raw.tx_error.get(),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct FlowStatsRaw {
    pub packet_count: U64,
    pub byte_count: U64,
    pub used: U64,
    pub tcp_flags: u8,
    pub _pad: [u8; 7],
}

const _: () = assert!(core::mem::size_of::<FlowStatsRaw>() == FLOW_STATS_LEN);

/// Counters of a single flow.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct FlowStats {
    pub packet_count: u64,
    pub byte_count: u64,
    /// Milliseconds since datapath start of the last hit, or zero if
    /// the flow was never hit.
    pub used: u64,
    /// Union of the TCP flags seen on the flow.
    pub tcp_flags: TcpFlags,
}

impl FlowStats {
    pub fn to_raw(&self) -> FlowStatsRaw {
        FlowStatsRaw {
            packet_count: U64::new(self.packet_count),
            byte_count: U64::new(self.byte_count),
            used: U64::new(self.used),
            tcp_flags: self.tcp_flags.bits(),
            _pad: [0; 7],
        }
    }
}

impl From<&FlowStatsRaw> for FlowStats {
    fn from(raw: &FlowStatsRaw) -> Self {
        Self {
            packet_count: raw.packet_count.get(),
            byte_count: raw.byte_count.get(),
            used: raw.used.get(),
            tcp_flags: TcpFlags::from_bits_retain(raw.tcp_flags),
        }
    }
}

/// Flow statistics in the shape the vswitch's generic datapath
/// interface reports them.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct DpifFlowStats {
    pub n_packets: u64,
    pub n_bytes: u64,
    /// Last-used time in milliseconds, zero if never used.
    pub used: u64,
    pub tcp_flags: u16,
}

impl From<FlowStats> for DpifFlowStats {
    fn from(stats: FlowStats) -> Self {
        Self {
            n_packets: stats.packet_count,
            n_bytes: stats.byte_count,
            used: stats.used,
            tcp_flags: u16::from(stats.tcp_flags.bits()),
        }
    }
}
