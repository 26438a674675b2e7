// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow management messages.

use super::action::ActionList;
use super::action::ActionsRaw;
use super::cmd::FlowCmd;
use super::cmd::MsgFlags;
use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::WireMsg;
use super::codec::decode_bool;
use super::codec::read_raw;
use super::codec::write_raw;
use super::key::FlowKey;
use super::key::FlowKeyRaw;
use super::stat::FlowStats;
use super::stat::FlowStatsRaw;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::U32;

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
pub struct FlowMessageRaw {
    pub id: U32,
    pub cmd: u8,
    pub _pad0: [u8; 3],
    pub flags: U32,
    pub key: FlowKeyRaw,
    pub _pad1: [u8; 7],
    pub stats: FlowStatsRaw,
    pub actions: ActionsRaw,
    pub clear: u8,
    pub _pad2: [u8; 7],
}

const _: () = assert!(core::mem::size_of::<FlowMessageRaw>() == 864);

/// A flow request or response body.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowMessage {
    pub id: u32,
    pub cmd: u8,
    pub flags: MsgFlags,
    pub key: FlowKey,
    pub stats: FlowStats,
    pub actions: ActionList,
    /// On a read, reset the flow's counters after reporting them.
    pub clear: bool,
}

impl FlowMessage {
    pub fn new(cmd: FlowCmd, key: FlowKey) -> Self {
        Self { cmd: cmd as u8, key, ..Default::default() }
    }

    pub fn command(&self) -> Result<FlowCmd, u8> {
        FlowCmd::try_from(self.cmd)
    }

    pub fn to_raw(&self) -> FlowMessageRaw {
        FlowMessageRaw {
            id: U32::new(self.id),
            cmd: self.cmd,
            _pad0: [0; 3],
            flags: U32::new(self.flags.bits()),
            key: self.key.to_raw(),
            _pad1: [0; 7],
            stats: self.stats.to_raw(),
            actions: self.actions.to_raw(),
            clear: u8::from(self.clear),
            _pad2: [0; 7],
        }
    }

    pub fn from_raw(raw: &FlowMessageRaw) -> Result<Self, DecodeError> {
        Ok(Self {
            id: raw.id.get(),
            cmd: raw.cmd,
            flags: MsgFlags::from_bits_retain(raw.flags.get()),
            key: FlowKey::from(&raw.key),
            stats: FlowStats::from(&raw.stats),
            actions: ActionList::from_raw(&raw.actions)?,
            clear: decode_bool(raw.clear)?,
        })
    }
}

impl WireMsg for FlowMessage {
    const WIRE_LEN: usize = core::mem::size_of::<FlowMessageRaw>();

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_raw(&self.to_raw(), buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        read_raw::<FlowMessageRaw>(buf).and_then(Self::from_raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::ACTION_LEN;
    use crate::action::Action;
    use crate::ip::ETHER_TYPE_IPV4;
    use crate::ip::IP_PROTO_TCP;
    use crate::key::FLOW_KEY_LEN;
    use crate::tcp::TcpFlags;
    use alloc::vec::Vec;

    fn encode(msg: &FlowMessage) -> Vec<u8> {
        let mut buf = vec![0u8; FlowMessage::WIRE_LEN];
        msg.encode_into(&mut buf).unwrap();
        buf
    }

    fn https_put() -> FlowMessage {
        let key = FlowKey {
            in_port: 1,
            ether_type: ETHER_TYPE_IPV4,
            ip_proto: IP_PROTO_TCP,
            tran_src_port: 443,
            tran_dst_port: 50000,
            ..Default::default()
        };
        let mut msg = FlowMessage::new(FlowCmd::New, key);
        msg.flags = MsgFlags::CREATE;
        msg.actions.push(Action::Output { port: 2 }).unwrap();
        msg
    }

    #[test]
    fn https_flow_round_trip() {
        let msg = https_put();
        let buf = encode(&msg);
        assert_eq!(buf.len(), 864);

        let back = FlowMessage::decode(&buf).unwrap();
        assert_eq!(back.key, msg.key);
        assert_eq!(back.actions.as_slice(), &[Action::Output { port: 2 }]);
        assert!(!back.clear);
        assert_eq!(back, msg);
    }

    #[test]
    fn field_offsets() {
        let mut msg = https_put();
        msg.stats = FlowStats {
            packet_count: 5,
            byte_count: 6,
            used: 7,
            tcp_flags: TcpFlags::SYN,
        };
        msg.clear = true;
        let buf = encode(&msg);

        assert_eq!(&buf[12..12 + FLOW_KEY_LEN], &msg.key.encode());
        assert!(buf[49..56].iter().all(|b| *b == 0));
        assert_eq!(buf[56], 5);
        assert_eq!(buf[64], 6);
        assert_eq!(buf[72], 7);
        assert_eq!(buf[80], TcpFlags::SYN.bits());
        assert_eq!(&buf[88..92], &[1, 0, 0, 0]);
        assert_eq!(&buf[88 + ACTION_LEN..92 + ACTION_LEN], &[0, 0, 0, 0]);
        assert_eq!(buf[856], 1);
    }

    #[test]
    fn reject_bad_clear() {
        let mut buf = encode(&https_put());
        buf[856] = 2;
        assert_eq!(FlowMessage::decode(&buf), Err(DecodeError::BadBool(2)));
    }

    #[test]
    fn unknown_action_rejects_message() {
        let mut buf = encode(&https_put());
        buf[88 + ACTION_LEN] = 0x77;
        assert_eq!(
            FlowMessage::decode(&buf),
            Err(DecodeError::UnknownActionType(0x77))
        );
    }

    #[test]
    fn command_is_carried_verbatim() {
        let mut msg = https_put();
        msg.cmd = 200;
        let back = FlowMessage::decode(&encode(&msg)).unwrap();
        assert_eq!(back.cmd, 200);
        assert_eq!(back.command(), Err(200));
    }
}
