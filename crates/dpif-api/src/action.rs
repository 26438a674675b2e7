// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Datapath actions.
//!
//! On the wire an action list is an array of [`MAX_ACTIONS`] fixed-size
//! slots. Each slot is a 4-byte type followed by a 12-byte payload
//! whose meaning depends on the type. The list ends at the first slot
//! whose type is `ACTION_NULL`, or after the last slot.
//!
//! In memory an [`ActionList`] is just a bounded vector; there is no
//! "null" [`Action`]. The sentinel only exists in the encoding.

use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::read_raw;
use super::codec::write_raw;
use super::ip::ETHER_TYPE_VLAN;
use super::ip::Ipv4Addr;
use super::mac::MacAddr;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian;
use zerocopy::byteorder::network_endian;

/// The number of action slots carried by a flow or packet message.
///
/// This is a hard compatibility boundary: it sizes every message that
/// embeds an action list, and those messages sit in fixed-size shared
/// buffers. Raising it without also growing the enclosing message
/// buffers overruns neighbouring regions and corrupts packets.
pub const MAX_ACTIONS: usize = 48;

/// The number of payload bytes in an action slot.
pub const ACTION_DATA_LEN: usize = 12;

/// The number of bytes in one encoded action slot.
pub const ACTION_LEN: usize = 4 + ACTION_DATA_LEN;

/// The number of bytes in an encoded action list.
pub const ACTIONS_LEN: usize = ACTION_LEN * MAX_ACTIONS;

/// The action type carried in the first 4 bytes of a slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ActionType {
    /// Empty slot; terminates the list.
    Null = 0,
    Output = 1,
    PopVlan = 2,
    PushVlan = 3,
    SetEthernet = 4,
    SetIpv4 = 5,
    SetTcp = 6,
    SetUdp = 7,
}

impl TryFrom<u32> for ActionType {
    type Error = DecodeError;

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Null),
            1 => Ok(Self::Output),
            2 => Ok(Self::PopVlan),
            3 => Ok(Self::PushVlan),
            4 => Ok(Self::SetEthernet),
            5 => Ok(Self::SetIpv4),
            6 => Ok(Self::SetTcp),
            7 => Ok(Self::SetUdp),
            _ => Err(DecodeError::UnknownActionType(num)),
        }
    }
}

/// One encoded action slot.
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ActionRaw {
    pub kind: little_endian::U32,
    pub data: [u8; ACTION_DATA_LEN],
}

const _: () = assert!(core::mem::size_of::<ActionRaw>() == ACTION_LEN);

/// The encoded action list of a flow or packet message.
pub type ActionsRaw = [ActionRaw; MAX_ACTIONS];

const _: () = assert!(core::mem::size_of::<ActionsRaw>() == ACTIONS_LEN);

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct OutputRaw {
    port: little_endian::U32,
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct PushVlanRaw {
    tpid: little_endian::U16,
    tci: little_endian::U16,
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct EthernetRaw {
    src: [u8; 6],
    dst: [u8; 6],
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct Ipv4Raw {
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    tos: u8,
    ttl: u8,
    frag: u8,
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct L4PortsRaw {
    src: network_endian::U16,
    dst: network_endian::U16,
}

const _: () = assert!(core::mem::size_of::<Ipv4Raw>() <= ACTION_DATA_LEN);
const _: () = assert!(core::mem::size_of::<EthernetRaw>() <= ACTION_DATA_LEN);

/// New IPv4 header values for [`Action::SetIpv4`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Ipv4Rewrite {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
    pub frag: u8,
}

/// An operation applied to a packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Action {
    /// Transmit the packet on the given port.
    Output { port: u32 },
    /// Remove the outermost 802.1Q header.
    PopVlan,
    /// Add an 802.1Q header.
    PushVlan { tpid: u16, tci: u16 },
    /// Rewrite the Ethernet addresses.
    SetEthernet { src: MacAddr, dst: MacAddr },
    /// Rewrite IPv4 header fields.
    SetIpv4(Ipv4Rewrite),
    /// Rewrite the TCP ports.
    SetTcp { src: u16, dst: u16 },
    /// Rewrite the UDP ports.
    SetUdp { src: u16, dst: u16 },
}

impl Action {
    /// A push-VLAN action with the standard 802.1Q TPID.
    pub fn push_vlan(tci: u16) -> Self {
        Self::PushVlan { tpid: ETHER_TYPE_VLAN, tci }
    }

    pub fn kind(&self) -> ActionType {
        match self {
            Self::Output { .. } => ActionType::Output,
            Self::PopVlan => ActionType::PopVlan,
            Self::PushVlan { .. } => ActionType::PushVlan,
            Self::SetEthernet { .. } => ActionType::SetEthernet,
            Self::SetIpv4(_) => ActionType::SetIpv4,
            Self::SetTcp { .. } => ActionType::SetTcp,
            Self::SetUdp { .. } => ActionType::SetUdp,
        }
    }

    /// Encode this action into a single slot.
    pub fn to_raw(&self) -> ActionRaw {
        let mut raw = ActionRaw::new_zeroed();
        raw.kind = little_endian::U32::new(self.kind() as u32);
        let data = &mut raw.data[..];

        // The payload structs are all smaller than the slot, so none of
        // these writes can fail.
        let res = match *self {
            Self::Output { port } => write_raw(
                &OutputRaw { port: little_endian::U32::new(port) },
                data,
            ),

            Self::PopVlan => Ok(()),

            Self::PushVlan { tpid, tci } => write_raw(
                &PushVlanRaw {
                    tpid: little_endian::U16::new(tpid),
                    tci: little_endian::U16::new(tci),
                },
                data,
            ),

            Self::SetEthernet { src, dst } => write_raw(
                &EthernetRaw { src: src.bytes(), dst: dst.bytes() },
                data,
            ),

            Self::SetIpv4(ip) => write_raw(
                &Ipv4Raw {
                    src: ip.src.bytes(),
                    dst: ip.dst.bytes(),
                    proto: ip.proto,
                    tos: ip.tos,
                    ttl: ip.ttl,
                    frag: ip.frag,
                },
                data,
            ),

            Self::SetTcp { src, dst } | Self::SetUdp { src, dst } => write_raw(
                &L4PortsRaw {
                    src: network_endian::U16::new(src),
                    dst: network_endian::U16::new(dst),
                },
                data,
            ),
        };
        debug_assert!(res.is_ok());
        raw
    }

    /// Decode a single slot.
    ///
    /// Returns `Ok(None)` for the null sentinel. Only the payload bytes
    /// valid for the slot's type are looked at.
    pub fn from_raw(raw: &ActionRaw) -> Result<Option<Self>, DecodeError> {
        let data = &raw.data[..];

        let act = match ActionType::try_from(raw.kind.get())? {
            ActionType::Null => return Ok(None),

            ActionType::Output => {
                let out = read_raw::<OutputRaw>(data)?;
                Self::Output { port: out.port.get() }
            }

            ActionType::PopVlan => Self::PopVlan,

            ActionType::PushVlan => {
                let vlan = read_raw::<PushVlanRaw>(data)?;
                Self::PushVlan { tpid: vlan.tpid.get(), tci: vlan.tci.get() }
            }

            ActionType::SetEthernet => {
                let eth = read_raw::<EthernetRaw>(data)?;
                Self::SetEthernet {
                    src: MacAddr::from(eth.src),
                    dst: MacAddr::from(eth.dst),
                }
            }

            ActionType::SetIpv4 => {
                let ip = read_raw::<Ipv4Raw>(data)?;
                Self::SetIpv4(Ipv4Rewrite {
                    src: Ipv4Addr::from(ip.src),
                    dst: Ipv4Addr::from(ip.dst),
                    proto: ip.proto,
                    tos: ip.tos,
                    ttl: ip.ttl,
                    frag: ip.frag,
                })
            }

            ActionType::SetTcp => {
                let ports = read_raw::<L4PortsRaw>(data)?;
                Self::SetTcp { src: ports.src.get(), dst: ports.dst.get() }
            }

            ActionType::SetUdp => {
                let ports = read_raw::<L4PortsRaw>(data)?;
                Self::SetUdp { src: ports.src.get(), dst: ports.dst.get() }
            }
        };

        Ok(Some(act))
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Output { port } => write!(f, "output:{port}"),
            Self::PopVlan => write!(f, "pop_vlan"),
            Self::PushVlan { tpid, tci } => {
                write!(f, "push_vlan(tpid={tpid:#06x},tci={tci:#06x})")
            }
            Self::SetEthernet { src, dst } => {
                write!(f, "set(eth(src={src},dst={dst}))")
            }
            Self::SetIpv4(ip) => write!(
                f,
                "set(ipv4(src={},dst={},proto={},tos={},ttl={},frag={}))",
                ip.src, ip.dst, ip.proto, ip.tos, ip.ttl, ip.frag,
            ),
            Self::SetTcp { src, dst } => {
                write!(f, "set(tcp(src={src},dst={dst}))")
            }
            Self::SetUdp { src, dst } => {
                write!(f, "set(udp(src={src},dst={dst}))")
            }
        }
    }
}

/// An ordered list of at most [`MAX_ACTIONS`] actions.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionList {
    actions: heapless::Vec<Action, MAX_ACTIONS>,
}

impl ActionList {
    pub const fn new() -> Self {
        Self { actions: heapless::Vec::new() }
    }

    /// Append an action.
    ///
    /// # Errors
    ///
    /// Fails with [`EncodeError::CapacityExceeded`] when the list
    /// already holds [`MAX_ACTIONS`] actions; the list is unchanged.
    pub fn push(&mut self, act: Action) -> Result<(), EncodeError> {
        self.actions
            .push(act)
            .map_err(|_| EncodeError::CapacityExceeded(MAX_ACTIONS))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.actions
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// The output ports named by this list, in order.
    pub fn output_ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.actions.iter().filter_map(|act| match act {
            Action::Output { port } => Some(*port),
            _ => None,
        })
    }

    /// Encode the list into its slot array. Unused slots are zeroed,
    /// which makes the first of them the terminating sentinel.
    pub fn to_raw(&self) -> ActionsRaw {
        let mut raw = <ActionsRaw as FromZeros>::new_zeroed();
        for (slot, act) in raw.iter_mut().zip(self.actions.iter()) {
            *slot = act.to_raw();
        }
        raw
    }

    /// Encode the list into its fixed-size wire form.
    pub fn encode(&self) -> [u8; ACTIONS_LEN] {
        zerocopy::transmute!(self.to_raw())
    }

    /// Encode a caller-supplied sequence of actions.
    ///
    /// # Errors
    ///
    /// Fails with [`EncodeError::CapacityExceeded`] if `actions` holds
    /// more than [`MAX_ACTIONS`] entries.
    pub fn encode_slice(
        actions: &[Action],
    ) -> Result<[u8; ACTIONS_LEN], EncodeError> {
        Self::try_from(actions).map(|list| list.encode())
    }

    /// Decode the list from its slot array.
    ///
    /// Decoding stops at the first null slot. An unknown action type
    /// anywhere before that point fails the whole list rather than
    /// guessing at the rest of the message.
    pub fn from_raw(raw: &ActionsRaw) -> Result<Self, DecodeError> {
        let mut list = Self::new();
        for slot in raw {
            match Action::from_raw(slot)? {
                Some(act) => {
                    // At most MAX_ACTIONS slots exist.
                    let _ = list.actions.push(act);
                }
                None => break,
            }
        }
        Ok(list)
    }

    /// Decode the list from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        read_raw::<ActionsRaw>(buf).and_then(Self::from_raw)
    }
}

impl TryFrom<&[Action]> for ActionList {
    type Error = EncodeError;

    fn try_from(actions: &[Action]) -> Result<Self, Self::Error> {
        heapless::Vec::from_slice(actions)
            .map(|actions| Self { actions })
            .map_err(|_| EncodeError::CapacityExceeded(MAX_ACTIONS))
    }
}

impl<'a> IntoIterator for &'a ActionList {
    type Item = &'a Action;
    type IntoIter = core::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

impl Display for ActionList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "drop");
        }

        for (i, act) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{act}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn outputs(n: u32) -> Vec<Action> {
        (0..n).map(|port| Action::Output { port }).collect()
    }

    #[test]
    fn empty_list_is_all_null() {
        let bytes = ActionList::new().encode();
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(ActionList::decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn full_list_without_sentinel() {
        let acts = outputs(MAX_ACTIONS as u32);
        let bytes = ActionList::encode_slice(&acts).unwrap();
        let list = ActionList::decode(&bytes).unwrap();
        assert_eq!(list.as_slice(), &acts[..]);
        assert_eq!(
            list.output_ports().collect::<Vec<_>>(),
            (0..48u32).collect::<Vec<_>>()
        );
    }

    #[test]
    fn push_past_capacity() {
        let mut list = ActionList::try_from(&outputs(48)[..]).unwrap();
        assert_eq!(
            list.push(Action::PopVlan),
            Err(EncodeError::CapacityExceeded(MAX_ACTIONS))
        );
        assert_eq!(list.len(), MAX_ACTIONS);
        assert_eq!(
            ActionList::encode_slice(&outputs(49)),
            Err(EncodeError::CapacityExceeded(MAX_ACTIONS))
        );
    }

    #[test]
    fn slot_layout() {
        let out = Action::Output { port: 0x0102_0304 }.to_raw();
        assert_eq!(out.as_bytes()[..8], [1, 0, 0, 0, 4, 3, 2, 1]);

        let tcp = Action::SetTcp { src: 443, dst: 80 }.to_raw();
        assert_eq!(tcp.as_bytes()[..8], [6, 0, 0, 0, 0x01, 0xbb, 0x00, 0x50]);

        let vlan = Action::push_vlan(0x2064).to_raw();
        assert_eq!(vlan.as_bytes()[..8], [3, 0, 0, 0, 0x00, 0x81, 0x64, 0x20]);
    }

    #[test]
    fn null_truncates() {
        let mut raw = ActionList::try_from(&outputs(10)[..]).unwrap().to_raw();
        raw[3] = ActionRaw::new_zeroed();
        // Garbage after the sentinel must not be interpreted.
        raw[4].kind = little_endian::U32::new(0xdead);
        let list = ActionList::from_raw(&raw).unwrap();
        assert_eq!(list.as_slice(), &outputs(3)[..]);
    }

    #[test]
    fn unknown_type_aborts() {
        let mut raw = ActionList::try_from(&outputs(4)[..]).unwrap().to_raw();
        raw[2].kind = little_endian::U32::new(8);
        assert_eq!(
            ActionList::from_raw(&raw),
            Err(DecodeError::UnknownActionType(8))
        );
    }

    #[test]
    fn truncated_buffer() {
        let bytes = ActionList::new().encode();
        assert_eq!(
            ActionList::decode(&bytes[..ACTIONS_LEN - 1]),
            Err(DecodeError::Truncated {
                needed: ACTIONS_LEN,
                given: ACTIONS_LEN - 1
            })
        );
    }

    #[test]
    fn display() {
        assert_eq!(ActionList::new().to_string(), "drop");
        let list = ActionList::try_from(
            &[Action::PopVlan, Action::Output { port: 2 }][..],
        )
        .unwrap();
        assert_eq!(list.to_string(), "pop_vlan,output:2");
    }

    fn arb_action() -> impl Strategy<Value = Action> {
        prop_oneof![
            any::<u32>().prop_map(|port| Action::Output { port }),
            Just(Action::PopVlan),
            (any::<u16>(), any::<u16>())
                .prop_map(|(tpid, tci)| Action::PushVlan { tpid, tci }),
            (any::<[u8; 6]>(), any::<[u8; 6]>()).prop_map(|(s, d)| {
                Action::SetEthernet { src: s.into(), dst: d.into() }
            }),
            (any::<[u8; 4]>(), any::<[u8; 4]>(), any::<[u8; 4]>()).prop_map(
                |(s, d, l3)| Action::SetIpv4(Ipv4Rewrite {
                    src: s.into(),
                    dst: d.into(),
                    proto: l3[0],
                    tos: l3[1],
                    ttl: l3[2],
                    frag: l3[3],
                })
            ),
            (any::<u16>(), any::<u16>())
                .prop_map(|(src, dst)| Action::SetTcp { src, dst }),
            (any::<u16>(), any::<u16>())
                .prop_map(|(src, dst)| Action::SetUdp { src, dst }),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            acts in proptest::collection::vec(arb_action(), 0..=MAX_ACTIONS)
        ) {
            let bytes = ActionList::encode_slice(&acts).unwrap();
            let list = ActionList::decode(&bytes).unwrap();
            prop_assert_eq!(list.as_slice(), &acts[..]);
        }

        #[test]
        fn sentinel_truncates_anywhere(
            acts in proptest::collection::vec(arb_action(), MAX_ACTIONS),
            at in 0..MAX_ACTIONS - 1,
        ) {
            let mut raw = ActionList::try_from(&acts[..]).unwrap().to_raw();
            raw[at] = ActionRaw::new_zeroed();
            let list = ActionList::from_raw(&raw).unwrap();
            prop_assert_eq!(list.as_slice(), &acts[..at]);
        }
    }
}
