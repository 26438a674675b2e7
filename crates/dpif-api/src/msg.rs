// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The message envelope.
//!
//! Every message travels in an envelope of [`MESSAGE_SIZE`] bytes: a
//! signed 16-bit `type`, padding, then the family body zero-filled to
//! [`BODY_LEN`]. On a request `type` is the command code; on a response
//! it is a [`Status`]. Requests and responses are distinct types here,
//! tied together by the `id` the family body carries.

use super::Family;
use super::cmd::FlowCmd;
use super::cmd::PacketCmd;
use super::cmd::Status;
use super::cmd::VportCmd;
use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::WireMsg;
use super::codec::read_raw;
use super::codec::write_raw;
use super::flow::FlowMessage;
use super::packet::PacketMessage;
use super::vport::VportMessage;
use alloc::vec::Vec;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::I16;

/// The size of the body slot; the largest family message.
pub const BODY_LEN: usize = 864;

/// The offset of the body within the envelope.
pub const BODY_OFFSET: usize = 8;

/// The size of an encoded envelope.
pub const MESSAGE_SIZE: usize = BODY_OFFSET + BODY_LEN;

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
pub struct EnvelopeHdrRaw {
    pub msg_type: I16,
    pub _pad: [u8; 6],
}

const _: () =
    assert!(core::mem::size_of::<EnvelopeHdrRaw>() == BODY_OFFSET);

/// A message body belonging to one transport family.
pub trait FamilyMsg: WireMsg {
    /// The family whose channel carries this body.
    const FAMILY: Family;

    /// The family's command enumeration.
    type Cmd: Copy + Into<u8> + TryFrom<u8, Error = u8>;

    /// The correlation id, for families that carry one.
    fn id(&self) -> Option<u32>;
}

macro_rules! cmd_into_u8 {
    ($($cmd:ty),*) => {
        $(
            impl From<$cmd> for u8 {
                fn from(cmd: $cmd) -> u8 {
                    cmd as u8
                }
            }
        )*
    };
}

cmd_into_u8!(VportCmd, FlowCmd, PacketCmd);

impl FamilyMsg for VportMessage {
    const FAMILY: Family = Family::Vport;
    type Cmd = VportCmd;

    fn id(&self) -> Option<u32> {
        Some(self.id)
    }
}

impl FamilyMsg for FlowMessage {
    const FAMILY: Family = Family::Flow;
    type Cmd = FlowCmd;

    fn id(&self) -> Option<u32> {
        Some(self.id)
    }
}

impl FamilyMsg for PacketMessage {
    const FAMILY: Family = Family::Packet;
    type Cmd = PacketCmd;

    fn id(&self) -> Option<u32> {
        None
    }
}

const _: () = assert!(VportMessage::WIRE_LEN <= BODY_LEN);
const _: () = assert!(FlowMessage::WIRE_LEN == BODY_LEN);
const _: () = assert!(PacketMessage::WIRE_LEN <= BODY_LEN);

fn encode_envelope<M: WireMsg>(
    msg_type: i16,
    body: &M,
    buf: &mut [u8],
) -> Result<(), EncodeError> {
    if buf.len() < MESSAGE_SIZE {
        return Err(EncodeError::BufferTooSmall {
            needed: MESSAGE_SIZE,
            given: buf.len(),
        });
    }

    let hdr = EnvelopeHdrRaw { msg_type: I16::new(msg_type), _pad: [0; 6] };
    write_raw(&hdr, buf)?;
    let slot = &mut buf[BODY_OFFSET..MESSAGE_SIZE];
    slot.fill(0);
    body.encode_into(slot)
}

fn decode_envelope<M: WireMsg>(buf: &[u8]) -> Result<(i16, M), DecodeError> {
    if buf.len() < MESSAGE_SIZE {
        return Err(DecodeError::Truncated {
            needed: MESSAGE_SIZE,
            given: buf.len(),
        });
    }

    let hdr = read_raw::<EnvelopeHdrRaw>(buf)?;
    let body = M::decode(&buf[BODY_OFFSET..MESSAGE_SIZE])?;
    Ok((hdr.msg_type.get(), body))
}

/// A command sent to the datapath.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request<M: FamilyMsg> {
    /// The command code; travels in the envelope's `type`.
    pub cmd: u8,
    pub body: M,
}

impl<M: FamilyMsg> Request<M> {
    pub fn new(cmd: M::Cmd, body: M) -> Self {
        Self { cmd: cmd.into(), body }
    }

    pub fn command(&self) -> Result<M::Cmd, u8> {
        M::Cmd::try_from(self.cmd)
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        encode_envelope(i16::from(self.cmd), &self.body, buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0u8; MESSAGE_SIZE];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (msg_type, body) = decode_envelope::<M>(buf)?;
        let cmd = u8::try_from(msg_type)
            .map_err(|_| DecodeError::BadMsgType(msg_type))?;
        Ok(Self { cmd, body })
    }
}

/// The datapath's answer to a [`Request`].
///
/// The body echoes the request's `id`. On error the body carries no
/// meaningful payload beyond that id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response<M: FamilyMsg> {
    pub status: Status,
    pub body: M,
}

impl<M: FamilyMsg> Response<M> {
    pub fn new(status: Status, body: M) -> Self {
        Self { status, body }
    }

    pub fn id(&self) -> Option<u32> {
        self.body.id()
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        encode_envelope(self.status.0, &self.body, buf)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0u8; MESSAGE_SIZE];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (msg_type, body) = decode_envelope::<M>(buf)?;
        Ok(Self { status: Status(msg_type), body })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::Action;
    use crate::cmd::DpifError;
    use crate::key::FlowKey;
    use crate::vport::PortName;

    #[test]
    fn envelope_layout() {
        let mut body = VportMessage::new(VportCmd::Get);
        body.id = 5;
        body.name = PortName::new("eth0").unwrap();
        let req = Request::new(VportCmd::Get, body.clone());
        let buf = req.to_bytes().unwrap();

        assert_eq!(buf.len(), 872);
        assert_eq!(&buf[0..2], &[3, 0]);
        assert!(buf[2..8].iter().all(|b| *b == 0));
        assert_eq!(&buf[8..12], &[5, 0, 0, 0]);
        assert!(buf[8 + VportMessage::WIRE_LEN..].iter().all(|b| *b == 0));

        let back = Request::<VportMessage>::decode(&buf).unwrap();
        assert_eq!(back.command(), Ok(VportCmd::Get));
        assert_eq!(back.body, body);
    }

    #[test]
    fn negative_status_round_trip() {
        let mut body = FlowMessage::new(FlowCmd::Get, FlowKey::default());
        body.id = 77;
        let resp = Response::new(DpifError::FlowNotFound.status(), body);
        let buf = resp.to_bytes().unwrap();
        assert_eq!(
            i16::from_le_bytes([buf[0], buf[1]]),
            -(libc::ENOENT as i16)
        );

        let back = Response::<FlowMessage>::decode(&buf).unwrap();
        assert!(back.status.is_err());
        assert_eq!(back.id(), Some(77));
    }

    #[test]
    fn request_type_must_be_a_command() {
        let mut buf = Request::new(PacketCmd::Execute, PacketMessage::default())
            .to_bytes()
            .unwrap();
        buf[0..2].copy_from_slice(&(-1i16).to_le_bytes());
        assert_eq!(
            Request::<PacketMessage>::decode(&buf),
            Err(DecodeError::BadMsgType(-1))
        );
    }

    #[test]
    fn bad_body_rejects_envelope() {
        let mut pkt = PacketMessage::default();
        pkt.actions.push(Action::Output { port: 1 }).unwrap();
        let mut buf =
            Request::new(PacketCmd::Execute, pkt).to_bytes().unwrap();
        buf[BODY_OFFSET] = 0x42;
        assert_eq!(
            Request::<PacketMessage>::decode(&buf),
            Err(DecodeError::UnknownActionType(0x42))
        );
        assert_eq!(
            Request::<PacketMessage>::decode(&buf[..MESSAGE_SIZE - 1]),
            Err(DecodeError::Truncated {
                needed: MESSAGE_SIZE,
                given: MESSAGE_SIZE - 1
            })
        );
    }
}
